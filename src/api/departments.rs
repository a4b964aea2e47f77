use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;

use crate::api::require_administrator;
use crate::db::models::DepartmentRecord;
use crate::db::queries;
use crate::error::AppResult;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/departments", get(list_departments).post(create_department))
        .route(
            "/departments/{id}",
            get(get_department)
                .put(update_department)
                .delete(delete_department),
        )
}

#[derive(Debug, Deserialize)]
pub struct DepartmentRequest {
    pub name: String,
}

async fn list_departments(
    State(state): State<AppState>,
) -> AppResult<Json<Vec<DepartmentRecord>>> {
    let departments = queries::list_departments(&state.db).await?;
    Ok(Json(departments))
}

async fn get_department(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<DepartmentRecord>> {
    let department = queries::get_department(&state.db, &id).await?;
    Ok(Json(department))
}

async fn create_department(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<DepartmentRequest>,
) -> AppResult<(StatusCode, Json<DepartmentRecord>)> {
    require_administrator(&state, &headers).await?;

    let department = queries::create_department(
        &state.db,
        queries::NewDepartmentInput { name: payload.name },
    )
    .await?;
    Ok((StatusCode::CREATED, Json(department)))
}

async fn update_department(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<DepartmentRequest>,
) -> AppResult<Json<DepartmentRecord>> {
    require_administrator(&state, &headers).await?;

    let department = queries::update_department(&state.db, &id, payload.name).await?;
    Ok(Json(department))
}

async fn delete_department(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> AppResult<StatusCode> {
    require_administrator(&state, &headers).await?;

    queries::delete_department(&state.db, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}
