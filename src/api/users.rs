use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::api::{current_user, department_name, present, require_administrator};
use crate::db::models::UserRecord;
use crate::db::queries;
use crate::error::AppResult;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/users", get(list_users).post(create_user))
        .route("/users/me", get(get_current_user))
        .route(
            "/users/{id}",
            get(get_user).put(update_user).delete(delete_user),
        )
}

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub id: String,
    pub name: String,
    pub email: String,
    pub role: String,
    pub department_id: Option<String>,
    pub department_name: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub name: String,
    pub email: String,
    #[serde(default = "default_role")]
    pub role: String,
    pub department_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateUserRequest {
    pub name: Option<String>,
    pub email: Option<String>,
    pub role: Option<String>,
    #[serde(default, deserialize_with = "present")]
    pub department_id: Option<Option<String>>,
}

fn default_role() -> String {
    "user".to_string()
}

async fn map_user(state: &AppState, user: UserRecord) -> AppResult<UserResponse> {
    let department_name = department_name(state, user.department_id.as_deref()).await?;
    Ok(UserResponse {
        id: user.id,
        name: user.name,
        email: user.email,
        role: user.role,
        department_id: user.department_id,
        department_name,
        created_at: user.created_at,
        updated_at: user.updated_at,
    })
}

async fn list_users(State(state): State<AppState>) -> AppResult<Json<Vec<UserResponse>>> {
    let users = queries::list_users(&state.db).await?;

    let mut responses = Vec::with_capacity(users.len());
    for user in users {
        responses.push(map_user(&state, user).await?);
    }
    Ok(Json(responses))
}

async fn get_current_user(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<Json<UserResponse>> {
    let user = current_user(&state, &headers).await?;
    Ok(Json(map_user(&state, user).await?))
}

async fn get_user(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<UserResponse>> {
    let user = queries::get_user(&state.db, &id).await?;
    Ok(Json(map_user(&state, user).await?))
}

async fn create_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateUserRequest>,
) -> AppResult<(StatusCode, Json<UserResponse>)> {
    // Bootstrap: the very first user can be created without an actor header,
    // since there is nobody to act as yet.
    if !queries::list_users(&state.db).await?.is_empty() {
        require_administrator(&state, &headers).await?;
    }

    let user = queries::create_user(
        &state.db,
        queries::NewUserInput {
            name: payload.name,
            email: payload.email,
            role: payload.role,
            department_id: payload.department_id,
        },
    )
    .await?;
    Ok((StatusCode::CREATED, Json(map_user(&state, user).await?)))
}

async fn update_user(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<UpdateUserRequest>,
) -> AppResult<Json<UserResponse>> {
    require_administrator(&state, &headers).await?;

    let user = queries::update_user(
        &state.db,
        &id,
        queries::UpdateUserInput {
            name: payload.name,
            email: payload.email,
            role: payload.role,
            department_id: payload.department_id,
        },
    )
    .await?;
    Ok(Json(map_user(&state, user).await?))
}

async fn delete_user(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> AppResult<StatusCode> {
    require_administrator(&state, &headers).await?;

    queries::delete_user(&state.db, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}
