use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::api::{
    current_user, department_name, ensure_project_access, present, project_access_allowed,
    require_administrator, ListQuery,
};
use crate::db::models::ProjectRecord;
use crate::db::queries;
use crate::error::AppResult;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/projects", get(list_projects).post(create_project))
        .route(
            "/projects/{id}",
            get(get_project).put(update_project).delete(delete_project),
        )
}

#[derive(Debug, Serialize)]
pub struct ProjectResponse {
    pub id: String,
    pub name: String,
    pub description: String,
    pub department_id: Option<String>,
    pub department_name: Option<String>,
    pub emails: Vec<String>,
    pub phone_numbers: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub department_id: Option<String>,
    #[serde(default)]
    pub emails: Vec<String>,
    #[serde(default)]
    pub phone_numbers: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateProjectRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    #[serde(default, deserialize_with = "present")]
    pub department_id: Option<Option<String>>,
    pub emails: Option<Vec<String>>,
    pub phone_numbers: Option<Vec<String>>,
}

async fn map_project(state: &AppState, project: ProjectRecord) -> AppResult<ProjectResponse> {
    let department_name = department_name(state, project.department_id.as_deref()).await?;
    Ok(ProjectResponse {
        id: project.id,
        name: project.name,
        description: project.description,
        department_id: project.department_id,
        department_name,
        emails: queries::decode_string_list(&project.emails),
        phone_numbers: queries::decode_string_list(&project.phone_numbers),
        created_at: project.created_at,
        updated_at: project.updated_at,
    })
}

async fn list_projects(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Vec<ProjectResponse>>> {
    let (limit, offset) = query.normalize()?;
    let viewer = current_user(&state, &headers).await?;

    let projects = queries::list_projects(&state.db, limit, offset).await?;

    let mut responses = Vec::with_capacity(projects.len());
    for project in projects {
        if project_access_allowed(&state, &viewer, project.department_id.as_deref()).await? {
            responses.push(map_project(&state, project).await?);
        }
    }
    Ok(Json(responses))
}

async fn get_project(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> AppResult<Json<ProjectResponse>> {
    let viewer = current_user(&state, &headers).await?;
    let project = queries::get_project(&state.db, &id).await?;
    ensure_project_access(&state, &viewer, project.department_id.as_deref()).await?;

    Ok(Json(map_project(&state, project).await?))
}

async fn create_project(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateProjectRequest>,
) -> AppResult<(StatusCode, Json<ProjectResponse>)> {
    let actor = require_administrator(&state, &headers).await?;
    ensure_project_access(&state, &actor, payload.department_id.as_deref()).await?;

    let project = queries::create_project(
        &state.db,
        queries::NewProjectInput {
            name: payload.name,
            description: payload.description,
            department_id: payload.department_id,
            emails: payload.emails,
            phone_numbers: payload.phone_numbers,
            actor: actor.id,
        },
    )
    .await?;
    Ok((StatusCode::CREATED, Json(map_project(&state, project).await?)))
}

async fn update_project(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<UpdateProjectRequest>,
) -> AppResult<Json<ProjectResponse>> {
    let actor = require_administrator(&state, &headers).await?;
    let existing = queries::get_project(&state.db, &id).await?;
    ensure_project_access(&state, &actor, existing.department_id.as_deref()).await?;

    let project = queries::update_project(
        &state.db,
        &id,
        queries::UpdateProjectInput {
            name: payload.name,
            description: payload.description,
            department_id: payload.department_id,
            emails: payload.emails,
            phone_numbers: payload.phone_numbers,
            actor: actor.id,
        },
    )
    .await?;
    Ok(Json(map_project(&state, project).await?))
}

async fn delete_project(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> AppResult<StatusCode> {
    let actor = require_administrator(&state, &headers).await?;
    let existing = queries::get_project(&state.db, &id).await?;
    ensure_project_access(&state, &actor, existing.department_id.as_deref()).await?;

    queries::delete_project(&state.db, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}
