use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::api::{current_user, ensure_project_access, present, require_administrator};
use crate::db::models::StageRecord;
use crate::db::queries;
use crate::error::AppResult;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/stages", get(list_stages).post(create_stage))
        .route("/stages/{id}", get(get_stage).put(update_stage).delete(delete_stage))
}

#[derive(Debug, Serialize)]
pub struct StageResponse {
    pub id: String,
    pub project_id: String,
    pub title: String,
    pub color: String,
    pub position: i64,
    pub stage_type: String,
    pub main_responsible_id: Option<String>,
    pub backup_responsible_id1: Option<String>,
    pub backup_responsible_id2: Option<String>,
    pub is_review_stage: bool,
    pub linked_review_stage_id: Option<String>,
    pub approved_target_stage_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<StageRecord> for StageResponse {
    fn from(stage: StageRecord) -> Self {
        Self {
            is_review_stage: stage.is_review(),
            id: stage.id,
            project_id: stage.project_id,
            title: stage.title,
            color: stage.color,
            position: stage.position,
            stage_type: stage.stage_type,
            main_responsible_id: stage.main_responsible_id,
            backup_responsible_id1: stage.backup_responsible_id1,
            backup_responsible_id2: stage.backup_responsible_id2,
            linked_review_stage_id: stage.linked_review_stage_id,
            approved_target_stage_id: stage.approved_target_stage_id,
            created_at: stage.created_at,
            updated_at: stage.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StageListQuery {
    pub project_id: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateStageRequest {
    pub project_id: String,
    pub title: String,
    #[serde(default)]
    pub color: String,
    #[serde(default = "default_stage_type")]
    pub stage_type: String,
    pub main_responsible_id: Option<String>,
    pub backup_responsible_id1: Option<String>,
    pub backup_responsible_id2: Option<String>,
    #[serde(default)]
    pub is_review_stage: bool,
    pub linked_review_stage_id: Option<String>,
    pub approved_target_stage_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStageRequest {
    pub title: Option<String>,
    pub color: Option<String>,
    pub stage_type: Option<String>,
    #[serde(default, deserialize_with = "present")]
    pub main_responsible_id: Option<Option<String>>,
    #[serde(default, deserialize_with = "present")]
    pub backup_responsible_id1: Option<Option<String>>,
    #[serde(default, deserialize_with = "present")]
    pub backup_responsible_id2: Option<Option<String>>,
    pub is_review_stage: Option<bool>,
    #[serde(default, deserialize_with = "present")]
    pub linked_review_stage_id: Option<Option<String>>,
    #[serde(default, deserialize_with = "present")]
    pub approved_target_stage_id: Option<Option<String>>,
}

fn default_stage_type() -> String {
    "project".to_string()
}

async fn list_stages(
    State(state): State<AppState>,
    Query(query): Query<StageListQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Vec<StageResponse>>> {
    let viewer = current_user(&state, &headers).await?;
    let project = queries::get_project(&state.db, &query.project_id).await?;
    ensure_project_access(&state, &viewer, project.department_id.as_deref()).await?;

    let stages = queries::list_stages(&state.db, &query.project_id).await?;
    Ok(Json(stages.into_iter().map(StageResponse::from).collect()))
}

async fn get_stage(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> AppResult<Json<StageResponse>> {
    let viewer = current_user(&state, &headers).await?;
    let stage = queries::get_stage(&state.db, &id).await?;
    let project = queries::get_project(&state.db, &stage.project_id).await?;
    ensure_project_access(&state, &viewer, project.department_id.as_deref()).await?;

    Ok(Json(stage.into()))
}

async fn create_stage(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateStageRequest>,
) -> AppResult<(StatusCode, Json<StageResponse>)> {
    let actor = require_administrator(&state, &headers).await?;
    let project = queries::get_project(&state.db, &payload.project_id).await?;
    ensure_project_access(&state, &actor, project.department_id.as_deref()).await?;

    let stage = queries::create_stage(
        &state.db,
        queries::NewStageInput {
            project_id: payload.project_id,
            title: payload.title,
            color: payload.color,
            stage_type: payload.stage_type,
            main_responsible_id: payload.main_responsible_id,
            backup_responsible_id1: payload.backup_responsible_id1,
            backup_responsible_id2: payload.backup_responsible_id2,
            is_review_stage: payload.is_review_stage,
            linked_review_stage_id: payload.linked_review_stage_id,
            approved_target_stage_id: payload.approved_target_stage_id,
            actor: actor.id,
        },
    )
    .await?;
    Ok((StatusCode::CREATED, Json(stage.into())))
}

async fn update_stage(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<UpdateStageRequest>,
) -> AppResult<Json<StageResponse>> {
    let actor = require_administrator(&state, &headers).await?;
    let existing = queries::get_stage(&state.db, &id).await?;
    let project = queries::get_project(&state.db, &existing.project_id).await?;
    ensure_project_access(&state, &actor, project.department_id.as_deref()).await?;

    let stage = queries::update_stage(
        &state.db,
        &id,
        queries::UpdateStageInput {
            title: payload.title,
            color: payload.color,
            stage_type: payload.stage_type,
            main_responsible_id: payload.main_responsible_id,
            backup_responsible_id1: payload.backup_responsible_id1,
            backup_responsible_id2: payload.backup_responsible_id2,
            is_review_stage: payload.is_review_stage,
            linked_review_stage_id: payload.linked_review_stage_id,
            approved_target_stage_id: payload.approved_target_stage_id,
            actor: actor.id,
        },
    )
    .await?;
    Ok(Json(stage.into()))
}

async fn delete_stage(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> AppResult<StatusCode> {
    let actor = require_administrator(&state, &headers).await?;
    let existing = queries::get_stage(&state.db, &id).await?;
    let project = queries::get_project(&state.db, &existing.project_id).await?;
    ensure_project_access(&state, &actor, project.department_id.as_deref()).await?;

    queries::delete_stage(&state.db, &id, &actor.id).await?;
    Ok(StatusCode::NO_CONTENT)
}
