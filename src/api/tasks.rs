use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::api::{current_user, present, ListQuery};
use crate::db::models::{AttachmentRecord, RevisionEntryRecord, TaskDetails};
use crate::db::queries;
use crate::error::AppResult;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/tasks", get(list_tasks).post(create_task))
        .route(
            "/tasks/{id}",
            get(get_task).put(update_task).delete(delete_task),
        )
        .route("/tasks/{id}/attachments", post(add_attachment))
        .route(
            "/tasks/{id}/attachments/{attachment_id}",
            delete(delete_attachment),
        )
}

#[derive(Debug, Serialize)]
pub struct TaskResponse {
    pub id: String,
    pub title: String,
    pub description: String,
    pub project_id: String,
    pub project_name: String,
    pub assignee_id: Option<String>,
    pub assignee_name: Option<String>,
    pub due_date: Option<String>,
    pub start_date: Option<String>,
    pub user_status: String,
    pub project_stage_id: Option<String>,
    pub priority: String,
    pub tags: Vec<String>,
    pub is_in_specific_stage: bool,
    pub revision_comment: Option<String>,
    pub previous_stage_id: Option<String>,
    pub original_assignee_id: Option<String>,
    pub original_assignee_name: Option<String>,
    pub completed_at: Option<String>,
    pub attachments: Vec<AttachmentRecord>,
    pub revision_history: Vec<RevisionEntryRecord>,
    pub created_at: String,
    pub updated_at: String,
}

pub fn map_task_details(details: TaskDetails) -> TaskResponse {
    let task = details.task;
    TaskResponse {
        id: task.id,
        title: task.title,
        description: task.description,
        project_id: task.project_id,
        project_name: details.project_name,
        assignee_id: task.assignee_id,
        assignee_name: details.assignee_name,
        due_date: task.due_date,
        start_date: task.start_date,
        user_status: task.user_status,
        project_stage_id: task.project_stage_id,
        priority: task.priority,
        tags: details.tags,
        is_in_specific_stage: task.is_in_specific_stage != 0,
        revision_comment: task.revision_comment,
        previous_stage_id: task.previous_stage_id,
        original_assignee_id: task.original_assignee_id,
        original_assignee_name: details.original_assignee_name,
        completed_at: task.completed_at,
        attachments: details.attachments,
        revision_history: details.revision_history,
        created_at: task.created_at,
        updated_at: task.updated_at,
    }
}

#[derive(Debug, Deserialize)]
pub struct TaskListQuery {
    pub project_id: Option<String>,
    pub assignee_id: Option<String>,
    pub user_status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub project_id: String,
    pub assignee_id: Option<String>,
    pub due_date: Option<String>,
    pub start_date: Option<String>,
    #[serde(default = "default_user_status")]
    pub user_status: String,
    pub project_stage_id: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateTaskRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    #[serde(default, deserialize_with = "present")]
    pub due_date: Option<Option<String>>,
    #[serde(default, deserialize_with = "present")]
    pub start_date: Option<Option<String>>,
    pub priority: Option<String>,
    pub user_status: Option<String>,
    pub project_stage_id: Option<String>,
    #[serde(default, deserialize_with = "present")]
    pub assignee_id: Option<Option<String>>,
    pub tags: Option<Vec<String>>,
    pub is_in_specific_stage: Option<bool>,
    #[serde(default, deserialize_with = "present")]
    pub revision_comment: Option<Option<String>>,
}

#[derive(Debug, Deserialize)]
pub struct AddAttachmentRequest {
    pub name: String,
    pub url: String,
    #[serde(default = "default_attachment_kind")]
    pub kind: String,
}

fn default_user_status() -> String {
    "pending".to_string()
}

fn default_priority() -> String {
    "medium".to_string()
}

fn default_attachment_kind() -> String {
    "link".to_string()
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<TaskListQuery>,
) -> AppResult<Json<Vec<TaskResponse>>> {
    let (limit, offset) = ListQuery {
        limit: query.limit,
        offset: query.offset,
    }
    .normalize()?;

    let tasks = queries::list_tasks(
        &state.db,
        queries::TaskFilters {
            project_id: query.project_id,
            assignee_id: query.assignee_id,
            user_status: query.user_status,
        },
        limit,
        offset,
    )
    .await?;
    Ok(Json(tasks.into_iter().map(map_task_details).collect()))
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<TaskResponse>> {
    let details = queries::get_task_details(&state.db, &id).await?;
    Ok(Json(map_task_details(details)))
}

async fn create_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateTaskRequest>,
) -> AppResult<(StatusCode, Json<TaskResponse>)> {
    let actor = current_user(&state, &headers).await?;

    let details = queries::create_task(
        &state.db,
        queries::NewTaskInput {
            title: payload.title,
            description: payload.description,
            project_id: payload.project_id,
            assignee_id: payload.assignee_id,
            due_date: payload.due_date,
            start_date: payload.start_date,
            user_status: payload.user_status,
            project_stage_id: payload.project_stage_id,
            priority: payload.priority,
            tags: payload.tags,
            actor: actor.id,
        },
    )
    .await?;
    Ok((StatusCode::CREATED, Json(map_task_details(details))))
}

async fn update_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<UpdateTaskRequest>,
) -> AppResult<Json<TaskResponse>> {
    let actor = current_user(&state, &headers).await?;

    let details = queries::update_task(
        &state.db,
        &id,
        queries::UpdateTaskInput {
            title: payload.title,
            description: payload.description,
            due_date: payload.due_date,
            start_date: payload.start_date,
            priority: payload.priority,
            user_status: payload.user_status,
            project_stage_id: payload.project_stage_id,
            assignee_id: payload.assignee_id,
            tags: payload.tags,
            is_in_specific_stage: payload.is_in_specific_stage,
            revision_comment: payload.revision_comment,
            actor: actor.id,
        },
    )
    .await?;
    Ok(Json(map_task_details(details)))
}

async fn delete_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> AppResult<StatusCode> {
    let actor = current_user(&state, &headers).await?;

    queries::delete_task(&state.db, &id, &actor.id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn add_attachment(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<AddAttachmentRequest>,
) -> AppResult<(StatusCode, Json<AttachmentRecord>)> {
    let actor = current_user(&state, &headers).await?;

    let attachment = queries::add_attachment(
        &state.db,
        &id,
        queries::NewAttachmentInput {
            name: payload.name,
            url: payload.url,
            kind: payload.kind,
            actor: actor.id,
        },
    )
    .await?;
    Ok((StatusCode::CREATED, Json(attachment)))
}

async fn delete_attachment(
    State(state): State<AppState>,
    Path((id, attachment_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> AppResult<StatusCode> {
    current_user(&state, &headers).await?;

    queries::delete_attachment(&state.db, &id, &attachment_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
