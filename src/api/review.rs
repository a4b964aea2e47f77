use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;

use crate::api::require_administrator;
use crate::api::tasks::{map_task_details, TaskResponse};
use crate::db::queries;
use crate::error::AppResult;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/tasks/{id}/approve", post(approve_task))
        .route("/tasks/{id}/revision", post(request_revision))
}

#[derive(Debug, Deserialize)]
pub struct ApproveRequest {
    pub target_stage_id: Option<String>,
    pub comment: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RevisionRequest {
    pub target_stage_id: Option<String>,
    pub comment: String,
}

async fn approve_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<ApproveRequest>,
) -> AppResult<Json<TaskResponse>> {
    let reviewer = require_administrator(&state, &headers).await?;

    let details = queries::approve_task(
        &state.db,
        &id,
        payload.target_stage_id.as_deref(),
        payload.comment.as_deref(),
        &reviewer,
    )
    .await?;
    Ok(Json(map_task_details(details)))
}

async fn request_revision(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<RevisionRequest>,
) -> AppResult<Json<TaskResponse>> {
    let reviewer = require_administrator(&state, &headers).await?;

    let details = queries::request_task_revision(
        &state.db,
        &id,
        payload.target_stage_id.as_deref(),
        &payload.comment,
        &reviewer,
    )
    .await?;
    Ok(Json(map_task_details(details)))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::api::test_support::{spawn_app, TestApp};

    struct ReviewFixture {
        admin_id: String,
        worker_id: String,
        task_id: String,
        design_id: String,
        dev_id: String,
    }

    /// Design -> Review -> Development, with the task completed out of Design
    /// so it sits in Review awaiting judgment.
    async fn seed_review_scenario(app: &TestApp) -> ReviewFixture {
        let admin = app
            .server
            .post("/api/v1/users")
            .json(&json!({
                "name": "Lena",
                "email": "lena@example.com",
                "role": "team-lead",
            }))
            .await;
        let admin: serde_json::Value = admin.json();
        let admin_id = admin["id"].as_str().unwrap().to_string();

        let worker = app
            .server
            .post("/api/v1/users")
            .add_header("X-User-Id", admin_id.as_str())
            .json(&json!({ "name": "Dana", "email": "dana@example.com" }))
            .await;
        let worker: serde_json::Value = worker.json();
        let worker_id = worker["id"].as_str().unwrap().to_string();

        let project = app
            .server
            .post("/api/v1/projects")
            .add_header("X-User-Id", admin_id.as_str())
            .json(&json!({ "name": "Website Redesign" }))
            .await;
        let project: serde_json::Value = project.json();

        let mut stage_ids = Vec::new();
        for title in ["Design", "Review", "Development"] {
            let stage = app
                .server
                .post("/api/v1/stages")
                .add_header("X-User-Id", admin_id.as_str())
                .json(&json!({ "project_id": project["id"], "title": title }))
                .await;
            let stage: serde_json::Value = stage.json();
            stage_ids.push(stage["id"].as_str().unwrap().to_string());
        }

        let configured = app
            .server
            .put(&format!("/api/v1/stages/{}", stage_ids[1]))
            .add_header("X-User-Id", admin_id.as_str())
            .json(&json!({
                "is_review_stage": true,
                "approved_target_stage_id": stage_ids[2],
            }))
            .await;
        configured.assert_status_ok();

        let task = app
            .server
            .post("/api/v1/tasks")
            .add_header("X-User-Id", admin_id.as_str())
            .json(&json!({
                "title": "Landing page",
                "project_id": project["id"],
                "project_stage_id": stage_ids[0],
                "assignee_id": worker_id,
            }))
            .await;
        let task: serde_json::Value = task.json();
        let task_id = task["id"].as_str().unwrap().to_string();

        let completed = app
            .server
            .put(&format!("/api/v1/tasks/{task_id}"))
            .add_header("X-User-Id", worker_id.as_str())
            .json(&json!({ "user_status": "complete" }))
            .await;
        completed.assert_status_ok();

        ReviewFixture {
            admin_id,
            worker_id,
            task_id,
            design_id: stage_ids[0].clone(),
            dev_id: stage_ids[2].clone(),
        }
    }

    #[tokio::test]
    async fn approval_advances_to_the_configured_target() {
        let app = spawn_app("review-approve").await;
        let fixture = seed_review_scenario(&app).await;

        let approved = app
            .server
            .post(&format!("/api/v1/tasks/{}/approve", fixture.task_id))
            .add_header("X-User-Id", fixture.admin_id.as_str())
            .json(&json!({ "comment": "ship it" }))
            .await;
        approved.assert_status_ok();
        let task: serde_json::Value = approved.json();
        assert_eq!(task["project_stage_id"], json!(fixture.dev_id));
        assert_eq!(task["is_in_specific_stage"], false);
        assert_eq!(task["previous_stage_id"], json!(null));
        assert_eq!(task["original_assignee_id"], json!(null));
    }

    #[tokio::test]
    async fn revision_sends_the_task_back_to_the_original_worker() {
        let app = spawn_app("review-revise").await;
        let fixture = seed_review_scenario(&app).await;

        let revised = app
            .server
            .post(&format!("/api/v1/tasks/{}/revision", fixture.task_id))
            .add_header("X-User-Id", fixture.admin_id.as_str())
            .json(&json!({ "comment": "redo the header" }))
            .await;
        revised.assert_status_ok();
        let task: serde_json::Value = revised.json();
        assert_eq!(task["project_stage_id"], json!(fixture.design_id));
        assert_eq!(task["assignee_id"], json!(fixture.worker_id));
        assert_eq!(task["user_status"], "pending");
        assert_eq!(task["revision_comment"], "redo the header");
        assert!(task["tags"]
            .as_array()
            .unwrap()
            .iter()
            .any(|tag| tag == "Redo"));
        assert_eq!(task["revision_history"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn plain_users_cannot_judge_reviews() {
        let app = spawn_app("review-role").await;
        let fixture = seed_review_scenario(&app).await;

        let denied = app
            .server
            .post(&format!("/api/v1/tasks/{}/approve", fixture.task_id))
            .add_header("X-User-Id", fixture.worker_id.as_str())
            .json(&json!({}))
            .await;
        denied.assert_status(axum::http::StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn revision_without_a_comment_is_rejected() {
        let app = spawn_app("review-comment").await;
        let fixture = seed_review_scenario(&app).await;

        let denied = app
            .server
            .post(&format!("/api/v1/tasks/{}/revision", fixture.task_id))
            .add_header("X-User-Id", fixture.admin_id.as_str())
            .json(&json!({ "comment": "   " }))
            .await;
        denied.assert_status(axum::http::StatusCode::BAD_REQUEST);
    }
}
