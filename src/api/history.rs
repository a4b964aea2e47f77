use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use serde_json::Value;

use crate::api::{current_user, ensure_project_access, ListQuery};
use crate::db::models::HistoryEntryRecord;
use crate::db::queries;
use crate::error::AppResult;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/projects/{id}/history", get(list_history))
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub id: String,
    pub timestamp: String,
    pub user_id: String,
    pub user_name: Option<String>,
    pub action: String,
    pub entity_id: String,
    pub entity_type: String,
    pub project_id: String,
    pub details: Value,
}

fn map_entry(entry: HistoryEntryRecord, user_name: Option<String>) -> HistoryResponse {
    // Details are stored as a JSON string; surface them structured.
    let details = serde_json::from_str(&entry.details).unwrap_or(Value::Null);
    HistoryResponse {
        id: entry.id,
        timestamp: entry.timestamp,
        user_id: entry.user_id,
        user_name,
        action: entry.action,
        entity_id: entry.entity_id,
        entity_type: entry.entity_type,
        project_id: entry.project_id,
        details,
    }
}

async fn list_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ListQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Vec<HistoryResponse>>> {
    let (limit, offset) = query.normalize()?;

    // The audit trail is as sensitive as the project itself.
    let viewer = current_user(&state, &headers).await?;
    let project = queries::get_project(&state.db, &id).await?;
    ensure_project_access(&state, &viewer, project.department_id.as_deref()).await?;

    let entries = queries::list_history(&state.db, &id, limit, offset).await?;
    let users = queries::list_users(&state.db).await?;

    let responses = entries
        .into_iter()
        .map(|entry| {
            let user_name = users
                .iter()
                .find(|user| user.id == entry.user_id)
                .map(|user| user.name.clone());
            map_entry(entry, user_name)
        })
        .collect();
    Ok(Json(responses))
}
