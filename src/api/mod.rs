pub mod departments;
pub mod history;
pub mod projects;
pub mod review;
pub mod stages;
pub mod tasks;
pub mod users;

use axum::http::HeaderMap;
use axum::Json;
use axum::Router;
use serde::de::Deserializer;
use serde::{Deserialize, Serialize};

use crate::db::models::UserRecord;
use crate::db::queries;
use crate::error::{AppError, AppResult};
use crate::state::AppState;
use crate::workflow::policy::Role;

/// Header naming the user performing the request. Identity is asserted, not
/// authenticated; upstream infrastructure owns authentication.
pub const ACTOR_HEADER: &str = "X-User-Id";

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(departments::router())
        .merge(users::router())
        .merge(projects::router())
        .merge(stages::router())
        .merge(tasks::router())
        .merge(review::router())
        .merge(history::router())
}

#[derive(Debug, Serialize)]
pub struct HealthzResponse {
    pub status: &'static str,
}

pub async fn healthz() -> Json<HealthzResponse> {
    Json(HealthzResponse { status: "ok" })
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl ListQuery {
    pub fn normalize(&self) -> AppResult<(i64, i64)> {
        let limit = self.limit.unwrap_or(50);
        let offset = self.offset.unwrap_or(0);

        if limit <= 0 {
            return Err(AppError::BadRequest(
                "limit must be greater than 0".to_string(),
            ));
        }

        if limit > 100 {
            return Err(AppError::BadRequest(
                "limit must be less than or equal to 100".to_string(),
            ));
        }

        if offset < 0 {
            return Err(AppError::BadRequest(
                "offset cannot be negative".to_string(),
            ));
        }

        Ok((limit, offset))
    }
}

/// Resolves the requesting user from the actor header.
pub async fn current_user(state: &AppState, headers: &HeaderMap) -> AppResult<UserRecord> {
    let user_id = headers
        .get(ACTOR_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| AppError::BadRequest(format!("missing {ACTOR_HEADER} header")))?;

    queries::get_user(&state.db, user_id).await
}

/// Loads the requesting user and rejects anyone below team lead.
pub async fn require_administrator(
    state: &AppState,
    headers: &HeaderMap,
) -> AppResult<UserRecord> {
    let user = current_user(state, headers).await?;
    let role = Role::parse(&user.role)?;
    if !role.can_administer() {
        return Err(AppError::Forbidden(
            "this operation requires a team lead or admin role".to_string(),
        ));
    }
    Ok(user)
}

pub async fn department_name(
    state: &AppState,
    department_id: Option<&str>,
) -> AppResult<Option<String>> {
    match department_id {
        Some(id) => Ok(Some(queries::get_department(&state.db, id).await?.name)),
        None => Ok(None),
    }
}

/// Evaluates the department visibility policy for one viewer and one project.
pub async fn project_access_allowed(
    state: &AppState,
    viewer: &UserRecord,
    project_department_id: Option<&str>,
) -> AppResult<bool> {
    let role = Role::parse(&viewer.role)?;
    let viewer_department = department_name(state, viewer.department_id.as_deref()).await?;
    let project_department = department_name(state, project_department_id).await?;

    Ok(crate::workflow::policy::can_access_project(
        role,
        viewer_department.as_deref(),
        project_department.as_deref(),
    ))
}

pub async fn ensure_project_access(
    state: &AppState,
    viewer: &UserRecord,
    project_department_id: Option<&str>,
) -> AppResult<()> {
    if !project_access_allowed(state, viewer, project_department_id).await? {
        return Err(AppError::Forbidden(
            "you do not have access to this project".to_string(),
        ));
    }
    Ok(())
}

/// Marks a nullable field as present: absent fields fall back to the serde
/// default (`None`), an explicit `null` arrives as `Some(None)`.
pub(crate) fn present<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    T::deserialize(deserializer).map(Some)
}
