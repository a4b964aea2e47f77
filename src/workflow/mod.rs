//! Task transition rules.
//!
//! Everything here is pure: the functions take the task, its project's
//! stages, and the known users, and return the fields to persist plus the
//! history entries to emit. The store applies an outcome in one transaction
//! so callers observe a single combined update.

pub mod policy;
pub mod stage_graph;

use serde_json::{json, Value};

use crate::db::models::{StageRecord, TaskRecord, UserRecord};
use crate::error::{AppError, AppResult};
use crate::workflow::stage_graph::StageGraph;

pub const COMPLETED_TAG: &str = "Completed";
pub const REDO_TAG: &str = "Redo";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserStatus {
    Pending,
    InProgress,
    Complete,
}

impl UserStatus {
    pub fn parse(value: &str) -> AppResult<Self> {
        match value {
            "pending" => Ok(Self::Pending),
            "in-progress" => Ok(Self::InProgress),
            "complete" => Ok(Self::Complete),
            _ => Err(AppError::BadRequest(format!(
                "invalid user status '{value}'"
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in-progress",
            Self::Complete => "complete",
        }
    }
}

/// Distinguishes "caller explicitly set this field" from "derive it".
/// An explicit value always suppresses the engine's auto-derivation.
#[derive(Debug, Clone)]
pub enum Requested<T> {
    Auto,
    Set(T),
}

#[derive(Debug, Clone)]
pub struct StageChangeRequest {
    pub new_stage_id: String,
    pub assignee_id: Requested<Option<String>>,
    pub user_status: Requested<UserStatus>,
}

impl StageChangeRequest {
    pub fn auto(new_stage_id: impl Into<String>) -> Self {
        Self {
            new_stage_id: new_stage_id.into(),
            assignee_id: Requested::Auto,
            user_status: Requested::Auto,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HistoryDraft {
    pub action: &'static str,
    pub details: Value,
}

/// Fields a stage change writes, computed before anything is persisted.
#[derive(Debug, Clone)]
pub struct StageChangeOutcome {
    pub project_stage_id: String,
    pub assignee_id: Option<String>,
    pub user_status: UserStatus,
    pub tags: Vec<String>,
    pub history: Vec<HistoryDraft>,
}

#[derive(Debug, Clone)]
pub struct HandoffOutcome {
    pub change: StageChangeOutcome,
    /// Set when the task entered a review stage: the vacated stage and the
    /// worker awaiting judgment.
    pub previous_stage_id: Option<String>,
    pub original_assignee_id: Option<String>,
    pub entered_review: bool,
}

#[derive(Debug, Clone)]
pub struct ApproveOutcome {
    pub change: StageChangeOutcome,
    /// Approval comments land in history, never in the revision list.
    pub comment_history: Option<HistoryDraft>,
}

#[derive(Debug, Clone)]
pub struct RevisionOutcome {
    pub change: StageChangeOutcome,
    pub comment: String,
    pub assignee_id: String,
}

fn user_name(users: &[UserRecord], user_id: Option<&str>) -> String {
    user_id
        .and_then(|id| users.iter().find(|user| user.id == id))
        .map(|user| user.name.clone())
        .unwrap_or_default()
}

fn with_completed_tag(current_tags: &[String], is_last_stage: bool) -> Vec<String> {
    let mut tags: Vec<String> = current_tags
        .iter()
        .filter(|tag| *tag != COMPLETED_TAG)
        .cloned()
        .collect();
    if is_last_stage {
        tags.push(COMPLETED_TAG.to_string());
    }
    tags
}

/// Moves a task to another stage of its project and derives the dependent
/// fields, in fixed order: assignee, then user status, then the "Completed"
/// tag, then history. Returns `None` when the task already sits in the target
/// stage (redundant writes produce no history).
pub fn apply_stage_change(
    task: &TaskRecord,
    current_tags: &[String],
    stages: &[StageRecord],
    users: &[UserRecord],
    request: &StageChangeRequest,
) -> AppResult<Option<StageChangeOutcome>> {
    if task.project_stage_id.as_deref() == Some(request.new_stage_id.as_str()) {
        return Ok(None);
    }

    let graph = StageGraph::new(stages);
    let target = graph.get(&request.new_stage_id).ok_or_else(|| {
        AppError::NotFound(format!("stage '{}' not found", request.new_stage_id))
    })?;

    // Moving stages strips stale assignment unless the target stage has a
    // resolvable main responsible or the caller pinned an assignee.
    let assignee_id = match &request.assignee_id {
        Requested::Set(value) => value.clone(),
        Requested::Auto => target
            .main_responsible_id
            .as_deref()
            .filter(|id| users.iter().any(|user| user.id == *id))
            .map(ToOwned::to_owned),
    };

    let user_status = match &request.user_status {
        Requested::Set(value) => *value,
        Requested::Auto => UserStatus::Pending,
    };

    let tags = with_completed_tag(current_tags, graph.is_last(&target.id));

    let mut history = vec![HistoryDraft {
        action: "UPDATE_TASK_STATUS",
        details: json!({
            "from": task.project_stage_id,
            "to": target.id,
        }),
    }];

    if assignee_id != task.assignee_id {
        history.push(HistoryDraft {
            action: "UPDATE_TASK_ASSIGNEE",
            details: json!({
                "from": user_name(users, task.assignee_id.as_deref()),
                "to": user_name(users, assignee_id.as_deref()),
            }),
        });
    }

    Ok(Some(StageChangeOutcome {
        project_stage_id: target.id.clone(),
        assignee_id,
        user_status,
        tags,
        history,
    }))
}

/// Automatic hand-off when a worker marks a task complete. The target is the
/// stage's linked review stage, else the next stage by position. Entering a
/// review stage keeps the worker attached and the status at `complete`;
/// entering an ordinary stage follows the usual stage-change rules. Returns
/// `None` when the task is not stage-tracked or already sits in the final
/// stage.
pub fn complete_handoff(
    task: &TaskRecord,
    current_tags: &[String],
    stages: &[StageRecord],
    users: &[UserRecord],
) -> AppResult<Option<HandoffOutcome>> {
    let Some(current_stage_id) = task.project_stage_id.as_deref() else {
        return Ok(None);
    };

    let graph = StageGraph::new(stages);
    let Some(current) = graph.get(current_stage_id) else {
        return Ok(None);
    };

    let target = match current.linked_review_stage_id.as_deref() {
        Some(linked) => graph.get(linked),
        None => graph.next_stage_after(current),
    };
    let Some(target) = target else {
        return Ok(None);
    };

    if target.is_review() {
        // Awaiting judgment, not starting new work: keep the assignee and the
        // complete status so the reviewer sees who finished it.
        let request = StageChangeRequest {
            new_stage_id: target.id.clone(),
            assignee_id: Requested::Set(task.assignee_id.clone()),
            user_status: Requested::Set(UserStatus::Complete),
        };
        let change = apply_stage_change(task, current_tags, stages, users, &request)?;
        let Some(change) = change else {
            return Ok(None);
        };

        return Ok(Some(HandoffOutcome {
            change,
            previous_stage_id: Some(current.id.clone()),
            original_assignee_id: task.assignee_id.clone(),
            entered_review: true,
        }));
    }

    let request = StageChangeRequest::auto(target.id.clone());
    let change = apply_stage_change(task, current_tags, stages, users, &request)?;
    let Some(change) = change else {
        return Ok(None);
    };

    Ok(Some(HandoffOutcome {
        change,
        previous_stage_id: None,
        original_assignee_id: None,
        entered_review: false,
    }))
}

fn review_stage_of<'a>(
    task: &TaskRecord,
    graph: &StageGraph<'a>,
) -> AppResult<&'a StageRecord> {
    let current = task
        .project_stage_id
        .as_deref()
        .and_then(|id| graph.get(id))
        .ok_or_else(|| {
            AppError::BadRequest("task is not in any project stage".to_string())
        })?;

    if !current.is_review() {
        return Err(AppError::BadRequest(
            "task is not in a review stage".to_string(),
        ));
    }

    Ok(current)
}

/// Reviewer approval: advance the task to the chosen stage (defaulting to the
/// review stage's configured target) and close the open review.
pub fn approve(
    task: &TaskRecord,
    current_tags: &[String],
    stages: &[StageRecord],
    users: &[UserRecord],
    target_stage_id: Option<&str>,
    comment: Option<&str>,
    reviewer: &UserRecord,
) -> AppResult<ApproveOutcome> {
    let graph = StageGraph::new(stages);
    let current = review_stage_of(task, &graph)?;

    let target_id = target_stage_id
        .or(current.approved_target_stage_id.as_deref())
        .ok_or_else(|| {
            AppError::BadRequest("no approval target stage configured".to_string())
        })?;

    if target_id == current.id {
        return Err(AppError::BadRequest(
            "approval target must differ from the review stage".to_string(),
        ));
    }

    let target = graph
        .get(target_id)
        .ok_or_else(|| AppError::NotFound(format!("stage '{target_id}' not found")))?;

    let request = StageChangeRequest::auto(target.id.clone());
    let change = apply_stage_change(task, current_tags, stages, users, &request)?
        .expect("target differs from current stage");

    let comment_history = comment
        .map(str::trim)
        .filter(|comment| !comment.is_empty())
        .map(|comment| HistoryDraft {
            action: "UPDATE_TASK_STATUS",
            details: json!({
                "action": "approved",
                "comment": comment,
                "target_stage": target.title,
                "reviewer": reviewer.name,
            }),
        });

    Ok(ApproveOutcome {
        change,
        comment_history,
    })
}

/// Reviewer sends the task backward with feedback: the original worker gets
/// it back in `pending` with a "Redo" tag and a new revision entry.
pub fn request_revision(
    task: &TaskRecord,
    current_tags: &[String],
    stages: &[StageRecord],
    users: &[UserRecord],
    target_stage_id: Option<&str>,
    comment: &str,
) -> AppResult<RevisionOutcome> {
    let comment = comment.trim();
    if comment.is_empty() {
        return Err(AppError::BadRequest(
            "revision comment cannot be empty".to_string(),
        ));
    }

    let graph = StageGraph::new(stages);
    let current = review_stage_of(task, &graph)?;

    let target_id = target_stage_id
        .or(task.previous_stage_id.as_deref())
        .ok_or_else(|| {
            AppError::BadRequest("no revision target stage given".to_string())
        })?;

    if target_id == current.id {
        return Err(AppError::BadRequest(
            "revision target must differ from the review stage".to_string(),
        ));
    }

    if graph.get(target_id).is_none() {
        return Err(AppError::NotFound(format!("stage '{target_id}' not found")));
    }

    let assignee_id = task
        .original_assignee_id
        .clone()
        .or_else(|| task.assignee_id.clone())
        .ok_or_else(|| {
            AppError::MissingAssignee(
                "could not resolve an assignee to send the task back to".to_string(),
            )
        })?;

    let mut tags: Vec<String> = current_tags.to_vec();
    if !tags.iter().any(|tag| tag == REDO_TAG) {
        tags.push(REDO_TAG.to_string());
    }

    // Explicit assignee and status so auto-assignment and the pending reset
    // cannot override the deliberate hand-back.
    let request = StageChangeRequest {
        new_stage_id: target_id.to_string(),
        assignee_id: Requested::Set(Some(assignee_id.clone())),
        user_status: Requested::Set(UserStatus::Pending),
    };
    let change = apply_stage_change(task, &tags, stages, users, &request)?
        .expect("target differs from current stage");

    Ok(RevisionOutcome {
        change,
        comment: comment.to_string(),
        assignee_id,
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::db::models::{StageRecord, TaskRecord, UserRecord};

    pub fn stage(id: &str, title: &str, position: i64) -> StageRecord {
        StageRecord {
            id: id.to_string(),
            project_id: "project-1".to_string(),
            title: title.to_string(),
            color: String::new(),
            position,
            stage_type: "project".to_string(),
            main_responsible_id: None,
            backup_responsible_id1: None,
            backup_responsible_id2: None,
            is_review_stage: 0,
            linked_review_stage_id: None,
            approved_target_stage_id: None,
            created_at: "2026-01-01T00:00:00Z".to_string(),
            updated_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    pub fn user(id: &str, name: &str) -> UserRecord {
        UserRecord {
            id: id.to_string(),
            name: name.to_string(),
            email: format!("{id}@example.com"),
            role: "user".to_string(),
            department_id: None,
            created_at: "2026-01-01T00:00:00Z".to_string(),
            updated_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    pub fn task(id: &str, stage_id: Option<&str>, assignee_id: Option<&str>) -> TaskRecord {
        TaskRecord {
            id: id.to_string(),
            title: "task".to_string(),
            description: String::new(),
            project_id: "project-1".to_string(),
            assignee_id: assignee_id.map(ToOwned::to_owned),
            due_date: None,
            start_date: None,
            user_status: "pending".to_string(),
            project_stage_id: stage_id.map(ToOwned::to_owned),
            priority: "medium".to_string(),
            is_in_specific_stage: 0,
            revision_comment: None,
            previous_stage_id: None,
            original_assignee_id: None,
            completed_at: None,
            created_at: "2026-01-01T00:00:00Z".to_string(),
            updated_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }
}
