use serde::Serialize;
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct DepartmentRecord {
    pub id: String,
    pub name: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct UserRecord {
    pub id: String,
    pub name: String,
    pub email: String,
    pub role: String,
    pub department_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ProjectRecord {
    pub id: String,
    pub name: String,
    pub description: String,
    pub department_id: Option<String>,
    pub emails: String,
    pub phone_numbers: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct StageRecord {
    pub id: String,
    pub project_id: String,
    pub title: String,
    pub color: String,
    pub position: i64,
    pub stage_type: String,
    pub main_responsible_id: Option<String>,
    pub backup_responsible_id1: Option<String>,
    pub backup_responsible_id2: Option<String>,
    pub is_review_stage: i64,
    pub linked_review_stage_id: Option<String>,
    pub approved_target_stage_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl StageRecord {
    pub fn is_review(&self) -> bool {
        self.is_review_stage == 1
    }
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct TaskRecord {
    pub id: String,
    pub title: String,
    pub description: String,
    pub project_id: String,
    pub assignee_id: Option<String>,
    pub due_date: Option<String>,
    pub start_date: Option<String>,
    pub user_status: String,
    pub project_stage_id: Option<String>,
    pub priority: String,
    pub is_in_specific_stage: i64,
    pub revision_comment: Option<String>,
    pub previous_stage_id: Option<String>,
    pub original_assignee_id: Option<String>,
    pub completed_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct AttachmentRecord {
    pub id: String,
    pub task_id: String,
    pub name: String,
    pub url: String,
    pub kind: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct RevisionEntryRecord {
    pub id: String,
    pub task_id: String,
    pub comment: String,
    pub requested_by_id: String,
    pub requested_at: String,
    pub resolved_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct HistoryEntryRecord {
    pub id: String,
    pub timestamp: String,
    pub user_id: String,
    pub action: String,
    pub entity_id: String,
    pub entity_type: String,
    pub project_id: String,
    pub details: String,
    pub created_at: String,
}

/// Task row plus the relations the wire format resolves eagerly.
#[derive(Debug, Clone)]
pub struct TaskDetails {
    pub task: TaskRecord,
    pub project_name: String,
    pub assignee_name: Option<String>,
    pub original_assignee_name: Option<String>,
    pub tags: Vec<String>,
    pub attachments: Vec<AttachmentRecord>,
    pub revision_history: Vec<RevisionEntryRecord>,
}
