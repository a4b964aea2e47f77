use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use sqlx::query_builder::QueryBuilder;
use sqlx::{Any, AnyPool};
use uuid::Uuid;

use crate::db::models::{
    AttachmentRecord, DepartmentRecord, HistoryEntryRecord, ProjectRecord, RevisionEntryRecord,
    StageRecord, TaskDetails, TaskRecord, UserRecord,
};
use crate::error::{AppError, AppResult};
use crate::workflow::{
    self, Requested, StageChangeOutcome, StageChangeRequest, UserStatus,
};

#[derive(Debug, Clone)]
pub struct NewDepartmentInput {
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct NewUserInput {
    pub name: String,
    pub email: String,
    pub role: String,
    pub department_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateUserInput {
    pub name: Option<String>,
    pub email: Option<String>,
    pub role: Option<String>,
    pub department_id: Option<Option<String>>,
}

#[derive(Debug, Clone)]
pub struct NewProjectInput {
    pub name: String,
    pub description: String,
    pub department_id: Option<String>,
    pub emails: Vec<String>,
    pub phone_numbers: Vec<String>,
    pub actor: String,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateProjectInput {
    pub name: Option<String>,
    pub description: Option<String>,
    pub department_id: Option<Option<String>>,
    pub emails: Option<Vec<String>>,
    pub phone_numbers: Option<Vec<String>>,
    pub actor: String,
}

#[derive(Debug, Clone)]
pub struct NewStageInput {
    pub project_id: String,
    pub title: String,
    pub color: String,
    pub stage_type: String,
    pub main_responsible_id: Option<String>,
    pub backup_responsible_id1: Option<String>,
    pub backup_responsible_id2: Option<String>,
    pub is_review_stage: bool,
    pub linked_review_stage_id: Option<String>,
    pub approved_target_stage_id: Option<String>,
    pub actor: String,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateStageInput {
    pub title: Option<String>,
    pub color: Option<String>,
    pub stage_type: Option<String>,
    pub main_responsible_id: Option<Option<String>>,
    pub backup_responsible_id1: Option<Option<String>>,
    pub backup_responsible_id2: Option<Option<String>>,
    pub is_review_stage: Option<bool>,
    pub linked_review_stage_id: Option<Option<String>>,
    pub approved_target_stage_id: Option<Option<String>>,
    pub actor: String,
}

#[derive(Debug, Clone, Default)]
pub struct TaskFilters {
    pub project_id: Option<String>,
    pub assignee_id: Option<String>,
    pub user_status: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewTaskInput {
    pub title: String,
    pub description: String,
    pub project_id: String,
    pub assignee_id: Option<String>,
    pub due_date: Option<String>,
    pub start_date: Option<String>,
    pub user_status: String,
    pub project_stage_id: Option<String>,
    pub priority: String,
    pub tags: Vec<String>,
    pub actor: String,
}

/// Partial task update. `Option<Option<_>>` fields distinguish "leave alone"
/// (outer `None`) from "clear" (`Some(None)`); the engine's auto-derivation
/// only runs for fields the caller left alone.
#[derive(Debug, Clone, Default)]
pub struct UpdateTaskInput {
    pub title: Option<String>,
    pub description: Option<String>,
    pub due_date: Option<Option<String>>,
    pub start_date: Option<Option<String>>,
    pub priority: Option<String>,
    pub user_status: Option<String>,
    pub project_stage_id: Option<String>,
    pub assignee_id: Option<Option<String>>,
    pub tags: Option<Vec<String>>,
    pub is_in_specific_stage: Option<bool>,
    pub revision_comment: Option<Option<String>>,
    pub actor: String,
}

#[derive(Debug, Clone)]
pub struct NewAttachmentInput {
    pub name: String,
    pub url: String,
    pub kind: String,
    pub actor: String,
}

// ---------------------------------------------------------------------------
// Departments

pub async fn list_departments(pool: &AnyPool) -> AppResult<Vec<DepartmentRecord>> {
    let departments = sqlx::query_as::<Any, DepartmentRecord>(
        "SELECT id, name, created_at, updated_at FROM departments ORDER BY name ASC",
    )
    .fetch_all(pool)
    .await?;
    Ok(departments)
}

pub async fn get_department(pool: &AnyPool, department_id: &str) -> AppResult<DepartmentRecord> {
    let department = sqlx::query_as::<Any, DepartmentRecord>(
        "SELECT id, name, created_at, updated_at FROM departments WHERE id = ?",
    )
    .bind(department_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| AppError::NotFound(format!("department '{department_id}' not found")))?;
    Ok(department)
}

pub async fn create_department(
    pool: &AnyPool,
    input: NewDepartmentInput,
) -> AppResult<DepartmentRecord> {
    let name = input.name.trim().to_string();
    if name.is_empty() {
        return Err(AppError::BadRequest(
            "department name cannot be empty".to_string(),
        ));
    }

    ensure_department_name_free(pool, &name, None).await?;

    let department_id = Uuid::new_v4().to_string();
    let now = now_timestamp();

    sqlx::query(
        "INSERT INTO departments (id, name, created_at, updated_at) VALUES (?, ?, ?, ?)",
    )
    .bind(&department_id)
    .bind(&name)
    .bind(&now)
    .bind(&now)
    .execute(pool)
    .await?;

    get_department(pool, &department_id).await
}

pub async fn update_department(
    pool: &AnyPool,
    department_id: &str,
    name: String,
) -> AppResult<DepartmentRecord> {
    let existing = get_department(pool, department_id).await?;

    let name = name.trim().to_string();
    if name.is_empty() {
        return Err(AppError::BadRequest(
            "department name cannot be empty".to_string(),
        ));
    }

    ensure_department_name_free(pool, &name, Some(&existing.id)).await?;

    sqlx::query("UPDATE departments SET name = ?, updated_at = ? WHERE id = ?")
        .bind(&name)
        .bind(now_timestamp())
        .bind(&existing.id)
        .execute(pool)
        .await?;

    get_department(pool, department_id).await
}

pub async fn delete_department(pool: &AnyPool, department_id: &str) -> AppResult<()> {
    // FK SET NULL decouples users and projects instead of cascading.
    let result = sqlx::query("DELETE FROM departments WHERE id = ?")
        .bind(department_id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::NotFound(format!(
            "department '{department_id}' not found"
        )));
    }

    Ok(())
}

async fn ensure_department_name_free(
    pool: &AnyPool,
    name: &str,
    exclude_id: Option<&str>,
) -> AppResult<()> {
    let existing: Option<String> =
        sqlx::query_scalar("SELECT id FROM departments WHERE LOWER(name) = LOWER(?)")
            .bind(name)
            .fetch_optional(pool)
            .await?;

    match existing {
        Some(id) if Some(id.as_str()) != exclude_id => Err(AppError::Conflict(format!(
            "department '{name}' already exists"
        ))),
        _ => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Users

pub async fn list_users(pool: &AnyPool) -> AppResult<Vec<UserRecord>> {
    let users = sqlx::query_as::<Any, UserRecord>(
        r#"
        SELECT id, name, email, role, department_id, created_at, updated_at
        FROM users
        ORDER BY name ASC
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(users)
}

pub async fn get_user(pool: &AnyPool, user_id: &str) -> AppResult<UserRecord> {
    let user = sqlx::query_as::<Any, UserRecord>(
        r#"
        SELECT id, name, email, role, department_id, created_at, updated_at
        FROM users
        WHERE id = ?
        "#,
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| AppError::NotFound(format!("user '{user_id}' not found")))?;
    Ok(user)
}

pub async fn create_user(pool: &AnyPool, input: NewUserInput) -> AppResult<UserRecord> {
    let name = input.name.trim().to_string();
    if name.is_empty() {
        return Err(AppError::BadRequest("user name cannot be empty".to_string()));
    }

    let email = input.email.trim().to_lowercase();
    if email.is_empty() || !email.contains('@') {
        return Err(AppError::BadRequest(format!("invalid email '{email}'")));
    }

    workflow::policy::Role::parse(&input.role)?;

    if let Some(department_id) = input.department_id.as_deref() {
        get_department(pool, department_id).await?;
    }

    let user_id = Uuid::new_v4().to_string();
    let now = now_timestamp();

    sqlx::query(
        r#"
        INSERT INTO users (id, name, email, role, department_id, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&user_id)
    .bind(&name)
    .bind(&email)
    .bind(&input.role)
    .bind(&input.department_id)
    .bind(&now)
    .bind(&now)
    .execute(pool)
    .await?;

    get_user(pool, &user_id).await
}

pub async fn update_user(
    pool: &AnyPool,
    user_id: &str,
    input: UpdateUserInput,
) -> AppResult<UserRecord> {
    let existing = get_user(pool, user_id).await?;

    let name = match input.name {
        Some(value) => {
            let trimmed = value.trim().to_string();
            if trimmed.is_empty() {
                return Err(AppError::BadRequest(
                    "user name cannot be empty".to_string(),
                ));
            }
            trimmed
        }
        None => existing.name,
    };

    let email = match input.email {
        Some(value) => {
            let email = value.trim().to_lowercase();
            if email.is_empty() || !email.contains('@') {
                return Err(AppError::BadRequest(format!("invalid email '{email}'")));
            }
            email
        }
        None => existing.email,
    };

    let role = match input.role {
        Some(value) => {
            workflow::policy::Role::parse(&value)?;
            value
        }
        None => existing.role,
    };

    let department_id = match input.department_id {
        Some(value) => {
            if let Some(department_id) = value.as_deref() {
                get_department(pool, department_id).await?;
            }
            value
        }
        None => existing.department_id,
    };

    sqlx::query(
        r#"
        UPDATE users
        SET name = ?, email = ?, role = ?, department_id = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&name)
    .bind(&email)
    .bind(&role)
    .bind(&department_id)
    .bind(now_timestamp())
    .bind(user_id)
    .execute(pool)
    .await?;

    get_user(pool, user_id).await
}

pub async fn delete_user(pool: &AnyPool, user_id: &str) -> AppResult<()> {
    let result = sqlx::query("DELETE FROM users WHERE id = ?")
        .bind(user_id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::NotFound(format!("user '{user_id}' not found")));
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Projects

pub async fn list_projects(
    pool: &AnyPool,
    limit: i64,
    offset: i64,
) -> AppResult<Vec<ProjectRecord>> {
    let projects = sqlx::query_as::<Any, ProjectRecord>(
        r#"
        SELECT id, name, description, department_id, emails, phone_numbers, created_at, updated_at
        FROM projects
        ORDER BY created_at DESC
        LIMIT ? OFFSET ?
        "#,
    )
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;
    Ok(projects)
}

pub async fn get_project(pool: &AnyPool, project_id: &str) -> AppResult<ProjectRecord> {
    let project = sqlx::query_as::<Any, ProjectRecord>(
        r#"
        SELECT id, name, description, department_id, emails, phone_numbers, created_at, updated_at
        FROM projects
        WHERE id = ?
        "#,
    )
    .bind(project_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| AppError::NotFound(format!("project '{project_id}' not found")))?;
    Ok(project)
}

pub async fn create_project(pool: &AnyPool, input: NewProjectInput) -> AppResult<ProjectRecord> {
    let name = input.name.trim().to_string();
    if name.is_empty() {
        return Err(AppError::BadRequest(
            "project name cannot be empty".to_string(),
        ));
    }

    ensure_project_name_free(pool, &name, None).await?;

    if let Some(department_id) = input.department_id.as_deref() {
        get_department(pool, department_id).await?;
    }

    let project_id = Uuid::new_v4().to_string();
    let now = now_timestamp();

    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO projects (id, name, description, department_id, emails, phone_numbers, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&project_id)
    .bind(&name)
    .bind(&input.description)
    .bind(&input.department_id)
    .bind(encode_string_list(&input.emails)?)
    .bind(encode_string_list(&input.phone_numbers)?)
    .bind(&now)
    .bind(&now)
    .execute(&mut *tx)
    .await?;

    insert_history(
        &mut tx,
        &project_id,
        &input.actor,
        "CREATE_PROJECT",
        "project",
        &project_id,
        serde_json::json!({ "name": name }),
    )
    .await?;

    tx.commit().await?;

    get_project(pool, &project_id).await
}

pub async fn update_project(
    pool: &AnyPool,
    project_id: &str,
    input: UpdateProjectInput,
) -> AppResult<ProjectRecord> {
    let existing = get_project(pool, project_id).await?;

    let name = match input.name {
        Some(value) => {
            let trimmed = value.trim().to_string();
            if trimmed.is_empty() {
                return Err(AppError::BadRequest(
                    "project name cannot be empty".to_string(),
                ));
            }
            ensure_project_name_free(pool, &trimmed, Some(&existing.id)).await?;
            trimmed
        }
        None => existing.name.clone(),
    };

    let department_id = match input.department_id {
        Some(value) => {
            if let Some(department_id) = value.as_deref() {
                get_department(pool, department_id).await?;
            }
            value
        }
        None => existing.department_id.clone(),
    };

    let description = input.description.unwrap_or(existing.description.clone());
    let emails = match input.emails {
        Some(values) => encode_string_list(&values)?,
        None => existing.emails.clone(),
    };
    let phone_numbers = match input.phone_numbers {
        Some(values) => encode_string_list(&values)?,
        None => existing.phone_numbers.clone(),
    };

    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        UPDATE projects
        SET name = ?, description = ?, department_id = ?, emails = ?, phone_numbers = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&name)
    .bind(&description)
    .bind(&department_id)
    .bind(&emails)
    .bind(&phone_numbers)
    .bind(now_timestamp())
    .bind(project_id)
    .execute(&mut *tx)
    .await?;

    insert_history(
        &mut tx,
        project_id,
        &input.actor,
        "UPDATE_PROJECT",
        "project",
        project_id,
        serde_json::json!({ "from": existing.name, "to": name }),
    )
    .await?;

    tx.commit().await?;

    get_project(pool, project_id).await
}

pub async fn delete_project(pool: &AnyPool, project_id: &str) -> AppResult<()> {
    // Cascades to stages, tasks, and the project's history entries.
    let result = sqlx::query("DELETE FROM projects WHERE id = ?")
        .bind(project_id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::NotFound(format!(
            "project '{project_id}' not found"
        )));
    }

    Ok(())
}

async fn ensure_project_name_free(
    pool: &AnyPool,
    name: &str,
    exclude_id: Option<&str>,
) -> AppResult<()> {
    let existing: Option<String> =
        sqlx::query_scalar("SELECT id FROM projects WHERE LOWER(name) = LOWER(?)")
            .bind(name)
            .fetch_optional(pool)
            .await?;

    match existing {
        Some(id) if Some(id.as_str()) != exclude_id => Err(AppError::Conflict(format!(
            "project '{name}' already exists"
        ))),
        _ => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Stages

pub async fn list_stages(pool: &AnyPool, project_id: &str) -> AppResult<Vec<StageRecord>> {
    get_project(pool, project_id).await?;
    stages_for_project(pool, project_id).await
}

pub async fn get_stage(pool: &AnyPool, stage_id: &str) -> AppResult<StageRecord> {
    let stage = sqlx::query_as::<Any, StageRecord>(
        r#"
        SELECT
            id, project_id, title, color, position, stage_type,
            main_responsible_id, backup_responsible_id1, backup_responsible_id2,
            is_review_stage, linked_review_stage_id, approved_target_stage_id,
            created_at, updated_at
        FROM stages
        WHERE id = ?
        "#,
    )
    .bind(stage_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| AppError::NotFound(format!("stage '{stage_id}' not found")))?;
    Ok(stage)
}

pub async fn create_stage(pool: &AnyPool, input: NewStageInput) -> AppResult<StageRecord> {
    get_project(pool, &input.project_id).await?;
    validate_stage_type(&input.stage_type)?;

    let title = input.title.trim().to_string();
    if title.is_empty() {
        return Err(AppError::BadRequest(
            "stage title cannot be empty".to_string(),
        ));
    }

    let existing = stages_for_project(pool, &input.project_id).await?;
    let now = now_timestamp();

    let candidate = StageRecord {
        id: Uuid::new_v4().to_string(),
        project_id: input.project_id.clone(),
        title,
        color: input.color,
        position: existing.len() as i64,
        stage_type: input.stage_type,
        main_responsible_id: input.main_responsible_id,
        backup_responsible_id1: input.backup_responsible_id1,
        backup_responsible_id2: input.backup_responsible_id2,
        is_review_stage: i64::from(input.is_review_stage),
        linked_review_stage_id: input.linked_review_stage_id,
        approved_target_stage_id: input.approved_target_stage_id,
        created_at: now.clone(),
        updated_at: now,
    };

    let mut prospective = existing;
    prospective.push(candidate.clone());
    workflow::stage_graph::validate_stage_set(&prospective)?;

    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO stages (
            id, project_id, title, color, position, stage_type,
            main_responsible_id, backup_responsible_id1, backup_responsible_id2,
            is_review_stage, linked_review_stage_id, approved_target_stage_id,
            created_at, updated_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&candidate.id)
    .bind(&candidate.project_id)
    .bind(&candidate.title)
    .bind(&candidate.color)
    .bind(candidate.position)
    .bind(&candidate.stage_type)
    .bind(&candidate.main_responsible_id)
    .bind(&candidate.backup_responsible_id1)
    .bind(&candidate.backup_responsible_id2)
    .bind(candidate.is_review_stage)
    .bind(&candidate.linked_review_stage_id)
    .bind(&candidate.approved_target_stage_id)
    .bind(&candidate.created_at)
    .bind(&candidate.updated_at)
    .execute(&mut *tx)
    .await?;

    insert_history(
        &mut tx,
        &candidate.project_id,
        &input.actor,
        "CREATE_STAGE",
        "stage",
        &candidate.id,
        serde_json::json!({ "title": candidate.title }),
    )
    .await?;

    tx.commit().await?;

    get_stage(pool, &candidate.id).await
}

pub async fn update_stage(
    pool: &AnyPool,
    stage_id: &str,
    input: UpdateStageInput,
) -> AppResult<StageRecord> {
    let existing = get_stage(pool, stage_id).await?;

    let title = match input.title {
        Some(value) => {
            let trimmed = value.trim().to_string();
            if trimmed.is_empty() {
                return Err(AppError::BadRequest(
                    "stage title cannot be empty".to_string(),
                ));
            }
            trimmed
        }
        None => existing.title.clone(),
    };

    let stage_type = match input.stage_type {
        Some(value) => {
            validate_stage_type(&value)?;
            value
        }
        None => existing.stage_type.clone(),
    };

    let updated = StageRecord {
        title,
        color: input.color.unwrap_or(existing.color.clone()),
        stage_type,
        main_responsible_id: input
            .main_responsible_id
            .unwrap_or(existing.main_responsible_id.clone()),
        backup_responsible_id1: input
            .backup_responsible_id1
            .unwrap_or(existing.backup_responsible_id1.clone()),
        backup_responsible_id2: input
            .backup_responsible_id2
            .unwrap_or(existing.backup_responsible_id2.clone()),
        is_review_stage: input
            .is_review_stage
            .map(i64::from)
            .unwrap_or(existing.is_review_stage),
        linked_review_stage_id: input
            .linked_review_stage_id
            .unwrap_or(existing.linked_review_stage_id.clone()),
        approved_target_stage_id: input
            .approved_target_stage_id
            .unwrap_or(existing.approved_target_stage_id.clone()),
        updated_at: now_timestamp(),
        ..existing.clone()
    };

    let mut prospective = stages_for_project(pool, &existing.project_id).await?;
    for stage in &mut prospective {
        if stage.id == updated.id {
            *stage = updated.clone();
        }
    }
    workflow::stage_graph::validate_stage_set(&prospective)?;

    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        UPDATE stages
        SET title = ?, color = ?, stage_type = ?,
            main_responsible_id = ?, backup_responsible_id1 = ?, backup_responsible_id2 = ?,
            is_review_stage = ?, linked_review_stage_id = ?, approved_target_stage_id = ?,
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&updated.title)
    .bind(&updated.color)
    .bind(&updated.stage_type)
    .bind(&updated.main_responsible_id)
    .bind(&updated.backup_responsible_id1)
    .bind(&updated.backup_responsible_id2)
    .bind(updated.is_review_stage)
    .bind(&updated.linked_review_stage_id)
    .bind(&updated.approved_target_stage_id)
    .bind(&updated.updated_at)
    .bind(stage_id)
    .execute(&mut *tx)
    .await?;

    insert_history(
        &mut tx,
        &existing.project_id,
        &input.actor,
        "UPDATE_STAGE",
        "stage",
        stage_id,
        serde_json::json!({ "from": existing.title, "to": updated.title }),
    )
    .await?;

    tx.commit().await?;

    get_stage(pool, stage_id).await
}

pub async fn delete_stage(pool: &AnyPool, stage_id: &str, actor: &str) -> AppResult<()> {
    let existing = get_stage(pool, stage_id).await?;
    let siblings = stages_for_project(pool, &existing.project_id).await?;

    if siblings.len() <= 1 {
        return Err(AppError::BadRequest(
            "cannot delete the only stage of a project".to_string(),
        ));
    }

    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM stages WHERE id = ?")
        .bind(stage_id)
        .execute(&mut *tx)
        .await?;

    // Drop dangling review links and restore contiguous positions.
    sqlx::query("UPDATE stages SET linked_review_stage_id = NULL WHERE linked_review_stage_id = ?")
        .bind(stage_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        "UPDATE stages SET approved_target_stage_id = NULL WHERE approved_target_stage_id = ?",
    )
    .bind(stage_id)
    .execute(&mut *tx)
    .await?;

    let mut position = 0i64;
    for sibling in siblings.iter().filter(|stage| stage.id != stage_id) {
        if sibling.position != position {
            sqlx::query("UPDATE stages SET position = ? WHERE id = ?")
                .bind(position)
                .bind(&sibling.id)
                .execute(&mut *tx)
                .await?;
        }
        position += 1;
    }

    insert_history(
        &mut tx,
        &existing.project_id,
        actor,
        "DELETE_STAGE",
        "stage",
        stage_id,
        serde_json::json!({ "title": existing.title }),
    )
    .await?;

    tx.commit().await?;
    Ok(())
}

async fn stages_for_project(pool: &AnyPool, project_id: &str) -> AppResult<Vec<StageRecord>> {
    let stages = sqlx::query_as::<Any, StageRecord>(
        r#"
        SELECT
            id, project_id, title, color, position, stage_type,
            main_responsible_id, backup_responsible_id1, backup_responsible_id2,
            is_review_stage, linked_review_stage_id, approved_target_stage_id,
            created_at, updated_at
        FROM stages
        WHERE project_id = ?
        ORDER BY position ASC
        "#,
    )
    .bind(project_id)
    .fetch_all(pool)
    .await?;
    Ok(stages)
}

// ---------------------------------------------------------------------------
// Tasks

pub async fn list_tasks(
    pool: &AnyPool,
    filters: TaskFilters,
    limit: i64,
    offset: i64,
) -> AppResult<Vec<TaskDetails>> {
    if let Some(user_status) = filters.user_status.as_deref() {
        UserStatus::parse(user_status)?;
    }

    let mut query = QueryBuilder::<Any>::new(
        r#"
        SELECT
            id, title, description, project_id, assignee_id, due_date, start_date,
            user_status, project_stage_id, priority, is_in_specific_stage,
            revision_comment, previous_stage_id, original_assignee_id, completed_at,
            created_at, updated_at
        FROM tasks
        WHERE 1 = 1
        "#,
    );

    if let Some(project_id) = filters.project_id {
        query.push(" AND project_id = ");
        query.push_bind(project_id);
    }

    if let Some(assignee_id) = filters.assignee_id {
        query.push(" AND assignee_id = ");
        query.push_bind(assignee_id);
    }

    if let Some(user_status) = filters.user_status {
        query.push(" AND user_status = ");
        query.push_bind(user_status);
    }

    query.push(" ORDER BY created_at ASC LIMIT ");
    query.push_bind(limit);
    query.push(" OFFSET ");
    query.push_bind(offset);

    let tasks = query.build_query_as::<TaskRecord>().fetch_all(pool).await?;

    let mut details = Vec::with_capacity(tasks.len());
    for task in tasks {
        details.push(task_details_for(pool, task).await?);
    }
    Ok(details)
}

pub async fn get_task_details(pool: &AnyPool, task_id: &str) -> AppResult<TaskDetails> {
    let task = get_task_record_by_id(pool, task_id).await?;
    task_details_for(pool, task).await
}

pub async fn create_task(pool: &AnyPool, input: NewTaskInput) -> AppResult<TaskDetails> {
    let title = input.title.trim().to_string();
    if title.is_empty() {
        return Err(AppError::BadRequest(
            "task title cannot be empty".to_string(),
        ));
    }

    validate_priority(&input.priority)?;
    UserStatus::parse(&input.user_status)?;

    get_project(pool, &input.project_id).await?;
    let stages = stages_for_project(pool, &input.project_id).await?;

    // Stage tracking defaults to the project's first stage when the project
    // has stages and the caller did not pick one.
    let project_stage_id = match input.project_stage_id {
        Some(stage_id) => {
            if !stages.iter().any(|stage| stage.id == stage_id) {
                return Err(AppError::BadRequest(format!(
                    "stage '{stage_id}' does not belong to the task's project"
                )));
            }
            Some(stage_id)
        }
        None => stages.first().map(|stage| stage.id.clone()),
    };

    if let Some(assignee_id) = input.assignee_id.as_deref() {
        get_user(pool, assignee_id).await?;
    }

    let task_id = Uuid::new_v4().to_string();
    let now = now_timestamp();

    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO tasks (
            id, title, description, project_id, assignee_id, due_date, start_date,
            user_status, project_stage_id, priority, is_in_specific_stage,
            revision_comment, previous_stage_id, original_assignee_id, completed_at,
            created_at, updated_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, NULL, NULL, NULL, NULL, ?, ?)
        "#,
    )
    .bind(&task_id)
    .bind(&title)
    .bind(&input.description)
    .bind(&input.project_id)
    .bind(&input.assignee_id)
    .bind(&input.due_date)
    .bind(&input.start_date)
    .bind(&input.user_status)
    .bind(&project_stage_id)
    .bind(&input.priority)
    .bind(&now)
    .bind(&now)
    .execute(&mut *tx)
    .await?;

    replace_tags(&mut tx, &task_id, &normalized_tags(input.tags)).await?;

    insert_history(
        &mut tx,
        &input.project_id,
        &input.actor,
        "CREATE_TASK",
        "task",
        &task_id,
        serde_json::json!({ "title": title }),
    )
    .await?;

    tx.commit().await?;

    get_task_details(pool, &task_id).await
}

pub async fn update_task(
    pool: &AnyPool,
    task_id: &str,
    input: UpdateTaskInput,
) -> AppResult<TaskDetails> {
    let task = get_task_record_by_id(pool, task_id).await?;
    let current_tags = tags_for_task(pool, task_id).await?;

    if let Some(priority) = input.priority.as_deref() {
        validate_priority(priority)?;
    }
    if let Some(user_status) = input.user_status.as_deref() {
        UserStatus::parse(user_status)?;
    }

    let title = match input.title {
        Some(value) => {
            let trimmed = value.trim().to_string();
            if trimmed.is_empty() {
                return Err(AppError::BadRequest(
                    "task title cannot be empty".to_string(),
                ));
            }
            trimmed
        }
        None => task.title.clone(),
    };

    if let Some(Some(assignee_id)) = input.assignee_id.as_ref() {
        get_user(pool, assignee_id).await?;
    }

    let stages = stages_for_project(pool, &task.project_id).await?;
    let users = list_users(pool).await?;

    let base_tags = input.tags.map(normalized_tags).unwrap_or(current_tags.clone());

    // Everything the write will set, engine-derived fields included, is
    // computed before the transaction so the update lands as one statement.
    let mut next = TaskWrite {
        title,
        description: input.description.unwrap_or(task.description.clone()),
        due_date: input.due_date.unwrap_or(task.due_date.clone()),
        start_date: input.start_date.unwrap_or(task.start_date.clone()),
        priority: input.priority.clone().unwrap_or(task.priority.clone()),
        user_status: input.user_status.clone().unwrap_or(task.user_status.clone()),
        project_stage_id: task.project_stage_id.clone(),
        assignee_id: match input.assignee_id.clone() {
            Some(value) => value,
            None => task.assignee_id.clone(),
        },
        tags: base_tags.clone(),
        is_in_specific_stage: input
            .is_in_specific_stage
            .map(i64::from)
            .unwrap_or(task.is_in_specific_stage),
        revision_comment: input
            .revision_comment
            .unwrap_or(task.revision_comment.clone()),
        previous_stage_id: task.previous_stage_id.clone(),
        original_assignee_id: task.original_assignee_id.clone(),
        completed_at: task.completed_at.clone(),
        history: Vec::new(),
    };

    let explicit_stage_change = input
        .project_stage_id
        .as_deref()
        .is_some_and(|stage_id| task.project_stage_id.as_deref() != Some(stage_id));

    let completing = input.user_status.as_deref() == Some(UserStatus::Complete.as_str())
        && task.user_status != UserStatus::Complete.as_str();

    if explicit_stage_change {
        let request = StageChangeRequest {
            new_stage_id: input.project_stage_id.clone().unwrap_or_default(),
            assignee_id: match input.assignee_id.clone() {
                Some(value) => Requested::Set(value),
                None => Requested::Auto,
            },
            user_status: match input.user_status.as_deref() {
                Some(value) => Requested::Set(UserStatus::parse(value)?),
                None => Requested::Auto,
            },
        };

        if let Some(outcome) =
            workflow::apply_stage_change(&task, &base_tags, &stages, &users, &request)?
        {
            next.apply_change(outcome);
        }
    } else if completing {
        if let Some(handoff) = workflow::complete_handoff(&task, &base_tags, &stages, &users)? {
            next.apply_change(handoff.change);
            if handoff.entered_review {
                next.is_in_specific_stage = 1;
                next.previous_stage_id = handoff.previous_stage_id;
                next.original_assignee_id = handoff.original_assignee_id;
            }
        }
    } else {
        // Plain field edit: no engine involvement, but assignee changes are
        // still audited.
        if next.assignee_id != task.assignee_id {
            next.history.push(workflow::HistoryDraft {
                action: "UPDATE_TASK_ASSIGNEE",
                details: serde_json::json!({
                    "from": name_of(&users, task.assignee_id.as_deref()),
                    "to": name_of(&users, next.assignee_id.as_deref()),
                }),
            });
        }
        next.history.push(workflow::HistoryDraft {
            action: "UPDATE_TASK",
            details: serde_json::json!({ "title": next.title }),
        });
    }

    persist_task_write(pool, &task, next, &input.actor).await?;
    get_task_details(pool, task_id).await
}

pub async fn delete_task(pool: &AnyPool, task_id: &str, actor: &str) -> AppResult<()> {
    let task = get_task_record_by_id(pool, task_id).await?;

    let mut tx = pool.begin().await?;

    insert_history(
        &mut tx,
        &task.project_id,
        actor,
        "DELETE_TASK",
        "task",
        task_id,
        serde_json::json!({ "title": task.title }),
    )
    .await?;

    sqlx::query("DELETE FROM tasks WHERE id = ?")
        .bind(task_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Review workflow

pub async fn approve_task(
    pool: &AnyPool,
    task_id: &str,
    target_stage_id: Option<&str>,
    comment: Option<&str>,
    reviewer: &UserRecord,
) -> AppResult<TaskDetails> {
    let task = get_task_record_by_id(pool, task_id).await?;
    let current_tags = tags_for_task(pool, task_id).await?;
    let stages = stages_for_project(pool, &task.project_id).await?;
    let users = list_users(pool).await?;

    let outcome = workflow::approve(
        &task,
        &current_tags,
        &stages,
        &users,
        target_stage_id,
        comment,
        reviewer,
    )?;

    let mut next = TaskWrite::carry_over(&task);
    next.apply_change(outcome.change);
    next.clear_review_markers();
    if let Some(comment_history) = outcome.comment_history {
        next.history.push(comment_history);
    }

    persist_task_write(pool, &task, next, &reviewer.id).await?;
    get_task_details(pool, task_id).await
}

pub async fn request_task_revision(
    pool: &AnyPool,
    task_id: &str,
    target_stage_id: Option<&str>,
    comment: &str,
    reviewer: &UserRecord,
) -> AppResult<TaskDetails> {
    let task = get_task_record_by_id(pool, task_id).await?;
    let current_tags = tags_for_task(pool, task_id).await?;
    let stages = stages_for_project(pool, &task.project_id).await?;
    let users = list_users(pool).await?;

    let outcome = workflow::request_revision(
        &task,
        &current_tags,
        &stages,
        &users,
        target_stage_id,
        comment,
    )?;

    let mut next = TaskWrite::carry_over(&task);
    next.apply_change(outcome.change);
    next.clear_review_markers();
    next.revision_comment = Some(outcome.comment.clone());
    next.completed_at = None;

    let mut tx = pool.begin().await?;

    write_task_row(&mut tx, &task, &next).await?;
    replace_tags(&mut tx, task_id, &next.tags).await?;

    sqlx::query(
        r#"
        INSERT INTO revision_histories (id, task_id, comment, requested_by_id, requested_at, resolved_at)
        VALUES (?, ?, ?, ?, ?, NULL)
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(task_id)
    .bind(&outcome.comment)
    .bind(&reviewer.id)
    .bind(now_timestamp())
    .execute(&mut *tx)
    .await?;

    for draft in &next.history {
        insert_history(
            &mut tx,
            &task.project_id,
            &reviewer.id,
            draft.action,
            "task",
            task_id,
            draft.details.clone(),
        )
        .await?;
    }

    tx.commit().await?;
    get_task_details(pool, task_id).await
}

// ---------------------------------------------------------------------------
// Attachments

pub async fn add_attachment(
    pool: &AnyPool,
    task_id: &str,
    input: NewAttachmentInput,
) -> AppResult<AttachmentRecord> {
    let task = get_task_record_by_id(pool, task_id).await?;

    let name = input.name.trim().to_string();
    if name.is_empty() {
        return Err(AppError::BadRequest(
            "attachment name cannot be empty".to_string(),
        ));
    }
    if input.url.trim().is_empty() {
        return Err(AppError::BadRequest(
            "attachment url cannot be empty".to_string(),
        ));
    }
    validate_attachment_kind(&input.kind)?;

    let attachment_id = Uuid::new_v4().to_string();
    let now = now_timestamp();

    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO attachments (id, task_id, name, url, kind, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&attachment_id)
    .bind(task_id)
    .bind(&name)
    .bind(input.url.trim())
    .bind(&input.kind)
    .bind(&now)
    .execute(&mut *tx)
    .await?;

    insert_history(
        &mut tx,
        &task.project_id,
        &input.actor,
        "UPDATE_TASK",
        "task",
        task_id,
        serde_json::json!({ "attachment": name }),
    )
    .await?;

    tx.commit().await?;

    let attachment = sqlx::query_as::<Any, AttachmentRecord>(
        "SELECT id, task_id, name, url, kind, created_at FROM attachments WHERE id = ?",
    )
    .bind(&attachment_id)
    .fetch_one(pool)
    .await?;
    Ok(attachment)
}

pub async fn delete_attachment(
    pool: &AnyPool,
    task_id: &str,
    attachment_id: &str,
) -> AppResult<()> {
    get_task_record_by_id(pool, task_id).await?;

    let result = sqlx::query("DELETE FROM attachments WHERE id = ? AND task_id = ?")
        .bind(attachment_id)
        .bind(task_id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::NotFound(format!(
            "attachment '{attachment_id}' not found on task '{task_id}'"
        )));
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// History log

pub async fn list_history(
    pool: &AnyPool,
    project_id: &str,
    limit: i64,
    offset: i64,
) -> AppResult<Vec<HistoryEntryRecord>> {
    get_project(pool, project_id).await?;

    let entries = sqlx::query_as::<Any, HistoryEntryRecord>(
        r#"
        SELECT id, timestamp, user_id, action, entity_id, entity_type, project_id, details, created_at
        FROM history_entries
        WHERE project_id = ?
        ORDER BY created_at ASC, id ASC
        LIMIT ? OFFSET ?
        "#,
    )
    .bind(project_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;
    Ok(entries)
}

// ---------------------------------------------------------------------------
// Internals

/// The full set of task columns a mutation writes, plus the history to emit.
struct TaskWrite {
    title: String,
    description: String,
    due_date: Option<String>,
    start_date: Option<String>,
    priority: String,
    user_status: String,
    project_stage_id: Option<String>,
    assignee_id: Option<String>,
    tags: Vec<String>,
    is_in_specific_stage: i64,
    revision_comment: Option<String>,
    previous_stage_id: Option<String>,
    original_assignee_id: Option<String>,
    completed_at: Option<String>,
    history: Vec<workflow::HistoryDraft>,
}

impl TaskWrite {
    fn carry_over(task: &TaskRecord) -> Self {
        Self {
            title: task.title.clone(),
            description: task.description.clone(),
            due_date: task.due_date.clone(),
            start_date: task.start_date.clone(),
            priority: task.priority.clone(),
            user_status: task.user_status.clone(),
            project_stage_id: task.project_stage_id.clone(),
            assignee_id: task.assignee_id.clone(),
            tags: Vec::new(),
            is_in_specific_stage: task.is_in_specific_stage,
            revision_comment: task.revision_comment.clone(),
            previous_stage_id: task.previous_stage_id.clone(),
            original_assignee_id: task.original_assignee_id.clone(),
            completed_at: task.completed_at.clone(),
            history: Vec::new(),
        }
    }

    fn apply_change(&mut self, change: StageChangeOutcome) {
        self.project_stage_id = Some(change.project_stage_id);
        self.assignee_id = change.assignee_id;
        self.user_status = change.user_status.as_str().to_string();
        self.tags = change.tags;
        self.history.extend(change.history);
    }

    fn clear_review_markers(&mut self) {
        self.is_in_specific_stage = 0;
        self.previous_stage_id = None;
        self.original_assignee_id = None;
        self.revision_comment = None;
    }
}

async fn persist_task_write(
    pool: &AnyPool,
    task: &TaskRecord,
    write: TaskWrite,
    actor: &str,
) -> AppResult<()> {
    let mut write = write;

    // completed_at and open revision entries both key off the final status:
    // stamped/resolved on the transition into complete, completed_at cleared
    // whenever the task leaves it.
    let entering_complete = write.user_status == UserStatus::Complete.as_str()
        && task.user_status != UserStatus::Complete.as_str();
    if entering_complete {
        write.completed_at = Some(now_timestamp());
    } else if write.user_status != UserStatus::Complete.as_str() {
        write.completed_at = None;
    }

    let mut tx = pool.begin().await?;

    write_task_row(&mut tx, task, &write).await?;
    replace_tags(&mut tx, &task.id, &write.tags).await?;

    if entering_complete {
        sqlx::query(
            "UPDATE revision_histories SET resolved_at = ? WHERE task_id = ? AND resolved_at IS NULL",
        )
        .bind(now_timestamp())
        .bind(&task.id)
        .execute(&mut *tx)
        .await?;
    }

    for draft in &write.history {
        insert_history(
            &mut tx,
            &task.project_id,
            actor,
            draft.action,
            "task",
            &task.id,
            draft.details.clone(),
        )
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

async fn write_task_row(
    tx: &mut sqlx::Transaction<'_, Any>,
    task: &TaskRecord,
    write: &TaskWrite,
) -> AppResult<()> {
    sqlx::query(
        r#"
        UPDATE tasks
        SET title = ?, description = ?, due_date = ?, start_date = ?, priority = ?,
            user_status = ?, project_stage_id = ?, assignee_id = ?,
            is_in_specific_stage = ?, revision_comment = ?, previous_stage_id = ?,
            original_assignee_id = ?, completed_at = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&write.title)
    .bind(&write.description)
    .bind(&write.due_date)
    .bind(&write.start_date)
    .bind(&write.priority)
    .bind(&write.user_status)
    .bind(&write.project_stage_id)
    .bind(&write.assignee_id)
    .bind(write.is_in_specific_stage)
    .bind(&write.revision_comment)
    .bind(&write.previous_stage_id)
    .bind(&write.original_assignee_id)
    .bind(&write.completed_at)
    .bind(now_timestamp())
    .bind(&task.id)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

async fn task_details_for(pool: &AnyPool, task: TaskRecord) -> AppResult<TaskDetails> {
    let project_name: String = sqlx::query_scalar("SELECT name FROM projects WHERE id = ?")
        .bind(&task.project_id)
        .fetch_optional(pool)
        .await?
        .unwrap_or_default();

    let assignee_name = user_name_by_id(pool, task.assignee_id.as_deref()).await?;
    let original_assignee_name =
        user_name_by_id(pool, task.original_assignee_id.as_deref()).await?;

    let tags = tags_for_task(pool, &task.id).await?;

    let attachments = sqlx::query_as::<Any, AttachmentRecord>(
        r#"
        SELECT id, task_id, name, url, kind, created_at
        FROM attachments
        WHERE task_id = ?
        ORDER BY created_at ASC
        "#,
    )
    .bind(&task.id)
    .fetch_all(pool)
    .await?;

    let revision_history = sqlx::query_as::<Any, RevisionEntryRecord>(
        r#"
        SELECT id, task_id, comment, requested_by_id, requested_at, resolved_at
        FROM revision_histories
        WHERE task_id = ?
        ORDER BY requested_at ASC, id ASC
        "#,
    )
    .bind(&task.id)
    .fetch_all(pool)
    .await?;

    Ok(TaskDetails {
        task,
        project_name,
        assignee_name,
        original_assignee_name,
        tags,
        attachments,
        revision_history,
    })
}

async fn user_name_by_id(pool: &AnyPool, user_id: Option<&str>) -> AppResult<Option<String>> {
    let Some(user_id) = user_id else {
        return Ok(None);
    };

    let name: Option<String> = sqlx::query_scalar("SELECT name FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(pool)
        .await?;
    Ok(name)
}

fn name_of(users: &[UserRecord], user_id: Option<&str>) -> String {
    user_id
        .and_then(|id| users.iter().find(|user| user.id == id))
        .map(|user| user.name.clone())
        .unwrap_or_default()
}

async fn get_task_record_by_id(pool: &AnyPool, task_id: &str) -> AppResult<TaskRecord> {
    let task = sqlx::query_as::<Any, TaskRecord>(
        r#"
        SELECT
            id, title, description, project_id, assignee_id, due_date, start_date,
            user_status, project_stage_id, priority, is_in_specific_stage,
            revision_comment, previous_stage_id, original_assignee_id, completed_at,
            created_at, updated_at
        FROM tasks
        WHERE id = ?
        "#,
    )
    .bind(task_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| AppError::NotFound(format!("task '{task_id}' not found")))?;
    Ok(task)
}

async fn tags_for_task(pool: &AnyPool, task_id: &str) -> AppResult<Vec<String>> {
    let tags: Vec<String> =
        sqlx::query_scalar("SELECT tag FROM task_tags WHERE task_id = ? ORDER BY tag ASC")
            .bind(task_id)
            .fetch_all(pool)
            .await?;
    Ok(tags)
}

async fn replace_tags(
    tx: &mut sqlx::Transaction<'_, Any>,
    task_id: &str,
    tags: &[String],
) -> AppResult<()> {
    sqlx::query("DELETE FROM task_tags WHERE task_id = ?")
        .bind(task_id)
        .execute(&mut **tx)
        .await?;

    for tag in tags {
        sqlx::query("INSERT INTO task_tags (task_id, tag) VALUES (?, ?)")
            .bind(task_id)
            .bind(tag)
            .execute(&mut **tx)
            .await?;
    }

    Ok(())
}

async fn insert_history(
    tx: &mut sqlx::Transaction<'_, Any>,
    project_id: &str,
    user_id: &str,
    action: &str,
    entity_type: &str,
    entity_id: &str,
    details: Value,
) -> AppResult<()> {
    let now = history_timestamp();

    sqlx::query(
        r#"
        INSERT INTO history_entries (id, timestamp, user_id, action, entity_id, entity_type, project_id, details, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(&now)
    .bind(user_id)
    .bind(action)
    .bind(entity_id)
    .bind(entity_type)
    .bind(project_id)
    .bind(details.to_string())
    .bind(&now)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Strictly increasing microsecond timestamps, so `ORDER BY created_at`
/// reproduces insertion order even when two history entries land in the
/// same microsecond.
fn history_timestamp() -> String {
    static LAST_MICROS: AtomicI64 = AtomicI64::new(0);

    let now = Utc::now().timestamp_micros();
    let mut last = LAST_MICROS.load(Ordering::Relaxed);
    let stamp = loop {
        let candidate = now.max(last + 1);
        match LAST_MICROS.compare_exchange_weak(
            last,
            candidate,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break candidate,
            Err(actual) => last = actual,
        }
    };

    DateTime::from_timestamp_micros(stamp)
        .unwrap_or_else(Utc::now)
        .to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn validate_priority(value: &str) -> AppResult<()> {
    match value {
        "low" | "medium" | "high" => Ok(()),
        _ => Err(AppError::BadRequest(format!(
            "invalid task priority '{value}'"
        ))),
    }
}

fn validate_stage_type(value: &str) -> AppResult<()> {
    match value {
        "user" | "project" => Ok(()),
        _ => Err(AppError::BadRequest(format!(
            "invalid stage type '{value}'"
        ))),
    }
}

fn validate_attachment_kind(value: &str) -> AppResult<()> {
    match value {
        "file" | "link" => Ok(()),
        _ => Err(AppError::BadRequest(format!(
            "invalid attachment kind '{value}'"
        ))),
    }
}

fn normalized_tags(tags: Vec<String>) -> Vec<String> {
    let mut seen = Vec::new();
    for tag in tags {
        let trimmed = tag.trim();
        if trimmed.is_empty() {
            continue;
        }
        if !seen.iter().any(|existing: &String| existing == trimmed) {
            seen.push(trimmed.to_string());
        }
    }
    seen
}

fn encode_string_list(values: &[String]) -> AppResult<String> {
    serde_json::to_string(values).map_err(|error| {
        tracing::error!(error = ?error, "failed to serialize string list");
        AppError::Internal
    })
}

pub fn decode_string_list(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use sqlx::AnyPool;
    use tempfile::tempdir;

    use crate::config::Config;
    use crate::db;
    use crate::db::models::UserRecord;
    use crate::db::queries::{self, TaskFilters};
    use crate::error::AppError;
    use crate::workflow::{COMPLETED_TAG, REDO_TAG};

    async fn setup_db(db_name: &str) -> (tempfile::TempDir, AnyPool) {
        let temp_dir = tempdir().expect("tempdir should be created");
        let db_path = temp_dir.path().join(format!("{db_name}.db"));

        let config = Config {
            port: 7500,
            db_url: format!("sqlite://{}?mode=rwc", db_path.display()),
            log_level: "info".to_string(),
            max_request_body_bytes: 2 * 1024 * 1024,
        };

        let pool = db::connect_and_migrate(&config)
            .await
            .expect("database should initialize");

        (temp_dir, pool)
    }

    async fn seed_user(pool: &AnyPool, name: &str, role: &str) -> UserRecord {
        queries::create_user(
            pool,
            queries::NewUserInput {
                name: name.to_string(),
                email: format!("{}@example.com", name.to_lowercase()),
                role: role.to_string(),
                department_id: None,
            },
        )
        .await
        .expect("user should be created")
    }

    struct Fixture {
        project_id: String,
        planning_id: String,
        design_id: String,
        review_id: String,
        dev_id: String,
        dana: UserRecord,
        devon: UserRecord,
        lead: UserRecord,
    }

    /// Planning -> Design -> Review (approves into Development) -> Development.
    async fn seed_website_redesign(pool: &AnyPool) -> Fixture {
        let dana = seed_user(pool, "Dana", "user").await;
        let devon = seed_user(pool, "Devon", "user").await;
        let lead = seed_user(pool, "Lena", "team-lead").await;

        let project = queries::create_project(
            pool,
            queries::NewProjectInput {
                name: "Website Redesign".to_string(),
                description: String::new(),
                department_id: None,
                emails: Vec::new(),
                phone_numbers: Vec::new(),
                actor: lead.id.clone(),
            },
        )
        .await
        .expect("project should be created");

        let mut stage_ids = Vec::new();
        for title in ["Planning", "Design", "Review", "Development"] {
            let stage = queries::create_stage(
                pool,
                queries::NewStageInput {
                    project_id: project.id.clone(),
                    title: title.to_string(),
                    color: String::new(),
                    stage_type: "project".to_string(),
                    main_responsible_id: match title {
                        "Design" => Some(dana.id.clone()),
                        "Development" => Some(devon.id.clone()),
                        _ => None,
                    },
                    backup_responsible_id1: None,
                    backup_responsible_id2: None,
                    is_review_stage: false,
                    linked_review_stage_id: None,
                    approved_target_stage_id: None,
                    actor: lead.id.clone(),
                },
            )
            .await
            .expect("stage should be created");
            stage_ids.push(stage.id);
        }

        let review_id = stage_ids[2].clone();
        let dev_id = stage_ids[3].clone();
        queries::update_stage(
            pool,
            &review_id,
            queries::UpdateStageInput {
                is_review_stage: Some(true),
                approved_target_stage_id: Some(Some(dev_id.clone())),
                actor: lead.id.clone(),
                ..Default::default()
            },
        )
        .await
        .expect("review stage should be configured");

        Fixture {
            project_id: project.id,
            planning_id: stage_ids[0].clone(),
            design_id: stage_ids[1].clone(),
            review_id,
            dev_id,
            dana,
            devon,
            lead,
        }
    }

    async fn seed_task(pool: &AnyPool, fixture: &Fixture, stage_id: &str) -> String {
        let details = queries::create_task(
            pool,
            queries::NewTaskInput {
                title: "Landing page".to_string(),
                description: String::new(),
                project_id: fixture.project_id.clone(),
                assignee_id: Some(fixture.dana.id.clone()),
                due_date: None,
                start_date: None,
                user_status: "pending".to_string(),
                project_stage_id: Some(stage_id.to_string()),
                priority: "medium".to_string(),
                tags: Vec::new(),
                actor: fixture.lead.id.clone(),
            },
        )
        .await
        .expect("task should be created");
        details.task.id
    }

    #[tokio::test]
    async fn project_names_are_unique_case_insensitively() {
        let (_temp_dir, pool) = setup_db("projects").await;
        let lead = seed_user(&pool, "Lena", "team-lead").await;

        let input = |name: &str| queries::NewProjectInput {
            name: name.to_string(),
            description: String::new(),
            department_id: None,
            emails: Vec::new(),
            phone_numbers: Vec::new(),
            actor: lead.id.clone(),
        };

        queries::create_project(&pool, input("Website Redesign"))
            .await
            .expect("first project should be created");

        let duplicate = queries::create_project(&pool, input("website redesign")).await;
        assert!(matches!(duplicate, Err(AppError::Conflict(_))));
    }

    #[tokio::test]
    async fn stage_positions_stay_contiguous_after_delete() {
        let (_temp_dir, pool) = setup_db("stages").await;
        let fixture = seed_website_redesign(&pool).await;

        queries::delete_stage(&pool, &fixture.design_id, &fixture.lead.id)
            .await
            .expect("stage should be deleted");

        let stages = queries::list_stages(&pool, &fixture.project_id)
            .await
            .expect("stages should list");
        let positions: Vec<i64> = stages.iter().map(|stage| stage.position).collect();
        assert_eq!(positions, [0, 1, 2]);
    }

    #[tokio::test]
    async fn duplicate_stage_title_is_rejected() {
        let (_temp_dir, pool) = setup_db("stage-titles").await;
        let fixture = seed_website_redesign(&pool).await;

        let duplicate = queries::create_stage(
            &pool,
            queries::NewStageInput {
                project_id: fixture.project_id.clone(),
                title: " design ".to_string(),
                color: String::new(),
                stage_type: "project".to_string(),
                main_responsible_id: None,
                backup_responsible_id1: None,
                backup_responsible_id2: None,
                is_review_stage: false,
                linked_review_stage_id: None,
                approved_target_stage_id: None,
                actor: fixture.lead.id.clone(),
            },
        )
        .await;
        assert!(matches!(duplicate, Err(AppError::BadRequest(_))));
    }

    #[tokio::test]
    async fn stage_move_auto_assigns_and_logs_history() {
        let (_temp_dir, pool) = setup_db("moves").await;
        let fixture = seed_website_redesign(&pool).await;
        let task_id = seed_task(&pool, &fixture, &fixture.planning_id).await;

        let before = queries::list_history(&pool, &fixture.project_id, 100, 0)
            .await
            .expect("history should list")
            .len();

        let details = queries::update_task(
            &pool,
            &task_id,
            queries::UpdateTaskInput {
                project_stage_id: Some(fixture.design_id.clone()),
                actor: fixture.lead.id.clone(),
                ..Default::default()
            },
        )
        .await
        .expect("move should succeed");

        assert_eq!(
            details.task.project_stage_id.as_deref(),
            Some(fixture.design_id.as_str())
        );
        assert_eq!(details.task.assignee_id.as_deref(), Some(fixture.dana.id.as_str()));
        assert_eq!(details.task.user_status, "pending");

        let history = queries::list_history(&pool, &fixture.project_id, 100, 0)
            .await
            .expect("history should list");
        // Assignee did not change (already Dana), so exactly one new entry.
        assert_eq!(history.len(), before + 1);
        assert_eq!(history.last().unwrap().action, "UPDATE_TASK_STATUS");
    }

    #[tokio::test]
    async fn completing_in_design_hands_off_to_review() {
        let (_temp_dir, pool) = setup_db("handoff").await;
        let fixture = seed_website_redesign(&pool).await;
        let task_id = seed_task(&pool, &fixture, &fixture.design_id).await;

        let details = queries::update_task(
            &pool,
            &task_id,
            queries::UpdateTaskInput {
                user_status: Some("complete".to_string()),
                actor: fixture.dana.id.clone(),
                ..Default::default()
            },
        )
        .await
        .expect("completion should succeed");

        assert_eq!(
            details.task.project_stage_id.as_deref(),
            Some(fixture.review_id.as_str())
        );
        assert_eq!(
            details.task.previous_stage_id.as_deref(),
            Some(fixture.design_id.as_str())
        );
        assert_eq!(
            details.task.original_assignee_id.as_deref(),
            Some(fixture.dana.id.as_str())
        );
        assert_eq!(details.task.assignee_id.as_deref(), Some(fixture.dana.id.as_str()));
        assert_eq!(details.task.user_status, "complete");
        assert_eq!(details.task.is_in_specific_stage, 1);
        assert!(details.task.completed_at.is_some());
    }

    #[tokio::test]
    async fn approve_advances_and_clears_review_markers() {
        let (_temp_dir, pool) = setup_db("approve").await;
        let fixture = seed_website_redesign(&pool).await;
        let task_id = seed_task(&pool, &fixture, &fixture.design_id).await;

        queries::update_task(
            &pool,
            &task_id,
            queries::UpdateTaskInput {
                user_status: Some("complete".to_string()),
                actor: fixture.dana.id.clone(),
                ..Default::default()
            },
        )
        .await
        .expect("completion should succeed");

        let details = queries::approve_task(&pool, &task_id, None, Some("ship it"), &fixture.lead)
            .await
            .expect("approval should succeed");

        assert_eq!(
            details.task.project_stage_id.as_deref(),
            Some(fixture.dev_id.as_str())
        );
        assert_eq!(details.task.is_in_specific_stage, 0);
        assert!(details.task.previous_stage_id.is_none());
        assert!(details.task.original_assignee_id.is_none());
        assert!(details.task.revision_comment.is_none());
        // Development is the last stage.
        assert!(details.tags.iter().any(|tag| tag == COMPLETED_TAG));
        // Auto-assigned to Development's main responsible.
        assert_eq!(
            details.task.assignee_id.as_deref(),
            Some(fixture.devon.id.as_str())
        );
        // Approvals never create revision entries.
        assert!(details.revision_history.is_empty());
    }

    #[tokio::test]
    async fn revision_round_trip() {
        let (_temp_dir, pool) = setup_db("revision").await;
        let fixture = seed_website_redesign(&pool).await;
        let task_id = seed_task(&pool, &fixture, &fixture.design_id).await;

        queries::update_task(
            &pool,
            &task_id,
            queries::UpdateTaskInput {
                user_status: Some("complete".to_string()),
                actor: fixture.dana.id.clone(),
                ..Default::default()
            },
        )
        .await
        .expect("completion should succeed");

        let details = queries::request_task_revision(
            &pool,
            &task_id,
            None,
            "redo the header",
            &fixture.lead,
        )
        .await
        .expect("revision should succeed");

        assert_eq!(
            details.task.project_stage_id.as_deref(),
            Some(fixture.design_id.as_str())
        );
        assert_eq!(details.task.assignee_id.as_deref(), Some(fixture.dana.id.as_str()));
        assert_eq!(details.task.user_status, "pending");
        assert_eq!(
            details.task.revision_comment.as_deref(),
            Some("redo the header")
        );
        assert!(details.task.previous_stage_id.is_none());
        assert!(details.task.original_assignee_id.is_none());
        assert!(details.tags.iter().any(|tag| tag == REDO_TAG));
        assert_eq!(details.revision_history.len(), 1);
        assert_eq!(details.revision_history[0].comment, "redo the header");
        assert_eq!(details.revision_history[0].requested_by_id, fixture.lead.id);
        assert!(details.revision_history[0].resolved_at.is_none());

        let blank =
            queries::request_task_revision(&pool, &task_id, None, "  ", &fixture.lead).await;
        assert!(matches!(blank, Err(AppError::BadRequest(_))));
    }

    #[tokio::test]
    async fn completing_a_revised_task_resolves_revision_entries() {
        let (_temp_dir, pool) = setup_db("resolve").await;
        let fixture = seed_website_redesign(&pool).await;
        let task_id = seed_task(&pool, &fixture, &fixture.design_id).await;

        queries::update_task(
            &pool,
            &task_id,
            queries::UpdateTaskInput {
                user_status: Some("complete".to_string()),
                actor: fixture.dana.id.clone(),
                ..Default::default()
            },
        )
        .await
        .expect("completion should succeed");

        queries::request_task_revision(&pool, &task_id, None, "fix spacing", &fixture.lead)
            .await
            .expect("revision should succeed");

        let details = queries::update_task(
            &pool,
            &task_id,
            queries::UpdateTaskInput {
                user_status: Some("complete".to_string()),
                actor: fixture.dana.id.clone(),
                ..Default::default()
            },
        )
        .await
        .expect("second completion should succeed");

        assert_eq!(details.revision_history.len(), 1);
        assert!(details.revision_history[0].resolved_at.is_some());
    }

    #[tokio::test]
    async fn stage_move_that_also_completes_resolves_revision_entries() {
        let (_temp_dir, pool) = setup_db("resolve-with-move").await;
        let fixture = seed_website_redesign(&pool).await;
        let task_id = seed_task(&pool, &fixture, &fixture.design_id).await;

        queries::update_task(
            &pool,
            &task_id,
            queries::UpdateTaskInput {
                user_status: Some("complete".to_string()),
                actor: fixture.dana.id.clone(),
                ..Default::default()
            },
        )
        .await
        .expect("completion should succeed");

        queries::request_task_revision(&pool, &task_id, None, "fix spacing", &fixture.lead)
            .await
            .expect("revision should succeed");

        // One PUT carrying both a stage move and the completion.
        let details = queries::update_task(
            &pool,
            &task_id,
            queries::UpdateTaskInput {
                project_stage_id: Some(fixture.dev_id.clone()),
                user_status: Some("complete".to_string()),
                actor: fixture.dana.id.clone(),
                ..Default::default()
            },
        )
        .await
        .expect("combined update should succeed");

        assert_eq!(details.task.user_status, "complete");
        assert!(details.task.completed_at.is_some());
        assert_eq!(details.revision_history.len(), 1);
        assert!(details.revision_history[0].resolved_at.is_some());
    }

    #[tokio::test]
    async fn task_filters_narrow_by_status_and_assignee() {
        let (_temp_dir, pool) = setup_db("filters").await;
        let fixture = seed_website_redesign(&pool).await;
        seed_task(&pool, &fixture, &fixture.planning_id).await;

        let mine = queries::list_tasks(
            &pool,
            TaskFilters {
                project_id: Some(fixture.project_id.clone()),
                assignee_id: Some(fixture.dana.id.clone()),
                user_status: Some("pending".to_string()),
            },
            50,
            0,
        )
        .await
        .expect("tasks should list");
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].project_name, "Website Redesign");
        assert_eq!(mine[0].assignee_name.as_deref(), Some("Dana"));

        let none = queries::list_tasks(
            &pool,
            TaskFilters {
                project_id: Some(fixture.project_id.clone()),
                assignee_id: Some(fixture.devon.id.clone()),
                user_status: None,
            },
            50,
            0,
        )
        .await
        .expect("tasks should list");
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn deleting_a_project_cascades_to_tasks_and_stages() {
        let (_temp_dir, pool) = setup_db("cascade").await;
        let fixture = seed_website_redesign(&pool).await;
        let task_id = seed_task(&pool, &fixture, &fixture.planning_id).await;

        queries::delete_project(&pool, &fixture.project_id)
            .await
            .expect("project should be deleted");

        let task = queries::get_task_details(&pool, &task_id).await;
        assert!(matches!(task, Err(AppError::NotFound(_))));
        let stage = queries::get_stage(&pool, &fixture.design_id).await;
        assert!(matches!(stage, Err(AppError::NotFound(_))));
    }

    #[test]
    fn history_timestamps_strictly_increase() {
        let mut previous = super::history_timestamp();
        for _ in 0..1000 {
            let next = super::history_timestamp();
            assert!(next > previous, "{next} should sort after {previous}");
            previous = next;
        }
    }
}
