use crate::error::{AppError, AppResult};

/// Cross-department visibility grants, keyed by the viewing department's
/// lowercased name. Carries the long-standing rule that the digital teams
/// also work on design projects.
const DEPARTMENT_VISIBILITY: &[(&str, &[&str])] = &[
    ("digital", &["design"]),
    ("digital marketing", &["design"]),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    TeamLead,
    Admin,
}

impl Role {
    pub fn parse(value: &str) -> AppResult<Self> {
        match value {
            "user" => Ok(Self::User),
            "team-lead" => Ok(Self::TeamLead),
            "admin" => Ok(Self::Admin),
            _ => Err(AppError::BadRequest(format!("invalid role '{value}'"))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::TeamLead => "team-lead",
            Self::Admin => "admin",
        }
    }

    /// Project, stage, and user administration is limited to leads and admins.
    pub fn can_administer(self) -> bool {
        matches!(self, Self::Admin | Self::TeamLead)
    }
}

fn department_visible(user_department: &str, project_department: &str) -> bool {
    let user_department = user_department.trim().to_lowercase();
    let project_department = project_department.trim().to_lowercase();

    if user_department == project_department {
        return true;
    }

    DEPARTMENT_VISIBILITY
        .iter()
        .filter(|(viewer, _)| *viewer == user_department)
        .any(|(_, extras)| extras.contains(&project_department.as_str()))
}

/// Single visibility predicate: admins see everything, everyone sees
/// department-less projects, otherwise the viewer's department must match the
/// project's or carry an explicit grant.
pub fn can_access_project(
    role: Role,
    user_department: Option<&str>,
    project_department: Option<&str>,
) -> bool {
    if role == Role::Admin {
        return true;
    }

    let Some(project_department) = project_department else {
        return true;
    };

    match user_department {
        Some(user_department) => department_visible(user_department, project_department),
        None => false,
    }
}
