use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ===== Identity Models =====

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub is_active: bool,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Role {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
}

// ===== Application Models =====

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "application_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ApplicationStatus {
    #[default]
    Active,
    Inactive,
    Deprecated,
}

impl ApplicationStatus {
    /// Spellings accepted in import files, in template order.
    pub const LABELS: &'static [&'static str] = &["Active", "Inactive", "Deprecated"];

    pub fn label(&self) -> &'static str {
        match self {
            ApplicationStatus::Active => "Active",
            ApplicationStatus::Inactive => "Inactive",
            ApplicationStatus::Deprecated => "Deprecated",
        }
    }
}

impl fmt::Display for ApplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for ApplicationStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(ApplicationStatus::Active),
            "inactive" => Ok(ApplicationStatus::Inactive),
            "deprecated" => Ok(ApplicationStatus::Deprecated),
            other => Err(format!("unknown application status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Application {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub url: Option<String>,
    pub status: ApplicationStatus,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Grants a user access to an application, optionally under a role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct UserApplication {
    pub id: Uuid,
    pub user_id: Uuid,
    pub application_id: Uuid,
    pub role_id: Option<Uuid>,
    pub expires_at: Option<DateTime<Utc>>,
    pub assigned_by: Uuid,
    pub assigned_at: DateTime<Utc>,
}
