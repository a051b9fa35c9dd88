//! Shared type definitions for the database layer.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ProfileField;

/// Errors specific to database operations.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Schema migration failed: {0}")]
    Migration(String),
}

/// A row from the `members` table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalProfile {
    pub id: String,
    pub firstname: String,
    pub lastname: String,
    pub email: String,
    pub company: String,
    pub jobtitle: String,
    pub phone: String,
    pub industry: String,
    pub state: String,
    pub city: String,
    pub bio: String,
    pub linkedin: String,
    pub headshot: String,
    pub membership: String,
    /// Locally held annotation; the CRM never reports it.
    pub email_domain: Option<String>,
    pub active: bool,
}

impl LocalProfile {
    /// An active profile with every field empty.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            active: true,
            ..Self::default()
        }
    }

    pub fn field(&self, field: ProfileField) -> &str {
        match field {
            ProfileField::FirstName => &self.firstname,
            ProfileField::LastName => &self.lastname,
            ProfileField::Email => &self.email,
            ProfileField::Company => &self.company,
            ProfileField::JobTitle => &self.jobtitle,
            ProfileField::Phone => &self.phone,
            ProfileField::Industry => &self.industry,
            ProfileField::State => &self.state,
            ProfileField::City => &self.city,
            ProfileField::Bio => &self.bio,
            ProfileField::LinkedIn => &self.linkedin,
            ProfileField::Headshot => &self.headshot,
            ProfileField::Membership => &self.membership,
        }
    }

    pub fn field_mut(&mut self, field: ProfileField) -> &mut String {
        match field {
            ProfileField::FirstName => &mut self.firstname,
            ProfileField::LastName => &mut self.lastname,
            ProfileField::Email => &mut self.email,
            ProfileField::Company => &mut self.company,
            ProfileField::JobTitle => &mut self.jobtitle,
            ProfileField::Phone => &mut self.phone,
            ProfileField::Industry => &mut self.industry,
            ProfileField::State => &mut self.state,
            ProfileField::City => &mut self.city,
            ProfileField::Bio => &mut self.bio,
            ProfileField::LinkedIn => &mut self.linkedin,
            ProfileField::Headshot => &mut self.headshot,
            ProfileField::Membership => &mut self.membership,
        }
    }
}

/// Partial update of a member row. Unset parts are left untouched.
#[derive(Debug, Clone, Default)]
pub struct ProfilePatch {
    pub fields: Vec<(ProfileField, String)>,
    pub email_domain: Option<Option<String>>,
    pub active: Option<bool>,
}

impl ProfilePatch {
    /// Flip `active` off and nothing else.
    pub fn deactivate() -> Self {
        Self {
            active: Some(false),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.email_domain.is_none() && self.active.is_none()
    }
}

/// Lifecycle of a row in `sync_runs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncRunStatus {
    Running,
    Completed,
    CompletedWithFailures,
    Cancelled,
    Failed,
}

impl SyncRunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncRunStatus::Running => "running",
            SyncRunStatus::Completed => "completed",
            SyncRunStatus::CompletedWithFailures => "completed_with_failures",
            SyncRunStatus::Cancelled => "cancelled",
            SyncRunStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(SyncRunStatus::Running),
            "completed" => Some(SyncRunStatus::Completed),
            "completed_with_failures" => Some(SyncRunStatus::CompletedWithFailures),
            "cancelled" => Some(SyncRunStatus::Cancelled),
            "failed" => Some(SyncRunStatus::Failed),
            _ => None,
        }
    }
}

/// Per-run counters stored alongside a finished run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRunCounts {
    pub updated: u32,
    pub created: u32,
    pub deactivated: u32,
    pub skipped: u32,
    pub failed: u32,
}

/// A row from the `sync_runs` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbSyncRun {
    pub id: String,
    pub list_id: i64,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub status: SyncRunStatus,
    pub requested: u32,
    pub counts: SyncRunCounts,
    pub error: Option<String>,
}

/// The stored field mapping for one list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbFieldMapping {
    pub list_id: i64,
    pub list_name: String,
    pub mapped_at: String,
    pub properties: BTreeMap<String, String>,
}
