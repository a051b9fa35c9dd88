//! Error types for sync runs and the operations around them.
//!
//! Errors are classified by recoverability:
//! - Retryable: CRM transport failures, timeouts, throttling, upstream 5xx
//! - NonRetryable: configuration, bad requests, malformed responses, storage
//! - Operational: cancellation and overlapping runs

use thiserror::Error;

use crate::crm::client::CrmError;
use crate::db::DbError;

/// Errors surfaced by sync, connection-test and enrichment operations.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Failed to fetch contact page {page} (cursor {cursor}): {source}")]
    Page {
        page: usize,
        cursor: String,
        #[source]
        source: CrmError,
    },

    #[error("CRM list {list_id}: {source}")]
    List {
        list_id: u64,
        #[source]
        source: CrmError,
    },

    #[error(transparent)]
    Crm(#[from] CrmError),

    #[error("Member {member_id}: {source}")]
    Member {
        member_id: String,
        #[source]
        source: DbError,
    },

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Database unavailable")]
    DatabaseUnavailable,

    #[error("Database task failed: {0}")]
    DatabaseTask(String),

    #[error("Sync run cancelled")]
    Cancelled,

    #[error("A sync run is already in progress ({0})")]
    AlreadyRunning(String),
}

impl SyncError {
    /// The CRM error at the root of this failure, if there is one.
    fn crm_source(&self) -> Option<&CrmError> {
        match self {
            SyncError::Page { source, .. } | SyncError::List { source, .. } => Some(source),
            SyncError::Crm(e) => Some(e),
            _ => None,
        }
    }

    /// Returns true if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::AlreadyRunning(_) | SyncError::Cancelled => true,
            _ => self.crm_source().is_some_and(CrmError::is_retryable),
        }
    }

    /// Returns true if an upstream call ran out of time.
    pub fn is_timeout(&self) -> bool {
        matches!(self.crm_source(), Some(CrmError::Timeout(_)))
    }

    /// Get a user-friendly recovery suggestion
    pub fn recovery_suggestion(&self) -> &'static str {
        match self {
            SyncError::Configuration(_) => {
                "Set the CRM API key and list id in ~/.memberdir/config.json or the environment."
            }
            SyncError::InvalidRequest(_) => "Check the request parameters and try again.",
            SyncError::Page { .. } | SyncError::List { .. } | SyncError::Crm(_) => {
                if self.is_retryable() {
                    "The CRM did not respond correctly. Try again in a few minutes."
                } else {
                    "Check the CRM API key, list id and base URL."
                }
            }
            SyncError::Member { .. }
            | SyncError::Database(_)
            | SyncError::DatabaseUnavailable
            | SyncError::DatabaseTask(_) => "Check the member database file and disk space.",
            SyncError::Cancelled => "The run was cancelled. Start it again when ready.",
            SyncError::AlreadyRunning(_) => "Wait for the current run to finish.",
        }
    }
}

/// Serializable failure payload returned at the operation boundary.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub success: bool,
    pub error: String,
    pub error_type: ErrorType,
    pub can_retry: bool,
    pub recovery_suggestion: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorType {
    Configuration,
    Request,
    Upstream,
    Storage,
    Cancelled,
    Conflict,
}

impl SyncError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            SyncError::Configuration(_) => ErrorType::Configuration,
            SyncError::InvalidRequest(_) => ErrorType::Request,
            SyncError::Page { .. } | SyncError::List { .. } | SyncError::Crm(_) => {
                ErrorType::Upstream
            }
            SyncError::Member { .. }
            | SyncError::Database(_)
            | SyncError::DatabaseUnavailable
            | SyncError::DatabaseTask(_) => ErrorType::Storage,
            SyncError::Cancelled => ErrorType::Cancelled,
            SyncError::AlreadyRunning(_) => ErrorType::Conflict,
        }
    }
}

impl From<&SyncError> for ErrorPayload {
    fn from(err: &SyncError) -> Self {
        ErrorPayload {
            success: false,
            error: err.to_string(),
            error_type: err.error_type(),
            can_retry: err.is_retryable(),
            recovery_suggestion: err.recovery_suggestion().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_error_keeps_context() {
        let err = SyncError::Page {
            page: 3,
            cursor: "300".to_string(),
            source: CrmError::Status {
                status: 502,
                body: "bad gateway".to_string(),
            },
        };
        let msg = err.to_string();
        assert!(msg.contains("page 3"));
        assert!(msg.contains("cursor 300"));
        assert!(err.is_retryable());
        assert_eq!(err.error_type(), ErrorType::Upstream);
    }

    #[test]
    fn test_auth_failure_not_retryable() {
        let err = SyncError::List {
            list_id: 9,
            source: CrmError::Status {
                status: 401,
                body: String::new(),
            },
        };
        assert!(!err.is_retryable());
        assert!(err.recovery_suggestion().contains("API key"));
    }

    #[test]
    fn test_configuration_error_payload() {
        let err = SyncError::Configuration("No CRM API key configured".to_string());
        let payload = ErrorPayload::from(&err);
        assert!(!payload.success);
        assert_eq!(payload.error, "Configuration error: No CRM API key configured");
        assert_eq!(payload.error_type, ErrorType::Configuration);
        assert!(!payload.can_retry);
    }

    #[test]
    fn test_timeout_detected_through_page_context() {
        let err = SyncError::Page {
            page: 1,
            cursor: "start".to_string(),
            source: CrmError::Timeout(30),
        };
        assert!(err.is_timeout());
    }
}
