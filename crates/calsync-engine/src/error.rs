//! # Sync Error Types
//!
//! Error types for sync and reconciliation operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │     Remote      │  │     Reconciliation      │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  CursorExpired  │  │  MalformedEvent         │ │
//! │  │  InvalidUrl     │  │  Transient...   │  │  LocationResolution     │ │
//! │  │  ConfigLoad/Save│  │  FatalAuth      │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │    Request      │  │    Database     │  │      Internal           │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidRequest │  │  Database       │  │  Serialization          │ │
//! │  │                 │  │                 │  │  Internal               │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Propagation
//! Per-event and per-page failures are collected into the sync summary.
//! Only `FatalAuth` and request-level errors reach the caller as `Err`.

use calsync_core::{CoreError, ValidationError};
use calsync_db::DbError;
use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

// =============================================================================
// Remote Error
// =============================================================================

/// Failure reported by a [`crate::source::CalendarSource`] for one page.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// The delta token is no longer accepted (HTTP 410).
    #[error("Delta cursor expired")]
    CursorExpired,

    /// Network, rate-limit or server-side failure. A later run may succeed.
    #[error("Transient remote failure (status {status:?}): {message}")]
    Transient { status: Option<u16>, message: String },

    /// Credentials rejected or calendar not accessible.
    #[error("Remote rejected access (status {status}): {message}")]
    FatalAuth { status: u16, message: String },
}

impl RemoteError {
    /// Classifies a non-success HTTP status.
    ///
    /// ## Mapping
    /// - 410 → `CursorExpired`
    /// - 401 / 403 / 404 → `FatalAuth`
    /// - everything else → `Transient`
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = if body.trim().is_empty() {
            format!("HTTP {status}")
        } else {
            body.chars().take(512).collect()
        };

        match status {
            410 => RemoteError::CursorExpired,
            401 | 403 | 404 => RemoteError::FatalAuth { status, message },
            _ => RemoteError::Transient {
                status: Some(status),
                message,
            },
        }
    }

    /// A transient failure without an HTTP status (timeouts, resets).
    pub fn transient(message: impl Into<String>) -> Self {
        RemoteError::Transient {
            status: None,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient { .. })
    }
}

// =============================================================================
// Sync Error
// =============================================================================

/// Sync error type covering all possible sync failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Remote Errors
    // =========================================================================
    /// Delta cursor expired and the one full-sync retry also failed.
    #[error("Delta cursor for calendar {calendar_id} expired")]
    CursorExpired { calendar_id: String },

    /// Network / rate-limit failure. The cursor was not advanced.
    #[error("Remote failure on calendar {calendar_id}: {message}")]
    TransientRemoteFailure { calendar_id: String, message: String },

    /// Authentication or permission failure.
    #[error("Access denied for calendar {calendar_id}: {message}")]
    FatalAuth { calendar_id: String, message: String },

    // =========================================================================
    // Reconciliation Errors
    // =========================================================================
    /// A single remote event could not be interpreted.
    #[error("Malformed remote event {remote_id}: {reason}")]
    MalformedEvent { remote_id: String, reason: String },

    /// Location lookup failed. Callers treat this as "no match".
    #[error("Location resolution failed: {0}")]
    LocationResolution(String),

    // =========================================================================
    // Request Errors
    // =========================================================================
    /// Caller input rejected before any work started.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Invalid remote base URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    /// Failed to serialize or deserialize a payload.
    #[error("Serialization failed: {0}")]
    Serialization(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal engine error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<ValidationError> for SyncError {
    fn from(err: ValidationError) -> Self {
        SyncError::InvalidRequest(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

impl SyncError {
    /// Wraps a per-event domain error with the offending remote id.
    pub fn malformed(remote_id: impl Into<String>, err: CoreError) -> Self {
        SyncError::MalformedEvent {
            remote_id: remote_id.into(),
            reason: err.to_string(),
        }
    }

    /// Lifts a page-level remote error into the calendar's context.
    pub fn from_remote(calendar_id: impl Into<String>, err: RemoteError) -> Self {
        let calendar_id = calendar_id.into();
        match err {
            RemoteError::CursorExpired => SyncError::CursorExpired { calendar_id },
            RemoteError::Transient { message, .. } => {
                SyncError::TransientRemoteFailure { calendar_id, message }
            }
            RemoteError::FatalAuth { message, .. } => SyncError::FatalAuth { calendar_id, message },
        }
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl SyncError {
    /// Returns true if a later run may succeed without intervention.
    ///
    /// ## Retryable Errors
    /// - Expired cursors (next run starts from a full sync)
    /// - Transient remote failures
    /// - Transient database failures (pool exhausted, connection lost)
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::CursorExpired { .. } | SyncError::TransientRemoteFailure { .. } => true,
            SyncError::Database(db) => db.is_transient(),
            _ => false,
        }
    }

    /// Returns true if the error must be surfaced to the caller.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::FatalAuth { .. })
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }

    /// Short machine-readable tag used in sync summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::CursorExpired { .. } => "cursor_expired",
            SyncError::TransientRemoteFailure { .. } => "transient_remote_failure",
            SyncError::FatalAuth { .. } => "fatal_auth",
            SyncError::MalformedEvent { .. } => "malformed_event",
            SyncError::LocationResolution(_) => "location_resolution",
            SyncError::InvalidRequest(_) => "invalid_request",
            SyncError::InvalidConfig(_)
            | SyncError::InvalidUrl(_)
            | SyncError::ConfigLoadFailed(_)
            | SyncError::ConfigSaveFailed(_) => "config",
            SyncError::Database(_) => "database",
            SyncError::Serialization(_) => "serialization",
            SyncError::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(RemoteError::from_status(410, ""), RemoteError::CursorExpired);
        assert!(matches!(
            RemoteError::from_status(401, "token expired"),
            RemoteError::FatalAuth { status: 401, .. }
        ));
        assert!(matches!(
            RemoteError::from_status(404, ""),
            RemoteError::FatalAuth { status: 404, .. }
        ));
        assert!(RemoteError::from_status(429, "slow down").is_transient());
        assert!(RemoteError::from_status(503, "").is_transient());
        assert!(RemoteError::from_status(400, "bad filter").is_transient());
    }

    #[test]
    fn test_from_remote_keeps_calendar() {
        let err = SyncError::from_remote("cal-1", RemoteError::transient("timed out"));
        assert!(err.is_retryable());
        assert!(err.to_string().contains("cal-1"));

        let err = SyncError::from_remote(
            "cal-2",
            RemoteError::FatalAuth {
                status: 403,
                message: "forbidden".into(),
            },
        );
        assert!(err.is_fatal());
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), "fatal_auth");
    }

    #[test]
    fn test_config_errors() {
        assert!(SyncError::InvalidConfig("page_size".into()).is_config_error());
        assert!(!SyncError::Internal("x".into()).is_config_error());
    }

    #[test]
    fn test_validation_becomes_invalid_request() {
        let err: SyncError = ValidationError::Required {
            field: "owner_id".into(),
        }
        .into();
        assert!(matches!(err, SyncError::InvalidRequest(ref m) if m == "owner_id is required"));
    }
}
