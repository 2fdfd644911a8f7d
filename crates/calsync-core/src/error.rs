//! # Error Types
//!
//! Domain-specific error types for calsync-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  calsync-core errors (this file)                                       │
//! │  ├── CoreError        - Malformed remote data, domain failures         │
//! │  └── ValidationError  - Caller input validation failures               │
//! │                                                                         │
//! │  calsync-db errors (separate crate)                                    │
//! │  └── DbError          - Database operation failures                    │
//! │                                                                         │
//! │  calsync-engine errors                                                 │
//! │  └── SyncError        - CursorExpired / Transient / FatalAuth / ...    │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → SyncError → route layer           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Core domain errors.
///
/// Raised while interpreting a single remote event. The merge path catches
/// these per event, so one bad record never aborts a page.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A required remote field is missing.
    ///
    /// ## When This Occurs
    /// - Remote item has no `start` or `end`
    /// - Remote item has an empty `id`
    #[error("Remote event {remote_id} is missing required field '{field}'")]
    MissingField { remote_id: String, field: String },

    /// A remote date/time could not be parsed.
    #[error("Invalid date/time '{value}': {reason}")]
    InvalidDateTime { value: String, reason: String },

    /// The remote time zone name is not a known IANA zone.
    #[error("Unknown time zone: {0}")]
    UnknownTimeZone(String),

    /// Event ends before it starts.
    #[error("Remote event {remote_id} ends before it starts")]
    InvertedRange { remote_id: String },

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
///
/// These errors occur when caller input (owner ids, calendar lists, windows,
/// bulk batches) doesn't meet requirements.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Numeric value is out of range.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: i64, max: i64 },

    /// Invalid format (e.g., inverted window).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// Duplicate value in a list that must be unique.
    #[error("{field} '{value}' is listed more than once")]
    Duplicate { field: String, value: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = CoreError::MissingField {
            remote_id: "AAMk-1".to_string(),
            field: "start".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Remote event AAMk-1 is missing required field 'start'"
        );
    }

    #[test]
    fn test_validation_error_messages() {
        let err = ValidationError::Required {
            field: "owner_id".to_string(),
        };
        assert_eq!(err.to_string(), "owner_id is required");

        let err = ValidationError::Duplicate {
            field: "calendar_ids".to_string(),
            value: "cal-1".to_string(),
        };
        assert_eq!(err.to_string(), "calendar_ids 'cal-1' is listed more than once");
    }

    #[test]
    fn test_validation_converts_to_core_error() {
        let validation_err = ValidationError::Required {
            field: "calendar_id".to_string(),
        };
        let core_err: CoreError = validation_err.into();
        assert!(matches!(core_err, CoreError::Validation(_)));
    }
}
