//! # Validation Module
//!
//! Request validation for the sync service entry points.
//!
//! ## Validation Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: Route layer (external)                                       │
//! │  └── Authentication, request deserialisation                           │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: CalendarSyncService                                          │
//! │  └── THIS MODULE: ids, calendar lists, windows, batch sizes            │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: Database (SQLite)                                            │
//! │  ├── UNIQUE (owner_id, remote_id) among live rows                     │
//! │  └── CHECK (full_sync_required → cursor_token IS NULL)                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use calsync_core::validation::{validate_calendar_ids, validate_owner_id};
//!
//! validate_owner_id("me").unwrap();
//! validate_calendar_ids(&["cal-a".to_string(), "cal-b".to_string()]).unwrap();
//! ```

use std::collections::HashSet;

use crate::error::ValidationError;

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Longest identifier accepted from callers.
pub const MAX_ID_LEN: usize = 512;

// =============================================================================
// Identifier Validators
// =============================================================================

fn validate_id(field: &str, value: &str) -> ValidationResult<()> {
    let value = value.trim();

    if value.is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }

    if value.len() > MAX_ID_LEN {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max: MAX_ID_LEN,
        });
    }

    Ok(())
}

/// Validates an owner (mailbox) identifier.
///
/// ## Example
/// ```rust
/// use calsync_core::validation::validate_owner_id;
///
/// assert!(validate_owner_id("user@example.org").is_ok());
/// assert!(validate_owner_id("  ").is_err());
/// ```
pub fn validate_owner_id(owner_id: &str) -> ValidationResult<()> {
    validate_id("owner_id", owner_id)
}

/// Validates a single calendar identifier.
pub fn validate_calendar_id(calendar_id: &str) -> ValidationResult<()> {
    validate_id("calendar_id", calendar_id)
}

/// Validates the calendar list of a sync request.
///
/// ## Rules
/// - At least one calendar
/// - Every id non-empty and at most [`MAX_ID_LEN`] characters
/// - No calendar listed twice
pub fn validate_calendar_ids(calendar_ids: &[String]) -> ValidationResult<()> {
    if calendar_ids.is_empty() {
        return Err(ValidationError::Required {
            field: "calendar_ids".to_string(),
        });
    }

    let mut seen = HashSet::with_capacity(calendar_ids.len());
    for id in calendar_ids {
        validate_calendar_id(id)?;
        if !seen.insert(id.trim()) {
            return Err(ValidationError::Duplicate {
                field: "calendar_ids".to_string(),
                value: id.clone(),
            });
        }
    }

    Ok(())
}

// =============================================================================
// Numeric Validators
// =============================================================================

/// Validates the size of a bulk-load batch.
pub fn validate_batch_size(len: usize, max: usize) -> ValidationResult<()> {
    if len > max {
        return Err(ValidationError::OutOfRange {
            field: "events".to_string(),
            min: 0,
            max: max as i64,
        });
    }
    Ok(())
}

/// Validates a window length in days.
pub fn validate_window_days(days: i64) -> ValidationResult<()> {
    if !(1..=3650).contains(&days) {
        return Err(ValidationError::OutOfRange {
            field: "window_days".to_string(),
            min: 1,
            max: 3650,
        });
    }
    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================
