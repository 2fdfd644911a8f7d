//! # Domain Types
//!
//! Core domain types used throughout calsync.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌──────────────────────┐   ┌─────────────────┐  │
//! │  │   SyncCursor    │   │    UnifiedEvent      │   │ LocationEntity  │  │
//! │  │  ─────────────  │   │  ──────────────────  │   │  ─────────────  │  │
//! │  │  owner_id       │   │  internal_id (UUID)  │   │  name           │  │
//! │  │  calendar_id    │   │  remote_id           │   │  aliases[]      │  │
//! │  │  cursor_token   │   │  global_uid          │   │  location_code  │  │
//! │  │  full_sync_req. │   │  snapshot (remote)   │   │  status         │  │
//! │  └─────────────────┘   │  enrichment (local)  │   │  merged_into    │  │
//! │                        └──────────────────────┘   └─────────────────┘  │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌──────────────────────┐                        │
//! │  │  RemoteEvent    │──►│   RemoteSnapshot     │  verbatim remote copy  │
//! │  │  (delta item)   │   │   (parsed, UTC)      │                        │
//! │  └─────────────────┘   └──────────────────────┘                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Two Identity Schemes
//! Every mirrored event carries:
//! - `internal_id`: UUID v4 minted once, survives every re-sync
//! - `remote_id`: the calendar service's per-mailbox id, may be rebound
//! - `global_uid`: cross-mailbox id, preferred when present

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult, ValidationError};

// =============================================================================
// Sync Mode
// =============================================================================

/// How a calendar is fetched during one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Re-read everything, ignoring any stored cursor.
    Full,
    /// Ask only for what changed since the stored cursor.
    Incremental,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::Full => write!(f, "full"),
            SyncMode::Incremental => write!(f, "incremental"),
        }
    }
}

// =============================================================================
// Sync Cursor
// =============================================================================

/// Persisted delta state for one (owner, calendar) pair.
///
/// ## Invariant
/// `cursor_token` is `None` whenever `full_sync_required` is true. The
/// constructors below are the only way the engine builds cursors, so the
/// invariant holds by construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub owner_id: String,
    pub calendar_id: String,
    pub cursor_token: Option<String>,
    pub full_sync_required: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl SyncCursor {
    /// Cursor for a calendar that has never been synced (or was reset).
    pub fn initial(owner_id: impl Into<String>, calendar_id: impl Into<String>) -> Self {
        SyncCursor {
            owner_id: owner_id.into(),
            calendar_id: calendar_id.into(),
            cursor_token: None,
            full_sync_required: true,
            last_synced_at: None,
        }
    }

    /// Cursor after a page loop completed with a final delta token.
    pub fn advanced(
        owner_id: impl Into<String>,
        calendar_id: impl Into<String>,
        token: impl Into<String>,
        synced_at: DateTime<Utc>,
    ) -> Self {
        SyncCursor {
            owner_id: owner_id.into(),
            calendar_id: calendar_id.into(),
            cursor_token: Some(token.into()),
            full_sync_required: false,
            last_synced_at: Some(synced_at),
        }
    }

    /// Chooses the fetch mode for this cursor.
    ///
    /// Incremental only if a token exists and the caller did not force a
    /// full sync.
    pub fn sync_mode(&self, force_full: bool) -> SyncMode {
        match (&self.cursor_token, self.full_sync_required, force_full) {
            (Some(_), false, false) => SyncMode::Incremental,
            _ => SyncMode::Full,
        }
    }

    /// Returns true if exactly one of {token present, full sync required} holds.
    pub fn is_consistent(&self) -> bool {
        self.cursor_token.is_some() != self.full_sync_required
    }
}

// =============================================================================
// Time Window
// =============================================================================

/// Caller-supplied `[start, end)` window, applied client-side on full syncs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// Creates a window, rejecting empty or inverted ranges.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, ValidationError> {
        if start >= end {
            return Err(ValidationError::InvalidFormat {
                field: "window".to_string(),
                reason: "start must be before end".to_string(),
            });
        }
        Ok(TimeWindow { start, end })
    }

    /// Returns true if `[start, end)` overlaps this window.
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        start < self.end && end > self.start
    }
}

// =============================================================================
// Source Calendars
// =============================================================================

/// How a calendar relates to the logical event observed on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceRole {
    /// The owner's own calendar.
    Primary,
    /// A shared / group / registration calendar.
    Shared,
}

/// One calendar the same logical event was observed on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCalendar {
    pub calendar_id: String,
    pub role: SourceRole,
    /// The item id this calendar last reported for the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
}

impl SourceCalendar {
    pub fn new(calendar_id: impl Into<String>, role: SourceRole) -> Self {
        SourceCalendar {
            calendar_id: calendar_id.into(),
            role,
            remote_id: None,
        }
    }

    pub fn with_remote_id(mut self, remote_id: impl Into<String>) -> Self {
        self.remote_id = Some(remote_id.into());
        self
    }
}

// =============================================================================
// Remote Event (delta item)
// =============================================================================

/// A date/time as the calendar service reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteDateTime {
    pub date_time: String,
    pub time_zone: Option<String>,
}

impl RemoteDateTime {
    /// A UTC date/time (convenience for tests and fixtures).
    pub fn utc(date_time: impl Into<String>) -> Self {
        RemoteDateTime {
            date_time: date_time.into(),
            time_zone: Some("UTC".to_string()),
        }
    }

    /// Converts to UTC.
    ///
    /// ## Accepted Shapes
    /// - RFC 3339 with offset (`2024-03-01T10:00:00Z`) - zone is ignored
    /// - Local wall time (`2024-03-01T10:00:00.0000000`) in `time_zone`
    /// - Bare date (`2024-03-01`) for all-day items, midnight in `time_zone`
    pub fn to_utc(&self) -> CoreResult<DateTime<Utc>> {
        let raw = self.date_time.trim();

        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Ok(dt.with_timezone(&Utc));
        }

        let naive = match NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
            Ok(naive) => naive,
            Err(e) => NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .ok_or_else(|| CoreError::InvalidDateTime {
                    value: raw.to_string(),
                    reason: e.to_string(),
                })?,
        };

        match self.time_zone.as_deref().map(str::trim) {
            None | Some("") | Some("UTC") | Some("Etc/UTC") | Some("tzone://Microsoft/Utc") => {
                Ok(Utc.from_utc_datetime(&naive))
            }
            Some(zone) => {
                let tz = Tz::from_str(zone)
                    .map_err(|_| CoreError::UnknownTimeZone(zone.to_string()))?;
                tz.from_local_datetime(&naive)
                    .earliest()
                    .map(|dt| dt.with_timezone(&Utc))
                    .ok_or_else(|| CoreError::InvalidDateTime {
                        value: raw.to_string(),
                        reason: format!("does not exist in {zone}"),
                    })
            }
        }
    }
}

/// An attendee as reported by the calendar service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteAttendee {
    pub name: Option<String>,
    pub email: String,
    pub response: Option<String>,
}

/// One change record from a delta page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteEvent {
    pub id: String,
    pub global_uid: Option<String>,
    pub subject: Option<String>,
    pub start: Option<RemoteDateTime>,
    pub end: Option<RemoteDateTime>,
    #[serde(default)]
    pub is_all_day: bool,
    pub location: Option<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    pub body: Option<String>,
    pub body_preview: Option<String>,
    #[serde(default)]
    pub attendees: Vec<RemoteAttendee>,
    pub last_modified: Option<DateTime<Utc>>,
    pub change_key: Option<String>,
    pub online_meeting_url: Option<String>,
    /// True when the delta page reports this item as removed.
    #[serde(default)]
    pub removed: bool,
}

impl RemoteEvent {
    /// A tombstone change record.
    pub fn tombstone(id: impl Into<String>) -> Self {
        RemoteEvent {
            id: id.into(),
            removed: true,
            ..Default::default()
        }
    }

    /// Parses start/end into UTC.
    pub fn time_range(&self) -> CoreResult<(DateTime<Utc>, DateTime<Utc>)> {
        let start = self.start.as_ref().ok_or_else(|| self.missing("start"))?.to_utc()?;
        let end = self.end.as_ref().ok_or_else(|| self.missing("end"))?.to_utc()?;
        if end < start {
            return Err(CoreError::InvertedRange {
                remote_id: self.id.clone(),
            });
        }
        Ok((start, end))
    }

    /// Body text used for enrichment extraction (full body preferred).
    pub fn free_text(&self) -> &str {
        self.body
            .as_deref()
            .filter(|b| !b.trim().is_empty())
            .or(self.body_preview.as_deref())
            .unwrap_or("")
    }

    fn missing(&self, field: &str) -> CoreError {
        CoreError::MissingField {
            remote_id: self.id.clone(),
            field: field.to_string(),
        }
    }
}

// =============================================================================
// Remote Snapshot
// =============================================================================

/// Verbatim remote fields mirrored onto the local record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteSnapshot {
    pub subject: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub is_all_day: bool,
    pub attendees: Vec<RemoteAttendee>,
    pub categories: Vec<String>,
    pub body: Option<String>,
    pub location_text: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub change_key: Option<String>,
}

impl RemoteSnapshot {
    /// Builds a snapshot from a delta item.
    ///
    /// ## Errors
    /// `MissingField` / `InvalidDateTime` / `InvertedRange` when the item
    /// cannot be placed on a timeline.
    pub fn from_remote(event: &RemoteEvent) -> CoreResult<Self> {
        if event.id.trim().is_empty() {
            return Err(CoreError::MissingField {
                remote_id: String::new(),
                field: "id".to_string(),
            });
        }
        let (start, end) = event.time_range()?;
        Ok(RemoteSnapshot {
            subject: event.subject.clone().unwrap_or_default(),
            start,
            end,
            is_all_day: event.is_all_day,
            attendees: event.attendees.clone(),
            categories: event.categories.clone(),
            body: event.body.clone(),
            location_text: event
                .location
                .as_ref()
                .map(|l| l.trim().to_string())
                .filter(|l| !l.is_empty()),
            last_modified: event.last_modified,
            change_key: event.change_key.clone(),
        })
    }

    /// Returns true if this snapshot was modified strictly after `other`.
    ///
    /// A snapshot without a timestamp never beats one that has it.
    pub fn is_newer_than(&self, other: &RemoteSnapshot) -> bool {
        match (self.last_modified, other.last_modified) {
            (Some(mine), Some(theirs)) => mine > theirs,
            (Some(_), None) => true,
            _ => false,
        }
    }
}

// =============================================================================
// Enrichment
// =============================================================================

/// Locally-owned fields the calendar service knows nothing about.
///
/// Never overwritten by a sync, except that registration calendars may
/// contribute setup/teardown timing and notes extracted from the body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enrichment {
    pub setup_minutes: i64,
    pub teardown_minutes: i64,
    pub assigned_staff: Option<String>,
    pub internal_notes: Option<String>,
    pub estimated_cost_cents: Option<i64>,
    pub actual_cost_cents: Option<i64>,
    /// True when the record was first created by a bulk import.
    #[serde(default)]
    pub imported: bool,
    pub import_source: Option<String>,
}

impl Enrichment {
    /// Enrichment for a brand-new record.
    pub fn with_defaults(setup_minutes: i64, teardown_minutes: i64) -> Self {
        Enrichment {
            setup_minutes,
            teardown_minutes,
            ..Default::default()
        }
    }
}

/// Online meeting detected in place of a physical location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualMeeting {
    pub platform: String,
    pub url: String,
}

// =============================================================================
// Unified Event
// =============================================================================

/// The reconciled local record for one logical event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedEvent {
    /// Storage identifier of the document.
    pub id: String,
    /// Stable identifier, minted once.
    pub internal_id: String,
    pub remote_id: String,
    pub global_uid: Option<String>,
    pub owner_id: String,
    pub primary_calendar_id: String,
    pub source_calendars: Vec<SourceCalendar>,
    pub snapshot: RemoteSnapshot,
    pub enrichment: Enrichment,
    pub resolved_locations: Vec<String>,
    pub location_display_text: Option<String>,
    pub virtual_meeting: Option<VirtualMeeting>,
    pub is_deleted: bool,
    pub last_synced_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The canonical identity of an existing record, resolved before any write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventIdentity {
    pub storage_id: String,
    pub internal_id: String,
}

// =============================================================================
// Locations
// =============================================================================

/// Lifecycle state of a location entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationStatus {
    Approved,
    /// Consolidated into another entity by an administrator.
    Merged,
}

impl LocationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocationStatus::Approved => "approved",
            LocationStatus::Merged => "merged",
        }
    }
}

impl FromStr for LocationStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approved" => Ok(LocationStatus::Approved),
            "merged" => Ok(LocationStatus::Merged),
            other => Err(ValidationError::InvalidFormat {
                field: "status".to_string(),
                reason: format!("unknown location status '{other}'"),
            }),
        }
    }
}

/// A canonical place record free-text locations resolve against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationEntity {
    pub id: String,
    pub name: String,
    pub display_name: String,
    /// Normalised free-text variants.
    pub aliases: Vec<String>,
    pub location_code: Option<String>,
    pub status: LocationStatus,
    pub merged_into: Option<String>,
    /// Original (un-normalised) strings seen resolving to this entity.
    pub seen_variations: Vec<String>,
    pub usage_count: i64,
}

impl LocationEntity {
    pub fn is_merged(&self) -> bool {
        self.status == LocationStatus::Merged
    }

    /// Returns true if this exact original text resolved here before.
    pub fn has_seen(&self, original: &str) -> bool {
        self.seen_variations.iter().any(|v| v == original)
    }
}

/// How a location string was matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    /// Nothing matched (and nothing was created).
    None,
    Exact,
    Code,
    Fuzzy,
    /// Fuzzy match on a string already recorded on the entity.
    Variation,
    /// No match; a new entity was created.
    Created,
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MatchType::None => "none",
            MatchType::Exact => "exact",
            MatchType::Code => "code",
            MatchType::Fuzzy => "fuzzy",
            MatchType::Variation => "variation",
            MatchType::Created => "created",
        };
        f.write_str(s)
    }
}

/// Result of resolving one location segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationMatch {
    pub entity_id: Option<String>,
    pub confidence: f64,
    pub match_type: MatchType,
}

impl LocationMatch {
    pub fn none() -> Self {
        LocationMatch {
            entity_id: None,
            confidence: 0.0,
            match_type: MatchType::None,
        }
    }

    pub fn matched(entity_id: impl Into<String>, confidence: f64, match_type: MatchType) -> Self {
        LocationMatch {
            entity_id: Some(entity_id.into()),
            confidence,
            match_type,
        }
    }

    pub fn is_match(&self) -> bool {
        self.entity_id.is_some()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
