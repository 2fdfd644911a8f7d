//! # Event Repository
//!
//! Unified event documents: scalar identity columns plus JSON sub-documents.
//!
//! ## Identity Resolution
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  find_existing(owner, global_uid, remote_id)                           │
//! │                                                                         │
//! │   global_uid present? ──yes──► WHERE owner_id = ? AND global_uid = ?   │
//! │          │                            │ hit → done                      │
//! │          no / miss                    │                                 │
//! │          ▼                            ▼                                 │
//! │   WHERE owner_id = ? AND remote_id = ?                                 │
//! │   ORDER BY is_deleted, updated_at DESC   (live row first)              │
//! │                                                                         │
//! │  Soft-deleted rows are included: a recreated remote item revives the   │
//! │  original internal_id and its enrichment.                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Write Paths
//! - [`EventRepository::upsert`]: full-document replace keyed by storage id
//!   (per-event merge path)
//! - [`EventRepository::bulk_update_snapshots`]: conditional update-only
//!   batch in one transaction (bulk path; never creates rows)

use std::collections::HashMap;

use calsync_core::{EventIdentity, TimeWindow, UnifiedEvent};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::debug;

use crate::error::{DbError, DbResult};

const SELECT_EVENT: &str = r#"
    SELECT
        id, internal_id, remote_id, global_uid, owner_id, primary_calendar_id,
        source_calendars, remote_snapshot, enrichment, resolved_locations,
        location_display_text, virtual_meeting, is_deleted,
        last_synced_at, created_at, updated_at
    FROM unified_events
"#;

// =============================================================================
// Row Mapping
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    id: String,
    internal_id: String,
    remote_id: String,
    global_uid: Option<String>,
    owner_id: String,
    primary_calendar_id: String,
    source_calendars: String,
    remote_snapshot: String,
    enrichment: String,
    resolved_locations: String,
    location_display_text: Option<String>,
    virtual_meeting: Option<String>,
    is_deleted: bool,
    last_synced_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

fn decode<T: DeserializeOwned>(column: &str, raw: &str) -> DbResult<T> {
    serde_json::from_str(raw).map_err(|e| DbError::serialization(column, e))
}

fn encode<T: Serialize>(column: &str, value: &T) -> DbResult<String> {
    serde_json::to_string(value).map_err(|e| DbError::serialization(column, e))
}

impl TryFrom<EventRow> for UnifiedEvent {
    type Error = DbError;

    fn try_from(row: EventRow) -> DbResult<Self> {
        Ok(UnifiedEvent {
            source_calendars: decode("source_calendars", &row.source_calendars)?,
            snapshot: decode("remote_snapshot", &row.remote_snapshot)?,
            enrichment: decode("enrichment", &row.enrichment)?,
            resolved_locations: decode("resolved_locations", &row.resolved_locations)?,
            virtual_meeting: row
                .virtual_meeting
                .as_deref()
                .map(|raw| decode("virtual_meeting", raw))
                .transpose()?,
            id: row.id,
            internal_id: row.internal_id,
            remote_id: row.remote_id,
            global_uid: row.global_uid,
            owner_id: row.owner_id,
            primary_calendar_id: row.primary_calendar_id,
            location_display_text: row.location_display_text,
            is_deleted: row.is_deleted,
            last_synced_at: row.last_synced_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct IdentityRow {
    id: String,
    internal_id: String,
    remote_id: String,
}

// =============================================================================
// Bulk Update Input
// =============================================================================

/// Remote-derived fields written by the bulk path.
///
/// Enrichment, identity and source calendars are never touched by a bulk
/// update.
#[derive(Debug, Clone)]
pub struct SnapshotUpdate {
    pub remote_id: String,
    pub snapshot: calsync_core::RemoteSnapshot,
    pub resolved_locations: Vec<String>,
    pub location_display_text: Option<String>,
    pub virtual_meeting: Option<calsync_core::VirtualMeeting>,
}

// =============================================================================
// Repository
// =============================================================================

/// Repository for unified event documents.
#[derive(Debug, Clone)]
pub struct EventRepository {
    pool: SqlitePool,
}

impl EventRepository {
    /// Creates a new EventRepository.
    pub fn new(pool: SqlitePool) -> Self {
        EventRepository { pool }
    }

    /// Gets an event by storage id.
    pub async fn get(&self, id: &str) -> DbResult<Option<UnifiedEvent>> {
        let row = sqlx::query_as::<_, EventRow>(&format!("{SELECT_EVENT} WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(UnifiedEvent::try_from).transpose()
    }

    /// Resolves the existing record for a remote item, global uid first.
    pub async fn find_existing(
        &self,
        owner_id: &str,
        global_uid: Option<&str>,
        remote_id: &str,
    ) -> DbResult<Option<UnifiedEvent>> {
        if let Some(uid) = global_uid.filter(|u| !u.is_empty()) {
            let row = sqlx::query_as::<_, EventRow>(&format!(
                "{SELECT_EVENT} WHERE owner_id = ?1 AND global_uid = ?2"
            ))
            .bind(owner_id)
            .bind(uid)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(row) = row {
                return UnifiedEvent::try_from(row).map(Some);
            }
        }

        let row = sqlx::query_as::<_, EventRow>(&format!(
            "{SELECT_EVENT} WHERE owner_id = ?1 AND remote_id = ?2 \
             ORDER BY is_deleted ASC, updated_at DESC LIMIT 1"
        ))
        .bind(owner_id)
        .bind(remote_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(UnifiedEvent::try_from).transpose()
    }

    /// Finds the live record a removal on `calendar_id` refers to.
    ///
    /// Matches the record's own remote id, or a source entry that last saw
    /// `remote_id` on that calendar.
    pub async fn find_live_by_source(
        &self,
        owner_id: &str,
        calendar_id: &str,
        remote_id: &str,
    ) -> DbResult<Option<UnifiedEvent>> {
        let row = sqlx::query_as::<_, EventRow>(&format!(
            "{SELECT_EVENT} WHERE owner_id = ?1 AND is_deleted = 0 AND (remote_id = ?3 OR EXISTS ( \
                 SELECT 1 FROM json_each(unified_events.source_calendars) AS s \
                 WHERE json_extract(s.value, '$.calendar_id') = ?2 \
                 AND json_extract(s.value, '$.remote_id') = ?3)) \
             LIMIT 1"
        ))
        .bind(owner_id)
        .bind(calendar_id)
        .bind(remote_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(UnifiedEvent::try_from).transpose()
    }

    /// Writes the whole document, inserting or replacing by storage id.
    pub async fn upsert(&self, event: &UnifiedEvent) -> DbResult<()> {
        debug!(
            owner_id = %event.owner_id,
            remote_id = %event.remote_id,
            internal_id = %event.internal_id,
            "Upserting unified event"
        );

        sqlx::query(
            r#"
            INSERT INTO unified_events (
                id, internal_id, remote_id, global_uid, owner_id, primary_calendar_id,
                subject, start_time, end_time, location_display_text,
                source_calendars, remote_snapshot, enrichment, resolved_locations,
                virtual_meeting, is_deleted, last_synced_at, created_at, updated_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6,
                ?7, ?8, ?9, ?10,
                ?11, ?12, ?13, ?14,
                ?15, ?16, ?17, ?18, ?19
            )
            ON CONFLICT (id) DO UPDATE SET
                remote_id = excluded.remote_id,
                global_uid = excluded.global_uid,
                primary_calendar_id = excluded.primary_calendar_id,
                subject = excluded.subject,
                start_time = excluded.start_time,
                end_time = excluded.end_time,
                location_display_text = excluded.location_display_text,
                source_calendars = excluded.source_calendars,
                remote_snapshot = excluded.remote_snapshot,
                enrichment = excluded.enrichment,
                resolved_locations = excluded.resolved_locations,
                virtual_meeting = excluded.virtual_meeting,
                is_deleted = excluded.is_deleted,
                last_synced_at = excluded.last_synced_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&event.id)
        .bind(&event.internal_id)
        .bind(&event.remote_id)
        .bind(&event.global_uid)
        .bind(&event.owner_id)
        .bind(&event.primary_calendar_id)
        .bind(&event.snapshot.subject)
        .bind(event.snapshot.start)
        .bind(event.snapshot.end)
        .bind(&event.location_display_text)
        .bind(encode("source_calendars", &event.source_calendars)?)
        .bind(encode("remote_snapshot", &event.snapshot)?)
        .bind(encode("enrichment", &event.enrichment)?)
        .bind(encode("resolved_locations", &event.resolved_locations)?)
        .bind(
            event
                .virtual_meeting
                .as_ref()
                .map(|v| encode("virtual_meeting", v))
                .transpose()?,
        )
        .bind(event.is_deleted)
        .bind(event.last_synced_at)
        .bind(event.created_at)
        .bind(event.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // =========================================================================
    // Bulk Path
    // =========================================================================

    /// Looks up live records for a batch of remote ids in one query.
    pub async fn find_by_remote_ids(
        &self,
        owner_id: &str,
        remote_ids: &[String],
    ) -> DbResult<HashMap<String, EventIdentity>> {
        if remote_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let rows: Vec<IdentityRow> = live_rows_for(owner_id, remote_ids)
            .build_query_as()
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|r| {
                (
                    r.remote_id,
                    EventIdentity {
                        storage_id: r.id,
                        internal_id: r.internal_id,
                    },
                )
            })
            .collect())
    }

    /// Applies remote-derived updates to existing live rows in one transaction.
    ///
    /// Rows that do not exist (or are deleted) are left alone, and so are rows
    /// whose stored snapshot was modified after the incoming one. Returns the
    /// remote ids that were updated.
    pub async fn bulk_update_snapshots(
        &self,
        owner_id: &str,
        updates: &[SnapshotUpdate],
        synced_at: DateTime<Utc>,
    ) -> DbResult<Vec<String>> {
        if updates.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await?;
        let mut updated = Vec::new();

        for update in updates {
            let result = sqlx::query(
                r#"
                UPDATE unified_events SET
                    subject = ?3,
                    start_time = ?4,
                    end_time = ?5,
                    remote_snapshot = ?6,
                    resolved_locations = ?7,
                    location_display_text = ?8,
                    virtual_meeting = ?9,
                    last_synced_at = ?10,
                    updated_at = ?10
                WHERE owner_id = ?1 AND remote_id = ?2 AND is_deleted = 0
                  AND (
                    json_extract(remote_snapshot, '$.last_modified') IS NULL
                    OR julianday(json_extract(remote_snapshot, '$.last_modified')) <= julianday(?11)
                  )
                "#,
            )
            .bind(owner_id)
            .bind(&update.remote_id)
            .bind(&update.snapshot.subject)
            .bind(update.snapshot.start)
            .bind(update.snapshot.end)
            .bind(encode("remote_snapshot", &update.snapshot)?)
            .bind(encode("resolved_locations", &update.resolved_locations)?)
            .bind(&update.location_display_text)
            .bind(
                update
                    .virtual_meeting
                    .as_ref()
                    .map(|v| encode("virtual_meeting", v))
                    .transpose()?,
            )
            .bind(synced_at)
            .bind(
                update
                    .snapshot
                    .last_modified
                    .map(|t| t.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            )
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() > 0 {
                updated.push(update.remote_id.clone());
            }
        }

        tx.commit().await?;

        debug!(owner_id = %owner_id, updated = updated.len(), "Bulk snapshot update committed");
        Ok(updated)
    }

    /// Storage ids of the live rows for a batch of remote ids.
    pub async fn storage_ids_for(
        &self,
        owner_id: &str,
        remote_ids: &[String],
    ) -> DbResult<Vec<String>> {
        Ok(self
            .find_by_remote_ids(owner_id, remote_ids)
            .await?
            .into_values()
            .map(|identity| identity.storage_id)
            .collect())
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Live events overlapping the window, ordered by start.
    pub async fn list_in_window(
        &self,
        owner_id: &str,
        window: &TimeWindow,
    ) -> DbResult<Vec<UnifiedEvent>> {
        let rows = sqlx::query_as::<_, EventRow>(&format!(
            "{SELECT_EVENT} WHERE owner_id = ?1 AND is_deleted = 0 \
             AND start_time < ?3 AND end_time > ?2 ORDER BY start_time ASC"
        ))
        .bind(owner_id)
        .bind(window.start)
        .bind(window.end)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(UnifiedEvent::try_from).collect()
    }

    /// Number of live events for an owner.
    pub async fn count_active(&self, owner_id: &str) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM unified_events WHERE owner_id = ?1 AND is_deleted = 0",
        )
        .bind(owner_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }
}

fn live_rows_for<'a>(owner_id: &'a str, remote_ids: &'a [String]) -> QueryBuilder<'a, Sqlite> {
    let mut builder = QueryBuilder::new(
        "SELECT id, internal_id, remote_id FROM unified_events WHERE is_deleted = 0 AND owner_id = ",
    );
    builder.push_bind(owner_id);
    builder.push(" AND remote_id IN (");
    let mut separated = builder.separated(", ");
    for remote_id in remote_ids {
        separated.push_bind(remote_id);
    }
    separated.push_unseparated(")");
    builder
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;
    use calsync_core::{
        Enrichment, RemoteSnapshot, SourceCalendar, SourceRole, TimeWindow, UnifiedEvent,
    };
    use chrono::TimeZone;

    fn sample(owner: &str, remote_id: &str, global_uid: Option<&str>, hour: u32) -> UnifiedEvent {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap();
        let now = Utc::now();
        UnifiedEvent {
            id: uuid::Uuid::new_v4().to_string(),
            internal_id: uuid::Uuid::new_v4().to_string(),
            remote_id: remote_id.to_string(),
            global_uid: global_uid.map(str::to_string),
            owner_id: owner.to_string(),
            primary_calendar_id: "cal-1".to_string(),
            source_calendars: vec![SourceCalendar::new("cal-1", SourceRole::Primary)],
            snapshot: RemoteSnapshot {
                subject: format!("Event {remote_id}"),
                start,
                end: start + chrono::Duration::hours(1),
                is_all_day: false,
                attendees: vec![],
                categories: vec![],
                body: None,
                location_text: None,
                last_modified: None,
                change_key: None,
            },
            enrichment: Enrichment::default(),
            resolved_locations: vec![],
            location_display_text: None,
            virtual_meeting: None,
            is_deleted: false,
            last_synced_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_upsert_and_get_round_trip() {
        let db = Database::in_memory().await.unwrap();
        let mut event = sample("me", "r-1", Some("uid-1"), 10);
        event.enrichment.assigned_staff = Some("Jane".to_string());

        db.events().upsert(&event).await.unwrap();
        let loaded = db.events().get(&event.id).await.unwrap().unwrap();

        assert_eq!(loaded.internal_id, event.internal_id);
        assert_eq!(loaded.enrichment.assigned_staff.as_deref(), Some("Jane"));
        assert_eq!(loaded.snapshot.start, event.snapshot.start);
    }

    #[tokio::test]
    async fn test_find_existing_prefers_global_uid() {
        let db = Database::in_memory().await.unwrap();
        let event = sample("me", "r-1", Some("uid-1"), 10);
        db.events().upsert(&event).await.unwrap();

        // Recreated remotely: new remote id, same global uid
        let found = db
            .events()
            .find_existing("me", Some("uid-1"), "r-2")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.internal_id, event.internal_id);

        let found = db.events().find_existing("me", None, "r-1").await.unwrap().unwrap();
        assert_eq!(found.id, event.id);

        assert!(db.events().find_existing("other", Some("uid-1"), "r-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_deleted_rows_still_resolve() {
        let db = Database::in_memory().await.unwrap();
        let mut event = sample("me", "r-1", None, 10);
        db.events().upsert(&event).await.unwrap();

        event.is_deleted = true;
        db.events().upsert(&event).await.unwrap();
        assert_eq!(db.events().count_active("me").await.unwrap(), 0);

        // A revival keeps the internal id
        let found = db.events().find_existing("me", None, "r-1").await.unwrap().unwrap();
        assert!(found.is_deleted);
        assert_eq!(found.internal_id, event.internal_id);
        assert!(db.events().find_live_by_source("me", "cal-1", "r-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_find_live_by_source() {
        let db = Database::in_memory().await.unwrap();
        let mut event = sample("me", "r-1", Some("uid-1"), 10);
        event.source_calendars = vec![
            SourceCalendar::new("cal-1", SourceRole::Primary).with_remote_id("r-1"),
            SourceCalendar::new("shared-cal", SourceRole::Shared).with_remote_id("r-9"),
        ];
        db.events().upsert(&event).await.unwrap();

        let by_record = db.events().find_live_by_source("me", "cal-1", "r-1").await.unwrap();
        assert_eq!(by_record.unwrap().id, event.id);

        let by_source = db.events().find_live_by_source("me", "shared-cal", "r-9").await.unwrap();
        assert_eq!(by_source.unwrap().id, event.id);

        // The copy id only counts on the calendar that reported it
        assert!(db.events().find_live_by_source("me", "cal-2", "r-9").await.unwrap().is_none());
        assert!(db.events().find_live_by_source("other", "cal-1", "r-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_live_remote_id_rejected() {
        let db = Database::in_memory().await.unwrap();
        db.events().upsert(&sample("me", "r-1", None, 10)).await.unwrap();

        let err = db.events().upsert(&sample("me", "r-1", None, 11)).await.unwrap_err();
        assert!(matches!(err, DbError::UniqueViolation { .. }));
    }

    #[tokio::test]
    async fn test_bulk_update_only_touches_existing_rows() {
        let db = Database::in_memory().await.unwrap();
        let mut existing = sample("me", "r-1", None, 10);
        existing.enrichment.setup_minutes = 30;
        db.events().upsert(&existing).await.unwrap();

        let ids = vec!["r-1".to_string(), "r-2".to_string()];
        let found = db.events().find_by_remote_ids("me", &ids).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found["r-1"].internal_id, existing.internal_id);

        let mut snapshot = existing.snapshot.clone();
        snapshot.subject = "Renamed".to_string();
        let updates = vec![
            SnapshotUpdate {
                remote_id: "r-1".to_string(),
                snapshot: snapshot.clone(),
                resolved_locations: vec!["loc-1".to_string()],
                location_display_text: Some("Main Chapel".to_string()),
                virtual_meeting: None,
            },
            SnapshotUpdate {
                remote_id: "r-2".to_string(),
                snapshot,
                resolved_locations: vec![],
                location_display_text: None,
                virtual_meeting: None,
            },
        ];
        let updated = db
            .events()
            .bulk_update_snapshots("me", &updates, Utc::now())
            .await
            .unwrap();
        assert_eq!(updated, vec!["r-1".to_string()]);

        let loaded = db.events().get(&existing.id).await.unwrap().unwrap();
        assert_eq!(loaded.snapshot.subject, "Renamed");
        assert_eq!(loaded.enrichment.setup_minutes, 30);
        assert_eq!(loaded.resolved_locations, vec!["loc-1".to_string()]);

        let storage_ids = db.events().storage_ids_for("me", &ids).await.unwrap();
        assert_eq!(storage_ids, vec![existing.id.clone()]);
        assert_eq!(db.events().count_active("me").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_bulk_update_never_overwrites_newer_snapshot() {
        let db = Database::in_memory().await.unwrap();
        let mut existing = sample("me", "r-1", None, 10);
        existing.snapshot.subject = "Current".to_string();
        existing.snapshot.last_modified = Some(Utc.with_ymd_and_hms(2024, 2, 2, 12, 0, 0).unwrap());
        db.events().upsert(&existing).await.unwrap();

        let update = |subject: &str, last_modified: Option<DateTime<Utc>>| {
            let mut snapshot = existing.snapshot.clone();
            snapshot.subject = subject.to_string();
            snapshot.last_modified = last_modified;
            SnapshotUpdate {
                remote_id: "r-1".to_string(),
                snapshot,
                resolved_locations: vec![],
                location_display_text: None,
                virtual_meeting: None,
            }
        };

        let stale = vec![
            update("Stale", Some(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap())),
            update("Undated", None),
        ];
        let updated = db.events().bulk_update_snapshots("me", &stale, Utc::now()).await.unwrap();
        assert!(updated.is_empty());
        let loaded = db.events().get(&existing.id).await.unwrap().unwrap();
        assert_eq!(loaded.snapshot.subject, "Current");

        let same = vec![update("Same instant", existing.snapshot.last_modified)];
        let updated = db.events().bulk_update_snapshots("me", &same, Utc::now()).await.unwrap();
        assert_eq!(updated, vec!["r-1".to_string()]);
        let loaded = db.events().get(&existing.id).await.unwrap().unwrap();
        assert_eq!(loaded.snapshot.subject, "Same instant");
    }

    #[tokio::test]
    async fn test_list_in_window() {
        let db = Database::in_memory().await.unwrap();
        db.events().upsert(&sample("me", "r-late", None, 15)).await.unwrap();
        db.events().upsert(&sample("me", "r-early", None, 9)).await.unwrap();
        db.events().upsert(&sample("me", "r-out", None, 20)).await.unwrap();

        let window = TimeWindow::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 1, 16, 0, 0).unwrap(),
        )
        .unwrap();
        let events = db.events().list_in_window("me", &window).await.unwrap();

        let ids: Vec<_> = events.iter().map(|e| e.remote_id.as_str()).collect();
        assert_eq!(ids, vec!["r-early", "r-late"]);
    }
}
