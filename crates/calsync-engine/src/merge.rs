//! # Event Merge Engine
//!
//! Reconciles one remote change record into the unified local record.
//!
//! ## Merge Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         merge(owner, calendar, remote)                  │
//! │                                                                         │
//! │  remote ──► RemoteSnapshot::from_remote ──✗──► MalformedEvent           │
//! │                    │                                                    │
//! │                    ▼                                                    │
//! │  1. identity     find_existing(global_uid, then remote_id)              │
//! │                  found  → reuse id + internal_id (revive if deleted)    │
//! │                  absent → mint both                                     │
//! │                    │                                                    │
//! │  2. sources      add calendar tagged primary / shared                   │
//! │                    │                                                    │
//! │  3. enrichment   new: defaults │ existing: verbatim                     │
//! │                  registration calendar: + setup/teardown + notes        │
//! │                    │                                                    │
//! │  4. tie-break    stored snapshot kept only if strictly newer            │
//! │                    │                                                    │
//! │  5. location     LocationResolver::resolve_text (never fails)           │
//! │                    │                                                    │
//! │  6. write        full-document upsert                                   │
//! │                  unique clash with a concurrent writer → redo once      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Removal
//! ```text
//! remove(owner, calendar, remote_id)
//!   find_live_by_source ──► none → NotFound
//!   drop that calendar's source entry
//!   no sources left        → soft-delete             (Deleted)
//!   primary calendar gone  → promote a remaining one (Detached)
//!   otherwise              → keep primary            (Detached)
//! ```
//!
//! Merging the same remote state twice writes the same document, so page
//! re-processing after a crash is harmless. Merges and removals hold one
//! write lock, so calendars synced side by side never both mint a record for
//! the same `global_uid`.

use calsync_core::enrichment::{extract_notes, extract_timing, merge_notes};
use calsync_core::{
    Enrichment, RemoteEvent, RemoteSnapshot, SourceCalendar, SourceRole, UnifiedEvent,
};
use std::sync::Arc;

use calsync_db::{DbError, EventRepository};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::config::MergeSettings;
use crate::error::{SyncError, SyncResult};
use crate::location::LocationResolver;

/// Result of merging one remote event.
#[derive(Debug, Clone, Serialize)]
pub struct MergeOutcome {
    pub event: UnifiedEvent,
    /// True when no record (live or deleted) existed before.
    pub created: bool,
}

/// What a removal did to the unified record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalOutcome {
    /// The last source calendar dropped the event; the record is soft-deleted.
    Deleted,
    /// Other calendars still carry the event.
    Detached,
    /// No live record for this item.
    NotFound,
}

/// Per-event reconciliation.
#[derive(Debug, Clone)]
pub struct EventMergeEngine {
    events: EventRepository,
    resolver: LocationResolver,
    settings: MergeSettings,
    /// Serialises read-modify-write of event documents within this process.
    write_lock: Arc<Mutex<()>>,
}

impl EventMergeEngine {
    pub fn new(events: EventRepository, resolver: LocationResolver, settings: MergeSettings) -> Self {
        EventMergeEngine {
            events,
            resolver,
            settings,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    // =========================================================================
    // Calendar Classification
    // =========================================================================

    /// Registration calendars contribute setup/teardown and notes.
    pub fn is_registration(&self, calendar_id: &str) -> bool {
        self.settings
            .registration_calendar_ids
            .iter()
            .any(|id| id == calendar_id)
            || contains_marker(calendar_id, &self.settings.registration_markers)
    }

    /// Role of a calendar by naming convention.
    pub fn role_for(&self, calendar_id: &str) -> SourceRole {
        if self.is_registration(calendar_id)
            || contains_marker(calendar_id, &self.settings.shared_calendar_markers)
        {
            SourceRole::Shared
        } else {
            SourceRole::Primary
        }
    }

    pub fn source_for(&self, calendar_id: &str) -> SourceCalendar {
        SourceCalendar::new(calendar_id, self.role_for(calendar_id))
    }

    // =========================================================================
    // Merge
    // =========================================================================

    /// Merges one remote event observed on `calendar_id`.
    ///
    /// ## Errors
    /// - `MalformedEvent` if the item has no usable id or times
    /// - `Database` if the lookup or write fails
    pub async fn merge(
        &self,
        owner_id: &str,
        calendar_id: &str,
        remote: &RemoteEvent,
        known_sources: &[SourceCalendar],
    ) -> SyncResult<MergeOutcome> {
        let incoming =
            RemoteSnapshot::from_remote(remote).map_err(|e| SyncError::malformed(&remote.id, e))?;

        let _guard = self.write_lock.lock().await;
        match self
            .merge_locked(owner_id, calendar_id, remote, incoming.clone(), known_sources)
            .await
        {
            // Another writer created the record between lookup and write.
            Err(SyncError::Database(DbError::UniqueViolation { field, .. })) => {
                debug!(
                    owner_id,
                    calendar_id,
                    remote_id = %remote.id,
                    field = %field,
                    "Identity clash on write, merging into the existing record"
                );
                self.merge_locked(owner_id, calendar_id, remote, incoming, known_sources)
                    .await
            }
            other => other,
        }
    }

    async fn merge_locked(
        &self,
        owner_id: &str,
        calendar_id: &str,
        remote: &RemoteEvent,
        incoming: RemoteSnapshot,
        known_sources: &[SourceCalendar],
    ) -> SyncResult<MergeOutcome> {
        let existing = self
            .events
            .find_existing(owner_id, remote.global_uid.as_deref(), &remote.id)
            .await?;

        let now = Utc::now();
        let source_calendars =
            self.merge_sources(existing.as_ref(), calendar_id, &remote.id, known_sources);
        let enrichment = self.merge_enrichment(existing.as_ref(), calendar_id, remote);

        let (snapshot, primary_calendar_id) = match &existing {
            Some(stored) if stored.snapshot.is_newer_than(&incoming) => {
                debug!(
                    owner_id,
                    calendar_id,
                    remote_id = %remote.id,
                    "Stored snapshot is newer, keeping it"
                );
                (stored.snapshot.clone(), stored.primary_calendar_id.clone())
            }
            Some(stored) if !incoming.is_newer_than(&stored.snapshot) => {
                (incoming, stored.primary_calendar_id.clone())
            }
            _ => (incoming, calendar_id.to_string()),
        };

        let locations = self
            .resolver
            .resolve_text(
                snapshot.location_text.as_deref(),
                remote.online_meeting_url.as_deref(),
            )
            .await;

        let created = existing.is_none();
        let (id, internal_id, created_at, global_uid, remote_id) = match existing {
            Some(stored) => {
                // The remote id tracks the primary calendar's copy.
                let remote_id = if primary_calendar_id == calendar_id {
                    remote.id.clone()
                } else {
                    stored.remote_id
                };
                (
                    stored.id,
                    stored.internal_id,
                    stored.created_at,
                    remote.global_uid.clone().or(stored.global_uid),
                    remote_id,
                )
            }
            None => (
                Uuid::new_v4().to_string(),
                Uuid::new_v4().to_string(),
                now,
                remote.global_uid.clone(),
                remote.id.clone(),
            ),
        };

        let event = UnifiedEvent {
            id,
            internal_id,
            remote_id,
            global_uid,
            owner_id: owner_id.to_string(),
            primary_calendar_id,
            source_calendars,
            snapshot,
            enrichment,
            resolved_locations: locations.entity_ids,
            location_display_text: locations.display_text,
            virtual_meeting: locations.virtual_meeting,
            is_deleted: false,
            last_synced_at: now,
            created_at,
            updated_at: now,
        };

        self.events.upsert(&event).await?;

        debug!(
            owner_id,
            calendar_id,
            remote_id = %event.remote_id,
            internal_id = %event.internal_id,
            created,
            "Merged remote event"
        );

        Ok(MergeOutcome { event, created })
    }

    // =========================================================================
    // Removal
    // =========================================================================

    /// Applies a removal reported by `calendar_id` for its copy `remote_id`.
    ///
    /// Only that calendar's source entry is dropped. The record is
    /// soft-deleted once no source calendar carries it any more.
    pub async fn remove(
        &self,
        owner_id: &str,
        calendar_id: &str,
        remote_id: &str,
    ) -> SyncResult<RemovalOutcome> {
        let _guard = self.write_lock.lock().await;

        let Some(mut record) = self
            .events
            .find_live_by_source(owner_id, calendar_id, remote_id)
            .await?
        else {
            return Ok(RemovalOutcome::NotFound);
        };

        let before = record.source_calendars.len();
        record.source_calendars.retain(|s| {
            s.calendar_id != calendar_id || s.remote_id.as_deref().is_some_and(|r| r != remote_id)
        });
        if record.source_calendars.len() == before {
            debug!(owner_id, calendar_id, remote_id, "Removal for a calendar the record does not list");
            return Ok(RemovalOutcome::NotFound);
        }

        let outcome = if record.source_calendars.is_empty() {
            record.is_deleted = true;
            RemovalOutcome::Deleted
        } else {
            if !record
                .source_calendars
                .iter()
                .any(|s| s.calendar_id == record.primary_calendar_id)
            {
                promote_primary(&mut record);
            }
            RemovalOutcome::Detached
        };

        let now = Utc::now();
        record.last_synced_at = now;
        record.updated_at = now;
        self.events.upsert(&record).await?;

        debug!(
            owner_id,
            calendar_id,
            remote_id,
            internal_id = %record.internal_id,
            ?outcome,
            primary = %record.primary_calendar_id,
            "Applied remote removal"
        );
        Ok(outcome)
    }

    fn merge_sources(
        &self,
        existing: Option<&UnifiedEvent>,
        calendar_id: &str,
        remote_id: &str,
        known_sources: &[SourceCalendar],
    ) -> Vec<SourceCalendar> {
        let mut sources = existing
            .map(|e| e.source_calendars.clone())
            .unwrap_or_default();

        match sources.iter_mut().find(|s| s.calendar_id == calendar_id) {
            Some(seen) => seen.remote_id = Some(remote_id.to_string()),
            None => {
                let current = known_sources
                    .iter()
                    .find(|s| s.calendar_id == calendar_id)
                    .cloned()
                    .unwrap_or_else(|| self.source_for(calendar_id));
                sources.push(current.with_remote_id(remote_id));
            }
        }
        sources
    }

    fn merge_enrichment(
        &self,
        existing: Option<&UnifiedEvent>,
        calendar_id: &str,
        remote: &RemoteEvent,
    ) -> Enrichment {
        let mut enrichment = match existing {
            Some(stored) => stored.enrichment.clone(),
            None => Enrichment::with_defaults(
                self.settings.default_setup_minutes,
                self.settings.default_teardown_minutes,
            ),
        };

        if !self.is_registration(calendar_id) {
            return enrichment;
        }

        let text = remote.free_text();
        if let Some(timing) = extract_timing(text) {
            enrichment.setup_minutes = timing.setup_minutes;
            enrichment.teardown_minutes = timing.teardown_minutes;
        }
        if let Some(notes) = extract_notes(text) {
            enrichment.internal_notes =
                Some(merge_notes(enrichment.internal_notes.as_deref(), &notes));
        }
        enrichment
    }
}

/// Hands the primary role to a remaining source, own calendars first.
fn promote_primary(record: &mut UnifiedEvent) {
    let next = record
        .source_calendars
        .iter()
        .find(|s| s.role == SourceRole::Primary)
        .or_else(|| record.source_calendars.first())
        .cloned();

    if let Some(next) = next {
        record.primary_calendar_id = next.calendar_id;
        if let Some(remote_id) = next.remote_id {
            record.remote_id = remote_id;
        }
    }
}

fn contains_marker(calendar_id: &str, markers: &[String]) -> bool {
    let lower = calendar_id.to_lowercase();
    markers
        .iter()
        .filter(|m| !m.is_empty())
        .any(|m| lower.contains(&m.to_lowercase()))
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LocationSettings;
    use crate::testing::remote_event;
    use calsync_core::RemoteDateTime;
    use calsync_db::Database;
    use chrono::TimeZone;

    async fn engine_with(settings: MergeSettings) -> (Database, EventMergeEngine) {
        let db = Database::in_memory().await.unwrap();
        let resolver = LocationResolver::new(db.locations(), LocationSettings::default());
        let engine = EventMergeEngine::new(db.events(), resolver, settings);
        (db, engine)
    }

    async fn engine() -> (Database, EventMergeEngine) {
        engine_with(MergeSettings::default()).await
    }

    #[tokio::test]
    async fn test_merge_is_idempotent() {
        let (_db, engine) = engine().await;
        let remote = remote_event("AAMk-1", Some("uid-1"), "Choir", 10);

        let first = engine.merge("alice", "cal-1", &remote, &[]).await.unwrap();
        let second = engine.merge("alice", "cal-1", &remote, &[]).await.unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.event.internal_id, second.event.internal_id);
        assert_eq!(first.event.id, second.event.id);
        assert_eq!(first.event.enrichment, second.event.enrichment);
        assert_eq!(second.event.source_calendars.len(), 1);
    }

    #[tokio::test]
    async fn test_identity_follows_global_uid() {
        let (db, engine) = engine().await;
        let original = remote_event("remote-A", Some("uid-1"), "Retreat", 9);
        let first = engine.merge("alice", "cal-1", &original, &[]).await.unwrap();

        let mut stored = first.event.clone();
        stored.enrichment.assigned_staff = Some("Jane".into());
        db.events().upsert(&stored).await.unwrap();

        let recreated = remote_event("remote-B", Some("uid-1"), "Retreat", 9);
        let second = engine.merge("alice", "cal-1", &recreated, &[]).await.unwrap();

        assert!(!second.created);
        assert_eq!(second.event.internal_id, first.event.internal_id);
        assert_eq!(second.event.remote_id, "remote-B");
        assert_eq!(second.event.enrichment.assigned_staff.as_deref(), Some("Jane"));
        assert_eq!(db.events().count_active("alice").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_enrichment_preserved_on_title_change() {
        let (db, engine) = engine().await;
        let remote = remote_event("AAMk-1", None, "Choir", 10);
        let first = engine.merge("alice", "cal-1", &remote, &[]).await.unwrap();

        let mut stored = first.event.clone();
        stored.enrichment.assigned_staff = Some("Jane".into());
        db.events().upsert(&stored).await.unwrap();

        let mut renamed = remote.clone();
        renamed.subject = Some("Choir (rescheduled)".into());
        let second = engine.merge("alice", "cal-1", &renamed, &[]).await.unwrap();

        assert_eq!(second.event.snapshot.subject, "Choir (rescheduled)");
        assert_eq!(second.event.enrichment.assigned_staff.as_deref(), Some("Jane"));
    }

    #[tokio::test]
    async fn test_registration_timing_extraction() {
        let (_db, engine) = engine().await;

        let mut remote = remote_event("AAMk-1", None, "Wedding", 14);
        remote.body = Some("Setup: 30 min, Teardown: 15 min".into());
        let merged = engine
            .merge("alice", "registration-cal", &remote, &[])
            .await
            .unwrap();
        assert_eq!(merged.event.enrichment.setup_minutes, 30);
        assert_eq!(merged.event.enrichment.teardown_minutes, 15);

        let mut total = remote_event("AAMk-2", None, "Funeral", 11);
        total.body = Some("Total: 40 min".into());
        let merged = engine
            .merge("alice", "registration-cal", &total, &[])
            .await
            .unwrap();
        assert_eq!(merged.event.enrichment.setup_minutes, 20);
        assert_eq!(merged.event.enrichment.teardown_minutes, 20);
    }

    #[tokio::test]
    async fn test_non_registration_ignores_body() {
        let (_db, engine) = engine_with(MergeSettings {
            default_setup_minutes: 10,
            ..Default::default()
        })
        .await;

        let mut remote = remote_event("AAMk-1", None, "Wedding", 14);
        remote.body = Some("Setup: 30 min".into());
        let merged = engine.merge("alice", "cal-1", &remote, &[]).await.unwrap();
        assert_eq!(merged.event.enrichment.setup_minutes, 10);
    }

    #[tokio::test]
    async fn test_registration_notes_append_once() {
        let (_db, engine) = engine().await;

        let mut remote = remote_event("AAMk-1", None, "Wedding", 14);
        remote.body = Some("Notes: bring extra chairs".into());
        engine.merge("alice", "registration-cal", &remote, &[]).await.unwrap();
        let again = engine.merge("alice", "registration-cal", &remote, &[]).await.unwrap();

        assert_eq!(
            again.event.enrichment.internal_notes.as_deref(),
            Some("bring extra chairs")
        );
    }

    #[tokio::test]
    async fn test_newer_stored_snapshot_wins() {
        let (_db, engine) = engine().await;

        let mut newer = remote_event("AAMk-1", Some("uid-1"), "Updated title", 10);
        newer.last_modified = Some(Utc.with_ymd_and_hms(2024, 2, 2, 0, 0, 0).unwrap());
        engine.merge("alice", "cal-1", &newer, &[]).await.unwrap();

        let mut stale = remote_event("AAMk-9", Some("uid-1"), "Old title", 10);
        stale.last_modified = Some(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap());
        let merged = engine
            .merge("alice", "shared-cal", &stale, &[])
            .await
            .unwrap();

        assert_eq!(merged.event.snapshot.subject, "Updated title");
        assert_eq!(merged.event.primary_calendar_id, "cal-1");
        assert_eq!(merged.event.remote_id, "AAMk-1");
        assert_eq!(merged.event.source_calendars.len(), 2);
        assert_eq!(merged.event.source_calendars[1].role, SourceRole::Shared);
    }

    #[tokio::test]
    async fn test_malformed_event_rejected() {
        let (db, engine) = engine().await;
        let mut remote = remote_event("AAMk-1", None, "Broken", 10);
        remote.end = Some(RemoteDateTime::utc("yesterday-ish"));

        let err = engine.merge("alice", "cal-1", &remote, &[]).await.unwrap_err();
        assert!(matches!(err, SyncError::MalformedEvent { ref remote_id, .. } if remote_id == "AAMk-1"));
        assert_eq!(db.events().count_active("alice").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_deleted_record_revived() {
        let (db, engine) = engine().await;
        let remote = remote_event("AAMk-1", Some("uid-1"), "Choir", 10);
        let first = engine.merge("alice", "cal-1", &remote, &[]).await.unwrap();

        let removed = engine.remove("alice", "cal-1", "AAMk-1").await.unwrap();
        assert_eq!(removed, RemovalOutcome::Deleted);
        assert_eq!(db.events().count_active("alice").await.unwrap(), 0);

        let revived = engine.merge("alice", "cal-1", &remote, &[]).await.unwrap();

        assert!(!revived.created);
        assert!(!revived.event.is_deleted);
        assert_eq!(revived.event.internal_id, first.event.internal_id);
        assert_eq!(revived.event.source_calendars.len(), 1);
    }

    #[tokio::test]
    async fn test_sources_record_copy_ids() {
        let (_db, engine) = engine().await;
        engine
            .merge("alice", "cal-1", &remote_event("AAMk-1", Some("uid-1"), "Choir", 10), &[])
            .await
            .unwrap();
        let merged = engine
            .merge("alice", "shared-cal", &remote_event("AAMk-9", Some("uid-1"), "Choir", 10), &[])
            .await
            .unwrap();

        let copies: Vec<_> = merged
            .event
            .source_calendars
            .iter()
            .map(|s| (s.calendar_id.as_str(), s.remote_id.as_deref()))
            .collect();
        assert_eq!(copies, vec![("cal-1", Some("AAMk-1")), ("shared-cal", Some("AAMk-9"))]);
    }

    #[tokio::test]
    async fn test_removal_from_primary_promotes_remaining_source() {
        let (db, engine) = engine().await;
        engine
            .merge("alice", "cal-1", &remote_event("AAMk-1", Some("uid-1"), "Choir", 10), &[])
            .await
            .unwrap();
        engine
            .merge("alice", "shared-cal", &remote_event("AAMk-9", Some("uid-1"), "Choir", 10), &[])
            .await
            .unwrap();

        let outcome = engine.remove("alice", "cal-1", "AAMk-1").await.unwrap();
        assert_eq!(outcome, RemovalOutcome::Detached);

        let record = db
            .events()
            .find_existing("alice", Some("uid-1"), "AAMk-9")
            .await
            .unwrap()
            .unwrap();
        assert!(!record.is_deleted);
        assert_eq!(record.primary_calendar_id, "shared-cal");
        assert_eq!(record.remote_id, "AAMk-9");
        assert_eq!(record.source_calendars.len(), 1);

        assert_eq!(
            engine.remove("alice", "cal-1", "AAMk-1").await.unwrap(),
            RemovalOutcome::NotFound
        );
        assert_eq!(
            engine.remove("alice", "shared-cal", "AAMk-9").await.unwrap(),
            RemovalOutcome::Deleted
        );
        assert_eq!(db.events().count_active("alice").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_removal_from_shared_keeps_primary() {
        let (db, engine) = engine().await;
        let first = engine
            .merge("alice", "cal-1", &remote_event("AAMk-1", Some("uid-1"), "Choir", 10), &[])
            .await
            .unwrap();
        engine
            .merge("alice", "shared-cal", &remote_event("AAMk-9", Some("uid-1"), "Choir", 10), &[])
            .await
            .unwrap();

        let outcome = engine.remove("alice", "shared-cal", "AAMk-9").await.unwrap();
        assert_eq!(outcome, RemovalOutcome::Detached);

        let record = db.events().get(&first.event.id).await.unwrap().unwrap();
        assert!(!record.is_deleted);
        assert_eq!(record.primary_calendar_id, "cal-1");
        assert_eq!(record.remote_id, "AAMk-1");
        let calendars: Vec<_> = record.source_calendars.iter().map(|s| s.calendar_id.as_str()).collect();
        assert_eq!(calendars, vec!["cal-1"]);
    }

    #[tokio::test]
    async fn test_concurrent_merges_share_one_record() {
        let (db, engine) = engine().await;
        let own = remote_event("AAMk-1", Some("uid-1"), "Choir", 10);
        let shared = remote_event("AAMk-9", Some("uid-1"), "Choir", 10);

        let (a, b) = tokio::join!(
            engine.merge("alice", "cal-1", &own, &[]),
            engine.merge("alice", "shared-cal", &shared, &[]),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a.event.internal_id, b.event.internal_id);
        assert_eq!(usize::from(a.created) + usize::from(b.created), 1);
        assert_eq!(db.events().count_active("alice").await.unwrap(), 1);

        let record = db.events().get(&a.event.id).await.unwrap().unwrap();
        assert_eq!(record.source_calendars.len(), 2);
    }

    #[tokio::test]
    async fn test_location_resolved_on_merge() {
        let (db, engine) = engine().await;
        let mut remote = remote_event("AAMk-1", None, "Choir", 10);
        remote.location = Some("Main Chapel".into());

        let merged = engine.merge("alice", "cal-1", &remote, &[]).await.unwrap();
        assert_eq!(merged.event.resolved_locations.len(), 1);
        assert_eq!(merged.event.location_display_text.as_deref(), Some("Main Chapel"));
        assert_eq!(db.locations().list_active().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_role_classification() {
        let (_db, engine) = engine_with(MergeSettings {
            registration_calendar_ids: vec!["AAMkRegs".into()],
            ..Default::default()
        })
        .await;

        assert_eq!(engine.role_for("my-calendar"), SourceRole::Primary);
        assert_eq!(engine.role_for("Youth-Group"), SourceRole::Shared);
        assert_eq!(engine.role_for("AAMkRegs"), SourceRole::Shared);
        assert!(engine.is_registration("AAMkRegs"));
        assert!(engine.is_registration("Registration-2024"));
        assert!(!engine.is_registration("Youth-Group"));
    }
}
