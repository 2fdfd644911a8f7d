//! # Sync Orchestrator
//!
//! Drives the per-calendar delta state machine and joins the results.
//!
//! ## Per-Calendar State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   ┌──────┐   ┌──────────┐   ┌────────┐   ┌─────────────┐               │
//! │   │ Idle │──►│ Fetching │──►│ Paging │──►│ Reconciling │──┐            │
//! │   └──────┘   └──────────┘   └────────┘   └─────────────┘  │            │
//! │                   ▲             ▲   continuation          │            │
//! │                   │             └─────────────────────────┤            │
//! │                   │                          final token  ▼            │
//! │          ┌────────┴──────┐                       ┌───────────┐         │
//! │          │ ErrorRecovery │◄── 410 (once) ────────│ Advancing │         │
//! │          │ reset cursor  │    from Paging        └─────┬─────┘         │
//! │          └───────────────┘                             ▼               │
//! │                                                    ┌──────┐            │
//! │   Transient / FatalAuth / second 410 ─────────────►│ Done │            │
//! │   (cursor untouched)                               └──────┘            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Fan-Out
//! Calendars run concurrently (bounded by `max_concurrent_calendars`); pages
//! within one calendar are strictly sequential. One calendar failing never
//! cancels its siblings. After the join, a `FatalAuth` on any calendar is
//! returned as `Err`; everything else lands in the [`SyncSummary`].

use std::sync::Arc;

use calsync_core::{RemoteEvent, SourceCalendar, SyncMode, TimeWindow};
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::cursor::DeltaCursorStore;
use crate::error::{RemoteError, SyncError, SyncResult};
use crate::merge::{EventMergeEngine, RemovalOutcome};
use crate::source::{CalendarSource, PageRequest};

// =============================================================================
// Request / Summary Types
// =============================================================================

/// One `sync_calendars` call.
#[derive(Debug, Clone)]
pub struct SyncRequest {
    pub owner_id: String,
    pub calendar_ids: Vec<String>,
    /// Applied client-side, full syncs only.
    pub window: Option<TimeWindow>,
    pub force_full: bool,
}

/// Where a calendar's sync currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Fetching,
    Paging,
    Reconciling,
    Advancing,
    Done,
    ErrorRecovery,
}

/// Counts for one calendar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CalendarSummary {
    pub calendar_id: String,
    pub mode: SyncMode,
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Malformed items.
    pub skipped: usize,
    /// Outside the requested window.
    pub filtered: usize,
    /// Items whose write failed.
    pub failed: usize,
    pub pages: usize,
    pub restarted_after_expiry: bool,
    pub cursor_advanced: bool,
    pub error: Option<String>,
}

impl CalendarSummary {
    fn new(calendar_id: &str, mode: SyncMode) -> Self {
        CalendarSummary {
            calendar_id: calendar_id.to_string(),
            mode,
            created: 0,
            updated: 0,
            deleted: 0,
            skipped: 0,
            filtered: 0,
            failed: 0,
            pages: 0,
            restarted_after_expiry: false,
            cursor_advanced: false,
            error: None,
        }
    }
}

/// A calendar-level failure, reported without aborting the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CalendarError {
    pub calendar_id: String,
    pub kind: String,
    pub message: String,
}

/// Result of one `sync_calendars` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    pub calendars: Vec<CalendarSummary>,
    /// Created + updated across all calendars.
    pub merged_event_count: usize,
    pub errors: Vec<CalendarError>,
}

impl SyncSummary {
    pub fn calendar(&self, calendar_id: &str) -> Option<&CalendarSummary> {
        self.calendars.iter().find(|c| c.calendar_id == calendar_id)
    }
}

struct CalendarOutcome {
    summary: CalendarSummary,
    error: Option<SyncError>,
}

/// Mutable state of one calendar's run.
struct CalendarRun<'a> {
    owner_id: &'a str,
    calendar_id: &'a str,
    phase: SyncPhase,
    summary: CalendarSummary,
}

impl<'a> CalendarRun<'a> {
    fn transition(&mut self, next: SyncPhase) {
        debug!(
            owner_id = self.owner_id,
            calendar_id = self.calendar_id,
            from = ?self.phase,
            to = ?next,
            "Sync phase transition"
        );
        self.phase = next;
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

pub struct SyncOrchestrator {
    source: Arc<dyn CalendarSource>,
    cursors: DeltaCursorStore,
    merge: EventMergeEngine,
    max_concurrent: usize,
}

impl SyncOrchestrator {
    pub fn new(
        source: Arc<dyn CalendarSource>,
        cursors: DeltaCursorStore,
        merge: EventMergeEngine,
        max_concurrent: usize,
    ) -> Self {
        SyncOrchestrator {
            source,
            cursors,
            merge,
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Syncs every requested calendar and joins the results.
    ///
    /// ## Errors
    /// `FatalAuth` for the first calendar that hit one. Sibling calendars
    /// still ran to completion and their cursors were advanced.
    pub async fn sync_calendars(&self, request: &SyncRequest) -> SyncResult<SyncSummary> {
        let owner_id = request.owner_id.as_str();
        info!(
            owner_id,
            calendars = request.calendar_ids.len(),
            force_full = request.force_full,
            "Sync starting"
        );

        let known: Vec<SourceCalendar> = request
            .calendar_ids
            .iter()
            .map(|c| self.merge.source_for(c))
            .collect();

        let outcomes: Vec<CalendarOutcome> = stream::iter(request.calendar_ids.iter())
            .map(|calendar_id| {
                self.sync_calendar(
                    owner_id,
                    calendar_id,
                    request.window.as_ref(),
                    request.force_full,
                    &known,
                )
            })
            .buffered(self.max_concurrent)
            .collect()
            .await;

        let mut summary = SyncSummary::default();
        let mut fatal = None;

        for outcome in outcomes {
            summary.merged_event_count += outcome.summary.created + outcome.summary.updated;
            if let Some(err) = outcome.error {
                summary.errors.push(CalendarError {
                    calendar_id: outcome.summary.calendar_id.clone(),
                    kind: err.kind().to_string(),
                    message: err.to_string(),
                });
                if err.is_fatal() && fatal.is_none() {
                    fatal = Some(err);
                }
            }
            summary.calendars.push(outcome.summary);
        }

        if let Some(err) = fatal {
            return Err(err);
        }

        info!(
            owner_id,
            merged = summary.merged_event_count,
            errors = summary.errors.len(),
            "Sync finished"
        );
        Ok(summary)
    }

    async fn sync_calendar(
        &self,
        owner_id: &str,
        calendar_id: &str,
        window: Option<&TimeWindow>,
        force_full: bool,
        known: &[SourceCalendar],
    ) -> CalendarOutcome {
        let cursor = self.cursors.get(owner_id, calendar_id).await;
        let mut mode = cursor.sync_mode(force_full);
        let mut run = CalendarRun {
            owner_id,
            calendar_id,
            phase: SyncPhase::Idle,
            summary: CalendarSummary::new(calendar_id, mode),
        };

        info!(owner_id, calendar_id, %mode, "Calendar sync starting");

        loop {
            run.transition(SyncPhase::Fetching);
            let first = match (mode, cursor.cursor_token.as_deref()) {
                (SyncMode::Incremental, Some(token)) => PageRequest::Delta(token.to_string()),
                _ => PageRequest::Full,
            };

            match self.page_loop(&mut run, first, window, known).await {
                Ok(token) => {
                    run.transition(SyncPhase::Advancing);
                    run.summary.cursor_advanced =
                        self.cursors.advance(owner_id, calendar_id, &token).await;
                    run.transition(SyncPhase::Done);

                    let s = &run.summary;
                    info!(
                        owner_id,
                        calendar_id,
                        mode = %s.mode,
                        created = s.created,
                        updated = s.updated,
                        deleted = s.deleted,
                        skipped = s.skipped,
                        filtered = s.filtered,
                        pages = s.pages,
                        "Calendar sync finished"
                    );
                    return CalendarOutcome {
                        summary: run.summary,
                        error: None,
                    };
                }
                Err(RemoteError::CursorExpired) if !run.summary.restarted_after_expiry => {
                    run.transition(SyncPhase::ErrorRecovery);
                    warn!(owner_id, calendar_id, "Delta cursor expired, restarting as full sync");
                    self.cursors.reset(owner_id, calendar_id).await;
                    run.summary.restarted_after_expiry = true;
                    mode = SyncMode::Full;
                    run.summary.mode = mode;
                }
                Err(remote) => {
                    let err = SyncError::from_remote(calendar_id, remote);
                    if err.is_fatal() {
                        error!(owner_id, calendar_id, error = %err, "Calendar sync aborted");
                    } else {
                        warn!(owner_id, calendar_id, error = %err, "Calendar sync failed, cursor kept");
                    }
                    run.summary.error = Some(err.to_string());
                    run.transition(SyncPhase::Done);
                    return CalendarOutcome {
                        summary: run.summary,
                        error: Some(err),
                    };
                }
            }
        }
    }

    /// Fetches and reconciles pages until the final delta token.
    async fn page_loop(
        &self,
        run: &mut CalendarRun<'_>,
        mut request: PageRequest,
        window: Option<&TimeWindow>,
        known: &[SourceCalendar],
    ) -> Result<String, RemoteError> {
        loop {
            run.transition(SyncPhase::Paging);
            let page = self
                .source
                .fetch_page(run.owner_id, run.calendar_id, request)
                .await?;
            run.summary.pages += 1;

            debug!(
                owner_id = run.owner_id,
                calendar_id = run.calendar_id,
                page = run.summary.pages,
                items = page.items.len(),
                "Received delta page"
            );

            run.transition(SyncPhase::Reconciling);
            for item in &page.items {
                self.reconcile(run, item, window, known).await;
            }

            match (page.continuation, page.new_delta_token) {
                (Some(next), _) => request = PageRequest::Next(next),
                (None, Some(token)) => return Ok(token),
                (None, None) => {
                    return Err(RemoteError::transient("final delta page carried no delta token"))
                }
            }
        }
    }

    /// Applies one change record. Never fails; outcomes are counted.
    async fn reconcile(
        &self,
        run: &mut CalendarRun<'_>,
        item: &RemoteEvent,
        window: Option<&TimeWindow>,
        known: &[SourceCalendar],
    ) {
        let owner_id = run.owner_id;
        let calendar_id = run.calendar_id;

        if item.removed {
            match self.merge.remove(owner_id, calendar_id, &item.id).await {
                Ok(RemovalOutcome::Deleted) => run.summary.deleted += 1,
                // Still carried by another calendar
                Ok(RemovalOutcome::Detached) => run.summary.updated += 1,
                Ok(RemovalOutcome::NotFound) => debug!(
                    owner_id,
                    calendar_id,
                    remote_id = %item.id,
                    "Removal for an unknown or already deleted event"
                ),
                Err(e) => {
                    run.summary.failed += 1;
                    warn!(owner_id, calendar_id, remote_id = %item.id, error = %e, "Removal failed");
                }
            }
            return;
        }

        if run.summary.mode == SyncMode::Full {
            if let (Some(window), Ok((start, end))) = (window, item.time_range()) {
                if !window.overlaps(start, end) {
                    run.summary.filtered += 1;
                    return;
                }
            }
        }

        match self.merge.merge(owner_id, calendar_id, item, known).await {
            Ok(outcome) if outcome.created => run.summary.created += 1,
            Ok(_) => run.summary.updated += 1,
            Err(e @ SyncError::MalformedEvent { .. }) => {
                run.summary.skipped += 1;
                warn!(owner_id, calendar_id, remote_id = %item.id, error = %e, "Skipping malformed event");
            }
            Err(e) => {
                run.summary.failed += 1;
                warn!(owner_id, calendar_id, remote_id = %item.id, error = %e, "Event merge failed");
            }
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LocationSettings, MergeSettings};
    use crate::location::LocationResolver;
    use crate::source::DeltaPage;
    use crate::testing::{remote_event, ScriptedSource};
    use calsync_core::RemoteDateTime;
    use calsync_db::Database;
    use chrono::{TimeZone, Utc};

    fn orchestrator(db: &Database, source: Arc<ScriptedSource>) -> SyncOrchestrator {
        let resolver = LocationResolver::new(db.locations(), LocationSettings::default());
        let merge = EventMergeEngine::new(db.events(), resolver, MergeSettings::default());
        SyncOrchestrator::new(
            source,
            DeltaCursorStore::new(db.cursors()),
            merge,
            4,
        )
    }

    fn request(calendars: &[&str]) -> SyncRequest {
        SyncRequest {
            owner_id: "alice".to_string(),
            calendar_ids: calendars.iter().map(|c| c.to_string()).collect(),
            window: None,
            force_full: false,
        }
    }

    #[tokio::test]
    async fn test_full_sync_scenario() {
        let db = Database::in_memory().await.unwrap();
        let source = Arc::new(ScriptedSource::new());
        source
            .push("cal-1", Ok(DeltaPage::more(vec![remote_event("e1", None, "One", 9)], "next-1")))
            .push(
                "cal-1",
                Ok(DeltaPage::last(
                    vec![remote_event("e2", None, "Two", 10), RemoteEvent::tombstone("gone")],
                    "tok-final",
                )),
            );

        let summary = orchestrator(&db, source.clone())
            .sync_calendars(&request(&["cal-1"]))
            .await
            .unwrap();

        let cal = summary.calendar("cal-1").unwrap();
        assert_eq!(cal.mode, SyncMode::Full);
        assert_eq!((cal.created, cal.updated, cal.deleted), (2, 0, 0));
        assert_eq!(cal.pages, 2);
        assert!(cal.cursor_advanced);
        assert_eq!(summary.merged_event_count, 2);
        assert!(summary.errors.is_empty());

        assert_eq!(
            source.requests_for("cal-1"),
            vec![PageRequest::Full, PageRequest::Next("next-1".into())]
        );
        let cursor = db.cursors().get("alice", "cal-1").await.unwrap().unwrap();
        assert_eq!(cursor.cursor_token.as_deref(), Some("tok-final"));
    }

    #[tokio::test]
    async fn test_cursor_expiry_restarts_once() {
        let db = Database::in_memory().await.unwrap();
        db.cursors().advance("alice", "cal-1", "stale", Utc::now()).await.unwrap();

        let source = Arc::new(ScriptedSource::new());
        source
            .push("cal-1", Err(RemoteError::CursorExpired))
            .push("cal-1", Ok(DeltaPage::last(vec![remote_event("e1", None, "One", 9)], "fresh")));

        let summary = orchestrator(&db, source.clone())
            .sync_calendars(&request(&["cal-1"]))
            .await
            .unwrap();

        let cal = summary.calendar("cal-1").unwrap();
        assert!(cal.restarted_after_expiry);
        assert_eq!(cal.mode, SyncMode::Full);
        assert_eq!(cal.created, 1);
        assert!(summary.errors.is_empty());
        assert_eq!(
            source.requests_for("cal-1"),
            vec![PageRequest::Delta("stale".into()), PageRequest::Full]
        );

        let cursor = db.cursors().get("alice", "cal-1").await.unwrap().unwrap();
        assert_eq!(cursor.cursor_token.as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn test_repeated_expiry_is_bounded() {
        let db = Database::in_memory().await.unwrap();
        db.cursors().advance("alice", "cal-1", "stale", Utc::now()).await.unwrap();

        let source = Arc::new(ScriptedSource::new());
        source
            .push("cal-1", Err(RemoteError::CursorExpired))
            .push("cal-1", Err(RemoteError::CursorExpired))
            .push("cal-1", Ok(DeltaPage::last(vec![], "never-reached")));

        let summary = orchestrator(&db, source.clone())
            .sync_calendars(&request(&["cal-1"]))
            .await
            .unwrap();

        assert_eq!(source.requests_for("cal-1").len(), 2);
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(summary.errors[0].kind, "cursor_expired");

        let cursor = db.cursors().get("alice", "cal-1").await.unwrap().unwrap();
        assert!(cursor.full_sync_required);
        assert!(cursor.cursor_token.is_none());
    }

    #[tokio::test]
    async fn test_transient_failure_keeps_cursor() {
        let db = Database::in_memory().await.unwrap();
        db.cursors().advance("alice", "cal-1", "tok-1", Utc::now()).await.unwrap();

        let source = Arc::new(ScriptedSource::new());
        source
            .push("cal-1", Ok(DeltaPage::more(vec![remote_event("e1", None, "One", 9)], "n")))
            .push(
                "cal-1",
                Err(RemoteError::Transient {
                    status: Some(503),
                    message: "unavailable".into(),
                }),
            );

        let summary = orchestrator(&db, source)
            .sync_calendars(&request(&["cal-1"]))
            .await
            .unwrap();

        let cal = summary.calendar("cal-1").unwrap();
        assert_eq!(cal.mode, SyncMode::Incremental);
        assert_eq!(cal.created, 1);
        assert!(!cal.cursor_advanced);
        assert!(cal.error.is_some());
        assert_eq!(summary.errors[0].kind, "transient_remote_failure");

        let cursor = db.cursors().get("alice", "cal-1").await.unwrap().unwrap();
        assert_eq!(cursor.cursor_token.as_deref(), Some("tok-1"));
    }

    #[tokio::test]
    async fn test_fatal_auth_propagates_without_cancelling_siblings() {
        let db = Database::in_memory().await.unwrap();
        let source = Arc::new(ScriptedSource::new());
        source
            .push(
                "cal-a",
                Err(RemoteError::FatalAuth {
                    status: 403,
                    message: "forbidden".into(),
                }),
            )
            .push("cal-b", Ok(DeltaPage::last(vec![remote_event("e1", None, "One", 9)], "tok-b")));

        let err = orchestrator(&db, source)
            .sync_calendars(&request(&["cal-a", "cal-b"]))
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::FatalAuth { ref calendar_id, .. } if calendar_id == "cal-a"));
        assert!(db.cursors().get("alice", "cal-a").await.unwrap().is_none());
        let sibling = db.cursors().get("alice", "cal-b").await.unwrap().unwrap();
        assert_eq!(sibling.cursor_token.as_deref(), Some("tok-b"));
        assert_eq!(db.events().count_active("alice").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_window_filters_full_sync_only() {
        let db = Database::in_memory().await.unwrap();
        let source = Arc::new(ScriptedSource::new());
        source
            .push(
                "cal-1",
                Ok(DeltaPage::last(
                    vec![remote_event("inside", None, "In", 9), {
                        let mut far = remote_event("outside", None, "Out", 9);
                        far.start = Some(RemoteDateTime::utc("2025-01-01T09:00:00"));
                        far.end = Some(RemoteDateTime::utc("2025-01-01T10:00:00"));
                        far
                    }],
                    "tok-1",
                )),
            )
            .push(
                "cal-1",
                Ok(DeltaPage::last(
                    vec![{
                        let mut far = remote_event("later", None, "Later", 9);
                        far.start = Some(RemoteDateTime::utc("2025-01-01T09:00:00"));
                        far.end = Some(RemoteDateTime::utc("2025-01-01T10:00:00"));
                        far
                    }],
                    "tok-2",
                )),
            );

        let window = TimeWindow::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap(),
        )
        .unwrap();
        let mut req = request(&["cal-1"]);
        req.window = Some(window);

        let orchestrator = orchestrator(&db, source);
        let first = orchestrator.sync_calendars(&req).await.unwrap();
        let cal = first.calendar("cal-1").unwrap();
        assert_eq!((cal.created, cal.filtered), (1, 1));

        let second = orchestrator.sync_calendars(&req).await.unwrap();
        let cal = second.calendar("cal-1").unwrap();
        assert_eq!(cal.mode, SyncMode::Incremental);
        assert_eq!((cal.created, cal.filtered), (1, 0));
    }

    #[tokio::test]
    async fn test_malformed_item_skipped_page_continues() {
        let db = Database::in_memory().await.unwrap();
        let mut broken = remote_event("broken", None, "Broken", 9);
        broken.end = None;

        let source = Arc::new(ScriptedSource::new());
        source.push(
            "cal-1",
            Ok(DeltaPage::last(vec![broken, remote_event("ok", None, "Fine", 10)], "tok")),
        );

        let summary = orchestrator(&db, source)
            .sync_calendars(&request(&["cal-1"]))
            .await
            .unwrap();

        let cal = summary.calendar("cal-1").unwrap();
        assert_eq!((cal.skipped, cal.created), (1, 1));
        assert!(cal.cursor_advanced);
    }

    #[tokio::test]
    async fn test_removed_item_soft_deletes_existing() {
        let db = Database::in_memory().await.unwrap();
        let source = Arc::new(ScriptedSource::new());
        source
            .push("cal-1", Ok(DeltaPage::last(vec![remote_event("e1", None, "One", 9)], "tok-1")))
            .push("cal-1", Ok(DeltaPage::last(vec![RemoteEvent::tombstone("e1")], "tok-2")))
            .push("cal-1", Ok(DeltaPage::last(vec![RemoteEvent::tombstone("e1")], "tok-3")));

        let orchestrator = orchestrator(&db, source);
        orchestrator.sync_calendars(&request(&["cal-1"])).await.unwrap();

        let second = orchestrator.sync_calendars(&request(&["cal-1"])).await.unwrap();
        assert_eq!(second.calendar("cal-1").unwrap().deleted, 1);

        let third = orchestrator.sync_calendars(&request(&["cal-1"])).await.unwrap();
        assert_eq!(third.calendar("cal-1").unwrap().deleted, 0);
        assert_eq!(db.events().count_active("alice").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_calendars_sharing_an_event_merge_into_one_record() {
        let db = Database::in_memory().await.unwrap();
        let source = Arc::new(ScriptedSource::new());
        source
            .push("cal-1", Ok(DeltaPage::last(vec![remote_event("A", Some("uid-1"), "Retreat", 9)], "tok-1")))
            .push(
                "shared-cal",
                Ok(DeltaPage::last(vec![remote_event("C", Some("uid-1"), "Retreat", 9)], "tok-s")),
            );

        let summary = orchestrator(&db, source)
            .sync_calendars(&request(&["cal-1", "shared-cal"]))
            .await
            .unwrap();

        for calendar_id in ["cal-1", "shared-cal"] {
            let cal = summary.calendar(calendar_id).unwrap();
            assert_eq!(cal.failed, 0, "{calendar_id}");
            assert_eq!(cal.created + cal.updated, 1, "{calendar_id}");
        }
        assert_eq!(db.events().count_active("alice").await.unwrap(), 1);

        let record = db
            .events()
            .find_existing("alice", Some("uid-1"), "A")
            .await
            .unwrap()
            .unwrap();
        let mut calendars: Vec<_> = record.source_calendars.iter().map(|s| s.calendar_id.as_str()).collect();
        calendars.sort_unstable();
        assert_eq!(calendars, vec!["cal-1", "shared-cal"]);
    }

    /// Syncs A on cal-1 and then C (same uid) on shared-cal.
    async fn shared_event(db: &Database, source: &Arc<ScriptedSource>) -> SyncOrchestrator {
        source
            .push("cal-1", Ok(DeltaPage::last(vec![remote_event("A", Some("uid-1"), "Retreat", 9)], "tok-1")))
            .push(
                "shared-cal",
                Ok(DeltaPage::last(vec![remote_event("C", Some("uid-1"), "Retreat", 9)], "tok-s")),
            );
        let orchestrator = orchestrator(db, source.clone());
        orchestrator.sync_calendars(&request(&["cal-1"])).await.unwrap();
        orchestrator.sync_calendars(&request(&["shared-cal"])).await.unwrap();
        orchestrator
    }

    #[tokio::test]
    async fn test_removal_on_primary_calendar_keeps_shared_copy() {
        let db = Database::in_memory().await.unwrap();
        let source = Arc::new(ScriptedSource::new());
        let orchestrator = shared_event(&db, &source).await;

        source.push("cal-1", Ok(DeltaPage::last(vec![RemoteEvent::tombstone("A")], "tok-2")));
        let summary = orchestrator.sync_calendars(&request(&["cal-1"])).await.unwrap();
        let cal = summary.calendar("cal-1").unwrap();
        assert_eq!((cal.deleted, cal.updated), (0, 1));

        let record = db
            .events()
            .find_existing("alice", Some("uid-1"), "C")
            .await
            .unwrap()
            .unwrap();
        assert!(!record.is_deleted);
        assert_eq!(record.primary_calendar_id, "shared-cal");
        assert_eq!(record.remote_id, "C");
        assert_eq!(record.source_calendars.len(), 1);

        source.push("shared-cal", Ok(DeltaPage::last(vec![RemoteEvent::tombstone("C")], "tok-s2")));
        let summary = orchestrator.sync_calendars(&request(&["shared-cal"])).await.unwrap();
        assert_eq!(summary.calendar("shared-cal").unwrap().deleted, 1);
        assert_eq!(db.events().count_active("alice").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_removal_on_shared_calendar_keeps_primary_copy() {
        let db = Database::in_memory().await.unwrap();
        let source = Arc::new(ScriptedSource::new());
        let orchestrator = shared_event(&db, &source).await;

        source.push("shared-cal", Ok(DeltaPage::last(vec![RemoteEvent::tombstone("C")], "tok-s2")));
        let summary = orchestrator.sync_calendars(&request(&["shared-cal"])).await.unwrap();
        let cal = summary.calendar("shared-cal").unwrap();
        assert_eq!((cal.deleted, cal.updated), (0, 1));

        let record = db
            .events()
            .find_existing("alice", Some("uid-1"), "A")
            .await
            .unwrap()
            .unwrap();
        assert!(!record.is_deleted);
        assert_eq!(record.primary_calendar_id, "cal-1");
        assert_eq!(record.remote_id, "A");
        let calendars: Vec<_> = record.source_calendars.iter().map(|s| s.calendar_id.as_str()).collect();
        assert_eq!(calendars, vec!["cal-1"]);
    }
}
