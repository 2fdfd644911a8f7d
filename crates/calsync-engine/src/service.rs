//! # Calendar Sync Service
//!
//! The facade the route layer (and the `calsync` binary) calls into. Every
//! entry point validates its input first and then delegates to one of the
//! engine components.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      CalendarSyncService (Clone)                        │
//! │                                                                         │
//! │   sync_calendars ──────► SyncOrchestrator ──► EventMergeEngine          │
//! │   reset_cursor ────────► DeltaCursorStore                               │
//! │   resolve_location ────► LocationResolver (match only)                  │
//! │   merge_locations ─────► LocationResolver                               │
//! │   bulk_load ───────────► BulkPersistenceLayer                           │
//! │   queue_cache_warm ────► tokio::spawn(bulk_load)                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use calsync_core::validation::{
    validate_batch_size, validate_calendar_id, validate_calendar_ids, validate_owner_id,
};
use calsync_core::{LocationEntity, LocationMatch, RemoteEvent, TimeWindow, UnifiedEvent};
use calsync_db::{Database, EventRepository};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::bulk::{BulkLoadResult, BulkPersistenceLayer};
use crate::config::CalSyncConfig;
use crate::cursor::DeltaCursorStore;
use crate::error::{SyncError, SyncResult};
use crate::location::LocationResolver;
use crate::merge::EventMergeEngine;
use crate::orchestrator::{SyncOrchestrator, SyncRequest, SyncSummary};
use crate::source::CalendarSource;

struct Inner {
    config: CalSyncConfig,
    orchestrator: SyncOrchestrator,
    cursors: DeltaCursorStore,
    resolver: LocationResolver,
    bulk: BulkPersistenceLayer,
    events: EventRepository,
}

/// Cheaply cloneable handle over the whole engine.
#[derive(Clone)]
pub struct CalendarSyncService {
    inner: Arc<Inner>,
}

impl CalendarSyncService {
    pub fn new(config: CalSyncConfig, db: &Database, source: Arc<dyn CalendarSource>) -> Self {
        let resolver = LocationResolver::new(db.locations(), config.location.clone());
        let merge = EventMergeEngine::new(db.events(), resolver.clone(), config.merge.clone());
        let cursors = DeltaCursorStore::new(db.cursors());
        let orchestrator = SyncOrchestrator::new(
            source,
            cursors.clone(),
            merge,
            config.sync.max_concurrent_calendars,
        );

        CalendarSyncService {
            inner: Arc::new(Inner {
                orchestrator,
                cursors,
                resolver,
                bulk: BulkPersistenceLayer::new(db.events(), db.locations()),
                events: db.events(),
                config,
            }),
        }
    }

    pub fn config(&self) -> &CalSyncConfig {
        &self.inner.config
    }

    // =========================================================================
    // Sync
    // =========================================================================

    /// Syncs the given calendars of one owner.
    ///
    /// ## Errors
    /// `InvalidRequest` before any remote call; `FatalAuth` after all
    /// calendars ran if any of them was rejected.
    pub async fn sync_calendars(
        &self,
        owner_id: &str,
        calendar_ids: Vec<String>,
        window: Option<TimeWindow>,
        force_full: bool,
    ) -> SyncResult<SyncSummary> {
        validate_owner_id(owner_id)?;
        validate_calendar_ids(&calendar_ids)?;

        let request = SyncRequest {
            owner_id: owner_id.to_string(),
            calendar_ids,
            window,
            force_full,
        };
        self.inner.orchestrator.sync_calendars(&request).await
    }

    /// Forces the next sync of a calendar to be a full one.
    pub async fn reset_cursor(&self, owner_id: &str, calendar_id: &str) -> SyncResult<()> {
        validate_owner_id(owner_id)?;
        validate_calendar_id(calendar_id)?;

        if !self.inner.cursors.reset(owner_id, calendar_id).await {
            return Err(SyncError::Internal(format!(
                "cursor reset for {calendar_id} was not persisted"
            )));
        }
        info!(owner_id, calendar_id, "Cursor reset on request");
        Ok(())
    }

    // =========================================================================
    // Locations
    // =========================================================================

    /// Matches free text against the location catalogue without side effects.
    pub async fn resolve_location(&self, text: &str) -> SyncResult<LocationMatch> {
        self.inner.resolver.match_only(text).await
    }

    pub async fn merge_locations(&self, source_id: &str, target_id: &str) -> SyncResult<LocationEntity> {
        self.inner.resolver.merge_locations(source_id, target_id).await
    }

    pub async fn add_location_alias(&self, location_id: &str, text: &str) -> SyncResult<bool> {
        self.inner.resolver.add_alias(location_id, text).await
    }

    // =========================================================================
    // Bulk
    // =========================================================================

    pub async fn bulk_load(&self, owner_id: &str, events: &[RemoteEvent]) -> SyncResult<BulkLoadResult> {
        validate_owner_id(owner_id)?;
        validate_batch_size(events.len(), self.inner.config.bulk.max_batch_size)?;
        self.inner.bulk.bulk_load(owner_id, events).await
    }

    /// Runs a bulk load on a background task.
    ///
    /// The outcome is logged, never propagated.
    pub fn queue_cache_warm(&self, owner_id: impl Into<String>, events: Vec<RemoteEvent>) -> JoinHandle<()> {
        let service = self.clone();
        let owner_id = owner_id.into();

        tokio::spawn(async move {
            match service.bulk_load(&owner_id, &events).await {
                Ok(result) => info!(
                    owner_id = %owner_id,
                    persisted = result.persisted_count,
                    skipped = result.skipped.len(),
                    "Cache warm finished"
                ),
                Err(e) => warn!(owner_id = %owner_id, error = %e, "Cache warm failed"),
            }
        })
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn events_in_window(&self, owner_id: &str, window: &TimeWindow) -> SyncResult<Vec<UnifiedEvent>> {
        validate_owner_id(owner_id)?;
        Ok(self.inner.events.list_in_window(owner_id, window).await?)
    }

    pub async fn active_event_count(&self, owner_id: &str) -> SyncResult<i64> {
        validate_owner_id(owner_id)?;
        Ok(self.inner.events.count_active(owner_id).await?)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
