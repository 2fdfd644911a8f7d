//! # Bulk Persistence Layer
//!
//! Cache-warming path for reloading a large batch of remote events in one go.
//!
//! ## Query Plan
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   N remote events                                                       │
//! │        │                                                                │
//! │        ├── 1. find_by_remote_ids(all ids)        ──► live identities    │
//! │        ├── 2. find_by_aliases(all segments)      ──► location hits      │
//! │        │                                                                │
//! │        ▼                                                                │
//! │   build N SnapshotUpdates in memory (no per-event queries)              │
//! │        │                                                                │
//! │        ├── 3. bulk_update_snapshots (one transaction, update-only,      │
//! │        │      rows with a newer stored snapshot left alone)             │
//! │        └── 4. storage_ids_for(persisted ids)                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! This path never creates events and never touches enrichment or source
//! calendars; brand-new events are left to the per-event merge path.

use std::collections::{HashMap, HashSet};

use calsync_core::location::{detect_virtual_meeting, normalize_location, split_segments};
use calsync_core::{
    LocationEntity, RemoteEvent, RemoteSnapshot, VirtualMeeting, LOCATION_DISPLAY_SEPARATOR,
};
use calsync_db::{EventRepository, LocationRepository, SnapshotUpdate};
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::SyncResult;

/// An input event that was not written, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedEvent {
    pub remote_id: String,
    pub reason: String,
}

/// Outcome of one bulk load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BulkLoadResult {
    pub persisted_count: u64,
    /// Storage ids of the rows that were written.
    pub storage_ids: Vec<String>,
    pub skipped: Vec<SkippedEvent>,
}

#[derive(Debug, Clone)]
pub struct BulkPersistenceLayer {
    events: EventRepository,
    locations: LocationRepository,
}

impl BulkPersistenceLayer {
    pub fn new(events: EventRepository, locations: LocationRepository) -> Self {
        BulkPersistenceLayer { events, locations }
    }

    /// Writes remote-derived fields for every already-mirrored event.
    ///
    /// Removed items, items without a usable time range, items with no
    /// existing record and items older than the stored copy are reported in
    /// `skipped`.
    pub async fn bulk_load(&self, owner_id: &str, batch: &[RemoteEvent]) -> SyncResult<BulkLoadResult> {
        let mut result = BulkLoadResult::default();
        let mut candidates: Vec<(&RemoteEvent, RemoteSnapshot)> = Vec::with_capacity(batch.len());

        for item in batch {
            if item.removed {
                result.skipped.push(skip(&item.id, "removed upstream"));
                continue;
            }
            match RemoteSnapshot::from_remote(item) {
                Ok(snapshot) => candidates.push((item, snapshot)),
                Err(e) => result.skipped.push(skip(&item.id, &e.to_string())),
            }
        }

        if candidates.is_empty() {
            return Ok(result);
        }

        let remote_ids: Vec<String> = candidates.iter().map(|(item, _)| item.id.clone()).collect();
        let identities = self.events.find_by_remote_ids(owner_id, &remote_ids).await?;

        let aliases = batch_aliases(candidates.iter().map(|(_, s)| s.location_text.as_deref()));
        let hits = self.locations.find_by_aliases(&aliases).await?;

        debug!(
            owner_id,
            candidates = candidates.len(),
            existing = identities.len(),
            aliases = aliases.len(),
            location_hits = hits.len(),
            "Bulk batch pre-resolved"
        );

        let mut updates = Vec::with_capacity(candidates.len());
        for (item, snapshot) in candidates {
            if !identities.contains_key(&item.id) {
                result.skipped.push(skip(&item.id, "no existing record"));
                continue;
            }
            let (resolved_locations, location_display_text, virtual_meeting) =
                locations_for(snapshot.location_text.as_deref(), item.online_meeting_url.as_deref(), &hits);
            updates.push(SnapshotUpdate {
                remote_id: item.id.clone(),
                snapshot,
                resolved_locations,
                location_display_text,
                virtual_meeting,
            });
        }

        if updates.is_empty() {
            return Ok(result);
        }

        let written = self
            .events
            .bulk_update_snapshots(owner_id, &updates, Utc::now())
            .await?;
        for update in updates.iter().filter(|u| !written.contains(&u.remote_id)) {
            result.skipped.push(skip(&update.remote_id, "stored snapshot is newer"));
        }

        result.persisted_count = written.len() as u64;
        result.storage_ids = self.events.storage_ids_for(owner_id, &written).await?;

        info!(
            owner_id,
            persisted = result.persisted_count,
            skipped = result.skipped.len(),
            "Bulk load committed"
        );
        Ok(result)
    }
}

fn skip(remote_id: &str, reason: &str) -> SkippedEvent {
    SkippedEvent {
        remote_id: remote_id.to_string(),
        reason: reason.to_string(),
    }
}

/// Distinct normalised segments across the batch, virtual texts excluded.
fn batch_aliases<'a>(texts: impl Iterator<Item = Option<&'a str>>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut aliases = Vec::new();
    for text in texts.flatten() {
        if detect_virtual_meeting(text).is_some() {
            continue;
        }
        for segment in split_segments(text) {
            let alias = normalize_location(segment);
            if !alias.is_empty() && seen.insert(alias.clone()) {
                aliases.push(alias);
            }
        }
    }
    aliases
}

/// Resolves one event's location from the pre-fetched alias hits.
///
/// A hit on a merged entity points at its `merged_into` target.
fn locations_for(
    text: Option<&str>,
    online_meeting_url: Option<&str>,
    hits: &HashMap<String, LocationEntity>,
) -> (Vec<String>, Option<String>, Option<VirtualMeeting>) {
    let Some(text) = text else {
        let meeting = online_meeting_url.map(|url| {
            detect_virtual_meeting(url).unwrap_or_else(|| VirtualMeeting {
                platform: "Online".to_string(),
                url: url.to_string(),
            })
        });
        return (Vec::new(), None, meeting);
    };

    if let Some(meeting) = detect_virtual_meeting(text) {
        return (Vec::new(), Some(text.to_string()), Some(meeting));
    }

    let mut ids = Vec::new();
    let mut displays: Vec<String> = Vec::new();
    for segment in split_segments(text) {
        let display = match hits.get(&normalize_location(segment)) {
            Some(entity) => {
                let id = entity.merged_into.clone().unwrap_or_else(|| entity.id.clone());
                if !ids.contains(&id) {
                    ids.push(id);
                }
                entity.display_name.clone()
            }
            None => segment.to_string(),
        };
        if !displays.contains(&display) {
            displays.push(display);
        }
    }

    (ids, Some(displays.join(LOCATION_DISPLAY_SEPARATOR)), None)
}

// =============================================================================
// Unit Tests
// =============================================================================
