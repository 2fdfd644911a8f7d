//! # Location Resolver
//!
//! Maps free-text event locations onto canonical [`LocationEntity`] records.
//!
//! ## Resolution Ladder (per segment)
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  "Main Chapel; Rm FH-2"                                                │
//! │        │ split on ';'                                                   │
//! │        ▼                                                                │
//! │  segment ──normalise──► "main chapel"                                   │
//! │        │                                                                │
//! │        ├── 1. exact name / alias ─────────────► confidence 1.0          │
//! │        ├── 2. location code token (FH-2) ─────► code_confidence         │
//! │        ├── 3. fuzzy score ≥ threshold ────────► score (fuzzy/variation) │
//! │        └── 4. nothing ──► create entity ──────► confidence 1.0          │
//! │                           (match-only: no match)                        │
//! │                                                                         │
//! │  Any hit on a merged entity is followed along merged_into to the        │
//! │  final target, at most MAX_MERGE_DEPTH hops.                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Alias and variation writes are add-if-absent, so a concurrent admin
//! merge never loses entries.

use std::collections::HashSet;

use calsync_core::location::{
    best_fuzzy_match, detect_virtual_meeting, extract_location_codes, find_by_code, find_exact,
    normalize_location, split_segments, FuzzyWeights,
};
use calsync_core::{
    LocationEntity, LocationMatch, MatchType, VirtualMeeting, LOCATION_DISPLAY_SEPARATOR,
    MAX_MERGE_DEPTH,
};
use calsync_db::{LocationRepository, NewLocation};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::LocationSettings;
use crate::error::{SyncError, SyncResult};

/// Aggregate result of resolving a whole location string.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolvedLocations {
    /// Distinct entity ids, in segment order.
    pub entity_ids: Vec<String>,
    /// Entity display names, or the raw segment where nothing matched.
    pub display_text: Option<String>,
    pub virtual_meeting: Option<VirtualMeeting>,
}

/// One segment's match plus the text to show for it.
struct SegmentResolution {
    matched: LocationMatch,
    display: String,
}

/// Free-text location resolver.
#[derive(Debug, Clone)]
pub struct LocationResolver {
    repo: LocationRepository,
    settings: LocationSettings,
    weights: FuzzyWeights,
}

impl LocationResolver {
    pub fn new(repo: LocationRepository, settings: LocationSettings) -> Self {
        let weights = settings.weights();
        LocationResolver {
            repo,
            settings,
            weights,
        }
    }

    // =========================================================================
    // Event Path
    // =========================================================================

    /// Resolves an event's location text, creating entities where needed.
    ///
    /// Never fails: lookup errors degrade to passing the raw text through.
    pub async fn resolve_text(
        &self,
        location_text: Option<&str>,
        online_meeting_url: Option<&str>,
    ) -> ResolvedLocations {
        let text = location_text.map(str::trim).filter(|t| !t.is_empty());

        let Some(text) = text else {
            return ResolvedLocations {
                virtual_meeting: online_meeting_url.and_then(|url| {
                    detect_virtual_meeting(url).or_else(|| {
                        Some(VirtualMeeting {
                            platform: "Online".to_string(),
                            url: url.to_string(),
                        })
                    })
                }),
                ..Default::default()
            };
        };

        if let Some(meeting) = detect_virtual_meeting(text) {
            debug!(platform = %meeting.platform, "Location is a virtual meeting");
            return ResolvedLocations {
                entity_ids: Vec::new(),
                display_text: Some(text.to_string()),
                virtual_meeting: Some(meeting),
            };
        }

        let entities = match self.repo.list_active().await {
            Ok(entities) => entities,
            Err(e) => {
                warn!(error = %e, "Failed to load locations, passing text through");
                return ResolvedLocations {
                    display_text: Some(text.to_string()),
                    ..Default::default()
                };
            }
        };

        let mut resolved = ResolvedLocations::default();
        let mut displays = Vec::new();

        for segment in split_segments(text) {
            let display = match self.resolve_segment(segment, &entities, true).await {
                Ok(res) => {
                    if let Some(id) = res.matched.entity_id {
                        if !resolved.entity_ids.contains(&id) {
                            resolved.entity_ids.push(id);
                        }
                    }
                    res.display
                }
                Err(e) => {
                    warn!(segment, error = %e, "Location resolution failed, keeping raw text");
                    segment.to_string()
                }
            };
            if !displays.contains(&display) {
                displays.push(display);
            }
        }

        resolved.display_text = Some(displays.join(LOCATION_DISPLAY_SEPARATOR));
        resolved
    }

    /// Resolves one segment, creating an entity if nothing matches.
    pub async fn resolve(&self, text: &str) -> SyncResult<LocationMatch> {
        let entities = self.repo.list_active().await?;
        Ok(self.resolve_segment(text, &entities, true).await?.matched)
    }

    /// Matches one segment without creating or tracking anything.
    pub async fn match_only(&self, text: &str) -> SyncResult<LocationMatch> {
        let entities = self.repo.list_active().await?;
        Ok(self.resolve_segment(text, &entities, false).await?.matched)
    }

    async fn resolve_segment(
        &self,
        segment: &str,
        entities: &[LocationEntity],
        track: bool,
    ) -> SyncResult<SegmentResolution> {
        let original = segment.trim();
        let normalized = normalize_location(original);
        if normalized.is_empty() {
            return Ok(SegmentResolution {
                matched: LocationMatch::none(),
                display: original.to_string(),
            });
        }

        // 1. Exact
        let exact = match find_exact(&normalized, entities) {
            Some(entity) => Some(entity.clone()),
            None => self.repo.find_by_alias(&normalized).await?,
        };
        if let Some(entity) = exact {
            let entity = self.follow_merged(entity).await?;
            return self.hit(entity, 1.0, MatchType::Exact, original, track).await;
        }

        // 2. Location code
        let codes = extract_location_codes(original, self.settings.max_code_len);
        if let Some(entity) = find_by_code(&codes, entities) {
            let confidence = self.settings.code_confidence;
            return self.hit(entity.clone(), confidence, MatchType::Code, original, track).await;
        }

        // 3. Fuzzy
        if let Some((entity, score)) = best_fuzzy_match(
            &normalized,
            entities,
            &self.weights,
            self.settings.fuzzy_threshold,
        ) {
            let match_type = if entity.has_seen(original) {
                MatchType::Variation
            } else {
                MatchType::Fuzzy
            };
            if track {
                self.repo.record_variation(&entity.id, original).await?;
            }
            return self.hit(entity.clone(), score, match_type, original, track).await;
        }

        // 4. Create
        if !track {
            return Ok(SegmentResolution {
                matched: LocationMatch::none(),
                display: original.to_string(),
            });
        }

        let created = self
            .repo
            .create(&NewLocation {
                name: original.to_string(),
                alias: normalized,
                location_code: None,
            })
            .await?;
        let created = self.follow_merged(created).await?;
        self.hit(created, 1.0, MatchType::Created, original, track).await
    }

    async fn hit(
        &self,
        entity: LocationEntity,
        confidence: f64,
        match_type: MatchType,
        original: &str,
        track: bool,
    ) -> SyncResult<SegmentResolution> {
        if track {
            self.repo.increment_usage(&entity.id).await?;
        }
        debug!(
            segment = original,
            location_id = %entity.id,
            %match_type,
            confidence,
            "Resolved location"
        );
        Ok(SegmentResolution {
            matched: LocationMatch::matched(entity.id, confidence, match_type),
            display: entity.display_name,
        })
    }

    /// Follows `merged_into` to the surviving entity.
    async fn follow_merged(&self, entity: LocationEntity) -> SyncResult<LocationEntity> {
        let mut current = entity;
        let mut visited = HashSet::new();

        for _ in 0..=MAX_MERGE_DEPTH {
            if !current.is_merged() {
                return Ok(current);
            }
            if !visited.insert(current.id.clone()) {
                break;
            }
            let target_id = current.merged_into.clone().ok_or_else(|| {
                SyncError::LocationResolution(format!("location {} is merged without a target", current.id))
            })?;
            current = self.repo.get(&target_id).await?.ok_or_else(|| {
                SyncError::LocationResolution(format!("merge target {target_id} does not exist"))
            })?;
        }

        Err(SyncError::LocationResolution(format!(
            "merge chain from {} is cyclic or deeper than {MAX_MERGE_DEPTH}",
            current.id
        )))
    }

    // =========================================================================
    // Administration
    // =========================================================================

    /// Consolidates `source_id` into `target_id`.
    ///
    /// The target is first followed to its final survivor. Merging an
    /// entity into itself (directly or via a chain) is rejected.
    pub async fn merge_locations(&self, source_id: &str, target_id: &str) -> SyncResult<LocationEntity> {
        if source_id == target_id {
            return Err(SyncError::InvalidRequest("cannot merge a location into itself".into()));
        }

        let source = self
            .repo
            .get(source_id)
            .await?
            .ok_or_else(|| SyncError::InvalidRequest(format!("location {source_id} not found")))?;
        if source.is_merged() {
            return Err(SyncError::InvalidRequest(format!("location {source_id} is already merged")));
        }

        let target = self
            .repo
            .get(target_id)
            .await?
            .ok_or_else(|| SyncError::InvalidRequest(format!("location {target_id} not found")))?;
        let target = self.follow_merged(target).await?;
        if target.id == source.id {
            return Err(SyncError::InvalidRequest(format!(
                "merging {source_id} into {target_id} would create a cycle"
            )));
        }

        let extra: Vec<String> = [&source.name, &source.display_name]
            .into_iter()
            .map(|s| normalize_location(s))
            .collect();
        self.repo.mark_merged(&source.id, &target.id, &extra).await?;

        debug!(source_id, target_id = %target.id, "Locations merged");

        self.repo
            .get(&target.id)
            .await?
            .ok_or_else(|| SyncError::Internal(format!("merge target {} vanished", target.id)))
    }

    /// Adds a normalised alias to a location. Returns true if it was new.
    pub async fn add_alias(&self, location_id: &str, text: &str) -> SyncResult<bool> {
        let alias = normalize_location(text);
        if alias.is_empty() {
            return Err(SyncError::InvalidRequest("alias must contain letters or digits".into()));
        }
        if self.repo.get(location_id).await?.is_none() {
            return Err(SyncError::InvalidRequest(format!("location {location_id} not found")));
        }
        Ok(self.repo.add_alias(location_id, &alias).await?)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
