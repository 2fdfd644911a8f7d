//! # Location Matching
//!
//! Pure text functions behind the location resolver: normalisation, segment
//! splitting, location-code extraction, fuzzy similarity, and virtual-meeting
//! detection. The engine's `LocationResolver` feeds these with entities it
//! loaded from storage.
//!
//! ## Resolution Ladder
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     One Location Segment                                │
//! │                                                                         │
//! │  "Fellowship  Hal!"                                                    │
//! │       │ normalize_location                                              │
//! │       ▼                                                                 │
//! │  "fellowship hal"                                                      │
//! │       │                                                                 │
//! │       ├── find_exact      name / display name / alias   → 1.00         │
//! │       ├── find_by_code    "FH" token == location_code   → 0.95         │
//! │       └── best_fuzzy      edit distance + bonuses       → score        │
//! │                           accepted when score ≥ threshold              │
//! │                                                                         │
//! │  Merged entities never take part in matching.                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Fuzzy Score
//! ```text
//! score = 1 − edit_distance / max(len_a, len_b)
//!       + containment_bonus            (one string contains the other)
//!       + first_word_bonus             (first words equal)
//!       + shared_word_weight × shared  (fraction of words longer than 3 chars)
//! capped at 1.0
//! ```

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::types::{LocationEntity, VirtualMeeting};
use crate::LOCATION_SEGMENT_DELIMITER;

// =============================================================================
// Normalisation
// =============================================================================

/// Lower-cases, strips punctuation except hyphens, collapses whitespace.
///
/// ## Example
/// ```rust
/// use calsync_core::location::normalize_location;
///
/// assert_eq!(normalize_location("St. Mary's  Hall"), "st marys hall");
/// assert_eq!(normalize_location("Room 101-A"), "room 101-a");
/// ```
pub fn normalize_location(text: &str) -> String {
    let stripped: String = text
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == '-')
        .flat_map(char::to_lowercase)
        .collect();

    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Splits a multi-location string into trimmed, non-empty segments.
pub fn split_segments(text: &str) -> Vec<&str> {
    text.split(LOCATION_SEGMENT_DELIMITER)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

// =============================================================================
// Codes
// =============================================================================

/// Extracts short all-caps tokens (e.g. `FH`, `B12`) from the original text.
///
/// A code is 2..=`max_len` characters of ASCII upper-case letters and digits
/// with at least one letter.
pub fn extract_location_codes(text: &str, max_len: usize) -> Vec<String> {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|token| {
            (2..=max_len).contains(&token.len())
                && token
                    .chars()
                    .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
                && token.chars().any(|c| c.is_ascii_uppercase())
        })
        .map(str::to_string)
        .collect()
}

// =============================================================================
// Similarity
// =============================================================================

/// Bonus weights for the fuzzy score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FuzzyWeights {
    pub containment_bonus: f64,
    pub first_word_bonus: f64,
    pub shared_word_weight: f64,
}

impl Default for FuzzyWeights {
    fn default() -> Self {
        FuzzyWeights {
            containment_bonus: 0.2,
            first_word_bonus: 0.1,
            shared_word_weight: 0.1,
        }
    }
}

/// Levenshtein distance over Unicode scalar values.
pub fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

/// Scores two already-normalised strings in `[0.0, 1.0]`.
pub fn similarity(a: &str, b: &str, weights: &FuzzyWeights) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let max_len = a.chars().count().max(b.chars().count());
    let mut score = 1.0 - edit_distance(a, b) as f64 / max_len as f64;

    if a.contains(b) || b.contains(a) {
        score += weights.containment_bonus;
    }

    if a.split(' ').next() == b.split(' ').next() {
        score += weights.first_word_bonus;
    }

    let significant = |s: &str| -> HashSet<String> {
        s.split(' ')
            .filter(|w| w.chars().count() > 3)
            .map(str::to_string)
            .collect()
    };
    let words_a = significant(a);
    let words_b = significant(b);
    let denominator = words_a.len().max(words_b.len());
    if denominator > 0 {
        let shared = words_a.intersection(&words_b).count();
        score += weights.shared_word_weight * (shared as f64 / denominator as f64);
    }

    score.min(1.0)
}

// =============================================================================
// Candidate Search
// =============================================================================

fn matchable(entities: &[LocationEntity]) -> impl Iterator<Item = &LocationEntity> {
    entities.iter().filter(|e| !e.is_merged())
}

/// Finds a non-merged entity whose name, display name, or alias equals the
/// normalised text.
pub fn find_exact<'a>(normalized: &str, entities: &'a [LocationEntity]) -> Option<&'a LocationEntity> {
    matchable(entities).find(|e| {
        normalize_location(&e.name) == normalized
            || normalize_location(&e.display_name) == normalized
            || e.aliases.iter().any(|a| a == normalized)
    })
}

/// Finds a non-merged entity whose `location_code` appears as a code token.
pub fn find_by_code<'a>(codes: &[String], entities: &'a [LocationEntity]) -> Option<&'a LocationEntity> {
    codes.iter().find_map(|code| {
        matchable(entities).find(|e| {
            e.location_code
                .as_deref()
                .is_some_and(|c| c.eq_ignore_ascii_case(code))
        })
    })
}

/// Returns the best-scoring non-merged entity at or above `threshold`.
///
/// Each entity is scored against its name, display name and aliases; the
/// highest of those counts.
pub fn best_fuzzy_match<'a>(
    normalized: &str,
    entities: &'a [LocationEntity],
    weights: &FuzzyWeights,
    threshold: f64,
) -> Option<(&'a LocationEntity, f64)> {
    matchable(entities)
        .map(|e| {
            let best = std::iter::once(normalize_location(&e.name))
                .chain(std::iter::once(normalize_location(&e.display_name)))
                .chain(e.aliases.iter().cloned())
                .map(|candidate| similarity(normalized, &candidate, weights))
                .fold(0.0_f64, f64::max);
            (e, best)
        })
        .filter(|(_, score)| *score >= threshold)
        .max_by(|a, b| a.1.total_cmp(&b.1))
}

// =============================================================================
// Virtual Meetings
// =============================================================================

/// Known conferencing platforms keyed by domain suffix.
const PLATFORM_DOMAINS: &[(&str, &str)] = &[
    ("teams.microsoft.com", "Microsoft Teams"),
    ("teams.live.com", "Microsoft Teams"),
    ("zoom.us", "Zoom"),
    ("zoomgov.com", "Zoom"),
    ("meet.google.com", "Google Meet"),
    ("webex.com", "Webex"),
    ("gotomeeting.com", "GoTo Meeting"),
    ("goto.com", "GoTo Meeting"),
    ("whereby.com", "Whereby"),
];

fn url_regex() -> &'static Regex {
    static URL: OnceLock<Regex> = OnceLock::new();
    URL.get_or_init(|| Regex::new(r#"(?i)\bhttps?://[^\s<>"';]+"#).expect("valid url regex"))
}

fn platform_for(token: &str) -> Option<&'static str> {
    let lower = token.to_lowercase();
    let host = lower
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .split(['/', '?', '#'])
        .next()
        .unwrap_or("");
    PLATFORM_DOMAINS
        .iter()
        .find(|(domain, _)| host == *domain || host.ends_with(&format!(".{domain}")))
        .map(|(_, platform)| *platform)
}

/// Detects an online meeting in a location string.
///
/// Any `http(s)` URL counts; known conferencing domains count even without
/// a scheme. Unknown hosts are tagged `Online`.
pub fn detect_virtual_meeting(text: &str) -> Option<VirtualMeeting> {
    if let Some(m) = url_regex().find(text) {
        let url = m.as_str().to_string();
        let platform = platform_for(&url).unwrap_or("Online").to_string();
        return Some(VirtualMeeting { platform, url });
    }

    text.split_whitespace().find_map(|token| {
        platform_for(token).map(|platform| VirtualMeeting {
            platform: platform.to_string(),
            url: format!("https://{token}"),
        })
    })
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LocationStatus;

    fn entity(id: &str, name: &str) -> LocationEntity {
        LocationEntity {
            id: id.to_string(),
            name: name.to_string(),
            display_name: name.to_string(),
            aliases: vec![normalize_location(name)],
            location_code: None,
            status: LocationStatus::Approved,
            merged_into: None,
            seen_variations: vec![name.to_string()],
            usage_count: 0,
        }
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize_location("  Main   Chapel! "), "main chapel");
        assert_eq!(normalize_location("Fellowship  Hal"), "fellowship hal");
        assert_eq!(normalize_location("Gym (North)"), "gym north");
        assert_eq!(normalize_location(""), "");
    }

    #[test]
    fn test_split_segments() {
        assert_eq!(split_segments("Chapel; Gym ;;"), vec!["Chapel", "Gym"]);
        assert!(split_segments(" ; ").is_empty());
    }

    #[test]
    fn test_extract_codes() {
        assert_eq!(extract_location_codes("Meet in FH-2 (B12)", 6), vec!["FH", "B12"]);
        assert!(extract_location_codes("Parking Lot B", 6).is_empty());
        assert!(extract_location_codes("Room 101", 6).is_empty());
    }

    #[test]
    fn test_edit_distance() {
        assert_eq!(edit_distance("kitten", "sitting"), 3);
        assert_eq!(edit_distance("", "abc"), 3);
        assert_eq!(edit_distance("same", "same"), 0);
    }

    #[test]
    fn test_fuzzy_typo_matches() {
        let entities = vec![entity("loc-1", "Fellowship Hall")];
        let query = normalize_location("Fellowship  Hal");

        let (found, score) =
            best_fuzzy_match(&query, &entities, &FuzzyWeights::default(), 0.6).unwrap();
        assert_eq!(found.id, "loc-1");
        assert!(score >= 0.6);
    }

    #[test]
    fn test_fuzzy_unrelated_rejected() {
        let entities = vec![entity("loc-1", "Fellowship Hall")];
        let query = normalize_location("Parking Lot B");

        assert!(best_fuzzy_match(&query, &entities, &FuzzyWeights::default(), 0.6).is_none());
    }

    #[test]
    fn test_similarity_capped() {
        let score = similarity("main chapel", "main chapel", &FuzzyWeights::default());
        assert_eq!(score, 1.0);
    }

    #[test]
    fn test_merged_entities_excluded() {
        let mut merged = entity("loc-1", "Main Chapel");
        merged.status = LocationStatus::Merged;
        merged.merged_into = Some("loc-2".to_string());
        let entities = vec![merged];

        assert!(find_exact("main chapel", &entities).is_none());
        assert!(best_fuzzy_match("main chapel", &entities, &FuzzyWeights::default(), 0.6).is_none());
    }

    #[test]
    fn test_find_by_code() {
        let mut hall = entity("loc-1", "Fellowship Hall");
        hall.location_code = Some("FH".to_string());
        let entities = vec![hall];

        let codes = extract_location_codes("Lunch @ FH", 6);
        assert_eq!(find_by_code(&codes, &entities).unwrap().id, "loc-1");
    }

    #[test]
    fn test_detect_virtual_meeting() {
        let teams = detect_virtual_meeting("https://teams.microsoft.com/l/meetup-join/abc").unwrap();
        assert_eq!(teams.platform, "Microsoft Teams");

        let zoom = detect_virtual_meeting("Join at us02web.zoom.us/j/123").unwrap();
        assert_eq!(zoom.platform, "Zoom");
        assert_eq!(zoom.url, "https://us02web.zoom.us/j/123");

        let generic = detect_virtual_meeting("http://example.org/stream").unwrap();
        assert_eq!(generic.platform, "Online");

        assert!(detect_virtual_meeting("Main Chapel").is_none());
    }
}
