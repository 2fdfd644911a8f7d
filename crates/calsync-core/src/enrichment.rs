//! # Enrichment Extraction
//!
//! Reads setup/teardown timing and internal notes out of the free text of
//! events that arrive from registration calendars, and merges notes onto
//! existing enrichment without duplicating fragments.
//!
//! ## Recognised Phrasings
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Setup      "Setup: 30 min"  "set-up 1 hour"  "45 minutes setup"       │
//! │  Teardown   "Teardown: 15 mins"  "tear down - 2 hrs"                    │
//! │  Total      "Total: 40 min"   (only when neither of the above appears) │
//! │             → setup = floor(N/2), teardown = ceil(N/2)                  │
//! │                                                                         │
//! │  Units      min | mins | minute | minutes | hr | hrs | hour | hours    │
//! │  Notes      lines starting "Notes:", "Note:", "Internal notes:"         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::NOTES_SEPARATOR;

// =============================================================================
// Timing
// =============================================================================

/// Setup/teardown minutes recovered from event text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupTeardown {
    pub setup_minutes: i64,
    pub teardown_minutes: i64,
}

const UNIT: &str = r"(minutes|minute|mins|min|hours|hour|hrs|hr)\b";

struct TimingPatterns {
    setup_first: Regex,
    setup_after: Regex,
    teardown_first: Regex,
    teardown_after: Regex,
    total: Regex,
}

fn timing_patterns() -> &'static TimingPatterns {
    static PATTERNS: OnceLock<TimingPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let keyword_first = |keyword: &str| {
            Regex::new(&format!(
                r"(?i)\b{keyword}\b(?:\s+time)?\s*[:=\-]?\s*(\d+(?:\.\d+)?)\s*{UNIT}"
            ))
            .expect("Invalid regex")
        };
        let amount_first = |keyword: &str| {
            Regex::new(&format!(r"(?i)(\d+(?:\.\d+)?)\s*{UNIT}\s+(?:of\s+)?{keyword}\b"))
                .expect("Invalid regex")
        };
        let setup = r"set[\s\-]?up";
        let teardown = r"tear[\s\-]?down";

        TimingPatterns {
            setup_first: keyword_first(setup),
            setup_after: amount_first(setup),
            teardown_first: keyword_first(teardown),
            teardown_after: amount_first(teardown),
            total: keyword_first("total"),
        }
    })
}

/// Converts an `(amount, unit)` capture pair into whole minutes.
fn minutes_from(caps: &Captures<'_>) -> Option<i64> {
    let amount: f64 = caps.get(1)?.as_str().parse().ok()?;
    let unit = caps.get(2)?.as_str().to_ascii_lowercase();
    let factor = if unit.starts_with('h') { 60.0 } else { 1.0 };
    Some((amount * factor).round() as i64)
}

fn first_minutes(text: &str, patterns: &[&Regex]) -> Option<i64> {
    patterns
        .iter()
        .find_map(|re| re.captures(text).and_then(|c| minutes_from(&c)))
}

/// Extracts setup/teardown timing from free text.
///
/// Returns `None` when no recognised phrasing is present. A lone setup or
/// teardown value leaves the other side at zero.
///
/// ## Example
/// ```rust
/// use calsync_core::enrichment::extract_timing;
///
/// let t = extract_timing("Total: 45 min").unwrap();
/// assert_eq!((t.setup_minutes, t.teardown_minutes), (22, 23));
/// assert!(extract_timing("Choir practice").is_none());
/// ```
pub fn extract_timing(text: &str) -> Option<SetupTeardown> {
    let p = timing_patterns();

    let setup = first_minutes(text, &[&p.setup_first, &p.setup_after]);
    let teardown = first_minutes(text, &[&p.teardown_first, &p.teardown_after]);

    if setup.is_some() || teardown.is_some() {
        return Some(SetupTeardown {
            setup_minutes: setup.unwrap_or(0),
            teardown_minutes: teardown.unwrap_or(0),
        });
    }

    let total = first_minutes(text, &[&p.total])?;
    Some(SetupTeardown {
        setup_minutes: total / 2,
        teardown_minutes: total - total / 2,
    })
}

// =============================================================================
// Notes
// =============================================================================

fn notes_regex() -> &'static Regex {
    static NOTES: OnceLock<Regex> = OnceLock::new();
    NOTES.get_or_init(|| {
        Regex::new(r"(?im)^\s*(?:internal\s+notes?|notes?)\s*:\s*(.+?)\s*$").expect("Invalid regex")
    })
}

/// Collects every `Notes:` line from free text, joined by newlines.
pub fn extract_notes(text: &str) -> Option<String> {
    let lines: Vec<&str> = notes_regex()
        .captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .filter(|s| !s.is_empty())
        .collect();

    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

/// Appends `incoming` to `existing` unless one already contains the other.
pub fn merge_notes(existing: Option<&str>, incoming: &str) -> String {
    let incoming = incoming.trim();
    match existing.map(str::trim).filter(|e| !e.is_empty()) {
        None => incoming.to_string(),
        Some(existing) if incoming.is_empty() || existing.contains(incoming) => existing.to_string(),
        Some(existing) if incoming.contains(existing) => incoming.to_string(),
        Some(existing) => format!("{existing}{NOTES_SEPARATOR}{incoming}"),
    }
}

// =============================================================================
// HTML Bodies
// =============================================================================

struct HtmlPatterns {
    blocks: Regex,
    breaks: Regex,
    tags: Regex,
    blank_lines: Regex,
}

fn html_patterns() -> &'static HtmlPatterns {
    static PATTERNS: OnceLock<HtmlPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| HtmlPatterns {
        blocks: Regex::new(r"(?is)<head[^>]*>.*?</head>|<style[^>]*>.*?</style>|<script[^>]*>.*?</script>")
            .expect("Invalid regex"),
        breaks: Regex::new(r"(?i)<br\s*/?>|</p>|</div>|</li>|</tr>").expect("Invalid regex"),
        tags: Regex::new(r"<[^>]+>").expect("Invalid regex"),
        blank_lines: Regex::new(r"\n{3,}").expect("Invalid regex"),
    })
}

/// Reduces an HTML event body to plain text.
///
/// Block-level closers become newlines so that line-anchored patterns
/// (`Notes:`) still work on the result.
pub fn strip_html(html: &str) -> String {
    if !html.contains('<') && !html.contains('&') {
        return html.trim().to_string();
    }

    let p = html_patterns();
    let text = p.blocks.replace_all(html, "");
    let text = p.breaks.replace_all(&text, "\n");
    let text = p.tags.replace_all(&text, "");

    let decoded = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");

    let lines: Vec<&str> = decoded.lines().map(str::trim).collect();
    p.blank_lines
        .replace_all(&lines.join("\n"), "\n\n")
        .trim()
        .to_string()
}

// =============================================================================
// Unit Tests
// =============================================================================
