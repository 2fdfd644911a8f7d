//! # calsync-core: Pure Domain Logic for the Calendar Mirror
//!
//! This crate holds every decision the reconciliation engine makes that does
//! not need I/O: what a mirrored event looks like, how free-text locations are
//! normalised and scored, how setup/teardown timing is read out of an event
//! body, and how caller input is validated.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        calsync Architecture                             │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 Route layer (external collaborator)             │   │
//! │  │    syncCalendars, resetCursor, resolveLocation, bulkLoad        │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                 calsync-engine (orchestration)                  │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ calsync-core (THIS CRATE) ★                     │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌────────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │ location  │  │ enrichment │  │ validation│  │   │
//! │  │   │ Unified-  │  │ normalise │  │ setup/tear │  │  request  │  │   │
//! │  │   │ Event ... │  │ fuzzy     │  │ notes      │  │  checks   │  │   │
//! │  │   └───────────┘  └───────────┘  └────────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                   calsync-db (SQLite documents)                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Domain types (SyncCursor, UnifiedEvent, LocationEntity, ...)
//! - [`location`] - Location text normalisation, code extraction, fuzzy scoring
//! - [`enrichment`] - Setup/teardown and notes extraction from event bodies
//! - [`error`] - Domain error types
//! - [`validation`] - Request validation
//!
//! ## Example Usage
//!
//! ```rust
//! use calsync_core::enrichment::extract_timing;
//! use calsync_core::location::normalize_location;
//!
//! assert_eq!(normalize_location("  Main   Chapel! "), "main chapel");
//!
//! let timing = extract_timing("Setup: 30 min, Teardown: 15 min").unwrap();
//! assert_eq!(timing.setup_minutes, 30);
//! assert_eq!(timing.teardown_minutes, 15);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod enrichment;
pub mod error;
pub mod location;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, CoreResult, ValidationError};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Separator placed between locations in a multi-location free-text string.
pub const LOCATION_SEGMENT_DELIMITER: char = ';';

/// Separator used when joining resolved location names for display.
pub const LOCATION_DISPLAY_SEPARATOR: &str = "; ";

/// Separator placed between appended internal-notes fragments.
pub const NOTES_SEPARATOR: &str = "\n---\n";

/// Maximum number of `merged_into` hops followed before giving up.
///
/// Admin merges are expected to form short chains; anything longer is
/// treated as a cycle.
pub const MAX_MERGE_DEPTH: usize = 8;
