//! # calsync-engine: Sync and Reconciliation Engine
//!
//! Keeps a local, enriched mirror of remote calendar events consistent with
//! the calendar service through delta queries.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      CalendarSyncService (facade)                       │
//! │                               │                                         │
//! │          ┌────────────────────┼──────────────────────┐                  │
//! │          ▼                    ▼                      ▼                  │
//! │  ┌────────────────┐  ┌──────────────────┐  ┌──────────────────────┐    │
//! │  │SyncOrchestrator│  │ LocationResolver │  │ BulkPersistenceLayer │    │
//! │  │                │  │                  │  │                      │    │
//! │  │ per-calendar   │  │ exact / code /   │  │ two lookups, one     │    │
//! │  │ state machine, │  │ fuzzy / create,  │  │ batched update,      │    │
//! │  │ bounded fan-out│  │ merge chains     │  │ no creates           │    │
//! │  └───────┬────────┘  └────────▲─────────┘  └──────────────────────┘    │
//! │          │                    │                                         │
//! │    ┌─────┴──────┬─────────────┼───────────┐                             │
//! │    ▼            ▼             │           │                             │
//! │ ┌──────────┐ ┌──────────────────────┐     │                             │
//! │ │ Delta    │ │  EventMergeEngine    │─────┘                             │
//! │ │ Cursor   │ │  identity, sources,  │                                   │
//! │ │ Store    │ │  enrichment, tiebreak│                                   │
//! │ └──────────┘ └──────────────────────┘                                   │
//! │                                                                         │
//! │  CalendarSource (trait) ◄── GraphClient (reqwest + backoff)             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`service`] - `CalendarSyncService`, the validated entry points
//! - [`orchestrator`] - Per-calendar delta state machine and fan-out
//! - [`merge`] - Per-event reconciliation into `UnifiedEvent` records
//! - [`location`] - Free-text location resolution and entity merges
//! - [`bulk`] - Batched cache-warming writes
//! - [`cursor`] - Delta cursor lifecycle
//! - [`source`] - The `CalendarSource` seam
//! - [`graph`] - Microsoft Graph delta client
//! - [`config`] - Engine configuration (file + env)
//! - [`error`] - Engine error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use calsync_db::{Database, DbConfig};
//! use calsync_engine::{CalSyncConfig, CalendarSyncService, GraphClient, StaticToken};
//!
//! let config = CalSyncConfig::load(None)?;
//! let db = Database::new(DbConfig::new(&config.database.path)).await?;
//! let graph = GraphClient::new(config.graph.clone(), Arc::new(StaticToken::new(token)))?;
//!
//! let service = CalendarSyncService::new(config, &db, Arc::new(graph));
//! let summary = service
//!     .sync_calendars("me", vec!["AAMkCal".into()], None, false)
//!     .await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod bulk;
pub mod config;
pub mod cursor;
pub mod error;
pub mod graph;
pub mod location;
pub mod merge;
pub mod orchestrator;
pub mod service;
pub mod source;

#[cfg(test)]
mod testing;

// =============================================================================
// Re-exports
// =============================================================================

pub use bulk::{BulkLoadResult, BulkPersistenceLayer, SkippedEvent};
pub use config::CalSyncConfig;
pub use cursor::DeltaCursorStore;
pub use error::{RemoteError, SyncError, SyncResult};
pub use graph::{AccessTokenProvider, GraphClient, StaticToken};
pub use location::{LocationResolver, ResolvedLocations};
pub use merge::{EventMergeEngine, MergeOutcome, RemovalOutcome};
pub use orchestrator::{
    CalendarError, CalendarSummary, SyncOrchestrator, SyncPhase, SyncRequest, SyncSummary,
};
pub use service::CalendarSyncService;
pub use source::{CalendarSource, DeltaPage, PageRequest};
