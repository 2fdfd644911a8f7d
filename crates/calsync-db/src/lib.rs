//! # calsync-db: Database Layer for the Calendar Mirror
//!
//! This crate provides database access for the reconciliation engine.
//! It uses SQLite for local storage with sqlx for async operations.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        calsync Data Flow                                │
//! │                                                                         │
//! │  calsync-engine (orchestrator, merge engine, bulk layer)               │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     calsync-db (THIS CRATE)                     │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌──────────────────┐   ┌─────────────┐  │   │
//! │  │   │   Database    │    │  Repositories    │   │ Migrations  │  │   │
//! │  │   │   (pool.rs)   │    │                  │   │ (embedded)  │  │   │
//! │  │   │               │    │ CursorRepository │   │ 001_init    │  │   │
//! │  │   │ SqlitePool    │◄───│ EventRepository  │   │             │  │   │
//! │  │   │               │    │ LocationRepo...  │   │             │  │   │
//! │  │   └───────────────┘    └──────────────────┘   └─────────────┘  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     SQLite Database                             │   │
//! │  │   <data dir>/calsync/calsync.db                                │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool creation and configuration
//! - [`migrations`] - Embedded database migrations
//! - [`error`] - Database error types
//! - [`repository`] - Repository implementations (cursor, event, location)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use calsync_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("path/to/calsync.db")).await?;
//!
//! let cursor = db.cursors().get("me", "calendar-1").await?;
//! let live = db.events().count_active("me").await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

// Repository re-exports for convenience
pub use repository::cursor::CursorRepository;
pub use repository::event::{EventRepository, SnapshotUpdate};
pub use repository::location::{LocationRepository, NewLocation};
