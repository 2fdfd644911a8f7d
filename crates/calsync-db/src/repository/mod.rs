//! # Repository Module
//!
//! Database repository implementations for the calendar mirror.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Repository Layout                                    │
//! │                                                                         │
//! │  calsync-engine                                                        │
//! │       │                                                                 │
//! │       │  db.events().find_existing(owner, uid, remote_id)              │
//! │       ▼                                                                 │
//! │  CursorRepository     sync_cursors                                     │
//! │  ├── get / save / advance / reset                                      │
//! │                                                                         │
//! │  EventRepository      unified_events                                   │
//! │  ├── find_existing / find_live_by_source / get / upsert                │
//! │  ├── find_by_remote_ids / bulk_update_snapshots / storage_ids_for      │
//! │  └── list_in_window / count_active                                     │
//! │                                                                         │
//! │  LocationRepository   locations + aliases + variations                 │
//! │  ├── list_active / get / find_by_name / find_by_alias(es)              │
//! │  └── create / add_alias / record_variation / increment_usage / merge   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`cursor::CursorRepository`] - Delta cursor persistence
//! - [`event::EventRepository`] - Unified event documents
//! - [`location::LocationRepository`] - Canonical locations

pub mod cursor;
pub mod event;
pub mod location;
