//! # Delta Cursor Store
//!
//! Wraps [`CursorRepository`] so the orchestrator never fails on cursor I/O.
//! A storage failure degrades to "full sync every run" instead of aborting.

use calsync_core::SyncCursor;
use calsync_db::CursorRepository;
use chrono::Utc;
use tracing::{debug, warn};

/// Cursor lifecycle operations used by the orchestrator.
#[derive(Debug, Clone)]
pub struct DeltaCursorStore {
    repo: CursorRepository,
}

impl DeltaCursorStore {
    pub fn new(repo: CursorRepository) -> Self {
        DeltaCursorStore { repo }
    }

    /// Returns the stored cursor, or an initial one demanding a full sync.
    pub async fn get(&self, owner_id: &str, calendar_id: &str) -> SyncCursor {
        match self.repo.get(owner_id, calendar_id).await {
            Ok(Some(cursor)) if cursor.is_consistent() => cursor,
            Ok(Some(cursor)) => {
                warn!(owner_id, calendar_id, ?cursor, "Stored cursor is inconsistent, forcing full sync");
                SyncCursor::initial(owner_id, calendar_id)
            }
            Ok(None) => SyncCursor::initial(owner_id, calendar_id),
            Err(e) => {
                warn!(owner_id, calendar_id, error = %e, "Failed to load cursor, forcing full sync");
                SyncCursor::initial(owner_id, calendar_id)
            }
        }
    }

    /// Stores the final token of a completed page loop.
    ///
    /// Returns false if the write failed; the next run then repeats the
    /// same delta range, which merge tolerates.
    pub async fn advance(&self, owner_id: &str, calendar_id: &str, token: &str) -> bool {
        match self.repo.advance(owner_id, calendar_id, token, Utc::now()).await {
            Ok(_) => {
                debug!(owner_id, calendar_id, "Cursor advanced");
                true
            }
            Err(e) => {
                warn!(owner_id, calendar_id, error = %e, "Failed to advance cursor");
                false
            }
        }
    }

    /// Drops the token so the next run is a full sync.
    pub async fn reset(&self, owner_id: &str, calendar_id: &str) -> bool {
        match self.repo.reset(owner_id, calendar_id).await {
            Ok(()) => {
                debug!(owner_id, calendar_id, "Cursor reset");
                true
            }
            Err(e) => {
                warn!(owner_id, calendar_id, error = %e, "Failed to reset cursor");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use calsync_core::SyncMode;
    use calsync_db::Database;

    #[tokio::test]
    async fn test_missing_cursor_requires_full_sync() {
        let db = Database::in_memory().await.unwrap();
        let store = DeltaCursorStore::new(db.cursors());

        let cursor = store.get("alice", "cal-1").await;
        assert!(cursor.full_sync_required);
        assert_eq!(cursor.sync_mode(false), SyncMode::Full);
    }

    #[tokio::test]
    async fn test_advance_and_reset_hold_invariant() {
        let db = Database::in_memory().await.unwrap();
        let store = DeltaCursorStore::new(db.cursors());

        assert!(store.advance("alice", "cal-1", "tok-1").await);
        let cursor = store.get("alice", "cal-1").await;
        assert!(cursor.is_consistent());
        assert_eq!(cursor.sync_mode(false), SyncMode::Incremental);

        assert!(store.reset("alice", "cal-1").await);
        let cursor = store.get("alice", "cal-1").await;
        assert!(cursor.is_consistent());
        assert!(cursor.full_sync_required);
        assert!(cursor.cursor_token.is_none());
    }

    #[tokio::test]
    async fn test_storage_failure_degrades_to_full_sync() {
        let db = Database::in_memory().await.unwrap();
        let store = DeltaCursorStore::new(db.cursors());
        db.close().await;

        let cursor = store.get("alice", "cal-1").await;
        assert!(cursor.full_sync_required);
        assert!(!store.advance("alice", "cal-1", "tok").await);
    }
}
