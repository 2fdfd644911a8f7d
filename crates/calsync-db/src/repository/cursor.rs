//! # Cursor Repository
//!
//! Persists one delta cursor per (owner, calendar).
//!
//! ## Cursor Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   (no row) ──get──► initial {token: NULL, full_sync_required: 1}       │
//! │                          │                                              │
//! │                          │ page loop finished                           │
//! │                          ▼                                              │
//! │                 advanced {token: T, full_sync_required: 0}              │
//! │                          │                                              │
//! │          ┌───────────────┼─────────────────┐                            │
//! │          │ next run      │ 410 / reset     │                            │
//! │          ▼               ▼                 │                            │
//! │     advanced {T'}   initial {NULL, 1} ─────┘                            │
//! │                                                                         │
//! │  The table CHECK rejects a row with both a token and the flag set.     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use calsync_core::SyncCursor;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::DbResult;

#[derive(Debug, sqlx::FromRow)]
struct CursorRow {
    owner_id: String,
    calendar_id: String,
    cursor_token: Option<String>,
    full_sync_required: bool,
    last_synced_at: Option<DateTime<Utc>>,
}

impl From<CursorRow> for SyncCursor {
    fn from(row: CursorRow) -> Self {
        SyncCursor {
            owner_id: row.owner_id,
            calendar_id: row.calendar_id,
            cursor_token: row.cursor_token,
            full_sync_required: row.full_sync_required,
            last_synced_at: row.last_synced_at,
        }
    }
}

/// Repository for delta cursors.
#[derive(Debug, Clone)]
pub struct CursorRepository {
    pool: SqlitePool,
}

impl CursorRepository {
    /// Creates a new CursorRepository.
    pub fn new(pool: SqlitePool) -> Self {
        CursorRepository { pool }
    }

    /// Loads the stored cursor, if any.
    pub async fn get(&self, owner_id: &str, calendar_id: &str) -> DbResult<Option<SyncCursor>> {
        let row = sqlx::query_as::<_, CursorRow>(
            r#"
            SELECT owner_id, calendar_id, cursor_token, full_sync_required, last_synced_at
            FROM sync_cursors
            WHERE owner_id = ?1 AND calendar_id = ?2
            "#,
        )
        .bind(owner_id)
        .bind(calendar_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(SyncCursor::from))
    }

    /// Inserts or replaces a cursor row.
    pub async fn save(&self, cursor: &SyncCursor) -> DbResult<()> {
        debug!(
            owner_id = %cursor.owner_id,
            calendar_id = %cursor.calendar_id,
            full_sync_required = cursor.full_sync_required,
            "Saving sync cursor"
        );

        sqlx::query(
            r#"
            INSERT INTO sync_cursors (
                owner_id, calendar_id, cursor_token, full_sync_required,
                last_synced_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT (owner_id, calendar_id) DO UPDATE SET
                cursor_token = excluded.cursor_token,
                full_sync_required = excluded.full_sync_required,
                last_synced_at = COALESCE(excluded.last_synced_at, sync_cursors.last_synced_at),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&cursor.owner_id)
        .bind(&cursor.calendar_id)
        .bind(&cursor.cursor_token)
        .bind(cursor.full_sync_required)
        .bind(cursor.last_synced_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Stores a fresh delta token and clears the full-sync flag.
    pub async fn advance(
        &self,
        owner_id: &str,
        calendar_id: &str,
        token: &str,
        synced_at: DateTime<Utc>,
    ) -> DbResult<SyncCursor> {
        let cursor = SyncCursor::advanced(owner_id, calendar_id, token, synced_at);
        self.save(&cursor).await?;
        Ok(cursor)
    }

    /// Drops the token and demands a full sync next time.
    ///
    /// `last_synced_at` is kept so operators can still see when the
    /// calendar last completed.
    pub async fn reset(&self, owner_id: &str, calendar_id: &str) -> DbResult<()> {
        self.save(&SyncCursor::initial(owner_id, calendar_id)).await
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
