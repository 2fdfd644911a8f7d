//! # Location Repository
//!
//! Canonical locations with additive alias and variation sets.
//!
//! ## Shared Mutation
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Automatic resolver                 Administrator                       │
//! │  ├── create (dedupe on name)        ├── add_alias                       │
//! │  ├── add_alias                      └── mark_merged(source, target)     │
//! │  ├── record_variation                                                   │
//! │  └── increment_usage                                                    │
//! │                                                                         │
//! │  Aliases and variations are rows with composite primary keys, written  │
//! │  with INSERT OR IGNORE. Neither flow can drop what the other added.    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::str::FromStr;

use calsync_core::{LocationEntity, LocationStatus};
use chrono::Utc;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{DbError, DbResult};

const SELECT_LOCATION: &str = r#"
    SELECT id, name, display_name, location_code, status, merged_into, usage_count
    FROM locations
"#;

// =============================================================================
// Row Mapping
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
struct LocationRow {
    id: String,
    name: String,
    display_name: String,
    location_code: Option<String>,
    status: String,
    merged_into: Option<String>,
    usage_count: i64,
}

impl LocationRow {
    fn into_entity(self, aliases: Vec<String>, seen_variations: Vec<String>) -> DbResult<LocationEntity> {
        let status = LocationStatus::from_str(&self.status).map_err(|e| DbError::Serialization {
            column: "status".to_string(),
            reason: e.to_string(),
        })?;

        Ok(LocationEntity {
            id: self.id,
            name: self.name,
            display_name: self.display_name,
            aliases,
            location_code: self.location_code,
            status,
            merged_into: self.merged_into,
            seen_variations,
            usage_count: self.usage_count,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ChildRow {
    location_id: String,
    value: String,
}

#[derive(Debug, sqlx::FromRow)]
struct AliasHitRow {
    alias: String,
    id: String,
    name: String,
    display_name: String,
    location_code: Option<String>,
    status: String,
    merged_into: Option<String>,
    usage_count: i64,
}

/// Input for a newly auto-created location.
#[derive(Debug, Clone)]
pub struct NewLocation {
    /// Original free text; becomes both name and display name.
    pub name: String,
    /// Normalised form of `name`, stored as the first alias.
    pub alias: String,
    pub location_code: Option<String>,
}

// =============================================================================
// Repository
// =============================================================================

/// Repository for canonical locations.
#[derive(Debug, Clone)]
pub struct LocationRepository {
    pool: SqlitePool,
}

impl LocationRepository {
    /// Creates a new LocationRepository.
    pub fn new(pool: SqlitePool) -> Self {
        LocationRepository { pool }
    }

    /// All non-merged locations with their aliases and variations.
    pub async fn list_active(&self) -> DbResult<Vec<LocationEntity>> {
        let rows = sqlx::query_as::<_, LocationRow>(&format!(
            "{SELECT_LOCATION} WHERE status = 'approved' ORDER BY name"
        ))
        .fetch_all(&self.pool)
        .await?;

        self.hydrate(rows).await
    }

    /// Gets a location by id, whatever its status.
    pub async fn get(&self, id: &str) -> DbResult<Option<LocationEntity>> {
        let row = sqlx::query_as::<_, LocationRow>(&format!("{SELECT_LOCATION} WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(self.hydrate(row.into_iter().collect()).await?.pop())
    }

    /// Gets a location by its exact stored name.
    pub async fn find_by_name(&self, name: &str) -> DbResult<Option<LocationEntity>> {
        let row = sqlx::query_as::<_, LocationRow>(&format!("{SELECT_LOCATION} WHERE name = ?1"))
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        Ok(self.hydrate(row.into_iter().collect()).await?.pop())
    }

    /// Gets the first location carrying a normalised alias.
    pub async fn find_by_alias(&self, alias: &str) -> DbResult<Option<LocationEntity>> {
        let row = sqlx::query_as::<_, LocationRow>(&format!(
            "{SELECT_LOCATION} WHERE id IN (SELECT location_id FROM location_aliases WHERE alias = ?1) \
             ORDER BY status = 'merged', name LIMIT 1"
        ))
        .bind(alias)
        .fetch_optional(&self.pool)
        .await?;

        Ok(self.hydrate(row.into_iter().collect()).await?.pop())
    }

    /// Maps each alias in the batch to the location carrying it, in one query.
    ///
    /// Returned entities are shallow: `aliases` holds only the matched alias
    /// and `seen_variations` is empty.
    pub async fn find_by_aliases(&self, aliases: &[String]) -> DbResult<HashMap<String, LocationEntity>> {
        if aliases.is_empty() {
            return Ok(HashMap::new());
        }

        let mut builder: QueryBuilder<'_, Sqlite> = QueryBuilder::new(
            "SELECT a.alias, l.id, l.name, l.display_name, l.location_code, l.status, \
             l.merged_into, l.usage_count \
             FROM location_aliases a JOIN locations l ON l.id = a.location_id \
             WHERE a.alias IN (",
        );
        let mut separated = builder.separated(", ");
        for alias in aliases {
            separated.push_bind(alias);
        }
        separated.push_unseparated(") ORDER BY l.status = 'merged', l.name");

        let rows: Vec<AliasHitRow> = builder.build_query_as().fetch_all(&self.pool).await?;

        let mut hits = HashMap::with_capacity(rows.len());
        for row in rows {
            if hits.contains_key(&row.alias) {
                continue;
            }
            let alias = row.alias;
            let entity = LocationRow {
                id: row.id,
                name: row.name,
                display_name: row.display_name,
                location_code: row.location_code,
                status: row.status,
                merged_into: row.merged_into,
                usage_count: row.usage_count,
            }
            .into_entity(vec![alias.clone()], Vec::new())?;
            hits.insert(alias, entity);
        }

        Ok(hits)
    }

    /// Creates a location, or returns the existing one with the same name.
    pub async fn create(&self, new: &NewLocation) -> DbResult<LocationEntity> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        let inserted = sqlx::query(
            r#"
            INSERT INTO locations (
                id, name, display_name, location_code, status, merged_into,
                usage_count, created_at, updated_at
            ) VALUES (?1, ?2, ?2, ?3, 'approved', NULL, 0, ?4, ?4)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(&id)
        .bind(&new.name)
        .bind(&new.location_code)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected()
            > 0;

        let entity = self
            .find_by_name(&new.name)
            .await?
            .ok_or_else(|| DbError::not_found("Location", &new.name))?;

        if inserted {
            info!(location_id = %entity.id, name = %entity.name, "Created location");
        }

        self.add_alias(&entity.id, &new.alias).await?;
        self.record_variation(&entity.id, &new.name).await?;

        self.get(&entity.id)
            .await?
            .ok_or_else(|| DbError::not_found("Location", entity.id))
    }

    /// Adds a normalised alias if absent. Returns true if it was new.
    pub async fn add_alias(&self, location_id: &str, alias: &str) -> DbResult<bool> {
        if alias.is_empty() {
            return Ok(false);
        }

        let result = sqlx::query(
            "INSERT OR IGNORE INTO location_aliases (location_id, alias) VALUES (?1, ?2)",
        )
        .bind(location_id)
        .bind(alias)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Records an original text seen resolving here, if absent.
    pub async fn record_variation(&self, location_id: &str, variation: &str) -> DbResult<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO location_variations (location_id, variation) VALUES (?1, ?2)",
        )
        .bind(location_id)
        .bind(variation)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Bumps the usage counter.
    pub async fn increment_usage(&self, location_id: &str) -> DbResult<()> {
        sqlx::query(
            "UPDATE locations SET usage_count = usage_count + 1, updated_at = ?2 WHERE id = ?1",
        )
        .bind(location_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Marks `source_id` merged into `target_id` and copies its aliases and
    /// variations onto the target, plus `extra_aliases`.
    ///
    /// One transaction; copies are add-if-absent.
    pub async fn mark_merged(
        &self,
        source_id: &str,
        target_id: &str,
        extra_aliases: &[String],
    ) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE locations SET status = 'merged', merged_into = ?2, updated_at = ?3
            WHERE id = ?1
            "#,
        )
        .bind(source_id)
        .bind(target_id)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(DbError::not_found("Location", source_id));
        }

        sqlx::query(
            r#"
            INSERT OR IGNORE INTO location_aliases (location_id, alias)
            SELECT ?2, alias FROM location_aliases WHERE location_id = ?1
            "#,
        )
        .bind(source_id)
        .bind(target_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT OR IGNORE INTO location_variations (location_id, variation)
            SELECT ?2, variation FROM location_variations WHERE location_id = ?1
            "#,
        )
        .bind(source_id)
        .bind(target_id)
        .execute(&mut *tx)
        .await?;

        for alias in extra_aliases.iter().filter(|a| !a.is_empty()) {
            sqlx::query("INSERT OR IGNORE INTO location_aliases (location_id, alias) VALUES (?1, ?2)")
                .bind(target_id)
                .bind(alias)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        debug!(source_id = %source_id, target_id = %target_id, "Location merged");
        Ok(())
    }

    /// Loads aliases and variations for a set of location rows.
    async fn hydrate(&self, rows: Vec<LocationRow>) -> DbResult<Vec<LocationEntity>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
        let mut aliases = self.children("location_aliases", "alias", &ids).await?;
        let mut variations = self.children("location_variations", "variation", &ids).await?;

        rows.into_iter()
            .map(|row| {
                let a = aliases.remove(&row.id).unwrap_or_default();
                let v = variations.remove(&row.id).unwrap_or_default();
                row.into_entity(a, v)
            })
            .collect()
    }

    async fn children(
        &self,
        table: &str,
        column: &str,
        ids: &[String],
    ) -> DbResult<HashMap<String, Vec<String>>> {
        let mut builder: QueryBuilder<'_, Sqlite> = QueryBuilder::new(format!(
            "SELECT location_id, {column} AS value FROM {table} WHERE location_id IN ("
        ));
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(id);
        }
        separated.push_unseparated(&format!(") ORDER BY location_id, {column}"));

        let rows: Vec<ChildRow> = builder.build_query_as().fetch_all(&self.pool).await?;

        let mut grouped: HashMap<String, Vec<String>> = HashMap::new();
        for row in rows {
            grouped.entry(row.location_id).or_default().push(row.value);
        }
        Ok(grouped)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
