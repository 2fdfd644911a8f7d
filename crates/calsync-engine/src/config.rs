//! # Engine Configuration
//!
//! Configuration management for the sync engine.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     CALSYNC_DATABASE_PATH=/var/lib/calsync/mirror.db                   │
//! │     CALSYNC_REGISTRATION_CALENDARS=cal-a,cal-b                         │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/calsync/calsync.toml (Linux)                             │
//! │     ~/Library/Application Support/com.calsync.calsync/calsync.toml     │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [database]
//! path = "/var/lib/calsync/mirror.db"
//!
//! [graph]
//! base_url = "https://graph.microsoft.com/v1.0"
//! page_size = 50
//!
//! [sync]
//! max_concurrent_calendars = 4
//!
//! [merge]
//! registration_calendar_ids = ["AAMkAGI2...="]
//! default_setup_minutes = 15
//!
//! [location]
//! fuzzy_threshold = 0.6
//!
//! [bulk]
//! max_batch_size = 1000
//! ```

use std::path::PathBuf;
use std::time::Duration;

use backoff::ExponentialBackoff;
use calsync_core::location::FuzzyWeights;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};

/// Upper bound accepted for `graph.page_size`.
pub const MAX_PAGE_SIZE: u32 = 1000;

// =============================================================================
// Database Settings
// =============================================================================

/// Where the local mirror lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// SQLite file path.
    #[serde(default = "default_database_path")]
    pub path: String,
}

fn default_database_path() -> String {
    directories::ProjectDirs::from("com", "calsync", "calsync")
        .map(|dirs| dirs.data_dir().join("calsync.db").to_string_lossy().into_owned())
        .unwrap_or_else(|| "calsync.db".to_string())
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        DatabaseSettings {
            path: default_database_path(),
        }
    }
}

// =============================================================================
// Graph Settings
// =============================================================================

/// Remote calendar API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSettings {
    /// API root, without trailing slash.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Sent as `Prefer: odata.maxpagesize=N`.
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Per-request timeout (seconds).
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Retries per request, transient failures only.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial backoff duration (milliseconds).
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff duration (seconds).
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
}

fn default_base_url() -> String {
    "https://graph.microsoft.com/v1.0".to_string()
}
fn default_page_size() -> u32 {
    50
}
fn default_timeout() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}
fn default_initial_backoff() -> u64 {
    500
}
fn default_max_backoff() -> u64 {
    10
}

impl Default for GraphSettings {
    fn default() -> Self {
        GraphSettings {
            base_url: default_base_url(),
            page_size: default_page_size(),
            timeout_secs: default_timeout(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
        }
    }
}

impl GraphSettings {
    /// Backoff policy for retrying one request.
    ///
    /// No elapsed-time cap: the retry count bounds the loop.
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: Duration::from_millis(self.initial_backoff_ms),
            max_interval: Duration::from_secs(self.max_backoff_secs),
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

// =============================================================================
// Sync Settings
// =============================================================================

/// Orchestrator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Calendars fetched concurrently within one request.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_calendars: usize,

    /// Window used by the binary when `--days` is not given.
    #[serde(default = "default_window_days")]
    pub default_window_days: i64,
}

fn default_max_concurrent() -> usize {
    4
}
fn default_window_days() -> i64 {
    90
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            max_concurrent_calendars: default_max_concurrent(),
            default_window_days: default_window_days(),
        }
    }
}

// =============================================================================
// Merge Settings
// =============================================================================

/// How calendars are classified and how new records are seeded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeSettings {
    /// Calendar ids containing any of these (case-insensitive) are shared.
    #[serde(default = "default_shared_markers")]
    pub shared_calendar_markers: Vec<String>,

    /// Calendars whose bodies carry setup/teardown and notes.
    #[serde(default)]
    pub registration_calendar_ids: Vec<String>,

    /// Calendar ids containing any of these are registration calendars.
    #[serde(default = "default_registration_markers")]
    pub registration_markers: Vec<String>,

    #[serde(default)]
    pub default_setup_minutes: i64,

    #[serde(default)]
    pub default_teardown_minutes: i64,
}

fn default_shared_markers() -> Vec<String> {
    vec!["shared".to_string(), "group".to_string()]
}
fn default_registration_markers() -> Vec<String> {
    vec!["registration".to_string()]
}

impl Default for MergeSettings {
    fn default() -> Self {
        MergeSettings {
            shared_calendar_markers: default_shared_markers(),
            registration_calendar_ids: Vec::new(),
            registration_markers: default_registration_markers(),
            default_setup_minutes: 0,
            default_teardown_minutes: 0,
        }
    }
}

// =============================================================================
// Location Settings
// =============================================================================

/// Location resolver tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationSettings {
    /// Minimum fuzzy score accepted as a match.
    #[serde(default = "default_fuzzy_threshold")]
    pub fuzzy_threshold: f64,

    #[serde(default = "default_containment_bonus")]
    pub containment_bonus: f64,

    #[serde(default = "default_first_word_bonus")]
    pub first_word_bonus: f64,

    #[serde(default = "default_shared_word_weight")]
    pub shared_word_weight: f64,

    /// Confidence reported for a location-code match.
    #[serde(default = "default_code_confidence")]
    pub code_confidence: f64,

    /// Longest token treated as a location code.
    #[serde(default = "default_max_code_len")]
    pub max_code_len: usize,
}

fn default_fuzzy_threshold() -> f64 {
    0.6
}
fn default_containment_bonus() -> f64 {
    0.2
}
fn default_first_word_bonus() -> f64 {
    0.1
}
fn default_shared_word_weight() -> f64 {
    0.1
}
fn default_code_confidence() -> f64 {
    0.95
}
fn default_max_code_len() -> usize {
    6
}

impl Default for LocationSettings {
    fn default() -> Self {
        LocationSettings {
            fuzzy_threshold: default_fuzzy_threshold(),
            containment_bonus: default_containment_bonus(),
            first_word_bonus: default_first_word_bonus(),
            shared_word_weight: default_shared_word_weight(),
            code_confidence: default_code_confidence(),
            max_code_len: default_max_code_len(),
        }
    }
}

impl LocationSettings {
    pub fn weights(&self) -> FuzzyWeights {
        FuzzyWeights {
            containment_bonus: self.containment_bonus,
            first_word_bonus: self.first_word_bonus,
            shared_word_weight: self.shared_word_weight,
        }
    }
}

// =============================================================================
// Bulk Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkSettings {
    /// Largest batch accepted by `bulk_load`.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
}

fn default_max_batch_size() -> usize {
    1000
}

impl Default for BulkSettings {
    fn default() -> Self {
        BulkSettings {
            max_batch_size: default_max_batch_size(),
        }
    }
}

// =============================================================================
// Main Configuration
// =============================================================================

/// Complete engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CalSyncConfig {
    #[serde(default)]
    pub database: DatabaseSettings,

    #[serde(default)]
    pub graph: GraphSettings,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub merge: MergeSettings,

    #[serde(default)]
    pub location: LocationSettings,

    #[serde(default)]
    pub bulk: BulkSettings,
}

impl CalSyncConfig {
    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (calsync.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading calsync config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Calsync config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.database.path.trim().is_empty() {
            return Err(SyncError::InvalidConfig("database.path must not be empty".into()));
        }

        let base = &self.graph.base_url;
        if !base.starts_with("http://") && !base.starts_with("https://") {
            return Err(SyncError::InvalidUrl(format!(
                "Graph base URL must start with http:// or https://, got: {}",
                base
            )));
        }
        url::Url::parse(base)?;

        if self.graph.page_size == 0 || self.graph.page_size > MAX_PAGE_SIZE {
            return Err(SyncError::InvalidConfig(format!(
                "graph.page_size must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }

        if self.sync.max_concurrent_calendars == 0 {
            return Err(SyncError::InvalidConfig(
                "sync.max_concurrent_calendars must be greater than 0".into(),
            ));
        }

        let threshold = self.location.fuzzy_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(SyncError::InvalidConfig(format!(
                "location.fuzzy_threshold must be in (0, 1], got {}",
                threshold
            )));
        }

        if self.bulk.max_batch_size == 0 {
            return Err(SyncError::InvalidConfig(
                "bulk.max_batch_size must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Applies overrides from an arbitrary lookup (the environment in
    /// production, a map in tests).
    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup("CALSYNC_DATABASE_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.database.path = path;
        }

        if let Some(url) = lookup("CALSYNC_GRAPH_BASE_URL") {
            debug!(url = %url, "Overriding Graph base URL from environment");
            self.graph.base_url = url.trim_end_matches('/').to_string();
        }

        if let Some(size) = lookup("CALSYNC_PAGE_SIZE") {
            match size.parse::<u32>() {
                Ok(n) => self.graph.page_size = n,
                Err(_) => warn!(value = %size, "Ignoring non-numeric CALSYNC_PAGE_SIZE"),
            }
        }

        if let Some(n) = lookup("CALSYNC_MAX_CONCURRENT_CALENDARS") {
            match n.parse::<usize>() {
                Ok(n) => self.sync.max_concurrent_calendars = n,
                Err(_) => warn!(value = %n, "Ignoring non-numeric CALSYNC_MAX_CONCURRENT_CALENDARS"),
            }
        }

        if let Some(t) = lookup("CALSYNC_FUZZY_THRESHOLD") {
            match t.parse::<f64>() {
                Ok(t) => self.location.fuzzy_threshold = t,
                Err(_) => warn!(value = %t, "Ignoring non-numeric CALSYNC_FUZZY_THRESHOLD"),
            }
        }

        if let Some(ids) = lookup("CALSYNC_REGISTRATION_CALENDARS") {
            self.merge.registration_calendar_ids = ids
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "calsync", "calsync")
            .map(|dirs| dirs.config_dir().join("calsync.toml"))
    }
}
