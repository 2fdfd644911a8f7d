//! # calsync
//!
//! Command-line driver for the sync engine.
//!
//! ```text
//! calsync sync    --owner me --calendar AAMk1 --calendar AAMk2 [--full] [--days 30]
//! calsync reset   --owner me --calendar AAMk1
//! calsync resolve "Main Chapel; Rm FH-2"
//! calsync load    --owner me --file events.json
//! calsync status  --owner me
//! calsync init    [--force]
//! ```
//!
//! The Graph access token is read from `CALSYNC_ACCESS_TOKEN`.

use std::path::PathBuf;
use std::sync::Arc;

use calsync_core::validation::validate_window_days;
use calsync_core::{RemoteEvent, TimeWindow};
use calsync_db::{Database, DbConfig};
use calsync_engine::{CalSyncConfig, CalendarSyncService, GraphClient, StaticToken};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

const ACCESS_TOKEN_VAR: &str = "CALSYNC_ACCESS_TOKEN";

#[derive(Parser)]
#[command(name = "calsync")]
#[command(about = "Mirror remote calendars into a local enriched event store")]
struct Cli {
    /// Path to calsync.toml (defaults to the platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pull changes for one or more calendars
    Sync {
        #[arg(long)]
        owner: String,

        #[arg(short, long = "calendar", required = true)]
        calendars: Vec<String>,

        /// Ignore stored cursors
        #[arg(long)]
        full: bool,

        /// Only keep events within this many days from now (full syncs)
        #[arg(long)]
        days: Option<i64>,
    },
    /// Drop a calendar's delta cursor
    Reset {
        #[arg(long)]
        owner: String,

        #[arg(short, long)]
        calendar: String,
    },
    /// Match free text against known locations
    Resolve { text: String },
    /// Bulk-update mirrored events from a JSON array of remote events
    Load {
        #[arg(long)]
        owner: String,

        #[arg(long)]
        file: PathBuf,
    },
    /// Show how many live events are mirrored
    Status {
        #[arg(long)]
        owner: String,
    },
    /// Write the effective configuration to calsync.toml
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let cli = Cli::parse();

    let config = CalSyncConfig::load(cli.config.clone())?;

    if let Commands::Init { force } = cli.command {
        let path = cli
            .config
            .or_else(CalSyncConfig::default_config_path)
            .ok_or("no config directory available, pass --config")?;
        if path.exists() && !force {
            return Err(format!("{} already exists, pass --force to overwrite", path.display()).into());
        }
        config.save(Some(path.clone()))?;
        println!("wrote {}", path.display());
        return Ok(());
    }

    let db_path = PathBuf::from(&config.database.path);
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let db = Database::new(DbConfig::new(&db_path)).await?;
    info!(path = %db_path.display(), "Database ready");

    let token = std::env::var(ACCESS_TOKEN_VAR).unwrap_or_default();
    let graph = GraphClient::new(config.graph.clone(), Arc::new(StaticToken::new(token)))?;
    let default_days = config.sync.default_window_days;
    let service = CalendarSyncService::new(config, &db, Arc::new(graph));

    match cli.command {
        Commands::Sync {
            owner,
            calendars,
            full,
            days,
        } => {
            let days = days.unwrap_or(default_days);
            validate_window_days(days)?;
            let now = Utc::now();
            let window = TimeWindow::new(now - Duration::days(days), now + Duration::days(days))?;

            let summary = service.sync_calendars(&owner, calendars, Some(window), full).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Reset { owner, calendar } => {
            service.reset_cursor(&owner, &calendar).await?;
            println!("cursor reset: {calendar}");
        }
        Commands::Resolve { text } => {
            let matched = service.resolve_location(&text).await?;
            println!("{}", serde_json::to_string_pretty(&matched)?);
        }
        Commands::Load { owner, file } => {
            let contents = std::fs::read_to_string(&file)?;
            let events: Vec<RemoteEvent> = serde_json::from_str(&contents)?;
            let result = service.bulk_load(&owner, &events).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Status { owner } => {
            let count = service.active_event_count(&owner).await?;
            println!("{owner}: {count} live events");
        }
        // Written above, before the database is opened.
        Commands::Init { .. } => {}
    }

    db.close().await;
    Ok(())
}

/// Initializes the tracing subscriber.
///
/// `RUST_LOG` overrides the default of `info,calsync=debug,sqlx=warn`.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,calsync=debug,sqlx=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
