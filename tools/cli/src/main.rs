//! Lantern CLI - operator tool for the offline core.
//!
//! Inspects and drives a local offline store: queue actions, replay them
//! against an HTTP endpoint, manage the TTL cache and watch connectivity.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use url::Url;

use lantern_app::{CoreConfig, OfflineCore, SyncMode, UserNotification};
use lantern_common::{ErrorKind, Severity};

/// Environment variable overriding the configured API base URL.
const API_URL_ENV: &str = "LANTERN_API_URL";
/// Environment variable supplying the bearer token for replays.
const AUTH_TOKEN_ENV: &str = "LANTERN_AUTH_TOKEN";

#[derive(Parser)]
#[command(name = "lantern")]
#[command(about = "Lantern - offline queue and cache management")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (default: platform config dir).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Sqlite database to operate on, overriding the configuration.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a configuration file with default settings.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },

    /// Queue an action for replay.
    Enqueue {
        /// Action kind (selects the endpoint path).
        #[arg(short, long)]
        kind: String,

        /// Opaque payload, usually JSON.
        #[arg(short, long)]
        payload: String,

        /// Retries allowed after the first attempt.
        #[arg(short, long)]
        max_retries: Option<u32>,
    },

    /// List queued actions, oldest first.
    Pending {
        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Replay every queued action against the API.
    Drain {
        /// API base URL, overriding configuration and environment.
        #[arg(short, long)]
        endpoint: Option<String>,
    },

    /// Manage the TTL cache.
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },

    /// Record an error through the classifier.
    Report {
        /// Error message.
        message: String,

        /// Error kind: network, api, validation, runtime, auth, permission.
        #[arg(short, long, default_value = "runtime")]
        kind: ErrorKind,

        /// Severity: low, medium, high, critical.
        #[arg(short, long, default_value = "medium")]
        severity: Severity,

        /// Record the error without notifying.
        #[arg(short, long)]
        quiet: bool,
    },

    /// Delete all queued actions, cache entries and preferences.
    Clear {
        /// Confirm the deletion.
        #[arg(long)]
        yes: bool,
    },

    /// Monitor connectivity and drain the queue whenever the API is reachable.
    Watch {
        /// API base URL, overriding configuration and environment.
        #[arg(short, long)]
        endpoint: Option<String>,

        /// Probe interval in seconds.
        #[arg(short, long)]
        interval: Option<u64>,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Store a JSON value.
    Set {
        key: String,
        /// JSON value; plain text is stored as a string.
        value: String,
        /// Time to live in minutes.
        #[arg(short, long)]
        ttl: Option<u32>,
    },
    /// Print a value unless it has expired.
    Get { key: String },
    /// Remove a value.
    Remove { key: String },
    /// Delete every expired entry.
    Sweep,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config_path = match cli.config {
        Some(path) => path,
        None => CoreConfig::default_path()?,
    };

    if let Commands::Init { force } = cli.command {
        return cmd_init(&config_path, force).await;
    }

    let mut config = CoreConfig::load(&config_path)
        .await
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    if let Some(db) = cli.db {
        config.store = "sqlite".to_string();
        config.database_path = Some(db);
    }
    if let Ok(url) = std::env::var(API_URL_ENV) {
        config.api_base_url = Some(url);
    }

    match cli.command {
        Commands::Init { .. } => unreachable!("handled above"),

        Commands::Enqueue {
            kind,
            payload,
            max_retries,
        } => cmd_enqueue(&config, &kind, &payload, max_retries).await,

        Commands::Pending { json } => cmd_pending(&config, json).await,

        Commands::Drain { endpoint } => cmd_drain(config, endpoint).await,

        Commands::Cache { command } => cmd_cache(&config, command).await,

        Commands::Report {
            message,
            kind,
            severity,
            quiet,
        } => cmd_report(&config, &message, kind, severity, quiet).await,

        Commands::Clear { yes } => cmd_clear(&config, yes).await,

        Commands::Watch { endpoint, interval } => cmd_watch(config, endpoint, interval).await,
    }
}

async fn open_core(config: &CoreConfig) -> Result<OfflineCore> {
    OfflineCore::from_config(config)
        .await
        .context("Failed to open offline store")
}

/// Apply an endpoint override and require that some endpoint is configured.
fn with_endpoint(mut config: CoreConfig, endpoint: Option<String>) -> Result<CoreConfig> {
    if let Some(endpoint) = endpoint {
        Url::parse(&endpoint).with_context(|| format!("Invalid endpoint URL: {}", endpoint))?;
        config.api_base_url = Some(endpoint);
    }
    if config.api_base_url.is_none() {
        anyhow::bail!(
            "No API endpoint. Pass --endpoint, set {} or add api_base_url to the config",
            API_URL_ENV
        );
    }
    Ok(config)
}

/// Store the token from the environment so replays can authenticate.
async fn apply_auth_token(core: &OfflineCore) -> Result<()> {
    if let Ok(token) = std::env::var(AUTH_TOKEN_ENV) {
        core.preferences()
            .set_auth_token(&token)
            .await
            .context("Failed to store auth token")?;
    }
    Ok(())
}

fn print_notification(notification: &UserNotification) {
    let style = serde_json::to_value(notification.style)
        .ok()
        .and_then(|v| v.as_str().map(str::to_uppercase))
        .unwrap_or_default();
    println!("[{}] {}: {}", style, notification.title, notification.message);
    if !notification.actions.is_empty() {
        let labels: Vec<&str> = notification.actions.iter().map(|a| a.label()).collect();
        println!("        actions: {}", labels.join(", "));
    }
}

fn print_pending_notifications(rx: &mut broadcast::Receiver<UserNotification>) {
    loop {
        match rx.try_recv() {
            Ok(notification) => print_notification(&notification),
            Err(TryRecvError::Lagged(skipped)) => warn!("{} notifications dropped", skipped),
            Err(_) => break,
        }
    }
}

/// Write a default configuration file.
async fn cmd_init(path: &Path, force: bool) -> Result<()> {
    if tokio::fs::try_exists(path).await.unwrap_or(false) && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }

    CoreConfig::default()
        .save(path)
        .await
        .context("Failed to write config")?;

    println!("Configuration written to {}", path.display());
    Ok(())
}

/// Queue an action.
async fn cmd_enqueue(config: &CoreConfig, kind: &str, payload: &str, max_retries: Option<u32>) -> Result<()> {
    let core = open_core(config).await?;

    let id = core
        .enqueue(kind, payload, max_retries)
        .await
        .context("Failed to enqueue action")?;

    println!("Queued {} ({})", id, kind);
    Ok(())
}

/// List queued actions.
async fn cmd_pending(config: &CoreConfig, json: bool) -> Result<()> {
    let core = open_core(config).await?;
    let pending = core.pending().await.context("Failed to read queue")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&pending)?);
        return Ok(());
    }

    if pending.is_empty() {
        println!("Queue is empty.");
    } else {
        println!("{} pending action(s):", pending.len());
        for action in pending {
            println!(
                "  {}  {:<16} retries {}/{}  queued {}",
                action.id,
                action.kind,
                action.retry_count,
                action.max_retries,
                action.enqueued_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
    }

    Ok(())
}

/// Replay the queue once, waiting for scheduled retries.
async fn cmd_drain(config: CoreConfig, endpoint: Option<String>) -> Result<()> {
    let config = with_endpoint(config, endpoint)?;
    let core = open_core(&config).await?;
    apply_auth_token(&core).await?;
    let mut notifications = core.subscribe();

    if !core.is_online() {
        println!("API is unreachable; actions stay queued.");
        return Ok(());
    }

    let report = core.drain().await.context("Drain failed")?;
    info!("Waiting for scheduled retries");
    core.wait_idle().await;

    println!(
        "Drain finished: {} succeeded, {} retried, {} abandoned, {} without handler",
        report.succeeded, report.rescheduled, report.abandoned, report.unhandled
    );
    print_pending_notifications(&mut notifications);

    let remaining = core.pending().await?.len();
    if remaining > 0 {
        println!("{} action(s) still queued.", remaining);
    }
    Ok(())
}

/// Cache operations.
async fn cmd_cache(config: &CoreConfig, command: CacheCommands) -> Result<()> {
    let core = open_core(config).await?;

    match command {
        CacheCommands::Set { key, value, ttl } => {
            let data = serde_json::from_str(&value).unwrap_or(serde_json::Value::String(value));
            core.cache(&key, data, ttl).await.context("Failed to cache value")?;
            println!("Cached {}", key);
        }
        CacheCommands::Get { key } => match core.read_cache(&key).await? {
            Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
            None => println!("{} is not cached or has expired.", key),
        },
        CacheCommands::Remove { key } => {
            core.remove_cache(&key).await?;
            println!("Removed {}", key);
        }
        CacheCommands::Sweep => {
            let removed = core.cleanup_expired_cache().await?;
            println!("Removed {} expired entr{}", removed, if removed == 1 { "y" } else { "ies" });
        }
    }

    Ok(())
}

/// Classify and record an error.
async fn cmd_report(
    config: &CoreConfig,
    message: &str,
    kind: ErrorKind,
    severity: Severity,
    quiet: bool,
) -> Result<()> {
    let core = open_core(config).await?;
    let mut notifications = core.subscribe();

    let record = core
        .report_error(message, Some(kind), Some(severity), BTreeMap::new(), quiet.then_some(false))
        .await;

    println!("Recorded error {} ({}, {:?})", record.id, kind, severity);
    print_pending_notifications(&mut notifications);
    Ok(())
}

/// Wipe all local data.
async fn cmd_clear(config: &CoreConfig, yes: bool) -> Result<()> {
    if !yes {
        anyhow::bail!("Refusing to delete all offline data without --yes");
    }

    let core = open_core(config).await?;
    core.clear_all_data().await.context("Failed to clear data")?;

    println!("All offline data cleared.");
    Ok(())
}

/// Probe the API periodically and drain on reconnect until interrupted.
async fn cmd_watch(config: CoreConfig, endpoint: Option<String>, interval: Option<u64>) -> Result<()> {
    let mut config = with_endpoint(config, endpoint)?;
    if let Some(secs) = interval {
        config.probe_interval_secs = secs;
    }
    let core = open_core(&config).await?;
    apply_auth_token(&core).await?;
    let _panics = core.capture_panics();

    let mut notifications = core.subscribe();
    let mut connectivity = core.monitor().subscribe();
    let (scheduler, task) = core.start_scheduler(SyncMode::Periodic {
        interval: config.probe_interval(),
    });

    println!(
        "Watching {} every {}s ({}). Press Ctrl+C to stop.",
        config.api_base_url.as_deref().unwrap_or_default(),
        config.probe_interval().as_secs(),
        if core.is_online() { "online" } else { "offline" }
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = connectivity.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *connectivity.borrow_and_update();
                println!("Connectivity: {:?}", state);
            }
            notification = notifications.recv() => match notification {
                Ok(notification) => print_notification(&notification),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("{} notifications dropped", skipped)
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    info!("Stopping watcher");
    scheduler.shutdown().await;
    let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
    core.wait_idle().await;
    core.close().await?;
    Ok(())
}
