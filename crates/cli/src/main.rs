//! Administrative CLI for the weave sync storage engine.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use weave_core::UserId;
use weave_core::config::AppConfig;
use weave_storage::SyncStorage;

#[derive(Parser)]
#[command(name = "weavectl")]
#[command(about = "Administrative CLI for weave sync storage")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "WEAVE_CONFIG", default_value = "weave.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Commands {
    /// Create missing tables
    Migrate,
    /// Check database and cache connectivity
    Health,
    /// Check connectivity, then print this process's Prometheus metrics
    Metrics,
    /// Show quota usage of a user
    Usage {
        user_id: UserId,
        /// Recompute cached totals from the database
        #[arg(long, default_value_t = false)]
        recalculate: bool,
    },
    /// List a user's collections with timestamps and counts
    Collections { user_id: UserId },
    /// Remove a user with all collections and items
    DeleteUser {
        user_id: UserId,
        /// Skip the confirmation check
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
    /// Remove every collection and item of a user, keeping the user
    PurgeStorage {
        user_id: UserId,
        /// Skip the confirmation check
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = load_config(Path::new(&cli.config))?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;

    weave_server::metrics::register_metrics();
    let storage = weave_storage::from_config(&config.storage)
        .await
        .context("failed to initialize storage")?;
    tracing::debug!(backend = storage.name(), "Storage backend initialized");

    run(cli.command, storage).await
}

/// Load configuration from an optional TOML file, overridden by `WEAVE_`
/// environment variables (`WEAVE_STORAGE__DATABASE__URL=...`).
fn load_config(path: &Path) -> Result<AppConfig> {
    let mut figment = Figment::new();
    if path.exists() {
        tracing::debug!(config_path = %path.display(), "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::debug!("No config file found at {}", path.display());
    }
    figment
        .merge(Env::prefixed("WEAVE_").ignore(&["CONFIG"]).split("__"))
        .extract()
        .context("failed to load configuration")
}

async fn run(command: Commands, storage: Arc<dyn SyncStorage>) -> Result<()> {
    match command {
        Commands::Migrate => {
            storage.migrate().await.context("migration failed")?;
            println!("Tables ready");
        }
        Commands::Health => {
            storage
                .health_check()
                .await
                .context("storage health check failed")?;
            println!("{} backend healthy", storage.name());
        }
        Commands::Metrics => {
            if let Err(e) = storage.health_check().await {
                tracing::warn!(error = %e, "Storage health check failed");
            }
            let text = weave_server::metrics::render().context("failed to encode metrics")?;
            print!("{text}");
        }
        Commands::Usage {
            user_id,
            recalculate,
        } => {
            let used = storage.get_total_size(user_id, recalculate).await?;
            let sizes = storage.get_collection_sizes(user_id).await?;
            let quota = storage.quota();
            let left = if quota.enabled {
                Some(storage.get_size_left(user_id, false).await?)
            } else {
                None
            };
            print_json(&json!({
                "user_id": user_id,
                "used_kb": used,
                "limit_kb": quota.enabled.then_some(quota.size_kb),
                "left_kb": left,
                "collections": sizes,
            }))?;
        }
        Commands::Collections { user_id } => {
            let stamps = storage.get_collection_timestamps(user_id).await?;
            let counts = storage.get_collection_counts(user_id).await?;
            let collections: Vec<_> = stamps
                .iter()
                .map(|(name, modified)| {
                    json!({
                        "name": name,
                        "modified": modified,
                        "count": counts.get(name).copied().unwrap_or(0),
                    })
                })
                .collect();
            print_json(&collections)?;
        }
        Commands::DeleteUser { user_id, yes } => {
            confirm(yes, "delete-user", user_id)?;
            storage.delete_user(user_id).await?;
            tracing::info!(user_id, "User deleted");
            println!("Deleted user {user_id}");
        }
        Commands::PurgeStorage { user_id, yes } => {
            confirm(yes, "purge-storage", user_id)?;
            storage.delete_storage(user_id).await?;
            tracing::info!(user_id, "User storage purged");
            println!("Purged storage of user {user_id}");
        }
    }
    Ok(())
}

fn confirm(yes: bool, command: &str, user_id: UserId) -> Result<()> {
    if !yes {
        anyhow::bail!("{command} removes data of user {user_id}; pass --yes to proceed");
    }
    Ok(())
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
