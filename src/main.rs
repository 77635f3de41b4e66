use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use racesync::config::Config;
use racesync::engine::SyncEngine;
use racesync::server::SyncApiServer;
use racesync::storage::Database;

#[derive(Parser)]
#[command(
    name = "racesync",
    version,
    about = "Adaptive sync scheduler and job queue for race-registration providers",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a TOML config file (defaults to RACESYNC_* environment variables)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the SQLite database path
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json)
    #[arg(long, global = true, default_value = "text")]
    log_format: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tick loop, the watchdog and the operator API
    Serve {
        /// Override the API bind address
        #[arg(short, long)]
        bind: Option<String>,

        /// Disable the stuck job watchdog
        #[arg(long, default_value = "false")]
        no_watchdog: bool,
    },

    /// Run a single scheduling pass and exit
    Tick,

    /// Enqueue a full sync now for one event or a whole provider
    Sync {
        /// Tenant identifier
        #[arg(short, long)]
        tenant: String,

        /// Provider identifier
        #[arg(short, long)]
        provider: String,

        /// Restrict to one provider event
        #[arg(short, long)]
        event: Option<String>,
    },

    /// Show job counts per provider
    Stats,

    /// Requeue (or fail) jobs stuck in the running state
    RequeueStuck,

    /// Create the database and schema if missing
    InitDb,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_tracing(&cli.log_format, cli.verbose)?;

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.database.path = db;
    }
    config.validate()?;

    tracing::info!(database = %config.database.path.display(), "racesync starting");

    match cli.command {
        Commands::Serve { bind, no_watchdog } => {
            if let Some(bind) = bind {
                config.server.bind_address = bind
                    .parse()
                    .with_context(|| format!("Invalid bind address: {bind}"))?;
            }
            if no_watchdog {
                config.watchdog.enabled = false;
            }
            serve(config).await?;
        }

        Commands::Tick => {
            let engine = SyncEngine::open(&config)?;
            match engine.handle().tick_now().await? {
                Some(report) => println!("{}", serde_json::to_string_pretty(&report)?),
                None => println!("A tick is already in progress"),
            }
        }

        Commands::Sync {
            tenant,
            provider,
            event,
        } => {
            tracing::info!(
                tenant_id = %tenant,
                provider_id = %provider,
                event_id = ?event,
                "Starting manual sync command"
            );
            let engine = SyncEngine::open(&config)?;
            let report = engine
                .handle()
                .manual_sync(&tenant, &provider, event.as_deref())
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Commands::Stats => {
            let engine = SyncEngine::open(&config)?;
            let counts = engine.handle().job_stats().await?;
            if counts.is_empty() {
                println!("No jobs recorded");
            } else {
                println!(
                    "{:<24} {:>8} {:>8} {:>8} {:>8}",
                    "PROVIDER", "PENDING", "RUNNING", "SUCCESS", "FAILED"
                );
                for c in counts {
                    println!(
                        "{:<24} {:>8} {:>8} {:>8} {:>8}",
                        c.provider_id, c.pending, c.running, c.success, c.failed
                    );
                }
            }
        }

        Commands::RequeueStuck => {
            let engine = SyncEngine::open(&config)?;
            let report = engine.handle().requeue_stuck().await?;
            println!("Requeued: {:?}", report.requeued);
            println!("Failed:   {:?}", report.failed);
        }

        Commands::InitDb => {
            Database::open(&config.database.path).with_context(|| {
                format!(
                    "Failed to initialize database: {}",
                    config.database.path.display()
                )
            })?;
            println!("Database ready at {}", config.database.path.display());
        }
    }

    Ok(())
}

fn load_config(path: Option<&std::path::Path>) -> Result<Config> {
    match path {
        Some(path) => Config::from_file(path),
        None => Config::from_env(),
    }
}

async fn serve(config: Config) -> Result<()> {
    if let Err(e) = racesync::metrics::init_metrics() {
        tracing::warn!(error = %e, "Metrics disabled");
    }

    let engine = SyncEngine::start(&config).await?;
    let server = SyncApiServer::new(config.server.clone(), engine.handle());

    let result = server
        .start_with_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown signal received");
        })
        .await;

    engine.stop().await?;
    result?;
    Ok(())
}

fn setup_tracing(format: &str, verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("racesync=debug,info")
    } else {
        tracing_subscriber::EnvFilter::new("racesync=info,warn")
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
    }

    Ok(())
}
