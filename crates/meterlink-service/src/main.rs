//! Meterlink Service - scheduled profile synchronization.
//!
//! Run with: `cargo run -p meterlink-service -- simulate`

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use time::OffsetDateTime;
use tracing::{info, warn};

use meterlink_core::{SystemClock, SyncMetrics};
use meterlink_service::{AppState, Config, Simulation, SimulationOptions};
use meterlink_store::Store;
use meterlink_types::ProfileId;

/// Meterlink Service - scheduled profile synchronization for smart meters.
#[derive(Parser, Debug)]
#[command(name = "meterlink-service")]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Path to configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Database path (overrides config).
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check the configuration and list the scheduled jobs.
    Validate,

    /// Synchronize against simulated meters built from the configuration.
    Simulate {
        /// Stop after this many rounds instead of running until Ctrl-C.
        #[arg(long)]
        cycles: Option<u32>,

        /// Hours of history each simulated profile holds.
        #[arg(long, default_value_t = 48)]
        history_hours: u64,

        /// Capture period of simulated interval profiles, in seconds.
        #[arg(long, default_value_t = meterlink_service::simulate::DEFAULT_CAPTURE_PERIOD_SECS)]
        capture_period: u64,

        /// Print job statistics as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List stored cursors.
    Cursors {
        /// Only this device.
        #[arg(long)]
        device: Option<String>,
    },

    /// Delete a cursor so the next cycle seeds it again.
    ResetCursor {
        /// Device serial.
        device: String,
        /// Profile identifier.
        profile: String,
    },

    /// List known devices with stored row counts.
    Devices,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("meterlink_service=info".parse()?)
                .add_directive("meterlink_core=info".parse()?),
        )
        .init();

    let config = load_config(&args)?;

    match args.command {
        Command::Validate => validate(&config),
        Command::Simulate {
            cycles,
            history_hours,
            capture_period,
            json,
        } => {
            let options = SimulationOptions {
                history: Duration::from_secs(history_hours * 3600),
                capture_period_secs: capture_period,
            };
            simulate(config, options, cycles, json).await
        }
        Command::Cursors { device } => list_cursors(&config, device.as_deref()),
        Command::ResetCursor { device, profile } => reset_cursor(&config, &device, &profile),
        Command::Devices => list_devices(&config),
    }
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };

    // Override config with CLI args
    if let Some(db_path) = &args.database {
        config.storage.path = db_path.clone();
    }

    config.validate()?;
    Ok(config)
}

fn open_store(config: &Config) -> anyhow::Result<Store> {
    info!("Opening database at {:?}", config.storage.path);
    Store::open(&config.storage.path)
        .with_context(|| format!("failed to open {}", config.storage.path.display()))
}

fn validate(config: &Config) -> anyhow::Result<()> {
    meterlink_service::ConfigMetadata::from_config(config)?;
    let jobs = meterlink_service::SyncJob::from_config(config);
    let registry = config.registry();

    println!("Configuration is valid: {} job(s)", jobs.len());
    for job in &jobs {
        let strategy = registry.resolve(job.model.as_deref(), &job.profile_id, None);
        println!(
            "  {} {:<24} every {:>6}s  ({})",
            job.device_id,
            job.profile_id.as_str(),
            job.interval.as_secs(),
            strategy.name()
        );
    }
    Ok(())
}

async fn simulate(
    config: Config,
    options: SimulationOptions,
    cycles: Option<u32>,
    json: bool,
) -> anyhow::Result<()> {
    let store = open_store(&config)?;
    for device in &config.devices {
        store.upsert_device(&device.serial, device.model.as_deref())?;
    }

    let simulation = Simulation::from_config(
        &config,
        &config.registry(),
        options,
        OffsetDateTime::now_utc(),
    )?;
    for profile in &simulation.profiles {
        info!(
            "Simulated {} on {}: {} rows ({})",
            profile.profile_id, profile.device_id, profile.rows, profile.strategy
        );
    }

    let state = AppState::new(
        config,
        store,
        simulation.network.tracker(),
        simulation.network.clone(),
        Arc::new(SystemClock),
    )?;
    let scheduler = state.scheduler();
    let sweeper = state.spawn_idle_sweeper(scheduler.cancellation_token());

    match cycles {
        Some(rounds) => {
            for round in 1..=rounds {
                let reports = scheduler.run_once().await;
                let inserted: usize = reports.iter().map(|r| r.inserted).sum();
                info!("Round {}: {} job(s), {} new rows", round, reports.len(), inserted);
            }
        }
        None => {
            scheduler.start();
            tokio::signal::ctrl_c().await?;
            info!("Shutting down");
        }
    }

    scheduler.shutdown().await;
    if let Some(sweeper) = sweeper
        && let Err(e) = sweeper.await
    {
        warn!("Idle sweeper ended abnormally: {}", e);
    }

    let stats = scheduler.stats().await;
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        print_stats(&stats, &state.metrics);
    }
    Ok(())
}

fn print_stats(stats: &[meterlink_service::JobStats], metrics: &SyncMetrics) {
    println!(
        "{:<16} {:<24} {:>7} {:>7} {:>9} {:>9}  cursor",
        "device", "profile", "cycles", "failed", "inserted", "recovered"
    );
    for s in stats {
        println!(
            "{:<16} {:<24} {:>7} {:>7} {:>9} {:>9}  {}",
            s.device_id,
            s.profile_id.as_str(),
            s.cycles,
            s.failures,
            s.rows_inserted,
            s.rows_recovered,
            s.cursor.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string())
        );
    }
    for series in metrics.summary() {
        if !series.failures.is_empty() {
            println!(
                "failures of {} on {}: {:?}",
                series.profile_id, series.device_id, series.failures
            );
        }
    }
}

fn list_cursors(config: &Config, device: Option<&str>) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let cursors = store.list_cursors(device)?;
    if cursors.is_empty() {
        println!("No cursors stored");
        return Ok(());
    }
    for cursor in cursors {
        println!(
            "{:<16} {:<24} {}  ({}, updated {})",
            cursor.device_id,
            cursor.profile_id.as_str(),
            cursor.last_timestamp,
            cursor.capture_period,
            cursor.updated_at
        );
    }
    Ok(())
}

fn reset_cursor(config: &Config, device: &str, profile: &str) -> anyhow::Result<()> {
    let store = open_store(config)?;
    if store.delete_cursor(device, &ProfileId::from(profile))? {
        println!("Cursor of {} on {} deleted", profile, device);
    } else {
        println!("No cursor stored for {} on {}", profile, device);
    }
    Ok(())
}

fn list_devices(config: &Config) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let devices = store.list_devices()?;
    if devices.is_empty() {
        println!("No devices stored");
        return Ok(());
    }
    for device in devices {
        let rows = store.count_rows(Some(&device.id), None)?;
        println!(
            "{:<16} {:<10} {:>8} rows  last seen {}",
            device.id,
            device.model.as_deref().unwrap_or("-"),
            rows,
            device.last_seen
        );
    }
    Ok(())
}
