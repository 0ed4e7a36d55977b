//! CLI entry point for daq-capture
//!
//! Provides a command-line interface for:
//! - Running the capture core against the configured station
//! - Replaying leftover session buffers without opening the instrument
//! - Validating a protocol profile registry
//!
//! # Usage
//!
//! ```bash
//! daq-capture run --config config/capture.toml
//! daq-capture recover --config config/capture.toml
//! daq-capture check-profiles config/profiles.toml
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use daq_capture::buffer;
use daq_capture::events::{BroadcastEventSink, EventPublisher, FanoutSink, TracingEventSink};
use daq_capture::logging;
use daq_capture::profile::ProfileRegistry;
use daq_capture::store::orphaned_measurements;
use daq_capture::transport::build_transport;
use daq_capture::{CaptureConfig, CaptureRuntime, EventSink, MeasurementStore, SqliteStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "daq-capture")]
#[command(about = "Crash-resistant capture core for a serial-attached instrument", long_about = None)]
struct Cli {
    /// Station configuration file
    #[arg(long, global = true, default_value = "config/capture.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the instrument and capture until interrupted
    Run {
        /// Start with this profile instead of the configured one
        #[arg(long)]
        profile: Option<String>,
    },

    /// Replay leftover session buffers into the store and exit
    Recover,

    /// Load and validate a profile registry
    CheckProfiles {
        /// Registry file (defaults to the configured `station.profiles_path`)
        path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { profile } => {
            let mut config = load_config(&cli.config)?;
            if let Some(profile) = profile {
                config.station.profile = profile;
            }
            run(config).await
        }
        Commands::Recover => recover(load_config(&cli.config)?).await,
        Commands::CheckProfiles { path } => {
            let path = match path {
                Some(path) => path,
                None => load_config(&cli.config)?.station.profiles_path,
            };
            check_profiles(&path)
        }
    }
}

fn load_config(path: &Path) -> Result<CaptureConfig> {
    let config = CaptureConfig::load_from(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;
    config.validate().context("invalid configuration")?;
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;
    Ok(config)
}

fn open_store(config: &CaptureConfig) -> Result<Arc<SqliteStore>> {
    let path = &config.store.database_path;
    let store = SqliteStore::open(path.clone())
        .with_context(|| format!("failed to open store at {}", path.display()))?;
    Ok(Arc::new(store))
}

async fn run(config: CaptureConfig) -> Result<()> {
    let registry = ProfileRegistry::load(&config.station.profiles_path).with_context(|| {
        format!(
            "failed to load profiles from {}",
            config.station.profiles_path.display()
        )
    })?;
    let profile = registry.get(&config.station.profile)?;
    let transport = build_transport(profile, &config.station)?;
    let store = open_store(&config)?;

    let sink: Arc<dyn EventSink> = Arc::new(
        FanoutSink::new()
            .with(Arc::new(TracingEventSink))
            .with(Arc::new(BroadcastEventSink::new(256))),
    );

    info!(
        profile = %config.station.profile,
        database = %config.store.database_path.display(),
        "Starting capture"
    );
    let runtime = CaptureRuntime::start(&config, Arc::new(registry), transport, store, sink)
        .await
        .context("capture failed to start")?;

    tokio::select! {
        _ = shutdown_signal() => info!("Signal received"),
        _ = runtime.stopped() => warn!("Engine stopped on its own"),
    }

    let report = runtime.shutdown().await;
    report.engine.context("engine stopped with an error")?;
    Ok(())
}

async fn recover(config: CaptureConfig) -> Result<()> {
    let store = open_store(&config)?;
    let publisher = EventPublisher::new(
        Arc::new(TracingEventSink),
        store.clone() as Arc<dyn MeasurementStore>,
    );
    let report = buffer::recover(&config.buffer.dir, store.as_ref(), &publisher)
        .await
        .with_context(|| format!("recovery failed in {}", config.buffer.dir.display()))?;

    println!(
        "files: {}  replayed: {}  duplicates: {}  lost: {}  kept: {}",
        report.files.len(),
        report.replayed(),
        report.duplicates(),
        report.lost(),
        report.kept()
    );
    for file in &report.files {
        println!("  {} -> {:?}", file.path.display(), file.outcome);
    }

    let orphaned = orphaned_measurements(&store).await?;
    if orphaned > 0 {
        anyhow::bail!("{orphaned} measurements have no source frame");
    }
    Ok(())
}

fn check_profiles(path: &Path) -> Result<()> {
    let registry = ProfileRegistry::load(path)
        .with_context(|| format!("failed to load profiles from {}", path.display()))?;
    println!("{} profile(s) in {}", registry.len(), path.display());
    for name in registry.names() {
        let chain: Vec<&str> = registry
            .fallback_chain(name)
            .into_iter()
            .map(|p| p.name.as_str())
            .collect();
        println!("  {}", chain.join(" -> "));
    }
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
