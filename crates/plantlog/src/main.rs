// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Plantlog CLI
//!
//! Runs the acquisition service and inspects its store.
//!
//! # Usage
//!
//! ```bash
//! # Write an example configuration
//! plantlog gen-config --output plantlog.toml
//!
//! # Run against the simulated backend, injecting 5% faults
//! plantlog --config plantlog.toml --fault-rate 0.05
//!
//! # Poll real modules (built with --features opcua-backend)
//! plantlog --config plantlog.toml --backend opcua
//!
//! # Inspect the store
//! plantlog stats --db plantlog.db
//! plantlog export --db plantlog.db "Bottom Cover Module" > bottom.jsonl
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use plantlog::{
    AcquisitionService, ProtocolClient, ReadingStore, ServiceConfig, SimulatedClient, SqliteStore,
};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Plantlog acquisition service
#[derive(Parser, Debug)]
#[command(name = "plantlog")]
#[command(about = "Plantlog - resilient acquisition of automation tags into a durable store")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides the config
    #[arg(long)]
    log_level: Option<String>,

    /// Protocol backend used to poll the sources
    #[arg(long, value_enum, default_value_t = Backend::Simulated)]
    backend: Backend,

    /// Fault rate injected by the simulated backend (0.0 - 1.0)
    #[arg(long, default_value_t = 0.0)]
    fault_rate: f64,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Backend {
    /// Generated values, optional fault injection
    Simulated,
    /// OPC UA endpoints
    Opcua,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate example configuration file
    GenConfig {
        /// Output file path
        #[arg(short, long, default_value = "plantlog.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Show stored reading counts per source
    Stats {
        /// Database path (SQLite file)
        #[arg(short, long, default_value = "plantlog.db")]
        db: PathBuf,
    },

    /// Export stored readings of one source as JSON lines
    Export {
        /// Database path (SQLite file)
        #[arg(short, long, default_value = "plantlog.db")]
        db: PathBuf,

        /// Source name
        source: String,

        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show the latest value of every tag of one source
    Latest {
        /// Database path (SQLite file)
        #[arg(short, long, default_value = "plantlog.db")]
        db: PathBuf,

        /// Source name
        source: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match (&args.command, &args.config) {
        (None, Some(path)) => Some(
            ServiceConfig::from_file(path)
                .with_context(|| format!("Failed to load {}", path.display()))?,
        ),
        _ => None,
    };

    // Initialize logging
    let level = args
        .log_level
        .clone()
        .or_else(|| config.as_ref().map(|c| c.service.log_level.clone()))
        .unwrap_or_else(|| "info".to_string());
    let filter = EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // Handle subcommands
    if let Some(cmd) = args.command {
        return match cmd {
            Commands::GenConfig { output } => cmd_gen_config(output),
            Commands::Validate { config } => cmd_validate(config),
            Commands::Stats { db } => cmd_stats(db),
            Commands::Export { db, source, output } => cmd_export(db, &source, output),
            Commands::Latest { db, source } => cmd_latest(db, &source),
        };
    }

    let Some(config) = config else {
        bail!("--config is required to run the service (see `plantlog gen-config`)");
    };

    run_service(config, args.backend, args.fault_rate).await
}

#[cfg(feature = "opcua-backend")]
fn opcua_client(config: &ServiceConfig) -> Result<Arc<dyn ProtocolClient>> {
    Ok(Arc::new(plantlog::ua::OpcUaClient::new(&config.service.name)))
}

#[cfg(not(feature = "opcua-backend"))]
fn opcua_client(_config: &ServiceConfig) -> Result<Arc<dyn ProtocolClient>> {
    bail!("OPC UA support is not compiled in (rebuild with --features opcua-backend)")
}

async fn run_service(config: ServiceConfig, backend: Backend, fault_rate: f64) -> Result<()> {
    let client: Arc<dyn ProtocolClient> = match backend {
        Backend::Simulated => Arc::new(SimulatedClient::new(fault_rate)),
        Backend::Opcua => {
            if fault_rate > 0.0 {
                tracing::warn!("--fault-rate only applies to the simulated backend");
            }
            opcua_client(&config)?
        }
    };
    let store = SqliteStore::open(&config.store.path)
        .with_context(|| format!("Failed to open store {}", config.store.path))?;

    println!("Plantlog v{}", env!("CARGO_PKG_VERSION"));
    println!("=====================================");
    println!("Backend: {:?}", backend);
    println!();
    for source in &config.sources {
        println!(
            "Source: {} ({}, {} tags, every {} ms)",
            source.name,
            source.endpoint,
            source.tags.len(),
            source.poll_interval_ms
        );
    }
    println!();
    println!("Press Ctrl+C to stop...");
    println!();

    let cancel = CancellationToken::new();
    let running = AcquisitionService::new(config, client, Arc::new(store))
        .start(cancel.clone())
        .await?;

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Ctrl+C received");
                cancel.cancel();
            }
            Err(e) => tracing::error!("Cannot listen for Ctrl+C: {}", e),
        }
    });

    let report = running.join().await?;

    println!();
    println!("Final statistics:");
    for source in &report.health.sources {
        println!(
            "  {}: {} acquired, {} committed, {} dropped, {} reconnects, {} gaps",
            source.name,
            source.readings_acquired,
            source.readings_committed,
            source.dropped,
            source.reconnects,
            source.sequence_gaps
        );
    }
    println!(
        "  Writer: {} batches, {} readings, {} duplicates, {} failures",
        report.health.writer.batches_committed,
        report.health.writer.readings_committed,
        report.health.writer.duplicates_skipped,
        report.health.writer.write_failures
    );
    println!(
        "  Unacknowledged: {} (spilled {}, discarded {})",
        report.unacked, report.spilled, report.discarded
    );

    Ok(())
}

fn cmd_gen_config(output: PathBuf) -> Result<()> {
    let content = toml::to_string_pretty(&ServiceConfig::example())?;
    std::fs::write(&output, content)?;
    println!("Generated example configuration: {}", output.display());
    Ok(())
}

fn cmd_validate(path: PathBuf) -> Result<()> {
    match ServiceConfig::from_file(&path) {
        Ok(config) => {
            println!("Configuration is valid: {}", path.display());
            println!("  Sources: {}", config.sources.len());
            for source in &config.sources {
                let watched = source.tags.iter().filter(|t| t.on_change).count();
                println!(
                    "    - {}: {} tags ({} on change) @ {}",
                    source.name,
                    source.tags.len(),
                    watched,
                    source.endpoint
                );
            }
            Ok(())
        }
        Err(e) => bail!("Configuration error: {}", e),
    }
}

fn cmd_stats(db: PathBuf) -> Result<()> {
    let store = SqliteStore::open_read_only(&db)?;

    println!("Stored sources:");
    for (source, count) in store.sources()? {
        let max = store
            .max_sequence(&source)?
            .map_or_else(|| "-".to_string(), |m| m.to_string());
        println!("  {} ({} readings, last sequence {})", source, count, max);
    }
    println!("Total readings stored: {}", store.count()?);
    Ok(())
}

fn cmd_export(db: PathBuf, source: &str, output: Option<PathBuf>) -> Result<()> {
    let store = SqliteStore::open_read_only(&db)?;
    let readings = store.load(source)?;

    let sink: Box<dyn Write> = match &output {
        Some(path) => Box::new(std::fs::File::create(path)?),
        None => Box::new(std::io::stdout().lock()),
    };
    let mut out = BufWriter::new(sink);
    for reading in &readings {
        serde_json::to_writer(&mut out, reading)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;

    if let Some(path) = output {
        println!("Exported {} readings to {}", readings.len(), path.display());
    }
    Ok(())
}

fn cmd_latest(db: PathBuf, source: &str) -> Result<()> {
    let store = SqliteStore::open_read_only(&db)?;
    let latest = store.latest_values(source)?;
    if latest.is_empty() {
        println!("No readings stored for '{}'", source);
        return Ok(());
    }

    println!("Latest values for '{}':", source);
    for reading in &latest {
        println!(
            "  {} = {} (seq={}, ts={})",
            reading.tag, reading.value, reading.sequence, reading.timestamp_ns
        );
    }
    Ok(())
}
