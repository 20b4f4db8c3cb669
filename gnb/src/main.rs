//! gNB MAC Scheduler Simulator
//!
//! Runs the MAC scheduling and HARQ engine of one cell in lock-step against
//! simulated UEs and reports per-UE statistics.

mod config;
mod sim;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use config::SimConfig;
use sim::SimReport;

/// gNB MAC scheduler simulator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a TOML or YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Number of slots to simulate
    #[arg(long)]
    slots: Option<u64>,

    /// Allocation strategy (round_robin, proportional_fair, best_cqi)
    #[arg(long)]
    strategy: Option<String>,

    /// Random seed for channel outcomes and CQI jitter
    #[arg(long)]
    seed: Option<u64>,

    /// Write the statistics report as JSON to this file
    #[arg(long)]
    stats_json: Option<PathBuf>,
}

fn log_report(report: &SimReport) {
    info!(
        "Simulated {} slots ({:.1} ms) with strategy={}",
        report.slots, report.duration_ms, report.strategy
    );
    for ue in &report.ues {
        info!(
            "  rnti={}: DL {:.2} Mbit/s (BLER {:.3}), UL {:.2} Mbit/s (BLER {:.3})",
            ue.rnti, ue.dl_throughput_mbps, ue.dl_bler, ue.ul_throughput_mbps, ue.ul_bler
        );
    }
    info!(
        "  Control channel: {} to UEs, {} to gNB, {} bytes",
        report.control.to_ue_messages, report.control.to_gnb_messages, report.control.bytes
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Starting gNB MAC scheduler simulator");

    let mut config = match &args.config {
        Some(path) => {
            info!("Configuration file: {}", path.display());
            SimConfig::from_file(path)?
        }
        None => SimConfig::default(),
    };
    if let Some(strategy) = args.strategy {
        config.scheduler.strategy = strategy;
    }
    if let Some(seed) = args.seed {
        config.simulation.seed = seed;
    }
    let slots = args.slots.unwrap_or(config.simulation.slots);

    let stop = Arc::new(AtomicBool::new(false));
    let mut handle = sim::spawn(config, slots, stop.clone());

    // Wait for completion or shutdown signal
    let result = tokio::select! {
        result = &mut handle => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Received shutdown signal");
            stop.store(true, Ordering::Relaxed);
            handle.await
        }
    };
    let report = result.context("Simulation task failed")??;

    log_report(&report);
    if let Some(path) = &args.stats_json {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Statistics written to {}", path.display());
    }

    info!("Simulation complete");
    Ok(())
}
