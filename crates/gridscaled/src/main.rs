//! gridscaled — the GridScale autoscaling daemon.
//!
//! Reads `gridscale.toml`, wires the scale-set drivers to a backend, and
//! runs the decision loop until interrupted. With no vendor adapter
//! configured the built-in simulation backend is used, which makes the
//! daemon a dry-run harness for a configuration.
//!
//! # Usage
//!
//! ```text
//! gridscaled run --config gridscale.toml
//! gridscaled validate --config gridscale.toml
//! ```
//!
//! Exit codes: 0 on normal shutdown, 1 on configuration errors, 2 when the
//! backend cannot list groups at startup.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info};

use gridscale_cloud::{CloudProvider, SimCloud};
use gridscale_core::config::parse_duration;
use gridscale_core::GridConfig;
use gridscale_engine::{ClusterSnapshot, Engine, EngineOptions, StaticSnapshot};
use gridscale_scaleset::{GroupCache, ScaleSet};

const EXIT_CONFIG_ERROR: u8 = 1;
const EXIT_BACKEND_ERROR: u8 = 2;

/// TTL of the shared group-descriptor cache.
const GROUP_CACHE_TTL: Duration = Duration::from_secs(15);

/// Deadline for each backend call.
const CALL_DEADLINE: Duration = Duration::from_secs(180);

#[derive(Parser)]
#[command(name = "gridscaled", about = "GridScale cluster-autoscaler daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the autoscaling loop.
    Run {
        /// Path to the configuration file.
        #[arg(long, default_value = "gridscale.toml")]
        config: PathBuf,

        /// Override the configured scan interval, e.g. "30s".
        #[arg(long)]
        scan_interval: Option<String>,
    },

    /// Parse and validate a configuration file, then exit.
    Validate {
        /// Path to the configuration file.
        #[arg(long, default_value = "gridscale.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,gridscaled=debug,gridscale=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            config,
            scan_interval,
        } => run(&config, scan_interval).await,
        Command::Validate { config } => validate(&config),
    }
}

fn validate(path: &PathBuf) -> ExitCode {
    match GridConfig::from_file(path) {
        Ok(config) => {
            for spec in config.node_groups() {
                info!(
                    group = %spec.name,
                    min = spec.min_size,
                    max = spec.max_size,
                    priority = spec.priority,
                    "group configured"
                );
            }
            info!(path = %path.display(), "configuration is valid");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(path = %path.display(), error = %e, "configuration is invalid");
            ExitCode::from(EXIT_CONFIG_ERROR)
        }
    }
}

async fn run(path: &PathBuf, scan_interval_override: Option<String>) -> ExitCode {
    let config = match GridConfig::from_file(path) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %path.display(), error = %e, "cannot load configuration");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    let scan_interval = match scan_interval_override {
        Some(raw) => match parse_duration(&raw) {
            Some(duration) => duration,
            None => {
                error!(value = %raw, "cannot parse --scan-interval");
                return ExitCode::from(EXIT_CONFIG_ERROR);
            }
        },
        None => config.scan_interval(),
    };

    let specs = config.node_groups();
    let provider: Arc<dyn CloudProvider> = Arc::new(SimCloud::from_specs(&specs));
    info!(
        backend = provider.name(),
        "no vendor adapter configured, using the built-in simulation backend"
    );

    let groups = Arc::new(GroupCache::new(GROUP_CACHE_TTL, CALL_DEADLINE));

    // Fail fast when the backend cannot enumerate the configured groups.
    for spec in &specs {
        if let Err(e) = groups.describe(provider.as_ref(), &spec.name).await {
            error!(group = %spec.name, error = %e, "backend cannot resolve group at startup");
            return ExitCode::from(EXIT_BACKEND_ERROR);
        }
    }

    let scale_sets: Vec<Arc<ScaleSet>> = specs
        .into_iter()
        .map(|spec| Arc::new(ScaleSet::new(spec, provider.clone(), groups.clone())))
        .collect();

    let snapshot: Arc<dyn ClusterSnapshot> = Arc::new(StaticSnapshot::new());
    let options = EngineOptions {
        scan_interval,
        scale_down_enabled: config.scale_down_enabled(),
        scale_down_unneeded_time: config.scale_down_unneeded_time(),
        scale_down_utilization_threshold: config.scale_down_utilization_threshold(),
        max_concurrent_drain: config.max_concurrent_drain(),
        expander: config.expander(),
        cordon_node_before_terminating: config.cordon_node_before_terminating(),
        cooldown: config.cooldown(),
    };
    let mut engine = Engine::new(snapshot, scale_sets.clone(), options);
    let counters = engine.counters();

    // ── Shutdown signal ────────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    engine.run(shutdown_rx).await;

    for (group, snapshot) in counters.snapshot() {
        info!(
            %group,
            scale_up_attempts = snapshot.scale_up_attempts,
            scale_up_successes = snapshot.scale_up_successes,
            scale_down_attempts = snapshot.scale_down_attempts,
            scale_down_successes = snapshot.scale_down_successes,
            throttle_events = snapshot.throttle_events,
            "final counters"
        );
    }
    for set in &scale_sets {
        info!(
            group = %set.name(),
            stale_cache_serves = set.stale_cache_serves(),
            "cache staleness"
        );
    }

    info!("gridscaled stopped");
    ExitCode::SUCCESS
}
