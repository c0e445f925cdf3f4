//! vaocean-server - standalone runnable server for the
//! VirtualAcousticOcean simulator.
//!
//! Loads a scenario (YAML, or the built-in two-node demo), wires it into
//! a [`vaocean_core::Simulation`], binds each node's protocol daemon,
//! and runs until a shutdown signal arrives.

mod config;
mod free_space;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;

use vaocean_core::{NodeConfig, ProtocolDaemon, RedGaussianNoise, Simulation, Uasp2Daemon, UaspDaemon};

use crate::config::{ProtocolKind, ServerConfig};
use crate::free_space::FreeSpacePropagation;

/// VirtualAcousticOcean server - real-time underwater-acoustic modem simulator.
#[derive(Parser, Debug)]
#[command(name = "vaocean-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the scenario configuration file (YAML). Uses a built-in
    /// two-node demo scenario when omitted.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "VAOCEAN_LOG_LEVEL")]
    log_level: log::LevelFilter,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("VirtualAcousticOcean server v{}", env!("CARGO_PKG_VERSION"));

    let scenario =
        ServerConfig::load(args.config.as_deref()).context("Failed to load scenario configuration")?;
    log::info!(
        "Scenario: frequency={}Hz, nodes={}, mobility={}",
        scenario.frequency,
        scenario.nodes.len(),
        scenario.mobility
    );

    let sim_config = scenario.to_simulation_config();
    sim_config.validate().context("Invalid simulation configuration")?;

    let propagation = Arc::new(FreeSpacePropagation::new(scenario.sound_speed));
    let noise = Arc::new(RedGaussianNoise::new());
    let runtime = tokio::runtime::Handle::current();

    let sim = Simulation::new(sim_config, propagation, noise, runtime)
        .context("Failed to construct simulation")?;

    for (idx, node_spec) in scenario.nodes.iter().enumerate() {
        let ochannels = node_spec.ochannels.unwrap_or(node_spec.relpos.len());
        let node_config = NodeConfig {
            position: node_spec.position,
            relpos: node_spec.relpos.clone(),
            ochannels,
            igain: node_spec.igain,
            ogain: node_spec.ogain,
            obufsize: node_spec.obufsize,
        };

        let control_bind: SocketAddr = (node_spec.bind_ip, node_spec.port).into();
        let daemon: Arc<dyn ProtocolDaemon> = match node_spec.protocol {
            ProtocolKind::Uasp => {
                let data_bind: SocketAddr = (node_spec.bind_ip, node_spec.port + 1).into();
                Arc::new(UaspDaemon::new(control_bind, data_bind, node_spec.obufsize))
            }
            ProtocolKind::Uasp2 => {
                // UASP2 only needs an outbound UDP socket for pushing ADC
                // frames; the destination is learned from `istart`, so an
                // ephemeral local port is fine.
                let data_bind: SocketAddr = (node_spec.bind_ip, 0).into();
                Arc::new(Uasp2Daemon::new(control_bind, data_bind, node_spec.obufsize))
            }
        };

        sim.add_node(node_config, daemon)
            .with_context(|| format!("Failed to add node {idx}"))?;
        log::info!("Node {idx} bound at {control_bind} ({:?})", node_spec.protocol);
    }

    sim.run().context("Failed to start simulation")?;
    log::info!("Simulation running");

    shutdown_signal().await;
    log::info!("Shutdown signal received, stopping simulation...");
    sim.close();
    log::info!("Shutdown complete");
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
