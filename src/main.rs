//! HiveLink - Virtual robot client for the HIVE entity protocol
//!
//! Registers a fleet of simulated robots with a HIVE server and streams their
//! positions while logging everything the server sends back.

mod config;
mod network;
mod protocol;
mod simulation;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use config::Config;
use network::{Client, ClientEvent, NetworkConfig};
use simulation::{SchedulerConfig, UpdateScheduler, VirtualRobot};

/// HiveLink - Virtual robot client
#[derive(Parser)]
#[command(name = "hivelink")]
#[command(author = "HiveLink Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Stream simulated robot positions to a HIVE server", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and stream virtual robots until Ctrl+C
    Run {
        /// Server host
        #[arg(long)]
        host: Option<String>,

        /// Server port
        #[arg(short, long)]
        port: Option<u16>,

        /// Number of virtual robots
        #[arg(short, long)]
        robots: Option<usize>,

        /// Time between position updates (ms)
        #[arg(short, long)]
        interval_ms: Option<u64>,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    // Load configuration
    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)
            .with_context(|| format!("Failed to load {}", config_path.display()))?
    } else {
        Config::load_default().unwrap_or_default()
    };

    match cli.command {
        Commands::Run {
            host,
            port,
            robots,
            interval_ms,
        } => {
            if let Some(host) = host {
                config.connection.host = host;
            }
            if let Some(port) = port {
                config.connection.port = port;
            }
            if let Some(robots) = robots {
                config.simulation.robot_count = robots;
            }
            if let Some(interval_ms) = interval_ms {
                config.simulation.update_interval_ms = interval_ms;
            }
            run_client(config).await?;
        }
        Commands::Config { generate, output } => {
            let shown = if generate { Config::sample() } else { config };
            if let Some(path) = output {
                shown
                    .save(&path)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                println!("Configuration written to: {}", path.display());
            } else {
                println!("{}", toml::to_string_pretty(&shown)?);
            }
        }
    }

    Ok(())
}

/// Connect, stream until Ctrl+C or connection loss, then shut down
async fn run_client(config: Config) -> anyhow::Result<()> {
    let net_config = NetworkConfig::from(&config.connection);
    let host = &config.connection.host;
    let port = config.connection.port;

    let mut client = Client::connect(host, port, &net_config)
        .await
        .with_context(|| format!("Failed to connect to {}:{}", host, port))?;

    let robots = VirtualRobot::fleet(
        config.simulation.robot_count,
        config.simulation.base_entity_id,
    );
    let mut scheduler = UpdateScheduler::new(SchedulerConfig::from(&config.simulation), robots);

    println!("\n========================================");
    println!("  HiveLink Client Connected");
    println!("========================================");
    println!("  Server: {}", client.remote_addr());
    println!("  Robots: {}", scheduler.robots().len());
    println!("  Interval: {} ms", config.simulation.update_interval_ms);
    println!("========================================");
    println!("\nPress Ctrl+C to stop.\n");

    let mut event_rx = client
        .take_event_receiver()
        .context("Event receiver already taken")?;
    let shutdown = client.shutdown_handle();

    let result = {
        let run = client.run(&mut scheduler);
        tokio::pin!(run);

        loop {
            tokio::select! {
                result = &mut run => break result,
                Some(event) = event_rx.recv() => {
                    match event {
                        ClientEvent::EntityReceived { entity } => {
                            tracing::trace!("Inbound entity: {:?}", entity);
                        }
                        ClientEvent::Disconnected { reason } => {
                            tracing::info!("Listener stopped: {}", reason);
                        }
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    println!("\nShutting down...");
                    shutdown.trigger();
                }
            }
        }
    };

    tracing::debug!(
        "Scheduler {:?}, client {:?}, {} bytes sent",
        scheduler.state(),
        client.state(),
        client.stats().bytes_sent
    );

    let report = result.context("Streaming stopped")?;
    tracing::info!(
        "Client stopped: {} robots registered, {} updates, {} frames sent",
        report.registered,
        report.ticks,
        report.frames_sent
    );

    Ok(())
}
