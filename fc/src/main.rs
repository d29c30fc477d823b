//! forcectl - force-offload controller
//!
//! CLI entry point for serving and probing controllers.

use std::path::Path;
use std::time::Duration;

use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use tracing::{debug, info};

use forcectl::channel::{self, SocketPeer, SocketWorld};
use forcectl::cli::{Cli, Command};
use forcectl::client::PeerClient;
use forcectl::config::{Config, HandlerMode};
use forcectl::controller::Controller;
use forcectl::handler::{DependentAtomHandler, GridSamplingHandler, IndependentAtomHandler, RequestHandler};
use forcectl::models::Model;

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    // Determine log level with priority: CLI --log-level > config file > default (INFO)
    let level_str = cli_log_level.or(config_log_level);
    let level = match level_str.map(|s| s.to_uppercase()) {
        Some(s) => match s.as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .try_init()
        .map_err(|e| eyre::eyre!("Failed to install subscriber: {}", e))?;

    debug!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load log level from config file early (before full config load)
    let config_log_level = Config::load_log_level(cli.config.as_ref());
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let mut config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    match cli.command {
        Command::Run {
            mode,
            model,
            tag,
            socket_dir,
            max_idle_ms,
            every,
        } => {
            if let Some(mode) = mode {
                config.controller.mode = mode;
            }
            if let Some(tag) = tag {
                config.controller.partition_tag = tag;
            }
            if let Some(dir) = socket_dir {
                config.transport.socket_dir = dir;
            }
            if let Some(ms) = max_idle_ms {
                config.controller.max_idle_ms = ms;
            }
            config.validate().context("Invalid configuration")?;

            let code = run_controller(&config, model, every).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Command::Probe {
            tag,
            socket_dir,
            round_trip,
            timeout_ms,
        } => {
            let tag = tag.unwrap_or(config.controller.partition_tag);
            let dir = socket_dir.unwrap_or_else(|| config.transport.socket_dir.clone());
            let round_trip = round_trip.then(|| Duration::from_millis(timeout_ms));
            probe(&dir, tag, round_trip).await?;
        }
        Command::Config => {
            print!("{}", config.to_yaml()?);
        }
    }

    Ok(())
}

/// Serve until drained; returns the process exit code
async fn run_controller(config: &Config, model: Model, every: Option<u64>) -> Result<i32> {
    let mut world =
        SocketWorld::new(&config.transport.socket_dir).with_barrier_timeout(config.transport.barrier_timeout());
    let tag = config.controller.partition_tag;
    let channels = channel::open(&mut world, tag)
        .await
        .context(format!("Failed to open partition {}", tag))?;

    let handler: Box<dyn RequestHandler> = match config.controller.mode {
        HandlerMode::Atoms => Box::new(
            IndependentAtomHandler::new(model.atom_callback()).with_progress_every(config.controller.progress_every),
        ),
        HandlerMode::Grid => {
            let mut handler =
                GridSamplingHandler::new(model.grid_callback()).with_max_nodes(config.controller.max_grid_nodes);
            if let Some(steps) = every {
                handler = handler.with_every(steps);
            }
            Box::new(handler)
        }
        HandlerMode::Dependent => Box::new(
            DependentAtomHandler::new(model.batch_model()).with_progress_every(config.controller.progress_every),
        ),
    };

    println!(
        "{} Controller listening on {}",
        "●".green(),
        world.socket_path(tag).display().to_string().cyan()
    );

    match Controller::new(config.controller.clone(), channels, handler).run().await {
        Ok(summary) => {
            println!(
                "{} Drained after {} requests and {} grid requests ({} peers registered)",
                "✓".green(),
                summary.requests,
                summary.grid_requests,
                summary.registrations
            );
            Ok(0)
        }
        Err(e) => {
            eprintln!("{} {}", "✗".red(), e);
            Ok(e.exit_code())
        }
    }
}

/// Connect to a controller; with `round_trip`, also register and deregister
///
/// Connecting alone leaves the controller untouched. The round trip counts as
/// a registration, so a controller with no other peers drains right after.
async fn probe(dir: &Path, tag: u32, round_trip: Option<Duration>) -> Result<()> {
    let path = channel::partition_socket_path(dir, tag);
    info!(path = %path.display(), "Probing controller");

    let link = SocketPeer::connect(&path)
        .await
        .context(format!("Failed to connect to {}", path.display()))?;

    let Some(timeout) = round_trip else {
        println!("{} Controller listening at {}", "✓".green(), path.display().to_string().cyan());
        return Ok(());
    };

    let mut client = PeerClient::new(link).with_timeout(timeout);
    client.register().await.context("Registration failed")?;
    client.deregister().await.context("Deregistration failed")?;

    println!("{} Controller at {} acknowledged", "✓".green(), path.display().to_string().cyan());
    Ok(())
}
