//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::HandlerMode;
use crate::models::Model;

/// forcectl - force-offload controller for molecular dynamics engines
#[derive(Parser)]
#[command(
    name = "fc",
    about = "Serve force corrections to molecular dynamics engines",
    version = env!("CARGO_PKG_VERSION"),
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Serve as a controller until every peer has deregistered
    Run {
        /// Handler to run (overrides config)
        #[arg(short, long, value_enum)]
        mode: Option<HandlerMode>,

        /// Force model to serve
        #[arg(long, value_enum, default_value_t = Model::Zero)]
        model: Model,

        /// Partition tag (overrides config)
        #[arg(short, long)]
        tag: Option<u32>,

        /// Socket directory (overrides config)
        #[arg(long)]
        socket_dir: Option<PathBuf>,

        /// Idle limit in milliseconds (overrides config)
        #[arg(long)]
        max_idle_ms: Option<u64>,

        /// Ask grid peers to resample every N steps
        #[arg(long)]
        every: Option<u64>,
    },

    /// Check that a controller is listening on a partition
    Probe {
        /// Partition tag (overrides config)
        #[arg(short, long)]
        tag: Option<u32>,

        /// Socket directory (overrides config)
        #[arg(long)]
        socket_dir: Option<PathBuf>,

        /// Also register and deregister; this ends a controller with no other registered peers
        #[arg(long)]
        round_trip: bool,

        /// Reply timeout in milliseconds (with --round-trip)
        #[arg(long, default_value = "5000")]
        timeout_ms: u64,
    },

    /// Print the effective configuration as YAML
    Config,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_overrides() {
        let cli = Cli::try_parse_from([
            "fc", "run", "--mode", "grid", "--model", "wall", "--tag", "99", "--max-idle-ms", "250",
        ])
        .unwrap();
        match cli.command {
            Command::Run {
                mode,
                model,
                tag,
                max_idle_ms,
                ..
            } => {
                assert_eq!(mode, Some(HandlerMode::Grid));
                assert_eq!(model, Model::Wall);
                assert_eq!(tag, Some(99));
                assert_eq!(max_idle_ms, Some(250));
            }
            other => panic!("Expected run, got {:?}", other),
        }
    }

    #[test]
    fn test_round_trip_is_off_by_default() {
        let cli = Cli::try_parse_from(["fc", "probe", "--tag", "5"]).unwrap();
        assert!(matches!(cli.command, Command::Probe { round_trip: false, .. }));

        let cli = Cli::try_parse_from(["fc", "probe", "--round-trip"]).unwrap();
        assert!(matches!(cli.command, Command::Probe { round_trip: true, .. }));
    }

    #[test]
    fn test_global_log_level() {
        let cli = Cli::try_parse_from(["fc", "config", "-l", "debug"]).unwrap();
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert!(matches!(cli.command, Command::Config));
    }
}
