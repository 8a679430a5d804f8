//! Command line and logging
//!
//! Parses the daemon command line and sets up the tracing subscriber.

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::{fmt, EnvFilter};

/// Set coordinator daemon command-line interface
#[derive(Parser, Debug)]
#[command(name = "set-coordinator-daemon")]
#[command(about = "Coordinated set connection daemon", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Set log level (error, warn, info, debug, trace)
    #[arg(short, long, value_name = "LEVEL", default_value = "info")]
    pub log_level: String,

    /// Enable JSON structured logging
    #[arg(long)]
    pub json_logs: bool,

    /// Show timestamps in logs (`--timestamps false` to hide them)
    #[arg(long, value_name = "BOOL", default_value_t = true, action = ArgAction::Set)]
    pub timestamps: bool,

    /// Configuration file (defaults to the user config directory)
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Run the coordinator against the simulated radio stack
    Run,

    /// Show current configuration
    DumpConfig,

    /// Show daemon version and build information
    Version {
        /// Show detailed build information
        #[arg(long)]
        verbose: bool,
    },
}

/// Initialize logging based on CLI configuration
pub fn init_logging(cli: &Cli) -> Result<()> {
    let log_level = cli.log_level.parse::<Level>().with_context(|| {
        format!(
            "Invalid log level '{}'. Valid levels: error, warn, info, debug, trace",
            cli.log_level
        )
    })?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level.as_str()))
        .context("Failed to create log filter")?;

    let subscriber = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false);

    match (cli.json_logs, cli.timestamps) {
        (true, true) => subscriber.json().init(),
        (true, false) => subscriber.without_time().json().init(),
        (false, true) => subscriber.init(),
        (false, false) => subscriber.without_time().init(),
    }

    info!(
        "Logging initialized: level={}, json={}, timestamps={}",
        log_level, cli.json_logs, cli.timestamps
    );

    Ok(())
}

/// Print version information
pub fn show_version(verbose: bool) {
    println!("set-coordinator-daemon {}", env!("CARGO_PKG_VERSION"));

    if verbose {
        println!("Protocol crate: set-coordinator-protocol");
        println!("Authors: {}", env!("CARGO_PKG_AUTHORS"));
        println!("License: {}", env!("CARGO_PKG_LICENSE"));
    }
}
