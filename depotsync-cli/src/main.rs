//! DepotSync CLI - Command-line interface
//!
//! Watches one app for new versions, downloads the changed content and
//! publishes it.

mod commands;
mod error;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use crate::commands::common::CommonArgs;

#[derive(Debug, Parser)]
#[command(name = "depotsync", version, about = "Incremental depot content tracker")]
struct Cli {
    /// Path to config.ini (defaults to the platform config directory)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log level filter, overrides the config file (RUST_LOG still wins)
    #[arg(long, global = true, value_name = "LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Watch for changes and synchronize them until Ctrl+C
    Run,

    /// Check for a change once and synchronize everything pending
    Sync,

    /// Show cursors and queued changes
    Status,

    /// Show the configuration file path
    ConfigPath,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let common = CommonArgs {
        config: cli.config,
        log_level: cli.log_level,
    };

    let result = match cli.command {
        Command::Run => commands::run::run(&common),
        Command::Sync => commands::sync::run(&common),
        Command::Status => commands::status::run(&common),
        Command::ConfigPath => commands::config_path::run(&common),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
