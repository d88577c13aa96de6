//! CLI argument definitions using clap
//!
//! Commands:
//! - tablegate serve --config <path> [--port <port>]
//! - tablegate check --config <path>

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// tablegate - REST gateway over table drivers
#[derive(Parser, Debug)]
#[command(name = "tablegate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the REST API
    Serve {
        /// Path to configuration file
        #[arg(long, default_value = "./tablegate.json")]
        config: PathBuf,

        /// Override the configured port
        #[arg(long)]
        port: Option<u16>,
    },

    /// Validate a configuration file and print a summary
    Check {
        /// Path to configuration file
        #[arg(long, default_value = "./tablegate.json")]
        config: PathBuf,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
