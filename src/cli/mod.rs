//! CLI module for tablegate
//!
//! Provides command-line interface for:
//! - serve: Load configuration and serve the REST API
//! - check: Validate a configuration file and print a summary

mod args;
mod commands;
mod errors;

pub use args::{Cli, Command};
pub use commands::{check, run, run_command, serve, summarize};
pub use errors::{CliError, CliResult};
