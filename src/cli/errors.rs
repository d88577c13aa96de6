//! CLI-specific error types
//!
//! All CLI errors are fatal: `main` prints them and exits non-zero.

use std::io;

use thiserror::Error;

use crate::config::ConfigError;

/// CLI error
#[derive(Debug, Error)]
pub enum CliError {
    #[error("TABLEGATE_CLI_CONFIG_ERROR: {0}")]
    Config(#[from] ConfigError),

    #[error("TABLEGATE_CLI_IO_ERROR: {0}")]
    Io(#[from] io::Error),

    #[error("TABLEGATE_CLI_BOOT_FAILED: {0}")]
    BootFailed(String),
}

impl CliError {
    pub fn boot_failed(msg: impl Into<String>) -> Self {
        Self::BootFailed(msg.into())
    }

    /// Get the error code string
    pub fn code_str(&self) -> &'static str {
        match self {
            Self::Config(_) => "TABLEGATE_CLI_CONFIG_ERROR",
            Self::Io(_) => "TABLEGATE_CLI_IO_ERROR",
            Self::BootFailed(_) => "TABLEGATE_CLI_BOOT_FAILED",
        }
    }
}

impl From<serde_json::Error> for CliError {
    fn from(e: serde_json::Error) -> Self {
        Self::Io(io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

/// CLI result type
pub type CliResult<T> = Result<T, CliError>;
