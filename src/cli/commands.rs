//! CLI command implementations
//!
//! Every command loads and validates the configuration first; nothing is
//! served from an invalid file.

use std::path::Path;

use serde_json::{json, Value};
use tracing::info;

use crate::config::GatewayConfig;
use crate::observability::init_logging;
use crate::rest_api::RestServer;
use crate::table::TableResource;

use super::args::Command;
use super::errors::{CliError, CliResult};

/// Main CLI entry point
///
/// Parses arguments and dispatches to the appropriate command.
pub fn run() -> CliResult<()> {
    let cli = super::args::Cli::parse_args();
    run_command(cli.command)
}

/// Run the appropriate command based on CLI args
pub fn run_command(cmd: Command) -> CliResult<()> {
    match cmd {
        Command::Serve { config, port } => serve(&config, port),
        Command::Check { config } => check(&config),
    }
}

/// Serve the REST API over the memory driver seeded from configuration
pub fn serve(config_path: &Path, port: Option<u16>) -> CliResult<()> {
    let mut config = GatewayConfig::load(config_path)?;
    if let Some(port) = port {
        config.server.port = port;
    }

    init_logging(&config.log_filter);
    info!(
        config = %config_path.display(),
        tables = config.tables.len(),
        "starting tablegate"
    );

    let resource = TableResource::new(config.build_driver())
        .with_policy(config.policy())
        .with_settings(config.resource_settings());
    let server = RestServer::new(resource).with_cors(config.server.cors_origins.clone());
    let addr = config.server.socket_addr();

    let rt = tokio::runtime::Runtime::new()
        .map_err(|e| CliError::boot_failed(format!("Failed to create tokio runtime: {}", e)))?;

    rt.block_on(async {
        server
            .serve(&addr)
            .await
            .map_err(|e| CliError::boot_failed(format!("HTTP server failed: {}", e)))
    })
}

/// Validate a configuration file and print its summary as JSON
pub fn check(config_path: &Path) -> CliResult<()> {
    let config = GatewayConfig::load(config_path)?;
    let summary = serde_json::to_string_pretty(&summarize(&config))?;
    println!("{}", summary);
    Ok(())
}

/// Summary printed by `check`
pub fn summarize(config: &GatewayConfig) -> Value {
    let tables: Vec<Value> = config
        .tables
        .iter()
        .map(|t| {
            let ids: Vec<&str> = t
                .fields
                .iter()
                .filter(|f| f.is_primary_key)
                .map(|f| f.name.as_str())
                .collect();
            json!({
                "name": t.name,
                "fields": t.fields.len(),
                "ids": ids,
                "access": config.access.contains_key(&t.name),
            })
        })
        .collect();

    json!({
        "listen": config.server.socket_addr(),
        "record_key": config.record_key,
        "max_records_returned": config.max_records_returned,
        "tables": tables,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_config(temp_dir: &TempDir, config: Value) -> std::path::PathBuf {
        let path = temp_dir.path().join("tablegate.json");
        fs::write(&path, config.to_string()).unwrap();
        path
    }

    #[test]
    fn test_check_valid_config() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_config(
            &temp_dir,
            json!({
                "tables": [{"name": "todo", "fields": [
                    {"name": "id", "type": "id", "is_primary_key": true}
                ]}]
            }),
        );
        check(&path).unwrap();
    }

    #[test]
    fn test_check_rejects_invalid_config() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_config(&temp_dir, json!({"max_records_returned": 0}));
        let err = check(&path).unwrap_err();
        assert_eq!(err.code_str(), "TABLEGATE_CLI_CONFIG_ERROR");
    }

    #[test]
    fn test_serve_requires_config() {
        let temp_dir = TempDir::new().unwrap();
        let err = serve(&temp_dir.path().join("missing.json"), None).unwrap_err();
        assert!(matches!(err, CliError::Config(_)));
    }

    #[test]
    fn test_summarize() {
        let config = GatewayConfig::from_json(
            r#"{
                "server": {"port": 9090},
                "tables": [{"name": "todo", "fields": [
                    {"name": "id", "is_primary_key": true},
                    {"name": "name"}
                ]}],
                "access": {"todo": {"verbs": ["GET"]}}
            }"#,
        )
        .unwrap();

        let summary = summarize(&config);
        assert_eq!(summary["listen"], json!("0.0.0.0:9090"));
        assert_eq!(
            summary["tables"],
            json!([{"name": "todo", "fields": 2, "ids": ["id"], "access": true}])
        );
    }
}
