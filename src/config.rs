//! # Gateway Configuration
//!
//! JSON configuration file: HTTP server, envelope key, retrieval cap,
//! log filter, table schemas and per-table access rules.
//! Every field has a default, so `{}` is a valid file.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::driver::MemoryDriver;
use crate::table::fields::FieldDescriptor;
use crate::table::options::Verb;
use crate::table::policy::{RulePolicy, TableRule};
use crate::table::resource::ResourceSettings;
use crate::table::DEFAULT_RECORD_KEY;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Read(String),

    #[error("Invalid config JSON: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// HTTP server settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Allowed CORS origins; empty allows any
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Schema of one served table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,

    #[serde(default)]
    pub fields: Vec<FieldDescriptor>,
}

/// Top-level configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default = "default_record_key")]
    pub record_key: String,

    #[serde(default = "default_max_records")]
    pub max_records_returned: usize,

    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    #[serde(default)]
    pub tables: Vec<TableSchema>,

    /// Access rules keyed by table name
    #[serde(default)]
    pub access: BTreeMap<String, TableRule>,
}

fn default_record_key() -> String {
    DEFAULT_RECORD_KEY.to_string()
}

fn default_max_records() -> usize {
    1000
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            record_key: default_record_key(),
            max_records_returned: default_max_records(),
            log_filter: default_log_filter(),
            tables: Vec::new(),
            access: BTreeMap::new(),
        }
    }
}

impl GatewayConfig {
    /// Load and validate a configuration file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> ConfigResult<Self> {
        let config: GatewayConfig =
            serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.record_key.trim().is_empty() {
            return Err(ConfigError::Invalid("record_key must not be empty".into()));
        }

        if self.max_records_returned == 0 {
            return Err(ConfigError::Invalid(
                "max_records_returned must be > 0".into(),
            ));
        }

        let mut seen = HashSet::new();
        for table in &self.tables {
            if table.name.trim().is_empty() {
                return Err(ConfigError::Invalid("table name must not be empty".into()));
            }
            if !seen.insert(table.name.to_ascii_lowercase()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate table '{}'",
                    table.name
                )));
            }
            if !table.fields.iter().any(|f| f.is_primary_key) {
                return Err(ConfigError::Invalid(format!(
                    "table '{}' has no primary key field",
                    table.name
                )));
            }
        }

        for (table, rule) in &self.access {
            for verb in rule.verbs.iter().flatten() {
                if Verb::parse(verb).is_none() {
                    return Err(ConfigError::Invalid(format!(
                        "unknown verb '{}' in access rule for '{}'",
                        verb, table
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn resource_settings(&self) -> ResourceSettings {
        ResourceSettings {
            record_key: self.record_key.clone(),
            max_records_returned: self.max_records_returned,
        }
    }

    pub fn policy(&self) -> RulePolicy {
        self.access
            .iter()
            .fold(RulePolicy::new(), |policy, (table, rule)| {
                policy.with_rule(table, rule.clone())
            })
    }

    /// Memory driver seeded with the configured table schemas
    pub fn build_driver(&self) -> MemoryDriver {
        self.tables
            .iter()
            .fold(MemoryDriver::new(), |driver, table| {
                driver.with_table(&table.name, table.fields.clone())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::policy::AccessPolicy;
    use crate::table::context::Principal;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = GatewayConfig::from_json("{}").unwrap();
        assert_eq!(config, GatewayConfig::default());
        assert_eq!(config.server.socket_addr(), "0.0.0.0:8080");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "record_key": "resource",
                "tables": [{{"name": "todo", "fields": [
                    {{"name": "id", "type": "id", "is_primary_key": true, "auto_increment": true}},
                    {{"name": "name", "type": "string", "required": true}}
                ]}}],
                "access": {{"todo": {{"verbs": ["GET"]}}}}
            }}"#
        )
        .unwrap();

        let config = GatewayConfig::load(file.path()).unwrap();
        assert_eq!(config.record_key, "resource");
        assert_eq!(config.tables[0].fields.len(), 2);

        let driver = config.build_driver();
        assert_eq!(driver.table_names(), vec!["todo".to_string()]);

        let policy = config.policy();
        assert!(policy
            .check(&Principal::anonymous(), "todo", Verb::Post)
            .is_err());
    }

    #[test]
    fn test_missing_file() {
        let err = GatewayConfig::load(Path::new("/nonexistent/tablegate.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read(_)));
    }

    #[test]
    fn test_validation_failures() {
        let cases = [
            r#"{"record_key": ""}"#,
            r#"{"max_records_returned": 0}"#,
            r#"{"tables": [{"name": "t", "fields": [{"name": "x"}]}]}"#,
            r#"{"tables": [
                {"name": "t", "fields": [{"name": "id", "is_primary_key": true}]},
                {"name": "T", "fields": [{"name": "id", "is_primary_key": true}]}
            ]}"#,
            r#"{"access": {"t": {"verbs": ["FETCH"]}}}"#,
        ];
        for case in cases {
            assert!(
                matches!(GatewayConfig::from_json(case), Err(ConfigError::Invalid(_))),
                "expected invalid: {}",
                case
            );
        }
    }

    #[test]
    fn test_bad_combiner_is_rejected() {
        let json = r#"{"access": {"t": {"filter": {"filter_op": "xor", "filters": []}}}}"#;
        assert!(matches!(
            GatewayConfig::from_json(json),
            Err(ConfigError::Parse(_))
        ));
    }
}
