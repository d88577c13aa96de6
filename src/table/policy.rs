//! # Table Access Policy
//!
//! Verb-level permission checks and the record filters attached to them.
//! The table resource asks the policy once per request, before any batch
//! work, and threads the returned filter through `RequestOptions`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::access::AccessFilter;
use super::context::Principal;
use super::errors::{ResourceError, ResourceResult};
use super::options::Verb;

/// Permission source consulted by the table resource
pub trait AccessPolicy: Send + Sync {
    /// Fail with `Forbidden` when the principal may not use `verb` on `table`
    fn check(&self, principal: &Principal, table: &str, verb: Verb) -> ResourceResult<()>;

    /// Record filter to enforce for this principal, table and verb
    fn record_filter(&self, principal: &Principal, table: &str, verb: Verb)
        -> Option<AccessFilter>;
}

/// Allows everything, attaches no filters
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenPolicy;

impl AccessPolicy for OpenPolicy {
    fn check(&self, _principal: &Principal, _table: &str, _verb: Verb) -> ResourceResult<()> {
        Ok(())
    }

    fn record_filter(
        &self,
        _principal: &Principal,
        _table: &str,
        _verb: Verb,
    ) -> Option<AccessFilter> {
        None
    }
}

/// Per-table access rule
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableRule {
    /// Allowed verbs; `None` allows all
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verbs: Option<Vec<String>>,

    /// Record filter applied to every allowed verb
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<AccessFilter>,
}

impl TableRule {
    pub fn allow(verbs: &[Verb]) -> Self {
        Self {
            verbs: Some(verbs.iter().map(|v| v.as_str().to_string()).collect()),
            filter: None,
        }
    }

    pub fn with_filter(mut self, filter: AccessFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn allows(&self, verb: Verb) -> bool {
        match &self.verbs {
            None => true,
            Some(verbs) => verbs.iter().any(|v| Verb::parse(v) == Some(verb)),
        }
    }
}

/// Rule-driven policy keyed by table name (case-insensitive).
/// Tables without a rule fall back to the default rule.
#[derive(Debug, Clone, Default)]
pub struct RulePolicy {
    rules: HashMap<String, TableRule>,
    default_rule: TableRule,
}

impl RulePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rule(mut self, table: &str, rule: TableRule) -> Self {
        self.rules.insert(table.to_ascii_lowercase(), rule);
        self
    }

    pub fn with_default_rule(mut self, rule: TableRule) -> Self {
        self.default_rule = rule;
        self
    }

    fn rule(&self, table: &str) -> &TableRule {
        self.rules
            .get(&table.to_ascii_lowercase())
            .unwrap_or(&self.default_rule)
    }
}

impl AccessPolicy for RulePolicy {
    fn check(&self, _principal: &Principal, table: &str, verb: Verb) -> ResourceResult<()> {
        if self.rule(table).allows(verb) {
            Ok(())
        } else {
            Err(ResourceError::forbidden(format!(
                "No {} permission on table '{}'.",
                verb, table
            )))
        }
    }

    fn record_filter(
        &self,
        _principal: &Principal,
        table: &str,
        _verb: Verb,
    ) -> Option<AccessFilter> {
        self.rule(table)
            .filter
            .as_ref()
            .filter(|f| !f.is_empty())
            .cloned()
    }
}
