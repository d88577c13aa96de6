//! # Record-Level Access Filters
//!
//! Server-side `{field, operator, value}` predicates combined with `and`/`or`,
//! checked against every record a client writes and used by drivers to
//! restrict reads.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::context::Principal;
use super::errors::{ResourceError, ResourceResult};
use super::ids::{as_number, loosely_equal, scalar_string};
use super::Record;

/// Message used for every access-filter denial
pub const ACCESS_DENIED: &str = "Denied access to some of the requested fields.";

const USER_ID_PLACEHOLDER: &str = "{user.id}";

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOperator {
    #[serde(rename = "=", alias = "eq")]
    Eq,
    #[serde(rename = "!=", alias = "ne", alias = "<>")]
    Ne,
    #[serde(rename = ">", alias = "gt")]
    Gt,
    #[serde(rename = "<", alias = "lt")]
    Lt,
    #[serde(rename = ">=", alias = "gte")]
    Gte,
    #[serde(rename = "<=", alias = "lte")]
    Lte,
    #[serde(rename = "starts with")]
    StartsWith,
    #[serde(rename = "ends with")]
    EndsWith,
    #[serde(rename = "contains")]
    Contains,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "not in")]
    NotIn,
    #[serde(rename = "is null")]
    IsNull,
    #[serde(rename = "is not null")]
    IsNotNull,
    #[serde(rename = "does exist")]
    DoesExist,
    #[serde(rename = "does not exist")]
    DoesNotExist,
}

impl FilterOperator {
    /// Parse an operator, ignoring case and repeated whitespace
    pub fn parse(s: &str) -> Option<Self> {
        let normalized = s
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_ascii_lowercase();
        let op = match normalized.as_str() {
            "=" | "==" | "eq" => FilterOperator::Eq,
            "!=" | "<>" | "ne" => FilterOperator::Ne,
            ">" | "gt" => FilterOperator::Gt,
            "<" | "lt" => FilterOperator::Lt,
            ">=" | "gte" => FilterOperator::Gte,
            "<=" | "lte" => FilterOperator::Lte,
            "starts with" => FilterOperator::StartsWith,
            "ends with" => FilterOperator::EndsWith,
            "contains" => FilterOperator::Contains,
            "in" => FilterOperator::In,
            "not in" => FilterOperator::NotIn,
            "is null" => FilterOperator::IsNull,
            "is not null" => FilterOperator::IsNotNull,
            "does exist" => FilterOperator::DoesExist,
            "does not exist" => FilterOperator::DoesNotExist,
            _ => return None,
        };
        Some(op)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::Eq => "=",
            FilterOperator::Ne => "!=",
            FilterOperator::Gt => ">",
            FilterOperator::Lt => "<",
            FilterOperator::Gte => ">=",
            FilterOperator::Lte => "<=",
            FilterOperator::StartsWith => "starts with",
            FilterOperator::EndsWith => "ends with",
            FilterOperator::Contains => "contains",
            FilterOperator::In => "in",
            FilterOperator::NotIn => "not in",
            FilterOperator::IsNull => "is null",
            FilterOperator::IsNotNull => "is not null",
            FilterOperator::DoesExist => "does exist",
            FilterOperator::DoesNotExist => "does not exist",
        }
    }

    /// Operators that take no right-hand value
    pub fn is_unary(&self) -> bool {
        matches!(
            self,
            FilterOperator::IsNull
                | FilterOperator::IsNotNull
                | FilterOperator::DoesExist
                | FilterOperator::DoesNotExist
        )
    }

    /// Evaluate against a field value; `None` means the field is absent.
    /// Existence operators test presence, not value.
    pub fn evaluate(&self, value: Option<&Value>, operand: &Value) -> bool {
        match self {
            FilterOperator::Eq => match value {
                Some(v) => loosely_equal(v, operand),
                None => operand.is_null(),
            },
            FilterOperator::Ne => !FilterOperator::Eq.evaluate(value, operand),
            FilterOperator::Gt => compare(value, operand) == Some(Ordering::Greater),
            FilterOperator::Lt => compare(value, operand) == Some(Ordering::Less),
            FilterOperator::Gte => matches!(
                compare(value, operand),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FilterOperator::Lte => matches!(
                compare(value, operand),
                Some(Ordering::Less | Ordering::Equal)
            ),
            FilterOperator::StartsWith => text_pair(value, operand)
                .map(|(v, o)| v.starts_with(&o))
                .unwrap_or(false),
            FilterOperator::EndsWith => text_pair(value, operand)
                .map(|(v, o)| v.ends_with(&o))
                .unwrap_or(false),
            FilterOperator::Contains => match value {
                Some(Value::Array(items)) => items.iter().any(|i| loosely_equal(i, operand)),
                _ => text_pair(value, operand)
                    .map(|(v, o)| v.contains(&o))
                    .unwrap_or(false),
            },
            FilterOperator::In => match value {
                Some(v) => operand_list(operand).iter().any(|o| loosely_equal(v, o)),
                None => false,
            },
            FilterOperator::NotIn => !FilterOperator::In.evaluate(value, operand),
            FilterOperator::IsNull => value.map(Value::is_null).unwrap_or(true),
            FilterOperator::IsNotNull => value.map(|v| !v.is_null()).unwrap_or(false),
            FilterOperator::DoesExist => value.is_some(),
            FilterOperator::DoesNotExist => value.is_none(),
        }
    }
}

fn compare(value: Option<&Value>, operand: &Value) -> Option<Ordering> {
    let value = value?;
    if value.is_null() || operand.is_null() {
        return None;
    }
    match (as_number(value), as_number(operand)) {
        (Some(a), Some(b)) => a.partial_cmp(&b),
        _ => Some(scalar_string(value).cmp(&scalar_string(operand))),
    }
}

fn text_pair(value: Option<&Value>, operand: &Value) -> Option<(String, String)> {
    match value? {
        Value::Null => None,
        v => Some((scalar_string(v), scalar_string(operand))),
    }
}

/// Right-hand side of `in`: a JSON list or a comma-separated string
pub(crate) fn operand_list(operand: &Value) -> Vec<Value> {
    match operand {
        Value::Array(items) => items.clone(),
        Value::String(s) => s
            .split(',')
            .map(|p| Value::String(p.trim().to_string()))
            .collect(),
        other => vec![other.clone()],
    }
}

/// One predicate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldFilter {
    pub name: String,
    pub operator: FilterOperator,
    #[serde(default)]
    pub value: Value,
}

impl FieldFilter {
    pub fn new(name: impl Into<String>, operator: FilterOperator, value: Value) -> Self {
        Self {
            name: name.into(),
            operator,
            value,
        }
    }

    /// Copy with `{user.id}` replaced by the acting principal's id
    pub fn bind(&self, principal: &Principal) -> Self {
        let value = match &self.value {
            Value::String(s) if s.trim() == USER_ID_PLACEHOLDER => {
                principal.user_id.clone().unwrap_or(Value::Null)
            }
            other => other.clone(),
        };
        Self {
            name: self.name.clone(),
            operator: self.operator,
            value,
        }
    }
}

/// How predicates are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Combiner {
    #[default]
    And,
    Or,
}

/// A server-side record filter
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AccessFilter {
    #[serde(default)]
    pub filter_op: Combiner,
    #[serde(default)]
    pub filters: Vec<FieldFilter>,
}

impl AccessFilter {
    pub fn all(filters: Vec<FieldFilter>) -> Self {
        Self {
            filter_op: Combiner::And,
            filters,
        }
    }

    pub fn any(filters: Vec<FieldFilter>) -> Self {
        Self {
            filter_op: Combiner::Or,
            filters,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Copy with principal placeholders substituted
    pub fn bind(&self, principal: &Principal) -> Self {
        Self {
            filter_op: self.filter_op,
            filters: self.filters.iter().map(|f| f.bind(principal)).collect(),
        }
    }

    /// Check a record about to be written. Expects a bound filter.
    ///
    /// On update a field missing from the incoming record is compared using the
    /// previous record's value; if it is absent from both the predicate is
    /// undetermined and skipped. An `or` filter whose predicates were all
    /// skipped passes.
    pub fn validate_record(
        &self,
        record: &Record,
        for_update: bool,
        previous: Option<&Record>,
    ) -> ResourceResult<()> {
        if self.filters.is_empty() || record.is_empty() {
            return Ok(());
        }

        let mut evaluated = false;
        for filter in &self.filters {
            let current = match record.get(&filter.name) {
                Some(v) => Some(v),
                None if for_update => previous.and_then(|p| p.get(&filter.name)),
                None => None,
            };

            if for_update && current.is_none() {
                continue;
            }
            evaluated = true;

            let passed = filter.operator.evaluate(current, &filter.value);
            match self.filter_op {
                Combiner::And if !passed => return Err(ResourceError::forbidden(ACCESS_DENIED)),
                Combiner::Or if passed => return Ok(()),
                _ => {}
            }
        }

        match self.filter_op {
            Combiner::Or if evaluated => Err(ResourceError::forbidden(ACCESS_DENIED)),
            _ => Ok(()),
        }
    }

    /// Whether a stored record is visible through this filter
    pub fn matches(&self, record: &Record) -> bool {
        if self.filters.is_empty() {
            return true;
        }
        let mut results = self
            .filters
            .iter()
            .map(|f| f.operator.evaluate(record.get(&f.name), &f.value));
        match self.filter_op {
            Combiner::And => results.all(|r| r),
            Combiner::Or => results.any(|r| r),
        }
    }
}
