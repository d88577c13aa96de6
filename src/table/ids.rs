//! # Identifier Resolution
//!
//! Extracts and validates record identifiers from records or bare values,
//! for single-field and composite keys.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::errors::{ResourceError, ResourceResult};
use super::fields::{FieldDescriptor, FieldType};
use super::Record;

/// One field of a (possibly composite) key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdDescriptor {
    pub name: String,

    #[serde(rename = "type", default)]
    pub id_type: FieldType,

    #[serde(default)]
    pub required: bool,

    /// Store assigns the value, so a create may omit it
    #[serde(default)]
    pub auto_increment: bool,
}

impl IdDescriptor {
    pub fn new(name: impl Into<String>, id_type: FieldType) -> Self {
        Self {
            name: name.into(),
            id_type,
            required: true,
            auto_increment: false,
        }
    }

    pub fn from_field(field: &FieldDescriptor) -> Self {
        Self {
            name: field.name.clone(),
            id_type: field.field_type,
            required: field.required || field.is_primary_key,
            auto_increment: field.auto_increment,
        }
    }
}

/// Names of the identifying fields, in key order
pub fn id_field_names(descriptors: &[IdDescriptor]) -> Vec<String> {
    descriptors.iter().map(|d| d.name.clone()).collect()
}

/// A resolved record identifier
#[derive(Debug, Clone, PartialEq)]
pub enum Identifier {
    /// Single-field key
    Scalar(Value),
    /// Multi-field key, field name to value
    Composite(Map<String, Value>),
}

impl Identifier {
    /// JSON form: the scalar itself, or a name-to-value object
    pub fn to_value(&self) -> Value {
        match self {
            Identifier::Scalar(v) => v.clone(),
            Identifier::Composite(map) => Value::Object(map.clone()),
        }
    }

    /// Whether the record carries exactly this identifier
    pub fn matches(&self, record: &Record, descriptors: &[IdDescriptor]) -> bool {
        match self {
            Identifier::Scalar(v) => descriptors
                .first()
                .and_then(|d| record.get(&d.name))
                .map(|rv| loosely_equal(rv, v))
                .unwrap_or(false),
            Identifier::Composite(map) => map.iter().all(|(name, v)| {
                record
                    .get(name)
                    .map(|rv| loosely_equal(rv, v))
                    .unwrap_or(false)
            }),
        }
    }

    /// Write the identifier's field values into a record
    pub fn apply_to(&self, record: &mut Record, descriptors: &[IdDescriptor]) {
        match self {
            Identifier::Scalar(v) => {
                if let Some(d) = descriptors.first() {
                    record.insert(d.name.clone(), v.clone());
                }
            }
            Identifier::Composite(map) => {
                for (name, v) in map {
                    record.insert(name.clone(), v.clone());
                }
            }
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::Scalar(Value::String(s)) => write!(f, "{}", s),
            Identifier::Scalar(v) => write!(f, "{}", v),
            Identifier::Composite(map) => write!(f, "{}", Value::Object(map.clone())),
        }
    }
}

/// Outcome of identifier resolution
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Resolved(Identifier),
    /// Create without a client key; the store assigns it
    Pending,
    /// A required identifier field is absent
    Missing,
}

impl Resolution {
    pub fn identifier(&self) -> Option<&Identifier> {
        match self {
            Resolution::Resolved(id) => Some(id),
            _ => None,
        }
    }
}

/// Resolve the identifier of a record or bare value.
///
/// A JSON object is read field by field (and stripped of its key fields
/// when `remove` is set); any other value is taken as the key itself.
pub fn resolve(
    item: &mut Value,
    descriptors: &[IdDescriptor],
    on_create: bool,
    remove: bool,
) -> ResourceResult<Resolution> {
    match item {
        Value::Object(record) => resolve_record(record, descriptors, on_create, remove),
        other => resolve_value(other, descriptors),
    }
}

/// Resolve from a record's current field values
pub fn resolve_record(
    record: &mut Record,
    descriptors: &[IdDescriptor],
    on_create: bool,
    remove: bool,
) -> ResourceResult<Resolution> {
    if descriptors.is_empty() {
        return Err(undeterminable());
    }

    let mut resolved = Map::new();
    for desc in descriptors {
        let value = if remove {
            record.remove(&desc.name)
        } else {
            record.get(&desc.name).cloned()
        };

        match value {
            Some(v) if !v.is_null() => {
                resolved.insert(desc.name.clone(), coerce(&desc.name, v, desc.id_type)?);
            }
            _ => {
                if on_create && desc.required && !desc.auto_increment {
                    return Ok(Resolution::Missing);
                }
            }
        }
    }

    Ok(finish(resolved, descriptors, on_create))
}

/// Resolve from a bare value (path segment or `ids` list entry)
pub fn resolve_value(value: &Value, descriptors: &[IdDescriptor]) -> ResourceResult<Resolution> {
    match descriptors {
        [] => Err(undeterminable()),
        [single] => {
            if value.is_null() {
                return Ok(Resolution::Missing);
            }
            let v = coerce(&single.name, value.clone(), single.id_type)?;
            Ok(Resolution::Resolved(Identifier::Scalar(v)))
        }
        _ => match value {
            Value::Object(map) => {
                let mut record = map.clone();
                resolve_record(&mut record, descriptors, false, false)
            }
            _ => Ok(Resolution::Missing),
        },
    }
}

fn finish(resolved: Map<String, Value>, descriptors: &[IdDescriptor], on_create: bool) -> Resolution {
    if resolved.is_empty() {
        return if on_create {
            Resolution::Pending
        } else {
            Resolution::Missing
        };
    }

    if descriptors.len() == 1 {
        match resolved.into_iter().next() {
            Some((_, v)) => Resolution::Resolved(Identifier::Scalar(v)),
            None => Resolution::Missing,
        }
    } else {
        Resolution::Resolved(Identifier::Composite(resolved))
    }
}

fn undeterminable() -> ResourceError {
    ResourceError::configuration("Identifying field(s) could not be determined.")
}

/// Coerce an identifier value to its declared type
pub fn coerce(name: &str, value: Value, id_type: FieldType) -> ResourceResult<Value> {
    if id_type.is_integer() {
        let coerced = match &value {
            Value::Number(n) => n.as_i64().or_else(|| {
                n.as_f64()
                    .filter(|f| f.fract() == 0.0 && (i64::MIN as f64..i64::MAX as f64).contains(f))
                    .map(|f| f as i64)
            }),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        };
        return coerced.map(Value::from).ok_or_else(|| {
            ResourceError::bad_request(format!(
                "Invalid identifier value {} for field '{}'.",
                value, name
            ))
        });
    }

    if id_type.is_string() {
        return match value {
            Value::String(_) => Ok(value),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            other => Err(ResourceError::bad_request(format!(
                "Invalid identifier value {} for field '{}'.",
                other, name
            ))),
        };
    }

    Ok(value)
}

/// Split an `ids` option into individual entries
pub fn parse_id_list(ids: &Value) -> Vec<Value> {
    match ids {
        Value::Null => Vec::new(),
        Value::String(s) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| Value::String(s.to_string()))
            .collect(),
        Value::Array(items) => items.clone(),
        other => vec![other.clone()],
    }
}

/// Strip identifier fields from a record
pub fn remove_ids(record: &mut Record, descriptors: &[IdDescriptor]) {
    for desc in descriptors {
        record.remove(&desc.name);
    }
}

/// Identifiers of every record, in order
pub fn records_as_ids(records: &[Value], descriptors: &[IdDescriptor]) -> ResourceResult<Vec<Value>> {
    records
        .iter()
        .map(|r| {
            let mut item = r.clone();
            match resolve(&mut item, descriptors, false, false)? {
                Resolution::Resolved(id) => Ok(id.to_value()),
                _ => Err(ResourceError::driver(
                    "Driver returned a record without its identifying field(s).",
                )),
            }
        })
        .collect()
}

/// Equality that treats numbers and numeric strings alike
pub fn loosely_equal(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => x == y,
        _ => match (a, b) {
            (Value::String(s), other) | (other, Value::String(s)) if !other.is_null() => {
                *s == scalar_string(other)
            }
            _ => false,
        },
    }
}

pub(crate) fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

pub(crate) fn scalar_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
