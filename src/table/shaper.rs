//! # Result Shaper
//!
//! Projects driver output onto the requested fields and wraps it for the
//! client: a bare record for single-record requests, otherwise the
//! `{<record_key>: [...], meta?, error?}` envelope.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::Record;

/// Projection requested through the `fields` option
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldSelection {
    /// `*`
    All,
    /// No `fields` given; identifiers only
    IdsOnly,
    /// Comma-separated list; identifiers are always kept
    Only(Vec<String>),
}

impl FieldSelection {
    pub fn parse(fields: Option<&str>) -> Self {
        let raw = match fields.map(str::trim) {
            None | Some("") => return FieldSelection::IdsOnly,
            Some(raw) => raw,
        };

        let names: Vec<String> = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        if names.iter().any(|n| n == "*") {
            FieldSelection::All
        } else if names.is_empty() {
            FieldSelection::IdsOnly
        } else {
            FieldSelection::Only(names)
        }
    }
}

/// Response metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
}

impl Meta {
    pub fn is_empty(&self) -> bool {
        self.count.is_none() && self.schema.is_none()
    }
}

/// Records produced by one table operation, before wrapping
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationResult {
    /// One entry per request item; failed items hold their error message
    pub records: Vec<Value>,
    /// Indices of failed items (continue mode)
    pub errors: Vec<usize>,
    pub meta: Option<Meta>,
    /// Identifier field names of the table
    pub id_fields: Vec<String>,
}

impl OperationResult {
    pub fn empty(id_fields: Vec<String>) -> Self {
        Self {
            id_fields,
            ..Default::default()
        }
    }
}

/// Project one record; non-object entries (error messages) pass through
pub fn clean_record(record: Value, selection: &FieldSelection, id_fields: &[String]) -> Value {
    match record {
        Value::Object(map) => Value::Object(clean_map(map, selection, id_fields)),
        other => other,
    }
}

pub fn clean_records(
    records: Vec<Value>,
    selection: &FieldSelection,
    id_fields: &[String],
) -> Vec<Value> {
    records
        .into_iter()
        .map(|r| clean_record(r, selection, id_fields))
        .collect()
}

fn clean_map(mut map: Record, selection: &FieldSelection, id_fields: &[String]) -> Record {
    let wanted: Vec<&String> = match selection {
        FieldSelection::All => return map,
        FieldSelection::IdsOnly => id_fields.iter().collect(),
        FieldSelection::Only(names) => id_fields
            .iter()
            .chain(names.iter().filter(|n| !id_fields.contains(n)))
            .collect(),
    };

    let mut out = Record::new();
    for name in wanted {
        if let Some(value) = map.remove(name.as_str()) {
            out.insert(name.clone(), value);
        }
    }
    out
}

/// Identifier values of each record: scalars for single keys, objects for composite
pub fn ids_as_list(records: &[Value], id_fields: &[String]) -> Vec<Value> {
    records
        .iter()
        .filter_map(Value::as_object)
        .map(|record| match id_fields {
            [single] => record.get(single).cloned().unwrap_or(Value::Null),
            many => Value::Object(
                many.iter()
                    .filter_map(|n| record.get(n).map(|v| (n.clone(), v.clone())))
                    .collect(),
            ),
        })
        .collect()
}

/// Build the public envelope
pub fn wrap(records: Vec<Value>, record_key: &str, meta: Option<Meta>, errors: &[usize]) -> Value {
    let mut out = Map::new();
    out.insert(record_key.to_string(), Value::Array(records));
    if let Some(meta) = meta.filter(|m| !m.is_empty()) {
        out.insert(
            "meta".to_string(),
            serde_json::to_value(meta).unwrap_or(Value::Null),
        );
    }
    if !errors.is_empty() {
        out.insert("error".to_string(), Value::from(errors.to_vec()));
    }
    Value::Object(out)
}

/// Records list from an envelope, a bare list or a bare record
pub fn unwrap(payload: &Value, record_key: &str) -> Vec<Value> {
    match payload {
        Value::Array(items) => items.clone(),
        Value::Object(obj) => match obj.get(record_key) {
            Some(Value::Array(items)) => items.clone(),
            Some(record @ Value::Object(_)) => vec![record.clone()],
            Some(_) => Vec::new(),
            None => vec![payload.clone()],
        },
        _ => Vec::new(),
    }
}

/// Final response value for a finished operation
pub fn shape(result: OperationResult, single: bool, as_list: bool, record_key: &str) -> Value {
    if as_list {
        return Value::Array(ids_as_list(&result.records, &result.id_fields));
    }

    if single && result.records.len() == 1 && result.errors.is_empty() {
        if let Some(record) = result.records.into_iter().next() {
            return record;
        }
        return Value::Null;
    }

    wrap(result.records, record_key, result.meta, &result.errors)
}
