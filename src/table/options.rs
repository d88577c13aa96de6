//! # Request Option Normalizer
//!
//! Merges query-string parameters, payload-level options and their aliases
//! into one `RequestOptions` bag, and unwraps the records payload.
//! Performs no I/O.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde_json::{Map, Value};

use super::access::AccessFilter;
use super::errors::{ResourceError, ResourceResult};

/// REST verbs understood by the table resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Verb {
    /// Parse an HTTP method name; `MERGE` is an alias of `PATCH`
    pub fn parse(method: &str) -> Option<Self> {
        match method.trim().to_ascii_uppercase().as_str() {
            "GET" => Some(Verb::Get),
            "POST" => Some(Verb::Post),
            "PUT" => Some(Verb::Put),
            "PATCH" | "MERGE" => Some(Verb::Patch),
            "DELETE" => Some(Verb::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Get => "GET",
            Verb::Post => "POST",
            Verb::Put => "PUT",
            Verb::Patch => "PATCH",
            Verb::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const FIELDS: &str = "fields";
pub const FILTER: &str = "filter";
pub const PARAMS: &str = "params";
pub const LIMIT: &str = "limit";
pub const OFFSET: &str = "offset";
pub const ORDER: &str = "order";
pub const IDS: &str = "ids";
pub const ID_FIELD: &str = "id_field";
pub const ID_TYPE: &str = "id_type";
pub const CONTINUE: &str = "continue";
pub const ROLLBACK: &str = "rollback";
pub const INCLUDE_COUNT: &str = "include_count";
pub const INCLUDE_SCHEMA: &str = "include_schema";
pub const AS_LIST: &str = "as_list";
pub const REFRESH: &str = "refresh";
pub const FORCE: &str = "force";

const OPTION_NAMES: &[&str] = &[
    FIELDS,
    FILTER,
    PARAMS,
    LIMIT,
    OFFSET,
    ORDER,
    IDS,
    ID_FIELD,
    ID_TYPE,
    CONTINUE,
    ROLLBACK,
    INCLUDE_COUNT,
    INCLUDE_SCHEMA,
    AS_LIST,
    REFRESH,
    FORCE,
];

/// Alias to canonical option name
const ALIASES: &[(&str, &str)] = &[
    ("select", FIELDS),
    ("where", FILTER),
    ("top", LIMIT),
    ("skip", OFFSET),
    ("sort", ORDER),
    ("order_by", ORDER),
];

/// Canonical option name for a query or payload key
pub fn canonical_option(key: &str) -> Option<&'static str> {
    let lower = key.to_ascii_lowercase();
    if let Some(name) = OPTION_NAMES.iter().copied().find(|n| *n == lower) {
        return Some(name);
    }
    ALIASES
        .iter()
        .find(|(alias, _)| *alias == lower)
        .map(|(_, name)| *name)
}

/// Per-request options bag
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestOptions {
    pub fields: Option<String>,
    pub filter: Option<String>,
    pub params: Map<String, Value>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub order: Option<String>,
    pub ids: Option<Value>,
    pub id_field: Option<Vec<String>>,
    pub id_type: Option<Vec<String>>,
    pub continue_on_error: bool,
    pub rollback: bool,
    pub include_count: bool,
    pub include_schema: bool,
    pub as_list: bool,
    pub refresh: bool,
    pub force: bool,
    /// Server-side record filter from the permission check, never from client input
    pub access_filter: Option<AccessFilter>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fields(mut self, fields: impl Into<String>) -> Self {
        self.fields = Some(fields.into());
        self
    }

    pub fn with_continue(mut self) -> Self {
        self.continue_on_error = true;
        self
    }

    pub fn with_rollback(mut self) -> Self {
        self.rollback = true;
        self
    }

    /// Build from canonical name/value pairs
    pub fn from_map(raw: &BTreeMap<&'static str, Value>) -> ResourceResult<Self> {
        let mut options = RequestOptions::default();

        for (name, value) in raw {
            match *name {
                FIELDS => options.fields = opt_string(value),
                FILTER => options.filter = opt_string(value),
                PARAMS => options.params = parse_params(value)?,
                LIMIT => options.limit = opt_usize(name, value)?,
                OFFSET => options.offset = opt_usize(name, value)?,
                ORDER => options.order = opt_string(value),
                IDS => {
                    options.ids = match value {
                        Value::Null => None,
                        Value::String(s) if s.trim().is_empty() => None,
                        v => Some(v.clone()),
                    }
                }
                ID_FIELD => options.id_field = opt_list(value),
                ID_TYPE => options.id_type = opt_list(value),
                CONTINUE => options.continue_on_error = parse_bool(name, value)?,
                ROLLBACK => options.rollback = parse_bool(name, value)?,
                INCLUDE_COUNT => options.include_count = parse_bool(name, value)?,
                INCLUDE_SCHEMA => options.include_schema = parse_bool(name, value)?,
                AS_LIST => options.as_list = parse_bool(name, value)?,
                REFRESH => options.refresh = parse_bool(name, value)?,
                FORCE => options.force = parse_bool(name, value)?,
                _ => {}
            }
        }

        Ok(options)
    }
}

/// Output of normalization
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRequest {
    pub verb: Verb,
    pub resource_id: Option<String>,
    pub options: RequestOptions,
    /// Records from the payload, always a list
    pub records: Vec<Value>,
    /// Payload was a bare record object rather than a list or wrapper
    pub single: bool,
}

impl NormalizedRequest {
    /// Whether the response should be a bare record instead of an envelope
    pub fn wants_single(&self) -> bool {
        self.resource_id.is_some() || self.single
    }
}

/// Normalize a request into options and a records list.
///
/// Query-string options win over payload options of the same name.
pub fn normalize(
    verb: Verb,
    resource_id: Option<&str>,
    query: &HashMap<String, String>,
    payload: Option<Value>,
    record_key: &str,
) -> ResourceResult<NormalizedRequest> {
    let mut raw: BTreeMap<&'static str, Value> = BTreeMap::new();
    let options_body = resource_id.map_or(true, |id| id.trim().is_empty())
        && matches!(verb, Verb::Get | Verb::Delete);
    let (records, single) = split_payload(payload, record_key, options_body, &mut raw)?;

    // aliases first so a canonical name given alongside its alias wins
    let (canonical, aliased): (Vec<_>, Vec<_>) = query
        .iter()
        .filter_map(|(key, value)| canonical_option(key).map(|name| (key, name, value)))
        .partition(|(key, name, _)| key.eq_ignore_ascii_case(name));
    for (_, name, value) in aliased.into_iter().chain(canonical) {
        raw.insert(name, Value::String(value.clone()));
    }

    let mut options = RequestOptions::from_map(&raw)?;
    if verb == Verb::Get && options.fields.is_none() {
        options.fields = Some("*".to_string());
    }

    Ok(NormalizedRequest {
        verb,
        resource_id: resource_id
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        options,
        records,
        single,
    })
}

/// Separate payload-level options from record data.
///
/// Outside a wrapper, an object made only of option names is read as
/// options only when `options_body` is set (GET/DELETE on the table).
/// Otherwise it is a record, even if its fields share option names.
fn split_payload(
    payload: Option<Value>,
    record_key: &str,
    options_body: bool,
    raw: &mut BTreeMap<&'static str, Value>,
) -> ResourceResult<(Vec<Value>, bool)> {
    match payload {
        None | Some(Value::Null) => Ok((Vec::new(), false)),
        Some(Value::Array(items)) => Ok((items, false)),
        Some(Value::Object(mut obj)) => {
            if let Some(wrapped) = obj.remove(record_key) {
                take_options(obj, raw);
                let records = match wrapped {
                    Value::Array(items) => items,
                    Value::Null => Vec::new(),
                    record @ Value::Object(_) => vec![record],
                    _ => {
                        return Err(ResourceError::bad_request(format!(
                            "Invalid '{}' value in request payload.",
                            record_key
                        )))
                    }
                };
                return Ok((records, false));
            }

            let options_only = options_body
                && !obj.is_empty()
                && obj.keys().all(|k| canonical_option(k).is_some());
            if options_only {
                take_options(obj, raw);
                return Ok((Vec::new(), false));
            }

            if obj.is_empty() {
                return Ok((Vec::new(), false));
            }
            Ok((vec![Value::Object(obj)], true))
        }
        Some(_) => Err(ResourceError::bad_request(
            "Request payload must be a record, a list of records, or a wrapper object.",
        )),
    }
}

fn take_options(obj: Map<String, Value>, raw: &mut BTreeMap<&'static str, Value>) {
    for (key, value) in obj {
        if let Some(name) = canonical_option(&key) {
            raw.insert(name, value);
        }
    }
}

fn opt_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => Some(
            items
                .iter()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join(","),
        ),
        other => Some(other.to_string()),
    }
}

fn opt_list(value: &Value) -> Option<Vec<String>> {
    let list: Vec<String> = opt_string(value)?
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if list.is_empty() {
        None
    } else {
        Some(list)
    }
}

fn opt_usize(name: &str, value: &Value) -> ResourceResult<Option<usize>> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => n.as_u64().map(|n| Some(n as usize)).ok_or_else(|| {
            ResourceError::bad_request(format!("Invalid {}: {}", name, n))
        }),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => s
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|_| ResourceError::bad_request(format!("Invalid {}: {}", name, s))),
        other => Err(ResourceError::bad_request(format!(
            "Invalid {}: {}",
            name, other
        ))),
    }
}

/// Lenient boolean parsing for query-string and payload values
pub fn parse_bool(name: &str, value: &Value) -> ResourceResult<bool> {
    match value {
        Value::Null => Ok(false),
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => Ok(n.as_f64().map(|f| f != 0.0).unwrap_or(false)),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            // a bare `?include_count` flag counts as set
            "" | "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(ResourceError::bad_request(format!(
                "Invalid boolean value for '{}': {}",
                name, s
            ))),
        },
        other => Err(ResourceError::bad_request(format!(
            "Invalid boolean value for '{}': {}",
            name, other
        ))),
    }
}

fn parse_params(value: &Value) -> ResourceResult<Map<String, Value>> {
    match value {
        Value::Null => Ok(Map::new()),
        Value::Object(map) => Ok(map.clone()),
        Value::String(s) if s.trim().is_empty() => Ok(Map::new()),
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(Value::Object(map)) => Ok(map),
            _ => Err(ResourceError::bad_request(
                "Filter 'params' must be a JSON object.",
            )),
        },
        _ => Err(ResourceError::bad_request(
            "Filter 'params' must be a JSON object.",
        )),
    }
}
