//! # Record Validator
//!
//! Sanitizes a client record against the table's field descriptors before it
//! is handed to a driver:
//! - undeclared fields are dropped
//! - each declared field runs its validation rules
//! - auto-populated fields (`timestamp_on_*`, `user_id_on_*`) are injected
//! - the record-level access filter is checked last

use std::sync::OnceLock;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use serde_json::Value;

use super::access::AccessFilter;
use super::context::Principal;
use super::errors::{ResourceError, ResourceResult};
use super::fields::{FieldDescriptor, FieldType, RuleKind, ValidationRule};
use super::ids::scalar_string;
use super::Record;

/// Per-record validation inputs that are not field metadata
#[derive(Debug, Clone)]
pub struct ValidationContext<'a> {
    pub principal: &'a Principal,
    pub now: DateTime<Utc>,
}

impl<'a> ValidationContext<'a> {
    pub fn new(principal: &'a Principal) -> Self {
        Self {
            principal,
            now: Utc::now(),
        }
    }
}

/// Validate and sanitize one record.
///
/// `previous` is the stored record on update, used by the access filter when
/// the incoming record omits a filtered field.
pub fn parse_record(
    record: Record,
    fields: &[FieldDescriptor],
    access: Option<&AccessFilter>,
    for_update: bool,
    previous: Option<&Record>,
    ctx: &ValidationContext<'_>,
) -> ResourceResult<Record> {
    let parsed = if fields.is_empty() {
        record
    } else {
        parse_fields(record, fields, for_update, ctx)?
    };

    if let Some(filter) = access {
        filter.validate_record(&parsed, for_update, previous)?;
    }

    Ok(parsed)
}

fn parse_fields(
    mut record: Record,
    fields: &[FieldDescriptor],
    for_update: bool,
    ctx: &ValidationContext<'_>,
) -> ResourceResult<Record> {
    let mut parsed = Record::new();

    for field in fields {
        let name = &field.name;
        let supplied = take_field(&mut record, name);

        if field.field_type.is_auto_populated() {
            if let Some(value) = auto_value(field.field_type, for_update, ctx) {
                parsed.insert(name.clone(), value);
            }
            continue;
        }

        match supplied {
            Some(value) => {
                // empty containers stand in for null from some encodings
                let value = match value {
                    Value::Array(ref a) if a.is_empty() => Value::Null,
                    v => v,
                };
                if value.is_null() && !field.allow_null {
                    return Err(ResourceError::bad_request(format!(
                        "Field '{}' can not be NULL.",
                        name
                    )));
                }
                if validate_field_value(field, &value, for_update)? {
                    parsed.insert(name.clone(), value);
                }
            }
            None => {
                if !for_update && !field.may_omit_on_create() {
                    return Err(ResourceError::bad_request(format!(
                        "Required field '{}' can not be NULL.",
                        name
                    )));
                }
            }
        }
    }

    Ok(parsed)
}

/// Remove a field by name, matching case-insensitively
fn take_field(record: &mut Record, name: &str) -> Option<Value> {
    if let Some(v) = record.remove(name) {
        return Some(v);
    }
    let key = record
        .keys()
        .find(|k| k.eq_ignore_ascii_case(name))
        .cloned()?;
    record.remove(&key)
}

fn auto_value(field_type: FieldType, for_update: bool, ctx: &ValidationContext<'_>) -> Option<Value> {
    let now = || Value::String(ctx.now.to_rfc3339_opts(SecondsFormat::Secs, true));
    match field_type {
        FieldType::TimestampOnCreate if !for_update => Some(now()),
        FieldType::TimestampOnUpdate => Some(now()),
        FieldType::UserIdOnCreate if !for_update => ctx.principal.user_id.clone(),
        FieldType::UserIdOnUpdate => ctx.principal.user_id.clone(),
        _ => None,
    }
}

/// Run a field's rules. `Ok(false)` drops the field from the output.
pub fn validate_field_value(
    field: &FieldDescriptor,
    value: &Value,
    for_update: bool,
) -> ResourceResult<bool> {
    let implied = [
        field
            .read_only
            .then(|| ValidationRule::new(RuleKind::ApiReadOnly)),
        field
            .create_only
            .then(|| ValidationRule::new(RuleKind::CreateOnly)),
    ];

    for rule in implied.iter().flatten().chain(field.validation.iter()) {
        if let Some(default_msg) = check_rule(field, &rule.kind, value, for_update)? {
            if rule.ignores_field() {
                return Ok(false);
            }
            let msg = rule
                .custom_message()
                .map(str::to_string)
                .unwrap_or(default_msg);
            return Err(ResourceError::bad_request(msg));
        }
    }

    Ok(true)
}

/// `Some(message)` on failure
fn check_rule(
    field: &FieldDescriptor,
    kind: &RuleKind,
    value: &Value,
    for_update: bool,
) -> ResourceResult<Option<String>> {
    let name = &field.name;
    let fail = |what: &str| Ok(Some(format!("Field '{}' {}", name, what)));

    match kind {
        RuleKind::ApiReadOnly => fail("is read only."),
        RuleKind::CreateOnly if for_update => fail("can only be set during record creation."),
        RuleKind::CreateOnly => Ok(None),
        RuleKind::NotNull if value.is_null() => fail("value can not be null."),
        RuleKind::NotNull => Ok(None),
        _ if value.is_null() => Ok(None),
        RuleKind::NotEmpty if is_empty_value(value) => fail("value can not be empty."),
        RuleKind::NotEmpty => Ok(None),
        RuleKind::NotZero if is_zero(value) => fail("value can not be zero."),
        RuleKind::NotZero => Ok(None),
        _ if is_empty_value(value) && !matches!(kind, RuleKind::Boolean | RuleKind::Int { .. }) => {
            Ok(None)
        }
        RuleKind::Email if !is_email(value) => fail("value must be a valid email address."),
        RuleKind::Email => Ok(None),
        RuleKind::Url {
            path_required,
            query_required,
        } if !is_url(value, *path_required, *query_required) => {
            fail("value must be a valid URL.")
        }
        RuleKind::Url { .. } => Ok(None),
        RuleKind::Int {
            min,
            max,
            allow_hex,
            allow_octal,
        } => match parse_int(value, *allow_hex, *allow_octal) {
            Some(n) if min.map_or(true, |m| n >= m) && max.map_or(true, |m| n <= m) => Ok(None),
            _ => fail("value is not in the valid range."),
        },
        RuleKind::Float { decimal } if parse_float(value, *decimal).is_none() => {
            fail("value is not an acceptable float value.")
        }
        RuleKind::Float { .. } => Ok(None),
        RuleKind::Boolean if parse_boolean(value).is_none() => {
            fail("value is not an acceptable boolean value.")
        }
        RuleKind::Boolean => Ok(None),
        RuleKind::Match { regexp } => {
            let re = decode_pattern(name, regexp)?;
            if re.is_match(&scalar_string(value)) {
                Ok(None)
            } else {
                fail("value is invalid.")
            }
        }
        RuleKind::Picklist => {
            if field.picklist.iter().any(|p| *p == scalar_string(value)) {
                Ok(None)
            } else {
                fail("value is not in the valid picklist.")
            }
        }
        RuleKind::MultiPicklist {
            delimiter,
            min,
            max,
        } => {
            let selections = selections(value, *delimiter);
            if selections.len() < min.unwrap_or(1) {
                return fail("value does not contain enough selections.");
            }
            if max.map_or(false, |m| selections.len() > m) {
                return fail("value contains too many selections.");
            }
            if selections.iter().all(|s| field.picklist.contains(s)) {
                Ok(None)
            } else {
                fail("value is not in the valid picklist.")
            }
        }
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty() || s == "0",
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
    }
}

fn is_zero(value: &Value) -> bool {
    match value {
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.trim().parse::<f64>().map(|f| f == 0.0).unwrap_or(false),
        _ => false,
    }
}

fn email_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(
                r"^[A-Za-z0-9.!#$%&'*+/=?^_`{|}~-]+@[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?)+$",
            )
            .ok()
        })
        .as_ref()
}

fn is_email(value: &Value) -> bool {
    match (value.as_str(), email_pattern()) {
        (Some(s), Some(re)) => re.is_match(s),
        _ => false,
    }
}

fn is_url(value: &Value, path_required: bool, query_required: bool) -> bool {
    let Some(parsed) = value.as_str().and_then(|s| url::Url::parse(s).ok()) else {
        return false;
    };
    if parsed.host_str().is_none() {
        return false;
    }
    if path_required && matches!(parsed.path(), "" | "/") {
        return false;
    }
    if query_required && parsed.query().map_or(true, str::is_empty) {
        return false;
    }
    true
}

fn parse_int(value: &Value, allow_hex: bool, allow_octal: bool) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(n) = s.parse::<i64>() {
                if !(s.len() > 1 && s.starts_with('0')) {
                    return Some(n);
                }
            }
            if allow_hex {
                if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                    return i64::from_str_radix(hex, 16).ok();
                }
            }
            if allow_octal && s.len() > 1 && s.starts_with('0') {
                return i64::from_str_radix(&s[1..], 8).ok();
            }
            None
        }
        _ => None,
    }
}

fn parse_float(value: &Value, decimal: char) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let s = s.trim();
            let normalized = if decimal == '.' {
                s.to_string()
            } else {
                s.replace('.', "").replace(decimal, ".")
            };
            normalized.parse::<f64>().ok()
        }
        _ => None,
    }
}

fn parse_boolean(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_i64() {
            Some(1) => Some(true),
            Some(0) => Some(false),
            _ => None,
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "on" | "yes" => Some(true),
            "0" | "false" | "off" | "no" | "" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Decode a base64 pattern, accepting `/pattern/flags` delimiters
fn decode_pattern(name: &str, encoded: &str) -> ResourceResult<Regex> {
    let invalid = || {
        ResourceError::configuration(format!(
            "Invalid validation pattern configured for field '{}'.",
            name
        ))
    };

    let bytes = STANDARD.decode(encoded.trim()).map_err(|_| invalid())?;
    let raw = String::from_utf8(bytes).map_err(|_| invalid())?;

    let pattern = match raw.strip_prefix('/').and_then(|rest| rest.rfind('/').map(|i| (rest, i))) {
        Some((rest, end)) => {
            let (body, flags) = rest.split_at(end);
            let flags: String = flags[1..].chars().filter(|c| "imsx".contains(*c)).collect();
            if flags.is_empty() {
                body.to_string()
            } else {
                format!("(?{}){}", flags, body)
            }
        }
        None => raw,
    };

    Regex::new(&pattern).map_err(|_| invalid())
}

fn selections(value: &Value, delimiter: char) -> Vec<String> {
    match value {
        Value::Array(items) => items.iter().map(scalar_string).collect(),
        other => scalar_string(other)
            .split(delimiter)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::access::{FieldFilter, FilterOperator};
    use serde_json::json;

    fn record(v: Value) -> Record {
        serde_json::from_value(v).unwrap()
    }

    fn rule(kind: RuleKind) -> ValidationRule {
        ValidationRule::new(kind)
    }

    fn field(name: &str, r: RuleKind) -> FieldDescriptor {
        FieldDescriptor::new(name, FieldType::String).with_rule(rule(r))
    }

    fn check(f: &FieldDescriptor, v: Value) -> ResourceResult<bool> {
        validate_field_value(f, &v, false)
    }

    #[test]
    fn test_undeclared_fields_are_dropped() {
        let fields = vec![FieldDescriptor::new("name", FieldType::String)];
        let p = Principal::anonymous();
        let out = parse_record(
            record(json!({"name": "a", "extra": 1})),
            &fields,
            None,
            false,
            None,
            &ValidationContext::new(&p),
        )
        .unwrap();
        assert_eq!(out, record(json!({"name": "a"})));
    }

    #[test]
    fn test_field_names_match_case_insensitively() {
        let fields = vec![FieldDescriptor::new("Name", FieldType::String)];
        let p = Principal::anonymous();
        let out = parse_record(
            record(json!({"name": "a"})),
            &fields,
            None,
            false,
            None,
            &ValidationContext::new(&p),
        )
        .unwrap();
        assert_eq!(out.get("Name"), Some(&json!("a")));
    }

    #[test]
    fn test_required_on_create_only() {
        let fields = vec![FieldDescriptor::new("name", FieldType::String).required()];
        let p = Principal::anonymous();
        let ctx = ValidationContext::new(&p);

        let err = parse_record(record(json!({})), &fields, None, false, None, &ctx).unwrap_err();
        assert_eq!(err.to_string(), "Required field 'name' can not be NULL.");
        assert!(parse_record(record(json!({})), &fields, None, true, None, &ctx).is_ok());
    }

    #[test]
    fn test_disallowed_null() {
        let fields = vec![FieldDescriptor::new("name", FieldType::String).not_null()];
        let p = Principal::anonymous();
        let err = parse_record(
            record(json!({"name": null})),
            &fields,
            None,
            true,
            None,
            &ValidationContext::new(&p),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "Field 'name' can not be NULL.");
    }

    #[test]
    fn test_auto_populated_fields() {
        let fields = vec![
            FieldDescriptor::new("created", FieldType::TimestampOnCreate),
            FieldDescriptor::new("updated", FieldType::TimestampOnUpdate),
            FieldDescriptor::new("created_by", FieldType::UserIdOnCreate),
            FieldDescriptor::new("updated_by", FieldType::UserIdOnUpdate),
        ];
        let p = Principal::user(5);
        let ctx = ValidationContext::new(&p);

        let created = parse_record(
            record(json!({"created": "client value"})),
            &fields,
            None,
            false,
            None,
            &ctx,
        )
        .unwrap();
        assert_ne!(created["created"], json!("client value"));
        assert!(created.contains_key("updated"));
        assert_eq!(created["created_by"], json!(5));
        assert_eq!(created["updated_by"], json!(5));

        let updated = parse_record(record(json!({})), &fields, None, true, None, &ctx).unwrap();
        assert!(!updated.contains_key("created"));
        assert!(!updated.contains_key("created_by"));
        assert!(updated.contains_key("updated"));
        assert_eq!(updated["updated_by"], json!(5));
    }

    #[test]
    fn test_read_only_and_create_only() {
        let ro = FieldDescriptor::new("a", FieldType::String).read_only();
        assert!(check(&ro, json!("x")).is_err());

        let co = FieldDescriptor::new("b", FieldType::String).create_only();
        assert!(validate_field_value(&co, &json!("x"), false).unwrap());
        let err = validate_field_value(&co, &json!("x"), true).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Field 'b' can only be set during record creation."
        );
    }

    #[test]
    fn test_ignore_field_drops_instead_of_raising() {
        let f = FieldDescriptor::new("email", FieldType::String)
            .with_rule(rule(RuleKind::Email).ignore_on_fail());
        assert_eq!(check(&f, json!("nope")).unwrap(), false);
    }

    #[test]
    fn test_custom_failure_message() {
        let f = FieldDescriptor::new("email", FieldType::String)
            .with_rule(rule(RuleKind::Email).with_message("Give us a real address"));
        assert_eq!(
            check(&f, json!("nope")).unwrap_err().to_string(),
            "Give us a real address"
        );
    }

    #[test]
    fn test_null_and_empty_rules() {
        let f = field("a", RuleKind::NotNull);
        assert!(check(&f, Value::Null).is_err());
        assert!(check(&f, json!("")).unwrap());

        let f = field("a", RuleKind::NotEmpty);
        assert!(check(&f, json!("")).is_err());
        assert!(check(&f, Value::Null).unwrap());

        let f = field("a", RuleKind::NotZero);
        assert!(check(&f, json!(0)).is_err());
        assert!(check(&f, json!("0.0")).is_err());
        assert!(check(&f, json!(3)).unwrap());
    }

    #[test]
    fn test_email_and_url() {
        let f = field("e", RuleKind::Email);
        assert!(check(&f, json!("a.b@example.com")).unwrap());
        assert!(check(&f, json!("a@b")).is_err());

        let f = field(
            "u",
            RuleKind::Url {
                path_required: true,
                query_required: false,
            },
        );
        assert!(check(&f, json!("https://example.com/docs")).unwrap());
        assert!(check(&f, json!("https://example.com")).is_err());
        assert!(check(&f, json!("not a url")).is_err());
    }

    #[test]
    fn test_int_range_and_formats() {
        let f = field(
            "n",
            RuleKind::Int {
                min: Some(1),
                max: Some(20),
                allow_hex: true,
                allow_octal: true,
            },
        );
        assert!(check(&f, json!(5)).unwrap());
        assert!(check(&f, json!("0x10")).unwrap());
        assert!(check(&f, json!("017")).unwrap());
        assert!(check(&f, json!(21)).is_err());
        assert!(check(&f, json!(2.5)).is_err());

        let strict = field(
            "n",
            RuleKind::Int {
                min: None,
                max: None,
                allow_hex: false,
                allow_octal: false,
            },
        );
        assert!(check(&strict, json!("0x10")).is_err());
    }

    #[test]
    fn test_float_decimal_separator() {
        let f = field("f", RuleKind::Float { decimal: ',' });
        assert!(check(&f, json!("3,14")).unwrap());
        assert!(check(&f, json!("abc")).is_err());
    }

    #[test]
    fn test_boolean_rule() {
        let f = field("b", RuleKind::Boolean);
        assert!(check(&f, json!("yes")).unwrap());
        assert!(check(&f, json!(0)).unwrap());
        assert!(check(&f, json!("perhaps")).is_err());
    }

    #[test]
    fn test_match_rule_base64_pattern() {
        let encoded = STANDARD.encode("/^[a-z]+$/i");
        let f = field("m", RuleKind::Match { regexp: encoded });
        assert!(check(&f, json!("Hello")).unwrap());
        assert!(check(&f, json!("hello1")).is_err());

        let broken = field(
            "m",
            RuleKind::Match {
                regexp: "%%%".to_string(),
            },
        );
        assert!(check(&broken, json!("x")).unwrap_err().is_fatal());
    }

    #[test]
    fn test_picklists() {
        let f = FieldDescriptor::new("p", FieldType::String)
            .with_picklist(["red", "green", "blue"])
            .with_rule(rule(RuleKind::Picklist));
        assert!(check(&f, json!("red")).unwrap());
        assert!(check(&f, json!("pink")).is_err());

        let f = FieldDescriptor::new("m", FieldType::String)
            .with_picklist(["red", "green", "blue"])
            .with_rule(rule(RuleKind::MultiPicklist {
                delimiter: ',',
                min: Some(2),
                max: Some(2),
            }));
        assert!(check(&f, json!("red,blue")).unwrap());
        assert!(check(&f, json!("red")).is_err());
        assert!(check(&f, json!("red,green,blue")).is_err());
        assert!(check(&f, json!("red,pink")).is_err());
    }

    #[test]
    fn test_access_filter_applied_after_parse() {
        let fields = vec![
            FieldDescriptor::new("owner", FieldType::UserIdOnCreate),
            FieldDescriptor::new("title", FieldType::String),
        ];
        let p = Principal::user("alice");
        let filter = AccessFilter::all(vec![FieldFilter::new(
            "owner",
            FilterOperator::Eq,
            json!("{user.id}"),
        )])
        .bind(&p);
        let out = parse_record(
            record(json!({"title": "t", "owner": "mallory"})),
            &fields,
            Some(&filter),
            false,
            None,
            &ValidationContext::new(&p),
        )
        .unwrap();
        assert_eq!(out["owner"], json!("alice"));
    }
}
