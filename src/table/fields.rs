//! # Field Descriptors
//!
//! Per-field metadata supplied by a driver through `get_fields_info`,
//! including the validation rule catalog applied by the record validator.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Declared field types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    /// Auto-assigned integer key
    Id,
    Integer,
    Float,
    Boolean,
    #[default]
    String,
    Text,
    Date,
    Datetime,
    Timestamp,
    /// Set to the current time on create, never from client input
    TimestampOnCreate,
    /// Set to the current time on every write
    TimestampOnUpdate,
    UserId,
    /// Set to the acting principal on create
    UserIdOnCreate,
    /// Set to the acting principal on every write
    UserIdOnUpdate,
    Json,
}

impl FieldType {
    /// Parse an `id_type` option value
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "id" => Some(FieldType::Id),
            "int" | "integer" | "bigint" => Some(FieldType::Integer),
            "float" | "double" | "decimal" => Some(FieldType::Float),
            "bool" | "boolean" => Some(FieldType::Boolean),
            "string" => Some(FieldType::String),
            "text" => Some(FieldType::Text),
            "date" => Some(FieldType::Date),
            "datetime" => Some(FieldType::Datetime),
            "timestamp" => Some(FieldType::Timestamp),
            "user_id" => Some(FieldType::UserId),
            "json" => Some(FieldType::Json),
            _ => None,
        }
    }

    /// Whether values of this type are coerced to integers when used as identifiers
    pub fn is_integer(&self) -> bool {
        matches!(self, FieldType::Id | FieldType::Integer)
    }

    /// Whether values of this type are coerced to strings when used as identifiers
    pub fn is_string(&self) -> bool {
        matches!(self, FieldType::String | FieldType::Text)
    }

    /// Whether the value is injected by the server rather than read from input
    pub fn is_auto_populated(&self) -> bool {
        matches!(
            self,
            FieldType::TimestampOnCreate
                | FieldType::TimestampOnUpdate
                | FieldType::UserIdOnCreate
                | FieldType::UserIdOnUpdate
        )
    }
}

/// Field metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,

    #[serde(rename = "type", default)]
    pub field_type: FieldType,

    /// Must be present on create
    #[serde(default)]
    pub required: bool,

    /// Explicit `null` accepted
    #[serde(default = "default_allow_null")]
    pub allow_null: bool,

    /// Client-supplied values always rejected
    #[serde(default)]
    pub read_only: bool,

    /// Client-supplied values rejected on update
    #[serde(default)]
    pub create_only: bool,

    #[serde(default)]
    pub is_primary_key: bool,

    /// Store assigns the value on create
    #[serde(default)]
    pub auto_increment: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    /// Allowed values for `picklist` and `multi_picklist` rules
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub picklist: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validation: Vec<ValidationRule>,
}

fn default_allow_null() -> bool {
    true
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
            allow_null: true,
            read_only: false,
            create_only: false,
            is_primary_key: false,
            auto_increment: false,
            default: None,
            picklist: Vec::new(),
            validation: Vec::new(),
        }
    }

    /// An auto-increment integer primary key
    pub fn id(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Id).primary_key().auto_increment()
    }

    pub fn primary_key(mut self) -> Self {
        self.is_primary_key = true;
        self.required = true;
        self.allow_null = false;
        self
    }

    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.allow_null = false;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn create_only(mut self) -> Self {
        self.create_only = true;
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn with_picklist<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.picklist = values.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_rule(mut self, rule: ValidationRule) -> Self {
        self.validation.push(rule);
        self
    }

    /// Whether a create may omit this field
    pub fn may_omit_on_create(&self) -> bool {
        !self.required
            || self.auto_increment
            || self.default.is_some()
            || self.field_type.is_auto_populated()
    }
}

/// A validation rule attached to a field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRule {
    #[serde(flatten)]
    pub kind: RuleKind,

    /// `ignore_field` drops the field on failure; any other value replaces the message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_fail: Option<String>,
}

impl ValidationRule {
    pub fn new(kind: RuleKind) -> Self {
        Self {
            kind,
            on_fail: None,
        }
    }

    /// Drop the field instead of failing the record
    pub fn ignore_on_fail(mut self) -> Self {
        self.on_fail = Some("ignore_field".to_string());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.on_fail = Some(message.into());
        self
    }

    pub fn ignores_field(&self) -> bool {
        self.on_fail
            .as_deref()
            .map(|s| s.eq_ignore_ascii_case("ignore_field"))
            .unwrap_or(false)
    }

    pub fn custom_message(&self) -> Option<&str> {
        match self.on_fail.as_deref() {
            Some(s) if !s.eq_ignore_ascii_case("ignore_field") && !s.is_empty() => Some(s),
            _ => None,
        }
    }
}

/// Validation rule catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum RuleKind {
    ApiReadOnly,
    CreateOnly,
    NotNull,
    NotEmpty,
    NotZero,
    Email,
    Url {
        #[serde(default)]
        path_required: bool,
        #[serde(default)]
        query_required: bool,
    },
    Int {
        #[serde(default)]
        min: Option<i64>,
        #[serde(default)]
        max: Option<i64>,
        #[serde(default)]
        allow_hex: bool,
        #[serde(default)]
        allow_octal: bool,
    },
    Float {
        #[serde(default = "default_decimal")]
        decimal: char,
    },
    Boolean,
    /// Base64-encoded regular expression, optionally `/delimited/` with flags
    Match { regexp: String },
    Picklist,
    MultiPicklist {
        #[serde(default = "default_delimiter")]
        delimiter: char,
        #[serde(default)]
        min: Option<usize>,
        #[serde(default)]
        max: Option<usize>,
    },
}

fn default_decimal() -> char {
    '.'
}

fn default_delimiter() -> char {
    ','
}
