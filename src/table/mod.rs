//! # Table Resource Core
//!
//! Database-agnostic request pipeline for table resources:
//! option normalization, identifier resolution, record validation,
//! batch orchestration over a driver transaction, filter-to-ids
//! translation and result shaping.
//!
//! Backing stores plug in through [`driver::TableDriver`].

pub mod access;
pub mod batch;
pub mod context;
pub mod driver;
pub mod errors;
pub mod fields;
pub mod ids;
pub mod options;
pub mod policy;
pub mod resource;
pub mod shaper;
pub mod validator;

/// A record: field name to JSON value
pub type Record = serde_json::Map<String, serde_json::Value>;

/// Envelope key used when none is configured
pub const DEFAULT_RECORD_KEY: &str = "record";

pub use access::{AccessFilter, Combiner, FieldFilter, FilterOperator};
pub use batch::{Action, BatchContext, BatchMode, RollbackEntry, TransactionItem};
pub use context::{Principal, RequestContext};
pub use driver::{RecordSet, TableDriver};
pub use errors::{ErrorKind, ResourceError, ResourceResult};
pub use fields::{FieldDescriptor, FieldType, RuleKind, ValidationRule};
pub use ids::{IdDescriptor, Identifier, Resolution};
pub use options::{normalize, NormalizedRequest, RequestOptions, Verb};
pub use policy::{AccessPolicy, OpenPolicy, RulePolicy, TableRule};
pub use resource::{ResourceSettings, TableResource};
pub use shaper::{FieldSelection, Meta, OperationResult};
