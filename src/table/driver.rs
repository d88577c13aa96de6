//! # Table Driver Contract
//!
//! The hooks a backing store implements so the table resource can run the
//! generic request pipeline against it. Only table lookup, schema, filter
//! retrieval, commit and rollback are mandatory; the rest have defaults.

use serde_json::{Map, Value};

use super::batch::{BatchContext, TransactionItem};
use super::errors::{ResourceError, ResourceResult};
use super::fields::{FieldDescriptor, FieldType};
use super::ids::{IdDescriptor, Identifier};
use super::options::RequestOptions;
use super::Record;

/// Records returned by a filter retrieval
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordSet {
    pub records: Vec<Value>,
    /// Total matches ignoring limit/offset, when `include_count` was asked
    pub total: Option<usize>,
}

impl RecordSet {
    pub fn new(records: Vec<Value>) -> Self {
        Self {
            records,
            total: None,
        }
    }
}

/// Backing store adapter
pub trait TableDriver: Send + Sync {
    /// Canonical table name, or `NotFound`
    fn correct_table_name(&self, name: &str) -> ResourceResult<String>;

    /// Field schema of a table
    fn get_fields_info(&self, table: &str) -> ResourceResult<Vec<FieldDescriptor>>;

    /// Identifier descriptors; an empty list means they cannot be determined
    fn get_ids_info(
        &self,
        _table: &str,
        fields: &[FieldDescriptor],
        requested_fields: Option<&[String]>,
        requested_types: Option<&[String]>,
    ) -> ResourceResult<Vec<IdDescriptor>> {
        default_ids_info(fields, requested_fields, requested_types)
    }

    /// Records matching `filter` (all when `None`), honoring limit, offset,
    /// order and `options.access_filter`
    fn retrieve_records_by_filter(
        &self,
        table: &str,
        filter: Option<&str>,
        params: &Map<String, Value>,
        options: &RequestOptions,
    ) -> ResourceResult<RecordSet>;

    /// Stage one item. Returning `None` defers the item's output to commit.
    ///
    /// The default only accumulates the item for a bulk commit.
    fn add_to_transaction(
        &self,
        batch: &mut BatchContext,
        item: TransactionItem,
    ) -> ResourceResult<Option<Value>> {
        if let Some(record) = item.record {
            batch.records.push(record);
        }
        if let Some(id) = item.id {
            batch.ids.push(id);
        }
        Ok(None)
    }

    /// Flush staged work. `Some` replaces the per-item outputs.
    fn commit_transaction(&self, batch: &mut BatchContext) -> ResourceResult<Option<Vec<Value>>>;

    /// Undo staged or applied work of a rollback-mode batch
    fn rollback_transaction(&self, batch: &mut BatchContext) -> ResourceResult<bool>;

    /// Stored record, used by access filters on update and delete
    fn previous_record(
        &self,
        _batch: &BatchContext,
        _id: &Identifier,
    ) -> ResourceResult<Option<Record>> {
        Ok(None)
    }

    /// Native truncate; `None` makes the resource fall back to retrieve-then-delete
    fn truncate(&self, _table: &str) -> ResourceResult<Option<Vec<Value>>> {
        Ok(None)
    }

    /// Drop any cached schema for `table`
    fn refresh_table_schema(&self, _table: &str) -> ResourceResult<()> {
        Ok(())
    }
}

/// Identifier descriptors from an `id_field`/`id_type` override, or the
/// table's primary-key fields
pub fn default_ids_info(
    fields: &[FieldDescriptor],
    requested_fields: Option<&[String]>,
    requested_types: Option<&[String]>,
) -> ResourceResult<Vec<IdDescriptor>> {
    let names = match requested_fields {
        Some(names) if !names.is_empty() => names,
        _ => {
            return Ok(fields
                .iter()
                .filter(|f| f.is_primary_key)
                .map(IdDescriptor::from_field)
                .collect())
        }
    };

    names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let declared = fields.iter().find(|f| f.name.eq_ignore_ascii_case(name));
            let id_type = match requested_types.and_then(|t| t.get(i)) {
                Some(t) => FieldType::parse(t).ok_or_else(|| {
                    ResourceError::bad_request(format!("Invalid id_type '{}'.", t))
                })?,
                None => declared.map(|f| f.field_type).unwrap_or_default(),
            };
            let mut desc = match declared {
                Some(field) => IdDescriptor::from_field(field),
                None => IdDescriptor::new(name.clone(), id_type),
            };
            desc.id_type = id_type;
            desc.required = true;
            Ok(desc)
        })
        .collect()
}
