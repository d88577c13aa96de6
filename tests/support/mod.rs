//! Shared fixtures for integration tests
//!
//! `RecordingDriver` wraps `MemoryDriver` and logs every driver hook it
//! receives, so tests can assert which calls a table operation made.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::{Map, Value};
use tablegate::driver::MemoryDriver;
use tablegate::table::{
    BatchContext, FieldDescriptor, FieldType, IdDescriptor, Identifier, Record, RecordSet,
    RequestOptions, ResourceError, ResourceResult, TableDriver, TableResource, TransactionItem,
};

// =============================================================================
// Recording Driver
// =============================================================================

#[derive(Default)]
pub struct RecordingDriver {
    inner: MemoryDriver,
    calls: Mutex<Vec<String>>,
    stage_failures: Mutex<HashMap<usize, ResourceError>>,
    commit_failure: Mutex<Option<ResourceError>>,
}

impl RecordingDriver {
    pub fn new(inner: MemoryDriver) -> Self {
        Self {
            inner,
            ..Default::default()
        }
    }

    /// Fail `add_to_transaction` for the item at `index`
    pub fn fail_stage(self, index: usize, err: ResourceError) -> Self {
        self.stage_failures.lock().unwrap().insert(index, err);
        self
    }

    /// Fail the next `commit_transaction`
    pub fn fail_commit(self, err: ResourceError) -> Self {
        *self.commit_failure.lock().unwrap() = Some(err);
        self
    }

    pub fn inner(&self) -> &MemoryDriver {
        &self.inner
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn log(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

impl TableDriver for RecordingDriver {
    fn correct_table_name(&self, name: &str) -> ResourceResult<String> {
        self.log(format!("correct_table_name:{}", name));
        self.inner.correct_table_name(name)
    }

    fn get_fields_info(&self, table: &str) -> ResourceResult<Vec<FieldDescriptor>> {
        self.log("get_fields_info".to_string());
        self.inner.get_fields_info(table)
    }

    fn get_ids_info(
        &self,
        table: &str,
        fields: &[FieldDescriptor],
        requested_fields: Option<&[String]>,
        requested_types: Option<&[String]>,
    ) -> ResourceResult<Vec<IdDescriptor>> {
        self.log("get_ids_info".to_string());
        self.inner
            .get_ids_info(table, fields, requested_fields, requested_types)
    }

    fn retrieve_records_by_filter(
        &self,
        table: &str,
        filter: Option<&str>,
        params: &Map<String, Value>,
        options: &RequestOptions,
    ) -> ResourceResult<RecordSet> {
        self.log(format!("retrieve:{}", filter.unwrap_or("")));
        self.inner
            .retrieve_records_by_filter(table, filter, params, options)
    }

    fn add_to_transaction(
        &self,
        batch: &mut BatchContext,
        item: TransactionItem,
    ) -> ResourceResult<Option<Value>> {
        self.log(format!("add_to_transaction:{}", item.index));
        if let Some(err) = self.stage_failures.lock().unwrap().remove(&item.index) {
            return Err(err);
        }
        self.inner.add_to_transaction(batch, item)
    }

    fn commit_transaction(&self, batch: &mut BatchContext) -> ResourceResult<Option<Vec<Value>>> {
        self.log("commit_transaction".to_string());
        if let Some(err) = self.commit_failure.lock().unwrap().take() {
            return Err(err);
        }
        self.inner.commit_transaction(batch)
    }

    fn rollback_transaction(&self, batch: &mut BatchContext) -> ResourceResult<bool> {
        self.log("rollback_transaction".to_string());
        self.inner.rollback_transaction(batch)
    }

    fn previous_record(
        &self,
        batch: &BatchContext,
        id: &Identifier,
    ) -> ResourceResult<Option<Record>> {
        self.log("previous_record".to_string());
        self.inner.previous_record(batch, id)
    }

    fn truncate(&self, table: &str) -> ResourceResult<Option<Vec<Value>>> {
        self.log("truncate".to_string());
        self.inner.truncate(table)
    }

    fn refresh_table_schema(&self, table: &str) -> ResourceResult<()> {
        self.log("refresh_table_schema".to_string());
        self.inner.refresh_table_schema(table)
    }
}

// =============================================================================
// Bulk Driver
// =============================================================================

/// Driver relying on the default `add_to_transaction`: items accumulate in
/// the batch and are written in one go at commit, which assigns ids.
pub struct BulkDriver {
    fields: Vec<FieldDescriptor>,
    rows: Mutex<Vec<Record>>,
    drop_results: usize,
}

impl BulkDriver {
    pub fn new(fields: Vec<FieldDescriptor>) -> Self {
        Self {
            fields,
            rows: Mutex::new(Vec::new()),
            drop_results: 0,
        }
    }

    /// Return `count` fewer results from commit than records written
    pub fn drop_results(mut self, count: usize) -> Self {
        self.drop_results = count;
        self
    }

    pub fn rows(&self) -> Vec<Record> {
        self.rows.lock().unwrap().clone()
    }
}

impl TableDriver for BulkDriver {
    fn correct_table_name(&self, name: &str) -> ResourceResult<String> {
        if name.eq_ignore_ascii_case("todo") {
            Ok("todo".to_string())
        } else {
            Err(ResourceError::not_found(format!(
                "Table '{}' does not exist in the database.",
                name
            )))
        }
    }

    fn get_fields_info(&self, _table: &str) -> ResourceResult<Vec<FieldDescriptor>> {
        Ok(self.fields.clone())
    }

    fn retrieve_records_by_filter(
        &self,
        _table: &str,
        _filter: Option<&str>,
        _params: &Map<String, Value>,
        _options: &RequestOptions,
    ) -> ResourceResult<RecordSet> {
        Ok(RecordSet::new(self.rows().into_iter().map(Value::Object).collect()))
    }

    fn commit_transaction(&self, batch: &mut BatchContext) -> ResourceResult<Option<Vec<Value>>> {
        let mut rows = self.rows.lock().unwrap();
        let mut written = Vec::new();
        for mut record in batch.records.drain(..) {
            record.insert("id".to_string(), Value::from(rows.len() as i64 + 1));
            rows.push(record.clone());
            written.push(Value::Object(record));
        }
        let keep = written.len().saturating_sub(self.drop_results);
        written.truncate(keep);
        Ok(Some(written))
    }

    fn rollback_transaction(&self, batch: &mut BatchContext) -> ResourceResult<bool> {
        batch.records.clear();
        Ok(true)
    }
}

// =============================================================================
// Fixtures
// =============================================================================

/// `todo(id, name required, done, owner user_id_on_create)`
pub fn todo_fields() -> Vec<FieldDescriptor> {
    vec![
        FieldDescriptor::id("id"),
        FieldDescriptor::new("name", FieldType::String).required(),
        FieldDescriptor::new("done", FieldType::Boolean).with_default(Value::Bool(false)),
        FieldDescriptor::new("owner", FieldType::UserIdOnCreate),
    ]
}

pub fn todo_driver() -> RecordingDriver {
    RecordingDriver::new(MemoryDriver::new().with_table("todo", todo_fields()))
}

pub fn todo_resource() -> TableResource<RecordingDriver> {
    TableResource::new(todo_driver())
}
