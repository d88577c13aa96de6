//! # Batch Orchestrator
//!
//! Runs a list of request items through one driver transaction.
//!
//! ## Lifecycle
//! - INIT: mode resolved, schema and identifier descriptors loaded
//! - ITERATING: each item staged via the caller's step function
//! - COMMITTING: `commit_transaction` once all items are staged
//! - ROLLING_BACK: on abort in rollback mode, `rollback_transaction` once
//!
//! ## Failure modes
//! - single item or `rollback`: first failure aborts
//! - `continue`: failures are recorded in place and the rest proceed
//! - neither: first failure aborts, earlier items stay applied
//! - configuration errors always abort

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::context::Principal;
use super::driver::TableDriver;
use super::errors::{ResourceError, ResourceResult};
use super::fields::FieldDescriptor;
use super::ids::{id_field_names, IdDescriptor, Identifier};
use super::options::RequestOptions;
use super::Record;

/// What a batch does to each item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Create,
    Update,
    Patch,
    Delete,
    Retrieve,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Patch => "patch",
            Action::Delete => "delete",
            Action::Retrieve => "retrieve",
        }
    }

    pub fn past_tense(&self) -> &'static str {
        match self {
            Action::Create => "created",
            Action::Update => "updated",
            Action::Patch => "patched",
            Action::Delete => "deleted",
            Action::Retrieve => "retrieved",
        }
    }
}

/// Failure handling for one batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchMode {
    pub rollback: bool,
    pub continue_on_error: bool,
    pub single: bool,
}

impl BatchMode {
    /// Resolve from options. A single item ignores both flags; a multi-item
    /// batch may not ask for both.
    pub fn resolve(options: &RequestOptions, count: usize) -> ResourceResult<Self> {
        if count == 1 {
            return Ok(BatchMode {
                rollback: false,
                continue_on_error: false,
                single: true,
            });
        }
        check_conflict(options)?;
        Ok(BatchMode {
            rollback: options.rollback,
            continue_on_error: options.continue_on_error,
            single: false,
        })
    }

    /// Whether the first item failure ends the batch
    pub fn aborts_on_error(&self) -> bool {
        self.single || self.rollback || !self.continue_on_error
    }
}

/// `rollback` and `continue` are mutually exclusive
pub fn check_conflict(options: &RequestOptions) -> ResourceResult<()> {
    if options.rollback && options.continue_on_error {
        return Err(ResourceError::bad_request(
            "Rollback and continue operations can not be requested at the same time.",
        ));
    }
    Ok(())
}

/// One item handed to the driver
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionItem {
    pub index: usize,
    /// Validated record; absent for delete and retrieve
    pub record: Option<Record>,
    /// Resolved identifier; absent for a create without a client key
    pub id: Option<Identifier>,
}

/// What to undo for one applied item
#[derive(Debug, Clone, PartialEq)]
pub struct RollbackEntry {
    pub id: Identifier,
    /// Stored record before the change; `None` when the item created it
    pub previous: Option<Record>,
}

/// Request-scoped batch state shared with the driver
#[derive(Debug, Clone)]
pub struct BatchContext {
    pub table: String,
    pub action: Action,
    pub mode: BatchMode,
    pub options: RequestOptions,
    pub principal: Principal,
    pub record_key: String,
    pub fields_info: Vec<FieldDescriptor>,
    pub ids_info: Vec<IdDescriptor>,
    /// Records staged for a bulk commit
    pub records: Vec<Record>,
    /// Identifiers staged for a bulk commit
    pub ids: Vec<Identifier>,
    pub rollback_records: Vec<RollbackEntry>,
}

impl BatchContext {
    pub fn new(
        table: impl Into<String>,
        action: Action,
        mode: BatchMode,
        options: RequestOptions,
        principal: Principal,
    ) -> Self {
        Self {
            table: table.into(),
            action,
            mode,
            options,
            principal,
            record_key: crate::table::DEFAULT_RECORD_KEY.to_string(),
            fields_info: Vec::new(),
            ids_info: Vec::new(),
            records: Vec::new(),
            ids: Vec::new(),
            rollback_records: Vec::new(),
        }
    }

    pub fn with_schema(mut self, fields: Vec<FieldDescriptor>, ids: Vec<IdDescriptor>) -> Self {
        self.fields_info = fields;
        self.ids_info = ids;
        self
    }

    pub fn with_record_key(mut self, record_key: impl Into<String>) -> Self {
        self.record_key = record_key.into();
        self
    }

    pub fn id_fields(&self) -> Vec<String> {
        id_field_names(&self.ids_info)
    }

    /// Remember how to undo an applied item, when rolling back is possible
    pub fn track_rollback(&mut self, id: Identifier, previous: Option<Record>) {
        if self.mode.rollback {
            self.rollback_records.push(RollbackEntry { id, previous });
        }
    }
}

/// Indices of failed items, in order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorLedger {
    indices: Vec<usize>,
}

impl ErrorLedger {
    pub fn record(&mut self, index: usize) {
        self.indices.push(index);
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn contains(&self, index: usize) -> bool {
        self.indices.binary_search(&index).is_ok()
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn into_indices(self) -> Vec<usize> {
        self.indices
    }
}

/// Result of a finished batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    /// One entry per item; failed items hold their error message
    pub outputs: Vec<Value>,
    pub errors: Vec<usize>,
}

/// Run `items` through `step` and the driver's commit.
///
/// `step` validates one item and stages it with the driver, returning the
/// item's output or `None` when the driver defers it to commit.
pub fn run<D, I, F>(
    driver: &D,
    batch: &mut BatchContext,
    items: Vec<I>,
    mut step: F,
) -> ResourceResult<BatchOutcome>
where
    D: TableDriver + ?Sized,
    F: FnMut(&D, &mut BatchContext, usize, I) -> ResourceResult<Option<Value>>,
{
    info!(
        table = %batch.table,
        action = batch.action.as_str(),
        count = items.len(),
        rollback = batch.mode.rollback,
        continue_on_error = batch.mode.continue_on_error,
        "batch started"
    );

    let mut outputs = Vec::with_capacity(items.len());
    let mut ledger = ErrorLedger::default();

    for (index, item) in items.into_iter().enumerate() {
        let err = match step(driver, batch, index, item) {
            Ok(output) => {
                outputs.push(output.unwrap_or(Value::Null));
                continue;
            }
            Err(err) => err,
        };

        warn!(table = %batch.table, index, error = %err, "batch item failed");

        if err.is_fatal() {
            return Err(abort(driver, batch, err, &ledger, outputs));
        }

        if batch.mode.aborts_on_error() {
            // a failure on the very first item is reported as-is
            if index > 0 {
                ledger.record(index);
                outputs.push(Value::String(err.to_string()));
            }
            return Err(abort(driver, batch, err, &ledger, outputs));
        }

        ledger.record(index);
        outputs.push(Value::String(err.to_string()));
    }

    debug!(table = %batch.table, staged = outputs.len(), "committing batch");
    let outputs = match driver.commit_transaction(batch) {
        Ok(Some(results)) => match merge_commit(outputs.clone(), &ledger, results) {
            Ok(merged) => merged,
            Err(err) => {
                warn!(table = %batch.table, error = %err, "batch commit results rejected");
                return Err(abort(driver, batch, err, &ledger, outputs));
            }
        },
        Ok(None) => outputs,
        Err(err) => {
            warn!(table = %batch.table, error = %err, "batch commit failed");
            return Err(abort(driver, batch, err, &ledger, outputs));
        }
    };

    info!(
        table = %batch.table,
        action = batch.action.as_str(),
        failed = ledger.len(),
        "batch finished"
    );

    Ok(BatchOutcome {
        outputs,
        errors: ledger.into_indices(),
    })
}

/// Commit results cover only the items that staged successfully; slot them
/// around the recorded failures.
///
/// A driver may also return one result per item, in which case the failure
/// slots keep their messages. Any other count cannot be lined up.
fn merge_commit(
    outputs: Vec<Value>,
    ledger: &ErrorLedger,
    results: Vec<Value>,
) -> ResourceResult<Vec<Value>> {
    if ledger.is_empty() {
        return Ok(results);
    }

    let staged = outputs.len() - ledger.len();
    if results.len() == outputs.len() {
        return Ok(outputs
            .into_iter()
            .zip(results)
            .enumerate()
            .map(|(index, (output, result))| if ledger.contains(index) { output } else { result })
            .collect());
    }
    if results.len() != staged {
        return Err(ResourceError::driver(format!(
            "Commit returned {} results for {} staged records.",
            results.len(),
            staged
        )));
    }

    let mut results = results.into_iter();
    Ok(outputs
        .into_iter()
        .enumerate()
        .map(|(index, output)| {
            if ledger.contains(index) {
                output
            } else {
                results.next().unwrap_or(output)
            }
        })
        .collect())
}

/// Build the error for an aborted batch, rolling back first when asked to
fn abort<D: TableDriver + ?Sized>(
    driver: &D,
    batch: &mut BatchContext,
    err: ResourceError,
    ledger: &ErrorLedger,
    outputs: Vec<Value>,
) -> ResourceError {
    let mut message = err.to_string();
    let mut err = err;

    if !ledger.is_empty() {
        message = format!(
            "Batch Error: Not all records could be {}.",
            batch.action.past_tense()
        );
        let mut context = json!({ "error": ledger.indices() });
        if let Value::Object(map) = &mut context {
            map.insert(batch.record_key.clone(), Value::Array(outputs));
        }
        err = err.into_batch(message.clone(), context);
    }

    if batch.mode.rollback {
        match driver.rollback_transaction(batch) {
            Ok(_) => info!(table = %batch.table, "batch rolled back"),
            Err(e) => warn!(table = %batch.table, error = %e, "batch rollback failed"),
        }
        message.push_str(" All changes rolled back.");
        err = err.with_message(message);
    }

    err
}
