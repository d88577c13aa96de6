//! # In-Memory Driver
//!
//! Reference `TableDriver` over tables held in process memory. Writes are
//! applied as each item is staged; rollback replays the batch's rollback
//! records in reverse. Retrievals by id are deferred to commit.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::{Map, Value};
use tracing::debug;

use super::condition::Condition;
use crate::table::batch::{Action, BatchContext, TransactionItem};
use crate::table::driver::{RecordSet, TableDriver};
use crate::table::errors::{ResourceError, ResourceResult};
use crate::table::fields::{FieldDescriptor, FieldType};
use crate::table::ids::{as_number, resolve_record, IdDescriptor, Identifier, Resolution};
use crate::table::options::RequestOptions;
use crate::table::Record;

#[derive(Debug, Clone)]
struct MemoryTable {
    name: String,
    fields: Vec<FieldDescriptor>,
    rows: Vec<Record>,
    next_id: i64,
}

impl MemoryTable {
    fn position(&self, id: &Identifier, ids: &[IdDescriptor]) -> Option<usize> {
        self.rows.iter().position(|r| id.matches(r, ids))
    }

    /// Position of a row visible through the batch's access filter
    fn visible_position(&self, id: &Identifier, batch: &BatchContext) -> Option<usize> {
        let filter = batch.options.access_filter.as_ref();
        self.rows
            .iter()
            .position(|r| id.matches(r, &batch.ids_info) && filter.map_or(true, |f| f.matches(r)))
    }
}

/// In-process table store
#[derive(Debug, Default)]
pub struct MemoryDriver {
    tables: RwLock<BTreeMap<String, MemoryTable>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of `create_table`
    pub fn with_table(mut self, name: &str, fields: Vec<FieldDescriptor>) -> Self {
        let tables = self
            .tables
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        tables.insert(name.to_ascii_lowercase(), new_table(name, fields));
        self
    }

    /// Create or replace a table
    pub fn create_table(&self, name: &str, fields: Vec<FieldDescriptor>) -> ResourceResult<()> {
        let mut tables = self.write()?;
        tables.insert(name.to_ascii_lowercase(), new_table(name, fields));
        Ok(())
    }

    /// Snapshot of a table's rows; empty for unknown tables
    pub fn rows(&self, table: &str) -> Vec<Record> {
        self.read()
            .ok()
            .and_then(|tables| {
                tables
                    .get(&table.to_ascii_lowercase())
                    .map(|t| t.rows.clone())
            })
            .unwrap_or_default()
    }

    pub fn table_names(&self) -> Vec<String> {
        self.read()
            .map(|tables| tables.values().map(|t| t.name.clone()).collect())
            .unwrap_or_default()
    }

    fn read(&self) -> ResourceResult<RwLockReadGuard<'_, BTreeMap<String, MemoryTable>>> {
        self.tables.read().map_err(|_| lock_poisoned())
    }

    fn write(&self) -> ResourceResult<RwLockWriteGuard<'_, BTreeMap<String, MemoryTable>>> {
        self.tables.write().map_err(|_| lock_poisoned())
    }

    fn insert(&self, batch: &mut BatchContext, item: TransactionItem) -> ResourceResult<Value> {
        let mut record = item.record.unwrap_or_default();
        let mut tables = self.write()?;
        let table = table_mut(&mut tables, &batch.table)?;

        for field in &table.fields {
            if let (false, Some(default)) = (record.contains_key(&field.name), &field.default) {
                record.insert(field.name.clone(), default.clone());
            }
        }

        for desc in &batch.ids_info {
            let current = record.get(&desc.name).filter(|v| !v.is_null());
            match current.and_then(Value::as_i64) {
                Some(n) => table.next_id = table.next_id.max(n),
                None if current.is_none() && desc.auto_increment => {
                    table.next_id += 1;
                    record.insert(desc.name.clone(), Value::from(table.next_id));
                }
                None => {}
            }
        }

        let id = identifier_of(&record, &batch.ids_info)?;
        if table.position(&id, &batch.ids_info).is_some() {
            return Err(ResourceError::bad_request(format!(
                "Duplicate entry '{}' for key of table '{}'.",
                id, table.name
            )));
        }

        table.rows.push(record.clone());
        drop(tables);

        debug!(table = %batch.table, id = %id, "record inserted");
        batch.track_rollback(id, None);
        Ok(Value::Object(record))
    }

    fn update(&self, batch: &mut BatchContext, item: TransactionItem) -> ResourceResult<Value> {
        let id = item
            .id
            .ok_or_else(|| ResourceError::driver("Update requires a record identifier."))?;
        let changes = item.record.unwrap_or_default();

        let mut tables = self.write()?;
        let table = table_mut(&mut tables, &batch.table)?;
        let pos = table
            .visible_position(&id, batch)
            .ok_or_else(|| record_not_found(&id))?;

        let previous = table.rows[pos].clone();
        let updated = match batch.action {
            Action::Patch => {
                let mut row = previous.clone();
                row.extend(changes);
                row
            }
            _ => replace_row(&table.fields, &batch.ids_info, &previous, changes),
        };
        table.rows[pos] = updated.clone();
        drop(tables);

        debug!(table = %batch.table, id = %id, action = batch.action.as_str(), "record updated");
        batch.track_rollback(id, Some(previous));
        Ok(Value::Object(updated))
    }

    fn remove(&self, batch: &mut BatchContext, item: TransactionItem) -> ResourceResult<Value> {
        let id = item
            .id
            .ok_or_else(|| ResourceError::driver("Delete requires a record identifier."))?;

        let mut tables = self.write()?;
        let table = table_mut(&mut tables, &batch.table)?;
        let pos = table
            .visible_position(&id, batch)
            .ok_or_else(|| record_not_found(&id))?;
        let removed = table.rows.remove(pos);
        drop(tables);

        debug!(table = %batch.table, id = %id, "record deleted");
        batch.track_rollback(id, Some(removed.clone()));
        Ok(Value::Object(removed))
    }

    fn stage_retrieve(
        &self,
        batch: &mut BatchContext,
        item: TransactionItem,
    ) -> ResourceResult<Option<Value>> {
        let id = item
            .id
            .ok_or_else(|| ResourceError::driver("Retrieve requires a record identifier."))?;

        let tables = self.read()?;
        let table = table_ref(&tables, &batch.table)?;
        if table.visible_position(&id, batch).is_none() {
            return Err(record_not_found(&id));
        }
        drop(tables);

        batch.ids.push(id);
        Ok(None)
    }
}

impl TableDriver for MemoryDriver {
    fn correct_table_name(&self, name: &str) -> ResourceResult<String> {
        let tables = self.read()?;
        tables
            .get(&name.trim().to_ascii_lowercase())
            .map(|t| t.name.clone())
            .ok_or_else(|| {
                ResourceError::not_found(format!("Table '{}' does not exist in the database.", name))
            })
    }

    fn get_fields_info(&self, table: &str) -> ResourceResult<Vec<FieldDescriptor>> {
        let tables = self.read()?;
        Ok(table_ref(&tables, table)?.fields.clone())
    }

    fn retrieve_records_by_filter(
        &self,
        table: &str,
        filter: Option<&str>,
        params: &Map<String, Value>,
        options: &RequestOptions,
    ) -> ResourceResult<RecordSet> {
        let condition = match filter {
            Some(f) => Condition::parse(f, params)?,
            None => None,
        };
        let order = match options.order.as_deref() {
            Some(o) => parse_order(o)?,
            None => Vec::new(),
        };

        let tables = self.read()?;
        let table = table_ref(&tables, table)?;
        let access = options.access_filter.as_ref();

        let mut matched: Vec<&Record> = table
            .rows
            .iter()
            .filter(|r| access.map_or(true, |f| f.matches(r)))
            .filter(|r| condition.as_ref().map_or(true, |c| c.matches(r)))
            .collect();
        let total = matched.len();

        if !order.is_empty() {
            matched.sort_by(|a, b| compare_rows(a, b, &order));
        }

        let records = matched
            .into_iter()
            .skip(options.offset.unwrap_or(0))
            .take(options.limit.unwrap_or(usize::MAX))
            .map(|r| Value::Object(r.clone()))
            .collect();

        Ok(RecordSet {
            records,
            total: options.include_count.then_some(total),
        })
    }

    fn add_to_transaction(
        &self,
        batch: &mut BatchContext,
        item: TransactionItem,
    ) -> ResourceResult<Option<Value>> {
        match batch.action {
            Action::Create => self.insert(batch, item).map(Some),
            Action::Update | Action::Patch => self.update(batch, item).map(Some),
            Action::Delete => self.remove(batch, item).map(Some),
            Action::Retrieve => self.stage_retrieve(batch, item),
        }
    }

    fn commit_transaction(&self, batch: &mut BatchContext) -> ResourceResult<Option<Vec<Value>>> {
        if batch.action != Action::Retrieve {
            return Ok(None);
        }

        let ids = std::mem::take(&mut batch.ids);
        let tables = self.read()?;
        let table = table_ref(&tables, &batch.table)?;

        ids.iter()
            .map(|id| {
                table
                    .visible_position(id, batch)
                    .map(|pos| Value::Object(table.rows[pos].clone()))
                    .ok_or_else(|| record_not_found(id))
            })
            .collect::<ResourceResult<Vec<_>>>()
            .map(Some)
    }

    fn rollback_transaction(&self, batch: &mut BatchContext) -> ResourceResult<bool> {
        let mut tables = self.write()?;
        let table = table_mut(&mut tables, &batch.table)?;

        for entry in batch.rollback_records.drain(..).rev() {
            let pos = table.position(&entry.id, &batch.ids_info);
            match (entry.previous, pos) {
                (None, Some(pos)) => {
                    table.rows.remove(pos);
                }
                (Some(previous), Some(pos)) => table.rows[pos] = previous,
                (Some(previous), None) => table.rows.push(previous),
                (None, None) => {}
            }
        }
        Ok(true)
    }

    fn previous_record(
        &self,
        batch: &BatchContext,
        id: &Identifier,
    ) -> ResourceResult<Option<Record>> {
        let tables = self.read()?;
        let table = table_ref(&tables, &batch.table)?;
        Ok(table
            .position(id, &batch.ids_info)
            .map(|pos| table.rows[pos].clone()))
    }
}

fn new_table(name: &str, fields: Vec<FieldDescriptor>) -> MemoryTable {
    MemoryTable {
        name: name.to_string(),
        fields,
        rows: Vec::new(),
        next_id: 0,
    }
}

fn table_ref<'a>(
    tables: &'a BTreeMap<String, MemoryTable>,
    name: &str,
) -> ResourceResult<&'a MemoryTable> {
    tables
        .get(&name.to_ascii_lowercase())
        .ok_or_else(|| ResourceError::not_found(format!("Table '{}' does not exist in the database.", name)))
}

fn table_mut<'a>(
    tables: &'a mut BTreeMap<String, MemoryTable>,
    name: &str,
) -> ResourceResult<&'a mut MemoryTable> {
    tables
        .get_mut(&name.to_ascii_lowercase())
        .ok_or_else(|| ResourceError::not_found(format!("Table '{}' does not exist in the database.", name)))
}

fn lock_poisoned() -> ResourceError {
    ResourceError::driver("Table storage lock poisoned.")
}

fn record_not_found(id: &Identifier) -> ResourceError {
    ResourceError::not_found(format!("Record with identifier '{}' not found.", id))
}

fn identifier_of(record: &Record, ids: &[IdDescriptor]) -> ResourceResult<Identifier> {
    let mut probe = record.clone();
    match resolve_record(&mut probe, ids, false, false)? {
        Resolution::Resolved(id) => Ok(id),
        _ => Err(ResourceError::bad_request(
            "Required id field(s) could not be determined for the new record.",
        )),
    }
}

/// Full replacement keeps the key and fields clients can not rewrite
fn replace_row(
    fields: &[FieldDescriptor],
    ids: &[IdDescriptor],
    previous: &Record,
    changes: Record,
) -> Record {
    let kept = ids.iter().map(|d| d.name.as_str()).chain(
        fields
            .iter()
            .filter(|f| {
                f.read_only
                    || f.create_only
                    || matches!(
                        f.field_type,
                        FieldType::TimestampOnCreate | FieldType::UserIdOnCreate
                    )
            })
            .map(|f| f.name.as_str()),
    );

    let mut row = Record::new();
    for name in kept {
        if let Some(v) = previous.get(name) {
            row.insert(name.to_string(), v.clone());
        }
    }
    row.extend(changes);
    row
}

#[derive(Debug, Clone, PartialEq)]
struct OrderTerm {
    field: String,
    ascending: bool,
}

/// Comma-separated `field [asc|desc]` or `field.desc` terms
fn parse_order(order: &str) -> ResourceResult<Vec<OrderTerm>> {
    order
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|term| {
            let mut words = term.split_whitespace();
            let first = words.next().unwrap_or_default();
            let (field, direction) = match words.next() {
                Some(direction) => (first, Some(direction)),
                None => match first.rsplit_once('.') {
                    Some((field, direction))
                        if matches!(direction.to_ascii_lowercase().as_str(), "asc" | "desc") =>
                    {
                        (field, Some(direction))
                    }
                    _ => (first, None),
                },
            };

            let ascending = match direction.map(str::to_ascii_lowercase).as_deref() {
                None | Some("asc") => true,
                Some("desc") => false,
                Some(other) => {
                    return Err(ResourceError::bad_request(format!(
                        "Invalid order direction: {}",
                        other
                    )))
                }
            };

            Ok(OrderTerm {
                field: field.to_string(),
                ascending,
            })
        })
        .collect()
}

fn compare_rows(a: &Record, b: &Record, order: &[OrderTerm]) -> Ordering {
    for term in order {
        let cmp = compare_values(a.get(&term.field), b.get(&term.field));
        let cmp = if term.ascending { cmp } else { cmp.reverse() };
        if cmp != Ordering::Equal {
            return cmp;
        }
    }
    Ordering::Equal
}

/// Nulls sort first, then numbers, then everything else as text
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => match (as_number(a), as_number(b)) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => match (a, b) {
                (Value::String(x), Value::String(y)) => x.cmp(y),
                _ => a.to_string().cmp(&b.to_string()),
            },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::batch::BatchMode;
    use crate::table::context::Principal;
    use serde_json::json;

    fn driver() -> MemoryDriver {
        MemoryDriver::new().with_table(
            "Todo",
            vec![
                FieldDescriptor::id("id"),
                FieldDescriptor::new("name", FieldType::String),
                FieldDescriptor::new("done", FieldType::Boolean).with_default(json!(false)),
            ],
        )
    }

    fn batch(action: Action, rollback: bool) -> BatchContext {
        let mode = BatchMode {
            rollback,
            ..Default::default()
        };
        let mut id = IdDescriptor::new("id", FieldType::Id);
        id.auto_increment = true;
        BatchContext::new("Todo", action, mode, RequestOptions::new(), Principal::anonymous())
            .with_schema(Vec::new(), vec![id])
    }

    fn record(v: Value) -> Record {
        serde_json::from_value(v).unwrap()
    }

    fn create(d: &MemoryDriver, name: &str) -> Value {
        let mut b = batch(Action::Create, false);
        let item = TransactionItem {
            index: 0,
            record: Some(record(json!({ "name": name }))),
            id: None,
        };
        d.add_to_transaction(&mut b, item).unwrap().unwrap()
    }

    #[test]
    fn test_table_name_lookup() {
        let d = driver();
        assert_eq!(d.correct_table_name("todo").unwrap(), "Todo");
        assert!(matches!(
            d.correct_table_name("nope"),
            Err(ResourceError::NotFound(_))
        ));
    }

    #[test]
    fn test_insert_assigns_ids_and_defaults() {
        let d = driver();
        assert_eq!(create(&d, "a"), json!({"name": "a", "done": false, "id": 1}));
        assert_eq!(create(&d, "b")["id"], json!(2));
    }

    #[test]
    fn test_duplicate_key() {
        let d = driver();
        create(&d, "a");
        let mut b = batch(Action::Create, false);
        let item = TransactionItem {
            index: 0,
            record: Some(record(json!({"id": 1, "name": "dup"}))),
            id: Some(Identifier::Scalar(json!(1))),
        };
        assert!(d.add_to_transaction(&mut b, item).is_err());
    }

    #[test]
    fn test_patch_merges_and_update_replaces() {
        let d = driver();
        create(&d, "a");

        let mut b = batch(Action::Patch, false);
        let item = TransactionItem {
            index: 0,
            record: Some(record(json!({"done": true}))),
            id: Some(Identifier::Scalar(json!(1))),
        };
        let out = d.add_to_transaction(&mut b, item).unwrap().unwrap();
        assert_eq!(out, json!({"id": 1, "name": "a", "done": true}));

        let mut b = batch(Action::Update, false);
        let item = TransactionItem {
            index: 0,
            record: Some(record(json!({"name": "z"}))),
            id: Some(Identifier::Scalar(json!(1))),
        };
        let out = d.add_to_transaction(&mut b, item).unwrap().unwrap();
        assert_eq!(out, json!({"id": 1, "name": "z"}));
    }

    #[test]
    fn test_rollback_restores_state() {
        let d = driver();
        create(&d, "a");

        let mut b = batch(Action::Delete, true);
        let item = TransactionItem {
            index: 0,
            record: None,
            id: Some(Identifier::Scalar(json!(1))),
        };
        d.add_to_transaction(&mut b, item).unwrap();
        assert!(d.rows("todo").is_empty());

        d.rollback_transaction(&mut b).unwrap();
        assert_eq!(d.rows("todo").len(), 1);
        assert!(b.rollback_records.is_empty());
    }

    #[test]
    fn test_retrieve_is_deferred_to_commit() {
        let d = driver();
        create(&d, "a");

        let mut b = batch(Action::Retrieve, false);
        let item = TransactionItem {
            index: 0,
            record: None,
            id: Some(Identifier::Scalar(json!(1))),
        };
        assert_eq!(d.add_to_transaction(&mut b, item).unwrap(), None);
        let out = d.commit_transaction(&mut b).unwrap().unwrap();
        assert_eq!(out[0]["name"], json!("a"));

        let missing = TransactionItem {
            index: 0,
            record: None,
            id: Some(Identifier::Scalar(json!(9))),
        };
        assert!(matches!(
            d.add_to_transaction(&mut b, missing),
            Err(ResourceError::NotFound(_))
        ));
    }

    #[test]
    fn test_filter_order_and_paging() {
        let d = driver();
        for name in ["b", "c", "a"] {
            create(&d, name);
        }

        let mut options = RequestOptions::new();
        options.order = Some("name desc".to_string());
        options.limit = Some(2);
        options.include_count = true;
        let set = d
            .retrieve_records_by_filter("todo", Some("id > 0"), &Map::new(), &options)
            .unwrap();
        let names: Vec<_> = set.records.iter().map(|r| r["name"].clone()).collect();
        assert_eq!(names, vec![json!("c"), json!("b")]);
        assert_eq!(set.total, Some(3));
    }

    #[test]
    fn test_order_syntax() {
        let terms = parse_order("name.desc, id").unwrap();
        assert_eq!(terms[0].field, "name");
        assert!(!terms[0].ascending);
        assert!(terms[1].ascending);
        assert!(parse_order("name sideways").is_err());
    }
}
