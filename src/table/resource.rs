//! # Table Resource
//!
//! The generic pipeline in front of a `TableDriver`: permission check,
//! batch orchestration for create/update/patch/delete/retrieve, filter
//! scoped operations and per-verb dispatch.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::{debug, info};

use super::access::ACCESS_DENIED;
use super::batch::{self, Action, BatchContext, BatchMode, BatchOutcome, TransactionItem};
use super::context::RequestContext;
use super::driver::TableDriver;
use super::errors::{ResourceError, ResourceResult};
use super::fields::FieldDescriptor;
use super::ids::{
    id_field_names, parse_id_list, records_as_ids, remove_ids, resolve, resolve_record,
    resolve_value, scalar_string, IdDescriptor, Identifier, Resolution,
};
use super::options::{NormalizedRequest, RequestOptions, Verb};
use super::policy::{AccessPolicy, OpenPolicy};
use super::shaper::{clean_records, shape, FieldSelection, Meta, OperationResult};
use super::validator::{parse_record, ValidationContext};
use super::{Record, DEFAULT_RECORD_KEY};

const NO_RECORDS: &str = "No record(s) detected in request.";
const NO_IDS: &str = "No record ids detected in request.";

/// Resource-wide settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSettings {
    /// Envelope key for records in requests and responses
    pub record_key: String,
    /// Cap applied to every filter retrieval
    pub max_records_returned: usize,
}

impl Default for ResourceSettings {
    fn default() -> Self {
        Self {
            record_key: DEFAULT_RECORD_KEY.to_string(),
            max_records_returned: 1000,
        }
    }
}

/// REST table resource over one driver
pub struct TableResource<D: TableDriver> {
    driver: Arc<D>,
    policy: Arc<dyn AccessPolicy>,
    settings: ResourceSettings,
}

impl<D: TableDriver> TableResource<D> {
    pub fn new(driver: D) -> Self {
        Self::from_arc(Arc::new(driver))
    }

    pub fn from_arc(driver: Arc<D>) -> Self {
        Self {
            driver,
            policy: Arc::new(OpenPolicy),
            settings: ResourceSettings::default(),
        }
    }

    pub fn with_policy(mut self, policy: impl AccessPolicy + 'static) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    pub fn with_settings(mut self, settings: ResourceSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn settings(&self) -> &ResourceSettings {
        &self.settings
    }

    // ==================
    // Dispatch
    // ==================

    /// Run a normalized request and shape the response body
    pub fn handle(
        &self,
        ctx: &RequestContext,
        table: &str,
        request: NormalizedRequest,
    ) -> ResourceResult<Value> {
        let single = request.wants_single();
        let as_list = request.options.as_list;
        info!(
            request_id = %ctx.request_id,
            table,
            verb = %request.verb,
            records = request.records.len(),
            "handling table request"
        );

        let result = match request.verb {
            Verb::Get => self.handle_get(ctx, table, request)?,
            Verb::Post => self.handle_post(ctx, table, request)?,
            Verb::Put => self.handle_update(ctx, table, request, Action::Update)?,
            Verb::Patch => self.handle_update(ctx, table, request, Action::Patch)?,
            Verb::Delete => self.handle_delete(ctx, table, request)?,
        };

        Ok(shape(result, single, as_list, &self.settings.record_key))
    }

    fn handle_get(
        &self,
        ctx: &RequestContext,
        table: &str,
        request: NormalizedRequest,
    ) -> ResourceResult<OperationResult> {
        let NormalizedRequest {
            resource_id,
            mut options,
            records,
            ..
        } = request;

        if let Some(id) = resource_id {
            return self.retrieve_record_by_id(ctx, table, Value::String(id), options);
        }
        if let Some(ids) = options.ids.take() {
            return self.retrieve_records_by_ids(ctx, table, parse_id_list(&ids), options);
        }
        if !records.is_empty() {
            return self.retrieve_records(ctx, table, records, options);
        }

        let filter = options.filter.take();
        let params = std::mem::take(&mut options.params);
        self.retrieve_records_by_filter(ctx, table, filter.as_deref(), &params, options)
    }

    fn handle_post(
        &self,
        ctx: &RequestContext,
        table: &str,
        request: NormalizedRequest,
    ) -> ResourceResult<OperationResult> {
        if request.resource_id.is_some() {
            return Err(ResourceError::bad_request(
                "Create record by identifier not currently supported.",
            ));
        }
        self.create_records(ctx, table, request.records, request.options)
    }

    fn handle_update(
        &self,
        ctx: &RequestContext,
        table: &str,
        request: NormalizedRequest,
        action: Action,
    ) -> ResourceResult<OperationResult> {
        let NormalizedRequest {
            resource_id,
            mut options,
            records,
            ..
        } = request;

        if let Some(id) = resource_id {
            let record = first_record(records)?;
            return self.mutate_by_ids(ctx, table, record, vec![Value::String(id)], options, action);
        }
        if let Some(ids) = options.ids.take() {
            let record = first_record(records)?;
            return self.mutate_by_ids(ctx, table, record, parse_id_list(&ids), options, action);
        }
        if let Some(filter) = options.filter.take() {
            let record = first_record(records)?;
            let params = std::mem::take(&mut options.params);
            return self.mutate_by_filter(ctx, table, record, &filter, &params, options, action);
        }
        self.mutate_records(ctx, table, records, options, action)
    }

    fn handle_delete(
        &self,
        ctx: &RequestContext,
        table: &str,
        request: NormalizedRequest,
    ) -> ResourceResult<OperationResult> {
        let NormalizedRequest {
            resource_id,
            mut options,
            records,
            ..
        } = request;

        if let Some(id) = resource_id {
            return self.delete_record_by_id(ctx, table, Value::String(id), options);
        }
        if let Some(ids) = options.ids.take() {
            return self.delete_records_by_ids(ctx, table, parse_id_list(&ids), options);
        }
        if let Some(filter) = options.filter.take() {
            let params = std::mem::take(&mut options.params);
            return self.delete_records_by_filter(ctx, table, &filter, &params, options);
        }
        if !records.is_empty() {
            return self.delete_records(ctx, table, records, options);
        }
        if options.force {
            return self.truncate_table(ctx, table, options);
        }
        Err(ResourceError::bad_request(
            "No filter or records given for delete request. Use 'force' to delete all records.",
        ))
    }

    // ==================
    // Create
    // ==================

    pub fn create_record(
        &self,
        ctx: &RequestContext,
        table: &str,
        record: Value,
        options: RequestOptions,
    ) -> ResourceResult<OperationResult> {
        self.create_records(ctx, table, vec![record], options)
    }

    pub fn create_records(
        &self,
        ctx: &RequestContext,
        table: &str,
        records: Vec<Value>,
        mut options: RequestOptions,
    ) -> ResourceResult<OperationResult> {
        if records.is_empty() {
            return Err(ResourceError::bad_request(NO_RECORDS));
        }
        let mode = BatchMode::resolve(&options, records.len())?;
        let table = self.prepare(ctx, table, Verb::Post, &mut options)?;
        let mut batch = self.begin(ctx, &table, Action::Create, mode, options)?;
        let vctx = ValidationContext::new(&ctx.principal);

        let outcome = batch::run(
            self.driver.as_ref(),
            &mut batch,
            records,
            |driver, batch, index, item| {
                let mut record = into_record(item, index)?;
                let id = match resolve_record(&mut record, &batch.ids_info, true, false)? {
                    Resolution::Resolved(id) => Some(id),
                    Resolution::Pending => None,
                    Resolution::Missing => return Err(missing_id(index)),
                };
                let parsed = parse_record(
                    record,
                    &batch.fields_info,
                    batch.options.access_filter.as_ref(),
                    false,
                    None,
                    &vctx,
                )?;
                driver.add_to_transaction(
                    batch,
                    TransactionItem {
                        index,
                        record: Some(parsed),
                        id,
                    },
                )
            },
        )?;

        Ok(finish(&batch, outcome))
    }

    // ==================
    // Update / Patch
    // ==================

    pub fn update_record_by_id(
        &self,
        ctx: &RequestContext,
        table: &str,
        record: Value,
        id: Value,
        options: RequestOptions,
    ) -> ResourceResult<OperationResult> {
        self.mutate_by_ids(ctx, table, record, vec![id], options, Action::Update)
    }

    pub fn update_records(
        &self,
        ctx: &RequestContext,
        table: &str,
        records: Vec<Value>,
        options: RequestOptions,
    ) -> ResourceResult<OperationResult> {
        self.mutate_records(ctx, table, records, options, Action::Update)
    }

    pub fn update_records_by_ids(
        &self,
        ctx: &RequestContext,
        table: &str,
        record: Value,
        ids: Vec<Value>,
        options: RequestOptions,
    ) -> ResourceResult<OperationResult> {
        self.mutate_by_ids(ctx, table, record, ids, options, Action::Update)
    }

    pub fn update_records_by_filter(
        &self,
        ctx: &RequestContext,
        table: &str,
        record: Value,
        filter: &str,
        params: &Map<String, Value>,
        options: RequestOptions,
    ) -> ResourceResult<OperationResult> {
        self.mutate_by_filter(ctx, table, record, filter, params, options, Action::Update)
    }

    pub fn patch_record_by_id(
        &self,
        ctx: &RequestContext,
        table: &str,
        record: Value,
        id: Value,
        options: RequestOptions,
    ) -> ResourceResult<OperationResult> {
        self.mutate_by_ids(ctx, table, record, vec![id], options, Action::Patch)
    }

    pub fn patch_records(
        &self,
        ctx: &RequestContext,
        table: &str,
        records: Vec<Value>,
        options: RequestOptions,
    ) -> ResourceResult<OperationResult> {
        self.mutate_records(ctx, table, records, options, Action::Patch)
    }

    pub fn patch_records_by_ids(
        &self,
        ctx: &RequestContext,
        table: &str,
        record: Value,
        ids: Vec<Value>,
        options: RequestOptions,
    ) -> ResourceResult<OperationResult> {
        self.mutate_by_ids(ctx, table, record, ids, options, Action::Patch)
    }

    pub fn patch_records_by_filter(
        &self,
        ctx: &RequestContext,
        table: &str,
        record: Value,
        filter: &str,
        params: &Map<String, Value>,
        options: RequestOptions,
    ) -> ResourceResult<OperationResult> {
        self.mutate_by_filter(ctx, table, record, filter, params, options, Action::Patch)
    }

    /// Each record carries its own identifier
    fn mutate_records(
        &self,
        ctx: &RequestContext,
        table: &str,
        records: Vec<Value>,
        mut options: RequestOptions,
        action: Action,
    ) -> ResourceResult<OperationResult> {
        if records.is_empty() {
            return Err(ResourceError::bad_request(NO_RECORDS));
        }
        let mode = BatchMode::resolve(&options, records.len())?;
        let table = self.prepare(ctx, table, verb_for(action), &mut options)?;
        let mut batch = self.begin(ctx, &table, action, mode, options)?;
        let vctx = ValidationContext::new(&ctx.principal);

        let outcome = batch::run(
            self.driver.as_ref(),
            &mut batch,
            records,
            |driver, batch, index, item| {
                let mut record = into_record(item, index)?;
                let id = match resolve_record(&mut record, &batch.ids_info, false, true)? {
                    Resolution::Resolved(id) => id,
                    _ => return Err(missing_id(index)),
                };
                stage_update(driver, batch, index, record, id, &vctx)
            },
        )?;

        Ok(finish(&batch, outcome))
    }

    /// One template record applied to every identifier. Identifier fields in
    /// the template are ignored.
    fn mutate_by_ids(
        &self,
        ctx: &RequestContext,
        table: &str,
        record: Value,
        ids: Vec<Value>,
        mut options: RequestOptions,
        action: Action,
    ) -> ResourceResult<OperationResult> {
        let template = match record {
            Value::Object(map) if !map.is_empty() => map,
            _ => return Err(ResourceError::bad_request(NO_RECORDS)),
        };
        if ids.is_empty() {
            return Err(ResourceError::bad_request(NO_IDS));
        }
        let mode = BatchMode::resolve(&options, ids.len())?;
        let table = self.prepare(ctx, table, verb_for(action), &mut options)?;
        let mut batch = self.begin(ctx, &table, action, mode, options)?;
        let vctx = ValidationContext::new(&ctx.principal);

        let outcome = batch::run(
            self.driver.as_ref(),
            &mut batch,
            ids,
            |driver, batch, index, value| {
                let id = resolve_id_value(&value, &batch.ids_info)?;
                let mut record = template.clone();
                remove_ids(&mut record, &batch.ids_info);
                stage_update(driver, batch, index, record, id, &vctx)
            },
        )?;

        Ok(finish(&batch, outcome))
    }

    #[allow(clippy::too_many_arguments)]
    fn mutate_by_filter(
        &self,
        ctx: &RequestContext,
        table: &str,
        record: Value,
        filter: &str,
        params: &Map<String, Value>,
        options: RequestOptions,
        action: Action,
    ) -> ResourceResult<OperationResult> {
        let (ids, id_fields) =
            self.filter_to_ids(ctx, table, verb_for(action), filter, params, &options)?;
        if ids.is_empty() {
            return Ok(OperationResult::empty(id_fields));
        }
        self.mutate_by_ids(ctx, table, record, ids, options, action)
    }

    // ==================
    // Delete
    // ==================

    pub fn delete_record_by_id(
        &self,
        ctx: &RequestContext,
        table: &str,
        id: Value,
        options: RequestOptions,
    ) -> ResourceResult<OperationResult> {
        self.delete_records_by_ids(ctx, table, vec![id], options)
    }

    pub fn delete_records(
        &self,
        ctx: &RequestContext,
        table: &str,
        records: Vec<Value>,
        mut options: RequestOptions,
    ) -> ResourceResult<OperationResult> {
        if records.is_empty() {
            return Err(ResourceError::bad_request(NO_RECORDS));
        }
        let mode = BatchMode::resolve(&options, records.len())?;
        let table = self.prepare(ctx, table, Verb::Delete, &mut options)?;
        let mut batch = self.begin(ctx, &table, Action::Delete, mode, options)?;

        let outcome = batch::run(
            self.driver.as_ref(),
            &mut batch,
            records,
            |driver, batch, index, mut item| {
                let id = match resolve(&mut item, &batch.ids_info, false, false)? {
                    Resolution::Resolved(id) => id,
                    _ => return Err(missing_id(index)),
                };
                stage_delete(driver, batch, index, id)
            },
        )?;

        Ok(finish(&batch, outcome))
    }

    pub fn delete_records_by_ids(
        &self,
        ctx: &RequestContext,
        table: &str,
        ids: Vec<Value>,
        mut options: RequestOptions,
    ) -> ResourceResult<OperationResult> {
        if ids.is_empty() {
            return Err(ResourceError::bad_request(NO_IDS));
        }
        let mode = BatchMode::resolve(&options, ids.len())?;
        let table = self.prepare(ctx, table, Verb::Delete, &mut options)?;
        let mut batch = self.begin(ctx, &table, Action::Delete, mode, options)?;

        let outcome = batch::run(
            self.driver.as_ref(),
            &mut batch,
            ids,
            |driver, batch, index, value| {
                let id = resolve_id_value(&value, &batch.ids_info)?;
                stage_delete(driver, batch, index, id)
            },
        )?;

        Ok(finish(&batch, outcome))
    }

    pub fn delete_records_by_filter(
        &self,
        ctx: &RequestContext,
        table: &str,
        filter: &str,
        params: &Map<String, Value>,
        options: RequestOptions,
    ) -> ResourceResult<OperationResult> {
        let (ids, id_fields) =
            self.filter_to_ids(ctx, table, Verb::Delete, filter, params, &options)?;
        if ids.is_empty() {
            return Ok(OperationResult::empty(id_fields));
        }
        self.delete_records_by_ids(ctx, table, ids, options)
    }

    /// Delete every visible record. Uses the driver's native truncate when
    /// it has one, otherwise retrieves everything and deletes by record.
    pub fn truncate_table(
        &self,
        ctx: &RequestContext,
        table: &str,
        mut options: RequestOptions,
    ) -> ResourceResult<OperationResult> {
        let table = self.prepare(ctx, table, Verb::Delete, &mut options)?;
        let (_, ids_info) = self.schema(&table, &options)?;
        let id_fields = id_field_names(&ids_info);

        if let Some(records) = self.driver.truncate(&table)? {
            info!(table = %table, removed = records.len(), "table truncated by driver");
            let selection = FieldSelection::parse(options.fields.as_deref());
            return Ok(OperationResult {
                records: clean_records(records, &selection, &id_fields),
                id_fields,
                ..Default::default()
            });
        }

        let mut lookup = options.clone();
        lookup.limit = None;
        lookup.offset = None;
        lookup.include_count = false;
        let found = self
            .driver
            .retrieve_records_by_filter(&table, None, &Map::new(), &lookup)?;
        if found.records.is_empty() {
            return Ok(OperationResult::empty(id_fields));
        }
        self.delete_records(ctx, &table, found.records, options)
    }

    // ==================
    // Retrieve
    // ==================

    pub fn retrieve_record_by_id(
        &self,
        ctx: &RequestContext,
        table: &str,
        id: Value,
        options: RequestOptions,
    ) -> ResourceResult<OperationResult> {
        self.retrieve_records_by_ids(ctx, table, vec![id], options)
    }

    pub fn retrieve_records(
        &self,
        ctx: &RequestContext,
        table: &str,
        records: Vec<Value>,
        mut options: RequestOptions,
    ) -> ResourceResult<OperationResult> {
        if records.is_empty() {
            return Err(ResourceError::bad_request(NO_RECORDS));
        }
        let mode = BatchMode::resolve(&options, records.len())?;
        let table = self.prepare(ctx, table, Verb::Get, &mut options)?;
        let mut batch = self.begin(ctx, &table, Action::Retrieve, mode, options)?;

        let outcome = batch::run(
            self.driver.as_ref(),
            &mut batch,
            records,
            |driver, batch, index, mut item| {
                let id = match resolve(&mut item, &batch.ids_info, false, false)? {
                    Resolution::Resolved(id) => id,
                    _ => return Err(missing_id(index)),
                };
                stage_retrieve(driver, batch, index, id)
            },
        )?;

        Ok(finish(&batch, outcome))
    }

    pub fn retrieve_records_by_ids(
        &self,
        ctx: &RequestContext,
        table: &str,
        ids: Vec<Value>,
        mut options: RequestOptions,
    ) -> ResourceResult<OperationResult> {
        if ids.is_empty() {
            return Err(ResourceError::bad_request(NO_IDS));
        }
        let mode = BatchMode::resolve(&options, ids.len())?;
        let table = self.prepare(ctx, table, Verb::Get, &mut options)?;
        let mut batch = self.begin(ctx, &table, Action::Retrieve, mode, options)?;

        let outcome = batch::run(
            self.driver.as_ref(),
            &mut batch,
            ids,
            |driver, batch, index, value| {
                let id = resolve_id_value(&value, &batch.ids_info)?;
                stage_retrieve(driver, batch, index, id)
            },
        )?;

        Ok(finish(&batch, outcome))
    }

    /// Filter retrieval, capped at `max_records_returned`
    pub fn retrieve_records_by_filter(
        &self,
        ctx: &RequestContext,
        table: &str,
        filter: Option<&str>,
        params: &Map<String, Value>,
        mut options: RequestOptions,
    ) -> ResourceResult<OperationResult> {
        let table = self.prepare(ctx, table, Verb::Get, &mut options)?;
        let (fields, ids_info) = self.schema(&table, &options)?;
        options.limit = Some(self.clamp_limit(options.limit));

        let found = self
            .driver
            .retrieve_records_by_filter(&table, filter, params, &options)?;
        debug!(table = %table, matched = found.records.len(), "filter retrieval finished");

        let mut meta = Meta::default();
        if options.include_count {
            meta.count = Some(found.total.unwrap_or(found.records.len()));
        }
        if options.include_schema {
            meta.schema = Some(schema_value(&table, &fields));
        }

        let id_fields = id_field_names(&ids_info);
        let selection = FieldSelection::parse(options.fields.as_deref());
        Ok(OperationResult {
            records: clean_records(found.records, &selection, &id_fields),
            errors: Vec::new(),
            meta: Some(meta),
            id_fields,
        })
    }

    // ==================
    // Shared steps
    // ==================

    /// Canonical table name, permission check and access filter injection
    fn prepare(
        &self,
        ctx: &RequestContext,
        table: &str,
        verb: Verb,
        options: &mut RequestOptions,
    ) -> ResourceResult<String> {
        let table = self.driver.correct_table_name(table)?;
        self.policy.check(&ctx.principal, &table, verb)?;
        options.access_filter = self
            .policy
            .record_filter(&ctx.principal, &table, verb)
            .map(|f| f.bind(&ctx.principal));
        if options.refresh {
            self.driver.refresh_table_schema(&table)?;
        }
        Ok(table)
    }

    fn schema(
        &self,
        table: &str,
        options: &RequestOptions,
    ) -> ResourceResult<(Vec<FieldDescriptor>, Vec<IdDescriptor>)> {
        let fields = self.driver.get_fields_info(table)?;
        let ids = self.driver.get_ids_info(
            table,
            &fields,
            options.id_field.as_deref(),
            options.id_type.as_deref(),
        )?;
        if ids.is_empty() {
            return Err(ResourceError::configuration(
                "Identifying field(s) could not be determined.",
            ));
        }
        Ok((fields, ids))
    }

    fn begin(
        &self,
        ctx: &RequestContext,
        table: &str,
        action: Action,
        mode: BatchMode,
        options: RequestOptions,
    ) -> ResourceResult<BatchContext> {
        let (fields, ids) = self.schema(table, &options)?;
        Ok(
            BatchContext::new(table, action, mode, options, ctx.principal.clone())
                .with_schema(fields, ids)
                .with_record_key(self.settings.record_key.as_str()),
        )
    }

    /// Identifiers of the records matching `filter`, retrieved with the
    /// caller's verb so its access filter scopes the match
    fn filter_to_ids(
        &self,
        ctx: &RequestContext,
        table: &str,
        verb: Verb,
        filter: &str,
        params: &Map<String, Value>,
        options: &RequestOptions,
    ) -> ResourceResult<(Vec<Value>, Vec<String>)> {
        batch::check_conflict(options)?;

        let mut lookup = options.clone();
        let table = self.prepare(ctx, table, verb, &mut lookup)?;
        let (_, ids_info) = self.schema(&table, &lookup)?;
        lookup.fields = None;
        lookup.include_count = false;
        lookup.include_schema = false;

        let found = self
            .driver
            .retrieve_records_by_filter(&table, Some(filter), params, &lookup)?;
        let ids = records_as_ids(&found.records, &ids_info)?;
        debug!(table = %table, filter, matched = ids.len(), "filter resolved to ids");

        Ok((ids, id_field_names(&ids_info)))
    }

    fn clamp_limit(&self, limit: Option<usize>) -> usize {
        let max = self.settings.max_records_returned;
        match limit {
            Some(l) if l > 0 && l <= max => l,
            _ => max,
        }
    }
}

fn finish(batch: &BatchContext, outcome: BatchOutcome) -> OperationResult {
    let selection = FieldSelection::parse(batch.options.fields.as_deref());
    let id_fields = batch.id_fields();
    OperationResult {
        records: clean_records(outcome.outputs, &selection, &id_fields),
        errors: outcome.errors,
        meta: None,
        id_fields,
    }
}

fn stage_update<D: TableDriver + ?Sized>(
    driver: &D,
    batch: &mut BatchContext,
    index: usize,
    record: Record,
    id: Identifier,
    vctx: &ValidationContext<'_>,
) -> ResourceResult<Option<Value>> {
    let previous = match batch.options.access_filter {
        Some(_) => driver.previous_record(batch, &id)?,
        None => None,
    };
    let parsed = parse_record(
        record,
        &batch.fields_info,
        batch.options.access_filter.as_ref(),
        true,
        previous.as_ref(),
        vctx,
    )?;
    if parsed.is_empty() {
        return Err(ResourceError::bad_request(format!(
            "No valid fields were found in record {}.",
            index
        )));
    }
    driver.add_to_transaction(
        batch,
        TransactionItem {
            index,
            record: Some(parsed),
            id: Some(id),
        },
    )
}

fn stage_delete<D: TableDriver + ?Sized>(
    driver: &D,
    batch: &mut BatchContext,
    index: usize,
    id: Identifier,
) -> ResourceResult<Option<Value>> {
    if let Some(filter) = &batch.options.access_filter {
        if let Some(previous) = driver.previous_record(batch, &id)? {
            if !filter.matches(&previous) {
                return Err(ResourceError::forbidden(ACCESS_DENIED));
            }
        }
    }
    driver.add_to_transaction(
        batch,
        TransactionItem {
            index,
            record: None,
            id: Some(id),
        },
    )
}

fn stage_retrieve<D: TableDriver + ?Sized>(
    driver: &D,
    batch: &mut BatchContext,
    index: usize,
    id: Identifier,
) -> ResourceResult<Option<Value>> {
    driver.add_to_transaction(
        batch,
        TransactionItem {
            index,
            record: None,
            id: Some(id),
        },
    )
}

fn verb_for(action: Action) -> Verb {
    match action {
        Action::Create => Verb::Post,
        Action::Update => Verb::Put,
        Action::Patch => Verb::Patch,
        Action::Delete => Verb::Delete,
        Action::Retrieve => Verb::Get,
    }
}

fn first_record(records: Vec<Value>) -> ResourceResult<Value> {
    records
        .into_iter()
        .next()
        .ok_or_else(|| ResourceError::bad_request(NO_RECORDS))
}

fn into_record(item: Value, index: usize) -> ResourceResult<Record> {
    match item {
        Value::Object(map) => Ok(map),
        _ => Err(ResourceError::bad_request(format!(
            "Record {} is not a valid JSON object.",
            index
        ))),
    }
}

fn resolve_id_value(value: &Value, descriptors: &[IdDescriptor]) -> ResourceResult<Identifier> {
    match resolve_value(value, descriptors)? {
        Resolution::Resolved(id) => Ok(id),
        _ => Err(ResourceError::bad_request(format!(
            "Invalid identifier '{}'.",
            scalar_string(value)
        ))),
    }
}

fn missing_id(index: usize) -> ResourceError {
    ResourceError::bad_request(format!(
        "Required id field(s) not found in record {}.",
        index
    ))
}

fn schema_value(table: &str, fields: &[FieldDescriptor]) -> Value {
    json!({
        "name": table,
        "field": fields,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::memory::MemoryDriver;
    use crate::table::fields::FieldType;
    use crate::table::policy::{RulePolicy, TableRule};
    use serde_json::json;

    fn resource() -> TableResource<MemoryDriver> {
        let driver = MemoryDriver::new().with_table(
            "todo",
            vec![
                FieldDescriptor::id("id"),
                FieldDescriptor::new("name", FieldType::String).required(),
                FieldDescriptor::new("done", FieldType::Boolean),
            ],
        );
        TableResource::new(driver)
    }

    #[test]
    fn test_create_returns_ids_by_default() {
        let res = resource();
        let ctx = RequestContext::anonymous();
        let out = res
            .create_record(&ctx, "todo", json!({"name": "a"}), RequestOptions::new())
            .unwrap();
        assert_eq!(out.records, vec![json!({"id": 1})]);
    }

    #[test]
    fn test_table_name_is_corrected() {
        let res = resource();
        let ctx = RequestContext::anonymous();
        let out = res
            .create_record(
                &ctx,
                "TODO",
                json!({"name": "a"}),
                RequestOptions::new().with_fields("*"),
            )
            .unwrap();
        assert_eq!(out.records[0]["name"], json!("a"));
    }

    #[test]
    fn test_unknown_table() {
        let res = resource();
        let err = res
            .retrieve_records_by_filter(
                &RequestContext::anonymous(),
                "nope",
                None,
                &Map::new(),
                RequestOptions::new(),
            )
            .unwrap_err();
        assert!(matches!(err, ResourceError::NotFound(_)));
    }

    #[test]
    fn test_limit_is_clamped() {
        let res = resource().with_settings(ResourceSettings {
            max_records_returned: 2,
            ..Default::default()
        });
        let ctx = RequestContext::anonymous();
        let records = vec![json!({"name": "a"}), json!({"name": "b"}), json!({"name": "c"})];
        res.create_records(&ctx, "todo", records, RequestOptions::new())
            .unwrap();

        let mut options = RequestOptions::new().with_fields("*");
        options.limit = Some(50);
        options.include_count = true;
        let out = res
            .retrieve_records_by_filter(&ctx, "todo", None, &Map::new(), options)
            .unwrap();
        assert_eq!(out.records.len(), 2);
        assert_eq!(out.meta.and_then(|m| m.count), Some(3));
    }

    #[test]
    fn test_policy_denies_verb() {
        let res = resource()
            .with_policy(RulePolicy::new().with_rule("todo", TableRule::allow(&[Verb::Get])));
        let err = res
            .create_record(
                &RequestContext::anonymous(),
                "todo",
                json!({"name": "a"}),
                RequestOptions::new(),
            )
            .unwrap_err();
        assert!(matches!(err, ResourceError::Forbidden(_)));
    }

    #[test]
    fn test_delete_without_scope_needs_force() {
        let res = resource();
        let ctx = RequestContext::anonymous();
        res.create_records(
            &ctx,
            "todo",
            vec![json!({"name": "a"}), json!({"name": "b"})],
            RequestOptions::new(),
        )
        .unwrap();

        let request = crate::table::options::normalize(
            Verb::Delete,
            None,
            &Default::default(),
            None,
            "record",
        )
        .unwrap();
        assert!(res.handle(&ctx, "todo", request.clone()).is_err());

        let mut forced = request;
        forced.options.force = true;
        let out = res.handle(&ctx, "todo", forced).unwrap();
        assert_eq!(out, json!({"record": [{"id": 1}, {"id": 2}]}));
        assert!(res.driver().rows("todo").is_empty());
    }

    #[test]
    fn test_missing_identifier_config() {
        let driver = MemoryDriver::new().with_table(
            "keyless",
            vec![FieldDescriptor::new("name", FieldType::String)],
        );
        let res = TableResource::new(driver);
        let err = res
            .create_record(
                &RequestContext::anonymous(),
                "keyless",
                json!({"name": "a"}),
                RequestOptions::new(),
            )
            .unwrap_err();
        assert!(err.is_fatal());
    }
}
