//! Filter Delegation Tests
//!
//! Filter-scoped update, patch and delete run as "retrieve matching ids,
//! then operate by ids":
//! - The driver sees the filter exactly once, before any staging
//! - An empty match returns an empty result without staging
//! - The caller's access filter scopes the match
//! - Template identifier fields never override matched identifiers

mod support;

use serde_json::{json, Map, Value};
use support::{todo_driver, todo_resource, RecordingDriver};
use tablegate::table::{
    AccessFilter, FieldFilter, FilterOperator, RequestContext, RequestOptions, ResourceError,
    RulePolicy, TableResource, TableRule,
};

// =============================================================================
// Helper Functions
// =============================================================================

fn seed(res: &TableResource<RecordingDriver>, ctx: &RequestContext, names: &[&str]) {
    let records = names.iter().map(|n| json!({"name": n})).collect();
    res.create_records(ctx, "todo", records, RequestOptions::new())
        .unwrap();
    res.driver().clear();
}

fn owner_scoped() -> TableResource<RecordingDriver> {
    let filter = AccessFilter::all(vec![FieldFilter::new(
        "owner",
        FilterOperator::Eq,
        json!("{user.id}"),
    )]);
    TableResource::new(todo_driver()).with_policy(
        RulePolicy::new().with_rule("todo", TableRule::default().with_filter(filter)),
    )
}

fn names(res: &TableResource<RecordingDriver>) -> Vec<Value> {
    res.driver()
        .inner()
        .rows("todo")
        .into_iter()
        .map(|r| r["name"].clone())
        .collect()
}

// =============================================================================
// Delegation Order
// =============================================================================

/// The filter is resolved to ids before anything is staged.
#[test]
fn test_update_by_filter_retrieves_then_stages() {
    let res = todo_resource();
    let ctx = RequestContext::anonymous();
    seed(&res, &ctx, &["a", "b", "c"]);

    let out = res
        .patch_records_by_filter(
            &ctx,
            "todo",
            json!({"done": true}),
            "name != 'b'",
            &Map::new(),
            RequestOptions::new(),
        )
        .unwrap();
    assert_eq!(out.records, vec![json!({"id": 1}), json!({"id": 3})]);

    let calls = res.driver().calls();
    let retrieve = calls.iter().position(|c| c == "retrieve:name != 'b'").unwrap();
    let first_stage = calls
        .iter()
        .position(|c| c.starts_with("add_to_transaction:"))
        .unwrap();
    assert!(retrieve < first_stage);
    assert_eq!(res.driver().count("retrieve:"), 1);
    assert_eq!(res.driver().count("add_to_transaction:"), 2);

    let rows = res.driver().inner().rows("todo");
    assert_eq!(rows[0]["done"], json!(true));
    assert_eq!(rows[1]["done"], json!(false));
    assert_eq!(rows[2]["done"], json!(true));
}

/// Parameters are bound by the driver when the filter is resolved.
#[test]
fn test_delete_by_filter_with_params() {
    let res = todo_resource();
    let ctx = RequestContext::anonymous();
    seed(&res, &ctx, &["keep", "drop", "drop"]);

    let mut params = Map::new();
    params.insert("name".to_string(), json!("drop"));
    let out = res
        .delete_records_by_filter(&ctx, "todo", "name = :name", &params, RequestOptions::new())
        .unwrap();

    assert_eq!(out.records, vec![json!({"id": 2}), json!({"id": 3})]);
    assert_eq!(names(&res), vec![json!("keep")]);
}

/// A filter matching nothing stages nothing and commits nothing.
#[test]
fn test_empty_match_returns_empty_result() {
    let res = todo_resource();
    let ctx = RequestContext::anonymous();
    seed(&res, &ctx, &["a"]);

    let out = res
        .update_records_by_filter(
            &ctx,
            "todo",
            json!({"name": "z"}),
            "name = 'nobody'",
            &Map::new(),
            RequestOptions::new(),
        )
        .unwrap();

    assert!(out.records.is_empty());
    assert!(out.errors.is_empty());
    assert_eq!(res.driver().count("add_to_transaction:"), 0);
    assert_eq!(res.driver().count("commit_transaction"), 0);
}

/// Conflicting batch flags fail before the filter reaches the driver.
#[test]
fn test_flag_conflict_checked_before_retrieval() {
    let res = todo_resource();
    let ctx = RequestContext::anonymous();
    seed(&res, &ctx, &["a"]);

    let err = res
        .delete_records_by_filter(
            &ctx,
            "todo",
            "name = 'a'",
            &Map::new(),
            RequestOptions::new().with_rollback().with_continue(),
        )
        .unwrap_err();

    assert!(matches!(err, ResourceError::BadRequest(_)));
    assert!(res.driver().calls().is_empty());
}

/// A malformed filter is the driver's request error.
#[test]
fn test_malformed_filter_is_rejected() {
    let res = todo_resource();
    let err = res
        .delete_records_by_filter(
            &RequestContext::anonymous(),
            "todo",
            "name = ",
            &Map::new(),
            RequestOptions::new(),
        )
        .unwrap_err();
    assert!(matches!(err, ResourceError::BadRequest(_)));
}

// =============================================================================
// Identifier Handling
// =============================================================================

/// Identifier fields in the template are stripped; matched ids win.
#[test]
fn test_template_ids_are_ignored() {
    let res = todo_resource();
    let ctx = RequestContext::anonymous();
    seed(&res, &ctx, &["a", "b"]);

    res.patch_records_by_filter(
        &ctx,
        "todo",
        json!({"id": 99, "name": "renamed"}),
        "name = 'b'",
        &Map::new(),
        RequestOptions::new(),
    )
    .unwrap();

    let rows = res.driver().inner().rows("todo");
    assert_eq!(rows[1]["id"], json!(2));
    assert_eq!(rows[1]["name"], json!("renamed"));
}

// =============================================================================
// Access Filter Scoping
// =============================================================================

/// Only records visible to the principal are matched and changed.
#[test]
fn test_access_filter_scopes_filter_match() {
    let res = owner_scoped();
    let alice = RequestContext::user(1);
    let bob = RequestContext::user(2);
    seed(&res, &alice, &["a1", "a2"]);
    seed(&res, &bob, &["b1"]);

    let out = res
        .patch_records_by_filter(
            &alice,
            "todo",
            json!({"done": true}),
            "done = false",
            &Map::new(),
            RequestOptions::new(),
        )
        .unwrap();
    assert_eq!(out.records, vec![json!({"id": 1}), json!({"id": 2})]);

    let rows = res.driver().inner().rows("todo");
    assert_eq!(rows[2]["owner"], json!(2));
    assert_eq!(rows[2]["done"], json!(false));
}

/// Deleting another principal's record by id is denied.
#[test]
fn test_access_filter_denies_foreign_delete() {
    let res = owner_scoped();
    let alice = RequestContext::user(1);
    let bob = RequestContext::user(2);
    seed(&res, &alice, &["a1"]);

    let err = res
        .delete_record_by_id(&bob, "todo", json!(1), RequestOptions::new())
        .unwrap_err();
    assert!(matches!(err, ResourceError::Forbidden(_)));
    assert_eq!(names(&res), vec![json!("a1")]);
}

/// Filter retrieval never returns records outside the access filter.
#[test]
fn test_access_filter_scopes_retrieval() {
    let res = owner_scoped();
    let alice = RequestContext::user(1);
    let bob = RequestContext::user(2);
    seed(&res, &alice, &["a1", "a2"]);
    seed(&res, &bob, &["b1"]);

    let out = res
        .retrieve_records_by_filter(
            &bob,
            "todo",
            None,
            &Map::new(),
            RequestOptions::new().with_fields("name"),
        )
        .unwrap();
    assert_eq!(out.records, vec![json!({"id": 3, "name": "b1"})]);
}
