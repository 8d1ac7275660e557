//! Edge case tests for duffel-store
//!
//! These tests cover boundary conditions and unusual inputs.

use duffel_store::{
    BatchOperation, ColumnDef, ColumnType, Comparison, DocumentStore, RawRecord, Schema,
    SerializedQuery, SortDirection, TableSchema,
};
use proptest::prelude::*;
use serde_json::json;

fn test_schema() -> Schema {
    Schema::new(1).with_table(TableSchema::new(
        "items",
        vec![
            ColumnDef::required("name", ColumnType::String),
            ColumnDef::optional("count", ColumnType::Int),
            ColumnDef::optional("data", ColumnType::Json),
        ],
    ))
}

fn record(value: serde_json::Value) -> RawRecord {
    RawRecord::from_value(value).unwrap()
}

// ============================================================================
// String Edge Cases
// ============================================================================

#[test]
fn empty_string_fields() {
    let mut store = DocumentStore::new(test_schema());

    store
        .batch(&[BatchOperation::create(
            "items",
            "item1",
            record(json!({"name": ""})),
        )])
        .unwrap();

    let found = store.find("items", "item1").unwrap().unwrap();
    assert_eq!(found.get("name"), Some(&json!("")));
}

#[test]
fn unicode_strings() {
    let mut store = DocumentStore::new(test_schema());

    let unicode_names = vec![
        "日本語テスト",      // Japanese
        "Привет мир",        // Russian
        "مرحبا بالعالم",     // Arabic
        "🎉🚀💯",            // Emoji
        "Ω≈ç√∫",             // Math symbols
        "Hello\nWorld\tTab", // Whitespace
        "Null\0Test",        // Embedded null
    ];

    for (i, name) in unicode_names.iter().enumerate() {
        let id = format!("item_{}", i);
        store
            .batch(&[BatchOperation::create(
                "items",
                id.clone(),
                record(json!({"name": name})),
            )])
            .unwrap();

        let found = store.find("items", &id).unwrap().unwrap();
        assert_eq!(found.get("name"), Some(&json!(name)));
    }
}

#[test]
fn very_long_strings() {
    let mut store = DocumentStore::new(test_schema());

    // 1MB string
    let long_string = "x".repeat(1024 * 1024);

    store
        .batch(&[BatchOperation::create(
            "items",
            "item1",
            record(json!({"name": long_string.clone()})),
        )])
        .unwrap();

    let found = store.find("items", "item1").unwrap().unwrap();
    assert_eq!(
        found.get("name").and_then(|v| v.as_str()).unwrap().len(),
        1024 * 1024
    );
}

// ============================================================================
// Numeric Edge Cases
// ============================================================================

#[test]
fn integer_boundaries() {
    let mut store = DocumentStore::new(test_schema());

    let values = vec![i64::MIN, i64::MAX, 0i64, -1i64, 1i64];

    for (i, value) in values.iter().enumerate() {
        let id = format!("item_{}", i);
        store
            .batch(&[BatchOperation::create(
                "items",
                id.clone(),
                record(json!({"name": "n", "count": value})),
            )])
            .unwrap();

        let found = store.find("items", &id).unwrap().unwrap();
        assert_eq!(found.get("count"), Some(&json!(value)));
    }
}

#[test]
fn comparison_across_number_representations() {
    let mut store = DocumentStore::new(test_schema());
    store
        .batch(&[BatchOperation::create(
            "items",
            "item1",
            record(json!({"name": "n", "count": 5})),
        )])
        .unwrap();

    // 5 matches >= 4.5 even though one side is a float
    let q = SerializedQuery::new("items").and_where("count", Comparison::Gte(json!(4.5)));
    assert_eq!(store.count(&q).unwrap(), 1);
}

// ============================================================================
// Nested Data
// ============================================================================

#[test]
fn deeply_nested_json_payloads() {
    let mut store = DocumentStore::new(test_schema());

    let nested = json!({
        "name": "n",
        "data": {"a": {"b": {"c": {"d": [1, 2, {"e": "deep"}]}}}}
    });
    store
        .batch(&[BatchOperation::create("items", "item1", record(nested.clone()))])
        .unwrap();

    let found = store.find("items", "item1").unwrap().unwrap();
    assert_eq!(found.get("data"), nested.get("data"));
}

// ============================================================================
// Query Edge Cases
// ============================================================================

#[test]
fn query_on_empty_table() {
    let store = DocumentStore::new(test_schema());
    let q = SerializedQuery::new("items");

    assert!(store.query(&q).unwrap().is_empty());
    assert_eq!(store.count(&q).unwrap(), 0);
    assert!(store.query_ids(&q).unwrap().is_empty());
}

#[test]
fn limit_zero_and_oversized() {
    let mut store = DocumentStore::new(test_schema());
    store
        .batch(&[BatchOperation::create(
            "items",
            "item1",
            record(json!({"name": "n"})),
        )])
        .unwrap();

    let q = SerializedQuery::new("items").limit(0);
    assert!(store.query(&q).unwrap().is_empty());

    let q = SerializedQuery::new("items").limit(1000);
    assert_eq!(store.query(&q).unwrap().len(), 1);
}

#[test]
fn sort_with_missing_fields() {
    let mut store = DocumentStore::new(test_schema());
    store
        .batch(&[
            BatchOperation::create("items", "a", record(json!({"name": "a", "count": 2}))),
            BatchOperation::create("items", "b", record(json!({"name": "b"}))),
        ])
        .unwrap();

    // A record missing the sort field still comes back
    let q = SerializedQuery::new("items").sort_by("count", SortDirection::Asc);
    assert_eq!(store.query(&q).unwrap().len(), 2);
}

// ============================================================================
// Batch Atomicity (property)
// ============================================================================

fn arb_operation() -> impl Strategy<Value = BatchOperation> {
    let ids = prop::sample::select(vec!["a", "b", "c", "d"]);
    let kinds = 0..3u8;
    (ids, kinds, any::<u8>()).prop_map(|(id, kind, n)| match kind {
        0 => BatchOperation::create("items", id, record(json!({"name": "n", "count": n}))),
        1 => BatchOperation::update("items", id, record(json!({"name": "n", "count": n}))),
        _ => BatchOperation::destroy_permanently("items", id),
    })
}

proptest! {
    // A failed batch must leave the store byte-identical to its prior state;
    // a successful batch must apply every operation.
    #[test]
    fn batch_is_all_or_nothing(ops in prop::collection::vec(arb_operation(), 1..12)) {
        let mut store = DocumentStore::new(test_schema());
        store
            .batch(&[BatchOperation::create(
                "items",
                "a",
                record(json!({"name": "seed", "count": 0})),
            )])
            .unwrap();

        let before = store.clone();
        let result = store.batch(&ops);

        if result.is_err() {
            prop_assert_eq!(store, before);
        } else {
            // Replaying the ops one-by-one from the prior state must agree.
            let mut replay = before;
            for op in &ops {
                replay.batch(std::slice::from_ref(op)).unwrap();
            }
            prop_assert_eq!(store, replay);
        }
    }
}
