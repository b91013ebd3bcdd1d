use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use crate::dispatcher::{ChangeFeedDispatcher, DispatcherConfig};
use crate::payload::{Payload, RowImage};
use crate::subscriber::Subscriber;

pub const TEST_TABLE: &str = "products";

pub fn new_dispatcher(buffer_capacity: usize) -> ChangeFeedDispatcher {
    ChangeFeedDispatcher::new(DispatcherConfig {
        buffer_capacity,
        ..Default::default()
    })
    .expect("valid dispatcher config")
}

pub fn new_subscriber(id: &str, poll_timeout: Duration) -> Arc<Subscriber> {
    Arc::new(
        Subscriber::new(id, poll_timeout)
            .expect("non-zero poll timeout")
            .with_table_name(TEST_TABLE),
    )
}

pub fn row(value: Value) -> RowImage {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

pub fn insert_payload(key: i64) -> Payload {
    Payload::insert(
        vec![json!(key)],
        row(json!({"id": key, "name": format!("name{key}")})),
    )
}

pub fn update_payload(key: i64) -> Payload {
    Payload::new(
        vec![json!(key)],
        row(json!({"id": key, "name": format!("name{key}")})),
        row(json!({"id": key, "name": format!("renamed{key}")})),
    )
}

pub fn delete_payload(key: i64) -> Payload {
    Payload::delete(vec![json!(key)], row(json!({"id": key})))
}
