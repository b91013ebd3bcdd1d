use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::{json, Value};

pub const TEST_TABLE: &str = "t";
const DATABASE_URL_ENV: &str = "ROACH_CDC_DATABASE_URL";
static UNIQUE_COUNTER: AtomicUsize = AtomicUsize::new(0);

pub fn now() -> chrono::Duration {
    chrono::Duration::milliseconds(chrono::Local::now().timestamp_millis())
}

pub fn unique_name() -> String {
    let cnt = UNIQUE_COUNTER.fetch_add(1, Ordering::SeqCst);
    let name = format!("test_rust_{}_{}", now().num_seconds(), cnt);
    println!("unique_name: {name}");
    name
}

/// Body of a resolved timestamp delivery.
pub fn resolved_body(wall_time_seconds: i64, logical: u32) -> String {
    json!({ "resolved": format!("{wall_time_seconds}.000000000,{logical}") }).to_string()
}

/// Body of a payload delivery carrying one upserted row per `(pk, v)` pair.
pub fn upsert_body(rows: &[(i64, &str)]) -> String {
    let payload: Vec<Value> = rows
        .iter()
        .map(|(pk, v)| {
            json!({
                "key": [pk],
                "after": { "pk": pk, "v": v },
                "topic": TEST_TABLE,
            })
        })
        .collect();
    json!({ "payload": payload, "length": rows.len() }).to_string()
}

/// Body of a payload delivery deleting the rows with the given keys.
pub fn delete_body(pks: &[i64]) -> String {
    let payload: Vec<Value> = pks
        .iter()
        .map(|pk| {
            json!({
                "key": [pk],
                "after": null,
                "before": { "pk": pk },
                "topic": TEST_TABLE,
            })
        })
        .collect();
    json!({ "payload": payload, "length": pks.len() }).to_string()
}

pub fn get_create_table_query(table: &str) -> String {
    format!("CREATE TABLE IF NOT EXISTS {table} (pk INT PRIMARY KEY, v STRING)")
}

/// Connection string of the database used by integration tests, if configured.
pub fn get_database_url() -> Option<String> {
    std::env::var(DATABASE_URL_ENV).ok()
}

/// Returns the database URL, or returns from the calling test when no
/// database is configured.
#[macro_export]
macro_rules! database_url_or_skip {
    () => {
        match $crate::get_database_url() {
            Some(url) => url,
            None => {
                eprintln!("Skipping test: ROACH_CDC_DATABASE_URL is not set");
                return;
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_names_differ() {
        assert_ne!(unique_name(), unique_name());
    }

    #[test]
    fn test_bodies() {
        let body: Value = serde_json::from_str(&upsert_body(&[(1, "a"), (2, "b")])).unwrap();
        assert_eq!(body["length"], json!(2));
        assert_eq!(body["payload"][1]["after"]["v"], json!("b"));

        let body: Value = serde_json::from_str(&resolved_body(1634000000, 3)).unwrap();
        assert_eq!(body["resolved"], json!("1634000000.000000000,3"));
    }
}
