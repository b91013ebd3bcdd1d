//! Row mutation events carried by change feed deliveries.
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// A flat column-to-value image of a row.
pub type RowImage = Map<String, Value>;

/// Represents different kinds of row mutations.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Operation::Insert => write!(f, "insert"),
            Operation::Update => write!(f, "update"),
            Operation::Delete => write!(f, "delete"),
        }
    }
}

/// The row images of a mutation, classified once when decoded.
///
/// The wire format does not tag the operation: an after image alone is an
/// insert, both images make an update and anything else is a delete. That
/// includes a payload with neither image, which keeps an empty before image.
#[derive(Clone, Debug, PartialEq)]
pub enum RowChange {
    Insert { after: RowImage },
    Update { before: RowImage, after: RowImage },
    Delete { before: RowImage },
}

impl RowChange {
    pub fn from_images(before: RowImage, after: RowImage) -> RowChange {
        match (before.is_empty(), after.is_empty()) {
            (true, false) => RowChange::Insert { after },
            (false, false) => RowChange::Update { before, after },
            _ => RowChange::Delete { before },
        }
    }

    pub fn operation(&self) -> Operation {
        match self {
            RowChange::Insert { .. } => Operation::Insert,
            RowChange::Update { .. } => Operation::Update,
            RowChange::Delete { .. } => Operation::Delete,
        }
    }
}

/// Represents a single row mutation from the change feed.
/// Immutable once decoded.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "WirePayload", into = "WirePayload")]
pub struct Payload {
    keys: Vec<Value>,
    change: RowChange,
    topic: Option<String>,
    updated: Option<String>,
}

impl Payload {
    pub fn new(keys: Vec<Value>, before: RowImage, after: RowImage) -> Payload {
        Payload {
            keys,
            change: RowChange::from_images(before, after),
            topic: None,
            updated: None,
        }
    }

    pub fn insert(keys: Vec<Value>, after: RowImage) -> Payload {
        Payload::new(keys, RowImage::new(), after)
    }

    pub fn delete(keys: Vec<Value>, before: RowImage) -> Payload {
        Payload::new(keys, before, RowImage::new())
    }

    /// Primary key component values, in key order.
    pub fn keys(&self) -> &[Value] {
        &self.keys
    }

    pub fn change(&self) -> &RowChange {
        &self.change
    }

    pub fn operation(&self) -> Operation {
        self.change.operation()
    }

    /// The after image, or `None` for deletes.
    pub fn after(&self) -> Option<&RowImage> {
        match &self.change {
            RowChange::Insert { after } | RowChange::Update { after, .. } => Some(after),
            RowChange::Delete { .. } => None,
        }
    }

    /// The before image, or `None` for inserts.
    pub fn before(&self) -> Option<&RowImage> {
        match &self.change {
            RowChange::Update { before, .. } | RowChange::Delete { before } => Some(before),
            RowChange::Insert { .. } => None,
        }
    }

    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    pub fn updated(&self) -> Option<&str> {
        self.updated.as_deref()
    }
}

// Shape of a payload inside a webhook sink delivery.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct WirePayload {
    #[serde(rename = "key", default)]
    keys: Vec<Value>,
    #[serde(default, deserialize_with = "nullable_image", skip_serializing_if = "Map::is_empty")]
    before: RowImage,
    #[serde(default, deserialize_with = "nullable_image", skip_serializing_if = "Map::is_empty")]
    after: RowImage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    updated: Option<String>,
}

fn nullable_image<'de, D>(deserializer: D) -> Result<RowImage, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<RowImage>::deserialize(deserializer)?.unwrap_or_default())
}

impl From<WirePayload> for Payload {
    fn from(wire: WirePayload) -> Self {
        Payload {
            keys: wire.keys,
            change: RowChange::from_images(wire.before, wire.after),
            topic: wire.topic,
            updated: wire.updated,
        }
    }
}

impl From<Payload> for WirePayload {
    fn from(payload: Payload) -> Self {
        let (before, after) = match payload.change {
            RowChange::Insert { after } => (RowImage::new(), after),
            RowChange::Update { before, after } => (before, after),
            RowChange::Delete { before } => (before, RowImage::new()),
        };
        WirePayload {
            keys: payload.keys,
            before,
            after,
            topic: payload.topic,
            updated: payload.updated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn image(value: Value) -> RowImage {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_operation_derivation() {
        let row = image(json!({"id": 1, "name": "a"}));

        let insert = Payload::new(vec![json!(1)], RowImage::new(), row.clone());
        assert_eq!(insert.operation(), Operation::Insert);

        let update = Payload::new(vec![json!(1)], row.clone(), row.clone());
        assert_eq!(update.operation(), Operation::Update);

        let delete = Payload::new(vec![json!(1)], row.clone(), RowImage::new());
        assert_eq!(delete.operation(), Operation::Delete);

        // Neither image present is still classified as a delete.
        let degenerate = Payload::new(vec![json!(1)], RowImage::new(), RowImage::new());
        assert_eq!(degenerate.operation(), Operation::Delete);
        assert_eq!(degenerate.before(), Some(&RowImage::new()));
    }

    #[test]
    fn test_decode_webhook_payload() {
        let payload: Payload = serde_json::from_value(json!({
            "key": [42],
            "after": {"id": 42, "name": "x"},
            "topic": "products",
            "updated": "1634000000000000000.0000000000"
        }))
        .unwrap();

        assert_eq!(payload.keys(), &[json!(42)]);
        assert_eq!(payload.operation(), Operation::Insert);
        assert_eq!(payload.after().unwrap()["name"], json!("x"));
        assert!(payload.before().is_none());
        assert_eq!(payload.topic(), Some("products"));
        assert_eq!(payload.updated(), Some("1634000000000000000.0000000000"));
    }

    #[test]
    fn test_decode_null_images() {
        let payload: Payload = serde_json::from_value(json!({
            "key": ["a", 7],
            "before": {"id": "a"},
            "after": null
        }))
        .unwrap();

        assert_eq!(payload.keys().len(), 2);
        assert_eq!(payload.operation(), Operation::Delete);
    }

    #[test]
    fn test_encode_keeps_images() {
        let update = Payload::new(
            vec![json!(1)],
            image(json!({"v": 1})),
            image(json!({"v": 2})),
        );
        let encoded = serde_json::to_value(&update).unwrap();
        assert_eq!(
            encoded,
            json!({"key": [1], "before": {"v": 1}, "after": {"v": 2}})
        );
    }
}
