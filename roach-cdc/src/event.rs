//! The envelope emitted by the database's webhook sink.
use serde::Deserialize;
use tracing::warn;

use crate::cdc_types::LogicalTimestamp;
use crate::error::CdcError;
use crate::payload::Payload;

/// A single webhook sink delivery: either a resolved watermark heartbeat
/// or a non-empty batch of row mutations.
#[derive(Clone, Debug, PartialEq)]
pub enum ChangeFeedEvent {
    Resolved(LogicalTimestamp),
    Payload(Vec<Payload>),
}

#[derive(Deserialize)]
struct WireEvent {
    #[serde(default)]
    resolved: Option<String>,
    #[serde(default)]
    payload: Option<Vec<Payload>>,
    #[serde(default)]
    length: Option<usize>,
}

impl ChangeFeedEvent {
    /// Decodes a delivery body. A present `resolved` field wins: the
    /// payload branch of such a message is never looked at.
    pub fn from_slice(body: &[u8]) -> Result<ChangeFeedEvent, CdcError> {
        let wire: WireEvent = serde_json::from_slice(body)?;

        if let Some(resolved) = wire.resolved {
            return Ok(ChangeFeedEvent::Resolved(LogicalTimestamp::parse(&resolved)?));
        }

        match wire.payload {
            Some(payload) if !payload.is_empty() => {
                if let Some(length) = wire.length {
                    if length != payload.len() {
                        warn!(
                            length,
                            payloads = payload.len(),
                            "Change feed event length does not match payload count"
                        );
                    }
                }
                Ok(ChangeFeedEvent::Payload(payload))
            }
            _ => Err(CdcError::MalformedEvent(
                "expected either 'resolved' or a non-empty 'payload'".to_string(),
            )),
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, ChangeFeedEvent::Resolved(_))
    }
}
