//! Identity and runtime state of a single change feed consumer.
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{self, AtomicU64};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::cdc_types::LogicalTimestamp;
use crate::error::CdcError;
use crate::payload::Payload;

#[derive(Debug, Default)]
struct SubscriberState {
    last_resolved_timestamp: Option<LogicalTimestamp>,
    last_event_received: Option<DateTime<Utc>>,
    // Only the most recent batch is kept.
    last_payload: Vec<Payload>,
}

/// One logical consumer of a change feed, typically one per table and job.
/// Equality, hashing and ordering consider the id only.
#[derive(Debug)]
pub struct Subscriber {
    id: String,
    table_name: Option<String>,
    poll_timeout: Duration,
    creation_timestamp: DateTime<Utc>,
    events_received: AtomicU64,
    payloads_received: AtomicU64,
    state: Mutex<SubscriberState>,
}

impl Subscriber {
    /// Creates a subscriber. The poll timeout bounds every wait for data
    /// after the first event was received, so it must not be zero.
    pub fn new(id: impl Into<String>, poll_timeout: Duration) -> Result<Subscriber, CdcError> {
        if poll_timeout.is_zero() {
            return Err(CdcError::InvalidPollTimeout);
        }
        Ok(Subscriber {
            id: id.into(),
            table_name: None,
            poll_timeout,
            creation_timestamp: Utc::now(),
            events_received: AtomicU64::new(0),
            payloads_received: AtomicU64::new(0),
            state: Mutex::new(SubscriberState::default()),
        })
    }

    pub fn with_table_name(mut self, table_name: impl Into<String>) -> Subscriber {
        self.table_name = Some(table_name.into());
        self
    }

    pub fn with_creation_timestamp(mut self, creation_timestamp: DateTime<Utc>) -> Subscriber {
        self.creation_timestamp = creation_timestamp;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn table_name(&self) -> Option<&str> {
        self.table_name.as_deref()
    }

    pub fn poll_timeout(&self) -> Duration {
        self.poll_timeout
    }

    pub fn creation_timestamp(&self) -> DateTime<Utc> {
        self.creation_timestamp
    }

    pub fn events_received(&self) -> u64 {
        self.events_received.load(atomic::Ordering::Relaxed)
    }

    pub fn payloads_received(&self) -> u64 {
        self.payloads_received.load(atomic::Ordering::Relaxed)
    }

    pub async fn last_resolved_timestamp(&self) -> Option<LogicalTimestamp> {
        self.state.lock().await.last_resolved_timestamp
    }

    pub async fn last_event_received(&self) -> Option<DateTime<Utc>> {
        self.state.lock().await.last_event_received
    }

    pub async fn last_payload(&self) -> Vec<Payload> {
        self.state.lock().await.last_payload.clone()
    }

    /// Time of the last delivered batch, or the creation time if none arrived yet.
    pub async fn last_activity(&self) -> DateTime<Utc> {
        self.last_event_received()
            .await
            .unwrap_or(self.creation_timestamp)
    }

    pub(crate) async fn record_payloads(&self, payloads: &[Payload]) {
        let mut state = self.state.lock().await;
        state.last_event_received = Some(Utc::now());
        state.last_payload = payloads.to_vec();
        self.events_received.fetch_add(1, atomic::Ordering::Relaxed);
        self.payloads_received
            .fetch_add(payloads.len() as u64, atomic::Ordering::Relaxed);
    }

    /// Stores the watermark. With `reject_regressions` set, a watermark
    /// older than the current one is dropped and `false` is returned.
    pub(crate) async fn set_last_resolved_timestamp(
        &self,
        timestamp: LogicalTimestamp,
        reject_regressions: bool,
    ) -> bool {
        let mut state = self.state.lock().await;
        match state.last_resolved_timestamp {
            Some(current) if reject_regressions && timestamp < current => false,
            _ => {
                state.last_resolved_timestamp = Some(timestamp);
                true
            }
        }
    }

    pub(crate) async fn snapshot(
        &self,
        buffer_size: usize,
        buffer_capacity: usize,
        awaiting_first_event: bool,
    ) -> SubscriberSnapshot {
        let state = self.state.lock().await;
        let last_activity = state
            .last_event_received
            .unwrap_or(self.creation_timestamp);
        let poll_timeout =
            chrono::Duration::from_std(self.poll_timeout).unwrap_or(chrono::Duration::MAX);
        let until_expiry = last_activity
            .checked_add_signed(poll_timeout)
            .map(|expiry| (expiry - Utc::now()).num_seconds().max(0))
            .unwrap_or(i64::MAX);

        SubscriberSnapshot {
            id: self.id.clone(),
            table_name: self.table_name.clone(),
            poll_timeout_seconds: self.poll_timeout.as_secs_f64(),
            creation_timestamp: self.creation_timestamp,
            last_resolved_timestamp: state.last_resolved_timestamp,
            last_event_received: state.last_event_received,
            events_received: self.events_received(),
            payloads_received: self.payloads_received(),
            duration_until_poll_expires_seconds: until_expiry,
            buffer_size,
            buffer_capacity,
            buffer_fill_ratio: if buffer_capacity > 0 {
                buffer_size as f64 / buffer_capacity as f64
            } else {
                0.0
            },
            awaiting_first_event,
        }
    }
}

impl PartialEq for Subscriber {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Subscriber {}

impl Hash for Subscriber {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl PartialOrd for Subscriber {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Subscriber {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

impl fmt::Display for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Subscriber{{id={}, table={}, poll_timeout={:?}}}",
            self.id,
            self.table_name.as_deref().unwrap_or("-"),
            self.poll_timeout
        )
    }
}

/// Point-in-time diagnostics of a registered subscriber.
#[derive(Clone, Debug, Serialize)]
pub struct SubscriberSnapshot {
    pub id: String,
    pub table_name: Option<String>,
    pub poll_timeout_seconds: f64,
    pub creation_timestamp: DateTime<Utc>,
    pub last_resolved_timestamp: Option<LogicalTimestamp>,
    pub last_event_received: Option<DateTime<Utc>>,
    pub events_received: u64,
    pub payloads_received: u64,
    pub duration_until_poll_expires_seconds: i64,
    pub buffer_size: usize,
    pub buffer_capacity: usize,
    pub buffer_fill_ratio: f64,
    pub awaiting_first_event: bool,
}
