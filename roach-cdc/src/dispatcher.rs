//! A module owning the per-subscriber buffers between the webhook sink
//! (producers) and the draining jobs (consumers).
//!
//! Every registered subscriber gets one bounded FIFO buffer. Producers
//! wait in [`ChangeFeedDispatcher::publish`] while the buffer is full, which
//! slows down the HTTP response and makes the change feed source back off.
//! Consumers pull with [`ChangeFeedDispatcher::receive`]: the first receive
//! of a subscriber waits as long as it takes for data to show up, every
//! later one gives up after the subscriber's poll timeout. That turns an
//! endless feed into a unit of work that completes once the feed goes quiet.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cdc_types::LogicalTimestamp;
use crate::error::CdcError;
use crate::event::ChangeFeedEvent;
use crate::payload::Payload;
use crate::subscriber::{Subscriber, SubscriberSnapshot};

pub const DEFAULT_BUFFER_CAPACITY: usize = 1024;

fn default_buffer_capacity() -> usize {
    DEFAULT_BUFFER_CAPACITY
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Maximum number of payloads buffered per subscriber.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    /// Drop resolved watermarks that are older than the current one.
    #[serde(default)]
    pub strict_watermarks: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            strict_watermarks: false,
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> Result<(), CdcError> {
        if self.buffer_capacity == 0 {
            return Err(CdcError::InvalidConfig(
                "buffer_capacity must be greater than 0".to_string(),
            ));
        }
        if self.buffer_capacity > tokio::sync::Semaphore::MAX_PERMITS {
            return Err(CdcError::InvalidConfig(format!(
                "buffer_capacity must not exceed {}",
                tokio::sync::Semaphore::MAX_PERMITS
            )));
        }
        Ok(())
    }
}

struct SubscriberBuffer {
    subscriber: Arc<Subscriber>,
    sender: mpsc::Sender<Payload>,
    // A buffer is drained by one consumer at a time.
    receiver: Mutex<mpsc::Receiver<Payload>>,
    // Keeps the payloads of one delivery contiguous.
    publish_lock: Mutex<()>,
    awaiting_first_event: AtomicBool,
    // Cancelled on unregistration to release blocked producers and consumers.
    unregistered: CancellationToken,
}

impl SubscriberBuffer {
    fn new(subscriber: Arc<Subscriber>, capacity: usize) -> SubscriberBuffer {
        let (sender, receiver) = mpsc::channel(capacity);
        SubscriberBuffer {
            subscriber,
            sender,
            receiver: Mutex::new(receiver),
            publish_lock: Mutex::new(()),
            awaiting_first_event: AtomicBool::new(true),
            unregistered: CancellationToken::new(),
        }
    }

    fn len(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    fn capacity(&self) -> usize {
        self.sender.max_capacity()
    }

    fn fill_ratio(&self) -> f64 {
        self.len() as f64 / self.capacity() as f64
    }

    fn is_awaiting_first_event(&self) -> bool {
        self.awaiting_first_event.load(Ordering::Acquire)
    }

    async fn snapshot(&self) -> SubscriberSnapshot {
        self.subscriber
            .snapshot(self.len(), self.capacity(), self.is_awaiting_first_event())
            .await
    }
}

/// Registry of subscribers and their buffers.
pub struct ChangeFeedDispatcher {
    config: DispatcherConfig,
    buffers: RwLock<HashMap<String, Arc<SubscriberBuffer>>>,
}

impl ChangeFeedDispatcher {
    /// Creates a dispatcher. Fails if the configuration is invalid.
    pub fn new(config: DispatcherConfig) -> Result<ChangeFeedDispatcher, CdcError> {
        config.validate()?;
        Ok(ChangeFeedDispatcher {
            config,
            buffers: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn buffer_capacity(&self) -> usize {
        self.config.buffer_capacity
    }

    /// Creates a buffer for the subscriber unless its id is already taken.
    /// A duplicate registration leaves the existing buffer untouched and
    /// returns `false`.
    pub async fn register(&self, subscriber: Arc<Subscriber>) -> bool {
        let mut buffers = self.buffers.write().await;
        if buffers.contains_key(subscriber.id()) {
            warn!(subscriber_id = %subscriber.id(), "Subscriber {} already registered", subscriber);
            return false;
        }

        info!(
            subscriber_id = %subscriber.id(),
            buffer_capacity = self.config.buffer_capacity,
            "Registering subscriber {}", subscriber
        );
        let buffer = SubscriberBuffer::new(subscriber.clone(), self.config.buffer_capacity);
        buffers.insert(subscriber.id().to_string(), Arc::new(buffer));
        true
    }

    /// Removes the buffer of a subscriber, discarding undelivered payloads.
    /// Returns `false` if the subscriber was not registered.
    pub async fn unregister(&self, subscriber_id: &str) -> bool {
        let removed = self.buffers.write().await.remove(subscriber_id);
        match removed {
            Some(buffer) => {
                info!(
                    subscriber_id,
                    discarded = buffer.len(),
                    "Unregistering subscriber {}", buffer.subscriber
                );
                buffer.unregistered.cancel();
                true
            }
            None => {
                warn!(subscriber_id, "Subscriber not registered");
                false
            }
        }
    }

    pub async fn get_subscriber(&self, subscriber_id: &str) -> Option<Arc<Subscriber>> {
        self.buffers
            .read()
            .await
            .get(subscriber_id)
            .map(|buffer| buffer.subscriber.clone())
    }

    /// All registered subscribers ordered by id.
    pub async fn subscribers(&self) -> Vec<Arc<Subscriber>> {
        let mut subscribers: Vec<_> = self
            .buffers
            .read()
            .await
            .values()
            .map(|buffer| buffer.subscriber.clone())
            .collect();
        subscribers.sort();
        subscribers
    }

    /// Number of payloads currently buffered, 0 for unknown subscribers.
    pub async fn buffer_size(&self, subscriber_id: &str) -> usize {
        match self.lookup(subscriber_id).await {
            Ok(buffer) => buffer.len(),
            Err(_) => 0,
        }
    }

    /// Buffered payloads relative to the buffer capacity, in `[0, 1]`.
    pub async fn buffer_fill_ratio(&self, subscriber_id: &str) -> f64 {
        match self.lookup(subscriber_id).await {
            Ok(buffer) => buffer.fill_ratio(),
            Err(_) => 0.0,
        }
    }

    pub async fn describe(&self, subscriber_id: &str) -> Option<SubscriberSnapshot> {
        let buffer = self.lookup(subscriber_id).await.ok()?;
        Some(buffer.snapshot().await)
    }

    pub async fn describe_all(&self) -> Vec<SubscriberSnapshot> {
        let mut snapshots = Vec::new();
        for buffer in self.all_buffers().await {
            snapshots.push(buffer.snapshot().await);
        }
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }

    /// Routes a decoded webhook delivery to [`Self::resolved`] or [`Self::publish`].
    pub async fn dispatch(
        &self,
        subscriber_id: &str,
        event: ChangeFeedEvent,
        cancel: &CancellationToken,
    ) -> Result<(), CdcError> {
        match event {
            ChangeFeedEvent::Resolved(timestamp) => {
                self.resolved(subscriber_id, timestamp).await.map(|_| ())
            }
            ChangeFeedEvent::Payload(payloads) => {
                self.publish(subscriber_id, payloads, cancel).await
            }
        }
    }

    /// Appends a batch of payloads to the subscriber's buffer, in order.
    ///
    /// Waits while the buffer is full. The wait ends with
    /// [`CdcError::Cancelled`] if `cancel` fires and with
    /// [`CdcError::SubscriberNotFound`] if the subscriber is unregistered
    /// meanwhile. Payloads enqueued before that stay in the buffer.
    pub async fn publish(
        &self,
        subscriber_id: &str,
        payloads: Vec<Payload>,
        cancel: &CancellationToken,
    ) -> Result<(), CdcError> {
        let buffer = self.lookup(subscriber_id).await?;
        if payloads.is_empty() {
            return Err(CdcError::MalformedEvent("empty payload batch".to_string()));
        }

        debug!(
            subscriber_id,
            buffer_size = buffer.len(),
            buffer_fill_ratio = buffer.fill_ratio(),
            payloads = payloads.len(),
            "Publishing change feed event"
        );

        let _guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CdcError::Cancelled),
            _ = buffer.unregistered.cancelled() => {
                return Err(CdcError::SubscriberNotFound(subscriber_id.to_string()))
            }
            guard = buffer.publish_lock.lock() => guard,
        };

        buffer.subscriber.record_payloads(&payloads).await;

        for payload in payloads {
            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CdcError::Cancelled),
                _ = buffer.unregistered.cancelled() => {
                    return Err(CdcError::SubscriberNotFound(subscriber_id.to_string()))
                }
                sent = buffer.sender.send(payload) => sent,
            };
            sent.map_err(|_| CdcError::SubscriberNotFound(subscriber_id.to_string()))?;
        }

        Ok(())
    }

    /// Records a resolved watermark. Never touches the buffer and never waits
    /// for capacity. Returns `false` if the watermark was dropped as a
    /// regression (only with `strict_watermarks`).
    pub async fn resolved(
        &self,
        subscriber_id: &str,
        timestamp: LogicalTimestamp,
    ) -> Result<bool, CdcError> {
        let buffer = self.lookup(subscriber_id).await?;
        let applied = buffer
            .subscriber
            .set_last_resolved_timestamp(timestamp, self.config.strict_watermarks)
            .await;
        if applied {
            debug!(subscriber_id, %timestamp, "Last resolved timestamp updated");
        } else {
            warn!(subscriber_id, %timestamp, "Ignoring out-of-order resolved timestamp");
        }
        Ok(applied)
    }

    /// Takes the next payload from the subscriber's buffer.
    ///
    /// Until the subscriber has received its first payload this waits without
    /// a time limit. Afterwards it waits at most the subscriber's poll timeout
    /// and returns `Ok(None)` if nothing arrived.
    pub async fn receive(
        &self,
        subscriber_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Payload>, CdcError> {
        let buffer = self.lookup(subscriber_id).await?;
        let not_found = || CdcError::SubscriberNotFound(subscriber_id.to_string());

        let mut receiver = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CdcError::Cancelled),
            _ = buffer.unregistered.cancelled() => return Err(not_found()),
            receiver = buffer.receiver.lock() => receiver,
        };

        if buffer.is_awaiting_first_event() {
            info!(subscriber_id, "Subscriber {} waiting for initial event", buffer.subscriber);
            let payload = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CdcError::Cancelled),
                _ = buffer.unregistered.cancelled() => return Err(not_found()),
                payload = receiver.recv() => payload.ok_or_else(not_found)?,
            };
            buffer.awaiting_first_event.store(false, Ordering::Release);
            info!(subscriber_id, "Subscriber {} received initial event", buffer.subscriber);
            return Ok(Some(payload));
        }

        let poll_timeout = buffer.subscriber.poll_timeout();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CdcError::Cancelled),
            _ = buffer.unregistered.cancelled() => Err(not_found()),
            polled = tokio::time::timeout(poll_timeout, receiver.recv()) => match polled {
                Ok(Some(payload)) => Ok(Some(payload)),
                Ok(None) => Err(not_found()),
                Err(_) => Ok(None),
            },
        }
    }

    /// Unregisters every subscriber without activity (last delivered batch,
    /// or creation if none) for longer than `max_idle`. Returns the evicted ids.
    pub async fn evict_idle(&self, max_idle: Duration) -> Vec<String> {
        let max_idle = chrono::Duration::from_std(max_idle).unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();

        let mut idle = Vec::new();
        for buffer in self.all_buffers().await {
            let last_activity = buffer.subscriber.last_activity().await;
            if now - last_activity > max_idle {
                idle.push(buffer.subscriber.id().to_string());
            }
        }

        let mut evicted = Vec::with_capacity(idle.len());
        for subscriber_id in idle {
            if self.unregister(&subscriber_id).await {
                info!(subscriber_id = %subscriber_id, "Evicted idle subscriber");
                evicted.push(subscriber_id);
            }
        }
        evicted
    }

    async fn lookup(&self, subscriber_id: &str) -> Result<Arc<SubscriberBuffer>, CdcError> {
        self.buffers
            .read()
            .await
            .get(subscriber_id)
            .cloned()
            .ok_or_else(|| CdcError::SubscriberNotFound(subscriber_id.to_string()))
    }

    async fn all_buffers(&self) -> Vec<Arc<SubscriberBuffer>> {
        self.buffers.read().await.values().cloned().collect()
    }
}
