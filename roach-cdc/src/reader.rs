//! A sequential, restartable item source on top of the dispatcher.
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::checkpoints::{Checkpoint, CheckpointSaver};
use crate::dispatcher::ChangeFeedDispatcher;
use crate::error::CdcError;
use crate::payload::Payload;
use crate::subscriber::Subscriber;

#[derive(Clone, Debug)]
pub struct ReaderOptions {
    /// Restore and persist the last seen keys.
    pub save_state: bool,
    /// Treat an existing registration of the same id and table as a previous
    /// execution of this job and drain its buffer instead of failing.
    pub reattach: bool,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        ReaderOptions {
            save_state: true,
            reattach: false,
        }
    }
}

/// Reads the change feed of one subscriber, one payload at a time.
///
/// `read` returns `Ok(None)` once the feed stayed quiet for a poll timeout,
/// which completes the owning unit of work. Closing the reader keeps the
/// subscriber registered so that a restarted execution finds the events
/// delivered in the meantime.
pub struct ChangeFeedReader {
    subscriber: Arc<Subscriber>,
    dispatcher: Arc<ChangeFeedDispatcher>,
    options: ReaderOptions,
    cancel: CancellationToken,
    registration_failed: bool,
    last_keys: Vec<Value>,
}

impl ChangeFeedReader {
    pub fn new(subscriber: Arc<Subscriber>, dispatcher: Arc<ChangeFeedDispatcher>) -> Self {
        ChangeFeedReader {
            subscriber,
            dispatcher,
            options: ReaderOptions::default(),
            cancel: CancellationToken::new(),
            registration_failed: false,
            last_keys: Vec::new(),
        }
    }

    pub fn with_options(mut self, options: ReaderOptions) -> Self {
        self.options = options;
        self
    }

    /// Pending reads end with [`CdcError::Cancelled`] once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn subscriber(&self) -> &Arc<Subscriber> {
        &self.subscriber
    }

    pub fn last_keys(&self) -> &[Value] {
        &self.last_keys
    }

    pub fn is_registration_failed(&self) -> bool {
        self.registration_failed
    }

    /// Registers the subscriber and restores the last seen keys.
    pub async fn open(&mut self, restored: Option<Checkpoint>) {
        info!(
            subscriber_id = %self.subscriber.id(),
            "Change feed poll timeout: {:?}", self.subscriber.poll_timeout()
        );

        if let Some(checkpoint) = restored.filter(|_| self.options.save_state) {
            if checkpoint.subscriber_id == self.subscriber.id() {
                self.last_keys = checkpoint.last_keys;
                debug!(subscriber_id = %self.subscriber.id(), "Last seen keys: {:?}", self.last_keys);
            } else {
                warn!(
                    subscriber_id = %self.subscriber.id(),
                    checkpoint_subscriber_id = %checkpoint.subscriber_id,
                    "Ignoring checkpoint of another subscriber"
                );
            }
        }

        if self.dispatcher.register(self.subscriber.clone()).await {
            return;
        }

        if self.options.reattach && self.is_same_feed().await {
            info!(
                subscriber_id = %self.subscriber.id(),
                "Reattaching to existing change feed buffer"
            );
        } else {
            self.registration_failed = true;
        }
    }

    async fn is_same_feed(&self) -> bool {
        match self.dispatcher.get_subscriber(self.subscriber.id()).await {
            Some(existing) => existing.table_name() == self.subscriber.table_name(),
            None => false,
        }
    }

    /// Returns the next payload, or `None` at the end of the feed.
    pub async fn read(&mut self) -> Result<Option<Payload>, CdcError> {
        if self.registration_failed {
            return Err(CdcError::RegistrationConflict(
                self.subscriber.id().to_string(),
            ));
        }

        match self
            .dispatcher
            .receive(self.subscriber.id(), &self.cancel)
            .await?
        {
            Some(payload) => {
                self.last_keys = payload.keys().to_vec();
                Ok(Some(payload))
            }
            None => {
                info!(
                    subscriber_id = %self.subscriber.id(),
                    "Change feed reader completion for subscriber {}", self.subscriber
                );
                Ok(None)
            }
        }
    }

    /// Returns the state to persist, if there is any.
    pub fn persist_state(&self) -> Option<Checkpoint> {
        if self.options.save_state && !self.last_keys.is_empty() {
            Some(Checkpoint::new(self.subscriber.id(), self.last_keys.clone()))
        } else {
            None
        }
    }

    /// Persists the current state with the given saver.
    pub async fn save_state(&self, saver: &dyn CheckpointSaver) -> Result<(), CdcError> {
        if let Some(checkpoint) = self.persist_state() {
            saver
                .save_checkpoint(&checkpoint)
                .await
                .map_err(CdcError::Checkpoint)?;
        }
        Ok(())
    }

    /// Releases the reader. The subscriber stays registered.
    pub fn close(&mut self) {
        debug!(
            subscriber_id = %self.subscriber.id(),
            "Closing change feed reader, subscriber stays registered"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoints::InMemoryCheckpointSaver;
    use crate::test_utilities::{delete_payload, insert_payload, new_dispatcher, new_subscriber};
    use serde_json::json;
    use std::time::Duration;

    const POLL_TIMEOUT: Duration = Duration::from_millis(100);

    fn new_reader(dispatcher: &Arc<ChangeFeedDispatcher>, id: &str) -> ChangeFeedReader {
        ChangeFeedReader::new(new_subscriber(id, POLL_TIMEOUT), dispatcher.clone())
    }

    #[tokio::test]
    async fn test_reads_until_feed_goes_quiet() {
        let dispatcher = Arc::new(new_dispatcher(10));
        let mut reader = new_reader(&dispatcher, "sub1");
        reader.open(None).await;

        let cancel = CancellationToken::new();
        dispatcher
            .publish("sub1", vec![insert_payload(1), delete_payload(2)], &cancel)
            .await
            .unwrap();

        assert_eq!(reader.read().await.unwrap(), Some(insert_payload(1)));
        assert_eq!(reader.read().await.unwrap(), Some(delete_payload(2)));
        assert_eq!(reader.read().await.unwrap(), None);
        assert_eq!(reader.last_keys(), &[json!(2)]);

        reader.close();
        assert!(dispatcher.get_subscriber("sub1").await.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_registration_fails_read() {
        let dispatcher = Arc::new(new_dispatcher(10));
        let mut first = new_reader(&dispatcher, "sub1");
        first.open(None).await;

        let mut second = new_reader(&dispatcher, "sub1");
        second.open(None).await;
        assert!(second.is_registration_failed());
        assert!(matches!(
            second.read().await,
            Err(CdcError::RegistrationConflict(id)) if id == "sub1"
        ));
    }

    #[tokio::test]
    async fn test_reattach_to_warm_buffer() {
        let dispatcher = Arc::new(new_dispatcher(10));
        let mut first = new_reader(&dispatcher, "sub1");
        first.open(None).await;
        first.close();

        // Delivered while no execution is draining.
        let cancel = CancellationToken::new();
        dispatcher
            .publish("sub1", vec![insert_payload(5)], &cancel)
            .await
            .unwrap();

        let mut restarted = new_reader(&dispatcher, "sub1").with_options(ReaderOptions {
            reattach: true,
            ..Default::default()
        });
        restarted.open(None).await;
        assert!(!restarted.is_registration_failed());
        assert_eq!(restarted.read().await.unwrap(), Some(insert_payload(5)));
    }

    #[tokio::test]
    async fn test_reattach_requires_same_table() {
        let dispatcher = Arc::new(new_dispatcher(10));
        let other = Arc::new(
            Subscriber::new("sub1", POLL_TIMEOUT)
                .unwrap()
                .with_table_name("orders"),
        );
        assert!(dispatcher.register(other).await);

        let mut reader = new_reader(&dispatcher, "sub1").with_options(ReaderOptions {
            reattach: true,
            ..Default::default()
        });
        reader.open(None).await;
        assert!(reader.is_registration_failed());
    }

    #[tokio::test]
    async fn test_state_round_trip_through_saver() {
        let dispatcher = Arc::new(new_dispatcher(10));
        let saver = InMemoryCheckpointSaver::new();
        let mut reader = new_reader(&dispatcher, "sub1");
        reader.open(None).await;
        assert!(reader.persist_state().is_none());

        let cancel = CancellationToken::new();
        dispatcher
            .publish("sub1", vec![insert_payload(9)], &cancel)
            .await
            .unwrap();
        reader.read().await.unwrap();
        reader.save_state(&saver).await.unwrap();

        let restored = saver.load_checkpoint("sub1").await.unwrap();
        assert_eq!(restored, Some(Checkpoint::new("sub1", vec![json!(9)])));

        let mut restarted = new_reader(&dispatcher, "sub1").with_options(ReaderOptions {
            reattach: true,
            ..Default::default()
        });
        restarted.open(restored).await;
        assert_eq!(restarted.last_keys(), &[json!(9)]);
    }

    #[tokio::test]
    async fn test_without_save_state() {
        let dispatcher = Arc::new(new_dispatcher(10));
        let mut reader = new_reader(&dispatcher, "sub1").with_options(ReaderOptions {
            save_state: false,
            ..Default::default()
        });
        reader
            .open(Some(Checkpoint::new("sub1", vec![json!(3)])))
            .await;
        assert!(reader.last_keys().is_empty());

        let cancel = CancellationToken::new();
        dispatcher
            .publish("sub1", vec![insert_payload(4)], &cancel)
            .await
            .unwrap();
        reader.read().await.unwrap();
        assert!(reader.persist_state().is_none());
    }

    #[tokio::test]
    async fn test_cancelled_read() {
        let dispatcher = Arc::new(new_dispatcher(10));
        let cancel = CancellationToken::new();
        let mut reader = new_reader(&dispatcher, "sub1").with_cancellation(cancel.clone());
        reader.open(None).await;

        cancel.cancel();
        assert!(reader.read().await.unwrap_err().is_cancelled());
    }
}
