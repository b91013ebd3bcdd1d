use std::sync::Arc;

use futures_util::future::{FutureExt, RemoteHandle};
use futures_util::stream::FuturesUnordered;
use roach_cdc::checkpoints::CheckpointSaver;
use roach_cdc::reader::{ChangeFeedReader, ReaderOptions};
use roach_cdc::{ChangeFeedDispatcher, Payload, Subscriber};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::writer::PayloadWriter;

/// Drains the change feed of one subscriber into a writer, chunk by chunk.
pub struct DrainJob {
    reader: ChangeFeedReader,
    writer: Arc<dyn PayloadWriter>,
    checkpoint_saver: Arc<dyn CheckpointSaver>,
    chunk_size: usize,
}

impl DrainJob {
    pub fn new(
        reader: ChangeFeedReader,
        writer: Arc<dyn PayloadWriter>,
        checkpoint_saver: Arc<dyn CheckpointSaver>,
        chunk_size: usize,
    ) -> DrainJob {
        DrainJob {
            reader,
            writer,
            checkpoint_saver,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Runs until the feed stays quiet for a poll timeout or the reader is
    /// cancelled. Returns the number of written payloads.
    pub async fn run(mut self) -> anyhow::Result<u64> {
        let subscriber_id = self.reader.subscriber().id().to_string();
        let restored = self.checkpoint_saver.load_checkpoint(&subscriber_id).await?;
        self.reader.open(restored).await;

        let mut written = 0;
        let result = loop {
            let (chunk, finished) = match self.read_chunk().await {
                Ok(read) => read,
                Err(err) => break Err(err),
            };

            if !chunk.is_empty() {
                if let Err(err) = self.write_chunk(&chunk).await {
                    break Err(err);
                }
                written += chunk.len() as u64;
            }

            if finished {
                break Ok(written);
            }
        };

        self.reader.close();
        match &result {
            Ok(written) => info!(subscriber_id = %subscriber_id, written, "Drain job finished"),
            Err(err) => warn!(subscriber_id = %subscriber_id, error = %err, "Drain job failed"),
        }
        result
    }

    // Reads up to `chunk_size` payloads. The flag tells whether the feed
    // ended or the job was cancelled.
    async fn read_chunk(&mut self) -> anyhow::Result<(Vec<Payload>, bool)> {
        let mut chunk = Vec::with_capacity(self.chunk_size);
        while chunk.len() < self.chunk_size {
            match self.reader.read().await {
                Ok(Some(payload)) => chunk.push(payload),
                Ok(None) => return Ok((chunk, true)),
                Err(err) if err.is_cancelled() => {
                    info!(
                        subscriber_id = %self.reader.subscriber().id(),
                        "Drain job cancelled"
                    );
                    return Ok((chunk, true));
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok((chunk, false))
    }

    async fn write_chunk(&self, chunk: &[Payload]) -> anyhow::Result<()> {
        self.writer.write(chunk).await?;
        self.reader
            .save_state(self.checkpoint_saver.as_ref())
            .await?;
        Ok(())
    }
}

/// Everything needed to replicate one table.
pub struct TableJob {
    pub subscriber: Subscriber,
    pub writer: Arc<dyn PayloadWriter>,
}

pub struct Replicator {
    cancel: CancellationToken,
}

impl Replicator {
    /// Spawns one drain job per table.
    pub fn new(
        dispatcher: Arc<ChangeFeedDispatcher>,
        jobs: Vec<TableJob>,
        checkpoint_saver: Arc<dyn CheckpointSaver>,
        reader_options: ReaderOptions,
        chunk_size: usize,
    ) -> (Self, FuturesUnordered<RemoteHandle<anyhow::Result<u64>>>) {
        let cancel = CancellationToken::new();
        let handles = FuturesUnordered::new();

        for job in jobs {
            let reader = ChangeFeedReader::new(Arc::new(job.subscriber), dispatcher.clone())
                .with_options(reader_options.clone())
                .with_cancellation(cancel.child_token());
            let drain_job = DrainJob::new(reader, job.writer, checkpoint_saver.clone(), chunk_size);

            let (fut, handle) = drain_job.run().remote_handle();
            tokio::task::spawn(fut);
            handles.push(handle);
        }

        (Replicator { cancel }, handles)
    }

    pub fn stop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::tests::RecordingWriter;
    use crate::writer::CompositeWriter;
    use futures_util::StreamExt;
    use roach_cdc::checkpoints::{Checkpoint, InMemoryCheckpointSaver};
    use roach_cdc::test_utilities::{delete_payload, insert_payload, new_dispatcher, TEST_TABLE};
    use serde_json::json;
    use std::time::Duration;

    const POLL_TIMEOUT: Duration = Duration::from_millis(200);

    fn subscriber(id: &str) -> Subscriber {
        Subscriber::new(id, POLL_TIMEOUT)
            .unwrap()
            .with_table_name(TEST_TABLE)
    }

    struct Fixture {
        dispatcher: Arc<ChangeFeedDispatcher>,
        upserts: Arc<RecordingWriter>,
        deletes: Arc<RecordingWriter>,
        saver: Arc<InMemoryCheckpointSaver>,
    }

    impl Fixture {
        fn new() -> Fixture {
            Fixture {
                dispatcher: Arc::new(new_dispatcher(16)),
                upserts: Arc::new(RecordingWriter::default()),
                deletes: Arc::new(RecordingWriter::default()),
                saver: Arc::new(InMemoryCheckpointSaver::new()),
            }
        }

        fn job(&self, id: &str) -> TableJob {
            TableJob {
                subscriber: subscriber(id),
                writer: Arc::new(CompositeWriter::new(
                    self.upserts.clone(),
                    self.deletes.clone(),
                )),
            }
        }

        async fn wait_registered(&self, id: &str) {
            while self.dispatcher.get_subscriber(id).await.is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
    }

    #[tokio::test]
    async fn test_drains_in_chunks() {
        let fixture = Fixture::new();
        let (_replicator, mut handles) = Replicator::new(
            fixture.dispatcher.clone(),
            vec![fixture.job("sub1")],
            fixture.saver.clone(),
            ReaderOptions::default(),
            2,
        );
        fixture.wait_registered("sub1").await;

        let cancel = CancellationToken::new();
        fixture
            .dispatcher
            .publish(
                "sub1",
                vec![insert_payload(1), insert_payload(2), delete_payload(3)],
                &cancel,
            )
            .await
            .unwrap();

        let written = handles.next().await.unwrap().unwrap();
        assert_eq!(written, 3);

        let upserts = fixture.upserts.batches.lock().await;
        assert_eq!(upserts.len(), 1);
        assert_eq!(upserts[0].len(), 2);
        assert_eq!(fixture.deletes.batches.lock().await.len(), 1);

        let checkpoint = fixture.saver.load_checkpoint("sub1").await.unwrap();
        assert_eq!(checkpoint, Some(Checkpoint::new("sub1", vec![json!(3)])));
        assert!(fixture.dispatcher.get_subscriber("sub1").await.is_some());
    }

    #[tokio::test]
    async fn test_stop_cancels_waiting_jobs() {
        let fixture = Fixture::new();
        let (mut replicator, mut handles) = Replicator::new(
            fixture.dispatcher.clone(),
            vec![fixture.job("sub1"), fixture.job("sub2")],
            fixture.saver.clone(),
            ReaderOptions::default(),
            10,
        );
        fixture.wait_registered("sub1").await;
        fixture.wait_registered("sub2").await;

        // No first event yet, so both jobs wait until stopped.
        tokio::time::sleep(POLL_TIMEOUT * 2).await;
        replicator.stop();

        while let Some(result) = handles.next().await {
            assert_eq!(result.unwrap(), 0);
        }
        assert!(fixture.upserts.batches.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_registration_fails_job() {
        let fixture = Fixture::new();
        assert!(fixture.dispatcher.register(Arc::new(subscriber("sub1"))).await);

        let (_replicator, mut handles) = Replicator::new(
            fixture.dispatcher.clone(),
            vec![fixture.job("sub1")],
            fixture.saver.clone(),
            ReaderOptions::default(),
            10,
        );
        assert!(handles.next().await.unwrap().is_err());
    }
}
