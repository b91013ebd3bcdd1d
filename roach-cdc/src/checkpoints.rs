//! A module representing the logic behind saving reader progress.
//!
//! Buffered payloads live in memory only, so a checkpoint does not allow
//! replaying anything. It records the keys of the last payload a reader
//! handed out, which tells an operator where a failed execution stopped.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub subscriber_id: String,
    pub last_keys: Vec<Value>,
}

impl Checkpoint {
    pub fn new(subscriber_id: impl Into<String>, last_keys: Vec<Value>) -> Checkpoint {
        Checkpoint {
            subscriber_id: subscriber_id.into(),
            last_keys,
        }
    }
}

/// Customizable trait responsible for storing reader checkpoints.
#[async_trait]
pub trait CheckpointSaver: Send + Sync {
    /// Saves given checkpoint, replacing any previous one of the same subscriber.
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> anyhow::Result<()>;
    /// Loads the last checkpoint saved for the subscriber.
    async fn load_checkpoint(&self, subscriber_id: &str) -> anyhow::Result<Option<Checkpoint>>;
}

/// Keeps checkpoints in process memory.
#[derive(Default)]
pub struct InMemoryCheckpointSaver {
    checkpoints: RwLock<HashMap<String, Checkpoint>>,
}

impl InMemoryCheckpointSaver {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointSaver for InMemoryCheckpointSaver {
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> anyhow::Result<()> {
        self.checkpoints
            .write()
            .await
            .insert(checkpoint.subscriber_id.clone(), checkpoint.clone());
        Ok(())
    }

    async fn load_checkpoint(&self, subscriber_id: &str) -> anyhow::Result<Option<Checkpoint>> {
        Ok(self.checkpoints.read().await.get(subscriber_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_save_checkpoint_multiple_times() {
        let saver = InMemoryCheckpointSaver::new();

        for key in 0..20 {
            saver
                .save_checkpoint(&Checkpoint::new("sub1", vec![json!(key)]))
                .await
                .unwrap();
        }

        let loaded = saver.load_checkpoint("sub1").await.unwrap().unwrap();
        assert_eq!(loaded.last_keys, vec![json!(19)]);
        assert!(saver.load_checkpoint("sub2").await.unwrap().is_none());
    }
}
