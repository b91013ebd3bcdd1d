//! Periodic removal of subscribers whose change feed stopped delivering.
use std::sync::Arc;
use std::time::Duration;

use futures::future::RemoteHandle;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::debug;

use crate::dispatcher::ChangeFeedDispatcher;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdleEvictionConfig {
    /// Time between two sweeps.
    pub interval: Duration,
    /// Subscribers idle for longer are unregistered.
    pub max_idle: Duration,
}

impl Default for IdleEvictionConfig {
    fn default() -> Self {
        IdleEvictionConfig {
            interval: Duration::from_secs(60),
            max_idle: Duration::from_secs(60 * 60),
        }
    }
}

/// Spawns the eviction loop. Dropping the returned handle stops it.
pub fn start_idle_eviction(
    dispatcher: Arc<ChangeFeedDispatcher>,
    config: IdleEvictionConfig,
) -> RemoteHandle<()> {
    let (fut, handle) = async move {
        loop {
            sleep(config.interval).await;
            let evicted = dispatcher.evict_idle(config.max_idle).await;
            if !evicted.is_empty() {
                debug!("Evicted {} idle subscribers: {:?}", evicted.len(), evicted);
            }
        }
    }
    .remote_handle();

    tokio::task::spawn(fut);

    handle
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utilities::{new_dispatcher, new_subscriber};

    #[tokio::test]
    async fn test_evicts_until_dropped() {
        let dispatcher = Arc::new(new_dispatcher(10));
        dispatcher
            .register(new_subscriber("sub1", Duration::from_secs(1)))
            .await;

        let handle = start_idle_eviction(
            dispatcher.clone(),
            IdleEvictionConfig {
                interval: Duration::from_millis(20),
                max_idle: Duration::from_millis(50),
            },
        );
        sleep(Duration::from_millis(300)).await;
        assert!(dispatcher.get_subscriber("sub1").await.is_none());

        drop(handle);
        dispatcher
            .register(new_subscriber("sub2", Duration::from_secs(1)))
            .await;
        sleep(Duration::from_millis(300)).await;
        assert!(dispatcher.get_subscriber("sub2").await.is_some());
    }
}
