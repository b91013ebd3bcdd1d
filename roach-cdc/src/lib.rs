pub mod cdc_types;
pub mod checkpoints;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod eviction;
pub mod payload;
pub mod reader;
pub mod server;
pub mod subscriber;
pub mod webhook;

// The test module should be visible only if test feature is enabled.
// Test feature is disabled by default.
#[cfg(all(test, not(feature = "test")))]
mod test_utilities;

#[cfg(feature = "test")]
pub mod test_utilities;

pub use cdc_types::LogicalTimestamp;
pub use dispatcher::{ChangeFeedDispatcher, DispatcherConfig};
pub use error::CdcError;
pub use event::ChangeFeedEvent;
pub use payload::{Operation, Payload, RowChange, RowImage};
pub use subscriber::{Subscriber, SubscriberSnapshot};
