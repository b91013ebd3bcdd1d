//! Errors raised by the change feed dispatcher and its collaborators.
use thiserror::Error;

use crate::cdc_types::ParseTimestampError;

#[derive(Debug, Error)]
pub enum CdcError {
    /// The addressed subscriber has no active buffer.
    #[error("No subscriber found with ID: {0}")]
    SubscriberNotFound(String),

    /// A subscriber with the same ID is already registered.
    #[error("Subscriber registration failed - possible duplicate ID: {0}")]
    RegistrationConflict(String),

    /// The body of a change feed delivery could not be decoded.
    #[error("Malformed change feed event: {0}")]
    MalformedEvent(String),

    /// A pending publish or receive was cancelled by its caller.
    #[error("Change feed operation cancelled")]
    Cancelled,

    #[error("Poll timeout must be positive and non-zero")]
    InvalidPollTimeout,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Checkpoint store failure: {0}")]
    Checkpoint(#[source] anyhow::Error),
}

impl CdcError {
    /// Returns `true` if the error is a normal shutdown rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CdcError::Cancelled)
    }
}

impl From<serde_json::Error> for CdcError {
    fn from(err: serde_json::Error) -> Self {
        CdcError::MalformedEvent(err.to_string())
    }
}

impl From<ParseTimestampError> for CdcError {
    fn from(err: ParseTimestampError) -> Self {
        CdcError::MalformedEvent(err.to_string())
    }
}
