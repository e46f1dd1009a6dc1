//! Typed errors for queue operations.
//!
//! Precondition violations are rejected synchronously. Store and transport
//! failures are surfaced as-is and never retried here. "No result" is not
//! an error: a drained queue yields `Ok(None)` and a missed ack deadline
//! yields `Ok(false)`.

use crate::ts::EventId;

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the queue engine.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A queue name was empty.
    #[error("queue name must not be empty")]
    EmptyQueue,

    /// A consumer group name was empty.
    #[error("consumer group must not be empty")]
    EmptyConsumerGroup,

    /// An event's expiration was not in the future.
    #[error("event expiration must be after the current time")]
    ExpireNotFuture,

    /// An id was delivered from an index but its payload is gone.
    #[error("event {0} is indexed but its payload is missing")]
    MissingEvent(EventId),

    /// The backing store failed.
    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}
