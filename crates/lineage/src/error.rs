//! Error types for the dispatch pipeline.
//!
//! Three families of failure exist:
//!
//! - **Configuration errors** ([`BusError::DuplicateMessageId`],
//!   [`BusError::MissingMessageId`], [`BusError::NoHandler`]) are programmer
//!   errors. They fail the dispatch and are never retried.
//! - **Delegate failures** ([`BusError::Handler`], [`BusError::Transport`])
//!   come from handlers and senders and travel back through every stage
//!   unchanged.
//! - **Observability failures** (status recorders, metrics exporters) never
//!   surface here. Stages log them and carry on.

use thiserror::Error;

/// The result type used throughout the pipeline.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors raised while dispatching a message.
#[derive(Debug, Error)]
pub enum BusError {
    /// The stamps handed to a bus already carried a message ID.
    #[error("MessageIdStamp with ID {id} already exists")]
    DuplicateMessageId { id: String },

    /// A stage that needs the message ID ran before one was attached.
    #[error("message {message} has no MessageIdStamp; the ID stage must run first")]
    MissingMessageId { message: &'static str },

    /// No handler is registered for the message and the bus requires one.
    #[error("no handler registered for message {message}")]
    NoHandler { message: &'static str },

    /// A handler returned an error.
    #[error("handler {handler} failed: {source}")]
    Handler {
        handler: String,
        #[source]
        source: anyhow::Error,
    },

    /// A sender could not hand the envelope to its transport.
    #[error("sender {sender} failed: {source}")]
    Transport {
        sender: String,
        #[source]
        source: anyhow::Error,
    },

    /// A synchronous dispatch expected exactly one handler result.
    #[error("message {message} was handled {count} times; exactly one handler is expected")]
    HandledCount { message: &'static str, count: usize },

    /// A handler result could not be decoded into the caller's type.
    #[error("failed to decode handler result: {0}")]
    ResultDecode(#[from] serde_json::Error),

    /// One or more messages deferred until the end of the current dispatch
    /// failed while being flushed.
    #[error("{} deferred message(s) failed: {}", .failures.len(), summarize(.failures))]
    DelayedHandling { failures: Vec<BusError> },
}

impl BusError {
    /// Returns true for errors caused by how the bus was assembled or
    /// called, as opposed to failures of a handler or transport.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            BusError::DuplicateMessageId { .. }
                | BusError::MissingMessageId { .. }
                | BusError::NoHandler { .. }
        )
    }
}

fn summarize(failures: &[BusError]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
