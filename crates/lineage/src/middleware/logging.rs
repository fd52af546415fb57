//! Structured logging around each message.

use std::time::Instant;

use async_trait::async_trait;

use crate::envelope::Envelope;
use crate::error::Result;
use crate::message::MessageType;
use crate::middleware::{Middleware, Next};

/// Logs the start, outcome and duration of every message on the bus.
///
/// Errors are logged and returned unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingMiddleware;

impl LoggingMiddleware {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Middleware for LoggingMiddleware {
    async fn handle(&self, envelope: Envelope, next: Next) -> Result<Envelope> {
        let message = envelope.message_name();
        let message_type = envelope.message_type();
        let message_id = envelope.message_id().map(str::to_owned);

        tracing::info!(
            message_name = message,
            message_id = ?message_id,
            stamps = ?envelope.stamp_kinds(),
            "processing {}",
            message_type,
        );

        let mut unfinished = Unfinished {
            message_name: message,
            message_type,
            message_id: message_id.clone(),
            started: Instant::now(),
            done: false,
        };
        let result = next.run(envelope).await;
        unfinished.done = true;
        let elapsed_ms = unfinished.elapsed_ms();

        match &result {
            Ok(_) => tracing::info!(
                message_name = message,
                message_id = ?message_id,
                elapsed_ms,
                "{} processed successfully",
                message_type,
            ),
            Err(error) => tracing::error!(
                message_name = message,
                message_id = ?message_id,
                elapsed_ms,
                error = %error,
                "{} processing failed",
                message_type,
            ),
        }

        result
    }
}

/// Logs a cancelled run if dropped before the rest of the chain returns.
struct Unfinished {
    message_name: &'static str,
    message_type: MessageType,
    message_id: Option<String>,
    started: Instant,
    done: bool,
}

impl Unfinished {
    fn elapsed_ms(&self) -> f64 {
        self.started.elapsed().as_secs_f64() * 1000.0
    }
}

impl Drop for Unfinished {
    fn drop(&mut self) {
        if !self.done {
            tracing::warn!(
                message_name = self.message_name,
                message_id = ?self.message_id,
                elapsed_ms = self.elapsed_ms(),
                "{} processing cancelled",
                self.message_type,
            );
        }
    }
}
