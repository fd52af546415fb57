//! Pipeline-side message ID assignment.

use std::sync::Arc;

use async_trait::async_trait;

use crate::envelope::Envelope;
use crate::error::Result;
use crate::id::{MessageIdGenerator, UuidV7Generator};
use crate::middleware::{Middleware, Next};
use crate::stamp::MessageIdStamp;

/// Gives envelopes without an ID a fresh one; envelopes that already carry
/// an ID (façade dispatches, redeliveries) pass through unchanged.
#[derive(Clone)]
pub struct MessageIdMiddleware {
    generator: Arc<dyn MessageIdGenerator>,
}

impl MessageIdMiddleware {
    pub fn new(generator: Arc<dyn MessageIdGenerator>) -> Self {
        Self { generator }
    }
}

impl Default for MessageIdMiddleware {
    fn default() -> Self {
        Self::new(Arc::new(UuidV7Generator))
    }
}

#[async_trait]
impl Middleware for MessageIdMiddleware {
    async fn handle(&self, envelope: Envelope, next: Next) -> Result<Envelope> {
        let envelope = if envelope.has::<MessageIdStamp>() {
            envelope
        } else {
            envelope.with(MessageIdStamp::new(self.generator.next_id()))
        };
        next.run(envelope).await
    }
}
