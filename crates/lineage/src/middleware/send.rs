//! Routing messages to transports.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::envelope::Envelope;
use crate::error::{BusError, Result};
use crate::message::MessageType;
use crate::middleware::{Middleware, Next};
use crate::stamp::{ReceivedStamp, SentStamp};

/// Hands envelopes to a transport for processing elsewhere.
///
/// Implementations receive the envelope as it left the pipeline and are
/// expected to strip process-local stamps (see
/// [`Envelope::for_transport`]) before serializing it.
#[async_trait]
pub trait Sender: Send + Sync {
    fn name(&self) -> &str;

    /// Optional alias recorded on the `SentStamp`, usually the queue name.
    fn alias(&self) -> Option<&str> {
        None
    }

    async fn send(&self, envelope: &Envelope) -> anyhow::Result<()>;
}

/// Sends fresh envelopes to every sender routed for their message type and
/// stops the chain; the message is processed when the transport delivers it
/// back with a `ReceivedStamp`.
///
/// Received envelopes and message types without a route continue down the
/// chain to be handled locally.
#[derive(Clone, Default)]
pub struct SendMessageMiddleware {
    routes: HashMap<MessageType, Vec<Arc<dyn Sender>>>,
}

impl SendMessageMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, message_type: MessageType, sender: Arc<dyn Sender>) -> Self {
        self.routes.entry(message_type).or_default().push(sender);
        self
    }

    /// Route every message type to `sender`.
    pub fn route_all(self, sender: Arc<dyn Sender>) -> Self {
        [MessageType::Command, MessageType::Query, MessageType::DomainEvent]
            .into_iter()
            .fold(self, |middleware, message_type| {
                middleware.route(message_type, Arc::clone(&sender))
            })
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    fn senders_for(&self, message_type: MessageType) -> &[Arc<dyn Sender>] {
        self.routes
            .get(&message_type)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

impl fmt::Debug for SendMessageMiddleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut routes: Vec<(MessageType, Vec<&str>)> = self
            .routes
            .iter()
            .map(|(kind, senders)| (*kind, senders.iter().map(|s| s.name()).collect()))
            .collect();
        routes.sort_by_key(|(kind, _)| kind.as_str());
        f.debug_struct("SendMessageMiddleware")
            .field("routes", &routes)
            .finish()
    }
}

#[async_trait]
impl Middleware for SendMessageMiddleware {
    async fn handle(&self, envelope: Envelope, next: Next) -> Result<Envelope> {
        if envelope.has::<ReceivedStamp>() {
            return next.run(envelope).await;
        }

        let senders = self.senders_for(envelope.message_type());
        if senders.is_empty() {
            return next.run(envelope).await;
        }

        let mut envelope = envelope;
        for sender in senders {
            sender
                .send(&envelope)
                .await
                .map_err(|source| BusError::Transport {
                    sender: sender.name().to_string(),
                    source,
                })?;

            tracing::debug!(
                sender = sender.name(),
                message_id = ?envelope.message_id(),
                "message sent"
            );
            envelope = envelope.with(SentStamp::new(sender.name(), sender.alias().map(str::to_owned)));
        }

        Ok(envelope)
    }
}
