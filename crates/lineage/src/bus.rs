//! Typed entry points over a [`MessageBus`].
//!
//! Each façade attaches a fresh message ID, dispatches and hands back the ID
//! wrapped in a kind-specific type. Command and domain event dispatches are
//! marked with [`DispatchAfterCurrentBusStamp`], so when they are issued from
//! a handler running on the same bus they wait for that handler's message to
//! finish. Queries run to completion and return their handler's result.

use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::envelope::Envelope;
use crate::error::{BusError, Result};
use crate::id::{CommandId, DomainEventId, MessageIdGenerator, MessageIdStamper, QueryId};
use crate::message::{Command, DomainEvent, Message, Query};
use crate::middleware::MessageBus;
use crate::stamp::{DispatchAfterCurrentBusStamp, HandledStamp, Stamp};

/// Dispatch shared by the façades: attach the ID, log around the pipeline.
#[derive(Debug, Clone)]
struct Dispatcher {
    bus: MessageBus,
    stamper: MessageIdStamper,
}

impl Dispatcher {
    fn new(bus: MessageBus, generator: Arc<dyn MessageIdGenerator>) -> Self {
        Self {
            bus,
            stamper: MessageIdStamper::new(generator),
        }
    }

    async fn dispatch<M: Message>(
        &self,
        message: M,
        stamps: Vec<Stamp>,
        deferred: bool,
    ) -> Result<(String, Envelope)> {
        let mut stamps = self.stamper.attach(stamps)?;
        if deferred {
            stamps.push(DispatchAfterCurrentBusStamp.into());
        }

        let envelope = Envelope::with_stamps(message, stamps);
        let message_id = envelope.require_message_id()?.to_owned();
        let message_type = envelope.message_type();
        let message_name = envelope.message_name();

        tracing::info!(
            message_id = %message_id,
            message_name,
            bus = self.bus.name(),
            "dispatching {}",
            message_type,
        );

        match self.bus.dispatch(envelope).await {
            Ok(envelope) => {
                tracing::info!(
                    message_id = %message_id,
                    message_name,
                    "{} dispatched successfully",
                    message_type,
                );
                Ok((message_id, envelope))
            }
            Err(error) => {
                tracing::error!(
                    message_id = %message_id,
                    message_name,
                    error = %error,
                    "failed to dispatch {}",
                    message_type,
                );
                Err(error)
            }
        }
    }
}

// ============================================================================
// Command bus
// ============================================================================

#[derive(Debug, Clone)]
pub struct CommandBus {
    inner: Dispatcher,
}

impl CommandBus {
    pub fn new(bus: MessageBus, generator: Arc<dyn MessageIdGenerator>) -> Self {
        Self {
            inner: Dispatcher::new(bus, generator),
        }
    }

    /// Dispatch a command. `stamps` must not contain a `MessageIdStamp`.
    pub async fn dispatch<C: Command>(&self, command: C, stamps: Vec<Stamp>) -> Result<CommandId> {
        let (id, _) = self.inner.dispatch(command, stamps, true).await?;
        Ok(CommandId::new(id))
    }

    /// The underlying pipeline, for redelivering envelopes from a transport.
    pub fn message_bus(&self) -> &MessageBus {
        &self.inner.bus
    }
}

// ============================================================================
// Domain event bus
// ============================================================================

#[derive(Debug, Clone)]
pub struct DomainEventBus {
    inner: Dispatcher,
}

impl DomainEventBus {
    pub fn new(bus: MessageBus, generator: Arc<dyn MessageIdGenerator>) -> Self {
        Self {
            inner: Dispatcher::new(bus, generator),
        }
    }

    pub async fn dispatch<E: DomainEvent>(&self, event: E, stamps: Vec<Stamp>) -> Result<DomainEventId> {
        let (id, _) = self.inner.dispatch(event, stamps, true).await?;
        Ok(DomainEventId::new(id))
    }

    pub fn message_bus(&self) -> &MessageBus {
        &self.inner.bus
    }
}

// ============================================================================
// Query bus
// ============================================================================

#[derive(Debug, Clone)]
pub struct QueryBus {
    inner: Dispatcher,
}

impl QueryBus {
    pub fn new(bus: MessageBus, generator: Arc<dyn MessageIdGenerator>) -> Self {
        Self {
            inner: Dispatcher::new(bus, generator),
        }
    }

    /// Run a query and decode its single handler's result.
    pub async fn dispatch<Q: Query>(&self, query: Q, stamps: Vec<Stamp>) -> Result<(QueryId, Q::Output)> {
        let (id, envelope) = self.inner.dispatch(query, stamps, false).await?;
        let output = single_result(&envelope)?;
        Ok((QueryId::new(id), output))
    }

    /// Shorthand for [`dispatch`](Self::dispatch) without extra stamps,
    /// discarding the ID.
    pub async fn ask<Q: Query>(&self, query: Q) -> Result<Q::Output> {
        let (_, output) = self.dispatch(query, Vec::new()).await?;
        Ok(output)
    }

    pub fn message_bus(&self) -> &MessageBus {
        &self.inner.bus
    }
}

fn single_result<T: DeserializeOwned>(envelope: &Envelope) -> Result<T> {
    let mut handled = envelope.all::<HandledStamp>();
    match (handled.next(), handled.next()) {
        (Some(stamp), None) => Ok(serde_json::from_value(stamp.result.clone())?),
        _ => Err(BusError::HandledCount {
            message: envelope.message_name(),
            count: envelope.all::<HandledStamp>().count(),
        }),
    }
}
