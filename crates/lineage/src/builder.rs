//! Assembling buses from the standard stages.
//!
//! ```ignore
//! let recorder = Arc::new(PgStatusRecorder::new(pool));
//!
//! let commands = BusBuilder::new("commands")
//!     .recorder(recorder.clone())
//!     .sender(MessageType::Command, outbox.clone())
//!     .handlers(command_handlers)
//!     .build_command_bus();
//!
//! let queries = BusBuilder::new("queries")
//!     .recorder(recorder)
//!     .handlers(query_handlers)
//!     .build_query_bus();
//! ```
//!
//! Stages run in this order, optional ones only when configured:
//!
//! 1. message ID
//! 2. logging (on by default)
//! 3. metrics (when an exporter is set)
//! 4. causation
//! 5. deferral (command and domain event buses)
//! 6. status recording (when a recorder is set)
//! 7. custom middleware, in the order added
//! 8. sending (when a sender is routed)
//! 9. handling

use std::fmt;
use std::sync::Arc;

use crate::bus::{CommandBus, DomainEventBus, QueryBus};
use crate::id::{MessageIdGenerator, UuidV7Generator};
use crate::message::MessageType;
use crate::middleware::blame::BlameMiddleware;
use crate::middleware::defer::DispatchAfterCurrentBusMiddleware;
use crate::middleware::handle::{HandleMessageMiddleware, HandlerRegistry};
use crate::middleware::logging::LoggingMiddleware;
use crate::middleware::message_id::MessageIdMiddleware;
use crate::middleware::metrics::{MetricsExporter, MetricsMiddleware};
use crate::middleware::send::{SendMessageMiddleware, Sender};
use crate::middleware::status::StatusRecorderMiddleware;
use crate::middleware::{MessageBus, Middleware};
use crate::recorder::StatusRecorder;

pub struct BusBuilder {
    name: String,
    generator: Arc<dyn MessageIdGenerator>,
    recorder: Option<Arc<dyn StatusRecorder>>,
    record_failures: bool,
    metrics: MetricsMiddleware,
    send: SendMessageMiddleware,
    handlers: HandlerRegistry,
    custom: Vec<Arc<dyn Middleware>>,
    logging: bool,
    allow_no_handlers: bool,
}

impl BusBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            generator: Arc::new(UuidV7Generator),
            recorder: None,
            record_failures: false,
            metrics: MetricsMiddleware::default(),
            send: SendMessageMiddleware::new(),
            handlers: HandlerRegistry::new(),
            custom: Vec::new(),
            logging: true,
            allow_no_handlers: false,
        }
    }

    /// Replace the UUIDv7 generator, for example with a deterministic one in
    /// tests.
    pub fn id_generator(mut self, generator: Arc<dyn MessageIdGenerator>) -> Self {
        self.generator = generator;
        self
    }

    pub fn recorder(mut self, recorder: Arc<dyn StatusRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Record `failed` for messages whose processing returns an error.
    pub fn record_failures(mut self, enabled: bool) -> Self {
        self.record_failures = enabled;
        self
    }

    pub fn metrics_exporter(mut self, exporter: Arc<dyn MetricsExporter>) -> Self {
        self.metrics = self.metrics.with_exporter(exporter);
        self
    }

    /// Send messages of `route` to `sender` instead of handling them here.
    pub fn sender(mut self, route: MessageType, sender: Arc<dyn Sender>) -> Self {
        self.send = self.send.route(route, sender);
        self
    }

    /// Add handlers; may be called repeatedly.
    pub fn handlers(mut self, registry: HandlerRegistry) -> Self {
        self.handlers = self.handlers.merge(registry);
        self
    }

    /// Add a stage between status recording and sending.
    pub fn middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.custom.push(middleware);
        self
    }

    pub fn logging(mut self, enabled: bool) -> Self {
        self.logging = enabled;
        self
    }

    pub fn allow_no_handlers(mut self, allow: bool) -> Self {
        self.allow_no_handlers = allow;
        self
    }

    pub fn build_command_bus(self) -> CommandBus {
        let generator = Arc::clone(&self.generator);
        CommandBus::new(self.assemble(true), generator)
    }

    pub fn build_query_bus(self) -> QueryBus {
        let generator = Arc::clone(&self.generator);
        QueryBus::new(self.assemble(false), generator)
    }

    /// Domain event buses accept events nobody listens to.
    pub fn build_event_bus(mut self) -> DomainEventBus {
        self.allow_no_handlers = true;
        let generator = Arc::clone(&self.generator);
        DomainEventBus::new(self.assemble(true), generator)
    }

    /// The raw pipeline without the deferral stage.
    pub fn build(self) -> MessageBus {
        self.assemble(false)
    }

    fn assemble(self, deferred: bool) -> MessageBus {
        let mut stages: Vec<Arc<dyn Middleware>> =
            vec![Arc::new(MessageIdMiddleware::new(Arc::clone(&self.generator)))];

        if self.logging {
            stages.push(Arc::new(LoggingMiddleware::new()));
        }
        if !self.metrics.is_empty() {
            stages.push(Arc::new(self.metrics));
        }
        stages.push(Arc::new(BlameMiddleware::new()));
        if deferred {
            stages.push(Arc::new(DispatchAfterCurrentBusMiddleware::new()));
        }
        if let Some(recorder) = self.recorder {
            stages.push(Arc::new(
                StatusRecorderMiddleware::new(recorder).record_failures(self.record_failures),
            ));
        }
        stages.extend(self.custom);
        if !self.send.is_empty() {
            stages.push(Arc::new(self.send));
        }
        stages.push(Arc::new(
            HandleMessageMiddleware::new(self.handlers).allow_no_handlers(self.allow_no_handlers),
        ));

        tracing::debug!(bus = %self.name, stages = stages.len(), "bus assembled");
        MessageBus::new(self.name, stages)
    }
}

impl fmt::Debug for BusBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusBuilder")
            .field("name", &self.name)
            .field("recorder", &self.recorder.is_some())
            .field("record_failures", &self.record_failures)
            .field("metrics", &self.metrics)
            .field("send", &self.send)
            .field("handlers", &self.handlers)
            .field("custom", &self.custom.len())
            .field("logging", &self.logging)
            .field("allow_no_handlers", &self.allow_no_handlers)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stamp::HandledStamp;
    use crate::Envelope;

    #[derive(Debug)]
    struct Archive;
    crate::impl_command!(Archive);

    #[derive(Debug)]
    struct Archived;
    crate::impl_domain_event!(Archived);

    #[test]
    fn optional_stages_are_left_out() {
        let bus = BusBuilder::new("bare").logging(false).build();
        // message ID, causation, handling
        assert_eq!(bus.len(), 3);
        assert_eq!(bus.name(), "bare");
    }

    #[tokio::test]
    async fn command_bus_handles_through_the_full_chain() {
        let registry = HandlerRegistry::new().register_fn("archive", |_: Arc<Archive>| async { Ok(true) });
        let commands = BusBuilder::new("commands").handlers(registry).build_command_bus();

        let id = commands.dispatch(Archive, Vec::new()).await.unwrap();

        assert!(!id.as_str().is_empty());
        // ID, logging, causation, deferral, handling
        assert_eq!(commands.message_bus().len(), 5);
    }

    #[tokio::test]
    async fn event_bus_accepts_unhandled_events() {
        let events = BusBuilder::new("events").build_event_bus();
        events.dispatch(Archived, Vec::new()).await.unwrap();
    }

    #[tokio::test]
    async fn raw_bus_assigns_ids() {
        let registry = HandlerRegistry::new().register_fn("archive", |_: Arc<Archive>| async { Ok(()) });
        let bus = BusBuilder::new("raw").handlers(registry).build();

        let envelope = bus.dispatch(Envelope::new(Archive)).await.unwrap();

        assert!(envelope.message_id().is_some());
        assert!(envelope.has::<HandledStamp>());
    }
}
