//! # Lineage
//!
//! A command/query/event message bus that knows who caused what.
//!
//! Messages travel through an ordered chain of middleware inside an
//! [`Envelope`] that collects typed [`Stamp`]s on the way. The standard chain
//! gives every message an ID, records the chain of messages whose processing
//! caused it, and reports lifecycle statuses plus a dependency graph to a
//! [`StatusRecorder`].
//!
//! ## Core Concepts
//!
//! - **Envelope**: a message plus its stamps. Stamps are only appended.
//! - **Middleware**: one pipeline stage. It may stamp the envelope, call the
//!   rest of the chain, stop early, or clean up after an error.
//! - **Causation**: while a message is being processed, anything dispatched
//!   from its handler (on any bus, in the same task) carries a `CausedByStamp`
//!   for it and for all of its ancestors, oldest first.
//! - **Deferral**: commands and domain events dispatched from inside a
//!   handler on the same bus wait until the outer message has finished.
//! - **Recording**: `dispatched`, then `sent` or `handled`, per message, and
//!   one dependency edge per cause.
//!
//! ## Causation
//!
//! ```text
//! CommandBus.dispatch(PlaceOrder)            id cmd-1, caused by []
//!   └─ handler: events.dispatch(OrderPlaced) id evt-1, caused by [COMMAND:cmd-1]
//!        └─ handler: queries.ask(StockLevel) id qry-1, caused by [COMMAND:cmd-1, DOMAIN_EVENT:evt-1]
//! ```
//!
//! The chain is held in a tokio task-local and is restored when a message's
//! processing returns, fails or is cancelled, so siblings never inherit each
//! other. Causation stamps survive a transport hop: when a received envelope
//! is dispatched again, its stamps seed the chain.
//!
//! ## Example
//!
//! ```ignore
//! use lineage::{BusBuilder, HandlerRegistry, MessageType};
//!
//! #[derive(Debug)]
//! struct PlaceOrder { sku: String, quantity: u32 }
//! lineage::impl_command!(PlaceOrder);
//!
//! #[derive(Debug)]
//! struct StockLevel { sku: String }
//! lineage::impl_query!(StockLevel => u32);
//!
//! let queries = BusBuilder::new("queries")
//!     .recorder(recorder.clone())
//!     .handlers(HandlerRegistry::new().register_fn("stock", |q: Arc<StockLevel>| async move {
//!         Ok(warehouse.level(&q.sku).await?)
//!     }))
//!     .build_query_bus();
//!
//! let commands = BusBuilder::new("commands")
//!     .recorder(recorder)
//!     .handlers(HandlerRegistry::new().register_fn("place", move |c: Arc<PlaceOrder>| {
//!         let queries = queries.clone();
//!         async move {
//!             let level = queries.ask(StockLevel { sku: c.sku.clone() }).await?;
//!             anyhow::ensure!(level >= c.quantity, "out of stock");
//!             Ok(())
//!         }
//!     }))
//!     .build_command_bus();
//!
//! let id = commands.dispatch(PlaceOrder { sku: "A-1".into(), quantity: 2 }, vec![]).await?;
//! ```
//!
//! ## What This Is Not
//!
//! Lineage does not ship a transport, a serialization format, or retry
//! policy. Senders hand envelopes to whatever queue you run; a worker feeds
//! received envelopes back through [`MessageBus::dispatch`].

// Core modules
mod builder;
mod bus;
mod envelope;
mod error;
mod id;
mod message;
mod message_macro;
mod stamp;

// Task-scoped causation chain
pub mod causation;

// Pipeline stages
pub mod middleware;

// Status recording (null, logging and fan-out recorders)
pub mod recorder;

// Testing utilities are in the separate lineage-testing crate


// Re-export message types
pub use message::{downcast_message, AsAny, Command, DomainEvent, Message, MessageType, Query};

// Re-export stamp and envelope types
pub use envelope::Envelope;
pub use stamp::{
    CausedByStamp, DispatchAfterCurrentBusStamp, HandledStamp, MessageIdStamp, ReceivedStamp,
    SentStamp, Stamp, StampKind, StampType,
};

// Re-export ID types
pub use id::{
    CommandId, DomainEventId, MessageIdGenerator, MessageIdStamper, QueryId, UuidV7Generator,
};

// Re-export error types
pub use error::{BusError, Result};

// Re-export pipeline types
pub use middleware::blame::BlameMiddleware;
pub use middleware::defer::DispatchAfterCurrentBusMiddleware;
pub use middleware::handle::{HandleMessageMiddleware, Handler, HandlerRegistry};
pub use middleware::logging::LoggingMiddleware;
pub use middleware::message_id::MessageIdMiddleware;
pub use middleware::metrics::{Metric, MetricsExporter, MetricsMiddleware};
pub use middleware::send::{SendMessageMiddleware, Sender};
pub use middleware::status::StatusRecorderMiddleware;
pub use middleware::{MessageBus, Middleware, Next};

// Re-export recorder types
pub use recorder::{
    Dependency, FanOutStatusRecorder, LoggingStatusRecorder, MessageStatus, NullStatusRecorder,
    StatusRecord, StatusRecorder,
};

// Re-export bus types
pub use builder::BusBuilder;
pub use bus::{CommandBus, DomainEventBus, QueryBus};

// Re-export commonly used external types
pub use async_trait::async_trait;
