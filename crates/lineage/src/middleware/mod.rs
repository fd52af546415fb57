//! Middleware pipeline.
//!
//! A [`MessageBus`] is a fixed, ordered chain of [`Middleware`] stages. Each
//! stage receives the envelope plus a [`Next`] handle to the rest of the
//! chain and may:
//!
//! - stamp the envelope before calling `next`,
//! - inspect or stamp the returned envelope,
//! - short-circuit by returning without calling `next`,
//! - let an error from `next` propagate after cleaning up.
//!
//! Running past the last stage returns the envelope unchanged.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::Instrument;

use crate::envelope::Envelope;
use crate::error::Result;

pub mod blame;
pub mod defer;
pub mod handle;
pub mod logging;
pub mod message_id;
pub mod metrics;
pub mod send;
pub mod status;

/// One stage of the pipeline.
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    async fn handle(&self, envelope: Envelope, next: Next) -> Result<Envelope>;
}

type Chain = Arc<[Arc<dyn Middleware>]>;

/// The remainder of the chain after the current stage.
///
/// `Next` owns a reference to the chain, so a stage may keep it and resume
/// the chain later (see
/// [`DispatchAfterCurrentBusMiddleware`](defer::DispatchAfterCurrentBusMiddleware)).
#[derive(Clone)]
pub struct Next {
    chain: Chain,
    index: usize,
}

impl Next {
    fn start(chain: Chain) -> Self {
        Self { chain, index: 0 }
    }

    /// A `Next` with no stages left, for driving a single stage in tests.
    pub fn end() -> Self {
        Self::start(Arc::from(Vec::new()))
    }

    /// Run the remaining stages.
    pub async fn run(self, envelope: Envelope) -> Result<Envelope> {
        let Some(stage) = self.chain.get(self.index).cloned() else {
            return Ok(envelope);
        };
        let next = Next {
            chain: self.chain,
            index: self.index + 1,
        };
        stage.handle(envelope, next).await
    }

    /// Stages left to run, including the one `run` would call first.
    pub fn remaining(&self) -> usize {
        self.chain.len().saturating_sub(self.index)
    }
}

impl fmt::Debug for Next {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next")
            .field("index", &self.index)
            .field("remaining", &self.remaining())
            .finish()
    }
}

/// A named, immutable middleware chain.
#[derive(Clone)]
pub struct MessageBus {
    name: Arc<str>,
    chain: Chain,
}

impl MessageBus {
    pub fn new(name: impl Into<String>, stages: Vec<Arc<dyn Middleware>>) -> Self {
        let name: String = name.into();
        Self {
            name: Arc::from(name),
            chain: Arc::from(stages),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    /// Run an envelope through every stage.
    pub async fn dispatch(&self, envelope: Envelope) -> Result<Envelope> {
        let span = tracing::debug_span!(
            "dispatch",
            bus = %self.name,
            message_name = envelope.message_name(),
            message_type = %envelope.message_type(),
        );
        Next::start(Arc::clone(&self.chain))
            .run(envelope)
            .instrument(span)
            .await
    }
}

impl fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBus")
            .field("name", &self.name)
            .field("stages", &self.chain.len())
            .finish()
    }
}
