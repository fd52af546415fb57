//! Causation tracking ("blame").
//!
//! Stamps every message with the chain of messages whose processing caused
//! it. The active chain lives in [`causation`](crate::causation); for each
//! message this stage:
//!
//! 1. seeds an empty chain from the `CausedByStamp`s already on the envelope
//!    (a message coming back from a transport restores its ancestry),
//! 2. appends every chain entry the envelope does not carry yet,
//! 3. extends the chain with the message's own `type:id`,
//! 4. runs the rest of the pipeline under the extended chain.
//!
//! Anything dispatched from a handler while step 4 is running inherits the
//! whole chain. Once step 4 returns the previous chain is back in place, so a
//! sibling dispatched afterwards does not inherit the message it followed.
//!
//! The stage must run after the message ID has been attached.

use async_trait::async_trait;

use crate::causation::{self, CausationChain};
use crate::envelope::Envelope;
use crate::error::Result;
use crate::middleware::{Middleware, Next};
use crate::stamp::CausedByStamp;

#[derive(Debug, Clone, Copy, Default)]
pub struct BlameMiddleware;

impl BlameMiddleware {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Middleware for BlameMiddleware {
    async fn handle(&self, envelope: Envelope, next: Next) -> Result<Envelope> {
        let mut chain = causation::current();
        if chain.is_empty() {
            chain = CausationChain::from_stamps(envelope.all::<CausedByStamp>());
        }

        let envelope = attach_missing_causes(envelope, &chain);

        let own = CausedByStamp::new(envelope.message_type(), envelope.require_message_id()?);
        chain.push_unique(own);

        causation::scope(chain, next.run(envelope)).await
    }
}

fn attach_missing_causes(envelope: Envelope, chain: &CausationChain) -> Envelope {
    let missing: Vec<CausedByStamp> = chain
        .iter()
        .filter(|cause| !envelope.all::<CausedByStamp>().any(|present| present == *cause))
        .cloned()
        .collect();

    missing
        .into_iter()
        .fold(envelope, |envelope, cause| envelope.with(cause))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BusError;
    use crate::stamp::MessageIdStamp;
    use crate::MessageType;

    #[derive(Debug)]
    struct Audit;
    crate::impl_command!(Audit);

    fn command(id: &str) -> Envelope {
        Envelope::new(Audit).with(MessageIdStamp::new(id))
    }

    fn causes(envelope: &Envelope) -> Vec<String> {
        envelope.all::<CausedByStamp>().map(ToString::to_string).collect()
    }

    #[tokio::test]
    async fn top_level_message_is_left_without_causes() {
        let envelope = BlameMiddleware.handle(command("a"), Next::end()).await.unwrap();
        assert!(causes(&envelope).is_empty());
        assert!(causation::current().is_empty());
    }

    #[tokio::test]
    async fn active_chain_is_attached_to_nested_message() {
        let outer = CausationChain::from_stamps(&[
            CausedByStamp::new(MessageType::Command, "root"),
            CausedByStamp::new(MessageType::DomainEvent, "evt"),
        ]);

        let envelope = causation::scope(outer, BlameMiddleware.handle(command("child"), Next::end()))
            .await
            .unwrap();

        assert_eq!(causes(&envelope), vec!["COMMAND:root", "DOMAIN_EVENT:evt"]);
    }

    #[tokio::test]
    async fn existing_causes_are_not_duplicated() {
        let envelope = command("child").with(CausedByStamp::new(MessageType::Command, "root"));
        let outer = CausationChain::from_stamps(&[CausedByStamp::new(MessageType::Command, "root")]);

        let envelope = causation::scope(outer, BlameMiddleware.handle(envelope, Next::end()))
            .await
            .unwrap();

        assert_eq!(causes(&envelope), vec!["COMMAND:root"]);
    }

    #[tokio::test]
    async fn missing_id_fails_before_running_the_chain() {
        let err = BlameMiddleware
            .handle(Envelope::new(Audit), Next::end())
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::MissingMessageId { .. }));
    }
}
