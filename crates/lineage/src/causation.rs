//! Execution-scoped causation chain.
//!
//! The chain answers "which messages are being processed, transitively, by
//! the code running right now". It lives in a tokio task-local, so every
//! task sees its own chain and concurrent dispatches never mix.
//!
//! The value is never mutated in place. [`scope`] runs a future with a new
//! chain installed and puts the previous one back when the future finishes,
//! fails, panics or is dropped.

use std::future::Future;

use crate::stamp::CausedByStamp;

tokio::task_local! {
    static CURRENT: CausationChain;
}

/// Ordered ancestors, oldest first, without duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CausationChain {
    causes: Vec<CausedByStamp>,
}

impl CausationChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a chain from stamps, dropping repeats.
    pub fn from_stamps<'a>(stamps: impl IntoIterator<Item = &'a CausedByStamp>) -> Self {
        stamps.into_iter().cloned().fold(Self::new(), |mut chain, stamp| {
            chain.push_unique(stamp);
            chain
        })
    }

    pub fn is_empty(&self) -> bool {
        self.causes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.causes.len()
    }

    pub fn contains(&self, stamp: &CausedByStamp) -> bool {
        self.causes.contains(stamp)
    }

    /// Append `stamp` unless an equal stamp is already present.
    /// Returns whether it was added.
    pub fn push_unique(&mut self, stamp: CausedByStamp) -> bool {
        if self.contains(&stamp) {
            return false;
        }
        self.causes.push(stamp);
        true
    }

    pub fn iter(&self) -> std::slice::Iter<'_, CausedByStamp> {
        self.causes.iter()
    }

    pub fn message_ids(&self) -> Vec<&str> {
        self.causes.iter().map(CausedByStamp::message_id).collect()
    }
}

impl<'a> IntoIterator for &'a CausationChain {
    type Item = &'a CausedByStamp;
    type IntoIter = std::slice::Iter<'a, CausedByStamp>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// The chain active in the current task, empty outside any dispatch.
pub fn current() -> CausationChain {
    CURRENT.try_with(Clone::clone).unwrap_or_default()
}

/// Run `future` with `chain` as the active chain.
pub async fn scope<F: Future>(chain: CausationChain, future: F) -> F::Output {
    CURRENT.scope(chain, future).await
}
