//! Deferred dispatch.
//!
//! A message carrying [`DispatchAfterCurrentBusStamp`] that is dispatched
//! while the same bus is already processing a message is not run right away.
//! It is queued and run once the outermost dispatch on that bus has returned
//! successfully, so a handler never observes the partial side effects of a
//! sibling that is still running.
//!
//! Queues are scoped like the causation chain: per bus instance, per task.
//! The outermost dispatch on a bus installs an empty queue for the duration
//! of its call; nested dispatches in the same task find it and enqueue.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use crate::causation::{self, CausationChain};
use crate::envelope::Envelope;
use crate::error::{BusError, Result};
use crate::middleware::{Middleware, Next};
use crate::stamp::DispatchAfterCurrentBusStamp;

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
    static ACTIVE: ActiveQueues;
}

type ActiveQueues = HashMap<u64, Queue>;

#[derive(Clone, Default)]
struct Queue {
    items: Arc<Mutex<VecDeque<Queued>>>,
}

impl Queue {
    fn push(&self, item: Queued) {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(item);
    }

    fn pop(&self) -> Option<Queued> {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    fn clear(&self) {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// A held-back message and everything needed to resume it.
struct Queued {
    envelope: Envelope,
    next: Next,
    causes: CausationChain,
}

#[derive(Debug)]
pub struct DispatchAfterCurrentBusMiddleware {
    instance: u64,
}

impl DispatchAfterCurrentBusMiddleware {
    pub fn new() -> Self {
        Self {
            instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
        }
    }

    fn active_queue(&self) -> Option<Queue> {
        ACTIVE
            .try_with(|active| active.get(&self.instance).cloned())
            .ok()
            .flatten()
    }

    async fn run_root(&self, envelope: Envelope, next: Next) -> Result<Envelope> {
        let queue = Queue::default();
        let mut active = ACTIVE.try_with(Clone::clone).unwrap_or_default();
        active.insert(self.instance, queue.clone());

        ACTIVE.scope(active, async move {
            let envelope = match next.run(envelope).await {
                Ok(envelope) => envelope,
                Err(error) => {
                    queue.clear();
                    return Err(error);
                }
            };

            let mut failures = Vec::new();
            while let Some(Queued {
                envelope,
                next,
                causes,
            }) = queue.pop()
            {
                if let Err(error) = causation::scope(causes, next.run(envelope)).await {
                    tracing::warn!(error = %error, "deferred message failed");
                    failures.push(error);
                }
            }

            if failures.is_empty() {
                Ok(envelope)
            } else {
                Err(BusError::DelayedHandling { failures })
            }
        })
        .await
    }
}

impl Default for DispatchAfterCurrentBusMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Middleware for DispatchAfterCurrentBusMiddleware {
    async fn handle(&self, envelope: Envelope, next: Next) -> Result<Envelope> {
        let Some(queue) = self.active_queue() else {
            return self.run_root(envelope, next).await;
        };

        if !envelope.has::<DispatchAfterCurrentBusStamp>() {
            return next.run(envelope).await;
        }

        tracing::debug!(
            message_id = ?envelope.message_id(),
            message_name = envelope.message_name(),
            "deferring message until the current dispatch completes"
        );
        queue.push(Queued {
            envelope: envelope.clone(),
            next,
            causes: causation::current(),
        });
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::MessageBus;
    use crate::stamp::{CausedByStamp, HandledStamp, MessageIdStamp};
    use crate::MessageType;
    use std::sync::OnceLock;

    #[derive(Debug, Clone)]
    struct Step {
        name: &'static str,
        defer: bool,
        fail: bool,
        children: Vec<Step>,
    }
    crate::impl_command!(Step);

    fn step(name: &'static str) -> Step {
        Step {
            name,
            defer: true,
            fail: false,
            children: Vec::new(),
        }
    }

    impl Step {
        fn immediate(mut self) -> Self {
            self.defer = false;
            self
        }

        fn failing(mut self) -> Self {
            self.fail = true;
            self
        }

        fn then(mut self, child: Step) -> Self {
            self.children.push(child);
            self
        }
    }

    /// Terminal stage: logs entry and exit, dispatching children in between.
    struct Run {
        bus: Arc<OnceLock<MessageBus>>,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Middleware for Run {
        async fn handle(&self, envelope: Envelope, _next: Next) -> Result<Envelope> {
            let step = envelope.downcast::<Step>().unwrap();
            let causes: Vec<String> = causation::current()
                .iter()
                .map(|cause| cause.message_id().to_string())
                .collect();
            self.log
                .lock()
                .unwrap()
                .push(format!("start {} {:?}", step.name, causes));

            for child in &step.children {
                let mut child_envelope = Envelope::new(child.clone());
                if child.defer {
                    child_envelope = child_envelope.with(DispatchAfterCurrentBusStamp);
                }
                let bus = self.bus.get().unwrap();
                bus.dispatch(child_envelope).await?;
            }

            self.log.lock().unwrap().push(format!("end {}", step.name));
            if step.fail {
                return Err(BusError::Handler {
                    handler: "run".to_string(),
                    source: anyhow::anyhow!("{} failed", step.name),
                });
            }
            Ok(envelope.with(HandledStamp::new("run", serde_json::Value::Null)))
        }
    }

    /// Pushes the step name as the active cause, standing in for the
    /// causation stage.
    struct Cause;

    #[async_trait]
    impl Middleware for Cause {
        async fn handle(&self, envelope: Envelope, next: Next) -> Result<Envelope> {
            let name = envelope.downcast::<Step>().unwrap().name;
            let mut chain = causation::current();
            chain.push_unique(CausedByStamp::new(MessageType::Command, name));
            causation::scope(chain, next.run(envelope)).await
        }
    }

    fn harness() -> (MessageBus, Arc<Mutex<Vec<String>>>) {
        let slot = Arc::new(OnceLock::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let bus = MessageBus::new(
            "defer",
            vec![
                Arc::new(Cause),
                Arc::new(DispatchAfterCurrentBusMiddleware::new()),
                Arc::new(Run {
                    bus: Arc::clone(&slot),
                    log: Arc::clone(&log),
                }),
            ],
        );
        let _ = slot.set(bus.clone());
        (bus, log)
    }

    fn entries(log: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn outermost_dispatch_runs_immediately() {
        let (bus, log) = harness();
        let envelope = bus
            .dispatch(Envelope::new(step("a")).with(DispatchAfterCurrentBusStamp))
            .await
            .unwrap();

        assert!(envelope.has::<HandledStamp>());
        assert_eq!(entries(&log), vec!["start a [\"a\"]", "end a"]);
    }

    #[tokio::test]
    async fn nested_deferred_message_runs_after_the_outer_one() {
        let (bus, log) = harness();
        bus.dispatch(Envelope::new(step("a").then(step("b")).then(step("c"))))
            .await
            .unwrap();

        assert_eq!(
            entries(&log),
            vec![
                "start a [\"a\"]",
                "end a",
                "start b [\"a\", \"b\"]",
                "end b",
                "start c [\"a\", \"c\"]",
                "end c",
            ]
        );
    }

    #[tokio::test]
    async fn nested_message_without_marker_runs_inline() {
        let (bus, log) = harness();
        bus.dispatch(Envelope::new(step("a").then(step("b").immediate())))
            .await
            .unwrap();

        assert_eq!(
            entries(&log),
            vec!["start a [\"a\"]", "start b [\"a\", \"b\"]", "end b", "end a"]
        );
    }

    #[tokio::test]
    async fn messages_queued_during_the_flush_run_in_the_same_flush() {
        let (bus, log) = harness();
        bus.dispatch(Envelope::new(
            step("a").then(step("b").then(step("d"))).then(step("c")),
        ))
        .await
        .unwrap();

        let order: Vec<String> = entries(&log)
            .into_iter()
            .filter(|entry| entry.starts_with("start"))
            .collect();
        assert_eq!(
            order,
            vec![
                "start a [\"a\"]",
                "start b [\"a\", \"b\"]",
                "start c [\"a\", \"c\"]",
                "start d [\"a\", \"b\", \"d\"]",
            ]
        );
    }

    #[tokio::test]
    async fn failed_outer_dispatch_discards_the_queue() {
        let (bus, log) = harness();
        let err = bus
            .dispatch(Envelope::new(step("a").then(step("b")).failing()))
            .await
            .unwrap_err();

        assert!(matches!(err, BusError::Handler { .. }));
        assert_eq!(entries(&log), vec!["start a [\"a\"]", "end a"]);
    }

    #[tokio::test]
    async fn deferred_failures_are_collected() {
        let (bus, log) = harness();
        let err = bus
            .dispatch(Envelope::new(
                step("a").then(step("b").failing()).then(step("c")),
            ))
            .await
            .unwrap_err();

        match err {
            BusError::DelayedHandling { failures } => {
                assert_eq!(failures.len(), 1);
                assert!(failures[0].to_string().contains("b failed"));
            }
            other => panic!("expected DelayedHandling, got {other}"),
        }
        assert!(entries(&log).contains(&"end c".to_string()));
    }

    #[tokio::test]
    async fn deferred_envelope_is_returned_unhandled() {
        let slot = Arc::new(Mutex::new(None));
        let seen = Arc::clone(&slot);

        // Two buses sharing one deferral stage: the inner dispatch is nested
        // inside the outer one and gets queued.
        struct Probe {
            bus: MessageBus,
            seen: Arc<Mutex<Option<Envelope>>>,
        }

        #[async_trait]
        impl Middleware for Probe {
            async fn handle(&self, envelope: Envelope, next: Next) -> Result<Envelope> {
                let nested = Envelope::new(step("inner"))
                    .with(MessageIdStamp::new("inner-1"))
                    .with(DispatchAfterCurrentBusStamp);
                let returned = self.bus.dispatch(nested).await?;
                *self.seen.lock().unwrap() = Some(returned);
                next.run(envelope).await
            }
        }

        let defer = Arc::new(DispatchAfterCurrentBusMiddleware::new());
        let inner_bus = MessageBus::new("inner", vec![defer.clone(), Arc::new(Cause)]);
        let outer = MessageBus::new(
            "outer",
            vec![
                defer,
                Arc::new(Probe {
                    bus: inner_bus,
                    seen,
                }),
            ],
        );
        outer.dispatch(Envelope::new(step("outer"))).await.unwrap();

        let returned = slot.lock().unwrap().take().unwrap();
        assert_eq!(returned.message_id(), Some("inner-1"));
        assert!(!returned.has::<HandledStamp>());
    }

    #[tokio::test]
    async fn separate_tasks_have_separate_queues() {
        let (bus, log) = harness();
        let a = tokio::spawn({
            let bus = bus.clone();
            async move { bus.dispatch(Envelope::new(step("a"))).await }
        });
        let b = tokio::spawn({
            let bus = bus.clone();
            async move { bus.dispatch(Envelope::new(step("b"))).await }
        });

        assert!(a.await.unwrap().unwrap().has::<HandledStamp>());
        assert!(b.await.unwrap().unwrap().has::<HandledStamp>());
        assert_eq!(entries(&log).len(), 4);
    }
}
