//! Testing utilities for lineage buses.
//!
//! - [`SequenceIdGenerator`]: predictable message IDs (`cmd-1`, `cmd-2`, ...)
//! - [`CapturingMiddleware`]: keeps every envelope that passes through
//! - [`InMemoryTransport`]: a sender plus a receive side, for exercising the
//!   transport hop without a broker
//! - [`InMemoryStatusRecorder`]: keeps statuses and dependency edges
//! - [`InMemoryMetricsExporter`]: keeps exported metrics
//!
//! ```ignore
//! let recorder = Arc::new(InMemoryStatusRecorder::new());
//! let commands = BusBuilder::new("commands")
//!     .id_generator(Arc::new(SequenceIdGenerator::new("cmd")))
//!     .recorder(recorder.clone())
//!     .handlers(handlers)
//!     .build_command_bus();
//!
//! commands.dispatch(Ship { order: 7 }, vec![]).await?;
//! assert_eq!(recorder.statuses_for("cmd-1"), vec![MessageStatus::Dispatched, MessageStatus::Handled]);
//! ```

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use async_trait::async_trait;
use lineage::{
    CausedByStamp, Dependency, Envelope, MessageBus, MessageIdGenerator, MessageStatus, Metric,
    MetricsExporter, Middleware, Next, ReceivedStamp, Sender, StatusRecord, StatusRecorder,
};
use serde_json::json;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// IDs
// ============================================================================

/// Generates `<prefix>-1`, `<prefix>-2`, ...
#[derive(Debug)]
pub struct SequenceIdGenerator {
    prefix: String,
    next: AtomicU64,
}

impl SequenceIdGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: AtomicU64::new(1),
        }
    }
}

impl MessageIdGenerator for SequenceIdGenerator {
    fn next_id(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        format!("{}-{}", self.prefix, n)
    }
}

// ============================================================================
// Capturing middleware
// ============================================================================

/// Records each envelope as it reaches this stage, then continues.
///
/// Place it after the causation stage to observe the stamps a handler's
/// message carries.
#[derive(Debug, Clone, Default)]
pub struct CapturingMiddleware {
    seen: Arc<Mutex<Vec<Envelope>>>,
}

impl CapturingMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn envelopes(&self) -> Vec<Envelope> {
        lock(&self.seen).clone()
    }

    /// The most recent envelope carrying `message_id`.
    pub fn find(&self, message_id: &str) -> Option<Envelope> {
        lock(&self.seen)
            .iter()
            .rev()
            .find(|envelope| envelope.message_id() == Some(message_id))
            .cloned()
    }

    /// Causes of `message_id` in string form (`COMMAND:cmd-1`), oldest first.
    pub fn causes_of(&self, message_id: &str) -> Vec<String> {
        self.find(message_id)
            .map(|envelope| {
                envelope
                    .all::<CausedByStamp>()
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        lock(&self.seen).clear();
    }
}

#[async_trait]
impl Middleware for CapturingMiddleware {
    async fn handle(&self, envelope: Envelope, next: Next) -> lineage::Result<Envelope> {
        lock(&self.seen).push(envelope.clone());
        next.run(envelope).await
    }
}

// ============================================================================
// Transport
// ============================================================================

/// A FIFO queue standing in for a message broker.
///
/// Sending keeps only the stamps that survive a transport hop. Receiving pops
/// the oldest envelope and marks it with a `ReceivedStamp`.
#[derive(Debug, Clone)]
pub struct InMemoryTransport {
    name: String,
    queue: Arc<Mutex<VecDeque<Envelope>>>,
}

impl InMemoryTransport {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue: Arc::default(),
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.queue).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.queue).is_empty()
    }

    /// Envelopes waiting, oldest first.
    pub fn pending(&self) -> Vec<Envelope> {
        lock(&self.queue).iter().cloned().collect()
    }

    pub fn receive(&self) -> Option<Envelope> {
        let envelope = lock(&self.queue).pop_front()?;
        Some(envelope.with(ReceivedStamp::new(self.name.clone())))
    }

    /// Receive one envelope and dispatch it on `bus` from a new task, the
    /// way a worker process would. Returns `None` when the queue is empty.
    pub async fn deliver_next(&self, bus: &MessageBus) -> Result<Option<Envelope>> {
        let Some(envelope) = self.receive() else {
            return Ok(None);
        };
        let bus = bus.clone();
        let handled = tokio::spawn(async move { bus.dispatch(envelope).await }).await??;
        Ok(Some(handled))
    }

    /// Deliver until the queue is empty, including anything sent while
    /// delivering. Returns how many envelopes were delivered.
    pub async fn drain(&self, bus: &MessageBus) -> Result<usize> {
        let mut delivered = 0;
        while self.deliver_next(bus).await?.is_some() {
            delivered += 1;
        }
        Ok(delivered)
    }
}

#[async_trait]
impl Sender for InMemoryTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, envelope: &Envelope) -> Result<()> {
        lock(&self.queue).push_back(envelope.for_transport());
        Ok(())
    }
}

// ============================================================================
// Status recorder
// ============================================================================

/// Keeps every status record and dependency edge in memory.
#[derive(Debug, Default)]
pub struct InMemoryStatusRecorder {
    statuses: Mutex<Vec<StatusRecord>>,
    dependencies: Mutex<Vec<Dependency>>,
}

impl InMemoryStatusRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn statuses(&self) -> Vec<StatusRecord> {
        lock(&self.statuses).clone()
    }

    /// Statuses recorded for one message, in order.
    pub fn statuses_for(&self, message_id: &str) -> Vec<MessageStatus> {
        lock(&self.statuses)
            .iter()
            .filter(|record| record.message_id == message_id)
            .map(|record| record.status)
            .collect()
    }

    pub fn latest_status(&self, message_id: &str) -> Option<MessageStatus> {
        self.statuses_for(message_id).last().copied()
    }

    pub fn dependencies(&self) -> Vec<Dependency> {
        lock(&self.dependencies).clone()
    }

    /// Direct parents of `message_id`, in recording order.
    pub fn parents_of(&self, message_id: &str) -> Vec<String> {
        lock(&self.dependencies)
            .iter()
            .filter(|dependency| dependency.dependent_id == message_id)
            .map(|dependency| dependency.parent_id.clone())
            .collect()
    }

    /// Every message that depends on `parent_id`, directly or transitively,
    /// in breadth-first order.
    pub fn dependents_of(&self, parent_id: &str) -> Vec<String> {
        let dependencies = lock(&self.dependencies);
        let mut found = Vec::new();
        let mut visited = HashSet::from([parent_id.to_string()]);
        let mut frontier = VecDeque::from([parent_id.to_string()]);

        while let Some(parent) = frontier.pop_front() {
            for dependency in dependencies.iter().filter(|d| d.parent_id == parent) {
                if visited.insert(dependency.dependent_id.clone()) {
                    found.push(dependency.dependent_id.clone());
                    frontier.push_back(dependency.dependent_id.clone());
                }
            }
        }
        found
    }

    pub fn clear(&self) {
        lock(&self.statuses).clear();
        lock(&self.dependencies).clear();
    }
}

#[async_trait]
impl StatusRecorder for InMemoryStatusRecorder {
    async fn record_status(&self, record: StatusRecord) -> Result<()> {
        lock(&self.statuses).push(record);
        Ok(())
    }

    async fn record_dependency(&self, dependency: Dependency) -> Result<()> {
        let mut dependencies = lock(&self.dependencies);
        let exists = dependencies.iter().any(|existing| {
            existing.dependent_id == dependency.dependent_id
                && existing.parent_id == dependency.parent_id
        });
        if !exists {
            dependencies.push(dependency);
        }
        Ok(())
    }

    async fn update_dependent_statuses(
        &self,
        parent_id: &str,
        status: MessageStatus,
        reason: Option<&str>,
    ) -> Result<()> {
        let dependents = self.dependents_of(parent_id);
        let mut statuses = lock(&self.statuses);

        for dependent in dependents {
            let Some(last) = statuses.iter().rev().find(|r| r.message_id == dependent) else {
                continue;
            };
            let mut record =
                StatusRecord::new(last.message_type, dependent, status, last.caused_by.clone());
            if let Some(reason) = reason {
                record = record.with_data(json!({ "reason": reason }));
            }
            statuses.push(record);
        }
        Ok(())
    }
}

// ============================================================================
// Metrics exporter
// ============================================================================

#[derive(Debug, Default)]
pub struct InMemoryMetricsExporter {
    metrics: Mutex<Vec<Metric>>,
}

impl InMemoryMetricsExporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metrics(&self) -> Vec<Metric> {
        lock(&self.metrics).clone()
    }

    pub fn named(&self, name: &str) -> Vec<Metric> {
        lock(&self.metrics)
            .iter()
            .filter(|metric| metric.name == name)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl MetricsExporter for InMemoryMetricsExporter {
    fn name(&self) -> &str {
        "in-memory"
    }

    async fn export(&self, metric: &Metric) -> Result<()> {
        lock(&self.metrics).push(metric.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lineage::MessageType;

    #[test]
    fn sequence_ids_count_up() {
        let ids = SequenceIdGenerator::new("cmd");
        assert_eq!(ids.next_id(), "cmd-1");
        assert_eq!(ids.next_id(), "cmd-2");
    }

    #[tokio::test]
    async fn dependents_are_found_transitively() {
        let recorder = InMemoryStatusRecorder::new();
        for (child, parent) in [("b", "a"), ("c", "b"), ("d", "a"), ("c", "a")] {
            recorder
                .record_dependency(Dependency::new(child, parent))
                .await
                .unwrap();
        }

        assert_eq!(recorder.dependents_of("a"), vec!["b", "d", "c"]);
        assert_eq!(recorder.dependents_of("c"), Vec::<String>::new());
    }

    #[tokio::test]
    async fn duplicate_edges_are_ignored() {
        let recorder = InMemoryStatusRecorder::new();
        recorder.record_dependency(Dependency::new("b", "a")).await.unwrap();
        recorder.record_dependency(Dependency::new("b", "a")).await.unwrap();
        assert_eq!(recorder.dependencies().len(), 1);
    }

    #[tokio::test]
    async fn update_marks_every_dependent() {
        let recorder = InMemoryStatusRecorder::new();
        for id in ["a", "b", "c"] {
            recorder
                .record_status(StatusRecord::new(
                    MessageType::Command,
                    id,
                    MessageStatus::Dispatched,
                    vec![],
                ))
                .await
                .unwrap();
        }
        recorder.record_dependency(Dependency::new("b", "a")).await.unwrap();
        recorder.record_dependency(Dependency::new("c", "b")).await.unwrap();

        recorder
            .update_dependent_statuses("a", MessageStatus::Rejected, Some("parent rejected"))
            .await
            .unwrap();

        assert_eq!(recorder.latest_status("a"), Some(MessageStatus::Dispatched));
        assert_eq!(recorder.latest_status("b"), Some(MessageStatus::Rejected));
        assert_eq!(recorder.latest_status("c"), Some(MessageStatus::Rejected));
        let last = recorder.statuses().pop().unwrap();
        assert_eq!(last.data, Some(serde_json::json!({ "reason": "parent rejected" })));
    }
}
