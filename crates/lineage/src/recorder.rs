//! Message status and dependency recording.
//!
//! The pipeline reports lifecycle transitions through [`StatusRecorder`];
//! storage is up to the implementation. Recording is best-effort
//! observability: the two writes per message (status, then dependencies)
//! are not atomic, and a failing recorder never fails a dispatch.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::MessageType;

/// Where a message is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Dispatched to a bus, not yet sent or handled.
    Dispatched,
    /// Handed to a transport for asynchronous processing.
    Sent,
    /// Being processed by a handler.
    Processing,
    /// Processed successfully.
    Handled,
    /// Processing failed.
    Failed,
    /// Processing timed out.
    Timeout,
    /// Rejected, for example by validation.
    Rejected,
}

impl MessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Dispatched => "dispatched",
            MessageStatus::Sent => "sent",
            MessageStatus::Processing => "processing",
            MessageStatus::Handled => "handled",
            MessageStatus::Failed => "failed",
            MessageStatus::Timeout => "timeout",
            MessageStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "dispatched" => MessageStatus::Dispatched,
            "sent" => MessageStatus::Sent,
            "processing" => MessageStatus::Processing,
            "handled" => MessageStatus::Handled,
            "failed" => MessageStatus::Failed,
            "timeout" => MessageStatus::Timeout,
            "rejected" => MessageStatus::Rejected,
            other => anyhow::bail!("unknown message status: {other}"),
        })
    }
}

/// One entry in the append-only status log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub message_type: MessageType,
    pub message_id: String,
    pub status: MessageStatus,
    pub caused_by: Vec<String>,
    pub data: Option<serde_json::Value>,
    pub occurred_at: DateTime<Utc>,
}

impl StatusRecord {
    pub fn new(
        message_type: MessageType,
        message_id: impl Into<String>,
        status: MessageStatus,
        caused_by: Vec<String>,
    ) -> Self {
        Self {
            message_type,
            message_id: message_id.into(),
            status,
            caused_by,
            data: None,
            occurred_at: Utc::now(),
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn occurred_at(mut self, at: DateTime<Utc>) -> Self {
        self.occurred_at = at;
        self
    }
}

/// `dependent_id` was caused, directly or transitively, by `parent_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub dependent_id: String,
    pub parent_id: String,
    pub recorded_at: DateTime<Utc>,
}

impl Dependency {
    pub fn new(dependent_id: impl Into<String>, parent_id: impl Into<String>) -> Self {
        Self {
            dependent_id: dependent_id.into(),
            parent_id: parent_id.into(),
            recorded_at: Utc::now(),
        }
    }

    pub fn recorded_at(mut self, at: DateTime<Utc>) -> Self {
        self.recorded_at = at;
        self
    }
}

/// Persists message statuses and the dependency graph between messages.
#[async_trait]
pub trait StatusRecorder: Send + Sync {
    async fn record_status(&self, record: StatusRecord) -> Result<()>;

    async fn record_dependency(&self, dependency: Dependency) -> Result<()>;

    /// Apply `status` to every message that depends, directly or
    /// transitively, on `parent_id`. Used, for example, to mark everything a
    /// failed command triggered.
    async fn update_dependent_statuses(
        &self,
        parent_id: &str,
        status: MessageStatus,
        reason: Option<&str>,
    ) -> Result<()>;
}

#[async_trait]
impl<R: StatusRecorder + ?Sized> StatusRecorder for Arc<R> {
    async fn record_status(&self, record: StatusRecord) -> Result<()> {
        (**self).record_status(record).await
    }

    async fn record_dependency(&self, dependency: Dependency) -> Result<()> {
        (**self).record_dependency(dependency).await
    }

    async fn update_dependent_statuses(
        &self,
        parent_id: &str,
        status: MessageStatus,
        reason: Option<&str>,
    ) -> Result<()> {
        (**self).update_dependent_statuses(parent_id, status, reason).await
    }
}

// ============================================================================
// Recorders
// ============================================================================

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullStatusRecorder;

#[async_trait]
impl StatusRecorder for NullStatusRecorder {
    async fn record_status(&self, _record: StatusRecord) -> Result<()> {
        Ok(())
    }

    async fn record_dependency(&self, _dependency: Dependency) -> Result<()> {
        Ok(())
    }

    async fn update_dependent_statuses(
        &self,
        _parent_id: &str,
        _status: MessageStatus,
        _reason: Option<&str>,
    ) -> Result<()> {
        Ok(())
    }
}

/// Logs every call before and after delegating to the wrapped recorder.
#[derive(Debug, Clone)]
pub struct LoggingStatusRecorder<R> {
    inner: R,
}

impl<R> LoggingStatusRecorder<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }
}

#[async_trait]
impl<R: StatusRecorder> StatusRecorder for LoggingStatusRecorder<R> {
    async fn record_status(&self, record: StatusRecord) -> Result<()> {
        tracing::info!(
            message_id = %record.message_id,
            message_type = %record.message_type,
            status = %record.status,
            caused_by = ?record.caused_by,
            occurred_at = %record.occurred_at.to_rfc3339(),
            data = ?record.data,
            "About to record message {} as {}",
            record.message_id,
            record.status,
        );

        let message_id = record.message_id.clone();
        let status = record.status;
        self.inner.record_status(record).await?;

        tracing::info!("Recorded message {} as {}", message_id, status);
        Ok(())
    }

    async fn record_dependency(&self, dependency: Dependency) -> Result<()> {
        tracing::info!(
            dependent_message_id = %dependency.dependent_id,
            parent_message_id = %dependency.parent_id,
            recorded_at = %dependency.recorded_at.to_rfc3339(),
            "About to record dependency: {} depends on {}",
            dependency.dependent_id,
            dependency.parent_id,
        );

        let (dependent, parent) = (dependency.dependent_id.clone(), dependency.parent_id.clone());
        self.inner.record_dependency(dependency).await?;

        tracing::info!("Recorded dependency: {} depends on {}", dependent, parent);
        Ok(())
    }

    async fn update_dependent_statuses(
        &self,
        parent_id: &str,
        status: MessageStatus,
        reason: Option<&str>,
    ) -> Result<()> {
        tracing::info!(
            parent_message_id = %parent_id,
            new_status = %status,
            reason = ?reason,
            "About to update dependent message statuses for parent {}",
            parent_id,
        );

        self.inner
            .update_dependent_statuses(parent_id, status, reason)
            .await?;

        tracing::info!("Updated dependent message statuses for parent {}", parent_id);
        Ok(())
    }
}

/// Writes to several recorders. Each sink is isolated: a failure is logged
/// and the remaining sinks still receive the call. Only when every sink
/// fails does the fan-out report an error.
#[derive(Clone, Default)]
pub struct FanOutStatusRecorder {
    sinks: Vec<(String, Arc<dyn StatusRecorder>)>,
}

impl FanOutStatusRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, name: impl Into<String>, sink: Arc<dyn StatusRecorder>) -> Self {
        self.sinks.push((name.into(), sink));
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    fn settle(&self, operation: &'static str, results: Vec<(&str, Result<()>)>) -> Result<()> {
        let total = results.len();
        let mut failed = 0;
        for (sink, result) in results {
            if let Err(error) = result {
                failed += 1;
                tracing::error!(sink, operation, error = %error, "status recorder sink failed");
            }
        }

        if total > 0 && failed == total {
            anyhow::bail!("all {total} status recorder sinks failed to {operation}");
        }
        Ok(())
    }
}

impl fmt::Debug for FanOutStatusRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FanOutStatusRecorder")
            .field("sinks", &self.sinks.iter().map(|(name, _)| name).collect::<Vec<_>>())
            .finish()
    }
}

#[async_trait]
impl StatusRecorder for FanOutStatusRecorder {
    async fn record_status(&self, record: StatusRecord) -> Result<()> {
        let mut results = Vec::with_capacity(self.sinks.len());
        for (name, sink) in &self.sinks {
            results.push((name.as_str(), sink.record_status(record.clone()).await));
        }
        self.settle("record status", results)
    }

    async fn record_dependency(&self, dependency: Dependency) -> Result<()> {
        let mut results = Vec::with_capacity(self.sinks.len());
        for (name, sink) in &self.sinks {
            results.push((name.as_str(), sink.record_dependency(dependency.clone()).await));
        }
        self.settle("record dependency", results)
    }

    async fn update_dependent_statuses(
        &self,
        parent_id: &str,
        status: MessageStatus,
        reason: Option<&str>,
    ) -> Result<()> {
        let mut results = Vec::with_capacity(self.sinks.len());
        for (name, sink) in &self.sinks {
            results.push((
                name.as_str(),
                sink.update_dependent_statuses(parent_id, status, reason).await,
            ));
        }
        self.settle("update dependent statuses", results)
    }
}
