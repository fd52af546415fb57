//! Status and dependency recording.
//!
//! For every message this stage reports:
//!
//! - `dispatched`, plus one dependency edge per cause, when the envelope is a
//!   fresh dispatch (no `ReceivedStamp`)
//! - `sent` with the transport details when the rest of the chain handed the
//!   envelope to one or more senders
//! - otherwise `handled` with every handler's result
//!
//! Nothing is reported when the chain fails unless failure recording is
//! switched on, in which case `failed` is recorded with the error text before
//! the error is returned. Recorder errors are logged and never fail the
//! dispatch.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use crate::envelope::Envelope;
use crate::error::Result;
use crate::message::MessageType;
use crate::middleware::{Middleware, Next};
use crate::recorder::{Dependency, MessageStatus, StatusRecord, StatusRecorder};
use crate::stamp::{CausedByStamp, HandledStamp, ReceivedStamp, SentStamp};

#[derive(Clone)]
pub struct StatusRecorderMiddleware {
    recorder: Arc<dyn StatusRecorder>,
    record_failures: bool,
}

impl StatusRecorderMiddleware {
    pub fn new(recorder: Arc<dyn StatusRecorder>) -> Self {
        Self {
            recorder,
            record_failures: false,
        }
    }

    /// Also record `failed` when the rest of the chain returns an error.
    pub fn record_failures(mut self, enabled: bool) -> Self {
        self.record_failures = enabled;
        self
    }

    async fn status(&self, target: &Target, status: MessageStatus, data: Option<Value>) {
        let mut record = StatusRecord::new(
            target.message_type,
            target.message_id.clone(),
            status,
            target.caused_by.clone(),
        );
        record.data = data;

        if let Err(error) = self.recorder.record_status(record).await {
            tracing::warn!(
                message_id = %target.message_id,
                message_type = %target.message_type,
                status = %status,
                error = %error,
                "failed to record message status"
            );
        }
    }

    async fn dependencies(&self, target: &Target) {
        for parent in &target.caused_by {
            let dependency = Dependency::new(target.message_id.clone(), parent.clone());
            if let Err(error) = self.recorder.record_dependency(dependency).await {
                tracing::warn!(
                    message_id = %target.message_id,
                    parent_id = %parent,
                    error = %error,
                    "failed to record message dependency"
                );
            }
        }
    }
}

impl std::fmt::Debug for StatusRecorderMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusRecorderMiddleware")
            .field("record_failures", &self.record_failures)
            .finish_non_exhaustive()
    }
}

/// The message a record is about, captured before delegating.
struct Target {
    message_type: MessageType,
    message_id: String,
    caused_by: Vec<String>,
}

#[async_trait]
impl Middleware for StatusRecorderMiddleware {
    async fn handle(&self, envelope: Envelope, next: Next) -> Result<Envelope> {
        let target = Target {
            message_type: envelope.message_type(),
            message_id: envelope.require_message_id()?.to_owned(),
            caused_by: envelope
                .all::<CausedByStamp>()
                .map(|cause| cause.message_id().to_owned())
                .collect(),
        };

        if !envelope.has::<ReceivedStamp>() {
            self.status(&target, MessageStatus::Dispatched, None).await;
            self.dependencies(&target).await;
        }

        let envelope = match next.run(envelope).await {
            Ok(envelope) => envelope,
            Err(error) => {
                if self.record_failures {
                    let data = json!({ "error": error.to_string() });
                    self.status(&target, MessageStatus::Failed, Some(data)).await;
                }
                return Err(error);
            }
        };

        if envelope.has::<SentStamp>() {
            let data = transport_data(&envelope);
            self.status(&target, MessageStatus::Sent, Some(data)).await;
            return Ok(envelope);
        }

        if envelope.has::<HandledStamp>() {
            let data = handler_results(&envelope);
            self.status(&target, MessageStatus::Handled, Some(data)).await;
        }

        Ok(envelope)
    }
}

fn transport_data(envelope: &Envelope) -> Value {
    let sent_at = Utc::now().to_rfc3339();
    envelope
        .all::<SentStamp>()
        .map(|stamp| {
            json!({
                "sender": stamp.sender,
                "alias": stamp.alias,
                "sent_at": sent_at,
            })
        })
        .collect()
}

fn handler_results(envelope: &Envelope) -> Value {
    let handled_at = Utc::now().to_rfc3339();
    envelope
        .all::<HandledStamp>()
        .map(|stamp| {
            json!({
                "handler_name": stamp.handler,
                "result": stamp.result,
                "handled_at": handled_at,
            })
        })
        .collect()
}
