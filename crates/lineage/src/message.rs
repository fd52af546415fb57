//! Message kinds carried by the buses.
//!
//! The pipeline never looks inside a message. All it needs is the
//! [`MessageType`] and a type name for logging; identity comes from the
//! [`MessageIdStamp`](crate::MessageIdStamp) on the envelope.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// The three kinds of message a bus carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Command,
    Query,
    DomainEvent,
}

impl MessageType {
    /// Upper-case name used in the causation string form (`COMMAND:<id>`).
    pub fn name(self) -> &'static str {
        match self {
            MessageType::Command => "COMMAND",
            MessageType::Query => "QUERY",
            MessageType::DomainEvent => "DOMAIN_EVENT",
        }
    }

    /// Lower-case label used in logs, metric tags and storage.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Command => "command",
            MessageType::Query => "query",
            MessageType::DomainEvent => "domain_event",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepts both the label and the causation name.
impl std::str::FromStr for MessageType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Ok(match s {
            "command" | "COMMAND" => MessageType::Command,
            "query" | "QUERY" => MessageType::Query,
            "domain_event" | "DOMAIN_EVENT" => MessageType::DomainEvent,
            other => anyhow::bail!("unknown message type: {other}"),
        })
    }
}

/// Type-erasure helpers, implemented for every `'static` type.
pub trait AsAny: Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
    fn type_name(&self) -> &'static str;
}

impl<T: Any + Send + Sync> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// Any payload that can travel through a bus.
///
/// Implement it through [`impl_command!`](crate::impl_command),
/// [`impl_query!`](crate::impl_query) or
/// [`impl_domain_event!`](crate::impl_domain_event) rather than by hand.
pub trait Message: AsAny + fmt::Debug {
    fn message_type(&self) -> MessageType;
}

/// Intent to change state. Dispatched on a [`CommandBus`](crate::CommandBus).
pub trait Command: Message {}

/// Request for data. Dispatched on a [`QueryBus`](crate::QueryBus), which
/// decodes the single handler's result into `Output`.
pub trait Query: Message {
    type Output: DeserializeOwned + Send + 'static;
}

/// Fact about something that happened. Dispatched on a
/// [`DomainEventBus`](crate::DomainEventBus).
pub trait DomainEvent: Message {}

/// Downcast a type-erased message back to its concrete type.
pub fn downcast_message<M: Message>(message: Arc<dyn Message>) -> Option<Arc<M>> {
    message.into_any_arc().downcast::<M>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Ping;
    crate::impl_command!(Ping);

    #[derive(Debug)]
    struct Pong;
    crate::impl_domain_event!(Pong);

    #[test]
    fn names_and_labels() {
        assert_eq!(MessageType::Command.name(), "COMMAND");
        assert_eq!(MessageType::DomainEvent.name(), "DOMAIN_EVENT");
        assert_eq!(MessageType::DomainEvent.to_string(), "domain_event");
        assert_eq!(
            serde_json::to_value(MessageType::Query).unwrap(),
            serde_json::json!("query")
        );
    }

    #[test]
    fn parses_labels_and_names() {
        assert_eq!("domain_event".parse::<MessageType>().unwrap(), MessageType::DomainEvent);
        assert_eq!("COMMAND".parse::<MessageType>().unwrap(), MessageType::Command);
        assert!("event".parse::<MessageType>().is_err());
    }

    #[test]
    fn erased_message_downcasts_to_its_own_type_only() {
        let erased: Arc<dyn Message> = Arc::new(Ping);
        assert_eq!(erased.message_type(), MessageType::Command);
        assert!(erased.as_ref().type_name().ends_with("Ping"));
        assert!(downcast_message::<Pong>(Arc::clone(&erased)).is_none());
        assert!(downcast_message::<Ping>(erased).is_some());
    }
}
