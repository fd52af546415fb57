//! Message identifiers.
//!
//! IDs are UUIDv7 strings: 48 bits of millisecond timestamp followed by
//! random bits, rendered as fixed-width lowercase hex. They sort
//! lexicographically in creation order, so status history keyed by message
//! ID reads chronologically without a central sequence.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::envelope::Envelope;
use crate::error::{BusError, Result};
use crate::stamp::{MessageIdStamp, Stamp, StampType};

/// Source of fresh message IDs.
pub trait MessageIdGenerator: Send + Sync {
    fn next_id(&self) -> String;
}

/// Time-ordered UUIDv7 IDs, monotonic within the process.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidV7Generator;

impl MessageIdGenerator for UuidV7Generator {
    fn next_id(&self) -> String {
        Uuid::now_v7().to_string()
    }
}

/// Attaches exactly one [`MessageIdStamp`] to a fresh stamp list.
///
/// Used by the bus façades before an envelope exists. Finding an ID already
/// in the list is a programmer error and fails with
/// [`BusError::DuplicateMessageId`].
#[derive(Clone)]
pub struct MessageIdStamper {
    generator: Arc<dyn MessageIdGenerator>,
}

impl MessageIdStamper {
    pub fn new(generator: Arc<dyn MessageIdGenerator>) -> Self {
        Self { generator }
    }

    pub fn attach(&self, mut stamps: Vec<Stamp>) -> Result<Vec<Stamp>> {
        if let Some(existing) = stamps.iter().rev().find_map(MessageIdStamp::from_stamp) {
            return Err(BusError::DuplicateMessageId {
                id: existing.id().to_owned(),
            });
        }

        stamps.push(MessageIdStamp::new(self.generator.next_id()).into());
        Ok(stamps)
    }

    pub fn generator(&self) -> &Arc<dyn MessageIdGenerator> {
        &self.generator
    }
}

impl Default for MessageIdStamper {
    fn default() -> Self {
        Self::new(Arc::new(UuidV7Generator))
    }
}

impl fmt::Debug for MessageIdStamper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageIdStamper").finish_non_exhaustive()
    }
}

// ============================================================================
// Typed identifiers returned by the bus façades
// ============================================================================

macro_rules! message_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }

            pub(crate) fn from_envelope(envelope: &Envelope) -> Result<Self> {
                envelope.require_message_id().map(Self::new)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

message_id! {
    /// ID of a dispatched command.
    CommandId
}

message_id! {
    /// ID of a dispatched query.
    QueryId
}

message_id! {
    /// ID of a dispatched domain event.
    DomainEventId
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stamp::{CausedByStamp, StampKind};
    use crate::MessageType;

    struct Fixed(&'static str);

    impl MessageIdGenerator for Fixed {
        fn next_id(&self) -> String {
            self.0.to_string()
        }
    }

    #[test]
    fn attach_adds_exactly_one_id() {
        let stamper = MessageIdStamper::new(Arc::new(Fixed("id-1")));
        let stamps = stamper
            .attach(vec![CausedByStamp::new(MessageType::Command, "p").into()])
            .unwrap();

        let ids: Vec<_> = stamps.iter().filter_map(MessageIdStamp::from_stamp).collect();
        assert_eq!(ids, vec![&MessageIdStamp::new("id-1")]);
        assert_eq!(stamps[0].kind(), StampKind::CausedBy);
    }

    #[test]
    fn attach_rejects_an_existing_id() {
        let stamper = MessageIdStamper::new(Arc::new(Fixed("fresh")));
        let err = stamper
            .attach(vec![MessageIdStamp::new("existing").into()])
            .unwrap_err();

        assert!(matches!(err, BusError::DuplicateMessageId { ref id } if id == "existing"));
    }

    #[test]
    fn uuid_v7_ids_sort_in_creation_order() {
        let generator = UuidV7Generator;
        let ids: Vec<String> = (0..64).map(|_| generator.next_id()).collect();

        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
        assert!(ids.windows(2).all(|w| w[0] != w[1]));
    }

    #[test]
    fn typed_ids_display_their_inner_value() {
        let id = CommandId::from("abc".to_string());
        assert_eq!(id.to_string(), "abc");
        assert_eq!(id.as_ref(), "abc");
        assert_eq!(serde_json::to_value(&id).unwrap(), serde_json::json!("abc"));
    }
}
