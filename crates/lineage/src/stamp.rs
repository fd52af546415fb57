//! Stamps: typed metadata records attached to an [`Envelope`](crate::Envelope).
//!
//! Every stamp type is one variant of [`Stamp`]. [`StampKind`] is the
//! discriminant used to key the envelope's multimap, and [`StampType`] gives
//! typed access (`envelope.all::<CausedByStamp>()`) without reflection.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::message::MessageType;

/// Typed access to one variant of [`Stamp`].
pub trait StampType: Into<Stamp> + Sized + 'static {
    const KIND: StampKind;

    fn from_stamp(stamp: &Stamp) -> Option<&Self>;
}

macro_rules! stamps {
    ($( $(#[$meta:meta])* $variant:ident($ty:ty) ),+ $(,)?) => {
        /// One metadata record on an envelope.
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        pub enum Stamp {
            $( $(#[$meta])* $variant($ty), )+
        }

        /// Discriminant of [`Stamp`].
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum StampKind {
            $( $variant, )+
        }

        impl Stamp {
            pub fn kind(&self) -> StampKind {
                match self {
                    $( Stamp::$variant(_) => StampKind::$variant, )+
                }
            }
        }

        $(
            impl From<$ty> for Stamp {
                fn from(stamp: $ty) -> Self {
                    Stamp::$variant(stamp)
                }
            }

            impl StampType for $ty {
                const KIND: StampKind = StampKind::$variant;

                fn from_stamp(stamp: &Stamp) -> Option<&Self> {
                    match stamp {
                        Stamp::$variant(inner) => Some(inner),
                        #[allow(unreachable_patterns)]
                        _ => None,
                    }
                }
            }
        )+
    };
}

stamps! {
    /// Correlation identifier, exactly one per envelope.
    MessageId(MessageIdStamp),
    /// One ancestor in the causation chain.
    CausedBy(CausedByStamp),
    /// The envelope was consumed from a transport.
    Received(ReceivedStamp),
    /// The envelope was handed to a transport.
    Sent(SentStamp),
    /// A handler processed the message.
    Handled(HandledStamp),
    /// Hold the message until the outermost dispatch on the bus completes.
    DispatchAfterCurrentBus(DispatchAfterCurrentBusStamp),
}

impl StampKind {
    /// Whether stamps of this kind survive a transport hop.
    ///
    /// Lifecycle markers describe what happened in the sending process and
    /// must not leak into the receiving one.
    pub fn is_sendable(self) -> bool {
        matches!(self, StampKind::MessageId | StampKind::CausedBy)
    }
}

// ============================================================================
// Stamp types
// ============================================================================

/// Carries the message's correlation identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageIdStamp {
    id: String,
}

impl MessageIdStamp {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Identifies a message responsible, directly or transitively, for
/// dispatching the current one.
///
/// Two stamps are the same cause when type and ID match. The string form
/// `<TYPE>:<id>` (for example `COMMAND:01J...`) is what logs show.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CausedByStamp {
    message_type: MessageType,
    message_id: String,
}

impl CausedByStamp {
    pub fn new(message_type: MessageType, message_id: impl Into<String>) -> Self {
        Self {
            message_type,
            message_id: message_id.into(),
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }
}

impl fmt::Display for CausedByStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.message_type.name(), self.message_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceivedStamp {
    pub transport: String,
}

impl ReceivedStamp {
    pub fn new(transport: impl Into<String>) -> Self {
        Self {
            transport: transport.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentStamp {
    pub sender: String,
    pub alias: Option<String>,
}

impl SentStamp {
    pub fn new(sender: impl Into<String>, alias: Option<String>) -> Self {
        Self {
            sender: sender.into(),
            alias,
        }
    }
}

/// Result of one handler invocation, kept as JSON so it can be recorded and
/// decoded by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandledStamp {
    pub handler: String,
    pub result: serde_json::Value,
}

impl HandledStamp {
    pub fn new(handler: impl Into<String>, result: serde_json::Value) -> Self {
        Self {
            handler: handler.into(),
            result,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchAfterCurrentBusStamp;
