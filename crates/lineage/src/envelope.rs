//! The envelope: one message plus its accumulated stamps.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::error::{BusError, Result};
use crate::message::{downcast_message, Message, MessageType};
use crate::stamp::{MessageIdStamp, Stamp, StampKind, StampType};

type StampList = SmallVec<[Stamp; 2]>;

/// Pairs a message with an ordered multimap of stamps.
///
/// Stamps are only ever appended. [`Envelope::with`] consumes the envelope
/// and returns the extended one, so a value a caller still holds (for
/// example a clone captured by a test) never changes underneath it. Cloning
/// is cheap: the message is shared.
#[derive(Clone)]
pub struct Envelope {
    message: Arc<dyn Message>,
    stamps: BTreeMap<StampKind, StampList>,
}

impl Envelope {
    pub fn new<M: Message>(message: M) -> Self {
        Self::from_arc(Arc::new(message))
    }

    pub fn from_arc(message: Arc<dyn Message>) -> Self {
        Self {
            message,
            stamps: BTreeMap::new(),
        }
    }

    /// Wrap a message together with an initial set of stamps.
    pub fn with_stamps<M: Message>(message: M, stamps: impl IntoIterator<Item = Stamp>) -> Self {
        Self::new(message).with_all(stamps)
    }

    pub fn message(&self) -> &dyn Message {
        self.message.as_ref()
    }

    pub fn message_arc(&self) -> Arc<dyn Message> {
        Arc::clone(&self.message)
    }

    pub fn message_type(&self) -> MessageType {
        self.message.message_type()
    }

    /// Rust type name of the message, for logs and errors.
    pub fn message_name(&self) -> &'static str {
        self.message().type_name()
    }

    pub fn downcast<M: Message>(&self) -> Option<Arc<M>> {
        downcast_message(self.message_arc())
    }

    /// Append a stamp after any existing stamps of the same kind.
    #[must_use]
    pub fn with(mut self, stamp: impl Into<Stamp>) -> Self {
        let stamp = stamp.into();
        self.stamps.entry(stamp.kind()).or_default().push(stamp);
        self
    }

    #[must_use]
    pub fn with_all(self, stamps: impl IntoIterator<Item = Stamp>) -> Self {
        stamps
            .into_iter()
            .fold(self, |envelope, stamp| envelope.with(stamp))
    }

    /// All stamps of type `T`, oldest first.
    pub fn all<T: StampType>(&self) -> impl Iterator<Item = &T> + '_ {
        self.stamps
            .get(&T::KIND)
            .into_iter()
            .flatten()
            .filter_map(T::from_stamp)
    }

    /// Most recently added stamp of type `T`.
    pub fn last<T: StampType>(&self) -> Option<&T> {
        self.stamps
            .get(&T::KIND)
            .and_then(|list| list.last())
            .and_then(T::from_stamp)
    }

    pub fn has<T: StampType>(&self) -> bool {
        self.count_of(T::KIND) > 0
    }

    pub fn count_of(&self, kind: StampKind) -> usize {
        self.stamps.get(&kind).map_or(0, |list| list.len())
    }

    /// Every stamp, grouped by kind.
    pub fn stamps(&self) -> impl Iterator<Item = &Stamp> + '_ {
        self.stamps.values().flatten()
    }

    /// Kinds present on the envelope, for logging.
    pub fn stamp_kinds(&self) -> Vec<StampKind> {
        self.stamps.keys().copied().collect()
    }

    pub fn message_id(&self) -> Option<&str> {
        self.last::<MessageIdStamp>().map(MessageIdStamp::id)
    }

    /// The message ID, or [`BusError::MissingMessageId`] when the ID stage
    /// has not run yet.
    pub fn require_message_id(&self) -> Result<&str> {
        self.message_id().ok_or(BusError::MissingMessageId {
            message: self.message_name(),
        })
    }

    /// A new envelope holding only the stamps that may cross a transport.
    pub fn for_transport(&self) -> Envelope {
        Envelope {
            message: self.message_arc(),
            stamps: self
                .stamps
                .iter()
                .filter(|(kind, _)| kind.is_sendable())
                .map(|(kind, list)| (*kind, list.clone()))
                .collect(),
        }
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("message", &self.message)
            .field("stamps", &self.stamps.values().flatten().collect::<Vec<_>>())
            .finish()
    }
}
