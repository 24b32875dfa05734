//! Sync protocol messages.
//!
//! Four message types travel on a connection, each framed with its own tag:
//! `Hello` and `Setup` once per direction during the handshake, then any
//! number of `Update`s, each batch closed by a `Checkpoint`.

use meshstore_storage::Mapping;
use meshstore_types::{ObjectId, TimedValues, Timestamp};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Maximum number of log rows pushed in a single batch.
pub const MAX_BATCH_SIZE: usize = 1000;

/// Wire tag identifying the payload type of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Hello = 1,
    Setup = 2,
    Update = 3,
    Checkpoint = 4,
}

impl MessageType {
    /// Returns the type for a wire tag, if known.
    #[must_use]
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Hello),
            2 => Some(Self::Setup),
            3 => Some(Self::Update),
            4 => Some(Self::Checkpoint),
            _ => None,
        }
    }

    #[must_use]
    pub fn tag(self) -> u8 {
        self as u8
    }
}

/// First message in each direction: the sender's stable node name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub name: String,
}

/// Second handshake message: where the sender's log ends, and how far the
/// sender has read the receiver's log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Setup {
    pub last_serial_in_db: i64,
    pub last_serial_received: i64,
}

/// One replicated attribute write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub object_id: ObjectId,
    pub key: String,
    pub timestamp: Timestamp,
    pub values: BTreeSet<String>,
}

impl Update {
    /// Returns the written value as a [`TimedValues`].
    #[must_use]
    pub fn timed_values(&self) -> TimedValues {
        TimedValues::new(self.values.iter().cloned(), self.timestamp)
    }
}

impl From<Mapping> for Update {
    fn from(mapping: Mapping) -> Self {
        Self {
            object_id: mapping.object_id,
            key: mapping.key,
            timestamp: mapping.timestamp,
            values: mapping.values,
        }
    }
}

/// Closes a batch: the sender's log has been pushed up to `serial`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub serial: i64,
}

/// Any message that can appear on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncMessage {
    Hello(Hello),
    Setup(Setup),
    Update(Update),
    Checkpoint(Checkpoint),
}

impl SyncMessage {
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Hello(_) => MessageType::Hello,
            Self::Setup(_) => MessageType::Setup,
            Self::Update(_) => MessageType::Update,
            Self::Checkpoint(_) => MessageType::Checkpoint,
        }
    }
}

/// A payload type bound to one wire tag.
pub trait WireMessage: Serialize + DeserializeOwned + Into<SyncMessage> {
    const TYPE: MessageType;
}

macro_rules! wire_message {
    ($name:ident) => {
        impl WireMessage for $name {
            const TYPE: MessageType = MessageType::$name;
        }

        impl From<$name> for SyncMessage {
            fn from(message: $name) -> Self {
                SyncMessage::$name(message)
            }
        }
    };
}

wire_message!(Hello);
wire_message!(Setup);
wire_message!(Update);
wire_message!(Checkpoint);
