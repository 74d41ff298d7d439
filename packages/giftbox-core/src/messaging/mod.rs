//! # Messaging Module
//!
//! The append-only message log and the realtime delivery channel on top of it.
//!
//! ## Send Path
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           SEND PATH                                     │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  send(alice, Peer(bob), "hi")                                          │
//! │         │                                                               │
//! │         ▼                                                               │
//! │  1. Validate body, check bob exists                                    │
//! │         │                                                               │
//! │         ▼                                                               │
//! │  2. Append to log (blocking pool, bounded by a timeout)                │
//! │         │                 │                                             │
//! │         │                 └── error / timeout ──► StorageFailure       │
//! │         ▼                                                               │
//! │  3. Spawn fan-out task ───────────────┐                                │
//! │         │                             ▼                                 │
//! │         ▼                   for each connection subscribed to          │
//! │  return MessageId           Peer(bob): try_send into its queue         │
//! │                             (full / closed ──► logged + counted)       │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Delivery Contract
//!
//! Push is at-most-once and best-effort. A message pushed to a connection
//! is never re-pushed, and a connection that is offline or too slow simply
//! misses it. The log is the source of truth: clients reconcile from
//! [`MessageChannel::history`] after reconnecting.

mod channel;

pub use channel::{
    ChannelConfig, ChannelEvent, ConnectionId, ConnectionManager, DeliveryStats, MessageChannel,
};

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};
use crate::identity::{Identity, PairKey, RoomName};

/// Maximum message text length, in characters
pub const MAX_TEXT_CHARS: usize = 4000;

// ============================================================================
// TYPES
// ============================================================================

/// Unique message identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub(crate) fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub(crate) fn from_stored(id: String) -> Self {
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a message is addressed, and the key connections subscribe to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum Target {
    /// A single identity
    Peer(Identity),
    /// A named broadcast room
    Room(RoomName),
}

impl Target {
    /// Storage discriminator
    pub fn kind(&self) -> &'static str {
        match self {
            Target::Peer(_) => "peer",
            Target::Room(_) => "room",
        }
    }

    /// The peer or room name
    pub fn name(&self) -> &str {
        match self {
            Target::Peer(identity) => identity.as_str(),
            Target::Room(room) => room.as_str(),
        }
    }

    /// Rebuild a target from its stored parts
    pub fn from_parts(kind: &str, name: &str) -> Result<Self> {
        match kind {
            "peer" => Ok(Target::Peer(Identity::parse(name)?)),
            "room" => Ok(Target::Room(RoomName::parse(name)?)),
            other => Err(Error::InvalidOperation(format!("unknown target kind {:?}", other))),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.name())
    }
}

/// Message payload: text, an attachment (media id), or both
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<String>,
}

impl MessageBody {
    /// A text-only body
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: Some(text.into()), attachment: None }
    }

    /// Drop blank parts and check what remains
    pub fn normalized(self) -> Result<Self> {
        let text = self.text.filter(|t| !t.trim().is_empty());
        let attachment = self
            .attachment
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty());

        if text.is_none() && attachment.is_none() {
            return Err(Error::InvalidOperation("message body is empty".into()));
        }
        if let Some(t) = &text {
            if t.chars().count() > MAX_TEXT_CHARS {
                return Err(Error::InvalidOperation(format!(
                    "message text exceeds {} characters",
                    MAX_TEXT_CHARS
                )));
            }
        }
        Ok(Self { text, attachment })
    }
}

/// A persisted message. Never mutated after it is appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub id: MessageId,
    /// Insertion order assigned by storage
    pub seq: i64,
    pub sender: Identity,
    pub target: Target,
    pub body: MessageBody,
    /// Unix milliseconds
    pub created_at: i64,
}

/// Persistence for the message log
pub trait MessageRepository: Send + Sync {
    /// Append a message and return the `seq` storage assigned to it
    fn append_message(&self, message: &Message) -> Result<i64>;

    /// Direct messages within a pair, ordered by `(created_at, seq)`
    fn peer_history(&self, pair: &PairKey) -> Result<Vec<Message>>;

    /// Messages sent to a room, ordered by `(created_at, seq)`
    fn room_history(&self, room: &RoomName) -> Result<Vec<Message>>;
}
