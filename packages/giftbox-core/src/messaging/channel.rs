//! Connection registry and best-effort push delivery.
//!
//! The [`ConnectionManager`] maps subscription keys (a peer or a room) to the
//! set of open connections that want pushes for it. Each connection owns a
//! bounded queue; the transport drains it on its own task.

use dashmap::DashMap;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::{Message, MessageBody, MessageId, MessageRepository, Target};
use crate::error::{Error, Result};
use crate::friends::Relationship;
use crate::identity::{Identity, IdentityDirectory, PairKey, RoomName};

/// Default per-connection push queue capacity
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Default bound on a single message write
pub const DEFAULT_PERSIST_TIMEOUT: Duration = Duration::from_secs(5);

/// Channel configuration
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Events buffered per connection before pushes are dropped
    pub queue_capacity: usize,
    /// How long `send` waits for the log append
    pub persist_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            persist_timeout: DEFAULT_PERSIST_TIMEOUT,
        }
    }
}

/// Something pushed to a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A message addressed to a key the connection is subscribed to
    Message(Message),
    /// A relationship involving the connection's identity changed
    RelationshipChanged(Relationship),
}

// ============================================================================
// CONNECTION MANAGER
// ============================================================================

/// Opaque handle for an open connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

struct ConnectionEntry {
    identity: Identity,
    sender: mpsc::Sender<ChannelEvent>,
    keys: HashSet<Target>,
}

/// Who is connected, and what each connection is subscribed to
pub struct ConnectionManager {
    next_id: AtomicU64,
    connections: DashMap<ConnectionId, ConnectionEntry>,
    subscribers: DashMap<Target, HashSet<ConnectionId>>,
    queue_capacity: usize,
}

impl ConnectionManager {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            connections: DashMap::new(),
            subscribers: DashMap::new(),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Open a connection for `identity`.
    ///
    /// The connection starts subscribed to its own peer key, so direct
    /// messages reach it without an explicit `subscribe`.
    pub fn open(&self, identity: &Identity) -> (ConnectionId, mpsc::Receiver<ChannelEvent>) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = mpsc::channel(self.queue_capacity);
        let own_key = Target::Peer(identity.clone());

        self.connections.insert(
            id,
            ConnectionEntry {
                identity: identity.clone(),
                sender,
                keys: HashSet::from([own_key.clone()]),
            },
        );
        self.subscribers.entry(own_key).or_default().insert(id);

        tracing::debug!(connection = %id, identity = %identity, "Connection opened");
        (id, receiver)
    }

    /// Close a connection and drop every subscription it held.
    ///
    /// Returns `false` if the connection was not open.
    pub fn close(&self, id: ConnectionId) -> bool {
        let Some((_, entry)) = self.connections.remove(&id) else {
            return false;
        };
        for key in &entry.keys {
            self.remove_subscriber(key, id);
        }
        tracing::debug!(connection = %id, identity = %entry.identity, "Connection closed");
        true
    }

    /// Subscribe a connection to a peer or room key
    pub fn subscribe(&self, id: ConnectionId, key: Target) -> Result<()> {
        let mut entry = self
            .connections
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("connection {}", id)))?;

        if let Target::Peer(peer) = &key {
            if peer != &entry.identity {
                return Err(Error::AuthorizationDenied(format!(
                    "{} cannot subscribe to messages for {}",
                    entry.identity, peer
                )));
            }
        }

        if entry.keys.insert(key.clone()) {
            self.subscribers.entry(key).or_default().insert(id);
        }
        Ok(())
    }

    /// Remove one subscription from a connection
    pub fn unsubscribe(&self, id: ConnectionId, key: &Target) -> Result<()> {
        let mut entry = self
            .connections
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("connection {}", id)))?;

        if entry.keys.remove(key) {
            self.remove_subscriber(key, id);
        }
        Ok(())
    }

    fn remove_subscriber(&self, key: &Target, id: ConnectionId) {
        if let Some(mut set) = self.subscribers.get_mut(key) {
            set.remove(&id);
        }
        self.subscribers.remove_if(key, |_, set| set.is_empty());
    }

    /// Push queues of every connection subscribed to `key`
    pub fn senders_for(&self, key: &Target) -> Vec<(ConnectionId, mpsc::Sender<ChannelEvent>)> {
        // Collect ids first so no subscribers guard is held while reading connections
        let ids: Vec<ConnectionId> = match self.subscribers.get(key) {
            Some(set) => set.iter().copied().collect(),
            None => return Vec::new(),
        };
        ids.into_iter()
            .filter_map(|id| {
                self.connections
                    .get(&id)
                    .map(|entry| (id, entry.sender.clone()))
            })
            .collect()
    }

    /// Identity a connection was opened for
    pub fn identity_of(&self, id: ConnectionId) -> Option<Identity> {
        self.connections.get(&id).map(|entry| entry.identity.clone())
    }

    /// Whether `identity` has at least one open connection
    pub fn is_online(&self, identity: &Identity) -> bool {
        self.subscribers
            .get(&Target::Peer(identity.clone()))
            .map(|set| !set.is_empty())
            .unwrap_or(false)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of keys with at least one subscriber
    pub fn subscription_key_count(&self) -> usize {
        self.subscribers.len()
    }
}

// ============================================================================
// DELIVERY STATS
// ============================================================================

/// Push counters
#[derive(Debug, Default)]
pub struct DeliveryStats {
    pushed: AtomicU64,
    failed: AtomicU64,
}

impl DeliveryStats {
    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    fn record(&self, delivered: bool) {
        if delivered {
            self.pushed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Try to enqueue one event on every given connection. Never waits.
fn push_all(
    stats: &DeliveryStats,
    targets: Vec<(ConnectionId, mpsc::Sender<ChannelEvent>)>,
    event: &ChannelEvent,
) {
    for (connection, sender) in targets {
        match sender.try_send(event.clone()) {
            Ok(()) => stats.record(true),
            Err(e) => {
                let reason = match e {
                    mpsc::error::TrySendError::Full(_) => "queue full",
                    mpsc::error::TrySendError::Closed(_) => "connection closed",
                };
                let failure = Error::DeliveryFailure(format!("{} ({})", connection, reason));
                stats.record(false);
                tracing::warn!(connection = %connection, error = %failure, "Push dropped");
            }
        }
    }
}

// ============================================================================
// MESSAGE CHANNEL
// ============================================================================

/// Persists messages and pushes them to subscribed connections
pub struct MessageChannel {
    repo: Arc<dyn MessageRepository>,
    directory: Arc<dyn IdentityDirectory>,
    connections: Arc<ConnectionManager>,
    stats: Arc<DeliveryStats>,
    config: ChannelConfig,
}

impl MessageChannel {
    pub fn new(
        repo: Arc<dyn MessageRepository>,
        directory: Arc<dyn IdentityDirectory>,
        config: ChannelConfig,
    ) -> Self {
        Self {
            repo,
            directory,
            connections: Arc::new(ConnectionManager::new(config.queue_capacity)),
            stats: Arc::new(DeliveryStats::default()),
            config,
        }
    }

    /// The connection registry this channel delivers through
    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn stats(&self) -> &DeliveryStats {
        &self.stats
    }

    /// Persist a message, then push it to whoever is subscribed to `target`.
    ///
    /// Returns once the message is in the log; the push happens on a spawned
    /// task and its failures are only logged and counted. A write that times
    /// out is reported as `StorageFailure` even though it may still land.
    pub async fn send(
        &self,
        sender: &Identity,
        target: Target,
        body: MessageBody,
    ) -> Result<MessageId> {
        let body = body.normalized()?;
        if let Target::Peer(peer) = &target {
            if peer == sender {
                return Err(Error::InvalidOperation("cannot message yourself".into()));
            }
            if !self.directory.exists(peer)? {
                return Err(Error::NotFound(format!("identity {}", peer)));
            }
        }

        let mut message = Message {
            id: MessageId::generate(),
            seq: 0,
            sender: sender.clone(),
            target,
            body,
            created_at: crate::time::now_timestamp_millis(),
        };

        let repo = self.repo.clone();
        let draft = message.clone();
        let write = tokio::task::spawn_blocking(move || repo.append_message(&draft));
        message.seq = match tokio::time::timeout(self.config.persist_timeout, write).await {
            Ok(Ok(Ok(seq))) => seq,
            Ok(Ok(Err(e))) => {
                tracing::error!(message_id = %message.id, error = %e, "Message write failed");
                return Err(e);
            }
            Ok(Err(join_err)) => {
                tracing::error!(message_id = %message.id, error = %join_err, "Message write task failed");
                return Err(Error::StorageFailure(format!("write task failed: {}", join_err)));
            }
            Err(_) => {
                tracing::error!(
                    message_id = %message.id,
                    timeout_ms = self.config.persist_timeout.as_millis() as u64,
                    "Message write timed out"
                );
                return Err(Error::StorageFailure("message write timed out".into()));
            }
        };

        tracing::info!(
            message_id = %message.id,
            sender = %message.sender,
            target = %message.target,
            seq = message.seq,
            "Message stored"
        );

        let id = message.id.clone();
        let connections = self.connections.clone();
        let stats = self.stats.clone();
        tokio::spawn(async move {
            let targets = connections.senders_for(&message.target);
            #[cfg(feature = "verbose-logging")]
            tracing::trace!(message_id = %message.id, subscribers = targets.len(), "Fan-out");
            push_all(&stats, targets, &ChannelEvent::Message(message));
        });

        Ok(id)
    }

    /// Push a relationship change to every connection of `identity`.
    ///
    /// Not persisted; offline identities simply miss it.
    pub fn notify(&self, identity: &Identity, relationship: Relationship) {
        let targets = self.connections.senders_for(&Target::Peer(identity.clone()));
        push_all(&self.stats, targets, &ChannelEvent::RelationshipChanged(relationship));
    }

    /// Direct messages between `a` and `b`, oldest first.
    ///
    /// Symmetric: `history(a, b) == history(b, a)`.
    pub fn history(&self, a: &Identity, b: &Identity) -> Result<Vec<Message>> {
        self.repo.peer_history(&PairKey::new(a, b))
    }

    /// Messages sent to a room, oldest first
    pub fn room_history(&self, room: &RoomName) -> Result<Vec<Message>> {
        self.repo.room_history(room)
    }
}

// ============================================================================
// TESTS
// ============================================================================
