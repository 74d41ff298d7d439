//! Server state management.
//!
//! Wraps the Giftbox core services and tracks bearer-token sessions.
//! Sessions live in a DashMap and expire after a fixed TTL.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use giftbox_core::{
    ChannelConfig, CoreConfig, DatabaseConfig, Error, Giftbox, Identity, MessageBody, MessageId,
    Relationship, Result, Target,
};
use rand::RngCore;

/// Default session TTL in seconds (24 hours).
const DEFAULT_SESSION_TTL_SECS: i64 = 24 * 3600;

/// Default per-connection push queue size.
const DEFAULT_PUSH_QUEUE_CAPACITY: usize = 256;

/// Default message write timeout in milliseconds.
const DEFAULT_PERSIST_TIMEOUT_MS: u64 = 5_000;

/// Session token length in bytes (hex encoded on the wire).
const TOKEN_BYTES: usize = 32;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub port: u16,
    /// Root for uploaded media
    pub data_dir: PathBuf,
    /// SQLite file; None keeps everything in memory
    pub database: Option<String>,
    pub session_ttl_secs: i64,
    pub push_queue_capacity: usize,
    pub persist_timeout_ms: u64,
    /// Direct messages need an accepted friendship
    pub friends_only_messaging: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            data_dir: PathBuf::from("./data"),
            database: None,
            session_ttl_secs: DEFAULT_SESSION_TTL_SECS,
            push_queue_capacity: DEFAULT_PUSH_QUEUE_CAPACITY,
            persist_timeout_ms: DEFAULT_PERSIST_TIMEOUT_MS,
            friends_only_messaging: true,
        }
    }
}

/// A logged-in client.
#[derive(Debug, Clone)]
pub struct Session {
    pub identity: Identity,
    pub expires_at: i64,
}

/// Shared server state.
#[derive(Clone)]
pub struct RelayState {
    /// Core services (directory, relationships, channel, media, wishes).
    pub core: Arc<Giftbox>,

    /// Token → session.
    pub sessions: Arc<DashMap<String, Session>>,

    /// Server configuration.
    pub config: Arc<RelayConfig>,
}

impl RelayState {
    /// Open the core services and create an empty session table.
    pub fn new(config: RelayConfig) -> Result<Self> {
        let core = Giftbox::open(CoreConfig {
            database: DatabaseConfig {
                path: config.database.clone(),
                ..DatabaseConfig::default()
            },
            channel: ChannelConfig {
                queue_capacity: config.push_queue_capacity,
                persist_timeout: Duration::from_millis(config.persist_timeout_ms),
            },
            data_dir: config.data_dir.clone(),
        })?;

        Ok(Self {
            core: Arc::new(core),
            sessions: Arc::new(DashMap::new()),
            config: Arc::new(config),
        })
    }

    // ── Sessions ──────────────────────────────────────────────────────────

    /// Issue a new bearer token for an authenticated identity.
    pub fn create_session(&self, identity: &Identity) -> String {
        let mut bytes = [0u8; TOKEN_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token = hex::encode(bytes);

        self.sessions.insert(
            token.clone(),
            Session {
                identity: identity.clone(),
                expires_at: giftbox_core::time::now_timestamp() + self.config.session_ttl_secs,
            },
        );
        tracing::info!(identity = %identity, "Session created");
        token
    }

    /// Look up the identity behind a token, dropping it if expired.
    pub fn resolve_session(&self, token: &str) -> Option<Identity> {
        let now = giftbox_core::time::now_timestamp();
        let identity = {
            let session = self.sessions.get(token)?;
            if session.expires_at > now {
                Some(session.identity.clone())
            } else {
                None
            }
        };
        if identity.is_none() {
            self.sessions.remove(token);
        }
        identity
    }

    /// Revoke a token. Returns false if it was unknown.
    pub fn revoke_session(&self, token: &str) -> bool {
        self.sessions.remove(token).is_some()
    }

    /// Remove expired sessions.
    /// Called periodically by the cleanup task.
    pub fn cleanup_expired(&self) -> usize {
        let now = giftbox_core::time::now_timestamp();
        let before = self.sessions.len();
        self.sessions.retain(|_, session| session.expires_at > now);
        let removed = before.saturating_sub(self.sessions.len());

        if removed > 0 {
            tracing::debug!(count = removed, "Cleaned up expired sessions");
        }
        removed
    }

    // ── Friends ───────────────────────────────────────────────────────────

    /// Create a friend request and tell the addressee if they are online.
    pub fn request_friend(&self, from: &Identity, to: &Identity) -> Result<Relationship> {
        let relationship = self.core.relationships.request(from, to)?;
        self.core.channel.notify(to, relationship.clone());
        Ok(relationship)
    }

    /// Answer a friend request and tell the requester if they are online.
    pub fn respond_friend(&self, me: &Identity, from: &Identity, accept: bool) -> Result<Relationship> {
        let relationship = self.core.relationships.respond(me, from, accept)?;
        self.core.channel.notify(from, relationship.clone());
        Ok(relationship)
    }

    // ── Messaging ─────────────────────────────────────────────────────────

    /// Apply relay policy, then hand the message to the delivery channel.
    pub async fn send_message(
        &self,
        sender: &Identity,
        target: Target,
        body: MessageBody,
    ) -> Result<MessageId> {
        if let Target::Peer(peer) = &target {
            if self.config.friends_only_messaging
                && peer != sender
                && self.core.directory.exists(peer)?
                && !self.core.relationships.are_friends(sender, peer)?
            {
                return Err(Error::AuthorizationDenied(format!(
                    "{} and {} are not friends",
                    sender, peer
                )));
            }
        }

        if let Some(media_id) = body.attachment.as_deref().map(str::trim).filter(|a| !a.is_empty()) {
            let media = self
                .core
                .media
                .get(media_id)?
                .ok_or_else(|| Error::NotFound(format!("media {}", media_id)))?;
            if &media.owner != sender {
                return Err(Error::AuthorizationDenied(
                    "attachments must be your own uploads".into(),
                ));
            }
        }

        self.core.channel.send(sender, target, body).await
    }
}
