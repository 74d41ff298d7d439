//! # Giftbox Core
//!
//! The social core of a birthday-gift site: accounts, friend requests,
//! realtime messaging, uploaded media and public wish pages.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        GIFTBOX CORE MODULES                             │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐  ┌──────────────┐   │
//! │  │  Identity   │  │   Friends   │  │  Messaging  │  │  Media/Wish  │   │
//! │  │             │  │             │  │             │  │              │   │
//! │  │ - Names     │  │ - Request   │  │ - Log       │  │ - Uploads    │   │
//! │  │ - Directory │  │ - Respond   │  │ - Fan-out   │  │ - Wish page  │   │
//! │  │ - Pair keys │  │ - Queries   │  │ - Conns     │  │              │   │
//! │  └──────┬──────┘  └──────┬──────┘  └──────┬──────┘  └──────┬───────┘   │
//! │         │                │                │                │           │
//! │         └────────────────┴───────┬────────┴────────────────┘           │
//! │                                  │ repository traits                    │
//! │                        ┌─────────▼─────────┐                            │
//! │                        │      Storage      │                            │
//! │                        │  SQLite + files   │                            │
//! │                        └───────────────────┘                            │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Hierarchy
//!
//! - [`error`] - Error types for the entire library
//! - [`identity`] - Identity names, credentials, the identity directory
//! - [`friends`] - Relationship store (request / respond / queries)
//! - [`messaging`] - Message log, connection manager, delivery channel
//! - [`media`] - Photo / video / audio storage
//! - [`wish`] - Public wish pages
//! - [`storage`] - SQLite backend for all of the above
//!
//! Services talk to storage through traits, so every piece can be wired
//! against a different backend. [`Giftbox`] wires them all to one
//! [`storage::Database`].

pub mod error;
pub mod friends;
pub mod identity;
pub mod media;
pub mod messaging;
pub mod storage;
pub mod time;
pub mod wish;

pub use error::{Error, Result};
pub use friends::{PendingRequests, Relationship, RelationshipStatus, RelationshipStore};
pub use identity::{Credentials, Identity, IdentityDirectory, PairKey, RoomName};
pub use media::{FsMediaStore, MediaKind, MediaReference, MediaStore};
pub use messaging::{
    ChannelConfig, ChannelEvent, ConnectionId, ConnectionManager, Message, MessageBody, MessageChannel,
    MessageId, Target,
};
pub use storage::{Database, DatabaseConfig};
pub use wish::{WishPage, WishService};

use std::path::PathBuf;
use std::sync::Arc;

/// Configuration for [`Giftbox::open`]
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub database: DatabaseConfig,
    pub channel: ChannelConfig,
    /// Root for uploaded media
    pub data_dir: PathBuf,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            channel: ChannelConfig::default(),
            data_dir: PathBuf::from("./data"),
        }
    }
}

/// Every service, wired to a single database
pub struct Giftbox {
    pub database: Arc<Database>,
    pub directory: Arc<dyn IdentityDirectory>,
    pub relationships: RelationshipStore,
    pub channel: MessageChannel,
    pub media: Arc<dyn MediaStore>,
    pub wishes: WishService,
}

impl Giftbox {
    pub fn open(config: CoreConfig) -> Result<Self> {
        tracing::info!("Opening Giftbox Core v{}", version());

        let database = Arc::new(Database::open_with(&config.database)?);
        let directory: Arc<dyn IdentityDirectory> = database.clone();
        let media: Arc<dyn MediaStore> =
            Arc::new(FsMediaStore::new(&config.data_dir, database.clone()));

        Ok(Self {
            relationships: RelationshipStore::new(database.clone(), directory.clone()),
            channel: MessageChannel::new(database.clone(), directory.clone(), config.channel),
            wishes: WishService::new(database.clone(), directory.clone(), media.clone()),
            database,
            directory,
            media,
        })
    }
}

/// Returns the version of Giftbox Core
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }

    #[test]
    fn test_open_wires_shared_database() {
        let dir = tempfile::tempdir().unwrap();
        let giftbox = Giftbox::open(CoreConfig {
            data_dir: dir.path().to_path_buf(),
            ..CoreConfig::default()
        })
        .unwrap();

        let alice = giftbox.directory.register(&Credentials::new("alice", "pw")).unwrap();
        giftbox.directory.register(&Credentials::new("bob", "pw")).unwrap();
        giftbox
            .relationships
            .request(&alice, &Identity::parse("bob").unwrap())
            .unwrap();

        let counts = giftbox.database.counts().unwrap();
        assert_eq!(counts.users, 2);
        assert_eq!(counts.pending_requests, 1);
    }
}
