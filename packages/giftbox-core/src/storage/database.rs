//! # Database
//!
//! SQLite-backed implementation of every repository in the crate.
//!
//! ## Database Operations
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      DATABASE OPERATIONS                                │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────────┐                                                   │
//! │  │    Services     │  RelationshipStore, MessageChannel,               │
//! │  │                 │  FsMediaStore, WishService                        │
//! │  └────────┬────────┘                                                   │
//! │           │  repository traits                                         │
//! │           ▼                                                             │
//! │  ┌─────────────────┐                                                   │
//! │  │    Database     │  - IdentityDirectory                              │
//! │  │   (this file)   │  - RelationshipRepository                         │
//! │  │                 │  - MessageRepository                              │
//! │  │                 │  - MediaIndex, WishRepository                     │
//! │  └────────┬────────┘                                                   │
//! │           │  one connection, bounded lock wait + busy timeout          │
//! │           ▼                                                             │
//! │  ┌─────────────────┐                                                   │
//! │  │   SQLite DB     │  - In-memory for tests                            │
//! │  │                 │  - File (WAL) for production                      │
//! │  └─────────────────┘                                                   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use parking_lot::{Mutex, MutexGuard};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::Arc;
use std::time::Duration;

use super::schema;
use crate::error::{Error, Result};
use crate::friends::{Relationship, RelationshipRepository, RelationshipStatus};
use crate::identity::{
    generate_salt, password_digest, Credentials, Identity, IdentityDirectory, PairKey, RoomName,
};
use crate::media::{MediaIndex, MediaKind, MediaReference};
use crate::messaging::{Message, MessageBody, MessageId, MessageRepository, Target};
use crate::wish::{WishNote, WishRepository};

/// Default wait for the connection mutex
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

/// Default SQLite busy timeout
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Path to the database file (None for in-memory)
    pub path: Option<String>,
    /// How long a caller waits for the connection before failing
    pub lock_timeout: Duration,
    /// How long SQLite retries a locked database file
    pub busy_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }
}

/// The main database handle
///
/// Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct Database {
    /// The underlying SQLite connection
    conn: Arc<Mutex<Connection>>,
    lock_timeout: Duration,
}

impl Database {
    /// Open or create a database
    ///
    /// If path is None, creates an in-memory database (useful for testing).
    pub fn open(path: Option<&str>) -> Result<Self> {
        Self::open_with(&DatabaseConfig {
            path: path.map(str::to_string),
            ..DatabaseConfig::default()
        })
    }

    /// Open with explicit timeouts
    pub fn open_with(config: &DatabaseConfig) -> Result<Self> {
        let conn = match &config.path {
            Some(p) => {
                let conn = Connection::open(p)
                    .map_err(|e| Error::StorageFailure(format!("Failed to open database: {}", e)))?;
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))
                    .map_err(|e| Error::StorageFailure(format!("Failed to enable WAL: {}", e)))?;
                conn
            }
            None => Connection::open_in_memory().map_err(|e| {
                Error::StorageFailure(format!("Failed to create in-memory database: {}", e))
            })?,
        };
        conn.busy_timeout(config.busy_timeout)
            .map_err(|e| Error::StorageFailure(format!("Failed to set busy timeout: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            lock_timeout: config.lock_timeout,
        };

        // Initialize schema
        db.init_schema()?;

        Ok(db)
    }

    /// Lock the connection, giving up after the configured timeout
    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.try_lock_for(self.lock_timeout).ok_or_else(|| {
            tracing::warn!(timeout_ms = self.lock_timeout.as_millis() as u64, "Database lock wait timed out");
            Error::StorageFailure("database is busy".into())
        })
    }

    /// Initialize the database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;

        // Check current schema version
        let version: Option<i32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
            .ok();

        match version {
            None => {
                // Fresh database, create all tables
                conn.execute_batch(schema::CREATE_TABLES)
                    .map_err(|e| Error::StorageFailure(format!("Failed to create tables: {}", e)))?;

                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?)",
                    params![schema::SCHEMA_VERSION],
                )
                .map_err(|e| Error::StorageFailure(format!("Failed to set schema version: {}", e)))?;

                tracing::info!("Database schema created (version {})", schema::SCHEMA_VERSION);
            }
            Some(v) if v != schema::SCHEMA_VERSION => {
                return Err(Error::StorageFailure(format!(
                    "Database schema version {} is not supported (expected {})",
                    v,
                    schema::SCHEMA_VERSION
                )));
            }
            Some(v) => {
                tracing::debug!("Database schema version: {}", v);
            }
        }

        Ok(())
    }

    // ========================================================================
    // STATS
    // ========================================================================

    /// Row counts for `/stats`
    pub fn counts(&self) -> Result<DatabaseCounts> {
        let conn = self.conn()?;
        let count = |sql: &str| -> Result<u64> {
            conn.query_row(sql, [], |row| row.get::<_, i64>(0))
                .map(|n| n as u64)
                .map_err(|e| Error::StorageFailure(format!("Failed to count rows: {}", e)))
        };
        Ok(DatabaseCounts {
            users: count("SELECT COUNT(*) FROM users")?,
            friendships: count("SELECT COUNT(*) FROM relationships WHERE status = 'accepted'")?,
            pending_requests: count("SELECT COUNT(*) FROM relationships WHERE status = 'pending'")?,
            messages: count("SELECT COUNT(*) FROM messages")?,
            media: count("SELECT COUNT(*) FROM media")?,
        })
    }
}

/// Row counts reported by the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct DatabaseCounts {
    pub users: u64,
    pub friendships: u64,
    pub pending_requests: u64,
    pub messages: u64,
    pub media: u64,
}

// ============================================================================
// ROW HELPERS
// ============================================================================

/// Read a text column and convert it, surfacing bad data as a conversion error
fn text_column<T>(row: &Row<'_>, idx: usize, parse: impl FnOnce(&str) -> Result<T>) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn identity_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Identity> {
    text_column(row, idx, Identity::parse)
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

// ============================================================================
// IDENTITY DIRECTORY
// ============================================================================

impl IdentityDirectory for Database {
    fn register(&self, credentials: &Credentials) -> Result<Identity> {
        let identity = Identity::parse(&credentials.username)?;
        if credentials.password.trim().is_empty() {
            return Err(Error::InvalidOperation("password must not be blank".into()));
        }

        let salt = generate_salt();
        let digest = password_digest(&salt, &credentials.password);
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO users (name, password_salt, password_hash, created_at) VALUES (?, ?, ?, ?)",
            params![identity.as_str(), hex::encode(salt), digest, crate::time::now_timestamp()],
        )
        .map_err(|e| {
            if is_unique_violation(&e) {
                Error::AlreadyExists(format!("identity {}", identity))
            } else {
                Error::StorageFailure(format!("Failed to register identity: {}", e))
            }
        })?;

        tracing::info!(identity = %identity, "Identity registered");
        Ok(identity)
    }

    fn authenticate(&self, credentials: &Credentials) -> Result<Identity> {
        let identity = Identity::parse(&credentials.username)
            .map_err(|_| Error::AuthenticationFailed)?;

        let conn = self.conn()?;
        let stored: Option<(String, String)> = conn
            .query_row(
                "SELECT password_salt, password_hash FROM users WHERE name = ?",
                params![identity.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|e| Error::StorageFailure(format!("Failed to load credentials: {}", e)))?;

        let (salt_hex, expected) = stored.ok_or(Error::AuthenticationFailed)?;
        let salt = hex::decode(&salt_hex)
            .map_err(|e| Error::StorageFailure(format!("Corrupt credential salt: {}", e)))?;

        if password_digest(&salt, &credentials.password) != expected {
            tracing::debug!(identity = %identity, "Password mismatch");
            return Err(Error::AuthenticationFailed);
        }
        Ok(identity)
    }

    fn exists(&self, identity: &Identity) -> Result<bool> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM users WHERE name = ?)",
            params![identity.as_str()],
            |row| row.get(0),
        )
        .map_err(|e| Error::StorageFailure(format!("Failed to look up identity: {}", e)))
    }
}

// ============================================================================
// RELATIONSHIP OPERATIONS
// ============================================================================

const RELATIONSHIP_COLUMNS: &str =
    "id, requester, addressee, status, created_at, responded_at, seq";

fn relationship_from_row(row: &Row<'_>) -> rusqlite::Result<Relationship> {
    Ok(Relationship {
        id: row.get(0)?,
        requester: identity_column(row, 1)?,
        addressee: identity_column(row, 2)?,
        status: text_column(row, 3, |s| {
            RelationshipStatus::parse(s)
                .ok_or_else(|| Error::StorageFailure(format!("unknown relationship status {:?}", s)))
        })?,
        created_at: row.get(4)?,
        responded_at: row.get(5)?,
        seq: row.get(6)?,
    })
}

impl RelationshipRepository for Database {
    fn insert_relationship(&self, relationship: &Relationship) -> Result<i64> {
        let pair = relationship.pair();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO relationships (id, requester, addressee, pair_low, pair_high, status, created_at, responded_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                relationship.id,
                relationship.requester.as_str(),
                relationship.addressee.as_str(),
                pair.low().as_str(),
                pair.high().as_str(),
                relationship.status.as_str(),
                relationship.created_at,
                relationship.responded_at,
            ],
        )
        .map_err(|e| {
            if is_unique_violation(&e) {
                Error::AlreadyExists(format!("live relationship for {}", pair))
            } else {
                Error::StorageFailure(format!("Failed to insert relationship: {}", e))
            }
        })?;

        Ok(conn.last_insert_rowid())
    }

    fn live_relationship(&self, pair: &PairKey) -> Result<Option<Relationship>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!(
                "SELECT {} FROM relationships
                 WHERE pair_low = ? AND pair_high = ? AND status != 'rejected'",
                RELATIONSHIP_COLUMNS
            ),
            params![pair.low().as_str(), pair.high().as_str()],
            relationship_from_row,
        )
        .optional()
        .map_err(|e| Error::StorageFailure(format!("Failed to load relationship: {}", e)))
    }

    fn resolve_relationship(
        &self,
        id: &str,
        status: RelationshipStatus,
        responded_at: i64,
    ) -> Result<bool> {
        if status == RelationshipStatus::Pending {
            return Err(Error::InvalidOperation("cannot move a relationship back to pending".into()));
        }
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE relationships SET status = ?, responded_at = ?
                 WHERE id = ? AND status = 'pending'",
                params![status.as_str(), responded_at, id],
            )
            .map_err(|e| Error::StorageFailure(format!("Failed to update relationship: {}", e)))?;
        Ok(changed == 1)
    }

    fn accepted_peers(&self, of: &Identity) -> Result<Vec<Identity>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT CASE WHEN requester = ?1 THEN addressee ELSE requester END
                 FROM relationships
                 WHERE (requester = ?1 OR addressee = ?1) AND status = 'accepted'",
            )
            .map_err(|e| Error::StorageFailure(format!("Failed to prepare query: {}", e)))?;

        let peers = stmt
            .query_map(params![of.as_str()], |row| identity_column(row, 0))
            .map_err(|e| Error::StorageFailure(format!("Failed to query friends: {}", e)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(peers)
    }

    fn pending_page(
        &self,
        addressee: &Identity,
        after: Option<(i64, i64)>,
        limit: usize,
    ) -> Result<Vec<Relationship>> {
        let (after_created, after_seq) = after.unwrap_or((i64::MIN, i64::MIN));
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM relationships
                 WHERE addressee = ?1 AND status = 'pending'
                   AND (created_at > ?2 OR (created_at = ?2 AND seq > ?3))
                 ORDER BY created_at ASC, seq ASC
                 LIMIT ?4",
                RELATIONSHIP_COLUMNS
            ))
            .map_err(|e| Error::StorageFailure(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map(
                params![addressee.as_str(), after_created, after_seq, limit as i64],
                relationship_from_row,
            )
            .map_err(|e| Error::StorageFailure(format!("Failed to query pending requests: {}", e)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn outgoing_pending(&self, requester: &Identity) -> Result<Vec<Relationship>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM relationships
                 WHERE requester = ? AND status = 'pending'
                 ORDER BY created_at ASC, seq ASC",
                RELATIONSHIP_COLUMNS
            ))
            .map_err(|e| Error::StorageFailure(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map(params![requester.as_str()], relationship_from_row)
            .map_err(|e| Error::StorageFailure(format!("Failed to query outgoing requests: {}", e)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

// ============================================================================
// MESSAGE OPERATIONS
// ============================================================================

const MESSAGE_COLUMNS: &str = "id, seq, sender, target_kind, target, body_text, attachment, created_at";

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    let kind: String = row.get(3)?;
    Ok(Message {
        id: MessageId::from_stored(row.get(0)?),
        seq: row.get(1)?,
        sender: identity_column(row, 2)?,
        target: text_column(row, 4, |name| Target::from_parts(&kind, name))?,
        body: MessageBody {
            text: row.get(5)?,
            attachment: row.get(6)?,
        },
        created_at: row.get(7)?,
    })
}

impl Database {
    fn query_messages(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<Message>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| Error::StorageFailure(format!("Failed to prepare query: {}", e)))?;
        let rows = stmt
            .query_map(args, message_from_row)
            .map_err(|e| Error::StorageFailure(format!("Failed to query messages: {}", e)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

impl MessageRepository for Database {
    fn append_message(&self, message: &Message) -> Result<i64> {
        let pair = match &message.target {
            Target::Peer(peer) => Some(PairKey::new(&message.sender, peer)),
            Target::Room(_) => None,
        };
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO messages (id, sender, target_kind, target, pair_low, pair_high, body_text, attachment, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                message.id.as_str(),
                message.sender.as_str(),
                message.target.kind(),
                message.target.name(),
                pair.as_ref().map(|p| p.low().as_str()),
                pair.as_ref().map(|p| p.high().as_str()),
                message.body.text,
                message.body.attachment,
                message.created_at,
            ],
        )
        .map_err(|e| Error::StorageFailure(format!("Failed to store message: {}", e)))?;

        Ok(conn.last_insert_rowid())
    }

    fn peer_history(&self, pair: &PairKey) -> Result<Vec<Message>> {
        self.query_messages(
            &format!(
                "SELECT {} FROM messages
                 WHERE target_kind = 'peer' AND pair_low = ? AND pair_high = ?
                 ORDER BY created_at ASC, seq ASC",
                MESSAGE_COLUMNS
            ),
            &[&pair.low().as_str(), &pair.high().as_str()],
        )
    }

    fn room_history(&self, room: &RoomName) -> Result<Vec<Message>> {
        self.query_messages(
            &format!(
                "SELECT {} FROM messages
                 WHERE target_kind = 'room' AND target = ?
                 ORDER BY created_at ASC, seq ASC",
                MESSAGE_COLUMNS
            ),
            &[&room.as_str()],
        )
    }
}

// ============================================================================
// MEDIA OPERATIONS
// ============================================================================

const MEDIA_COLUMNS: &str =
    "id, owner, kind, filename, content_type, size, caption, poster, created_at";

fn media_from_row(row: &Row<'_>) -> rusqlite::Result<MediaReference> {
    Ok(MediaReference {
        id: row.get(0)?,
        owner: identity_column(row, 1)?,
        kind: text_column(row, 2, |s| {
            MediaKind::parse(s).ok_or_else(|| Error::StorageFailure(format!("unknown media kind {:?}", s)))
        })?,
        filename: row.get(3)?,
        content_type: row.get(4)?,
        size: row.get::<_, i64>(5)? as u64,
        caption: row.get(6)?,
        poster: row.get(7)?,
        created_at: row.get(8)?,
    })
}

impl MediaIndex for Database {
    fn insert_media(&self, reference: &MediaReference) -> Result<MediaReference> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO media (id, owner, kind, filename, content_type, size, caption, poster, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (owner, kind, filename) DO NOTHING",
            params![
                reference.id,
                reference.owner.as_str(),
                reference.kind.as_str(),
                reference.filename,
                reference.content_type,
                reference.size as i64,
                reference.caption,
                reference.poster,
                reference.created_at,
            ],
        )
        .map_err(|e| Error::StorageFailure(format!("Failed to index media: {}", e)))?;

        conn.query_row(
            &format!(
                "SELECT {} FROM media WHERE owner = ? AND kind = ? AND filename = ?",
                MEDIA_COLUMNS
            ),
            params![reference.owner.as_str(), reference.kind.as_str(), reference.filename],
            media_from_row,
        )
        .map_err(|e| Error::StorageFailure(format!("Failed to load media: {}", e)))
    }

    fn media_for(&self, owner: &Identity, kind: MediaKind) -> Result<Vec<MediaReference>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM media WHERE owner = ? AND kind = ? ORDER BY created_at ASC, rowid ASC",
                MEDIA_COLUMNS
            ))
            .map_err(|e| Error::StorageFailure(format!("Failed to prepare query: {}", e)))?;
        let rows = stmt
            .query_map(params![owner.as_str(), kind.as_str()], media_from_row)
            .map_err(|e| Error::StorageFailure(format!("Failed to query media: {}", e)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn media_by_id(&self, id: &str) -> Result<Option<MediaReference>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM media WHERE id = ?", MEDIA_COLUMNS),
            params![id],
            media_from_row,
        )
        .optional()
        .map_err(|e| Error::StorageFailure(format!("Failed to load media: {}", e)))
    }

    fn media_by_filename(&self, owner: &Identity, filename: &str) -> Result<Option<MediaReference>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!(
                "SELECT {} FROM media WHERE owner = ? AND filename = ? LIMIT 1",
                MEDIA_COLUMNS
            ),
            params![owner.as_str(), filename],
            media_from_row,
        )
        .optional()
        .map_err(|e| Error::StorageFailure(format!("Failed to load media: {}", e)))
    }

    fn set_media_poster(&self, id: &str, poster: Option<&str>) -> Result<bool> {
        let conn = self.conn()?;
        let updated = conn
            .execute("UPDATE media SET poster = ? WHERE id = ?", params![poster, id])
            .map_err(|e| Error::StorageFailure(format!("Failed to set poster: {}", e)))?;
        Ok(updated > 0)
    }
}

// ============================================================================
// WISH OPERATIONS
// ============================================================================

impl WishRepository for Database {
    fn wish_note(&self, owner: &Identity) -> Result<Option<WishNote>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT note, updated_at FROM wishes WHERE owner = ?",
            params![owner.as_str()],
            |row| {
                Ok(WishNote {
                    note: row.get(0)?,
                    updated_at: row.get(1)?,
                })
            },
        )
        .optional()
        .map_err(|e| Error::StorageFailure(format!("Failed to load wish note: {}", e)))
    }

    fn put_wish_note(&self, owner: &Identity, note: &WishNote) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO wishes (owner, note, updated_at) VALUES (?, ?, ?)
             ON CONFLICT (owner) DO UPDATE SET note = excluded.note, updated_at = excluded.updated_at",
            params![owner.as_str(), note.note, note.updated_at],
        )
        .map_err(|e| Error::StorageFailure(format!("Failed to save wish note: {}", e)))?;
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
