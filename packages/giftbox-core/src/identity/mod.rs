//! # Identity Module
//!
//! Names, credentials and the directory that owns accounts.
//!
//! ## Naming Rules
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         IDENTITY NAMES                                  │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  "  alice  "  ──trim──►  "alice"  ──validate──►  Identity("alice")     │
//! │                                                                         │
//! │  • 1..=32 characters after trimming                                    │
//! │  • ASCII letters, digits, '_', '-', '.'                                │
//! │  • Compared and ordered byte-wise ("Bob" < "alice")                    │
//! │                                                                         │
//! │  Room names follow the same rules but live in a separate namespace,    │
//! │  so a room called "alice" never collides with the identity "alice".    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The directory itself is a trait so the relationship store and the
//! delivery channel can be exercised against any backend. The SQLite
//! [`Database`](crate::storage::Database) is the production implementation.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Maximum length of an identity or room name, in characters
pub const MAX_NAME_LEN: usize = 32;

/// Length of the random salt mixed into credential digests
pub const SALT_LEN: usize = 16;

fn validate_name(raw: &str, what: &str) -> Result<String> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(Error::InvalidIdentity(format!("{} must not be empty", what)));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(Error::InvalidIdentity(format!(
            "{} must be at most {} characters",
            what, MAX_NAME_LEN
        )));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
    {
        return Err(Error::InvalidIdentity(format!(
            "{} contains invalid character {:?}",
            what, bad
        )));
    }
    Ok(name.to_string())
}

// ============================================================================
// IDENTITY
// ============================================================================

/// A uniquely named account
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity(String);

impl Identity {
    /// Parse an identity from user input
    pub fn parse(raw: &str) -> Result<Self> {
        validate_name(raw, "identity").map(Self)
    }

    /// The identity's name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Identity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Identity {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Identity> for String {
    fn from(identity: Identity) -> Self {
        identity.0
    }
}

// ============================================================================
// ROOM NAME
// ============================================================================

/// Name of a broadcast room
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomName(String);

impl RoomName {
    /// Parse a room name from user input
    pub fn parse(raw: &str) -> Result<Self> {
        validate_name(raw, "room name").map(Self)
    }

    /// The room's name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RoomName {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<RoomName> for String {
    fn from(room: RoomName) -> Self {
        room.0
    }
}

// ============================================================================
// PAIR KEY
// ============================================================================

/// Canonical key for an unordered pair of identities
///
/// `PairKey::new(a, b) == PairKey::new(b, a)`. Relationships and direct
/// message history are both indexed by this key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PairKey {
    low: Identity,
    high: Identity,
}

impl PairKey {
    /// Canonicalise two identities into a pair key
    pub fn new(a: &Identity, b: &Identity) -> Self {
        if a <= b {
            Self { low: a.clone(), high: b.clone() }
        } else {
            Self { low: b.clone(), high: a.clone() }
        }
    }

    /// The lexicographically smaller identity
    pub fn low(&self) -> &Identity {
        &self.low
    }

    /// The lexicographically larger identity
    pub fn high(&self) -> &Identity {
        &self.high
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<->{}", self.low, self.high)
    }
}

// ============================================================================
// CREDENTIALS & DIRECTORY
// ============================================================================

/// Username and password as submitted by a client
#[derive(Clone, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self { username: username.into(), password: password.into() }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Account registry consulted by every other service
pub trait IdentityDirectory: Send + Sync {
    /// Create an account.
    ///
    /// Fails with `AlreadyExists` if the name is taken, `InvalidIdentity` for a
    /// malformed name and `InvalidOperation` for a blank password.
    fn register(&self, credentials: &Credentials) -> Result<Identity>;

    /// Check credentials, returning the identity they belong to
    fn authenticate(&self, credentials: &Credentials) -> Result<Identity>;

    /// Whether an account with this name exists
    fn exists(&self, identity: &Identity) -> Result<bool>;
}

/// Fresh random salt for a credential digest
pub(crate) fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Hex SHA-256 over `salt || password`
pub(crate) fn password_digest(salt: &[u8], password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_trims_input() {
        let id = Identity::parse("  alice \n").unwrap();
        assert_eq!(id.as_str(), "alice");
    }

    #[test]
    fn test_identity_rejects_bad_names() {
        assert!(matches!(Identity::parse("   "), Err(Error::InvalidIdentity(_))));
        assert!(matches!(Identity::parse("a b"), Err(Error::InvalidIdentity(_))));
        assert!(matches!(Identity::parse("bob/../x"), Err(Error::InvalidIdentity(_))));
        assert!(Identity::parse(&"x".repeat(MAX_NAME_LEN)).is_ok());
        assert!(Identity::parse(&"x".repeat(MAX_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn test_identity_serde_validates() {
        let id: Identity = serde_json::from_str("\"carol.k\"").unwrap();
        assert_eq!(id.as_str(), "carol.k");
        assert!(serde_json::from_str::<Identity>("\"no spaces\"").is_err());
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"carol.k\"");
    }

    #[test]
    fn test_pair_key_is_unordered() {
        let a = Identity::parse("alice").unwrap();
        let b = Identity::parse("bob").unwrap();
        let ab = PairKey::new(&a, &b);
        let ba = PairKey::new(&b, &a);

        assert_eq!(ab, ba);
        assert_eq!(ab.low(), &a);
        assert_eq!(ab.high(), &b);
    }

    #[test]
    fn test_password_digest_depends_on_salt() {
        let salt_a = generate_salt();
        let salt_b = generate_salt();
        assert_ne!(salt_a, salt_b);
        assert_eq!(password_digest(&salt_a, "pw"), password_digest(&salt_a, "pw"));
        assert_ne!(password_digest(&salt_a, "pw"), password_digest(&salt_b, "pw"));
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let creds = Credentials::new("alice", "hunter2");
        let shown = format!("{:?}", creds);
        assert!(shown.contains("alice"));
        assert!(!shown.contains("hunter2"));
    }
}
