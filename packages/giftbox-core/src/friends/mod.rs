//! # Friends Module
//!
//! Durable pairwise relationships and the friend-request state machine.
//!
//! ## Relationship Lifecycle
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      RELATIONSHIP LIFECYCLE                             │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Alice (requester)                           Bob (addressee)           │
//! │  ─────────────────────────────────────────────────────────────         │
//! │                                                                         │
//! │  request(alice, bob)                                                   │
//! │  ┌─────────────────────┐                                               │
//! │  │ Relationship {      │                                               │
//! │  │   requester: alice, │  ──────────────────►  list_pending(bob)       │
//! │  │   addressee: bob,   │                       yields "alice"          │
//! │  │   status: pending   │                                               │
//! │  │ }                   │                                               │
//! │  └─────────────────────┘                                               │
//! │                                                respond(bob, alice, ?)  │
//! │                                                ┌─────────────────┐     │
//! │                                                │ accept / reject │     │
//! │                                                └────────┬────────┘     │
//! │                          ┌──────────────────────────────┴──────┐       │
//! │                          ▼                                     ▼       │
//! │                 ┌─────────────────┐                 ┌─────────────────┐│
//! │                 │    accepted     │                 │    rejected     ││
//! │                 │ friends forever │                 │ kept as history ││
//! │                 └─────────────────┘                 │ pair is free    ││
//! │                                                     └─────────────────┘│
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Concurrency
//!
//! Every `request` / `respond` touching a pair runs under that pair's mutex.
//! Storage backs this up twice: a partial unique index allows one live
//! (non-rejected) row per pair, and transitions are conditional updates that
//! only match rows still in `pending`.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::identity::{Identity, IdentityDirectory, PairKey};

/// Rows fetched per storage round-trip by [`PendingRequests`]
pub const DEFAULT_PENDING_PAGE_SIZE: usize = 50;

// ============================================================================
// TYPES
// ============================================================================

/// Status of a relationship
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipStatus {
    /// Requested, awaiting the addressee
    Pending,
    /// Accepted by the addressee
    Accepted,
    /// Rejected by the addressee
    Rejected,
}

impl RelationshipStatus {
    /// Convert to string for database storage
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipStatus::Pending => "pending",
            RelationshipStatus::Accepted => "accepted",
            RelationshipStatus::Rejected => "rejected",
        }
    }

    /// Parse from database string
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RelationshipStatus::Pending),
            "accepted" => Some(RelationshipStatus::Accepted),
            "rejected" => Some(RelationshipStatus::Rejected),
            _ => None,
        }
    }

    /// Whether this status still occupies the pair
    pub fn is_live(&self) -> bool {
        !matches!(self, RelationshipStatus::Rejected)
    }
}

/// A friend request and, once answered, its outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Relationship {
    pub id: String,
    pub requester: Identity,
    pub addressee: Identity,
    pub status: RelationshipStatus,
    /// Unix milliseconds
    pub created_at: i64,
    /// Unix milliseconds, set on accept or reject
    pub responded_at: Option<i64>,
    /// Insertion order assigned by storage
    pub seq: i64,
}

impl Relationship {
    /// The canonical pair this relationship belongs to
    pub fn pair(&self) -> PairKey {
        PairKey::new(&self.requester, &self.addressee)
    }
}

/// Persistence for relationships
pub trait RelationshipRepository: Send + Sync {
    /// Insert a new pending relationship, returning its `seq`.
    ///
    /// Fails with `AlreadyExists` if the pair already has a live row.
    fn insert_relationship(&self, relationship: &Relationship) -> Result<i64>;

    /// The live (pending or accepted) relationship for a pair, if any
    fn live_relationship(&self, pair: &PairKey) -> Result<Option<Relationship>>;

    /// Move a relationship out of `pending`.
    ///
    /// Returns `false` if the row was no longer pending.
    fn resolve_relationship(
        &self,
        id: &str,
        status: RelationshipStatus,
        responded_at: i64,
    ) -> Result<bool>;

    /// Identities with an accepted relationship with `of`
    fn accepted_peers(&self, of: &Identity) -> Result<Vec<Identity>>;

    /// Pending requests addressed to `addressee`, ordered by
    /// `(created_at, seq)` and strictly after `after` when given
    fn pending_page(
        &self,
        addressee: &Identity,
        after: Option<(i64, i64)>,
        limit: usize,
    ) -> Result<Vec<Relationship>>;

    /// Pending requests sent by `requester`, oldest first
    fn outgoing_pending(&self, requester: &Identity) -> Result<Vec<Relationship>>;
}

// ============================================================================
// PENDING REQUESTS SEQUENCE
// ============================================================================

/// Lazy, restartable view over the requesters waiting on an identity
///
/// Nothing is read until iteration starts. Each call to [`iter`](Self::iter)
/// starts again from the oldest request and sees the state of storage as it
/// pages through it.
pub struct PendingRequests {
    repo: Arc<dyn RelationshipRepository>,
    addressee: Identity,
    page_size: usize,
}

impl PendingRequests {
    /// Start a fresh pass over the pending requesters
    pub fn iter(&self) -> PendingIter<'_> {
        PendingIter {
            source: self,
            buffer: VecDeque::new(),
            cursor: None,
            done: false,
        }
    }

    /// Drain one full pass into a vector
    pub fn requesters(&self) -> Result<Vec<Identity>> {
        self.iter().collect()
    }
}

impl<'a> IntoIterator for &'a PendingRequests {
    type Item = Result<Identity>;
    type IntoIter = PendingIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// One pass over [`PendingRequests`]
pub struct PendingIter<'a> {
    source: &'a PendingRequests,
    buffer: VecDeque<Relationship>,
    cursor: Option<(i64, i64)>,
    done: bool,
}

impl Iterator for PendingIter<'_> {
    type Item = Result<Identity>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.done {
            let page = self.source.repo.pending_page(
                &self.source.addressee,
                self.cursor,
                self.source.page_size,
            );
            match page {
                Ok(rows) => {
                    if rows.len() < self.source.page_size {
                        self.done = true;
                    }
                    if let Some(last) = rows.last() {
                        self.cursor = Some((last.created_at, last.seq));
                    }
                    self.buffer.extend(rows);
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }

        self.buffer.pop_front().map(|rel| Ok(rel.requester))
    }
}

// ============================================================================
// RELATIONSHIP STORE
// ============================================================================

/// The friend-request state machine
pub struct RelationshipStore {
    repo: Arc<dyn RelationshipRepository>,
    directory: Arc<dyn IdentityDirectory>,
    /// Per-pair mutexes, dropped again once nobody holds them
    pair_locks: DashMap<PairKey, Arc<Mutex<()>>>,
    page_size: usize,
}

impl RelationshipStore {
    pub fn new(
        repo: Arc<dyn RelationshipRepository>,
        directory: Arc<dyn IdentityDirectory>,
    ) -> Self {
        Self {
            repo,
            directory,
            pair_locks: DashMap::new(),
            page_size: DEFAULT_PENDING_PAGE_SIZE,
        }
    }

    /// Override how many rows `list_pending` fetches per page
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn with_pair_lock<T>(&self, pair: &PairKey, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock = self.pair_locks.entry(pair.clone()).or_default().clone();
        let result = {
            let _guard = lock.lock();
            f()
        };
        drop(lock);
        self.pair_locks
            .remove_if(pair, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    /// Ask `to` to become friends with `from`
    pub fn request(&self, from: &Identity, to: &Identity) -> Result<Relationship> {
        if from == to {
            return Err(Error::InvalidOperation(
                "cannot send a friend request to yourself".into(),
            ));
        }
        if !self.directory.exists(to)? {
            return Err(Error::NotFound(format!("identity {}", to)));
        }

        let pair = PairKey::new(from, to);
        self.with_pair_lock(&pair, || {
            if let Some(existing) = self.repo.live_relationship(&pair)? {
                return Err(Error::AlreadyExists(format!(
                    "{} relationship between {} and {}",
                    existing.status.as_str(),
                    from,
                    to
                )));
            }

            let mut relationship = Relationship {
                id: uuid::Uuid::new_v4().to_string(),
                requester: from.clone(),
                addressee: to.clone(),
                status: RelationshipStatus::Pending,
                created_at: crate::time::now_timestamp_millis(),
                responded_at: None,
                seq: 0,
            };
            relationship.seq = self.repo.insert_relationship(&relationship)?;

            tracing::info!(
                id = %relationship.id,
                requester = %from,
                addressee = %to,
                "Friend request created"
            );
            Ok(relationship)
        })
    }

    /// Answer the pending request that `from` sent to `to`
    ///
    /// Only the addressee may respond. A request that was already accepted or
    /// rejected is gone as far as this call is concerned, so replays fail with
    /// `NotFound`.
    pub fn respond(&self, to: &Identity, from: &Identity, accept: bool) -> Result<Relationship> {
        let pair = PairKey::new(to, from);
        self.with_pair_lock(&pair, || {
            let not_found = || Error::NotFound(format!("pending request from {} to {}", from, to));

            let mut relationship = match self.repo.live_relationship(&pair)? {
                Some(rel) if rel.status == RelationshipStatus::Pending => rel,
                _ => return Err(not_found()),
            };
            if &relationship.requester == to {
                return Err(Error::AuthorizationDenied(format!(
                    "{} sent this request and cannot answer it",
                    to
                )));
            }

            let status = if accept {
                RelationshipStatus::Accepted
            } else {
                RelationshipStatus::Rejected
            };
            let now = crate::time::now_timestamp_millis();
            if !self.repo.resolve_relationship(&relationship.id, status, now)? {
                return Err(not_found());
            }

            relationship.status = status;
            relationship.responded_at = Some(now);
            tracing::info!(
                id = %relationship.id,
                requester = %from,
                addressee = %to,
                status = status.as_str(),
                "Friend request answered"
            );
            Ok(relationship)
        })
    }

    /// Everyone with an accepted relationship with `of`
    pub fn list_friends(&self, of: &Identity) -> Result<BTreeSet<Identity>> {
        Ok(self.repo.accepted_peers(of)?.into_iter().collect())
    }

    /// Requesters whose pending request targets `of`, oldest first
    pub fn list_pending(&self, of: &Identity) -> PendingRequests {
        PendingRequests {
            repo: self.repo.clone(),
            addressee: of.clone(),
            page_size: self.page_size,
        }
    }

    /// Pending requests `of` has sent and that are still unanswered
    pub fn list_outgoing(&self, of: &Identity) -> Result<Vec<Relationship>> {
        self.repo.outgoing_pending(of)
    }

    /// The live relationship between two identities, if any
    pub fn relationship_between(&self, a: &Identity, b: &Identity) -> Result<Option<Relationship>> {
        self.repo.live_relationship(&PairKey::new(a, b))
    }

    /// Whether `a` and `b` have an accepted relationship
    pub fn are_friends(&self, a: &Identity, b: &Identity) -> Result<bool> {
        Ok(matches!(
            self.relationship_between(a, b)?,
            Some(rel) if rel.status == RelationshipStatus::Accepted
        ))
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.pair_locks.len()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Credentials;
    use crate::storage::Database;

    fn id(name: &str) -> Identity {
        Identity::parse(name).unwrap()
    }

    fn store_with(names: &[&str]) -> (Arc<Database>, RelationshipStore) {
        let db = Arc::new(Database::open(None).unwrap());
        for name in names {
            db.register(&Credentials::new(*name, "pw")).unwrap();
        }
        let store = RelationshipStore::new(db.clone(), db.clone());
        (db, store)
    }

    #[test]
    fn test_relationship_status() {
        assert_eq!(RelationshipStatus::Pending.as_str(), "pending");
        assert_eq!(
            RelationshipStatus::parse("accepted"),
            Some(RelationshipStatus::Accepted)
        );
        assert_eq!(RelationshipStatus::parse("blocked"), None);
        assert!(RelationshipStatus::Accepted.is_live());
        assert!(!RelationshipStatus::Rejected.is_live());
    }

    #[test]
    fn test_request_creates_pending() {
        let (_db, store) = store_with(&["alice", "bob"]);

        let rel = store.request(&id("alice"), &id("bob")).unwrap();

        assert_eq!(rel.status, RelationshipStatus::Pending);
        assert_eq!(rel.requester, id("alice"));
        assert_eq!(rel.addressee, id("bob"));
        assert!(rel.seq > 0);
        assert_eq!(store.list_pending(&id("bob")).requesters().unwrap(), vec![id("alice")]);
        assert!(store.list_pending(&id("alice")).requesters().unwrap().is_empty());
    }

    #[test]
    fn test_self_request_is_invalid() {
        let (_db, store) = store_with(&["alice"]);
        let result = store.request(&id("alice"), &id("alice"));
        assert!(matches!(result, Err(Error::InvalidOperation(_))));
    }

    #[test]
    fn test_request_to_unknown_identity() {
        let (_db, store) = store_with(&["alice"]);
        let result = store.request(&id("alice"), &id("ghost"));
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_duplicate_request_either_direction() {
        let (_db, store) = store_with(&["alice", "bob"]);
        store.request(&id("alice"), &id("bob")).unwrap();

        assert!(matches!(
            store.request(&id("alice"), &id("bob")),
            Err(Error::AlreadyExists(_))
        ));
        assert!(matches!(
            store.request(&id("bob"), &id("alice")),
            Err(Error::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_accept_makes_friends_both_ways() {
        let (_db, store) = store_with(&["alice", "bob"]);
        store.request(&id("alice"), &id("bob")).unwrap();

        let rel = store.respond(&id("bob"), &id("alice"), true).unwrap();
        assert_eq!(rel.status, RelationshipStatus::Accepted);
        assert!(rel.responded_at.is_some());

        assert!(store.list_friends(&id("alice")).unwrap().contains(&id("bob")));
        assert!(store.list_friends(&id("bob")).unwrap().contains(&id("alice")));
        assert!(store.list_pending(&id("bob")).requesters().unwrap().is_empty());
        assert!(store.are_friends(&id("bob"), &id("alice")).unwrap());

        // Accepted pairs stay occupied
        assert!(matches!(
            store.request(&id("bob"), &id("alice")),
            Err(Error::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_requester_cannot_respond() {
        let (_db, store) = store_with(&["alice", "bob"]);
        store.request(&id("alice"), &id("bob")).unwrap();

        let result = store.respond(&id("alice"), &id("bob"), true);
        assert!(matches!(result, Err(Error::AuthorizationDenied(_))));
        assert!(!store.are_friends(&id("alice"), &id("bob")).unwrap());
    }

    #[test]
    fn test_respond_without_request() {
        let (_db, store) = store_with(&["alice", "bob"]);
        let result = store.respond(&id("bob"), &id("alice"), true);
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_replayed_response_is_not_found() {
        let (_db, store) = store_with(&["alice", "bob"]);
        store.request(&id("alice"), &id("bob")).unwrap();
        store.respond(&id("bob"), &id("alice"), true).unwrap();

        assert!(matches!(
            store.respond(&id("bob"), &id("alice"), true),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            store.respond(&id("bob"), &id("alice"), false),
            Err(Error::NotFound(_))
        ));
        assert!(store.are_friends(&id("alice"), &id("bob")).unwrap());
    }

    #[test]
    fn test_reject_frees_the_pair() {
        let (_db, store) = store_with(&["alice", "bob"]);
        store.request(&id("alice"), &id("bob")).unwrap();
        let rejected = store.respond(&id("bob"), &id("alice"), false).unwrap();
        assert_eq!(rejected.status, RelationshipStatus::Rejected);

        assert!(store.list_friends(&id("alice")).unwrap().is_empty());
        assert!(store.relationship_between(&id("alice"), &id("bob")).unwrap().is_none());
        assert!(matches!(
            store.respond(&id("bob"), &id("alice"), false),
            Err(Error::NotFound(_))
        ));

        // Either side may ask again
        let again = store.request(&id("bob"), &id("alice")).unwrap();
        assert_eq!(again.status, RelationshipStatus::Pending);
        assert_ne!(again.id, rejected.id);
    }

    #[test]
    fn test_pending_is_ordered_and_restartable() {
        let (_db, store) = store_with(&["zed", "alice", "bob", "carol", "dave"]);
        let store = store.with_page_size(2);
        for name in ["carol", "alice", "dave", "bob"] {
            store.request(&id(name), &id("zed")).unwrap();
        }

        let pending = store.list_pending(&id("zed"));
        let first: Vec<Identity> = pending.iter().map(|r| r.unwrap()).collect();
        assert_eq!(first, vec![id("carol"), id("alice"), id("dave"), id("bob")]);

        // Partially consume, then restart from the top
        let mut partial = pending.iter();
        assert_eq!(partial.next().unwrap().unwrap(), id("carol"));
        let second = pending.requesters().unwrap();
        assert_eq!(second, first);

        // A fresh pass reflects later answers
        store.respond(&id("zed"), &id("alice"), true).unwrap();
        let third = pending.requesters().unwrap();
        assert_eq!(third, vec![id("carol"), id("dave"), id("bob")]);
    }

    #[test]
    fn test_list_outgoing() {
        let (_db, store) = store_with(&["alice", "bob", "carol"]);
        store.request(&id("alice"), &id("bob")).unwrap();
        store.request(&id("alice"), &id("carol")).unwrap();
        store.respond(&id("carol"), &id("alice"), true).unwrap();

        let outgoing = store.list_outgoing(&id("alice")).unwrap();
        assert_eq!(outgoing.len(), 1);
        assert_eq!(outgoing[0].addressee, id("bob"));
    }

    #[test]
    fn test_pair_locks_are_reclaimed() {
        let (_db, store) = store_with(&["alice", "bob"]);
        store.request(&id("alice"), &id("bob")).unwrap();
        let _ = store.request(&id("bob"), &id("alice"));
        store.respond(&id("bob"), &id("alice"), true).unwrap();
        assert_eq!(store.lock_count(), 0);
    }

    #[test]
    fn test_concurrent_requests_create_one_live_relationship() {
        let (_db, store) = store_with(&["alice", "bob"]);
        let store = Arc::new(store);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    if i % 2 == 0 {
                        store.request(&id("alice"), &id("bob"))
                    } else {
                        store.request(&id("bob"), &id("alice"))
                    }
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let created = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(created, 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, Error::AlreadyExists(_))));
    }
}
