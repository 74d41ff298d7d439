//! # Database Schema
//!
//! SQL schema definitions for the Giftbox database.
//!
//! ## Schema Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         DATABASE SCHEMA                                 │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────────┐    ┌─────────────────┐      ┌─────────────────┐    │
//! │  │     users       │    │  relationships  │      │    messages     │    │
//! │  ├─────────────────┤    ├─────────────────┤      ├─────────────────┤    │
//! │  │ name            │◄───│ requester       │      │ seq             │    │
//! │  │ password_salt   │◄───│ addressee       │      │ id              │    │
//! │  │ password_hash   │    │ pair_low/high   │      │ sender          │    │
//! │  │ created_at      │    │ status          │      │ target_kind     │    │
//! │  └─────────────────┘    │ created_at      │      │ target          │    │
//! │                         │ responded_at    │      │ pair_low/high   │    │
//! │                         │ seq             │      │ body_text       │    │
//! │                         └─────────────────┘      │ attachment      │    │
//! │                                                  │ created_at      │    │
//! │  ┌─────────────────┐    ┌─────────────────┐      └─────────────────┘    │
//! │  │     media       │    │     wishes      │                             │
//! │  ├─────────────────┤    ├─────────────────┤                             │
//! │  │ id              │    │ owner           │                             │
//! │  │ owner, kind     │    │ note            │                             │
//! │  │ filename        │    │ updated_at      │                             │
//! │  │ content_type    │    └─────────────────┘                             │
//! │  │ size, caption   │                                                    │
//! │  │ poster          │                                                    │
//! │  │ created_at      │                                                    │
//! │  └─────────────────┘                                                    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// SQL to create all tables
pub const CREATE_TABLES: &str = r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY
);

-- Accounts
CREATE TABLE IF NOT EXISTS users (
    name TEXT PRIMARY KEY,
    -- Random per-account salt (hex)
    password_salt TEXT NOT NULL,
    -- SHA-256(salt || password) (hex)
    password_hash TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

-- Friend requests and friendships
-- pair_low/pair_high hold the two identities in canonical order
CREATE TABLE IF NOT EXISTS relationships (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    requester TEXT NOT NULL,
    addressee TEXT NOT NULL,
    pair_low TEXT NOT NULL,
    pair_high TEXT NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('pending', 'accepted', 'rejected')),
    -- Unix milliseconds
    created_at INTEGER NOT NULL,
    responded_at INTEGER,
    CHECK (requester != addressee),
    CHECK (pair_low < pair_high)
);
-- At most one live relationship per pair; rejected rows are history
CREATE UNIQUE INDEX IF NOT EXISTS idx_relationships_live_pair
    ON relationships(pair_low, pair_high) WHERE status != 'rejected';
CREATE INDEX IF NOT EXISTS idx_relationships_inbox
    ON relationships(addressee, status, created_at, seq);
CREATE INDEX IF NOT EXISTS idx_relationships_outbox
    ON relationships(requester, status, created_at, seq);

-- Append-only message log
CREATE TABLE IF NOT EXISTS messages (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    sender TEXT NOT NULL,
    target_kind TEXT NOT NULL CHECK (target_kind IN ('peer', 'room')),
    target TEXT NOT NULL,
    -- Set for peer messages only
    pair_low TEXT,
    pair_high TEXT,
    body_text TEXT,
    -- Media id
    attachment TEXT,
    -- Unix milliseconds
    created_at INTEGER NOT NULL,
    CHECK (body_text IS NOT NULL OR attachment IS NOT NULL)
);
CREATE INDEX IF NOT EXISTS idx_messages_pair
    ON messages(pair_low, pair_high, created_at, seq) WHERE target_kind = 'peer';
CREATE INDEX IF NOT EXISTS idx_messages_room
    ON messages(target, created_at, seq) WHERE target_kind = 'room';

-- Uploaded photos, videos, audio and documents
CREATE TABLE IF NOT EXISTS media (
    id TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    kind TEXT NOT NULL CHECK (kind IN ('photo', 'video', 'audio', 'document')),
    -- Content-addressed: <sha256>.<ext>
    filename TEXT NOT NULL,
    content_type TEXT NOT NULL,
    size INTEGER NOT NULL,
    caption TEXT,
    -- Photo media id, videos only
    poster TEXT,
    created_at INTEGER NOT NULL,
    UNIQUE (owner, kind, filename)
);
CREATE INDEX IF NOT EXISTS idx_media_owner ON media(owner, kind, created_at);

-- Wish page notes
CREATE TABLE IF NOT EXISTS wishes (
    owner TEXT PRIMARY KEY,
    note TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);
"#;
