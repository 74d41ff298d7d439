//! # Storage Module
//!
//! SQLite persistence for accounts, relationships, messages, media metadata
//! and wish notes.
//!
//! ## Storage Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         STORAGE SYSTEM                                  │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  SQLite Database                                                │   │
//! │  │  ───────────────                                                │   │
//! │  │                                                                 │   │
//! │  │  Tables:                                                       │   │
//! │  │  • users - Accounts with salted password digests               │   │
//! │  │  • relationships - Friend requests, one live row per pair      │   │
//! │  │  • messages - Append-only log, ordered by (created_at, seq)    │   │
//! │  │  • media - Index of uploaded files                             │   │
//! │  │  • wishes - Wish page notes                                    │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  Filesystem                                                     │   │
//! │  │  ──────────                                                     │   │
//! │  │                                                                 │   │
//! │  │  {data_dir}/media/{owner}/{kind}/{sha256}.{ext}                │   │
//! │  │  (see crate::media)                                            │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

mod database;
mod schema;

pub use database::{Database, DatabaseConfig, DatabaseCounts};
