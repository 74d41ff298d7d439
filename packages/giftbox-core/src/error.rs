//! # Error Handling
//!
//! Error types shared by every Giftbox Core service.
//!
//! ## Error Hierarchy
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           ERROR HIERARCHY                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Error (top-level)                                                     │
//! │  │                                                                      │
//! │  ├── Identity Errors                                                   │
//! │  │   ├── InvalidIdentity       - Malformed identity or room name       │
//! │  │   └── AuthenticationFailed  - Bad credentials or session token      │
//! │  │                                                                      │
//! │  ├── Domain Errors                                                     │
//! │  │   ├── NotFound              - Identity/relationship/media absent    │
//! │  │   ├── AlreadyExists         - Duplicate live relationship/account   │
//! │  │   ├── InvalidOperation      - Self-request, malformed input         │
//! │  │   └── AuthorizationDenied   - Caller is not the permitted party     │
//! │  │                                                                      │
//! │  ├── Storage Errors                                                    │
//! │  │   └── StorageFailure        - Persistence I/O error or timeout      │
//! │  │                                                                      │
//! │  ├── Delivery Errors                                                   │
//! │  │   └── DeliveryFailure       - Push to a subscriber failed           │
//! │  │                                                                      │
//! │  └── Internal Errors                                                   │
//! │      └── SerializationError    - JSON encode/decode failure            │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `DeliveryFailure` never crosses the channel boundary: the delivery channel
//! logs and counts it, and the sender only ever sees a message id or a
//! `StorageFailure`.

use thiserror::Error;

/// Result type alias for Giftbox Core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Giftbox Core
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // ========================================================================
    // Identity Errors (200-299)
    // ========================================================================

    /// Identity or room name failed validation
    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    /// Credentials or session token were rejected
    #[error("Authentication failed.")]
    AuthenticationFailed,

    // ========================================================================
    // Domain Errors (300-399)
    // ========================================================================

    /// Referenced identity, relationship, message or media is absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// A live relationship (or account) already exists
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// The operation is not allowed for these inputs
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// The caller is not the party allowed to perform this operation
    #[error("Authorization denied: {0}")]
    AuthorizationDenied(String),

    // ========================================================================
    // Storage Errors (400-499)
    // ========================================================================

    /// Persistence failed or timed out
    #[error("Storage failure: {0}")]
    StorageFailure(String),

    // ========================================================================
    // Delivery Errors (500-599)
    // ========================================================================

    /// Push to a connected subscriber failed
    #[error("Delivery failure: {0}")]
    DeliveryFailure(String),

    // ========================================================================
    // Internal Errors (900-999)
    // ========================================================================

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl Error {
    /// Numeric error code, grouped by category:
    /// - 200-299: Identity
    /// - 300-399: Domain
    /// - 400-499: Storage
    /// - 500-599: Delivery
    /// - 900-999: Internal
    pub fn code(&self) -> i32 {
        match self {
            Error::InvalidIdentity(_) => 200,
            Error::AuthenticationFailed => 201,

            Error::NotFound(_) => 300,
            Error::AlreadyExists(_) => 301,
            Error::InvalidOperation(_) => 302,
            Error::AuthorizationDenied(_) => 303,

            Error::StorageFailure(_) => 400,

            Error::DeliveryFailure(_) => 500,

            Error::SerializationError(_) => 900,
        }
    }

    /// Check if this error is recoverable
    ///
    /// Recoverable errors can potentially be resolved by retrying.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::StorageFailure(_) | Error::DeliveryFailure(_))
    }
}

// ============================================================================
// ERROR CONVERSIONS
// ============================================================================

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::StorageFailure(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::StorageFailure(err.to_string())
    }
}

// ============================================================================
// TESTS
// ============================================================================
