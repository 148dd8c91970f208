//! # Error Handling for ShardLog
//!
//! This module defines the error type used throughout ShardLog. A single error
//! enum ([`Error`]) covers every failure mode of the storage core, so callers
//! can match on one type regardless of which path (coalesced append,
//! transactional append, read, erase) produced it.
//!
//! ## Error Categories
//!
//! | Category | Examples | Typical Response |
//! |----------|----------|------------------|
//! | Storage | SQLite error, constraint violation | Fails one request (batched path) or one call (transactional paths) |
//! | Routing | No sub-table covers a timestamp | Caller picks another timestamp or provisions the window |
//! | Decoding | Unknown type code, corrupt payload | Dropped by readers, never surfaced from a read |
//! | Lifecycle | Writer shut down, blocking task lost | Reopen the store |
//!
//! Idempotent duplicates are *not* errors: an append that hits an existing
//! `(state_id, version)` or `unique_id` returns `Ok(false)`.

use thiserror::Error;

use crate::types::Timestamp;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in ShardLog operations.
///
/// # Example
///
/// ```rust,ignore
/// use shardlog::{Error, Result};
///
/// fn example() -> Result<()> {
///     let err = Error::NoSubTable { timestamp: Timestamp::from_millis(42) };
///     assert!(err.to_string().contains("42"));
///
///     // Or propagated with ?
///     some_operation()?;
///     Ok(())
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Storage Errors
    // =========================================================================

    /// SQLite operation failed.
    ///
    /// # When This Happens
    ///
    /// - A row violates a constraint other than uniqueness (e.g. an empty type code)
    /// - The database file is locked past the busy timeout
    /// - A sub-table named by the router does not exist physically
    /// - Disk is full or the file is corrupted
    ///
    /// The `#[from]` attribute lets `?` convert `rusqlite::Error` directly.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Schema version mismatch or corruption detected.
    #[error("schema error: {0}")]
    Schema(String),

    /// Invalid configuration (bad table prefix, zero window width, ...).
    #[error("invalid configuration: {0}")]
    Config(String),

    // =========================================================================
    // Routing Errors
    // =========================================================================

    /// No sub-table descriptor covers the given timestamp.
    ///
    /// # When This Happens
    ///
    /// Routers over a fixed set of windows (see
    /// [`StaticRouter`](crate::router::StaticRouter)) return this for
    /// timestamps outside every window. `delete_by_version` also returns it
    /// rather than operating against a missing target.
    #[error("no sub-table covers timestamp {timestamp}")]
    NoSubTable {
        /// The timestamp that could not be routed
        timestamp: Timestamp,
    },

    // =========================================================================
    // Decoding Errors (dropped on read paths)
    // =========================================================================

    /// The type code of a stored row is not registered.
    #[error("unknown event type '{0}'")]
    UnknownType(String),

    /// A payload could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    Serialization(String),

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================

    /// The write coalescer has shut down or dropped a completion handle.
    #[error("store closed: {0}")]
    Closed(String),

    /// A blocking storage task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Background(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Background(err.to_string())
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
