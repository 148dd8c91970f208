//! # ShardLog - Time-Partitioned Event Storage
//!
//! ShardLog is the append-only storage backend of an event-sourcing system,
//! built on SQLite. It provides:
//!
//! - **Per-entity event streams**: read back in strict version order
//! - **Time partitioning**: events land in sub-tables chosen by timestamp
//! - **Write coalescing**: concurrent appends are batched into few transactions
//! - **Poison-row isolation**: a failing row never fails its batch-mates
//! - **Idempotent inserts**: duplicates report `false`, never an error
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       EventStore<K, E>                          │
//! │   append │ append_transactional │ get_list* │ delete_*          │
//! └─────┬──────────────────┬─────────────────────────┬──────────────┘
//!       │                  │                         │
//!       ▼                  │                         │
//! ┌───────────────┐        │                         │
//! │Write Coalescer│        │                         │
//! │ (one thread)  │        │                         │
//! │ fast / slow   │        │                         │
//! │ path, per-row │        │                         │
//! │ fallback      │        │                         │
//! └─────┬─────────┘        │                         │
//!       │                  ▼                         ▼
//!       │        ┌──────────────────────────────────────────┐
//!       ├───────►│ TableRouter: timestamp → sub-table        │
//!       │        └──────────────────────────────────────────┘
//!       ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │          SQLite (WAL): events_<start> sub-tables + catalog      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Settled once**: every append is answered exactly once with one outcome
//! 2. **Idempotence**: a duplicate `unique_id` or `(state_id, version)` is `false`
//! 3. **Atomicity**: a committed transaction applies all its rows or none
//! 4. **Ordering**: reads are re-sorted by version, never trusting shard order
//!
//! ## Module Organization
//!
//! - [`error`]: Error type for all failure modes
//! - [`types`]: Keys, versions, timestamps, records, sub-table descriptors
//! - [`codec`]: JSON encoding and the type-code registry
//! - [`schema`]: SQLite DDL, catalog and connection provider
//! - [`router`]: Timestamp-to-sub-table routing
//! - [`writer`]: Write coalescer and batch executor
//! - [`reader`]: Ordered multi-shard reads
//! - [`eraser`]: Multi-shard transactional deletes
//! - [`api`]: Async store handle (main entry point)

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types for ShardLog operations.
pub mod error;

/// Domain types: keys, versions, timestamps, records, sub-table descriptors.
pub mod types;

/// Payload encoding and the type-code registry used by readers.
pub mod codec;

/// SQLite schema, sub-table provisioning and connection provider.
pub mod schema;

/// Table routing.
///
/// Maps event timestamps to sub-tables. [`router::FixedWindowRouter`]
/// provisions fixed-width windows on demand; [`router::StaticRouter`] routes
/// against a caller-supplied set.
pub mod router;

/// Write coalescer with batch execution.
///
/// Many producers, one consumer thread. Each drained batch is written in one
/// transaction per sub-table and falls back to per-row inserts on failure.
pub mod writer;

/// Ordered reads across sub-tables.
pub mod reader;

/// Transactional deletes across sub-tables.
pub mod eraser;

/// Async API for ShardLog.
///
/// The main entry point is [`EventStore`](api::EventStore).
pub mod api;

// =============================================================================
// Re-exports
// =============================================================================

pub use api::{EventStore, StoreConfig};
pub use codec::TypeRegistry;
pub use error::{Error, Result};
pub use router::{FixedWindowRouter, StaticRouter, TableRouter};
pub use schema::{ConnectionProvider, Database};
pub use writer::WriterConfig;

pub use types::{
    EventRecord, StateKey, StoredEvent, SubTable, Timestamp, TypeCode, UniqueId, Version,
};
