//! # Domain Types for ShardLog
//!
//! This module defines the core types used throughout ShardLog: entity keys,
//! versions, timestamps, event records and sub-table descriptors.
//!
//! ## Newtypes
//!
//! Primitive values are wrapped in single-field structs so a [`Version`] can
//! never be passed where a [`Timestamp`] is expected:
//!
//! ```rust
//! use shardlog::types::{Timestamp, Version};
//!
//! fn example(version: Version, ts: Timestamp) {
//!     // version == ts  // Won't compile
//! }
//! ```
//!
//! ## Invariants
//!
//! - [`Version`]: unique per state id, intended to increase monotonically
//! - [`Timestamp`]: drives sub-table routing, milliseconds on a caller-defined clock
//! - [`SubTable`]: half-open window `[start_time, end_time)`

use std::fmt;

use serde::Serialize;

use crate::codec::encode_json;
use crate::error::Result;

// =============================================================================
// Entity Keys
// =============================================================================

/// Capability set required of an entity key: stringify and equality.
///
/// Every sub-table stores the key as TEXT. Routing and row-keying only ever go
/// through [`to_key_string`](StateKey::to_key_string), so any type that can
/// render itself deterministically can key a stream.
///
/// # Example
///
/// ```rust
/// use shardlog::types::StateKey;
///
/// assert_eq!(42u64.to_key_string(), "42");
/// assert_eq!("account-7".to_string().to_key_string(), "account-7");
/// ```
pub trait StateKey: Clone + Eq + fmt::Debug + Send + Sync + 'static {
    /// Returns the stored representation of this key.
    fn to_key_string(&self) -> String;
}

impl StateKey for String {
    fn to_key_string(&self) -> String {
        self.clone()
    }
}

macro_rules! integer_state_key {
    ($($ty:ty),*) => {
        $(
            impl StateKey for $ty {
                fn to_key_string(&self) -> String {
                    self.to_string()
                }
            }
        )*
    };
}

integer_state_key!(i32, i64, u32, u64, i128, u128);

// =============================================================================
// Versions and Timestamps
// =============================================================================

/// Per-entity event version.
///
/// Stored as INTEGER. Global read order is always re-derived by sorting on
/// this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version(i64);

impl Version {
    /// Lowest possible version, useful as an open lower bound.
    pub const MIN: Version = Version(i64::MIN);

    /// Highest possible version, useful as an open upper bound.
    pub const MAX: Version = Version(i64::MAX);

    /// Creates a version from a raw value.
    pub fn from_raw(value: i64) -> Self {
        Self(value)
    }

    /// Returns the raw value for database storage.
    pub fn as_raw(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Event time in milliseconds. Drives shard routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(i64);

impl Timestamp {
    /// The earliest timestamp; as a read hint it selects every sub-table.
    pub const MIN: Timestamp = Timestamp(i64::MIN);

    /// Creates a timestamp from milliseconds.
    pub fn from_millis(ms: i64) -> Self {
        Self(ms)
    }

    /// Current wall-clock time in milliseconds since the Unix epoch.
    pub fn now() -> Self {
        let ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Self(ms)
    }

    /// Returns the raw millisecond value.
    pub fn as_millis(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Identifiers
// =============================================================================

/// Idempotency token of an event. A second insert with the same token is
/// ignored by storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UniqueId(String);

impl UniqueId {
    /// Creates a unique id from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for UniqueId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for UniqueId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// String tag identifying the runtime type of an event payload.
///
/// Readers look it up in a [`TypeRegistry`](crate::codec::TypeRegistry) to
/// pick the decoder.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TypeCode(String);

impl TypeCode {
    /// Creates a type code from a string.
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    /// Returns the string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TypeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TypeCode {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TypeCode {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// =============================================================================
// Event Records
// =============================================================================

/// An event ready to be appended.
///
/// `data` is the already-serialized payload; see [`EventRecord::json`] for the
/// default serializer.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord<K> {
    /// Entity the event belongs to.
    pub state_id: K,

    /// Runtime type tag of the payload.
    pub type_code: TypeCode,

    /// Serialized payload.
    pub data: Vec<u8>,

    /// Version within the entity's stream.
    pub version: Version,

    /// Event time; selects the sub-table.
    pub timestamp: Timestamp,

    /// Idempotency token.
    pub unique_id: UniqueId,
}

impl<K: StateKey> EventRecord<K> {
    /// Creates a record from an already-serialized payload.
    pub fn new(
        state_id: K,
        type_code: impl Into<TypeCode>,
        data: impl Into<Vec<u8>>,
        version: Version,
        timestamp: Timestamp,
        unique_id: impl Into<UniqueId>,
    ) -> Self {
        Self {
            state_id,
            type_code: type_code.into(),
            data: data.into(),
            version,
            timestamp,
            unique_id: unique_id.into(),
        }
    }

    /// Creates a record whose payload is `payload` serialized as JSON.
    pub fn json<T: Serialize>(
        state_id: K,
        type_code: impl Into<TypeCode>,
        payload: &T,
        version: Version,
        timestamp: Timestamp,
        unique_id: impl Into<UniqueId>,
    ) -> Result<Self> {
        Ok(Self::new(
            state_id,
            type_code,
            encode_json(payload)?,
            version,
            timestamp,
            unique_id,
        ))
    }
}

/// An event read back from storage with its payload decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent<K, E> {
    pub state_id: K,
    pub type_code: TypeCode,
    pub version: Version,
    pub timestamp: Timestamp,
    pub unique_id: UniqueId,
    pub event: E,
}

// =============================================================================
// Sub-table Descriptors
// =============================================================================

/// A time window mapped to one physical table.
///
/// Produced and owned by a [`TableRouter`](crate::router::TableRouter); the
/// storage core only reads it. The window is half-open:
/// `start_time <= ts < end_time`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubTable {
    /// Physical table name.
    pub name: String,

    /// First timestamp inside the window.
    pub start_time: Timestamp,

    /// First timestamp after the window.
    pub end_time: Timestamp,
}

impl SubTable {
    /// Creates a descriptor.
    pub fn new(name: impl Into<String>, start_time: Timestamp, end_time: Timestamp) -> Self {
        Self {
            name: name.into(),
            start_time,
            end_time,
        }
    }

    /// Returns true if `ts` falls inside this window.
    pub fn covers(&self, ts: Timestamp) -> bool {
        self.start_time <= ts && ts < self.end_time
    }

    /// Returns true if this window ends at or after `hint`, i.e. it may hold
    /// events newer than the hint.
    pub fn ends_at_or_after(&self, hint: Timestamp) -> bool {
        self.end_time >= hint
    }
}

impl fmt::Display for SubTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}, {})", self.name, self.start_time, self.end_time)
    }
}

// =============================================================================
// Tests
// =============================================================================
