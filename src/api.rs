//! # Async API for ShardLog
//!
//! [`EventStore`] is the public handle. It bundles the write coalescer, the
//! table router, a connection provider, the insert-statement cache and the
//! type registry.
//!
//! ```text
//!                       ┌──────────────────────────────┐
//!   append ───────────► │ BatchWriterHandle (mpsc)     │ ──► writer thread ──┐
//!                       └──────────────────────────────┘                     │
//!   append_transactional ┐                                                   ▼
//!   get_list             ├──► router ──► spawn_blocking(connect + SQL) ──► SQLite (WAL)
//!   get_list_by_type     │
//!   delete_*            ─┘
//! ```
//!
//! Only `append` goes through the coalescer. Every other operation opens its
//! own connection on Tokio's blocking pool and runs fully concurrently with
//! the coalescer and with each other.

use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;

use rusqlite::Connection;
use tracing::error;

use crate::codec::TypeRegistry;
use crate::eraser;
use crate::error::{Error, Result};
use crate::reader::{read_by_type, read_versions};
use crate::router::{group_by_table, resolve_each, tables_since, FixedWindowRouter, TableRouter};
use crate::schema::{ConnectionProvider, Database};
use crate::types::{EventRecord, StateKey, StoredEvent, SubTable, Timestamp, TypeCode, Version};
use crate::writer::{
    insert_all_or_nothing, spawn_batch_writer, BatchWriterHandle, InsertRow, InsertStatements,
    WriterConfig,
};

// =============================================================================
// Configuration
// =============================================================================

/// Default table name prefix for [`EventStore::open`].
pub const DEFAULT_TABLE_PREFIX: &str = "events";

/// Default window width for [`EventStore::open`]: one day.
pub const DEFAULT_WINDOW_MS: i64 = 86_400_000;

/// Configuration for [`EventStore::open`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Write coalescer settings.
    pub writer: WriterConfig,

    /// Prefix of every sub-table name.
    pub table_prefix: String,

    /// Width of each sub-table's time window in milliseconds.
    pub window_ms: i64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            writer: WriterConfig::default(),
            table_prefix: DEFAULT_TABLE_PREFIX.to_string(),
            window_ms: DEFAULT_WINDOW_MS,
        }
    }
}

// =============================================================================
// EventStore
// =============================================================================

struct Shared<E> {
    provider: Arc<dyn ConnectionProvider>,
    router: Arc<dyn TableRouter>,
    statements: Arc<InsertStatements>,
    registry: Arc<TypeRegistry<E>>,
}

/// The main async handle for ShardLog operations.
///
/// `K` is the entity key type, `E` the decoded event family. The handle is
/// cheap to clone; all clones share one coalescer.
///
/// # Example
///
/// ```rust,no_run
/// use serde::{Deserialize, Serialize};
/// use shardlog::{EventRecord, EventStore, StoreConfig, Timestamp, TypeRegistry, Version};
///
/// #[derive(Serialize, Deserialize)]
/// struct Deposited { amount: u64 }
///
/// # async fn example() -> shardlog::Result<()> {
/// let mut registry = TypeRegistry::new();
/// registry.register::<Deposited, _>("Deposited", |d| d);
///
/// let store: EventStore<String, Deposited> =
///     EventStore::open("events.db", StoreConfig::default(), registry).await?;
///
/// let record = EventRecord::json(
///     "account-1".to_string(),
///     "Deposited",
///     &Deposited { amount: 10 },
///     Version::from_raw(1),
///     Timestamp::now(),
///     "deposit-1",
/// )?;
/// assert!(store.append(record).await?);
///
/// let events = store
///     .get_list(&"account-1".to_string(), Timestamp::MIN, Version::MIN, Version::MAX)
///     .await?;
/// assert_eq!(events.len(), 1);
///
/// store.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct EventStore<K, E> {
    shared: Arc<Shared<E>>,
    writer: BatchWriterHandle,
    _key: PhantomData<fn() -> K>,
}

impl<K, E> Clone for EventStore<K, E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            writer: self.writer.clone(),
            _key: PhantomData,
        }
    }
}

impl<K: StateKey, E: Send + 'static> EventStore<K, E> {
    /// Opens or creates a store backed by one SQLite file with fixed-width
    /// windows.
    ///
    /// Other stores may open the same file with the same prefix and width.
    /// Windows any of them provisions show up in every store's reads.
    ///
    /// # Errors
    ///
    /// - `Error::Sqlite` / `Error::Schema` if the database can't be opened
    /// - `Error::Config` for an invalid prefix, window width or writer setting
    pub async fn open(
        path: impl AsRef<Path>,
        config: StoreConfig,
        registry: TypeRegistry<E>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let StoreConfig {
            writer,
            table_prefix,
            window_ms,
        } = config;

        let (db, router) = tokio::task::spawn_blocking(move || -> Result<_> {
            let db: Arc<dyn ConnectionProvider> = Arc::new(Database::open(&path)?);
            let router = FixedWindowRouter::open(Arc::clone(&db), table_prefix, window_ms)?;
            Ok((db, router))
        })
        .await??;

        Self::with_parts(db, Arc::new(router), writer, registry)
    }

    /// Builds a store from any connection provider and router.
    ///
    /// The coalescer takes one connection from `provider` for its lifetime.
    pub fn with_parts(
        provider: Arc<dyn ConnectionProvider>,
        router: Arc<dyn TableRouter>,
        writer: WriterConfig,
        registry: TypeRegistry<E>,
    ) -> Result<Self> {
        let statements = Arc::new(InsertStatements::new());
        let writer = spawn_batch_writer(
            provider.connect()?,
            Arc::clone(&router),
            Arc::clone(&statements),
            writer,
        )?;

        Ok(Self {
            shared: Arc::new(Shared {
                provider,
                router,
                statements,
                registry: Arc::new(registry),
            }),
            writer,
            _key: PhantomData,
        })
    }

    /// Runs `f` with a fresh connection on the blocking pool.
    async fn with_connection<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let provider = Arc::clone(&self.shared.provider);
        tokio::task::spawn_blocking(move || {
            let mut conn = provider.connect()?;
            f(&mut conn)
        })
        .await?
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Appends one event through the write coalescer.
    ///
    /// Returns `true` if stored, `false` if an event with the same
    /// `(state_id, version)` or `unique_id` already exists. Suspends until
    /// the batch holding this event has been executed.
    pub async fn append(&self, record: EventRecord<K>) -> Result<bool> {
        self.writer.append(InsertRow::from_record(record)).await
    }

    /// Appends `records` in one transaction spanning every sub-table they
    /// route to.
    ///
    /// Bypasses the coalescer. Returns one outcome per record, in input
    /// order. Any failure stores nothing and is returned.
    pub async fn append_transactional(&self, records: Vec<EventRecord<K>>) -> Result<Vec<bool>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let rows: Vec<InsertRow> = records.into_iter().map(InsertRow::from_record).collect();
        let count = rows.len();
        let result = self.insert_transactional(rows).await;
        if let Err(e) = &result {
            error!(rows = count, error = %e, "transactional append failed");
        }
        result
    }

    async fn insert_transactional(&self, rows: Vec<InsertRow>) -> Result<Vec<bool>> {
        let timestamps: Vec<Timestamp> = rows.iter().map(|r| r.timestamp).collect();
        let tables = resolve_each(self.shared.router.as_ref(), &timestamps)
            .await
            .into_iter()
            .collect::<Result<Vec<SubTable>>>()?;
        let groups = group_by_table(tables);

        let statements = Arc::clone(&self.shared.statements);
        self.with_connection(move |conn| insert_all_or_nothing(conn, &statements, &groups, &rows))
            .await
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Reads `state_id`'s events with `start <= version <= end`, ascending.
    ///
    /// Only sub-tables whose window ends at or after `latest_hint` are
    /// scanned; pass [`Timestamp::MIN`] to scan all of them. Rows that fail
    /// to decode are dropped.
    pub async fn get_list(
        &self,
        state_id: &K,
        latest_hint: Timestamp,
        start: Version,
        end: Version,
    ) -> Result<Vec<StoredEvent<K, E>>> {
        let tables = tables_since(self.shared.router.list_all().await?, latest_hint);
        let registry = Arc::clone(&self.shared.registry);
        let state_id = state_id.clone();

        self.with_connection(move |conn| {
            read_versions(conn, &tables, &state_id, start, end, &registry)
        })
        .await
    }

    /// Reads `state_id`'s events of one type with `version >= start`,
    /// ascending.
    ///
    /// Sub-tables are scanned in window order and scanning stops once
    /// `limit` events have been collected; the last shard consulted may push
    /// the result past `limit`.
    pub async fn get_list_by_type(
        &self,
        state_id: &K,
        type_code: impl Into<TypeCode>,
        start: Version,
        limit: usize,
    ) -> Result<Vec<StoredEvent<K, E>>> {
        let tables = self.shared.router.list_all().await?;
        let registry = Arc::clone(&self.shared.registry);
        let state_id = state_id.clone();
        let type_code = type_code.into();

        self.with_connection(move |conn| {
            read_by_type(conn, &tables, &state_id, &type_code, start, limit, &registry)
        })
        .await
    }

    // =========================================================================
    // Deletes
    // =========================================================================

    /// Deletes `state_id`'s events with `version <= to` from every sub-table
    /// ending at or after `start_hint`, all or nothing.
    pub async fn delete_previous(
        &self,
        state_id: &K,
        to: Version,
        start_hint: Timestamp,
    ) -> Result<usize> {
        let tables = tables_since(self.shared.router.list_all().await?, start_hint);
        let key = state_id.to_key_string();

        self.with_connection(move |conn| eraser::delete_previous(conn, &tables, &key, to))
            .await
    }

    /// Deletes `state_id`'s events with `version >= from` from every sub-table
    /// ending at or after `start_hint`, all or nothing.
    pub async fn delete_after(
        &self,
        state_id: &K,
        from: Version,
        start_hint: Timestamp,
    ) -> Result<usize> {
        let tables = tables_since(self.shared.router.list_all().await?, start_hint);
        let key = state_id.to_key_string();

        self.with_connection(move |conn| eraser::delete_after(conn, &tables, &key, from))
            .await
    }

    /// Deletes the event `(state_id, version)` from the sub-table covering
    /// `timestamp`.
    ///
    /// # Errors
    ///
    /// `Error::NoSubTable` if no existing sub-table covers `timestamp`. The
    /// lookup never provisions a window.
    pub async fn delete_by_version(
        &self,
        state_id: &K,
        version: Version,
        timestamp: Timestamp,
    ) -> Result<usize> {
        let table = self
            .shared
            .router
            .find(timestamp)
            .await?
            .ok_or(Error::NoSubTable { timestamp })?;
        let key = state_id.to_key_string();

        self.with_connection(move |conn| {
            eraser::delete_by_version(conn, &table, &key, version, timestamp)
        })
        .await
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Every sub-table known to the router, ordered by window start.
    pub async fn sub_tables(&self) -> Result<Vec<SubTable>> {
        self.shared.router.list_all().await
    }

    /// Flushes the coalescer and stops it.
    ///
    /// Every append accepted before shutdown is settled. Appends submitted
    /// afterwards fail with `Error::Closed`; reads and deletes keep working.
    pub async fn shutdown(&self) -> Result<()> {
        self.writer.shutdown().await
    }
}
