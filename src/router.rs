//! # Table Routing
//!
//! Events are partitioned into sub-tables by timestamp. A [`TableRouter`]
//! answers two questions for the storage core:
//!
//! - *Which sub-table holds timestamp `ts`?* ([`TableRouter::resolve`])
//! - *Which sub-tables exist?* ([`TableRouter::list_all`])
//!
//! The core never computes window widths or decides when tables are created;
//! it routes against whatever the router returns. Two routers ship with the
//! crate:
//!
//! | Router | Windows | Unknown timestamp |
//! |--------|---------|-------------------|
//! | [`FixedWindowRouter`] | fixed width, provisioned on first use | provisions a new window |
//! | [`StaticRouter`] | caller-supplied, pre-provisioned | `Error::NoSubTable` |
//!
//! Lookups that must not create anything (exact-version deletes) go through
//! [`TableRouter::find`] instead of `resolve`.
//!
//! ## Shard Groups
//!
//! Multi-row writes resolve each row's sub-table and then bucket rows by
//! table ([`group_by_table`]). One group becomes one run of inserts against
//! one physical table. At most [`RESOLVE_CONCURRENCY`] resolves of one write
//! are in flight at a time.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use tokio::sync::{Mutex, OnceCell};
use tracing::debug;

use crate::error::{Error, Result};
use crate::schema::{load_catalog, provision_sub_table, ConnectionProvider};
use crate::types::{SubTable, Timestamp};

/// Maximum number of in-flight resolves per [`resolve_each`] call.
pub const RESOLVE_CONCURRENCY: usize = 16;

// =============================================================================
// Router Trait
// =============================================================================

/// Maps timestamps to sub-table descriptors.
#[async_trait]
pub trait TableRouter: Send + Sync {
    /// Returns the sub-table whose window contains `timestamp`.
    ///
    /// May suspend while a new window is provisioned.
    async fn resolve(&self, timestamp: Timestamp) -> Result<SubTable>;

    /// Returns every known sub-table, ordered by window start.
    async fn list_all(&self) -> Result<Vec<SubTable>>;

    /// Returns the existing sub-table covering `timestamp`, if any.
    ///
    /// Never provisions.
    async fn find(&self, timestamp: Timestamp) -> Result<Option<SubTable>> {
        let tables = self.list_all().await?;
        Ok(tables.into_iter().find(|t| t.covers(timestamp)))
    }
}

// =============================================================================
// Fixed Window Router
// =============================================================================

/// Routes timestamps into fixed-width windows, provisioning tables on demand.
///
/// Window `i` covers `[i * width, (i + 1) * width)` and is stored in the table
/// `<prefix>_<start>` (a negative start is written with an `n` prefix, e.g.
/// `events_n100`). A window whose bounds do not fit in an `i64` cannot be
/// routed: timestamps in it fail with `Error::NoSubTable`.
///
/// # Descriptor Cache
///
/// Each window index maps to a `OnceCell` in a `DashMap`. Concurrent resolves
/// of a new window all await the same initialization, so its DDL runs once
/// per router. Initializations of different windows take the `provisioning`
/// lock, so one router never has two DDL writers competing for the SQLite
/// write lock.
///
/// # Sharing a File
///
/// Several routers (one per `EventStore`) may use the same database file.
/// `list_all` re-reads the catalog on every call and adopts windows the
/// other instances provisioned, so reads see their rows too.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use shardlog::router::{FixedWindowRouter, TableRouter};
/// use shardlog::schema::Database;
/// use shardlog::types::Timestamp;
///
/// # async fn example() -> shardlog::Result<()> {
/// let db = Arc::new(Database::open("events.db")?);
/// let router = FixedWindowRouter::open(db, "events", 3_600_000)?;
/// let table = router.resolve(Timestamp::now()).await?;
/// println!("routing to {}", table);
/// # Ok(())
/// # }
/// ```
pub struct FixedWindowRouter {
    provider: Arc<dyn ConnectionProvider>,
    prefix: String,
    window_ms: i64,
    tables: DashMap<i64, Arc<OnceCell<SubTable>>>,
    provisioning: Mutex<()>,
}

impl FixedWindowRouter {
    /// Creates a router and loads every previously provisioned window of this
    /// prefix and width from the catalog.
    ///
    /// # Errors
    ///
    /// - `Error::Config` if `prefix` is not a plain identifier or `window_ms <= 0`
    /// - `Error::Sqlite` if the catalog can't be read
    pub fn open(
        provider: Arc<dyn ConnectionProvider>,
        prefix: impl Into<String>,
        window_ms: i64,
    ) -> Result<Self> {
        let prefix = prefix.into();
        validate_prefix(&prefix)?;
        if window_ms <= 0 {
            return Err(Error::Config(format!(
                "window width must be positive, got {window_ms}"
            )));
        }

        let router = Self {
            provider,
            prefix,
            window_ms,
            tables: DashMap::new(),
            provisioning: Mutex::new(()),
        };

        let conn = router.provider.connect()?;
        let known = router.adopt(load_catalog(&conn)?).len();

        debug!(
            prefix = %router.prefix,
            window_ms,
            known,
            "fixed window router opened"
        );
        Ok(router)
    }

    /// Window width in milliseconds.
    pub fn window_ms(&self) -> i64 {
        self.window_ms
    }

    fn window_index(&self, ts: Timestamp) -> i64 {
        ts.as_millis().div_euclid(self.window_ms)
    }

    /// `None` when the window's bounds overflow.
    fn descriptor(&self, index: i64) -> Option<SubTable> {
        let start = index.checked_mul(self.window_ms)?;
        let end = start.checked_add(self.window_ms)?;
        let suffix = if start < 0 {
            format!("n{}", start.unsigned_abs())
        } else {
            start.to_string()
        };

        Some(SubTable::new(
            format!("{}_{}", self.prefix, suffix),
            Timestamp::from_millis(start),
            Timestamp::from_millis(end),
        ))
    }

    fn cell(&self, index: i64) -> Arc<OnceCell<SubTable>> {
        let entry = self
            .tables
            .entry(index)
            .or_insert_with(|| Arc::new(OnceCell::new()));
        Arc::clone(entry.value())
    }

    fn cached(&self, index: i64) -> Option<SubTable> {
        self.tables.get(&index)?.value().get().cloned()
    }

    /// Keeps the catalog rows this router would generate itself and records
    /// them in the cache. Input order is preserved.
    fn adopt(&self, catalog: Vec<SubTable>) -> Vec<SubTable> {
        let mut adopted = Vec::with_capacity(catalog.len());
        for table in catalog {
            let index = self.window_index(table.start_time);
            if self.descriptor(index).as_ref() != Some(&table) {
                continue;
            }
            // Fails only if the cell is already set (or being set) to the
            // same descriptor.
            let _ = self.cell(index).set(table.clone());
            adopted.push(table);
        }
        adopted
    }

    async fn provision(&self, table: SubTable) -> Result<SubTable> {
        let _guard = self.provisioning.lock().await;

        let provider = Arc::clone(&self.provider);
        let to_create = table.clone();
        tokio::task::spawn_blocking(move || {
            let conn = provider.connect()?;
            provision_sub_table(&conn, &to_create)
        })
        .await??;

        debug!(table = %table, "provisioned sub-table");
        Ok(table)
    }
}

#[async_trait]
impl TableRouter for FixedWindowRouter {
    async fn resolve(&self, timestamp: Timestamp) -> Result<SubTable> {
        let index = self.window_index(timestamp);
        if let Some(table) = self.cached(index) {
            return Ok(table);
        }

        let table = self
            .descriptor(index)
            .filter(|t| t.covers(timestamp))
            .ok_or(Error::NoSubTable { timestamp })?;

        let cell = self.cell(index);
        let table = cell.get_or_try_init(|| self.provision(table)).await?;
        Ok(table.clone())
    }

    async fn list_all(&self) -> Result<Vec<SubTable>> {
        let provider = Arc::clone(&self.provider);
        let catalog = tokio::task::spawn_blocking(move || {
            let conn = provider.connect()?;
            load_catalog(&conn)
        })
        .await??;

        Ok(self.adopt(catalog))
    }

    async fn find(&self, timestamp: Timestamp) -> Result<Option<SubTable>> {
        if let Some(table) = self.cached(self.window_index(timestamp)) {
            return Ok(Some(table));
        }
        let tables = self.list_all().await?;
        Ok(tables.into_iter().find(|t| t.covers(timestamp)))
    }
}

fn validate_prefix(prefix: &str) -> Result<()> {
    let valid = !prefix.is_empty()
        && prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "table prefix '{prefix}' must be non-empty and contain only [A-Za-z0-9_]"
        )))
    }
}

// =============================================================================
// Static Router
// =============================================================================

/// Routes against a fixed, caller-supplied set of windows.
///
/// Use this when partitions are managed outside ShardLog. Timestamps outside
/// every window fail with `Error::NoSubTable`.
#[derive(Debug, Clone)]
pub struct StaticRouter {
    tables: Vec<SubTable>,
}

impl StaticRouter {
    /// Creates a router over `tables`; they are kept ordered by window start.
    pub fn new(mut tables: Vec<SubTable>) -> Self {
        tables.sort_by_key(|t| t.start_time);
        Self { tables }
    }

    /// Creates every table of this router that does not exist yet.
    pub fn provision_all(&self, provider: &dyn ConnectionProvider) -> Result<()> {
        let conn = provider.connect()?;
        for table in &self.tables {
            provision_sub_table(&conn, table)?;
        }
        Ok(())
    }
}

#[async_trait]
impl TableRouter for StaticRouter {
    async fn resolve(&self, timestamp: Timestamp) -> Result<SubTable> {
        self.tables
            .iter()
            .find(|t| t.covers(timestamp))
            .cloned()
            .ok_or(Error::NoSubTable { timestamp })
    }

    async fn list_all(&self) -> Result<Vec<SubTable>> {
        Ok(self.tables.clone())
    }
}

// =============================================================================
// Shard Groups
// =============================================================================

/// Rows of one multi-row write that land in the same sub-table.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardGroup {
    /// Destination table.
    pub table: SubTable,

    /// Indices of the rows (into the caller's slice), in input order.
    pub members: Vec<usize>,
}

/// Resolves the sub-table of every timestamp, at most
/// [`RESOLVE_CONCURRENCY`] at a time.
///
/// The result is positional: entry `i` belongs to `timestamps[i]`.
pub async fn resolve_each(router: &dyn TableRouter, timestamps: &[Timestamp]) -> Vec<Result<SubTable>> {
    stream::iter(timestamps)
        .map(|ts| router.resolve(*ts))
        .buffered(RESOLVE_CONCURRENCY)
        .collect()
        .await
}

/// Keeps the tables whose window ends at or after `hint`, in order.
pub fn tables_since(tables: Vec<SubTable>, hint: Timestamp) -> Vec<SubTable> {
    tables
        .into_iter()
        .filter(|t| t.ends_at_or_after(hint))
        .collect()
}

/// Buckets positional table assignments into groups, ordered by first
/// appearance.
pub fn group_by_table(tables: Vec<SubTable>) -> Vec<ShardGroup> {
    let mut groups: Vec<ShardGroup> = Vec::new();
    let mut by_name: HashMap<String, usize> = HashMap::new();

    for (index, table) in tables.into_iter().enumerate() {
        match by_name.get(&table.name) {
            Some(&g) => groups[g].members.push(index),
            None => {
                by_name.insert(table.name.clone(), groups.len());
                groups.push(ShardGroup {
                    table,
                    members: vec![index],
                });
            }
        }
    }

    groups
}

// =============================================================================
// Tests
// =============================================================================
