//! # SQLite Schema for ShardLog
//!
//! This module defines the database schema and hands out connections. Events
//! live in many physical *sub-tables*, one per time window, all inside one
//! SQLite file. Two bookkeeping tables sit beside them.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           Schema Overview                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  shard_metadata        shard_catalog              events_<start>  (N×)  │
//! │  ┌──────────────┐      ┌──────────────────┐       ┌─────────────────┐   │
//! │  │ key (PK)     │      │ name (PK)  ──────┼──────►│ state_id   ┐ PK │   │
//! │  │ value        │      │ start_time       │       │ version    ┘    │   │
//! │  └──────────────┘      │ end_time         │       │ unique_id (UQ)  │   │
//! │                        └──────────────────┘       │ type_code       │   │
//! │                                                   │ data BLOB       │   │
//! │                                                   │ timestamp       │   │
//! │                                                   └─────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Idempotent Inserts
//!
//! Every sub-table carries `PRIMARY KEY (state_id, version)` and a unique index
//! on `unique_id`. Inserts use `ON CONFLICT DO NOTHING`, so a duplicate affects
//! zero rows instead of raising. Other constraint failures (the `CHECK` on
//! `type_code`, `NOT NULL`) still raise.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{params, Connection};
use tracing::info;

use crate::error::{Error, Result};
use crate::types::{SubTable, Timestamp};

// =============================================================================
// Schema Version
// =============================================================================

/// Current schema version. Opening a database with a different version fails.
const SCHEMA_VERSION: i32 = 1;

/// How long a connection waits on a locked database before failing.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// DDL Statements
// =============================================================================

/// Key-value metadata (schema version).
const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS shard_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

/// Every provisioned sub-table and its time window.
///
/// Routers that provision tables on demand record them here so the full set
/// of windows survives restarts.
const CREATE_CATALOG: &str = r#"
CREATE TABLE IF NOT EXISTS shard_catalog (
    name       TEXT PRIMARY KEY,
    start_time INTEGER NOT NULL,
    end_time   INTEGER NOT NULL
)
"#;

/// Returns the DDL creating one sub-table and its indexes.
///
/// # Columns
///
/// - `state_id`: stringified entity key
/// - `unique_id`: idempotency token (unique)
/// - `type_code`: runtime type tag, must be non-empty
/// - `data`: serialized payload
/// - `version`: per-entity version, unique together with `state_id`
/// - `timestamp`: event time in milliseconds
pub fn sub_table_ddl(name: &str) -> String {
    let table = quote_ident(name);
    let unique_index = quote_ident(&format!("{name}_unique_id"));
    let type_index = quote_ident(&format!("{name}_type"));

    format!(
        r#"
CREATE TABLE IF NOT EXISTS {table} (
    state_id  TEXT    NOT NULL,
    unique_id TEXT    NOT NULL,
    type_code TEXT    NOT NULL CHECK (length(type_code) > 0),
    data      BLOB    NOT NULL,
    version   INTEGER NOT NULL,
    timestamp INTEGER NOT NULL,
    PRIMARY KEY (state_id, version)
);
CREATE UNIQUE INDEX IF NOT EXISTS {unique_index} ON {table}(unique_id);
CREATE INDEX IF NOT EXISTS {type_index} ON {table}(state_id, type_code, version);
"#
    )
}

/// Quotes a table or index name for use in SQL text.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Creates a sub-table (if missing) and records it in the catalog.
///
/// Safe to call concurrently for the same descriptor: both statements are
/// no-ops the second time.
pub fn provision_sub_table(conn: &Connection, table: &SubTable) -> Result<()> {
    conn.execute_batch(&sub_table_ddl(&table.name))?;
    conn.execute(
        "INSERT INTO shard_catalog (name, start_time, end_time) VALUES (?1, ?2, ?3)
         ON CONFLICT(name) DO NOTHING",
        params![
            table.name,
            table.start_time.as_millis(),
            table.end_time.as_millis()
        ],
    )?;
    Ok(())
}

/// Loads every catalogued sub-table, ordered by window start.
pub fn load_catalog(conn: &Connection) -> Result<Vec<SubTable>> {
    let mut stmt = conn.prepare(
        "SELECT name, start_time, end_time FROM shard_catalog ORDER BY start_time",
    )?;

    let rows = stmt.query_map([], |row| {
        let name: String = row.get(0)?;
        let start: i64 = row.get(1)?;
        let end: i64 = row.get(2)?;
        Ok(SubTable::new(
            name,
            Timestamp::from_millis(start),
            Timestamp::from_millis(end),
        ))
    })?;

    let mut tables = Vec::new();
    for table in rows {
        tables.push(table?);
    }
    Ok(tables)
}

// =============================================================================
// Connection Provider
// =============================================================================

/// Source of connections to the relational backend.
///
/// The write coalescer takes one connection for its lifetime; every read,
/// erase and transactional append opens its own.
pub trait ConnectionProvider: Send + Sync + 'static {
    /// Opens a new, fully configured connection.
    fn connect(&self) -> Result<Connection>;
}

// =============================================================================
// Database
// =============================================================================

/// A ShardLog database file.
///
/// `Database` owns the path, not a connection: [`Database::open`] initializes
/// the schema once, and each [`connect`](ConnectionProvider::connect) yields a
/// fresh connection in WAL mode so readers and writers proceed concurrently.
///
/// # Example
///
/// ```rust,no_run
/// use shardlog::schema::{ConnectionProvider, Database};
///
/// let db = Database::open("events.db")?;
/// let conn = db.connect()?;
/// # Ok::<(), shardlog::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct Database {
    path: PathBuf,
    busy_timeout: Duration,
}

impl Database {
    /// Opens a database file, creating and initializing it if necessary.
    ///
    /// # Errors
    ///
    /// - `Error::Sqlite` if the file can't be opened or created
    /// - `Error::Schema` if the schema version doesn't match
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Self {
            path: path.as_ref().to_path_buf(),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        };

        let conn = db.connect()?;
        initialize(&conn)?;

        info!(path = %db.path.display(), "database opened");
        Ok(db)
    }

    /// Overrides the busy timeout applied to new connections.
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConnectionProvider for Database {
    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(self.busy_timeout)?;

        // WAL: readers see committed data while the coalescer writes
        conn.execute_batch("PRAGMA journal_mode = WAL")?;
        conn.execute_batch("PRAGMA synchronous = NORMAL")?;

        Ok(conn)
    }
}

/// Creates bookkeeping tables and verifies the schema version.
fn initialize(conn: &Connection) -> Result<()> {
    conn.execute_batch(CREATE_METADATA)?;
    conn.execute_batch(CREATE_CATALOG)?;
    verify_or_set_version(conn)
}

/// Verifies the schema version, or sets it if this is a new database.
fn verify_or_set_version(conn: &Connection) -> Result<()> {
    let existing: Option<String> = match conn.query_row(
        "SELECT value FROM shard_metadata WHERE key = 'schema_version'",
        [],
        |row| row.get(0),
    ) {
        Ok(v) => Some(v),
        Err(rusqlite::Error::QueryReturnedNoRows) => None,
        Err(e) => return Err(e.into()),
    };

    match existing {
        None => {
            conn.execute(
                "INSERT INTO shard_metadata (key, value) VALUES ('schema_version', ?1)",
                [SCHEMA_VERSION.to_string()],
            )?;
        }
        Some(v) if v == SCHEMA_VERSION.to_string() => {}
        Some(v) => {
            return Err(Error::Schema(format!(
                "schema version mismatch: database has version {v}, but this ShardLog version requires {SCHEMA_VERSION}"
            )));
        }
    }

    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
