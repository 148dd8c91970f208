#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use shardlog::schema::provision_sub_table;
use shardlog::{
    ConnectionProvider, Database, EventRecord, EventStore, StaticRouter, StoreConfig, StoredEvent,
    SubTable, Timestamp, TypeRegistry, Version, WriterConfig,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deposited {
    pub amount: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Withdrawn {
    pub amount: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AccountEvent {
    Deposited(Deposited),
    Withdrawn(Withdrawn),
}

pub type Store = EventStore<String, AccountEvent>;

pub fn registry() -> TypeRegistry<AccountEvent> {
    let mut registry = TypeRegistry::new();
    registry
        .register::<Deposited, _>("Deposited", AccountEvent::Deposited)
        .register::<Withdrawn, _>("Withdrawn", AccountEvent::Withdrawn);
    registry
}

pub fn ts(ms: i64) -> Timestamp {
    Timestamp::from_millis(ms)
}

pub fn v(raw: i64) -> Version {
    Version::from_raw(raw)
}

pub fn t1() -> SubTable {
    SubTable::new("t1", ts(0), ts(100))
}

pub fn t2() -> SubTable {
    SubTable::new("t2", ts(100), ts(200))
}

/// A descriptor the router lists but whose table was never created.
pub fn phantom() -> SubTable {
    SubTable::new("phantom", ts(200), ts(300))
}

pub fn create_temp_db_file(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    let _ = Database::open(&path).expect("initialize database");
    (dir, path)
}

pub fn open_read_only(path: &Path) -> Connection {
    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .expect("open read-only connection")
}

/// Opens a store over a `StaticRouter` listing `provisioned` followed by
/// `unprovisioned`; only the former get physical tables.
pub fn static_store(
    path: &Path,
    provisioned: &[SubTable],
    unprovisioned: &[SubTable],
    config: WriterConfig,
) -> Store {
    let db = Database::open(path).expect("open database");
    let conn = db.connect().expect("connect");
    for table in provisioned {
        provision_sub_table(&conn, table).expect("provision sub-table");
    }

    let mut tables = provisioned.to_vec();
    tables.extend_from_slice(unprovisioned);

    EventStore::with_parts(
        Arc::new(db),
        Arc::new(StaticRouter::new(tables)),
        config,
        registry(),
    )
    .expect("build store")
}

/// A store over `t1 [0,100)` and `t2 [100,200)`.
pub fn two_shard_store(path: &Path) -> Store {
    static_store(path, &[t1(), t2()], &[], WriterConfig::default())
}

/// A store over fixed windows of `window_ms`, provisioned on first use.
pub async fn fixed_store(path: &Path, window_ms: i64, writer: WriterConfig) -> Store {
    let config = StoreConfig {
        writer,
        window_ms,
        ..StoreConfig::default()
    };
    EventStore::open(path, config, registry())
        .await
        .expect("open fixed-window store")
}

pub fn deposit(state: &str, version: i64, timestamp: i64, amount: u64) -> EventRecord<String> {
    EventRecord::json(
        state.to_string(),
        "Deposited",
        &Deposited { amount },
        v(version),
        ts(timestamp),
        format!("{state}-{version}"),
    )
    .expect("encode deposit")
}

pub fn withdrawal(state: &str, version: i64, timestamp: i64, amount: u64) -> EventRecord<String> {
    EventRecord::json(
        state.to_string(),
        "Withdrawn",
        &Withdrawn { amount },
        v(version),
        ts(timestamp),
        format!("{state}-{version}"),
    )
    .expect("encode withdrawal")
}

/// A record the storage layer rejects: its type code is empty.
pub fn poisoned(state: &str, version: i64, timestamp: i64) -> EventRecord<String> {
    EventRecord::new(
        state.to_string(),
        "",
        b"{}".to_vec(),
        v(version),
        ts(timestamp),
        format!("{state}-{version}"),
    )
}

pub fn count_rows(conn: &Connection, table: &str) -> i64 {
    conn.query_row(&format!("SELECT COUNT(*) FROM \"{table}\""), [], |row| row.get(0))
        .expect("count rows")
}

pub fn versions<K, E>(events: &[StoredEvent<K, E>]) -> Vec<i64> {
    events.iter().map(|e| e.version.as_raw()).collect()
}
