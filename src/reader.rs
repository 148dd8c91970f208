//! # Ordered Stream Reader
//!
//! Reads one entity's events back across sub-tables. Each shard is scanned
//! independently and the merged result is re-sorted by version; shard scan
//! order is never trusted as global order.
//!
//! ```text
//!   t1 [0,100)    ──► rows v1, v2 ─┐
//!   t2 [100,200)  ──► rows v3      ├──► decode ──► sort by version ──► [v1, v2, v3]
//!   t3 [200,300)  ──► (none)      ─┘
//! ```
//!
//! ## Undecodable Rows
//!
//! A row whose type code is not registered, or whose payload no longer
//! deserializes, is dropped from the result and logged. Reads never fail
//! because of payload shape.
//!
//! These functions are blocking and take a connection; the store facade runs
//! them on the blocking pool.

use rusqlite::{params, Connection, Params};
use tracing::warn;

use crate::codec::TypeRegistry;
use crate::error::Result;
use crate::schema::quote_ident;
use crate::types::{StateKey, StoredEvent, SubTable, Timestamp, TypeCode, UniqueId, Version};

// =============================================================================
// Row Decoding
// =============================================================================

const SELECT_COLUMNS: &str = "type_code, data, version, timestamp, unique_id";

/// A row as stored, before payload decoding.
struct RawRow {
    type_code: String,
    data: Vec<u8>,
    version: i64,
    timestamp: i64,
    unique_id: String,
}

/// Runs `sql` against one shard and appends every decodable row to `out`.
///
/// Returns the number of rows appended.
fn scan_shard<K: StateKey, E, P: Params>(
    conn: &Connection,
    table: &SubTable,
    sql: &str,
    params: P,
    state_id: &K,
    registry: &TypeRegistry<E>,
    out: &mut Vec<StoredEvent<K, E>>,
) -> Result<usize> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, |row| {
        Ok(RawRow {
            type_code: row.get(0)?,
            data: row.get(1)?,
            version: row.get(2)?,
            timestamp: row.get(3)?,
            unique_id: row.get(4)?,
        })
    })?;

    let before = out.len();
    for row in rows {
        let row = row?;
        match registry.decode(&row.type_code, &row.data) {
            Ok(event) => out.push(StoredEvent {
                state_id: state_id.clone(),
                type_code: TypeCode::new(row.type_code),
                version: Version::from_raw(row.version),
                timestamp: Timestamp::from_millis(row.timestamp),
                unique_id: UniqueId::new(row.unique_id),
                event,
            }),
            Err(e) => warn!(
                table = %table.name,
                version = row.version,
                type_code = %row.type_code,
                error = %e,
                "dropping undecodable row"
            ),
        }
    }

    Ok(out.len() - before)
}

// =============================================================================
// Read Functions
// =============================================================================

/// Reads `state_id`'s events with `start <= version <= end` from `tables`.
///
/// The caller picks the tables (typically those ending at or after a
/// timestamp hint). Results are ascending by version.
pub fn read_versions<K: StateKey, E>(
    conn: &Connection,
    tables: &[SubTable],
    state_id: &K,
    start: Version,
    end: Version,
    registry: &TypeRegistry<E>,
) -> Result<Vec<StoredEvent<K, E>>> {
    let key = state_id.to_key_string();
    let mut events = Vec::new();

    for table in tables {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM {} WHERE state_id = ?1 AND version BETWEEN ?2 AND ?3",
            quote_ident(&table.name)
        );
        scan_shard(
            conn,
            table,
            &sql,
            params![key, start.as_raw(), end.as_raw()],
            state_id,
            registry,
            &mut events,
        )?;
    }

    events.sort_by_key(|e| e.version);
    Ok(events)
}

/// Reads up to about `limit` events of one type with `version >= start`.
///
/// Tables are scanned in the given order, each capped at `limit` rows.
/// Scanning stops as soon as the decoded total reaches `limit`, so the result
/// can exceed `limit` by at most one shard's worth but no further shard is
/// consulted. Results are ascending by version.
pub fn read_by_type<K: StateKey, E>(
    conn: &Connection,
    tables: &[SubTable],
    state_id: &K,
    type_code: &TypeCode,
    start: Version,
    limit: usize,
    registry: &TypeRegistry<E>,
) -> Result<Vec<StoredEvent<K, E>>> {
    let key = state_id.to_key_string();
    let cap = i64::try_from(limit).unwrap_or(i64::MAX);
    let mut events = Vec::new();

    for table in tables {
        if events.len() >= limit {
            break;
        }

        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM {}
             WHERE state_id = ?1 AND type_code = ?2 AND version >= ?3
             ORDER BY version LIMIT ?4",
            quote_ident(&table.name)
        );
        scan_shard(
            conn,
            table,
            &sql,
            params![key, type_code.as_str(), start.as_raw(), cap],
            state_id,
            registry,
            &mut events,
        )?;
    }

    events.sort_by_key(|e| e.version);
    Ok(events)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{provision_sub_table, ConnectionProvider, Database};
    use serde_json::Value;

    fn ts(ms: i64) -> Timestamp {
        Timestamp::from_millis(ms)
    }

    fn t1() -> SubTable {
        SubTable::new("t1", ts(0), ts(100))
    }

    fn t2() -> SubTable {
        SubTable::new("t2", ts(100), ts(200))
    }

    fn registry() -> TypeRegistry<Value> {
        let mut registry = TypeRegistry::new();
        registry
            .register::<Value, _>("Deposited", |v| v)
            .register::<Value, _>("Withdrawn", |v| v);
        registry
    }

    fn setup() -> (tempfile::TempDir, Connection) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("reader.db")).unwrap();
        let conn = db.connect().unwrap();
        provision_sub_table(&conn, &t1()).unwrap();
        provision_sub_table(&conn, &t2()).unwrap();
        (dir, conn)
    }

    fn put(conn: &Connection, table: &str, state: &str, version: i64, type_code: &str, data: &[u8]) {
        conn.execute(
            &format!(
                "INSERT INTO \"{table}\" (state_id, unique_id, type_code, data, version, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0)"
            ),
            params![state, format!("{state}-{version}"), type_code, data, version],
        )
        .unwrap();
    }

    fn versions<E>(events: &[StoredEvent<String, E>]) -> Vec<i64> {
        events.iter().map(|e| e.version.as_raw()).collect()
    }

    #[test]
    fn test_read_versions_merges_shards_in_version_order() {
        let (_dir, conn) = setup();
        // The later shard holds the lower versions.
        put(&conn, "t2", "s", 1, "Deposited", b"1");
        put(&conn, "t1", "s", 3, "Deposited", b"3");
        put(&conn, "t2", "s", 2, "Deposited", b"2");
        put(&conn, "t1", "other", 4, "Deposited", b"4");

        let events = read_versions(
            &conn,
            &[t1(), t2()],
            &"s".to_string(),
            Version::MIN,
            Version::MAX,
            &registry(),
        )
        .unwrap();

        assert_eq!(versions(&events), vec![1, 2, 3]);
        assert_eq!(events[0].event, Value::from(1));
        assert_eq!(events[0].unique_id.as_str(), "s-1");
    }

    #[test]
    fn test_read_versions_range_is_inclusive() {
        let (_dir, conn) = setup();
        for v in 1..=5 {
            put(&conn, "t1", "s", v, "Deposited", b"0");
        }

        let events = read_versions(
            &conn,
            &[t1()],
            &"s".to_string(),
            Version::from_raw(2),
            Version::from_raw(4),
            &registry(),
        )
        .unwrap();
        assert_eq!(versions(&events), vec![2, 3, 4]);
    }

    #[test]
    fn test_undecodable_rows_are_dropped() {
        let (_dir, conn) = setup();
        put(&conn, "t1", "s", 1, "Deposited", b"1");
        put(&conn, "t1", "s", 2, "Renamed", b"{}");
        put(&conn, "t1", "s", 3, "Deposited", b"not json");
        put(&conn, "t1", "s", 4, "Withdrawn", b"4");

        let events = read_versions(
            &conn,
            &[t1()],
            &"s".to_string(),
            Version::MIN,
            Version::MAX,
            &registry(),
        )
        .unwrap();
        assert_eq!(versions(&events), vec![1, 4]);
    }

    #[test]
    fn test_read_by_type_filters_and_sorts() {
        let (_dir, conn) = setup();
        put(&conn, "t1", "s", 1, "Deposited", b"1");
        put(&conn, "t1", "s", 2, "Withdrawn", b"2");
        put(&conn, "t2", "s", 3, "Deposited", b"3");
        put(&conn, "t2", "s", 4, "Deposited", b"4");

        let events = read_by_type(
            &conn,
            &[t1(), t2()],
            &"s".to_string(),
            &TypeCode::new("Deposited"),
            Version::from_raw(2),
            10,
            &registry(),
        )
        .unwrap();
        assert_eq!(versions(&events), vec![3, 4]);
    }

    #[test]
    fn test_read_by_type_stops_at_limit() {
        let (_dir, conn) = setup();
        put(&conn, "t1", "s", 1, "Deposited", b"1");
        put(&conn, "t1", "s", 2, "Deposited", b"2");

        // "missing" has no physical table; consulting it would fail.
        let missing = SubTable::new("missing", ts(100), ts(200));
        let events = read_by_type(
            &conn,
            &[t1(), missing.clone()],
            &"s".to_string(),
            &TypeCode::new("Deposited"),
            Version::MIN,
            2,
            &registry(),
        )
        .unwrap();
        assert_eq!(versions(&events), vec![1, 2]);

        // Below the limit the next shard is consulted.
        let result = read_by_type(
            &conn,
            &[t1(), missing],
            &"s".to_string(),
            &TypeCode::new("Deposited"),
            Version::MIN,
            3,
            &registry(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_read_by_type_zero_limit_reads_nothing() {
        let (_dir, conn) = setup();
        put(&conn, "t1", "s", 1, "Deposited", b"1");

        let events = read_by_type(
            &conn,
            &[SubTable::new("missing", ts(0), ts(1))],
            &"s".to_string(),
            &TypeCode::new("Deposited"),
            Version::MIN,
            0,
            &registry(),
        )
        .unwrap();
        assert!(events.is_empty());
    }
}
