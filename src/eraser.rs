//! # Range Eraser
//!
//! Deletes an entity's events by version. Range deletes span every selected
//! shard inside one transaction: if the statement against any shard fails,
//! nothing is removed from any shard.
//!
//! | Operation | Shards | Rows removed |
//! |-----------|--------|--------------|
//! | [`delete_previous`] | window ends at/after hint | `version <= to` |
//! | [`delete_after`] | window ends at/after hint | `version >= from` |
//! | [`delete_by_version`] | the one covering the timestamp | `version == v` |

use rusqlite::{params, Connection, TransactionBehavior};
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::schema::quote_ident;
use crate::types::{SubTable, Timestamp, Version};

/// Which side of a version a range delete removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionBound {
    /// `version <= v`
    AtMost(Version),
    /// `version >= v`
    AtLeast(Version),
}

impl VersionBound {
    fn predicate(&self) -> &'static str {
        match self {
            VersionBound::AtMost(_) => "version <= ?2",
            VersionBound::AtLeast(_) => "version >= ?2",
        }
    }

    fn version(&self) -> Version {
        match self {
            VersionBound::AtMost(v) | VersionBound::AtLeast(v) => *v,
        }
    }
}

/// Deletes `state_id`'s rows matching `bound` from every table in one
/// transaction. Returns the number of rows removed.
pub fn delete_range(
    conn: &mut Connection,
    tables: &[SubTable],
    state_id: &str,
    bound: VersionBound,
) -> Result<usize> {
    let result = delete_in_transaction(conn, tables, state_id, bound);

    match &result {
        Ok(removed) => debug!(state_id, ?bound, shards = tables.len(), removed, "range deleted"),
        Err(e) => error!(state_id, ?bound, shards = tables.len(), error = %e, "range delete rolled back"),
    }
    result
}

fn delete_in_transaction(
    conn: &mut Connection,
    tables: &[SubTable],
    state_id: &str,
    bound: VersionBound,
) -> Result<usize> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let mut removed = 0;
    for table in tables {
        let sql = format!(
            "DELETE FROM {} WHERE state_id = ?1 AND {}",
            quote_ident(&table.name),
            bound.predicate()
        );
        removed += tx.execute(&sql, params![state_id, bound.version().as_raw()])?;
    }
    tx.commit()?;
    Ok(removed)
}

/// Deletes `state_id`'s rows with `version <= to`.
pub fn delete_previous(
    conn: &mut Connection,
    tables: &[SubTable],
    state_id: &str,
    to: Version,
) -> Result<usize> {
    delete_range(conn, tables, state_id, VersionBound::AtMost(to))
}

/// Deletes `state_id`'s rows with `version >= from`.
pub fn delete_after(
    conn: &mut Connection,
    tables: &[SubTable],
    state_id: &str,
    from: Version,
) -> Result<usize> {
    delete_range(conn, tables, state_id, VersionBound::AtLeast(from))
}

/// Deletes the single row `(state_id, version)` from `table`.
///
/// # Errors
///
/// `Error::NoSubTable` if `table` does not cover `timestamp`; the delete is
/// never run against a table the timestamp does not route to.
pub fn delete_by_version(
    conn: &Connection,
    table: &SubTable,
    state_id: &str,
    version: Version,
    timestamp: Timestamp,
) -> Result<usize> {
    if !table.covers(timestamp) {
        return Err(Error::NoSubTable { timestamp });
    }

    let sql = format!(
        "DELETE FROM {} WHERE state_id = ?1 AND version = ?2",
        quote_ident(&table.name)
    );
    Ok(conn.execute(&sql, params![state_id, version.as_raw()])?)
}

// =============================================================================
// Tests
// =============================================================================
