//! Range Eraser Tests
//!
//! Tests the invariants around multi-shard deletes:
//! - Range deletes cover every selected shard
//! - A failure on any shard removes nothing from any shard
//! - Exact-version deletes refuse timestamps no sub-table covers

mod common;

use shardlog::{Error, Timestamp, Version, WriterConfig};

use common::{deposit, ts, v, versions, Store};

async fn seed(store: &Store) {
    let acct = "acct";
    let outcomes = store
        .append_transactional(vec![
            deposit(acct, 1, 50, 1),
            deposit(acct, 2, 50, 1),
            deposit(acct, 3, 150, 1),
            deposit("other", 1, 60, 1),
        ])
        .await
        .unwrap();
    assert_eq!(outcomes, vec![true; 4]);
}

async fn remaining(store: &Store, state: &str) -> Vec<i64> {
    let events = store
        .get_list(&state.to_string(), Timestamp::MIN, Version::MIN, Version::MAX)
        .await
        .unwrap();
    versions(&events)
}

#[tokio::test]
async fn delete_previous_removes_up_to_version() {
    let (_dir, path) = common::create_temp_db_file("delete_previous.db");
    let store = common::two_shard_store(&path);
    seed(&store).await;

    let removed = store
        .delete_previous(&"acct".to_string(), v(2), ts(0))
        .await
        .unwrap();
    assert_eq!(removed, 2);
    assert_eq!(remaining(&store, "acct").await, vec![3]);
    assert_eq!(remaining(&store, "other").await, vec![1]);
}

#[tokio::test]
async fn delete_after_removes_from_version() {
    let (_dir, path) = common::create_temp_db_file("delete_after.db");
    let store = common::two_shard_store(&path);
    seed(&store).await;

    let removed = store
        .delete_after(&"acct".to_string(), v(2), ts(0))
        .await
        .unwrap();
    assert_eq!(removed, 2);
    assert_eq!(remaining(&store, "acct").await, vec![1]);
}

#[tokio::test]
async fn range_delete_respects_start_hint() {
    let (_dir, path) = common::create_temp_db_file("delete_hint.db");
    let store = common::two_shard_store(&path);
    seed(&store).await;

    // Only t2 ends at or after 150.
    let removed = store
        .delete_previous(&"acct".to_string(), Version::MAX, ts(150))
        .await
        .unwrap();
    assert_eq!(removed, 1);
    assert_eq!(remaining(&store, "acct").await, vec![1, 2]);
}

/// The phantom shard has no physical table: its DELETE fails after t1 and
/// t2 have already run, and the whole transaction must roll back.
#[tokio::test]
async fn range_delete_is_all_or_nothing() {
    let (_dir, path) = common::create_temp_db_file("delete_atomic.db");
    let store = common::static_store(
        &path,
        &[common::t1(), common::t2()],
        &[common::phantom()],
        WriterConfig::default(),
    );
    seed(&store).await;
    let conn = common::open_read_only(&path);

    let err = store
        .delete_previous(&"acct".to_string(), Version::MAX, ts(0))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Sqlite(_)));
    assert_eq!(common::count_rows(&conn, "t1"), 3);
    assert_eq!(common::count_rows(&conn, "t2"), 1);

    let err = store
        .delete_after(&"acct".to_string(), Version::MIN, ts(0))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Sqlite(_)));
    assert_eq!(common::count_rows(&conn, "t1"), 3);
    assert_eq!(common::count_rows(&conn, "t2"), 1);
}

#[tokio::test]
async fn delete_by_version_removes_exact_row() {
    let (_dir, path) = common::create_temp_db_file("delete_exact.db");
    let store = common::two_shard_store(&path);
    seed(&store).await;
    let acct = "acct".to_string();

    assert_eq!(store.delete_by_version(&acct, v(3), ts(150)).await.unwrap(), 1);
    assert_eq!(store.delete_by_version(&acct, v(3), ts(150)).await.unwrap(), 0);

    // Right version, wrong window: nothing to delete there.
    assert_eq!(store.delete_by_version(&acct, v(1), ts(150)).await.unwrap(), 0);
    assert_eq!(remaining(&store, "acct").await, vec![1, 2]);
}

#[tokio::test]
async fn delete_by_version_without_covering_table_fails() {
    let (_dir, path) = common::create_temp_db_file("delete_uncovered.db");
    let store = common::two_shard_store(&path);
    seed(&store).await;

    let err = store
        .delete_by_version(&"acct".to_string(), v(1), ts(10_000))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoSubTable { timestamp } if timestamp == ts(10_000)));
    assert_eq!(remaining(&store, "acct").await, vec![1, 2, 3]);
}

/// DeletePrevious(to 2, hint 0) after the two-shard scenario leaves only v3.
#[tokio::test]
async fn delete_previous_scenario() {
    let (_dir, path) = common::create_temp_db_file("delete_scenario.db");
    let store = common::two_shard_store(&path);
    let acct = "acct".to_string();

    for (version, timestamp) in [(1, 50), (2, 50), (3, 150)] {
        assert!(store.append(deposit(&acct, version, timestamp, 1)).await.unwrap());
    }

    store.delete_previous(&acct, v(2), ts(0)).await.unwrap();

    let events = store.get_list(&acct, ts(0), v(1), v(3)).await.unwrap();
    assert_eq!(versions(&events), vec![3]);
}
