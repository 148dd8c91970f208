//! Transactional Append Tests
//!
//! `append_transactional` writes every record in one transaction across all
//! shards. Any failure stores nothing.

mod common;

use shardlog::{Error, Timestamp, Version};

use common::{deposit, poisoned, versions};

#[tokio::test]
async fn transactional_append_reports_per_record_outcomes() {
    let (_dir, path) = common::create_temp_db_file("tx_outcomes.db");
    let store = common::two_shard_store(&path);

    assert!(store.append(deposit("a", 1, 10, 1)).await.unwrap());

    let outcomes = store
        .append_transactional(vec![
            deposit("b", 1, 150, 1),
            deposit("a", 1, 10, 1),
            deposit("a", 2, 20, 1),
            deposit("b", 2, 160, 1),
        ])
        .await
        .unwrap();
    assert_eq!(outcomes, vec![true, false, true, true]);

    let conn = common::open_read_only(&path);
    assert_eq!(common::count_rows(&conn, "t1"), 2);
    assert_eq!(common::count_rows(&conn, "t2"), 2);
}

#[tokio::test]
async fn transactional_append_empty_is_noop() {
    let (_dir, path) = common::create_temp_db_file("tx_empty.db");
    let store = common::two_shard_store(&path);

    assert!(store.append_transactional(Vec::new()).await.unwrap().is_empty());
}

/// A constraint failure in the second shard rolls back the first shard too.
#[tokio::test]
async fn transactional_append_is_all_or_nothing() {
    let (_dir, path) = common::create_temp_db_file("tx_atomic.db");
    let store = common::two_shard_store(&path);

    let err = store
        .append_transactional(vec![
            deposit("a", 1, 10, 1),
            deposit("b", 1, 20, 1),
            poisoned("c", 1, 150),
        ])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Sqlite(_)));

    let conn = common::open_read_only(&path);
    assert_eq!(common::count_rows(&conn, "t1"), 0);
    assert_eq!(common::count_rows(&conn, "t2"), 0);
}

#[tokio::test]
async fn transactional_append_unroutable_stores_nothing() {
    let (_dir, path) = common::create_temp_db_file("tx_unroutable.db");
    let store = common::two_shard_store(&path);

    let err = store
        .append_transactional(vec![deposit("a", 1, 10, 1), deposit("a", 2, 9_999, 1)])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoSubTable { .. }));

    let events = store
        .get_list(&"a".to_string(), Timestamp::MIN, Version::MIN, Version::MAX)
        .await
        .unwrap();
    assert!(versions(&events).is_empty());
}
