//! Batch Isolation Tests
//!
//! A row that violates a storage constraint (other than uniqueness) must fail
//! only its own append. Its batch-mates settle with their correct outcome.

mod common;

use std::time::Duration;

use shardlog::{Error, WriterConfig};

use common::{deposit, poisoned};

fn lingering_config() -> WriterConfig {
    WriterConfig {
        batch_linger: Duration::from_millis(50),
        ..WriterConfig::default()
    }
}

/// Tests that a poisoned row in a single-shard batch fails alone.
#[tokio::test]
async fn poisoned_row_does_not_fail_batch_mates() {
    let (_dir, path) = common::create_temp_db_file("poison_fast.db");
    let store = common::static_store(&path, &[common::t1(), common::t2()], &[], lingering_config());

    let mut handles = Vec::new();
    for i in 1..=9i64 {
        let store = store.clone();
        let record = if i == 5 {
            poisoned("acct", i, i)
        } else {
            deposit("acct", i, i, 1)
        };
        handles.push(tokio::spawn(async move { store.append(record).await }));
    }

    for (i, handle) in handles.into_iter().enumerate() {
        let result = handle.await.unwrap();
        if i + 1 == 5 {
            assert!(matches!(result, Err(Error::Sqlite(_))), "poisoned row: {result:?}");
        } else {
            assert!(result.unwrap(), "row {} should be inserted", i + 1);
        }
    }

    let conn = common::open_read_only(&path);
    assert_eq!(common::count_rows(&conn, "t1"), 8);
}

/// Tests isolation when the batch spans shards (slow path).
#[tokio::test]
async fn poisoned_row_isolated_across_shards() {
    let (_dir, path) = common::create_temp_db_file("poison_slow.db");
    let store = common::static_store(&path, &[common::t1(), common::t2()], &[], lingering_config());

    let (a, b, c, d) = tokio::join!(
        store.append(deposit("acct", 1, 10, 1)),
        store.append(poisoned("acct", 2, 150)),
        store.append(deposit("acct", 3, 160, 1)),
        store.append(deposit("acct", 1, 20, 1)),
    );

    assert!(a.unwrap());
    assert!(matches!(b, Err(Error::Sqlite(_))));
    assert!(c.unwrap());
    assert!(!d.unwrap(), "duplicate version must report false");

    let conn = common::open_read_only(&path);
    assert_eq!(common::count_rows(&conn, "t1"), 1);
    assert_eq!(common::count_rows(&conn, "t2"), 1);
}
