//! Engine tests: key/value operations on a single node

use spokekv::storage::{
    Compare, CompareResult, DeleteRangeRequest, KeyValue, PutOp, PutRequest, RangeOp,
    RangeRequest, RequestOp, ResponseOp, TxnRequest,
};
use spokekv::{Config, Engine, Error};
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.raft.node_host_dir = dir.join("host");
    config.table.data_dir = dir.join("data");
    config.raft.rtt_ms = 1;
    config.request_timeout_ms = 2_000;
    config
}

async fn engine_with_table(dir: &Path, table: &str) -> Engine {
    let engine = Engine::new(test_config(dir)).unwrap();
    engine.start().await.unwrap();
    engine.create_table(table).await.unwrap();
    engine
        .wait_for_table(table, Duration::from_secs(5))
        .await
        .unwrap();
    engine
}

fn put(table: &str, key: &str, value: &str, prev_kv: bool) -> PutRequest {
    PutRequest {
        table: table.to_string(),
        key: key.into(),
        value: value.into(),
        prev_kv,
    }
}

fn get(table: &str, key: &str) -> RangeRequest {
    RangeRequest {
        table: table.to_string(),
        key: key.into(),
        ..Default::default()
    }
}

fn delete_all(table: &str, count: bool, prev_kv: bool) -> DeleteRangeRequest {
    DeleteRangeRequest {
        table: table.to_string(),
        key: vec![0],
        range_end: vec![0],
        count,
        prev_kv,
    }
}

#[tokio::test]
async fn test_end_to_end_revisions() {
    let dir = TempDir::new().unwrap();
    let engine = engine_with_table(dir.path(), "table").await;

    let first = engine.put(put("table", "key", "value", false)).await.unwrap();
    assert_eq!(first.header.revision, 3);
    assert_eq!(first.header.shard_id, 10001);
    assert_eq!(first.header.replica_id, 1);
    assert_eq!(first.prev_kv, None);

    let second = engine.put(put("table", "key", "value2", true)).await.unwrap();
    assert_eq!(second.header.revision, 4);
    assert_eq!(second.prev_kv, Some(KeyValue::new("key", "value")));

    let read = engine.range(get("table", "key")).await.unwrap();
    assert_eq!(read.kvs, vec![KeyValue::new("key", "value2")]);
    assert_eq!(read.header.revision, 4);

    engine.close().await;
}

#[tokio::test]
async fn test_delete_all_after_single_put() {
    let dir = TempDir::new().unwrap();
    let engine = engine_with_table(dir.path(), "table").await;

    engine.put(put("table", "key", "value", false)).await.unwrap();
    let deleted = engine.delete_range(delete_all("table", true, false)).await.unwrap();
    assert_eq!(deleted.deleted, 1);
    assert_eq!(deleted.header.revision, 4);
    assert!(deleted.prev_kvs.is_empty());

    assert!(matches!(
        engine.range(get("table", "key")).await,
        Err(Error::KeyNotFound)
    ));
    engine.close().await;
}

#[tokio::test]
async fn test_delete_range_flags() {
    let dir = TempDir::new().unwrap();
    let engine = engine_with_table(dir.path(), "t").await;

    // nothing to delete is not an error
    let empty = engine.delete_range(delete_all("t", true, false)).await.unwrap();
    assert_eq!(empty.deleted, 0);

    for key in ["a", "b", "c"] {
        engine.put(put("t", key, key, false)).await.unwrap();
    }

    let half = engine
        .delete_range(DeleteRangeRequest {
            table: "t".into(),
            key: b"a".to_vec(),
            range_end: b"c".to_vec(),
            count: false,
            prev_kv: true,
        })
        .await
        .unwrap();
    assert_eq!(half.deleted, 2);
    assert_eq!(
        half.prev_kvs,
        vec![KeyValue::new("a", "a"), KeyValue::new("b", "b")]
    );

    let rest = engine.delete_range(delete_all("t", false, true)).await.unwrap();
    assert_eq!(rest.prev_kvs, vec![KeyValue::new("c", "c")]);

    let all = engine
        .range(RangeRequest {
            table: "t".into(),
            key: vec![0],
            range_end: vec![0],
            count_only: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(all.count, 0);
    engine.close().await;
}

#[tokio::test]
async fn test_revisions_are_monotonic() {
    let dir = TempDir::new().unwrap();
    let engine = engine_with_table(dir.path(), "t").await;

    let mut last = 0;
    for i in 0..20 {
        let resp = engine
            .put(put("t", &format!("k{:02}", i), "v", false))
            .await
            .unwrap();
        assert!(resp.header.revision > last);
        last = resp.header.revision;
    }

    let range = engine
        .range(RangeRequest {
            table: "t".into(),
            key: b"k05".to_vec(),
            range_end: b"k10".to_vec(),
            limit: 3,
            linearizable: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(range.count, 5);
    assert_eq!(range.kvs.len(), 3);
    assert!(range.more);
    assert_eq!(range.header.revision, last);
    engine.close().await;
}

#[tokio::test]
async fn test_txn_branch_selection() {
    let dir = TempDir::new().unwrap();
    let engine = engine_with_table(dir.path(), "t").await;
    engine.put(put("t", "key", "value", false)).await.unwrap();

    let txn = |expected: &str| TxnRequest {
        table: "t".into(),
        compare: vec![Compare::value("key", CompareResult::Equal, expected)],
        success: vec![
            RequestOp::Put(PutOp {
                key: b"branch".to_vec(),
                value: b"success".to_vec(),
                prev_kv: false,
            }),
            RequestOp::Range(RangeOp {
                key: b"key".to_vec(),
                ..Default::default()
            }),
        ],
        failure: vec![RequestOp::Put(PutOp {
            key: b"branch".to_vec(),
            value: b"failure".to_vec(),
            prev_kv: true,
        })],
    };

    let taken = engine.txn(txn("value")).await.unwrap();
    assert!(taken.succeeded);
    assert_eq!(taken.header.revision, 4);
    assert_eq!(taken.responses.len(), 2);
    match &taken.responses[1] {
        ResponseOp::Range(r) => assert_eq!(r.kvs, vec![KeyValue::new("key", "value")]),
        other => panic!("unexpected response {:?}", other),
    }

    let skipped = engine.txn(txn("foo")).await.unwrap();
    assert!(!skipped.succeeded);
    assert_eq!(skipped.header.revision, 5);
    match &skipped.responses[0] {
        ResponseOp::Put(p) => assert_eq!(p.prev_kv, Some(KeyValue::new("branch", "success"))),
        other => panic!("unexpected response {:?}", other),
    }

    let branch = engine.range(get("t", "branch")).await.unwrap();
    assert_eq!(branch.kvs[0].value, b"failure");
    engine.close().await;
}

#[tokio::test]
async fn test_unknown_table_and_bad_arguments() {
    let dir = TempDir::new().unwrap();
    let engine = engine_with_table(dir.path(), "t").await;

    assert!(matches!(
        engine.put(put("missing", "k", "v", false)).await,
        Err(Error::TableNotFound(_))
    ));
    assert!(matches!(
        engine.range(get("missing", "k")).await,
        Err(Error::TableNotFound(_))
    ));
    assert!(matches!(
        engine.txn(TxnRequest {
            table: "missing".into(),
            ..Default::default()
        })
        .await,
        Err(Error::TableNotFound(_))
    ));
    assert!(matches!(
        engine.put(put("t", "", "v", false)).await,
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        engine.range(get("t", "nope")).await,
        Err(Error::KeyNotFound)
    ));
    assert!(!Error::TableNotFound("missing".into()).is_retryable());
    engine.close().await;
}

#[tokio::test]
async fn test_tables_are_independent() {
    let dir = TempDir::new().unwrap();
    let engine = engine_with_table(dir.path(), "a").await;
    engine.create_table("b").await.unwrap();
    engine
        .wait_for_table("b", Duration::from_secs(5))
        .await
        .unwrap();

    engine.put(put("a", "k", "1", false)).await.unwrap();
    engine.put(put("a", "k", "2", false)).await.unwrap();
    let b = engine.put(put("b", "k", "1", false)).await.unwrap();
    assert_eq!(b.header.revision, 3);
    assert_eq!(b.header.shard_id, 10002);

    engine.drop_table("a").await.unwrap();
    assert!(matches!(
        engine.range(get("a", "k")).await,
        Err(Error::TableNotFound(_))
    ));
    assert_eq!(engine.range(get("b", "k")).await.unwrap().kvs.len(), 1);
    engine.close().await;
}
