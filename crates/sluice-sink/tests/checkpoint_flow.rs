//! End-to-end checkpoint + DML flow against a scripted downstream.
//!
//! Walks the path a sink worker takes in production:
//! 1. Bootstrap the checkpoint from dump metadata
//! 2. Apply row changes through the batching backend
//! 3. Advance and flush checkpoint positions
//! 4. Replay a batch after a simulated timeout (at-least-once retry)

use std::sync::Arc;
use std::time::Duration;

use sluice_model::{
    BinlogPosition, Column, Location, RowChange, SqlValue, TableRef, TxnCallbackableEvent,
    TxnEvent,
};
use sluice_sink::backend::{MysqlBackend, SinkConfig};
use sluice_sink::checkpoint::{CheckpointConfig, RemoteCheckpoint};
use sluice_sink::conn::DbOpError;
use sluice_sink::meta::parse_metadata;
use sluice_sink::testing::ScriptedDb;

fn insert_event(table: &TableRef, id: i64, commit_ts: u64) -> TxnCallbackableEvent {
    let row = RowChange {
        table: table.clone(),
        pre_columns: vec![],
        columns: vec![
            Some(Column::handle("id", SqlValue::Int(id))),
            Some(Column::new("payload", SqlValue::Text(format!("p{id}")))),
        ],
        commit_ts,
        start_ts: commit_ts - 1,
        replicating_ts: 1,
        approximate_size: 32,
        index_columns: vec![vec![0]],
    };
    TxnCallbackableEvent {
        event: TxnEvent {
            start_ts: commit_ts - 1,
            commit_ts,
            rows: vec![row],
            wait_flush: false,
        },
        callback: None,
    }
}

#[tokio::test]
async fn test_bootstrap_apply_and_checkpoint() {
    let db = ScriptedDb::new();
    let checkpoint = RemoteCheckpoint::new(
        CheckpointConfig {
            task_id: "flow_test".to_string(),
            task_name: "flow".to_string(),
            meta_schema: "meta".to_string(),
            flush_interval: Duration::from_secs(30),
        },
        db.pool(),
    );
    checkpoint.prepare().await.unwrap();

    // Bootstrap from a dump's metadata file.
    let meta = parse_metadata(
        "SHOW MASTER STATUS:\n\
         \tLog: mysql-bin.000005\n\
         \tPos: 2052\n\
         \tGTID:\n",
    )
    .unwrap();
    checkpoint.load_meta(&meta);
    assert_eq!(
        checkpoint.global_point().position,
        BinlogPosition::new("mysql-bin.000005", 2052)
    );

    // Apply some rows.
    let table = TableRef::new("app", "orders");
    let mut backend = MysqlBackend::new(0, "flow_test", SinkConfig::default(), db.pool());
    backend.on_txn_event(insert_event(&table, 1, 100));
    backend.on_txn_event(insert_event(&table, 2, 101));
    backend.flush().await.unwrap();

    // Advance and flush the checkpoint.
    let loc = Location::from_position(BinlogPosition::new("mysql-bin.000005", 4000));
    checkpoint.save_global_point(loc.clone());
    checkpoint
        .save_table_point(&table, loc.clone(), None)
        .unwrap();
    let snapshot = checkpoint.snapshot(true).unwrap();
    checkpoint
        .flush_points_except(snapshot.id, &[])
        .await
        .unwrap();
    assert_eq!(checkpoint.flushed_global_point(), loc);

    // Rollback after a completed flush changes nothing.
    checkpoint.rollback();
    assert_eq!(checkpoint.global_point(), loc);

    // prepare (schema + table), DML txn, checkpoint txn.
    let committed = db.committed();
    assert_eq!(committed.len(), 4);
    let checkpoint_rows = committed.last().unwrap();
    assert_eq!(checkpoint_rows.len(), 2);
}

#[tokio::test]
async fn test_replay_after_timeout_is_idempotent_sql() {
    let db = ScriptedDb::new();
    let cfg = SinkConfig {
        enable_old_value: false,
        backoff_base_delay: Duration::from_millis(1),
        backoff_max_delay: Duration::from_millis(2),
        ..SinkConfig::default()
    };
    let table = TableRef::new("app", "orders");

    let mut backend = MysqlBackend::new(0, "flow_test", cfg, db.pool());
    backend.on_txn_event(insert_event(&table, 7, 200));
    db.fail_next_execute(DbOpError::transient("i/o timeout"));
    backend.flush().await.unwrap();

    // Both the failed attempt and the successful retry emitted the same
    // REPLACE, so replaying cannot change the downstream row state.
    let executed = db.executed();
    assert_eq!(executed.len(), 2);
    assert_eq!(executed[0], executed[1]);
    assert!(executed[0].sql.starts_with("REPLACE INTO"));
    assert_eq!(db.committed().len(), 1);
}
