// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos tests: simulate failures and verify graceful degradation.
//!
//! These tests verify the connector handles source outages, flapping
//! targets, lost history and damaged checkpoints without panics, deadlocks,
//! duplicated or silently lost events.
//!
//! Run with: cargo test --test chaos_tests -- --nocapture

mod common;

use common::*;
use oplog_connector::{
    AdapterErrorKind, BatchSize, Checkpoint, ConnectorError, ConnectorState, DocManager, HaltMode,
    MemoryDocManager, MemoryOplog, Position,
};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::time::sleep;

fn single_target() -> (Arc<MemoryDocManager>, Vec<Arc<dyn DocManager>>) {
    let manager = Arc::new(MemoryDocManager::new("a"));
    let managers: Vec<Arc<dyn DocManager>> = vec![manager.clone()];
    (manager, managers)
}

// =============================================================================
// Source Outages
// =============================================================================

/// Test: Repeated disconnects neither lose nor duplicate events
#[tokio::test]
async fn source_disconnect_storm_exactly_once() {
    let dir = TempDir::new().unwrap();
    let path = checkpoint_path(&dir);
    let oplog = Arc::new(MemoryOplog::new("memory://source"));
    let (manager, managers) = single_target();

    let mut connector = connector(config_with_targets(&path, &["a"]), oplog.clone(), managers);
    connector.start().await.unwrap();

    let mut expected = Vec::new();
    for i in 0..10 {
        oplog.fail_next_reads(1 + i % 3);
        let position = oplog.insert("db.c", json!({"_id": i}));
        expected.push(position);
        if i % 2 == 0 {
            wait_for_resume(&connector, position).await;
        }
    }

    wait_for_resume(&connector, *expected.last().unwrap()).await;
    connector.shutdown().await;

    assert_eq!(manager.applied_positions(), expected);
    assert_eq!(manager.documents("db.c").len(), 10);
}

/// Test: History trimmed while the source was unreachable stops the connector
#[tokio::test]
async fn history_trimmed_while_disconnected_is_fatal() {
    let dir = TempDir::new().unwrap();
    let path = checkpoint_path(&dir);
    let oplog = Arc::new(MemoryOplog::new("memory://source"));
    let (manager, managers) = single_target();

    let mut connector = connector(config_with_targets(&path, &["a"]), oplog.clone(), managers);
    connector.start().await.unwrap();

    oplog.insert("db.c", json!({"_id": 1}));
    let e2 = oplog.insert("db.c", json!({"_id": 2}));
    wait_for_resume(&connector, e2).await;

    // Reads keep failing; the tailer cycles through reconnects.
    oplog.fail_next_reads(10_000);
    sleep(Duration::from_millis(100)).await;

    oplog.insert("db.c", json!({"_id": 3}));
    oplog.insert("db.c", json!({"_id": 4}));
    let e5 = oplog.insert("db.c", json!({"_id": 5}));
    oplog.trim_before(e5);

    let err = connector.run().await.unwrap_err();
    match err {
        ConnectorError::HistoryGap { resume, oldest } => {
            assert_eq!(resume, e2);
            assert_eq!(oldest, e5);
        }
        other => panic!("expected history gap, got {:?}", other),
    }
    assert_eq!(connector.state(), ConnectorState::Failed);
    assert_eq!(manager.applied().len(), 2);
    assert_eq!(Checkpoint::load(&path).await.unwrap().unwrap().position, e2);
}

/// Test: History trimmed while the tailer lags behind a blocked target stops
/// the connector instead of skipping the trimmed entries
#[tokio::test]
async fn history_trimmed_while_lagging_is_fatal() {
    let dir = TempDir::new().unwrap();
    let path = checkpoint_path(&dir);
    let oplog = Arc::new(MemoryOplog::new("memory://source"));
    let (manager, managers) = single_target();
    manager.reject_id(&json!(1), AdapterErrorKind::Other);

    let mut config = config_with_targets(&path, &["a"]);
    config.halt_mode = HaltMode::Block;
    config.read_limit = 2;
    config.max_queued_batches = 1;
    config.batch_size = BatchSize::bounded(1).unwrap();
    let mut connector = connector(config, oplog.clone(), managers);
    connector.start().await.unwrap();

    let mut positions = Vec::new();
    for i in 1..=10 {
        positions.push(oplog.insert("db.c", json!({"_id": i})));
    }
    let e8 = positions[7];
    sleep(Duration::from_millis(200)).await;

    // The tailer is suspended a few entries in; trim past it, then unblock.
    oplog.trim_before(e8);
    manager.clear_rejections();

    let err = connector.run().await.unwrap_err();
    match err {
        ConnectorError::HistoryGap { resume, oldest } => {
            assert_eq!(oldest, e8);
            assert!(resume < e8);
        }
        other => panic!("expected history gap, got {:?}", other),
    }

    let ids: Vec<u64> = manager.applied_positions().iter().map(|p| p.ts).collect();
    let expected: Vec<u64> = (1..=ids.len() as u64).collect();
    assert_eq!(ids, expected);
    assert!(ids.len() < 8);
    assert!(Checkpoint::load(&path).await.unwrap().unwrap().position < e8);
}

/// Test: History trimmed between runs is detected at startup
#[tokio::test]
async fn history_trimmed_before_restart_is_fatal() {
    let dir = TempDir::new().unwrap();
    let path = checkpoint_path(&dir);
    let oplog = Arc::new(MemoryOplog::new("memory://source"));

    let (_, managers) = single_target();
    let mut first = connector(config_with_targets(&path, &["a"]), oplog.clone(), managers);
    first.start().await.unwrap();
    let e1 = oplog.insert("db.c", json!({"_id": 1}));
    wait_for_resume(&first, e1).await;
    first.shutdown().await;

    oplog.insert("db.c", json!({"_id": 2}));
    let e3 = oplog.insert("db.c", json!({"_id": 3}));
    oplog.trim_before(e3);

    let (manager, managers) = single_target();
    let mut second = connector(config_with_targets(&path, &["a"]), oplog.clone(), managers);
    let err = second.start().await.unwrap_err();
    assert!(matches!(err, ConnectorError::HistoryGap { .. }));
    assert_eq!(second.state(), ConnectorState::Failed);
    assert!(manager.applied().is_empty());

    // The checkpoint is left where it was for the operator to act on.
    assert_eq!(Checkpoint::load(&path).await.unwrap().unwrap().position, e1);
}

// =============================================================================
// Target Failures
// =============================================================================

/// Test: A target that fails intermittently converges without gaps
#[tokio::test]
async fn target_flapping_recovers() {
    let dir = TempDir::new().unwrap();
    let path = checkpoint_path(&dir);
    let oplog = Arc::new(MemoryOplog::new("memory://source"));
    let (manager, managers) = single_target();

    let mut connector = connector(config_with_targets(&path, &["a"]), oplog.clone(), managers);
    connector.start().await.unwrap();

    let mut last = Position::ZERO;
    for i in 0..4 {
        manager.fail_next(1);
        last = oplog.insert("db.c", json!({"_id": i}));
        wait_for_resume(&connector, last).await;
    }
    connector.shutdown().await;

    assert_eq!(connector.state(), ConnectorState::Stopped);
    assert_eq!(manager.documents("db.c").len(), 4);
    assert_eq!(Checkpoint::load(&path).await.unwrap().unwrap().position, last);
}

/// Test: Authentication failures halt even with continueOnError
#[tokio::test]
async fn target_authentication_failure_halts() {
    let dir = TempDir::new().unwrap();
    let path = checkpoint_path(&dir);
    let oplog = Arc::new(MemoryOplog::new("memory://source"));
    let (manager, managers) = single_target();
    manager.reject_id(&json!(2), AdapterErrorKind::Authentication);

    let mut config = config_with_targets(&path, &["a"]);
    config.continue_on_error = true;
    let mut connector = connector(config, oplog.clone(), managers);
    connector.start().await.unwrap();

    let e1 = oplog.insert("db.c", json!({"_id": 1}));
    oplog.insert("db.c", json!({"_id": 2}));

    let err = connector.run().await.unwrap_err();
    assert!(matches!(err, ConnectorError::Authentication { .. }));
    assert_eq!(Checkpoint::load(&path).await.unwrap().unwrap().position, e1);
}

/// Test: Shutdown interrupts a blocked target, and the event is re-delivered
/// on the next run
#[tokio::test]
async fn shutdown_during_block_redelivers_on_restart() {
    let dir = TempDir::new().unwrap();
    let path = checkpoint_path(&dir);
    let oplog = Arc::new(MemoryOplog::new("memory://source"));
    let (manager, managers) = single_target();
    manager.reject_id(&json!(2), AdapterErrorKind::InvalidDocument);

    let mut config = config_with_targets(&path, &["a"]);
    config.halt_mode = HaltMode::Block;
    let mut blocked = connector(config.clone(), oplog.clone(), managers);
    blocked.start().await.unwrap();

    oplog.insert("db.c", json!({"_id": 1}));
    let e2 = oplog.insert("db.c", json!({"_id": 2}));
    sleep(Duration::from_millis(300)).await;

    let started = Instant::now();
    blocked.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(blocked.state(), ConnectorState::Stopped);
    assert!(manager.get("db.c", &json!(2)).is_none());
    let persisted = Checkpoint::load(&path).await.unwrap().unwrap().position;
    assert!(persisted < e2);

    let (retry, managers) = single_target();
    let mut restarted = connector(config, oplog, managers);
    restarted.start().await.unwrap();
    wait_for_resume(&restarted, e2).await;
    restarted.shutdown().await;
    assert!(retry.get("db.c", &json!(2)).is_some());
}

// =============================================================================
// Checkpoint Damage
// =============================================================================

/// Test: A corrupt checkpoint refuses to start instead of resyncing silently
#[tokio::test]
async fn corrupt_checkpoint_fails_start() {
    let dir = TempDir::new().unwrap();
    let path = checkpoint_path(&dir);
    tokio::fs::write(&path, b"{\"position\": \"12-").await.unwrap();

    let oplog = Arc::new(MemoryOplog::new("memory://source"));
    oplog.insert("db.c", json!({"_id": 1}));
    let (manager, managers) = single_target();

    let mut connector = connector(config_with_targets(&path, &["a"]), oplog, managers);
    let err = connector.start().await.unwrap_err();
    assert!(matches!(err, ConnectorError::Serialization(_)));
    assert_eq!(connector.state(), ConnectorState::Failed);
    assert!(manager.applied().is_empty());

    // Left untouched for inspection.
    let contents = tokio::fs::read(&path).await.unwrap();
    assert_eq!(contents, b"{\"position\": \"12-");
}

/// Test: A leftover temp file from an interrupted write is ignored
#[tokio::test]
async fn interrupted_checkpoint_write_recovers() {
    let dir = TempDir::new().unwrap();
    let path = checkpoint_path(&dir);
    tokio::fs::write(&path, r#"{"position":"1-0","perTarget":{"a":"1-0"},"updatedAt":0}"#)
        .await
        .unwrap();
    tokio::fs::write(format!("{}.tmp", path), b"{\"posi").await.unwrap();

    let oplog = Arc::new(MemoryOplog::new("memory://source"));
    oplog.insert("db.c", json!({"_id": 1}));
    let e2 = oplog.insert("db.c", json!({"_id": 2}));
    let (manager, managers) = single_target();

    let mut connector = connector(config_with_targets(&path, &["a"]), oplog, managers);
    connector.start().await.unwrap();
    wait_for_resume(&connector, e2).await;
    connector.shutdown().await;

    assert_eq!(manager.applied_positions(), vec![e2]);
    assert_eq!(Checkpoint::load(&path).await.unwrap().unwrap().position, e2);
}
