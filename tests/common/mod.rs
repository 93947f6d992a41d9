// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - Redis testcontainer setup
//! - A recording document manager for asserting on bulk calls
//! - Connector builders and polling helpers

#![allow(dead_code)]

pub mod containers;
pub mod recording;

pub use containers::*;
pub use recording::*;

use oplog_connector::oplog::Document;
use oplog_connector::{
    Connector, ConnectorConfig, DocManager, DocManagerConfig, OplogSource, Position, RetryConfig,
};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// How long a test waits for the pipeline before giving up.
pub const WAIT: Duration = Duration::from_secs(5);

/// Checkpoint file inside a temp dir.
pub fn checkpoint_path(dir: &TempDir) -> String {
    dir.path().join("oplog.timestamp").to_string_lossy().into_owned()
}

/// Test config with one in-memory target per id.
pub fn config_with_targets(path: &str, ids: &[&str]) -> ConnectorConfig {
    let mut config = ConnectorConfig::for_testing(path);
    config.doc_managers = ids
        .iter()
        .map(|id| DocManagerConfig::for_testing_with_id("memory", id))
        .collect();
    config
}

/// Build a connector over pre-built adapters with fast retries.
pub fn connector(
    config: ConnectorConfig,
    source: Arc<dyn OplogSource>,
    managers: Vec<Arc<dyn DocManager>>,
) -> Connector {
    Connector::with_doc_managers(config, source, managers)
        .expect("valid test config")
        .with_retry(RetryConfig::testing(), RetryConfig::testing())
}

/// Poll until the connector's checkpoint reaches `position`.
pub async fn wait_for_resume(connector: &Connector, position: Position) {
    let checkpoint = Arc::clone(connector.checkpoint().expect("connector started"));
    tokio::time::timeout(WAIT, async {
        while checkpoint.resume_point().await < position {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("checkpoint never reached {}", position));
}

/// Poll a condition until it holds. Returns false on timeout.
pub async fn wait_until<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(WAIT, async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}

/// JSON object literal as a document.
pub fn doc(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        other => panic!("not an object: {}", other),
    }
}
