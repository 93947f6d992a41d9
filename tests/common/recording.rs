// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Document manager wrapper that records bulk calls.
//!
//! Delegates to a [`MemoryDocManager`] so documents and injected failures
//! behave as usual, and remembers the size of every `bulk_apply` call.
//!
//! # Example
//! ```rust,ignore
//! let recording = Arc::new(RecordingDocManager::new("a"));
//! // ... run a connector over it ...
//! assert_eq!(recording.bulk_sizes(), vec![2, 2, 1]);
//! ```

use oplog_connector::doc_manager::{BoxFuture, BulkFuture, WriteOp};
use oplog_connector::oplog::{Delta, Document};
use oplog_connector::{DocManager, MemoryDocManager, Position};
use serde_json::Value;
use std::sync::Mutex;

pub struct RecordingDocManager {
    inner: MemoryDocManager,
    bulk_sizes: Mutex<Vec<usize>>,
}

impl RecordingDocManager {
    pub fn new(name: &str) -> Self {
        Self {
            inner: MemoryDocManager::new(name),
            bulk_sizes: Mutex::new(Vec::new()),
        }
    }

    /// The wrapped adapter, for document assertions.
    pub fn inner(&self) -> &MemoryDocManager {
        &self.inner
    }

    /// Sizes of the `bulk_apply` calls, in call order.
    pub fn bulk_sizes(&self) -> Vec<usize> {
        self.bulk_sizes.lock().unwrap().clone()
    }

    /// Total number of writes handed to the adapter.
    pub fn total_writes(&self) -> usize {
        self.bulk_sizes().iter().sum()
    }
}

impl DocManager for RecordingDocManager {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn upsert(&self, doc: Document, namespace: String, position: Position) -> BoxFuture<'_, ()> {
        self.inner.upsert(doc, namespace, position)
    }

    fn update(
        &self,
        id: Value,
        delta: Delta,
        namespace: String,
        position: Position,
    ) -> BoxFuture<'_, ()> {
        self.inner.update(id, delta, namespace, position)
    }

    fn remove(&self, id: Value, namespace: String, position: Position) -> BoxFuture<'_, ()> {
        self.inner.remove(id, namespace, position)
    }

    fn bulk_apply(&self, ops: Vec<WriteOp>) -> BulkFuture<'_> {
        self.bulk_sizes.lock().unwrap().push(ops.len());
        self.inner.bulk_apply(ops)
    }

    fn commit(&self) -> BoxFuture<'_, ()> {
        self.inner.commit()
    }

    fn last_applied_position(&self, namespace: &str) -> BoxFuture<'_, Option<Position>> {
        self.inner.last_applied_position(namespace)
    }

    fn stop(&self) -> BoxFuture<'_, ()> {
        self.inner.stop()
    }
}
