// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory document manager.
//!
//! Keeps target collections in process. Used when embedding the connector
//! and throughout the tests, so it also records every applied operation and
//! supports injected failures.

use crate::doc_manager::{AdapterError, AdapterErrorKind, AdapterResult, BoxFuture, DocManager};
use crate::oplog::{id_string, remove_path, set_path, Delta, Document, Position, ID_FIELD};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use tracing::debug;

/// One operation the adapter accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedOp {
    pub namespace: String,
    pub position: Position,
    pub id: String,
    /// `upsert`, `update` or `remove`.
    pub op: &'static str,
}

#[derive(Default)]
struct State {
    collections: BTreeMap<String, BTreeMap<String, Document>>,
    positions: BTreeMap<String, Position>,
    applied: Vec<AppliedOp>,
    commits: usize,
    rejected: HashMap<String, AdapterErrorKind>,
    transient_failures: usize,
    stopped: bool,
}

/// Document manager backed by in-process maps.
pub struct MemoryDocManager {
    name: String,
    unique_key: String,
    state: Mutex<State>,
}

impl MemoryDocManager {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            unique_key: ID_FIELD.to_string(),
            state: Mutex::new(State::default()),
        }
    }

    /// Identify documents by `unique_key` instead of `_id`.
    pub fn with_unique_key(mut self, unique_key: &str) -> Self {
        self.unique_key = unique_key.to_string();
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reject every write of the document with `id` with an error of `kind`.
    pub fn reject_id(&self, id: &Value, kind: AdapterErrorKind) {
        self.lock().rejected.insert(id_string(id), kind);
    }

    /// Stop rejecting anything.
    pub fn clear_rejections(&self) {
        self.lock().rejected.clear();
    }

    /// Fail the next `n` writes with a connection error.
    pub fn fail_next(&self, n: usize) {
        self.lock().transient_failures = n;
    }

    /// Documents in a namespace, ordered by id.
    pub fn documents(&self, namespace: &str) -> Vec<Document> {
        self.lock()
            .collections
            .get(namespace)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, namespace: &str, id: &Value) -> Option<Document> {
        self.lock()
            .collections
            .get(namespace)
            .and_then(|docs| docs.get(&id_string(id)).cloned())
    }

    /// Namespaces that hold at least one document.
    pub fn namespaces(&self) -> Vec<String> {
        self.lock()
            .collections
            .iter()
            .filter(|(_, docs)| !docs.is_empty())
            .map(|(ns, _)| ns.clone())
            .collect()
    }

    /// Every accepted operation, in application order.
    pub fn applied(&self) -> Vec<AppliedOp> {
        self.lock().applied.clone()
    }

    /// Positions of the accepted operations, in application order.
    pub fn applied_positions(&self) -> Vec<Position> {
        self.lock().applied.iter().map(|a| a.position).collect()
    }

    pub fn commit_count(&self) -> usize {
        self.lock().commits
    }

    pub fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    fn check(state: &mut State, key: &str) -> AdapterResult<()> {
        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return Err(AdapterError::connection("injected connection failure"));
        }
        if let Some(kind) = state.rejected.get(key) {
            return Err(AdapterError::new(*kind, format!("document {} rejected", key)));
        }
        Ok(())
    }

    fn record(state: &mut State, namespace: String, position: Position, id: String, op: &'static str) {
        let latest = state.positions.entry(namespace.clone()).or_insert(position);
        if position > *latest {
            *latest = position;
        }
        debug!(namespace = %namespace, position = %position, id = %id, op, "Applied");
        state.applied.push(AppliedOp {
            namespace,
            position,
            id,
            op,
        });
    }
}

/// A `$set` path is written as a literal key when the document already
/// stores that subtree flattened.
fn is_flattened(doc: &Document, path: &str) -> bool {
    let Some((head, _)) = path.split_once('.') else {
        return false;
    };
    let prefix = format!("{}.", head);
    doc.keys().any(|k| k == path || k.starts_with(&prefix))
}

fn apply_delta(doc: &mut Document, delta: &Delta) {
    for (path, value) in &delta.set {
        if is_flattened(doc, path) {
            doc.insert(path.clone(), value.clone());
        } else {
            set_path(doc, path, value.clone());
        }
    }
    for path in &delta.unset {
        let prefix = format!("{}.", path);
        doc.retain(|k, _| k != path && !k.starts_with(&prefix));
        remove_path(doc, path);
    }
}

impl DocManager for MemoryDocManager {
    fn name(&self) -> &str {
        &self.name
    }

    fn upsert(&self, doc: Document, namespace: String, position: Position) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let Some(id) = doc.get(&self.unique_key) else {
                return Err(AdapterError::invalid_document(format!(
                    "document has no {:?} field",
                    self.unique_key
                )));
            };
            let key = id_string(id);
            let mut state = self.lock();
            Self::check(&mut state, &key)?;
            state
                .collections
                .entry(namespace.clone())
                .or_default()
                .insert(key.clone(), doc);
            Self::record(&mut state, namespace, position, key, "upsert");
            Ok(())
        })
    }

    fn update(
        &self,
        id: Value,
        delta: Delta,
        namespace: String,
        position: Position,
    ) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let key = id_string(&id);
            let mut state = self.lock();
            Self::check(&mut state, &key)?;
            let unique_key = self.unique_key.clone();
            let doc = state
                .collections
                .entry(namespace.clone())
                .or_default()
                .entry(key.clone())
                .or_insert_with(|| {
                    let mut doc = Document::new();
                    doc.insert(unique_key, id);
                    doc
                });
            apply_delta(doc, &delta);
            Self::record(&mut state, namespace, position, key, "update");
            Ok(())
        })
    }

    fn remove(&self, id: Value, namespace: String, position: Position) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let key = id_string(&id);
            let mut state = self.lock();
            Self::check(&mut state, &key)?;
            if let Some(docs) = state.collections.get_mut(&namespace) {
                docs.remove(&key);
            }
            Self::record(&mut state, namespace, position, key, "remove");
            Ok(())
        })
    }

    fn commit(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.lock().commits += 1;
            Ok(())
        })
    }

    fn last_applied_position(&self, namespace: &str) -> BoxFuture<'_, Option<Position>> {
        let namespace = namespace.to_string();
        Box::pin(async move { Ok(self.lock().positions.get(&namespace).copied()) })
    }

    fn stop(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.lock().stopped = true;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: Value) -> Document {
        match v {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    fn pos(ts: u64) -> Position {
        Position::new(ts, 0)
    }

    #[tokio::test]
    async fn test_upsert_and_remove() {
        let m = MemoryDocManager::new("mem");
        m.upsert(doc(json!({"_id": 1, "a": 1})), "db.c".into(), pos(1)).await.unwrap();
        m.upsert(doc(json!({"_id": 1, "a": 2})), "db.c".into(), pos(2)).await.unwrap();
        assert_eq!(m.documents("db.c"), vec![doc(json!({"_id": 1, "a": 2}))]);

        m.remove(json!(1), "db.c".into(), pos(3)).await.unwrap();
        assert!(m.documents("db.c").is_empty());
        assert_eq!(m.applied_positions(), vec![pos(1), pos(2), pos(3)]);
        assert_eq!(m.last_applied_position("db.c").await.unwrap(), Some(pos(3)));
        assert_eq!(m.last_applied_position("db.other").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_upsert_without_id_is_invalid() {
        let m = MemoryDocManager::new("mem");
        let err = m.upsert(doc(json!({"a": 1})), "db.c".into(), pos(1)).await.unwrap_err();
        assert_eq!(err.kind, AdapterErrorKind::InvalidDocument);
    }

    #[tokio::test]
    async fn test_update_applies_delta_and_creates_missing() {
        let m = MemoryDocManager::new("mem");
        m.upsert(doc(json!({"_id": 1, "a": {"b": 1}, "c": 1})), "db.c".into(), pos(1))
            .await
            .unwrap();
        let delta = Delta {
            set: doc(json!({"a.b": 2})),
            unset: vec!["c".to_string()],
        };
        m.update(json!(1), delta, "db.c".into(), pos(2)).await.unwrap();
        assert_eq!(m.get("db.c", &json!(1)), Some(doc(json!({"_id": 1, "a": {"b": 2}}))));

        let delta = Delta {
            set: doc(json!({"x": 1})),
            unset: vec![],
        };
        m.update(json!(2), delta, "db.c".into(), pos(3)).await.unwrap();
        assert_eq!(m.get("db.c", &json!(2)), Some(doc(json!({"_id": 2, "x": 1}))));
    }

    #[tokio::test]
    async fn test_update_on_flattened_document() {
        let m = MemoryDocManager::new("mem");
        m.upsert(doc(json!({"_id": 1, "a.b": 1, "a.c": 1})), "db.c".into(), pos(1))
            .await
            .unwrap();
        let delta = Delta {
            set: doc(json!({"a.b": 5})),
            unset: vec![],
        };
        m.update(json!(1), delta, "db.c".into(), pos(2)).await.unwrap();
        assert_eq!(m.get("db.c", &json!(1)), Some(doc(json!({"_id": 1, "a.b": 5, "a.c": 1}))));

        let delta = Delta {
            set: Document::new(),
            unset: vec!["a".to_string()],
        };
        m.update(json!(1), delta, "db.c".into(), pos(3)).await.unwrap();
        assert_eq!(m.get("db.c", &json!(1)), Some(doc(json!({"_id": 1}))));
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let m = MemoryDocManager::new("mem");
        m.fail_next(1);
        let err = m.upsert(doc(json!({"_id": 1})), "db.c".into(), pos(1)).await.unwrap_err();
        assert!(err.is_transient());
        m.upsert(doc(json!({"_id": 1})), "db.c".into(), pos(1)).await.unwrap();

        m.reject_id(&json!("bad"), AdapterErrorKind::Authentication);
        let err = m.remove(json!("bad"), "db.c".into(), pos(2)).await.unwrap_err();
        assert_eq!(err.kind, AdapterErrorKind::Authentication);
        m.clear_rejections();
        m.remove(json!("bad"), "db.c".into(), pos(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_custom_unique_key() {
        let m = MemoryDocManager::new("mem").with_unique_key("id");
        m.upsert(doc(json!({"id": "k", "v": 1})), "db.c".into(), pos(1)).await.unwrap();
        assert!(m.get("db.c", &json!("k")).is_some());
    }

    #[tokio::test]
    async fn test_commit_and_stop() {
        let m = MemoryDocManager::new("mem");
        m.commit().await.unwrap();
        m.commit().await.unwrap();
        m.stop().await.unwrap();
        assert_eq!(m.commit_count(), 2);
        assert!(m.is_stopped());
    }
}
