// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Oplog events and the source-log seam.
//!
//! The connector reads a single ordered log of committed operations. Every
//! entry carries a [`Position`], an opaque `(timestamp, sequence)` token with a
//! total order; the connector never interprets it beyond comparison.
//!
//! # Position Format
//!
//! Positions render as `{timestamp}-{sequence}`, the same shape as a Redis
//! stream ID:
//!
//! ```text
//! 1718000000123-0   < 1718000000123-1   < 1718000000124-0
//! ```
//!
//! [`Position::ZERO`] means "before the first entry" and is used when the
//! log was empty at the time an initial import captured its start position.
//!
//! # Sources
//!
//! [`OplogSource`] is the interface the tailer and the initial import need.
//! [`MemoryOplog`] is an in-process implementation used for embedding and
//! tests; [`crate::redis_oplog::RedisOplog`] reads a Redis stream.

use crate::error::{ConnectorError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

/// A document: a JSON object keyed by field name.
pub type Document = serde_json::Map<String, Value>;

/// The identifier field every source document carries.
pub const ID_FIELD: &str = "_id";

/// Boxed future returned by source operations.
pub type SourceFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

// ═══════════════════════════════════════════════════════════════════════════════
// Position
// ═══════════════════════════════════════════════════════════════════════════════

/// Ordered log position: timestamp first, then sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Position {
    /// Commit timestamp (milliseconds for Redis-backed logs).
    pub ts: u64,
    /// Tie-breaker among entries with the same timestamp.
    pub seq: u64,
}

impl Position {
    /// Before every log entry.
    pub const ZERO: Position = Position { ts: 0, seq: 0 };

    pub const fn new(ts: u64, seq: u64) -> Self {
        Self { ts, seq }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.ts, self.seq)
    }
}

/// Error parsing a position string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid position {0:?}: expected \"<timestamp>-<sequence>\"")]
pub struct PositionParseError(pub String);

impl FromStr for Position {
    type Err = PositionParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let err = || PositionParseError(s.to_string());
        match s.split_once('-') {
            Some((ts, seq)) => Ok(Position {
                ts: ts.parse().map_err(|_| err())?,
                seq: seq.parse().map_err(|_| err())?,
            }),
            // "0" and bare timestamps are accepted, like XREAD cursors
            None => Ok(Position {
                ts: s.parse().map_err(|_| err())?,
                seq: 0,
            }),
        }
    }
}

impl Serialize for Position {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Position {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Time lag in milliseconds between two positions (`to - from`).
///
/// Only meaningful when timestamps are epoch milliseconds. Returns 0 when
/// `from` is ahead of `to`.
pub fn lag_ms(from: Position, to: Position) -> u64 {
    to.ts.saturating_sub(from.ts)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Change events
// ═══════════════════════════════════════════════════════════════════════════════

/// Logged operation type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    /// Parse an oplog op code (`i`, `u`, `d`).
    pub fn from_code(s: &str) -> Option<Self> {
        match s {
            "i" | "insert" => Some(Operation::Insert),
            "u" | "update" => Some(Operation::Update),
            "d" | "delete" => Some(Operation::Delete),
            _ => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Operation::Insert => "i",
            Operation::Update => "u",
            Operation::Delete => "d",
        }
    }
}

/// Partial update: fields to set (dotted paths allowed) and fields to remove.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Delta {
    pub set: Document,
    pub unset: Vec<String>,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.unset.is_empty()
    }

    /// Apply this delta to a full document in place.
    pub fn apply_to(&self, doc: &mut Document) {
        for (path, value) in &self.set {
            set_path(doc, path, value.clone());
        }
        for path in &self.unset {
            remove_path(doc, path);
        }
    }
}

/// Event payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Full document (inserts and replacement updates).
    Document(Document),
    /// Partial update.
    Delta(Delta),
    /// No payload (deletes).
    None,
}

impl Payload {
    /// Interpret an update specification.
    ///
    /// `{"$set": {...}, "$unset": {...}}` becomes a [`Delta`]; anything else is
    /// a replacement document.
    pub fn from_update(spec: Document) -> Self {
        let is_operator_doc = !spec.is_empty() && spec.keys().all(|k| k.starts_with('$'));
        if !is_operator_doc {
            return Payload::Document(spec);
        }
        let mut delta = Delta::default();
        if let Some(Value::Object(set)) = spec.get("$set") {
            delta.set = set.clone();
        }
        if let Some(Value::Object(unset)) = spec.get("$unset") {
            delta.unset = unset.keys().cloned().collect();
        }
        Payload::Delta(delta)
    }

    pub fn document(&self) -> Option<&Document> {
        match self {
            Payload::Document(doc) => Some(doc),
            _ => None,
        }
    }
}

/// One logged operation, immutable once read from the source.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// Log position (ordering key)
    pub position: Position,
    /// Source namespace (`database.collection`)
    pub namespace: String,
    /// Operation type
    pub op: Operation,
    /// Document identifier (`_id`)
    pub document_id: Value,
    /// Full document, delta or nothing
    pub payload: Payload,
}

impl ChangeEvent {
    pub fn insert(position: Position, namespace: impl Into<String>, doc: Document) -> Self {
        let document_id = doc.get(ID_FIELD).cloned().unwrap_or(Value::Null);
        Self {
            position,
            namespace: namespace.into(),
            op: Operation::Insert,
            document_id,
            payload: Payload::Document(doc),
        }
    }

    pub fn update(
        position: Position,
        namespace: impl Into<String>,
        document_id: Value,
        payload: Payload,
    ) -> Self {
        Self {
            position,
            namespace: namespace.into(),
            op: Operation::Update,
            document_id,
            payload,
        }
    }

    pub fn delete(position: Position, namespace: impl Into<String>, document_id: Value) -> Self {
        Self {
            position,
            namespace: namespace.into(),
            op: Operation::Delete,
            document_id,
            payload: Payload::None,
        }
    }

    /// Source commit timestamp (the position's timestamp component).
    pub fn source_timestamp(&self) -> u64 {
        self.position.ts
    }

    /// Stable string form of the document id, for logging and tracking.
    pub fn id_string(&self) -> String {
        id_string(&self.document_id)
    }
}

/// String form of an id value: strings verbatim, everything else as JSON.
pub fn id_string(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Look up a dotted path (`a.b.c`) in a document.
pub fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = doc.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Set a dotted path, creating intermediate objects as needed.
pub fn set_path(doc: &mut Document, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            doc.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let child = doc
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Document::new()));
            if !child.is_object() {
                *child = Value::Object(Document::new());
            }
            if let Value::Object(map) = child {
                set_path(map, rest, value);
            }
        }
    }
}

/// Remove a dotted path. Missing paths are ignored.
pub fn remove_path(doc: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            doc.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Value::Object(map)) = doc.get_mut(head) {
                remove_path(map, rest);
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Source seam
// ═══════════════════════════════════════════════════════════════════════════════

/// Fail with [`ConnectorError::HistoryGap`] when the oldest retained entry
/// is newer than a non-zero resume point.
///
/// The resume entry itself must still be in the log; a zero resume point
/// means "from the beginning" and never gaps.
pub fn ensure_retained(resume: Position, oldest: Option<Position>) -> Result<()> {
    match oldest {
        Some(oldest) if !resume.is_zero() && oldest > resume => Err(ConnectorError::HistoryGap { resume, oldest }),
        _ => Ok(()),
    }
}

/// What the connector needs from the source database.
///
/// Reads are idempotent at the position level: reading after the same
/// position twice returns the same events, which is what lets the tailer
/// reconnect without duplicating or losing entries.
pub trait OplogSource: Send + Sync + 'static {
    /// Endpoint name for logs and errors.
    fn name(&self) -> &str;

    /// Oldest position still retained by the log, `None` when empty.
    fn oldest_position(&self) -> SourceFuture<'_, Option<Position>>;

    /// Newest position in the log, `None` when empty.
    fn latest_position(&self) -> SourceFuture<'_, Option<Position>>;

    /// Read up to `limit` events strictly after `after`, in position order.
    ///
    /// May block up to `timeout` waiting for new entries; an empty result
    /// means nothing new arrived. Fails with `HistoryGap` when entries after
    /// `after` were already trimmed.
    fn read_after(
        &self,
        after: Position,
        limit: usize,
        timeout: Duration,
    ) -> SourceFuture<'_, Vec<ChangeEvent>>;

    /// All namespaces that currently hold documents.
    fn namespaces(&self) -> SourceFuture<'_, Vec<String>>;

    /// Current contents of a namespace (for the initial import).
    fn scan(&self, namespace: &str) -> SourceFuture<'_, Vec<Document>>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// MemoryOplog
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct MemoryState {
    entries: VecDeque<ChangeEvent>,
    collections: BTreeMap<String, BTreeMap<String, Document>>,
    clock: u64,
}

/// In-process oplog with collection state.
///
/// Appending an operation both logs it and applies it to the collection
/// snapshot, so [`OplogSource::scan`] reflects the current state the way a
/// real database would.
///
/// # Example
///
/// ```rust
/// use oplog_connector::oplog::{MemoryOplog, OplogSource, Position};
/// use serde_json::json;
///
/// # async fn example() {
/// let oplog = MemoryOplog::new("memory://source");
/// let pos = oplog.insert("shop.orders", json!({"_id": 1, "total": 12}));
/// assert_eq!(pos, Position::new(1, 0));
/// assert_eq!(oplog.latest_position().await.unwrap(), Some(pos));
/// # }
/// ```
pub struct MemoryOplog {
    name: String,
    state: Mutex<MemoryState>,
    notify: Notify,
    failing_reads: AtomicUsize,
}

impl MemoryOplog {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(MemoryState::default()),
            notify: Notify::new(),
            failing_reads: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        // A poisoned lock only means a panicking test; the data is still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Log and apply an operation. Returns the assigned position.
    pub fn append(
        &self,
        namespace: &str,
        op: Operation,
        document_id: Value,
        payload: Payload,
    ) -> Position {
        let position = {
            let mut state = self.lock();
            state.clock += 1;
            let position = Position::new(state.clock, 0);
            let key = id_string(&document_id);
            let collection = state.collections.entry(namespace.to_string()).or_default();
            match (&op, &payload) {
                (Operation::Delete, _) => {
                    collection.remove(&key);
                }
                (_, Payload::Document(doc)) => {
                    let mut doc = doc.clone();
                    doc.insert(ID_FIELD.to_string(), document_id.clone());
                    collection.insert(key, doc);
                }
                (_, Payload::Delta(delta)) => {
                    if let Some(doc) = collection.get_mut(&key) {
                        delta.apply_to(doc);
                    }
                }
                (_, Payload::None) => {}
            }
            state.entries.push_back(ChangeEvent {
                position,
                namespace: namespace.to_string(),
                op,
                document_id,
                payload,
            });
            position
        };
        self.notify.notify_waiters();
        position
    }

    /// Insert a document (must be a JSON object with an `_id`).
    pub fn insert(&self, namespace: &str, doc: Value) -> Position {
        let doc = match doc {
            Value::Object(map) => map,
            _ => Document::new(),
        };
        let id = doc.get(ID_FIELD).cloned().unwrap_or(Value::Null);
        self.append(namespace, Operation::Insert, id, Payload::Document(doc))
    }

    /// Update with an operator document (`$set`/`$unset`) or a replacement.
    pub fn update(&self, namespace: &str, id: Value, spec: Value) -> Position {
        let spec = match spec {
            Value::Object(map) => map,
            _ => Document::new(),
        };
        self.append(namespace, Operation::Update, id, Payload::from_update(spec))
    }

    pub fn delete(&self, namespace: &str, id: Value) -> Position {
        self.append(namespace, Operation::Delete, id, Payload::None)
    }

    /// Seed a collection without logging (data older than the log).
    pub fn seed(&self, namespace: &str, doc: Value) {
        if let Value::Object(doc) = doc {
            let key = doc.get(ID_FIELD).map(id_string).unwrap_or_default();
            self.lock()
                .collections
                .entry(namespace.to_string())
                .or_default()
                .insert(key, doc);
        }
    }

    /// Drop log entries older than `position` (capped-log rollover).
    pub fn trim_before(&self, position: Position) {
        let mut state = self.lock();
        while state.entries.front().is_some_and(|e| e.position < position) {
            state.entries.pop_front();
        }
    }

    /// Make the next `n` reads fail with a connection error.
    pub fn fail_next_reads(&self, n: usize) {
        self.failing_reads.store(n, Ordering::SeqCst);
    }

    /// Number of retained log entries.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Entries after `after`, checked against the retained history under
    /// the same lock.
    fn collect_after(&self, after: Position, limit: usize) -> Result<Vec<ChangeEvent>> {
        let state = self.lock();
        ensure_retained(after, state.entries.front().map(|e| e.position))?;
        Ok(state
            .entries
            .iter()
            .filter(|e| e.position > after)
            .take(limit)
            .cloned()
            .collect())
    }
}

impl OplogSource for MemoryOplog {
    fn name(&self) -> &str {
        &self.name
    }

    fn oldest_position(&self) -> SourceFuture<'_, Option<Position>> {
        Box::pin(async move { Ok(self.lock().entries.front().map(|e| e.position)) })
    }

    fn latest_position(&self) -> SourceFuture<'_, Option<Position>> {
        Box::pin(async move { Ok(self.lock().entries.back().map(|e| e.position)) })
    }

    fn read_after(
        &self,
        after: Position,
        limit: usize,
        timeout: Duration,
    ) -> SourceFuture<'_, Vec<ChangeEvent>> {
        Box::pin(async move {
            if self.take_injected_failure() {
                return Err(ConnectorError::connection(&self.name, "injected disconnect"));
            }

            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let events = self.collect_after(after, limit)?;
            if !events.is_empty() || timeout.is_zero() {
                return Ok(events);
            }

            let _ = tokio::time::timeout(timeout, notified).await;
            self.collect_after(after, limit)
        })
    }

    fn namespaces(&self) -> SourceFuture<'_, Vec<String>> {
        Box::pin(async move {
            Ok(self
                .lock()
                .collections
                .iter()
                .filter(|(_, docs)| !docs.is_empty())
                .map(|(ns, _)| ns.clone())
                .collect())
        })
    }

    fn scan(&self, namespace: &str) -> SourceFuture<'_, Vec<Document>> {
        let namespace = namespace.to_string();
        Box::pin(async move {
            Ok(self
                .lock()
                .collections
                .get(&namespace)
                .map(|docs| docs.values().cloned().collect())
                .unwrap_or_default())
        })
    }
}
