// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Batching of the routed event stream.
//!
//! The [`Batcher`] turns the ordered, filtered event stream into batches of
//! at most `batchSize` events. It is a plain state machine: the tailer feeds
//! it and decides when time has passed.
//!
//! # Design
//!
//! ```text
//! routed events ──▶ Batcher ──┬──▶ pending batch ──(full | idle | release)──▶ Batch
//!                             │
//!                             └──▶ held large-object metadata (per files namespace)
//!                                    ▲ released when all chunks were seen,
//!                                    │ or when a probe finds them at the source
//! dropped events ──▶ skip(position): advance the safe checkpoint only
//! ```
//!
//! # Acknowledgment
//!
//! Every entry carries the checkpoint position that becomes safe once the
//! entry (and everything before it) is applied. Acks strictly increase
//! across the stream. While a metadata document is held, the safe position
//! is frozen at the last position passed before it was held, so a restart
//! re-reads the held event instead of losing it.
//!
//! # Order
//!
//! Source order is kept within every batch and across batches for every
//! namespace. Events of a metadata namespace with a held document queue
//! behind it; other namespaces flow on.

use crate::config::BatchSize;
use crate::namespace::{chunks_namespace, NamespaceKind};
use crate::oplog::{id_string, ChangeEvent, Document, Operation, Payload, Position};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// An event that passed routing and projection.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedEvent {
    /// The event, with `namespace` already mapped to the target name.
    pub event: ChangeEvent,
    /// Namespace as it appears in the source log.
    pub source_namespace: String,
    pub kind: NamespaceKind,
}

impl RoutedEvent {
    pub fn new(event: ChangeEvent, target_namespace: String, kind: NamespaceKind) -> Self {
        let source_namespace = event.namespace.clone();
        Self {
            event: ChangeEvent {
                namespace: target_namespace,
                ..event
            },
            source_namespace,
            kind,
        }
    }

    /// Event routed under its own name.
    pub fn unmapped(event: ChangeEvent) -> Self {
        let namespace = event.namespace.clone();
        Self::new(event, namespace, NamespaceKind::Normal)
    }

    pub fn position(&self) -> Position {
        self.event.position
    }
}

/// One batch entry.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchEntry {
    pub event: RoutedEvent,
    /// Checkpoint position that is safe once this entry is applied.
    pub ack: Option<Position>,
}

/// An ordered group of events delivered to every target.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Batch {
    /// Monotonic batch number.
    pub seq: u64,
    /// Safe position before any entry is applied (from dropped events).
    pub leading_ack: Option<Position>,
    pub entries: Vec<BatchEntry>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Safe position once the whole batch is applied.
    pub fn final_ack(&self) -> Option<Position> {
        self.entries
            .iter()
            .rev()
            .find_map(|e| e.ack)
            .or(self.leading_ack)
    }

    pub fn first_position(&self) -> Option<Position> {
        self.entries.first().map(|e| e.event.position())
    }

    pub fn last_position(&self) -> Option<Position> {
        self.entries.last().map(|e| e.event.position())
    }
}

/// A held metadata document that waited longer than `largeObjectWait`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deferral {
    /// Source metadata namespace (`<base>.files`).
    pub files_namespace: String,
    /// Source chunks namespace to probe.
    pub chunks_namespace: String,
    /// `id_string` of the metadata document.
    pub files_id: String,
    pub position: Position,
    pub chunks_needed: u64,
}

struct Held {
    event: RoutedEvent,
    /// Chunks still missing; `None` for events queued behind a held document.
    waiting_for: Option<(String, u64)>,
    /// Safe position at the time the event was held.
    safe_before: Option<Position>,
    held_since: Instant,
}

struct ChunkTally {
    seen: HashSet<u64>,
    last_seen: Instant,
}

/// Groups the routed stream into batches.
pub struct Batcher {
    limit: Option<usize>,
    idle_timeout: Duration,
    large_object_wait: Duration,

    pending: Vec<BatchEntry>,
    leading_ack: Option<Position>,
    opened_at: Option<Instant>,
    next_seq: u64,

    /// Highest position passed through (emitted or skipped).
    high: Option<Position>,
    /// Last ack handed out.
    last_ack: Option<Position>,

    /// Held events per source metadata namespace, in arrival order.
    held: BTreeMap<String, VecDeque<Held>>,
    /// Chunks seen per (base, files_id).
    chunks: HashMap<(String, String), ChunkTally>,
}

impl Batcher {
    pub fn new(batch_size: BatchSize, idle_timeout: Duration, large_object_wait: Duration) -> Self {
        Self {
            limit: batch_size.limit(),
            idle_timeout,
            large_object_wait,
            pending: Vec::new(),
            leading_ack: None,
            opened_at: None,
            next_seq: 0,
            high: None,
            last_ack: None,
            held: BTreeMap::new(),
            chunks: HashMap::new(),
        }
    }

    /// Start acknowledging after `position` (the resume point).
    pub fn with_resume_point(mut self, position: Position) -> Self {
        self.high = Some(position);
        self.last_ack = Some(position);
        self
    }

    /// Number of entries in the pending batch.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Whether a batch is open (entries or an ack waiting to be flushed).
    pub fn is_open(&self) -> bool {
        self.opened_at.is_some()
    }

    /// Number of held events (metadata plus events queued behind them).
    pub fn held_len(&self) -> usize {
        self.held.values().map(VecDeque::len).sum()
    }

    /// Highest position that is safe to checkpoint once everything emitted
    /// so far is applied.
    pub fn safe_position(&self) -> Option<Position> {
        let floor = self
            .held
            .values()
            .filter_map(|q| q.front())
            .map(|h| h.safe_before)
            .min();
        match floor {
            Some(floor) => floor,
            None => self.high,
        }
    }

    fn next_ack(&mut self) -> Option<Position> {
        let safe = self.safe_position()?;
        if self.last_ack.is_some_and(|last| safe <= last) {
            return None;
        }
        self.last_ack = Some(safe);
        Some(safe)
    }

    fn bump_high(&mut self, position: Position) {
        if self.high.map_or(true, |h| position > h) {
            self.high = Some(position);
        }
    }

    /// Record a dropped (filtered) event: nothing to deliver, but the
    /// checkpoint may move past it.
    pub fn skip(&mut self, position: Position, now: Instant) {
        self.bump_high(position);
        if let Some(ack) = self.next_ack() {
            match self.pending.last_mut() {
                Some(last) => last.ack = Some(ack),
                None => {
                    self.leading_ack = Some(ack);
                    self.opened_at.get_or_insert(now);
                }
            }
        }
    }

    /// Add a routed event. Returns the batches that became complete.
    pub fn push(&mut self, event: RoutedEvent, now: Instant) -> Vec<Batch> {
        let mut out = Vec::new();
        // Safe position as of just before this event, in case it is held.
        let safe_before = self.safe_position();
        self.bump_high(event.position());

        if event.kind.is_large_object() {
            self.prune_tallies(now);
        }

        if let NamespaceKind::LargeObjectChunks { base } = &event.kind {
            self.tally_chunk(base, &event.event, now);
        }

        if let NamespaceKind::LargeObjectFiles { base } = &event.kind {
            let queue_busy = self
                .held
                .get(&event.source_namespace)
                .is_some_and(|q| !q.is_empty());
            if queue_busy {
                debug!(
                    namespace = %event.source_namespace,
                    position = %event.position(),
                    "Queued behind held large-object metadata"
                );
                self.held
                    .entry(event.source_namespace.clone())
                    .or_default()
                    .push_back(Held {
                        event,
                        waiting_for: None,
                        safe_before,
                        held_since: now,
                    });
                return out;
            }
            if let Some(waiting) = self.missing_chunks(base, &event.event) {
                info!(
                    namespace = %event.source_namespace,
                    position = %event.position(),
                    files_id = %waiting.0,
                    chunks_needed = waiting.1,
                    "Holding large-object metadata until its chunks are seen"
                );
                crate::metrics::record_large_object_deferred();
                self.held
                    .entry(event.source_namespace.clone())
                    .or_default()
                    .push_back(Held {
                        event,
                        waiting_for: Some(waiting),
                        safe_before,
                        held_since: now,
                    });
                return out;
            }
        }

        let released_base = match &event.kind {
            NamespaceKind::LargeObjectChunks { base } => Some(base.clone()),
            _ => None,
        };

        self.emit(event, now, &mut out);

        if let Some(base) = released_base {
            self.drain_ready(&base, now, &mut out);
        }
        out
    }

    fn emit(&mut self, event: RoutedEvent, now: Instant, out: &mut Vec<Batch>) {
        self.bump_high(event.position());
        let ack = self.next_ack();
        self.opened_at.get_or_insert(now);
        self.pending.push(BatchEntry { event, ack });
        if self.limit.is_some_and(|limit| self.pending.len() >= limit) {
            out.extend(self.flush());
        }
    }

    /// Release every held queue of `base` whose front is now complete.
    fn drain_ready(&mut self, base: &str, now: Instant, out: &mut Vec<Batch>) {
        let namespaces: Vec<String> = self
            .held
            .iter()
            .filter(|(_, q)| {
                q.front().is_some_and(|h| {
                    matches!(&h.event.kind, NamespaceKind::LargeObjectFiles { base: b } if b == base)
                })
            })
            .map(|(ns, _)| ns.clone())
            .collect();

        for namespace in namespaces {
            let ready = self.held.get(&namespace).and_then(|q| q.front()).is_some_and(|h| {
                match &h.waiting_for {
                    Some((files_id, needed)) => self.chunk_count(base, files_id) >= *needed,
                    None => true,
                }
            });
            if ready {
                self.release_front(&namespace, now, out);
            }
        }
    }

    fn release_front(&mut self, files_namespace: &str, now: Instant, out: &mut Vec<Batch>) {
        let mut released = 0usize;

        // The front goes out unconditionally; events behind it follow until
        // one of them is itself incomplete. The rest of the queue stays held
        // while releasing, so acks never pass it.
        let mut force = true;
        loop {
            let Some(queue) = self.held.get_mut(files_namespace) else {
                break;
            };
            let Some(front) = queue.pop_front() else {
                self.held.remove(files_namespace);
                break;
            };
            let base = match &front.event.kind {
                NamespaceKind::LargeObjectFiles { base } => base.clone(),
                _ => String::new(),
            };
            if !force {
                if let Some(waiting) = self.missing_chunks(&base, &front.event.event) {
                    if let Some(queue) = self.held.get_mut(files_namespace) {
                        queue.push_front(Held {
                            waiting_for: Some(waiting),
                            held_since: now,
                            ..front
                        });
                    }
                    break;
                }
            }
            force = false;
            if self.held.get(files_namespace).is_some_and(VecDeque::is_empty) {
                self.held.remove(files_namespace);
            }
            if let Some((files_id, _)) = &front.waiting_for {
                self.chunks.remove(&(base, files_id.clone()));
            }
            released += 1;
            self.emit_released(front.event, now, out);
        }

        debug!(namespace = %files_namespace, released, "Released held large-object events");
        crate::metrics::record_large_object_released(released);

        if self.limit.is_none() {
            out.extend(self.flush());
        }
    }

    fn emit_released(&mut self, event: RoutedEvent, now: Instant, out: &mut Vec<Batch>) {
        // Released events are older than `high`; they do not move it.
        let ack = self.next_ack();
        self.opened_at.get_or_insert(now);
        self.pending.push(BatchEntry { event, ack });
        if self.limit.is_some_and(|limit| self.pending.len() >= limit) {
            out.extend(self.flush());
        }
    }

    /// Emit the pending batch, if it has anything to deliver or acknowledge.
    pub fn flush(&mut self) -> Option<Batch> {
        if self.pending.is_empty() && self.leading_ack.is_none() {
            return None;
        }
        self.opened_at = None;
        let batch = Batch {
            seq: self.next_seq,
            leading_ack: self.leading_ack.take(),
            entries: std::mem::take(&mut self.pending),
        };
        self.next_seq += 1;
        Some(batch)
    }

    /// Whether the pending batch has been open for the idle timeout.
    pub fn should_flush(&self, now: Instant) -> bool {
        self.opened_at
            .is_some_and(|opened| now.saturating_duration_since(opened) >= self.idle_timeout)
    }

    /// Held metadata documents older than `largeObjectWait`.
    pub fn expired(&self, now: Instant) -> Vec<Deferral> {
        self.held
            .iter()
            .filter_map(|(files_namespace, queue)| {
                let front = queue.front()?;
                let (files_id, needed) = front.waiting_for.as_ref()?;
                if now.saturating_duration_since(front.held_since) < self.large_object_wait {
                    return None;
                }
                let NamespaceKind::LargeObjectFiles { base } = &front.event.kind else {
                    return None;
                };
                Some(Deferral {
                    files_namespace: files_namespace.clone(),
                    chunks_namespace: chunks_namespace(base),
                    files_id: files_id.clone(),
                    position: front.event.position(),
                    chunks_needed: *needed,
                })
            })
            .collect()
    }

    /// Release a held metadata document whose chunks were found at the
    /// source (they predate the resume point).
    pub fn release(&mut self, deferral: &Deferral, now: Instant) -> Vec<Batch> {
        let mut out = Vec::new();
        let matches = self
            .held
            .get(&deferral.files_namespace)
            .and_then(|q| q.front())
            .is_some_and(|h| h.event.position() == deferral.position);
        if matches {
            info!(
                namespace = %deferral.files_namespace,
                position = %deferral.position,
                "Chunks already present at source, releasing metadata"
            );
            self.release_front(&deferral.files_namespace, now, &mut out);
        }
        out
    }

    /// Restart the wait for a held document whose probe came up short.
    pub fn rearm(&mut self, deferral: &Deferral, now: Instant) {
        if let Some(front) = self
            .held
            .get_mut(&deferral.files_namespace)
            .and_then(|q| q.front_mut())
        {
            if front.event.position() == deferral.position {
                warn!(
                    namespace = %deferral.files_namespace,
                    position = %deferral.position,
                    chunks_needed = deferral.chunks_needed,
                    "Large-object chunks still missing, waiting again"
                );
                front.held_since = now;
            }
        }
    }

    fn tally_chunk(&mut self, base: &str, event: &ChangeEvent, now: Instant) {
        if event.op != Operation::Insert {
            return;
        }
        let Some(doc) = event.payload.document() else {
            return;
        };
        let (Some(files_id), Some(n)) = (doc.get("files_id"), doc.get("n").and_then(as_u64)) else {
            return;
        };
        let tally = self
            .chunks
            .entry((base.to_string(), id_string(files_id)))
            .or_insert_with(|| ChunkTally {
                seen: HashSet::new(),
                last_seen: now,
            });
        tally.seen.insert(n);
        tally.last_seen = now;
    }

    fn chunk_count(&self, base: &str, files_id: &str) -> u64 {
        self.chunks
            .get(&(base.to_string(), files_id.to_string()))
            .map_or(0, |t| t.seen.len() as u64)
    }

    /// `(files_id, chunks_needed)` if a metadata insert must still wait.
    fn missing_chunks(&self, base: &str, event: &ChangeEvent) -> Option<(String, u64)> {
        if event.op != Operation::Insert {
            return None;
        }
        let Payload::Document(doc) = &event.payload else {
            return None;
        };
        let needed = chunks_needed(doc)?;
        let files_id = event.id_string();
        (self.chunk_count(base, &files_id) < needed).then_some((files_id, needed))
    }

    /// Forget chunk tallies that no metadata document claimed in a while.
    fn prune_tallies(&mut self, now: Instant) {
        let horizon = self.large_object_wait * 4;
        self.chunks
            .retain(|_, t| now.saturating_duration_since(t.last_seen) < horizon);
    }
}

/// `ceil(length / chunkSize)`, `None` when the document does not describe
/// its chunks (nothing to wait for).
pub fn chunks_needed(doc: &Document) -> Option<u64> {
    let length = doc.get("length").and_then(as_u64)?;
    let chunk_size = doc.get("chunkSize").and_then(as_u64).filter(|c| *c > 0)?;
    Some(length.div_ceil(chunk_size))
}

fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::Object(map) => map
            .get("$numberLong")
            .or_else(|| map.get("$numberInt"))
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok()),
        _ => None,
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

    fn insert(ts: u64, ns: &str, body: Value) -> RoutedEvent {
        RoutedEvent::unmapped(ChangeEvent::insert(Position::new(ts, 0), ns, doc(body)))
    }

    fn gridfs(ts: u64, ns: &str, body: Value, files: bool) -> RoutedEvent {
        let event = ChangeEvent::insert(Position::new(ts, 0), ns, doc(body));
        let kind = if files {
            NamespaceKind::LargeObjectFiles { base: "media.fs".into() }
        } else {
            NamespaceKind::LargeObjectChunks { base: "media.fs".into() }
        };
        RoutedEvent::new(event, ns.to_string(), kind)
    }

    fn batcher(size: BatchSize) -> Batcher {
        Batcher::new(size, Duration::from_millis(100), Duration::from_secs(30))
    }

    fn positions(batch: &Batch) -> Vec<u64> {
        batch.entries.iter().map(|e| e.event.position().ts).collect()
    }

    #[test]
    fn test_bounded_batches_of_two_one() {
        let now = Instant::now();
        let mut b = batcher(BatchSize::bounded(2).unwrap());
        let mut batches = Vec::new();
        for ts in 1..=5 {
            batches.extend(b.push(insert(ts, "db.c", json!({"_id": ts})), now));
        }
        batches.extend(b.flush());

        let sizes: Vec<usize> = batches.iter().map(Batch::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(batches[2].final_ack(), Some(Position::new(5, 0)));
        assert_eq!(batches.iter().map(|b| b.seq).collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn test_unbounded_flushes_on_idle() {
        let now = Instant::now();
        let mut b = batcher(BatchSize::Unbounded);
        for ts in 1..=5 {
            assert!(b.push(insert(ts, "db.c", json!({"_id": ts})), now).is_empty());
        }
        assert!(!b.should_flush(now + Duration::from_millis(50)));
        assert!(b.should_flush(now + Duration::from_millis(100)));
        let batch = b.flush().unwrap();
        assert_eq!(batch.len(), 5);
        assert!(b.flush().is_none());
    }

    #[test]
    fn test_acks_strictly_increase() {
        let now = Instant::now();
        let mut b = batcher(BatchSize::Unbounded).with_resume_point(Position::new(2, 0));
        b.push(insert(3, "db.c", json!({"_id": 3})), now);
        b.push(insert(4, "db.c", json!({"_id": 4})), now);
        let batch = b.flush().unwrap();
        let acks: Vec<_> = batch.entries.iter().map(|e| e.ack).collect();
        assert_eq!(acks, vec![Some(Position::new(3, 0)), Some(Position::new(4, 0))]);
    }

    #[test]
    fn test_skip_moves_ack() {
        let now = Instant::now();
        let mut b = batcher(BatchSize::Unbounded);

        b.skip(Position::new(1, 0), now);
        let batch = b.flush().unwrap();
        assert!(batch.is_empty());
        assert_eq!(batch.final_ack(), Some(Position::new(1, 0)));

        b.push(insert(2, "db.c", json!({"_id": 2})), now);
        b.skip(Position::new(3, 0), now);
        let batch = b.flush().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.entries[0].ack, Some(Position::new(3, 0)));
    }

    #[test]
    fn test_metadata_waits_for_chunks() {
        let now = Instant::now();
        let mut b = batcher(BatchSize::Unbounded);

        // 2 chunks needed (length 300, chunkSize 255)
        let out = b.push(
            gridfs(1, "media.fs.files", json!({"_id": "f1", "length": 300, "chunkSize": 255}), true),
            now,
        );
        assert!(out.is_empty());
        assert_eq!(b.held_len(), 1);

        b.push(insert(2, "db.other", json!({"_id": 1})), now);
        b.push(gridfs(3, "media.fs.chunks", json!({"_id": "c0", "files_id": "f1", "n": 0}), false), now);
        assert_eq!(b.held_len(), 1);

        let out = b.push(
            gridfs(4, "media.fs.chunks", json!({"_id": "c1", "files_id": "f1", "n": 1}), false),
            now,
        );
        // Unbounded: releasing the metadata is a batch boundary.
        assert_eq!(out.len(), 1);
        assert_eq!(positions(&out[0]), vec![2, 3, 4, 1]);
        assert_eq!(b.held_len(), 0);

        // Nothing past the held event was acknowledged until it was released.
        let acks: Vec<_> = out[0].entries.iter().map(|e| e.ack).collect();
        assert_eq!(acks, vec![None, None, None, Some(Position::new(4, 0))]);
    }

    #[test]
    fn test_chunks_before_metadata_release_immediately() {
        let now = Instant::now();
        let mut b = batcher(BatchSize::Unbounded);
        b.push(gridfs(1, "media.fs.chunks", json!({"files_id": "f1", "n": 0}), false), now);
        b.push(
            gridfs(2, "media.fs.files", json!({"_id": "f1", "length": 10, "chunkSize": 255}), true),
            now,
        );
        assert_eq!(b.held_len(), 0);
        assert_eq!(positions(&b.flush().unwrap()), vec![1, 2]);
    }

    #[test]
    fn test_zero_length_file_not_held() {
        let now = Instant::now();
        let mut b = batcher(BatchSize::Unbounded);
        b.push(
            gridfs(1, "media.fs.files", json!({"_id": "empty", "length": 0, "chunkSize": 255}), true),
            now,
        );
        assert_eq!(b.held_len(), 0);
        assert_eq!(b.pending_len(), 1);
    }

    #[test]
    fn test_later_metadata_events_queue_behind_held() {
        let now = Instant::now();
        let mut b = batcher(BatchSize::Unbounded);
        b.push(
            gridfs(1, "media.fs.files", json!({"_id": "f1", "length": 1, "chunkSize": 255}), true),
            now,
        );
        let update = RoutedEvent::new(
            ChangeEvent::update(
                Position::new(2, 0),
                "media.fs.files",
                json!("f1"),
                Payload::Delta(crate::oplog::Delta {
                    set: doc(json!({"filename": "x"})),
                    unset: vec![],
                }),
            ),
            "media.fs.files".into(),
            NamespaceKind::LargeObjectFiles { base: "media.fs".into() },
        );
        b.push(update, now);
        assert_eq!(b.held_len(), 2);

        let out = b.push(gridfs(3, "media.fs.chunks", json!({"files_id": "f1", "n": 0}), false), now);
        assert_eq!(positions(&out[0]), vec![3, 1, 2]);
    }

    #[test]
    fn test_expired_deferral_probe_and_release() {
        let now = Instant::now();
        let mut b = Batcher::new(
            BatchSize::bounded(10).unwrap(),
            Duration::from_millis(100),
            Duration::from_secs(1),
        );
        b.push(
            gridfs(5, "media.fs.files", json!({"_id": "old", "length": 600, "chunkSize": 255}), true),
            now,
        );
        assert!(b.expired(now).is_empty());

        let later = now + Duration::from_secs(2);
        let expired = b.expired(later);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].chunks_namespace, "media.fs.chunks");
        assert_eq!(expired[0].chunks_needed, 3);

        b.rearm(&expired[0], later);
        assert!(b.expired(later).is_empty());

        let out = b.release(&expired[0], later);
        assert!(out.is_empty(), "bounded batches wait for size or idle");
        assert_eq!(b.held_len(), 0);
        let batch = b.flush().unwrap();
        assert_eq!(positions(&batch), vec![5]);
        assert_eq!(batch.final_ack(), Some(Position::new(5, 0)));
    }

    #[test]
    fn test_chunks_needed() {
        assert_eq!(chunks_needed(&doc(json!({"length": 300, "chunkSize": 255}))), Some(2));
        assert_eq!(chunks_needed(&doc(json!({"length": 255, "chunkSize": 255}))), Some(1));
        assert_eq!(chunks_needed(&doc(json!({"length": 0, "chunkSize": 255}))), Some(0));
        assert_eq!(
            chunks_needed(&doc(json!({"length": {"$numberLong": "510"}, "chunkSize": 255}))),
            Some(2)
        );
        assert_eq!(chunks_needed(&doc(json!({"length": 10}))), None);
        assert_eq!(chunks_needed(&doc(json!({"length": 10, "chunkSize": 0}))), None);
    }
}
