// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Oplog tailer: reads the source, routes and batches events, and fans
//! batches out to the target queues.
//!
//! There is exactly one tailer per connector. It:
//! 1. Reads up to `readLimit` events after its read position
//! 2. Routes each event (drops system, excluded and not-included namespaces)
//! 3. Projects fields (drops updates left with nothing to apply)
//! 4. Batches the survivors and sends every batch to every target queue
//!
//! # Backpressure
//!
//! Target queues are bounded. A batch that does not fit a full queue waits
//! in that target's backlog, so a stuck target never holds up the others.
//! Backlogged batches are the same `Arc` every queue received. Reading
//! suspends only when every open target has a backlog, and resumes as soon
//! as any of them has room again.
//!
//! # History Gaps
//!
//! Every read fails with a history gap when the source trimmed past the
//! read position, so a tailer that falls behind while connected stops
//! instead of silently skipping entries. The same check runs at start and
//! after each reconnect.
//!
//! # Reconnecting
//!
//! A transient source error holds the read position and backs off.
//!
//! # Graceful Shutdown
//!
//! The current read is cancelled, the open batch is flushed to the targets
//! and the queues are closed so the workers can drain. Large-object metadata
//! still held is not acknowledged and is read again on the next start.

use super::types::TailerState;
use crate::batch::{Batch, Batcher, Deferral, RoutedEvent};
use crate::checkpoint::CheckpointStore;
use crate::error::{ConnectorError, Result};
use crate::metrics;
use crate::namespace::{NamespaceRouter, Route};
use crate::oplog::{ensure_retained, id_string, lag_ms, ChangeEvent, OplogSource, Position};
use crate::projection::FieldProjection;
use crate::resilience::RetryConfig;
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// How often to emit the lag gauge (in reads).
const LAG_CHECK_INTERVAL: u32 = 10;

/// Sending half of one target's queue.
pub(crate) struct TargetQueue {
    pub(crate) target_id: String,
    pub(crate) tx: mpsc::Sender<Arc<Batch>>,
    pub(crate) queued: Arc<AtomicUsize>,
    /// Batches waiting for room in the queue, oldest first.
    backlog: VecDeque<Arc<Batch>>,
    closed: bool,
}

impl TargetQueue {
    pub(crate) fn new(target_id: String, tx: mpsc::Sender<Arc<Batch>>, queued: Arc<AtomicUsize>) -> Self {
        Self {
            target_id,
            tx,
            queued,
            backlog: VecDeque::new(),
            closed: false,
        }
    }

    fn push(&mut self, batch: Arc<Batch>) {
        let depth = self.queued.fetch_add(1, Ordering::AcqRel) + 1;
        metrics::set_queue_depth(&self.target_id, depth);
        self.backlog.push_back(batch);
    }

    /// Move backlogged batches into the queue until it is full.
    fn pump(&mut self) {
        while let Some(batch) = self.backlog.pop_front() {
            match self.tx.try_send(batch) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(batch)) => {
                    self.backlog.push_front(batch);
                    return;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.close(1);
                    return;
                }
            }
        }
    }

    /// Deliver the whole backlog, waiting for the worker to take it.
    async fn drain(&mut self) {
        while let Some(batch) = self.backlog.pop_front() {
            if self.tx.send(batch).await.is_err() {
                self.close(1);
                return;
            }
        }
    }

    /// Stop delivering. `in_flight` counts a batch already taken off the
    /// backlog.
    fn close(&mut self, in_flight: usize) {
        let dropped = self.backlog.len() + in_flight;
        self.backlog.clear();
        let _ = self
            .queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(dropped)));
        self.closed = true;
        // The worker stopped (halt or interrupted back-off).
        warn!(target_id = %self.target_id, dropped, "Target queue closed, no longer delivering");
    }

    fn is_backlogged(&self) -> bool {
        !self.closed && !self.backlog.is_empty()
    }
}

/// Read-side settings.
#[derive(Debug, Clone)]
pub(crate) struct TailerSettings {
    pub(crate) read_limit: usize,
    pub(crate) read_timeout: Duration,
    pub(crate) idle_timeout: Duration,
    pub(crate) reconnect: RetryConfig,
}

pub(crate) struct Tailer {
    source: Arc<dyn OplogSource>,
    router: NamespaceRouter,
    projection: FieldProjection,
    batcher: Batcher,
    targets: Vec<TargetQueue>,
    checkpoint: Arc<CheckpointStore>,
    settings: TailerSettings,
    state_tx: watch::Sender<TailerState>,
    failures: mpsc::UnboundedSender<ConnectorError>,
    shutdown_rx: watch::Receiver<bool>,

    /// Position of the last event read.
    position: Position,
}

impl Tailer {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        source: Arc<dyn OplogSource>,
        router: NamespaceRouter,
        projection: FieldProjection,
        batcher: Batcher,
        targets: Vec<TargetQueue>,
        checkpoint: Arc<CheckpointStore>,
        settings: TailerSettings,
        state_tx: watch::Sender<TailerState>,
        failures: mpsc::UnboundedSender<ConnectorError>,
        shutdown_rx: watch::Receiver<bool>,
        resume_point: Position,
    ) -> Self {
        Self {
            source,
            router,
            projection,
            batcher,
            targets,
            checkpoint,
            settings,
            state_tx,
            failures,
            shutdown_rx,
            position: resume_point,
        }
    }

    /// Run until shutdown or a fatal source error.
    pub(crate) async fn run(mut self) {
        let span = info_span!("tailer", source = %self.source.name());

        async move {
            info!(
                resume_point = %self.position,
                read_limit = self.settings.read_limit,
                targets = self.targets.len(),
                "Starting oplog tailer"
            );
            self.set_state(TailerState::Starting);

            let outcome = self.tail().await;
            let failed = outcome.is_err();

            // Report first: draining can wait on a target that only stops
            // once the connector shuts down.
            if let Err(e) = outcome {
                self.set_state(TailerState::Error);
                error!(position = %self.position, error = %e, "Oplog tailer failed");
                let _ = self.failures.send(e);
            }

            if let Some(batch) = self.batcher.flush() {
                self.enqueue(batch);
            }
            if self.batcher.held_len() > 0 {
                info!(
                    held = self.batcher.held_len(),
                    "Large-object metadata still held, will be re-read on restart"
                );
            }
            for target in self.targets.iter_mut().filter(|t| !t.closed) {
                target.drain().await;
            }
            // Dropping the senders lets the workers drain and exit.
            self.targets.clear();

            if !failed {
                self.set_state(TailerState::Stopped);
                info!(position = %self.position, "Oplog tailer stopped");
            }
        }
        .instrument(span)
        .await
    }

    async fn tail(&mut self) -> Result<()> {
        if let Err(e) = self.check_history().await {
            if !e.is_retryable() {
                return Err(e);
            }
            self.reconnect(e).await?;
        }

        let mut reads: u32 = 0;
        loop {
            if *self.shutdown_rx.borrow() {
                return Ok(());
            }

            self.pump();
            self.service_timers().await;

            // An open batch or a backlog must not wait a full read timeout.
            let timeout = if self.batcher.is_open() || self.targets.iter().any(TargetQueue::is_backlogged) {
                self.settings.read_timeout.min(self.settings.idle_timeout)
            } else {
                self.settings.read_timeout
            };

            let started = std::time::Instant::now();
            let read = tokio::select! {
                read = self.source.read_after(self.position, self.settings.read_limit, timeout) => read,
                _ = self.shutdown_rx.changed() => {
                    debug!("Shutdown signal received, cancelling read");
                    return Ok(());
                }
            };

            match read {
                Ok(events) => {
                    metrics::record_source_read(events.len(), started.elapsed());
                    let state = if events.len() >= self.settings.read_limit {
                        TailerState::CatchingUp
                    } else {
                        TailerState::Tailing
                    };
                    self.set_state(state);

                    for event in events {
                        self.handle(event).await;
                    }

                    reads = reads.wrapping_add(1);
                    if reads % LAG_CHECK_INTERVAL == 0 {
                        let applied = self.checkpoint.resume_point().await;
                        metrics::set_replication_lag_ms(lag_ms(applied, self.position));
                    }
                }
                Err(e) if e.is_retryable() => self.reconnect(e).await?,
                Err(e) => {
                    metrics::record_source_error("read_after");
                    return Err(report_history_gap(e));
                }
            }
        }
    }

    /// Route, project and batch one event.
    async fn handle(&mut self, event: ChangeEvent) {
        let now = Instant::now();
        let position = event.position;
        if position <= self.position {
            // Sources never repeat entries, but a replayed read must not
            // push positions backwards.
            return;
        }
        self.position = position;

        let (namespace, kind) = match self.router.route_event(&event) {
            Route::Target { namespace, kind } => (namespace, kind),
            Route::Dropped(reason) => {
                metrics::record_event_dropped(reason.as_str());
                self.batcher.skip(position, now);
                return;
            }
        };

        let Some(projected) = self.projection.project_event(&event) else {
            debug!(namespace = %event.namespace, position = %position, "Update has no projected fields, dropping");
            metrics::record_event_dropped("projected_empty");
            self.batcher.skip(position, now);
            return;
        };

        for batch in self.batcher.push(RoutedEvent::new(projected, namespace, kind), now) {
            self.deliver(batch).await;
        }
    }

    /// Idle flush and probes for large objects held too long.
    async fn service_timers(&mut self) {
        let now = Instant::now();

        for deferral in self.batcher.expired(now) {
            match self.chunks_present(&deferral).await {
                Ok(true) => {
                    for batch in self.batcher.release(&deferral, now) {
                        self.deliver(batch).await;
                    }
                }
                Ok(false) => self.batcher.rearm(&deferral, now),
                Err(e) => {
                    warn!(
                        namespace = %deferral.chunks_namespace,
                        error = %e,
                        "Failed to probe large-object chunks"
                    );
                    self.batcher.rearm(&deferral, now);
                }
            }
        }

        if self.batcher.should_flush(now) {
            if let Some(batch) = self.batcher.flush() {
                self.deliver(batch).await;
            }
        }
    }

    /// Whether all chunks of a held metadata document exist at the source.
    async fn chunks_present(&self, deferral: &Deferral) -> Result<bool> {
        let chunks = self.source.scan(&deferral.chunks_namespace).await?;
        let seen: HashSet<u64> = chunks
            .iter()
            .filter(|doc| {
                doc.get("files_id")
                    .is_some_and(|id| id_string(id) == deferral.files_id)
            })
            .filter_map(|doc| doc.get("n").and_then(Value::as_u64))
            .collect();
        Ok(seen.len() as u64 >= deferral.chunks_needed)
    }

    /// Hand a batch to every open target, then wait while all of them are
    /// backlogged.
    async fn deliver(&mut self, batch: Batch) {
        self.enqueue(batch);
        self.wait_for_room().await;
    }

    fn enqueue(&mut self, batch: Batch) {
        metrics::record_batch_emitted(batch.len());
        debug!(
            seq = batch.seq,
            events = batch.len(),
            final_ack = ?batch.final_ack(),
            "Emitting batch"
        );
        let batch = Arc::new(batch);

        for target in self.targets.iter_mut().filter(|t| !t.closed) {
            target.push(Arc::clone(&batch));
        }
        self.pump();
    }

    fn pump(&mut self) {
        for target in self.targets.iter_mut().filter(|t| !t.closed) {
            target.pump();
        }
    }

    /// Suspend while every open target is backlogged. Returns once any of
    /// them has room again, or on shutdown.
    async fn wait_for_room(&mut self) {
        loop {
            if *self.shutdown_rx.borrow() {
                return;
            }
            let open = self.targets.iter().filter(|t| !t.closed).count();
            let backlogged = self.targets.iter().filter(|t| t.is_backlogged()).count();
            if open == 0 || backlogged < open {
                return;
            }

            debug!(targets = open, "All target queues full, suspending reads");
            {
                let room = self
                    .targets
                    .iter()
                    .filter(|t| !t.closed)
                    .map(|t| Box::pin(t.tx.reserve()));
                tokio::select! {
                    // The permit is released on drop; `pump` claims the slot.
                    _ = futures::future::select_all(room) => {}
                    _ = self.shutdown_rx.changed() => return,
                }
            }
            self.pump();
        }
    }

    /// Fail if the source no longer retains history after the read position.
    async fn check_history(&self) -> Result<()> {
        let oldest = self.source.oldest_position().await?;
        check_history_gap(self.position, oldest)
    }

    /// Back off until the source answers again. Returns `Ok` on reconnect or
    /// shutdown.
    async fn reconnect(&mut self, cause: ConnectorError) -> Result<()> {
        warn!(position = %self.position, error = %cause, "Source unavailable, reconnecting");
        metrics::record_source_error("read_after");
        self.set_state(TailerState::Reconnecting);

        let mut attempt = 1;
        loop {
            let delay = self.settings.reconnect.delay_for_attempt(attempt);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown_rx.changed() => return Ok(()),
            }

            match self.check_history().await {
                Ok(()) => {
                    metrics::record_source_reconnect(true);
                    info!(attempt, position = %self.position, "Reconnected to source");
                    return Ok(());
                }
                Err(e) if e.is_retryable() => {
                    metrics::record_source_reconnect(false);
                    if !self.settings.reconnect.should_retry(attempt) {
                        return Err(e);
                    }
                    warn!(attempt, delay = ?delay, error = %e, "Reconnect failed, retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn set_state(&self, state: TailerState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Tailer state changed");
            metrics::set_tailer_state(&state.to_string());
        }
    }
}

/// Fail if the oldest retained entry is newer than a non-zero resume point.
pub(crate) fn check_history_gap(resume: Position, oldest: Option<Position>) -> Result<()> {
    ensure_retained(resume, oldest).map_err(report_history_gap)
}

fn report_history_gap(e: ConnectorError) -> ConnectorError {
    if let ConnectorError::HistoryGap { resume, oldest } = &e {
        metrics::record_history_gap();
        error!(
            resume = %resume,
            oldest = %oldest,
            "Source history no longer reaches the resume point, resync required"
        );
    }
    e
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BatchSize, NamespaceConfig};
    use crate::oplog::MemoryOplog;
    use serde_json::json;
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        oplog: Arc<MemoryOplog>,
        rx: mpsc::Receiver<Arc<Batch>>,
        state_rx: watch::Receiver<TailerState>,
        failures_rx: mpsc::UnboundedReceiver<ConnectorError>,
        shutdown_tx: watch::Sender<bool>,
        handle: tokio::task::JoinHandle<()>,
    }

    async fn start(
        oplog: Arc<MemoryOplog>,
        router: NamespaceRouter,
        batch_size: BatchSize,
        resume: Position,
    ) -> Harness {
        let (tx, rx) = mpsc::channel(64);
        let (h, _) = spawn(oplog, router, batch_size, resume, 100, vec![("t", tx)]).await;
        Harness { rx, ..h }
    }

    /// Tailer over the given queues. The returned harness receives nothing
    /// on its own `rx`.
    async fn spawn(
        oplog: Arc<MemoryOplog>,
        router: NamespaceRouter,
        batch_size: BatchSize,
        resume: Position,
        read_limit: usize,
        queues: Vec<(&str, mpsc::Sender<Arc<Batch>>)>,
    ) -> (Harness, Vec<Arc<AtomicUsize>>) {
        let dir = TempDir::new().unwrap();
        let ids: Vec<String> = queues.iter().map(|(id, _)| id.to_string()).collect();
        let checkpoint = Arc::new(
            CheckpointStore::open(dir.path().join("oplog.timestamp"), &ids)
                .await
                .unwrap(),
        );
        let (_, rx) = mpsc::channel(1);
        let (state_tx, state_rx) = watch::channel(TailerState::Starting);
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let depths: Vec<Arc<AtomicUsize>> = queues.iter().map(|_| Arc::new(AtomicUsize::new(0))).collect();
        let targets = queues
            .into_iter()
            .zip(&depths)
            .map(|((id, tx), depth)| TargetQueue::new(id.to_string(), tx, depth.clone()))
            .collect();

        let tailer = Tailer::new(
            oplog.clone(),
            router,
            FieldProjection::pass_through(),
            Batcher::new(batch_size, Duration::from_millis(20), Duration::from_millis(200))
                .with_resume_point(resume),
            targets,
            checkpoint,
            TailerSettings {
                read_limit,
                read_timeout: Duration::from_millis(20),
                idle_timeout: Duration::from_millis(20),
                reconnect: RetryConfig::testing(),
            },
            state_tx,
            failures_tx,
            shutdown_rx,
            resume,
        );
        let handle = tokio::spawn(tailer.run());

        let harness = Harness {
            _dir: dir,
            oplog,
            rx,
            state_rx,
            failures_rx,
            shutdown_tx,
            handle,
        };
        (harness, depths)
    }

    async fn recv(rx: &mut mpsc::Receiver<Arc<Batch>>) -> Arc<Batch> {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for a batch")
            .expect("queue closed")
    }

    #[test]
    fn test_history_gap_rule() {
        assert!(check_history_gap(Position::ZERO, Some(Position::new(9, 0))).is_ok());
        assert!(check_history_gap(Position::new(5, 0), None).is_ok());
        assert!(check_history_gap(Position::new(5, 0), Some(Position::new(5, 0))).is_ok());
        assert!(matches!(
            check_history_gap(Position::new(5, 0), Some(Position::new(6, 0))),
            Err(ConnectorError::HistoryGap { .. })
        ));
    }

    #[tokio::test]
    async fn test_batches_by_size() {
        let oplog = Arc::new(MemoryOplog::new("memory://test"));
        for i in 1..=5 {
            oplog.insert("db.a", json!({"_id": i}));
        }
        let mut h = start(
            oplog,
            NamespaceRouter::pass_through(),
            BatchSize::bounded(2).unwrap(),
            Position::ZERO,
        )
        .await;

        let sizes = vec![
            recv(&mut h.rx).await.len(),
            recv(&mut h.rx).await.len(),
            recv(&mut h.rx).await.len(),
        ];
        assert_eq!(sizes, vec![2, 2, 1]);

        h.shutdown_tx.send(true).unwrap();
        h.handle.await.unwrap();
        assert_eq!(*h.state_rx.borrow(), TailerState::Stopped);
        assert!(h.rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_filtered_events_still_acknowledged() {
        let oplog = Arc::new(MemoryOplog::new("memory://test"));
        oplog.insert("db.keep", json!({"_id": 1}));
        oplog.insert("db.skip", json!({"_id": 2}));
        oplog.insert("db.skip", json!({"_id": 3}));

        let router = NamespaceRouter::new(&NamespaceConfig {
            include: vec!["db.keep".into()],
            ..Default::default()
        })
        .unwrap();
        let mut h = start(oplog, router, BatchSize::Unbounded, Position::ZERO).await;

        let batch = recv(&mut h.rx).await;
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.final_ack(), Some(Position::new(3, 0)));

        h.shutdown_tx.send(true).unwrap();
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_history_gap_fails_tailer() {
        let oplog = Arc::new(MemoryOplog::new("memory://test"));
        for i in 1..=5 {
            oplog.insert("db.a", json!({"_id": i}));
        }
        oplog.trim_before(Position::new(4, 0));

        let mut h = start(
            oplog,
            NamespaceRouter::pass_through(),
            BatchSize::Unbounded,
            Position::new(2, 0),
        )
        .await;
        h.handle.await.unwrap();

        assert_eq!(*h.state_rx.borrow(), TailerState::Error);
        assert!(matches!(
            h.failures_rx.recv().await,
            Some(ConnectorError::HistoryGap { .. })
        ));
        assert!(h.rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_reconnect_resumes_without_duplicates() {
        let oplog = Arc::new(MemoryOplog::new("memory://test"));
        oplog.insert("db.a", json!({"_id": 1}));
        let mut h = start(
            oplog,
            NamespaceRouter::pass_through(),
            BatchSize::bounded(1).unwrap(),
            Position::ZERO,
        )
        .await;
        assert_eq!(recv(&mut h.rx).await.last_position(), Some(Position::new(1, 0)));

        h.oplog.fail_next_reads(2);
        h.oplog.insert("db.a", json!({"_id": 2}));
        h.oplog.insert("db.a", json!({"_id": 3}));

        assert_eq!(recv(&mut h.rx).await.last_position(), Some(Position::new(2, 0)));
        assert_eq!(recv(&mut h.rx).await.last_position(), Some(Position::new(3, 0)));

        h.shutdown_tx.send(true).unwrap();
        h.handle.await.unwrap();
        assert!(h.rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_full_queue_does_not_hold_back_other_targets() {
        let oplog = Arc::new(MemoryOplog::new("memory://test"));
        for i in 1..=10 {
            oplog.insert("db.a", json!({"_id": i}));
        }
        let (stuck_tx, mut stuck_rx) = mpsc::channel(1);
        let (live_tx, mut live_rx) = mpsc::channel(1);
        let (h, depths) = spawn(
            oplog,
            NamespaceRouter::pass_through(),
            BatchSize::bounded(1).unwrap(),
            Position::ZERO,
            100,
            vec![("stuck", stuck_tx), ("live", live_tx)],
        )
        .await;

        for i in 1..=10 {
            assert_eq!(recv(&mut live_rx).await.last_position(), Some(Position::new(i, 0)));
        }
        // Everything past the first batch waits in the stuck target's backlog.
        assert_eq!(depths[0].load(Ordering::Acquire), 10);

        h.shutdown_tx.send(true).unwrap();
        for i in 1..=10 {
            assert_eq!(recv(&mut stuck_rx).await.last_position(), Some(Position::new(i, 0)));
        }
        h.handle.await.unwrap();
        assert!(stuck_rx.recv().await.is_none());
        assert!(live_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_closed_queue_drops_its_backlog() {
        let oplog = Arc::new(MemoryOplog::new("memory://test"));
        for i in 1..=5 {
            oplog.insert("db.a", json!({"_id": i}));
        }
        let (gone_tx, gone_rx) = mpsc::channel(1);
        let (live_tx, mut live_rx) = mpsc::channel(1);
        let (h, depths) = spawn(
            oplog.clone(),
            NamespaceRouter::pass_through(),
            BatchSize::bounded(1).unwrap(),
            Position::ZERO,
            100,
            vec![("gone", gone_tx), ("live", live_tx)],
        )
        .await;

        for i in 1..=5 {
            assert_eq!(recv(&mut live_rx).await.last_position(), Some(Position::new(i, 0)));
        }
        drop(gone_rx);
        oplog.insert("db.a", json!({"_id": 6}));
        assert_eq!(recv(&mut live_rx).await.last_position(), Some(Position::new(6, 0)));
        // Only the batch left in the dropped queue is still counted.
        assert_eq!(depths[0].load(Ordering::Acquire), 1);

        h.shutdown_tx.send(true).unwrap();
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_history_trimmed_while_lagging_fails_tailer() {
        let oplog = Arc::new(MemoryOplog::new("memory://test"));
        for i in 1..=10 {
            oplog.insert("db.a", json!({"_id": i}));
        }
        let (tx, mut rx) = mpsc::channel(1);
        let (mut h, _) = spawn(
            oplog.clone(),
            NamespaceRouter::pass_through(),
            BatchSize::bounded(1).unwrap(),
            Position::ZERO,
            2,
            vec![("t", tx)],
        )
        .await;

        // The first read fills the queue and the backlog; reading is suspended.
        tokio::time::sleep(Duration::from_millis(100)).await;
        oplog.trim_before(Position::new(8, 0));

        let mut delivered = Vec::new();
        while let Some(batch) = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap() {
            delivered.extend(batch.entries.iter().map(|e| e.event.position().ts));
        }
        h.handle.await.unwrap();

        assert_eq!(delivered, vec![1, 2]);
        assert_eq!(*h.state_rx.borrow(), TailerState::Error);
        match h.failures_rx.recv().await {
            Some(ConnectorError::HistoryGap { resume, oldest }) => {
                assert_eq!(resume, Position::new(2, 0));
                assert_eq!(oldest, Position::new(8, 0));
            }
            other => panic!("expected history gap, got {:?}", other),
        }
    }
}
