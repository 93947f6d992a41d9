// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-target apply worker.
//!
//! Each target has one worker task that drains a bounded queue of batches
//! and applies them through the target's document manager:
//!
//! 1. Format every entry for the target and split the batch into
//!    `bulkSize` chunks
//! 2. `bulk_apply` each chunk; on failure, account for the applied prefix
//!    and ask the [`ErrorPolicy`] what to do with the failed write
//! 3. Commit when `autoCommitInterval` requires it
//! 4. Advance the target's checkpoint to the last acknowledged position
//!
//! Acks are held while the target has uncommitted writes. The checkpoint
//! only moves once a commit made everything up to the ack durable, so with
//! `autoCommitInterval` unset it advances at shutdown.
//!
//! A skipped large-object chunk also skips the metadata document released
//! for it, so the target never exposes a file with missing chunks.
//!
//! # Graceful Shutdown
//!
//! The worker keeps draining until the tailer closes the queue. The shutdown
//! signal only interrupts retry and block back-offs; whatever was not applied
//! then is re-read from the checkpoint on the next start.

use crate::batch::{Batch, RoutedEvent};
use crate::checkpoint::CheckpointStore;
use crate::config::{AutoCommit, TargetConfig};
use crate::doc_manager::{BulkApplyError, DocManager, WriteOp};
use crate::error::ConnectorError;
use crate::metrics;
use crate::namespace::NamespaceKind;
use crate::oplog::{id_string, Position};
use crate::policy::{ErrorPolicy, FailureAction};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Why a worker stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// The queue was closed and everything in it applied.
    Drained,
    /// A fatal error; reported on the failure channel.
    Halted,
    /// Shutdown arrived while backing off.
    Interrupted,
}

/// `(base, files_id)` of one large object.
type LargeObjectKey = (String, String);

/// Role of a write in a large object.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LargeObjectPart {
    Chunk(LargeObjectKey),
    Metadata(LargeObjectKey),
}

impl LargeObjectPart {
    fn of(event: &RoutedEvent) -> Option<Self> {
        match &event.kind {
            NamespaceKind::Normal => None,
            NamespaceKind::LargeObjectChunks { base } => {
                let files_id = event.event.payload.document()?.get("files_id")?;
                Some(Self::Chunk((base.clone(), id_string(files_id))))
            }
            NamespaceKind::LargeObjectFiles { base } => Some(Self::Metadata((base.clone(), event.event.id_string()))),
        }
    }
}

/// A write waiting for the next bulk call.
struct PendingWrite {
    op: WriteOp,
    ack: Option<Position>,
    part: Option<LargeObjectPart>,
}

/// Everything a worker needs, assembled by the connector.
pub(crate) struct TargetWorker {
    target: Arc<TargetConfig>,
    manager: Arc<dyn DocManager>,
    checkpoint: Arc<CheckpointStore>,
    policy: ErrorPolicy,
    queue: mpsc::Receiver<Arc<Batch>>,
    queued: Arc<AtomicUsize>,
    failures: mpsc::UnboundedSender<ConnectorError>,
    shutdown_rx: watch::Receiver<bool>,

    /// Entries at or before this position were applied before a restart.
    applied_through: Option<Position>,
    /// Checkpoint position last written for this target.
    last_ack: Option<Position>,
    /// Highest ack reached but not yet written to the checkpoint.
    pending_ack: Option<Position>,
    uncommitted: bool,
    last_commit: Instant,
    /// Large objects with a skipped chunk; their metadata is skipped too.
    incomplete: HashSet<LargeObjectKey>,
}

impl TargetWorker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn new(
        target: Arc<TargetConfig>,
        manager: Arc<dyn DocManager>,
        checkpoint: Arc<CheckpointStore>,
        policy: ErrorPolicy,
        queue: mpsc::Receiver<Arc<Batch>>,
        queued: Arc<AtomicUsize>,
        failures: mpsc::UnboundedSender<ConnectorError>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let position = checkpoint.position(&target.id).await;
        Self {
            target,
            manager,
            checkpoint,
            policy,
            queue,
            queued,
            failures,
            shutdown_rx,
            applied_through: position.filter(|p| !p.is_zero()),
            last_ack: position,
            pending_ack: None,
            uncommitted: false,
            last_commit: Instant::now(),
            incomplete: HashSet::new(),
        }
    }

    /// Run until the queue closes or a fatal error.
    pub(crate) async fn run(mut self) -> WorkerExit {
        let span = info_span!("target_worker", target_id = %self.target.id);

        async move {
            info!(
                applied_through = ?self.applied_through,
                bulk_size = self.target.bulk_size,
                "Starting target worker"
            );

            let mut commit_timer = match self.target.auto_commit {
                AutoCommit::Every(interval) => {
                    let mut timer = tokio::time::interval(interval);
                    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    Some(timer)
                }
                _ => None,
            };

            let exit = loop {
                let batch = tokio::select! {
                    batch = self.queue.recv() => batch,
                    _ = tick(&mut commit_timer) => {
                        if self.uncommitted {
                            self.commit().await;
                        }
                        continue;
                    }
                };

                let Some(batch) = batch else {
                    break WorkerExit::Drained;
                };
                let depth = self
                    .queued
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
                    .map_or(0, |n| n.saturating_sub(1));
                metrics::set_queue_depth(&self.target.id, depth);

                if let Err(exit) = self.apply_batch(&batch).await {
                    break exit;
                }
            };

            // Whatever was applied is committed and acknowledged, even on halt.
            if self.uncommitted || !matches!(self.target.auto_commit, AutoCommit::EveryBatch) {
                self.commit().await;
            }
            if self.uncommitted {
                warn!(
                    pending_ack = ?self.pending_ack,
                    "Final commit failed, uncommitted writes will be applied again on restart"
                );
            } else {
                self.settle().await;
            }

            match exit {
                WorkerExit::Drained => info!(last_ack = ?self.last_ack, "Target worker drained"),
                WorkerExit::Interrupted => {
                    info!(last_ack = ?self.last_ack, "Target worker interrupted by shutdown")
                }
                WorkerExit::Halted => error!(last_ack = ?self.last_ack, "Target worker halted"),
            }
            exit
        }
        .instrument(span)
        .await
    }

    async fn apply_batch(&mut self, batch: &Batch) -> Result<(), WorkerExit> {
        let started = std::time::Instant::now();
        self.note_ack(batch.leading_ack);

        let mut chunk: Vec<PendingWrite> = Vec::with_capacity(self.target.bulk_size);
        let mut applied = 0;

        for entry in &batch.entries {
            let position = entry.event.position();
            let part = LargeObjectPart::of(&entry.event);
            let op = if self.applied_through.is_some_and(|done| position <= done) {
                None
            } else if part.as_ref().is_some_and(|p| self.is_incomplete(p)) {
                self.skip_incomplete(&entry.event.event.namespace, position);
                None
            } else {
                WriteOp::from_event(&entry.event.event, self.target.formatter, &self.target.unique_key)
            };

            match op {
                Some(op) => {
                    chunk.push(PendingWrite { op, ack: entry.ack, part });
                    if chunk.len() >= self.target.bulk_size {
                        applied += self.apply_chunk(std::mem::take(&mut chunk)).await?;
                    }
                }
                None if chunk.is_empty() => self.note_ack(entry.ack),
                None => {
                    if let (Some(last), Some(ack)) = (chunk.last_mut(), entry.ack) {
                        last.ack = Some(ack);
                    }
                }
            }
        }
        if !chunk.is_empty() {
            applied += self.apply_chunk(chunk).await?;
        }

        if applied > 0 {
            self.uncommitted = true;
        }
        match self.target.auto_commit {
            AutoCommit::EveryBatch if self.uncommitted => self.commit().await,
            AutoCommit::Every(interval) if self.uncommitted && self.last_commit.elapsed() >= interval => {
                self.commit().await
            }
            _ => {}
        }
        if !self.uncommitted {
            self.settle().await;
        }

        metrics::record_batch_applied(&self.target.id, applied, started.elapsed());
        debug!(
            batch_seq = batch.seq,
            entries = batch.len(),
            applied,
            ack = ?self.last_ack,
            "Applied batch"
        );
        Ok(())
    }

    /// Apply one chunk, following the error policy. Returns the number of
    /// writes that took effect.
    async fn apply_chunk(&mut self, mut remaining: Vec<PendingWrite>) -> Result<usize, WorkerExit> {
        let mut applied_total = 0;
        let mut attempt = 0;

        while !remaining.is_empty() {
            let writes: Vec<WriteOp> = remaining.iter().map(|w| w.op.clone()).collect();
            let BulkApplyError { applied, error } = match self.manager.bulk_apply(writes).await {
                Ok(()) => {
                    applied_total += remaining.len();
                    let ack = remaining.iter().rev().find_map(|w| w.ack);
                    self.note_ack(ack);
                    break;
                }
                Err(e) => e,
            };

            let applied = applied.min(remaining.len().saturating_sub(1));
            if applied > 0 {
                let ack = remaining.drain(..applied).rev().find_map(|w| w.ack);
                self.note_ack(ack);
                applied_total += applied;
                attempt = 0;
            }
            attempt += 1;

            let failed = &remaining[0].op;
            let action = self.policy.decide(&error, attempt);
            match action {
                FailureAction::Retry(delay) | FailureAction::Block(delay) => {
                    warn!(
                        namespace = %failed.namespace,
                        position = %failed.position,
                        id = %crate::oplog::id_string(&failed.id),
                        error = %error,
                        attempt,
                        action = action.as_str(),
                        delay_ms = delay.as_millis() as u64,
                        "Write failed, retrying"
                    );
                    metrics::record_apply_retry(&self.target.id, error.kind.as_str());
                    if !self.backoff(delay).await {
                        self.uncommitted |= applied_total > 0;
                        return Err(WorkerExit::Interrupted);
                    }
                }
                FailureAction::Skip => {
                    warn!(
                        namespace = %failed.namespace,
                        position = %failed.position,
                        id = %crate::oplog::id_string(&failed.id),
                        op = failed.kind.name(),
                        error = %error,
                        "Skipping write rejected by target"
                    );
                    metrics::record_event_skipped(&self.target.id, error.kind.as_str());
                    let skipped = remaining.remove(0);
                    self.note_ack(skipped.ack);
                    if let Some(LargeObjectPart::Chunk(key)) = skipped.part {
                        self.incomplete.insert(key);
                        self.drop_incomplete(&mut remaining);
                    }
                    attempt = 0;
                }
                FailureAction::Halt => {
                    error!(
                        namespace = %failed.namespace,
                        position = %failed.position,
                        id = %crate::oplog::id_string(&failed.id),
                        op = failed.kind.name(),
                        error = %error,
                        "Write failed, halting"
                    );
                    metrics::record_apply_halt(&self.target.id, error.kind.as_str());
                    let failure =
                        error.into_connector_error(&self.target.id, &failed.namespace, failed.position);
                    let _ = self.failures.send(failure);
                    self.uncommitted |= applied_total > 0;
                    return Err(WorkerExit::Halted);
                }
            }
        }
        Ok(applied_total)
    }

    fn is_incomplete(&self, part: &LargeObjectPart) -> bool {
        matches!(part, LargeObjectPart::Metadata(key) if self.incomplete.contains(key))
    }

    fn skip_incomplete(&self, namespace: &str, position: Position) {
        warn!(
            namespace = %namespace,
            position = %position,
            "Skipping large-object metadata, one of its chunks was skipped"
        );
        metrics::record_event_skipped(&self.target.id, "incomplete_large_object");
    }

    /// Remove queued metadata writes of incomplete large objects, handing
    /// their acks to the write before them.
    fn drop_incomplete(&mut self, remaining: &mut Vec<PendingWrite>) {
        let mut i = 0;
        while i < remaining.len() {
            if !remaining[i].part.as_ref().is_some_and(|p| self.is_incomplete(p)) {
                i += 1;
                continue;
            }
            let dropped = remaining.remove(i);
            self.skip_incomplete(&dropped.op.namespace, dropped.op.position);
            match (i.checked_sub(1), dropped.ack) {
                (Some(prev), Some(ack)) => remaining[prev].ack = Some(ack),
                (None, ack) => self.note_ack(ack),
                (Some(_), None) => {}
            }
        }
    }

    /// Sleep, unless shutdown arrives first. Returns `false` on shutdown.
    async fn backoff(&mut self, delay: Duration) -> bool {
        if *self.shutdown_rx.borrow() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.shutdown_rx.changed() => !*self.shutdown_rx.borrow(),
        }
    }

    fn note_ack(&mut self, ack: Option<Position>) {
        if let Some(ack) = ack {
            if self.pending_ack.map_or(true, |p| ack > p) {
                self.pending_ack = Some(ack);
            }
        }
    }

    /// Write the pending ack to the checkpoint.
    async fn settle(&mut self) {
        let Some(ack) = self.pending_ack.take() else {
            return;
        };
        if self.last_ack.is_some_and(|last| ack <= last) {
            return;
        }
        match self.checkpoint.advance(&self.target.id, ack).await {
            Ok(()) => self.last_ack = Some(ack),
            Err(e) => error!(position = %ack, error = %e, "Failed to advance checkpoint"),
        }
    }

    async fn commit(&mut self) {
        match self.manager.commit().await {
            Ok(()) => {
                metrics::record_commit(&self.target.id, true);
                self.uncommitted = false;
                self.last_commit = Instant::now();
                debug!("Committed target");
                self.settle().await;
            }
            Err(e) => {
                metrics::record_commit(&self.target.id, false);
                warn!(error = %e, "Commit failed, will retry at the next commit point");
            }
        }
    }
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}
