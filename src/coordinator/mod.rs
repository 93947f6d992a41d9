// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Connector coordinator.
//!
//! The main orchestrator that ties together:
//! - The source via [`crate::oplog::OplogSource`]
//! - Checkpoint persistence via [`crate::checkpoint::CheckpointStore`]
//! - The initial import via [`crate::initial_sync::InitialSync`]
//! - One tailer and one worker per target
//!
//! # Architecture
//!
//! ```text
//!                        ┌──────────┐  queue  ┌──────────┐
//!                   ┌───►│ worker A │◄────────┤          │
//! OplogSource ──► tailer │          │         │ checkpoint│
//!                   └───►│ worker B │◄────────┤          │
//!                        └──────────┘         └──────────┘
//! ```
//!
//! 1. Opens the checkpoint (or runs the initial import when there is none)
//! 2. Checks the source still has history back to the resume point
//! 3. Spawns a worker per target, the tailer, a checkpoint flush task and a
//!    failure monitor
//! 4. On shutdown, lets the tailer flush, the workers drain, and persists
//!    the checkpoint
//!
//! The first fatal error (history gap, halt, authentication) triggers the
//! same shutdown and is returned from [`Connector::run`].

mod tailer;
mod types;
mod worker;

pub use types::{ConnectorState, HealthCheck, TailerState, TargetHealth};
pub use worker::WorkerExit;

use crate::batch::Batcher;
use crate::checkpoint::CheckpointStore;
use crate::config::{ConnectorConfig, TargetConfig, ValidatedConfig};
use crate::doc_manager::DocManager;
use crate::doc_managers;
use crate::error::{ConnectorError, Result};
use crate::initial_sync::{InitialSync, SyncReport, SyncTarget};
use crate::metrics;
use crate::namespace::{NamespaceRouter, Route};
use crate::oplog::{OplogSource, Position};
use crate::policy::ErrorPolicy;
use crate::projection::FieldProjection;
use crate::query::Query;
use crate::resilience::RetryConfig;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tailer::{check_history_gap, Tailer, TailerSettings, TargetQueue};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use worker::TargetWorker;

/// How long shutdown waits for each task to finish.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Triggers a graceful shutdown from another task (e.g. a signal handler).
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Result of the startup phase.
struct Prepared {
    resume: Position,
    router: NamespaceRouter,
    projection: FieldProjection,
}

struct Target {
    config: Arc<TargetConfig>,
    manager: Arc<dyn DocManager>,
    queued: Arc<AtomicUsize>,
}

/// The connector: one source, any number of targets.
pub struct Connector {
    config: Arc<ValidatedConfig>,
    source: Arc<dyn OplogSource>,
    targets: Vec<Target>,

    state_tx: watch::Sender<ConnectorState>,
    state_rx: watch::Receiver<ConnectorState>,
    tailer_state_tx: Option<watch::Sender<TailerState>>,
    tailer_state_rx: watch::Receiver<TailerState>,

    checkpoint: Option<Arc<CheckpointStore>>,

    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,

    /// First fatal error reported by a task.
    failure: Arc<Mutex<Option<ConnectorError>>>,

    startup_retry: RetryConfig,
    reconnect_retry: RetryConfig,

    tailer_handle: Option<JoinHandle<()>>,
    worker_handles: Vec<(String, JoinHandle<WorkerExit>)>,
    monitor_handle: Option<JoinHandle<()>>,
    flush_handle: Option<JoinHandle<()>>,
}

impl Connector {
    /// Validate the configuration and build every configured adapter.
    pub async fn new(config: ConnectorConfig, source: Arc<dyn OplogSource>) -> Result<Self> {
        let config = config.validate()?;
        let mut managers = Vec::with_capacity(config.targets.len());
        for target in &config.targets {
            managers.push(doc_managers::build(target).await?);
        }
        Ok(Self::assemble(config, source, managers))
    }

    /// Use pre-built adapters, one per configured target, in order.
    pub fn with_doc_managers(
        config: ConnectorConfig,
        source: Arc<dyn OplogSource>,
        managers: Vec<Arc<dyn DocManager>>,
    ) -> Result<Self> {
        let config = config.validate()?;
        if managers.len() != config.targets.len() {
            return Err(ConnectorError::config(
                "docManagers",
                format!(
                    "{} targets configured but {} adapters supplied",
                    config.targets.len(),
                    managers.len()
                ),
            ));
        }
        Ok(Self::assemble(config, source, managers))
    }

    fn assemble(
        config: ValidatedConfig,
        source: Arc<dyn OplogSource>,
        managers: Vec<Arc<dyn DocManager>>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectorState::Created);
        let (tailer_state_tx, tailer_state_rx) = watch::channel(TailerState::Starting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let targets = config
            .targets
            .iter()
            .cloned()
            .zip(managers)
            .map(|(config, manager)| Target {
                config,
                manager,
                queued: Arc::new(AtomicUsize::new(0)),
            })
            .collect();

        Self {
            config: Arc::new(config),
            source,
            targets,
            state_tx,
            state_rx,
            tailer_state_tx: Some(tailer_state_tx),
            tailer_state_rx,
            checkpoint: None,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
            failure: Arc::new(Mutex::new(None)),
            startup_retry: RetryConfig::startup(),
            reconnect_retry: RetryConfig::daemon(),
            tailer_handle: None,
            worker_handles: Vec::new(),
            monitor_handle: None,
            flush_handle: None,
        }
    }

    /// Override the source retry schedules (startup probe, reconnect).
    pub fn with_retry(mut self, startup: RetryConfig, reconnect: RetryConfig) -> Self {
        self.startup_retry = startup;
        self.reconnect_retry = reconnect;
        self
    }

    pub fn config(&self) -> &ValidatedConfig {
        &self.config
    }

    /// Get current connector state.
    pub fn state(&self) -> ConnectorState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<ConnectorState> {
        self.state_rx.clone()
    }

    pub fn tailer_state(&self) -> TailerState {
        *self.tailer_state_rx.borrow()
    }

    pub fn tailer_state_receiver(&self) -> watch::Receiver<TailerState> {
        self.tailer_state_rx.clone()
    }

    /// The checkpoint store, once started.
    pub fn checkpoint(&self) -> Option<&Arc<CheckpointStore>> {
        self.checkpoint.as_ref()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    /// Health snapshot for monitoring endpoints.
    ///
    /// Performs no I/O: everything comes from watch channels, counters and
    /// the in-memory checkpoint.
    pub async fn health(&self) -> HealthCheck {
        let state = self.state();
        let tailer_state = self.tailer_state();

        let mut targets = Vec::with_capacity(self.targets.len());
        for target in &self.targets {
            let position = match &self.checkpoint {
                Some(checkpoint) => checkpoint.position(&target.config.id).await,
                None => None,
            };
            targets.push(TargetHealth {
                target_id: target.config.id.clone(),
                position,
                queued_batches: target.queued.load(Ordering::Acquire),
            });
        }

        let resume_point = match &self.checkpoint {
            Some(checkpoint) => checkpoint.resume_point().await,
            None => Position::ZERO,
        };

        HealthCheck {
            state,
            tailer_state,
            ready: state == ConnectorState::Running
                && matches!(tailer_state, TailerState::Tailing | TailerState::CatchingUp),
            resume_point,
            targets,
        }
    }

    fn set_state(&self, state: ConnectorState) {
        let _ = self.state_tx.send(state);
        metrics::set_connector_state(&state.to_string());
    }

    /// Start replication.
    ///
    /// 1. Opens the checkpoint file
    /// 2. Waits for the source (startup retry schedule)
    /// 3. Runs the initial import if there is no checkpoint or `dump` is set
    /// 4. Checks for a history gap
    /// 5. Spawns the workers, the tailer and the background tasks
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != ConnectorState::Created {
            return Err(ConnectorError::InvalidState {
                expected: "Created".to_string(),
                actual: format!("{:?}", self.state()),
            });
        }

        info!(
            source = %self.source.name(),
            targets = self.targets.len(),
            checkpoint = %self.config.oplog_file,
            "Starting connector"
        );

        match self.prepare().await {
            Ok(prepared) => {
                let resume = prepared.resume;
                self.spawn_tasks(prepared).await;
                self.set_state(ConnectorState::Running);
                info!(resume_point = %resume, "Connector running");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Connector failed to start");
                self.set_state(ConnectorState::Failed);
                // Without a file the next start runs the import again.
                if let Some(checkpoint) = self.checkpoint.as_ref().filter(|c| c.was_loaded()) {
                    checkpoint.close().await;
                }
                Err(e)
            }
        }
    }

    /// Everything before the tasks run.
    async fn prepare(&mut self) -> Result<Prepared> {
        let ids: Vec<String> = self.targets.iter().map(|t| t.config.id.clone()).collect();
        let checkpoint = Arc::new(CheckpointStore::open(&self.config.oplog_file, &ids).await?);
        self.checkpoint = Some(Arc::clone(&checkpoint));

        self.wait_for_source().await?;

        let router = NamespaceRouter::new(&self.config.namespaces)?;
        let projection = FieldProjection::from_config(&self.config.fields)?;
        if checkpoint.was_loaded() {
            self.cross_check_targets(&router, &checkpoint).await;
        }

        if !checkpoint.was_loaded() || self.config.initial_import.dump {
            self.set_state(ConnectorState::InitialSync);
            let report = self.initial_sync(router.clone(), projection.clone()).await?;
            checkpoint.reset(report.start).await?;
        }

        let resume = checkpoint.resume_point().await;
        let oldest = self.source.oldest_position().await?;
        check_history_gap(resume, oldest)?;
        Ok(Prepared {
            resume,
            router,
            projection,
        })
    }

    /// Probe the source until it answers or the startup schedule runs out.
    async fn wait_for_source(&self) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.source.latest_position().await {
                Ok(latest) => {
                    debug!(latest = ?latest, "Source reachable");
                    return Ok(());
                }
                Err(e) if e.is_retryable() && self.startup_retry.should_retry(attempt) => {
                    let delay = self.startup_retry.delay_for_attempt(attempt);
                    warn!(attempt, delay = ?delay, error = %e, "Source unavailable at startup, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Compare what each target reports as applied with the checkpoint.
    ///
    /// A target ahead of the checkpoint re-applies the difference (all
    /// writes are idempotent); the comparison is only logged.
    async fn cross_check_targets(&self, router: &NamespaceRouter, checkpoint: &CheckpointStore) {
        let namespaces = match self.source.namespaces().await {
            Ok(namespaces) => namespaces,
            Err(e) => {
                debug!(error = %e, "Skipping target cross-check");
                return;
            }
        };

        for target in &self.targets {
            let Some(acked) = checkpoint.position(&target.config.id).await else {
                continue;
            };
            for namespace in &namespaces {
                let Route::Target { namespace: mapped, .. } = router.route(namespace) else {
                    continue;
                };
                match target.manager.last_applied_position(&mapped).await {
                    Ok(Some(applied)) if applied > acked => info!(
                        target_id = %target.config.id,
                        namespace = %mapped,
                        applied = %applied,
                        checkpoint = %acked,
                        "Target is ahead of the checkpoint, entries will be re-applied"
                    ),
                    Ok(_) => {}
                    Err(e) => debug!(
                        target_id = %target.config.id,
                        error = %e,
                        "Target cannot report its last applied position"
                    ),
                }
            }
        }
    }

    async fn initial_sync(
        &self,
        router: NamespaceRouter,
        projection: FieldProjection,
    ) -> Result<SyncReport> {
        let query = match &self.config.initial_import.query {
            Some(query) => Query::parse(query)?,
            None => Query::all(),
        };
        let sync = InitialSync::new(
            Arc::clone(&self.source),
            router,
            projection,
            query,
            self.shutdown_rx.clone(),
        );
        let targets: Vec<SyncTarget> = self
            .targets
            .iter()
            .map(|t| SyncTarget {
                target: t.config.clone(),
                manager: Arc::clone(&t.manager),
                policy: ErrorPolicy::for_target(&t.config, &self.config),
            })
            .collect();
        sync.run(&targets).await
    }

    async fn spawn_tasks(&mut self, prepared: Prepared) {
        let Prepared {
            resume,
            router,
            projection,
        } = prepared;
        let Some(checkpoint) = self.checkpoint.clone() else {
            return;
        };
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();

        // Workers first so the queues have consumers.
        let mut queues = Vec::with_capacity(self.targets.len());
        for target in &self.targets {
            let (tx, rx) = mpsc::channel(self.config.max_queued_batches);
            let worker = TargetWorker::new(
                target.config.clone(),
                Arc::clone(&target.manager),
                Arc::clone(&checkpoint),
                ErrorPolicy::for_target(&target.config, &self.config),
                rx,
                Arc::clone(&target.queued),
                failures_tx.clone(),
                self.shutdown_rx.clone(),
            )
            .await;
            let handle = tokio::spawn(worker.run());
            info!(target_id = %target.config.id, kind = %target.config.kind, "Spawned target worker");
            self.worker_handles.push((target.config.id.clone(), handle));
            queues.push(TargetQueue::new(
                target.config.id.clone(),
                tx,
                Arc::clone(&target.queued),
            ));
        }

        if let Some(state_tx) = self.tailer_state_tx.take() {
            let tailer = Tailer::new(
                Arc::clone(&self.source),
                router,
                projection,
                Batcher::new(
                    self.config.batch_size,
                    self.config.batch_idle_timeout,
                    self.config.large_object_wait,
                )
                .with_resume_point(resume),
                queues,
                Arc::clone(&checkpoint),
                TailerSettings {
                    read_limit: self.config.read_limit,
                    read_timeout: self.config.read_timeout,
                    idle_timeout: self.config.batch_idle_timeout,
                    reconnect: self.reconnect_retry.clone(),
                },
                state_tx,
                failures_tx,
                self.shutdown_rx.clone(),
                resume,
            );
            self.tailer_handle = Some(tokio::spawn(tailer.run()));
            info!("Spawned oplog tailer");
        }

        self.spawn_failure_monitor(failures_rx);
        self.spawn_checkpoint_flush_task(checkpoint);
    }

    /// Record the first fatal error and trigger shutdown.
    ///
    /// Ends once every task holding a sender has exited.
    fn spawn_failure_monitor(&mut self, mut failures_rx: mpsc::UnboundedReceiver<ConnectorError>) {
        let failure = Arc::clone(&self.failure);
        let shutdown_tx = Arc::clone(&self.shutdown_tx);

        self.monitor_handle = Some(tokio::spawn(async move {
            while let Some(e) = failures_rx.recv().await {
                let mut slot = failure.lock().await;
                if slot.is_none() {
                    error!(error = %e, "Fatal error, stopping connector");
                    *slot = Some(e);
                    let _ = shutdown_tx.send(true);
                } else {
                    warn!(error = %e, "Further error while stopping");
                }
            }
            debug!("Failure monitor stopped");
        }));
    }

    /// Periodically write acknowledged positions to the checkpoint file.
    fn spawn_checkpoint_flush_task(&mut self, checkpoint: Arc<CheckpointStore>) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        let interval = self.config.checkpoint_interval;

        self.flush_handle = Some(tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        if let Err(e) = checkpoint.flush().await {
                            warn!(error = %e, "Failed to flush checkpoint");
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            debug!("Checkpoint flush task stopping");
                            break;
                        }
                    }
                }
            }
        }));
        debug!(interval = ?interval, "Spawned checkpoint flush task");
    }

    /// Start if needed, run until shutdown is triggered (by the handle or a
    /// fatal error), then stop. Returns the fatal error, if any.
    pub async fn run(&mut self) -> Result<()> {
        if self.state() == ConnectorState::Created {
            self.start().await?;
        }

        let mut shutdown_rx = self.shutdown_rx.clone();
        while !*shutdown_rx.borrow() {
            if shutdown_rx.changed().await.is_err() {
                break;
            }
        }

        self.shutdown().await;
        match self.failure.lock().await.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Shut down gracefully.
    ///
    /// 1. Signal every task to stop
    /// 2. The tailer flushes its open batch and closes the queues
    /// 3. Workers drain their queues and commit
    /// 4. Adapters are stopped and the checkpoint is persisted
    pub async fn shutdown(&mut self) {
        if matches!(self.state(), ConnectorState::Stopped | ConnectorState::Failed)
            && self.tailer_handle.is_none()
        {
            return;
        }

        info!("Shutting down connector");
        self.set_state(ConnectorState::Stopping);
        let _ = self.shutdown_tx.send(true);

        if let Some(handle) = self.tailer_handle.take() {
            match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
                Ok(Ok(())) => debug!("Tailer completed"),
                Ok(Err(e)) => warn!(error = %e, "Tailer panicked during shutdown"),
                Err(_) => warn!("Tailer timed out during shutdown"),
            }
        }

        let workers = std::mem::take(&mut self.worker_handles);
        if !workers.is_empty() {
            info!(workers = workers.len(), "Waiting for target workers to drain");
        }
        for (target_id, handle) in workers {
            match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
                Ok(Ok(exit)) => debug!(target_id = %target_id, exit = ?exit, "Target worker completed"),
                Ok(Err(e)) => warn!(target_id = %target_id, error = %e, "Target worker panicked during shutdown"),
                Err(_) => warn!(target_id = %target_id, "Target worker timed out during shutdown (queued batches will be re-read)"),
            }
        }

        if let Some(handle) = self.monitor_handle.take() {
            let _ = tokio::time::timeout(DRAIN_TIMEOUT, handle).await;
        }
        if let Some(handle) = self.flush_handle.take() {
            let _ = handle.await;
        }

        for target in &self.targets {
            if let Err(e) = target.manager.stop().await {
                warn!(target_id = %target.config.id, error = %e, "Failed to stop target");
            }
        }

        if let Some(checkpoint) = &self.checkpoint {
            checkpoint.close().await;
        }

        if self.failure.lock().await.is_some() {
            self.set_state(ConnectorState::Failed);
            error!("Connector stopped after a fatal error");
        } else {
            self.set_state(ConnectorState::Stopped);
            info!("Connector stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc_manager::AdapterErrorKind;
    use crate::doc_managers::MemoryDocManager;
    use crate::oplog::MemoryOplog;
    use serde_json::json;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> ConnectorConfig {
        let path = dir.path().join("oplog.timestamp");
        ConnectorConfig::for_testing(path.to_str().unwrap())
    }

    fn connector(dir: &TempDir, oplog: Arc<MemoryOplog>) -> (Connector, Arc<MemoryDocManager>) {
        let manager = Arc::new(MemoryDocManager::new("memory"));
        let managers: Vec<Arc<dyn DocManager>> = vec![manager.clone()];
        let connector = Connector::with_doc_managers(test_config(dir), oplog, managers)
            .unwrap()
            .with_retry(RetryConfig::testing(), RetryConfig::testing());
        (connector, manager)
    }

    #[test]
    fn test_connector_initial_state() {
        let dir = TempDir::new().unwrap();
        let (connector, _) = connector(&dir, Arc::new(MemoryOplog::new("memory://test")));
        assert_eq!(connector.state(), ConnectorState::Created);
        assert_eq!(connector.tailer_state(), TailerState::Starting);
        assert!(connector.checkpoint().is_none());
    }

    #[test]
    fn test_adapter_count_must_match_targets() {
        let dir = TempDir::new().unwrap();
        let result = Connector::with_doc_managers(
            test_config(&dir),
            Arc::new(MemoryOplog::new("memory://test")),
            Vec::new(),
        );
        assert!(matches!(result, Err(ConnectorError::Config { .. })));
    }

    #[test]
    fn test_targets_share_validated_config() {
        let dir = TempDir::new().unwrap();
        let (connector, _) = connector(&dir, Arc::new(MemoryOplog::new("memory://test")));
        assert!(Arc::ptr_eq(&connector.targets[0].config, &connector.config().targets[0]));
    }

    #[tokio::test]
    async fn test_failed_import_leaves_no_checkpoint() {
        let dir = TempDir::new().unwrap();
        let oplog = Arc::new(MemoryOplog::new("memory://test"));
        oplog.seed("db.c", json!({"_id": 1}));
        let (mut connector, manager) = connector(&dir, oplog);
        manager.reject_id(&json!(1), AdapterErrorKind::InvalidDocument);

        assert!(matches!(connector.start().await, Err(ConnectorError::Apply { .. })));
        assert_eq!(connector.state(), ConnectorState::Failed);
        assert!(!dir.path().join("oplog.timestamp").exists());
    }

    #[tokio::test]
    async fn test_start_invalid_state() {
        let dir = TempDir::new().unwrap();
        let (mut connector, _) = connector(&dir, Arc::new(MemoryOplog::new("memory://test")));
        connector.start().await.unwrap();

        let result = connector.start().await;
        assert!(matches!(result, Err(ConnectorError::InvalidState { .. })));
        connector.shutdown().await;
        assert_eq!(connector.state(), ConnectorState::Stopped);
    }

    #[tokio::test]
    async fn test_shutdown_from_created() {
        let dir = TempDir::new().unwrap();
        let (mut connector, _) = connector(&dir, Arc::new(MemoryOplog::new("memory://test")));
        connector.shutdown().await;
        assert_eq!(connector.state(), ConnectorState::Stopped);
    }

    #[tokio::test]
    async fn test_state_receiver_sees_running() {
        let dir = TempDir::new().unwrap();
        let (mut connector, _) = connector(&dir, Arc::new(MemoryOplog::new("memory://test")));
        let rx = connector.state_receiver();
        connector.start().await.unwrap();
        assert_eq!(*rx.borrow(), ConnectorState::Running);
        connector.shutdown().await;
        assert_eq!(*rx.borrow(), ConnectorState::Stopped);
    }

    #[tokio::test]
    async fn test_replicates_and_persists_checkpoint() {
        let dir = TempDir::new().unwrap();
        let oplog = Arc::new(MemoryOplog::new("memory://test"));
        let (mut connector, manager) = connector(&dir, oplog.clone());
        connector.start().await.unwrap();

        oplog.insert("db.a", json!({"_id": 1, "x": 1}));
        let last = oplog.update("db.a", json!(1), json!({"$set": {"x": 2}}));

        let checkpoint = Arc::clone(connector.checkpoint().unwrap());
        tokio::time::timeout(Duration::from_secs(5), async {
            while checkpoint.resume_point().await < last {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let health = connector.health().await;
        assert_eq!(health.resume_point, last);
        assert_eq!(health.targets.len(), 1);

        connector.shutdown().await;
        assert_eq!(manager.get("db.a", &json!(1)).unwrap()["x"], json!(2));
        assert!(manager.is_stopped());

        let persisted = crate::checkpoint::Checkpoint::load(dir.path().join("oplog.timestamp"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(persisted.position, last);
    }

    #[tokio::test]
    async fn test_run_returns_history_gap() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("oplog.timestamp");
        tokio::fs::write(
            &path,
            r#"{"position":"2-0","perTarget":{"memory-0":"2-0"},"updatedAt":0}"#,
        )
        .await
        .unwrap();

        let oplog = Arc::new(MemoryOplog::new("memory://test"));
        for i in 1..=5 {
            oplog.insert("db.a", json!({"_id": i}));
        }
        oplog.trim_before(Position::new(4, 0));

        let (mut connector, manager) = connector(&dir, oplog);
        let err = connector.run().await.unwrap_err();
        assert!(matches!(err, ConnectorError::HistoryGap { .. }));
        assert_eq!(connector.state(), ConnectorState::Failed);
        assert!(manager.applied().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_handle_stops_run() {
        let dir = TempDir::new().unwrap();
        let (mut connector, _) = connector(&dir, Arc::new(MemoryOplog::new("memory://test")));
        let handle = connector.shutdown_handle();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            handle.trigger();
        });
        connector.run().await.unwrap();
        assert_eq!(connector.state(), ConnectorState::Stopped);
    }
}
