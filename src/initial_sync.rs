// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Initial import: copy the current contents of every routed namespace to
//! every target before tailing starts.
//!
//! # Consistency
//!
//! The newest log position is captured *before* the first scan. Tailing then
//! starts from that position, so anything written during the copy is applied
//! again from the log. Upserts are idempotent, which makes the overlap
//! harmless.
//!
//! # Ordering
//!
//! Namespaces are copied one at a time, in name order, except that
//! large-object chunks always go before their metadata. Targets copy the
//! same namespace concurrently.
//!
//! # Shutdown
//!
//! A namespace is copied completely or not at all. Shutdown is observed
//! between namespaces only; retry and block back-offs inside a namespace run
//! to the end. An import stopped early leaves no checkpoint, so the next
//! start copies everything again.

use crate::config::TargetConfig;
use crate::doc_manager::{BulkApplyError, DocManager, WriteOp};
use crate::error::{ConnectorError, Result};
use crate::metrics;
use crate::namespace::{NamespaceKind, NamespaceRouter, Route};
use crate::oplog::{id_string, ChangeEvent, OplogSource, Position};
use crate::policy::{ErrorPolicy, FailureAction};
use crate::projection::FieldProjection;
use crate::query::Query;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{error, info, info_span, warn, Instrument};

/// A target taking part in the import.
#[derive(Clone)]
pub struct SyncTarget {
    pub target: Arc<TargetConfig>,
    pub manager: Arc<dyn DocManager>,
    pub policy: ErrorPolicy,
}

/// Outcome of a completed import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// Position tailing must start after.
    pub start: Position,
    /// Namespaces copied.
    pub namespaces: usize,
    /// Source documents that passed the query.
    pub documents: usize,
    /// Writes skipped under `continueOnError`, summed over targets.
    pub skipped: usize,
}

/// One routed namespace to copy.
#[derive(Debug, Clone)]
struct PlannedNamespace {
    source: String,
    target: String,
    kind: NamespaceKind,
}

/// Copies existing documents to the targets.
pub struct InitialSync {
    source: Arc<dyn OplogSource>,
    router: NamespaceRouter,
    projection: FieldProjection,
    query: Query,
    shutdown_rx: watch::Receiver<bool>,
}

impl InitialSync {
    pub fn new(
        source: Arc<dyn OplogSource>,
        router: NamespaceRouter,
        projection: FieldProjection,
        query: Query,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            source,
            router,
            projection,
            query,
            shutdown_rx,
        }
    }

    /// Copy everything, then commit every target.
    pub async fn run(&self, targets: &[SyncTarget]) -> Result<SyncReport> {
        let span = info_span!("initial_sync", source = %self.source.name());

        async move {
            let started = Instant::now();
            let start = self.source.latest_position().await?.unwrap_or(Position::ZERO);
            let plan = self.plan().await?;
            info!(
                start = %start,
                namespaces = plan.len(),
                targets = targets.len(),
                "Starting initial import"
            );

            let mut documents = 0;
            let mut skipped = 0;
            for ns in &plan {
                if *self.shutdown_rx.borrow() {
                    return Err(ConnectorError::Shutdown);
                }

                let events = self.load(ns, start).await?;
                documents += events.len();

                let results = join_all(
                    targets
                        .iter()
                        .map(|t| self.copy_namespace(t, &ns.target, &events)),
                )
                .await;
                for result in results {
                    skipped += result?;
                }
            }

            for (target, result) in targets
                .iter()
                .zip(join_all(targets.iter().map(|t| t.manager.commit())).await)
            {
                metrics::record_commit(&target.target.id, result.is_ok());
                result.map_err(|e| e.into_connector_error(&target.target.id, "", start))?;
            }

            metrics::record_initial_sync_complete(plan.len(), started.elapsed());
            info!(
                start = %start,
                namespaces = plan.len(),
                documents,
                skipped,
                duration_ms = started.elapsed().as_millis() as u64,
                "Initial import complete"
            );
            Ok(SyncReport {
                start,
                namespaces: plan.len(),
                documents,
                skipped,
            })
        }
        .instrument(span)
        .await
    }

    /// Routed namespaces in copy order.
    async fn plan(&self) -> Result<Vec<PlannedNamespace>> {
        let mut plan: Vec<PlannedNamespace> = self
            .source
            .namespaces()
            .await?
            .into_iter()
            .filter_map(|source| match self.router.route(&source) {
                Route::Target { namespace, kind } => Some(PlannedNamespace {
                    source,
                    target: namespace,
                    kind,
                }),
                Route::Dropped(_) => None,
            })
            .collect();

        // Metadata sorts after everything so its chunks are already there.
        plan.sort_by(|a, b| {
            let rank = |p: &PlannedNamespace| {
                matches!(p.kind, NamespaceKind::LargeObjectFiles { .. }) as u8
            };
            rank(a).cmp(&rank(b)).then_with(|| a.source.cmp(&b.source))
        });
        Ok(plan)
    }

    /// Scan, filter and project one namespace into insert events.
    async fn load(&self, ns: &PlannedNamespace, start: Position) -> Result<Vec<ChangeEvent>> {
        let docs = self.source.scan(&ns.source).await?;
        let scanned = docs.len();

        let events: Vec<ChangeEvent> = docs
            .into_iter()
            .filter(|doc| ns.kind.is_large_object() || self.query.matches(doc))
            .map(|doc| ChangeEvent::insert(start, ns.target.clone(), self.projection.project_document(&doc)))
            .collect();

        info!(
            namespace = %ns.source,
            target_namespace = %ns.target,
            scanned,
            matched = events.len(),
            "Loaded namespace"
        );
        Ok(events)
    }

    /// Copy one namespace to one target. Returns the number of skipped writes.
    async fn copy_namespace(
        &self,
        target: &SyncTarget,
        namespace: &str,
        events: &[ChangeEvent],
    ) -> Result<usize> {
        let started = Instant::now();
        let ops: Vec<WriteOp> = events
            .iter()
            .filter_map(|e| WriteOp::from_event(e, target.target.formatter, &target.target.unique_key))
            .collect();

        let mut skipped = 0;
        for chunk in ops.chunks(target.target.bulk_size.max(1)) {
            skipped += self.apply_chunk(target, chunk.to_vec()).await?;
        }

        metrics::record_initial_sync_namespace(&target.target.id, ops.len() - skipped, started.elapsed());
        info!(
            target_id = %target.target.id,
            namespace = %namespace,
            documents = ops.len() - skipped,
            skipped,
            "Copied namespace"
        );
        Ok(skipped)
    }

    async fn apply_chunk(&self, target: &SyncTarget, mut remaining: Vec<WriteOp>) -> Result<usize> {
        let target_id = target.target.id.as_str();
        let mut skipped = 0;
        let mut attempt = 0;

        while !remaining.is_empty() {
            let BulkApplyError { applied, error } = match target.manager.bulk_apply(remaining.clone()).await {
                Ok(()) => break,
                Err(e) => e,
            };

            let applied = applied.min(remaining.len().saturating_sub(1));
            if applied > 0 {
                remaining.drain(..applied);
                attempt = 0;
            }
            attempt += 1;

            let failed = &remaining[0];
            match target.policy.decide(&error, attempt) {
                FailureAction::Retry(delay) | FailureAction::Block(delay) => {
                    warn!(
                        target_id,
                        namespace = %failed.namespace,
                        id = %id_string(&failed.id),
                        error = %error,
                        attempt,
                        "Import write failed, retrying"
                    );
                    metrics::record_apply_retry(target_id, error.kind.as_str());
                    tokio::time::sleep(delay).await;
                }
                FailureAction::Skip => {
                    warn!(
                        target_id,
                        namespace = %failed.namespace,
                        id = %id_string(&failed.id),
                        error = %error,
                        "Skipping document rejected by target"
                    );
                    metrics::record_event_skipped(target_id, error.kind.as_str());
                    remaining.remove(0);
                    skipped += 1;
                    attempt = 0;
                }
                FailureAction::Halt => {
                    error!(
                        target_id,
                        namespace = %failed.namespace,
                        id = %id_string(&failed.id),
                        error = %error,
                        "Import write failed, halting"
                    );
                    metrics::record_apply_halt(target_id, error.kind.as_str());
                    return Err(error.into_connector_error(target_id, &failed.namespace, failed.position));
                }
            }
        }
        Ok(skipped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectorConfig, HaltMode, NamespaceConfig};
    use crate::doc_manager::AdapterErrorKind;
    use crate::doc_managers::MemoryDocManager;
    use crate::oplog::MemoryOplog;
    use crate::resilience::RetryConfig;
    use serde_json::json;
    use std::time::Duration;

    fn target(manager: Arc<MemoryDocManager>, continue_on_error: bool) -> SyncTarget {
        let validated = ConnectorConfig::for_testing("/tmp/oplog.timestamp").validate().unwrap();
        SyncTarget {
            target: validated.targets[0].clone(),
            manager,
            policy: ErrorPolicy::new(continue_on_error, HaltMode::Exit, RetryConfig::testing()),
        }
    }

    fn sync(oplog: Arc<MemoryOplog>, router: NamespaceRouter, query: Query) -> (InitialSync, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        (
            InitialSync::new(oplog, router, FieldProjection::pass_through(), query, rx),
            tx,
        )
    }

    #[tokio::test]
    async fn test_copies_routed_namespaces_and_captures_start() {
        let oplog = Arc::new(MemoryOplog::new("memory://test"));
        oplog.seed("shop.orders", json!({"_id": 1, "total": 5}));
        oplog.seed("shop.orders", json!({"_id": 2, "total": 500}));
        oplog.seed("shop.system.profile", json!({"_id": 9}));
        let latest = oplog.insert("shop.users", json!({"_id": "u1"}));

        let manager = Arc::new(MemoryDocManager::new("memory"));
        let (sync, _tx) = sync(oplog, NamespaceRouter::pass_through(), Query::all());
        let report = sync.run(&[target(manager.clone(), false)]).await.unwrap();

        assert_eq!(report.start, latest);
        assert_eq!(report.namespaces, 2);
        assert_eq!(report.documents, 3);
        assert_eq!(manager.namespaces(), vec!["shop.orders".to_string(), "shop.users".to_string()]);
        assert_eq!(manager.commit_count(), 1);
    }

    #[tokio::test]
    async fn test_query_limits_normal_namespaces() {
        let oplog = Arc::new(MemoryOplog::new("memory://test"));
        oplog.seed("shop.orders", json!({"_id": 1, "total": 5}));
        oplog.seed("shop.orders", json!({"_id": 2, "total": 500}));

        let manager = Arc::new(MemoryDocManager::new("memory"));
        let query = Query::parse(&json!({"total": {"$gte": 100}})).unwrap();
        let (sync, _tx) = sync(oplog, NamespaceRouter::pass_through(), query);
        let report = sync.run(&[target(manager.clone(), false)]).await.unwrap();

        assert_eq!(report.documents, 1);
        assert!(manager.get("shop.orders", &json!(1)).is_none());
        assert!(manager.get("shop.orders", &json!(2)).is_some());
    }

    #[tokio::test]
    async fn test_chunks_copied_before_metadata() {
        let oplog = Arc::new(MemoryOplog::new("memory://test"));
        oplog.seed("db.fs.files", json!({"_id": "f", "length": 4, "chunkSize": 4}));
        oplog.seed("db.fs.chunks", json!({"_id": "c", "files_id": "f", "n": 0}));
        oplog.seed("db.a", json!({"_id": 1}));

        let router = NamespaceRouter::new(&NamespaceConfig {
            gridfs: vec!["db.fs".into()],
            ..Default::default()
        })
        .unwrap();
        let manager = Arc::new(MemoryDocManager::new("memory"));
        let (sync, _tx) = sync(oplog, router, Query::all());
        sync.run(&[target(manager.clone(), false)]).await.unwrap();

        let order: Vec<String> = manager.applied().into_iter().map(|a| a.namespace).collect();
        assert_eq!(order, vec!["db.a", "db.fs.chunks", "db.fs.files"]);
    }

    #[tokio::test]
    async fn test_rejected_document_skipped_or_halts() {
        let oplog = Arc::new(MemoryOplog::new("memory://test"));
        for i in 1..=3 {
            oplog.seed("db.a", json!({"_id": i}));
        }

        let lenient = Arc::new(MemoryDocManager::new("memory"));
        lenient.reject_id(&json!(2), AdapterErrorKind::InvalidDocument);
        let (s, _tx) = sync(oplog.clone(), NamespaceRouter::pass_through(), Query::all());
        let report = s.run(&[target(lenient.clone(), true)]).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(lenient.documents("db.a").len(), 2);

        let strict = Arc::new(MemoryDocManager::new("memory"));
        strict.reject_id(&json!(2), AdapterErrorKind::InvalidDocument);
        let (s, _tx) = sync(oplog, NamespaceRouter::pass_through(), Query::all());
        let err = s.run(&[target(strict.clone(), false)]).await.unwrap_err();
        assert!(matches!(err, ConnectorError::Apply { .. }));
        assert_eq!(strict.documents("db.a").len(), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_retried() {
        let oplog = Arc::new(MemoryOplog::new("memory://test"));
        oplog.seed("db.a", json!({"_id": 1}));

        let manager = Arc::new(MemoryDocManager::new("memory"));
        manager.fail_next(2);
        let (s, _tx) = sync(oplog, NamespaceRouter::pass_through(), Query::all());
        s.run(&[target(manager.clone(), false)]).await.unwrap();
        assert_eq!(manager.documents("db.a").len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_finishes_namespace_in_progress() {
        let oplog = Arc::new(MemoryOplog::new("memory://test"));
        for i in 1..=3 {
            oplog.seed("db.a", json!({"_id": i}));
        }
        oplog.seed("db.b", json!({"_id": 1}));

        let manager = Arc::new(MemoryDocManager::new("memory"));
        manager.reject_id(&json!(2), AdapterErrorKind::Other);
        let mut blocking = target(manager.clone(), false);
        blocking.policy = ErrorPolicy::new(false, HaltMode::Block, RetryConfig::testing());

        let (s, tx) = sync(oplog, NamespaceRouter::pass_through(), Query::all());
        let handle = tokio::spawn(async move { s.run(&[blocking]).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());

        manager.clear_rejections();
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, ConnectorError::Shutdown));
        assert_eq!(manager.documents("db.a").len(), 3);
        assert!(manager.documents("db.b").is_empty());
    }
}
