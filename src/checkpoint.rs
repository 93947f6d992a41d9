// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Checkpoint persistence.
//!
//! Tracks the last acknowledged position of every target and persists the
//! resume point (the minimum across targets) to a small JSON file.
//!
//! # Debounced Writes
//!
//! - `advance()` updates the in-memory state immediately and marks it dirty
//! - `flush()` writes the file if dirty
//! - The connector calls `flush()` every `checkpointInterval` and on shutdown
//!
//! A crash between `advance()` and `flush()` loses at most one interval of
//! progress. On restart those events are re-read and re-applied, which
//! adapters must tolerate (upserts and removes are idempotent).
//!
//! # File Format
//!
//! ```json
//! {
//!   "position": "1700000000-3",
//!   "perTarget": {"search": "1700000000-3", "archive": "1700000005-0"},
//!   "updatedAt": 1700000012345
//! }
//! ```
//!
//! The file is replaced atomically: write `<path>.tmp`, fsync, rename.
//!
//! # Semantics
//!
//! ```text
//! target A acks 12 ─┐
//! target B acks  9 ─┴─► resume point = min = 9
//!                       (restart re-reads 10..12 for A, idempotent)
//! ```

use crate::error::{ConnectorError, Result};
use crate::oplog::Position;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Persisted checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    /// Resume point: minimum of `per_target`.
    pub position: Position,
    /// Last acknowledged position per target.
    #[serde(default)]
    pub per_target: BTreeMap<String, Position>,
    /// Epoch millis of the last write.
    #[serde(default)]
    pub updated_at: i64,
}

impl Checkpoint {
    /// Read a checkpoint file. `Ok(None)` when it does not exist.
    ///
    /// A file that exists but does not parse is an error: starting from
    /// scratch would silently re-import or skip history.
    pub async fn load(path: impl AsRef<Path>) -> Result<Option<Self>> {
        let path = path.as_ref();
        match fs::read(path).await {
            Ok(bytes) => {
                let checkpoint: Checkpoint = serde_json::from_slice(&bytes)?;
                Ok(Some(checkpoint))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ConnectorError::Checkpoint(e)),
        }
    }
}

struct State {
    per_target: BTreeMap<String, Position>,
}

impl State {
    fn min(&self) -> Position {
        self.per_target.values().min().copied().unwrap_or(Position::ZERO)
    }
}

/// Checkpoint store shared by the workers, the tailer and the connector.
pub struct CheckpointStore {
    path: PathBuf,
    state: RwLock<State>,
    dirty: AtomicBool,
    /// Serializes file writes.
    write_lock: Mutex<()>,
    loaded: bool,
}

impl CheckpointStore {
    /// Open the store at `path` for the given targets.
    ///
    /// Targets missing from the file start at the file's resume point;
    /// targets in the file that are no longer configured are dropped.
    pub async fn open(path: impl AsRef<Path>, targets: &[String]) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        info!(path = %path.display(), "Opening checkpoint store");

        let existing = Checkpoint::load(&path).await?;
        let loaded = existing.is_some();
        let base = existing.as_ref().map(|c| c.position).unwrap_or(Position::ZERO);

        let mut per_target = BTreeMap::new();
        for target in targets {
            let position = existing
                .as_ref()
                .and_then(|c| c.per_target.get(target).copied())
                .unwrap_or(base);
            per_target.insert(target.clone(), position);
        }

        if let Some(checkpoint) = &existing {
            for stale in checkpoint.per_target.keys().filter(|t| !per_target.contains_key(*t)) {
                info!(target_id = %stale, "Dropping checkpoint entry for unconfigured target");
            }
            info!(
                position = %checkpoint.position,
                targets = per_target.len(),
                "Restored checkpoint from previous run"
            );
        }

        Ok(Self {
            path,
            state: RwLock::new(State { per_target }),
            dirty: AtomicBool::new(false),
            write_lock: Mutex::new(()),
            loaded,
        })
    }

    /// Whether a checkpoint file existed when the store was opened.
    pub fn was_loaded(&self) -> bool {
        self.loaded
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record that `target` has applied everything up to `position`.
    ///
    /// Positions must strictly increase per target. A non-increasing
    /// position is a caller bug.
    pub async fn advance(&self, target: &str, position: Position) -> Result<()> {
        let mut state = self.state.write().await;
        let current = state.per_target.get_mut(target).ok_or_else(|| {
            ConnectorError::InvalidState {
                expected: "configured target".to_string(),
                actual: target.to_string(),
            }
        })?;

        if position <= *current {
            error!(
                target_id = %target,
                current = %current,
                position = %position,
                "Checkpoint advance is not monotonic"
            );
            debug_assert!(
                position > *current,
                "non-monotonic checkpoint advance for {}: {} -> {}",
                target,
                current,
                position
            );
            return Err(ConnectorError::InvalidState {
                expected: format!("position after {}", current),
                actual: position.to_string(),
            });
        }

        *current = position;
        self.dirty.store(true, Ordering::Release);
        debug!(target_id = %target, position = %position, "Checkpoint advanced (pending flush)");
        crate::metrics::set_target_position(target, position);
        Ok(())
    }

    /// Last acknowledged position of one target.
    pub async fn position(&self, target: &str) -> Option<Position> {
        self.state.read().await.per_target.get(target).copied()
    }

    /// In-memory resume point (minimum across targets).
    pub async fn resume_point(&self) -> Position {
        self.state.read().await.min()
    }

    /// Snapshot of the current state.
    pub async fn snapshot(&self) -> Checkpoint {
        let state = self.state.read().await;
        Checkpoint {
            position: state.min(),
            per_target: state.per_target.clone(),
            updated_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Resume point, durably written before returning.
    pub async fn persisted_resume_point(&self) -> Result<Position> {
        self.dirty.store(true, Ordering::Release);
        self.flush().await?;
        Ok(self.resume_point().await)
    }

    /// Write the file if anything changed since the last flush.
    ///
    /// Returns whether a write happened.
    pub async fn flush(&self) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }

        let checkpoint = self.snapshot().await;
        match self.write_atomic(&checkpoint).await {
            Ok(()) => {
                debug!(position = %checkpoint.position, "Checkpoint flushed");
                crate::metrics::record_checkpoint_flush(true);
                crate::metrics::set_resume_position(checkpoint.position);
                Ok(true)
            }
            Err(e) => {
                warn!(error = %e, "Failed to flush checkpoint");
                crate::metrics::record_checkpoint_flush(false);
                // Retry on the next flush.
                self.dirty.store(true, Ordering::Release);
                Err(e)
            }
        }
    }

    /// Operator-forced resync: every target restarts at `position`.
    ///
    /// The only operation allowed to move the checkpoint backwards.
    pub async fn reset(&self, position: Position) -> Result<()> {
        {
            let mut state = self.state.write().await;
            for value in state.per_target.values_mut() {
                *value = position;
            }
        }
        info!(position = %position, "Checkpoint reset");
        self.dirty.store(true, Ordering::Release);
        self.flush().await?;
        Ok(())
    }

    async fn write_atomic(&self, checkpoint: &Checkpoint) -> Result<()> {
        let json = serde_json::to_vec_pretty(checkpoint)?;
        let temp_path = temp_path_for(&self.path);

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }

    /// Final flush on shutdown.
    pub async fn close(&self) {
        match self.persisted_resume_point().await {
            Ok(position) => info!(position = %position, "Checkpoint store closed"),
            Err(e) => error!(error = %e, "Failed to persist checkpoint on close"),
        }
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
