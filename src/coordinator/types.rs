// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Connector and tailer state types.
//!
//! # Connector State Transitions
//!
//! ```text
//!               start()
//! Created ─────────────────→ InitialSync ──→ Running
//!    │   (checkpoint found)                    │
//!    └──────────────────────────────────────→ │
//!                                              │ shutdown()
//!                                              ↓
//!                         Failed ←──────── Stopping ──→ Stopped
//!                     (fatal error,
//!                      gap, halt)
//! ```
//!
//! # Tailer State Transitions
//!
//! ```text
//! Starting ──→ CatchingUp ⇄ Tailing ──→ Stopped
//!                   │    ↘   ↑  │
//!                   │  Reconnecting
//!                   ↓
//!                 Error (history gap)
//! ```
//!
//! - **CatchingUp**: the last read returned a full `readLimit` of events.
//! - **Tailing**: the last read was short; the reader is at the head of the log.
//! - **Reconnecting**: the source failed; the read position is held while
//!   backing off.

use crate::oplog::Position;

/// State of the connector.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    /// Connector created but not started.
    ///
    /// Call [`start()`](super::Connector::start) to begin replication.
    Created,

    /// Copying existing documents before tailing.
    InitialSync,

    /// Tailing the source and applying to targets.
    Running,

    /// Draining queues and persisting the checkpoint.
    Stopping,

    /// Shut down cleanly. Safe to drop.
    Stopped,

    /// A fatal error stopped replication.
    ///
    /// Check logs for the failing target, namespace and position.
    Failed,
}

impl std::fmt::Display for ConnectorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectorState::Created => write!(f, "Created"),
            ConnectorState::InitialSync => write!(f, "InitialSync"),
            ConnectorState::Running => write!(f, "Running"),
            ConnectorState::Stopping => write!(f, "Stopping"),
            ConnectorState::Stopped => write!(f, "Stopped"),
            ConnectorState::Failed => write!(f, "Failed"),
        }
    }
}

/// State of the oplog tailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailerState {
    Starting,
    CatchingUp,
    Tailing,
    Reconnecting,
    /// Stopped on a non-retriable source error.
    Error,
    Stopped,
}

impl std::fmt::Display for TailerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TailerState::Starting => write!(f, "Starting"),
            TailerState::CatchingUp => write!(f, "CatchingUp"),
            TailerState::Tailing => write!(f, "Tailing"),
            TailerState::Reconnecting => write!(f, "Reconnecting"),
            TailerState::Error => write!(f, "Error"),
            TailerState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Health of one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetHealth {
    pub target_id: String,
    /// Acknowledged position.
    pub position: Option<Position>,
    /// Batches waiting in the target's queue.
    pub queued_batches: usize,
}

/// Point-in-time health snapshot, collected without I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    pub state: ConnectorState,
    pub tailer_state: TailerState,
    /// Running and tailing or catching up.
    pub ready: bool,
    /// Minimum acknowledged position across targets.
    pub resume_point: Position,
    pub targets: Vec<TargetHealth>,
}
