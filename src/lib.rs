// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Oplog Connector
//!
//! A change-data-capture connector: tails a source database's operation log
//! and replays every committed insert, update and delete into one or more
//! targets through pluggable document managers.
//!
//! ## Architecture
//!
//! ```text
//!                                      ┌──────────┐   ┌──────────┐
//! ┌─────────────┐   ┌──────────────┐ ┌►│ queue A  │──►│ worker A │──► DocManager A
//! │ OplogSource │──►│ Tailer       │─┤ └──────────┘   └──────────┘
//! │ (read_after)│   │ route/project│ │ ┌──────────┐   ┌──────────┐
//! └─────────────┘   │ batch        │ └►│ queue B  │──►│ worker B │──► DocManager B
//!                   └──────────────┘   └──────────┘   └──────────┘
//!                                                          │ acks
//!                                                          ▼
//!                                          ┌────────────────────────────────┐
//!                                          │ CheckpointStore (min of acks)  │
//!                                          └────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! - At-least-once delivery: the checkpoint only moves past events every
//!   target has applied and committed, and all adapter writes are idempotent
//! - A stuck target never stalls delivery to the others
//! - Per-namespace order is preserved within each target
//! - Large-object metadata is never applied before its chunks
//! - A log trimmed past the resume point stops the connector instead of
//!   silently losing updates
//!
//! ## Usage
//!
//! ```rust,no_run
//! use oplog_connector::{Connector, ConnectorConfig, RedisOplog};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> oplog_connector::Result<()> {
//!     let config = ConnectorConfig::from_file("config.json")?;
//!     let source = Arc::new(RedisOplog::connect(&config.main_address).await?);
//!
//!     let mut connector = Connector::new(config, source).await?;
//!     let shutdown = connector.shutdown_handle();
//!     tokio::spawn(async move {
//!         let _ = tokio::signal::ctrl_c().await;
//!         shutdown.trigger();
//!     });
//!
//!     // Runs until ctrl-c or a fatal error
//!     connector.run().await
//! }
//! ```

pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod coordinator;
pub mod doc_manager;
pub mod doc_managers;
pub mod error;
pub mod formatter;
pub mod initial_sync;
pub mod metrics;
pub mod namespace;
pub mod oplog;
pub mod policy;
pub mod projection;
pub mod query;
pub mod redis_oplog;
pub mod resilience;

// Re-exports for convenience
pub use batch::{Batch, Batcher, RoutedEvent};
pub use checkpoint::{Checkpoint, CheckpointStore};
pub use config::{BatchSize, ConnectorConfig, DocManagerConfig, HaltMode, ValidatedConfig};
pub use coordinator::{Connector, ConnectorState, HealthCheck, ShutdownHandle, TailerState};
pub use doc_manager::{AdapterError, AdapterErrorKind, DocManager, WriteOp};
pub use doc_managers::{DocManagerKind, JsonLinesDocManager, MemoryDocManager, RedisDocManager};
pub use error::{ConnectorError, Result};
pub use oplog::{ChangeEvent, MemoryOplog, OplogSource, Position};
pub use redis_oplog::RedisOplog;
pub use resilience::RetryConfig;
