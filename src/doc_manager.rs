// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Document manager (target adapter) seam.
//!
//! A document manager writes replicated changes into one target system.
//! The connector owns ordering, batching and checkpoints; an adapter only
//! has to apply what it is given and say how a failure should be treated.
//!
//! # Example
//!
//! ```rust,no_run
//! use oplog_connector::doc_manager::{AdapterError, BoxFuture, DocManager};
//! use oplog_connector::oplog::{Delta, Document, Position};
//! use serde_json::Value;
//!
//! struct StdoutTarget;
//!
//! impl DocManager for StdoutTarget {
//!     fn name(&self) -> &str {
//!         "stdout"
//!     }
//!
//!     fn upsert(&self, doc: Document, namespace: String, _position: Position) -> BoxFuture<'_, ()> {
//!         Box::pin(async move {
//!             println!("{} <- {}", namespace, Value::Object(doc));
//!             Ok(())
//!         })
//!     }
//!
//!     fn update(&self, id: Value, delta: Delta, namespace: String, _position: Position) -> BoxFuture<'_, ()> {
//!         Box::pin(async move {
//!             println!("{} ~ {} set={:?} unset={:?}", namespace, id, delta.set, delta.unset);
//!             Ok(())
//!         })
//!     }
//!
//!     fn remove(&self, id: Value, namespace: String, _position: Position) -> BoxFuture<'_, ()> {
//!         Box::pin(async move {
//!             println!("{} - {}", namespace, id);
//!             Ok(())
//!         })
//!     }
//!
//!     fn commit(&self) -> BoxFuture<'_, ()> {
//!         Box::pin(async { Ok(()) })
//!     }
//!
//!     fn last_applied_position(&self, _namespace: &str) -> BoxFuture<'_, Option<Position>> {
//!         Box::pin(async { Ok(None) })
//!     }
//!
//!     fn stop(&self) -> BoxFuture<'_, ()> {
//!         Box::pin(async { Ok(()) })
//!     }
//! }
//! ```

use crate::error::ConnectorError;
use crate::formatter::FormatterKind;
use crate::oplog::{ChangeEvent, Delta, Document, Operation, Payload, Position, ID_FIELD};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Result type for adapter operations.
pub type AdapterResult<T> = std::result::Result<T, AdapterError>;

/// Type alias for boxed adapter futures.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = AdapterResult<T>> + Send + 'a>>;

/// Boxed future returned by [`DocManager::bulk_apply`].
pub type BulkFuture<'a> = Pin<Box<dyn Future<Output = Result<(), BulkApplyError>> + Send + 'a>>;

/// How an adapter failure is classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdapterErrorKind {
    /// Target unreachable or timed out. Retried with backoff.
    Connection,
    /// Credentials rejected. Always fatal.
    Authentication,
    /// The target refused this document. Subject to `continueOnError`.
    InvalidDocument,
    /// Anything else the adapter could not do. Subject to `continueOnError`.
    Other,
}

impl AdapterErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Authentication => "authentication",
            Self::InvalidDocument => "invalid_document",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for AdapterErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by a document manager.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct AdapterError {
    pub kind: AdapterErrorKind,
    pub message: String,
}

impl AdapterError {
    pub fn new(kind: AdapterErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::Connection, message)
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::Authentication, message)
    }

    pub fn invalid_document(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::InvalidDocument, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::Other, message)
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        self.kind == AdapterErrorKind::Connection
    }

    /// Lift into a connector error for the failing target and event.
    pub fn into_connector_error(
        self,
        target: &str,
        namespace: &str,
        position: Position,
    ) -> ConnectorError {
        match self.kind {
            AdapterErrorKind::Authentication => ConnectorError::Authentication {
                target: target.to_string(),
                message: self.message,
            },
            AdapterErrorKind::Connection => ConnectorError::Connection {
                endpoint: target.to_string(),
                message: self.message,
            },
            _ => ConnectorError::Apply {
                target: target.to_string(),
                namespace: namespace.to_string(),
                position,
                message: self.to_string(),
            },
        }
    }
}

/// A bulk request stopped part way.
///
/// The first `applied` operations of the request took effect, the next one
/// failed with `error`, and nothing after it was attempted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("bulk apply failed after {applied} operations: {error}")]
pub struct BulkApplyError {
    pub applied: usize,
    pub error: AdapterError,
}

// ═══════════════════════════════════════════════════════════════════════════════
// WriteOp
// ═══════════════════════════════════════════════════════════════════════════════

/// What to do with one document.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteKind {
    /// Insert or replace the whole document.
    Upsert(Document),
    /// Apply a partial update.
    Update(Delta),
    Remove,
}

impl WriteKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Upsert(_) => "upsert",
            Self::Update(_) => "update",
            Self::Remove => "remove",
        }
    }
}

/// One formatted write for a target.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOp {
    /// Target namespace (after mapping).
    pub namespace: String,
    /// Source position of the originating event.
    pub position: Position,
    /// Document identifier.
    pub id: Value,
    pub kind: WriteKind,
}

impl WriteOp {
    /// Upsert of a document that already carries its id under `unique_key`.
    pub fn upsert(namespace: impl Into<String>, position: Position, id: Value, doc: Document) -> Self {
        Self {
            namespace: namespace.into(),
            position,
            id,
            kind: WriteKind::Upsert(doc),
        }
    }

    /// Build the write a target applies for an event.
    ///
    /// The formatter runs here, per target. Replacement updates become
    /// upserts. When the target's identifier field is not `_id`, the id is
    /// moved to `unique_key`. Returns `None` for an event with nothing to
    /// write.
    pub fn from_event(event: &ChangeEvent, formatter: FormatterKind, unique_key: &str) -> Option<Self> {
        let kind = match (&event.op, &event.payload) {
            (Operation::Delete, _) => WriteKind::Remove,
            (_, Payload::Document(doc)) => {
                let mut doc = formatter.format_document(doc);
                doc.remove(ID_FIELD);
                doc.insert(unique_key.to_string(), event.document_id.clone());
                WriteKind::Upsert(doc)
            }
            (_, Payload::Delta(delta)) => {
                let delta = formatter.format_delta(delta);
                if delta.is_empty() {
                    return None;
                }
                WriteKind::Update(delta)
            }
            (_, Payload::None) => return None,
        };

        Some(Self {
            namespace: event.namespace.clone(),
            position: event.position,
            id: event.document_id.clone(),
            kind,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DocManager trait
// ═══════════════════════════════════════════════════════════════════════════════

/// A target adapter.
///
/// All writes carry the source position so adapters can record how far
/// each namespace has been applied. Adapters must be idempotent: after a
/// restart the connector re-delivers events from the last checkpoint, which
/// may already have been applied.
pub trait DocManager: Send + Sync + 'static {
    /// Adapter name for logs.
    fn name(&self) -> &str;

    /// Insert or replace a document in `namespace`.
    fn upsert(&self, doc: Document, namespace: String, position: Position) -> BoxFuture<'_, ()>;

    /// Apply a partial update to the document with `id`.
    fn update(
        &self,
        id: Value,
        delta: Delta,
        namespace: String,
        position: Position,
    ) -> BoxFuture<'_, ()>;

    /// Delete the document with `id`.
    fn remove(&self, id: Value, namespace: String, position: Position) -> BoxFuture<'_, ()>;

    /// Dispatch one write.
    fn apply(&self, op: WriteOp) -> BoxFuture<'_, ()> {
        match op.kind {
            WriteKind::Upsert(doc) => self.upsert(doc, op.namespace, op.position),
            WriteKind::Update(delta) => self.update(op.id, delta, op.namespace, op.position),
            WriteKind::Remove => self.remove(op.id, op.namespace, op.position),
        }
    }

    /// Apply writes in order, stopping at the first failure.
    ///
    /// Default implementation applies one at a time. Adapters with a native
    /// bulk API should override it, keeping the contract that everything
    /// before `applied` took effect and nothing after it did.
    fn bulk_apply(&self, ops: Vec<WriteOp>) -> BulkFuture<'_> {
        Box::pin(async move {
            for (applied, op) in ops.into_iter().enumerate() {
                if let Err(error) = self.apply(op).await {
                    return Err(BulkApplyError { applied, error });
                }
            }
            Ok(())
        })
    }

    /// Make everything applied so far durable / visible.
    fn commit(&self) -> BoxFuture<'_, ()>;

    /// Highest position this adapter recorded for `namespace`, if it tracks one.
    fn last_applied_position(&self, namespace: &str) -> BoxFuture<'_, Option<Position>>;

    /// Release resources. Called once, after the final commit.
    fn stop(&self) -> BoxFuture<'_, ()>;
}
