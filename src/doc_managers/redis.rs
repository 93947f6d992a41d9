// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis document manager.
//!
//! Each document is stored as a JSON string under
//! `{prefix}:{namespace}:{id}`, where the prefix is the target's
//! `indexCategory` (default `connector`). The last applied position of every
//! namespace lives in the hash `{prefix}:positions`.
//!
//! Upserts and removes of a bulk request are sent as one atomic pipeline
//! (`MULTI`/`EXEC`) together with the position update, so a failed pipeline
//! applied nothing. Partial updates need the current document and are
//! applied one at a time.

use crate::doc_manager::{
    AdapterError, AdapterResult, BoxFuture, BulkApplyError, BulkFuture, DocManager, WriteKind,
    WriteOp,
};
use crate::error::{ConnectorError, Result};
use crate::oplog::{id_string, Delta, Document, Position};
use ::redis::aio::ConnectionManager;
use ::redis::{Client, ErrorKind, Pipeline, RedisError};
use serde_json::Value;
use tracing::{debug, info};

const DEFAULT_PREFIX: &str = "connector";

/// Document manager writing to a Redis server.
pub struct RedisDocManager {
    name: String,
    unique_key: String,
    prefix: String,
    conn: ConnectionManager,
}

impl RedisDocManager {
    /// Connect to the target.
    pub async fn connect(
        name: &str,
        url: &str,
        unique_key: &str,
        index_category: Option<&str>,
    ) -> Result<Self> {
        let client = Client::open(url).map_err(|e| ConnectorError::redis(url, e))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| ConnectorError::redis(url, e))?;

        let prefix = index_category.unwrap_or(DEFAULT_PREFIX).to_string();
        info!(target_id = %name, url = %url, prefix = %prefix, "Connected to Redis target");

        Ok(Self {
            name: name.to_string(),
            unique_key: unique_key.to_string(),
            prefix,
            conn,
        })
    }

    fn positions_key(&self) -> String {
        format!("{}:positions", self.prefix)
    }

    /// Read one stored document.
    pub async fn get_document(&self, namespace: &str, id: &Value) -> AdapterResult<Option<Document>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = ::redis::cmd("GET")
            .arg(document_key(&self.prefix, namespace, id))
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;

        match raw {
            None => Ok(None),
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(Value::Object(doc)) => Ok(Some(doc)),
                Ok(_) | Err(_) => Err(AdapterError::other(format!(
                    "stored value for {} is not a JSON document",
                    document_key(&self.prefix, namespace, id)
                ))),
            },
        }
    }

    /// Add the commands for an upsert or remove to a pipeline.
    fn queue(&self, pipe: &mut Pipeline, op: &WriteOp) -> AdapterResult<()> {
        let key = document_key(&self.prefix, &op.namespace, &op.id);
        match &op.kind {
            WriteKind::Upsert(doc) => {
                if !doc.contains_key(&self.unique_key) {
                    return Err(AdapterError::invalid_document(format!(
                        "document has no {:?} field",
                        self.unique_key
                    )));
                }
                let json = serde_json::to_string(doc)
                    .map_err(|e| AdapterError::invalid_document(e.to_string()))?;
                pipe.cmd("SET").arg(key).arg(json).ignore();
            }
            WriteKind::Remove => {
                pipe.cmd("DEL").arg(key).ignore();
            }
            WriteKind::Update(_) => {
                return Err(AdapterError::other("partial updates cannot be pipelined"));
            }
        }
        pipe.cmd("HSET")
            .arg(self.positions_key())
            .arg(&op.namespace)
            .arg(op.position.to_string())
            .ignore();
        Ok(())
    }

    async fn exec(&self, pipe: &Pipeline) -> AdapterResult<()> {
        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await.map_err(redis_error)?;
        Ok(())
    }

    async fn apply_update(&self, id: Value, delta: Delta, namespace: String, position: Position) -> AdapterResult<()> {
        let mut doc = match self.get_document(&namespace, &id).await? {
            Some(doc) => doc,
            None => {
                let mut doc = Document::new();
                doc.insert(self.unique_key.clone(), id.clone());
                doc
            }
        };
        delta.apply_to(&mut doc);

        let op = WriteOp::upsert(namespace, position, id, doc);
        let mut pipe = ::redis::pipe();
        pipe.atomic();
        self.queue(&mut pipe, &op)?;
        self.exec(&pipe).await
    }

    async fn apply_one(&self, op: WriteOp) -> AdapterResult<()> {
        if let WriteKind::Update(delta) = op.kind {
            return self.apply_update(op.id, delta, op.namespace, op.position).await;
        }
        let mut pipe = ::redis::pipe();
        pipe.atomic();
        self.queue(&mut pipe, &op)?;
        self.exec(&pipe).await
    }
}

/// Storage key of a document.
pub fn document_key(prefix: &str, namespace: &str, id: &Value) -> String {
    format!("{}:{}:{}", prefix, namespace, id_string(id))
}

/// Classify a redis error for the error policy.
pub fn redis_error(e: RedisError) -> AdapterError {
    if e.kind() == ErrorKind::AuthenticationFailed {
        return AdapterError::authentication(e.to_string());
    }
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() {
        return AdapterError::connection(e.to_string());
    }
    AdapterError::other(e.to_string())
}

impl DocManager for RedisDocManager {
    fn name(&self) -> &str {
        &self.name
    }

    fn upsert(&self, doc: Document, namespace: String, position: Position) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let id = doc.get(&self.unique_key).cloned().ok_or_else(|| {
                AdapterError::invalid_document(format!("document has no {:?} field", self.unique_key))
            })?;
            self.apply_one(WriteOp::upsert(namespace, position, id, doc)).await
        })
    }

    fn update(
        &self,
        id: Value,
        delta: Delta,
        namespace: String,
        position: Position,
    ) -> BoxFuture<'_, ()> {
        Box::pin(async move { self.apply_update(id, delta, namespace, position).await })
    }

    fn remove(&self, id: Value, namespace: String, position: Position) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.apply_one(WriteOp {
                namespace,
                position,
                id,
                kind: WriteKind::Remove,
            })
            .await
        })
    }

    fn bulk_apply(&self, ops: Vec<WriteOp>) -> BulkFuture<'_> {
        Box::pin(async move {
            let total = ops.len();
            let mut applied = 0;
            let mut pipe = ::redis::pipe();
            pipe.atomic();
            let mut queued = 0;

            for op in ops {
                if let WriteKind::Update(delta) = op.kind {
                    if queued > 0 {
                        self.exec(&pipe)
                            .await
                            .map_err(|error| BulkApplyError { applied, error })?;
                        applied += queued;
                        queued = 0;
                        pipe = ::redis::pipe();
                        pipe.atomic();
                    }
                    self.apply_update(op.id, delta, op.namespace, op.position)
                        .await
                        .map_err(|error| BulkApplyError { applied, error })?;
                    applied += 1;
                    continue;
                }

                if let Err(error) = self.queue(&mut pipe, &op) {
                    // Everything queued before the bad document still goes in.
                    if queued > 0 {
                        self.exec(&pipe)
                            .await
                            .map_err(|error| BulkApplyError { applied, error })?;
                        applied += queued;
                    }
                    return Err(BulkApplyError { applied, error });
                }
                queued += 1;
            }

            if queued > 0 {
                self.exec(&pipe)
                    .await
                    .map_err(|error| BulkApplyError { applied, error })?;
                applied += queued;
            }
            debug!(target_id = %self.name, total, applied, "Bulk applied");
            Ok(())
        })
    }

    fn commit(&self) -> BoxFuture<'_, ()> {
        // Every pipeline is acknowledged by the server before it returns.
        Box::pin(async { Ok(()) })
    }

    fn last_applied_position(&self, namespace: &str) -> BoxFuture<'_, Option<Position>> {
        let namespace = namespace.to_string();
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let raw: Option<String> = ::redis::cmd("HGET")
                .arg(self.positions_key())
                .arg(&namespace)
                .query_async(&mut conn)
                .await
                .map_err(redis_error)?;
            raw.map(|s| {
                s.parse::<Position>()
                    .map_err(|e| AdapterError::other(format!("bad stored position {:?}: {}", s, e.0)))
            })
            .transpose()
        })
    }

    fn stop(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            info!(target_id = %self.name, "Closed Redis target");
            Ok(())
        })
    }
}
