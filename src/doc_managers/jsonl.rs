// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! JSON-lines document manager.
//!
//! Appends one JSON record per write to a file:
//!
//! ```text
//! {"op":"upsert","ns":"shop.orders","position":"12-0","id":7,"doc":{"_id":7,"total":3}}
//! {"op":"update","ns":"shop.orders","position":"13-0","id":7,"set":{"total":4},"unset":[]}
//! {"op":"remove","ns":"shop.orders","position":"14-0","id":7}
//! ```
//!
//! Writes are buffered; `commit` flushes the buffer and syncs the file.
//! Per-namespace positions are rebuilt by scanning the file on open.

use crate::doc_manager::{AdapterError, AdapterResult, BoxFuture, DocManager};
use crate::error::Result;
use crate::oplog::{Delta, Document, Position};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Serialize)]
struct Record<'a> {
    op: &'static str,
    ns: &'a str,
    position: Position,
    id: &'a Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    doc: Option<&'a Document>,
    #[serde(skip_serializing_if = "Option::is_none")]
    set: Option<&'a Document>,
    #[serde(skip_serializing_if = "Option::is_none")]
    unset: Option<&'a [String]>,
}

#[derive(Deserialize)]
struct RecordHeader {
    ns: String,
    position: Position,
}

struct Inner {
    writer: BufWriter<File>,
    positions: BTreeMap<String, Position>,
}

/// Document manager writing an append-only JSON-lines file.
pub struct JsonLinesDocManager {
    name: String,
    path: PathBuf,
    unique_key: String,
    inner: Mutex<Inner>,
}

impl JsonLinesDocManager {
    /// Open (or create) the output file.
    pub async fn open(name: &str, path: impl Into<PathBuf>, unique_key: &str) -> Result<Self> {
        let path = path.into();
        let (positions, torn) = scan_positions(&path).await?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        if torn {
            // Terminate a torn final record so the next one starts on its own line.
            file.write_all(b"\n").await?;
        }

        info!(
            target_id = %name,
            path = %path.display(),
            namespaces = positions.len(),
            "Opened JSON-lines target"
        );

        Ok(Self {
            name: name.to_string(),
            path,
            unique_key: unique_key.to_string(),
            inner: Mutex::new(Inner {
                writer: BufWriter::new(file),
                positions,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, record: Record<'_>) -> AdapterResult<()> {
        let mut line = serde_json::to_vec(&record)
            .map_err(|e| AdapterError::invalid_document(e.to_string()))?;
        line.push(b'\n');

        let mut inner = self.inner.lock().await;
        inner.writer.write_all(&line).await.map_err(io_error)?;

        let latest = inner
            .positions
            .entry(record.ns.to_string())
            .or_insert(record.position);
        if record.position > *latest {
            *latest = record.position;
        }
        Ok(())
    }
}

/// Latest position per namespace recorded in an existing file, and whether
/// the file ends in an unterminated line.
async fn scan_positions(path: &Path) -> Result<(BTreeMap<String, Position>, bool)> {
    let mut positions = BTreeMap::new();
    let contents = match fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((positions, false)),
        Err(e) => return Err(e.into()),
    };
    let torn = !contents.is_empty() && !contents.ends_with('\n');

    for (lineno, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<RecordHeader>(line) {
            Ok(header) => {
                let latest = positions.entry(header.ns).or_insert(header.position);
                if header.position > *latest {
                    *latest = header.position;
                }
            }
            Err(e) => {
                warn!(
                    path = %path.display(),
                    line = lineno + 1,
                    error = %e,
                    "Ignoring unreadable record"
                );
            }
        }
    }
    Ok((positions, torn))
}

fn io_error(e: std::io::Error) -> AdapterError {
    use std::io::ErrorKind;
    match e.kind() {
        ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut => {
            AdapterError::connection(e.to_string())
        }
        ErrorKind::PermissionDenied => AdapterError::authentication(e.to_string()),
        _ => AdapterError::other(e.to_string()),
    }
}

impl DocManager for JsonLinesDocManager {
    fn name(&self) -> &str {
        &self.name
    }

    fn upsert(&self, doc: Document, namespace: String, position: Position) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let Some(id) = doc.get(&self.unique_key) else {
                return Err(AdapterError::invalid_document(format!(
                    "document has no {:?} field",
                    self.unique_key
                )));
            };
            self.append(Record {
                op: "upsert",
                ns: &namespace,
                position,
                id,
                doc: Some(&doc),
                set: None,
                unset: None,
            })
            .await
        })
    }

    fn update(
        &self,
        id: Value,
        delta: Delta,
        namespace: String,
        position: Position,
    ) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.append(Record {
                op: "update",
                ns: &namespace,
                position,
                id: &id,
                doc: None,
                set: Some(&delta.set),
                unset: Some(&delta.unset),
            })
            .await
        })
    }

    fn remove(&self, id: Value, namespace: String, position: Position) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.append(Record {
                op: "remove",
                ns: &namespace,
                position,
                id: &id,
                doc: None,
                set: None,
                unset: None,
            })
            .await
        })
    }

    fn commit(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut inner = self.inner.lock().await;
            inner.writer.flush().await.map_err(io_error)?;
            inner.writer.get_ref().sync_data().await.map_err(io_error)?;
            debug!(target_id = %self.name, "Committed JSON-lines target");
            Ok(())
        })
    }

    fn last_applied_position(&self, namespace: &str) -> BoxFuture<'_, Option<Position>> {
        let namespace = namespace.to_string();
        Box::pin(async move { Ok(self.inner.lock().await.positions.get(&namespace).copied()) })
    }

    fn stop(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut inner = self.inner.lock().await;
            inner.writer.flush().await.map_err(io_error)?;
            info!(target_id = %self.name, "Closed JSON-lines target");
            Ok(())
        })
    }
}
