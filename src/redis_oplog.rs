// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Oplog source backed by a Redis stream.
//!
//! # Layout
//!
//! - Stream `oplog`: one entry per operation, with fields
//!   - `ns`: namespace (`database.collection`)
//!   - `op`: `i`, `u` or `d`
//!   - `id`: document id as JSON
//!   - `doc`: JSON payload (the document for inserts, the update
//!     specification for updates, absent for deletes)
//! - Hash `coll:{ns}`: current contents of a collection, id → JSON document
//!
//! Stream IDs (`<ms>-<seq>`) are the positions. The stream may be trimmed
//! with `XTRIM`.
//!
//! # Reading
//!
//! Reads use `XRANGE` starting *at* the read position, which returns backlog
//! without blocking. The read position's own entry comes back first and is
//! dropped; when it is missing and the stream's oldest entry is newer, the
//! read fails with a history gap. Only when nothing is pending does the
//! source wait on `XREAD BLOCK` for new entries, then reads the range again.

use crate::error::{ConnectorError, Result};
use crate::oplog::{
    ensure_retained, id_string, ChangeEvent, Delta, Document, Operation, OplogSource, Payload, Position,
    SourceFuture, ID_FIELD,
};
use ::redis::aio::ConnectionManager;
use ::redis::streams::{StreamReadOptions, StreamReadReply};
use ::redis::{AsyncCommands, Client};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, trace};

/// Default stream key.
pub const DEFAULT_STREAM_KEY: &str = "oplog";

const COLLECTION_PREFIX: &str = "coll:";

/// Oplog source reading a Redis stream.
pub struct RedisOplog {
    name: String,
    stream_key: String,
    conn: ConnectionManager,
}

impl RedisOplog {
    /// Connect to the server at `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url).map_err(|e| ConnectorError::redis(url, e))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| ConnectorError::redis(url, e))?;
        info!(url = %url, stream = DEFAULT_STREAM_KEY, "Connected to Redis oplog");

        Ok(Self {
            name: url.to_string(),
            stream_key: DEFAULT_STREAM_KEY.to_string(),
            conn,
        })
    }

    /// Read a different stream key.
    pub fn with_stream_key(mut self, stream_key: impl Into<String>) -> Self {
        self.stream_key = stream_key.into();
        self
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    fn redis_err(&self, e: ::redis::RedisError) -> ConnectorError {
        ConnectorError::redis(&self.name, e)
    }

    /// Log an operation and apply it to the collection snapshot in one
    /// transaction. Returns the assigned position.
    ///
    /// This is the writer side, used by tests and by embedders that feed
    /// the stream themselves.
    pub async fn append(
        &self,
        namespace: &str,
        op: Operation,
        id: &Value,
        payload: &Payload,
    ) -> Result<Position> {
        let mut conn = self.conn.clone();
        let collection = collection_key(namespace);
        let field = id_string(id);

        // Snapshot value after the operation; `None` deletes it.
        let snapshot = match payload {
            Payload::Document(doc) => {
                let mut doc = doc.clone();
                doc.insert(ID_FIELD.to_string(), id.clone());
                Some(doc)
            }
            Payload::Delta(delta) => {
                let current: Option<String> = conn
                    .hget(&collection, &field)
                    .await
                    .map_err(|e| self.redis_err(e))?;
                match current {
                    Some(raw) => {
                        let mut doc = parse_document(&raw)?;
                        delta.apply_to(&mut doc);
                        Some(doc)
                    }
                    None => None,
                }
            }
            Payload::None => None,
        };

        let mut fields: Vec<(&str, String)> = vec![
            ("ns", namespace.to_string()),
            ("op", op.code().to_string()),
            ("id", serde_json::to_string(id)?),
        ];
        if let Some(doc) = encode_payload(payload) {
            fields.push(("doc", serde_json::to_string(&doc)?));
        }

        let mut pipe = ::redis::pipe();
        pipe.atomic();
        pipe.cmd("XADD").arg(&self.stream_key).arg("*");
        for (name, value) in &fields {
            pipe.arg(*name).arg(value);
        }
        match (&snapshot, op) {
            (_, Operation::Delete) => {
                pipe.cmd("HDEL").arg(&collection).arg(&field).ignore();
            }
            (Some(doc), _) => {
                pipe.cmd("HSET")
                    .arg(&collection)
                    .arg(&field)
                    .arg(serde_json::to_string(doc)?)
                    .ignore();
            }
            (None, _) => {}
        }

        let (stream_id,): (String,) = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| self.redis_err(e))?;
        parse_stream_id(&stream_id)
    }

    pub async fn insert(&self, namespace: &str, doc: Value) -> Result<Position> {
        let Value::Object(doc) = doc else {
            return Err(ConnectorError::Internal("insert needs a JSON object".to_string()));
        };
        let id = doc.get(ID_FIELD).cloned().unwrap_or(Value::Null);
        self.append(namespace, Operation::Insert, &id, &Payload::Document(doc))
            .await
    }

    /// Update with an operator document (`$set`/`$unset`) or a replacement.
    pub async fn update(&self, namespace: &str, id: Value, spec: Value) -> Result<Position> {
        let Value::Object(spec) = spec else {
            return Err(ConnectorError::Internal("update needs a JSON object".to_string()));
        };
        self.append(namespace, Operation::Update, &id, &Payload::from_update(spec))
            .await
    }

    pub async fn delete(&self, namespace: &str, id: Value) -> Result<Position> {
        self.append(namespace, Operation::Delete, &id, &Payload::None)
            .await
    }

    /// Trim the stream so it starts at `position` (capped-log rollover).
    pub async fn trim_before(&self, position: Position) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = ::redis::cmd("XTRIM")
            .arg(&self.stream_key)
            .arg("MINID")
            .arg(position.to_string())
            .query_async(&mut conn)
            .await
            .map_err(|e| self.redis_err(e))?;
        Ok(())
    }

    async fn edge_position(&self, command: &str, from: &str, to: &str) -> Result<Option<Position>> {
        let mut conn = self.conn.clone();
        let result: Vec<(String, HashMap<String, String>)> = ::redis::cmd(command)
            .arg(&self.stream_key)
            .arg(from)
            .arg(to)
            .arg("COUNT")
            .arg(1)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.redis_err(e))?;
        result.first().map(|(id, _)| parse_stream_id(id)).transpose()
    }

    /// Non-blocking read of the backlog after `after`.
    async fn read_range(&self, after: Position, limit: usize) -> Result<Vec<ChangeEvent>> {
        let start = if after.is_zero() {
            "-".to_string()
        } else {
            after.to_string()
        };

        let mut conn = self.conn.clone();
        let entries: Vec<(String, HashMap<String, String>)> = ::redis::cmd("XRANGE")
            .arg(&self.stream_key)
            .arg(&start)
            .arg("+")
            .arg("COUNT")
            .arg(limit + 1)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.redis_err(e))?;

        let mut events = entries
            .iter()
            .map(|(id, fields)| parse_entry(id, fields))
            .collect::<Result<Vec<_>>>()?;

        if !after.is_zero() {
            match events.first().map(|e| e.position) {
                Some(first) if first == after => {
                    events.remove(0);
                }
                Some(_) => {
                    // The read position's entry is gone.
                    let oldest = self.edge_position("XRANGE", "-", "+").await?;
                    ensure_retained(after, oldest)?;
                }
                None => {}
            }
        }
        events.truncate(limit);
        Ok(events)
    }

    /// Block until an entry after `after` arrives. Returns whether one did.
    async fn wait_for_entries(&self, after: Position, timeout: Duration) -> Result<bool> {
        let opts = StreamReadOptions::default()
            .block(timeout.as_millis().max(1) as usize)
            .count(1);
        let cursor = after.to_string();

        let mut conn = self.conn.clone();
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&self.stream_key], &[&cursor], &opts)
            .await
            .map_err(|e| self.redis_err(e))?;

        Ok(reply.is_some_and(|r| r.keys.iter().any(|k| !k.ids.is_empty())))
    }
}

impl OplogSource for RedisOplog {
    fn name(&self) -> &str {
        &self.name
    }

    fn oldest_position(&self) -> SourceFuture<'_, Option<Position>> {
        Box::pin(async move { self.edge_position("XRANGE", "-", "+").await })
    }

    fn latest_position(&self) -> SourceFuture<'_, Option<Position>> {
        Box::pin(async move { self.edge_position("XREVRANGE", "+", "-").await })
    }

    fn read_after(
        &self,
        after: Position,
        limit: usize,
        timeout: Duration,
    ) -> SourceFuture<'_, Vec<ChangeEvent>> {
        Box::pin(async move {
            let events = self.read_range(after, limit).await?;
            if !events.is_empty() || timeout.is_zero() {
                return Ok(events);
            }
            if !self.wait_for_entries(after, timeout).await? {
                return Ok(events);
            }
            let events = self.read_range(after, limit).await?;
            if !events.is_empty() {
                trace!(
                    count = events.len(),
                    first = %events[0].position,
                    "Read oplog entries after blocking"
                );
            }
            Ok(events)
        })
    }

    fn namespaces(&self) -> SourceFuture<'_, Vec<String>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let pattern = format!("{}*", COLLECTION_PREFIX);
            let mut cursor: u64 = 0;
            let mut namespaces = Vec::new();
            loop {
                let (next, keys): (u64, Vec<String>) = ::redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(100)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| self.redis_err(e))?;
                namespaces.extend(
                    keys.iter()
                        .filter_map(|k| k.strip_prefix(COLLECTION_PREFIX))
                        .map(str::to_string),
                );
                if next == 0 {
                    break;
                }
                cursor = next;
            }
            namespaces.sort();
            namespaces.dedup();
            Ok(namespaces)
        })
    }

    fn scan(&self, namespace: &str) -> SourceFuture<'_, Vec<Document>> {
        let key = collection_key(namespace);
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let raw: HashMap<String, String> = conn.hgetall(&key).await.map_err(|e| self.redis_err(e))?;
            raw.values().map(|v| parse_document(v)).collect()
        })
    }
}

fn collection_key(namespace: &str) -> String {
    format!("{}{}", COLLECTION_PREFIX, namespace)
}

/// Stream ID to position.
pub fn parse_stream_id(id: &str) -> Result<Position> {
    id.parse::<Position>()
        .map_err(|e| ConnectorError::Internal(format!("bad stream id {:?}: {}", id, e.0)))
}

fn parse_document(raw: &str) -> Result<Document> {
    match serde_json::from_str(raw)? {
        Value::Object(doc) => Ok(doc),
        other => Err(ConnectorError::Internal(format!(
            "expected a JSON document, got {}",
            other
        ))),
    }
}

/// Decode one stream entry.
///
/// A malformed entry is an error rather than skipped: skipping would let
/// the checkpoint move past an operation that was never applied.
pub fn parse_entry(stream_id: &str, fields: &HashMap<String, String>) -> Result<ChangeEvent> {
    let position = parse_stream_id(stream_id)?;
    let field = |name: &str| {
        fields.get(name).ok_or_else(|| {
            ConnectorError::Internal(format!("oplog entry {} has no {:?} field", stream_id, name))
        })
    };

    let namespace = field("ns")?.clone();
    let op_code = field("op")?;
    let op = Operation::from_code(op_code).ok_or_else(|| {
        ConnectorError::Internal(format!("oplog entry {} has unknown op {:?}", stream_id, op_code))
    })?;
    let document_id: Value = serde_json::from_str(field("id")?)?;

    let payload = match op {
        Operation::Delete => Payload::None,
        Operation::Insert => Payload::Document(parse_document(field("doc")?)?),
        Operation::Update => Payload::from_update(parse_document(field("doc")?)?),
    };

    Ok(ChangeEvent {
        position,
        namespace,
        op,
        document_id,
        payload,
    })
}

/// Encode a payload for the `doc` field.
fn encode_payload(payload: &Payload) -> Option<Value> {
    match payload {
        Payload::Document(doc) => Some(Value::Object(doc.clone())),
        Payload::Delta(Delta { set, unset }) => {
            let mut spec = Document::new();
            if !set.is_empty() {
                spec.insert("$set".to_string(), Value::Object(set.clone()));
            }
            if !unset.is_empty() {
                let unset: Document = unset.iter().map(|k| (k.clone(), json!(1))).collect();
                spec.insert("$unset".to_string(), Value::Object(unset));
            }
            Some(Value::Object(spec))
        }
        Payload::None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_insert_entry() {
        let event = parse_entry(
            "1700000000000-2",
            &fields(&[("ns", "shop.orders"), ("op", "i"), ("id", "7"), ("doc", r#"{"_id":7,"total":3}"#)]),
        )
        .unwrap();
        assert_eq!(event.position, Position::new(1_700_000_000_000, 2));
        assert_eq!(event.namespace, "shop.orders");
        assert_eq!(event.op, Operation::Insert);
        assert_eq!(event.document_id, json!(7));
        assert_eq!(event.payload.document().unwrap()["total"], json!(3));
    }

    #[test]
    fn test_parse_update_entry_as_delta() {
        let event = parse_entry(
            "5-0",
            &fields(&[
                ("ns", "a.b"),
                ("op", "u"),
                ("id", r#""k""#),
                ("doc", r#"{"$set":{"x":1},"$unset":{"y":1}}"#),
            ]),
        )
        .unwrap();
        match event.payload {
            Payload::Delta(delta) => {
                assert_eq!(delta.set["x"], json!(1));
                assert_eq!(delta.unset, vec!["y".to_string()]);
            }
            other => panic!("expected delta, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_delete_entry() {
        let event = parse_entry("5-1", &fields(&[("ns", "a.b"), ("op", "d"), ("id", "1")])).unwrap();
        assert_eq!(event.op, Operation::Delete);
        assert_eq!(event.payload, Payload::None);
    }

    #[test]
    fn test_malformed_entries_rejected() {
        assert!(parse_entry("x", &fields(&[("ns", "a.b"), ("op", "d"), ("id", "1")])).is_err());
        assert!(parse_entry("1-0", &fields(&[("op", "d"), ("id", "1")])).is_err());
        assert!(parse_entry("1-0", &fields(&[("ns", "a.b"), ("op", "z"), ("id", "1")])).is_err());
        assert!(parse_entry("1-0", &fields(&[("ns", "a.b"), ("op", "i"), ("id", "1")])).is_err());
        assert!(
            parse_entry("1-0", &fields(&[("ns", "a.b"), ("op", "i"), ("id", "1"), ("doc", "[1]")])).is_err()
        );
    }

    #[test]
    fn test_encode_delta_round_trips_through_update_parser() {
        let mut set = Document::new();
        set.insert("a.b".into(), json!(2));
        let delta = Delta {
            set,
            unset: vec!["c".into()],
        };
        let Some(Value::Object(spec)) = encode_payload(&Payload::Delta(delta.clone())) else {
            panic!("expected an object");
        };
        assert_eq!(Payload::from_update(spec), Payload::Delta(delta));
        assert_eq!(encode_payload(&Payload::None), None);
    }
}
