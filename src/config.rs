// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the connector.
//!
//! The configuration file is JSON with camelCase keys. It is parsed once,
//! validated once, and the resulting [`ValidatedConfig`] is shared by `Arc`
//! with every component. Nothing re-reads or mutates it afterwards.
//!
//! # Quick Start
//!
//! ```rust
//! use oplog_connector::config::{ConnectorConfig, DocManagerConfig};
//!
//! let config = ConnectorConfig {
//!     doc_managers: vec![DocManagerConfig::for_testing("memory")],
//!     ..Default::default()
//! };
//! let validated = config.validate().expect("valid config");
//! assert_eq!(validated.targets.len(), 1);
//! ```
//!
//! # JSON Example
//!
//! ```json
//! {
//!   "mainAddress": "redis://source:6379",
//!   "oplogFile": "/var/lib/connector/oplog.timestamp",
//!   "batchSize": -1,
//!   "continueOnError": false,
//!   "namespaces": {
//!     "include": ["shop.*"],
//!     "mapping": {"shop.orders": "archive.orders"},
//!     "gridfs": ["shop.fs"]
//!   },
//!   "fields": {"exclude": ["secret"]},
//!   "docManagers": [
//!     {"docManager": "jsonl", "targetURL": "/var/lib/connector/out.jsonl", "autoCommitInterval": 0}
//!   ],
//!   "__comment": "keys starting with __ are ignored"
//! }
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ConnectorConfig
//! ├── mainAddress / oplogFile       # source endpoint, checkpoint file
//! ├── initialImport: { dump, query }
//! ├── batchSize (n | -1), batchIdleTimeout
//! ├── continueOnError, haltMode, maxApplyRetries
//! ├── maxQueuedBatches, readLimit, readTimeout
//! ├── checkpointInterval, largeObjectWait
//! ├── namespaces: { include | exclude, mapping, gridfs }
//! ├── fields: { include | exclude }
//! ├── docManagers[]                 # one per target
//! └── authentication / __ssl / logging / verbosity (not used by the core)
//! ```

use crate::doc_managers::DocManagerKind;
use crate::error::{ConnectorError, Result};
use crate::formatter::FormatterKind;
use crate::namespace::NamespaceRouter;
use crate::projection::FieldProjection;
use crate::query::Query;
use crate::resilience::RetryConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// BatchSize: bounded count or unbounded (idle flush)
// ═══════════════════════════════════════════════════════════════════════════════

/// Maximum events per batch.
///
/// Serialized as an integer: a positive count, or `-1` for [`BatchSize::Unbounded`]
/// (flush on idle timeout or at an explicit boundary).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum BatchSize {
    Bounded(NonZeroUsize),
    Unbounded,
}

impl BatchSize {
    pub fn bounded(n: usize) -> Option<Self> {
        NonZeroUsize::new(n).map(BatchSize::Bounded)
    }

    /// The bound, `None` when unbounded.
    pub fn limit(&self) -> Option<usize> {
        match self {
            BatchSize::Bounded(n) => Some(n.get()),
            BatchSize::Unbounded => None,
        }
    }
}

impl Default for BatchSize {
    fn default() -> Self {
        BatchSize::Unbounded
    }
}

impl TryFrom<i64> for BatchSize {
    type Error = String;

    fn try_from(value: i64) -> std::result::Result<Self, Self::Error> {
        if value == -1 {
            return Ok(BatchSize::Unbounded);
        }
        usize::try_from(value)
            .ok()
            .and_then(BatchSize::bounded)
            .ok_or_else(|| format!("batchSize must be a positive integer or -1, got {}", value))
    }
}

impl From<BatchSize> for i64 {
    fn from(size: BatchSize) -> Self {
        match size {
            BatchSize::Bounded(n) => n.get() as i64,
            BatchSize::Unbounded => -1,
        }
    }
}

/// What the connector does when an apply failure is fatal for a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HaltMode {
    /// Stop the connector; `run` returns the error.
    #[default]
    Exit,
    /// Keep retrying the failed event until it succeeds or shutdown.
    Block,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The configuration file, as parsed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorConfig {
    /// Source connection endpoint.
    #[serde(default = "default_main_address")]
    pub main_address: String,

    /// Path to the persisted checkpoint.
    #[serde(default = "default_oplog_file")]
    pub oplog_file: String,

    #[serde(default)]
    pub initial_import: InitialImportConfig,

    /// Max events per batch; `-1` = unbounded (idle flush).
    #[serde(default)]
    pub batch_size: BatchSize,

    /// Idle time after which a partial batch is flushed (e.g. "1s").
    #[serde(default = "default_batch_idle_timeout")]
    pub batch_idle_timeout: String,

    /// Skip (and log) events an adapter rejects instead of halting.
    #[serde(default)]
    pub continue_on_error: bool,

    #[serde(default)]
    pub halt_mode: HaltMode,

    /// Attempts for transient adapter failures before the policy applies.
    #[serde(default = "default_max_apply_retries")]
    pub max_apply_retries: usize,

    /// Per-target queue capacity, in batches.
    #[serde(default = "default_max_queued_batches")]
    pub max_queued_batches: usize,

    /// Max events per source read.
    #[serde(default = "default_read_limit")]
    pub read_limit: usize,

    /// How long a read blocks waiting for new entries (e.g. "1s").
    #[serde(default = "default_read_timeout")]
    pub read_timeout: String,

    /// How often acknowledged positions are flushed to the checkpoint file.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: String,

    /// How long a large-object metadata document waits for its chunks before
    /// the source is probed.
    #[serde(default = "default_large_object_wait")]
    pub large_object_wait: String,

    #[serde(default)]
    pub namespaces: NamespaceConfig,

    #[serde(default)]
    pub fields: FieldsConfig,

    /// Targets, in order.
    #[serde(default)]
    pub doc_managers: Vec<DocManagerConfig>,

    /// Consumed by the connection layer only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<Value>,

    /// Consumed by the embedding daemon only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verbosity: Option<Value>,

    /// Everything else. Only `__`-prefixed keys (comments, `__ssl`) are allowed.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

fn default_main_address() -> String {
    "redis://localhost:6379".to_string()
}

fn default_oplog_file() -> String {
    "oplog.timestamp".to_string()
}

fn default_batch_idle_timeout() -> String {
    "1s".to_string()
}

fn default_max_apply_retries() -> usize {
    5
}

fn default_max_queued_batches() -> usize {
    16
}

fn default_read_limit() -> usize {
    500
}

fn default_read_timeout() -> String {
    "1s".to_string()
}

fn default_checkpoint_interval() -> String {
    "5s".to_string()
}

fn default_large_object_wait() -> String {
    "30s".to_string()
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            main_address: default_main_address(),
            oplog_file: default_oplog_file(),
            initial_import: InitialImportConfig::default(),
            batch_size: BatchSize::default(),
            batch_idle_timeout: default_batch_idle_timeout(),
            continue_on_error: false,
            halt_mode: HaltMode::default(),
            max_apply_retries: default_max_apply_retries(),
            max_queued_batches: default_max_queued_batches(),
            read_limit: default_read_limit(),
            read_timeout: default_read_timeout(),
            checkpoint_interval: default_checkpoint_interval(),
            large_object_wait: default_large_object_wait(),
            namespaces: NamespaceConfig::default(),
            fields: FieldsConfig::default(),
            doc_managers: Vec::new(),
            authentication: None,
            logging: None,
            verbosity: None,
            extra: BTreeMap::new(),
        }
    }
}

impl ConnectorConfig {
    /// Config with one in-memory target, a checkpoint file at `oplog_file`
    /// and short timeouts, for tests.
    pub fn for_testing(oplog_file: &str) -> Self {
        Self {
            oplog_file: oplog_file.to_string(),
            batch_idle_timeout: "20ms".to_string(),
            read_timeout: "20ms".to_string(),
            checkpoint_interval: "50ms".to_string(),
            large_object_wait: "200ms".to_string(),
            max_apply_retries: 2,
            doc_managers: vec![DocManagerConfig::for_testing("memory")],
            ..Default::default()
        }
    }

    /// Parse a JSON configuration.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| ConnectorError::config("config", e.to_string()))
    }

    /// Read and parse a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            ConnectorError::config("config", format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    /// Validate the whole configuration, failing on the first offending field.
    pub fn validate(self) -> Result<ValidatedConfig> {
        if let Some(key) = self.extra.keys().find(|k| !k.starts_with("__")) {
            return Err(ConnectorError::config(key.clone(), "unknown option"));
        }

        // Each component validates its own section by compiling it.
        NamespaceRouter::new(&self.namespaces)?;
        FieldProjection::from_config(&self.fields)?;
        if let Some(query) = &self.initial_import.query {
            Query::parse(query)?;
        }

        if self.oplog_file.trim().is_empty() {
            return Err(ConnectorError::config("oplogFile", "must not be empty"));
        }
        if self.max_queued_batches == 0 {
            return Err(ConnectorError::config("maxQueuedBatches", "must be at least 1"));
        }
        if self.read_limit == 0 {
            return Err(ConnectorError::config("readLimit", "must be at least 1"));
        }
        if self.max_apply_retries == 0 {
            return Err(ConnectorError::config("maxApplyRetries", "must be at least 1"));
        }

        let batch_idle_timeout = parse_duration("batchIdleTimeout", &self.batch_idle_timeout)?;
        let read_timeout = parse_duration("readTimeout", &self.read_timeout)?;
        let checkpoint_interval = parse_duration("checkpointInterval", &self.checkpoint_interval)?;
        let large_object_wait = parse_duration("largeObjectWait", &self.large_object_wait)?;

        if self.doc_managers.is_empty() {
            return Err(ConnectorError::config(
                "docManagers",
                "at least one target must be configured",
            ));
        }

        let mut targets = Vec::with_capacity(self.doc_managers.len());
        let mut seen = HashSet::new();
        for (index, dm) in self.doc_managers.iter().enumerate() {
            let target = dm.resolve(index, self.continue_on_error)?;
            if !seen.insert(target.id.clone()) {
                return Err(ConnectorError::config(
                    format!("docManagers[{}].id", index),
                    format!("duplicate target id {:?}", target.id),
                ));
            }
            targets.push(Arc::new(target));
        }

        Ok(ValidatedConfig {
            batch_idle_timeout,
            read_timeout,
            checkpoint_interval,
            large_object_wait,
            targets,
            config: self,
        })
    }
}

fn parse_duration(field: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value)
        .map_err(|e| ConnectorError::config(field, format!("invalid duration {:?}: {}", value, e)))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Sections
// ═══════════════════════════════════════════════════════════════════════════════

/// Initial import settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitialImportConfig {
    /// Force a full copy before tailing, even when a checkpoint exists.
    #[serde(default)]
    pub dump: bool,

    /// Predicate restricting which documents are copied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<Value>,
}

/// Namespace filtering, renaming and large-object pairs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NamespaceConfig {
    /// Allow-list (wildcards allowed). Empty = everything.
    #[serde(default)]
    pub include: Vec<String>,

    /// Deny-list. Mutually exclusive with `include`.
    #[serde(default)]
    pub exclude: Vec<String>,

    /// Source → target name map. Unmapped namespaces keep their name.
    #[serde(default)]
    pub mapping: BTreeMap<String, String>,

    /// Large-object bases: `db.fs` covers `db.fs.files` and `db.fs.chunks`.
    #[serde(default)]
    pub gridfs: Vec<String>,
}

/// Field projection. At most one of the two lists may be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldsConfig {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// DocManagerConfig: one entry per target
// ═══════════════════════════════════════════════════════════════════════════════

/// A `docManagers[]` entry as written in the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocManagerConfig {
    /// Adapter kind (`memory`, `jsonl`, `redis`).
    pub doc_manager: String,

    /// Target id for logs and the checkpoint. Defaults to `<kind>-<index>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, rename = "targetURL", skip_serializing_if = "Option::is_none")]
    pub target_url: Option<String>,

    /// Max documents per bulk request.
    #[serde(default = "default_bulk_size")]
    pub bulk_size: usize,

    /// Identifier field at the target.
    #[serde(default = "default_unique_key")]
    pub unique_key: String,

    /// Seconds between explicit commits. `0` = after every batch, absent =
    /// only at shutdown.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_commit_interval: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_category: Option<String>,

    /// Overrides the global `continueOnError` for this target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continue_on_error: Option<bool>,

    #[serde(default)]
    pub formatter: FormatterKind,
}

fn default_bulk_size() -> usize {
    1000
}

fn default_unique_key() -> String {
    crate::oplog::ID_FIELD.to_string()
}

impl DocManagerConfig {
    /// Create a target config for testing.
    pub fn for_testing(kind: &str) -> Self {
        Self {
            doc_manager: kind.to_string(),
            id: None,
            target_url: None,
            bulk_size: default_bulk_size(),
            unique_key: default_unique_key(),
            auto_commit_interval: Some(0),
            index_category: None,
            continue_on_error: None,
            formatter: FormatterKind::None,
        }
    }

    /// Same, with an explicit target id.
    pub fn for_testing_with_id(kind: &str, id: &str) -> Self {
        Self {
            id: Some(id.to_string()),
            ..Self::for_testing(kind)
        }
    }

    fn resolve(&self, index: usize, global_continue_on_error: bool) -> Result<TargetConfig> {
        let field = |name: &str| format!("docManagers[{}].{}", index, name);

        let kind = DocManagerKind::from_name(&self.doc_manager).ok_or_else(|| {
            ConnectorError::config(
                field("docManager"),
                format!("unknown adapter kind {:?}", self.doc_manager),
            )
        })?;

        if self.bulk_size == 0 {
            return Err(ConnectorError::config(field("bulkSize"), "must be at least 1"));
        }
        if self.unique_key.is_empty() {
            return Err(ConnectorError::config(field("uniqueKey"), "must not be empty"));
        }
        if kind.requires_url() && self.target_url.is_none() {
            return Err(ConnectorError::config(
                field("targetURL"),
                format!("required for adapter kind {:?}", self.doc_manager),
            ));
        }

        let auto_commit = match self.auto_commit_interval {
            None => AutoCommit::OnShutdown,
            Some(0) => AutoCommit::EveryBatch,
            Some(secs) => AutoCommit::Every(Duration::from_secs(secs)),
        };

        Ok(TargetConfig {
            id: self
                .id
                .clone()
                .unwrap_or_else(|| format!("{}-{}", self.doc_manager, index)),
            kind,
            url: self.target_url.clone(),
            bulk_size: self.bulk_size,
            unique_key: self.unique_key.clone(),
            auto_commit,
            index_category: self.index_category.clone(),
            continue_on_error: self.continue_on_error.unwrap_or(global_continue_on_error),
            formatter: self.formatter,
        })
    }
}

/// When a target's adapter is asked to commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoCommit {
    /// After every applied batch.
    EveryBatch,
    /// When the interval has elapsed since the last commit.
    Every(Duration),
    /// Only when the connector stops.
    OnShutdown,
}

/// A validated target, immutable after startup.
#[derive(Debug, Clone)]
pub struct TargetConfig {
    pub id: String,
    pub kind: DocManagerKind,
    pub url: Option<String>,
    pub bulk_size: usize,
    pub unique_key: String,
    pub auto_commit: AutoCommit,
    pub index_category: Option<String>,
    pub continue_on_error: bool,
    pub formatter: FormatterKind,
}

// ═══════════════════════════════════════════════════════════════════════════════
// ValidatedConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration that passed validation, with parsed durations and targets.
#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    pub config: ConnectorConfig,
    pub batch_idle_timeout: Duration,
    pub read_timeout: Duration,
    pub checkpoint_interval: Duration,
    pub large_object_wait: Duration,
    /// Shared with the workers and the import.
    pub targets: Vec<Arc<TargetConfig>>,
}

impl std::ops::Deref for ValidatedConfig {
    type Target = ConnectorConfig;

    fn deref(&self) -> &ConnectorConfig {
        &self.config
    }
}

impl ValidatedConfig {
    /// Retry schedule for transient adapter failures.
    pub fn apply_retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_apply_retries,
            ..RetryConfig::apply()
        }
    }

    pub fn target(&self, id: &str) -> Option<&TargetConfig> {
        self.targets.iter().find(|t| t.id == id).map(Arc::as_ref)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
