// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Built-in document managers and the adapter registry.
//!
//! Adapters are selected by name in `docManagers[].docManager`. The set is
//! closed and resolved at compile time:
//!
//! | Name | Kind | Target |
//! |------|------|--------|
//! | `memory` | [`DocManagerKind::Memory`] | In-process collections (tests, embedding) |
//! | `jsonl`, `json_lines` | [`DocManagerKind::JsonLines`] | Append-only JSON-lines file at `targetURL` |
//! | `redis` | [`DocManagerKind::Redis`] | Redis server at `targetURL` |

pub mod jsonl;
pub mod memory;
pub mod redis;

use crate::config::TargetConfig;
use crate::doc_manager::DocManager;
use crate::error::{ConnectorError, Result};
use std::sync::Arc;
use tracing::info;

pub use jsonl::JsonLinesDocManager;
pub use memory::MemoryDocManager;
pub use self::redis::RedisDocManager;

/// Registered adapter kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocManagerKind {
    Memory,
    JsonLines,
    Redis,
}

impl DocManagerKind {
    /// Look up an adapter by its configured name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "memory" => Some(Self::Memory),
            "jsonl" | "json_lines" => Some(Self::JsonLines),
            "redis" => Some(Self::Redis),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::JsonLines => "jsonl",
            Self::Redis => "redis",
        }
    }

    /// Whether `targetURL` must be set.
    pub fn requires_url(&self) -> bool {
        !matches!(self, Self::Memory)
    }
}

impl std::fmt::Display for DocManagerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Construct the adapter for a validated target.
pub async fn build(target: &TargetConfig) -> Result<Arc<dyn DocManager>> {
    let url = || {
        target.url.clone().ok_or_else(|| {
            ConnectorError::config(format!("docManagers.{}.targetURL", target.id), "missing")
        })
    };

    let manager: Arc<dyn DocManager> = match target.kind {
        DocManagerKind::Memory => Arc::new(
            MemoryDocManager::new(&target.id).with_unique_key(&target.unique_key),
        ),
        DocManagerKind::JsonLines => Arc::new(
            JsonLinesDocManager::open(&target.id, url()?, &target.unique_key).await?,
        ),
        DocManagerKind::Redis => Arc::new(
            RedisDocManager::connect(
                &target.id,
                &url()?,
                &target.unique_key,
                target.index_category.as_deref(),
            )
            .await?,
        ),
    };

    info!(
        target_id = %target.id,
        kind = %target.kind,
        "Document manager ready"
    );
    Ok(manager)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectorConfig, DocManagerConfig};
    use tempfile::tempdir;

    #[test]
    fn test_kind_from_name() {
        assert_eq!(DocManagerKind::from_name("memory"), Some(DocManagerKind::Memory));
        assert_eq!(DocManagerKind::from_name("jsonl"), Some(DocManagerKind::JsonLines));
        assert_eq!(DocManagerKind::from_name("json_lines"), Some(DocManagerKind::JsonLines));
        assert_eq!(DocManagerKind::from_name("redis"), Some(DocManagerKind::Redis));
        assert_eq!(DocManagerKind::from_name("solr"), None);
    }

    #[test]
    fn test_requires_url() {
        assert!(!DocManagerKind::Memory.requires_url());
        assert!(DocManagerKind::JsonLines.requires_url());
        assert!(DocManagerKind::Redis.requires_url());
    }

    #[tokio::test]
    async fn test_build_memory_and_jsonl() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("out.jsonl");

        let mut jsonl = DocManagerConfig::for_testing_with_id("jsonl", "file");
        jsonl.target_url = Some(out.display().to_string());

        let config = ConnectorConfig {
            doc_managers: vec![DocManagerConfig::for_testing_with_id("memory", "mem"), jsonl],
            ..ConnectorConfig::for_testing(&dir.path().join("ckpt").display().to_string())
        }
        .validate()
        .unwrap();

        let mem = build(&config.targets[0]).await.unwrap();
        assert_eq!(mem.name(), "mem");
        let file = build(&config.targets[1]).await.unwrap();
        assert_eq!(file.name(), "file");
        assert!(out.exists());
    }
}
