// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Namespace routing.
//!
//! Decides, per source namespace (`database.collection`), whether its events
//! are replicated, under which target name, and whether the namespace is half
//! of a large-object pair.
//!
//! # Rules
//!
//! ```text
//! system namespace (db.system.*)        → dropped, always
//! exclude list matches                  → dropped
//! include list set and nothing matches  → dropped (unless a gridfs half)
//! mapping: exact entry, then wildcard   → renamed
//! otherwise                             → same name
//! ```
//!
//! Patterns may use `*` wildcards. A wildcard mapping substitutes the matched
//! text into the target pattern:
//!
//! ```text
//! "shop.*" → "archive.*"      shop.orders ⇒ archive.orders
//! ```

use crate::config::NamespaceConfig;
use crate::error::{ConnectorError, Result};
use crate::oplog::ChangeEvent;
use regex::Regex;
use std::collections::HashSet;

const FILES_SUFFIX: &str = ".files";
const CHUNKS_SUFFIX: &str = ".chunks";

/// How a routed namespace is treated downstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamespaceKind {
    Normal,
    /// `<base>.files`: metadata documents that must wait for their chunks.
    LargeObjectFiles { base: String },
    /// `<base>.chunks`: binary chunks.
    LargeObjectChunks { base: String },
}

impl NamespaceKind {
    pub fn is_large_object(&self) -> bool {
        !matches!(self, NamespaceKind::Normal)
    }
}

/// Why an event was not routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    System,
    Excluded,
    NotIncluded,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::System => "system",
            DropReason::Excluded => "excluded",
            DropReason::NotIncluded => "not_included",
        }
    }
}

/// Routing decision for one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Target { namespace: String, kind: NamespaceKind },
    Dropped(DropReason),
}

#[derive(Debug, Clone)]
struct Pattern {
    raw: String,
    regex: Regex,
}

impl Pattern {
    fn compile(field: &str, raw: &str) -> Result<Self> {
        if raw.is_empty() || !raw.contains('.') || raw.starts_with('.') {
            return Err(ConnectorError::config(
                field,
                format!("{:?} is not a database.collection namespace", raw),
            ));
        }
        let regex = glob_to_regex(raw)
            .map_err(|e| ConnectorError::config(field, format!("invalid pattern {:?}: {}", raw, e)))?;
        Ok(Self {
            raw: raw.to_string(),
            regex,
        })
    }

    fn is_wildcard(&self) -> bool {
        self.raw.contains('*')
    }

    fn matches(&self, namespace: &str) -> bool {
        self.regex.is_match(namespace)
    }

    /// Whether this pattern covers everything `other` could name.
    fn covers(&self, other: &str) -> bool {
        self.raw == other || self.regex.is_match(other)
    }
}

/// Each `*` becomes a capture group, so mappings can substitute it.
fn glob_to_regex(pattern: &str) -> std::result::Result<Regex, regex::Error> {
    let escaped = regex::escape(pattern);
    let regex_pattern = escaped.replace(r"\*", "(.*)");
    Regex::new(&format!("^{}$", regex_pattern))
}

#[derive(Debug, Clone)]
struct Mapping {
    source: Pattern,
    target: String,
}

impl Mapping {
    fn apply(&self, namespace: &str) -> Option<String> {
        if !self.source.is_wildcard() {
            return (self.source.raw == namespace).then(|| self.target.clone());
        }
        let captures = self.source.regex.captures(namespace)?;
        let matched = captures.get(1).map(|m| m.as_str()).unwrap_or("");
        Some(self.target.replacen('*', matched, 1))
    }
}

/// Compiled, immutable routing rules.
#[derive(Debug, Clone)]
pub struct NamespaceRouter {
    include: Vec<Pattern>,
    exclude: Vec<Pattern>,
    /// Exact mappings first, then wildcard mappings.
    mappings: Vec<Mapping>,
    gridfs: Vec<String>,
}

impl NamespaceRouter {
    /// Compile and validate the namespace section.
    pub fn new(config: &NamespaceConfig) -> Result<Self> {
        if !config.include.is_empty() && !config.exclude.is_empty() {
            return Err(ConnectorError::config(
                "namespaces",
                "include and exclude are mutually exclusive",
            ));
        }

        let include = config
            .include
            .iter()
            .map(|p| Pattern::compile("namespaces.include", p))
            .collect::<Result<Vec<_>>>()?;
        let exclude = config
            .exclude
            .iter()
            .map(|p| Pattern::compile("namespaces.exclude", p))
            .collect::<Result<Vec<_>>>()?;

        let mut exact = Vec::new();
        let mut wildcard = Vec::new();
        let mut targets = HashSet::new();
        for (source, target) in &config.mapping {
            let source_stars = source.matches('*').count();
            let target_stars = target.matches('*').count();
            if source_stars > 1 || source_stars != target_stars {
                return Err(ConnectorError::config(
                    "namespaces.mapping",
                    format!(
                        "{:?} → {:?}: source and target must both have one wildcard or none",
                        source, target
                    ),
                ));
            }
            if !target.contains('.') {
                return Err(ConnectorError::config(
                    "namespaces.mapping",
                    format!("{:?} is not a database.collection namespace", target),
                ));
            }
            if !targets.insert(target.as_str()) {
                return Err(ConnectorError::config(
                    "namespaces.mapping",
                    format!("more than one source is mapped to {:?}", target),
                ));
            }
            if exclude.iter().any(|e| e.covers(source)) {
                return Err(ConnectorError::config(
                    "namespaces.mapping",
                    format!("{:?} is both excluded and mapped", source),
                ));
            }

            let mapping = Mapping {
                source: Pattern::compile("namespaces.mapping", source)?,
                target: target.clone(),
            };
            if mapping.source.is_wildcard() {
                wildcard.push(mapping);
            } else {
                exact.push(mapping);
            }
        }

        let mut gridfs = Vec::with_capacity(config.gridfs.len());
        for base in &config.gridfs {
            if base.contains('*') || !base.contains('.') {
                return Err(ConnectorError::config(
                    "namespaces.gridfs",
                    format!("{:?} must be a literal database.bucket name", base),
                ));
            }
            let files = format!("{}{}", base, FILES_SUFFIX);
            if exclude.iter().any(|e| e.covers(base) || e.covers(&files)) {
                return Err(ConnectorError::config(
                    "namespaces.gridfs",
                    format!("{:?} is both excluded and listed as gridfs", base),
                ));
            }
            gridfs.push(base.clone());
        }

        exact.extend(wildcard);
        Ok(Self {
            include,
            exclude,
            mappings: exact,
            gridfs,
        })
    }

    /// Router that replicates everything under its own name.
    pub fn pass_through() -> Self {
        Self {
            include: Vec::new(),
            exclude: Vec::new(),
            mappings: Vec::new(),
            gridfs: Vec::new(),
        }
    }

    /// Route a source namespace.
    pub fn route(&self, namespace: &str) -> Route {
        if is_system_namespace(namespace) {
            return Route::Dropped(DropReason::System);
        }

        let kind = self.classify(namespace);

        if self.exclude.iter().any(|p| p.matches(namespace)) {
            return Route::Dropped(DropReason::Excluded);
        }
        if !self.include.is_empty()
            && kind == NamespaceKind::Normal
            && !self.include.iter().any(|p| p.matches(namespace))
        {
            return Route::Dropped(DropReason::NotIncluded);
        }

        Route::Target {
            namespace: self.target_name(namespace),
            kind,
        }
    }

    /// Route an event by its namespace.
    pub fn route_event(&self, event: &ChangeEvent) -> Route {
        self.route(&event.namespace)
    }

    fn target_name(&self, namespace: &str) -> String {
        self.mappings
            .iter()
            .find_map(|m| m.apply(namespace))
            .unwrap_or_else(|| namespace.to_string())
    }

    fn classify(&self, namespace: &str) -> NamespaceKind {
        for base in &self.gridfs {
            if let Some(rest) = namespace.strip_prefix(base.as_str()) {
                if rest == FILES_SUFFIX {
                    return NamespaceKind::LargeObjectFiles { base: base.clone() };
                }
                if rest == CHUNKS_SUFFIX {
                    return NamespaceKind::LargeObjectChunks { base: base.clone() };
                }
            }
        }
        NamespaceKind::Normal
    }

    /// Configured large-object bases.
    pub fn gridfs_bases(&self) -> &[String] {
        &self.gridfs
    }
}

/// Chunks namespace for a large-object base.
pub fn chunks_namespace(base: &str) -> String {
    format!("{}{}", base, CHUNKS_SUFFIX)
}

/// Metadata namespace for a large-object base.
pub fn files_namespace(base: &str) -> String {
    format!("{}{}", base, FILES_SUFFIX)
}

/// `db.system.*` collections are internal and never replicated.
pub fn is_system_namespace(namespace: &str) -> bool {
    namespace
        .split_once('.')
        .is_some_and(|(_, collection)| collection.starts_with("system."))
}
