// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Field projection.
//!
//! Applies an include-or-exclude field mask to documents and update deltas.
//! Field names may be dotted paths (`address.city`). Projection is pure and
//! idempotent: projecting twice gives the same result as projecting once.
//!
//! Include mode always keeps `_id`. An update whose delta becomes empty after
//! projection carries nothing for the target and is dropped.

use crate::config::FieldsConfig;
use crate::error::{ConnectorError, Result};
use crate::oplog::{remove_path, ChangeEvent, Delta, Document, Operation, Payload, ID_FIELD};
use serde_json::Value;

/// Projection mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectionMode {
    Include,
    Exclude,
}

/// Compiled field mask. An empty field list passes everything through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldProjection {
    mode: ProjectionMode,
    fields: Vec<String>,
}

impl FieldProjection {
    pub fn pass_through() -> Self {
        Self {
            mode: ProjectionMode::Exclude,
            fields: Vec::new(),
        }
    }

    pub fn include(fields: &[&str]) -> Self {
        Self {
            mode: ProjectionMode::Include,
            fields: fields.iter().map(|f| f.to_string()).collect(),
        }
    }

    pub fn exclude(fields: &[&str]) -> Self {
        Self {
            mode: ProjectionMode::Exclude,
            fields: fields.iter().map(|f| f.to_string()).collect(),
        }
    }

    /// Compile and validate the `fields` section.
    pub fn from_config(config: &FieldsConfig) -> Result<Self> {
        if !config.include.is_empty() && !config.exclude.is_empty() {
            return Err(ConnectorError::config(
                "fields",
                "include and exclude are mutually exclusive",
            ));
        }

        let (mode, fields, field) = if config.include.is_empty() {
            (ProjectionMode::Exclude, &config.exclude, "fields.exclude")
        } else {
            (ProjectionMode::Include, &config.include, "fields.include")
        };

        for name in fields {
            if name.is_empty() || name.split('.').any(str::is_empty) || name.starts_with('$') {
                return Err(ConnectorError::config(field, format!("invalid field name {:?}", name)));
            }
        }
        if mode == ProjectionMode::Exclude && fields.iter().any(|f| f == ID_FIELD) {
            return Err(ConnectorError::config(field, "_id cannot be excluded"));
        }

        Ok(Self {
            mode,
            fields: fields.clone(),
        })
    }

    pub fn mode(&self) -> ProjectionMode {
        self.mode
    }

    pub fn is_pass_through(&self) -> bool {
        self.fields.is_empty()
    }

    /// Project a full document.
    pub fn project_document(&self, doc: &Document) -> Document {
        if self.is_pass_through() {
            return doc.clone();
        }
        match self.mode {
            ProjectionMode::Include => {
                let fields: Vec<&str> = self.fields.iter().map(String::as_str).collect();
                let mut out = include_fields(doc, &fields);
                if let Some(id) = doc.get(ID_FIELD) {
                    out.insert(ID_FIELD.to_string(), id.clone());
                }
                out
            }
            ProjectionMode::Exclude => {
                let mut out = doc.clone();
                for field in &self.fields {
                    remove_path(&mut out, field);
                }
                out
            }
        }
    }

    /// Project an update delta. The result may be empty.
    pub fn project_delta(&self, delta: &Delta) -> Delta {
        if self.is_pass_through() {
            return delta.clone();
        }
        let mut out = Delta::default();

        for (path, value) in &delta.set {
            if path == ID_FIELD {
                out.set.insert(path.clone(), value.clone());
                continue;
            }
            match self.mode {
                ProjectionMode::Include => {
                    if self.fields.iter().any(|f| covers(f, path)) {
                        out.set.insert(path.clone(), value.clone());
                        continue;
                    }
                    let nested: Vec<&str> = self
                        .fields
                        .iter()
                        .filter_map(|f| below(f, path))
                        .collect();
                    if nested.is_empty() {
                        continue;
                    }
                    match value {
                        Value::Object(inner) => {
                            out.set
                                .insert(path.clone(), Value::Object(include_fields(inner, &nested)));
                        }
                        // Replacing the parent with a scalar removes every included child.
                        _ => out.unset.push(path.clone()),
                    }
                }
                ProjectionMode::Exclude => {
                    if self.fields.iter().any(|f| covers(f, path)) {
                        continue;
                    }
                    let mut value = value.clone();
                    if let Value::Object(inner) = &mut value {
                        for rel in self.fields.iter().filter_map(|f| below(f, path)) {
                            remove_path(inner, rel);
                        }
                    }
                    out.set.insert(path.clone(), value);
                }
            }
        }

        for path in &delta.unset {
            let keep = match self.mode {
                ProjectionMode::Include => self
                    .fields
                    .iter()
                    .any(|f| covers(f, path) || below(f, path).is_some()),
                ProjectionMode::Exclude => !self.fields.iter().any(|f| covers(f, path)),
            };
            if keep && !out.unset.contains(path) {
                out.unset.push(path.clone());
            }
        }

        out
    }

    /// Project an event. `None` when an update has nothing left to apply.
    pub fn project_event(&self, event: &ChangeEvent) -> Option<ChangeEvent> {
        if self.is_pass_through() {
            return Some(event.clone());
        }
        let payload = match &event.payload {
            Payload::Document(doc) => Payload::Document(self.project_document(doc)),
            Payload::Delta(delta) => {
                let projected = self.project_delta(delta);
                if projected.is_empty() && event.op == Operation::Update {
                    return None;
                }
                Payload::Delta(projected)
            }
            Payload::None => Payload::None,
        };
        Some(ChangeEvent {
            payload,
            ..event.clone()
        })
    }
}

impl Default for FieldProjection {
    fn default() -> Self {
        Self::pass_through()
    }
}

/// `field` names `path` itself or one of its ancestors.
fn covers(field: &str, path: &str) -> bool {
    path == field
        || path
            .strip_prefix(field)
            .is_some_and(|rest| rest.starts_with('.'))
}

/// `field` lies strictly below `path`; returns the relative remainder.
fn below<'a>(field: &'a str, path: &str) -> Option<&'a str> {
    field.strip_prefix(path)?.strip_prefix('.')
}

/// Keep only `fields` (dotted, relative to `doc`).
fn include_fields(doc: &Document, fields: &[&str]) -> Document {
    let mut out = Document::new();
    for (key, value) in doc {
        let mut whole = false;
        let mut nested = Vec::new();
        for field in fields {
            match field.split_once('.') {
                None if *field == key => whole = true,
                Some((head, rest)) if head == key => nested.push(rest),
                _ => {}
            }
        }
        if whole {
            out.insert(key.clone(), value.clone());
        } else if !nested.is_empty() {
            if let Value::Object(inner) = value {
                let projected = include_fields(inner, &nested);
                if !projected.is_empty() {
                    out.insert(key.clone(), Value::Object(projected));
                }
            }
        }
    }
    out
}
