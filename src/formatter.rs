// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-target document formatting.
//!
//! Some targets want type information encoded in field names, or flat
//! documents. A target picks one of three fixed formatters:
//!
//! | Formatter | Effect |
//! |-----------|--------|
//! | `none` | documents pass through unchanged |
//! | `default` | top-level keys get a type prefix (`long_total`, `string_name`) |
//! | `flatten` | nested objects and arrays are unwound into dotted keys |
//!
//! ```text
//! {"a": 2, "b": {"c": {"d": 5}}, "e": [6, 7]}
//!   default → {"long_a": 2, "object_b": {"c": {"d": 5}}, "long_e": [6, 7]}
//!   flatten → {"long_a": 2, "b.c.d": 5, "long_e.0": 6, "long_e.1": 7}
//! ```
//!
//! Both formatters also normalize extended-JSON wrappers (`$date`, `$oid`,
//! `$binary`, `$uuid`, `$regex`, `$numberLong`, `$numberDouble`) into plain
//! values. Values that cannot be represented (NaN, infinity) are dropped with
//! a warning. The identifier field is never prefixed.

use crate::oplog::{Delta, Document, ID_FIELD};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use tracing::warn;

/// Value type, as encoded in field-name prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Bool,
    Long,
    Double,
    String,
    Object,
    Datetime,
    Geopoint,
    Unknown,
}

impl DataType {
    pub const ALL: [DataType; 8] = [
        DataType::Bool,
        DataType::Long,
        DataType::Double,
        DataType::String,
        DataType::Object,
        DataType::Datetime,
        DataType::Geopoint,
        DataType::Unknown,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            DataType::Bool => "bool",
            DataType::Long => "long",
            DataType::Double => "double",
            DataType::String => "string",
            DataType::Object => "object",
            DataType::Datetime => "datetime",
            DataType::Geopoint => "geopoint",
            DataType::Unknown => "",
        }
    }

    pub fn from_name(name: &str) -> DataType {
        DataType::ALL
            .into_iter()
            .find(|t| t.name() == name)
            .unwrap_or(DataType::Unknown)
    }

    /// Field-name prefix, empty for unknown values.
    pub fn prefix(&self) -> String {
        match self {
            DataType::Unknown => String::new(),
            other => format!("{}_", other.name()),
        }
    }

    /// Type of a (normalized) value. Arrays take the type of their first
    /// element; RFC 3339 strings are datetimes.
    pub fn for_value(value: &Value) -> DataType {
        match value {
            Value::Bool(_) => DataType::Bool,
            Value::Number(n) if n.is_i64() || n.is_u64() => DataType::Long,
            Value::Number(_) => DataType::Double,
            Value::String(s) if DateTime::parse_from_rfc3339(s).is_ok() => DataType::Datetime,
            Value::String(_) => DataType::String,
            Value::Object(map) if is_geopoint(map) => DataType::Geopoint,
            Value::Object(_) => DataType::Object,
            Value::Array(items) => items.first().map(DataType::for_value).unwrap_or(DataType::Unknown),
            Value::Null => DataType::Unknown,
        }
    }

    /// Strip a type prefix from a field name.
    pub fn attribute_name_from_key(key: &str) -> &str {
        DataType::ALL
            .iter()
            .filter(|t| **t != DataType::Unknown)
            .find_map(|t| key.strip_prefix(t.prefix().as_str()))
            .unwrap_or(key)
    }
}

/// An object with exactly `lat` and `lon`.
fn is_geopoint(map: &Document) -> bool {
    map.len() == 2 && map.contains_key("lat") && map.contains_key("lon")
}

/// Which formatter a target uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatterKind {
    #[default]
    None,
    Default,
    Flatten,
}

#[derive(Debug, Clone, PartialEq)]
struct InvalidValue(&'static str);

impl FormatterKind {
    /// Format a full document.
    pub fn format_document(&self, doc: &Document) -> Document {
        match self {
            FormatterKind::None => doc.clone(),
            FormatterKind::Default => {
                let mut out = Document::new();
                for (key, value) in doc {
                    if let Some(value) = transform_or_warn(key, value) {
                        out.insert(prefixed(key, &value), value);
                    }
                }
                out
            }
            FormatterKind::Flatten => {
                let mut out = Document::new();
                for (key, value) in doc {
                    match value {
                        Value::Object(inner) if !is_extended_json(inner) => {
                            flatten_into(&mut out, key, value);
                        }
                        _ => {
                            let mut unwound = Document::new();
                            flatten_into(&mut unwound, key, value);
                            for (k, v) in unwound {
                                out.insert(prefixed(&k, &v), v);
                            }
                        }
                    }
                }
                out
            }
        }
    }

    /// Format an update delta.
    ///
    /// `$set` paths are formatted like document keys. A top-level `$unset`
    /// expands to every typed variant of the name, since the stored type is
    /// not known; removing a missing field is a no-op at every target.
    pub fn format_delta(&self, delta: &Delta) -> Delta {
        match self {
            FormatterKind::None => delta.clone(),
            FormatterKind::Default => {
                let mut out = Delta::default();
                for (path, value) in &delta.set {
                    let Some(value) = transform_or_warn(path, value) else {
                        continue;
                    };
                    let key = match path.split_once('.') {
                        None => prefixed(path, &value),
                        Some((head, rest)) => format!("{}{}.{}", DataType::Object.prefix(), head, rest),
                    };
                    out.set.insert(key, value);
                }
                for path in &delta.unset {
                    match path.split_once('.') {
                        None => out.unset.extend(typed_variants(path)),
                        Some((head, rest)) => out
                            .unset
                            .push(format!("{}{}.{}", DataType::Object.prefix(), head, rest)),
                    }
                }
                out
            }
            FormatterKind::Flatten => {
                let mut out = Delta::default();
                for (path, value) in &delta.set {
                    let formatted = if path.contains('.') {
                        let mut flat = Document::new();
                        flatten_into(&mut flat, path, value);
                        flat
                    } else {
                        let mut single = Document::new();
                        single.insert(path.clone(), value.clone());
                        self.format_document(&single)
                    };
                    out.set.extend(formatted);
                }
                for path in &delta.unset {
                    if path.contains('.') {
                        out.unset.push(path.clone());
                    } else {
                        out.unset.extend(typed_variants(path));
                    }
                }
                out
            }
        }
    }
}

fn typed_variants(name: &str) -> Vec<String> {
    DataType::ALL
        .iter()
        .map(|t| format!("{}{}", t.prefix(), name))
        .collect()
}

fn prefixed(key: &str, value: &Value) -> String {
    if key == ID_FIELD {
        return key.to_string();
    }
    let prefix = DataType::for_value(value).prefix();
    if key.starts_with(&prefix) {
        key.to_string()
    } else {
        format!("{}{}", prefix, key)
    }
}

fn transform_or_warn(key: &str, value: &Value) -> Option<Value> {
    match transform_value(value) {
        Ok(v) => Some(v),
        Err(InvalidValue(reason)) => {
            warn!(key = %key, reason, "Dropping invalid value");
            None
        }
    }
}

/// Unwind `value` under `path` into dotted leaf keys.
fn flatten_into(out: &mut Document, path: &str, value: &Value) {
    match value {
        Value::Object(inner) if !is_extended_json(inner) => {
            for (k, v) in inner {
                flatten_into(out, &format!("{}.{}", path, k), v);
            }
        }
        Value::Array(items) => {
            for (i, v) in items.iter().enumerate() {
                flatten_into(out, &format!("{}.{}", path, i), v);
            }
        }
        leaf => {
            if let Some(v) = transform_or_warn(path, leaf) {
                out.insert(path.to_string(), v);
            }
        }
    }
}

const EXTENDED_KEYS: [&str; 8] = [
    "$date",
    "$oid",
    "$binary",
    "$uuid",
    "$regex",
    "$numberLong",
    "$numberDouble",
    "$numberInt",
];

/// The wrapper key of an extended-JSON value (`{"$date": ...}`), if any.
fn extended_key(map: &Document) -> Option<&'static str> {
    if map.is_empty() || map.len() > 2 || !map.keys().all(|k| k.starts_with('$')) {
        return None;
    }
    EXTENDED_KEYS.into_iter().find(|k| map.contains_key(*k))
}

fn is_extended_json(map: &Document) -> bool {
    extended_key(map).is_some()
}

/// Normalize a value, recursing into objects and arrays.
fn transform_value(value: &Value) -> std::result::Result<Value, InvalidValue> {
    match value {
        Value::Object(map) => match extended_key(map) {
            Some(key) => transform_extended(key, map),
            None => {
                let mut out = Document::new();
                for (k, v) in map {
                    if let Some(v) = transform_or_warn(k, v) {
                        out.insert(k.clone(), v);
                    }
                }
                Ok(Value::Object(out))
            }
        },
        Value::Array(items) => items
            .iter()
            .map(transform_value)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map(Value::Array),
        other => Ok(other.clone()),
    }
}

fn transform_extended(key: &str, map: &Document) -> std::result::Result<Value, InvalidValue> {
    let inner = map.get(key).unwrap_or(&Value::Null);
    match key {
        "$date" => date_to_string(inner).map(Value::String),
        "$oid" | "$uuid" => Ok(Value::String(
            inner.as_str().unwrap_or_default().replace('-', ""),
        )),
        "$binary" => match inner {
            Value::String(b64) => Ok(Value::String(b64.clone())),
            Value::Object(b) => Ok(b.get("base64").cloned().unwrap_or(Value::Null)),
            _ => Err(InvalidValue("malformed $binary")),
        },
        "$regex" => {
            let pattern = inner.as_str().unwrap_or_default();
            let flags = map.get("$options").and_then(Value::as_str).unwrap_or_default();
            Ok(Value::String(format!("/{}/{}", pattern, flags)))
        }
        "$numberLong" | "$numberInt" => inner
            .as_str()
            .and_then(|s| s.parse::<i64>().ok())
            .map(|n| Value::Number(n.into()))
            .ok_or(InvalidValue("malformed integer")),
        "$numberDouble" => {
            let parsed = inner
                .as_str()
                .and_then(|s| s.parse::<f64>().ok())
                .ok_or(InvalidValue("malformed double"))?;
            if parsed.is_nan() {
                return Err(InvalidValue("nan"));
            }
            Number::from_f64(parsed)
                .map(Value::Number)
                .ok_or(InvalidValue("inf"))
        }
        _ => Ok(Value::Object(map.clone())),
    }
}

fn date_to_string(inner: &Value) -> std::result::Result<String, InvalidValue> {
    let datetime = match inner {
        Value::Number(n) => n.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        Value::String(s) => DateTime::parse_from_rfc3339(s).ok().map(|d| d.with_timezone(&Utc)),
        Value::Object(o) => o
            .get("$numberLong")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<i64>().ok())
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    };
    datetime
        .map(|d| d.to_rfc3339_opts(SecondsFormat::Millis, true))
        .ok_or(InvalidValue("malformed $date"))
}
