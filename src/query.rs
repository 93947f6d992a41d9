// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Predicate for a query-scoped initial import.
//!
//! A small subset of the source database's query language:
//!
//! ```json
//! {"status": "active", "total": {"$gte": 100}, "tags": {"$in": ["a", "b"]}}
//! ```
//!
//! Every top-level key is a (possibly dotted) field path; all conditions
//! must hold. A plain value means equality, an object of `$` operators means
//! each operator must hold. Supported operators: `$eq $ne $gt $gte $lt $lte
//! $in $nin $exists`. Array fields match when any element matches, as in the
//! source database.

use crate::error::{ConnectorError, Result};
use crate::oplog::{get_path, Document};
use serde_json::Value;
use std::cmp::Ordering;

const FIELD: &str = "initialImport.query";

#[derive(Debug, Clone, PartialEq)]
enum Condition {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Exists(bool),
}

/// Compiled query.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    clauses: Vec<(String, Vec<Condition>)>,
}

impl Query {
    /// Compile a query document.
    pub fn parse(query: &Value) -> Result<Self> {
        let Value::Object(map) = query else {
            return Err(ConnectorError::config(FIELD, "query must be a JSON object"));
        };

        let mut clauses = Vec::with_capacity(map.len());
        for (path, spec) in map {
            if path.starts_with('$') {
                return Err(ConnectorError::config(
                    FIELD,
                    format!("top-level operator {:?} is not supported", path),
                ));
            }
            clauses.push((path.clone(), parse_conditions(path, spec)?));
        }
        Ok(Self { clauses })
    }

    /// A query that matches every document.
    pub fn all() -> Self {
        Self { clauses: Vec::new() }
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.clauses.iter().all(|(path, conditions)| {
            let value = get_path(doc, path);
            conditions.iter().all(|c| c.holds(value))
        })
    }
}

fn parse_conditions(path: &str, spec: &Value) -> Result<Vec<Condition>> {
    let operators = match spec {
        Value::Object(map) if map.keys().any(|k| k.starts_with('$')) => map,
        other => return Ok(vec![Condition::Eq(other.clone())]),
    };

    let mut conditions = Vec::with_capacity(operators.len());
    for (op, operand) in operators {
        let condition = match op.as_str() {
            "$eq" => Condition::Eq(operand.clone()),
            "$ne" => Condition::Ne(operand.clone()),
            "$gt" => Condition::Gt(operand.clone()),
            "$gte" => Condition::Gte(operand.clone()),
            "$lt" => Condition::Lt(operand.clone()),
            "$lte" => Condition::Lte(operand.clone()),
            "$in" | "$nin" => {
                let Value::Array(items) = operand else {
                    return Err(ConnectorError::config(
                        FIELD,
                        format!("{} on {:?} needs an array", op, path),
                    ));
                };
                if op == "$in" {
                    Condition::In(items.clone())
                } else {
                    Condition::Nin(items.clone())
                }
            }
            "$exists" => Condition::Exists(truthy(operand)),
            other => {
                return Err(ConnectorError::config(
                    FIELD,
                    format!("unsupported operator {:?} on {:?}", other, path),
                ))
            }
        };
        conditions.push(condition);
    }
    Ok(conditions)
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::Null => false,
        _ => true,
    }
}

impl Condition {
    fn holds(&self, value: Option<&Value>) -> bool {
        match self {
            Condition::Exists(expected) => value.is_some() == *expected,
            Condition::Eq(target) => equals(value, target),
            Condition::Ne(target) => !equals(value, target),
            Condition::In(items) => items.iter().any(|t| equals(value, t)),
            Condition::Nin(items) => !items.iter().any(|t| equals(value, t)),
            Condition::Gt(target) => compare_any(value, target, |o| o == Ordering::Greater),
            Condition::Gte(target) => compare_any(value, target, |o| o != Ordering::Less),
            Condition::Lt(target) => compare_any(value, target, |o| o == Ordering::Less),
            Condition::Lte(target) => compare_any(value, target, |o| o != Ordering::Greater),
        }
    }
}

/// Equality with array-element matching; a missing field equals `null`.
fn equals(value: Option<&Value>, target: &Value) -> bool {
    match value {
        None => target.is_null(),
        Some(v) if values_equal(v, target) => true,
        Some(Value::Array(items)) => items.iter().any(|item| values_equal(item, target)),
        Some(_) => false,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compare_any(value: Option<&Value>, target: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .any(|item| compare(item, target).is_some_and(&accept)),
        Some(v) => compare(v, target).is_some_and(accept),
        None => false,
    }
}

/// Ordering between values of the same kind; mixed kinds never compare.
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}
