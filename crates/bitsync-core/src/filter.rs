//! Filter engine — a compiled structural predicate plus an optional transform.
//!
//! Queries use a MongoDB-style document syntax:
//!
//! ```json
//! { "out.s1": "hello", "out.e.v": { "$gte": 546 }, "$or": [ { "in.e.a": "1Abc" }, { "lock": 0 } ] }
//! ```
//!
//! Dotted paths fan out across arrays: `out.s1` matches if any output has a
//! matching `s1`. The query is compiled once; evaluation is pure.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::IndexerError;
use crate::transform::{Transform, TransformRegistry};
use crate::types::{collect_path, Document, TxRecord};

// ─── FilterSpec ───────────────────────────────────────────────────────────────

/// The on-disk filter file.
///
/// ```json
/// { "from": 525470,
///   "filter": { "q": { "find": { "out.s1": "hello" } },
///               "r": { "f": "project", "args": { "fields": ["out"] } } } }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterSpec {
    /// Genesis height.
    #[serde(default)]
    pub from: u64,
    #[serde(default)]
    pub filter: Option<FilterSection>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterSection {
    #[serde(default)]
    pub q: Option<QuerySection>,
    #[serde(default)]
    pub r: Option<TransformSection>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuerySection {
    #[serde(default)]
    pub find: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformSection {
    /// Registered transform name.
    pub f: String,
    #[serde(default)]
    pub args: Value,
}

impl FilterSpec {
    /// Parse a filter file.
    pub fn from_json(s: &str) -> Result<Self, IndexerError> {
        serde_json::from_str(s).map_err(|e| IndexerError::Config(format!("filter spec: {e}")))
    }

    fn find(&self) -> Option<&Value> {
        self.filter.as_ref()?.q.as_ref()?.find.as_ref()
    }

    fn transform(&self) -> Option<&TransformSection> {
        self.filter.as_ref()?.r.as_ref()
    }
}

// ─── FilterEngine ─────────────────────────────────────────────────────────────

/// Compiled filter applied to every crawled batch.
pub struct FilterEngine {
    predicate: Option<Query>,
    transform: Option<Transform>,
}

impl FilterEngine {
    /// An engine that passes every record through.
    pub fn pass_through() -> Self {
        Self {
            predicate: None,
            transform: None,
        }
    }

    /// Compile a filter spec, resolving the transform in `registry`.
    pub fn compile(spec: &FilterSpec, registry: &TransformRegistry) -> Result<Self, IndexerError> {
        let predicate = spec.find().map(Query::compile).transpose()?;
        let transform = match (spec.transform(), &predicate) {
            (Some(section), Some(_)) => {
                let transform = registry.resolve(&section.f, section.args.clone())?;
                tracing::debug!(transform = transform.name(), "transform bound");
                Some(transform)
            }
            (Some(section), None) => {
                tracing::warn!(transform = %section.f, "transform configured without a query; ignored");
                None
            }
            (None, _) => None,
        };
        Ok(Self {
            predicate,
            transform,
        })
    }

    /// Returns `true` if no predicate is configured.
    pub fn is_pass_through(&self) -> bool {
        self.predicate.is_none()
    }

    /// Filter and transform a batch.
    ///
    /// Without a predicate the batch is returned as-is (in document form).
    /// Otherwise only matching records are kept, in their original order, and
    /// the transform (if any) runs once over the whole retained set.
    pub fn apply(&self, batch: Vec<TxRecord>) -> Result<Vec<Document>, IndexerError> {
        let docs = batch.into_iter().map(TxRecord::into_document);
        let Some(predicate) = &self.predicate else {
            return Ok(docs.collect());
        };
        let retained: Vec<Document> = docs.filter(|doc| predicate.matches(doc)).collect();
        match &self.transform {
            Some(transform) => transform.run(retained),
            None => Ok(retained),
        }
    }

    /// Test a single document against the predicate.
    pub fn matches(&self, doc: &Document) -> bool {
        self.predicate.as_ref().map_or(true, |q| q.matches(doc))
    }
}

// ─── Query AST ────────────────────────────────────────────────────────────────

/// A compiled query.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    And(Vec<Query>),
    Or(Vec<Query>),
    Nor(Vec<Query>),
    Field { path: Vec<String>, cond: Condition },
}

/// A condition on the values found at one path.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(Value),
    Ne(Value),
    Cmp(Ordering, bool, Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Exists(bool),
    Size(usize),
    ElemMatchDoc(Box<Query>),
    ElemMatchValue(Box<Condition>),
    Not(Box<Condition>),
    All(Vec<Condition>),
}

impl Query {
    /// Compile a query document.
    pub fn compile(q: &Value) -> Result<Self, IndexerError> {
        let obj = q
            .as_object()
            .ok_or_else(|| IndexerError::Filter(format!("query must be an object, got {q}")))?;
        let mut clauses = Vec::with_capacity(obj.len());
        for (key, value) in obj {
            clauses.push(match key.as_str() {
                "$and" => Query::And(compile_list(key, value)?),
                "$or" => Query::Or(compile_list(key, value)?),
                "$nor" => Query::Nor(compile_list(key, value)?),
                k if k.starts_with('$') => {
                    return Err(IndexerError::Filter(format!("unknown top-level operator {k}")))
                }
                path => Query::Field {
                    path: path.split('.').map(str::to_string).collect(),
                    cond: Condition::compile(value)?,
                },
            });
        }
        Ok(if clauses.len() == 1 {
            clauses.remove(0)
        } else {
            Query::And(clauses)
        })
    }

    /// Evaluate against a document.
    pub fn matches(&self, doc: &Value) -> bool {
        match self {
            Query::And(qs) => qs.iter().all(|q| q.matches(doc)),
            Query::Or(qs) => qs.iter().any(|q| q.matches(doc)),
            Query::Nor(qs) => !qs.iter().any(|q| q.matches(doc)),
            Query::Field { path, cond } => {
                let mut found = Vec::new();
                collect_path(doc, path, &mut found);
                cond.test(&found)
            }
        }
    }
}

fn compile_list(op: &str, value: &Value) -> Result<Vec<Query>, IndexerError> {
    let items = value
        .as_array()
        .filter(|a| !a.is_empty())
        .ok_or_else(|| IndexerError::Filter(format!("{op} expects a non-empty array")))?;
    items.iter().map(Query::compile).collect()
}

fn is_operator_object(map: &Map<String, Value>) -> bool {
    !map.is_empty() && map.keys().all(|k| k.starts_with('$'))
}

impl Condition {
    fn compile(value: &Value) -> Result<Self, IndexerError> {
        match value {
            Value::Object(map) if is_operator_object(map) => {
                let mut conds = map
                    .iter()
                    .map(|(op, arg)| Self::compile_operator(op, arg))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(if conds.len() == 1 {
                    conds.remove(0)
                } else {
                    Condition::All(conds)
                })
            }
            literal => Ok(Condition::Eq(literal.clone())),
        }
    }

    fn compile_operator(op: &str, arg: &Value) -> Result<Self, IndexerError> {
        let list = |arg: &Value| {
            arg.as_array()
                .cloned()
                .ok_or_else(|| IndexerError::Filter(format!("{op} expects an array")))
        };
        Ok(match op {
            "$eq" => Condition::Eq(arg.clone()),
            "$ne" => Condition::Ne(arg.clone()),
            "$gt" => Condition::Cmp(Ordering::Greater, false, arg.clone()),
            "$gte" => Condition::Cmp(Ordering::Greater, true, arg.clone()),
            "$lt" => Condition::Cmp(Ordering::Less, false, arg.clone()),
            "$lte" => Condition::Cmp(Ordering::Less, true, arg.clone()),
            "$in" => Condition::In(list(arg)?),
            "$nin" => Condition::Nin(list(arg)?),
            "$exists" => Condition::Exists(truthy(arg)),
            "$size" => Condition::Size(
                arg.as_u64()
                    .ok_or_else(|| IndexerError::Filter("$size expects a non-negative integer".into()))?
                    as usize,
            ),
            "$elemMatch" => match arg {
                Value::Object(map) if is_operator_object(map) => {
                    Condition::ElemMatchValue(Box::new(Condition::compile(arg)?))
                }
                Value::Object(_) => Condition::ElemMatchDoc(Box::new(Query::compile(arg)?)),
                _ => return Err(IndexerError::Filter("$elemMatch expects an object".into())),
            },
            "$not" => match arg {
                Value::Object(map) if is_operator_object(map) => {
                    Condition::Not(Box::new(Condition::compile(arg)?))
                }
                _ => return Err(IndexerError::Filter("$not expects an operator object".into())),
            },
            other => return Err(IndexerError::Filter(format!("unknown operator {other}"))),
        })
    }

    /// Test the values found at a path (empty when the path is missing).
    fn test(&self, found: &[&Value]) -> bool {
        match self {
            Condition::Eq(x) => eq_any(found, x),
            Condition::Ne(x) => !eq_any(found, x),
            Condition::Cmp(ord, inclusive, x) => candidates(found).any(|v| {
                compare(v, x).map_or(false, |o| o == *ord || (*inclusive && o == Ordering::Equal))
            }),
            Condition::In(xs) => xs.iter().any(|x| eq_any(found, x)),
            Condition::Nin(xs) => !xs.iter().any(|x| eq_any(found, x)),
            Condition::Exists(want) => !found.is_empty() == *want,
            Condition::Size(n) => found
                .iter()
                .any(|v| v.as_array().map_or(false, |a| a.len() == *n)),
            Condition::ElemMatchDoc(q) => found.iter().any(|v| {
                v.as_array()
                    .map_or(false, |a| a.iter().any(|e| e.is_object() && q.matches(e)))
            }),
            Condition::ElemMatchValue(c) => found.iter().any(|v| {
                v.as_array().map_or(false, |a| a.iter().any(|e| c.test(&[e])))
            }),
            Condition::Not(c) => !c.test(found),
            Condition::All(cs) => cs.iter().all(|c| c.test(found)),
        }
    }
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        Value::Null => false,
        _ => true,
    }
}

/// Each found value, plus the elements of found arrays.
fn candidates<'a>(found: &'a [&'a Value]) -> impl Iterator<Item = &'a Value> + 'a {
    found.iter().flat_map(|v| {
        let elements = v.as_array().map(|a| a.iter()).into_iter().flatten();
        std::iter::once(*v).chain(elements)
    })
}

fn eq_any(found: &[&Value], x: &Value) -> bool {
    if found.is_empty() {
        return x.is_null();
    }
    candidates(found).any(|v| values_equal(v, x))
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| values_equal(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).map_or(false, |w| values_equal(v, w)))
        }
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}
