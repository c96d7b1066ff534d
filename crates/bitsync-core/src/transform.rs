//! Named batch transforms applied after the filter predicate.
//!
//! A transform receives the whole retained batch and returns the documents to
//! store. Every output document must still carry `tx.h`; confirmed documents
//! must keep `blk`.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::IndexerError;
use crate::types::{document_hash, document_height, get_path, set_path, Document};

/// A transform implementation: `(batch, args) -> batch`.
pub type TransformFn =
    Arc<dyn Fn(Vec<Document>, &Value) -> Result<Vec<Document>, String> + Send + Sync>;

/// A transform resolved against its arguments.
#[derive(Clone)]
pub struct Transform {
    name: String,
    args: Value,
    func: TransformFn,
}

impl Transform {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run over a batch, then check every output still carries `tx.h`, and
    /// `blk.i` when the whole input batch was confirmed.
    pub fn run(&self, batch: Vec<Document>) -> Result<Vec<Document>, IndexerError> {
        let confirmed = !batch.is_empty() && batch.iter().all(|d| document_height(d).is_some());
        let out = (self.func)(batch, &self.args).map_err(|reason| self.error(reason))?;
        if let Some(pos) = out.iter().position(|d| document_hash(d).is_none()) {
            return Err(self.error(format!("output document {pos} has no tx.h")));
        }
        if confirmed {
            if let Some(pos) = out.iter().position(|d| document_height(d).is_none()) {
                return Err(self.error(format!("output document {pos} has no blk.i")));
            }
        }
        Ok(out)
    }

    fn error(&self, reason: String) -> IndexerError {
        IndexerError::Transform {
            name: self.name.clone(),
            reason,
        }
    }
}

impl std::fmt::Debug for Transform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transform")
            .field("name", &self.name)
            .field("args", &self.args)
            .finish()
    }
}

// ─── Registry ─────────────────────────────────────────────────────────────────

/// Registry of named transforms.
#[derive(Default, Clone)]
pub struct TransformRegistry {
    transforms: HashMap<String, TransformFn>,
}

impl TransformRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with `identity`, `project`, `unwind`, and `limit`.
    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        reg.register("identity", |batch, _| Ok(batch));
        reg.register("project", project);
        reg.register("unwind", unwind);
        reg.register("limit", limit);
        reg
    }

    /// Register (or replace) a transform.
    pub fn register<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(Vec<Document>, &Value) -> Result<Vec<Document>, String> + Send + Sync + 'static,
    {
        self.transforms.insert(name.into(), Arc::new(f));
    }

    /// Bind `name` to `args`. Unknown names are a filter compile error.
    pub fn resolve(&self, name: &str, args: Value) -> Result<Transform, IndexerError> {
        let func = self
            .transforms
            .get(name)
            .cloned()
            .ok_or_else(|| IndexerError::Filter(format!("unknown transform '{name}'")))?;
        Ok(Transform {
            name: name.to_string(),
            args,
            func,
        })
    }
}

// ─── Builtins ─────────────────────────────────────────────────────────────────

/// `{"fields": ["out", "in.e.a"]}`: keep only the listed paths plus `tx` and `blk`.
fn project(batch: Vec<Document>, args: &Value) -> Result<Vec<Document>, String> {
    let fields: Vec<&str> = args
        .get("fields")
        .and_then(Value::as_array)
        .ok_or("expected args.fields to be an array")?
        .iter()
        .map(|f| f.as_str().ok_or("field names must be strings"))
        .collect::<Result<_, _>>()?;

    Ok(batch
        .into_iter()
        .map(|doc| {
            let mut out = Map::new();
            for path in ["tx", "blk"].into_iter().chain(fields.iter().copied()) {
                if let Some(v) = get_path(&doc, path) {
                    set_path(&mut out, path, v.clone());
                }
            }
            Value::Object(out)
        })
        .collect())
}

/// `{"path": "out"}`: one document per element of the array at `path`.
///
/// Unwound documents get the hash suffix `:<index>` so each stays unique.
fn unwind(batch: Vec<Document>, args: &Value) -> Result<Vec<Document>, String> {
    let path = args
        .get("path")
        .and_then(Value::as_str)
        .ok_or("expected args.path to be a string")?;

    let mut out = Vec::with_capacity(batch.len());
    for doc in batch {
        let Some(Value::Array(items)) = get_path(&doc, path).cloned() else {
            out.push(doc);
            continue;
        };
        let hash = document_hash(&doc).unwrap_or_default().to_string();
        for (i, item) in items.into_iter().enumerate() {
            let mut copy = doc.clone();
            if let Value::Object(map) = &mut copy {
                set_path(map, path, item);
                set_path(map, "tx.h", Value::String(format!("{hash}:{i}")));
            }
            out.push(copy);
        }
    }
    Ok(out)
}

/// `{"n": 10}`: keep the first `n` documents.
fn limit(batch: Vec<Document>, args: &Value) -> Result<Vec<Document>, String> {
    let n = args
        .get("n")
        .and_then(Value::as_u64)
        .ok_or("expected args.n to be a non-negative integer")?;
    Ok(batch.into_iter().take(n as usize).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(h: &str) -> Document {
        json!({
            "tx": { "h": h },
            "blk": { "i": 7, "h": "00", "t": 1 },
            "in": [{ "i": 0 }],
            "out": [{ "i": 0, "s0": "OP_RETURN" }, { "i": 1, "e": { "v": 546 } }],
            "lock": 0
        })
    }

    #[test]
    fn project_keeps_identity() {
        let reg = TransformRegistry::with_builtins();
        let t = reg.resolve("project", json!({ "fields": ["lock"] })).unwrap();
        let out = t.run(vec![doc("aa")]).unwrap();
        assert_eq!(
            out[0],
            json!({ "tx": { "h": "aa" }, "blk": { "i": 7, "h": "00", "t": 1 }, "lock": 0 })
        );
    }

    #[test]
    fn unwind_outputs() {
        let reg = TransformRegistry::with_builtins();
        let t = reg.resolve("unwind", json!({ "path": "out" })).unwrap();
        let out = t.run(vec![doc("aa")]).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["tx"]["h"], "aa:0");
        assert_eq!(out[1]["out"]["e"]["v"], 546);
        assert_eq!(out[1]["blk"]["i"], 7);
    }

    #[test]
    fn bad_args_are_transform_errors() {
        let reg = TransformRegistry::with_builtins();
        let t = reg.resolve("limit", json!({})).unwrap();
        let err = t.run(vec![doc("aa")]).unwrap_err();
        assert!(matches!(err, IndexerError::Transform { ref name, .. } if name == "limit"));
    }

    #[test]
    fn output_without_hash_is_rejected() {
        let mut reg = TransformRegistry::new();
        reg.register("strip", |batch, _| {
            Ok(batch.into_iter().map(|_| json!({ "x": 1 })).collect())
        });
        let t = reg.resolve("strip", Value::Null).unwrap();
        assert!(t.run(vec![doc("aa")]).is_err());
        assert!(reg.resolve("missing", Value::Null).is_err());
    }

    #[test]
    fn confirmed_output_must_keep_block() {
        let mut reg = TransformRegistry::new();
        reg.register("drop_blk", |batch, _| {
            Ok(batch
                .into_iter()
                .map(|d| json!({ "tx": d["tx"].clone(), "out": d["out"].clone() }))
                .collect())
        });
        let t = reg.resolve("drop_blk", Value::Null).unwrap();
        assert_eq!(t.name(), "drop_blk");

        let err = t.run(vec![doc("aa")]).unwrap_err();
        assert!(err.to_string().contains("blk.i"), "{err}");

        // mempool batches never had a block
        let unconfirmed = json!({ "tx": { "h": "bb" }, "out": [] });
        assert_eq!(t.run(vec![unconfirmed]).unwrap().len(), 1);
    }
}
