//! Shared types for the sync pipeline.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A stored record: the JSON document form of a transaction.
///
/// Identity lives at `tx.h`; confirmed documents carry their block at `blk`.
pub type Document = Value;

// ─── BlockDescriptor ──────────────────────────────────────────────────────────

/// The block a confirmed transaction was fetched under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDescriptor {
    /// Block height.
    #[serde(rename = "i")]
    pub height: u64,
    /// Block hash.
    #[serde(rename = "h")]
    pub hash: String,
    /// Block time (seconds since epoch).
    #[serde(rename = "t")]
    pub time: i64,
}

// ─── BlockData ────────────────────────────────────────────────────────────────

/// A block as returned by the chain source: header fields plus its txids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockData {
    pub hash: String,
    pub time: i64,
    pub txids: Vec<String>,
}

impl BlockData {
    /// Build the descriptor stamped onto every transaction of this block.
    pub fn descriptor(&self, height: u64) -> BlockDescriptor {
        BlockDescriptor {
            height,
            hash: self.hash.clone(),
            time: self.time,
        }
    }
}

// ─── TxRecord ─────────────────────────────────────────────────────────────────

/// A fetched transaction before it becomes a [`Document`].
#[derive(Debug, Clone, PartialEq)]
pub struct TxRecord {
    /// Transaction hash (identity key).
    pub hash: String,
    /// Present only for confirmed transactions.
    pub blk: Option<BlockDescriptor>,
    /// Remaining fields (`in`, `out`, `lock`, ...).
    pub body: Map<String, Value>,
}

impl TxRecord {
    pub fn new(hash: impl Into<String>, body: Map<String, Value>) -> Self {
        Self {
            hash: hash.into(),
            blk: None,
            body,
        }
    }

    /// Attach the block this transaction was fetched under.
    pub fn stamp(&mut self, blk: BlockDescriptor) {
        self.blk = Some(blk);
    }

    /// Expand into the stored document form.
    ///
    /// `tx` and `blk` from the record always win over same-named body keys.
    pub fn into_document(self) -> Document {
        let mut doc = self.body;
        doc.insert("tx".into(), serde_json::json!({ "h": self.hash }));
        match self.blk {
            Some(blk) => {
                doc.insert(
                    "blk".into(),
                    serde_json::to_value(blk).unwrap_or(Value::Null),
                );
            }
            None => {
                doc.remove("blk");
            }
        }
        Value::Object(doc)
    }
}

// ─── Document helpers ─────────────────────────────────────────────────────────

/// The transaction hash of a document (`tx.h`).
pub fn document_hash(doc: &Document) -> Option<&str> {
    doc.pointer("/tx/h")?.as_str()
}

/// The block height of a confirmed document (`blk.i`).
pub fn document_height(doc: &Document) -> Option<u64> {
    doc.pointer("/blk/i")?.as_u64()
}

/// Look up a dotted path (`"out.e.a"`) through nested objects.
///
/// Numeric segments index into arrays. Unlike the query evaluator this does
/// not fan out across array elements.
pub fn get_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |v, seg| match v {
        Value::Object(map) => map.get(seg),
        Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Every value at a dotted path, descending through arrays.
///
/// `out.s1` yields the `s1` of each output; a numeric segment also selects
/// that element directly. Used by queries and by index extraction.
pub fn find_path<'a>(doc: &'a Value, path: &str) -> Vec<&'a Value> {
    let segments: Vec<&str> = path.split('.').collect();
    let mut out = Vec::new();
    collect_path(doc, &segments, &mut out);
    out
}

pub(crate) fn collect_path<'a, S: AsRef<str>>(v: &'a Value, path: &[S], out: &mut Vec<&'a Value>) {
    let Some((head, rest)) = path.split_first() else {
        out.push(v);
        return;
    };
    let head = head.as_ref();
    match v {
        Value::Object(map) => {
            if let Some(child) = map.get(head) {
                collect_path(child, rest, out);
            }
        }
        Value::Array(items) => {
            if let Ok(i) = head.parse::<usize>() {
                if let Some(child) = items.get(i) {
                    collect_path(child, rest, out);
                }
            }
            for item in items.iter().filter(|i| i.is_object() || i.is_array()) {
                collect_path(item, path, out);
            }
        }
        _ => {}
    }
}

/// Set a dotted path inside `map`, creating intermediate objects.
pub fn set_path(map: &mut Map<String, Value>, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            map.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let child = map
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !child.is_object() {
                *child = Value::Object(Map::new());
            }
            if let Value::Object(inner) = child {
                set_path(inner, rest, value);
            }
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body() -> Map<String, Value> {
        json!({ "out": [{ "i": 0, "s0": "OP_RETURN" }], "lock": 0 })
            .as_object()
            .cloned()
            .unwrap()
    }

    #[test]
    fn stamped_record_document() {
        let block = BlockData {
            hash: "00ab".into(),
            time: 1_700_000_000,
            txids: vec!["aa".into()],
        };
        let mut rec = TxRecord::new("aa", body());
        rec.stamp(block.descriptor(100));
        assert!(rec.blk.is_some());

        let doc = rec.into_document();
        assert_eq!(document_hash(&doc), Some("aa"));
        assert_eq!(document_height(&doc), Some(100));
        assert_eq!(doc["blk"], json!({ "i": 100, "h": "00ab", "t": 1_700_000_000 }));
        assert_eq!(doc["out"][0]["s0"], "OP_RETURN");
    }

    #[test]
    fn mempool_record_has_no_block() {
        let mut b = body();
        b.insert("blk".into(), json!({ "i": 1 }));
        let doc = TxRecord::new("bb", b).into_document();
        assert!(doc.get("blk").is_none());
        assert_eq!(document_height(&doc), None);
    }

    #[test]
    fn find_path_fans_out() {
        let doc = json!({ "out": [{ "s1": "a" }, { "s1": "b" }, { "s0": "OP_RETURN" }] });
        assert_eq!(find_path(&doc, "out.s1"), vec![&json!("a"), &json!("b")]);
        assert_eq!(find_path(&doc, "out.1.s1"), vec![&json!("b")]);
        assert!(find_path(&doc, "out.s9").is_empty());
    }

    #[test]
    fn dotted_paths() {
        let doc = json!({ "a": { "b": [{ "c": 1 }, { "c": 2 }] } });
        assert_eq!(get_path(&doc, "a.b.1.c"), Some(&json!(2)));
        assert_eq!(get_path(&doc, "a.x"), None);

        let mut map = Map::new();
        set_path(&mut map, "x.y.z", json!(5));
        set_path(&mut map, "x.w", json!("v"));
        assert_eq!(Value::Object(map), json!({ "x": { "y": { "z": 5 }, "w": "v" } }));
    }
}
