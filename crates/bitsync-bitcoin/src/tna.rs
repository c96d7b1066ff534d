//! Transaction-normalized records from verbose bitcoind transactions.
//!
//! Each input and output becomes an object whose script is split into
//! positional fields: opcodes and small numbers as `s<n>`, data pushes as
//! `h<n>` (hex) plus `s<n>` (lossy UTF-8). The full `asm` is kept at `str`.

use serde_json::{json, Map, Value};

use bitsync_core::error::IndexerError;
use bitsync_core::types::TxRecord;

const SATS_PER_BTC: f64 = 100_000_000.0;

/// Convert a `getrawtransaction(hash, true)` result into an unstamped record.
pub fn to_record(raw: &Value) -> Result<TxRecord, IndexerError> {
    let txid = raw["txid"]
        .as_str()
        .ok_or_else(|| IndexerError::Rpc("transaction without txid".into()))?;

    let inputs: Vec<Value> = raw["vin"]
        .as_array()
        .map(|vin| vin.iter().enumerate().map(|(i, v)| input(i, v)).collect())
        .unwrap_or_default();
    let outputs: Vec<Value> = raw["vout"]
        .as_array()
        .map(|vout| vout.iter().enumerate().map(|(i, v)| output(i, v)).collect())
        .unwrap_or_default();

    let mut body = Map::new();
    body.insert("in".into(), Value::Array(inputs));
    body.insert("out".into(), Value::Array(outputs));
    body.insert("lock".into(), raw["locktime"].as_u64().map_or(Value::Null, Value::from));
    Ok(TxRecord::new(txid, body))
}

fn input(index: usize, vin: &Value) -> Value {
    let mut xput = Map::new();
    xput.insert("i".into(), json!(index));

    if let Some(coinbase) = vin["coinbase"].as_str() {
        xput.insert("coinbase".into(), json!(coinbase));
        xput.insert("e".into(), json!({ "h": null, "i": null }));
        xput.insert("str".into(), json!(""));
        return Value::Object(xput);
    }

    let mut edge = Map::new();
    edge.insert("h".into(), vin["txid"].clone());
    edge.insert("i".into(), vin["vout"].clone());
    // only present when the node includes prevout data
    if let Some(addr) = address(&vin["prevout"]["scriptPubKey"]) {
        edge.insert("a".into(), json!(addr));
    }
    xput.insert("e".into(), Value::Object(edge));

    let asm = vin["scriptSig"]["asm"].as_str().unwrap_or_default();
    push_script(&mut xput, asm);
    Value::Object(xput)
}

fn output(index: usize, vout: &Value) -> Value {
    let mut xput = Map::new();
    let n = vout["n"].as_u64().unwrap_or(index as u64);
    xput.insert("i".into(), json!(n));

    let mut edge = Map::new();
    edge.insert("v".into(), json!(to_sats(&vout["value"])));
    edge.insert("i".into(), json!(n));
    if let Some(addr) = address(&vout["scriptPubKey"]) {
        edge.insert("a".into(), json!(addr));
    }
    xput.insert("e".into(), Value::Object(edge));

    let asm = vout["scriptPubKey"]["asm"].as_str().unwrap_or_default();
    push_script(&mut xput, asm);
    Value::Object(xput)
}

/// `address` (newer nodes) or the first of `addresses` (older nodes).
fn address(script_pubkey: &Value) -> Option<&str> {
    script_pubkey["address"]
        .as_str()
        .or_else(|| script_pubkey["addresses"].get(0)?.as_str())
}

fn to_sats(value: &Value) -> i64 {
    value
        .as_f64()
        .map_or(0, |btc| (btc * SATS_PER_BTC).round() as i64)
}

fn push_script(xput: &mut Map<String, Value>, asm: &str) {
    xput.insert("str".into(), json!(asm));
    for (n, token) in asm.split_whitespace().enumerate() {
        match Token::classify(token) {
            Token::Data(bytes, hex_str) => {
                xput.insert(format!("h{n}"), json!(hex_str));
                xput.insert(format!("s{n}"), json!(String::from_utf8_lossy(&bytes)));
            }
            Token::Op(op) => {
                xput.insert(format!("s{n}"), json!(op));
            }
        }
    }
}

enum Token<'a> {
    Data(Vec<u8>, &'a str),
    Op(&'a str),
}

impl<'a> Token<'a> {
    /// Pushes over four bytes appear in `asm` as hex; shorter ones as
    /// decimal numbers, which are kept verbatim like opcodes.
    fn classify(token: &'a str) -> Self {
        // scriptSig signatures carry a sighash suffix such as "[ALL]"
        let data = token.split_once('[').map_or(token, |(hex, _)| hex);
        // a 4-byte script number prints as up to 10 decimal digits
        let script_number = data.parse::<i32>().is_ok();
        if data.len() > 8 && data.len() % 2 == 0 && !script_number {
            if let Ok(bytes) = hex::decode(data) {
                return Token::Data(bytes, data);
            }
        }
        Token::Op(token)
    }
}
