//! Untyped bencode values, for inspection from the command line.

use crate::error::MetainfoError;

use serde_bencode::value::Value;
use serde_json::{Map, Value as Json};

/// Decode one bencoded value.
pub fn decode(buf: &[u8]) -> Result<Value, MetainfoError> {
    Ok(serde_bencode::from_bytes::<Value>(buf)?)
}

/// Render a bencode value as JSON. Byte strings become (lossy) UTF-8
/// strings and dictionary keys come out sorted.
pub fn to_json(value: &Value) -> Json {
    match value {
        Value::Bytes(bytes) => Json::String(String::from_utf8_lossy(bytes).into_owned()),
        Value::Int(i) => Json::from(*i),
        Value::List(items) => Json::Array(items.iter().map(to_json).collect()),
        Value::Dict(entries) => {
            let mut keys: Vec<&Vec<u8>> = entries.keys().collect();
            keys.sort();

            let mut map = Map::new();
            for key in keys {
                let name = String::from_utf8_lossy(key).into_owned();
                map.insert(name, to_json(&entries[key]));
            }
            Json::Object(map)
        }
    }
}
