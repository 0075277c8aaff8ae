//! # haven-bencode
//!
//! Exact bencode codec for the peer RPC surface and push frames.
//!
//! The wire contract requires dict keys emitted in byte-sorted order and
//! byte strings carried raw (a bencoded response embeds message data
//! without base64). Dicts are backed by a `BTreeMap<Vec<u8>, Value>`, which
//! gives sorted emission for free. The JSON bridge at the bottom mirrors
//! the request handler's rule that responses echo the caller's encoding:
//! byte strings that are valid UTF-8 become JSON strings, anything else is
//! base64-encoded.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

/// Errors from decoding bencoded input.
#[derive(Debug, thiserror::Error)]
pub enum BencodeError {
    #[error("truncated input at offset {0}")]
    Truncated(usize),

    #[error("invalid byte {byte:#04x} at offset {offset}")]
    InvalidByte { byte: u8, offset: usize },

    #[error("invalid integer")]
    InvalidInt,

    #[error("string length overflow")]
    LengthOverflow,

    #[error("dict keys not sorted or duplicated")]
    UnsortedKeys,

    #[error("trailing bytes after value")]
    TrailingData,
}

pub type Result<T> = std::result::Result<T, BencodeError>;

/// A bencoded value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    /// Convenience constructor for a byte-string value.
    pub fn bytes(b: impl Into<Vec<u8>>) -> Self {
        Value::Bytes(b.into())
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Encode this value to bencode bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        encode_into(self, &mut out);
        out
    }
}

/// Build a dict from `(key, value)` pairs.
pub fn dict<const N: usize>(pairs: [(&[u8], Value); N]) -> Value {
    Value::Dict(
        pairs
            .into_iter()
            .map(|(k, v)| (k.to_vec(), v))
            .collect(),
    )
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Int(i) => {
            out.push(b'i');
            out.extend_from_slice(i.to_string().as_bytes());
            out.push(b'e');
        }
        Value::Bytes(b) => {
            out.extend_from_slice(b.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(b);
        }
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        Value::Dict(map) => {
            out.push(b'd');
            for (k, v) in map {
                out.extend_from_slice(k.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(k);
                encode_into(v, out);
            }
            out.push(b'e');
        }
    }
}

/// Decode a single bencoded value; trailing bytes are an error.
pub fn decode(input: &[u8]) -> Result<Value> {
    let mut pos = 0;
    let value = decode_at(input, &mut pos)?;
    if pos != input.len() {
        return Err(BencodeError::TrailingData);
    }
    Ok(value)
}

fn decode_at(input: &[u8], pos: &mut usize) -> Result<Value> {
    match input.get(*pos).copied() {
        None => Err(BencodeError::Truncated(*pos)),
        Some(b'i') => {
            *pos += 1;
            let end = find(input, *pos, b'e')?;
            let s = std::str::from_utf8(&input[*pos..end]).map_err(|_| BencodeError::InvalidInt)?;
            // Reject leading zeros and bare/negative-zero forms, per spec.
            if s.is_empty()
                || s == "-"
                || (s.len() > 1 && s.starts_with('0'))
                || (s.len() > 2 && s.starts_with("-0"))
                || s == "-0"
            {
                return Err(BencodeError::InvalidInt);
            }
            let value = s.parse::<i64>().map_err(|_| BencodeError::InvalidInt)?;
            *pos = end + 1;
            Ok(Value::Int(value))
        }
        Some(b'l') => {
            *pos += 1;
            let mut items = Vec::new();
            loop {
                match input.get(*pos).copied() {
                    None => return Err(BencodeError::Truncated(*pos)),
                    Some(b'e') => {
                        *pos += 1;
                        return Ok(Value::List(items));
                    }
                    Some(_) => items.push(decode_at(input, pos)?),
                }
            }
        }
        Some(b'd') => {
            *pos += 1;
            let mut map = BTreeMap::new();
            let mut last_key: Option<Vec<u8>> = None;
            loop {
                match input.get(*pos).copied() {
                    None => return Err(BencodeError::Truncated(*pos)),
                    Some(b'e') => {
                        *pos += 1;
                        return Ok(Value::Dict(map));
                    }
                    Some(_) => {
                        let key = match decode_at(input, pos)? {
                            Value::Bytes(k) => k,
                            _ => {
                                return Err(BencodeError::InvalidByte {
                                    byte: input[*pos - 1],
                                    offset: *pos - 1,
                                })
                            }
                        };
                        if let Some(prev) = &last_key {
                            if *prev >= key {
                                return Err(BencodeError::UnsortedKeys);
                            }
                        }
                        let value = decode_at(input, pos)?;
                        last_key = Some(key.clone());
                        map.insert(key, value);
                    }
                }
            }
        }
        Some(b'0'..=b'9') => {
            let colon = find(input, *pos, b':')?;
            let len_str =
                std::str::from_utf8(&input[*pos..colon]).map_err(|_| BencodeError::InvalidInt)?;
            let len = len_str
                .parse::<usize>()
                .map_err(|_| BencodeError::LengthOverflow)?;
            let start = colon + 1;
            let end = start.checked_add(len).ok_or(BencodeError::LengthOverflow)?;
            if end > input.len() {
                return Err(BencodeError::Truncated(input.len()));
            }
            *pos = end;
            Ok(Value::Bytes(input[start..end].to_vec()))
        }
        Some(byte) => Err(BencodeError::InvalidByte { byte, offset: *pos }),
    }
}

fn find(input: &[u8], from: usize, needle: u8) -> Result<usize> {
    input[from..]
        .iter()
        .position(|&b| b == needle)
        .map(|i| from + i)
        .ok_or(BencodeError::Truncated(input.len()))
}

// ---------------------------------------------------------------------------
// JSON bridge
// ---------------------------------------------------------------------------

/// Convert a JSON value to its bencoded form.
///
/// Floats and nulls have no bencode representation; they become the empty
/// byte string, matching the forwarding behavior of the request handler
/// (no core response contains either).
pub fn from_json(j: &serde_json::Value) -> Value {
    match j {
        serde_json::Value::Null => Value::Bytes(Vec::new()),
        serde_json::Value::Bool(b) => Value::Int(i64::from(*b)),
        serde_json::Value::Number(n) => n
            .as_i64()
            .map(Value::Int)
            .unwrap_or_else(|| Value::Bytes(n.to_string().into_bytes())),
        serde_json::Value::String(s) => Value::Bytes(s.clone().into_bytes()),
        serde_json::Value::Array(items) => Value::List(items.iter().map(from_json).collect()),
        serde_json::Value::Object(map) => Value::Dict(
            map.iter()
                .map(|(k, v)| (k.clone().into_bytes(), from_json(v)))
                .collect(),
        ),
    }
}

/// Convert a bencoded value to JSON.
///
/// Byte strings that are valid UTF-8 map to JSON strings; all others are
/// base64-encoded, since JSON cannot carry raw bytes.
pub fn to_json(v: &Value) -> serde_json::Value {
    match v {
        Value::Int(i) => serde_json::Value::from(*i),
        Value::Bytes(b) => match std::str::from_utf8(b) {
            Ok(s) => serde_json::Value::String(s.to_string()),
            Err(_) => serde_json::Value::String(BASE64.encode(b)),
        },
        Value::List(items) => serde_json::Value::Array(items.iter().map(to_json).collect()),
        Value::Dict(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let key = String::from_utf8_lossy(k).into_owned();
                    (key, to_json(v))
                })
                .collect(),
        ),
    }
}
