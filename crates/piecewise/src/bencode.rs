//! Bencode codec.
//!
//! Decoding is recursive descent over an explicit cursor, so every call knows
//! exactly how many bytes the value it returned occupied. Encoding is
//! canonical: dictionary keys always come out in ascending byte order, which
//! is what makes the info hash reproducible.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};
use thiserror::Error;

const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BencodeError {
    #[error("malformed byte string length")]
    MalformedLength,
    #[error("malformed integer")]
    MalformedInteger,
    #[error("dictionary key is not a byte string")]
    InvalidKeyType,
    #[error("unsupported tag {0:#04x}")]
    UnsupportedTag(u8),
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("nesting deeper than {MAX_DEPTH} levels")]
    NestingTooDeep,
    #[error("trailing data after value")]
    TrailingData,
}

/// A decoded bencode value. Byte strings are raw bytes, not text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Bytes(Bytes),
    Integer(i64),
    List(Vec<Value>),
    Dict(BTreeMap<Bytes, Value>),
}

impl Value {
    pub fn string(s: &str) -> Self {
        Value::Bytes(Bytes::copy_from_slice(s.as_bytes()))
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the byte string as UTF-8, if it is one and it is valid.
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Bytes, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Looks `key` up when this value is a dictionary.
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict()?.get(key)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

impl From<&[u8]> for Value {
    fn from(b: &[u8]) -> Self {
        Value::Bytes(Bytes::copy_from_slice(b))
    }
}

impl From<Vec<Value>> for Value {
    fn from(l: Vec<Value>) -> Self {
        Value::List(l)
    }
}

impl From<BTreeMap<Bytes, Value>> for Value {
    fn from(d: BTreeMap<Bytes, Value>) -> Self {
        Value::Dict(d)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Bytes(b) => serializer.serialize_str(&String::from_utf8_lossy(b)),
            Value::Integer(i) => serializer.serialize_i64(*i),
            Value::List(l) => {
                let mut seq = serializer.serialize_seq(Some(l.len()))?;
                for item in l {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Dict(d) => {
                let mut map = serializer.serialize_map(Some(d.len()))?;
                for (k, v) in d {
                    map.serialize_entry(&String::from_utf8_lossy(k), v)?;
                }
                map.end()
            }
        }
    }
}

/// Decodes `buf` as exactly one value.
pub fn decode(buf: &[u8]) -> Result<Value, BencodeError> {
    let (value, consumed) = decode_prefix(buf, 0)?;
    if consumed != buf.len() {
        return Err(BencodeError::TrailingData);
    }
    Ok(value)
}

/// Decodes one value starting at `offset` and returns it together with the
/// number of bytes it occupied. Anything after the value is left untouched.
pub fn decode_prefix(buf: &[u8], offset: usize) -> Result<(Value, usize), BencodeError> {
    let mut pos = offset;
    let value = decode_value(buf, &mut pos, 0)?;
    Ok((value, pos - offset))
}

fn decode_value(buf: &[u8], pos: &mut usize, depth: usize) -> Result<Value, BencodeError> {
    if depth > MAX_DEPTH {
        return Err(BencodeError::NestingTooDeep);
    }
    match buf.get(*pos) {
        None => Err(BencodeError::UnexpectedEof),
        Some(b'0'..=b'9') => decode_bytes(buf, pos).map(Value::Bytes),
        Some(b'i') => decode_integer(buf, pos),
        Some(b'l') => decode_list(buf, pos, depth),
        Some(b'd') => decode_dict(buf, pos, depth),
        Some(&tag) => Err(BencodeError::UnsupportedTag(tag)),
    }
}

fn decode_bytes(buf: &[u8], pos: &mut usize) -> Result<Bytes, BencodeError> {
    let start = *pos;
    let mut colon = start;
    while colon < buf.len() && buf[colon].is_ascii_digit() {
        colon += 1;
    }
    if colon == start || buf.get(colon) != Some(&b':') {
        return Err(BencodeError::MalformedLength);
    }

    // Only ASCII digits were scanned, so this is valid UTF-8.
    let len: usize = std::str::from_utf8(&buf[start..colon])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(BencodeError::MalformedLength)?;

    let data_start = colon + 1;
    let data_end = data_start
        .checked_add(len)
        .filter(|end| *end <= buf.len())
        .ok_or(BencodeError::MalformedLength)?;

    *pos = data_end;
    Ok(Bytes::copy_from_slice(&buf[data_start..data_end]))
}

fn decode_integer(buf: &[u8], pos: &mut usize) -> Result<Value, BencodeError> {
    let start = *pos + 1;
    let end = buf[start..]
        .iter()
        .position(|&b| b == b'e')
        .map(|i| start + i)
        .ok_or(BencodeError::MalformedInteger)?;

    let digits = &buf[start..end];
    let unsigned = digits.strip_prefix(b"-").unwrap_or(digits);
    if unsigned.is_empty() || !unsigned.iter().all(u8::is_ascii_digit) {
        return Err(BencodeError::MalformedInteger);
    }
    // No leading zeros, and no negative zero.
    if unsigned[0] == b'0' && (unsigned.len() > 1 || unsigned.len() != digits.len()) {
        return Err(BencodeError::MalformedInteger);
    }

    let value: i64 = std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(BencodeError::MalformedInteger)?;

    *pos = end + 1;
    Ok(Value::Integer(value))
}

fn decode_list(buf: &[u8], pos: &mut usize, depth: usize) -> Result<Value, BencodeError> {
    *pos += 1;
    let mut list = Vec::new();
    loop {
        match buf.get(*pos) {
            None => return Err(BencodeError::UnexpectedEof),
            Some(b'e') => break,
            Some(_) => list.push(decode_value(buf, pos, depth + 1)?),
        }
    }
    *pos += 1;
    Ok(Value::List(list))
}

fn decode_dict(buf: &[u8], pos: &mut usize, depth: usize) -> Result<Value, BencodeError> {
    *pos += 1;
    let mut dict = BTreeMap::new();
    loop {
        match buf.get(*pos) {
            None => return Err(BencodeError::UnexpectedEof),
            Some(b'e') => break,
            Some(b'0'..=b'9') => {
                let key = decode_bytes(buf, pos)?;
                let value = decode_value(buf, pos, depth + 1)?;
                dict.insert(key, value);
            }
            Some(_) => return Err(BencodeError::InvalidKeyType),
        }
    }
    *pos += 1;
    Ok(Value::Dict(dict))
}

/// Canonical encoding of `value`.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_into(value, &mut buf);
    buf
}

fn encode_into(value: &Value, buf: &mut Vec<u8>) {
    match value {
        Value::Bytes(b) => encode_bytes(b, buf),
        Value::Integer(i) => {
            buf.push(b'i');
            buf.extend_from_slice(i.to_string().as_bytes());
            buf.push(b'e');
        }
        Value::List(l) => {
            buf.push(b'l');
            for item in l {
                encode_into(item, buf);
            }
            buf.push(b'e');
        }
        Value::Dict(d) => {
            // BTreeMap iterates keys in ascending byte order.
            buf.push(b'd');
            for (key, item) in d {
                encode_bytes(key, buf);
                encode_into(item, buf);
            }
            buf.push(b'e');
        }
    }
}

fn encode_bytes(b: &[u8], buf: &mut Vec<u8>) {
    buf.extend_from_slice(b.len().to_string().as_bytes());
    buf.push(b':');
    buf.extend_from_slice(b);
}
