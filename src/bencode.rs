//! Bencode codec.
//!
//! A streaming decoder producing a tagged value tree, and a canonical
//! encoder used for info-hash computation. Byte strings are kept as raw
//! bytes throughout; `pieces` is binary and must never round-trip through
//! UTF-8 conversion. The decoder reports how many bytes it consumed so
//! callers embedding bencode in a larger payload (the ut_metadata data
//! message) know where the value ends.
//!
//! Bencode format:
//! - Integers:   `i<number>e`        Example: `i42e`
//! - Strings:    `<length>:<data>`   Example: `4:spam`
//! - Lists:      `l<items>e`         Example: `l4:spami42ee`
//! - Dicts:      `d<pairs>e`         Example: `d3:cow3:moo4:spam4:eggse`

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{BencodeErrorKind, Error, Result};

/// Maximum declared length for a single bencode string (100 MiB). Bounds
/// allocation when decoding hostile input.
const MAX_STRING_LENGTH: usize = 100 * 1024 * 1024;

/// A bencode value.
#[derive(Clone, PartialEq, Eq)]
pub enum Value {
    /// Integer value (can be negative).
    Integer(i64),
    /// Byte string, not necessarily valid UTF-8.
    Bytes(Vec<u8>),
    /// List of values.
    List(Vec<Value>),
    /// Dictionary with byte-string keys, held sorted by raw key bytes.
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(n) => write!(f, "Integer({n})"),
            Self::Bytes(b) => match std::str::from_utf8(b) {
                Ok(s) if s.len() <= 50 => write!(f, "Bytes({s:?})"),
                _ => write!(f, "Bytes([{} bytes])", b.len()),
            },
            Self::List(l) => f.debug_tuple("List").field(l).finish(),
            Self::Dict(d) => {
                let readable: BTreeMap<String, &Value> = d
                    .iter()
                    .map(|(k, v)| (String::from_utf8_lossy(k).into_owned(), v))
                    .collect();
                f.debug_tuple("Dict").field(&readable).finish()
            }
        }
    }
}

impl Value {
    /// Decode one bencoded value from the front of `data`.
    ///
    /// Returns the value and the number of bytes consumed, so nested parses
    /// know where to resume.
    pub fn decode(data: &[u8]) -> Result<(Value, usize)> {
        let mut decoder = Decoder { data, pos: 0 };
        let value = decoder.value()?;
        Ok((value, decoder.pos))
    }

    /// Decode a complete bencoded value, rejecting trailing bytes.
    pub fn decode_exact(data: &[u8]) -> Result<Value> {
        let (value, consumed) = Self::decode(data)?;
        if consumed != data.len() {
            return Err(Error::bencode(
                BencodeErrorKind::TrailingData,
                consumed,
                data,
            ));
        }
        Ok(value)
    }

    /// Canonically encode this value: dictionary keys in ascending raw-byte
    /// order, integers without leading zeros, strings as raw bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_to(&mut buf);
        buf
    }

    /// Canonically encode into an existing buffer.
    pub fn encode_to(&self, buf: &mut Vec<u8>) {
        match self {
            Self::Integer(n) => {
                buf.push(b'i');
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.push(b'e');
            }
            Self::Bytes(b) => {
                buf.extend_from_slice(b.len().to_string().as_bytes());
                buf.push(b':');
                buf.extend_from_slice(b);
            }
            Self::List(items) => {
                buf.push(b'l');
                for item in items {
                    item.encode_to(buf);
                }
                buf.push(b'e');
            }
            Self::Dict(entries) => {
                buf.push(b'd');
                for (key, value) in entries {
                    buf.extend_from_slice(key.len().to_string().as_bytes());
                    buf.push(b':');
                    buf.extend_from_slice(key);
                    value.encode_to(buf);
                }
                buf.push(b'e');
            }
        }
    }

    // Accessors. `as_str` is a presentation hint only; hashing and
    // re-encoding always operate on the raw bytes.

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_uint(&self) -> Option<u64> {
        match self {
            Self::Integer(n) if *n >= 0 => Some(*n as u64),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Self::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Get a dictionary value by UTF-8 key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Self::Dict(d) => d.get(key.as_bytes()),
            _ => None,
        }
    }
}

/// Recursive single-pass decoder over a byte buffer.
struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn fail<T>(&self, kind: BencodeErrorKind, offset: usize) -> Result<T> {
        Err(Error::bencode(kind, offset, self.data))
    }

    fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn value(&mut self) -> Result<Value> {
        match self.peek() {
            None => self.fail(BencodeErrorKind::UnexpectedEnd, self.pos),
            Some(b'i') => self.integer(),
            Some(b'l') => self.list(),
            Some(b'd') => self.dict(),
            Some(b'0'..=b'9') => Ok(Value::Bytes(self.byte_string()?)),
            Some(_) => self.fail(BencodeErrorKind::InvalidPrefix, self.pos),
        }
    }

    /// `i<ascii decimal>e`. Rejects leading zeros (except `i0e`), `-0`, and
    /// a bare `-`.
    fn integer(&mut self) -> Result<Value> {
        let start = self.pos;
        self.pos += 1; // skip 'i'

        let end = match self.data[self.pos..].iter().position(|&b| b == b'e') {
            Some(rel) => self.pos + rel,
            None => return self.fail(BencodeErrorKind::UnexpectedEnd, start),
        };

        let digits = &self.data[self.pos..end];
        let text = match std::str::from_utf8(digits) {
            Ok(t) if !t.is_empty() => t,
            _ => return self.fail(BencodeErrorKind::InvalidInteger, start),
        };

        if text.len() > 1 && (text.starts_with('0') || text.starts_with("-0")) {
            return self.fail(BencodeErrorKind::InvalidInteger, start);
        }
        if text == "-0" {
            return self.fail(BencodeErrorKind::InvalidInteger, start);
        }

        // A bare "-" or stray characters fail the numeric parse.
        let n: i64 = match text.parse() {
            Ok(n) => n,
            Err(_) => return self.fail(BencodeErrorKind::InvalidInteger, start),
        };

        self.pos = end + 1;
        Ok(Value::Integer(n))
    }

    /// `<len>:<bytes>` with exactly `len` octets.
    fn byte_string(&mut self) -> Result<Vec<u8>> {
        let start = self.pos;

        let colon = match self.data[self.pos..].iter().position(|&b| b == b':') {
            Some(rel) => self.pos + rel,
            None => return self.fail(BencodeErrorKind::UnexpectedEnd, start),
        };

        let len: usize = match std::str::from_utf8(&self.data[self.pos..colon])
            .ok()
            .and_then(|t| t.parse().ok())
        {
            Some(len) => len,
            None => return self.fail(BencodeErrorKind::InvalidLength, start),
        };

        if len > MAX_STRING_LENGTH {
            return self.fail(BencodeErrorKind::OversizedString, start);
        }

        let body = colon + 1;
        let end = match body.checked_add(len) {
            Some(end) if end <= self.data.len() => end,
            _ => return self.fail(BencodeErrorKind::StringPastEnd, start),
        };

        self.pos = end;
        Ok(self.data[body..end].to_vec())
    }

    /// `l<elements>e`
    fn list(&mut self) -> Result<Value> {
        let start = self.pos;
        self.pos += 1; // skip 'l'

        let mut items = Vec::new();
        loop {
            match self.peek() {
                None => return self.fail(BencodeErrorKind::UnexpectedEnd, start),
                Some(b'e') => {
                    self.pos += 1;
                    return Ok(Value::List(items));
                }
                Some(_) => items.push(self.value()?),
            }
        }
    }

    /// `d<(key,value) pairs>e`. Keys must be byte strings; the decoder
    /// accepts them in any order, and the `BTreeMap` restores canonical
    /// ordering for re-encoding.
    fn dict(&mut self) -> Result<Value> {
        let start = self.pos;
        self.pos += 1; // skip 'd'

        let mut entries = BTreeMap::new();
        loop {
            match self.peek() {
                None => return self.fail(BencodeErrorKind::UnexpectedEnd, start),
                Some(b'e') => {
                    self.pos += 1;
                    return Ok(Value::Dict(entries));
                }
                Some(b'0'..=b'9') => {
                    let key = self.byte_string()?;
                    let value = self.value()?;
                    entries.insert(key, value);
                }
                Some(_) => return self.fail(BencodeErrorKind::NonStringKey, self.pos),
            }
        }
    }
}
