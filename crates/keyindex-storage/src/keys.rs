//! Key encoding and decoding for the storage layer.
//!
//! Index entry format: `{index_key}\x1E{source_id}`
//! - each component is an order-preserving [`KeyValue`] encoding
//! - `0x1E` (record separator) splits the components
//! - `0x1F` is the exclusive upper bound for a per-key range scan
//!
//! Key value encoding is a type tag followed by a payload:
//! - Null `0x00`, false `0x02`, true `0x03`
//! - Int `0x10` + 8 bytes big-endian with the sign bit flipped
//! - Str `0x20` + UTF-8 bytes, where every byte below `0x20` is escaped as
//!   `0x1D, byte + 0x40` so the separator bytes never occur inside a string
//!
//! The progress marker lives at `0x01 0x02`, below every tag an entry key
//! can start with.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Separates the index key from the source id in an entry key
pub const SEPARATOR: u8 = 0x1E;

/// Exclusive upper bound for scans over one index key
pub const SEPARATOR_NEXT: u8 = 0x1F;

/// Reserved key holding the last durably indexed source version
pub const PROGRESS_MARKER_KEY: &[u8] = &[0x01, 0x02];

const TAG_NULL: u8 = 0x00;
const TAG_FALSE: u8 = 0x02;
const TAG_TRUE: u8 = 0x03;
const TAG_INT: u8 = 0x10;
const TAG_STR: u8 = 0x20;

const ESCAPE: u8 = 0x1D;
const ESCAPE_OFFSET: u8 = 0x40;

/// A comparable value used as an index key or a source id.
///
/// The derived ordering matches the byte ordering of the encoding, except
/// that strings containing control characters sort those characters ahead
/// of the string terminator.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyValue {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
}

impl KeyValue {
    /// Append the order-preserving encoding of this value to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            KeyValue::Null => buf.push(TAG_NULL),
            KeyValue::Bool(false) => buf.push(TAG_FALSE),
            KeyValue::Bool(true) => buf.push(TAG_TRUE),
            KeyValue::Int(n) => {
                buf.push(TAG_INT);
                buf.extend_from_slice(&((*n as u64) ^ (1 << 63)).to_be_bytes());
            }
            KeyValue::Str(s) => {
                buf.push(TAG_STR);
                for &b in s.as_bytes() {
                    if b < 0x20 {
                        buf.push(ESCAPE);
                        buf.push(b + ESCAPE_OFFSET);
                    } else {
                        buf.push(b);
                    }
                }
            }
        }
    }

    /// Encode to a fresh byte vector.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16);
        self.encode_into(&mut buf);
        buf
    }

    /// Decode one value from the front of `bytes`.
    ///
    /// Strings stop at a separator byte or at the end of input. Returns the
    /// value and the number of bytes consumed.
    pub fn decode_prefix(bytes: &[u8]) -> Result<(Self, usize), StorageError> {
        let (&tag, rest) = bytes
            .split_first()
            .ok_or_else(|| StorageError::Key("empty key".to_string()))?;

        match tag {
            TAG_NULL => Ok((KeyValue::Null, 1)),
            TAG_FALSE => Ok((KeyValue::Bool(false), 1)),
            TAG_TRUE => Ok((KeyValue::Bool(true), 1)),
            TAG_INT => {
                let raw: [u8; 8] = rest
                    .get(..8)
                    .and_then(|s| s.try_into().ok())
                    .ok_or_else(|| StorageError::Key("truncated integer".to_string()))?;
                let n = (u64::from_be_bytes(raw) ^ (1 << 63)) as i64;
                Ok((KeyValue::Int(n), 9))
            }
            TAG_STR => {
                let mut out = Vec::with_capacity(rest.len());
                let mut i = 0;
                while i < rest.len() {
                    let b = rest[i];
                    if b == SEPARATOR || b == SEPARATOR_NEXT {
                        break;
                    }
                    if b == ESCAPE {
                        let escaped = rest
                            .get(i + 1)
                            .copied()
                            .filter(|e| (ESCAPE_OFFSET..ESCAPE_OFFSET + 0x20).contains(e))
                            .ok_or_else(|| StorageError::Key("invalid escape".to_string()))?;
                        out.push(escaped - ESCAPE_OFFSET);
                        i += 2;
                        continue;
                    }
                    out.push(b);
                    i += 1;
                }
                let s = String::from_utf8(out)
                    .map_err(|e| StorageError::Key(format!("Invalid UTF-8: {}", e)))?;
                Ok((KeyValue::Str(s), 1 + i))
            }
            other => Err(StorageError::Key(format!("unknown key tag 0x{:02x}", other))),
        }
    }

    /// Decode a value that must span all of `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        let (value, used) = Self::decode_prefix(bytes)?;
        if used != bytes.len() {
            return Err(StorageError::Key(format!(
                "trailing bytes after key value ({} of {})",
                used,
                bytes.len()
            )));
        }
        Ok(value)
    }

    /// Parse a command-line style key: integers when possible, strings otherwise.
    pub fn parse_lenient(s: &str) -> Self {
        match s.parse::<i64>() {
            Ok(n) => KeyValue::Int(n),
            Err(_) => KeyValue::Str(s.to_string()),
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Null => write!(f, "null"),
            KeyValue::Bool(b) => write!(f, "{}", b),
            KeyValue::Int(n) => write!(f, "{}", n),
            KeyValue::Str(s) => write!(f, "{:?}", s),
        }
    }
}

impl From<&str> for KeyValue {
    fn from(s: &str) -> Self {
        KeyValue::Str(s.to_string())
    }
}

impl From<String> for KeyValue {
    fn from(s: String) -> Self {
        KeyValue::Str(s)
    }
}

impl From<i64> for KeyValue {
    fn from(n: i64) -> Self {
        KeyValue::Int(n)
    }
}

impl From<i32> for KeyValue {
    fn from(n: i32) -> Self {
        KeyValue::Int(n as i64)
    }
}

impl From<bool> for KeyValue {
    fn from(b: bool) -> Self {
        KeyValue::Bool(b)
    }
}

/// Key for one index entry
/// Format: {index_key}\x1E{source_id}
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntryKey {
    /// Value the entry is filed under
    pub index_key: KeyValue,
    /// Entity that contributed the entry
    pub source_id: KeyValue,
}

impl EntryKey {
    pub fn new(index_key: KeyValue, source_id: KeyValue) -> Self {
        Self {
            index_key,
            source_id,
        }
    }

    /// Encode key to bytes for storage
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32);
        self.index_key.encode_into(&mut buf);
        buf.push(SEPARATOR);
        self.source_id.encode_into(&mut buf);
        buf
    }

    /// Decode key from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StorageError> {
        let (index_key, used) = KeyValue::decode_prefix(bytes)?;
        if bytes.get(used) != Some(&SEPARATOR) {
            return Err(StorageError::Key("missing entry separator".to_string()));
        }
        let source_id = KeyValue::decode(&bytes[used + 1..])?;
        Ok(Self {
            index_key,
            source_id,
        })
    }

    /// Scan bounds `[lower, upper)` covering every entry under `index_key`.
    pub fn range_for(index_key: &KeyValue) -> (Vec<u8>, Vec<u8>) {
        let mut lower = index_key.to_bytes();
        let mut upper = lower.clone();
        lower.push(SEPARATOR);
        upper.push(SEPARATOR_NEXT);
        (lower, upper)
    }

    /// Whether `bytes` belongs to an entry rather than a reserved key.
    pub fn is_entry_key(bytes: &[u8]) -> bool {
        bytes != PROGRESS_MARKER_KEY
    }
}

/// Key for entity table changelog rows
/// Format: ver:{version:020}
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionKey {
    /// Monotonic table version
    pub version: u64,
}

impl VersionKey {
    pub fn new(version: u64) -> Self {
        Self { version }
    }

    /// Encode key to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        format!("ver:{:020}", self.version).into_bytes()
    }

    /// Decode key from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StorageError> {
        let s = std::str::from_utf8(bytes)
            .map_err(|e| StorageError::Key(format!("Invalid UTF-8: {}", e)))?;

        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 2 || parts[0] != "ver" {
            return Err(StorageError::Key(format!("Invalid version key format: {}", s)));
        }

        let version: u64 = parts[1]
            .parse()
            .map_err(|e| StorageError::Key(format!("Invalid version: {}", e)))?;

        Ok(Self { version })
    }
}
