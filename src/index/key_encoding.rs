//! Order-preserving key encoding for index keys.
//!
//! Ordinal ordering only: byte-wise for text, bit-pattern derived for
//! numbers. Culture-aware collation is out of scope.
//!
//! Two encodings with different contracts:
//!
//! * `encode_value` — index keys. Numeric types share one keyspace via
//!   the f64 image, which is monotone (x <= y implies f64(x) <= f64(y)),
//!   so range scans never miss a row; distinct values may collide on one
//!   key, which is why index access paths always re-apply the predicate
//!   to candidate rows.
//! * `encode_primary_key` — exact identity for MVCC version chains.
//!   No two distinct values share an encoding.

use rust_decimal::prelude::ToPrimitive;

use crate::error::{Result, VaultError};
use crate::types::Value;

/// Encode i64 into 8 bytes that preserve sort order under byte comparison
/// (big-endian with the sign bit flipped).
pub fn encode_i64(val: i64) -> [u8; 8] {
    let unsigned = (val as u64) ^ (1u64 << 63);
    unsigned.to_be_bytes()
}

pub fn decode_i64(bytes: &[u8; 8]) -> i64 {
    let unsigned = u64::from_be_bytes(*bytes);
    (unsigned ^ (1u64 << 63)) as i64
}

/// Encode f64 so byte comparison matches numeric order (flip all bits for
/// negatives, flip the sign bit for positives).
pub fn encode_f64(val: f64) -> [u8; 8] {
    let bits = val.to_bits();
    let ordered = if bits & (1u64 << 63) != 0 {
        !bits
    } else {
        bits ^ (1u64 << 63)
    };
    ordered.to_be_bytes()
}

const KEY_BOOL: u8 = 1;
const KEY_NUMERIC: u8 = 2;
const KEY_DATETIME: u8 = 3;
const KEY_TEXT: u8 = 4;
const KEY_BLOB: u8 = 5;
const KEY_ULID: u8 = 6;
const KEY_GUID: u8 = 7;

fn null_key_error() -> VaultError {
    VaultError::Internal("NULL cannot be an index key".to_string())
}

/// Ordinal index key. NULL keys are not indexed and must be filtered
/// before this point.
pub fn encode_value(value: &Value) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(10);
    match value {
        Value::Null => return Err(null_key_error()),
        Value::Boolean(b) => {
            out.push(KEY_BOOL);
            out.push(u8::from(*b));
        }
        Value::Integer(v) => {
            out.push(KEY_NUMERIC);
            out.extend_from_slice(&encode_f64(*v as f64));
        }
        Value::Real(v) => {
            out.push(KEY_NUMERIC);
            out.extend_from_slice(&encode_f64(*v));
        }
        Value::Decimal(d) => {
            out.push(KEY_NUMERIC);
            out.extend_from_slice(&encode_f64(d.to_f64().unwrap_or(0.0)));
        }
        Value::DateTime(t) => {
            out.push(KEY_DATETIME);
            out.extend_from_slice(&encode_i64(*t));
        }
        Value::Text(s) => {
            out.push(KEY_TEXT);
            out.extend_from_slice(s.as_bytes());
        }
        Value::Blob(b) => {
            out.push(KEY_BLOB);
            out.extend_from_slice(b);
        }
        Value::Ulid(u) => {
            out.push(KEY_ULID);
            out.extend_from_slice(&u.to_bytes());
        }
        Value::Guid(g) => {
            out.push(KEY_GUID);
            out.extend_from_slice(g.as_bytes());
        }
    }
    Ok(out)
}

/// Exact identity encoding for primary keys. Distinct values never share
/// an encoding; byte order is not meaningful across types.
pub fn encode_primary_key(value: &Value) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(18);
    match value {
        Value::Null => return Err(null_key_error()),
        Value::Boolean(b) => {
            out.push(KEY_BOOL);
            out.push(u8::from(*b));
        }
        Value::Integer(v) => {
            out.push(KEY_NUMERIC);
            out.extend_from_slice(&encode_i64(*v));
        }
        Value::Real(v) => {
            out.push(KEY_NUMERIC + 100);
            out.extend_from_slice(&v.to_bits().to_be_bytes());
        }
        Value::Decimal(d) => {
            out.push(KEY_NUMERIC + 101);
            out.extend_from_slice(&d.normalize().serialize());
        }
        Value::DateTime(t) => {
            out.push(KEY_DATETIME);
            out.extend_from_slice(&encode_i64(*t));
        }
        Value::Text(s) => {
            out.push(KEY_TEXT);
            out.extend_from_slice(s.as_bytes());
        }
        Value::Blob(b) => {
            out.push(KEY_BLOB);
            out.extend_from_slice(b);
        }
        Value::Ulid(u) => {
            out.push(KEY_ULID);
            out.extend_from_slice(&u.to_bytes());
        }
        Value::Guid(g) => {
            out.push(KEY_GUID);
            out.extend_from_slice(g.as_bytes());
        }
    }
    Ok(out)
}
