//! Self-describing binary row codec shared by all storage engines.
//!
//! Layout:
//!   [field_count: u16]
//!   per field: [type_tag: u8][payload]
//!
//! Tag 0 is NULL and carries no payload. Fixed-width types store their
//! native little-endian encoding; TEXT and BLOB are u32-length-prefixed.
//! The stored field count lets old rows survive ALTER TABLE ADD COLUMN:
//! missing trailing fields deserialize as NULL.

use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::{Result, VaultError};
use crate::types::{Ulid, Value};

const TAG_NULL: u8 = 0;
const TAG_INTEGER: u8 = 1;
const TAG_REAL: u8 = 2;
const TAG_DECIMAL: u8 = 3;
const TAG_TEXT: u8 = 4;
const TAG_BOOLEAN: u8 = 5;
const TAG_DATETIME: u8 = 6;
const TAG_BLOB: u8 = 7;
const TAG_ULID: u8 = 8;
const TAG_GUID: u8 = 9;

pub fn serialize_row(values: &[Value]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(2 + values.len() * 9);
    buf.extend_from_slice(&(values.len() as u16).to_le_bytes());
    for value in values {
        match value {
            Value::Null => buf.push(TAG_NULL),
            Value::Integer(n) => {
                buf.push(TAG_INTEGER);
                buf.extend_from_slice(&n.to_le_bytes());
            }
            Value::Real(n) => {
                buf.push(TAG_REAL);
                buf.extend_from_slice(&n.to_le_bytes());
            }
            Value::Decimal(d) => {
                buf.push(TAG_DECIMAL);
                buf.extend_from_slice(&d.serialize());
            }
            Value::Text(s) => {
                buf.push(TAG_TEXT);
                buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
                buf.extend_from_slice(s.as_bytes());
            }
            Value::Boolean(b) => {
                buf.push(TAG_BOOLEAN);
                buf.push(u8::from(*b));
            }
            Value::DateTime(t) => {
                buf.push(TAG_DATETIME);
                buf.extend_from_slice(&t.to_le_bytes());
            }
            Value::Blob(b) => {
                buf.push(TAG_BLOB);
                buf.extend_from_slice(&(b.len() as u32).to_le_bytes());
                buf.extend_from_slice(b);
            }
            Value::Ulid(u) => {
                buf.push(TAG_ULID);
                buf.extend_from_slice(&u.to_bytes());
            }
            Value::Guid(g) => {
                buf.push(TAG_GUID);
                buf.extend_from_slice(g.as_bytes());
            }
        }
    }
    buf
}

/// Deserialize a row, padding with NULL up to `expected_columns` when the
/// stored row is shorter than the current schema.
pub fn deserialize_row(data: &[u8], expected_columns: usize) -> Result<Vec<Value>> {
    let corrupt = || VaultError::Corruption("truncated row record".to_string());

    if data.len() < 2 {
        return Err(corrupt());
    }
    let stored = u16::from_le_bytes(data[0..2].try_into().expect("2-byte slice")) as usize;
    let mut offset = 2;
    let mut values = Vec::with_capacity(stored.max(expected_columns));

    fn take_slice<'a>(data: &'a [u8], offset: &mut usize, n: usize) -> Result<&'a [u8]> {
        if data.len() < *offset + n {
            return Err(VaultError::Corruption("truncated row record".to_string()));
        }
        let slice = &data[*offset..*offset + n];
        *offset += n;
        Ok(slice)
    }
    let take = |offset: &mut usize, n: usize| take_slice(data, offset, n);

    for _ in 0..stored {
        let tag = *take(&mut offset, 1)?.first().ok_or_else(corrupt)?;
        let value = match tag {
            TAG_NULL => Value::Null,
            TAG_INTEGER => {
                let bytes = take(&mut offset, 8)?;
                Value::Integer(i64::from_le_bytes(bytes.try_into().expect("8-byte slice")))
            }
            TAG_REAL => {
                let bytes = take(&mut offset, 8)?;
                Value::Real(f64::from_le_bytes(bytes.try_into().expect("8-byte slice")))
            }
            TAG_DECIMAL => {
                let bytes = take(&mut offset, 16)?;
                Value::Decimal(Decimal::deserialize(bytes.try_into().expect("16-byte slice")))
            }
            TAG_TEXT => {
                let len = u32::from_le_bytes(take(&mut offset, 4)?.try_into().expect("4-byte slice")) as usize;
                let bytes = take(&mut offset, len)?;
                Value::Text(
                    String::from_utf8(bytes.to_vec())
                        .map_err(|_| VaultError::Corruption("non-UTF-8 text field".to_string()))?,
                )
            }
            TAG_BOOLEAN => Value::Boolean(*take(&mut offset, 1)?.first().ok_or_else(corrupt)? != 0),
            TAG_DATETIME => {
                let bytes = take(&mut offset, 8)?;
                Value::DateTime(i64::from_le_bytes(bytes.try_into().expect("8-byte slice")))
            }
            TAG_BLOB => {
                let len = u32::from_le_bytes(take(&mut offset, 4)?.try_into().expect("4-byte slice")) as usize;
                Value::Blob(take(&mut offset, len)?.to_vec())
            }
            TAG_ULID => {
                let bytes = take(&mut offset, 16)?;
                Value::Ulid(Ulid::from_bytes(bytes.try_into().expect("16-byte slice")))
            }
            TAG_GUID => {
                let bytes = take(&mut offset, 16)?;
                Value::Guid(Uuid::from_bytes(bytes.try_into().expect("16-byte slice")))
            }
            other => {
                return Err(VaultError::Corruption(format!("unknown row field tag {other}")));
            }
        };
        values.push(value);
    }

    while values.len() < expected_columns {
        values.push(Value::Null);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_all_types() {
        let values = vec![
            Value::Integer(-42),
            Value::Real(3.5),
            Value::Decimal(Decimal::new(12345, 2)),
            Value::Text("hello ''world''".to_string()),
            Value::Boolean(true),
            Value::DateTime(crate::types::now_ticks()),
            Value::Blob(vec![0, 1, 2, 255]),
            Value::Ulid(Ulid::generate()),
            Value::Guid(Uuid::new_v4()),
            Value::Null,
        ];
        let bytes = serialize_row(&values);
        let back = deserialize_row(&bytes, values.len()).unwrap();
        assert_eq!(back, values);
    }

    #[test]
    fn test_short_row_pads_null() {
        let values = vec![Value::Integer(1), Value::Text("a".to_string())];
        let bytes = serialize_row(&values);
        let back = deserialize_row(&bytes, 4).unwrap();
        assert_eq!(back.len(), 4);
        assert_eq!(back[2], Value::Null);
        assert_eq!(back[3], Value::Null);
    }

    #[test]
    fn test_truncated_row_is_corruption() {
        let values = vec![Value::Text("abcdef".to_string())];
        let mut bytes = serialize_row(&values);
        bytes.truncate(bytes.len() - 3);
        assert!(matches!(
            deserialize_row(&bytes, 1),
            Err(VaultError::Corruption(_))
        ));
    }
}
