use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use rand::RngCore;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::{Result, VaultError};

/// DATETIME values are UTC ticks: 100-nanosecond intervals since
/// 0001-01-01T00:00:00Z. This constant is the Unix epoch in ticks.
pub const UNIX_EPOCH_TICKS: i64 = 621_355_968_000_000_000;

/// Ticks per second (100ns resolution).
pub const TICKS_PER_SECOND: i64 = 10_000_000;

pub fn now_ticks() -> i64 {
    let now = Utc::now();
    UNIX_EPOCH_TICKS + now.timestamp() * TICKS_PER_SECOND + i64::from(now.timestamp_subsec_nanos()) / 100
}

pub fn ticks_to_datetime(ticks: i64) -> Option<DateTime<Utc>> {
    let unix_ticks = ticks - UNIX_EPOCH_TICKS;
    let secs = unix_ticks.div_euclid(TICKS_PER_SECOND);
    let nanos = (unix_ticks.rem_euclid(TICKS_PER_SECOND) * 100) as u32;
    Utc.timestamp_opt(secs, nanos).single()
}

pub fn datetime_to_ticks(dt: &DateTime<Utc>) -> i64 {
    UNIX_EPOCH_TICKS + dt.timestamp() * TICKS_PER_SECOND + i64::from(dt.timestamp_subsec_nanos()) / 100
}

/// 128-bit ULID: 48-bit millisecond timestamp followed by 80 random bits.
/// Byte order is big-endian so the binary form sorts chronologically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ulid(pub u128);

const CROCKFORD: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

impl Ulid {
    pub fn generate() -> Self {
        let millis = (now_ticks() - UNIX_EPOCH_TICKS) / 10_000;
        let mut rand_bytes = [0u8; 10];
        rand::thread_rng().fill_bytes(&mut rand_bytes);
        let mut value = (millis as u128 & 0xFFFF_FFFF_FFFF) << 80;
        for (i, b) in rand_bytes.iter().enumerate() {
            value |= (*b as u128) << (72 - i * 8);
        }
        Ulid(value)
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Ulid(u128::from_be_bytes(bytes))
    }

    pub fn to_bytes(self) -> [u8; 16] {
        self.0.to_be_bytes()
    }

    pub fn parse(s: &str) -> Result<Self> {
        if s.len() != 26 {
            return Err(VaultError::Type(format!("invalid ULID literal: {s}")));
        }
        let mut value: u128 = 0;
        for c in s.bytes() {
            let digit = CROCKFORD
                .iter()
                .position(|&d| d == c.to_ascii_uppercase())
                .ok_or_else(|| VaultError::Type(format!("invalid ULID literal: {s}")))?;
            value = (value << 5) | digit as u128;
        }
        Ok(Ulid(value))
    }
}

impl fmt::Display for Ulid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = [0u8; 26];
        let mut v = self.0;
        for slot in out.iter_mut().rev() {
            *slot = CROCKFORD[(v & 0x1F) as usize];
            v >>= 5;
        }
        f.write_str(std::str::from_utf8(&out).expect("crockford output is ascii"))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Integer(i64),
    Real(f64),
    Decimal(Decimal),
    Text(String),
    Boolean(bool),
    /// UTC, 100-ns ticks since 0001-01-01.
    DateTime(i64),
    Blob(Vec<u8>),
    Ulid(Ulid),
    Guid(Uuid),
    Null,
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Value::Integer(_) => Some(DataType::Integer),
            Value::Real(_) => Some(DataType::Real),
            Value::Decimal(_) => Some(DataType::Decimal),
            Value::Text(_) => Some(DataType::Text),
            Value::Boolean(_) => Some(DataType::Boolean),
            Value::DateTime(_) => Some(DataType::DateTime),
            Value::Blob(_) => Some(DataType::Blob),
            Value::Ulid(_) => Some(DataType::Ulid),
            Value::Guid(_) => Some(DataType::Guid),
            Value::Null => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            Value::Boolean(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(v) => Some(*v as f64),
            Value::Real(v) => Some(*v),
            Value::Decimal(d) => d.to_f64(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            Value::Integer(v) => Some(*v != 0),
            _ => None,
        }
    }

    /// SQL comparison. Returns `None` when either side is NULL or the
    /// types are not comparable. Numerics compare across integer/real/
    /// decimal; everything else compares within its own type.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        use Value::*;
        match (self, other) {
            (Null, _) | (_, Null) => None,
            (Integer(a), Integer(b)) => Some(a.cmp(b)),
            (Text(a), Text(b)) => Some(a.cmp(b)),
            (Boolean(a), Boolean(b)) => Some(a.cmp(b)),
            (DateTime(a), DateTime(b)) => Some(a.cmp(b)),
            (Blob(a), Blob(b)) => Some(a.cmp(b)),
            (Ulid(a), Ulid(b)) => Some(a.cmp(b)),
            (Guid(a), Guid(b)) => Some(a.as_bytes().cmp(b.as_bytes())),
            (Decimal(a), Decimal(b)) => Some(a.cmp(b)),
            (Decimal(a), Integer(b)) => Some(a.cmp(&rust_decimal::Decimal::from(*b))),
            (Integer(a), Decimal(b)) => Some(rust_decimal::Decimal::from(*a).cmp(b)),
            _ => {
                let a = self.as_f64()?;
                let b = other.as_f64()?;
                a.partial_cmp(&b)
            }
        }
    }

    /// Coerce into the given column type on insert/update. NULL passes
    /// through unchanged; incompatible values are a type error.
    pub fn coerce(self, target: DataType) -> Result<Value> {
        if self.is_null() {
            return Ok(Value::Null);
        }
        let mismatch = |v: &Value| {
            VaultError::Type(format!("cannot store {} into {} column", v.type_name(), target))
        };
        Ok(match (target, self) {
            (DataType::Integer, v @ Value::Integer(_)) => v,
            (DataType::Integer, Value::Boolean(b)) => Value::Integer(i64::from(b)),
            (DataType::Real, Value::Real(v)) => Value::Real(v),
            (DataType::Real, Value::Integer(v)) => Value::Real(v as f64),
            (DataType::Decimal, Value::Decimal(d)) => Value::Decimal(d),
            (DataType::Decimal, Value::Integer(v)) => Value::Decimal(Decimal::from(v)),
            (DataType::Decimal, Value::Real(v)) => Decimal::try_from(v)
                .map(Value::Decimal)
                .map_err(|e| VaultError::Type(format!("cannot store {v} into DECIMAL column: {e}")))?,
            (DataType::Text, v @ Value::Text(_)) => v,
            (DataType::Boolean, v @ Value::Boolean(_)) => v,
            (DataType::Boolean, Value::Integer(v)) => Value::Boolean(v != 0),
            (DataType::DateTime, v @ Value::DateTime(_)) => v,
            (DataType::DateTime, Value::Integer(v)) => Value::DateTime(v),
            (DataType::DateTime, Value::Text(s)) => Value::DateTime(parse_datetime_text(&s)?),
            (DataType::Blob, v @ Value::Blob(_)) => v,
            (DataType::Ulid, v @ Value::Ulid(_)) => v,
            (DataType::Ulid, Value::Text(s)) => Value::Ulid(Ulid::parse(&s)?),
            (DataType::Guid, v @ Value::Guid(_)) => v,
            (DataType::Guid, Value::Text(s)) => Uuid::parse_str(&s)
                .map(Value::Guid)
                .map_err(|_| VaultError::Type(format!("invalid GUID literal: {s}")))?,
            (_, v) => return Err(mismatch(&v)),
        })
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Integer(_) => "INTEGER",
            Value::Real(_) => "REAL",
            Value::Decimal(_) => "DECIMAL",
            Value::Text(_) => "TEXT",
            Value::Boolean(_) => "BOOLEAN",
            Value::DateTime(_) => "DATETIME",
            Value::Blob(_) => "BLOB",
            Value::Ulid(_) => "ULID",
            Value::Guid(_) => "GUID",
            Value::Null => "NULL",
        }
    }
}

/// Parse `YYYY-MM-DD` or `YYYY-MM-DD HH:MM:SS` into ticks.
pub fn parse_datetime_text(s: &str) -> Result<i64> {
    let formats = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d"];
    for fmt in formats {
        if fmt == "%Y-%m-%d" {
            if let Ok(date) = chrono::NaiveDate::parse_from_str(s, fmt) {
                let dt = Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).expect("midnight is valid"));
                return Ok(datetime_to_ticks(&dt));
            }
        } else if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(datetime_to_ticks(&Utc.from_utc_datetime(&naive)));
        }
    }
    Err(VaultError::Type(format!("invalid DATETIME literal: {s}")))
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(v) => write!(f, "{v}"),
            Value::Real(v) => write!(f, "{v}"),
            Value::Decimal(v) => write!(f, "{v}"),
            Value::Text(v) => write!(f, "{v}"),
            Value::Boolean(v) => write!(f, "{}", if *v { "TRUE" } else { "FALSE" }),
            Value::DateTime(ticks) => match ticks_to_datetime(*ticks) {
                Some(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M:%S")),
                None => write!(f, "<datetime {ticks}>"),
            },
            Value::Blob(v) => write!(f, "<blob {} bytes>", v.len()),
            Value::Ulid(v) => write!(f, "{v}"),
            Value::Guid(v) => write!(f, "{v}"),
            Value::Null => write!(f, "NULL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Integer,
    Real,
    Decimal,
    Text,
    Boolean,
    DateTime,
    Blob,
    Ulid,
    Guid,
}

impl DataType {
    pub fn is_numeric(self) -> bool {
        matches!(self, DataType::Integer | DataType::Real | DataType::Decimal)
    }

    pub const fn tag(self) -> u8 {
        match self {
            DataType::Integer => 1,
            DataType::Real => 2,
            DataType::Decimal => 3,
            DataType::Text => 4,
            DataType::Boolean => 5,
            DataType::DateTime => 6,
            DataType::Blob => 7,
            DataType::Ulid => 8,
            DataType::Guid => 9,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            1 => DataType::Integer,
            2 => DataType::Real,
            3 => DataType::Decimal,
            4 => DataType::Text,
            5 => DataType::Boolean,
            6 => DataType::DateTime,
            7 => DataType::Blob,
            8 => DataType::Ulid,
            9 => DataType::Guid,
            _ => return None,
        })
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl DataType {
    pub fn name(self) -> &'static str {
        match self {
            DataType::Integer => "INTEGER",
            DataType::Real => "REAL",
            DataType::Decimal => "DECIMAL",
            DataType::Text => "TEXT",
            DataType::Boolean => "BOOLEAN",
            DataType::DateTime => "DATETIME",
            DataType::Blob => "BLOB",
            DataType::Ulid => "ULID",
            DataType::Guid => "GUID",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ulid_sorts_by_time() {
        let a = Ulid::generate();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = Ulid::generate();
        assert!(a < b);
    }

    #[test]
    fn test_ulid_display_roundtrip() {
        let u = Ulid::generate();
        let s = u.to_string();
        assert_eq!(s.len(), 26);
        assert_eq!(Ulid::parse(&s).unwrap(), u);
    }

    #[test]
    fn test_ticks_roundtrip() {
        let ticks = now_ticks();
        let dt = ticks_to_datetime(ticks).unwrap();
        let back = datetime_to_ticks(&dt);
        assert_eq!(ticks, back);
    }

    #[test]
    fn test_numeric_cross_type_compare() {
        assert_eq!(
            Value::Integer(2).compare(&Value::Real(2.0)),
            Some(Ordering::Equal)
        );
        assert_eq!(
            Value::Integer(3).compare(&Value::Decimal(Decimal::from(2))),
            Some(Ordering::Greater)
        );
        assert_eq!(Value::Null.compare(&Value::Integer(1)), None);
    }

    #[test]
    fn test_coerce_rejects_mismatch() {
        assert!(Value::Text("x".into()).coerce(DataType::Integer).is_err());
        assert!(matches!(
            Value::Integer(5).coerce(DataType::Real).unwrap(),
            Value::Real(v) if v == 5.0
        ));
    }

    #[test]
    fn test_parse_datetime_text() {
        let t = parse_datetime_text("2024-03-01 12:30:00").unwrap();
        let dt = ticks_to_datetime(t).unwrap();
        assert_eq!(dt.format("%Y-%m-%d %H:%M:%S").to_string(), "2024-03-01 12:30:00");
        assert!(parse_datetime_text("not a date").is_err());
    }
}
