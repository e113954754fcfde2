use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The kinds of values the engine can carry between peers.
///
/// Kinds are what schemas speak; [`Value`] is the carried datum. Every kind
/// here must round-trip losslessly through the change-buffer spill codec.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    String,
    Bytes,
    Uuid,
    Numeric,
    Timestamp,
    TimestampTz,
    Time,
    Date,
    Json,
    Array,
}

impl ValueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::Bool => "bool",
            ValueKind::Int8 => "int8",
            ValueKind::Int16 => "int16",
            ValueKind::Int32 => "int32",
            ValueKind::Int64 => "int64",
            ValueKind::UInt8 => "uint8",
            ValueKind::UInt16 => "uint16",
            ValueKind::UInt32 => "uint32",
            ValueKind::UInt64 => "uint64",
            ValueKind::Float32 => "float32",
            ValueKind::Float64 => "float64",
            ValueKind::String => "string",
            ValueKind::Bytes => "bytes",
            ValueKind::Uuid => "uuid",
            ValueKind::Numeric => "numeric",
            ValueKind::Timestamp => "timestamp",
            ValueKind::TimestampTz => "timestamptz",
            ValueKind::Time => "time",
            ValueKind::Date => "date",
            ValueKind::Json => "json",
            ValueKind::Array => "array",
        }
    }
}

impl std::fmt::Display for ValueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serde helpers that pin timestamps to integer microseconds.
///
/// The spill codec must be exact: RFC 3339 strings lose sub-second digits
/// depending on formatting, so timestamps are stored as micros since the Unix
/// epoch (timestamps) or since midnight (times).
mod ts_micros {
    use super::*;
    use serde::{Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(ts: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(ts.and_utc().timestamp_micros())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<NaiveDateTime, D::Error> {
        let micros = i64::deserialize(deserializer)?;
        DateTime::from_timestamp_micros(micros)
            .map(|dt| dt.naive_utc())
            .ok_or_else(|| D::Error::custom("timestamp micros out of range"))
    }
}

mod ts_micros_tz {
    use super::*;
    use serde::{Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(ts.timestamp_micros())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<DateTime<Utc>, D::Error> {
        let micros = i64::deserialize(deserializer)?;
        DateTime::from_timestamp_micros(micros)
            .ok_or_else(|| D::Error::custom("timestamp micros out of range"))
    }
}

mod time_micros {
    use super::*;
    use serde::{Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        let micros = time.num_seconds_from_midnight() as i64 * 1_000_000
            + (time.nanosecond() / 1_000) as i64;
        serializer.serialize_i64(micros)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let micros = i64::deserialize(deserializer)?;
        let secs = (micros / 1_000_000) as u32;
        let nanos = ((micros % 1_000_000) * 1_000) as u32;
        NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos)
            .ok_or_else(|| D::Error::custom("time micros out of range"))
    }
}

/// A single typed datum flowing from a source to a destination.
///
/// The serialized representation is internally tagged, which makes the spill
/// codec self-describing: adding a kind later does not invalidate stored
/// batches.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    String(String),
    Bytes(Vec<u8>),
    Uuid(Uuid),
    Numeric(Decimal),
    Timestamp(#[serde(with = "ts_micros")] NaiveDateTime),
    TimestampTz(#[serde(with = "ts_micros_tz")] DateTime<Utc>),
    Time(#[serde(with = "time_micros")] NaiveTime),
    Date(NaiveDate),
    Json(serde_json::Value),
    Array(Vec<Value>),
}

impl Value {
    pub fn kind(&self) -> Option<ValueKind> {
        match self {
            Value::Null => None,
            Value::Bool(_) => Some(ValueKind::Bool),
            Value::Int8(_) => Some(ValueKind::Int8),
            Value::Int16(_) => Some(ValueKind::Int16),
            Value::Int32(_) => Some(ValueKind::Int32),
            Value::Int64(_) => Some(ValueKind::Int64),
            Value::UInt8(_) => Some(ValueKind::UInt8),
            Value::UInt16(_) => Some(ValueKind::UInt16),
            Value::UInt32(_) => Some(ValueKind::UInt32),
            Value::UInt64(_) => Some(ValueKind::UInt64),
            Value::Float32(_) => Some(ValueKind::Float32),
            Value::Float64(_) => Some(ValueKind::Float64),
            Value::String(_) => Some(ValueKind::String),
            Value::Bytes(_) => Some(ValueKind::Bytes),
            Value::Uuid(_) => Some(ValueKind::Uuid),
            Value::Numeric(_) => Some(ValueKind::Numeric),
            Value::Timestamp(_) => Some(ValueKind::Timestamp),
            Value::TimestampTz(_) => Some(ValueKind::TimestampTz),
            Value::Time(_) => Some(ValueKind::Time),
            Value::Date(_) => Some(ValueKind::Date),
            Value::Json(_) => Some(ValueKind::Json),
            Value::Array(_) => Some(ValueKind::Array),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Returns `true` if the value is null, an empty string or an empty
    /// collection. Sources disagree on how they encode absence, so equality
    /// treats all empty forms as interchangeable.
    pub fn is_empty(&self) -> bool {
        match self {
            Value::Null => true,
            Value::String(s) => s.is_empty(),
            Value::Bytes(b) => b.is_empty(),
            Value::Array(a) => a.is_empty(),
            Value::Json(serde_json::Value::Null) => true,
            _ => false,
        }
    }

    fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int8(v) => Some(*v as i64),
            Value::Int16(v) => Some(*v as i64),
            Value::Int32(v) => Some(*v as i64),
            Value::Int64(v) => Some(*v),
            Value::UInt8(v) => Some(*v as i64),
            Value::UInt16(v) => Some(*v as i64),
            Value::UInt32(v) => Some(*v as i64),
            Value::UInt64(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt8(v) => Some(*v as u64),
            Value::UInt16(v) => Some(*v as u64),
            Value::UInt32(v) => Some(*v as u64),
            Value::UInt64(v) => Some(*v),
            Value::Int8(v) => u64::try_from(*v).ok(),
            Value::Int16(v) => u64::try_from(*v).ok(),
            Value::Int32(v) => u64::try_from(*v).ok(),
            Value::Int64(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float32(v) => Some(*v as f64),
            Value::Float64(v) => Some(*v),
            _ => None,
        }
    }

    /// Semantic equality used by validation and tests.
    ///
    /// Integers compare across widths, floats across precisions, timestamps
    /// at microsecond precision, numerics by [`Decimal`] equality and JSON
    /// structurally. Empty forms compare equal to each other.
    pub fn equals(&self, other: &Value) -> bool {
        if self.is_empty() && other.is_empty() {
            return true;
        }

        match self {
            Value::Bool(a) => matches!(other, Value::Bool(b) if a == b),
            Value::Int8(_) | Value::Int16(_) | Value::Int32(_) | Value::Int64(_) => {
                match (self.as_i64(), other.as_i64()) {
                    (Some(a), Some(b)) => a == b,
                    _ => false,
                }
            }
            Value::UInt8(_) | Value::UInt16(_) | Value::UInt32(_) | Value::UInt64(_) => {
                match (self.as_u64(), other.as_u64()) {
                    (Some(a), Some(b)) => a == b,
                    _ => false,
                }
            }
            Value::Float32(_) | Value::Float64(_) => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
            Value::String(a) => matches!(other, Value::String(b) if a == b),
            Value::Bytes(a) => matches!(other, Value::Bytes(b) if a == b),
            Value::Uuid(a) => matches!(other, Value::Uuid(b) if a == b),
            Value::Numeric(a) => matches!(other, Value::Numeric(b) if a == b),
            Value::Timestamp(a) => match other {
                Value::Timestamp(b) => {
                    a.and_utc().timestamp_micros() == b.and_utc().timestamp_micros()
                }
                Value::TimestampTz(b) => a.and_utc().timestamp_micros() == b.timestamp_micros(),
                _ => false,
            },
            Value::TimestampTz(a) => match other {
                Value::TimestampTz(b) => a.timestamp_micros() == b.timestamp_micros(),
                Value::Timestamp(b) => a.timestamp_micros() == b.and_utc().timestamp_micros(),
                _ => false,
            },
            Value::Time(a) => matches!(other, Value::Time(b) if a == b),
            Value::Date(a) => matches!(other, Value::Date(b) if a == b),
            Value::Json(a) => matches!(other, Value::Json(b) if a == b),
            Value::Array(a) => match other {
                Value::Array(b) => {
                    a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.equals(y))
                }
                _ => false,
            },
            Value::Null => other.is_empty(),
        }
    }

    /// Renders this value for inclusion in a raw-row JSON payload.
    ///
    /// Numerics render as strings to preserve scale; bytes render as hex;
    /// timestamps render as micros so the merge's type casts are exact.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;

        match self {
            Value::Null => Json::Null,
            Value::Bool(v) => Json::Bool(*v),
            Value::Int8(v) => Json::from(*v),
            Value::Int16(v) => Json::from(*v),
            Value::Int32(v) => Json::from(*v),
            Value::Int64(v) => Json::from(*v),
            Value::UInt8(v) => Json::from(*v),
            Value::UInt16(v) => Json::from(*v),
            Value::UInt32(v) => Json::from(*v),
            Value::UInt64(v) => Json::from(*v),
            Value::Float32(v) => serde_json::json!(*v),
            Value::Float64(v) => serde_json::json!(*v),
            Value::String(v) => Json::String(v.clone()),
            Value::Bytes(v) => Json::String(hex_encode(v)),
            Value::Uuid(v) => Json::String(v.to_string()),
            Value::Numeric(v) => Json::String(v.to_string()),
            Value::Timestamp(v) => Json::String(v.and_utc().to_rfc3339()),
            Value::TimestampTz(v) => Json::String(v.to_rfc3339()),
            Value::Time(v) => Json::String(v.format("%H:%M:%S%.6f").to_string()),
            Value::Date(v) => Json::String(v.to_string()),
            Value::Json(v) => v.clone(),
            Value::Array(values) => Json::Array(values.iter().map(Value::to_json).collect()),
        }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("\\x");
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn roundtrip(value: &Value) -> Value {
        let encoded = serde_json::to_vec(value).unwrap();
        serde_json::from_slice(&encoded).unwrap()
    }

    #[test]
    fn every_kind_roundtrips_through_codec() {
        let timestamp = DateTime::from_timestamp_micros(18_342_121_716_506)
            .unwrap()
            .naive_utc();
        let values = vec![
            Value::Null,
            Value::Bool(true),
            Value::Int8(-8),
            Value::Int16(-16),
            Value::Int32(-32),
            Value::Int64(i64::MIN),
            Value::UInt8(8),
            Value::UInt16(16),
            Value::UInt32(32),
            Value::UInt64(u64::MAX),
            Value::Float32(1.5),
            Value::Float64(-2.25),
            Value::String("naïve ↯".to_string()),
            Value::Bytes(vec![0x00, 0xff, 0x7f]),
            Value::Uuid(Uuid::new_v4()),
            Value::Numeric(Decimal::from_str("9876543210.000000000123").unwrap()),
            Value::Timestamp(timestamp),
            Value::TimestampTz(Utc::now()),
            Value::Time(NaiveTime::from_hms_micro_opt(13, 7, 59, 123_456).unwrap()),
            Value::Date(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()),
            Value::Json(serde_json::json!({"a": [1, 2, {"b": null}]})),
            Value::Array(vec![Value::Int32(1), Value::Null, Value::Int32(3)]),
        ];

        for value in values {
            let decoded = roundtrip(&value);
            assert!(
                value.equals(&decoded),
                "value {value:?} did not roundtrip, got {decoded:?}"
            );
        }
    }

    #[test]
    fn timestamp_equality_is_micro_precision() {
        let base = Utc::now();
        let tz = Value::TimestampTz(base);
        let naive = Value::Timestamp(base.naive_utc());
        assert!(tz.equals(&naive));
    }

    #[test]
    fn integers_compare_across_widths() {
        assert!(Value::Int16(42).equals(&Value::Int64(42)));
        assert!(Value::UInt8(7).equals(&Value::UInt64(7)));
        assert!(!Value::Int32(1).equals(&Value::Int32(2)));
    }

    #[test]
    fn empty_forms_are_interchangeable() {
        assert!(Value::Null.equals(&Value::String(String::new())));
        assert!(Value::Bytes(vec![]).equals(&Value::Null));
        assert!(!Value::Null.equals(&Value::Int32(0)));
    }

    #[test]
    fn numeric_equality_preserves_scale_semantics() {
        let a = Value::Numeric(Decimal::from_str("1.50").unwrap());
        let b = Value::Numeric(Decimal::from_str("1.5").unwrap());
        // Decimal equality is value equality, trailing zeros do not matter.
        assert!(a.equals(&b));
    }
}
