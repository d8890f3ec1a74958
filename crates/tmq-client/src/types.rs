//! Core value types for decoded TMQ data

use serde::{Serialize, Serializer};
use std::fmt;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Column type tags as they appear in raw blocks and fetch responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataType {
    Null,
    Bool,
    TinyInt,
    SmallInt,
    Int,
    BigInt,
    Float,
    Double,
    VarChar,
    Timestamp,
    NChar,
    UTinyInt,
    USmallInt,
    UInt,
    UBigInt,
    Json,
    VarBinary,
    Decimal,
    Blob,
    MediumBlob,
    Geometry,
    Decimal64,
}

impl DataType {
    /// Map a wire type tag to a data type
    pub fn from_tag(tag: i8) -> Option<Self> {
        let ty = match tag {
            0 => DataType::Null,
            1 => DataType::Bool,
            2 => DataType::TinyInt,
            3 => DataType::SmallInt,
            4 => DataType::Int,
            5 => DataType::BigInt,
            6 => DataType::Float,
            7 => DataType::Double,
            8 => DataType::VarChar,
            9 => DataType::Timestamp,
            10 => DataType::NChar,
            11 => DataType::UTinyInt,
            12 => DataType::USmallInt,
            13 => DataType::UInt,
            14 => DataType::UBigInt,
            15 => DataType::Json,
            16 => DataType::VarBinary,
            17 => DataType::Decimal,
            18 => DataType::Blob,
            19 => DataType::MediumBlob,
            20 => DataType::Geometry,
            21 => DataType::Decimal64,
            _ => return None,
        };
        Some(ty)
    }

    /// The wire type tag
    pub fn tag(&self) -> i8 {
        match self {
            DataType::Null => 0,
            DataType::Bool => 1,
            DataType::TinyInt => 2,
            DataType::SmallInt => 3,
            DataType::Int => 4,
            DataType::BigInt => 5,
            DataType::Float => 6,
            DataType::Double => 7,
            DataType::VarChar => 8,
            DataType::Timestamp => 9,
            DataType::NChar => 10,
            DataType::UTinyInt => 11,
            DataType::USmallInt => 12,
            DataType::UInt => 13,
            DataType::UBigInt => 14,
            DataType::Json => 15,
            DataType::VarBinary => 16,
            DataType::Decimal => 17,
            DataType::Blob => 18,
            DataType::MediumBlob => 19,
            DataType::Geometry => 20,
            DataType::Decimal64 => 21,
        }
    }

    /// Byte width of one value for fixed-width types, `None` for variable-width
    pub fn fixed_width(&self) -> Option<usize> {
        match self {
            DataType::Bool | DataType::TinyInt | DataType::UTinyInt => Some(1),
            DataType::SmallInt | DataType::USmallInt => Some(2),
            DataType::Int | DataType::UInt | DataType::Float => Some(4),
            DataType::BigInt
            | DataType::UBigInt
            | DataType::Double
            | DataType::Timestamp
            | DataType::Decimal64 => Some(8),
            DataType::Decimal => Some(16),
            _ => None,
        }
    }

    pub fn is_var_width(&self) -> bool {
        self.fixed_width().is_none()
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Null => "NULL",
            DataType::Bool => "BOOL",
            DataType::TinyInt => "TINYINT",
            DataType::SmallInt => "SMALLINT",
            DataType::Int => "INT",
            DataType::BigInt => "BIGINT",
            DataType::Float => "FLOAT",
            DataType::Double => "DOUBLE",
            DataType::VarChar => "VARCHAR",
            DataType::Timestamp => "TIMESTAMP",
            DataType::NChar => "NCHAR",
            DataType::UTinyInt => "TINYINT UNSIGNED",
            DataType::USmallInt => "SMALLINT UNSIGNED",
            DataType::UInt => "INT UNSIGNED",
            DataType::UBigInt => "BIGINT UNSIGNED",
            DataType::Json => "JSON",
            DataType::VarBinary => "VARBINARY",
            DataType::Decimal => "DECIMAL",
            DataType::Blob => "BLOB",
            DataType::MediumBlob => "MEDIUMBLOB",
            DataType::Geometry => "GEOMETRY",
            DataType::Decimal64 => "DECIMAL",
        };
        f.write_str(name)
    }
}

/// Timestamp precision of a block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    Millisecond,
    Microsecond,
    Nanosecond,
}

impl Precision {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Precision::Millisecond),
            1 => Some(Precision::Microsecond),
            2 => Some(Precision::Nanosecond),
            _ => None,
        }
    }

    /// Nanoseconds per tick at this precision
    fn nanos_per_tick(&self) -> i128 {
        match self {
            Precision::Millisecond => 1_000_000,
            Precision::Microsecond => 1_000,
            Precision::Nanosecond => 1,
        }
    }
}

/// An epoch timestamp as stored on the wire, tagged with its precision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Timestamp {
    raw: i64,
    precision: Precision,
}

impl Timestamp {
    pub fn new(raw: i64, precision: Precision) -> Self {
        Self { raw, precision }
    }

    /// Raw epoch ticks at the block precision
    pub fn raw(&self) -> i64 {
        self.raw
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    /// Nanoseconds since the Unix epoch
    pub fn as_nanos(&self) -> i128 {
        self.raw as i128 * self.precision.nanos_per_tick()
    }

    /// Convert to a UTC datetime; `None` when outside the representable range
    pub fn to_datetime(&self) -> Option<OffsetDateTime> {
        OffsetDateTime::from_unix_timestamp_nanos(self.as_nanos()).ok()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_datetime().and_then(|dt| dt.format(&Rfc3339).ok()) {
            Some(s) => f.write_str(&s),
            None => write!(f, "{}", self.raw),
        }
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A single decoded cell
///
/// Each variant corresponds to exactly one column type, decided when the
/// block is decoded.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    TinyInt(i8),
    SmallInt(i16),
    Int(i32),
    BigInt(i64),
    UTinyInt(u8),
    USmallInt(u16),
    UInt(u32),
    UBigInt(u64),
    Float(f32),
    Double(f64),
    Timestamp(Timestamp),
    VarChar(String),
    NChar(String),
    Json(String),
    VarBinary(Vec<u8>),
    Blob(Vec<u8>),
    Geometry(Vec<u8>),
    /// Decimal rendered with its scale applied
    Decimal(String),
}

impl Value {
    /// Check if value is null
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Try to convert value to a bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Widen any integer that fits into an i64
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::TinyInt(v) => Some(*v as i64),
            Value::SmallInt(v) => Some(*v as i64),
            Value::Int(v) => Some(*v as i64),
            Value::BigInt(v) => Some(*v),
            Value::UTinyInt(v) => Some(*v as i64),
            Value::USmallInt(v) => Some(*v as i64),
            Value::UInt(v) => Some(*v as i64),
            Value::UBigInt(v) => i64::try_from(*v).ok(),
            Value::Timestamp(ts) => Some(ts.raw()),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UBigInt(v) => Some(*v),
            other => other.as_i64().and_then(|v| u64::try_from(v).ok()),
        }
    }

    /// Try to convert value to a f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f as f64),
            Value::Double(f) => Some(*f),
            other => other.as_i64().map(|i| i as f64),
        }
    }

    /// Try to borrow value as a string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::VarChar(s) | Value::NChar(s) | Value::Json(s) | Value::Decimal(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::VarBinary(b) | Value::Blob(b) | Value::Geometry(b) => Some(b),
            Value::VarChar(s) | Value::NChar(s) | Value::Json(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<Timestamp> {
        match self {
            Value::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }
}

/// Column metadata for a decoded block
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Field {
    pub name: String,
    pub data_type: DataType,
    /// Declared byte length of the column
    pub length: i64,
    /// Digits after the decimal point, only meaningful for decimals
    pub scale: u8,
}
