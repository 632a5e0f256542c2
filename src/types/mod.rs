//! # Column Types and Runtime Values
//!
//! This module defines the type system for tuple storage:
//! - `ValueType`: enumeration of supported column types with wire codes
//! - `Value<'a>`: runtime representation used to stage and read tuples
//!
//! ## Type Categories
//!
//! | Category | Types | Storage |
//! |----------|-------|---------|
//! | **Fixed** | tinyint, smallint, integer, bigint, double, timestamp | Direct bytes at a schema-computed offset |
//! | **Variable** | varchar | 8-byte pool handle at a schema-computed offset |
//!
//! ## Fixed-Width Sizes
//!
//! | Type | Size (bytes) |
//! |------|--------------|
//! | tinyint | 1 |
//! | smallint | 2 |
//! | integer | 4 |
//! | bigint | 8 |
//! | double | 8 |
//! | timestamp | 8 (microseconds since epoch) |
//!
//! ## Null Encoding
//!
//! Fixed-width columns encode NULL as the type's minimum value (`i8::MIN`
//! through `i64::MIN`, `f64::MIN` for double). Variable-length columns
//! encode NULL as the zero pool handle in storage and a `-1` length prefix
//! on the wire. There is no per-tuple null bitmap; a slot is exactly one
//! status byte followed by the column payload.

use std::borrow::Cow;
use std::fmt;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    TinyInt = 3,
    SmallInt = 4,
    Integer = 5,
    BigInt = 6,
    Double = 8,
    VarChar = 9,
    Timestamp = 11,
}

impl ValueType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            3 => Some(ValueType::TinyInt),
            4 => Some(ValueType::SmallInt),
            5 => Some(ValueType::Integer),
            6 => Some(ValueType::BigInt),
            8 => Some(ValueType::Double),
            9 => Some(ValueType::VarChar),
            11 => Some(ValueType::Timestamp),
            _ => None,
        }
    }

    /// In-slot footprint. Variable-length columns store an 8-byte pool
    /// handle rather than the payload itself.
    pub fn fixed_size(&self) -> Option<usize> {
        match self {
            ValueType::TinyInt => Some(1),
            ValueType::SmallInt => Some(2),
            ValueType::Integer => Some(4),
            ValueType::BigInt => Some(8),
            ValueType::Double => Some(8),
            ValueType::Timestamp => Some(8),
            ValueType::VarChar => None,
        }
    }

    pub fn is_variable(&self) -> bool {
        self.fixed_size().is_none()
    }

    pub fn name(&self) -> &'static str {
        match self {
            ValueType::TinyInt => "TINYINT",
            ValueType::SmallInt => "SMALLINT",
            ValueType::Integer => "INTEGER",
            ValueType::BigInt => "BIGINT",
            ValueType::Double => "DOUBLE",
            ValueType::VarChar => "VARCHAR",
            ValueType::Timestamp => "TIMESTAMP",
        }
    }
}

pub const NULL_TINYINT: i8 = i8::MIN;
pub const NULL_SMALLINT: i16 = i16::MIN;
pub const NULL_INTEGER: i32 = i32::MIN;
pub const NULL_BIGINT: i64 = i64::MIN;
pub const NULL_DOUBLE: f64 = f64::MIN;
pub const NULL_TIMESTAMP: i64 = i64::MIN;

/// Runtime value used to stage rows before insert and to materialize
/// column reads. Text borrows where the caller already owns the bytes and
/// owns a copy when read back out of the pool.
#[derive(Debug, Clone, PartialEq)]
pub enum Value<'a> {
    Null,
    TinyInt(i8),
    SmallInt(i16),
    Integer(i32),
    BigInt(i64),
    Double(f64),
    Timestamp(i64),
    VarChar(Cow<'a, str>),
}

impl<'a> Value<'a> {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The column type this value can be stored under, or `None` for NULL
    /// (which is storable under any nullable column).
    pub fn value_type(&self) -> Option<ValueType> {
        match self {
            Value::Null => None,
            Value::TinyInt(_) => Some(ValueType::TinyInt),
            Value::SmallInt(_) => Some(ValueType::SmallInt),
            Value::Integer(_) => Some(ValueType::Integer),
            Value::BigInt(_) => Some(ValueType::BigInt),
            Value::Double(_) => Some(ValueType::Double),
            Value::Timestamp(_) => Some(ValueType::Timestamp),
            Value::VarChar(_) => Some(ValueType::VarChar),
        }
    }

    pub fn varchar(s: impl Into<Cow<'a, str>>) -> Self {
        Value::VarChar(s.into())
    }
}

impl fmt::Display for Value<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::TinyInt(v) => write!(f, "{}", v),
            Value::SmallInt(v) => write!(f, "{}", v),
            Value::Integer(v) => write!(f, "{}", v),
            Value::BigInt(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::Timestamp(v) => write!(f, "{}", v),
            Value::VarChar(s) => write!(f, "'{}'", s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_type_from_byte_roundtrip() {
        for vt in [
            ValueType::TinyInt,
            ValueType::SmallInt,
            ValueType::Integer,
            ValueType::BigInt,
            ValueType::Double,
            ValueType::VarChar,
            ValueType::Timestamp,
        ] {
            assert_eq!(ValueType::from_byte(vt as u8), Some(vt));
        }
        assert_eq!(ValueType::from_byte(0), None);
        assert_eq!(ValueType::from_byte(255), None);
    }

    #[test]
    fn fixed_sizes() {
        assert_eq!(ValueType::TinyInt.fixed_size(), Some(1));
        assert_eq!(ValueType::SmallInt.fixed_size(), Some(2));
        assert_eq!(ValueType::Integer.fixed_size(), Some(4));
        assert_eq!(ValueType::BigInt.fixed_size(), Some(8));
        assert_eq!(ValueType::Double.fixed_size(), Some(8));
        assert_eq!(ValueType::Timestamp.fixed_size(), Some(8));
        assert_eq!(ValueType::VarChar.fixed_size(), None);
        assert!(ValueType::VarChar.is_variable());
    }

    #[test]
    fn value_reports_its_type() {
        assert_eq!(Value::Null.value_type(), None);
        assert_eq!(Value::Integer(7).value_type(), Some(ValueType::Integer));
        assert_eq!(
            Value::varchar("hello").value_type(),
            Some(ValueType::VarChar)
        );
        assert!(Value::Null.is_null());
        assert!(!Value::BigInt(0).is_null());
    }
}
