//! Dynamic SQL values.

use serde::{Deserialize, Serialize};

use crate::decimal::Decimal;
use crate::error::{Error, TypeError};

/// A dynamically-typed SQL value.
///
/// Parameters are bound from `Value`s and every fetched column arrives as
/// one. Drivers decide which variants they accept; anything a driver cannot
/// express natively is rejected at bind time with [`Error::Type`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// NULL value
    Null,

    /// Boolean value
    Bool(bool),

    /// 8-bit signed integer
    TinyInt(i8),

    /// 16-bit signed integer
    SmallInt(i16),

    /// 32-bit signed integer
    Int(i32),

    /// 64-bit signed integer
    BigInt(i64),

    /// 8-bit unsigned integer
    UTinyInt(u8),

    /// 16-bit unsigned integer
    USmallInt(u16),

    /// 32-bit unsigned integer
    UInt(u32),

    /// 64-bit unsigned integer
    UBigInt(u64),

    /// 32-bit floating point
    Float(f32),

    /// 64-bit floating point
    Double(f64),

    /// Exact fixed-point decimal
    Decimal(Decimal),

    /// Text string
    Text(String),

    /// Binary data
    Bytes(Vec<u8>),

    /// Date (days since the Unix epoch)
    Date(i32),

    /// Time (microseconds since midnight)
    Time(i64),

    /// Timestamp (microseconds since the Unix epoch)
    Timestamp(i64),

    /// Timestamp with timezone (microseconds since the Unix epoch, UTC)
    TimestampTz(i64),

    /// UUID (as 16 bytes)
    Uuid([u8; 16]),

    /// JSON value
    Json(serde_json::Value),

    /// Array of values
    Array(Vec<Value>),

    /// SQL DEFAULT keyword
    Default,
}

impl Value {
    /// Check if this value is NULL.
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Get the type name of this value.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Bool(_) => "BOOLEAN",
            Value::TinyInt(_) => "TINYINT",
            Value::SmallInt(_) => "SMALLINT",
            Value::Int(_) => "INTEGER",
            Value::BigInt(_) => "BIGINT",
            Value::UTinyInt(_) => "UNSIGNED TINYINT",
            Value::USmallInt(_) => "UNSIGNED SMALLINT",
            Value::UInt(_) => "UNSIGNED INT",
            Value::UBigInt(_) => "UNSIGNED BIGINT",
            Value::Float(_) => "REAL",
            Value::Double(_) => "DOUBLE",
            Value::Decimal(_) => "DECIMAL",
            Value::Text(_) => "TEXT",
            Value::Bytes(_) => "BINARY",
            Value::Date(_) => "DATE",
            Value::Time(_) => "TIME",
            Value::Timestamp(_) => "TIMESTAMP",
            Value::TimestampTz(_) => "TIMESTAMPTZ",
            Value::Uuid(_) => "UUID",
            Value::Json(_) => "JSON",
            Value::Array(_) => "ARRAY",
            Value::Default => "DEFAULT",
        }
    }

    /// Try to convert this value to a bool.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            other => other.as_i128().map(|v| v != 0),
        }
    }

    /// Try to convert this value to an i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Bool(v) => Some(i64::from(*v)),
            other => other.as_i128().and_then(|v| i64::try_from(v).ok()),
        }
    }

    /// Try to convert this value to an f64.
    #[allow(clippy::cast_possible_truncation)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(f64::from(*v)),
            Value::Double(v) => Some(*v),
            Value::Decimal(d) => Some(d.to_f64()),
            other => other.as_i128().map(|v| v as f64),
        }
    }

    /// Try to get this value as a string reference.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get this value as a byte slice.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            Value::Text(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Try to get this value as a decimal. Integers convert exactly.
    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            Value::Decimal(d) => Some(*d),
            other => other.as_i64().map(Decimal::from),
        }
    }

    /// Any integer variant widened to `i128`.
    pub fn as_i128(&self) -> Option<i128> {
        match self {
            Value::TinyInt(v) => Some(i128::from(*v)),
            Value::SmallInt(v) => Some(i128::from(*v)),
            Value::Int(v) => Some(i128::from(*v)),
            Value::BigInt(v) => Some(i128::from(*v)),
            Value::UTinyInt(v) => Some(i128::from(*v)),
            Value::USmallInt(v) => Some(i128::from(*v)),
            Value::UInt(v) => Some(i128::from(*v)),
            Value::UBigInt(v) => Some(i128::from(*v)),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v)
                }
            }
        )*
    };
}

value_from! {
    i8 => TinyInt,
    i16 => SmallInt,
    i32 => Int,
    i64 => BigInt,
    u8 => UTinyInt,
    u16 => USmallInt,
    u32 => UInt,
    u64 => UBigInt,
    f32 => Float,
    f64 => Double,
    Decimal => Decimal,
    String => Text,
    Vec<u8> => Bytes,
    serde_json::Value => Json,
    [u8; 16] => Uuid,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

fn type_error(expected: &'static str, value: &Value) -> Error {
    Error::Type(TypeError {
        expected,
        actual: value.type_name().to_string(),
        column: None,
        rust_type: None,
    })
}

impl TryFrom<Value> for bool {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        value.as_bool().ok_or_else(|| type_error("bool", &value))
    }
}

macro_rules! integer_try_from {
    ($($ty:ty),*) => {
        $(
            impl TryFrom<Value> for $ty {
                type Error = Error;

                fn try_from(value: Value) -> Result<Self, Self::Error> {
                    let wide = match &value {
                        Value::Bool(v) => Some(i128::from(*v)),
                        other => other.as_i128(),
                    };
                    match wide {
                        Some(v) => <$ty>::try_from(v).map_err(|_| {
                            Error::Type(TypeError {
                                expected: stringify!($ty),
                                actual: format!("{v} is out of range"),
                                column: None,
                                rust_type: Some(stringify!($ty)),
                            })
                        }),
                        None => Err(type_error(stringify!($ty), &value)),
                    }
                }
            }
        )*
    };
}

integer_try_from!(i8, i16, i32, i64, u8, u16, u32, u64);

impl TryFrom<Value> for f64 {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        value.as_f64().ok_or_else(|| type_error("f64", &value))
    }
}

impl TryFrom<Value> for f32 {
    type Error = Error;

    #[allow(clippy::cast_possible_truncation)]
    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Float(v) => Ok(v),
            Value::Double(v) => Ok(v as f32),
            other => Err(type_error("f32", &other)),
        }
    }
}

impl TryFrom<Value> for Decimal {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Text(s) => s.parse(),
            other => other.as_decimal().ok_or_else(|| type_error("decimal", &other)),
        }
    }
}

impl TryFrom<Value> for String {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Text(v) => Ok(v),
            Value::Decimal(d) => Ok(d.to_string()),
            other => Err(type_error("String", &other)),
        }
    }
}

impl TryFrom<Value> for Vec<u8> {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Bytes(v) => Ok(v),
            Value::Text(v) => Ok(v.into_bytes()),
            other => Err(type_error("Vec<u8>", &other)),
        }
    }
}

/// TryFrom for `Option<T>` - returns None for Null, tries to convert otherwise
impl<T> TryFrom<Value> for Option<T>
where
    T: TryFrom<Value, Error = Error>,
{
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Null => Ok(None),
            v => T::try_from(v).map(Some),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_integers() {
        assert_eq!(Value::from(42i8), Value::TinyInt(42));
        assert_eq!(Value::from(42i16), Value::SmallInt(42));
        assert_eq!(Value::from(42i32), Value::Int(42));
        assert_eq!(Value::from(42i64), Value::BigInt(42));
        assert_eq!(Value::from(42u8), Value::UTinyInt(42));
        assert_eq!(Value::from(u64::MAX), Value::UBigInt(u64::MAX));
    }

    #[test]
    fn test_from_option() {
        let some: Value = Some(42i32).into();
        assert_eq!(some, Value::Int(42));

        let none: Value = Option::<i32>::None.into();
        assert_eq!(none, Value::Null);
    }

    #[test]
    fn test_try_from_integers_checks_range() {
        assert_eq!(i64::try_from(Value::UInt(7)).unwrap(), 7);
        assert_eq!(u8::try_from(Value::BigInt(255)).unwrap(), 255);
        assert!(u8::try_from(Value::BigInt(256)).is_err());
        assert!(i64::try_from(Value::UBigInt(u64::MAX)).is_err());
        assert!(i32::try_from(Value::Text("1".into())).is_err());
        assert_eq!(i16::try_from(Value::Bool(true)).unwrap(), 1);
    }

    #[test]
    fn test_decimal_extraction() {
        let d: Decimal = "12.50".parse().unwrap();
        assert_eq!(Decimal::try_from(Value::Decimal(d)).unwrap(), d);
        assert_eq!(
            Decimal::try_from(Value::BigInt(5)).unwrap(),
            Decimal::new(5, 1, 0).unwrap()
        );
        assert_eq!(
            Decimal::try_from(Value::Text("12.50".into())).unwrap(),
            d
        );
        assert_eq!(String::try_from(Value::Decimal(d)).unwrap(), "12.50");
        assert!((Value::Decimal(d).as_f64().unwrap() - 12.5).abs() < 1e-12);
    }

    #[test]
    fn test_option_extraction() {
        assert_eq!(Option::<i64>::try_from(Value::Null).unwrap(), None);
        assert_eq!(Option::<i64>::try_from(Value::BigInt(3)).unwrap(), Some(3));
    }

    #[test]
    fn test_type_names() {
        assert_eq!(Value::Uuid([0; 16]).type_name(), "UUID");
        assert_eq!(Value::UInt(1).type_name(), "UNSIGNED INT");
        assert!(Value::Null.is_null());
    }
}
