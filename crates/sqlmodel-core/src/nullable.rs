//! Nullable scan targets for timestamp and binary columns.
//!
//! `Option<T>` covers most nullable columns. These wrappers keep the
//! `(value, valid)` shape for callers that pass scan targets around by
//! reference and want to reuse them across rows.

use crate::error::{Error, Result, TypeError};
use crate::value::Value;

/// A timestamp that may be NULL.
///
/// `time` is microseconds since the Unix epoch and is meaningful only when
/// `valid` is true.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NullTime {
    pub time: i64,
    pub valid: bool,
}

impl NullTime {
    pub const fn new(time: i64) -> Self {
        Self { time, valid: true }
    }

    pub const fn null() -> Self {
        Self {
            time: 0,
            valid: false,
        }
    }

    /// Load a fetched value.
    ///
    /// NULL clears `valid`. Timestamps (with or without zone) set `time`.
    /// Any other kind is rejected and leaves `self` untouched.
    pub fn scan(&mut self, value: &Value) -> Result<()> {
        match value {
            Value::Null => *self = Self::null(),
            Value::Timestamp(t) | Value::TimestampTz(t) => *self = Self::new(*t),
            other => return Err(scan_error("timestamp", other)),
        }
        Ok(())
    }

    /// The value to bind as a parameter.
    pub fn value(&self) -> Value {
        if self.valid {
            Value::Timestamp(self.time)
        } else {
            Value::Null
        }
    }
}

impl From<NullTime> for Value {
    fn from(v: NullTime) -> Self {
        v.value()
    }
}

/// Binary data that may be NULL.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NullBytes {
    pub bytes: Vec<u8>,
    pub valid: bool,
}

impl NullBytes {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes, valid: true }
    }

    pub fn null() -> Self {
        Self::default()
    }

    /// Load a fetched value: NULL clears `valid`, binary data sets `bytes`.
    pub fn scan(&mut self, value: &Value) -> Result<()> {
        match value {
            Value::Null => *self = Self::null(),
            Value::Bytes(b) => {
                self.bytes.clear();
                self.bytes.extend_from_slice(b);
                self.valid = true;
            }
            other => return Err(scan_error("binary", other)),
        }
        Ok(())
    }

    pub fn value(&self) -> Value {
        if self.valid {
            Value::Bytes(self.bytes.clone())
        } else {
            Value::Null
        }
    }
}

impl From<NullBytes> for Value {
    fn from(v: NullBytes) -> Self {
        if v.valid {
            Value::Bytes(v.bytes)
        } else {
            Value::Null
        }
    }
}

fn scan_error(expected: &'static str, value: &Value) -> Error {
    Error::Type(TypeError {
        expected,
        actual: value.type_name().to_string(),
        column: None,
        rust_type: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_time_scan() {
        let mut t = NullTime::default();
        t.scan(&Value::Timestamp(1_700_000_000_000_000)).unwrap();
        assert_eq!(t, NullTime::new(1_700_000_000_000_000));
        assert_eq!(t.value(), Value::Timestamp(1_700_000_000_000_000));

        t.scan(&Value::Null).unwrap();
        assert!(!t.valid);
        assert_eq!(Value::from(t), Value::Null);
    }

    #[test]
    fn null_time_rejects_other_kinds() {
        let mut t = NullTime::new(5);
        assert!(t.scan(&Value::Text("2024-01-01".into())).is_err());
        assert_eq!(t, NullTime::new(5));
    }

    #[test]
    fn null_bytes_scan() {
        let mut b = NullBytes::default();
        b.scan(&Value::Bytes(vec![1, 2, 3])).unwrap();
        assert!(b.valid);
        assert_eq!(b.bytes, vec![1, 2, 3]);
        assert_eq!(Value::from(b.clone()), Value::Bytes(vec![1, 2, 3]));

        b.scan(&Value::Null).unwrap();
        assert!(!b.valid);
        assert!(b.bytes.is_empty());
        assert!(b.scan(&Value::BigInt(1)).is_err());
    }
}
