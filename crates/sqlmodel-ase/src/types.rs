//! Conversion between [`Value`]s and CT-Library data buffers.
//!
//! Buffers use the client's native byte order, as CT-Library does for every
//! fixed-length type. Layouts:
//!
//! | type | layout |
//! |------|--------|
//! | `CS_DATETIME` | `i32` days since 1900-01-01, `i32` 1/300 s ticks since midnight |
//! | `CS_DATETIME4` | `u16` days since 1900-01-01, `u16` minutes since midnight |
//! | `CS_DATE` / `CS_TIME` | `i32` days since 1900-01-01 / `i32` 1/300 s ticks |
//! | `CS_BIGDATETIME` / `CS_BIGTIME` | `u64` µs since 0000-01-01 / since midnight |
//! | `CS_MONEY` | `i32` high, `u32` low word of an `i64` in 1/10000 units |
//! | `CS_MONEY4` | `i32` in 1/10000 units |
//! | `CS_NUMERIC` | precision, scale, sign byte, big-endian magnitude |

use sqlmodel_core::error::TypeError;
use sqlmodel_core::{Decimal, Error, Result, Value};

use crate::ffi;
use crate::library::{ColumnBuffer, DataFormat};

/// Days from 1900-01-01 to 1970-01-01.
const DAYS_1900_TO_UNIX: i64 = 25_567;
/// Days from 0000-01-01 to 1970-01-01.
const DAYS_0000_TO_UNIX: i64 = 719_528;
const MICROS_PER_DAY: i64 = 86_400_000_000;
const MICROS_PER_MINUTE: i64 = 60_000_000;
const TICKS_PER_DAY: i64 = 25_920_000;
/// Size of `CS_NUMERIC`.
const NUMERIC_LEN: usize = 2 + ffi::CS_MAX_NUMLEN;
/// Char and binary parameters longer than this bind as the long variants.
const SHORT_VARLEN: usize = 255;

/// A CT-Library datatype.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DbType {
    Char,
    VarChar,
    LongChar,
    Text,
    UniChar,
    UniText,
    Binary,
    VarBinary,
    LongBinary,
    Image,
    TinyInt,
    SmallInt,
    Int,
    BigInt,
    USmallInt,
    UInt,
    UBigInt,
    Real,
    Float,
    Bit,
    DateTime,
    DateTime4,
    Date,
    Time,
    BigDateTime,
    BigTime,
    Money,
    Money4,
    Numeric,
    Decimal,
    /// A datatype the driver does not convert.
    Other(i32),
}

/// The host type a column converts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanType {
    Int64,
    Bool,
    Float64,
    Decimal,
    String,
    Bytes,
    Timestamp,
}

impl DbType {
    pub fn from_code(code: ffi::CS_INT) -> Self {
        match code {
            ffi::CS_CHAR_TYPE => DbType::Char,
            ffi::CS_VARCHAR_TYPE => DbType::VarChar,
            ffi::CS_LONGCHAR_TYPE => DbType::LongChar,
            ffi::CS_TEXT_TYPE => DbType::Text,
            ffi::CS_UNICHAR_TYPE => DbType::UniChar,
            ffi::CS_UNITEXT_TYPE => DbType::UniText,
            ffi::CS_BINARY_TYPE => DbType::Binary,
            ffi::CS_VARBINARY_TYPE => DbType::VarBinary,
            ffi::CS_LONGBINARY_TYPE => DbType::LongBinary,
            ffi::CS_IMAGE_TYPE => DbType::Image,
            ffi::CS_TINYINT_TYPE => DbType::TinyInt,
            ffi::CS_SMALLINT_TYPE => DbType::SmallInt,
            ffi::CS_INT_TYPE => DbType::Int,
            ffi::CS_BIGINT_TYPE => DbType::BigInt,
            ffi::CS_USMALLINT_TYPE => DbType::USmallInt,
            ffi::CS_UINT_TYPE => DbType::UInt,
            ffi::CS_UBIGINT_TYPE => DbType::UBigInt,
            ffi::CS_REAL_TYPE => DbType::Real,
            ffi::CS_FLOAT_TYPE => DbType::Float,
            ffi::CS_BIT_TYPE => DbType::Bit,
            ffi::CS_DATETIME_TYPE => DbType::DateTime,
            ffi::CS_DATETIME4_TYPE => DbType::DateTime4,
            ffi::CS_DATE_TYPE => DbType::Date,
            ffi::CS_TIME_TYPE => DbType::Time,
            ffi::CS_BIGDATETIME_TYPE => DbType::BigDateTime,
            ffi::CS_BIGTIME_TYPE => DbType::BigTime,
            ffi::CS_MONEY_TYPE => DbType::Money,
            ffi::CS_MONEY4_TYPE => DbType::Money4,
            ffi::CS_NUMERIC_TYPE => DbType::Numeric,
            ffi::CS_DECIMAL_TYPE => DbType::Decimal,
            other => DbType::Other(other),
        }
    }

    pub const fn code(self) -> ffi::CS_INT {
        match self {
            DbType::Char => ffi::CS_CHAR_TYPE,
            DbType::VarChar => ffi::CS_VARCHAR_TYPE,
            DbType::LongChar => ffi::CS_LONGCHAR_TYPE,
            DbType::Text => ffi::CS_TEXT_TYPE,
            DbType::UniChar => ffi::CS_UNICHAR_TYPE,
            DbType::UniText => ffi::CS_UNITEXT_TYPE,
            DbType::Binary => ffi::CS_BINARY_TYPE,
            DbType::VarBinary => ffi::CS_VARBINARY_TYPE,
            DbType::LongBinary => ffi::CS_LONGBINARY_TYPE,
            DbType::Image => ffi::CS_IMAGE_TYPE,
            DbType::TinyInt => ffi::CS_TINYINT_TYPE,
            DbType::SmallInt => ffi::CS_SMALLINT_TYPE,
            DbType::Int => ffi::CS_INT_TYPE,
            DbType::BigInt => ffi::CS_BIGINT_TYPE,
            DbType::USmallInt => ffi::CS_USMALLINT_TYPE,
            DbType::UInt => ffi::CS_UINT_TYPE,
            DbType::UBigInt => ffi::CS_UBIGINT_TYPE,
            DbType::Real => ffi::CS_REAL_TYPE,
            DbType::Float => ffi::CS_FLOAT_TYPE,
            DbType::Bit => ffi::CS_BIT_TYPE,
            DbType::DateTime => ffi::CS_DATETIME_TYPE,
            DbType::DateTime4 => ffi::CS_DATETIME4_TYPE,
            DbType::Date => ffi::CS_DATE_TYPE,
            DbType::Time => ffi::CS_TIME_TYPE,
            DbType::BigDateTime => ffi::CS_BIGDATETIME_TYPE,
            DbType::BigTime => ffi::CS_BIGTIME_TYPE,
            DbType::Money => ffi::CS_MONEY_TYPE,
            DbType::Money4 => ffi::CS_MONEY4_TYPE,
            DbType::Numeric => ffi::CS_NUMERIC_TYPE,
            DbType::Decimal => ffi::CS_DECIMAL_TYPE,
            DbType::Other(code) => code,
        }
    }

    /// The server's name for the type.
    pub const fn sql_name(self) -> &'static str {
        match self {
            DbType::Char => "CHAR",
            DbType::VarChar | DbType::LongChar => "VARCHAR",
            DbType::Text => "TEXT",
            DbType::UniChar => "UNICHAR",
            DbType::UniText => "UNITEXT",
            DbType::Binary => "BINARY",
            DbType::VarBinary | DbType::LongBinary => "VARBINARY",
            DbType::Image => "IMAGE",
            DbType::TinyInt => "TINYINT",
            DbType::SmallInt => "SMALLINT",
            DbType::Int => "INT",
            DbType::BigInt => "BIGINT",
            DbType::USmallInt => "UNSIGNED SMALLINT",
            DbType::UInt => "UNSIGNED INT",
            DbType::UBigInt => "UNSIGNED BIGINT",
            DbType::Real => "REAL",
            DbType::Float => "FLOAT",
            DbType::Bit => "BIT",
            DbType::DateTime => "DATETIME",
            DbType::DateTime4 => "SMALLDATETIME",
            DbType::Date => "DATE",
            DbType::Time => "TIME",
            DbType::BigDateTime => "BIGDATETIME",
            DbType::BigTime => "BIGTIME",
            DbType::Money => "MONEY",
            DbType::Money4 => "SMALLMONEY",
            DbType::Numeric => "NUMERIC",
            DbType::Decimal => "DECIMAL",
            DbType::Other(_) => "UNKNOWN",
        }
    }

    /// Buffer size of fixed-length types.
    pub const fn fixed_size(self) -> Option<usize> {
        match self {
            DbType::TinyInt | DbType::Bit => Some(1),
            DbType::SmallInt | DbType::USmallInt => Some(2),
            DbType::Int
            | DbType::UInt
            | DbType::Real
            | DbType::DateTime4
            | DbType::Date
            | DbType::Time
            | DbType::Money4 => Some(4),
            DbType::BigInt
            | DbType::UBigInt
            | DbType::Float
            | DbType::DateTime
            | DbType::BigDateTime
            | DbType::BigTime
            | DbType::Money => Some(8),
            DbType::Numeric | DbType::Decimal => Some(NUMERIC_LEN),
            _ => None,
        }
    }

    /// Character and binary types, whose declared length is meaningful.
    pub const fn is_variable_length(self) -> bool {
        matches!(
            self,
            DbType::Char
                | DbType::VarChar
                | DbType::LongChar
                | DbType::Text
                | DbType::UniChar
                | DbType::UniText
                | DbType::Binary
                | DbType::VarBinary
                | DbType::LongBinary
                | DbType::Image
        )
    }

    pub const fn is_unicode(self) -> bool {
        matches!(self, DbType::UniChar | DbType::UniText)
    }

    pub const fn scan_type(self) -> Option<ScanType> {
        Some(match self {
            DbType::TinyInt
            | DbType::SmallInt
            | DbType::Int
            | DbType::BigInt
            | DbType::USmallInt
            | DbType::UInt
            | DbType::UBigInt => ScanType::Int64,
            DbType::Bit => ScanType::Bool,
            DbType::Real | DbType::Float => ScanType::Float64,
            DbType::Money | DbType::Money4 | DbType::Numeric | DbType::Decimal => {
                ScanType::Decimal
            }
            DbType::Char
            | DbType::VarChar
            | DbType::LongChar
            | DbType::Text
            | DbType::UniChar
            | DbType::UniText => ScanType::String,
            DbType::Binary
            | DbType::VarBinary
            | DbType::LongBinary
            | DbType::Image => ScanType::Bytes,
            DbType::DateTime
            | DbType::DateTime4
            | DbType::Date
            | DbType::Time
            | DbType::BigDateTime
            | DbType::BigTime => ScanType::Timestamp,
            DbType::Other(_) => return None,
        })
    }
}

/// Precision and scale of decimal-like columns.
pub fn precision_scale(format: &DataFormat) -> Option<(i64, i64)> {
    match format.datatype {
        DbType::Money => Some((19, 4)),
        DbType::Money4 => Some((10, 4)),
        DbType::Numeric | DbType::Decimal => {
            Some((i64::from(format.precision), i64::from(format.scale)))
        }
        _ => None,
    }
}

/// Receive buffer size for a described column.
///
/// Character and binary columns are capped at `text_limit` bytes.
pub fn buffer_capacity(format: &DataFormat, text_limit: usize) -> usize {
    if let Some(size) = format.datatype.fixed_size() {
        return size;
    }
    match usize::try_from(format.maxlength) {
        Ok(len) if len > 0 && len <= text_limit => len,
        _ => text_limit,
    }
}

/// Convert a fetched column buffer.
pub fn decode_buffer(buffer: &ColumnBuffer) -> Result<Value> {
    if buffer.is_null() {
        return Ok(Value::Null);
    }
    decode(&buffer.format, buffer.filled())
}

/// Convert native bytes of `format` into a [`Value`].
pub fn decode(format: &DataFormat, data: &[u8]) -> Result<Value> {
    let ty = format.datatype;
    Ok(match ty {
        DbType::TinyInt => Value::BigInt(i64::from(fixed::<1>(data, ty)?[0])),
        DbType::SmallInt => Value::BigInt(i64::from(i16::from_ne_bytes(fixed(data, ty)?))),
        DbType::Int => Value::BigInt(i64::from(i32::from_ne_bytes(fixed(data, ty)?))),
        DbType::BigInt => Value::BigInt(i64::from_ne_bytes(fixed(data, ty)?)),
        DbType::USmallInt => Value::BigInt(i64::from(u16::from_ne_bytes(fixed(data, ty)?))),
        DbType::UInt => Value::BigInt(i64::from(u32::from_ne_bytes(fixed(data, ty)?))),
        DbType::UBigInt => {
            let v = u64::from_ne_bytes(fixed(data, ty)?);
            Value::BigInt(i64::try_from(v).map_err(|_| {
                conversion_error("64-bit signed integer", format!("unsigned bigint {v}"))
            })?)
        }
        DbType::Bit => Value::Bool(fixed::<1>(data, ty)?[0] != 0),
        DbType::Real => Value::Double(f64::from(f32::from_ne_bytes(fixed(data, ty)?))),
        DbType::Float => Value::Double(f64::from_ne_bytes(fixed(data, ty)?)),
        DbType::Char | DbType::VarChar | DbType::LongChar | DbType::Text => {
            Value::Text(match String::from_utf8(data.to_vec()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(
                        column = %format.name,
                        "column is not valid UTF-8; replacing invalid sequences"
                    );
                    String::from_utf8_lossy(e.as_bytes()).into_owned()
                }
            })
        }
        DbType::UniChar | DbType::UniText => {
            let units: Vec<u16> = data
                .chunks_exact(2)
                .map(|pair| u16::from_ne_bytes([pair[0], pair[1]]))
                .collect();
            Value::Text(String::from_utf16_lossy(&units))
        }
        DbType::Binary | DbType::VarBinary | DbType::LongBinary | DbType::Image => {
            Value::Bytes(data.to_vec())
        }
        DbType::DateTime => {
            let raw = fixed::<8>(data, ty)?;
            let days = i32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]]);
            let ticks = i32::from_ne_bytes([raw[4], raw[5], raw[6], raw[7]]);
            Value::Timestamp(datetime_to_micros(i64::from(days), i64::from(ticks)))
        }
        DbType::DateTime4 => {
            let raw = fixed::<4>(data, ty)?;
            let days = u16::from_ne_bytes([raw[0], raw[1]]);
            let minutes = u16::from_ne_bytes([raw[2], raw[3]]);
            Value::Timestamp(
                (i64::from(days) - DAYS_1900_TO_UNIX) * MICROS_PER_DAY
                    + i64::from(minutes) * MICROS_PER_MINUTE,
            )
        }
        DbType::Date => {
            let days = i32::from_ne_bytes(fixed(data, ty)?);
            Value::Timestamp((i64::from(days) - DAYS_1900_TO_UNIX) * MICROS_PER_DAY)
        }
        DbType::Time => {
            let ticks = i32::from_ne_bytes(fixed(data, ty)?);
            Value::Timestamp(datetime_to_micros(0, i64::from(ticks)))
        }
        DbType::BigDateTime => {
            let micros = u64::from_ne_bytes(fixed(data, ty)?);
            let micros = i64::try_from(micros)
                .map_err(|_| conversion_error("bigdatetime", format!("{micros} µs")))?;
            Value::Timestamp(micros - DAYS_0000_TO_UNIX * MICROS_PER_DAY)
        }
        DbType::BigTime => {
            let micros = u64::from_ne_bytes(fixed(data, ty)?);
            let micros = i64::try_from(micros)
                .map_err(|_| conversion_error("bigtime", format!("{micros} µs")))?;
            Value::Timestamp(-DAYS_1900_TO_UNIX * MICROS_PER_DAY + micros)
        }
        DbType::Money => {
            let raw = fixed::<8>(data, ty)?;
            let high = i32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]]);
            let low = u32::from_ne_bytes([raw[4], raw[5], raw[6], raw[7]]);
            let units = (i64::from(high) << 32) | i64::from(low);
            Value::Decimal(Decimal::new(i128::from(units), 19, 4)?)
        }
        DbType::Money4 => {
            let units = i32::from_ne_bytes(fixed(data, ty)?);
            Value::Decimal(Decimal::new(i128::from(units), 10, 4)?)
        }
        DbType::Numeric | DbType::Decimal => Value::Decimal(decode_numeric(data)?),
        DbType::Other(code) => {
            return Err(conversion_error(
                "convertible column type",
                format!("datatype {code}"),
            ));
        }
    })
}

/// Pick the parameter format for a host value and encode it.
///
/// NULL binds as a `CS_CHAR` with a NULL indicator (`None` data).
pub fn encode_param(value: &Value) -> Result<(DataFormat, Option<Vec<u8>>)> {
    let datatype = match value {
        Value::Null => {
            return Ok((input_format(DataFormat::new(DbType::Char, 1)), None));
        }
        Value::Bool(_) => DbType::Bit,
        // ASE tinyint is unsigned, so signed 8-bit values widen.
        Value::TinyInt(_) | Value::SmallInt(_) => DbType::SmallInt,
        Value::Int(_) => DbType::Int,
        Value::BigInt(_) => DbType::BigInt,
        Value::UTinyInt(_) => DbType::TinyInt,
        Value::USmallInt(_) => DbType::USmallInt,
        Value::UInt(_) => DbType::UInt,
        Value::UBigInt(_) => DbType::UBigInt,
        Value::Float(_) => DbType::Real,
        Value::Double(_) => DbType::Float,
        Value::Decimal(_) => DbType::Decimal,
        Value::Text(s) if s.len() > SHORT_VARLEN => DbType::LongChar,
        Value::Text(_) => DbType::Char,
        Value::Bytes(b) if b.len() > SHORT_VARLEN => DbType::LongBinary,
        Value::Bytes(_) => DbType::Binary,
        Value::Date(_) => DbType::Date,
        Value::Time(_) => DbType::BigTime,
        Value::Timestamp(_) | Value::TimestampTz(_) => DbType::BigDateTime,
        Value::Uuid(_) | Value::Json(_) | Value::Array(_) | Value::Default => {
            return Err(Error::Type(TypeError {
                expected: "bindable parameter",
                actual: format!("unsupported parameter type {}", value.type_name()),
                column: None,
                rust_type: None,
            }));
        }
    };

    let mut format = DataFormat::new(datatype, 0);
    if let Value::Decimal(d) = value {
        format = format.with_precision(i32::from(d.precision()), i32::from(d.scale()));
    }
    let data = encode(value, &format)?;
    format.maxlength = i32::try_from(data.len())
        .map_err(|_| conversion_error("parameter under 2 GiB", format!("{} bytes", data.len())))?;
    Ok((input_format(format), Some(data)))
}

fn input_format(mut format: DataFormat) -> DataFormat {
    format.status |= ffi::CS_INPUTVALUE;
    format
}

/// Encode a non-NULL value into the native layout of `format`.
///
/// Character and binary values longer than a positive `maxlength` are
/// rejected.
pub fn encode(value: &Value, format: &DataFormat) -> Result<Vec<u8>> {
    let ty = format.datatype;
    let mismatch = || {
        conversion_error(ty.sql_name(), format!("value of type {}", value.type_name()))
    };
    let int_value = || -> Result<i128> {
        match value {
            Value::Bool(b) => Ok(i128::from(*b)),
            Value::Decimal(d) if d.scale() == 0 => Ok(d.unscaled()),
            other => other.as_i128().ok_or_else(mismatch),
        }
    };

    Ok(match ty {
        DbType::TinyInt => vec![narrow::<u8>(int_value()?, ty)?],
        DbType::SmallInt => narrow::<i16>(int_value()?, ty)?.to_ne_bytes().to_vec(),
        DbType::Int => narrow::<i32>(int_value()?, ty)?.to_ne_bytes().to_vec(),
        DbType::BigInt => narrow::<i64>(int_value()?, ty)?.to_ne_bytes().to_vec(),
        DbType::USmallInt => narrow::<u16>(int_value()?, ty)?.to_ne_bytes().to_vec(),
        DbType::UInt => narrow::<u32>(int_value()?, ty)?.to_ne_bytes().to_vec(),
        DbType::UBigInt => narrow::<u64>(int_value()?, ty)?.to_ne_bytes().to_vec(),
        DbType::Bit => match int_value()? {
            0 => vec![0],
            1 => vec![1],
            other => return Err(conversion_error("bit", format!("{other}"))),
        },
        #[allow(clippy::cast_possible_truncation)]
        DbType::Real => {
            let v = value.as_f64().ok_or_else(mismatch)?;
            (v as f32).to_ne_bytes().to_vec()
        }
        DbType::Float => value.as_f64().ok_or_else(mismatch)?.to_ne_bytes().to_vec(),
        DbType::Char | DbType::VarChar | DbType::LongChar | DbType::Text => {
            let text = value.as_str().ok_or_else(mismatch)?;
            check_length(text.len(), format)?;
            text.as_bytes().to_vec()
        }
        DbType::UniChar | DbType::UniText => {
            let text = value.as_str().ok_or_else(mismatch)?;
            let bytes: Vec<u8> = text.encode_utf16().flat_map(u16::to_ne_bytes).collect();
            check_length(bytes.len(), format)?;
            bytes
        }
        DbType::Binary | DbType::VarBinary | DbType::LongBinary | DbType::Image => {
            let Value::Bytes(bytes) = value else {
                return Err(mismatch());
            };
            check_length(bytes.len(), format)?;
            bytes.clone()
        }
        DbType::DateTime => {
            let (days, tod) = split_micros(timestamp_micros(value).ok_or_else(mismatch)?);
            let mut ticks = micros_to_ticks(tod);
            let mut days = days + DAYS_1900_TO_UNIX;
            if ticks == TICKS_PER_DAY {
                days += 1;
                ticks = 0;
            }
            let days = narrow::<i32>(i128::from(days), ty)?;
            let ticks = narrow::<i32>(i128::from(ticks), ty)?;
            let mut out = days.to_ne_bytes().to_vec();
            out.extend_from_slice(&ticks.to_ne_bytes());
            out
        }
        DbType::DateTime4 => {
            let micros = timestamp_micros(value).ok_or_else(mismatch)?;
            // Rounded to the nearest minute.
            let minutes_total = (micros + MICROS_PER_MINUTE / 2).div_euclid(MICROS_PER_MINUTE);
            let days = minutes_total.div_euclid(1440) + DAYS_1900_TO_UNIX;
            let minutes = minutes_total.rem_euclid(1440);
            let days = narrow::<u16>(i128::from(days), ty)?;
            let minutes = narrow::<u16>(i128::from(minutes), ty)?;
            let mut out = days.to_ne_bytes().to_vec();
            out.extend_from_slice(&minutes.to_ne_bytes());
            out
        }
        DbType::Date => {
            let days = match value {
                Value::Date(d) => i64::from(*d),
                other => split_micros(timestamp_micros(other).ok_or_else(mismatch)?).0,
            };
            narrow::<i32>(i128::from(days + DAYS_1900_TO_UNIX), ty)?
                .to_ne_bytes()
                .to_vec()
        }
        DbType::Time => {
            let tod = time_of_day(value).ok_or_else(mismatch)?;
            let ticks = micros_to_ticks(tod).min(TICKS_PER_DAY - 1);
            narrow::<i32>(i128::from(ticks), ty)?.to_ne_bytes().to_vec()
        }
        DbType::BigDateTime => {
            let micros = timestamp_micros(value).ok_or_else(mismatch)?;
            let since_year_zero = i128::from(micros) + i128::from(DAYS_0000_TO_UNIX * MICROS_PER_DAY);
            narrow::<u64>(since_year_zero, ty)?.to_ne_bytes().to_vec()
        }
        DbType::BigTime => {
            let tod = time_of_day(value).ok_or_else(mismatch)?;
            narrow::<u64>(i128::from(tod), ty)?.to_ne_bytes().to_vec()
        }
        DbType::Money => {
            let units = money_units(value, 19).ok_or_else(mismatch)??;
            let units = narrow::<i64>(units, ty)?;
            let high = i32::try_from(units >> 32).map_err(|_| mismatch())?;
            #[allow(clippy::cast_possible_truncation)]
            let low = units as u32;
            let mut out = high.to_ne_bytes().to_vec();
            out.extend_from_slice(&low.to_ne_bytes());
            out
        }
        DbType::Money4 => {
            let units = money_units(value, 10).ok_or_else(mismatch)??;
            narrow::<i32>(units, ty)?.to_ne_bytes().to_vec()
        }
        DbType::Numeric | DbType::Decimal => {
            let decimal = value.as_decimal().ok_or_else(mismatch)?;
            let target = match (u8::try_from(format.precision), u8::try_from(format.scale)) {
                (Ok(p), Ok(s)) if p > 0 => decimal.rescale(p, s)?,
                _ => decimal,
            };
            encode_numeric(&target)
        }
        DbType::Other(_) => return Err(mismatch()),
    })
}

/// Microseconds since the Unix epoch for a timestamp or date value.
fn timestamp_micros(value: &Value) -> Option<i64> {
    match value {
        Value::Timestamp(t) | Value::TimestampTz(t) => Some(*t),
        Value::Date(d) => Some(i64::from(*d) * MICROS_PER_DAY),
        _ => None,
    }
}

fn time_of_day(value: &Value) -> Option<i64> {
    match value {
        Value::Time(t) => Some(t.rem_euclid(MICROS_PER_DAY)),
        Value::Timestamp(t) | Value::TimestampTz(t) => Some(split_micros(*t).1),
        _ => None,
    }
}

/// Money values in 1/10000 units, after rounding to four places.
fn money_units(value: &Value, precision: u8) -> Option<Result<i128>> {
    let decimal = match value {
        Value::Double(_) | Value::Float(_) => {
            let text = format!("{:.4}", value.as_f64()?);
            match text.parse::<Decimal>() {
                Ok(d) => d,
                Err(e) => return Some(Err(e)),
            }
        }
        other => other.as_decimal()?,
    };
    Some(decimal.rescale(precision, 4).map(|d| d.unscaled()))
}

/// Split microseconds since the epoch into (days, microseconds of day).
fn split_micros(micros: i64) -> (i64, i64) {
    (
        micros.div_euclid(MICROS_PER_DAY),
        micros.rem_euclid(MICROS_PER_DAY),
    )
}

fn datetime_to_micros(days_since_1900: i64, ticks: i64) -> i64 {
    (days_since_1900 - DAYS_1900_TO_UNIX) * MICROS_PER_DAY + ticks_to_micros(ticks)
}

/// 1/300 s ticks to microseconds, rounded to nearest.
pub fn ticks_to_micros(ticks: i64) -> i64 {
    (ticks * 10_000 + 1) / 3
}

/// Microseconds to 1/300 s ticks, rounded to nearest.
pub fn micros_to_ticks(micros: i64) -> i64 {
    (micros * 3 + 5_000) / 10_000
}

/// Days since the Unix epoch for a proleptic Gregorian date.
pub fn days_from_civil(year: i64, month: u32, day: u32) -> i64 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = y.div_euclid(400);
    let yoe = y.rem_euclid(400);
    let m = i64::from(month);
    let doy = (153 * (if m > 2 { m - 3 } else { m + 9 }) + 2) / 5 + i64::from(day) - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

/// Total `CS_NUMERIC` bytes (sign included) used for `precision` digits.
pub fn numeric_len(precision: u8) -> usize {
    let max = 10u128.pow(u32::from(precision)) - 1;
    let bits = 128 - max.leading_zeros() as usize;
    1 + bits.div_ceil(8)
}

fn encode_numeric(decimal: &Decimal) -> Vec<u8> {
    let mut out = vec![0u8; NUMERIC_LEN];
    out[0] = decimal.precision();
    out[1] = decimal.scale();
    out[2] = u8::from(decimal.is_negative());
    let magnitude = decimal.unscaled().unsigned_abs().to_be_bytes();
    let len = numeric_len(decimal.precision()) - 1;
    out[3..3 + len].copy_from_slice(&magnitude[16 - len..]);
    out
}

fn decode_numeric(data: &[u8]) -> Result<Decimal> {
    let short = || conversion_error("numeric", format!("{}-byte buffer", data.len()));
    let (&precision, rest) = data.split_first().ok_or_else(short)?;
    let (&scale, array) = rest.split_first().ok_or_else(short)?;
    if precision == 0 || precision > sqlmodel_core::decimal::MAX_PRECISION {
        return Err(conversion_error(
            "numeric with at most 38 digits",
            format!("precision {precision}"),
        ));
    }
    let len = numeric_len(precision) - 1;
    let (&sign, digits) = array.split_first().ok_or_else(short)?;
    let digits = digits.get(..len).ok_or_else(short)?;
    let mut magnitude = [0u8; 16];
    magnitude[16 - len..].copy_from_slice(digits);
    let magnitude = i128::try_from(u128::from_be_bytes(magnitude))
        .map_err(|_| conversion_error("numeric", "magnitude overflow".to_string()))?;
    let unscaled = if sign == 0 { magnitude } else { -magnitude };
    Decimal::new(unscaled, precision, scale)
}

fn fixed<const N: usize>(data: &[u8], ty: DbType) -> Result<[u8; N]> {
    data.get(..N)
        .and_then(|bytes| <[u8; N]>::try_from(bytes).ok())
        .ok_or_else(|| {
            conversion_error(ty.sql_name(), format!("{}-byte buffer, need {N}", data.len()))
        })
}

fn narrow<T: TryFrom<i128>>(value: i128, ty: DbType) -> Result<T> {
    T::try_from(value).map_err(|_| conversion_error(ty.sql_name(), format!("{value} out of range")))
}

fn check_length(len: usize, format: &DataFormat) -> Result<()> {
    match usize::try_from(format.maxlength) {
        Ok(max) if max > 0 && len > max => Err(conversion_error(
            format.datatype.sql_name(),
            format!("{len} bytes, column holds {max}"),
        )),
        _ => Ok(()),
    }
}

fn conversion_error(expected: &'static str, actual: String) -> Error {
    Error::Type(TypeError {
        expected,
        actual,
        column: None,
        rust_type: None,
    })
}
