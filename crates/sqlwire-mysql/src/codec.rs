//! Row value codec for the text and binary result protocols, plus the
//! binary parameter encoding used by `COM_STMT_EXECUTE`.
//!
//! Column metadata decides how each field is interpreted: the declared
//! [`FieldType`], the `UNSIGNED` and `ZEROFILL` flags, the display length
//! and the binary charset.

#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]

use std::fmt::Write as _;

use sqlwire_core::error::UsageErrorKind;
use sqlwire_core::{Error, Result, Value};

use crate::buffer::{Buffer, DecodeError, DecodeResult};
use crate::column::{ColumnDefinition, FieldType};

/// Largest magnitude of a MySQL TIME value: 838:59:59.
const MAX_TIME_MICROS: u64 = (838 * 3600 + 59 * 60 + 59) * 1_000_000 + 999_999;

// ==================== Text protocol ====================

/// Decode one text-protocol row.
pub fn decode_text_row(payload: &[u8], columns: &[ColumnDefinition]) -> DecodeResult<Vec<Value>> {
    let mut buf = Buffer::from_vec(payload.to_vec());
    let mut values = Vec::with_capacity(columns.len());
    for column in columns {
        let value = match buf.read_lenenc_bytes()? {
            Some(data) => decode_text_value(column, data),
            None => Value::Null,
        };
        values.push(value);
    }
    Ok(values)
}

/// Decode a single text-protocol field.
///
/// Numeric columns are narrowed to integers or floats unless they are
/// zerofilled, in which case the server's padded text is kept.
pub fn decode_text_value(column: &ColumnDefinition, data: &[u8]) -> Value {
    let text = String::from_utf8_lossy(data);
    let ty = column.column_type;

    if column.is_zerofilled() && ty.is_numeric() {
        return Value::Text(text.into_owned());
    }

    let parsed = match ty {
        FieldType::Tiny if column.is_unsigned() => text.parse::<u8>().ok().map(Value::from),
        FieldType::Tiny => text.parse::<i8>().ok().map(Value::TinyInt),
        FieldType::Short if column.is_unsigned() => text.parse::<u16>().ok().map(Value::from),
        FieldType::Short | FieldType::Year => text.parse::<i16>().ok().map(Value::SmallInt),
        FieldType::Long | FieldType::Int24 if column.is_unsigned() => {
            text.parse::<u32>().ok().map(Value::from)
        }
        FieldType::Long | FieldType::Int24 => text.parse::<i32>().ok().map(Value::Int),
        FieldType::LongLong if column.is_unsigned() => {
            text.parse::<u64>().ok().map(Value::from_unsigned)
        }
        FieldType::LongLong => text.parse::<i64>().ok().map(Value::BigInt),
        FieldType::Float => text.parse::<f32>().ok().map(Value::Float),
        FieldType::Double => text.parse::<f64>().ok().map(Value::Double),
        FieldType::Decimal | FieldType::NewDecimal => Some(Value::Decimal(text.to_string())),
        FieldType::Json => serde_json::from_str(&text).ok().map(Value::Json),
        FieldType::Null => Some(Value::Null),
        FieldType::Bit | FieldType::Geometry => Some(Value::Bytes(data.to_vec())),
        _ if carries_bytes(column) => Some(Value::Bytes(data.to_vec())),
        _ => None,
    };
    parsed.unwrap_or_else(|| Value::Text(text.into_owned()))
}

/// Blob and string columns with the binary charset hold raw bytes.
fn carries_bytes(column: &ColumnDefinition) -> bool {
    let ty = column.column_type;
    let stringish = ty.is_blob()
        || matches!(
            ty,
            FieldType::String | FieldType::VarString | FieldType::VarChar
        );
    stringish && column.is_binary_charset()
}

// ==================== Binary protocol ====================

/// Decode one binary-protocol row (the payload still carries its 0x00 header).
pub fn decode_binary_row(
    payload: &[u8],
    columns: &[ColumnDefinition],
) -> DecodeResult<Vec<Value>> {
    let mut buf = Buffer::from_vec(payload.to_vec());
    let header = buf.read_u8()?;
    if header != 0x00 {
        return Err(DecodeError::malformed(format!(
            "binary row header must be 0x00, got {header:#04x}"
        )));
    }

    // NULL bitmap with a two-bit offset.
    let bitmap_len = (columns.len() + 7 + 2) / 8;
    let bitmap = buf.read(bitmap_len)?.to_vec();

    let mut values = Vec::with_capacity(columns.len());
    for (i, column) in columns.iter().enumerate() {
        let bit = i + 2;
        if bitmap[bit / 8] & (1 << (bit % 8)) != 0 {
            values.push(Value::Null);
            continue;
        }
        values.push(decode_binary_value(&mut buf, column)?);
    }
    Ok(values)
}

/// Decode a single binary-protocol field from the front of `buf`.
pub fn decode_binary_value(buf: &mut Buffer, column: &ColumnDefinition) -> DecodeResult<Value> {
    let unsigned = column.is_unsigned();
    let value = match column.column_type {
        FieldType::Null => Value::Null,
        FieldType::Tiny => {
            let raw = buf.read_u8()?;
            if unsigned {
                Value::from(raw)
            } else {
                Value::TinyInt(raw as i8)
            }
        }
        FieldType::Short | FieldType::Year => {
            let raw = buf.read_u16()?;
            if unsigned {
                Value::from(raw)
            } else {
                Value::SmallInt(raw as i16)
            }
        }
        FieldType::Long | FieldType::Int24 => {
            let raw = buf.read_u32()?;
            if unsigned {
                Value::from(raw)
            } else {
                Value::Int(raw as i32)
            }
        }
        FieldType::LongLong => {
            let raw = buf.read_u64()?;
            if unsigned {
                Value::from_unsigned(raw)
            } else {
                Value::BigInt(raw as i64)
            }
        }
        FieldType::Float => Value::Float(f32::from_bits(buf.read_u32()?)),
        FieldType::Double => Value::Double(f64::from_bits(buf.read_u64()?)),
        FieldType::Date | FieldType::NewDate => {
            let parts = read_temporal(buf)?;
            Value::Text(parts.date_string())
        }
        FieldType::DateTime | FieldType::DateTime2 => {
            let parts = read_temporal(buf)?;
            Value::Text(parts.datetime_string())
        }
        FieldType::Timestamp | FieldType::Timestamp2 => {
            let parts = read_temporal(buf)?;
            match parts.epoch_micros() {
                Some(micros) => Value::Timestamp(micros),
                None => Value::Text(parts.datetime_string()),
            }
        }
        FieldType::Time | FieldType::Time2 => Value::Text(read_time(buf)?),
        _ => {
            let data = buf.read_lenenc_bytes()?.unwrap_or_default().to_vec();
            return Ok(decode_text_value(column, &data));
        }
    };

    if column.is_zerofilled() && column.column_type.is_numeric() {
        if let Some(text) = zero_pad(&value, column) {
            return Ok(Value::Text(text));
        }
    }
    Ok(value)
}

/// Decimals value meaning "not fixed" for FLOAT/DOUBLE columns.
const FLOATING_DECIMALS: u8 = 0x1F;

fn zero_pad(value: &Value, column: &ColumnDefinition) -> Option<String> {
    let width = column.column_length as usize;
    let float = match value {
        Value::UBigInt(v) => return Some(format!("{v:0width$}")),
        Value::Float(v) => f64::from(*v),
        Value::Double(v) => *v,
        other => return other.as_i64().map(|v| format!("{v:0width$}")),
    };
    if column.decimals < FLOATING_DECIMALS {
        let prec = usize::from(column.decimals);
        Some(format!("{float:0width$.prec$}"))
    } else {
        Some(format!("{float:0width$}"))
    }
}

/// Calendar fields of a binary DATE/DATETIME/TIMESTAMP value.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Temporal {
    year: u16,
    month: u8,
    day: u8,
    hour: u8,
    minute: u8,
    second: u8,
    micros: u32,
}

impl Temporal {
    fn is_zero(&self) -> bool {
        *self == Temporal::default()
    }

    fn date_string(&self) -> String {
        format!("{:04}-{:02}-{:02}", self.year, self.month, self.day)
    }

    fn datetime_string(&self) -> String {
        let mut out = format!(
            "{} {:02}:{:02}:{:02}",
            self.date_string(),
            self.hour,
            self.minute,
            self.second
        );
        if self.micros != 0 {
            let _ = write!(out, ".{:06}", self.micros);
        }
        out
    }

    /// Microseconds since the Unix epoch, or `None` for the zero date.
    fn epoch_micros(&self) -> Option<i64> {
        if self.is_zero() || self.month == 0 || self.day == 0 {
            return None;
        }
        let days = days_from_civil(
            i32::from(self.year),
            u32::from(self.month),
            u32::from(self.day),
        );
        let secs = i64::from(days) * 86_400
            + i64::from(self.hour) * 3600
            + i64::from(self.minute) * 60
            + i64::from(self.second);
        Some(secs * 1_000_000 + i64::from(self.micros))
    }
}

/// The leading length byte selects how many fields follow: 0, 4, 7 or 11.
fn read_temporal(buf: &mut Buffer) -> DecodeResult<Temporal> {
    let len = buf.read_u8()?;
    let mut t = Temporal::default();
    if len >= 4 {
        t.year = buf.read_u16()?;
        t.month = buf.read_u8()?;
        t.day = buf.read_u8()?;
    }
    if len >= 7 {
        t.hour = buf.read_u8()?;
        t.minute = buf.read_u8()?;
        t.second = buf.read_u8()?;
    }
    if len >= 11 {
        t.micros = buf.read_u32()?;
    }
    let consumed = match len {
        0 => 0,
        1..=4 => 4,
        5..=7 => 7,
        _ => 11,
    };
    if usize::from(len) > consumed {
        buf.skip(usize::from(len) - consumed)?;
    }
    Ok(t)
}

/// Binary TIME: length, sign, days, hours, minutes, seconds, micros.
fn read_time(buf: &mut Buffer) -> DecodeResult<String> {
    let len = buf.read_u8()?;
    if len == 0 {
        return Ok("00:00:00".to_string());
    }
    let negative = buf.read_u8()? != 0;
    let days = buf.read_u32()?;
    let hours = buf.read_u8()?;
    let minutes = buf.read_u8()?;
    let seconds = buf.read_u8()?;
    let micros = if len >= 12 { buf.read_u32()? } else { 0 };

    let total_hours = u64::from(days) * 24 + u64::from(hours);
    let sign = if negative { "-" } else { "" };
    let mut out = format!("{sign}{total_hours:02}:{minutes:02}:{seconds:02}");
    if micros != 0 {
        let _ = write!(out, ".{micros:06}");
    }
    Ok(out)
}

/// Days since 1970-01-01 for a proleptic Gregorian date.
pub(crate) fn days_from_civil(year: i32, month: u32, day: u32) -> i32 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = (if y >= 0 { y } else { y - 399 }) / 400;
    let yoe = (y - era * 400) as u32;
    let mp = if month > 2 { month - 3 } else { month + 9 };
    let doy = (153 * mp + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe as i32 - 719_468
}

/// Inverse of [`days_from_civil`].
pub(crate) fn civil_from_days(days: i32) -> (i32, u32, u32) {
    let z = days + 719_468;
    let era = (if z >= 0 { z } else { z - 146_096 }) / 146_097;
    let doe = (z - era * 146_097) as u32;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe as i32 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    (if m <= 2 { y + 1 } else { y }, m, d)
}

// ==================== Parameter encoding ====================

/// Wire type and unsigned flag announced for a bound parameter.
pub fn param_type(value: &Value) -> (FieldType, bool) {
    match value {
        Value::Null => (FieldType::Null, false),
        Value::Bool(_) | Value::TinyInt(_) => (FieldType::Tiny, false),
        Value::SmallInt(_) => (FieldType::Short, false),
        Value::Int(_) => (FieldType::Long, false),
        Value::BigInt(_) => (FieldType::LongLong, false),
        Value::UBigInt(_) => (FieldType::LongLong, true),
        Value::Float(_) => (FieldType::Float, false),
        Value::Double(_) => (FieldType::Double, false),
        Value::Decimal(_) => (FieldType::NewDecimal, false),
        Value::Text(_) => (FieldType::VarString, false),
        Value::Bytes(_) => (FieldType::Blob, false),
        Value::Json(_) => (FieldType::Json, false),
        Value::Date(_) => (FieldType::Date, false),
        Value::Time(_) => (FieldType::Time, false),
        Value::Timestamp(_) => (FieldType::DateTime, false),
    }
}

/// Append the binary encoding of a non-NULL parameter.
///
/// Values MySQL cannot represent (non-finite floats, TIME beyond
/// 838:59:59) are rejected before anything reaches the wire.
pub fn encode_binary_param(buf: &mut Buffer, value: &Value) -> Result<()> {
    match value {
        Value::Null => {}
        Value::Bool(b) => buf.put_u8(u8::from(*b)),
        Value::TinyInt(v) => buf.put_u8(*v as u8),
        Value::SmallInt(v) => buf.put_u16(*v as u16),
        Value::Int(v) => buf.put_u32(*v as u32),
        Value::BigInt(v) => buf.put_u64(*v as u64),
        Value::UBigInt(v) => buf.put_u64(*v),
        Value::Float(v) => {
            if !v.is_finite() {
                return Err(unsupported(format!("non-finite FLOAT parameter {v}")));
            }
            buf.put_u32(v.to_bits());
        }
        Value::Double(v) => {
            if !v.is_finite() {
                return Err(unsupported(format!("non-finite DOUBLE parameter {v}")));
            }
            buf.put_u64(v.to_bits());
        }
        Value::Decimal(s) | Value::Text(s) => buf.put_lenenc_str(s),
        Value::Bytes(b) => buf.put_lenenc_bytes(b),
        Value::Json(j) => buf.put_lenenc_str(&j.to_string()),
        Value::Date(days) => encode_date(buf, *days),
        Value::Time(micros) => encode_time(buf, *micros)?,
        Value::Timestamp(micros) => encode_datetime(buf, *micros),
    }
    Ok(())
}

fn unsupported(message: String) -> Error {
    Error::usage(UsageErrorKind::UnsupportedParameterType, message)
}

fn encode_date(buf: &mut Buffer, days: i32) {
    let (year, month, day) = civil_from_days(days);
    buf.put_u8(4);
    buf.put_u16(year as u16);
    buf.put_u8(month as u8);
    buf.put_u8(day as u8);
}

fn encode_time(buf: &mut Buffer, micros: i64) -> Result<()> {
    let magnitude = micros.unsigned_abs();
    if magnitude > MAX_TIME_MICROS {
        return Err(unsupported(format!(
            "TIME parameter out of range: {micros} microseconds"
        )));
    }
    let frac = (magnitude % 1_000_000) as u32;
    let total_secs = magnitude / 1_000_000;
    let days = (total_secs / 86_400) as u32;
    let hours = ((total_secs % 86_400) / 3600) as u8;
    let minutes = ((total_secs % 3600) / 60) as u8;
    let seconds = (total_secs % 60) as u8;

    if magnitude == 0 {
        buf.put_u8(0);
        return Ok(());
    }
    buf.put_u8(if frac == 0 { 8 } else { 12 });
    buf.put_u8(u8::from(micros < 0));
    buf.put_u32(days);
    buf.put_u8(hours);
    buf.put_u8(minutes);
    buf.put_u8(seconds);
    if frac != 0 {
        buf.put_u32(frac);
    }
    Ok(())
}

fn encode_datetime(buf: &mut Buffer, micros: i64) {
    let secs = micros.div_euclid(1_000_000);
    let frac = micros.rem_euclid(1_000_000) as u32;
    let days = secs.div_euclid(86_400) as i32;
    let tod = secs.rem_euclid(86_400);
    let (year, month, day) = civil_from_days(days);

    let time_len = if frac != 0 {
        11
    } else if tod != 0 {
        7
    } else {
        4
    };
    buf.put_u8(time_len);
    buf.put_u16(year as u16);
    buf.put_u8(month as u8);
    buf.put_u8(day as u8);
    if time_len >= 7 {
        buf.put_u8((tod / 3600) as u8);
        buf.put_u8(((tod % 3600) / 60) as u8);
        buf.put_u8((tod % 60) as u8);
    }
    if time_len == 11 {
        buf.put_u32(frac);
    }
}

// ==================== Quoting ====================

/// Render a value as an SQL literal.
///
/// When the server reports `NO_BACKSLASH_ESCAPES`, only quotes are doubled;
/// otherwise control characters are backslash-escaped too.
pub fn quote(value: &Value, no_backslash_escapes: bool) -> Result<String> {
    let literal = match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        Value::TinyInt(v) => v.to_string(),
        Value::SmallInt(v) => v.to_string(),
        Value::Int(v) => v.to_string(),
        Value::BigInt(v) => v.to_string(),
        Value::UBigInt(v) => v.to_string(),
        Value::Float(v) if v.is_finite() => v.to_string(),
        Value::Double(v) if v.is_finite() => v.to_string(),
        Value::Float(_) | Value::Double(_) => {
            return Err(unsupported(format!(
                "cannot quote non-finite number {value:?}"
            )));
        }
        Value::Decimal(s) => s.clone(),
        Value::Text(s) => quote_str(s, no_backslash_escapes),
        Value::Json(j) => quote_str(&j.to_string(), no_backslash_escapes),
        Value::Bytes(b) => {
            let mut out = String::with_capacity(b.len() * 2 + 3);
            out.push_str("X'");
            for byte in b {
                let _ = write!(out, "{byte:02X}");
            }
            out.push('\'');
            out
        }
        Value::Date(days) => {
            let (y, m, d) = civil_from_days(*days);
            format!("'{y:04}-{m:02}-{d:02}'")
        }
        Value::Time(micros) => {
            let magnitude = micros.unsigned_abs();
            let secs = magnitude / 1_000_000;
            let sign = if *micros < 0 { "-" } else { "" };
            format!(
                "'{sign}{:02}:{:02}:{:02}.{:06}'",
                secs / 3600,
                (secs % 3600) / 60,
                secs % 60,
                magnitude % 1_000_000
            )
        }
        Value::Timestamp(micros) => {
            let secs = micros.div_euclid(1_000_000);
            let tod = secs.rem_euclid(86_400);
            let (y, m, d) = civil_from_days(secs.div_euclid(86_400) as i32);
            format!(
                "'{y:04}-{m:02}-{d:02} {:02}:{:02}:{:02}.{:06}'",
                tod / 3600,
                (tod % 3600) / 60,
                tod % 60,
                micros.rem_euclid(1_000_000)
            )
        }
    };
    Ok(literal)
}

/// Quote a string literal.
pub fn quote_str(s: &str, no_backslash_escapes: bool) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for ch in s.chars() {
        if no_backslash_escapes {
            if ch == '\'' {
                out.push_str("''");
            } else {
                out.push(ch);
            }
            continue;
        }
        match ch {
            '\0' => out.push_str("\\0"),
            '\'' => out.push_str("\\'"),
            '"' => out.push_str("\\\""),
            '\x08' => out.push_str("\\b"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\x1a' => out.push_str("\\Z"),
            '\\' => out.push_str("\\\\"),
            _ => out.push(ch),
        }
    }
    out.push('\'');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::LENENC_NULL;
    use crate::column::column_flags;

    fn col(ty: FieldType, flags: u16, length: u32) -> ColumnDefinition {
        col_cs(ty, flags, length, 45)
    }

    fn col_cs(ty: FieldType, flags: u16, length: u32, charset: u16) -> ColumnDefinition {
        ColumnDefinition {
            catalog: "def".into(),
            schema: "test".into(),
            table: "t".into(),
            org_table: "t".into(),
            name: "c".into(),
            org_name: "c".into(),
            charset,
            column_length: length,
            column_type: ty,
            flags,
            decimals: 0,
        }
    }

    fn text_row(fields: &[Option<&[u8]>]) -> Vec<u8> {
        let mut buf = Buffer::new();
        for field in fields {
            match field {
                Some(data) => buf.put_lenenc_bytes(data),
                None => buf.put_u8(LENENC_NULL),
            }
        }
        buf.into_vec()
    }

    #[test]
    fn test_zerofill_text_keeps_padding() {
        let column = col(FieldType::Long, column_flags::ZEROFILL | column_flags::UNSIGNED, 5);
        let values = decode_text_row(&text_row(&[Some(b"00005")]), &[column]).unwrap();
        assert_eq!(values, vec![Value::Text("00005".to_string())]);
    }

    #[test]
    fn test_text_numeric_narrowing() {
        let columns = vec![
            col(FieldType::LongLong, 0, 20),
            col(FieldType::LongLong, column_flags::UNSIGNED, 20),
            col(FieldType::Tiny, column_flags::UNSIGNED, 3),
            col(FieldType::Double, 0, 22),
            col(FieldType::NewDecimal, 0, 10),
            col(FieldType::VarString, 0, 255),
        ];
        let payload = text_row(&[
            Some(b"-42"),
            Some(b"18446744073709551615"),
            Some(b"200"),
            Some(b"1.5"),
            Some(b"3.14"),
            None,
        ]);
        let values = decode_text_row(&payload, &columns).unwrap();
        assert_eq!(
            values,
            vec![
                Value::BigInt(-42),
                Value::UBigInt(u64::MAX),
                Value::SmallInt(200),
                Value::Double(1.5),
                Value::Decimal("3.14".into()),
                Value::Null,
            ]
        );
    }

    #[test]
    fn test_text_binary_charset_blob_is_bytes() {
        let blob = col_cs(FieldType::Blob, column_flags::BINARY, 65535, 63);
        let text = col(FieldType::Blob, 0, 65535);
        let payload = text_row(&[Some(b"\x00\x01"), Some(b"hi")]);
        let values = decode_text_row(&payload, &[blob, text]).unwrap();
        assert_eq!(values[0], Value::Bytes(vec![0, 1]));
        assert_eq!(values[1], Value::Text("hi".into()));
    }

    #[test]
    fn test_text_unparseable_number_falls_back_to_text() {
        let column = col(FieldType::Long, 0, 11);
        assert_eq!(
            decode_text_value(&column, b"abc"),
            Value::Text("abc".to_string())
        );
    }

    #[test]
    fn test_truncated_text_row_underflows() {
        let column = col(FieldType::VarString, 0, 10);
        let err = decode_text_row(&[5, b'a', b'b'], &[column]).unwrap_err();
        assert!(err.is_underflow());
    }

    #[test]
    fn test_binary_row_null_bitmap_offset() {
        let columns = vec![
            col(FieldType::Long, 0, 11),
            col(FieldType::VarString, 0, 10),
            col(FieldType::Tiny, 0, 4),
        ];
        let mut buf = Buffer::new();
        buf.put_u8(0x00);
        // Column 1 is NULL: bit 3 of the first byte.
        buf.put_u8(0b0000_1000);
        buf.put_u32(7);
        buf.put_u8(0xFF);
        let values = decode_binary_row(&buf.into_vec(), &columns).unwrap();
        assert_eq!(values, vec![Value::Int(7), Value::Null, Value::TinyInt(-1)]);
    }

    #[test]
    fn test_binary_unsigned_correction() {
        let columns = vec![
            col(FieldType::LongLong, column_flags::UNSIGNED, 20),
            col(FieldType::Long, column_flags::UNSIGNED, 10),
        ];
        let mut buf = Buffer::new();
        buf.put_u8(0x00);
        buf.put_u8(0x00);
        buf.put_u64(u64::MAX);
        buf.put_u32(u32::MAX);
        let values = decode_binary_row(&buf.into_vec(), &columns).unwrap();
        assert_eq!(
            values,
            vec![Value::UBigInt(u64::MAX), Value::BigInt(i64::from(u32::MAX))]
        );
    }

    #[test]
    fn test_binary_zerofill_repads() {
        let column = col(FieldType::Long, column_flags::ZEROFILL | column_flags::UNSIGNED, 5);
        let mut buf = Buffer::new();
        buf.put_u8(0x00);
        buf.put_u8(0x00);
        buf.put_u32(5);
        let values = decode_binary_row(&buf.into_vec(), &[column]).unwrap();
        assert_eq!(values, vec![Value::Text("00005".into())]);

        // FLOAT(7,2) ZEROFILL reads the same as the text protocol would show it.
        let mut column = col(FieldType::Float, column_flags::ZEROFILL | column_flags::UNSIGNED, 7);
        column.decimals = 2;
        let mut buf = Buffer::new();
        buf.put_u8(0x00);
        buf.put_u8(0x00);
        buf.put_u32(3.5f32.to_bits());
        let values = decode_binary_row(&buf.into_vec(), std::slice::from_ref(&column)).unwrap();
        assert_eq!(values, vec![Value::Text("0003.50".into())]);
        assert_eq!(decode_text_value(&column, b"0003.50"), Value::Text("0003.50".into()));
    }

    #[test]
    fn test_binary_temporal_values() {
        let columns = vec![
            col(FieldType::Date, 0, 10),
            col(FieldType::DateTime, 0, 26),
            col(FieldType::Timestamp, 0, 19),
            col(FieldType::Time, 0, 10),
        ];
        let mut buf = Buffer::new();
        buf.put_u8(0x00);
        buf.put_u8(0x00);
        // DATE 2024-02-29
        buf.put_u8(4);
        buf.put_u16(2024);
        buf.put_u8(2);
        buf.put_u8(29);
        // DATETIME 2024-02-29 13:14:15.000250
        buf.put_u8(11);
        buf.put_u16(2024);
        buf.put_u8(2);
        buf.put_u8(29);
        buf.put_u8(13);
        buf.put_u8(14);
        buf.put_u8(15);
        buf.put_u32(250);
        // TIMESTAMP 1970-01-02 00:00:01
        buf.put_u8(7);
        buf.put_u16(1970);
        buf.put_u8(1);
        buf.put_u8(2);
        buf.put_u8(0);
        buf.put_u8(0);
        buf.put_u8(1);
        // TIME -1 day 02:03:04
        buf.put_u8(8);
        buf.put_u8(1);
        buf.put_u32(1);
        buf.put_u8(2);
        buf.put_u8(3);
        buf.put_u8(4);

        let values = decode_binary_row(&buf.into_vec(), &columns).unwrap();
        assert_eq!(values[0], Value::Text("2024-02-29".into()));
        assert_eq!(values[1], Value::Text("2024-02-29 13:14:15.000250".into()));
        assert_eq!(values[2], Value::Timestamp(86_401_000_000));
        assert_eq!(values[3], Value::Text("-26:03:04".into()));
    }

    #[test]
    fn test_zero_timestamp_is_text() {
        let column = col(FieldType::Timestamp, 0, 19);
        let mut buf = Buffer::from_vec(vec![0]);
        assert_eq!(
            decode_binary_value(&mut buf, &column).unwrap(),
            Value::Text("0000-00-00 00:00:00".into())
        );
    }

    #[test]
    fn test_civil_conversions() {
        assert_eq!(days_from_civil(1970, 1, 1), 0);
        assert_eq!(days_from_civil(2000, 3, 1), 11_017);
        assert_eq!(civil_from_days(11_017), (2000, 3, 1));
        assert_eq!(civil_from_days(-1), (1969, 12, 31));
    }

    #[test]
    fn test_encode_params() {
        let mut buf = Buffer::new();
        encode_binary_param(&mut buf, &Value::Int(-2)).unwrap();
        encode_binary_param(&mut buf, &Value::Text("ab".into())).unwrap();
        encode_binary_param(&mut buf, &Value::Date(0)).unwrap();
        assert_eq!(
            buf.into_vec(),
            vec![0xFE, 0xFF, 0xFF, 0xFF, 2, b'a', b'b', 4, 0xB2, 0x07, 1, 1]
        );
        assert_eq!(param_type(&Value::UBigInt(1)), (FieldType::LongLong, true));
    }

    #[test]
    fn test_encode_datetime_lengths() {
        let mut buf = Buffer::new();
        encode_binary_param(&mut buf, &Value::Timestamp(86_400_000_000)).unwrap();
        assert_eq!(buf.into_vec(), vec![4, 0xB2, 0x07, 1, 2]);

        let mut buf = Buffer::new();
        encode_binary_param(&mut buf, &Value::Timestamp(1_500_000)).unwrap();
        let bytes = buf.into_vec();
        assert_eq!(bytes[0], 11);
        assert_eq!(&bytes[5..8], &[0, 0, 1]);
        assert_eq!(u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]), 500_000);
    }

    #[test]
    fn test_unsupported_params_are_usage_errors() {
        let mut buf = Buffer::new();
        let err = encode_binary_param(&mut buf, &Value::Double(f64::NAN)).unwrap_err();
        assert!(err.is_usage_error());
        let err = encode_binary_param(&mut buf, &Value::Time(900 * 3600 * 1_000_000)).unwrap_err();
        assert!(err.is_usage_error());
        assert!(buf.written().is_empty());
    }

    #[test]
    fn test_quote_modes() {
        assert_eq!(quote_str("it's\n", false), "'it\\'s\\n'");
        assert_eq!(quote_str("it's\n", true), "'it''s\n'");
        assert_eq!(quote_str("a\\b", true), "'a\\b'");
        assert_eq!(quote(&Value::Null, false).unwrap(), "NULL");
        assert_eq!(quote(&Value::Bytes(vec![0xDE, 0xAD]), false).unwrap(), "X'DEAD'");
        assert_eq!(quote(&Value::Date(0), false).unwrap(), "'1970-01-01'");
        assert!(quote(&Value::Float(f32::INFINITY), false).is_err());
    }
}
