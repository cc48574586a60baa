//! Column metadata: field types, column flags and column definitions.

use crate::buffer::{Buffer, DecodeResult};
use crate::protocol::charset;

/// MySQL field type codes.
///
/// These are the `MYSQL_TYPE_*` constants from the MySQL C API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FieldType {
    Decimal = 0x00,
    Tiny = 0x01,
    Short = 0x02,
    Long = 0x03,
    Float = 0x04,
    Double = 0x05,
    Null = 0x06,
    Timestamp = 0x07,
    LongLong = 0x08,
    Int24 = 0x09,
    Date = 0x0A,
    Time = 0x0B,
    DateTime = 0x0C,
    Year = 0x0D,
    NewDate = 0x0E,
    VarChar = 0x0F,
    Bit = 0x10,
    Timestamp2 = 0x11,
    DateTime2 = 0x12,
    Time2 = 0x13,
    Json = 0xF5,
    NewDecimal = 0xF6,
    Enum = 0xF7,
    Set = 0xF8,
    TinyBlob = 0xF9,
    MediumBlob = 0xFA,
    LongBlob = 0xFB,
    Blob = 0xFC,
    VarString = 0xFD,
    String = 0xFE,
    Geometry = 0xFF,
}

impl FieldType {
    /// Parse a field type from its wire code. Unknown codes decode as strings.
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => FieldType::Decimal,
            0x01 => FieldType::Tiny,
            0x02 => FieldType::Short,
            0x03 => FieldType::Long,
            0x04 => FieldType::Float,
            0x05 => FieldType::Double,
            0x06 => FieldType::Null,
            0x07 => FieldType::Timestamp,
            0x08 => FieldType::LongLong,
            0x09 => FieldType::Int24,
            0x0A => FieldType::Date,
            0x0B => FieldType::Time,
            0x0C => FieldType::DateTime,
            0x0D => FieldType::Year,
            0x0E => FieldType::NewDate,
            0x0F => FieldType::VarChar,
            0x10 => FieldType::Bit,
            0x11 => FieldType::Timestamp2,
            0x12 => FieldType::DateTime2,
            0x13 => FieldType::Time2,
            0xF5 => FieldType::Json,
            0xF6 => FieldType::NewDecimal,
            0xF7 => FieldType::Enum,
            0xF8 => FieldType::Set,
            0xF9 => FieldType::TinyBlob,
            0xFA => FieldType::MediumBlob,
            0xFB => FieldType::LongBlob,
            0xFC => FieldType::Blob,
            0xFD => FieldType::VarString,
            0xFF => FieldType::Geometry,
            _ => FieldType::String,
        }
    }

    #[must_use]
    pub const fn is_integer(self) -> bool {
        matches!(
            self,
            FieldType::Tiny
                | FieldType::Short
                | FieldType::Long
                | FieldType::LongLong
                | FieldType::Int24
                | FieldType::Year
        )
    }

    #[must_use]
    pub const fn is_float(self) -> bool {
        matches!(self, FieldType::Float | FieldType::Double)
    }

    #[must_use]
    pub const fn is_decimal(self) -> bool {
        matches!(self, FieldType::Decimal | FieldType::NewDecimal)
    }

    /// Integer, float or decimal.
    #[must_use]
    pub const fn is_numeric(self) -> bool {
        self.is_integer() || self.is_float() || self.is_decimal()
    }

    #[must_use]
    pub const fn is_blob(self) -> bool {
        matches!(
            self,
            FieldType::TinyBlob
                | FieldType::MediumBlob
                | FieldType::LongBlob
                | FieldType::Blob
                | FieldType::Geometry
        )
    }

    #[must_use]
    pub const fn is_temporal(self) -> bool {
        matches!(
            self,
            FieldType::Date
                | FieldType::Time
                | FieldType::DateTime
                | FieldType::Timestamp
                | FieldType::NewDate
                | FieldType::Timestamp2
                | FieldType::DateTime2
                | FieldType::Time2
        )
    }

    /// SQL type name as declared in DDL.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            FieldType::Decimal | FieldType::NewDecimal => "DECIMAL",
            FieldType::Tiny => "TINYINT",
            FieldType::Short => "SMALLINT",
            FieldType::Long => "INT",
            FieldType::Float => "FLOAT",
            FieldType::Double => "DOUBLE",
            FieldType::Null => "NULL",
            FieldType::Timestamp | FieldType::Timestamp2 => "TIMESTAMP",
            FieldType::LongLong => "BIGINT",
            FieldType::Int24 => "MEDIUMINT",
            FieldType::Date | FieldType::NewDate => "DATE",
            FieldType::Time | FieldType::Time2 => "TIME",
            FieldType::DateTime | FieldType::DateTime2 => "DATETIME",
            FieldType::Year => "YEAR",
            FieldType::VarChar | FieldType::VarString => "VARCHAR",
            FieldType::Bit => "BIT",
            FieldType::Json => "JSON",
            FieldType::Enum => "ENUM",
            FieldType::Set => "SET",
            FieldType::TinyBlob => "TINYBLOB",
            FieldType::MediumBlob => "MEDIUMBLOB",
            FieldType::LongBlob => "LONGBLOB",
            FieldType::Blob => "BLOB",
            FieldType::String => "CHAR",
            FieldType::Geometry => "GEOMETRY",
        }
    }
}

/// Column flags in result set metadata.
#[allow(dead_code)]
pub mod column_flags {
    pub const NOT_NULL: u16 = 1;
    pub const PRIMARY_KEY: u16 = 2;
    pub const UNIQUE_KEY: u16 = 4;
    pub const MULTIPLE_KEY: u16 = 8;
    pub const BLOB: u16 = 16;
    pub const UNSIGNED: u16 = 32;
    pub const ZEROFILL: u16 = 64;
    pub const BINARY: u16 = 128;
    pub const ENUM: u16 = 256;
    pub const AUTO_INCREMENT: u16 = 512;
    pub const TIMESTAMP: u16 = 1024;
    pub const SET: u16 = 2048;
    pub const NO_DEFAULT_VALUE: u16 = 4096;
    pub const ON_UPDATE_NOW: u16 = 8192;
    pub const NUM: u16 = 32768;
}

/// A column definition from a result set or prepared statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDefinition {
    pub catalog: String,
    /// Schema (database) name
    pub schema: String,
    /// Table name (or alias)
    pub table: String,
    pub org_table: String,
    /// Column name (or alias)
    pub name: String,
    pub org_name: String,
    /// Character set / collation id
    pub charset: u16,
    /// Declared display length
    pub column_length: u32,
    pub column_type: FieldType,
    pub flags: u16,
    pub decimals: u8,
}

impl ColumnDefinition {
    /// Parse a protocol 4.1 column definition packet.
    pub fn parse(payload: &[u8]) -> DecodeResult<Self> {
        let mut buf = Buffer::from_vec(payload.to_vec());
        let catalog = buf.read_lenenc_string()?.unwrap_or_default();
        let schema = buf.read_lenenc_string()?.unwrap_or_default();
        let table = buf.read_lenenc_string()?.unwrap_or_default();
        let org_table = buf.read_lenenc_string()?.unwrap_or_default();
        let name = buf.read_lenenc_string()?.unwrap_or_default();
        let org_name = buf.read_lenenc_string()?.unwrap_or_default();
        // Length of the fixed-size fields, always 0x0c.
        let _fixed = buf.read_lenenc_int()?;
        let charset = buf.read_u16()?;
        let column_length = buf.read_u32()?;
        let column_type = FieldType::from_u8(buf.read_u8()?);
        let flags = buf.read_u16()?;
        let decimals = buf.read_u8()?;

        Ok(Self {
            catalog,
            schema,
            table,
            org_table,
            name,
            org_name,
            charset,
            column_length,
            column_type,
            flags,
            decimals,
        })
    }

    /// Declared SQL type name.
    pub fn type_name(&self) -> &'static str {
        self.column_type.name()
    }

    pub const fn is_nullable(&self) -> bool {
        self.flags & column_flags::NOT_NULL == 0
    }

    pub const fn is_auto_increment(&self) -> bool {
        self.flags & column_flags::AUTO_INCREMENT != 0
    }

    pub const fn is_primary_key(&self) -> bool {
        self.flags & column_flags::PRIMARY_KEY != 0
    }

    pub const fn is_unique_key(&self) -> bool {
        self.flags & column_flags::UNIQUE_KEY != 0
    }

    pub const fn is_multiple_key(&self) -> bool {
        self.flags & column_flags::MULTIPLE_KEY != 0
    }

    pub const fn is_unsigned(&self) -> bool {
        self.flags & column_flags::UNSIGNED != 0
    }

    pub const fn is_zerofilled(&self) -> bool {
        self.flags & column_flags::ZEROFILL != 0
    }

    pub const fn is_binary(&self) -> bool {
        self.flags & column_flags::BINARY != 0
    }

    /// Blob or string column carrying raw bytes rather than text.
    pub fn is_binary_charset(&self) -> bool {
        self.charset == u16::from(charset::BINARY)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Encode a column definition packet.
    pub(crate) fn column_packet(name: &str, ty: FieldType, flags: u16, length: u32) -> Vec<u8> {
        column_packet_with_charset(name, ty, flags, length, 45)
    }

    pub(crate) fn column_packet_with_charset(
        name: &str,
        ty: FieldType,
        flags: u16,
        length: u32,
        charset: u16,
    ) -> Vec<u8> {
        let mut buf = Buffer::new();
        buf.put_lenenc_str("def");
        buf.put_lenenc_str("test");
        buf.put_lenenc_str("t");
        buf.put_lenenc_str("t");
        buf.put_lenenc_str(name);
        buf.put_lenenc_str(name);
        buf.put_lenenc_int(0x0c);
        buf.put_u16(charset);
        buf.put_u32(length);
        buf.put_u8(ty as u8);
        buf.put_u16(flags);
        buf.put_u8(0);
        buf.put_zeros(2);
        buf.into_vec()
    }

    #[test]
    fn test_parse_column_definition() {
        let packet = column_packet(
            "id",
            FieldType::Long,
            column_flags::NOT_NULL | column_flags::PRIMARY_KEY | column_flags::AUTO_INCREMENT,
            11,
        );
        let col = ColumnDefinition::parse(&packet).unwrap();
        assert_eq!(col.name, "id");
        assert_eq!(col.schema, "test");
        assert_eq!(col.table, "t");
        assert_eq!(col.column_type, FieldType::Long);
        assert_eq!(col.type_name(), "INT");
        assert_eq!(col.column_length, 11);
        assert!(!col.is_nullable());
        assert!(col.is_primary_key());
        assert!(col.is_auto_increment());
    }

    #[test]
    fn test_truncated_column_definition_fails() {
        let packet = column_packet("id", FieldType::Long, 0, 11);
        assert!(ColumnDefinition::parse(&packet[..10]).is_err());
    }

    #[test]
    fn test_flag_predicates_match_bits_exactly() {
        let predicates: [(u16, fn(&ColumnDefinition) -> bool, bool); 7] = [
            (column_flags::NOT_NULL, ColumnDefinition::is_nullable, true),
            (column_flags::AUTO_INCREMENT, ColumnDefinition::is_auto_increment, false),
            (column_flags::PRIMARY_KEY, ColumnDefinition::is_primary_key, false),
            (column_flags::UNIQUE_KEY, ColumnDefinition::is_unique_key, false),
            (column_flags::MULTIPLE_KEY, ColumnDefinition::is_multiple_key, false),
            (column_flags::UNSIGNED, ColumnDefinition::is_unsigned, false),
            (column_flags::ZEROFILL, ColumnDefinition::is_zerofilled, false),
        ];
        let mask: u16 = predicates.iter().map(|(bit, _, _)| *bit).sum();

        let mut col = ColumnDefinition::parse(&column_packet("c", FieldType::Long, 0, 1)).unwrap();
        // Every subset of the seven documented bits.
        for flags in 0..=u16::MAX {
            if flags & !mask != 0 {
                continue;
            }
            col.flags = flags;
            for (bit, predicate, inverted) in &predicates {
                let present = flags & bit != 0;
                assert_eq!(predicate(&col), present != *inverted, "flags={flags:#x}");
            }
        }
    }

    #[test]
    fn test_unknown_type_code_is_string() {
        assert_eq!(FieldType::from_u8(0x42), FieldType::String);
        assert_eq!(FieldType::from_u8(0xFE), FieldType::String);
        assert!(FieldType::Int24.is_integer());
        assert!(FieldType::NewDecimal.is_numeric());
        assert!(FieldType::Timestamp2.is_temporal());
    }
}
