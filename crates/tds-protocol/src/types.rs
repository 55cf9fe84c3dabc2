//! TDS data type codes and the length strategy each one uses on the wire.
//!
//! Every type code is distinct and taken from MS-TDS 2.2.5.4. The value
//! codec for individual SQL types lives outside this crate; the parsers
//! here only need to know how many bytes each value occupies.

use bitflags::bitflags;

/// TDS data type identifiers.
///
/// These correspond to the type bytes sent in column metadata and parameter definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TypeId {
    // Fixed-length types
    /// Null type.
    Null = 0x1F,
    /// 8-bit signed integer.
    Int1 = 0x30,
    /// Bit (boolean).
    Bit = 0x32,
    /// 16-bit signed integer.
    Int2 = 0x34,
    /// 32-bit signed integer.
    Int4 = 0x38,
    /// 64-bit signed integer.
    Int8 = 0x7F,
    /// Nullable datetime (4 or 8 bytes).
    DateTimeN = 0x6F,
    /// 32-bit floating point.
    Float4 = 0x3B,
    /// 64-bit floating point.
    Float8 = 0x3E,
    /// 8-byte money.
    Money = 0x3C,
    /// 4-byte money.
    Money4 = 0x7A,
    /// 8-byte datetime.
    DateTime = 0x3D,
    /// 4-byte small datetime.
    DateTime4 = 0x3A,

    // Variable-length types (with length prefix)
    /// Variable-length GUID.
    Guid = 0x24,
    /// Variable-length integer.
    IntN = 0x26,
    /// Variable-length decimal.
    Decimal = 0x37,
    /// Variable-length numeric.
    Numeric = 0x3F,
    /// Variable-length bit.
    BitN = 0x68,
    /// Variable-length decimal (newer).
    DecimalN = 0x6A,
    /// Variable-length numeric (newer).
    NumericN = 0x6C,
    /// Variable-length float.
    FloatN = 0x6D,
    /// Variable-length money.
    MoneyN = 0x6E,

    // Byte-counted types
    /// Fixed-length character.
    Char = 0x2F,
    /// Variable-length character.
    VarChar = 0x27,
    /// Fixed-length binary.
    Binary = 0x2D,
    /// Variable-length binary.
    VarBinary = 0x25,

    // Counted types with 2-byte length
    /// Large variable-length character.
    BigVarChar = 0xA7,
    /// Large variable-length binary.
    BigVarBinary = 0xA5,
    /// Large fixed-length character.
    BigChar = 0xAF,
    /// Large fixed-length binary.
    BigBinary = 0xAD,

    // Unicode types
    /// Fixed-length Unicode character.
    NChar = 0xEF,
    /// Variable-length Unicode character.
    NVarChar = 0xE7,

    // Legacy large object types (text pointer + 4-byte length)
    /// Text (deprecated, use varchar(max)).
    Text = 0x23,
    /// Image (deprecated, use varbinary(max)).
    Image = 0x22,
    /// NText (deprecated, use nvarchar(max)).
    NText = 0x63,

    // Date/time types (SQL Server 2008+)
    /// Date (3 bytes, length-prefixed in row data).
    Date = 0x28,
    /// Time with variable precision.
    Time = 0x29,
    /// DateTime2 with variable precision.
    DateTime2 = 0x2A,
    /// DateTimeOffset with variable precision.
    DateTimeOffset = 0x2B,

    // Special types
    /// SQL Variant (4-byte length).
    Variant = 0x62,
    /// CLR user-defined type (always PLP).
    Udt = 0xF0,
    /// XML type (always PLP).
    Xml = 0xF1,
}

impl TypeId {
    /// Create a type ID from a raw byte.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x1F => Some(Self::Null),
            0x30 => Some(Self::Int1),
            0x32 => Some(Self::Bit),
            0x34 => Some(Self::Int2),
            0x38 => Some(Self::Int4),
            0x7F => Some(Self::Int8),
            0x6F => Some(Self::DateTimeN),
            0x3B => Some(Self::Float4),
            0x3E => Some(Self::Float8),
            0x3C => Some(Self::Money),
            0x7A => Some(Self::Money4),
            0x3D => Some(Self::DateTime),
            0x3A => Some(Self::DateTime4),
            0x24 => Some(Self::Guid),
            0x26 => Some(Self::IntN),
            0x37 => Some(Self::Decimal),
            0x3F => Some(Self::Numeric),
            0x68 => Some(Self::BitN),
            0x6A => Some(Self::DecimalN),
            0x6C => Some(Self::NumericN),
            0x6D => Some(Self::FloatN),
            0x6E => Some(Self::MoneyN),
            0x2F => Some(Self::Char),
            0x27 => Some(Self::VarChar),
            0x2D => Some(Self::Binary),
            0x25 => Some(Self::VarBinary),
            0xA7 => Some(Self::BigVarChar),
            0xA5 => Some(Self::BigVarBinary),
            0xAF => Some(Self::BigChar),
            0xAD => Some(Self::BigBinary),
            0xEF => Some(Self::NChar),
            0xE7 => Some(Self::NVarChar),
            0x23 => Some(Self::Text),
            0x22 => Some(Self::Image),
            0x63 => Some(Self::NText),
            0x28 => Some(Self::Date),
            0x29 => Some(Self::Time),
            0x2A => Some(Self::DateTime2),
            0x2B => Some(Self::DateTimeOffset),
            0x62 => Some(Self::Variant),
            0xF0 => Some(Self::Udt),
            0xF1 => Some(Self::Xml),
            _ => None,
        }
    }

    /// How values of this type are delimited in TYPE_INFO and row data.
    #[must_use]
    pub const fn length_strategy(&self) -> LengthStrategy {
        match self {
            Self::Null => LengthStrategy::Fixed(0),
            Self::Int1 | Self::Bit => LengthStrategy::Fixed(1),
            Self::Int2 => LengthStrategy::Fixed(2),
            Self::Int4 | Self::Float4 | Self::Money4 | Self::DateTime4 => LengthStrategy::Fixed(4),
            Self::Int8 | Self::Float8 | Self::Money | Self::DateTime => LengthStrategy::Fixed(8),
            Self::Guid
            | Self::IntN
            | Self::BitN
            | Self::FloatN
            | Self::MoneyN
            | Self::DateTimeN
            | Self::Char
            | Self::VarChar
            | Self::Binary
            | Self::VarBinary
            | Self::Date => LengthStrategy::ByteLen,
            Self::Decimal | Self::Numeric | Self::DecimalN | Self::NumericN => {
                LengthStrategy::PrecScale
            }
            Self::Time | Self::DateTime2 | Self::DateTimeOffset => LengthStrategy::ScaleLen,
            Self::BigVarChar
            | Self::BigVarBinary
            | Self::BigChar
            | Self::BigBinary
            | Self::NChar
            | Self::NVarChar => LengthStrategy::UShortLen,
            Self::Text | Self::Image | Self::NText | Self::Variant => LengthStrategy::LongLen,
            Self::Xml | Self::Udt => LengthStrategy::Plp,
        }
    }

    /// Check if this type carries a collation in its TYPE_INFO.
    #[must_use]
    pub const fn has_collation(&self) -> bool {
        matches!(
            self,
            Self::BigVarChar
                | Self::BigChar
                | Self::NChar
                | Self::NVarChar
                | Self::Text
                | Self::NText
        )
    }

    /// Check if this is a Unicode type.
    #[must_use]
    pub const fn is_unicode(&self) -> bool {
        matches!(self, Self::NChar | Self::NVarChar | Self::NText)
    }
}

/// Wire length discipline for a column value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthStrategy {
    /// Fixed number of bytes, no prefix.
    Fixed(u8),
    /// 1-byte length prefix; zero means NULL for nullable types.
    ByteLen,
    /// 2-byte length prefix; `0xFFFF` means NULL. Becomes PLP when the
    /// column metadata declares the MAX sentinel.
    UShortLen,
    /// 4-byte length prefix (legacy LOBs and `sql_variant`).
    LongLen,
    /// Precision and scale in TYPE_INFO, 1-byte length in row data.
    PrecScale,
    /// Scale in TYPE_INFO, 1-byte length in row data.
    ScaleLen,
    /// Partially length-prefixed chunks.
    Plp,
}

/// Max-length value that marks a ushort-length column as `(max)`.
pub const MAX_LENGTH_SENTINEL: u32 = 0xFFFF;

bitflags! {
    /// Column flags from COLMETADATA.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct ColumnFlags: u16 {
        /// Column is nullable.
        const NULLABLE = 0x0001;
        /// Column compares case-sensitively.
        const CASE_SENSITIVE = 0x0002;
        /// Column is read-write.
        const UPDATEABLE = 0x0004;
        /// Updateability is unknown.
        const UPDATEABLE_UNKNOWN = 0x0008;
        /// Identity column.
        const IDENTITY = 0x0010;
        /// Computed column.
        const COMPUTED = 0x0020;
        /// Fixed-length CLR type.
        const FIXED_LEN_CLR_TYPE = 0x0100;
        /// Sparse column set.
        const SPARSE_COLUMN_SET = 0x0200;
        /// Always Encrypted column.
        const ENCRYPTED = 0x0400;
        /// Hidden column.
        const HIDDEN = 0x2000;
        /// Key column.
        const KEY = 0x4000;
        /// Nullability unknown.
        const NULLABLE_UNKNOWN = 0x8000;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_id_from_u8() {
        assert_eq!(TypeId::from_u8(0x38), Some(TypeId::Int4));
        assert_eq!(TypeId::from_u8(0xE7), Some(TypeId::NVarChar));
        assert_eq!(TypeId::from_u8(0x99), None);
    }

    #[test]
    fn test_length_strategies() {
        assert_eq!(TypeId::Int4.length_strategy(), LengthStrategy::Fixed(4));
        assert_eq!(TypeId::Date.length_strategy(), LengthStrategy::ByteLen);
        assert_eq!(TypeId::NVarChar.length_strategy(), LengthStrategy::UShortLen);
        assert_eq!(TypeId::DecimalN.length_strategy(), LengthStrategy::PrecScale);
        assert_eq!(TypeId::DateTime2.length_strategy(), LengthStrategy::ScaleLen);
        assert_eq!(TypeId::Xml.length_strategy(), LengthStrategy::Plp);
        assert_eq!(TypeId::Image.length_strategy(), LengthStrategy::LongLen);
    }

    #[test]
    fn test_codes_are_distinct() {
        let mut seen = std::collections::HashSet::new();
        for raw in 0u8..=255 {
            if let Some(ty) = TypeId::from_u8(raw) {
                assert_eq!(ty as u8, raw);
                assert!(seen.insert(ty));
            }
        }
        assert!(seen.len() > 40);
    }

    #[test]
    fn test_column_flags_bits() {
        let flags = ColumnFlags::from_bits_truncate(0x4011);
        assert!(flags.contains(ColumnFlags::NULLABLE));
        assert!(flags.contains(ColumnFlags::IDENTITY));
        assert!(flags.contains(ColumnFlags::KEY));
        assert!(!flags.contains(ColumnFlags::COMPUTED));
    }
}
