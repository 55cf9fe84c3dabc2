//! SQL Server collations and the character set they imply.
//!
//! A collation travels as five bytes: a little-endian `u32` packing a
//! 20-bit locale id, eight comparison flags and a 4-bit version, followed
//! by a one-byte sort id. Non-Unicode text (`VARCHAR`, `CHAR`, `TEXT`, and
//! every session string before TDS 7.1) is encoded in the Windows code page
//! of that locale.

use bytes::{Buf, BufMut};
use encoding_rs::Encoding;

use crate::codec::ensure;
use crate::error::ProtocolError;

/// Encoded size of a collation.
pub const COLLATION_SIZE: usize = 5;

const LCID_MASK: u32 = 0x000F_FFFF;
const FLAG_UTF8: u32 = 1 << 26;

/// A decoded collation descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Collation {
    /// Packed locale id, flags and version.
    pub info: u32,
    /// SQL sort order id; zero for Windows collations.
    pub sort_id: u8,
}

impl Collation {
    /// Create a collation from its locale id with no flags.
    #[must_use]
    pub const fn from_lcid(lcid: u32) -> Self {
        Self {
            info: lcid & LCID_MASK,
            sort_id: 0,
        }
    }

    /// Decode a collation from five bytes.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        ensure(src, COLLATION_SIZE)?;
        let info = src.get_u32_le();
        let sort_id = src.get_u8();
        Ok(Self { info, sort_id })
    }

    /// Decode a collation from a raw byte slice, as stored in session state.
    #[must_use]
    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        if raw.len() < COLLATION_SIZE {
            return None;
        }
        let mut cursor = raw;
        Self::decode(&mut cursor).ok()
    }

    /// Encode the collation into five bytes.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u32_le(self.info);
        dst.put_u8(self.sort_id);
    }

    /// Locale id.
    #[must_use]
    pub const fn lcid(&self) -> u32 {
        self.info & LCID_MASK
    }

    /// Whether this is a `_UTF8` collation.
    #[must_use]
    pub const fn is_utf8(&self) -> bool {
        self.info & FLAG_UTF8 != 0
    }

    /// Character encoding for non-Unicode text under this collation.
    ///
    /// Unknown locales fall back to windows-1252.
    #[must_use]
    pub fn encoding(&self) -> &'static Encoding {
        if self.is_utf8() {
            return encoding_rs::UTF_8;
        }
        encoding_for_lcid(self.lcid())
    }
}

/// Windows code page for a locale id, by primary language.
#[must_use]
pub fn code_page_for_lcid(lcid: u32) -> u16 {
    let lang_id = lcid & 0xFFFF;
    match lang_id & 0x03FF {
        0x11 => 932,
        0x04 if matches!(lang_id, 0x0804 | 0x1004) => 936,
        0x04 => 950,
        0x12 => 949,
        0x1E => 874,
        0x2A => 1258,
        0x1A if matches!(lang_id, 0x0C1A | 0x201A) => 1251,
        0x05 | 0x0E | 0x15 | 0x18 | 0x1A | 0x1B | 0x1C | 0x24 => 1250,
        0x43 if lang_id == 0x0843 => 1251,
        0x02 | 0x19 | 0x22 | 0x23 | 0x2F | 0x40 | 0x44 | 0x50 | 0x85 => 1251,
        0x08 => 1253,
        0x1F | 0x2C | 0x43 => 1254,
        0x0D => 1255,
        0x01 | 0x20 | 0x29 | 0x63 | 0x8C => 1256,
        0x25..=0x27 => 1257,
        _ => 1252,
    }
}

/// `encoding_rs` encoding for a locale id.
#[must_use]
pub fn encoding_for_lcid(lcid: u32) -> &'static Encoding {
    match code_page_for_lcid(lcid) {
        874 => encoding_rs::WINDOWS_874,
        932 => encoding_rs::SHIFT_JIS,
        936 => encoding_rs::GB18030,
        949 => encoding_rs::EUC_KR,
        950 => encoding_rs::BIG5,
        1250 => encoding_rs::WINDOWS_1250,
        1251 => encoding_rs::WINDOWS_1251,
        1253 => encoding_rs::WINDOWS_1253,
        1254 => encoding_rs::WINDOWS_1254,
        1255 => encoding_rs::WINDOWS_1255,
        1256 => encoding_rs::WINDOWS_1256,
        1257 => encoding_rs::WINDOWS_1257,
        1258 => encoding_rs::WINDOWS_1258,
        _ => encoding_rs::WINDOWS_1252,
    }
}
