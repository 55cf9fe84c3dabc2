//! Low-level string readers and writers shared by the token parsers and
//! request encoders.
//!
//! TDS counts string lengths in characters, not bytes. Unicode sessions
//! (TDS 7.1+) carry two bytes per character; older sessions carry one.

use bytes::{Buf, BufMut};

use crate::error::ProtocolError;

/// Fail with `UnexpectedEof` unless `n` bytes remain.
#[inline]
pub fn ensure(src: &impl Buf, n: usize) -> Result<(), ProtocolError> {
    if src.remaining() < n {
        Err(ProtocolError::UnexpectedEof)
    } else {
        Ok(())
    }
}

/// Read a string with a 1-byte character count.
pub fn read_b_varchar(src: &mut impl Buf) -> Result<String, ProtocolError> {
    ensure(src, 1)?;
    let len = src.get_u8() as usize;
    read_utf16_string(src, len)
}

/// Read a string with a 2-byte character count.
pub fn read_us_varchar(src: &mut impl Buf) -> Result<String, ProtocolError> {
    ensure(src, 2)?;
    let len = src.get_u16_le() as usize;
    read_utf16_string(src, len)
}

/// Read a 1-byte-counted string that is UTF-16LE when `unicode` is set and
/// single-byte otherwise.
pub fn read_b_varchar_narrow(src: &mut impl Buf, unicode: bool) -> Result<String, ProtocolError> {
    if unicode {
        return read_b_varchar(src);
    }
    ensure(src, 1)?;
    let len = src.get_u8() as usize;
    ensure(src, len)?;
    let raw = src.copy_to_bytes(len);
    // Pre-7.1 sessions have no collation yet; the server default is windows-1252.
    let (text, _, _) = encoding_rs::WINDOWS_1252.decode(&raw);
    Ok(text.into_owned())
}

/// Read `char_count` UTF-16LE code units.
pub fn read_utf16_string(src: &mut impl Buf, char_count: usize) -> Result<String, ProtocolError> {
    ensure(src, char_count * 2)?;

    let mut units = Vec::with_capacity(char_count);
    for _ in 0..char_count {
        units.push(src.get_u16_le());
    }

    String::from_utf16(&units).map_err(|e| ProtocolError::StringEncoding(e.to_string()))
}

/// Write a string with a 1-byte character count, truncating at 255 units.
pub fn write_b_varchar(dst: &mut impl BufMut, s: &str) {
    let units: Vec<u16> = s.encode_utf16().collect();
    let len = units.len().min(255);
    dst.put_u8(len as u8);
    for &u in &units[..len] {
        dst.put_u16_le(u);
    }
}

/// Write a string with a 2-byte character count, truncating at 65535 units.
pub fn write_us_varchar(dst: &mut impl BufMut, s: &str) {
    let units: Vec<u16> = s.encode_utf16().collect();
    let len = units.len().min(65535);
    dst.put_u16_le(len as u16);
    for &u in &units[..len] {
        dst.put_u16_le(u);
    }
}

/// Write UTF-16LE text with no length prefix.
pub fn write_utf16_string(dst: &mut impl BufMut, s: &str) {
    for u in s.encode_utf16() {
        dst.put_u16_le(u);
    }
}

/// Number of bytes `s` occupies as UTF-16LE.
#[must_use]
pub fn utf16_byte_len(s: &str) -> usize {
    s.encode_utf16().count() * 2
}
