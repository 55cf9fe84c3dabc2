//! Partially length-prefixed (PLP) values.
//!
//! `(max)` types, `xml` and CLR UDTs are streamed as an 8-byte total length
//! followed by `(u32 length, data)` chunks and a zero-length terminator. The
//! all-ones total marks NULL and carries no chunks; `0xFFFF_FFFF_FFFF_FFFE`
//! announces a value whose length the server did not know up front.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::ensure;
use crate::error::ProtocolError;

/// Total-length sentinel for a NULL value.
pub const PLP_NULL: u64 = 0xFFFF_FFFF_FFFF_FFFF;

/// Total-length sentinel for a value of unknown length.
pub const PLP_UNKNOWN_LENGTH: u64 = 0xFFFF_FFFF_FFFF_FFFE;

/// Chunk size used when encoding.
pub const DEFAULT_PLP_CHUNK_SIZE: usize = 8000;

/// Read a PLP value. Returns `None` for NULL.
pub fn read_plp(src: &mut impl Buf) -> Result<Option<Bytes>, ProtocolError> {
    ensure(src, 8)?;
    let total = src.get_u64_le();
    if total == PLP_NULL {
        return Ok(None);
    }

    let hint = if total == PLP_UNKNOWN_LENGTH {
        0
    } else {
        (total as usize).min(src.remaining())
    };
    let mut out = BytesMut::with_capacity(hint);

    loop {
        ensure(src, 4)?;
        let chunk_len = src.get_u32_le() as usize;
        if chunk_len == 0 {
            break;
        }
        // A chunk may continue in the next packet.
        ensure(src, chunk_len)?;
        let start = out.len();
        out.resize(start + chunk_len, 0);
        src.copy_to_slice(&mut out[start..]);
    }

    if total != PLP_UNKNOWN_LENGTH && out.len() as u64 != total {
        return Err(ProtocolError::InvalidPlp(format!(
            "declared {total} bytes, received {}",
            out.len()
        )));
    }

    Ok(Some(out.freeze()))
}

/// Write a PLP value, splitting data into `chunk_size` chunks.
pub fn write_plp(dst: &mut impl BufMut, value: Option<&[u8]>, chunk_size: usize) {
    let Some(data) = value else {
        dst.put_u64_le(PLP_NULL);
        return;
    };

    dst.put_u64_le(data.len() as u64);
    for chunk in data.chunks(chunk_size.max(1)) {
        dst.put_u32_le(chunk.len() as u32);
        dst.put_slice(chunk);
    }
    dst.put_u32_le(0);
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn encode(value: Option<&[u8]>) -> Bytes {
        let mut buf = BytesMut::new();
        write_plp(&mut buf, value, DEFAULT_PLP_CHUNK_SIZE);
        buf.freeze()
    }

    #[test]
    fn test_plp_lengths() {
        for len in [0usize, 1, 8000, 20_000] {
            let data: Vec<u8> = (0..len).map(|i| (i % 253) as u8).collect();
            let mut encoded = encode(Some(&data));
            let decoded = read_plp(&mut encoded).unwrap().unwrap();
            assert_eq!(decoded.as_ref(), data.as_slice(), "length {len}");
            assert!(encoded.is_empty());
        }
    }

    #[test]
    fn test_plp_chunking() {
        let data = vec![7u8; 20_000];
        let encoded = encode(Some(&data));
        // total + 3 chunk headers + terminator
        assert_eq!(encoded.len(), 8 + 20_000 + 3 * 4 + 4);
    }

    #[test]
    fn test_plp_null() {
        let mut encoded = encode(None);
        assert_eq!(encoded.as_ref(), &PLP_NULL.to_le_bytes());
        assert_eq!(read_plp(&mut encoded).unwrap(), None);

        let mut reencoded = BytesMut::new();
        write_plp(&mut reencoded, None, DEFAULT_PLP_CHUNK_SIZE);
        assert_eq!(reencoded.as_ref(), &PLP_NULL.to_le_bytes());
    }

    #[test]
    fn test_plp_unknown_length() {
        let mut buf = BytesMut::new();
        buf.put_u64_le(PLP_UNKNOWN_LENGTH);
        buf.put_u32_le(3);
        buf.put_slice(b"abc");
        buf.put_u32_le(2);
        buf.put_slice(b"de");
        buf.put_u32_le(0);
        let mut cursor = buf.freeze();
        assert_eq!(read_plp(&mut cursor).unwrap().unwrap().as_ref(), b"abcde");
    }

    #[test]
    fn test_plp_length_mismatch() {
        let mut buf = BytesMut::new();
        buf.put_u64_le(10);
        buf.put_u32_le(3);
        buf.put_slice(b"abc");
        buf.put_u32_le(0);
        let mut cursor = buf.freeze();
        assert!(matches!(
            read_plp(&mut cursor),
            Err(ProtocolError::InvalidPlp(_))
        ));
    }

    #[test]
    fn test_plp_chunk_overrun() {
        let mut buf = BytesMut::new();
        buf.put_u64_le(100);
        buf.put_u32_le(100);
        buf.put_slice(b"short");
        let mut cursor = buf.freeze();
        assert!(matches!(
            read_plp(&mut cursor),
            Err(ProtocolError::UnexpectedEof)
        ));
    }

    proptest! {
        #[test]
        fn prop_plp_roundtrip(
            data in proptest::collection::vec(any::<u8>(), 0..4096),
            chunk in 1usize..512,
        ) {
            let mut buf = BytesMut::new();
            write_plp(&mut buf, Some(&data), chunk);
            let mut cursor = buf.freeze();
            let decoded = read_plp(&mut cursor).unwrap().unwrap();
            prop_assert_eq!(decoded.as_ref(), data.as_slice());
        }
    }
}
