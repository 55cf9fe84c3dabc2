//! SQL_BATCH request payloads.
//!
//! From TDS 7.2 every batch and RPC request starts with an ALL_HEADERS
//! block. The only header this client sends is the transaction descriptor,
//! which ties the request to the transaction the server last announced via
//! ENVCHANGE (0 in auto-commit mode).

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::{ensure, read_utf16_string, utf16_byte_len, write_utf16_string};
use crate::error::ProtocolError;
use crate::version::TdsVersion;

/// ALL_HEADERS header type for a transaction descriptor.
pub const HEADER_TRANSACTION_DESCRIPTOR: u16 = 0x0002;

/// Size of ALL_HEADERS with only a transaction descriptor header.
pub const ALL_HEADERS_LEN: usize = 22;

/// The ALL_HEADERS block prefixed to batch and RPC requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllHeaders {
    /// Descriptor of the current transaction, 0 when none.
    pub transaction_descriptor: u64,
    /// Requests outstanding on the connection, 1 without MARS.
    pub outstanding_requests: u32,
}

impl Default for AllHeaders {
    fn default() -> Self {
        Self::new(0)
    }
}

impl AllHeaders {
    /// Headers for a single outstanding request.
    #[must_use]
    pub const fn new(transaction_descriptor: u64) -> Self {
        Self {
            transaction_descriptor,
            outstanding_requests: 1,
        }
    }

    /// Write the block.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u32_le(ALL_HEADERS_LEN as u32);
        dst.put_u32_le((ALL_HEADERS_LEN - 4) as u32);
        dst.put_u16_le(HEADER_TRANSACTION_DESCRIPTOR);
        dst.put_u64_le(self.transaction_descriptor);
        dst.put_u32_le(self.outstanding_requests);
    }

    /// Read the block, keeping the transaction descriptor header and
    /// skipping any other.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        ensure(src, 4)?;
        let total = src.get_u32_le() as usize;
        let body_len = total.checked_sub(4).ok_or(ProtocolError::InvalidField {
            field: "ALL_HEADERS length",
            value: total as u64,
        })?;
        ensure(src, body_len)?;
        let mut body = src.copy_to_bytes(body_len);

        let mut headers = Self::default();
        while body.has_remaining() {
            ensure(&body, 6)?;
            let len = body.get_u32_le() as usize;
            let kind = body.get_u16_le();
            let data_len = len.checked_sub(6).ok_or(ProtocolError::InvalidField {
                field: "header length",
                value: len as u64,
            })?;
            ensure(&body, data_len)?;
            let mut data = body.split_to(data_len);
            if kind == HEADER_TRANSACTION_DESCRIPTOR {
                ensure(&data, 12)?;
                headers.transaction_descriptor = data.get_u64_le();
                headers.outstanding_requests = data.get_u32_le();
            }
        }
        Ok(headers)
    }

    /// Write the block only when `version` expects one.
    pub fn encode_for(&self, dst: &mut impl BufMut, version: TdsVersion) {
        if version.uses_wide_counts() {
            self.encode(dst);
        }
    }
}

/// A SQL_BATCH request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlBatch {
    sql: String,
    headers: AllHeaders,
}

impl SqlBatch {
    /// A batch running in auto-commit mode.
    #[must_use]
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            headers: AllHeaders::default(),
        }
    }

    /// Attach the batch to an open transaction.
    #[must_use]
    pub fn with_transaction(mut self, descriptor: u64) -> Self {
        self.headers.transaction_descriptor = descriptor;
        self
    }

    /// SQL text.
    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Transaction descriptor carried in the headers.
    #[must_use]
    pub fn transaction_descriptor(&self) -> u64 {
        self.headers.transaction_descriptor
    }

    /// Decode a payload encoded for `version`.
    pub fn decode(payload: &[u8], version: TdsVersion) -> Result<Self, ProtocolError> {
        let mut src = payload;
        let headers = if version.uses_wide_counts() {
            AllHeaders::decode(&mut src)?
        } else {
            AllHeaders::default()
        };
        if src.len() % 2 != 0 {
            return Err(ProtocolError::StringEncoding(
                "odd byte count in UTF-16 batch text".into(),
            ));
        }
        let char_count = src.len() / 2;
        let sql = read_utf16_string(&mut src, char_count)?;
        Ok(Self { sql, headers })
    }

    /// Encode the payload for the given version.
    #[must_use]
    pub fn encode(&self, version: TdsVersion) -> Bytes {
        let mut buf = BytesMut::with_capacity(ALL_HEADERS_LEN + utf16_byte_len(&self.sql));
        self.headers.encode_for(&mut buf, version);
        write_utf16_string(&mut buf, &self.sql);
        buf.freeze()
    }
}

/// Encode an auto-commit batch for TDS 7.4.
#[must_use]
pub fn encode_sql_batch(sql: &str) -> Bytes {
    SqlBatch::new(sql).encode(TdsVersion::V7_4)
}
