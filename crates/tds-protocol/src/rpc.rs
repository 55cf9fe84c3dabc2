//! RPC request payloads.
//!
//! An RPC request names a procedure (by name, or by id for the well-known
//! system procedures) and carries typed parameters. Each parameter is a
//! name, a status byte, a TYPE_INFO block and a value in row-data layout, so
//! parameters reuse [`ColumnMeta`] for their type description.
//!
//! Value bytes come from the caller; this module only frames them. The
//! exception is NVARCHAR, which the `sp_executesql` statement and parameter
//! declaration need.

use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{utf16_byte_len, write_b_varchar, write_us_varchar, write_utf16_string};
use crate::collation::Collation;
use crate::login7::DEFAULT_CLIENT_LCID;
use crate::sql_batch::AllHeaders;
use crate::token::ColumnMeta;
use crate::types::{TypeId, MAX_LENGTH_SENTINEL};
use crate::version::TdsVersion;

/// Well-known procedure ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ProcId {
    /// sp_cursoropen
    CursorOpen = 0x0002,
    /// sp_cursorfetch
    CursorFetch = 0x0007,
    /// sp_cursorclose
    CursorClose = 0x0009,
    /// sp_executesql
    ExecuteSql = 0x000A,
    /// sp_prepare
    Prepare = 0x000B,
    /// sp_execute
    Execute = 0x000C,
    /// sp_prepexec
    PrepExec = 0x000D,
    /// sp_unprepare
    Unprepare = 0x000F,
}

/// Procedure the request invokes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcName {
    /// Procedure referenced by name.
    Name(String),
    /// Well-known procedure referenced by id.
    Id(ProcId),
}

bitflags! {
    /// RPC option flags.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct RpcOptionFlags: u16 {
        /// Recompile the procedure.
        const WITH_RECOMPILE = 0x0001;
        /// Omit metadata from the response.
        const NO_METADATA = 0x0002;
        /// Reuse metadata from the previous call.
        const REUSE_METADATA = 0x0004;
    }
}

bitflags! {
    /// Parameter status byte.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct ParamStatus: u8 {
        /// Output parameter.
        const BY_REF_VALUE = 0x01;
        /// Use the parameter's default value.
        const DEFAULT_VALUE = 0x02;
    }
}

/// One RPC parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcParam {
    /// Parameter name, with `@`, or empty for positional.
    pub name: String,
    /// Status flags.
    pub status: ParamStatus,
    /// Type description.
    pub meta: ColumnMeta,
    /// Value bytes in row-data layout, `None` for NULL.
    pub value: Option<Bytes>,
}

impl RpcParam {
    /// A parameter with caller-encoded value bytes.
    #[must_use]
    pub fn typed(name: impl Into<String>, meta: ColumnMeta, value: Option<Bytes>) -> Self {
        Self {
            name: name.into(),
            status: ParamStatus::empty(),
            meta,
            value,
        }
    }

    /// An NVARCHAR parameter. Values longer than 4000 characters are sent as
    /// NVARCHAR(MAX).
    #[must_use]
    pub fn nvarchar(name: impl Into<String>, value: &str) -> Self {
        let byte_len = utf16_byte_len(value);
        let max_length = if byte_len > 8000 {
            MAX_LENGTH_SENTINEL
        } else {
            8000
        };
        let mut raw = BytesMut::with_capacity(byte_len);
        write_utf16_string(&mut raw, value);
        let meta = ColumnMeta::new(String::new(), TypeId::NVarChar)
            .with_max_length(max_length)
            .with_collation(Collation::from_lcid(DEFAULT_CLIENT_LCID));
        Self::typed(name, meta, Some(raw.freeze()))
    }

    /// An INT parameter.
    #[must_use]
    pub fn int(name: impl Into<String>, value: i32) -> Self {
        let meta = ColumnMeta::new(String::new(), TypeId::IntN).with_max_length(4);
        Self::typed(name, meta, Some(Bytes::copy_from_slice(&value.to_le_bytes())))
    }

    /// Mark as an output parameter.
    #[must_use]
    pub fn as_output(mut self) -> Self {
        self.status |= ParamStatus::BY_REF_VALUE;
        self
    }

    fn encode(&self, dst: &mut impl BufMut) {
        write_b_varchar(dst, &self.name);
        dst.put_u8(self.status.bits());
        dst.put_u8(self.meta.type_id as u8);
        self.meta.encode_type_info(dst);
        self.meta.write_value(dst, self.value.as_deref());
    }
}

/// An RPC request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcRequest {
    /// Target procedure.
    pub proc_name: ProcName,
    /// Option flags.
    pub options: RpcOptionFlags,
    /// Parameters in call order.
    pub params: Vec<RpcParam>,
    /// ALL_HEADERS content.
    pub headers: AllHeaders,
}

impl RpcRequest {
    /// Call a procedure by name.
    #[must_use]
    pub fn named(proc_name: impl Into<String>) -> Self {
        Self::new(ProcName::Name(proc_name.into()))
    }

    /// Call a well-known procedure by id.
    #[must_use]
    pub fn by_id(proc_id: ProcId) -> Self {
        Self::new(ProcName::Id(proc_id))
    }

    fn new(proc_name: ProcName) -> Self {
        Self {
            proc_name,
            options: RpcOptionFlags::empty(),
            params: Vec::new(),
            headers: AllHeaders::default(),
        }
    }

    /// A parameterized statement through `sp_executesql`.
    ///
    /// The declaration string (`@p1 int, @p2 nvarchar(50)`) is sent as given
    /// and must describe `params` in order.
    #[must_use]
    pub fn execute_sql(sql: &str, declarations: &str, params: Vec<RpcParam>) -> Self {
        let mut request = Self::by_id(ProcId::ExecuteSql).param(RpcParam::nvarchar("", sql));
        if !params.is_empty() {
            request = request.param(RpcParam::nvarchar("", declarations));
        }
        for param in params {
            request = request.param(param);
        }
        request
    }

    /// Append a parameter.
    #[must_use]
    pub fn param(mut self, param: RpcParam) -> Self {
        self.params.push(param);
        self
    }

    /// Set option flags.
    #[must_use]
    pub fn with_options(mut self, options: RpcOptionFlags) -> Self {
        self.options = options;
        self
    }

    /// Attach the request to an open transaction.
    #[must_use]
    pub fn with_transaction(mut self, descriptor: u64) -> Self {
        self.headers.transaction_descriptor = descriptor;
        self
    }

    /// Encode the payload for the given version.
    #[must_use]
    pub fn encode(&self, version: TdsVersion) -> Bytes {
        let mut buf = BytesMut::with_capacity(128);
        self.headers.encode_for(&mut buf, version);

        match &self.proc_name {
            ProcName::Name(name) => write_us_varchar(&mut buf, name),
            ProcName::Id(id) => {
                buf.put_u16_le(0xFFFF);
                buf.put_u16_le(*id as u16);
            }
        }
        buf.put_u16_le(self.options.bits());

        for param in &self.params {
            param.encode(&mut buf);
        }
        buf.freeze()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::sql_batch::ALL_HEADERS_LEN;

    #[test]
    fn test_proc_by_id() {
        let payload = RpcRequest::by_id(ProcId::ExecuteSql).encode(TdsVersion::V7_4);
        let body = &payload[ALL_HEADERS_LEN..];
        assert_eq!(body, &[0xFF, 0xFF, 0x0A, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_proc_by_name() {
        let payload = RpcRequest::named("sp_who").encode(TdsVersion::V7_1);
        assert_eq!(&payload[..2], &[6, 0]);
        assert_eq!(&payload[2..4], &[b's', 0]);
        assert_eq!(payload.len(), 2 + 12 + 2);
    }

    #[test]
    fn test_int_param_layout() {
        let payload = RpcRequest::named("p")
            .param(RpcParam::int("@x", 5).as_output())
            .encode(TdsVersion::V7_1);
        // name "p" (2+2), options (2), then the parameter
        let param = &payload[6..];
        assert_eq!(param[0], 2);
        assert_eq!(&param[1..5], &[b'@', 0, b'x', 0]);
        assert_eq!(param[5], ParamStatus::BY_REF_VALUE.bits());
        assert_eq!(param[6], TypeId::IntN as u8);
        assert_eq!(param[7], 4);
        assert_eq!(&param[8..], &[4, 5, 0, 0, 0]);
    }

    #[test]
    fn test_nvarchar_param() {
        let param = RpcParam::nvarchar("@s", "hi");
        assert_eq!(param.meta.max_length, Some(8000));
        assert_eq!(param.value.as_deref(), Some(&[b'h', 0, b'i', 0][..]));

        let long = "x".repeat(4001);
        assert!(RpcParam::nvarchar("@s", &long).meta.is_plp());
    }

    #[test]
    fn test_execute_sql_params() {
        let request = RpcRequest::execute_sql(
            "SELECT @a",
            "@a int",
            vec![RpcParam::int("@a", 1)],
        );
        assert_eq!(request.params.len(), 3);
        assert_eq!(request.proc_name, ProcName::Id(ProcId::ExecuteSql));

        let bare = RpcRequest::execute_sql("SELECT 1", "", Vec::new());
        assert_eq!(bare.params.len(), 1);
    }
}
