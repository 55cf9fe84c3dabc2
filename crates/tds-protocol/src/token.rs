//! TDS token stream definitions.
//!
//! Tokens are the units of a tabular response. Each one starts with a
//! one-byte tag followed by a tag-specific body. There is no generic length
//! prefix: some bodies are length-counted, others (DONE, ROW, COLMETADATA)
//! are only delimited by the layout of their fields, so a tag without a
//! parser cannot be skipped. Parsing is driven by
//! [`TokenDispatcher`](crate::dispatch::TokenDispatcher); this module holds
//! the token types and the decoder for each body.
//!
//! Several layouts depend on the negotiated TDS version, which parsers read
//! from the [`ParseContext`].

use std::sync::Arc;

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::{
    ensure, read_b_varchar, read_b_varchar_narrow, read_us_varchar, write_b_varchar,
    write_us_varchar,
};
use crate::collation::Collation;
use crate::error::ProtocolError;
use crate::plp::{read_plp, write_plp, DEFAULT_PLP_CHUNK_SIZE};
use crate::types::{ColumnFlags, LengthStrategy, TypeId, MAX_LENGTH_SENTINEL};
use crate::version::TdsVersion;

/// Token tag values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TokenType {
    /// Return status (RETURNSTATUS).
    ReturnStatus = 0x79,
    /// Column metadata (COLMETADATA).
    ColMetaData = 0x81,
    /// Order (ORDER).
    Order = 0xA9,
    /// Error message (ERROR).
    Error = 0xAA,
    /// Informational message (INFO).
    Info = 0xAB,
    /// Return value (RETURNVALUE).
    ReturnValue = 0xAC,
    /// Login acknowledgment (LOGINACK).
    LoginAck = 0xAD,
    /// Feature extension acknowledgment (FEATUREEXTACK).
    FeatureExtAck = 0xAE,
    /// Row data (ROW).
    Row = 0xD1,
    /// Null bitmap compressed row (NBCROW).
    NbcRow = 0xD2,
    /// Environment change (ENVCHANGE).
    EnvChange = 0xE3,
    /// Session state (SESSIONSTATE).
    SessionState = 0xE4,
    /// SSPI authentication (SSPI).
    Sspi = 0xED,
    /// Federated authentication info (FEDAUTHINFO).
    FedAuthInfo = 0xEE,
    /// Done (DONE).
    Done = 0xFD,
    /// Done procedure (DONEPROC).
    DoneProc = 0xFE,
    /// Done in procedure (DONEINPROC).
    DoneInProc = 0xFF,
}

impl TokenType {
    /// Create a token type from a raw tag.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x79 => Some(Self::ReturnStatus),
            0x81 => Some(Self::ColMetaData),
            0xA9 => Some(Self::Order),
            0xAA => Some(Self::Error),
            0xAB => Some(Self::Info),
            0xAC => Some(Self::ReturnValue),
            0xAD => Some(Self::LoginAck),
            0xAE => Some(Self::FeatureExtAck),
            0xD1 => Some(Self::Row),
            0xD2 => Some(Self::NbcRow),
            0xE3 => Some(Self::EnvChange),
            0xE4 => Some(Self::SessionState),
            0xED => Some(Self::Sspi),
            0xEE => Some(Self::FedAuthInfo),
            0xFD => Some(Self::Done),
            0xFE => Some(Self::DoneProc),
            0xFF => Some(Self::DoneInProc),
            _ => None,
        }
    }
}

/// State a parser may consult.
#[derive(Debug, Clone, Default)]
pub struct ParseContext {
    /// Negotiated protocol version.
    pub version: TdsVersion,
    /// Column metadata of the result set currently being read.
    pub metadata: Option<Arc<ColMetaData>>,
}

impl ParseContext {
    /// Create a context for the given version with no active result set.
    #[must_use]
    pub fn new(version: TdsVersion) -> Self {
        Self {
            version,
            metadata: None,
        }
    }

    pub(crate) fn require_metadata(&self) -> Result<&Arc<ColMetaData>, ProtocolError> {
        self.metadata
            .as_ref()
            .ok_or(ProtocolError::MissingColumnMetadata)
    }
}

/// Parsed TDS token.
#[derive(Debug, Clone)]
pub enum Token {
    /// Column metadata describing the following rows.
    ColMetaData(Arc<ColMetaData>),
    /// Row data (ROW and NBCROW both decode to this).
    Row(RowData),
    /// Completion of a SQL statement.
    Done(Done),
    /// Completion of a stored procedure.
    DoneProc(Done),
    /// Completion of a statement within a stored procedure.
    DoneInProc(Done),
    /// Return status from a stored procedure.
    ReturnStatus(i32),
    /// Output parameter value.
    ReturnValue(ReturnValue),
    /// Error message from the server.
    Error(ServerMessage),
    /// Informational message from the server.
    Info(ServerMessage),
    /// Login acknowledgment.
    LoginAck(LoginAck),
    /// Environment change notification.
    EnvChange(EnvChange),
    /// Column ordering of the current result set.
    Order(Order),
    /// Feature extension acknowledgment.
    FeatureExtAck(FeatureExtAck),
    /// SSPI challenge bytes.
    Sspi(Bytes),
    /// Session recovery state, kept opaque.
    SessionState(Bytes),
    /// Federated authentication info, kept opaque.
    FedAuthInfo(Bytes),
}

impl Token {
    /// The DONE-family payload if this token ends a statement.
    #[must_use]
    pub fn as_done(&self) -> Option<&Done> {
        match self {
            Self::Done(done) | Self::DoneProc(done) | Self::DoneInProc(done) => Some(done),
            _ => None,
        }
    }
}

// =============================================================================
// Column metadata
// =============================================================================

/// Metadata for one result column or one output parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMeta {
    /// Zero-based position in the result set.
    pub ordinal: usize,
    /// Column name; may be empty.
    pub name: String,
    /// Data type code.
    pub type_id: TypeId,
    /// Column flags.
    pub flags: ColumnFlags,
    /// User-defined type id.
    pub user_type: u32,
    /// Declared maximum length, when the type carries one.
    pub max_length: Option<u32>,
    /// Precision for decimal and numeric types.
    pub precision: Option<u8>,
    /// Scale for decimal, numeric and the scaled time types.
    pub scale: Option<u8>,
    /// Collation for character types.
    pub collation: Option<Collation>,
    /// Multi-part table name for legacy LOB columns.
    pub table_name: Vec<String>,
}

impl ColumnMeta {
    /// Create metadata for a column of the given type with no type info.
    #[must_use]
    pub fn new(name: impl Into<String>, type_id: TypeId) -> Self {
        Self {
            ordinal: 0,
            name: name.into(),
            type_id,
            flags: ColumnFlags::NULLABLE,
            user_type: 0,
            max_length: None,
            precision: None,
            scale: None,
            collation: None,
            table_name: Vec::new(),
        }
    }

    /// Set the declared maximum length.
    #[must_use]
    pub fn with_max_length(mut self, max_length: u32) -> Self {
        self.max_length = Some(max_length);
        self
    }

    /// Set precision and scale.
    #[must_use]
    pub fn with_precision_scale(mut self, precision: u8, scale: u8) -> Self {
        self.precision = Some(precision);
        self.scale = Some(scale);
        self
    }

    /// Set the scale.
    #[must_use]
    pub fn with_scale(mut self, scale: u8) -> Self {
        self.scale = Some(scale);
        self
    }

    /// Set the collation.
    #[must_use]
    pub fn with_collation(mut self, collation: Collation) -> Self {
        self.collation = Some(collation);
        self
    }

    /// Whether the column admits NULL.
    #[must_use]
    pub fn is_nullable(&self) -> bool {
        self.flags.contains(ColumnFlags::NULLABLE)
    }

    /// Whether row values for this column are PLP-encoded.
    #[must_use]
    pub fn is_plp(&self) -> bool {
        self.length_strategy() == LengthStrategy::Plp
    }

    /// The length strategy values of this column use in row data.
    ///
    /// A ushort-length type whose metadata declares the MAX sentinel is
    /// streamed as PLP.
    #[must_use]
    pub fn length_strategy(&self) -> LengthStrategy {
        match self.type_id.length_strategy() {
            LengthStrategy::UShortLen if self.max_length == Some(MAX_LENGTH_SENTINEL) => {
                LengthStrategy::Plp
            }
            other => other,
        }
    }

    /// Decode TYPE_INFO for `type_id` into `self`.
    fn decode_type_info(&mut self, src: &mut Bytes, version: TdsVersion) -> Result<(), ProtocolError> {
        match self.type_id.length_strategy() {
            LengthStrategy::Fixed(_) => {}
            LengthStrategy::ByteLen => {
                // DATE carries no length in metadata even though row data is prefixed.
                if self.type_id != TypeId::Date {
                    ensure(src, 1)?;
                    self.max_length = Some(u32::from(src.get_u8()));
                }
            }
            LengthStrategy::PrecScale => {
                ensure(src, 3)?;
                self.max_length = Some(u32::from(src.get_u8()));
                self.precision = Some(src.get_u8());
                self.scale = Some(src.get_u8());
            }
            LengthStrategy::ScaleLen => {
                ensure(src, 1)?;
                self.scale = Some(src.get_u8());
            }
            LengthStrategy::UShortLen => {
                ensure(src, 2)?;
                self.max_length = Some(u32::from(src.get_u16_le()));
                if self.type_id.has_collation() {
                    self.collation = Some(Collation::decode(src)?);
                }
            }
            LengthStrategy::LongLen => {
                ensure(src, 4)?;
                self.max_length = Some(src.get_u32_le());
                if self.type_id.has_collation() {
                    self.collation = Some(Collation::decode(src)?);
                }
                if self.type_id != TypeId::Variant {
                    self.table_name = decode_table_name(src, version)?;
                }
            }
            LengthStrategy::Plp => match self.type_id {
                TypeId::Xml => {
                    ensure(src, 1)?;
                    if src.get_u8() != 0 {
                        read_b_varchar(src)?;
                        read_b_varchar(src)?;
                        read_us_varchar(src)?;
                    }
                }
                TypeId::Udt => {
                    ensure(src, 2)?;
                    self.max_length = Some(u32::from(src.get_u16_le()));
                    read_b_varchar(src)?;
                    read_b_varchar(src)?;
                    read_b_varchar(src)?;
                    read_us_varchar(src)?;
                }
                other => return Err(ProtocolError::UnsupportedType(other as u8)),
            },
        }
        Ok(())
    }

    /// Encode TYPE_INFO for this column.
    pub(crate) fn encode_type_info(&self, dst: &mut impl BufMut) {
        match self.type_id.length_strategy() {
            LengthStrategy::Fixed(_) => {}
            LengthStrategy::ByteLen => {
                if self.type_id != TypeId::Date {
                    dst.put_u8(self.max_length.unwrap_or(0) as u8);
                }
            }
            LengthStrategy::PrecScale => {
                dst.put_u8(self.max_length.unwrap_or(17) as u8);
                dst.put_u8(self.precision.unwrap_or(38));
                dst.put_u8(self.scale.unwrap_or(0));
            }
            LengthStrategy::ScaleLen => dst.put_u8(self.scale.unwrap_or(7)),
            LengthStrategy::UShortLen => {
                dst.put_u16_le(self.max_length.unwrap_or(8000) as u16);
                if self.type_id.has_collation() {
                    self.collation.unwrap_or_default().encode(dst);
                }
            }
            LengthStrategy::LongLen => {
                dst.put_u32_le(self.max_length.unwrap_or(0x7FFF_FFFF));
                if self.type_id.has_collation() {
                    self.collation.unwrap_or_default().encode(dst);
                }
                if self.type_id != TypeId::Variant {
                    dst.put_u8(self.table_name.len() as u8);
                    for part in &self.table_name {
                        write_us_varchar(dst, part);
                    }
                }
            }
            LengthStrategy::Plp => {
                if self.type_id == TypeId::Udt {
                    dst.put_u16_le(self.max_length.unwrap_or(0xFFFF) as u16);
                    for _ in 0..3 {
                        dst.put_u8(0);
                    }
                    dst.put_u16_le(0);
                } else {
                    dst.put_u8(0);
                }
            }
        }
    }

    /// Read one value of this column from row data. `None` is SQL NULL.
    pub fn read_value(&self, src: &mut Bytes) -> Result<Option<Bytes>, ProtocolError> {
        match self.length_strategy() {
            LengthStrategy::Fixed(0) => Ok(None),
            LengthStrategy::Fixed(n) => {
                ensure(src, n as usize)?;
                Ok(Some(src.split_to(n as usize)))
            }
            LengthStrategy::ByteLen | LengthStrategy::PrecScale | LengthStrategy::ScaleLen => {
                ensure(src, 1)?;
                let len = src.get_u8() as usize;
                if len == 0 {
                    return Ok(None);
                }
                ensure(src, len)?;
                Ok(Some(src.split_to(len)))
            }
            LengthStrategy::UShortLen => {
                ensure(src, 2)?;
                let len = src.get_u16_le();
                if len == 0xFFFF {
                    return Ok(None);
                }
                ensure(src, len as usize)?;
                Ok(Some(src.split_to(len as usize)))
            }
            LengthStrategy::LongLen if self.type_id == TypeId::Variant => {
                ensure(src, 4)?;
                let len = src.get_u32_le() as usize;
                if len == 0 {
                    return Ok(None);
                }
                ensure(src, len)?;
                Ok(Some(src.split_to(len)))
            }
            LengthStrategy::LongLen => {
                ensure(src, 1)?;
                let ptr_len = src.get_u8() as usize;
                if ptr_len == 0 {
                    return Ok(None);
                }
                // text pointer, then an 8-byte timestamp
                ensure(src, ptr_len + 8 + 4)?;
                src.advance(ptr_len + 8);
                let len = src.get_u32_le() as usize;
                ensure(src, len)?;
                Ok(Some(src.split_to(len)))
            }
            LengthStrategy::Plp => read_plp(src),
        }
    }

    /// Write one value of this column in row-data layout.
    pub fn write_value(&self, dst: &mut impl BufMut, value: Option<&[u8]>) {
        match self.length_strategy() {
            LengthStrategy::Fixed(_) => {
                if let Some(v) = value {
                    dst.put_slice(v);
                }
            }
            LengthStrategy::ByteLen | LengthStrategy::PrecScale | LengthStrategy::ScaleLen => {
                match value {
                    Some(v) => {
                        dst.put_u8(v.len() as u8);
                        dst.put_slice(v);
                    }
                    None => dst.put_u8(0),
                }
            }
            LengthStrategy::UShortLen => match value {
                Some(v) => {
                    dst.put_u16_le(v.len() as u16);
                    dst.put_slice(v);
                }
                None => dst.put_u16_le(0xFFFF),
            },
            LengthStrategy::LongLen if self.type_id == TypeId::Variant => match value {
                Some(v) => {
                    dst.put_u32_le(v.len() as u32);
                    dst.put_slice(v);
                }
                None => dst.put_u32_le(0),
            },
            LengthStrategy::LongLen => match value {
                Some(v) => {
                    dst.put_u8(16);
                    dst.put_slice(&[0u8; 16]);
                    dst.put_slice(&[0u8; 8]);
                    dst.put_u32_le(v.len() as u32);
                    dst.put_slice(v);
                }
                None => dst.put_u8(0),
            },
            LengthStrategy::Plp => write_plp(dst, value, DEFAULT_PLP_CHUNK_SIZE),
        }
    }
}

fn decode_table_name(src: &mut Bytes, version: TdsVersion) -> Result<Vec<String>, ProtocolError> {
    if !version.uses_wide_counts() {
        return Ok(vec![read_us_varchar(src)?]);
    }
    ensure(src, 1)?;
    let parts = src.get_u8();
    (0..parts).map(|_| read_us_varchar(src)).collect()
}

fn decode_user_type(src: &mut Bytes, version: TdsVersion) -> Result<u32, ProtocolError> {
    if version.uses_wide_counts() {
        ensure(src, 4)?;
        Ok(src.get_u32_le())
    } else {
        ensure(src, 2)?;
        Ok(u32::from(src.get_u16_le()))
    }
}

fn decode_type_id(src: &mut Bytes) -> Result<TypeId, ProtocolError> {
    ensure(src, 1)?;
    let raw = src.get_u8();
    TypeId::from_u8(raw).ok_or(ProtocolError::UnsupportedType(raw))
}

/// Column metadata token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColMetaData {
    /// Column definitions in wire order.
    pub columns: Vec<ColumnMeta>,
}

impl ColMetaData {
    /// Column count announcing that no metadata follows.
    pub const NO_METADATA: u16 = 0xFFFF;

    /// Create metadata from a column list, assigning ordinals.
    #[must_use]
    pub fn new(mut columns: Vec<ColumnMeta>) -> Self {
        for (i, column) in columns.iter_mut().enumerate() {
            column.ordinal = i;
        }
        Self { columns }
    }

    /// Decode a COLMETADATA body.
    pub fn decode(src: &mut Bytes, version: TdsVersion) -> Result<Self, ProtocolError> {
        ensure(src, 2)?;
        let count = src.get_u16_le();
        if count == Self::NO_METADATA {
            return Ok(Self::default());
        }

        let mut columns = Vec::with_capacity(count as usize);
        for ordinal in 0..count as usize {
            let user_type = decode_user_type(src, version)?;
            ensure(src, 2)?;
            let flags = ColumnFlags::from_bits_truncate(src.get_u16_le());
            let type_id = decode_type_id(src)?;

            let mut column = ColumnMeta {
                ordinal,
                user_type,
                flags,
                ..ColumnMeta::new(String::new(), type_id)
            };
            column.decode_type_info(src, version)?;
            column.name = read_b_varchar(src)?;
            columns.push(column);
        }

        Ok(Self { columns })
    }

    /// Encode a full COLMETADATA token (tag included) in the 7.2+ layout.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(TokenType::ColMetaData as u8);
        dst.put_u16_le(self.columns.len() as u16);
        for column in &self.columns {
            dst.put_u32_le(column.user_type);
            dst.put_u16_le(column.flags.bits());
            dst.put_u8(column.type_id as u8);
            column.encode_type_info(dst);
            write_b_varchar(dst, &column.name);
        }
    }

    /// Number of columns.
    #[must_use]
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Whether the token carried no columns.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

// =============================================================================
// Rows
// =============================================================================

/// One row's raw column values, in metadata order.
///
/// Values stay as undecoded bytes; `None` is SQL NULL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowData {
    /// Per-column value bytes.
    pub values: Vec<Option<Bytes>>,
}

impl RowData {
    /// Decode a ROW body.
    pub fn decode(src: &mut Bytes, metadata: &ColMetaData) -> Result<Self, ProtocolError> {
        let values = metadata
            .columns
            .iter()
            .map(|column| column.read_value(src))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { values })
    }

    /// Decode an NBCROW body: a null bitmap, then the non-null values.
    pub fn decode_nbc(src: &mut Bytes, metadata: &ColMetaData) -> Result<Self, ProtocolError> {
        let bitmap_len = metadata.columns.len().div_ceil(8);
        ensure(src, bitmap_len)?;
        let bitmap = src.split_to(bitmap_len);

        let mut values = Vec::with_capacity(metadata.columns.len());
        for (i, column) in metadata.columns.iter().enumerate() {
            if bitmap[i / 8] & (1 << (i % 8)) != 0 {
                values.push(None);
            } else {
                values.push(column.read_value(src)?);
            }
        }
        Ok(Self { values })
    }

    /// Encode a full ROW token (tag included).
    pub fn encode(&self, dst: &mut impl BufMut, metadata: &ColMetaData) {
        dst.put_u8(TokenType::Row as u8);
        for (column, value) in metadata.columns.iter().zip(&self.values) {
            column.write_value(dst, value.as_deref());
        }
    }

    /// Number of values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the row has no values.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Raw bytes for a column, `None` if NULL or out of range.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Bytes> {
        self.values.get(index).and_then(Option::as_ref)
    }
}

// =============================================================================
// DONE family
// =============================================================================

bitflags! {
    /// DONE status bits.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct DoneStatus: u16 {
        /// More results follow in this response.
        const MORE = 0x0001;
        /// The statement raised an error.
        const ERROR = 0x0002;
        /// A transaction is in progress.
        const IN_XACT = 0x0004;
        /// The row count is valid.
        const COUNT = 0x0010;
        /// Acknowledges an attention request.
        const ATTN = 0x0020;
        /// A severe server error occurred.
        const SRVERROR = 0x0100;
    }
}

/// DONE, DONEPROC or DONEINPROC body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Done {
    /// Status bits.
    pub status: DoneStatus,
    /// Token of the completed command.
    pub cur_cmd: u16,
    /// Affected row count; valid when [`DoneStatus::COUNT`] is set.
    pub row_count: u64,
}

impl Done {
    /// Create a final DONE with an optional row count.
    #[must_use]
    pub fn new(row_count: Option<u64>) -> Self {
        Self {
            status: if row_count.is_some() {
                DoneStatus::COUNT
            } else {
                DoneStatus::empty()
            },
            cur_cmd: 0,
            row_count: row_count.unwrap_or(0),
        }
    }

    /// Set the "more results" bit.
    #[must_use]
    pub fn with_more(mut self) -> Self {
        self.status |= DoneStatus::MORE;
        self
    }

    /// Set additional status bits.
    #[must_use]
    pub fn with_status(mut self, status: DoneStatus) -> Self {
        self.status |= status;
        self
    }

    /// Decode a DONE-family body. The row count is 4 bytes before TDS 7.2.
    pub fn decode(src: &mut Bytes, version: TdsVersion) -> Result<Self, ProtocolError> {
        let wide = version.uses_wide_counts();
        ensure(src, if wide { 12 } else { 8 })?;
        let status = DoneStatus::from_bits_truncate(src.get_u16_le());
        let cur_cmd = src.get_u16_le();
        let row_count = if wide {
            src.get_u64_le()
        } else {
            u64::from(src.get_u32_le())
        };
        Ok(Self {
            status,
            cur_cmd,
            row_count,
        })
    }

    /// Encode with the given tag in the layout for `version`.
    pub fn encode(&self, dst: &mut impl BufMut, token_type: TokenType, version: TdsVersion) {
        dst.put_u8(token_type as u8);
        dst.put_u16_le(self.status.bits());
        dst.put_u16_le(self.cur_cmd);
        if version.uses_wide_counts() {
            dst.put_u64_le(self.row_count);
        } else {
            dst.put_u32_le(self.row_count as u32);
        }
    }

    /// Whether more results follow.
    #[must_use]
    pub const fn has_more(&self) -> bool {
        self.status.contains(DoneStatus::MORE)
    }

    /// Whether the statement failed.
    #[must_use]
    pub const fn has_error(&self) -> bool {
        self.status.contains(DoneStatus::ERROR) || self.status.contains(DoneStatus::SRVERROR)
    }

    /// Whether this acknowledges an attention.
    #[must_use]
    pub const fn is_attention_ack(&self) -> bool {
        self.status.contains(DoneStatus::ATTN)
    }

    /// Row count, when the server declared one valid.
    #[must_use]
    pub const fn count(&self) -> Option<u64> {
        if self.status.contains(DoneStatus::COUNT) {
            Some(self.row_count)
        } else {
            None
        }
    }
}

// =============================================================================
// ERROR / INFO
// =============================================================================

/// ERROR or INFO body; both share one layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerMessage {
    /// Message number.
    pub number: i32,
    /// Error state.
    pub state: u8,
    /// Severity class.
    pub class: u8,
    /// Message text.
    pub message: String,
    /// Reporting server name.
    pub server: String,
    /// Procedure name, empty outside a procedure.
    pub procedure: String,
    /// Line number within the batch or procedure.
    pub line: u32,
}

impl ServerMessage {
    /// Severity at and above which the server closes the connection.
    pub const FATAL_CLASS: u8 = 20;

    /// Create a message with the given number, severity and text.
    #[must_use]
    pub fn new(number: i32, class: u8, message: impl Into<String>) -> Self {
        Self {
            number,
            state: 1,
            class,
            message: message.into(),
            server: String::new(),
            procedure: String::new(),
            line: 1,
        }
    }

    /// Decode an ERROR or INFO body. The line number is 2 bytes before TDS 7.2.
    pub fn decode(src: &mut Bytes, version: TdsVersion) -> Result<Self, ProtocolError> {
        ensure(src, 2)?;
        let length = src.get_u16_le() as usize;
        ensure(src, length)?;
        let mut body = src.split_to(length);

        ensure(&body, 6)?;
        let number = body.get_i32_le();
        let state = body.get_u8();
        let class = body.get_u8();
        let message = read_us_varchar(&mut body)?;
        let server = read_b_varchar(&mut body)?;
        let procedure = read_b_varchar(&mut body)?;
        let line = if version.uses_wide_counts() {
            ensure(&body, 4)?;
            body.get_u32_le()
        } else {
            ensure(&body, 2)?;
            u32::from(body.get_u16_le())
        };

        Ok(Self {
            number,
            state,
            class,
            message,
            server,
            procedure,
            line,
        })
    }

    /// Encode with the given tag (ERROR or INFO) in the layout for `version`.
    pub fn encode(&self, dst: &mut impl BufMut, token_type: TokenType, version: TdsVersion) {
        let mut body = BytesMut::new();
        body.put_i32_le(self.number);
        body.put_u8(self.state);
        body.put_u8(self.class);
        write_us_varchar(&mut body, &self.message);
        write_b_varchar(&mut body, &self.server);
        write_b_varchar(&mut body, &self.procedure);
        if version.uses_wide_counts() {
            body.put_u32_le(self.line);
        } else {
            body.put_u16_le(self.line as u16);
        }

        dst.put_u8(token_type as u8);
        dst.put_u16_le(body.len() as u16);
        dst.put_slice(&body);
    }

    /// Whether the severity terminates the connection.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        self.class >= Self::FATAL_CLASS
    }
}

// =============================================================================
// LOGINACK
// =============================================================================

/// LOGINACK body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginAck {
    /// Interface type (1 = SQL).
    pub interface: u8,
    /// Version the server agreed to.
    pub tds_version: TdsVersion,
    /// Server program name.
    pub prog_name: String,
    /// Server program version (major, minor, build high, build low).
    pub prog_version: u32,
}

impl LoginAck {
    /// Decode a LOGINACK body.
    pub fn decode(src: &mut Bytes) -> Result<Self, ProtocolError> {
        ensure(src, 2)?;
        let length = src.get_u16_le() as usize;
        ensure(src, length)?;
        let mut body = src.split_to(length);

        ensure(&body, 5)?;
        let interface = body.get_u8();
        // Unlike LOGIN7, the version here is big-endian.
        let tds_version = TdsVersion::new(body.get_u32());
        let prog_name = read_b_varchar(&mut body)?;
        ensure(&body, 4)?;
        let prog_version = body.get_u32();

        Ok(Self {
            interface,
            tds_version,
            prog_name,
            prog_version,
        })
    }

    /// Encode a full LOGINACK token.
    pub fn encode(&self, dst: &mut impl BufMut) {
        let mut body = BytesMut::new();
        body.put_u8(self.interface);
        body.put_u32(self.tds_version.raw());
        write_b_varchar(&mut body, &self.prog_name);
        body.put_u32(self.prog_version);

        dst.put_u8(TokenType::LoginAck as u8);
        dst.put_u16_le(body.len() as u16);
        dst.put_slice(&body);
    }

    /// Server version rendered as `major.minor.build`.
    #[must_use]
    pub fn server_version_string(&self) -> String {
        let [major, minor, hi, lo] = self.prog_version.to_be_bytes();
        format!("{major}.{minor}.{}", u16::from_be_bytes([hi, lo]))
    }
}

// =============================================================================
// ENVCHANGE
// =============================================================================

/// ENVCHANGE sub-type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvChangeType {
    /// Current database.
    Database,
    /// Session language.
    Language,
    /// Character set (pre-7.1 servers).
    CharacterSet,
    /// Negotiated packet size.
    PacketSize,
    /// Unicode sorting locale id.
    UnicodeSortingLocalId,
    /// Unicode comparison flags.
    UnicodeComparisonFlags,
    /// Default collation.
    SqlCollation,
    /// Transaction started.
    BeginTransaction,
    /// Transaction committed.
    CommitTransaction,
    /// Transaction rolled back.
    RollbackTransaction,
    /// Enlisted in a distributed transaction.
    EnlistDtcTransaction,
    /// Transaction defected.
    DefectTransaction,
    /// Database mirroring partner.
    DatabaseMirroringPartner,
    /// Transaction promoted to a distributed one.
    PromoteTransaction,
    /// Transaction manager address.
    TransactionManagerAddress,
    /// Transaction ended.
    TransactionEnded,
    /// Acknowledges a reset-connection request.
    ResetConnectionAck,
    /// User instance name.
    UserInstance,
    /// Routing information.
    Routing,
    /// Sub-type without a known meaning.
    Unknown(u8),
}

impl EnvChangeType {
    /// Map a raw sub-type byte.
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Database,
            2 => Self::Language,
            3 => Self::CharacterSet,
            4 => Self::PacketSize,
            5 => Self::UnicodeSortingLocalId,
            6 => Self::UnicodeComparisonFlags,
            7 => Self::SqlCollation,
            8 => Self::BeginTransaction,
            9 => Self::CommitTransaction,
            10 => Self::RollbackTransaction,
            11 => Self::EnlistDtcTransaction,
            12 => Self::DefectTransaction,
            13 => Self::DatabaseMirroringPartner,
            15 => Self::PromoteTransaction,
            16 => Self::TransactionManagerAddress,
            17 => Self::TransactionEnded,
            18 => Self::ResetConnectionAck,
            19 => Self::UserInstance,
            20 => Self::Routing,
            other => Self::Unknown(other),
        }
    }

    /// Raw sub-type byte.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Database => 1,
            Self::Language => 2,
            Self::CharacterSet => 3,
            Self::PacketSize => 4,
            Self::UnicodeSortingLocalId => 5,
            Self::UnicodeComparisonFlags => 6,
            Self::SqlCollation => 7,
            Self::BeginTransaction => 8,
            Self::CommitTransaction => 9,
            Self::RollbackTransaction => 10,
            Self::EnlistDtcTransaction => 11,
            Self::DefectTransaction => 12,
            Self::DatabaseMirroringPartner => 13,
            Self::PromoteTransaction => 15,
            Self::TransactionManagerAddress => 16,
            Self::TransactionEnded => 17,
            Self::ResetConnectionAck => 18,
            Self::UserInstance => 19,
            Self::Routing => 20,
            Self::Unknown(other) => other,
        }
    }

    /// Whether values of this sub-type are character strings.
    #[must_use]
    pub const fn is_textual(self) -> bool {
        matches!(
            self,
            Self::Database
                | Self::Language
                | Self::CharacterSet
                | Self::PacketSize
                | Self::UnicodeSortingLocalId
                | Self::UnicodeComparisonFlags
                | Self::DatabaseMirroringPartner
                | Self::UserInstance
        )
    }
}

/// An ENVCHANGE old or new value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvChangeValue {
    /// Character value.
    String(String),
    /// Binary value (collation bytes, transaction descriptors).
    Binary(Bytes),
    /// Routing target.
    Routing {
        /// Target host.
        host: String,
        /// Target port.
        port: u16,
    },
}

impl EnvChangeValue {
    /// The value as text, if textual.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// The value as bytes, if binary.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Binary(b) => Some(b),
            _ => None,
        }
    }
}

/// ENVCHANGE body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvChange {
    /// Sub-type.
    pub env_type: EnvChangeType,
    /// Value after the change.
    pub new_value: EnvChangeValue,
    /// Value before the change.
    pub old_value: EnvChangeValue,
}

impl EnvChange {
    /// Create a textual change.
    #[must_use]
    pub fn text(env_type: EnvChangeType, new_value: &str, old_value: &str) -> Self {
        Self {
            env_type,
            new_value: EnvChangeValue::String(new_value.to_owned()),
            old_value: EnvChangeValue::String(old_value.to_owned()),
        }
    }

    /// Create a binary change.
    #[must_use]
    pub fn binary(env_type: EnvChangeType, new_value: &[u8], old_value: &[u8]) -> Self {
        Self {
            env_type,
            new_value: EnvChangeValue::Binary(Bytes::copy_from_slice(new_value)),
            old_value: EnvChangeValue::Binary(Bytes::copy_from_slice(old_value)),
        }
    }

    /// Decode an ENVCHANGE body.
    ///
    /// Textual values are UTF-16LE from TDS 7.1 and single-byte before.
    pub fn decode(src: &mut Bytes, version: TdsVersion) -> Result<Self, ProtocolError> {
        ensure(src, 2)?;
        let length = src.get_u16_le() as usize;
        ensure(src, length)?;
        let mut body = src.split_to(length);

        ensure(&body, 1)?;
        let env_type = EnvChangeType::from_u8(body.get_u8());

        let (new_value, old_value) = match env_type {
            EnvChangeType::Routing => {
                let new_value = Self::decode_routing(&mut body)?;
                ensure(&body, 2)?;
                let old_len = body.get_u16_le() as usize;
                ensure(&body, old_len)?;
                body.advance(old_len);
                (new_value, EnvChangeValue::Binary(Bytes::new()))
            }
            EnvChangeType::PromoteTransaction => {
                ensure(&body, 4)?;
                let len = body.get_u32_le() as usize;
                ensure(&body, len)?;
                let new_value = EnvChangeValue::Binary(body.split_to(len));
                let old_value = EnvChangeValue::Binary(Self::read_b_varbyte(&mut body)?);
                (new_value, old_value)
            }
            t if t.is_textual() => {
                let unicode = version.is_unicode();
                let new_value = read_b_varchar_narrow(&mut body, unicode)?;
                let old_value = read_b_varchar_narrow(&mut body, unicode)?;
                (
                    EnvChangeValue::String(new_value),
                    EnvChangeValue::String(old_value),
                )
            }
            EnvChangeType::Unknown(_) => {
                let rest = body.split_to(body.len());
                (EnvChangeValue::Binary(rest), EnvChangeValue::Binary(Bytes::new()))
            }
            _ => {
                let new_value = Self::read_b_varbyte(&mut body)?;
                let old_value = Self::read_b_varbyte(&mut body)?;
                (
                    EnvChangeValue::Binary(new_value),
                    EnvChangeValue::Binary(old_value),
                )
            }
        };

        Ok(Self {
            env_type,
            new_value,
            old_value,
        })
    }

    fn read_b_varbyte(src: &mut Bytes) -> Result<Bytes, ProtocolError> {
        ensure(src, 1)?;
        let len = src.get_u8() as usize;
        ensure(src, len)?;
        Ok(src.split_to(len))
    }

    fn decode_routing(src: &mut Bytes) -> Result<EnvChangeValue, ProtocolError> {
        ensure(src, 2)?;
        let len = src.get_u16_le() as usize;
        ensure(src, len)?;
        let mut value = src.split_to(len);

        ensure(&value, 5)?;
        let _protocol = value.get_u8();
        let port = value.get_u16_le();
        let host = read_us_varchar(&mut value)?;
        Ok(EnvChangeValue::Routing { host, port })
    }

    /// Encode a full ENVCHANGE token in the 7.1+ layout.
    pub fn encode(&self, dst: &mut impl BufMut) {
        let mut body = BytesMut::new();
        body.put_u8(self.env_type.code());
        match self.env_type {
            EnvChangeType::Routing => {
                Self::encode_value(&mut body, &self.new_value);
                body.put_u16_le(0);
            }
            EnvChangeType::PromoteTransaction => {
                let new_value = self.new_value.as_bytes().cloned().unwrap_or_default();
                body.put_u32_le(new_value.len() as u32);
                body.put_slice(&new_value);
                Self::encode_value(&mut body, &self.old_value);
            }
            _ => {
                Self::encode_value(&mut body, &self.new_value);
                Self::encode_value(&mut body, &self.old_value);
            }
        }

        dst.put_u8(TokenType::EnvChange as u8);
        dst.put_u16_le(body.len() as u16);
        dst.put_slice(&body);
    }

    fn encode_value(body: &mut BytesMut, value: &EnvChangeValue) {
        match value {
            EnvChangeValue::String(s) => write_b_varchar(body, s),
            EnvChangeValue::Binary(b) => {
                body.put_u8(b.len() as u8);
                body.put_slice(b);
            }
            EnvChangeValue::Routing { host, port } => {
                let mut routing = BytesMut::new();
                routing.put_u8(0);
                routing.put_u16_le(*port);
                write_us_varchar(&mut routing, host);
                body.put_u16_le(routing.len() as u16);
                body.put_slice(&routing);
            }
        }
    }
}

// =============================================================================
// RETURNVALUE, ORDER, FEATUREEXTACK, opaque tokens
// =============================================================================

/// RETURNVALUE body: one output parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnValue {
    /// Parameter ordinal.
    pub ordinal: u16,
    /// Parameter name.
    pub name: String,
    /// Status (1 = output parameter, 2 = UDF return value).
    pub status: u8,
    /// Type metadata.
    pub meta: ColumnMeta,
    /// Raw value, `None` for NULL.
    pub value: Option<Bytes>,
}

impl ReturnValue {
    /// Decode a RETURNVALUE body.
    pub fn decode(src: &mut Bytes, version: TdsVersion) -> Result<Self, ProtocolError> {
        ensure(src, 2)?;
        let ordinal = src.get_u16_le();
        let name = read_b_varchar(src)?;
        ensure(src, 1)?;
        let status = src.get_u8();
        let user_type = decode_user_type(src, version)?;
        ensure(src, 2)?;
        let flags = ColumnFlags::from_bits_truncate(src.get_u16_le());
        let type_id = decode_type_id(src)?;

        let mut meta = ColumnMeta {
            ordinal: ordinal as usize,
            user_type,
            flags,
            ..ColumnMeta::new(name.clone(), type_id)
        };
        meta.decode_type_info(src, version)?;
        let value = meta.read_value(src)?;

        Ok(Self {
            ordinal,
            name,
            status,
            meta,
            value,
        })
    }

    /// Encode a full RETURNVALUE token in the 7.2+ layout.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(TokenType::ReturnValue as u8);
        dst.put_u16_le(self.ordinal);
        write_b_varchar(dst, &self.name);
        dst.put_u8(self.status);
        dst.put_u32_le(self.meta.user_type);
        dst.put_u16_le(self.meta.flags.bits());
        dst.put_u8(self.meta.type_id as u8);
        self.meta.encode_type_info(dst);
        self.meta.write_value(dst, self.value.as_deref());
    }
}

/// ORDER body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Order {
    /// Ordinals of the ORDER BY columns.
    pub columns: Vec<u16>,
}

impl Order {
    /// Decode an ORDER body.
    pub fn decode(src: &mut Bytes) -> Result<Self, ProtocolError> {
        ensure(src, 2)?;
        let length = src.get_u16_le() as usize;
        ensure(src, length)?;
        let mut body = src.split_to(length);
        let mut columns = Vec::with_capacity(length / 2);
        while body.remaining() >= 2 {
            columns.push(body.get_u16_le());
        }
        Ok(Self { columns })
    }
}

/// One acknowledged feature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureAck {
    /// Feature id.
    pub feature_id: u8,
    /// Feature-specific data.
    pub data: Bytes,
}

/// FEATUREEXTACK body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureExtAck {
    /// Acknowledged features in wire order.
    pub features: Vec<FeatureAck>,
}

impl FeatureExtAck {
    /// Terminator byte.
    pub const TERMINATOR: u8 = 0xFF;

    /// Decode a FEATUREEXTACK body: `(id, u32 length, data)*` then `0xFF`.
    pub fn decode(src: &mut Bytes) -> Result<Self, ProtocolError> {
        let mut features = Vec::new();
        loop {
            ensure(src, 1)?;
            let feature_id = src.get_u8();
            if feature_id == Self::TERMINATOR {
                break;
            }
            ensure(src, 4)?;
            let len = src.get_u32_le() as usize;
            ensure(src, len)?;
            features.push(FeatureAck {
                feature_id,
                data: src.split_to(len),
            });
        }
        Ok(Self { features })
    }

    /// Encode a full FEATUREEXTACK token.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(TokenType::FeatureExtAck as u8);
        for feature in &self.features {
            dst.put_u8(feature.feature_id);
            dst.put_u32_le(feature.data.len() as u32);
            dst.put_slice(&feature.data);
        }
        dst.put_u8(Self::TERMINATOR);
    }
}

/// Read an opaque body with a 2-byte length.
pub fn decode_ushort_counted(src: &mut Bytes) -> Result<Bytes, ProtocolError> {
    ensure(src, 2)?;
    let len = src.get_u16_le() as usize;
    ensure(src, len)?;
    Ok(src.split_to(len))
}

/// Read an opaque body with a 4-byte length.
pub fn decode_long_counted(src: &mut Bytes) -> Result<Bytes, ProtocolError> {
    ensure(src, 4)?;
    let len = src.get_u32_le() as usize;
    ensure(src, len)?;
    Ok(src.split_to(len))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_done_status_bits() {
        let status = DoneStatus::from_bits_truncate(0x0113);
        assert!(status.contains(DoneStatus::MORE));
        assert!(status.contains(DoneStatus::ERROR));
        assert!(status.contains(DoneStatus::COUNT));
        assert!(status.contains(DoneStatus::SRVERROR));
        assert!(!status.contains(DoneStatus::ATTN));
    }

    #[test]
    fn test_done_wide_and_narrow() {
        let done = Done::new(Some(42)).with_more();

        let mut wide = BytesMut::new();
        done.encode(&mut wide, TokenType::Done, TdsVersion::V7_4);
        assert_eq!(wide.len(), 13);
        let mut body = wide.freeze().slice(1..);
        assert_eq!(Done::decode(&mut body, TdsVersion::V7_4).unwrap(), done);

        let mut narrow = BytesMut::new();
        done.encode(&mut narrow, TokenType::Done, TdsVersion::V7_1);
        assert_eq!(narrow.len(), 9);
        let mut body = narrow.freeze().slice(1..);
        assert_eq!(Done::decode(&mut body, TdsVersion::V7_1).unwrap(), done);
    }

    #[test]
    fn test_done_count() {
        assert_eq!(Done::new(Some(3)).count(), Some(3));
        assert_eq!(Done::new(None).count(), None);
    }

    #[test]
    fn test_error_line_width() {
        let msg = ServerMessage::new(208, 16, "Invalid object name 'foo'.");

        let mut wide = BytesMut::new();
        msg.encode(&mut wide, TokenType::Error, TdsVersion::V7_4);
        let mut narrow = BytesMut::new();
        msg.encode(&mut narrow, TokenType::Error, TdsVersion::V7_1);
        assert_eq!(wide.len(), narrow.len() + 2);

        let mut body = narrow.freeze().slice(1..);
        let decoded = ServerMessage::decode(&mut body, TdsVersion::V7_1).unwrap();
        assert_eq!(decoded, msg);
        assert!(body.is_empty());
    }

    #[test]
    fn test_error_fatal_class() {
        assert!(ServerMessage::new(1, 20, "x").is_fatal());
        assert!(!ServerMessage::new(1, 16, "x").is_fatal());
    }

    #[test]
    fn test_login_ack_roundtrip() {
        let ack = LoginAck {
            interface: 1,
            tds_version: TdsVersion::V7_4,
            prog_name: "Microsoft SQL Server".into(),
            prog_version: 0x1000_0FA0,
        };
        let mut buf = BytesMut::new();
        ack.encode(&mut buf);
        // big-endian version on the wire
        assert_eq!(&buf[4..8], &[0x74, 0x00, 0x00, 0x04]);

        let mut body = buf.freeze().slice(1..);
        let decoded = LoginAck::decode(&mut body).unwrap();
        assert_eq!(decoded, ack);
        assert_eq!(decoded.server_version_string(), "16.0.4000");
    }

    #[test]
    fn test_env_change_database() {
        let change = EnvChange::text(EnvChangeType::Database, "master", "");
        let mut buf = BytesMut::new();
        change.encode(&mut buf);
        let mut body = buf.freeze().slice(1..);
        let decoded = EnvChange::decode(&mut body, TdsVersion::V7_4).unwrap();
        assert_eq!(decoded.env_type, EnvChangeType::Database);
        assert_eq!(decoded.new_value.as_str(), Some("master"));
        assert_eq!(decoded.old_value.as_str(), Some(""));
    }

    #[test]
    fn test_env_change_narrow_text() {
        let raw = [
            0x0B, 0x00, // length
            0x01, // database
            0x04, b'p', b'u', b'b', b's', // new
            0x04, b'm', b'a', b's', b't', // old (truncated name)
        ];
        let mut buf = Bytes::copy_from_slice(&raw[..]);
        let decoded = EnvChange::decode(&mut buf, TdsVersion::V7_0).unwrap();
        assert_eq!(decoded.new_value.as_str(), Some("pubs"));
        assert_eq!(decoded.old_value.as_str(), Some("mast"));
    }

    #[test]
    fn test_env_change_collation_is_binary() {
        let collation = [0x09, 0x04, 0xD0, 0x00, 0x34];
        let change = EnvChange::binary(EnvChangeType::SqlCollation, &collation, &[]);
        let mut buf = BytesMut::new();
        change.encode(&mut buf);
        let mut body = buf.freeze().slice(1..);
        let decoded = EnvChange::decode(&mut body, TdsVersion::V7_4).unwrap();
        assert_eq!(decoded.new_value.as_bytes().unwrap().as_ref(), &collation);
    }

    #[test]
    fn test_env_change_routing() {
        let change = EnvChange {
            env_type: EnvChangeType::Routing,
            new_value: EnvChangeValue::Routing {
                host: "replica.example".into(),
                port: 11000,
            },
            old_value: EnvChangeValue::Binary(Bytes::new()),
        };
        let mut buf = BytesMut::new();
        change.encode(&mut buf);
        let mut body = buf.freeze().slice(1..);
        let decoded = EnvChange::decode(&mut body, TdsVersion::V7_4).unwrap();
        assert_eq!(decoded.new_value, change.new_value);
        assert!(body.is_empty());
    }

    #[test]
    fn test_env_change_unknown_type_kept() {
        let raw = [0x03, 0x00, 0x63, 0xAA, 0xBB];
        let mut buf = Bytes::copy_from_slice(&raw[..]);
        let decoded = EnvChange::decode(&mut buf, TdsVersion::V7_4).unwrap();
        assert_eq!(decoded.env_type, EnvChangeType::Unknown(0x63));
        assert_eq!(decoded.new_value.as_bytes().unwrap().as_ref(), &[0xAA, 0xBB]);
    }

    fn sample_metadata() -> ColMetaData {
        ColMetaData::new(vec![
            ColumnMeta::new("id", TypeId::IntN).with_max_length(4),
            ColumnMeta::new("name", TypeId::NVarChar)
                .with_max_length(100)
                .with_collation(Collation::from_lcid(0x0409)),
            ColumnMeta::new("body", TypeId::NVarChar)
                .with_max_length(MAX_LENGTH_SENTINEL)
                .with_collation(Collation::from_lcid(0x0409)),
            ColumnMeta::new("born", TypeId::Date),
            ColumnMeta::new("price", TypeId::DecimalN)
                .with_max_length(9)
                .with_precision_scale(18, 2),
            ColumnMeta::new("at", TypeId::DateTime2).with_scale(7),
            ColumnMeta::new("n", TypeId::Int4),
        ])
    }

    #[test]
    fn test_colmetadata_roundtrip() {
        let meta = sample_metadata();
        let mut buf = BytesMut::new();
        meta.encode(&mut buf);
        let mut body = buf.freeze().slice(1..);
        let decoded = ColMetaData::decode(&mut body, TdsVersion::V7_4).unwrap();
        assert_eq!(decoded, meta);
        assert!(decoded.columns[2].is_plp());
        assert!(!decoded.columns[1].is_plp());
        assert_eq!(decoded.columns[3].max_length, None);
    }

    #[test]
    fn test_colmetadata_no_metadata() {
        let mut body = Bytes::from_static(&[0xFF, 0xFF]);
        let decoded = ColMetaData::decode(&mut body, TdsVersion::V7_4).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_colmetadata_unknown_type() {
        let mut body = Bytes::from_static(&[0x01, 0x00, 0, 0, 0, 0, 0x01, 0x00, 0x99]);
        assert_eq!(
            ColMetaData::decode(&mut body, TdsVersion::V7_4).unwrap_err(),
            ProtocolError::UnsupportedType(0x99)
        );
    }

    #[test]
    fn test_row_roundtrip() {
        let meta = sample_metadata();
        let big = vec![0x41u8; 9000];
        let row = RowData {
            values: vec![
                Some(Bytes::from_static(&[1, 0, 0, 0])),
                Some(Bytes::from_static(&[b'h', 0, b'i', 0])),
                Some(Bytes::from(big)),
                Some(Bytes::from_static(&[0x01, 0x02, 0x03])),
                None,
                Some(Bytes::from_static(&[0, 0, 0, 0, 0, 0, 0, 0])),
                Some(Bytes::from_static(&[7, 0, 0, 0])),
            ],
        };
        let mut buf = BytesMut::new();
        row.encode(&mut buf, &meta);
        let mut body = buf.freeze().slice(1..);
        let decoded = RowData::decode(&mut body, &meta).unwrap();
        assert_eq!(decoded, row);
        assert!(body.is_empty());
    }

    #[test]
    fn test_row_date_is_length_prefixed() {
        let meta = ColMetaData::new(vec![ColumnMeta::new("d", TypeId::Date)]);
        let mut body = Bytes::from_static(&[0x03, 0x0A, 0x0B, 0x0C, 0x00]);
        let row = RowData::decode(&mut body, &meta).unwrap();
        assert_eq!(row.get(0).unwrap().as_ref(), &[0x0A, 0x0B, 0x0C]);

        let row = RowData::decode(&mut body, &meta).unwrap();
        assert_eq!(row.values, vec![None]);
    }

    #[test]
    fn test_row_plp_null() {
        let meta = ColMetaData::new(vec![
            ColumnMeta::new("x", TypeId::BigVarBinary).with_max_length(MAX_LENGTH_SENTINEL),
        ]);
        let mut body = Bytes::copy_from_slice(&u64::MAX.to_le_bytes());
        let row = RowData::decode(&mut body, &meta).unwrap();
        assert_eq!(row.values, vec![None]);
    }

    #[test]
    fn test_row_truncated_is_eof() {
        let meta = ColMetaData::new(vec![ColumnMeta::new("n", TypeId::Int8)]);
        let mut body = Bytes::from_static(&[1, 2, 3]);
        assert_eq!(
            RowData::decode(&mut body, &meta).unwrap_err(),
            ProtocolError::UnexpectedEof
        );
    }

    #[test]
    fn test_nbc_row() {
        let meta = ColMetaData::new(vec![
            ColumnMeta::new("a", TypeId::IntN).with_max_length(4),
            ColumnMeta::new("b", TypeId::IntN).with_max_length(4),
            ColumnMeta::new("c", TypeId::IntN).with_max_length(4),
        ]);
        // column b is null
        let mut body = Bytes::from_static(&[0b0000_0010, 0x04, 1, 0, 0, 0, 0x04, 3, 0, 0, 0]);
        let row = RowData::decode_nbc(&mut body, &meta).unwrap();
        assert_eq!(row.values[1], None);
        assert_eq!(row.get(2).unwrap().as_ref(), &[3, 0, 0, 0]);
    }

    #[test]
    fn test_legacy_text_column() {
        let meta = ColMetaData::new(vec![ColumnMeta {
            table_name: vec!["dbo".into(), "docs".into()],
            ..ColumnMeta::new("t", TypeId::Text)
                .with_max_length(0x7FFF_FFFF)
                .with_collation(Collation::from_lcid(0x0409))
        }]);
        let mut buf = BytesMut::new();
        meta.encode(&mut buf);
        RowData {
            values: vec![Some(Bytes::from_static(b"abc"))],
        }
        .encode(&mut buf, &meta);

        let mut payload = buf.freeze().slice(1..);
        let decoded = ColMetaData::decode(&mut payload, TdsVersion::V7_4).unwrap();
        assert_eq!(decoded.columns[0].table_name, vec!["dbo", "docs"]);
        payload.advance(1);
        let row = RowData::decode(&mut payload, &decoded).unwrap();
        assert_eq!(row.get(0).unwrap().as_ref(), b"abc");
    }

    #[test]
    fn test_return_value_roundtrip() {
        let rv = ReturnValue {
            ordinal: 1,
            name: "@out".into(),
            status: 1,
            meta: ColumnMeta {
                ordinal: 1,
                ..ColumnMeta::new("@out", TypeId::IntN).with_max_length(4)
            },
            value: Some(Bytes::from_static(&[9, 0, 0, 0])),
        };
        let mut buf = BytesMut::new();
        rv.encode(&mut buf);
        let mut body = buf.freeze().slice(1..);
        assert_eq!(ReturnValue::decode(&mut body, TdsVersion::V7_4).unwrap(), rv);
    }

    #[test]
    fn test_feature_ext_ack() {
        let ack = FeatureExtAck {
            features: vec![FeatureAck {
                feature_id: 0x0A,
                data: Bytes::from_static(&[1]),
            }],
        };
        let mut buf = BytesMut::new();
        ack.encode(&mut buf);
        let mut body = buf.freeze().slice(1..);
        assert_eq!(FeatureExtAck::decode(&mut body).unwrap(), ack);
    }

    #[test]
    fn test_feature_ext_ack_missing_terminator() {
        let mut body = Bytes::from_static(&[0x0A, 0x01, 0x00, 0x00, 0x00, 0x01]);
        assert_eq!(
            FeatureExtAck::decode(&mut body).unwrap_err(),
            ProtocolError::UnexpectedEof
        );
    }

    #[test]
    fn test_order() {
        let mut body = Bytes::from_static(&[0x04, 0x00, 0x01, 0x00, 0x03, 0x00]);
        assert_eq!(Order::decode(&mut body).unwrap().columns, vec![1, 3]);
    }

    #[test]
    fn test_require_metadata() {
        let ctx = ParseContext::new(TdsVersion::V7_4);
        assert_eq!(
            ctx.require_metadata().unwrap_err(),
            ProtocolError::MissingColumnMetadata
        );
    }
}
