//! LOGIN7 message.
//!
//! LOGIN7 carries credentials and client identity. It is a fixed 94-byte
//! header holding offset/length pairs, followed by UTF-16LE variable data in
//! a fixed order. Lengths in the header count characters, not bytes, except
//! for SSPI data.
//!
//! The password is obfuscated with a nibble swap and XOR, which is not
//! encryption. Logins should travel over TLS.

use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{utf16_byte_len, write_utf16_string};
use crate::error::ProtocolError;
use crate::packet::DEFAULT_PACKET_SIZE;
use crate::version::TdsVersion;

/// Size of the fixed LOGIN7 header.
pub const LOGIN7_HEADER_SIZE: usize = 94;

/// Locale id sent when the caller does not choose one (en-US).
pub const DEFAULT_CLIENT_LCID: u32 = 0x0409;

bitflags! {
    /// First option byte.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct OptionFlags1: u8 {
        /// Big-endian integers.
        const BYTE_ORDER_BE = 0x01;
        /// EBCDIC characters.
        const CHAR_EBCDIC = 0x02;
        /// VAX floating point.
        const FLOAT_VAX = 0x04;
        /// ND5000 floating point.
        const FLOAT_ND5000 = 0x08;
        /// Disable dump/load.
        const DUMP_LOAD_OFF = 0x10;
        /// Request a database change notification.
        const USE_DB = 0x20;
        /// Fail the login if the database cannot be used.
        const DATABASE_FATAL = 0x40;
        /// Request a language change notification.
        const SET_LANG = 0x80;
    }
}

bitflags! {
    /// Second option byte.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct OptionFlags2: u8 {
        /// Fail the login if the language cannot be set.
        const LANGUAGE_FATAL = 0x01;
        /// ODBC client.
        const ODBC = 0x02;
        /// Server-to-server login.
        const USER_SERVER = 0x10;
        /// Replication login.
        const USER_REPLICATION = 0x30;
        /// Windows integrated authentication.
        const INTEGRATED_SECURITY = 0x80;
    }
}

bitflags! {
    /// Type option byte.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct TypeFlags: u8 {
        /// T-SQL dialect.
        const SQL_TSQL = 0x01;
        /// OLE DB client.
        const OLEDB = 0x10;
        /// Read-only application intent.
        const READ_ONLY_INTENT = 0x20;
    }
}

bitflags! {
    /// Third option byte.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct OptionFlags3: u8 {
        /// Change the password during login.
        const CHANGE_PASSWORD = 0x01;
        /// Spawn a user instance.
        const USER_INSTANCE = 0x02;
        /// Client understands binary XML.
        const SEND_YUKON_BINARY_XML = 0x04;
        /// Client tolerates unknown collations.
        const UNKNOWN_COLLATION_HANDLING = 0x08;
        /// A feature extension block is present.
        const EXTENSION = 0x10;
    }
}

/// Feature extension ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FeatureId {
    /// Session recovery.
    SessionRecovery = 0x01,
    /// Federated authentication.
    FedAuth = 0x02,
    /// Column encryption.
    ColumnEncryption = 0x04,
    /// Global transactions.
    GlobalTransactions = 0x05,
    /// Azure SQL support.
    AzureSqlSupport = 0x08,
    /// Data classification.
    DataClassification = 0x09,
    /// UTF-8 support.
    Utf8Support = 0x0A,
}

/// Terminator of the feature extension block.
pub const FEATURE_TERMINATOR: u8 = 0xFF;

/// One feature extension request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureExtension {
    /// Feature id.
    pub feature_id: FeatureId,
    /// Feature data.
    pub data: Bytes,
}

/// LOGIN7 request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Login7 {
    /// Requested TDS version.
    pub tds_version: TdsVersion,
    /// Requested packet size.
    pub packet_size: u32,
    /// Client program version.
    pub client_prog_version: u32,
    /// Client process id.
    pub client_pid: u32,
    /// Connection id.
    pub connection_id: u32,
    /// First option byte.
    pub option_flags1: OptionFlags1,
    /// Second option byte.
    pub option_flags2: OptionFlags2,
    /// Type option byte.
    pub type_flags: TypeFlags,
    /// Third option byte.
    pub option_flags3: OptionFlags3,
    /// Client UTC offset in minutes.
    pub client_timezone: i32,
    /// Client locale id.
    pub client_lcid: u32,
    /// Client machine name.
    pub hostname: String,
    /// SQL login name.
    pub username: String,
    /// SQL login password, sent obfuscated.
    pub password: String,
    /// Application name.
    pub app_name: String,
    /// Server name as the client addressed it.
    pub server_name: String,
    /// Client library name.
    pub library_name: String,
    /// Initial language.
    pub language: String,
    /// Initial database.
    pub database: String,
    /// Client id, usually a MAC address.
    pub client_id: [u8; 6],
    /// SSPI blob for integrated authentication.
    pub sspi: Bytes,
    /// Database file to attach.
    pub attach_db_file: String,
    /// Replacement password.
    pub new_password: String,
    /// Feature extension requests.
    pub features: Vec<FeatureExtension>,
}

impl Default for Login7 {
    fn default() -> Self {
        Self {
            tds_version: TdsVersion::V7_4,
            packet_size: DEFAULT_PACKET_SIZE as u32,
            client_prog_version: 0,
            client_pid: std::process::id(),
            connection_id: 0,
            option_flags1: OptionFlags1::USE_DB | OptionFlags1::DATABASE_FATAL | OptionFlags1::SET_LANG,
            option_flags2: OptionFlags2::LANGUAGE_FATAL | OptionFlags2::ODBC,
            type_flags: TypeFlags::empty(),
            option_flags3: OptionFlags3::UNKNOWN_COLLATION_HANDLING,
            client_timezone: 0,
            client_lcid: DEFAULT_CLIENT_LCID,
            hostname: String::new(),
            username: String::new(),
            password: String::new(),
            app_name: String::from("tds-engine"),
            server_name: String::new(),
            library_name: String::from("tds-engine"),
            language: String::new(),
            database: String::new(),
            client_id: [0; 6],
            sspi: Bytes::new(),
            attach_db_file: String::new(),
            new_password: String::new(),
            features: Vec::new(),
        }
    }
}

/// Accumulates variable data and hands back `(offset, length)` pairs.
struct VarData {
    buf: BytesMut,
}

impl VarData {
    fn offset(&self) -> u16 {
        (LOGIN7_HEADER_SIZE + self.buf.len()) as u16
    }

    fn text(&mut self, s: &str) -> (u16, u16) {
        let offset = self.offset();
        write_utf16_string(&mut self.buf, s);
        (offset, (utf16_byte_len(s) / 2) as u16)
    }

    fn password(&mut self, s: &str) -> (u16, u16) {
        let offset = self.offset();
        let start = self.buf.len();
        write_utf16_string(&mut self.buf, s);
        obfuscate_password(&mut self.buf[start..]);
        (offset, ((self.buf.len() - start) / 2) as u16)
    }
}

impl Login7 {
    /// A request with default flags.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the requested TDS version.
    #[must_use]
    pub fn with_tds_version(mut self, version: TdsVersion) -> Self {
        self.tds_version = version;
        self
    }

    /// Use SQL authentication.
    #[must_use]
    pub fn with_sql_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self.option_flags2.remove(OptionFlags2::INTEGRATED_SECURITY);
        self
    }

    /// Set the initial database.
    #[must_use]
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    /// Set the client machine name.
    #[must_use]
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Set the application name.
    #[must_use]
    pub fn with_app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = app_name.into();
        self
    }

    /// Set the server name.
    #[must_use]
    pub fn with_server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = server_name.into();
        self
    }

    /// Set the requested packet size.
    #[must_use]
    pub fn with_packet_size(mut self, packet_size: u32) -> Self {
        self.packet_size = packet_size;
        self
    }

    /// Set the client locale id.
    #[must_use]
    pub fn with_lcid(mut self, lcid: u32) -> Self {
        self.client_lcid = lcid;
        self
    }

    /// Declare read-only application intent.
    #[must_use]
    pub fn with_read_only_intent(mut self, read_only: bool) -> Self {
        self.type_flags.set(TypeFlags::READ_ONLY_INTENT, read_only);
        self
    }

    /// Add a feature extension request.
    #[must_use]
    pub fn with_feature(mut self, feature: FeatureExtension) -> Self {
        self.features.push(feature);
        self
    }

    /// Encode the message.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let has_extension = !self.features.is_empty();
        let mut flags3 = self.option_flags3;
        flags3.set(OptionFlags3::EXTENSION, has_extension);

        let mut var = VarData {
            buf: BytesMut::with_capacity(256),
        };
        let hostname = var.text(&self.hostname);
        let username = var.text(&self.username);
        let password = var.password(&self.password);
        let app_name = var.text(&self.app_name);
        let server_name = var.text(&self.server_name);

        // ibExtension points at a DWORD holding the offset of the feature block.
        let extension = if has_extension {
            let slot = var.offset();
            var.buf.put_u32_le(0);
            (slot, 4)
        } else {
            (var.offset(), 0)
        };

        let library_name = var.text(&self.library_name);
        let language = var.text(&self.language);
        let database = var.text(&self.database);

        let sspi = (var.offset(), self.sspi.len() as u16);
        var.buf.put_slice(&self.sspi);

        let attach_db = var.text(&self.attach_db_file);
        let new_password = var.password(&self.new_password);

        if has_extension {
            let block_offset = u32::from(var.offset());
            let slot = extension.0 as usize - LOGIN7_HEADER_SIZE;
            var.buf[slot..slot + 4].copy_from_slice(&block_offset.to_le_bytes());
            for feature in &self.features {
                var.buf.put_u8(feature.feature_id as u8);
                var.buf.put_u32_le(feature.data.len() as u32);
                var.buf.put_slice(&feature.data);
            }
            var.buf.put_u8(FEATURE_TERMINATOR);
        }

        let mut buf = BytesMut::with_capacity(LOGIN7_HEADER_SIZE + var.buf.len());
        buf.put_u32_le((LOGIN7_HEADER_SIZE + var.buf.len()) as u32);
        buf.put_u32_le(self.tds_version.raw());
        buf.put_u32_le(self.packet_size);
        buf.put_u32_le(self.client_prog_version);
        buf.put_u32_le(self.client_pid);
        buf.put_u32_le(self.connection_id);
        buf.put_u8(self.option_flags1.bits());
        buf.put_u8(self.option_flags2.bits());
        buf.put_u8(self.type_flags.bits());
        buf.put_u8(flags3.bits());
        buf.put_i32_le(self.client_timezone);
        buf.put_u32_le(self.client_lcid);

        for (offset, len) in [
            hostname,
            username,
            password,
            app_name,
            server_name,
            extension,
            library_name,
            language,
            database,
        ] {
            buf.put_u16_le(offset);
            buf.put_u16_le(len);
        }
        buf.put_slice(&self.client_id);
        for (offset, len) in [sspi, attach_db, new_password] {
            buf.put_u16_le(offset);
            buf.put_u16_le(len);
        }
        // cbSSPILong
        buf.put_u32_le(0);

        buf.put_slice(&var.buf);
        buf.freeze()
    }

    /// Decode a LOGIN7 payload. Used by test servers.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() < LOGIN7_HEADER_SIZE {
            return Err(ProtocolError::UnexpectedEof);
        }
        let u32_at = |at: usize| {
            u32::from_le_bytes([payload[at], payload[at + 1], payload[at + 2], payload[at + 3]])
        };
        let u16_at = |at: usize| u16::from_le_bytes([payload[at], payload[at + 1]]) as usize;
        let text_at = |entry: usize| -> Result<String, ProtocolError> {
            let offset = u16_at(entry);
            let bytes = u16_at(entry + 2) * 2;
            let raw = payload
                .get(offset..offset + bytes)
                .ok_or(ProtocolError::UnexpectedEof)?;
            utf16_from_bytes(raw)
        };

        let password_offset = u16_at(44);
        let password_bytes = u16_at(46) * 2;
        let mut password = payload
            .get(password_offset..password_offset + password_bytes)
            .ok_or(ProtocolError::UnexpectedEof)?
            .to_vec();
        deobfuscate_password(&mut password);

        let mut client_id = [0u8; 6];
        client_id.copy_from_slice(&payload[72..78]);

        Ok(Self {
            tds_version: TdsVersion::new(u32_at(4)),
            packet_size: u32_at(8),
            client_prog_version: u32_at(12),
            client_pid: u32_at(16),
            connection_id: u32_at(20),
            option_flags1: OptionFlags1::from_bits_retain(payload[24]),
            option_flags2: OptionFlags2::from_bits_retain(payload[25]),
            type_flags: TypeFlags::from_bits_retain(payload[26]),
            option_flags3: OptionFlags3::from_bits_retain(payload[27]),
            client_timezone: u32_at(28) as i32,
            client_lcid: u32_at(32),
            hostname: text_at(36)?,
            username: text_at(40)?,
            password: utf16_from_bytes(&password)?,
            app_name: text_at(48)?,
            server_name: text_at(52)?,
            library_name: text_at(60)?,
            language: text_at(64)?,
            database: text_at(68)?,
            client_id,
            sspi: Bytes::new(),
            attach_db_file: text_at(82)?,
            new_password: String::new(),
            features: Vec::new(),
        })
    }
}

fn utf16_from_bytes(raw: &[u8]) -> Result<String, ProtocolError> {
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).map_err(|e| ProtocolError::StringEncoding(e.to_string()))
}

/// Obfuscate UTF-16LE password bytes in place: swap nibbles, then XOR 0xA5.
pub fn obfuscate_password(bytes: &mut [u8]) {
    for b in bytes {
        *b = b.rotate_right(4) ^ 0xA5;
    }
}

/// Undo [`obfuscate_password`].
pub fn deobfuscate_password(bytes: &mut [u8]) {
    for b in bytes {
        *b = (*b ^ 0xA5).rotate_left(4);
    }
}
