//! PRELOGIN message.
//!
//! PRELOGIN is the first exchange on a connection. It is not a token stream:
//! the payload is a table of `(tag, offset, length)` entries terminated by
//! `0xFF`, followed by a data block the offsets point into. Offsets and
//! lengths are big-endian and offsets are absolute from the start of the
//! payload.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::version::TdsVersion;

/// PRELOGIN option tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PreLoginOption {
    /// Client TDS version or server product version.
    Version = 0x00,
    /// Encryption negotiation.
    Encryption = 0x01,
    /// Named instance, NUL-terminated.
    Instance = 0x02,
    /// Client thread id.
    ThreadId = 0x03,
    /// Multiple active result sets.
    Mars = 0x04,
    /// Activity id for tracing.
    TraceId = 0x05,
    /// Federated authentication required.
    FedAuthRequired = 0x06,
    /// Nonce.
    Nonce = 0x07,
    /// End of the option table.
    Terminator = 0xFF,
}

impl PreLoginOption {
    /// Map a raw tag; `None` for tags this client does not know.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x00 => Self::Version,
            0x01 => Self::Encryption,
            0x02 => Self::Instance,
            0x03 => Self::ThreadId,
            0x04 => Self::Mars,
            0x05 => Self::TraceId,
            0x06 => Self::FedAuthRequired,
            0x07 => Self::Nonce,
            0xFF => Self::Terminator,
            _ => return None,
        })
    }
}

/// ENCRYPTION option value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum EncryptionLevel {
    /// Encrypt the login only.
    Off = 0x00,
    /// Encrypt the whole connection.
    #[default]
    On = 0x01,
    /// No encryption available.
    NotSupported = 0x02,
    /// Encryption is mandatory.
    Required = 0x03,
}

impl EncryptionLevel {
    /// Map a raw value.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Off),
            0x01 => Some(Self::On),
            0x02 => Some(Self::NotSupported),
            0x03 => Some(Self::Required),
            _ => None,
        }
    }

    /// Whether the server's answer calls for a TLS handshake.
    #[must_use]
    pub const fn requires_tls(self) -> bool {
        matches!(self, Self::On | Self::Required)
    }
}

/// PRELOGIN request or response.
///
/// In a request `version` is the TDS version the client wants. In a
/// response the same field carries the server's product version, which this
/// type exposes as `server_version`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PreLogin {
    /// TDS version requested by the client.
    pub version: TdsVersion,
    /// Server product version (major, minor, build) from a response.
    pub server_version: Option<u32>,
    /// Sub-build number accompanying the version.
    pub sub_build: u16,
    /// Encryption setting.
    pub encryption: EncryptionLevel,
    /// Instance name.
    pub instance: Option<String>,
    /// Client thread id.
    pub thread_id: Option<u32>,
    /// Multiple active result sets.
    pub mars: bool,
    /// Federated authentication required.
    pub fed_auth_required: bool,
}

impl PreLogin {
    /// A request for TDS 7.4 with encryption on.
    #[must_use]
    pub fn new() -> Self {
        Self {
            version: TdsVersion::V7_4,
            ..Self::default()
        }
    }

    /// Set the requested TDS version.
    #[must_use]
    pub fn with_version(mut self, version: TdsVersion) -> Self {
        self.version = version;
        self
    }

    /// Set the encryption setting.
    #[must_use]
    pub fn with_encryption(mut self, level: EncryptionLevel) -> Self {
        self.encryption = level;
        self
    }

    /// Set the instance name.
    #[must_use]
    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    /// Set the client thread id.
    #[must_use]
    pub fn with_thread_id(mut self, thread_id: u32) -> Self {
        self.thread_id = Some(thread_id);
        self
    }

    /// Request multiple active result sets.
    #[must_use]
    pub fn with_mars(mut self, enabled: bool) -> Self {
        self.mars = enabled;
        self
    }

    fn options(&self) -> Vec<(PreLoginOption, Vec<u8>)> {
        let mut version = self.version.raw().to_be_bytes().to_vec();
        version.extend_from_slice(&self.sub_build.to_le_bytes());

        let mut options = vec![
            (PreLoginOption::Version, version),
            (PreLoginOption::Encryption, vec![self.encryption as u8]),
        ];
        if let Some(instance) = &self.instance {
            let mut data = instance.as_bytes().to_vec();
            data.push(0);
            options.push((PreLoginOption::Instance, data));
        }
        if let Some(thread_id) = self.thread_id {
            options.push((PreLoginOption::ThreadId, thread_id.to_be_bytes().to_vec()));
        }
        options.push((PreLoginOption::Mars, vec![u8::from(self.mars)]));
        if self.fed_auth_required {
            options.push((PreLoginOption::FedAuthRequired, vec![1]));
        }
        options
    }

    /// Encode the option table and data block.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let options = self.options();
        let table_len = options.len() * 5 + 1;
        let data_len: usize = options.iter().map(|(_, data)| data.len()).sum();

        let mut buf = BytesMut::with_capacity(table_len + data_len);
        let mut offset = table_len;
        for (option, data) in &options {
            buf.put_u8(*option as u8);
            buf.put_u16(offset as u16);
            buf.put_u16(data.len() as u16);
            offset += data.len();
        }
        buf.put_u8(PreLoginOption::Terminator as u8);
        for (_, data) in &options {
            buf.put_slice(data);
        }
        buf.freeze()
    }

    /// Decode a PRELOGIN payload.
    ///
    /// Unknown option tags are skipped. An entry pointing outside the payload
    /// or into the option table is an error.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut entries = Vec::new();
        let mut pos = 0;
        loop {
            let tag = *payload.get(pos).ok_or(ProtocolError::UnexpectedEof)?;
            if tag == PreLoginOption::Terminator as u8 {
                pos += 1;
                break;
            }
            let entry = payload
                .get(pos + 1..pos + 5)
                .ok_or(ProtocolError::UnexpectedEof)?;
            let offset = u16::from_be_bytes([entry[0], entry[1]]) as usize;
            let length = u16::from_be_bytes([entry[2], entry[3]]) as usize;
            entries.push((tag, offset, length));
            pos += 5;
        }
        let table_end = pos;

        let mut prelogin = Self::default();
        for (tag, offset, length) in entries {
            if offset < table_end || offset + length > payload.len() {
                return Err(ProtocolError::InvalidPreloginOption(tag));
            }
            let data = &payload[offset..offset + length];

            match PreLoginOption::from_u8(tag) {
                Some(PreLoginOption::Version) if length >= 4 => {
                    let raw = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
                    prelogin.version = TdsVersion::new(raw);
                    prelogin.server_version = Some(raw);
                    if length >= 6 {
                        prelogin.sub_build = u16::from_le_bytes([data[4], data[5]]);
                    }
                }
                Some(PreLoginOption::Encryption) if length >= 1 => {
                    prelogin.encryption =
                        EncryptionLevel::from_u8(data[0]).ok_or(ProtocolError::InvalidField {
                            field: "encryption",
                            value: u64::from(data[0]),
                        })?;
                }
                Some(PreLoginOption::Instance) => {
                    let name = data.split(|&b| b == 0).next().unwrap_or_default();
                    if !name.is_empty() {
                        prelogin.instance = Some(String::from_utf8_lossy(name).into_owned());
                    }
                }
                Some(PreLoginOption::ThreadId) if length >= 4 => {
                    prelogin.thread_id =
                        Some(u32::from_be_bytes([data[0], data[1], data[2], data[3]]));
                }
                Some(PreLoginOption::Mars) if length >= 1 => prelogin.mars = data[0] != 0,
                Some(PreLoginOption::FedAuthRequired) if length >= 1 => {
                    prelogin.fed_auth_required = data[0] != 0;
                }
                _ => {}
            }
        }

        Ok(prelogin)
    }

    /// Server product version as `major.minor.build`.
    #[must_use]
    pub fn server_version_string(&self) -> Option<String> {
        self.server_version.map(|raw| {
            let [major, minor, hi, lo] = raw.to_be_bytes();
            format!("{major}.{minor}.{}", u16::from_be_bytes([hi, lo]))
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_table_layout() {
        let encoded = PreLogin::new().encode();
        // VERSION, ENCRYPTION, MARS and the terminator
        assert_eq!(encoded[0], PreLoginOption::Version as u8);
        assert_eq!(u16::from_be_bytes([encoded[1], encoded[2]]), 16);
        assert_eq!(u16::from_be_bytes([encoded[3], encoded[4]]), 6);
        assert_eq!(encoded[15], PreLoginOption::Terminator as u8);
        assert_eq!(&encoded[16..20], &[0x74, 0x00, 0x00, 0x04]);
        assert_eq!(encoded.len(), 16 + 6 + 1 + 1);
    }

    #[test]
    fn test_roundtrip() {
        let original = PreLogin::new()
            .with_encryption(EncryptionLevel::Required)
            .with_instance("SQLEXPRESS")
            .with_thread_id(77)
            .with_mars(true);
        let decoded = PreLogin::decode(&original.encode()).unwrap();
        assert_eq!(decoded.version, TdsVersion::V7_4);
        assert_eq!(decoded.encryption, EncryptionLevel::Required);
        assert_eq!(decoded.instance.as_deref(), Some("SQLEXPRESS"));
        assert_eq!(decoded.thread_id, Some(77));
        assert!(decoded.mars);
    }

    #[test]
    fn test_decode_out_of_order_options() {
        let payload = [
            0x01, 0x00, 0x0B, 0x00, 0x01, // ENCRYPTION -> offset 11
            0x00, 0x00, 0x0C, 0x00, 0x06, // VERSION -> offset 12
            0xFF, //
            0x03, // required
            0x10, 0x00, 0x0F, 0xA0, 0x00, 0x00,
        ];
        let decoded = PreLogin::decode(&payload).unwrap();
        assert_eq!(decoded.encryption, EncryptionLevel::Required);
        assert_eq!(decoded.server_version_string().as_deref(), Some("16.0.4000"));
    }

    #[test]
    fn test_decode_skips_unknown_option() {
        let payload = [
            0x42, 0x00, 0x0B, 0x00, 0x01, //
            0x01, 0x00, 0x0C, 0x00, 0x01, //
            0xFF, 0x99, 0x00,
        ];
        let decoded = PreLogin::decode(&payload).unwrap();
        assert_eq!(decoded.encryption, EncryptionLevel::Off);
    }

    #[test]
    fn test_decode_offset_out_of_bounds() {
        let payload = [0x01, 0x00, 0x20, 0x00, 0x01, 0xFF];
        assert_eq!(
            PreLogin::decode(&payload).unwrap_err(),
            ProtocolError::InvalidPreloginOption(0x01)
        );
    }

    #[test]
    fn test_decode_missing_terminator() {
        assert_eq!(
            PreLogin::decode(&[0x00, 0x00]).unwrap_err(),
            ProtocolError::UnexpectedEof
        );
    }

    #[test]
    fn test_requires_tls() {
        assert!(EncryptionLevel::On.requires_tls());
        assert!(EncryptionLevel::Required.requires_tls());
        assert!(!EncryptionLevel::Off.requires_tls());
        assert!(!EncryptionLevel::NotSupported.requires_tls());
    }
}
