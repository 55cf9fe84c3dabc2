//! Per-connection session state.
//!
//! The server announces changes to the session environment through ENVCHANGE
//! tokens and identifies itself in LOGINACK. [`SessionState::apply`] folds an
//! ENVCHANGE into a new state without any I/O, so the same function serves the
//! login handshake and the ready-phase driver.

use bytes::Bytes;
use encoding_rs::{Encoding, UTF_16LE, WINDOWS_1252};

use crate::collation::Collation;
use crate::packet::{DEFAULT_PACKET_SIZE, MAX_PACKET_SIZE, MIN_PACKET_SIZE};
use crate::token::{EnvChange, EnvChangeType, EnvChangeValue, LoginAck};
use crate::version::TdsVersion;

/// Language a fresh or reset session runs under.
pub const DEFAULT_LANGUAGE: &str = "us_english";

/// Connection-lifetime session record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    /// Negotiated protocol version.
    pub tds_version: TdsVersion,
    /// Current database.
    pub database: Option<String>,
    /// Session language.
    pub language: String,
    /// Character set announced by pre-7.1 servers.
    pub charset: Option<String>,
    /// Negotiated packet size.
    pub packet_size: u32,
    /// Raw default collation bytes; empty when unknown.
    pub collation: Bytes,
    /// Whether a transaction is open.
    pub in_transaction: bool,
    /// Descriptor of the open transaction, 0 when none.
    pub transaction_descriptor: u64,
    /// Server name as configured by the client.
    pub server_name: Option<String>,
    /// Server program version from LOGINACK.
    pub server_version: Option<u32>,
    /// Server program name from LOGINACK.
    pub server_program: Option<String>,
    /// Routing target announced during login.
    pub routing: Option<(String, u16)>,
    /// Database mirroring failover partner.
    pub failover_partner: Option<String>,
    /// Server process id of this session.
    pub spid: u16,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new(TdsVersion::default())
    }
}

impl SessionState {
    /// A fresh session for the given version.
    #[must_use]
    pub fn new(tds_version: TdsVersion) -> Self {
        Self {
            tds_version,
            database: None,
            language: DEFAULT_LANGUAGE.to_owned(),
            charset: None,
            packet_size: DEFAULT_PACKET_SIZE as u32,
            collation: Bytes::new(),
            in_transaction: false,
            transaction_descriptor: 0,
            server_name: None,
            server_version: None,
            server_program: None,
            routing: None,
            failover_partner: None,
            spid: 0,
        }
    }

    /// Fold one ENVCHANGE into the state.
    ///
    /// Out-of-range packet sizes and unknown sub-types leave the state as is.
    #[must_use]
    pub fn apply(change: &EnvChange, mut state: SessionState) -> SessionState {
        match change.env_type {
            EnvChangeType::Database => {
                if let Some(db) = change.new_value.as_str() {
                    state.database = Some(db.to_owned());
                }
            }
            EnvChangeType::Language => {
                if let Some(lang) = change.new_value.as_str() {
                    state.language = lang.to_owned();
                }
            }
            EnvChangeType::CharacterSet => {
                if let Some(charset) = change.new_value.as_str() {
                    state.charset = Some(charset.to_owned());
                }
            }
            EnvChangeType::PacketSize => {
                if let Some(size) = change
                    .new_value
                    .as_str()
                    .and_then(|s| s.trim().parse::<u32>().ok())
                    .filter(|size| {
                        (MIN_PACKET_SIZE as u32..=MAX_PACKET_SIZE as u32).contains(size)
                    })
                {
                    state.packet_size = size;
                }
            }
            EnvChangeType::SqlCollation => {
                if let Some(raw) = change.new_value.as_bytes() {
                    state.collation = raw.clone();
                }
            }
            EnvChangeType::BeginTransaction => {
                state.in_transaction = true;
                state.transaction_descriptor = change
                    .new_value
                    .as_bytes()
                    .map(|raw| descriptor_from_bytes(raw))
                    .unwrap_or(0);
            }
            EnvChangeType::CommitTransaction
            | EnvChangeType::RollbackTransaction
            | EnvChangeType::DefectTransaction
            | EnvChangeType::TransactionEnded => {
                state.in_transaction = false;
                state.transaction_descriptor = 0;
            }
            EnvChangeType::EnlistDtcTransaction | EnvChangeType::PromoteTransaction => {
                state.in_transaction = true;
            }
            EnvChangeType::ResetConnectionAck => state.reset_to_defaults(),
            EnvChangeType::DatabaseMirroringPartner => {
                state.failover_partner = change
                    .new_value
                    .as_str()
                    .filter(|s| !s.is_empty())
                    .map(str::to_owned);
            }
            EnvChangeType::Routing => {
                if let EnvChangeValue::Routing { host, port } = &change.new_value {
                    state.routing = Some((host.clone(), *port));
                }
            }
            EnvChangeType::UnicodeSortingLocalId
            | EnvChangeType::UnicodeComparisonFlags
            | EnvChangeType::TransactionManagerAddress
            | EnvChangeType::UserInstance
            | EnvChangeType::Unknown(_) => {}
        }
        state
    }

    /// Record the server identity from LOGINACK.
    ///
    /// The acknowledged version replaces the requested one.
    #[must_use]
    pub fn apply_login_ack(ack: &LoginAck, mut state: SessionState) -> SessionState {
        state.tds_version = ack.tds_version;
        state.server_program = Some(ack.prog_name.clone());
        state.server_version = Some(ack.prog_version);
        state
    }

    /// Return session fields to their post-login defaults.
    ///
    /// Idempotent. The protocol version and server identity are untouched.
    pub fn reset_to_defaults(&mut self) {
        self.database = None;
        self.language = DEFAULT_LANGUAGE.to_owned();
        self.charset = None;
        self.packet_size = DEFAULT_PACKET_SIZE as u32;
        self.collation = Bytes::new();
        self.in_transaction = false;
        self.transaction_descriptor = 0;
        self.spid = 0;
    }

    /// Parsed default collation, if the server sent one.
    #[must_use]
    pub fn collation(&self) -> Option<Collation> {
        Collation::from_bytes(&self.collation)
    }

    /// Encoding of server text that is not explicitly typed.
    ///
    /// UTF-16LE from TDS 7.1; before that the collation's locale decides,
    /// then the announced character set, then windows-1252.
    #[must_use]
    pub fn effective_encoding(&self) -> &'static Encoding {
        if self.tds_version.is_unicode() {
            return UTF_16LE;
        }
        if let Some(collation) = self.collation() {
            return collation.encoding();
        }
        self.charset
            .as_deref()
            .and_then(|label| Encoding::for_label(label.as_bytes()))
            .unwrap_or(WINDOWS_1252)
    }

    /// Server version as `major.minor.build`.
    #[must_use]
    pub fn server_version_string(&self) -> Option<String> {
        self.server_version.map(|v| {
            let [major, minor, hi, lo] = v.to_be_bytes();
            format!("{major}.{minor}.{}", u16::from_be_bytes([hi, lo]))
        })
    }
}

fn descriptor_from_bytes(raw: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let n = raw.len().min(8);
    buf[..n].copy_from_slice(&raw[..n]);
    u64::from_le_bytes(buf)
}
