//! Client configuration.

use std::time::Duration;

use tds_protocol::packet::{DEFAULT_PACKET_SIZE, MAX_PACKET_SIZE, MIN_PACKET_SIZE};
use tds_protocol::prelogin::EncryptionLevel;
use tds_protocol::version::TdsVersion;
use tds_tls::TlsConfig;

use crate::error::Error;

/// Timeout configuration for the connection phases.
///
/// Only the handshake is bounded. Once the connection is ready, pacing is
/// up to the caller.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Time to establish TCP connection (default: 15s).
    pub connect_timeout: Duration,
    /// Time to complete TLS handshake (default: 10s).
    pub tls_timeout: Duration,
    /// Time to complete login sequence (default: 30s).
    pub login_timeout: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            tls_timeout: Duration::from_secs(10),
            login_timeout: Duration::from_secs(30),
        }
    }
}

impl TimeoutConfig {
    /// Create a new timeout configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the TCP connection timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the TLS handshake timeout.
    #[must_use]
    pub fn tls_timeout(mut self, timeout: Duration) -> Self {
        self.tls_timeout = timeout;
        self
    }

    /// Set the login sequence timeout.
    #[must_use]
    pub fn login_timeout(mut self, timeout: Duration) -> Self {
        self.login_timeout = timeout;
        self
    }
}

/// Encryption preference advertised in PreLogin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncryptMode {
    /// Encryption is available but not requested.
    Off,
    /// Encrypt the connection.
    #[default]
    On,
    /// Refuse to continue without encryption.
    Required,
    /// The client cannot encrypt.
    NotSupported,
}

impl EncryptMode {
    /// The PreLogin value for this mode.
    #[must_use]
    pub fn to_level(self) -> EncryptionLevel {
        match self {
            Self::Off => EncryptionLevel::Off,
            Self::On => EncryptionLevel::On,
            Self::Required => EncryptionLevel::Required,
            Self::NotSupported => EncryptionLevel::NotSupported,
        }
    }

    /// Decide whether to run TLS given the server's PreLogin answer.
    ///
    /// TLS runs when the server answers ON or REQUIRED. A client that asked
    /// for encryption cannot continue against a server without it, and a
    /// client that cannot encrypt cannot satisfy a server that insists.
    pub fn negotiate(self, server: EncryptionLevel) -> Result<bool, Error> {
        match (self, server) {
            (Self::NotSupported, level) if level.requires_tls() => Err(Error::Config(
                "server requires encryption but the client has it disabled".into(),
            )),
            (Self::On | Self::Required, EncryptionLevel::NotSupported) => Err(Error::Config(
                "encryption was requested but the server does not support it".into(),
            )),
            (_, level) => Ok(level.requires_tls()),
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" | "optional" => Some(Self::On),
            "false" | "no" | "0" => Some(Self::Off),
            "mandatory" | "required" => Some(Self::Required),
            "notsupported" | "not supported" | "disable" => Some(Self::NotSupported),
            _ => None,
        }
    }
}

/// Configuration for connecting to SQL Server.
///
/// This struct is marked `#[non_exhaustive]` to allow adding new fields
/// in future releases without breaking semver. Use [`Config::default()`]
/// or [`Config::from_connection_string()`] to construct instances.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Config {
    /// Server hostname or IP address.
    pub host: String,

    /// Server port (default: 1433).
    pub port: u16,

    /// Instance name (for named instances).
    pub instance: Option<String>,

    /// Database name.
    pub database: Option<String>,

    /// SQL login name.
    pub username: String,

    /// SQL login password.
    pub password: String,

    /// Application name (shown in SQL Server management tools).
    pub application_name: String,

    /// Client workstation name sent in Login7.
    pub hostname: String,

    /// Requested TDS packet size, within [512, 32767].
    pub packet_size: u32,

    /// Encryption preference.
    pub encrypt: EncryptMode,

    /// TLS configuration, used when encryption is negotiated.
    pub tls: TlsConfig,

    /// Requested TDS protocol version.
    ///
    /// The server may negotiate a lower version. TDS 8.0 strict
    /// encryption is not supported.
    pub tds_version: TdsVersion,

    /// Timeout configuration for the connection phases.
    pub timeouts: TimeoutConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1433,
            instance: None,
            database: None,
            username: String::new(),
            password: String::new(),
            application_name: "tds-engine".to_string(),
            hostname: String::new(),
            packet_size: DEFAULT_PACKET_SIZE as u32,
            encrypt: EncryptMode::default(),
            tls: TlsConfig::default(),
            tds_version: TdsVersion::V7_4,
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl Config {
    /// Create a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a connection string into configuration.
    ///
    /// Supports ADO.NET-style connection strings:
    /// ```text
    /// Server=localhost;Database=mydb;User Id=sa;Password=secret;
    /// ```
    pub fn from_connection_string(conn_str: &str) -> Result<Self, Error> {
        let mut config = Self::default();

        for part in conn_str.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| Error::Config(format!("invalid key-value: {part}")))?;

            let key = key.trim().to_lowercase();
            let value = value.trim();

            match key.as_str() {
                "server" | "data source" | "host" | "address" | "addr" => {
                    let value = value.strip_prefix("tcp:").unwrap_or(value);
                    // host,port or host\instance
                    if let Some((host, port)) = value.split_once(',') {
                        config.host = host.trim().to_string();
                        config.port = parse_number(port.trim(), "port")?;
                    } else if let Some((host, instance)) = value.split_once('\\') {
                        config.host = host.to_string();
                        config.instance = Some(instance.to_string());
                    } else {
                        config.host = value.to_string();
                    }
                }
                "port" => config.port = parse_number(value, "port")?,
                "database" | "initial catalog" => {
                    config.database = Some(value.to_string());
                }
                "user id" | "uid" | "user" => config.username = value.to_string(),
                "password" | "pwd" => config.password = value.to_string(),
                "application name" | "app" => config.application_name = value.to_string(),
                "workstation id" | "wsid" => config.hostname = value.to_string(),
                "connect timeout" | "connection timeout" | "timeout" => {
                    let secs: u64 = parse_number(value, "timeout")?;
                    config.timeouts.connect_timeout = Duration::from_secs(secs);
                }
                "login timeout" => {
                    let secs: u64 = parse_number(value, "timeout")?;
                    config.timeouts.login_timeout = Duration::from_secs(secs);
                }
                "trustservercertificate" | "trust server certificate" => {
                    config.tls = config.tls.trust_server_certificate(parse_bool(value)?);
                }
                "hostnameincertificate" | "host name in certificate" => {
                    config.tls = config.tls.with_server_name(value);
                }
                "encrypt" => {
                    if value.eq_ignore_ascii_case("strict") {
                        return Err(Error::Config(
                            "strict encryption (TDS 8.0) is not supported".into(),
                        ));
                    }
                    config.encrypt = EncryptMode::parse(value)
                        .ok_or_else(|| Error::Config(format!("invalid encrypt value: {value}")))?;
                }
                "multipleactiveresultsets" | "mars" => {
                    if parse_bool(value)? {
                        return Err(Error::Config(
                            "MARS is not supported; requests are pipelined instead".into(),
                        ));
                    }
                }
                "packet size" => {
                    let size: u32 = parse_number(value, "packet size")?;
                    config = config.packet_size(size);
                }
                "tdsversion" | "tds version" | "protocolversion" | "protocol version" => {
                    config.tds_version = TdsVersion::parse(value).ok_or_else(|| {
                        Error::Config(format!(
                            "invalid TDS version: {value}. Supported values: 7.0, 7.1, 7.2, 7.3, 7.3A, 7.3B, 7.4"
                        ))
                    })?;
                    if config.tds_version.is_tds_8() {
                        return Err(Error::Config(
                            "TDS 8.0 strict encryption is not supported".into(),
                        ));
                    }
                }
                _ => {
                    // Ignore unknown options for forward compatibility
                    tracing::debug!(key = key, "ignoring unknown connection string option");
                }
            }
        }

        Ok(config)
    }

    /// Set the server host.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the server port.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the instance name.
    #[must_use]
    pub fn instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    /// Set the database name.
    #[must_use]
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Set SQL authentication credentials.
    #[must_use]
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// Set the application name.
    #[must_use]
    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = name.into();
        self
    }

    /// Set the client workstation name.
    #[must_use]
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Set the requested packet size, clamped to [512, 32767].
    #[must_use]
    pub fn packet_size(mut self, size: u32) -> Self {
        let clamped = size.clamp(MIN_PACKET_SIZE as u32, MAX_PACKET_SIZE as u32);
        if clamped != size {
            tracing::warn!(requested = size, packet_size = clamped, "packet size clamped");
        }
        self.packet_size = clamped;
        self
    }

    /// Set the encryption preference.
    #[must_use]
    pub fn encrypt(mut self, mode: EncryptMode) -> Self {
        self.encrypt = mode;
        self
    }

    /// Set the TLS configuration.
    #[must_use]
    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }

    /// Set trust server certificate option.
    ///
    /// **Warning:** this disables certificate validation and should only be
    /// used for development/testing on trusted networks.
    #[must_use]
    pub fn trust_server_certificate(mut self, trust: bool) -> Self {
        self.tls = self.tls.trust_server_certificate(trust);
        self
    }

    /// Set the TDS protocol version.
    #[must_use]
    pub fn tds_version(mut self, version: TdsVersion) -> Self {
        self.tds_version = version;
        self
    }

    /// Set the timeout configuration.
    #[must_use]
    pub fn timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Check the settings that cannot be enforced by the setters alone.
    pub fn validate(&self) -> Result<(), Error> {
        if self.host.is_empty() {
            return Err(Error::Config("host is empty".into()));
        }
        if self.tds_version.is_tds_8() {
            return Err(Error::Config(
                "TDS 8.0 strict encryption is not supported".into(),
            ));
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(value: &str, what: &str) -> Result<T, Error> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("invalid {what}: {value}")))
}

fn parse_bool(value: &str) -> Result<bool, Error> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        _ => Err(Error::Config(format!("invalid boolean: {value}"))),
    }
}
