//! Mock TDS server for unit testing.
//!
//! This module provides a scripted SQL Server stand-in that can be used
//! for testing without a real database instance.
//!
//! ## Features
//!
//! - Answers PreLogin (without TLS) and Login7
//! - Configurable responses keyed by SQL text
//! - Multi-result responses, errors, raw token streams
//! - Requests that only end on attention, for cancellation tests
//! - A log of every request received, including its reset bit
//! - Reset requests answered with the reset-connection ENVCHANGE
//!
//! ## Example
//!
//! ```rust,ignore
//! use tds_testing::mock_server::{MockTdsServer, MockResponse};
//!
//! #[tokio::test]
//! async fn test_query() {
//!     let server = MockTdsServer::builder()
//!         .with_response("SELECT 1", MockResponse::scalar_int(1))
//!         .build()
//!         .await
//!         .unwrap();
//!
//!     let addr = server.addr();
//!     // Connect your client to addr...
//! }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tds_codec::{CodecError, Connection, Message};
use tds_protocol::{
    ColMetaData, ColumnMeta, Done, DoneStatus, EncryptionLevel, EnvChange, EnvChangeType, Login7,
    LoginAck, PacketStatus, PacketType, PreLogin, RowData, ServerMessage, SqlBatch, TdsVersion,
    TokenType, TypeId,
};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Error type for mock server operations.
#[derive(Debug, Error)]
pub enum MockServerError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Framing error.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl From<tds_protocol::ProtocolError> for MockServerError {
    fn from(e: tds_protocol::ProtocolError) -> Self {
        Self::Protocol(e.to_string())
    }
}

/// Result type for mock server operations.
pub type Result<T> = std::result::Result<T, MockServerError>;

/// Mock response configuration.
#[derive(Clone)]
pub enum MockResponse {
    /// Return multiple rows with columns.
    Rows {
        /// Column definitions.
        columns: Vec<MockColumn>,
        /// Row data.
        rows: Vec<Vec<ScalarValue>>,
    },

    /// Return an error, then a Done with the error bit.
    Error {
        /// Error number.
        number: i32,
        /// Error message.
        message: String,
        /// Severity class.
        severity: u8,
    },

    /// Return rows affected count (for INSERT/UPDATE/DELETE).
    RowsAffected(u64),

    /// Switch the session database.
    UseDatabase(String),

    /// Several results in one response, chained with the more bit.
    Results(Vec<MockResponse>),

    /// Return raw pre-encoded TDS tokens.
    Raw(Bytes),

    /// Send nothing until the client sends attention.
    Hang,

    /// Close the connection without answering.
    Disconnect,

    /// Execute a custom handler.
    Custom(Arc<dyn Fn(&str) -> MockResponse + Send + Sync>),
}

impl fmt::Debug for MockResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rows { columns, rows } => f
                .debug_struct("Rows")
                .field("columns", columns)
                .field("rows", rows)
                .finish(),
            Self::Error {
                number,
                message,
                severity,
            } => f
                .debug_struct("Error")
                .field("number", number)
                .field("message", message)
                .field("severity", severity)
                .finish(),
            Self::RowsAffected(n) => f.debug_tuple("RowsAffected").field(n).finish(),
            Self::UseDatabase(db) => f.debug_tuple("UseDatabase").field(db).finish(),
            Self::Results(parts) => f.debug_tuple("Results").field(parts).finish(),
            Self::Raw(data) => f.debug_tuple("Raw").field(&data.len()).finish(),
            Self::Hang => f.write_str("Hang"),
            Self::Disconnect => f.write_str("Disconnect"),
            Self::Custom(_) => f.debug_tuple("Custom").field(&"<fn>").finish(),
        }
    }
}

impl MockResponse {
    /// Create a scalar integer response.
    pub fn scalar_int(value: i32) -> Self {
        Self::rows(vec![MockColumn::int("")], vec![vec![ScalarValue::Int(value)]])
    }

    /// Create a scalar string response.
    pub fn scalar_string(value: impl Into<String>) -> Self {
        Self::rows(
            vec![MockColumn::nvarchar("", 4000)],
            vec![vec![ScalarValue::String(value.into())]],
        )
    }

    /// Create an empty result response.
    pub fn empty() -> Self {
        Self::RowsAffected(0)
    }

    /// Create a rows affected response.
    pub fn affected(count: u64) -> Self {
        Self::RowsAffected(count)
    }

    /// Create an error response with severity 16.
    pub fn error(number: i32, message: impl Into<String>) -> Self {
        Self::error_with_severity(number, 16, message)
    }

    /// Create an error response with the given severity.
    pub fn error_with_severity(number: i32, severity: u8, message: impl Into<String>) -> Self {
        Self::Error {
            number,
            message: message.into(),
            severity,
        }
    }

    /// Create a multi-row response.
    pub fn rows(columns: Vec<MockColumn>, rows: Vec<Vec<ScalarValue>>) -> Self {
        Self::Rows { columns, rows }
    }

    /// Create a multi-result response.
    pub fn results(parts: Vec<MockResponse>) -> Self {
        Self::Results(parts)
    }
}

/// Scalar value for mock responses.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    /// NULL value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// 32-bit integer.
    Int(i32),
    /// 64-bit integer.
    BigInt(i64),
    /// 32-bit float.
    Float(f32),
    /// 64-bit float.
    Double(f64),
    /// String value.
    String(String),
    /// Binary data.
    Binary(Vec<u8>),
}

impl ScalarValue {
    /// Raw column bytes as they appear in row data; `None` for NULL.
    pub fn to_wire(&self) -> Option<Bytes> {
        match self {
            Self::Null => None,
            Self::Bool(b) => Some(Bytes::copy_from_slice(&[u8::from(*b)])),
            Self::Int(v) => Some(Bytes::copy_from_slice(&v.to_le_bytes())),
            Self::BigInt(v) => Some(Bytes::copy_from_slice(&v.to_le_bytes())),
            Self::Float(v) => Some(Bytes::copy_from_slice(&v.to_le_bytes())),
            Self::Double(v) => Some(Bytes::copy_from_slice(&v.to_le_bytes())),
            Self::String(s) => Some(s.encode_utf16().flat_map(u16::to_le_bytes).collect()),
            Self::Binary(b) => Some(Bytes::copy_from_slice(b)),
        }
    }
}

/// Column definition for mock results.
#[derive(Debug, Clone)]
pub struct MockColumn {
    /// Column name.
    pub name: String,
    /// TDS type ID.
    pub type_id: TypeId,
    /// Maximum length in bytes.
    pub max_length: u32,
    /// Nullable flag.
    pub nullable: bool,
}

impl MockColumn {
    /// Create a new column definition.
    pub fn new(name: impl Into<String>, type_id: TypeId, max_length: u32) -> Self {
        Self {
            name: name.into(),
            type_id,
            max_length,
            nullable: true,
        }
    }

    /// Create an INT column.
    pub fn int(name: impl Into<String>) -> Self {
        Self::new(name, TypeId::IntN, 4)
    }

    /// Create a BIGINT column.
    pub fn bigint(name: impl Into<String>) -> Self {
        Self::new(name, TypeId::IntN, 8)
    }

    /// Create a BIT column.
    pub fn bit(name: impl Into<String>) -> Self {
        Self::new(name, TypeId::BitN, 1)
    }

    /// Create an NVARCHAR column holding up to `max_chars` characters.
    pub fn nvarchar(name: impl Into<String>, max_chars: u32) -> Self {
        Self::new(name, TypeId::NVarChar, max_chars * 2)
    }

    /// Create a VARBINARY column.
    pub fn varbinary(name: impl Into<String>, max_len: u32) -> Self {
        Self::new(name, TypeId::BigVarBinary, max_len)
    }

    /// Set nullable flag.
    pub fn with_nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    fn to_meta(&self) -> ColumnMeta {
        let mut meta = ColumnMeta::new(self.name.as_str(), self.type_id).with_max_length(self.max_length);
        if !self.nullable {
            meta.flags.remove(tds_protocol::ColumnFlags::NULLABLE);
        }
        meta
    }
}

/// A request as the mock server received it.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    /// Message type.
    pub packet_type: PacketType,
    /// Status bits of the first packet.
    pub status: PacketStatus,
    /// Batch text, for SQL batches.
    pub sql: Option<String>,
    /// Transaction descriptor, for SQL batches.
    pub transaction_descriptor: Option<u64>,
}

impl RecordedRequest {
    /// Whether the client asked for a session reset.
    pub fn reset_requested(&self) -> bool {
        self.status.contains(PacketStatus::RESET_CONNECTION)
    }
}

/// Shared log of requests received across connections.
#[derive(Debug, Clone, Default)]
pub struct RequestLog {
    inner: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl RequestLog {
    fn record(&self, request: RecordedRequest) {
        self.inner.lock().push(request);
    }

    /// Snapshot of the requests so far.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.inner.lock().clone()
    }

    /// Number of attention signals received.
    pub fn attention_count(&self) -> usize {
        self.inner
            .lock()
            .iter()
            .filter(|r| r.packet_type == PacketType::Attention)
            .count()
    }
}

/// Configuration for the mock TDS server.
pub struct MockServerConfig {
    /// Responses keyed by upper-cased, trimmed SQL text.
    responses: HashMap<String, MockResponse>,
    /// Response for unmatched batches and for RPC requests.
    default_response: MockResponse,
    /// Server name to report in LoginAck.
    server_name: String,
    /// Highest TDS version to accept.
    tds_version: TdsVersion,
    /// Database to report when the client names none.
    database: String,
    /// PreLogin encryption answer.
    encryption: EncryptionLevel,
    /// Answer PreLogin with MARS on.
    mars: bool,
    /// Refuse logins with this error.
    login_error: Option<(i32, String)>,
}

impl Default for MockServerConfig {
    fn default() -> Self {
        Self {
            responses: HashMap::new(),
            default_response: MockResponse::empty(),
            server_name: "MockSQLServer".to_string(),
            tds_version: TdsVersion::V7_4,
            database: "master".to_string(),
            encryption: EncryptionLevel::Off,
            mars: false,
            login_error: None,
        }
    }
}

/// Builder for `MockTdsServer`.
#[derive(Default)]
pub struct MockServerBuilder {
    config: MockServerConfig,
}

impl MockServerBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a response for a specific SQL query.
    pub fn with_response(mut self, sql: impl Into<String>, response: MockResponse) -> Self {
        self.config.responses.insert(normalize(&sql.into()), response);
        self
    }

    /// Set the default response for unmatched queries and RPC requests.
    pub fn with_default_response(mut self, response: MockResponse) -> Self {
        self.config.default_response = response;
        self
    }

    /// Set the server name reported in LoginAck.
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.config.server_name = name.into();
        self
    }

    /// Set the default database.
    pub fn with_database(mut self, db: impl Into<String>) -> Self {
        self.config.database = db.into();
        self
    }

    /// Set the highest TDS version the server accepts.
    pub fn with_tds_version(mut self, version: TdsVersion) -> Self {
        self.config.tds_version = version;
        self
    }

    /// Set the encryption level answered in PreLogin.
    pub fn with_encryption(mut self, level: EncryptionLevel) -> Self {
        self.config.encryption = level;
        self
    }

    /// Answer PreLogin with MARS enabled whatever the client asked for.
    pub fn with_mars(mut self, enabled: bool) -> Self {
        self.config.mars = enabled;
        self
    }

    /// Refuse every login with the given error.
    pub fn with_login_error(mut self, number: i32, message: impl Into<String>) -> Self {
        self.config.login_error = Some((number, message.into()));
        self
    }

    /// Build and start the mock server.
    pub async fn build(self) -> Result<MockTdsServer> {
        MockTdsServer::start(self.config).await
    }

    /// Serve a single connection over an in-memory pipe.
    ///
    /// Returns the client end and the request log.
    pub fn build_duplex(self) -> (DuplexStream, RequestLog) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let log = RequestLog::default();
        let config = Arc::new(self.config);
        let server_log = log.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(server, config, server_log).await {
                tracing::debug!("Connection error: {}", e);
            }
        });
        (client, log)
    }
}

/// A mock TDS server for testing.
///
/// This server simulates a SQL Server instance for unit testing purposes.
/// It handles the TDS handshake and responds to requests based on
/// pre-configured responses.
pub struct MockTdsServer {
    /// Server address.
    addr: SocketAddr,
    /// Shutdown signal sender.
    shutdown_tx: broadcast::Sender<()>,
    /// Requests received on every connection.
    log: RequestLog,
    /// Connection count.
    connection_count: Arc<Mutex<usize>>,
}

impl MockTdsServer {
    /// Create a new builder for the mock server.
    pub fn builder() -> MockServerBuilder {
        MockServerBuilder::new()
    }

    /// Start the mock server on an available port.
    pub async fn start(config: MockServerConfig) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, _) = broadcast::channel(1);
        let config = Arc::new(config);
        let connection_count = Arc::new(Mutex::new(0usize));
        let log = RequestLog::default();

        let server = Self {
            addr,
            shutdown_tx: shutdown_tx.clone(),
            log: log.clone(),
            connection_count: connection_count.clone(),
        };

        // Spawn the accept loop
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, _peer_addr)) => {
                                let config = config.clone();
                                let count = connection_count.clone();
                                let log = log.clone();
                                tokio::spawn(async move {
                                    *count.lock() += 1;
                                    if let Err(e) = handle_connection(stream, config, log).await {
                                        tracing::debug!("Connection error: {}", e);
                                    }
                                    let mut c = count.lock();
                                    *c = c.saturating_sub(1);
                                });
                            }
                            Err(e) => {
                                tracing::error!("Accept error: {}", e);
                                break;
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        });

        Ok(server)
    }

    /// Get the server's listening address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the host string for connection configuration.
    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    /// Get the port number.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Get the current connection count.
    pub fn connection_count(&self) -> usize {
        *self.connection_count.lock()
    }

    /// Requests received so far.
    pub fn log(&self) -> &RequestLog {
        &self.log
    }

    /// Stop accepting connections.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

impl Drop for MockTdsServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// What to do after a request.
enum Reply {
    Send(Bytes),
    Hang,
    Disconnect,
}

/// Serve one client connection until it disconnects.
pub async fn handle_connection<S>(
    stream: S,
    config: Arc<MockServerConfig>,
    log: RequestLog,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut conn = Connection::new(stream);

    // Step 1: PRELOGIN
    let prelogin = conn.read_message().await?;
    expect_type(&prelogin, PacketType::PreLogin)?;
    let request = PreLogin::decode(&prelogin.payload)?;
    let answer = PreLogin::new()
        .with_version(config.tds_version)
        .with_encryption(config.encryption)
        .with_mars(config.mars || request.mars);
    conn.send_message(PacketType::TabularResult, &answer.encode(), false)
        .await?;

    // Step 2: LOGIN7
    let login = conn.read_message().await?;
    expect_type(&login, PacketType::Tds7Login)?;
    let login = Login7::decode(&login.payload)?;
    let version = if login.tds_version.at_least(config.tds_version) {
        config.tds_version
    } else {
        login.tds_version
    };
    let (reply, accepted) = login_response(&login, &config, version);
    conn.send_message(PacketType::TabularResult, &reply, false)
        .await?;
    if !accepted {
        return Ok(());
    }
    conn.set_packet_size(login.packet_size as usize);

    // Step 3: requests
    let login_database = if login.database.is_empty() {
        config.database.clone()
    } else {
        login.database.clone()
    };
    let mut database = login_database.clone();
    loop {
        let message = match conn.read_message().await {
            Ok(message) => message,
            // Client disconnected
            Err(CodecError::ConnectionClosed) => break,
            Err(e) => return Err(e.into()),
        };

        let reset = message.packet_type != PacketType::Attention
            && message.status.intersects(
                PacketStatus::RESET_CONNECTION | PacketStatus::RESET_CONNECTION_KEEP_TRANSACTION,
            );
        if reset {
            database = login_database.clone();
        }

        let mut recorded = RecordedRequest {
            packet_type: message.packet_type,
            status: message.status,
            sql: None,
            transaction_descriptor: None,
        };

        let response = match message.packet_type {
            PacketType::SqlBatch => {
                let batch = SqlBatch::decode(&message.payload, version)?;
                recorded.sql = Some(batch.sql().to_string());
                recorded.transaction_descriptor = Some(batch.transaction_descriptor());
                log.record(recorded);
                find_response(batch.sql(), &config)
            }
            PacketType::Attention => {
                log.record(recorded);
                // Nothing left to cancel; acknowledge anyway.
                conn.send_message(PacketType::TabularResult, &attention_ack(version), false)
                    .await?;
                continue;
            }
            _ => {
                log.record(recorded);
                config.default_response.clone()
            }
        };

        match encode_response(&response, &mut database, version) {
            Reply::Send(tokens) if reset => {
                let mut reply = BytesMut::new();
                EnvChange::binary(EnvChangeType::ResetConnectionAck, &[], &[]).encode(&mut reply);
                reply.extend_from_slice(&tokens);
                conn.send_message(PacketType::TabularResult, &reply, false)
                    .await?
            }
            Reply::Send(tokens) => {
                conn.send_message(PacketType::TabularResult, &tokens, false)
                    .await?
            }
            Reply::Disconnect => return Ok(()),
            Reply::Hang => {
                let next = match conn.read_message().await {
                    Ok(next) => next,
                    Err(CodecError::ConnectionClosed) => break,
                    Err(e) => return Err(e.into()),
                };
                log.record(RecordedRequest {
                    packet_type: next.packet_type,
                    status: next.status,
                    sql: None,
                    transaction_descriptor: None,
                });
                expect_type(&next, PacketType::Attention)?;
                conn.send_message(PacketType::TabularResult, &attention_ack(version), false)
                    .await?;
            }
        }
    }

    Ok(())
}

fn expect_type(message: &Message, expected: PacketType) -> Result<()> {
    if message.packet_type != expected {
        return Err(MockServerError::Protocol(format!(
            "Expected {:?}, got {:?}",
            expected, message.packet_type
        )));
    }
    Ok(())
}

fn login_response(login: &Login7, config: &MockServerConfig, version: TdsVersion) -> (Bytes, bool) {
    let mut buf = BytesMut::new();

    if let Some((number, message)) = &config.login_error {
        let mut error = ServerMessage::new(*number, 14, message.as_str());
        error.server = config.server_name.clone();
        error.encode(&mut buf, TokenType::Error, version);
        Done::new(None)
            .with_status(DoneStatus::ERROR)
            .encode(&mut buf, TokenType::Done, version);
        return (buf.freeze(), false);
    }

    let database = if login.database.is_empty() {
        config.database.as_str()
    } else {
        login.database.as_str()
    };
    EnvChange::text(EnvChangeType::Database, database, "master").encode(&mut buf);
    EnvChange::text(
        EnvChangeType::PacketSize,
        &login.packet_size.to_string(),
        "4096",
    )
    .encode(&mut buf);
    LoginAck {
        interface: 1,
        tds_version: version,
        prog_name: config.server_name.clone(),
        prog_version: 0x1000_0FA0,
    }
    .encode(&mut buf);
    Done::new(None).encode(&mut buf, TokenType::Done, version);
    (buf.freeze(), true)
}

/// Normalize SQL for matching.
fn normalize(sql: &str) -> String {
    sql.trim().to_uppercase()
}

/// Find the response for a SQL query.
fn find_response(sql: &str, config: &MockServerConfig) -> MockResponse {
    let response = config
        .responses
        .get(&normalize(sql))
        .cloned()
        .unwrap_or_else(|| config.default_response.clone());
    match response {
        MockResponse::Custom(handler) => handler(sql),
        other => other,
    }
}

fn encode_response(response: &MockResponse, database: &mut String, version: TdsVersion) -> Reply {
    match response {
        MockResponse::Hang => Reply::Hang,
        MockResponse::Disconnect => Reply::Disconnect,
        _ => {
            let mut buf = BytesMut::new();
            encode_result(response, database, version, false, &mut buf);
            Reply::Send(buf.freeze())
        }
    }
}

/// Encode one result; `more` sets the more bit on its final Done.
fn encode_result(
    response: &MockResponse,
    database: &mut String,
    version: TdsVersion,
    more: bool,
    dst: &mut BytesMut,
) {
    let done = |count: Option<u64>, status: DoneStatus| {
        let done = Done::new(count).with_status(status);
        if more { done.with_more() } else { done }
    };

    match response {
        MockResponse::Rows { columns, rows } => {
            let meta = ColMetaData::new(columns.iter().map(MockColumn::to_meta).collect());
            meta.encode(dst);
            for row in rows {
                RowData {
                    values: row.iter().map(ScalarValue::to_wire).collect(),
                }
                .encode(dst, &meta);
            }
            done(Some(rows.len() as u64), DoneStatus::empty()).encode(dst, TokenType::Done, version);
        }
        MockResponse::Error {
            number,
            message,
            severity,
        } => {
            let mut error = ServerMessage::new(*number, *severity, message.as_str());
            error.server = "MockServer".to_string();
            error.encode(dst, TokenType::Error, version);
            done(None, DoneStatus::ERROR).encode(dst, TokenType::Done, version);
        }
        MockResponse::RowsAffected(count) => {
            done(Some(*count), DoneStatus::empty()).encode(dst, TokenType::Done, version);
        }
        MockResponse::UseDatabase(name) => {
            EnvChange::text(EnvChangeType::Database, name, database).encode(dst);
            *database = name.clone();
            done(None, DoneStatus::empty()).encode(dst, TokenType::Done, version);
        }
        MockResponse::Results(parts) => {
            for (i, part) in parts.iter().enumerate() {
                let last = i + 1 == parts.len();
                encode_result(part, database, version, more || !last, dst);
            }
        }
        MockResponse::Raw(data) => dst.extend_from_slice(data),
        // Control responses only make sense at the top level.
        MockResponse::Hang | MockResponse::Disconnect | MockResponse::Custom(_) => {
            done(None, DoneStatus::empty()).encode(dst, TokenType::Done, version);
        }
    }
}

fn attention_ack(version: TdsVersion) -> Bytes {
    let mut buf = BytesMut::new();
    Done::new(None)
        .with_status(DoneStatus::ATTN)
        .encode(&mut buf, TokenType::Done, version);
    buf.freeze()
}
