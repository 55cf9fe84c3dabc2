//! Connection establishment: PreLogin, optional TLS, Login7.
//!
//! Runs on the caller's task before any driver exists, so it owns the
//! socket outright and exchanges whole messages through a
//! [`Connection`]. Any failure drops the socket before the error returns.

use std::future::Future;
use std::time::Duration;

use tds_codec::{Connection, Message};
use tds_protocol::packet::PacketType;
use tds_protocol::prelogin::PreLogin;
use tds_protocol::{Login7, LoginAck, ProtocolError, ServerMessage, SessionState, Token, TokenDispatcher};
use tds_tls::TlsConnector;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::state::{Lifecycle, LifecycleState};
use crate::transport::BoxedTransport;

/// A logged-in connection and the session it negotiated.
pub(crate) struct Established {
    pub(crate) connection: Connection<BoxedTransport>,
    pub(crate) session: SessionState,
}

/// Drive `transport` from `Disconnected` to `Ready`.
pub(crate) async fn establish(
    transport: BoxedTransport,
    config: &Config,
    lifecycle: &Lifecycle,
) -> Result<Established> {
    let login_timeout = config.timeouts.login_timeout;
    let mut connection = Connection::new(transport);

    let server = with_timeout(login_timeout, prelogin(&mut connection, config, lifecycle)).await?;
    tracing::debug!(
        encryption = ?server.encryption,
        server_version = server.server_version_string().as_deref(),
        "received prelogin response"
    );

    if config.encrypt.negotiate(server.encryption)? {
        lifecycle.advance(LifecycleState::TlsNegotiating)?;
        connection = with_timeout(config.timeouts.tls_timeout, upgrade(connection, config)).await?;
    }

    let session = with_timeout(login_timeout, login(&mut connection, config, lifecycle)).await?;
    connection.set_packet_size(session.packet_size as usize);
    lifecycle.advance(LifecycleState::Ready)?;
    tracing::info!(
        database = session.database.as_deref(),
        tds_version = %session.tds_version,
        packet_size = session.packet_size,
        "connection ready"
    );

    Ok(Established {
        connection,
        session,
    })
}

async fn with_timeout<T>(limit: Duration, fut: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| Error::ConnectionTimeout)?
}

async fn prelogin(
    connection: &mut Connection<BoxedTransport>,
    config: &Config,
    lifecycle: &Lifecycle,
) -> Result<PreLogin> {
    let mut request = PreLogin::new()
        .with_version(config.tds_version)
        .with_encryption(config.encrypt.to_level())
        .with_thread_id(std::process::id())
        .with_mars(false);
    if let Some(instance) = &config.instance {
        request = request.with_instance(instance.clone());
    }

    connection
        .send_message(PacketType::PreLogin, &request.encode(), false)
        .await?;
    lifecycle.advance(LifecycleState::PreLoginSent)?;

    let reply = expect_reply(connection.read_message().await?)?;
    let server = PreLogin::decode(&reply.payload)?;
    if server.mars {
        return Err(ProtocolError::InvalidField {
            field: "prelogin MARS",
            value: 1,
        }
        .into());
    }
    Ok(server)
}

async fn upgrade(
    connection: Connection<BoxedTransport>,
    config: &Config,
) -> Result<Connection<BoxedTransport>> {
    let packet_size = connection.packet_size();
    let transport = connection.into_inner()?;
    let connector = TlsConnector::new(config.tls.clone())?;
    let tls = connector.connect(transport, &config.host).await?;
    let transport: BoxedTransport = Box::new(tls);
    Ok(Connection::new(transport).with_packet_size(packet_size))
}

fn login7(config: &Config) -> Login7 {
    let hostname = if config.hostname.is_empty() {
        std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .unwrap_or_default()
    } else {
        config.hostname.clone()
    };

    let mut login = Login7::new()
        .with_tds_version(config.tds_version)
        .with_sql_auth(config.username.as_str(), config.password.as_str())
        .with_hostname(hostname)
        .with_app_name(config.application_name.as_str())
        .with_server_name(config.host.as_str())
        .with_packet_size(config.packet_size);
    if let Some(database) = &config.database {
        login = login.with_database(database.as_str());
    }
    login
}

async fn login(
    connection: &mut Connection<BoxedTransport>,
    config: &Config,
    lifecycle: &Lifecycle,
) -> Result<SessionState> {
    connection
        .send_message(PacketType::Tds7Login, &login7(config).encode(), false)
        .await?;
    lifecycle.advance(LifecycleState::LoginSent)?;

    let reply = expect_reply(connection.read_message().await?)?;
    let mut session = SessionState::new(config.tds_version);
    session.server_name = Some(config.host.clone());
    let outcome = process_login_response(reply, session, config.tds_version)?;

    if let Some((host, port)) = &outcome.routing {
        tracing::warn!(host = %host, port, "server requested routing; not followed");
    }
    Ok(outcome.session)
}

/// Session after a successful login.
#[derive(Debug)]
struct LoginOutcome {
    session: SessionState,
    routing: Option<(String, u16)>,
}

/// Walk the login response tokens.
///
/// Success needs a LOGINACK and no error that ends the login. When the
/// server refuses, its first error message becomes the failure text.
fn process_login_response(
    reply: Message,
    mut session: SessionState,
    version: tds_protocol::TdsVersion,
) -> Result<LoginOutcome> {
    let mut dispatcher = TokenDispatcher::new(version);
    let mut buf = reply.payload;
    let mut ack: Option<LoginAck> = None;
    let mut error: Option<ServerMessage> = None;

    while let Some(token) = dispatcher.parse_next(&mut buf)? {
        match token {
            Token::LoginAck(login_ack) => {
                // Later tokens use the version the server agreed to.
                dispatcher.set_version(login_ack.tds_version);
                ack = Some(login_ack);
            }
            Token::EnvChange(change) => {
                tracing::debug!(env_type = ?change.env_type, "login environment change");
                session = SessionState::apply(&change, session);
            }
            Token::Error(msg) => {
                tracing::debug!(number = msg.number, class = msg.class, message = %msg.message, "login error");
                error.get_or_insert(msg);
            }
            Token::Info(msg) => {
                tracing::info!(number = msg.number, message = %msg.message, "server message");
            }
            Token::Done(done) if done.has_error() && ack.is_none() => {
                tracing::debug!("login done with error status");
            }
            _ => {}
        }
    }

    match (ack, error) {
        (Some(ack), None) => {
            tracing::info!(
                server = %ack.prog_name,
                tds_version = %ack.tds_version,
                "login acknowledged"
            );
            let routing = session.routing.clone();
            Ok(LoginOutcome {
                session: SessionState::apply_login_ack(&ack, session),
                routing,
            })
        }
        (_, Some(msg)) => Err(Error::LoginFailed(format!(
            "{} (error {}, severity {}, state {})",
            msg.message, msg.number, msg.class, msg.state
        ))),
        (None, None) => Err(Error::LoginFailed(
            "server ended the login response without LOGINACK".into(),
        )),
    }
}

fn expect_reply(message: Message) -> Result<Message> {
    if message.packet_type != PacketType::TabularResult {
        return Err(ProtocolError::InvalidPacketType(message.packet_type as u8).into());
    }
    Ok(message)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bytes::{Bytes, BytesMut};
    use tds_protocol::packet::PacketStatus;
    use tds_protocol::{Done, EnvChange, EnvChangeType, TdsVersion, TokenType};

    fn reply(payload: BytesMut) -> Message {
        Message {
            packet_type: PacketType::TabularResult,
            status: PacketStatus::NORMAL,
            payload: payload.freeze(),
        }
    }

    fn ack(version: TdsVersion) -> LoginAck {
        LoginAck {
            interface: 1,
            tds_version: version,
            prog_name: "Microsoft SQL Server".into(),
            prog_version: 0x1000_0FA0,
        }
    }

    #[test]
    fn test_login_ack_and_env_changes() {
        let mut buf = BytesMut::new();
        EnvChange::text(EnvChangeType::Database, "master", "").encode(&mut buf);
        EnvChange::text(EnvChangeType::PacketSize, "8192", "4096").encode(&mut buf);
        ack(TdsVersion::V7_4).encode(&mut buf);
        Done::new(None).encode(&mut buf, TokenType::Done, TdsVersion::V7_4);

        let outcome =
            process_login_response(reply(buf), SessionState::new(TdsVersion::V7_4), TdsVersion::V7_4)
                .unwrap();
        assert_eq!(outcome.session.database.as_deref(), Some("master"));
        assert_eq!(outcome.session.packet_size, 8192);
        assert_eq!(outcome.session.server_program.as_deref(), Some("Microsoft SQL Server"));
        assert!(outcome.routing.is_none());
    }

    #[test]
    fn test_server_downgrades_version() {
        let mut buf = BytesMut::new();
        ack(TdsVersion::V7_1).encode(&mut buf);
        // Narrow row count once the server settled on 7.1.
        Done::new(None).encode(&mut buf, TokenType::Done, TdsVersion::V7_1);

        let outcome =
            process_login_response(reply(buf), SessionState::new(TdsVersion::V7_4), TdsVersion::V7_4)
                .unwrap();
        assert_eq!(outcome.session.tds_version, TdsVersion::V7_1);
    }

    #[test]
    fn test_login_error_is_reported() {
        let mut buf = BytesMut::new();
        ServerMessage::new(18456, 14, "Login failed for user 'sa'.").encode(
            &mut buf,
            TokenType::Error,
            TdsVersion::V7_4,
        );
        Done::new(None)
            .with_status(tds_protocol::DoneStatus::ERROR)
            .encode(&mut buf, TokenType::Done, TdsVersion::V7_4);

        let err =
            process_login_response(reply(buf), SessionState::default(), TdsVersion::V7_4).unwrap_err();
        assert!(matches!(&err, Error::LoginFailed(text) if text.contains("Login failed for user 'sa'.")));
        assert!(err.to_string().contains("18456"));
    }

    #[test]
    fn test_missing_login_ack() {
        let mut buf = BytesMut::new();
        Done::new(None).encode(&mut buf, TokenType::Done, TdsVersion::V7_4);
        assert!(matches!(
            process_login_response(reply(buf), SessionState::default(), TdsVersion::V7_4),
            Err(Error::LoginFailed(_))
        ));
    }

    #[test]
    fn test_unexpected_reply_type() {
        let message = Message {
            packet_type: PacketType::SqlBatch,
            status: PacketStatus::NORMAL,
            payload: Bytes::new(),
        };
        assert!(matches!(expect_reply(message), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_login7_defaults() {
        let config = Config::new()
            .credentials("sa", "secret")
            .database("app")
            .hostname("ws1");
        let decoded = Login7::decode(&login7(&config).encode()).unwrap();
        assert_eq!(decoded.database, "app");
        assert_eq!(decoded.hostname, "ws1");
        assert_eq!(decoded.username, "sa");
        assert_eq!(decoded.password, "secret");
    }
}
