//! rustls client configuration and the connect entry point.

use std::io;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsConnector as TokioTlsConnector;

use crate::config::TlsConfig;
use crate::error::TlsError;
use crate::handshake::PreLoginFraming;

/// An established TLS session over a TDS transport.
pub type TlsStream<S> = tokio_rustls::client::TlsStream<PreLoginFraming<S>>;

/// Accepts any server certificate. Handshake signatures are still checked.
#[derive(Debug)]
struct TrustingVerifier {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for TrustingVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Builds TLS sessions for TDS connections.
#[derive(Clone)]
pub struct TlsConnector {
    config: TlsConfig,
    client_config: Arc<ClientConfig>,
}

impl TlsConnector {
    /// Build a connector from `config`.
    pub fn new(config: TlsConfig) -> Result<Self, TlsError> {
        let client_config = Arc::new(build_client_config(&config)?);
        Ok(Self {
            config,
            client_config,
        })
    }

    /// The configuration this connector was built from.
    #[must_use]
    pub fn config(&self) -> &TlsConfig {
        &self.config
    }

    /// The name presented for SNI and certificate validation.
    ///
    /// A configured server name overrides `host`.
    pub fn server_name(&self, host: &str) -> Result<ServerName<'static>, TlsError> {
        let name = self.config.server_name.as_deref().unwrap_or(host);
        ServerName::try_from(name.to_owned()).map_err(|_| TlsError::InvalidServerName(name.to_owned()))
    }

    /// Negotiate TLS inside PreLogin packets over `stream`.
    ///
    /// The returned stream encrypts everything written to it; its framing
    /// layer has already switched to pass-through.
    pub async fn connect<S>(&self, stream: S, host: &str) -> Result<TlsStream<S>, TlsError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let server_name = self.server_name(host)?;
        tracing::debug!(host, "performing TLS handshake");

        let connector = TokioTlsConnector::from(Arc::clone(&self.client_config));
        let mut tls = connector
            .connect(server_name, PreLoginFraming::new(stream))
            .await
            .map_err(handshake_error)?;

        let (framing, session) = tls.get_mut();
        framing.handshake_complete();
        tracing::debug!(
            version = ?session.protocol_version(),
            "TLS handshake complete"
        );
        Ok(tls)
    }
}

/// Recover the typed error tokio-rustls wrapped in an `io::Error`.
fn handshake_error(err: io::Error) -> TlsError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        return TlsError::ConnectionClosed;
    }
    let err = match err.downcast::<TlsError>() {
        Ok(tls) => return tls,
        Err(err) => err,
    };
    match err.downcast::<rustls::Error>() {
        Ok(rustls) => TlsError::Rustls(rustls),
        Err(err) => TlsError::Io(err),
    }
}

impl std::fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConnector")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn build_client_config(config: &TlsConfig) -> Result<ClientConfig, TlsError> {
    let versions = config.protocol_versions();
    if versions.is_empty() {
        return Err(TlsError::Configuration(
            "minimum TLS version is above the maximum".into(),
        ));
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_protocol_versions(&versions)?;

    if config.trust_server_certificate {
        tracing::warn!(
            "trust_server_certificate is enabled; server certificates are not validated"
        );
        return Ok(builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(TrustingVerifier { provider }))
            .with_no_client_auth());
    }

    Ok(builder
        .with_root_certificates(build_root_store(config)?)
        .with_no_client_auth())
}

fn build_root_store(config: &TlsConfig) -> Result<RootCertStore, TlsError> {
    if config.root_certificates.is_empty() {
        return Ok(RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        });
    }

    let mut store = RootCertStore::empty();
    for cert in &config.root_certificates {
        store
            .add(cert.clone())
            .map_err(|e| TlsError::InvalidCertificate(e.to_string()))?;
    }
    Ok(store)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::TlsVersion;

    #[test]
    fn test_default_config() {
        assert!(TlsConnector::new(TlsConfig::default()).is_ok());
    }

    #[test]
    fn test_trust_server_certificate() {
        let connector = TlsConnector::new(TlsConfig::new().trust_server_certificate(true)).unwrap();
        assert!(connector.config().trust_server_certificate);
        assert!(connector.server_name("db.internal").is_ok());
    }

    #[test]
    fn test_invalid_root_certificate() {
        let config = TlsConfig::new().add_root_certificate(CertificateDer::from(vec![1, 2, 3]));
        assert!(matches!(
            TlsConnector::new(config),
            Err(TlsError::InvalidCertificate(_))
        ));
    }

    #[test]
    fn test_empty_version_range() {
        let config = TlsConfig::new()
            .min_protocol_version(TlsVersion::Tls13)
            .max_protocol_version(TlsVersion::Tls12);
        assert!(matches!(
            TlsConnector::new(config),
            Err(TlsError::Configuration(_))
        ));
    }

    #[test]
    fn test_server_name_override() {
        let connector =
            TlsConnector::new(TlsConfig::new().with_server_name("sql.example.com")).unwrap();
        assert_eq!(
            connector.server_name("not a valid name!").unwrap(),
            ServerName::try_from("sql.example.com").unwrap()
        );

        let plain = TlsConnector::new(TlsConfig::new()).unwrap();
        assert!(matches!(
            plain.server_name("not a valid name!"),
            Err(TlsError::InvalidServerName(_))
        ));
    }

    #[test]
    fn test_handshake_error_mapping() {
        assert!(matches!(
            handshake_error(io::Error::new(io::ErrorKind::UnexpectedEof, "tls handshake eof")),
            TlsError::ConnectionClosed
        ));
        assert!(matches!(
            handshake_error(io::Error::new(
                io::ErrorKind::InvalidData,
                TlsError::UnexpectedPacket(0x04)
            )),
            TlsError::UnexpectedPacket(0x04)
        ));
        assert!(matches!(
            handshake_error(io::Error::new(
                io::ErrorKind::InvalidData,
                rustls::Error::DecryptError
            )),
            TlsError::Rustls(rustls::Error::DecryptError)
        ));
        assert!(matches!(
            handshake_error(io::ErrorKind::ConnectionReset.into()),
            TlsError::Io(_)
        ));
    }
}
