//! TLS configuration options.

use rustls::pki_types::CertificateDer;

/// TLS configuration for a TDS connection.
#[derive(Clone, Debug)]
pub struct TlsConfig {
    /// Accept any server certificate.
    ///
    /// **Warning:** this disables certificate and host name validation.
    pub trust_server_certificate: bool,

    /// Root certificates to trust. Empty means the bundled web PKI roots.
    pub root_certificates: Vec<CertificateDer<'static>>,

    /// Name to validate the certificate against, if not the connection host.
    pub server_name: Option<String>,

    /// Minimum TLS version to accept.
    pub min_protocol_version: TlsVersion,

    /// Maximum TLS version to accept.
    pub max_protocol_version: TlsVersion,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            trust_server_certificate: false,
            root_certificates: Vec::new(),
            server_name: None,
            min_protocol_version: TlsVersion::Tls12,
            max_protocol_version: TlsVersion::Tls13,
        }
    }
}

impl TlsConfig {
    /// Default configuration: web PKI roots, TLS 1.2 through 1.3.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept any server certificate.
    #[must_use]
    pub fn trust_server_certificate(mut self, trust: bool) -> Self {
        self.trust_server_certificate = trust;
        self
    }

    /// Trust an additional root certificate.
    #[must_use]
    pub fn add_root_certificate(mut self, cert: CertificateDer<'static>) -> Self {
        self.root_certificates.push(cert);
        self
    }

    /// Validate the certificate against `name` instead of the host.
    #[must_use]
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    /// Set the minimum TLS version.
    #[must_use]
    pub fn min_protocol_version(mut self, version: TlsVersion) -> Self {
        self.min_protocol_version = version;
        self
    }

    /// Set the maximum TLS version.
    #[must_use]
    pub fn max_protocol_version(mut self, version: TlsVersion) -> Self {
        self.max_protocol_version = version;
        self
    }

    /// Protocol versions allowed by the min/max bounds, newest first.
    #[must_use]
    pub fn protocol_versions(&self) -> Vec<&'static rustls::SupportedProtocolVersion> {
        [TlsVersion::Tls13, TlsVersion::Tls12]
            .into_iter()
            .filter(|v| *v >= self.min_protocol_version && *v <= self.max_protocol_version)
            .map(TlsVersion::to_rustls)
            .collect()
    }
}

/// TLS protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum TlsVersion {
    /// TLS 1.2
    #[default]
    Tls12,
    /// TLS 1.3
    Tls13,
}

impl TlsVersion {
    /// The matching rustls protocol version.
    #[must_use]
    pub fn to_rustls(self) -> &'static rustls::SupportedProtocolVersion {
        match self {
            Self::Tls12 => &rustls::version::TLS12,
            Self::Tls13 => &rustls::version::TLS13,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_versions() {
        let config = TlsConfig::new();
        assert_eq!(config.protocol_versions().len(), 2);
        assert!(!config.trust_server_certificate);
    }

    #[test]
    fn test_tls13_only() {
        let config = TlsConfig::new().min_protocol_version(TlsVersion::Tls13);
        let versions = config.protocol_versions();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].version, rustls::ProtocolVersion::TLSv1_3);
    }

    #[test]
    fn test_inverted_bounds_allow_nothing() {
        let config = TlsConfig::new()
            .min_protocol_version(TlsVersion::Tls13)
            .max_protocol_version(TlsVersion::Tls12);
        assert!(config.protocol_versions().is_empty());
    }
}
