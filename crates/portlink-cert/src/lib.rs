//! On-demand TLS provisioning for proxy hops.
//!
//! Builds client and server `rustls` configurations around ephemeral
//! self-signed certificates, so links can offer transparent encryption
//! without a pre-existing PKI. See [`verify`] for the trust model.

use std::sync::Arc;

use portlink_config::TlsMode;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ServerConfig, SupportedProtocolVersion};
use thiserror::Error;

pub mod self_signed;
pub mod verify;

pub use self_signed::{generate_certificate, ProvisionedCert};
pub use verify::{AcceptAnyClientCert, SkipServerVerification};

#[derive(Debug, Error)]
pub enum CertError {
    #[error("certificate generation failed: {0}")]
    Generation(String),

    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("invalid SNI server name {0:?}")]
    InvalidServerName(String),
}

/// Client-side TLS material for one backend hop: the configuration plus
/// the SNI name to present at connect time.
#[derive(Clone)]
pub struct ClientTls {
    pub config: Arc<ClientConfig>,
    pub server_name: ServerName<'static>,
}

/// Minimum-version floor for a TLS mode. The maximum is always the
/// highest supported version.
fn protocol_versions(mode: TlsMode) -> &'static [&'static SupportedProtocolVersion] {
    static TLS12_FLOOR: &[&SupportedProtocolVersion] =
        &[&rustls::version::TLS12, &rustls::version::TLS13];
    static TLS13_FLOOR: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];
    match mode {
        TlsMode::Tls12 => TLS12_FLOOR,
        // TLS1.3 and anything unrecognized floor at 1.3.
        _ => TLS13_FLOOR,
    }
}

fn crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Server configuration for client-facing TLS termination on `address`.
///
/// A fresh certificate is generated per call and installed as the sole
/// server certificate. Client certificates are requested but never
/// required: this is opportunistic encryption, not client authentication.
pub fn server_config(address: &str, mode: TlsMode) -> Result<Arc<ServerConfig>, CertError> {
    let cert = generate_certificate(address)?;

    let config = ServerConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(protocol_versions(mode))?
        .with_client_cert_verifier(Arc::new(AcceptAnyClientCert))
        .with_single_cert(vec![cert.cert_der], cert.key_der)?;

    Ok(Arc::new(config))
}

/// Client configuration for TLS origination toward a backend.
///
/// `server_name` is the SNI name presented to the backend; `local_address`
/// is asserted as the identity of the client's own ephemeral certificate.
/// Backend certificate verification is disabled: the proxy trusts
/// whatever certificate the backend presents (see [`verify`]).
pub fn client_config(
    server_name: &str,
    local_address: &str,
    mode: TlsMode,
) -> Result<ClientTls, CertError> {
    let cert = generate_certificate(local_address)?;

    let config = ClientConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(protocol_versions(mode))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        .with_client_auth_cert(vec![cert.cert_der], cert.key_der)?;

    let server_name = ServerName::try_from(server_name.to_string())
        .map_err(|_| CertError::InvalidServerName(server_name.to_string()))?;

    Ok(ClientTls {
        config: Arc::new(config),
        server_name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_builds_for_each_mode() {
        assert!(server_config("127.0.0.1", TlsMode::Tls12).is_ok());
        assert!(server_config("127.0.0.1", TlsMode::Tls13).is_ok());
        assert!(server_config("0.0.0.0", TlsMode::Tls13).is_ok());
    }

    #[test]
    fn test_client_config_builds_with_ip_and_hostname_sni() {
        let by_ip = client_config("10.0.0.1", "127.0.0.1", TlsMode::Tls13).unwrap();
        assert!(matches!(by_ip.server_name, ServerName::IpAddress(_)));

        let by_name = client_config("backend.internal", "127.0.0.1", TlsMode::Tls12).unwrap();
        assert!(matches!(by_name.server_name, ServerName::DnsName(_)));
    }

    #[test]
    fn test_version_floor_mapping() {
        assert_eq!(protocol_versions(TlsMode::Tls12).len(), 2);
        assert_eq!(protocol_versions(TlsMode::Tls13).len(), 1);
        // NULL never reaches the provisioner, but the floor stays 1.3.
        assert_eq!(protocol_versions(TlsMode::Null).len(), 1);
    }
}
