//! Ephemeral self-signed certificate generation.
//!
//! Links that enable TLS get a certificate minted on the spot instead of
//! operator-supplied PKI material. Certificates are held in memory only
//! and live as long as the link instance that requested them.

use std::net::IpAddr;

use rcgen::{CertificateParams, DistinguishedName, ExtendedKeyUsagePurpose, KeyUsagePurpose};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::CertError;

/// Certificate validity window in days.
const VALID_DAYS: i64 = 365;

/// A freshly generated certificate with its private key, in the DER forms
/// rustls consumes directly.
pub struct ProvisionedCert {
    pub cert_der: CertificateDer<'static>,
    pub key_der: PrivateKeyDer<'static>,
}

/// Generate a self-signed certificate asserting `address` as its identity.
///
/// Wildcard binds (`0.0.0.0`, `::`) substitute the loopback address in the
/// SAN, since a certificate cannot assert a wildcard IP as its own
/// identity. Hostnames become DNS SANs.
pub fn generate_certificate(address: &str) -> Result<ProvisionedCert, CertError> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(rcgen::DnType::CommonName, "Portlink App");
    dn.push(rcgen::DnType::OrganizationName, "Portlink App co.");
    dn.push(rcgen::DnType::OrganizationalUnitName, "Portlink App");
    params.distinguished_name = dn;

    let address = match address {
        "0.0.0.0" | "::" => "127.0.0.1",
        other => other,
    };
    params.subject_alt_names = vec![match address.parse::<IpAddr>() {
        Ok(ip) => rcgen::SanType::IpAddress(ip),
        Err(_) => rcgen::SanType::DnsName(
            rcgen::Ia5String::try_from(address)
                .map_err(|e| CertError::Generation(e.to_string()))?,
        ),
    }];

    let not_before = time::OffsetDateTime::now_utc();
    params.not_before = not_before;
    params.not_after = not_before + time::Duration::days(VALID_DAYS);

    params.serial_number = Some(rcgen::SerialNumber::from(rand::random::<u64>()));

    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let key_pair = rcgen::KeyPair::generate().map_err(|e| CertError::Generation(e.to_string()))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| CertError::Generation(e.to_string()))?;

    Ok(ProvisionedCert {
        cert_der: CertificateDer::from(cert.der().to_vec()),
        key_der: PrivateKeyDer::try_from(key_pair.serialize_der())
            .map_err(|e| CertError::Generation(format!("{e:?}")))?,
    })
}
