//! Self-signed certificate generation
//!
//! The public TLS listener terminates with a certificate nobody else vouches
//! for; browsers reach it through the relay or a domain the operator fronts
//! with their own certificate.

use rcgen::{CertificateParams, DistinguishedName, DnType, Ia5String, KeyPair, SanType};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::{Duration, SystemTime};

use crate::CertError;

/// Validity of generated certificates (10 years)
pub const CERTIFICATE_VALIDITY: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// A self-signed certificate with its private key, both PEM encoded
#[derive(Debug, Clone)]
pub struct SelfSignedCertificate {
    pub pem_cert: String,
    pub pem_key: String,
}

/// Generate a certificate valid for localhost plus `extra_hostnames`
pub fn generate_self_signed_cert(
    extra_hostnames: &[String],
) -> Result<SelfSignedCertificate, CertError> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Cloudlink Server");
    dn.push(DnType::OrganizationName, "Cloudlink");
    params.distinguished_name = dn;

    let mut sans = vec![
        dns_name("localhost")?,
        SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        SanType::IpAddress(IpAddr::V6(Ipv6Addr::LOCALHOST)),
    ];
    for hostname in extra_hostnames {
        sans.push(dns_name(hostname)?);
    }
    params.subject_alt_names = sans;

    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_err(|e| CertError::Generation(e.to_string()))?;
    params.not_before = unix_to_offset(now)?;
    params.not_after = unix_to_offset(now + CERTIFICATE_VALIDITY)?;
    params.serial_number = Some(rcgen::SerialNumber::from(rand::random::<u64>()));

    let key_pair = KeyPair::generate().map_err(|e| CertError::Generation(e.to_string()))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| CertError::Generation(e.to_string()))?;

    Ok(SelfSignedCertificate {
        pem_cert: cert.pem(),
        pem_key: key_pair.serialize_pem(),
    })
}

fn dns_name(name: &str) -> Result<SanType, CertError> {
    Ia5String::try_from(name)
        .map(SanType::DnsName)
        .map_err(|e| CertError::Generation(format!("invalid hostname {}: {}", name, e)))
}

fn unix_to_offset(since_epoch: Duration) -> Result<time::OffsetDateTime, CertError> {
    time::OffsetDateTime::from_unix_timestamp(since_epoch.as_secs() as i64)
        .map_err(|e| CertError::Generation(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_self_signed_cert() {
        let cert = generate_self_signed_cert(&[]).unwrap();

        assert!(cert.pem_cert.contains("BEGIN CERTIFICATE"));
        assert!(cert.pem_key.contains("BEGIN PRIVATE KEY"));
    }

    #[test]
    fn test_extra_hostnames_accepted() {
        let cert = generate_self_signed_cert(&["cam.example.com".to_string()]).unwrap();
        assert!(!cert.pem_cert.is_empty());
    }

    #[test]
    fn test_invalid_hostname_rejected() {
        let result = generate_self_signed_cert(&["bad\u{e9}host".to_string()]);
        assert!(matches!(result, Err(CertError::Generation(_))));
    }
}
