//! Certificate issuance helpers. Emulated machines only need certificates
//! that satisfy the protocol contracts, not production-grade PKI; everything
//! is ECDSA P-256 via rcgen.

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose,
};
use thiserror::Error;
use time::{Duration, OffsetDateTime};

#[derive(Error, Debug)]
pub enum PkiError {
    #[error("certificate generation failed: {0}")]
    Generation(#[from] rcgen::Error),
}

/// A PEM-encoded certificate plus its private key.
#[derive(Clone, Debug)]
pub struct CertifiedPair {
    pub crt: String,
    pub key: String,
}

/// A certificate authority able to issue leaf certificates.
pub struct Authority {
    pub pair: CertifiedPair,
    cert: rcgen::Certificate,
    key: KeyPair,
}

/// Generate a new self-signed CA valid for `valid_for`.
pub fn generate_ca(common_name: &str, valid_for: Duration) -> Result<Authority, PkiError> {
    let key = KeyPair::generate()?;

    let mut params = CertificateParams::new(Vec::<String>::new())?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.not_before = OffsetDateTime::now_utc() - Duration::minutes(5);
    params.not_after = OffsetDateTime::now_utc() + valid_for;

    let cert = params.self_signed(&key)?;

    Ok(Authority {
        pair: CertifiedPair {
            crt: cert.pem(),
            key: key.serialize_pem(),
        },
        cert,
        key,
    })
}

/// Reconstruct an authority from stored PEMs so issuance survives restarts
/// without rotating the CA.
pub fn load_ca(crt_pem: &str, key_pem: &str) -> Result<Authority, PkiError> {
    let key = KeyPair::from_pem(key_pem)?;
    let params = CertificateParams::from_ca_cert_pem(crt_pem)?;
    let cert = params.self_signed(&key)?;

    Ok(Authority {
        pair: CertifiedPair {
            crt: crt_pem.to_string(),
            key: key_pem.to_string(),
        },
        cert,
        key,
    })
}

/// What a leaf certificate is for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CertUse {
    Server,
    Client,
}

pub struct LeafRequest<'a> {
    pub common_name: &'a str,
    pub organization: Option<&'a str>,
    pub san: &'a [String],
    pub cert_use: CertUse,
    pub valid_for: Duration,
}

impl Authority {
    /// Issue a leaf certificate signed by this authority.
    pub fn issue(&self, request: &LeafRequest<'_>) -> Result<CertifiedPair, PkiError> {
        let key = KeyPair::generate()?;

        let mut params = CertificateParams::new(request.san.to_vec())?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, request.common_name);
        if let Some(organization) = request.organization {
            dn.push(DnType::OrganizationName, organization);
        }
        params.distinguished_name = dn;
        params.use_authority_key_identifier_extension = true;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![match request.cert_use {
            CertUse::Server => ExtendedKeyUsagePurpose::ServerAuth,
            CertUse::Client => ExtendedKeyUsagePurpose::ClientAuth,
        }];
        params.not_before = OffsetDateTime::now_utc() - Duration::minutes(5);
        params.not_after = OffsetDateTime::now_utc() + request.valid_for;

        let cert = params.signed_by(&key, &self.cert, &self.key)?;

        Ok(CertifiedPair {
            crt: cert.pem(),
            key: key.serialize_pem(),
        })
    }
}

/// A self-signed server certificate for maintenance mode.
pub fn self_signed_server(san: &[String]) -> Result<CertifiedPair, PkiError> {
    let key = KeyPair::generate()?;

    let mut params = CertificateParams::new(san.to_vec())?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "maintenance");
    params.distinguished_name = dn;
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.not_before = OffsetDateTime::now_utc() - Duration::minutes(5);
    params.not_after = OffsetDateTime::now_utc() + Duration::days(365);

    let cert = params.self_signed(&key)?;

    Ok(CertifiedPair {
        crt: cert.pem(),
        key: key.serialize_pem(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ca_issues_server_cert() {
        let ca = generate_ca("talos", Duration::days(3650)).unwrap();
        assert!(ca.pair.crt.contains("BEGIN CERTIFICATE"));
        assert!(ca.pair.key.contains("PRIVATE KEY"));

        let leaf = ca
            .issue(&LeafRequest {
                common_name: "apid",
                organization: None,
                san: &["127.0.0.1".to_string(), "localhost".to_string()],
                cert_use: CertUse::Server,
                valid_for: Duration::days(365),
            })
            .unwrap();
        assert!(leaf.crt.contains("BEGIN CERTIFICATE"));
    }

    #[test]
    fn test_ca_round_trips_through_pem() {
        let ca = generate_ca("talos", Duration::days(3650)).unwrap();
        let reloaded = load_ca(&ca.pair.crt, &ca.pair.key).unwrap();

        reloaded
            .issue(&LeafRequest {
                common_name: "admin",
                organization: Some("system:masters"),
                san: &[],
                cert_use: CertUse::Client,
                valid_for: Duration::days(365),
            })
            .unwrap();
    }

    #[test]
    fn test_self_signed_server() {
        let pair = self_signed_server(&["localhost".to_string()]).unwrap();
        assert!(pair.crt.contains("BEGIN CERTIFICATE"));
    }
}
