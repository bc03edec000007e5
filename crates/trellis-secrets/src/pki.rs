//! Self-signed root CA for the cluster
//!
//! The CA key pair is generated once (through [`ensure_credential`]) and kept
//! in the local state directory. The key goes to the cert-manager namespace as
//! a TLS secret; only the certificate body is committed to the config
//! repository for trust distribution.
//!
//! [`ensure_credential`]: crate::credentials::ensure_credential

use std::collections::BTreeMap;

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue, IsCa, KeyPair,
    KeyUsagePurpose,
};

use crate::error::{Error, Result};

/// Validity of the root CA
pub const CA_VALIDITY_YEARS: i64 = 10;

/// Credential field holding the PEM certificate
pub const CA_CERT_KEY: &str = "tls.crt";
/// Credential field holding the PEM private key
pub const CA_KEY_KEY: &str = "tls.key";

/// PEM-encoded CA certificate and key
#[derive(Clone)]
pub struct CaBundle {
    /// Certificate, safe to distribute
    pub cert_pem: String,
    /// Private key
    pub key_pem: String,
}

impl CaBundle {
    /// Generate a new self-signed CA
    pub fn generate(common_name: &str) -> Result<Self> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(common_name.to_string()),
        );
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String("trellis".to_string()),
        );
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let now = ::time::OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + ::time::Duration::days(CA_VALIDITY_YEARS * 365);

        let key_pair = KeyPair::generate()
            .map_err(|e| Error::Pki(format!("failed to generate CA key: {}", e)))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| Error::Pki(format!("failed to create CA cert: {}", e)))?;

        Ok(Self {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }

    /// Credential fields for the bundle
    pub fn into_fields(self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (CA_CERT_KEY.to_string(), self.cert_pem),
            (CA_KEY_KEY.to_string(), self.key_pem),
        ])
    }
}

/// Generator for [`ensure_credential`](crate::credentials::ensure_credential)
pub fn ca_generator(common_name: &str) -> impl FnOnce() -> Result<BTreeMap<String, String>> + '_ {
    move || Ok(CaBundle::generate(common_name)?.into_fields())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_pem_certificate_and_key() {
        let bundle = CaBundle::generate("trellis-dev-root").unwrap();
        assert!(bundle.cert_pem.starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(bundle.key_pem.contains("PRIVATE KEY"));
        assert!(KeyPair::from_pem(&bundle.key_pem).is_ok());
    }

    #[test]
    fn each_generation_is_unique() {
        let a = CaBundle::generate("root").unwrap();
        let b = CaBundle::generate("root").unwrap();
        assert_ne!(a.key_pem, b.key_pem);
    }

    #[test]
    fn generator_produces_tls_fields() {
        let fields = ca_generator("root")().unwrap();
        assert!(fields.contains_key(CA_CERT_KEY));
        assert!(fields.contains_key(CA_KEY_KEY));
    }
}
