//! Certificates for the test server, generated with rcgen

use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, SanType,
};

/// A throwaway CA plus a server certificate for `<base>` and `*.<base>`
#[derive(Clone)]
pub struct TestCertificates {
    pub ca_cert_pem: String,
    pub server_cert_pem: String,
    pub server_key_pem: String,
}

impl TestCertificates {
    pub fn generate(base_domain: &str) -> Self {
        let (ca_cert_pem, issuer) = test_ca();
        let (server_cert_pem, server_key_pem) = wildcard_cert(base_domain, &issuer);
        Self {
            ca_cert_pem,
            server_cert_pem,
            server_key_pem,
        }
    }
}

fn test_ca() -> (String, Issuer<'static, KeyPair>) {
    let key = KeyPair::generate().expect("CA key");
    let mut params = CertificateParams::new(Vec::<String>::new()).expect("CA params");
    params
        .distinguished_name
        .push(DnType::CommonName, "DerTunnel Test CA");
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

    let cert = params.clone().self_signed(&key).expect("CA cert");
    (cert.pem(), Issuer::new(params, key))
}

fn wildcard_cert(base_domain: &str, issuer: &Issuer<'static, KeyPair>) -> (String, String) {
    let key = KeyPair::generate().expect("server key");
    let names = [base_domain.to_string(), format!("*.{}", base_domain)];
    let mut params = CertificateParams::default();
    params.distinguished_name.push(DnType::CommonName, base_domain);
    params.subject_alt_names = names
        .iter()
        .map(|name| SanType::DnsName(name.as_str().try_into().expect("DNS name")))
        .collect();
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let cert = params.signed_by(&key, issuer).expect("server cert");
    (cert.pem(), key.serialize_pem())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_accepts_generated_pair() {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let certs = TestCertificates::generate("tunnel.test");
        assert!(certs.ca_cert_pem.starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(certs.server_key_pem.contains("PRIVATE KEY"));
        assert!(dertunnel_common::load_server_config_from_pem(
            &certs.server_cert_pem,
            &certs.server_key_pem
        )
        .is_ok());
    }
}
