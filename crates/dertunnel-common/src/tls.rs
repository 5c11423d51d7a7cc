use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use rustls_pemfile::{certs, private_key};
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use crate::TlsSetupError;

fn read_pem(path: &Path, what: &'static str) -> Result<String, TlsSetupError> {
    std::fs::read_to_string(path).map_err(|source| TlsSetupError::Read {
        what,
        path: path.to_path_buf(),
        source,
    })
}

/// Load certificates from PEM content string
pub fn load_certs_from_pem(pem_content: &str) -> Result<Vec<CertificateDer<'static>>, TlsSetupError> {
    let mut cursor = Cursor::new(pem_content.as_bytes());
    let certs = certs(&mut cursor)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsSetupError::Certificate(format!("Failed to parse certificates: {}", e)))?;
    if certs.is_empty() {
        return Err(TlsSetupError::Certificate(
            "No certificate found in PEM content".to_string(),
        ));
    }
    Ok(certs)
}

/// Load a private key from PEM content string
pub fn load_private_key_from_pem(pem_content: &str) -> Result<PrivateKeyDer<'static>, TlsSetupError> {
    let mut cursor = Cursor::new(pem_content.as_bytes());
    private_key(&mut cursor)
        .map_err(|e| TlsSetupError::Certificate(format!("Failed to parse private key: {}", e)))?
        .ok_or_else(|| TlsSetupError::Certificate("No private key found in PEM content".to_string()))
}

/// Server TLS config for the public listener, without client certificates
pub fn load_server_config_from_pem(
    cert_pem: &str,
    key_pem: &str,
) -> Result<ServerConfig, TlsSetupError> {
    let certs = load_certs_from_pem(cert_pem)?;
    let key = load_private_key_from_pem(key_pem)?;

    ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(TlsSetupError::from)
}

/// Same as [`load_server_config_from_pem`], reading PEM files
pub fn load_server_config(cert_path: &Path, key_path: &Path) -> Result<ServerConfig, TlsSetupError> {
    let cert_pem = read_pem(cert_path, "cert")?;
    let key_pem = read_pem(key_path, "key")?;
    load_server_config_from_pem(&cert_pem, &key_pem)
}

/// How the tunnel client verifies the server certificate
#[derive(Debug, Clone, Default)]
pub enum ServerTrust {
    /// Public web PKI roots
    #[default]
    WebPki,
    /// Only the CA certificates in this PEM content
    CaPem(String),
    /// Accept any certificate
    Insecure,
}

/// Client TLS config for the control connection
pub fn load_client_config(trust: &ServerTrust) -> Result<ClientConfig, TlsSetupError> {
    let mut root_store = RootCertStore::empty();
    match trust {
        ServerTrust::WebPki | ServerTrust::Insecure => {
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
        ServerTrust::CaPem(pem) => {
            for cert in load_certs_from_pem(pem)? {
                root_store.add(cert).map_err(|e| {
                    TlsSetupError::Certificate(format!("Failed to add CA certificate: {}", e))
                })?;
            }
        }
    }

    let mut config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    if let ServerTrust::Insecure = trust {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoCertificateVerification));
    }

    Ok(config)
}

/// Reads the CA file for [`ServerTrust::CaPem`]
pub fn load_ca_trust(ca_path: &Path) -> Result<ServerTrust, TlsSetupError> {
    Ok(ServerTrust::CaPem(read_pem(ca_path, "CA")?))
}

#[derive(Debug)]
struct NoCertificateVerification;

impl ServerCertVerifier for NoCertificateVerification {
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
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
