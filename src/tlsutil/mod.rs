//! TLS configuration loading for both daemons.
//!
//! The client side builds a `rustls::ClientConfig` from the system trust
//! bundle and/or operator-supplied CA files, with optional client
//! certificates and an optional verification-off switch for lab setups.
//! The server side loads a PEM certificate/key pair into a
//! `rustls::ServerConfig` advertising HTTP/2 and HTTP/1.1.

use std::fs::File;
use std::io::{BufReader, Seek, SeekFrom};
use std::sync::{Arc, OnceLock};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};

use crate::error::{DnsError, DnsResult};

/// Install the process-wide rustls crypto provider exactly once.
fn install_crypto_provider() {
    static CRYPTO_INIT: OnceLock<()> = OnceLock::new();
    CRYPTO_INIT.get_or_init(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Options for [`client_config`].
#[derive(Debug, Clone)]
pub struct ClientTlsOptions {
    /// Trust the bundled webpki root CAs.
    pub use_system_roots: bool,
    /// Additional PEM CA files to trust.
    pub ca_files: Vec<String>,
    /// Client certificate presented to servers requesting one.
    pub cert_file: Option<String>,
    /// Private key matching `cert_file`.
    pub key_file: Option<String>,
    /// Skip peer certificate verification entirely. For lab setups only.
    pub insecure_skip_verify: bool,
}

impl Default for ClientTlsOptions {
    fn default() -> Self {
        Self {
            use_system_roots: true,
            ca_files: Vec::new(),
            cert_file: None,
            key_file: None,
            insecure_skip_verify: false,
        }
    }
}

/// Build the client TLS configuration used for upstream DoH exchanges.
///
/// # Errors
///
/// Returns a config error when a CA, certificate or key file cannot be
/// read or parsed, when only one of cert/key is supplied, or when no
/// trust source remains enabled.
pub fn client_config(options: &ClientTlsOptions) -> DnsResult<ClientConfig> {
    install_crypto_provider();

    let client_auth = match (&options.cert_file, &options.key_file) {
        (Some(cert), Some(key)) => Some((load_certs(cert)?, load_private_key(key)?)),
        (None, None) => None,
        _ => {
            return Err(DnsError::config(
                "client TLS certificate and key files must be supplied together",
            ))
        }
    };

    if options.insecure_skip_verify {
        let builder = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification));
        return match client_auth {
            Some((certs, key)) => builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| DnsError::config(format!("client TLS credentials rejected: {e}"))),
            None => Ok(builder.with_no_client_auth()),
        };
    }

    let mut roots = RootCertStore::empty();
    if options.use_system_roots {
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }
    for ca_file in &options.ca_files {
        for cert in load_certs(ca_file)? {
            roots
                .add(cert)
                .map_err(|e| DnsError::config(format!("bad CA certificate in {ca_file}: {e}")))?;
        }
    }
    if roots.is_empty() {
        return Err(DnsError::config(
            "no trust roots: system roots disabled and no CA files supplied",
        ));
    }

    let builder = ClientConfig::builder().with_root_certificates(roots);
    match client_auth {
        Some((certs, key)) => builder
            .with_client_auth_cert(certs, key)
            .map_err(|e| DnsError::config(format!("client TLS credentials rejected: {e}"))),
        None => Ok(builder.with_no_client_auth()),
    }
}

/// Build the server TLS configuration for the DoH listener, advertising
/// HTTP/2 and HTTP/1.1.
///
/// # Errors
///
/// Returns a config error when the certificate or key cannot be read,
/// parsed, or do not form a usable pair.
pub fn server_config(cert_file: &str, key_file: &str) -> DnsResult<ServerConfig> {
    install_crypto_provider();

    let certs = load_certs(cert_file)?;
    let key = load_private_key(key_file)?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| DnsError::config(format!("server TLS credentials rejected: {e}")))?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(config)
}

fn load_certs(path: &str) -> DnsResult<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| DnsError::config(format!("cannot open certificate file {path}: {e}")))?;
    let mut reader = BufReader::new(file);

    let mut certs = Vec::new();
    for cert in rustls_pemfile::certs(&mut reader) {
        certs.push(cert.map_err(|e| {
            DnsError::config(format!("failed to parse certificate in {path}: {e}"))
        })?);
    }
    if certs.is_empty() {
        return Err(DnsError::config(format!("no certificates found in {path}")));
    }

    Ok(certs)
}

/// Load a private key, trying PKCS#8 then RSA then SEC1 encodings.
fn load_private_key(path: &str) -> DnsResult<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| DnsError::config(format!("cannot open key file {path}: {e}")))?;
    let mut reader = BufReader::new(file);

    for key in rustls_pemfile::pkcs8_private_keys(&mut reader).flatten() {
        return Ok(PrivateKeyDer::Pkcs8(key));
    }

    if reader.get_mut().seek(SeekFrom::Start(0)).is_ok() {
        for key in rustls_pemfile::rsa_private_keys(&mut reader).flatten() {
            return Ok(PrivateKeyDer::Pkcs1(key));
        }
    }

    if reader.get_mut().seek(SeekFrom::Start(0)).is_ok() {
        for key in rustls_pemfile::ec_private_keys(&mut reader).flatten() {
            return Ok(PrivateKeyDer::Sec1(key));
        }
    }

    Err(DnsError::config(format!("no valid private key found in {path}")))
}

/// Accepts any server certificate. The operator asked for it.
#[derive(Debug)]
struct NoVerification;

impl ServerCertVerifier for NoVerification {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_with_system_roots() {
        let config = client_config(&ClientTlsOptions::default());
        assert!(config.is_ok());
    }

    #[test]
    fn test_client_config_insecure() {
        let options = ClientTlsOptions {
            insecure_skip_verify: true,
            ..ClientTlsOptions::default()
        };
        assert!(client_config(&options).is_ok());
    }

    #[test]
    fn test_client_config_no_roots_rejected() {
        let options = ClientTlsOptions {
            use_system_roots: false,
            ..ClientTlsOptions::default()
        };
        let err = client_config(&options).unwrap_err();
        assert!(err.to_string().contains("no trust roots"));
    }

    #[test]
    fn test_cert_without_key_rejected() {
        let options = ClientTlsOptions {
            cert_file: Some("cert.pem".to_string()),
            ..ClientTlsOptions::default()
        };
        let err = client_config(&options).unwrap_err();
        assert!(err.to_string().contains("together"));
    }

    #[test]
    fn test_missing_ca_file_rejected() {
        let options = ClientTlsOptions {
            ca_files: vec!["/no/such/ca.pem".to_string()],
            ..ClientTlsOptions::default()
        };
        assert!(client_config(&options).is_err());
    }

    #[test]
    fn test_missing_server_files_rejected() {
        assert!(server_config("/no/such/cert.pem", "/no/such/key.pem").is_err());
    }
}
