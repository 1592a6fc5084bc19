//! Client-side TLS for upstream connections.
//!
//! All certificate material is loaded once, when the dialer is built. Any
//! failure here is fatal to startup; nothing is read from disk per connection.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use thiserror::Error;

/// TLS settings for the upstream connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsOptions {
    /// Accept any server certificate. Development only.
    pub skip_verify: bool,
    /// PEM bundle of trusted CAs. Mozilla roots are used when unset.
    pub ca_file: Option<PathBuf>,
    /// PEM client certificate chain for mutual TLS.
    pub cert_file: Option<PathBuf>,
    /// PEM private key matching `cert_file`.
    pub key_file: Option<PathBuf>,
}

/// Errors loading TLS material or building the client configuration.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to load certificates from {}: {reason}", .path.display())]
    CertificateLoad { path: PathBuf, reason: String },

    #[error("failed to load private key from {}: {reason}", .path.display())]
    PrivateKeyLoad { path: PathBuf, reason: String },

    #[error("TLS configuration error: {0}")]
    Config(String),
}

impl TlsError {
    pub fn cert_load(path: &Path, reason: impl Into<String>) -> Self {
        Self::CertificateLoad {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    pub fn key_load(path: &Path, reason: impl Into<String>) -> Self {
        Self::PrivateKeyLoad {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config(reason.into())
    }

    pub fn reason_code(&self) -> &'static str {
        match self {
            TlsError::CertificateLoad { .. } => "tls_certificate_load",
            TlsError::PrivateKeyLoad { .. } => "tls_private_key_load",
            TlsError::Config(_) => "tls_config",
        }
    }
}

/// Build the rustls client configuration for the upstream.
///
/// A CA file, when given, is always loaded and validated, even with
/// `skip_verify`, so a broken path is caught at startup either way.
pub fn build_client_config(options: &TlsOptions) -> Result<ClientConfig, TlsError> {
    let provider = Arc::new(ring::default_provider());
    let roots = build_root_store(options.ca_file.as_deref())?;

    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| TlsError::config(format!("failed to set protocol versions: {e}")))?;

    let builder = if options.skip_verify {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertificateVerification(provider)))
    } else {
        builder.with_root_certificates(roots)
    };

    let config = match (&options.cert_file, &options.key_file) {
        (Some(cert_path), Some(key_path)) => {
            let certs = load_certificates(cert_path)?;
            if certs.is_empty() {
                return Err(TlsError::cert_load(cert_path, "no certificates found in file"));
            }
            let key = load_private_key(key_path)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| TlsError::config(format!("invalid client certificate: {e}")))?
        }
        (None, None) => builder.with_no_client_auth(),
        (Some(_), None) => {
            return Err(TlsError::config(
                "client certificate given without a private key",
            ))
        }
        (None, Some(_)) => {
            return Err(TlsError::config(
                "private key given without a client certificate",
            ))
        }
    };

    Ok(config)
}

fn build_root_store(ca_file: Option<&Path>) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();

    match ca_file {
        Some(path) => {
            let certs = load_certificates(path)?;
            if certs.is_empty() {
                return Err(TlsError::cert_load(path, "no certificates found in file"));
            }
            for cert in certs {
                roots
                    .add(cert)
                    .map_err(|e| TlsError::cert_load(path, e.to_string()))?;
            }
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }

    Ok(roots)
}

/// Read every certificate in a PEM file (chains supported).
pub fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = File::open(path).map_err(|e| TlsError::cert_load(path, e.to_string()))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::cert_load(path, e.to_string()))
}

/// Read the first private key (PKCS#8, PKCS#1 or SEC1) in a PEM file.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = File::open(path).map_err(|e| TlsError::key_load(path, e.to_string()))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TlsError::key_load(path, e.to_string()))?
        .ok_or_else(|| TlsError::key_load(path, "no private key found in file"))
}

/// Accepts any server certificate. Handshake signatures are still checked
/// against the provider's algorithms.
#[derive(Debug)]
struct NoCertificateVerification(Arc<CryptoProvider>);

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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
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
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
