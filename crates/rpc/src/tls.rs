//! TLS configuration builders shared by client and server.
//!
//! Certificate, key, and CA material is PEM, supplied either inline as a
//! base64 string or as a filesystem path. Both builders are pure functions
//! of their options; they hold no state.

use std::path::PathBuf;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rustls::crypto::aws_lc_rs::{cipher_suite, default_provider, kx_group};
use rustls::crypto::{CryptoProvider, SupportedKxGroup};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{
    ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme,
    SupportedCipherSuite, version,
};

use crate::error::TlsError;

/// PEM material, inline or on disk.
#[derive(Debug, Clone)]
pub enum TlsMaterial {
    /// Base64-encoded PEM contents.
    Base64(String),
    /// Path to a PEM file.
    Path(PathBuf),
}

impl TlsMaterial {
    /// Inline base64-encoded PEM.
    pub fn base64(contents: impl Into<String>) -> Self {
        Self::Base64(contents.into())
    }

    /// PEM file on disk.
    pub fn path(path: impl Into<PathBuf>) -> Self {
        Self::Path(path.into())
    }

    fn read(&self) -> Result<Vec<u8>, TlsError> {
        match self {
            Self::Base64(contents) => BASE64
                .decode(contents.trim())
                .map_err(|e| TlsError::ReadMaterial(format!("base64 decode failed: {e}"))),
            Self::Path(path) => std::fs::read(path)
                .map_err(|e| TlsError::ReadMaterial(format!("{}: {e}", path.display()))),
        }
    }
}

/// Options for the server-side TLS builder.
#[derive(Debug, Clone)]
pub struct ServerTlsOptions {
    /// Server certificate chain (PEM).
    pub cert: TlsMaterial,
    /// Server private key (PEM).
    pub key: TlsMaterial,
    /// CA certificates trusted for client-certificate authentication.
    /// Client certificates are only verified when this is non-empty.
    pub client_ca: Vec<TlsMaterial>,
    /// Seed the client-CA pool from the bundled trust roots as well.
    pub include_bundled_roots: bool,
    /// Override the curated cipher-suite list.
    pub cipher_suites: Option<Vec<SupportedCipherSuite>>,
    /// Override the preferred key-exchange groups.
    pub kx_groups: Option<Vec<&'static dyn SupportedKxGroup>>,
}

impl ServerTlsOptions {
    /// Options for a plain cert/key pair with no client authentication.
    #[must_use]
    pub const fn new(cert: TlsMaterial, key: TlsMaterial) -> Self {
        Self {
            cert,
            key,
            client_ca: Vec::new(),
            include_bundled_roots: false,
            cipher_suites: None,
            kx_groups: None,
        }
    }
}

/// Options for the client-side TLS builder.
#[derive(Debug, Clone)]
pub struct ClientTlsOptions {
    /// Expected server name, used for certificate verification and SNI.
    pub server_name: String,
    /// Additional CA certificates trusted for server verification.
    pub ca: Vec<TlsMaterial>,
    /// Seed the root pool from the bundled trust roots as well.
    pub include_bundled_roots: bool,
    /// Skip server certificate verification entirely. Dangerous; tests only.
    pub insecure_skip_verify: bool,
}

impl ClientTlsOptions {
    /// Options verifying against the supplied CAs only.
    #[must_use]
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            ca: Vec::new(),
            include_bundled_roots: false,
            insecure_skip_verify: false,
        }
    }
}

fn curated_cipher_suites() -> Vec<SupportedCipherSuite> {
    vec![
        cipher_suite::TLS13_AES_256_GCM_SHA384,
        cipher_suite::TLS13_AES_128_GCM_SHA256,
        cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
        cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
        cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
        cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
        cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
        cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
    ]
}

fn preferred_kx_groups() -> Vec<&'static dyn SupportedKxGroup> {
    vec![kx_group::X25519, kx_group::SECP256R1, kx_group::SECP384R1]
}

fn provider(
    cipher_suites: Option<Vec<SupportedCipherSuite>>,
    kx_groups: Option<Vec<&'static dyn SupportedKxGroup>>,
) -> CryptoProvider {
    let mut provider = default_provider();
    provider.cipher_suites = cipher_suites.unwrap_or_else(curated_cipher_suites);
    provider.kx_groups = kx_groups.unwrap_or_else(preferred_kx_groups);
    provider
}

fn load_certs(material: &TlsMaterial) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let pem = material.read()?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<_, _>>()
        .map_err(|e| TlsError::InvalidPem(e.to_string()))?;
    if certs.is_empty() {
        return Err(TlsError::InvalidPem(
            "no certificates found in material".to_string(),
        ));
    }
    Ok(certs)
}

fn load_key(material: &TlsMaterial) -> Result<PrivateKeyDer<'static>, TlsError> {
    let pem = material.read()?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(|e| TlsError::InvalidPem(e.to_string()))?
        .ok_or_else(|| TlsError::InvalidPem("no private key found in material".to_string()))
}

fn root_store(cas: &[TlsMaterial], include_bundled: bool) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    if include_bundled {
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }
    for material in cas {
        let pem = material.read().map_err(|e| TlsError::InvalidCa(e.to_string()))?;
        let mut added = 0usize;
        for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
            let cert = cert.map_err(|e| TlsError::InvalidCa(e.to_string()))?;
            roots
                .add(cert)
                .map_err(|e| TlsError::InvalidCa(e.to_string()))?;
            added += 1;
        }
        if added == 0 {
            return Err(TlsError::InvalidCa(
                "no ca certificates found in material".to_string(),
            ));
        }
    }
    Ok(roots)
}

/// Build a server-side rustls configuration.
///
/// Applies the curated cipher suites and key-exchange groups (unless
/// overridden) and enforces TLS 1.2 as the minimum protocol version. Client
/// certificates are verified against the configured CA pool when one is
/// supplied; without TLS the same options are inert.
///
/// # Errors
///
/// Fails when material cannot be read or parsed, or when rustls rejects the
/// assembled configuration.
pub fn server_config(opts: &ServerTlsOptions) -> Result<ServerConfig, TlsError> {
    let provider = Arc::new(provider(opts.cipher_suites.clone(), opts.kx_groups.clone()));
    let certs = load_certs(&opts.cert)?;
    let key = load_key(&opts.key)?;

    let builder = ServerConfig::builder_with_provider(Arc::clone(&provider))
        .with_protocol_versions(&[&version::TLS13, &version::TLS12])
        .map_err(|e| TlsError::Build(e.to_string()))?;

    let config = if opts.client_ca.is_empty() && !opts.include_bundled_roots {
        builder
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| TlsError::Build(e.to_string()))?
    } else {
        let roots = root_store(&opts.client_ca, opts.include_bundled_roots)?;
        let verifier =
            rustls::server::WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                .build()
                .map_err(|e| TlsError::Build(e.to_string()))?;
        builder
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)
            .map_err(|e| TlsError::Build(e.to_string()))?
    };

    Ok(config)
}

/// Build a client-side rustls configuration.
///
/// # Errors
///
/// Fails when CA material cannot be read or parsed, or when rustls rejects
/// the assembled configuration.
pub fn client_config(opts: &ClientTlsOptions) -> Result<ClientConfig, TlsError> {
    let provider = Arc::new(provider(None, None));
    let roots = root_store(&opts.ca, opts.include_bundled_roots)?;

    let mut config = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_protocol_versions(&[&version::TLS13, &version::TLS12])
        .map_err(|e| TlsError::Build(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();

    if opts.insecure_skip_verify {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoVerification {
                schemes: provider.signature_verification_algorithms.supported_schemes(),
            }));
    }

    Ok(config)
}

/// Parse the expected server name from client TLS options.
///
/// # Errors
///
/// Fails when the name is neither a DNS name nor an IP address.
pub fn parse_server_name(opts: &ClientTlsOptions) -> Result<ServerName<'static>, TlsError> {
    ServerName::try_from(opts.server_name.clone())
        .map_err(|e| TlsError::InvalidServerName(e.to_string()))
}

/// Certificate verifier that accepts everything. Test use only.
#[derive(Debug)]
struct NoVerification {
    schemes: Vec<SignatureScheme>,
}

impl rustls::client::danger::ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes.clone()
    }
}
