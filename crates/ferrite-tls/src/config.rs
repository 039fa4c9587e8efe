//! Engine configuration assembly.
//!
//! Builds the immutable server-side and client-side TLS configurations
//! from PEM material. Server configs carry the presented chain, private
//! key, and DH parameters; client configs carry the trust roots, the local
//! certificate (so peer intermediates verify), and the expected-CN host
//! verifier. Configs are shared snapshots: rotation installs a new one
//! while sessions created earlier keep the one they started with.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use rustls::client::danger::ServerCertVerifier;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use thiserror::Error;

use crate::cert;
use crate::options::PerformanceMode;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid certificate PEM: {0}")]
    BadCertificatePem(String),
    #[error("no certificates in PEM input")]
    NoCertificates,
    #[error("invalid private key PEM: {0}")]
    BadPrivateKey(String),
    #[error("no private key in PEM input")]
    NoPrivateKey,
    #[error("invalid DH parameters: {0}")]
    BadDhParams(String),
    #[error("unknown cipher preference policy {0:?}")]
    UnknownCipherPrefs(String),
    #[error("certificate/key rejected by engine: {0}")]
    Engine(rustls::Error),
    #[error("failed to build peer verifier: {0}")]
    Verifier(String),
    #[error("failed to load trust roots from {}: {detail}", .path.display())]
    CaLoad { path: PathBuf, detail: String },
    #[error("no usable trust roots at {}", .0.display())]
    CaEmpty(PathBuf),
}

/// Server-side configuration snapshot, tagged with its creation time so
/// rotation can tell which connections predate it.
#[derive(Debug, Clone)]
pub struct ServerTlsConfig {
    shared: Arc<rustls::ServerConfig>,
    created_at: SystemTime,
}

impl ServerTlsConfig {
    pub(crate) fn shared(&self) -> Arc<rustls::ServerConfig> {
        self.shared.clone()
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }
}

/// Client-side configuration snapshot.
#[derive(Debug, Clone)]
pub struct ClientTlsConfig {
    shared: Arc<rustls::ClientConfig>,
    /// SNI value used when a call site has no peer name (cluster bus
    /// connections address peers by IP).
    fallback_name: String,
}

impl ClientTlsConfig {
    pub(crate) fn shared(&self) -> Arc<rustls::ClientConfig> {
        self.shared.clone()
    }

    pub(crate) fn fallback_server_name(&self) -> &str {
        &self.fallback_name
    }
}

/// Build the server-side configuration: certificate chain, private key,
/// DH parameters, cipher policy, record sizing. Any failure discards the
/// partially built config.
pub fn build_server(
    cert_pem: &str,
    key_pem: &str,
    dh_pem: &str,
    cipher_prefs: &str,
    mode: PerformanceMode,
) -> Result<ServerTlsConfig, ConfigError> {
    let certs = read_certs(cert_pem)?;
    let key = read_key(key_pem)?;
    validate_dh_params(dh_pem)?;
    let versions = protocol_versions(cipher_prefs)?;

    let mut config = rustls::ServerConfig::builder_with_protocol_versions(versions)
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(ConfigError::Engine)?;
    config.max_fragment_size = mode.max_fragment_size();

    Ok(ServerTlsConfig {
        shared: Arc::new(config),
        created_at: SystemTime::now(),
    })
}

/// Build the client-side configuration used for replication and outbound
/// cluster-bus connections. The CA path supplies the trust roots; the
/// local certificate is added as well so chains through our own
/// intermediates verify; peer names are checked against the expected
/// hostname instead of the connection's endpoint name.
pub fn build_client(
    cipher_prefs: &str,
    cert_pem_for_trust: &str,
    ca_path: &Path,
    expected_hostname: Option<&str>,
    mode: PerformanceMode,
) -> Result<ClientTlsConfig, ConfigError> {
    let versions = protocol_versions(cipher_prefs)?;

    let mut roots = rustls::RootCertStore::empty();
    let from_ca = load_ca_path(&mut roots, ca_path)?;
    let local = read_certs(cert_pem_for_trust)?;
    let (from_local, _) = roots.add_parsable_certificates(local);
    if from_ca + from_local == 0 {
        return Err(ConfigError::CaEmpty(ca_path.to_path_buf()));
    }

    let verifier = ExpectedCnVerifier::new(roots, expected_hostname.map(String::from))?;

    let mut config = rustls::ClientConfig::builder_with_protocol_versions(versions)
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();
    config.max_fragment_size = mode.max_fragment_size();

    let fallback_name = expected_hostname.unwrap_or("peer.invalid").to_string();
    Ok(ClientTlsConfig {
        shared: Arc::new(config),
        fallback_name,
    })
}

fn read_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<_, _>>()
        .map_err(|e| ConfigError::BadCertificatePem(e.to_string()))?;
    if certs.is_empty() {
        return Err(ConfigError::NoCertificates);
    }
    Ok(certs)
}

fn read_key(pem: &str) -> Result<PrivateKeyDer<'static>, ConfigError> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(|e| ConfigError::BadPrivateKey(e.to_string()))?
        .ok_or(ConfigError::NoPrivateKey)
}

/// The engine negotiates ECDHE, so the DH parameters are not consumed at
/// runtime; they are still required and validated so a misconfigured
/// deployment fails at build time instead of differing silently from one
/// that supplies them.
fn validate_dh_params(pem: &str) -> Result<(), ConfigError> {
    for block in x509_parser::pem::Pem::iter_from_buffer(pem.as_bytes()) {
        let block = block.map_err(|e| ConfigError::BadDhParams(e.to_string()))?;
        if block.label == "DH PARAMETERS" && !block.contents.is_empty() {
            return Ok(());
        }
    }
    Err(ConfigError::BadDhParams(
        "no DH PARAMETERS block in PEM input".to_string(),
    ))
}

/// Resolve an opaque cipher preference policy name.
fn protocol_versions(
    prefs: &str,
) -> Result<&'static [&'static rustls::SupportedProtocolVersion], ConfigError> {
    match prefs {
        "default" => Ok(rustls::DEFAULT_VERSIONS),
        "modern" => {
            static MODERN: [&rustls::SupportedProtocolVersion; 1] = [&rustls::version::TLS13];
            Ok(&MODERN)
        }
        "classic" => {
            static CLASSIC: [&rustls::SupportedProtocolVersion; 1] = [&rustls::version::TLS12];
            Ok(&CLASSIC)
        }
        other => Err(ConfigError::UnknownCipherPrefs(other.to_string())),
    }
}

fn load_ca_path(roots: &mut rustls::RootCertStore, path: &Path) -> Result<usize, ConfigError> {
    if path.is_dir() {
        let entries = std::fs::read_dir(path).map_err(|e| ConfigError::CaLoad {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
        let mut total = 0;
        for entry in entries.flatten() {
            let p = entry.path();
            if p.is_file() {
                match add_pem_file(roots, &p) {
                    Ok(n) => total += n,
                    Err(e) => {
                        tracing::warn!(path = %p.display(), error = %e, "skipping unreadable trust root")
                    }
                }
            }
        }
        Ok(total)
    } else {
        add_pem_file(roots, path)
    }
}

fn add_pem_file(roots: &mut rustls::RootCertStore, path: &Path) -> Result<usize, ConfigError> {
    let data = std::fs::read(path).map_err(|e| ConfigError::CaLoad {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut data.as_slice())
        .collect::<Result<_, _>>()
        .map_err(|e| ConfigError::CaLoad {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
    let (added, _ignored) = roots.add_parsable_certificates(certs);
    Ok(added)
}

// ── Peer verification ─────────────────────────────────────────────────────────

/// Verifies the peer chain with webpki but replaces the name check: the
/// peer is accepted if any identity its certificate claims (CN or DNS SAN)
/// matches the process-wide expected hostname. The connection's own
/// endpoint name is not authoritative because cluster-bus peers are dialed
/// by IP.
#[derive(Debug)]
struct ExpectedCnVerifier {
    inner: Arc<rustls::client::WebPkiServerVerifier>,
    expected: Option<String>,
}

impl ExpectedCnVerifier {
    fn new(roots: rustls::RootCertStore, expected: Option<String>) -> Result<Self, ConfigError> {
        let inner = rustls::client::WebPkiServerVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| ConfigError::Verifier(e.to_string()))?;
        Ok(Self { inner, expected })
    }

    fn peer_name_matches(&self, end_entity: &CertificateDer<'_>) -> bool {
        match cert::identities_der(end_entity.as_ref()) {
            Ok(names) => names
                .iter()
                .any(|name| cert::verify_host(name, self.expected.as_deref())),
            Err(_) => false,
        }
    }
}

fn is_name_mismatch(err: &rustls::CertificateError) -> bool {
    matches!(
        err,
        rustls::CertificateError::NotValidForName
            | rustls::CertificateError::NotValidForNameContext { .. }
    )
}

impl ServerCertVerifier for ExpectedCnVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        let name_ok = self.peer_name_matches(end_entity);
        match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Ok(verified) if name_ok => Ok(verified),
            Ok(_) => Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::NotValidForName,
            )),
            Err(rustls::Error::InvalidCertificate(e)) if name_ok && is_name_mismatch(&e) => {
                Ok(rustls::client::danger::ServerCertVerified::assertion())
            }
            Err(e) => Err(e),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}
