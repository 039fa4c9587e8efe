//! TLS configuration options.
//!
//! These are the knobs the server's config file exposes for TLS. Loading
//! follows the usual resolution: explicit file, then defaults. The PEM
//! material itself is read at core construction, not here, so a bad path
//! fails loudly at startup rather than silently at first use.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Default trust root when none is configured.
pub const DEFAULT_ROOT_CA_CERTS_PATH: &str = "/etc/ssl/certs/ca-bundle.crt";

/// Default cipher preference policy name.
pub const DEFAULT_CIPHER_PREFS: &str = "default";

/// Top-level TLS options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsOptions {
    /// Master switch. When false, every I/O shim falls through to the OS.
    pub enabled: bool,
    /// PEM certificate chain presented to peers.
    pub certificate_file: PathBuf,
    /// PEM private key for the certificate.
    pub private_key_file: PathBuf,
    /// PEM Diffie-Hellman parameters.
    pub dh_params_file: PathBuf,
    /// Trust root for outbound (client-role) connections. A PEM bundle
    /// file or a directory of PEM files.
    pub root_ca_certs_path: PathBuf,
    /// Opaque cipher preference policy name, resolved by the engine layer.
    pub cipher_prefs: String,
    /// Record sizing trade-off for the engine.
    pub performance_mode: PerformanceMode,
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            certificate_file: PathBuf::new(),
            private_key_file: PathBuf::new(),
            dh_params_file: PathBuf::new(),
            root_ca_certs_path: PathBuf::from(DEFAULT_ROOT_CA_CERTS_PATH),
            cipher_prefs: DEFAULT_CIPHER_PREFS.to_string(),
            performance_mode: PerformanceMode::default(),
        }
    }
}

impl TlsOptions {
    /// Load options from a TOML file.
    pub fn load(path: &Path) -> Result<Self, OptionsError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| OptionsError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| OptionsError::ParseFailed(path.to_path_buf(), e))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OptionsError {
    #[error("failed to read {path}: {source}", path = .0.display(), source = .1)]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {path}: {source}", path = .0.display(), source = .1)]
    ParseFailed(PathBuf, toml::de::Error),
}

// ── Performance mode ──────────────────────────────────────────────────────────

/// Record sizing preference.
///
/// Low latency keeps TLS records small so partial data is decryptable as
/// soon as it arrives; high throughput fills records to the protocol
/// maximum and amortizes per-record overhead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PerformanceMode {
    #[default]
    LowLatency,
    HighThroughput,
}

impl PerformanceMode {
    /// Parse a mode from its config-file name. Case-insensitive.
    pub fn by_name(name: &str) -> Option<Self> {
        if name.eq_ignore_ascii_case("low-latency") {
            Some(PerformanceMode::LowLatency)
        } else if name.eq_ignore_ascii_case("high-throughput") {
            Some(PerformanceMode::HighThroughput)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PerformanceMode::LowLatency => "low-latency",
            PerformanceMode::HighThroughput => "high-throughput",
        }
    }

    /// Stable numeric code used by the config surface.
    pub fn code(self) -> i32 {
        match self {
            PerformanceMode::LowLatency => 0,
            PerformanceMode::HighThroughput => 1,
        }
    }

    /// Name to numeric code; unknown names map to -1.
    pub fn name_to_code(name: &str) -> i32 {
        Self::by_name(name).map(Self::code).unwrap_or(-1)
    }

    /// Record payload ceiling handed to the engine. `None` means the
    /// protocol maximum.
    pub(crate) fn max_fragment_size(self) -> Option<usize> {
        match self {
            PerformanceMode::LowLatency => Some(4096),
            PerformanceMode::HighThroughput => None,
        }
    }
}
