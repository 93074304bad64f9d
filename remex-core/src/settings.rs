//! Session settings.
//!
//! Everything a connection needs to know up front: target endpoint, TLS
//! bounds, trust-decision knobs, and bitmap cache geometry. Deserializable
//! with serde so host configuration files can populate it directly; every
//! field has a sensible default.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::RemexError;

/// Highest cell count the bitmap cache capability advertises.
pub const MAX_CACHE_CELLS: usize = 5;

/// Largest per-cell entry count the v2 capability encoding allows.
pub const MAX_CELL_ENTRIES: u16 = 4096;

// ── TransportKind ────────────────────────────────────────────────

/// Which leg of the connection this session secures.
///
/// The trust policy keeps one already-accepted certificate slot per kind,
/// so a gateway certificate acceptance never leaks onto the target host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Straight to the target server.
    #[default]
    Direct,
    /// Through an RD gateway.
    Gateway,
    /// Following a server-issued redirection.
    Redirected,
}

// ── TlsVersion ───────────────────────────────────────────────────

/// Protocol versions the session may negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Serialize, Deserialize)]
pub enum TlsVersion {
    #[serde(rename = "1.2")]
    Tls12,
    #[serde(rename = "1.3")]
    Tls13,
}

// ── SessionSettings ──────────────────────────────────────────────

/// Top-level per-connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Target hostname (also the SNI name).
    pub hostname: String,
    /// Target port.
    pub port: u16,
    /// Session color depth in bits per pixel.
    pub color_depth: u32,
    /// Which connection leg this is.
    pub transport: TransportKind,
    /// Whether client-side order decoding is active. When false, the
    /// order dispatcher is never registered.
    pub decoding_enabled: bool,
    /// TLS engine options.
    pub tls: TlsSettings,
    /// Certificate trust options.
    pub trust: TrustSettings,
    /// Bitmap cache geometry.
    pub cache: CacheSettings,
}

/// TLS engine options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    /// Lowest acceptable protocol version.
    pub min_version: TlsVersion,
    /// Highest acceptable protocol version.
    pub max_version: TlsVersion,
    /// Cipher-suite allow list (engine names). Empty means engine default.
    pub cipher_suites: Vec<String>,
    /// NSS key-log output path, one file per session. `None` disables.
    pub secrets_file: Option<PathBuf>,
}

/// Certificate trust options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustSettings {
    /// Skip all certificate checks. Dangerous; logged loudly.
    pub ignore_certificate: bool,
    /// Accept unknown certificates without prompting and persist them.
    pub auto_accept: bool,
    /// Deny unknown or changed certificates without prompting.
    pub auto_deny: bool,
    /// Delegate every decision to the host's certificate handler.
    pub external_management: bool,
    /// Pre-approved fingerprints, `"<hash>:<fingerprint>"` per entry,
    /// comma-joined lists accepted.
    pub accepted_fingerprints: Vec<String>,
    /// Expected certificate name, overriding the hostname for matching
    /// on direct transports.
    pub certificate_name: Option<String>,
    /// 0 disables server authentication on direct transports.
    pub authentication_level: u32,
    /// Directory holding known-host entries, `certificates.json`, and the
    /// `anchors/` PEM directory.
    pub trust_dir: PathBuf,
}

/// Bitmap cache geometry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Negotiated bitmap cache version.
    pub version: u32,
    /// Per-cell entry counts, in cache-id order.
    pub cells: Vec<CellSettings>,
    /// Whether long-lived entries are written to disk at teardown.
    pub persist_enabled: bool,
    /// Persistent cache file path.
    pub persist_file: Option<PathBuf>,
}

/// One bitmap cache cell.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CellSettings {
    /// Number of addressable entries (the waiting-list slot is extra).
    pub entries: u16,
    /// Whether this cell participates in the persistent cache.
    pub persistent: bool,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            port: 3389,
            color_depth: 32,
            transport: TransportKind::Direct,
            decoding_enabled: true,
            tls: TlsSettings::default(),
            trust: TrustSettings::default(),
            cache: CacheSettings::default(),
        }
    }
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            min_version: TlsVersion::Tls12,
            max_version: TlsVersion::Tls13,
            cipher_suites: Vec::new(),
            secrets_file: None,
        }
    }
}

impl Default for TrustSettings {
    fn default() -> Self {
        Self {
            ignore_certificate: false,
            auto_accept: false,
            auto_deny: false,
            external_management: false,
            accepted_fingerprints: Vec::new(),
            certificate_name: None,
            authentication_level: 2,
            trust_dir: PathBuf::from("."),
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            version: 2,
            cells: vec![
                CellSettings { entries: 600, persistent: false },
                CellSettings { entries: 600, persistent: false },
                CellSettings { entries: 2048, persistent: false },
            ],
            persist_enabled: false,
            persist_file: None,
        }
    }
}

// ── Validation ───────────────────────────────────────────────────

impl SessionSettings {
    /// Reject out-of-range values before any connection work starts.
    pub fn validate(&self) -> Result<(), RemexError> {
        if self.hostname.is_empty() {
            return Err(RemexError::BadConfiguration("hostname is empty".into()));
        }
        if self.port == 0 {
            return Err(RemexError::BadConfiguration("port is zero".into()));
        }
        if !matches!(self.color_depth, 8 | 15 | 16 | 24 | 32) {
            return Err(RemexError::BadConfiguration(format!(
                "unsupported color depth {}",
                self.color_depth
            )));
        }
        if self.tls.min_version > self.tls.max_version {
            return Err(RemexError::BadConfiguration(
                "tls min_version exceeds max_version".into(),
            ));
        }
        if self.cache.cells.is_empty() || self.cache.cells.len() > MAX_CACHE_CELLS {
            return Err(RemexError::BadConfiguration(format!(
                "bitmap cache cell count {} out of range 1..={MAX_CACHE_CELLS}",
                self.cache.cells.len()
            )));
        }
        for (id, cell) in self.cache.cells.iter().enumerate() {
            if cell.entries == 0 || cell.entries > MAX_CELL_ENTRIES {
                return Err(RemexError::BadConfiguration(format!(
                    "cell {id}: entry count {} out of range 1..={MAX_CELL_ENTRIES}",
                    cell.entries
                )));
            }
        }
        if !matches!(self.cache.version, 1 | 2 | 3) {
            return Err(RemexError::BadConfiguration(format!(
                "bitmap cache version {} unknown",
                self.cache.version
            )));
        }
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────
