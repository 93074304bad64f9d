//! CLI client configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use remex_core::{SessionSettings, TlsVersion};

/// Top-level configuration for the CLI client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Connection target.
    pub connection: ConnectionConfig,
    /// Certificate and TLS behavior.
    pub security: SecurityConfig,
    /// Bitmap cache persistence.
    pub cache: CacheConfig,
    /// Logging.
    pub logging: LoggingConfig,
}

/// Connection target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Server hostname.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Session color depth in bits per pixel.
    pub color_depth: u32,
}

/// Certificate and TLS behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Lowest TLS version to offer: "1.2" or "1.3".
    pub tls_min_version: String,
    /// Skip certificate verification entirely (dangerous).
    pub ignore_certificate: bool,
    /// Accept unknown certificates without prompting.
    pub auto_accept: bool,
    /// Pre-approved fingerprints, `"<hash>:<fingerprint>"` entries.
    pub accepted_fingerprints: Vec<String>,
    /// NSS key-log file; empty disables.
    pub secrets_file: String,
    /// Trust directory (known hosts, certificates.json, anchors/).
    /// Empty selects the per-user default.
    pub trust_dir: String,
}

/// Bitmap cache persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Write long-lived cache entries to disk at teardown.
    pub persist: bool,
    /// Persistent cache file; empty selects `<trust_dir>/bitmaps.bin`.
    pub persist_file: String,
}

/// Logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter.
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            security: SecurityConfig::default(),
            cache: CacheConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 3389,
            color_depth: 32,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            tls_min_version: "1.2".into(),
            ignore_certificate: false,
            auto_accept: false,
            accepted_fingerprints: Vec::new(),
            secrets_file: String::new(),
            trust_dir: String::new(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            persist: false,
            persist_file: String::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl ClientConfig {
    /// Load from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    /// The trust directory, honoring the per-user default.
    pub fn trust_dir(&self) -> PathBuf {
        if !self.security.trust_dir.is_empty() {
            return PathBuf::from(&self.security.trust_dir);
        }
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("remex")
    }

    /// Translate into core session settings.
    pub fn to_session_settings(&self) -> SessionSettings {
        let trust_dir = self.trust_dir();
        let mut settings = SessionSettings {
            hostname: self.connection.host.clone(),
            port: self.connection.port,
            color_depth: self.connection.color_depth,
            ..Default::default()
        };

        if self.security.tls_min_version == "1.3" {
            settings.tls.min_version = TlsVersion::Tls13;
        }
        if !self.security.secrets_file.is_empty() {
            settings.tls.secrets_file = Some(PathBuf::from(&self.security.secrets_file));
        }

        settings.trust.ignore_certificate = self.security.ignore_certificate;
        settings.trust.auto_accept = self.security.auto_accept;
        settings.trust.accepted_fingerprints = self.security.accepted_fingerprints.clone();
        settings.trust.trust_dir = trust_dir.clone();

        settings.cache.persist_enabled = self.cache.persist;
        settings.cache.persist_file = if self.cache.persist_file.is_empty() {
            Some(trust_dir.join("bitmaps.bin"))
        } else {
            Some(PathBuf::from(&self.cache.persist_file))
        };

        settings
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let cfg = ClientConfig::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        assert!(text.contains("host"));
        assert!(text.contains("ignore_certificate"));
    }

    #[test]
    fn roundtrip_config() {
        let mut cfg = ClientConfig::default();
        cfg.connection.host = "rdp.example.com".into();
        cfg.security.auto_accept = true;
        let text = toml::to_string_pretty(&cfg).unwrap();
        let parsed: ClientConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.connection.host, "rdp.example.com");
        assert!(parsed.security.auto_accept);
    }

    #[test]
    fn settings_translation() {
        let mut cfg = ClientConfig::default();
        cfg.connection.host = "rdp.example.com".into();
        cfg.security.tls_min_version = "1.3".into();
        cfg.security.trust_dir = "/tmp/remex-trust".into();

        let settings = cfg.to_session_settings();
        assert_eq!(settings.hostname, "rdp.example.com");
        assert_eq!(settings.tls.min_version, TlsVersion::Tls13);
        assert_eq!(
            settings.trust.trust_dir,
            PathBuf::from("/tmp/remex-trust")
        );
        assert!(settings.validate().is_ok());
    }
}
