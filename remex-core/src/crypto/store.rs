//! Persistent known-hosts store.
//!
//! One JSON file per `(host, port)` binding under `<trust_dir>/known_hosts/`.
//! Writes go through a temp file and an atomic rename so a crash can never
//! leave a half-written entry behind.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::crypto::identity::CertificateIdentity;
use crate::error::RemexError;

// ── StoreMatch ───────────────────────────────────────────────────

/// Result of checking a presented certificate against the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMatch {
    /// A record exists and its fingerprint matches.
    Match,
    /// No record for this `(host, port)`.
    Missing,
    /// A record exists but the fingerprint differs.
    Changed,
}

// ── Stored entry ─────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    hostname: String,
    port: u16,
    subject: String,
    issuer: String,
    fingerprint: String,
    pem: String,
}

// ── CertificateStore ─────────────────────────────────────────────

/// Process-wide record of accepted `(host, port) → certificate` bindings.
#[derive(Debug, Clone)]
pub struct CertificateStore {
    dir: PathBuf,
}

impl CertificateStore {
    /// A store rooted at `<trust_dir>/known_hosts/`. The directory is
    /// created lazily on first save.
    pub fn new(trust_dir: &Path) -> Self {
        Self {
            dir: trust_dir.join("known_hosts"),
        }
    }

    /// Compare a presented identity against the stored record for its
    /// `(host, port)`.
    pub fn contains(&self, identity: &CertificateIdentity) -> StoreMatch {
        match self.load(&identity.hostname, identity.port) {
            None => StoreMatch::Missing,
            Some(stored) if stored.fingerprint == identity.fingerprint => StoreMatch::Match,
            Some(_) => StoreMatch::Changed,
        }
    }

    /// Load the stored identity for `(host, port)`, if any.
    pub fn load(&self, hostname: &str, port: u16) -> Option<CertificateIdentity> {
        let path = self.entry_path(hostname, port);
        let text = fs::read_to_string(&path).ok()?;
        let entry: StoredEntry = match serde_json::from_str(&text) {
            Ok(e) => e,
            Err(e) => {
                warn!("corrupt known-hosts entry {}: {e}", path.display());
                return None;
            }
        };
        match CertificateIdentity::from_pem(&entry.hostname, entry.port, &entry.pem) {
            Ok(identity) => Some(identity),
            Err(e) => {
                warn!("unreadable certificate in {}: {e}", path.display());
                None
            }
        }
    }

    /// Persist an identity, replacing any previous record for its
    /// `(host, port)`. Atomic at the entry level.
    pub fn save(&self, identity: &CertificateIdentity) -> Result<(), RemexError> {
        fs::create_dir_all(&self.dir)?;

        let entry = StoredEntry {
            hostname: identity.hostname.clone(),
            port: identity.port,
            subject: identity.subject.clone(),
            issuer: identity.issuer.clone(),
            fingerprint: identity.fingerprint.clone(),
            pem: identity.pem.clone(),
        };
        let text = serde_json::to_string_pretty(&entry)
            .map_err(|e| RemexError::BadConfiguration(e.to_string()))?;

        let path = self.entry_path(&identity.hostname, identity.port);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, text)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Path of the entry file for `(host, port)`.
    pub fn entry_path(&self, hostname: &str, port: u16) -> PathBuf {
        let safe: String = hostname
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                    c.to_ascii_lowercase()
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{safe}_{port}.json"))
    }
}

// ── Tests ────────────────────────────────────────────────────────
