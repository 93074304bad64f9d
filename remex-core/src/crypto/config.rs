//! `certificates.json` — site-wide certificate trust rules.
//!
//! Keys are evaluated strictly in this order: `deny`, `ignore`,
//! `certificate-db`, `deny-userconfig`. `deny` therefore wins when both
//! `deny` and `ignore` are present.

use std::fs;
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::crypto::identity::{CertificateIdentity, HashAlg};

/// File name looked up inside the trust directory.
pub const TRUST_CONFIG_FILE: &str = "certificates.json";

// ── ConfigVerdict ────────────────────────────────────────────────

/// What the configuration file says about a presented certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigVerdict {
    /// Flat rejection.
    Deny,
    /// Flat acceptance.
    Allow,
    /// No rule applies; the user may be asked.
    AskUser,
    /// No rule applies and the user must *not* be asked.
    DenyUser,
}

// ── TrustConfig ──────────────────────────────────────────────────

/// Parsed `certificates.json`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    deny: bool,
    ignore: bool,
    #[serde(rename = "deny-userconfig")]
    deny_userconfig: bool,
    #[serde(rename = "certificate-db")]
    certificate_db: Vec<CertDbEntry>,
}

#[derive(Debug, Deserialize)]
struct CertDbEntry {
    /// Hash algorithm name, e.g. `"sha256"`.
    #[serde(rename = "type")]
    hash_type: String,
    /// Unseparated hex fingerprint.
    hash: String,
}

impl TrustConfig {
    /// Load from `<trust_dir>/certificates.json`. A missing or invalid
    /// file means "no rules".
    pub fn load(trust_dir: &Path) -> Option<Self> {
        let path = trust_dir.join(TRUST_CONFIG_FILE);
        let text = fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&text) {
            Ok(cfg) => Some(cfg),
            Err(e) => {
                debug!("ignoring invalid {}: {e}", path.display());
                None
            }
        }
    }

    /// Apply the rules to a presented certificate, in documented order.
    pub fn evaluate(&self, identity: &CertificateIdentity) -> ConfigVerdict {
        if self.deny {
            warn!("certificate denied by {TRUST_CONFIG_FILE}");
            return ConfigVerdict::Deny;
        }
        if self.ignore {
            warn!("certificate ignored by {TRUST_CONFIG_FILE}");
            return ConfigVerdict::Allow;
        }
        if self.db_matches(identity) {
            warn!("certificate accepted by {TRUST_CONFIG_FILE} certificate-db");
            return ConfigVerdict::Allow;
        }
        if self.deny_userconfig {
            warn!("{TRUST_CONFIG_FILE} forbids user certificate decisions");
            return ConfigVerdict::DenyUser;
        }
        ConfigVerdict::AskUser
    }

    fn db_matches(&self, identity: &CertificateIdentity) -> bool {
        for (pos, entry) in self.certificate_db.iter().enumerate() {
            let Some(alg) = HashAlg::from_name(&entry.hash_type) else {
                warn!(
                    "{TRUST_CONFIG_FILE}: certificate-db entry {pos}: \
                     unsupported hash type {:?}",
                    entry.hash_type
                );
                continue;
            };
            let have = identity.fingerprint_by_hash(alg, false);
            if have.eq_ignore_ascii_case(&entry.hash.replace(':', "")) {
                return true;
            }
        }
        false
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> CertificateIdentity {
        let key = rcgen::KeyPair::generate().unwrap();
        let params = rcgen::CertificateParams::new(vec!["host.example".to_string()]).unwrap();
        let cert = params.self_signed(&key).unwrap();
        CertificateIdentity::from_der("host.example", 3389, cert.der()).unwrap()
    }

    fn write_config(dir: &Path, text: &str) {
        fs::write(dir.join(TRUST_CONFIG_FILE), text).unwrap();
    }

    #[test]
    fn missing_file_means_no_rules() {
        let dir = tempfile::tempdir().unwrap();
        assert!(TrustConfig::load(dir.path()).is_none());
    }

    #[test]
    fn deny_wins_over_ignore() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), r#"{"deny": true, "ignore": true}"#);
        let cfg = TrustConfig::load(dir.path()).unwrap();
        assert_eq!(cfg.evaluate(&identity()), ConfigVerdict::Deny);
    }

    #[test]
    fn ignore_allows() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), r#"{"ignore": true}"#);
        let cfg = TrustConfig::load(dir.path()).unwrap();
        assert_eq!(cfg.evaluate(&identity()), ConfigVerdict::Allow);
    }

    #[test]
    fn certificate_db_match_allows() {
        let dir = tempfile::tempdir().unwrap();
        let id = identity();
        let fp = id.fingerprint_by_hash(HashAlg::Sha256, false);
        write_config(
            dir.path(),
            &format!(r#"{{"certificate-db": [{{"type": "sha256", "hash": "{fp}"}}]}}"#),
        );
        let cfg = TrustConfig::load(dir.path()).unwrap();
        assert_eq!(cfg.evaluate(&id), ConfigVerdict::Allow);
    }

    #[test]
    fn certificate_db_mismatch_falls_through() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            r#"{"certificate-db": [{"type": "sha256", "hash": "00ff"}]}"#,
        );
        let cfg = TrustConfig::load(dir.path()).unwrap();
        assert_eq!(cfg.evaluate(&identity()), ConfigVerdict::AskUser);
    }

    #[test]
    fn unsupported_db_hash_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            r#"{"certificate-db": [{"type": "md5", "hash": "00ff"}], "deny-userconfig": true}"#,
        );
        let cfg = TrustConfig::load(dir.path()).unwrap();
        assert_eq!(cfg.evaluate(&identity()), ConfigVerdict::DenyUser);
    }

    #[test]
    fn invalid_json_means_no_rules() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), "{nope");
        assert!(TrustConfig::load(dir.path()).is_none());
    }
}
