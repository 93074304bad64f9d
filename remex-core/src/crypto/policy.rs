//! Trust policy: decides whether a presented server certificate is
//! acceptable for a `(host, port)` endpoint.
//!
//! The decision chain, in order: pre-approved fingerprints, the
//! already-accepted certificate for this transport leg, external
//! management, the explicit ignore switch, chain + hostname verification,
//! `certificates.json` rules, and finally the known-hosts store with a
//! user decision for unknown or changed identities.

use std::sync::{Arc, Mutex};

use tracing::{error, info, warn};

use crate::crypto::config::{ConfigVerdict, TrustConfig};
use crate::crypto::identity::{CertificateIdentity, HashAlg};
use crate::crypto::store::{CertificateStore, StoreMatch};
use crate::error::RemexError;
use crate::settings::{TransportKind, TrustSettings};

// ── Verify flags ─────────────────────────────────────────────────

/// Gateway or redirected transport (compatibility behavior applies).
pub const VERIFY_FLAG_LEGACY: u32 = 1 << 0;
/// Certificate presented by an RD gateway.
pub const VERIFY_FLAG_GATEWAY: u32 = 1 << 1;
/// Certificate presented after a redirection.
pub const VERIFY_FLAG_REDIRECT: u32 = 1 << 2;
/// The hostname did not match the certificate names.
pub const VERIFY_FLAG_MISMATCH: u32 = 1 << 3;
/// A stored identity exists and this certificate differs from it.
pub const VERIFY_FLAG_CHANGED: u32 = 1 << 4;

// ── Handler & verifier traits ────────────────────────────────────

/// Outcome of a certificate decision made outside the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertDecision {
    /// Refuse the certificate.
    Reject,
    /// Accept and persist to the known-hosts store.
    AcceptPermanent,
    /// Accept for this session only.
    AcceptTemporary,
}

/// Host-provided certificate decisions.
///
/// Replaces the callback pointers of classic RDP clients: register a
/// different implementation to change behavior.
pub trait CertificateHandler: Send + Sync {
    /// An identity with no stored record. `flags` carries the transport
    /// bits plus [`VERIFY_FLAG_MISMATCH`] when the name did not match.
    fn verify_new(&self, identity: &CertificateIdentity, flags: u32) -> CertDecision;

    /// A stored record exists with a different fingerprint. `previous`
    /// is the stored identity when it is still readable.
    fn verify_changed(
        &self,
        identity: &CertificateIdentity,
        previous: Option<&CertificateIdentity>,
        flags: u32,
    ) -> CertDecision;

    /// Full delegation when external management is enabled; receives the
    /// PEM form.
    fn verify_external(
        &self,
        pem: &str,
        hostname: &str,
        port: u16,
        flags: u32,
    ) -> CertDecision;
}

/// Chain verification against the configured trust anchors.
pub trait ChainVerifier: Send + Sync {
    /// `chain` is the presented chain, end-entity first, DER encoded.
    fn verify_chain(&self, chain: &[Vec<u8>], server_name: &str) -> bool;
}

/// Verifier with no anchors: every chain is untrusted, pushing the
/// decision to the store / user path.
#[derive(Debug, Default)]
pub struct NoAnchors;

impl ChainVerifier for NoAnchors {
    fn verify_chain(&self, _chain: &[Vec<u8>], _server_name: &str) -> bool {
        false
    }
}

// ── Accepted certificates ────────────────────────────────────────

/// The PEM most recently accepted on each transport leg. An acceptance
/// for the gateway never satisfies the target host and vice versa.
#[derive(Debug, Default)]
pub struct AcceptedCerts {
    direct: Option<String>,
    gateway: Option<String>,
    redirected: Option<String>,
}

impl AcceptedCerts {
    fn slot(&mut self, kind: TransportKind) -> &mut Option<String> {
        match kind {
            TransportKind::Direct => &mut self.direct,
            TransportKind::Gateway => &mut self.gateway,
            TransportKind::Redirected => &mut self.redirected,
        }
    }
}

// ── TrustPolicy ──────────────────────────────────────────────────

/// Pure decision layer between the TLS session and the host.
pub struct TrustPolicy {
    store: CertificateStore,
    settings: TrustSettings,
    transport: TransportKind,
    handler: Arc<dyn CertificateHandler>,
    chain_verifier: Arc<dyn ChainVerifier>,
    accepted: Mutex<AcceptedCerts>,
}

impl TrustPolicy {
    pub fn new(
        settings: TrustSettings,
        transport: TransportKind,
        handler: Arc<dyn CertificateHandler>,
        chain_verifier: Arc<dyn ChainVerifier>,
    ) -> Self {
        Self {
            store: CertificateStore::new(&settings.trust_dir),
            settings,
            transport,
            handler,
            chain_verifier,
            accepted: Mutex::new(AcceptedCerts::default()),
        }
    }

    /// The backing known-hosts store.
    pub fn store(&self) -> &CertificateStore {
        &self.store
    }

    /// Decide whether `identity` is acceptable. `chain` is the full
    /// presented chain, end-entity first.
    pub fn verify(
        &self,
        identity: &CertificateIdentity,
        chain: &[Vec<u8>],
    ) -> Result<(), RemexError> {
        let gateway = self.transport == TransportKind::Gateway;
        let redirected = self.transport == TransportKind::Redirected;

        let mut flags = 0u32;
        if gateway || redirected {
            flags |= VERIFY_FLAG_LEGACY;
        }
        if gateway {
            flags |= VERIFY_FLAG_GATEWAY;
        }
        if redirected {
            flags |= VERIFY_FLAG_REDIRECT;
        }

        // 1. Pre-approved fingerprint list.
        if self.is_accepted_fingerprint(identity) {
            return Ok(());
        }

        // 2. Already accepted on this transport leg.
        if self.is_accepted(identity) {
            return Ok(());
        }

        // 3. The host application owns certificate management.
        if self.settings.external_management {
            return match self.handler.verify_external(
                &identity.pem,
                &identity.hostname,
                identity.port,
                flags,
            ) {
                CertDecision::Reject => Err(self.rejected(identity)),
                _ => {
                    self.remember_accepted(identity);
                    Ok(())
                }
            };
        }

        // 4. Explicitly disabled verification.
        if self.settings.ignore_certificate {
            warn!("[DANGER] certificate not checked, ignore-certificate in use");
            warn!("[DANGER] this prevents MITM attacks from being detected!");
            warn!("[DANGER] avoid outside of isolated lab networks");
            return Ok(());
        }

        // Server authentication disabled for direct connections.
        if !gateway && self.settings.authentication_level == 0 {
            return Ok(());
        }

        // A configured certificate name replaces the hostname for
        // matching on direct transports.
        let hostname = match (&self.settings.certificate_name, gateway) {
            (Some(name), false) => name.as_str(),
            _ => identity.hostname.as_str(),
        };

        // 5. Chain verification + name matching.
        let chain_ok = self.chain_verifier.verify_chain(chain, hostname);
        let hostname_ok = identity.matches_hostname(hostname);
        if chain_ok && hostname_ok {
            self.remember_accepted(identity);
            return Ok(());
        }
        if !hostname_ok {
            flags |= VERIFY_FLAG_MISMATCH;
        }

        // 6. Site configuration file.
        let mut allow_user = true;
        if let Some(config) = TrustConfig::load(&self.settings.trust_dir) {
            match config.evaluate(identity) {
                ConfigVerdict::Deny => return Err(RemexError::CertificatePolicyDenied),
                ConfigVerdict::Allow => {
                    self.remember_accepted(identity);
                    return Ok(());
                }
                ConfigVerdict::DenyUser => allow_user = false,
                ConfigVerdict::AskUser => {}
            }
        }
        if !allow_user {
            return Err(RemexError::CertificatePolicyDenied);
        }

        // 7. Known-hosts store + user decision.
        let decision = match self.store.contains(identity) {
            StoreMatch::Match => CertDecision::AcceptTemporary,
            StoreMatch::Missing => {
                if !hostname_ok {
                    print_name_mismatch(identity, hostname);
                }
                print_new_identity(identity, &self.store);

                if self.settings.auto_accept {
                    info!("no identity stored, automatically accepting");
                    CertDecision::AcceptPermanent
                } else if self.settings.auto_deny {
                    info!("no identity stored, automatically denying");
                    CertDecision::Reject
                } else {
                    self.handler.verify_new(identity, flags)
                }
            }
            StoreMatch::Changed => {
                let previous = self.store.load(&identity.hostname, identity.port);
                print_changed_identity(identity, previous.as_ref(), &self.store);

                if self.settings.auto_deny {
                    info!("identity changed, automatically denying");
                    CertDecision::Reject
                } else {
                    self.handler
                        .verify_changed(identity, previous.as_ref(), flags | VERIFY_FLAG_CHANGED)
                }
            }
        };

        match decision {
            CertDecision::AcceptPermanent => {
                self.store.save(identity)?;
                self.remember_accepted(identity);
                Ok(())
            }
            CertDecision::AcceptTemporary => {
                self.remember_accepted(identity);
                Ok(())
            }
            CertDecision::Reject => Err(self.rejected(identity)),
        }
    }

    // ── Internal ─────────────────────────────────────────────────

    /// Compare against the configured fingerprint list, each entry in
    /// both separated and unseparated forms.
    fn is_accepted_fingerprint(&self, identity: &CertificateIdentity) -> bool {
        for raw in self
            .settings
            .accepted_fingerprints
            .iter()
            .flat_map(|s| s.split(','))
        {
            let Some((hash_name, fp)) = raw.trim().split_once(':') else {
                continue;
            };
            let Some(alg) = HashAlg::from_name(hash_name) else {
                warn!("accepted-fingerprint entry with unsupported hash {hash_name:?}");
                continue;
            };
            let separated = identity.fingerprint_by_hash(alg, true);
            let plain = identity.fingerprint_by_hash(alg, false);
            if fp.eq_ignore_ascii_case(&separated) || fp.eq_ignore_ascii_case(&plain) {
                return true;
            }
        }
        false
    }

    /// Byte-compare against the accepted PEM for this transport leg.
    /// A mismatch clears the slot.
    fn is_accepted(&self, identity: &CertificateIdentity) -> bool {
        let mut accepted = self.accepted.lock().expect("accepted certs lock");
        let slot = accepted.slot(self.transport);
        match slot {
            Some(pem) if *pem == identity.pem => true,
            Some(_) => {
                *slot = None;
                false
            }
            None => false,
        }
    }

    fn remember_accepted(&self, identity: &CertificateIdentity) {
        let mut accepted = self.accepted.lock().expect("accepted certs lock");
        *accepted.slot(self.transport) = Some(identity.pem.clone());
    }

    fn rejected(&self, identity: &CertificateIdentity) -> RemexError {
        RemexError::CertificateRejected {
            hostname: identity.hostname.clone(),
            port: identity.port,
        }
    }
}

// ── Diagnostics ──────────────────────────────────────────────────

fn print_new_identity(identity: &CertificateIdentity, store: &CertificateStore) {
    let path = store.entry_path(&identity.hostname, identity.port);
    warn!(
        "new host identity for {}:{}",
        identity.hostname, identity.port
    );
    warn!("certificate fingerprint: {}", identity.fingerprint);
    warn!("subject: {}", identity.subject);
    warn!("issuer:  {}", identity.issuer);
    warn!(
        "accepting will record this identity in {}",
        path.display()
    );
}

fn print_changed_identity(
    identity: &CertificateIdentity,
    previous: Option<&CertificateIdentity>,
    store: &CertificateStore,
) {
    let path = store.entry_path(&identity.hostname, identity.port);
    error!(
        "the host identity for {}:{} HAS CHANGED",
        identity.hostname, identity.port
    );
    error!("@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@");
    error!("@    WARNING: REMOTE HOST IDENTIFICATION HAS CHANGED!     @");
    error!("@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@");
    error!("someone could be eavesdropping on this connection right now");
    error!("(man-in-the-middle attack), or the host key was just changed.");
    error!("presented fingerprint: {}", identity.fingerprint);
    if let Some(old) = previous {
        error!("stored subject:     {}", old.subject);
        error!("stored issuer:      {}", old.issuer);
        error!("stored fingerprint: {}", old.fingerprint);
    }
    error!("remove {} if the change is expected", path.display());
}

fn print_name_mismatch(identity: &CertificateIdentity, hostname: &str) {
    error!("@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@");
    error!("@           WARNING: CERTIFICATE NAME MISMATCH!           @");
    error!("@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@");
    error!(
        "the hostname used for this connection ({hostname}:{}) does not",
        identity.port
    );
    error!("match any name in the certificate:");
    match identity.common_name() {
        Some(cn) => error!("  common name: {cn}"),
        None => error!("  no common name in certificate"),
    }
    for name in identity.dns_names() {
        error!("  alternative name: {name}");
    }
    error!("a valid certificate for the wrong name should NOT be trusted!");
}

// ── Tests ────────────────────────────────────────────────────────
