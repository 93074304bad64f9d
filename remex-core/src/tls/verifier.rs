//! Certificate verifiers for the TLS engine.
//!
//! [`DeferredVerifier`] lets the handshake complete with any certificate
//! so the trust policy can run afterwards with the full chain in hand.
//! [`AnchorDirVerifier`] is the policy's chain checker, backed by a
//! directory of PEM trust anchors.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use tracing::{debug, warn};

use crate::crypto::ChainVerifier;

// ── DeferredVerifier ─────────────────────────────────────────────

/// Accepts any server certificate at handshake time.
///
/// Handshake signatures are still checked, so the peer must actually hold
/// the presented key; only *trust* in the certificate is deferred to the
/// policy layer that runs on handshake completion.
#[derive(Debug)]
pub struct DeferredVerifier {
    algorithms: WebPkiSupportedAlgorithms,
}

impl DeferredVerifier {
    pub fn new(provider: &CryptoProvider) -> Self {
        Self {
            algorithms: provider.signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for DeferredVerifier {
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
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

// ── AnchorDirVerifier ────────────────────────────────────────────

/// Chain verification against `<trust_dir>/anchors/*.pem`.
///
/// An empty or missing anchor directory yields a verifier that trusts
/// nothing, which routes every certificate to the first-use path.
pub struct AnchorDirVerifier {
    verifier: Option<Arc<WebPkiServerVerifier>>,
}

impl AnchorDirVerifier {
    pub fn from_dir(dir: &Path) -> Self {
        Self::with_provider(dir, Arc::new(rustls::crypto::ring::default_provider()))
    }

    pub fn with_provider(dir: &Path, provider: Arc<CryptoProvider>) -> Self {
        let mut roots = RootCertStore::empty();

        if let Ok(entries) = fs::read_dir(dir) {
            for entry in entries.filter_map(Result::ok) {
                let path = entry.path();
                let Ok(text) = fs::read_to_string(&path) else {
                    continue;
                };
                let Ok(pems) = pem::parse_many(&text) else {
                    debug!("skipping non-PEM anchor file {}", path.display());
                    continue;
                };
                for block in pems.iter().filter(|p| p.tag() == "CERTIFICATE") {
                    let der = CertificateDer::from(block.contents().to_vec());
                    if let Err(e) = roots.add(der) {
                        warn!("rejected trust anchor in {}: {e}", path.display());
                    }
                }
            }
        }

        if roots.is_empty() {
            return Self { verifier: None };
        }

        let verifier = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider)
            .build()
            .map_err(|e| warn!("trust anchor verifier unavailable: {e}"))
            .ok();
        Self { verifier }
    }
}

impl ChainVerifier for AnchorDirVerifier {
    fn verify_chain(&self, chain: &[Vec<u8>], server_name: &str) -> bool {
        let Some(verifier) = &self.verifier else {
            return false;
        };
        let Some((end_entity, intermediates)) = chain.split_first() else {
            return false;
        };
        let Ok(name) = ServerName::try_from(server_name.to_string()) else {
            return false;
        };

        let end_entity = CertificateDer::from(end_entity.clone());
        let intermediates: Vec<CertificateDer<'_>> = intermediates
            .iter()
            .map(|der| CertificateDer::from(der.clone()))
            .collect();

        verifier
            .verify_server_cert(&end_entity, &intermediates, &name, &[], UnixTime::now())
            .is_ok()
    }
}

// ── Tests ────────────────────────────────────────────────────────
