//! Certificate identity: the subset of an X.509 certificate the trust
//! machinery cares about.
//!
//! The PEM encoding is the canonical equality form; fingerprints are hex
//! digests over the DER encoding. MD5- and SHA-1-signed certificates are
//! upgraded to SHA-256 for hashing purposes (RFC 5929).

use sha2::{Digest, Sha256, Sha384, Sha512};
use x509_parser::prelude::*;

use crate::error::RemexError;

/// Fixed ASCII prefix of the channel-binding token (RFC 5929).
pub const TLS_SERVER_END_POINT: &[u8] = b"tls-server-end-point:";

// ── HashAlg ──────────────────────────────────────────────────────

/// Digest algorithms usable for fingerprints and channel bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlg {
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlg {
    /// Parse a hash name as it appears in fingerprint lists and
    /// `certificate-db` entries. Unknown names yield `None`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "sha256" | "sha-256" => Some(Self::Sha256),
            "sha384" | "sha-384" => Some(Self::Sha384),
            "sha512" | "sha-512" => Some(Self::Sha512),
            _ => None,
        }
    }

    /// Digest `data` with this algorithm.
    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha256 => Sha256::digest(data).to_vec(),
            Self::Sha384 => Sha384::digest(data).to_vec(),
            Self::Sha512 => Sha512::digest(data).to_vec(),
        }
    }
}

// ── CertificateIdentity ──────────────────────────────────────────

/// An endpoint identity: the `(host, port)` binding plus the certificate
/// fields the store records and the policy compares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateIdentity {
    /// Hostname this certificate was presented for.
    pub hostname: String,
    /// Port this certificate was presented on.
    pub port: u16,
    /// X.509 subject, RFC 2253 form.
    pub subject: String,
    /// X.509 issuer, RFC 2253 form.
    pub issuer: String,
    /// Default fingerprint: SHA-256 over DER, `aa:bb:cc…` form.
    pub fingerprint: String,
    /// PEM encoding; canonical equality form.
    pub pem: String,
    /// Raw DER encoding.
    pub der: Vec<u8>,
}

impl CertificateIdentity {
    /// Build an identity from the DER certificate a peer presented.
    pub fn from_der(hostname: &str, port: u16, der: &[u8]) -> Result<Self, RemexError> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|_| RemexError::CertificateMalformed("unparseable DER"))?;

        let pem = ::pem::encode(&::pem::Pem::new("CERTIFICATE", der.to_vec()));
        let fingerprint = hex_fingerprint(&HashAlg::Sha256.digest(der), true);

        Ok(Self {
            hostname: hostname.to_string(),
            port,
            subject: cert.subject().to_string(),
            issuer: cert.issuer().to_string(),
            fingerprint,
            pem,
            der: der.to_vec(),
        })
    }

    /// Rebuild an identity from a stored PEM entry.
    pub fn from_pem(hostname: &str, port: u16, pem_text: &str) -> Result<Self, RemexError> {
        let parsed = ::pem::parse(pem_text)
            .map_err(|_| RemexError::CertificateMalformed("unparseable PEM"))?;
        Self::from_der(hostname, port, parsed.contents())
    }

    /// Fingerprint with an explicit algorithm, with or without `:`
    /// separators.
    pub fn fingerprint_by_hash(&self, alg: HashAlg, separator: bool) -> String {
        hex_fingerprint(&alg.digest(&self.der), separator)
    }

    /// The hash algorithm channel bindings use for this certificate.
    ///
    /// The certificate's own signature hash, except MD5 and SHA-1 which
    /// are upgraded to SHA-256. Algorithms without an extractable hash
    /// (e.g. Ed25519) also map to SHA-256.
    pub fn binding_hash(&self) -> HashAlg {
        let Ok((_, cert)) = X509Certificate::from_der(&self.der) else {
            return HashAlg::Sha256;
        };

        match cert.signature_algorithm.algorithm.to_id_string().as_str() {
            // sha384WithRSAEncryption, ecdsa-with-SHA384
            "1.2.840.113549.1.1.12" | "1.2.840.10045.4.3.3" => HashAlg::Sha384,
            // sha512WithRSAEncryption, ecdsa-with-SHA512
            "1.2.840.113549.1.1.13" | "1.2.840.10045.4.3.4" => HashAlg::Sha512,
            // Everything else, including md5/sha1 signatures upgraded per
            // RFC 5929 and algorithms with no extractable hash.
            _ => HashAlg::Sha256,
        }
    }

    /// `"tls-server-end-point:" || hash(cert)`, raw digest bytes appended
    /// to the ASCII prefix. Used verbatim by upstream authentication.
    pub fn channel_binding_token(&self) -> Vec<u8> {
        let digest = self.binding_hash().digest(&self.der);
        let mut token = Vec::with_capacity(TLS_SERVER_END_POINT.len() + digest.len());
        token.extend_from_slice(TLS_SERVER_END_POINT);
        token.extend_from_slice(&digest);
        token
    }

    /// DER-encoded SubjectPublicKeyInfo.
    pub fn public_key(&self) -> Result<Vec<u8>, RemexError> {
        let (_, cert) = X509Certificate::from_der(&self.der)
            .map_err(|_| RemexError::CertificateMalformed("unparseable DER"))?;
        Ok(cert.public_key().raw.to_vec())
    }

    /// Subject Common Name, if present.
    pub fn common_name(&self) -> Option<String> {
        let (_, cert) = X509Certificate::from_der(&self.der).ok()?;
        let name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_string);
        name
    }

    /// DNS entries of the Subject Alternative Name extension.
    pub fn dns_names(&self) -> Vec<String> {
        let Ok((_, cert)) = X509Certificate::from_der(&self.der) else {
            return Vec::new();
        };
        let Ok(Some(san)) = cert.subject_alternative_name() else {
            return Vec::new();
        };
        san.value
            .general_names
            .iter()
            .filter_map(|gn| match gn {
                GeneralName::DNSName(d) => Some((*d).to_string()),
                _ => None,
            })
            .collect()
    }

    /// Whether `hostname` matches the Common Name or any DNS SAN,
    /// honoring the `*.` wildcard rule.
    pub fn matches_hostname(&self, hostname: &str) -> bool {
        if let Some(cn) = self.common_name() {
            if match_hostname(&cn, hostname) {
                return true;
            }
        }
        self.dns_names()
            .iter()
            .any(|name| match_hostname(name, hostname))
    }

    /// Same `(hostname, port)` binding.
    pub fn same_host(&self, other: &Self) -> bool {
        self.port == other.port && self.hostname.eq_ignore_ascii_case(&other.hostname)
    }
}

// ── Hostname matching ────────────────────────────────────────────

/// Case-insensitive hostname match with single-label `*.` wildcards.
///
/// `*.example.com` matches `rdp.example.com` but neither `example.com`
/// nor `a.b.example.com`.
pub fn match_hostname(pattern: &str, hostname: &str) -> bool {
    if pattern.eq_ignore_ascii_case(hostname) {
        return true;
    }

    if let Some(suffix) = pattern.strip_prefix("*.") {
        let Some(dot) = hostname.find('.') else {
            return false;
        };
        let (label, rest) = hostname.split_at(dot);
        return !label.is_empty() && rest[1..].eq_ignore_ascii_case(suffix);
    }

    false
}

fn hex_fingerprint(digest: &[u8], separator: bool) -> String {
    let mut out = String::with_capacity(digest.len() * 3);
    for (i, byte) in digest.iter().enumerate() {
        if separator && i > 0 {
            out.push(':');
        }
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn test_identity(names: &[&str]) -> CertificateIdentity {
        let key = rcgen::KeyPair::generate().unwrap();
        let params =
            rcgen::CertificateParams::new(names.iter().map(|n| n.to_string()).collect::<Vec<_>>())
                .unwrap();
        let cert = params.self_signed(&key).unwrap();
        CertificateIdentity::from_der("rdp.example.com", 3389, cert.der()).unwrap()
    }

    #[test]
    fn wildcard_matches_single_label() {
        assert!(match_hostname("*.example.com", "rdp.example.com"));
        assert!(match_hostname("*.EXAMPLE.com", "rdp.example.COM"));
        assert!(!match_hostname("*.example.com", "example.com"));
        assert!(!match_hostname("*.example.com", "a.b.example.com"));
        assert!(!match_hostname("*.example.com", "rdpexample.com"));
    }

    #[test]
    fn exact_match_is_case_insensitive() {
        assert!(match_hostname("RDP.Example.Com", "rdp.example.com"));
        assert!(!match_hostname("rdp.example.com", "rdp.example.org"));
    }

    #[test]
    fn identity_fields_extracted() {
        let id = test_identity(&["rdp.example.com"]);
        assert!(!id.subject.is_empty());
        assert!(!id.issuer.is_empty());
        assert!(id.pem.starts_with("-----BEGIN CERTIFICATE-----"));
        // sha256 → 32 bytes → 64 hex chars + 31 separators
        assert_eq!(id.fingerprint.len(), 95);
    }

    #[test]
    fn fingerprint_separator_forms() {
        let id = test_identity(&["rdp.example.com"]);
        let with = id.fingerprint_by_hash(HashAlg::Sha256, true);
        let without = id.fingerprint_by_hash(HashAlg::Sha256, false);
        assert_eq!(with.replace(':', ""), without);
        assert_eq!(with, id.fingerprint);
    }

    #[test]
    fn san_hostname_matching() {
        let id = test_identity(&["rdp.example.com", "*.backup.example.com"]);
        assert!(id.matches_hostname("rdp.example.com"));
        assert!(id.matches_hostname("a.backup.example.com"));
        assert!(!id.matches_hostname("other.example.com"));
    }

    #[test]
    fn binding_token_has_prefix_and_digest() {
        let id = test_identity(&["rdp.example.com"]);
        let token = id.channel_binding_token();
        assert!(token.starts_with(TLS_SERVER_END_POINT));
        // rcgen default is ECDSA-P256-SHA256, so the digest is 32 bytes.
        assert_eq!(token.len(), TLS_SERVER_END_POINT.len() + 32);
    }

    #[test]
    fn pem_roundtrip() {
        let id = test_identity(&["rdp.example.com"]);
        let back = CertificateIdentity::from_pem("rdp.example.com", 3389, &id.pem).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn public_key_extractable() {
        let id = test_identity(&["rdp.example.com"]);
        let key = id.public_key().unwrap();
        assert!(!key.is_empty());
    }

    #[test]
    fn malformed_der_is_typed_error() {
        let err = CertificateIdentity::from_der("h", 1, &[0x30, 0x00]).unwrap_err();
        assert!(matches!(err, RemexError::CertificateMalformed(_)));
    }
}
