//! Domain-specific error types for the remex stack.
//!
//! All fallible operations return `Result<T, RemexError>`.
//! No panics on invalid input — every error is typed and recoverable.

use thiserror::Error;

/// The canonical error type for the remex stack.
#[derive(Debug, Error)]
pub enum RemexError {
    // ── Transport Errors ─────────────────────────────────────────
    /// The underlying byte transport failed.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The session abort event fired while an operation was in flight.
    #[error("session aborted")]
    Aborted,

    // ── TLS Errors ───────────────────────────────────────────────
    /// The TLS handshake could not complete. Fatal for the session.
    #[error("tls handshake failed: {0}")]
    TlsHandshake(#[from] rustls::Error),

    /// A session operation was attempted in the wrong state.
    #[error("invalid session state: {0}")]
    SessionState(&'static str),

    // ── Certificate Errors ───────────────────────────────────────
    /// The user or a trust rule refused the presented certificate.
    #[error("certificate rejected for {hostname}:{port}")]
    CertificateRejected { hostname: String, port: u16 },

    /// No usable key, PEM, or fingerprint could be extracted.
    #[error("malformed certificate: {0}")]
    CertificateMalformed(&'static str),

    /// The trust configuration file unconditionally denied the peer.
    #[error("certificate denied by configuration policy")]
    CertificatePolicyDenied,

    // ── Cache Errors ─────────────────────────────────────────────
    /// A drawing order referenced a cache cell or slot that does not exist.
    ///
    /// Distinct from a *defined but empty* slot, which is absorbed silently.
    #[error("invalid cache reference: cell {cell_id}, index {index}")]
    InvalidCacheReference { cell_id: u8, index: u16 },

    /// A MEM3BLT referenced a cached brush that is not resolvable.
    #[error("cached brush {index} unavailable")]
    BrushUnavailable { index: u8 },

    /// A codec required by a drawing order is not registered.
    #[error("no bitmap codec registered for id {0}")]
    UnknownCodec(u8),

    /// A bitmap payload failed to decode.
    #[error("bitmap decode failed: {0}")]
    BitmapDecode(String),

    // ── Configuration Errors ─────────────────────────────────────
    /// Configuration integers or strings out of range. Fatal at start.
    #[error("bad configuration: {0}")]
    BadConfiguration(String),
}

impl From<String> for RemexError {
    fn from(s: String) -> Self {
        RemexError::BadConfiguration(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = RemexError::CertificateRejected {
            hostname: "rdp.example.com".into(),
            port: 3389,
        };
        assert!(e.to_string().contains("rdp.example.com"));
        assert!(e.to_string().contains("3389"));

        let e = RemexError::InvalidCacheReference {
            cell_id: 7,
            index: 99,
        };
        assert!(e.to_string().contains('7'));
        assert!(e.to_string().contains("99"));
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let e: RemexError = io_err.into();
        assert!(matches!(e, RemexError::Transport(_)));
    }
}
