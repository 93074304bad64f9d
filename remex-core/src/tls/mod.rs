//! TLS layered over a byte-oriented transport.
//!
//! [`TlsSession`] drives the handshake state machine, extracts the peer
//! identity and channel-binding token, and defers the trust decision to
//! [`crate::crypto::TrustPolicy`].

mod keylog;
mod session;
mod verifier;

pub use keylog::KeyLogToFile;
pub use session::{
    alert, HandshakeProgress, SessionState, TlsAlert, TlsSession, WriteOutcome,
};
pub use verifier::{AnchorDirVerifier, DeferredVerifier};
