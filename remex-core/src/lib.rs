//! remex-core — client protocol stack for the remex remote desktop tools.
//!
//! The crate covers the two subsystems that decide whether a session can
//! be established securely and whether drawing is correct: the TLS
//! transport with certificate trust resolution, and the bitmap caching
//! pipeline driven by drawing orders. Wire parsing and rendering live in
//! the host crates and talk to this one through traits.

mod error;
mod ringbuf;
mod settings;

pub mod cache;
pub mod crypto;
pub mod orders;
pub mod tls;

pub use error::RemexError;
pub use ringbuf::RingBuffer;
pub use settings::{
    CacheSettings, CellSettings, SessionSettings, TlsSettings, TlsVersion, TransportKind,
    TrustSettings, MAX_CACHE_CELLS, MAX_CELL_ENTRIES,
};
