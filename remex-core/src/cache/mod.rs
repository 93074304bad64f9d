//! Content-addressed bitmap caching.
//!
//! [`BitmapCache`] holds the in-memory cells referenced by drawing
//! orders; [`PersistentCacheFile`] is the disk sidecar for long-lived
//! entries; [`BitmapCodec`] is the seam to pluggable decompressors.

mod bitmap;
mod codec;
mod persist;

pub use bitmap::{BitmapCache, CachedBitmap, WAITING_LIST_INDEX};
pub use codec::{
    pixel_bytes, BitmapCodec, CodecRegistry, NoCodec, ZstdCodec, CODEC_ID_INTERLEAVED,
    CODEC_ID_NONE,
};
pub use persist::{PersistentCacheFile, PersistentEntry};
