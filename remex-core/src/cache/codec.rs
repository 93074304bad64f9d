//! Pluggable bitmap decompression.
//!
//! Drawing orders name a codec by id; the registry resolves it. Id 0 is
//! always the pass-through codec for uncompressed payloads; id 1 is the
//! conventional slot for the wire's default compression, which hosts
//! overwrite with their own implementation.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::RemexError;

/// Uncompressed payload.
pub const CODEC_ID_NONE: u8 = 0;
/// Default wire compression slot (v1/v2 `compressed` payloads).
pub const CODEC_ID_INTERLEAVED: u8 = 1;

/// Bytes per pixel for a given depth. 15-bpp pixels occupy two bytes.
pub fn pixel_bytes(bpp: u32) -> usize {
    match bpp {
        15 => 2,
        b => (b as usize + 7) / 8,
    }
}

// ── BitmapCodec ──────────────────────────────────────────────────

/// Decodes a wire payload into tightly packed pixel rows.
pub trait BitmapCodec: Send + Sync {
    /// Returns exactly `width * height * pixel_bytes(bpp)` bytes.
    fn decode(&self, data: &[u8], width: u16, height: u16, bpp: u32)
        -> Result<Vec<u8>, RemexError>;
}

/// Pass-through codec: validates the raw payload size and copies it.
#[derive(Debug, Default)]
pub struct NoCodec;

impl BitmapCodec for NoCodec {
    fn decode(
        &self,
        data: &[u8],
        width: u16,
        height: u16,
        bpp: u32,
    ) -> Result<Vec<u8>, RemexError> {
        let expected = width as usize * height as usize * pixel_bytes(bpp);
        if data.len() < expected {
            return Err(RemexError::BitmapDecode(format!(
                "raw payload too short: {} < {expected}",
                data.len()
            )));
        }
        Ok(data[..expected].to_vec())
    }
}

/// zstd-compressed payloads.
#[derive(Debug, Default)]
pub struct ZstdCodec;

impl BitmapCodec for ZstdCodec {
    fn decode(
        &self,
        data: &[u8],
        width: u16,
        height: u16,
        bpp: u32,
    ) -> Result<Vec<u8>, RemexError> {
        let decoded = zstd::decode_all(data)
            .map_err(|e| RemexError::BitmapDecode(format!("zstd decode failed: {e}")))?;
        let expected = width as usize * height as usize * pixel_bytes(bpp);
        if decoded.len() < expected {
            return Err(RemexError::BitmapDecode(format!(
                "decoded payload too short: {} < {expected}",
                decoded.len()
            )));
        }
        Ok(decoded[..expected].to_vec())
    }
}

// ── CodecRegistry ────────────────────────────────────────────────

/// Codec lookup table keyed by wire codec id.
pub struct CodecRegistry {
    codecs: HashMap<u8, Arc<dyn BitmapCodec>>,
}

impl CodecRegistry {
    /// Registry with the pass-through codec pre-installed at id 0.
    pub fn new() -> Self {
        let mut codecs: HashMap<u8, Arc<dyn BitmapCodec>> = HashMap::new();
        codecs.insert(CODEC_ID_NONE, Arc::new(NoCodec));
        Self { codecs }
    }

    /// Install or replace a codec.
    pub fn register(&mut self, id: u8, codec: Arc<dyn BitmapCodec>) {
        self.codecs.insert(id, codec);
    }

    /// Decode `data` with the codec registered under `id`.
    pub fn decode(
        &self,
        id: u8,
        data: &[u8],
        width: u16,
        height: u16,
        bpp: u32,
    ) -> Result<Vec<u8>, RemexError> {
        let codec = self.codecs.get(&id).ok_or(RemexError::UnknownCodec(id))?;
        codec.decode(data, width, height, bpp)
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ────────────────────────────────────────────────────────
