//! Drawing-order dispatch.
//!
//! Binds the cache-bitmap and memory-blit order callbacks to the bitmap
//! cache and forwards resolved bitmaps to a [`RenderSink`]. Behavior is
//! swapped by registering different trait implementations, not by
//! rewriting callback pointers.

use tracing::debug;

use crate::cache::{
    BitmapCache, CachedBitmap, CodecRegistry, CODEC_ID_INTERLEAVED, CODEC_ID_NONE,
};
use crate::error::RemexError;
use crate::settings::SessionSettings;

/// `cache_id` value routing a MEMBLT/MEM3BLT to the offscreen surface
/// cache instead of a bitmap cache cell.
pub const OFFSCREEN_CACHE_ID: u8 = 0xFF;

/// Brush style flag marking a brush-cache reference.
pub const CACHED_BRUSH: u8 = 0x80;

/// Brush style used while a resolved cached brush is being drawn.
const BRUSH_STYLE_PATTERN: u8 = 0x03;

// ── Order types ──────────────────────────────────────────────────

/// MEMBLT: blit a cached bitmap to the output surface.
#[derive(Debug, Clone)]
pub struct MemBltOrder {
    pub cache_id: u8,
    pub cache_index: u16,
    pub dest_left: i32,
    pub dest_top: i32,
    pub width: u16,
    pub height: u16,
    pub src_x: u16,
    pub src_y: u16,
    pub rop: u8,
}

/// Brush reference carried by MEM3BLT.
#[derive(Debug, Clone, Default)]
pub struct BrushRef {
    pub x: u8,
    pub y: u8,
    pub style: u8,
    pub hatch: u8,
    /// Brush cache slot, meaningful when `style` carries [`CACHED_BRUSH`].
    pub index: u8,
    pub bpp: u32,
    pub data: Vec<u8>,
}

/// MEM3BLT: blit a cached bitmap mixed with a brush.
#[derive(Debug, Clone)]
pub struct Mem3BltOrder {
    pub cache_id: u8,
    pub cache_index: u16,
    pub dest_left: i32,
    pub dest_top: i32,
    pub width: u16,
    pub height: u16,
    pub src_x: u16,
    pub src_y: u16,
    pub rop: u8,
    pub brush: BrushRef,
    pub fg_color: u32,
    pub bg_color: u32,
}

/// CACHE_BITMAP (v1): no content key, compression decided per order.
#[derive(Debug, Clone)]
pub struct CacheBitmapOrder {
    pub cache_id: u8,
    pub cache_index: u16,
    pub width: u16,
    pub height: u16,
    pub bpp: u32,
    pub compressed: bool,
    pub data: Vec<u8>,
}

/// CACHE_BITMAP_V2: adds the 64-bit content key halves.
#[derive(Debug, Clone)]
pub struct CacheBitmapV2Order {
    pub cache_id: u8,
    pub cache_index: u16,
    pub key1: u32,
    pub key2: u32,
    pub width: u16,
    pub height: u16,
    /// May be zero; defaults to the session color depth.
    pub bpp: u32,
    pub compressed: bool,
    pub data: Vec<u8>,
}

/// CACHE_BITMAP_V3: explicit codec id instead of a compressed flag.
#[derive(Debug, Clone)]
pub struct CacheBitmapV3Order {
    pub cache_id: u8,
    pub cache_index: u16,
    pub key1: u32,
    pub key2: u32,
    pub width: u16,
    pub height: u16,
    /// May be zero; defaults to the session color depth.
    pub bpp: u32,
    pub codec_id: u8,
    pub data: Vec<u8>,
}

// ── Collaborator traits ──────────────────────────────────────────

/// Downstream renderer receiving resolved blits.
pub trait RenderSink: Send {
    fn mem_blt(&mut self, order: &MemBltOrder, bitmap: &CachedBitmap) -> Result<(), RemexError>;
    fn mem3_blt(&mut self, order: &Mem3BltOrder, bitmap: &CachedBitmap)
        -> Result<(), RemexError>;
}

/// Offscreen surface cache (external collaborator).
pub trait OffscreenSource: Send {
    fn get(&self, index: u16) -> Option<&CachedBitmap>;
}

/// Brush cache (external collaborator). Returns `(data, bpp)`.
pub trait BrushSource: Send {
    fn get(&self, index: u8) -> Option<(Vec<u8>, u32)>;
}

// ── OrderDispatcher ──────────────────────────────────────────────

/// Stateless glue between wire order callbacks and the bitmap cache.
pub struct OrderDispatcher {
    cache: BitmapCache,
    codecs: CodecRegistry,
    sink: Box<dyn RenderSink>,
    offscreen: Box<dyn OffscreenSource>,
    brushes: Box<dyn BrushSource>,
    color_depth: u32,
}

impl OrderDispatcher {
    /// Register the dispatcher for a session. Returns `None` when
    /// client-side decoding is disabled by configuration.
    pub fn register(
        settings: &SessionSettings,
        codecs: CodecRegistry,
        sink: Box<dyn RenderSink>,
        offscreen: Box<dyn OffscreenSource>,
        brushes: Box<dyn BrushSource>,
    ) -> Option<Self> {
        if !settings.decoding_enabled {
            return None;
        }
        Some(Self {
            cache: BitmapCache::new(&settings.cache),
            codecs,
            sink,
            offscreen,
            brushes,
            color_depth: settings.color_depth,
        })
    }

    /// The backing bitmap cache.
    pub fn cache(&self) -> &BitmapCache {
        &self.cache
    }

    /// Mutable access, e.g. for warming or teardown flushing.
    pub fn cache_mut(&mut self) -> &mut BitmapCache {
        &mut self.cache
    }

    // ── Blits ────────────────────────────────────────────────────

    /// MEMBLT. An undefined source bitmap is tolerated silently: the
    /// order succeeds and nothing is drawn.
    pub fn mem_blt(&mut self, order: &MemBltOrder) -> Result<(), RemexError> {
        let bitmap = if order.cache_id == OFFSCREEN_CACHE_ID {
            self.offscreen.get(order.cache_index)
        } else {
            self.cache.get(order.cache_id, order.cache_index)
        };
        let Some(bitmap) = bitmap else {
            debug!(
                "memblt: no bitmap at cell {} index {}, skipping",
                order.cache_id, order.cache_index
            );
            return Ok(());
        };
        self.sink.mem_blt(order, bitmap)
    }

    /// MEM3BLT. A cached brush is resolved from the brush cache and the
    /// order's style reads `0x03` for the duration of the draw call;
    /// the caller's value is restored afterwards.
    pub fn mem3_blt(&mut self, order: &mut Mem3BltOrder) -> Result<(), RemexError> {
        let bitmap = if order.cache_id == OFFSCREEN_CACHE_ID {
            self.offscreen.get(order.cache_index)
        } else {
            self.cache.get(order.cache_id, order.cache_index)
        };
        let Some(bitmap) = bitmap else {
            return Ok(());
        };

        let saved_style = order.brush.style;
        if order.brush.style & CACHED_BRUSH != 0 {
            let Some((data, bpp)) = self.brushes.get(order.brush.index) else {
                return Err(RemexError::BrushUnavailable {
                    index: order.brush.index,
                });
            };
            order.brush.data = data;
            order.brush.bpp = bpp;
            order.brush.style = BRUSH_STYLE_PATTERN;
        }

        let result = self.sink.mem3_blt(order, bitmap);
        order.brush.style = saved_style;
        result
    }

    // ── Cache installs ───────────────────────────────────────────

    /// CACHE_BITMAP (v1).
    pub fn cache_bitmap(&mut self, order: &CacheBitmapOrder) -> Result<(), RemexError> {
        let data = self.decode_payload(
            order.compressed,
            CODEC_ID_NONE,
            &order.data,
            order.width,
            order.height,
            order.bpp,
        )?;
        self.cache.put(
            order.cache_id,
            order.cache_index,
            CachedBitmap {
                width: order.width,
                height: order.height,
                bpp: order.bpp,
                key64: 0,
                data,
            },
        )
    }

    /// CACHE_BITMAP_V2. Zero BPP inherits the session depth; a 16-bpp
    /// claim under a 15-bpp session is coerced to 15.
    pub fn cache_bitmap_v2(&mut self, order: &CacheBitmapV2Order) -> Result<(), RemexError> {
        let mut bpp = order.bpp;
        if bpp == 0 {
            bpp = self.color_depth;
        }
        if self.color_depth == 15 && bpp == 16 {
            bpp = self.color_depth;
        }

        let data = self.decode_payload(
            order.compressed,
            CODEC_ID_NONE,
            &order.data,
            order.width,
            order.height,
            bpp,
        )?;
        self.cache.put(
            order.cache_id,
            order.cache_index,
            CachedBitmap {
                width: order.width,
                height: order.height,
                bpp,
                key64: u64::from(order.key1) | (u64::from(order.key2) << 32),
                data,
            },
        )
    }

    /// CACHE_BITMAP_V3. The codec id decides the decompressor.
    pub fn cache_bitmap_v3(&mut self, order: &CacheBitmapV3Order) -> Result<(), RemexError> {
        let mut bpp = order.bpp;
        if bpp == 0 {
            bpp = self.color_depth;
        }

        let compressed = order.codec_id != CODEC_ID_NONE;
        let data = self.decode_payload(
            compressed,
            order.codec_id,
            &order.data,
            order.width,
            order.height,
            bpp,
        )?;
        self.cache.put(
            order.cache_id,
            order.cache_index,
            CachedBitmap {
                width: order.width,
                height: order.height,
                bpp,
                key64: u64::from(order.key1) | (u64::from(order.key2) << 32),
                data,
            },
        )
    }

    /// v1/v2 compressed payloads use the default wire codec; v3 names
    /// its codec explicitly.
    fn decode_payload(
        &self,
        compressed: bool,
        codec_id: u8,
        data: &[u8],
        width: u16,
        height: u16,
        bpp: u32,
    ) -> Result<Vec<u8>, RemexError> {
        let id = if !compressed {
            CODEC_ID_NONE
        } else if codec_id == CODEC_ID_NONE {
            CODEC_ID_INTERLEAVED
        } else {
            codec_id
        };
        self.codecs.decode(id, data, width, height, bpp)
    }
}

// ── Tests ────────────────────────────────────────────────────────
