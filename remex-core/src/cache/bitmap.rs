//! In-memory bitmap cache cells.
//!
//! A cache is an ordered set of cells; a drawing order addresses a slot
//! by `(cache_id, cache_index)`. Every cell carries one extra slot past
//! its advertised capacity, selected by [`WAITING_LIST_INDEX`], which
//! servers use for "the next-to-be-assigned entry".
//!
//! Gets on empty slots are *not* errors: XP-era servers reference
//! bitmaps they never defined, and the renderer must carry on.

use std::path::PathBuf;

use tracing::{error, warn};

use crate::cache::codec::pixel_bytes;
use crate::cache::persist::{PersistentCacheFile, PersistentEntry};
use crate::error::RemexError;
use crate::settings::CacheSettings;

/// Reserved index selecting a cell's overflow slot.
pub const WAITING_LIST_INDEX: u16 = 0x7FFF;

// ── CachedBitmap ─────────────────────────────────────────────────

/// A decoded bitmap owned by the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedBitmap {
    pub width: u16,
    pub height: u16,
    pub bpp: u32,
    /// 64-bit content key; 0 for keyless (v1) bitmaps.
    pub key64: u64,
    /// Tightly packed pixel rows, `width * height * pixel_bytes(bpp)`.
    pub data: Vec<u8>,
}

// ── Cell ─────────────────────────────────────────────────────────

#[derive(Debug)]
struct Cell {
    /// Addressable entries; `entries.len() == capacity + 1`.
    capacity: usize,
    persistent: bool,
    entries: Vec<Option<CachedBitmap>>,
}

impl Cell {
    fn new(capacity: usize, persistent: bool) -> Self {
        Self {
            capacity,
            persistent,
            entries: (0..=capacity).map(|_| None).collect(),
        }
    }
}

// ── BitmapCache ──────────────────────────────────────────────────

/// Session-scoped cache of decoded bitmaps.
#[derive(Debug)]
pub struct BitmapCache {
    cells: Vec<Cell>,
    version: u32,
    persist_enabled: bool,
    persist_file: Option<PathBuf>,
    persisted: bool,
}

impl BitmapCache {
    pub fn new(settings: &CacheSettings) -> Self {
        Self {
            cells: settings
                .cells
                .iter()
                .map(|c| Cell::new(c.entries as usize, c.persistent))
                .collect(),
            version: settings.version,
            persist_enabled: settings.persist_enabled,
            persist_file: settings.persist_file.clone(),
            persisted: false,
        }
    }

    /// Number of configured cells.
    pub fn max_cells(&self) -> usize {
        self.cells.len()
    }

    /// Addressable entry count of a cell.
    pub fn cell_capacity(&self, cell_id: u8) -> Option<usize> {
        self.cells.get(cell_id as usize).map(|c| c.capacity)
    }

    /// Install a bitmap, taking ownership. Any previous occupant of the
    /// slot is dropped.
    pub fn put(
        &mut self,
        cell_id: u8,
        index: u16,
        bitmap: CachedBitmap,
    ) -> Result<(), RemexError> {
        let (cell, slot) = self.resolve("put", cell_id, index)?;
        self.cells[cell].entries[slot] = Some(bitmap);
        Ok(())
    }

    /// Look up a bitmap. `None` for empty *and* for out-of-range slots;
    /// only the latter is logged.
    pub fn get(&self, cell_id: u8, index: u16) -> Option<&CachedBitmap> {
        let (cell, slot) = self.resolve("get", cell_id, index).ok()?;
        self.cells[cell].entries[slot].as_ref()
    }

    fn resolve(&self, op: &str, cell_id: u8, index: u16) -> Result<(usize, usize), RemexError> {
        let Some(cell) = self.cells.get(cell_id as usize) else {
            error!("{op}: invalid bitmap cell id {cell_id}");
            return Err(RemexError::InvalidCacheReference { cell_id, index });
        };

        let slot = if index == WAITING_LIST_INDEX {
            cell.capacity
        } else if index as usize > cell.capacity {
            error!("{op}: invalid bitmap index {index} in cell {cell_id}");
            return Err(RemexError::InvalidCacheReference { cell_id, index });
        } else {
            index as usize
        };

        Ok((cell_id as usize, slot))
    }

    // ── Persistence ──────────────────────────────────────────────

    /// Pre-load a persistent cell from sidecar entries. Entries beyond
    /// the cell capacity are dropped.
    pub fn warm_from(&mut self, entries: Vec<PersistentEntry>) {
        let Some(cell) = self.cells.iter_mut().find(|c| c.persistent) else {
            return;
        };
        for (slot, entry) in entries.into_iter().take(cell.capacity).enumerate() {
            let bpp = 32;
            if entry.data.len() < entry.width as usize * entry.height as usize * pixel_bytes(bpp) {
                continue;
            }
            cell.entries[slot] = Some(CachedBitmap {
                width: entry.width,
                height: entry.height,
                bpp,
                key64: entry.key64,
                data: entry.data,
            });
        }
    }

    /// Flush keyed entries to the sidecar file.
    ///
    /// A no-op unless the session negotiated cache version 2 with
    /// persistence enabled and a configured path; other versions persist
    /// through the graphics-effects channel instead. Returns the number
    /// of records written.
    pub fn save_persistent(&mut self) -> Result<usize, RemexError> {
        if self.version != 2 || !self.persist_enabled {
            return Ok(0);
        }
        let Some(path) = self.persist_file.clone() else {
            return Ok(0);
        };

        let mut records = Vec::new();
        for cell in &self.cells {
            for bitmap in cell.entries.iter().flatten() {
                if bitmap.key64 == 0 {
                    continue;
                }
                let size =
                    4u64 * u64::from(bitmap.width) * u64::from(bitmap.height);
                if size > u64::from(u32::MAX) {
                    continue;
                }
                records.push(PersistentEntry {
                    key64: bitmap.key64,
                    width: bitmap.width,
                    height: bitmap.height,
                    flags: 0,
                    data: bitmap.data.clone(),
                });
            }
        }

        let written = PersistentCacheFile::write(&path, self.version, &records)?;
        self.persisted = true;
        Ok(written)
    }
}

impl Drop for BitmapCache {
    fn drop(&mut self) {
        if !self.persisted {
            if let Err(e) = self.save_persistent() {
                warn!("persistent bitmap cache not saved: {e}");
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::CellSettings;

    fn cache_with_cells(counts: &[u16]) -> BitmapCache {
        BitmapCache::new(&CacheSettings {
            version: 2,
            cells: counts
                .iter()
                .map(|&entries| CellSettings {
                    entries,
                    persistent: false,
                })
                .collect(),
            persist_enabled: false,
            persist_file: None,
        })
    }

    fn bitmap(fill: u8, key: u64) -> CachedBitmap {
        CachedBitmap {
            width: 4,
            height: 4,
            bpp: 32,
            key64: key,
            data: vec![fill; 4 * 4 * 4],
        }
    }

    #[test]
    fn put_then_get_returns_installed() {
        let mut cache = cache_with_cells(&[16, 16]);
        cache.put(1, 3, bitmap(0xAA, 1)).unwrap();
        let got = cache.get(1, 3).unwrap();
        assert_eq!(got.data[0], 0xAA);
        assert!(cache.get(0, 3).is_none());
    }

    #[test]
    fn put_replaces_previous_occupant() {
        let mut cache = cache_with_cells(&[16]);
        cache.put(0, 5, bitmap(0x11, 1)).unwrap();
        cache.put(0, 5, bitmap(0x22, 2)).unwrap();
        assert_eq!(cache.get(0, 5).unwrap().data[0], 0x22);
    }

    #[test]
    fn out_of_range_cell_fails_without_panic() {
        let mut cache = cache_with_cells(&[16]);
        assert!(matches!(
            cache.put(3, 0, bitmap(0, 0)),
            Err(RemexError::InvalidCacheReference { cell_id: 3, .. })
        ));
        assert!(cache.get(3, 0).is_none());

        // The cell count itself is out of range too (not one past it).
        assert!(cache.put(1, 0, bitmap(0, 0)).is_err());
    }

    #[test]
    fn out_of_range_index_fails_without_panic() {
        let mut cache = cache_with_cells(&[10]);
        assert!(cache.put(0, 11, bitmap(0, 0)).is_err());
        assert!(cache.get(0, 11).is_none());
        // Index == capacity is the overflow slot and is addressable.
        cache.put(0, 10, bitmap(0x33, 0)).unwrap();
        assert_eq!(cache.get(0, 10).unwrap().data[0], 0x33);
    }

    #[test]
    fn waiting_list_aliases_overflow_slot() {
        let mut cache = cache_with_cells(&[10]);
        cache.put(0, WAITING_LIST_INDEX, bitmap(0x7F, 9)).unwrap();

        let via_alias = cache.get(0, WAITING_LIST_INDEX).unwrap();
        assert_eq!(via_alias.data[0], 0x7F);
        let via_slot = cache.get(0, 10).unwrap();
        assert_eq!(via_slot.data[0], 0x7F);
    }

    #[test]
    fn empty_slot_is_silent_absence() {
        let cache = cache_with_cells(&[16, 16, 16]);
        assert!(cache.get(2, 7).is_none());
    }

    #[test]
    fn persistence_writes_keyed_entries_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("persist.bin");

        let mut cache = BitmapCache::new(&CacheSettings {
            version: 2,
            cells: vec![CellSettings {
                entries: 8,
                persistent: true,
            }],
            persist_enabled: true,
            persist_file: Some(path.clone()),
        });
        cache.put(0, 0, bitmap(0xAA, 0x0123_4567_89AB_CDEF)).unwrap();
        cache.put(0, 1, bitmap(0xBB, 0)).unwrap(); // keyless, skipped
        cache.put(0, WAITING_LIST_INDEX, bitmap(0xCC, 7)).unwrap();

        let written = cache.save_persistent().unwrap();
        assert_eq!(written, 2);

        let (version, entries) = PersistentCacheFile::read(&path).unwrap();
        assert_eq!(version, 2);
        let keys: Vec<u64> = entries.iter().map(|e| e.key64).collect();
        assert!(keys.contains(&0x0123_4567_89AB_CDEF));
        assert!(keys.contains(&7));
    }

    #[test]
    fn persistence_noop_for_other_versions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("persist.bin");

        let mut cache = BitmapCache::new(&CacheSettings {
            version: 3,
            cells: vec![CellSettings {
                entries: 8,
                persistent: true,
            }],
            persist_enabled: true,
            persist_file: Some(path.clone()),
        });
        cache.put(0, 0, bitmap(0xAA, 99)).unwrap();
        assert_eq!(cache.save_persistent().unwrap(), 0);
        assert!(!path.exists());
    }

    #[test]
    fn drop_flushes_when_not_saved_explicitly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("persist.bin");

        {
            let mut cache = BitmapCache::new(&CacheSettings {
                version: 2,
                cells: vec![CellSettings {
                    entries: 4,
                    persistent: true,
                }],
                persist_enabled: true,
                persist_file: Some(path.clone()),
            });
            cache.put(0, 0, bitmap(0xEE, 11)).unwrap();
        }

        let (_, entries) = PersistentCacheFile::read(&path).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key64, 11);
    }

    #[test]
    fn warm_from_populates_persistent_cell() {
        let mut cache = BitmapCache::new(&CacheSettings {
            version: 2,
            cells: vec![
                CellSettings {
                    entries: 4,
                    persistent: false,
                },
                CellSettings {
                    entries: 4,
                    persistent: true,
                },
            ],
            persist_enabled: true,
            persist_file: None,
        });

        cache.warm_from(vec![PersistentEntry {
            key64: 5,
            width: 2,
            height: 2,
            flags: 0,
            data: vec![0xDD; 2 * 2 * 4],
        }]);

        assert!(cache.get(0, 0).is_none());
        assert_eq!(cache.get(1, 0).unwrap().key64, 5);
    }
}
