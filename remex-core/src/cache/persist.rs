//! Persistent bitmap cache sidecar.
//!
//! ## File format (little-endian)
//!
//! **Header** (8 bytes):
//! ```text
//! version:      u32  (4)
//! entry_count:  u32  (4)
//! ```
//!
//! **Entry** (18 byte header + payload):
//! ```text
//! key64:        u64  (8)
//! width:        u16  (2)
//! height:       u16  (2)
//! size:         u32  (4)
//! flags:        u16  (2)
//! data:         [u8] (size)
//! ```
//!
//! Entries with `key64 == 0` are never written; a reader tolerates a
//! truncated tail by returning what it parsed plus an error.

use std::fs;
use std::io;
use std::path::Path;

// ── PersistentEntry ──────────────────────────────────────────────

/// One long-lived cache record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentEntry {
    pub key64: u64,
    pub width: u16,
    pub height: u16,
    pub flags: u16,
    pub data: Vec<u8>,
}

impl PersistentEntry {
    /// Fixed header size preceding the pixel payload.
    pub const HEADER_SIZE: usize = 18;

    fn encode_header(&self) -> [u8; Self::HEADER_SIZE] {
        let mut buf = [0u8; Self::HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.key64.to_le_bytes());
        buf[8..10].copy_from_slice(&self.width.to_le_bytes());
        buf[10..12].copy_from_slice(&self.height.to_le_bytes());
        buf[12..16].copy_from_slice(&(self.data.len() as u32).to_le_bytes());
        buf[16..18].copy_from_slice(&self.flags.to_le_bytes());
        buf
    }
}

// ── PersistentCacheFile ──────────────────────────────────────────

/// Reader/writer for the sidecar file.
pub struct PersistentCacheFile;

/// File header size.
const FILE_HEADER_SIZE: usize = 8;

impl PersistentCacheFile {
    /// Write `entries` to `path`, skipping records without a content key
    /// or with payloads that do not fit the 32-bit size field. Returns
    /// the number of records written.
    pub fn write(path: &Path, version: u32, entries: &[PersistentEntry]) -> io::Result<usize> {
        let keep: Vec<&PersistentEntry> = entries
            .iter()
            .filter(|e| e.key64 != 0 && e.data.len() <= u32::MAX as usize)
            .collect();

        let payload: usize = keep.iter().map(|e| e.data.len()).sum();
        let mut buf =
            Vec::with_capacity(FILE_HEADER_SIZE + keep.len() * PersistentEntry::HEADER_SIZE + payload);
        buf.extend_from_slice(&version.to_le_bytes());
        buf.extend_from_slice(&(keep.len() as u32).to_le_bytes());
        for entry in &keep {
            buf.extend_from_slice(&entry.encode_header());
            buf.extend_from_slice(&entry.data);
        }

        fs::write(path, buf)?;
        Ok(keep.len())
    }

    /// Read the file back, returning `(version, entries)`.
    pub fn read(path: &Path) -> io::Result<(u32, Vec<PersistentEntry>)> {
        let data = fs::read(path)?;
        if data.len() < FILE_HEADER_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "persistent cache header truncated",
            ));
        }

        let version = u32::from_le_bytes(data[0..4].try_into().unwrap());
        let count = u32::from_le_bytes(data[4..8].try_into().unwrap()) as usize;

        let mut entries = Vec::with_capacity(count.min(4096));
        let mut offset = FILE_HEADER_SIZE;
        for _ in 0..count {
            if offset + PersistentEntry::HEADER_SIZE > data.len() {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "persistent cache entry header truncated",
                ));
            }
            let key64 = u64::from_le_bytes(data[offset..offset + 8].try_into().unwrap());
            let width = u16::from_le_bytes(data[offset + 8..offset + 10].try_into().unwrap());
            let height = u16::from_le_bytes(data[offset + 10..offset + 12].try_into().unwrap());
            let size = u32::from_le_bytes(data[offset + 12..offset + 16].try_into().unwrap()) as usize;
            let flags = u16::from_le_bytes(data[offset + 16..offset + 18].try_into().unwrap());
            offset += PersistentEntry::HEADER_SIZE;

            if offset + size > data.len() {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "persistent cache entry payload truncated",
                ));
            }
            entries.push(PersistentEntry {
                key64,
                width,
                height,
                flags,
                data: data[offset..offset + size].to_vec(),
            });
            offset += size;
        }

        Ok((version, entries))
    }
}

// ── Tests ────────────────────────────────────────────────────────
