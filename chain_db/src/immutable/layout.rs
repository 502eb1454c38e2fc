//! On-disk layout of the immutable store.
//!
//! Each chunk `i` is three files: `{i:06}.chunk` holds the framed
//! blocks, `{i:06}.secondary` one fixed-size record per block, and
//! `{i:06}.primary` the slot-within-chunk to secondary-record mapping
//! used for slot lookups.

use naos_common::BlockHash;
use std::path::{Path, PathBuf};

/// Size of one secondary index record.
pub const SECONDARY_ENTRY_SIZE: usize = 45;

/// Size of one primary index record.
pub const PRIMARY_ENTRY_SIZE: usize = 8;

/// Maps slots onto fixed-schedule chunks, one chunk per epoch.
#[derive(Debug, Clone, Copy)]
pub struct ChunkInfo {
    pub slots_per_chunk: u64,
}

impl ChunkInfo {
    pub fn new(slots_per_chunk: u64) -> Self {
        ChunkInfo { slots_per_chunk }
    }

    pub fn chunk_of(&self, slot: u64) -> u64 {
        slot / self.slots_per_chunk
    }

    pub fn relative_slot(&self, slot: u64) -> u32 {
        (slot % self.slots_per_chunk) as u32
    }

    pub fn first_slot(&self, chunk: u64) -> u64 {
        chunk * self.slots_per_chunk
    }
}

pub fn chunk_file(dir: &Path, chunk: u64) -> PathBuf {
    dir.join(format!("{chunk:06}.chunk"))
}

pub fn primary_file(dir: &Path, chunk: u64) -> PathBuf {
    dir.join(format!("{chunk:06}.primary"))
}

pub fn secondary_file(dir: &Path, chunk: u64) -> PathBuf {
    dir.join(format!("{chunk:06}.secondary"))
}

/// Parse a chunk number out of a `{i:06}.chunk` file name.
pub fn parse_chunk_file(name: &str) -> Option<u64> {
    name.strip_suffix(".chunk")?.parse().ok()
}

/// One record of the secondary index: where a block lives in the blobs
/// file and how to slice its header out without parsing the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecondaryEntry {
    /// Offset of the frame (length prefix included) in the chunk file.
    pub offset: u64,
    /// Bytes from the frame start to the encoded header.
    pub header_offset: u16,
    /// Length of the encoded header.
    pub header_size: u16,
    pub hash: BlockHash,
    pub is_ebb: bool,
}

impl SecondaryEntry {
    pub fn to_bytes(&self) -> [u8; SECONDARY_ENTRY_SIZE] {
        let mut bytes = [0u8; SECONDARY_ENTRY_SIZE];
        bytes[0..8].copy_from_slice(&self.offset.to_be_bytes());
        bytes[8..10].copy_from_slice(&self.header_offset.to_be_bytes());
        bytes[10..12].copy_from_slice(&self.header_size.to_be_bytes());
        bytes[12..44].copy_from_slice(self.hash.as_ref());
        bytes[44] = self.is_ebb as u8;
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<SecondaryEntry> {
        if bytes.len() != SECONDARY_ENTRY_SIZE {
            return None;
        }
        Some(SecondaryEntry {
            offset: u64::from_be_bytes(bytes[0..8].try_into().ok()?),
            header_offset: u16::from_be_bytes(bytes[8..10].try_into().ok()?),
            header_size: u16::from_be_bytes(bytes[10..12].try_into().ok()?),
            hash: BlockHash::try_from(&bytes[12..44]).ok()?,
            is_ebb: bytes[44] != 0,
        })
    }
}

/// One record of the primary index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrimaryEntry {
    pub relative_slot: u32,
    pub secondary_index: u32,
}

impl PrimaryEntry {
    pub fn to_bytes(&self) -> [u8; PRIMARY_ENTRY_SIZE] {
        let mut bytes = [0u8; PRIMARY_ENTRY_SIZE];
        bytes[0..4].copy_from_slice(&self.relative_slot.to_be_bytes());
        bytes[4..8].copy_from_slice(&self.secondary_index.to_be_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<PrimaryEntry> {
        if bytes.len() != PRIMARY_ENTRY_SIZE {
            return None;
        }
        Some(PrimaryEntry {
            relative_slot: u32::from_be_bytes(bytes[0..4].try_into().ok()?),
            secondary_index: u32::from_be_bytes(bytes[4..8].try_into().ok()?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_arithmetic() {
        let info = ChunkInfo::new(100);
        assert_eq!(info.chunk_of(0), 0);
        assert_eq!(info.chunk_of(99), 0);
        assert_eq!(info.chunk_of(100), 1);
        assert_eq!(info.relative_slot(250), 50);
        assert_eq!(info.first_slot(3), 300);
    }

    #[test]
    fn secondary_entry_round_trip() {
        let entry = SecondaryEntry {
            offset: 0xdead_beef,
            header_offset: 4,
            header_size: 121,
            hash: BlockHash::new([3; 32]),
            is_ebb: true,
        };
        let back = SecondaryEntry::from_bytes(&entry.to_bytes()).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn primary_entry_round_trip() {
        let entry = PrimaryEntry {
            relative_slot: 17,
            secondary_index: 5,
        };
        assert_eq!(PrimaryEntry::from_bytes(&entry.to_bytes()).unwrap(), entry);
    }

    #[test]
    fn file_names_are_zero_padded() {
        let dir = Path::new("/db/immutable");
        assert_eq!(chunk_file(dir, 12), dir.join("000012.chunk"));
        assert_eq!(parse_chunk_file("000012.chunk"), Some(12));
        assert_eq!(parse_chunk_file("000012.primary"), None);
    }
}
