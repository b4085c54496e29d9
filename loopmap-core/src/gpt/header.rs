use super::{u32_at, u64_at, Checksum};
use loopmap_error::{LoopmapError, Result};
use serde::Serialize;
use std::path::Path;
use uuid::Uuid;

/// The primary GPT header found at LBA 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionTableHeader {
    pub revision: u32,
    pub header_size: u32,
    pub header_crc32: u32,
    pub current_lba: u64,
    pub backup_lba: u64,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    pub disk_guid: Uuid,
    pub entries_lba: u64,
    pub entry_count: u32,
    pub entry_size: u32,
    pub entries_crc32: u32,
}

impl PartitionTableHeader {
    pub const SIGNATURE: [u8; 8] = *b"EFI PART";
    pub const MIN_SIZE: u32 = 92;
    pub const MIN_ENTRY_SIZE: u32 = 128;

    /// Decode the header block and recompute its checksum.
    ///
    /// `block` is one whole logical block read from LBA 1.
    pub(crate) fn decode(block: &[u8], origin: &Path) -> Result<(Self, Checksum)> {
        if block.len() < Self::MIN_SIZE as usize || block[0..8] != Self::SIGNATURE {
            return Err(LoopmapError::InvalidTableKind {
                path: origin.to_path_buf(),
            });
        }

        let header_size = u32_at(block, 12);
        if header_size < Self::MIN_SIZE || header_size as usize > block.len() {
            log::warn!(
                "GPT header on {} declares size {} (block is {} bytes)",
                origin.display(),
                header_size,
                block.len()
            );
            return Err(LoopmapError::InvalidTableKind {
                path: origin.to_path_buf(),
            });
        }

        let mut guid = [0u8; 16];
        guid.copy_from_slice(&block[56..72]);

        let header = Self {
            revision: u32_at(block, 8),
            header_size,
            header_crc32: u32_at(block, 16),
            current_lba: u64_at(block, 24),
            backup_lba: u64_at(block, 32),
            first_usable_lba: u64_at(block, 40),
            last_usable_lba: u64_at(block, 48),
            disk_guid: Uuid::from_bytes_le(guid),
            entries_lba: u64_at(block, 72),
            entry_count: u32_at(block, 80),
            entry_size: u32_at(block, 84),
            entries_crc32: u32_at(block, 88),
        };

        if header.entry_size < Self::MIN_ENTRY_SIZE {
            log::warn!(
                "GPT on {} declares {}-byte entries",
                origin.display(),
                header.entry_size
            );
            return Err(LoopmapError::InvalidTableKind {
                path: origin.to_path_buf(),
            });
        }

        let mut raw = block[..header_size as usize].to_vec();
        raw[16..20].fill(0);
        let checksum = Checksum {
            stored: header.header_crc32,
            computed: crc32fast::hash(&raw),
        };

        Ok((header, checksum))
    }

    /// Size in bytes of the entry array this header declares.
    pub fn entries_len(&self) -> u64 {
        self.entry_count as u64 * self.entry_size as u64
    }
}
