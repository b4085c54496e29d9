use super::{u64_at, DM_SECTOR_SIZE};
use loopmap_error::{LoopmapError, Result};
use serde::Serialize;
use std::ops::Range;
use std::path::Path;
use uuid::Uuid;

const NAME_UNITS: usize = 36;

/// One used slot of the partition entry array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Partition {
    /// 1-based position among the used slots, in on-disk order.
    pub number: u32,
    pub first_lba: u64,
    pub last_lba: u64,
    pub sector_count: u64,
    pub name: String,
    pub type_guid: Uuid,
    pub unique_guid: Uuid,
    pub attributes: u64,
    /// Logical block size the LBAs are expressed in.
    pub lba_size: u32,
}

impl Partition {
    /// Byte offsets covered by the partition, `None` if they overflow `u64`.
    pub fn byte_range(&self) -> Option<Range<u64>> {
        let lba = self.lba_size as u64;
        let start = self.first_lba.checked_mul(lba)?;
        let end = self.last_lba.checked_add(1)?.checked_mul(lba)?;
        Some(start..end)
    }

    /// `(start, length)` in 512-byte device-mapper sectors, `None` on overflow.
    pub fn mapper_sectors(&self) -> Option<(u64, u64)> {
        let scale = (self.lba_size as u64 / DM_SECTOR_SIZE).max(1);
        Some((
            self.first_lba.checked_mul(scale)?,
            self.sector_count.checked_mul(scale)?,
        ))
    }
}

fn guid_at(raw: &[u8], offset: usize) -> Uuid {
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&raw[offset..offset + 16]);
    Uuid::from_bytes_le(bytes)
}

fn decode_name(raw: &[u8]) -> String {
    let mut units: Vec<u16> = raw
        .chunks_exact(2)
        .take(NAME_UNITS)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    while units.last() == Some(&0) {
        units.pop();
    }
    String::from_utf16_lossy(&units)
}

/// Decode every used slot of `array`, numbering them in encounter order.
pub(crate) fn decode_entries(
    array: &[u8],
    entry_size: usize,
    lba_size: u32,
    origin: &Path,
) -> Result<Vec<Partition>> {
    let mut partitions = Vec::new();

    for (slot, raw) in array.chunks_exact(entry_size).enumerate() {
        let type_guid = guid_at(raw, 0);
        if type_guid.is_nil() {
            continue;
        }

        let number = partitions.len() as u32 + 1;
        let first_lba = u64_at(raw, 32);
        let last_lba = u64_at(raw, 40);
        if last_lba < first_lba {
            return Err(LoopmapError::ValidationFailed(format!(
                "partition {} (slot {}) on {} ends at LBA {} before it starts at {}",
                number,
                slot,
                origin.display(),
                last_lba,
                first_lba
            )));
        }

        let partition = Partition {
            number,
            first_lba,
            last_lba,
            sector_count: (last_lba - first_lba).saturating_add(1),
            name: decode_name(&raw[56..128]),
            type_guid,
            unique_guid: guid_at(raw, 16),
            attributes: u64_at(raw, 48),
            lba_size,
        };
        // the end byte bounds every derived offset and length
        if partition.byte_range().is_none() {
            return Err(LoopmapError::ValidationFailed(format!(
                "partition {} (slot {}) on {} ends at LBA {}, past the addressable range for {}-byte blocks",
                number,
                slot,
                origin.display(),
                last_lba,
                lba_size
            )));
        }
        log::debug!(
            "partition {} {:?}: LBA {}..={} ({} sectors)",
            partition.number,
            partition.name,
            partition.first_lba,
            partition.last_lba,
            partition.sector_count
        );
        partitions.push(partition);
    }

    Ok(partitions)
}
