//! Fixture images for loopmap tests.
//!
//! [`GptImage`] lays out a GPT disk the way partitioning tools do: protective
//! MBR in LBA 0, primary header in LBA 1 followed by the entry array, and the
//! backup entry array and header at the end of the disk. Images are written
//! sparse, so a 100 MiB fixture costs a few blocks on disk.

use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use uuid::Uuid;

pub const MIB: u64 = 1024 * 1024;

/// "Linux filesystem data" partition type.
pub const LINUX_FS: Uuid = Uuid::from_u128(0x0fc63daf_8483_4772_8e79_3d69d8477de4);
/// "EFI System" partition type.
pub const EFI_SYSTEM: Uuid = Uuid::from_u128(0xc12a7328_f81f_11d2_ba4b_00a0c93ec93b);

const HEADER_SIZE: usize = 92;
const DEFAULT_ENTRY_COUNT: u32 = 128;
const DEFAULT_ENTRY_SIZE: u32 = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixturePartition {
    pub first_lba: u64,
    pub last_lba: u64,
    pub name: String,
    pub type_guid: Uuid,
    pub unique_guid: Uuid,
    pub attributes: u64,
}

#[derive(Debug, Clone)]
pub struct GptImage {
    size_bytes: u64,
    block_size: u64,
    entry_count: u32,
    entry_size: u32,
    disk_guid: Uuid,
    partitions: Vec<(u32, FixturePartition)>,
}

impl GptImage {
    /// An empty GPT on a disk of `size_bytes` with 512-byte blocks.
    pub fn new(size_bytes: u64) -> Self {
        Self {
            size_bytes,
            block_size: 512,
            entry_count: DEFAULT_ENTRY_COUNT,
            entry_size: DEFAULT_ENTRY_SIZE,
            disk_guid: Uuid::from_u128(0x5eed_0000_0000_4000_8000_0000_0000_0001),
            partitions: Vec::new(),
        }
    }

    pub fn block_size(mut self, block_size: u64) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn entry_count(mut self, count: u32) -> Self {
        self.entry_count = count;
        self
    }

    pub fn entry_size(mut self, size: u32) -> Self {
        self.entry_size = size;
        self
    }

    /// Add a Linux filesystem partition spanning `first..=last` in the next free slot.
    pub fn partition(self, first_lba: u64, last_lba: u64, name: &str) -> Self {
        let slot = self.partitions.last().map(|(s, _)| s + 1).unwrap_or(0);
        self.partition_in_slot(slot, first_lba, last_lba, name)
    }

    /// Add a partition in entry slot `slot` (0-based), leaving earlier slots unused.
    pub fn partition_in_slot(mut self, slot: u32, first_lba: u64, last_lba: u64, name: &str) -> Self {
        let unique_guid = Uuid::from_u128(0x5eed_0000_0000_4000_8000_0000_0001_0000 + slot as u128);
        self.partitions.push((
            slot,
            FixturePartition {
                first_lba,
                last_lba,
                name: name.to_string(),
                type_guid: LINUX_FS,
                unique_guid,
                attributes: 0,
            },
        ));
        self
    }

    /// Override the type GUID and attributes of the most recently added partition.
    pub fn with_type(mut self, type_guid: Uuid, attributes: u64) -> Self {
        if let Some((_, part)) = self.partitions.last_mut() {
            part.type_guid = type_guid;
            part.attributes = attributes;
        }
        self
    }

    pub fn disk_guid(&self) -> Uuid {
        self.disk_guid
    }

    fn last_lba(&self) -> u64 {
        self.size_bytes / self.block_size - 1
    }

    fn entry_blocks(&self) -> u64 {
        let bytes = self.entry_count as u64 * self.entry_size as u64;
        bytes.div_ceil(self.block_size)
    }

    /// First LBA partitions may use with this layout.
    pub fn first_usable_lba(&self) -> u64 {
        2 + self.entry_blocks()
    }

    /// Last LBA partitions may use with this layout.
    pub fn last_usable_lba(&self) -> u64 {
        self.last_lba() - self.entry_blocks() - 1
    }

    /// The raw entry array.
    pub fn entries(&self) -> Vec<u8> {
        let size = self.entry_size as usize;
        let mut out = vec![0u8; self.entry_count as usize * size];
        for (slot, part) in &self.partitions {
            let off = *slot as usize * size;
            if off + 128 > out.len() {
                continue;
            }
            let entry = &mut out[off..off + size];
            entry[0..16].copy_from_slice(&part.type_guid.to_bytes_le());
            entry[16..32].copy_from_slice(&part.unique_guid.to_bytes_le());
            entry[32..40].copy_from_slice(&part.first_lba.to_le_bytes());
            entry[40..48].copy_from_slice(&part.last_lba.to_le_bytes());
            entry[48..56].copy_from_slice(&part.attributes.to_le_bytes());
            for (i, unit) in part.name.encode_utf16().take(36).enumerate() {
                entry[56 + i * 2..58 + i * 2].copy_from_slice(&unit.to_le_bytes());
            }
        }
        out
    }

    /// A header block (`block_size` bytes) describing this layout.
    pub fn header(&self, primary: bool) -> Vec<u8> {
        let entries_crc = crc32fast::hash(&self.entries());
        let (current, backup, entries_lba) = if primary {
            (1, self.last_lba(), 2)
        } else {
            (
                self.last_lba(),
                1,
                self.last_lba() - self.entry_blocks(),
            )
        };

        let mut block = vec![0u8; self.block_size as usize];
        let h = &mut block[..HEADER_SIZE];
        h[0..8].copy_from_slice(b"EFI PART");
        h[8..12].copy_from_slice(&[0, 0, 1, 0]);
        h[12..16].copy_from_slice(&(HEADER_SIZE as u32).to_le_bytes());
        h[24..32].copy_from_slice(&current.to_le_bytes());
        h[32..40].copy_from_slice(&backup.to_le_bytes());
        h[40..48].copy_from_slice(&self.first_usable_lba().to_le_bytes());
        h[48..56].copy_from_slice(&self.last_usable_lba().to_le_bytes());
        h[56..72].copy_from_slice(&self.disk_guid.to_bytes_le());
        h[72..80].copy_from_slice(&entries_lba.to_le_bytes());
        h[80..84].copy_from_slice(&self.entry_count.to_le_bytes());
        h[84..88].copy_from_slice(&self.entry_size.to_le_bytes());
        h[88..92].copy_from_slice(&entries_crc.to_le_bytes());
        let crc = crc32fast::hash(h);
        h[16..20].copy_from_slice(&crc.to_le_bytes());
        block
    }

    fn protective_mbr(&self) -> Vec<u8> {
        let mut block = vec![0u8; self.block_size as usize];
        let sectors = self.last_lba().min(u32::MAX as u64) as u32;
        let rec = &mut block[446..462];
        rec[1..4].copy_from_slice(&[0x00, 0x02, 0x00]);
        rec[4] = 0xee;
        rec[5..8].copy_from_slice(&[0xff, 0xff, 0xff]);
        rec[8..12].copy_from_slice(&1u32.to_le_bytes());
        rec[12..16].copy_from_slice(&sectors.to_le_bytes());
        block[510] = 0x55;
        block[511] = 0xaa;
        block
    }

    /// Write the whole disk to `out`, which must be empty or zeroed.
    pub fn write_to<W: Write + Seek>(&self, out: &mut W) -> io::Result<()> {
        let bs = self.block_size;
        let entries = self.entries();

        out.seek(SeekFrom::Start(0))?;
        out.write_all(&self.protective_mbr())?;
        out.write_all(&self.header(true))?;
        out.write_all(&entries)?;

        out.seek(SeekFrom::Start((self.last_lba() - self.entry_blocks()) * bs))?;
        out.write_all(&entries)?;
        out.seek(SeekFrom::Start(self.last_lba() * bs))?;
        out.write_all(&self.header(false))?;
        Ok(())
    }

    /// The whole disk in memory. Only sensible for small images.
    pub fn to_bytes(&self) -> io::Result<Vec<u8>> {
        let mut cursor = io::Cursor::new(vec![0u8; self.size_bytes as usize]);
        self.write_to(&mut cursor)?;
        Ok(cursor.into_inner())
    }

    /// Write a sparse image file at `path`, replacing any existing file.
    pub fn write_file(&self, path: &Path) -> io::Result<()> {
        let mut file = create_sized(path, self.size_bytes)?;
        self.write_to(&mut file)?;
        file.sync_all()
    }
}

fn create_sized(path: &Path, size_bytes: u64) -> io::Result<File> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    file.set_len(size_bytes)?;
    Ok(file)
}

/// A zero-filled sparse image.
pub fn write_blank(path: &Path, size_bytes: u64) -> io::Result<()> {
    create_sized(path, size_bytes).map(drop)
}

/// An image filled with deterministic pseudo-random bytes.
pub fn write_noise(path: &Path, size_bytes: u64, seed: u64) -> io::Result<()> {
    let mut file = create_sized(path, size_bytes)?;
    let mut state = seed | 1;
    let mut chunk = vec![0u8; 64 * 1024];
    let mut remaining = size_bytes;
    while remaining > 0 {
        for word in chunk.chunks_mut(8) {
            // xorshift64
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            word.copy_from_slice(&state.to_le_bytes()[..word.len()]);
        }
        let n = remaining.min(chunk.len() as u64) as usize;
        file.write_all(&chunk[..n])?;
        remaining -= n as u64;
    }
    Ok(())
}

/// The 100 MiB single-partition disk used across the test suites.
pub fn single_partition_disk() -> GptImage {
    GptImage::new(100 * MIB).partition(2048, 100_000, "data")
}

/// The 100 MiB three-partition disk used across the test suites.
pub fn three_partition_disk() -> GptImage {
    GptImage::new(100 * MIB)
        .partition(2048, 100_000, "esp")
        .with_type(EFI_SYSTEM, 0)
        .partition(100_001, 150_000, "root")
        .partition(150_001, 200_000, "home")
}

/// Scratch directory holding one image file; removed on drop.
pub struct ImageLab {
    dir: TempDir,
    image: PathBuf,
}

impl ImageLab {
    pub fn new(name: &str) -> io::Result<Self> {
        let dir = tempfile::tempdir()?;
        let image = dir.path().join(name);
        Ok(Self { dir, image })
    }

    pub fn with_gpt(name: &str, gpt: &GptImage) -> io::Result<Self> {
        let lab = Self::new(name)?;
        gpt.write_file(&lab.image)?;
        Ok(lab)
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn image(&self) -> &Path {
        &self.image
    }
}
