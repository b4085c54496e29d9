//! GPT partition table parsing.
//!
//! Only the primary header at LBA 1 and its entry array are read. Checksums are
//! always recomputed and reported through [`ChecksumStatus`]; whether a mismatch
//! is fatal is up to the caller (see [`parse_partition_table`]).

mod entry;
mod header;

pub use entry::Partition;
pub use header::PartitionTableHeader;

use loopmap_error::{LoopmapError, Result};
use loopmap_hal::BlockDeviceOps;
use serde::Serialize;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

/// Device-mapper always counts in 512-byte sectors.
pub const DM_SECTOR_SIZE: u64 = 512;

fn u32_at(raw: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&raw[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

fn u64_at(raw: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&raw[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

/// A stored CRC32 next to the value recomputed from the data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Checksum {
    pub stored: u32,
    pub computed: u32,
}

impl Checksum {
    pub fn is_valid(&self) -> bool {
        self.stored == self.computed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChecksumStatus {
    pub header: Checksum,
    pub entries: Checksum,
}

impl ChecksumStatus {
    pub fn is_valid(&self) -> bool {
        self.header.is_valid() && self.entries.is_valid()
    }

    /// Turn the first mismatch into [`LoopmapError::ChecksumMismatch`].
    pub fn verify(&self, origin: &Path) -> Result<()> {
        for (what, sum) in [("header", self.header), ("entry array", self.entries)] {
            if !sum.is_valid() {
                return Err(LoopmapError::ChecksumMismatch {
                    path: origin.to_path_buf(),
                    what,
                    stored: sum.stored,
                    computed: sum.computed,
                });
            }
        }
        Ok(())
    }
}

/// Everything decoded from one partition table read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionTable {
    pub header: PartitionTableHeader,
    pub partitions: Vec<Partition>,
    pub checksums: ChecksumStatus,
}

/// Read `len` bytes at `offset`, refusing to allocate past the end of the input.
fn read_region<R: Read + Seek>(
    reader: &mut R,
    input_len: u64,
    offset: u64,
    len: u64,
    what: &str,
    origin: &Path,
) -> Result<Vec<u8>> {
    let end = offset.checked_add(len).filter(|end| *end <= input_len);
    if end.is_none() {
        return Err(LoopmapError::TruncatedInput {
            path: origin.to_path_buf(),
            detail: format!(
                "{} needs {} bytes at offset {}, input is {} bytes",
                what, len, offset, input_len
            ),
        });
    }

    let io_err = |e: io::Error| LoopmapError::io(origin, e);
    reader.seek(SeekFrom::Start(offset)).map_err(io_err)?;
    let mut buf = vec![0u8; len as usize];
    match reader.read_exact(&mut buf) {
        Ok(()) => Ok(buf),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(LoopmapError::TruncatedInput {
            path: origin.to_path_buf(),
            detail: format!("short read of {}", what),
        }),
        Err(e) => Err(io_err(e)),
    }
}

/// Decode the partition table from any seekable source.
///
/// `block_size` is the logical block size LBAs are counted in; `origin` only
/// names the source in errors and logs. Checksum mismatches are logged and
/// reported in [`PartitionTable::checksums`], never returned as errors.
pub fn read_table<R: Read + Seek>(
    reader: &mut R,
    block_size: u32,
    origin: &Path,
) -> Result<PartitionTable> {
    if block_size < DM_SECTOR_SIZE as u32 || !block_size.is_power_of_two() {
        return Err(LoopmapError::ValidationFailed(format!(
            "unsupported logical block size {} on {}",
            block_size,
            origin.display()
        )));
    }
    let block = block_size as u64;
    let input_len = reader
        .seek(SeekFrom::End(0))
        .map_err(|e| LoopmapError::io(origin, e))?;

    let raw = read_region(reader, input_len, block, block, "GPT header", origin)?;
    let (header, header_sum) = PartitionTableHeader::decode(&raw, origin)?;
    if !header_sum.is_valid() {
        log::warn!(
            "GPT header checksum mismatch on {} (stored {:#010x}, computed {:#010x})",
            origin.display(),
            header_sum.stored,
            header_sum.computed
        );
    }

    let offset = header.entries_lba.checked_mul(block).ok_or_else(|| {
        LoopmapError::TruncatedInput {
            path: origin.to_path_buf(),
            detail: format!("entry array LBA {} is out of range", header.entries_lba),
        }
    })?;
    let array = read_region(
        reader,
        input_len,
        offset,
        header.entries_len(),
        "GPT entry array",
        origin,
    )?;
    let entries_sum = Checksum {
        stored: header.entries_crc32,
        computed: crc32fast::hash(&array),
    };
    if !entries_sum.is_valid() {
        log::warn!(
            "GPT entry array checksum mismatch on {} (stored {:#010x}, computed {:#010x})",
            origin.display(),
            entries_sum.stored,
            entries_sum.computed
        );
    }

    let partitions =
        entry::decode_entries(&array, header.entry_size as usize, block_size, origin)?;

    Ok(PartitionTable {
        header,
        partitions,
        checksums: ChecksumStatus {
            header: header_sum,
            entries: entries_sum,
        },
    })
}

/// Open `path` (image file or block device) and decode its partition table.
///
/// The logical block size comes from the kernel for block devices and is 512
/// for regular files. With `strict_checksums` a CRC mismatch fails the read.
pub fn load_table<H: BlockDeviceOps + ?Sized>(
    hal: &H,
    path: &Path,
    strict_checksums: bool,
) -> Result<PartitionTable> {
    let mut file = File::open(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => LoopmapError::NotFound(path.to_path_buf()),
        _ => LoopmapError::io(path, e),
    })?;
    let block_size = hal.logical_block_size(&file)?;
    log::debug!("reading GPT from {} ({}-byte blocks)", path.display(), block_size);

    let table = read_table(&mut file, block_size, path)?;
    if strict_checksums {
        table.checksums.verify(path)?;
    }
    Ok(table)
}

/// The used partitions of the GPT on `path`, in on-disk order.
///
/// No signature yields [`LoopmapError::InvalidTableKind`]; a valid table with
/// no used slots yields an empty list.
pub fn parse_partition_table<H: BlockDeviceOps + ?Sized>(
    hal: &H,
    path: &Path,
    strict_checksums: bool,
) -> Result<Vec<Partition>> {
    let table = load_table(hal, path, strict_checksums)?;
    log::info!(
        "found {} partition(s) on {}",
        table.partitions.len(),
        path.display()
    );
    Ok(table.partitions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use loopmap_hal::FakeHal;
    use loopmap_testing::{single_partition_disk, three_partition_disk, GptImage, MIB};
    use std::io::Cursor;

    fn origin() -> &'static Path {
        Path::new("test.img")
    }

    #[test]
    fn reads_single_partition_disk() {
        let bytes = GptImage::new(MIB).partition(34, 1000, "data").to_bytes().unwrap();
        let table = read_table(&mut Cursor::new(bytes), 512, origin()).unwrap();

        assert!(table.checksums.is_valid());
        assert_eq!(table.partitions.len(), 1);
        let p = &table.partitions[0];
        assert_eq!((p.number, p.first_lba, p.last_lba), (1, 34, 1000));
        assert_eq!(p.sector_count, 967);
        assert_eq!(p.name, "data");
        assert_eq!(p.lba_size, 512);
    }

    #[test]
    fn empty_table_is_not_an_error() {
        let bytes = GptImage::new(MIB).to_bytes().unwrap();
        let table = read_table(&mut Cursor::new(bytes), 512, origin()).unwrap();
        assert!(table.partitions.is_empty());
    }

    #[test]
    fn zeroed_input_has_no_table() {
        let err = read_table(&mut Cursor::new(vec![0u8; 64 * 1024]), 512, origin()).unwrap_err();
        assert!(matches!(err, LoopmapError::InvalidTableKind { .. }));
    }

    #[test]
    fn short_input_is_truncated() {
        let err = read_table(&mut Cursor::new(vec![0u8; 700]), 512, origin()).unwrap_err();
        assert!(matches!(err, LoopmapError::TruncatedInput { .. }));
    }

    #[test]
    fn huge_entry_array_fails_before_reading() {
        let mut bytes = GptImage::new(MIB).to_bytes().unwrap();
        // entry_count = u32::MAX, entry_size = 4096
        bytes[512 + 80..512 + 84].copy_from_slice(&u32::MAX.to_le_bytes());
        bytes[512 + 84..512 + 88].copy_from_slice(&4096u32.to_le_bytes());
        let err = read_table(&mut Cursor::new(bytes), 512, origin()).unwrap_err();
        assert!(matches!(err, LoopmapError::TruncatedInput { .. }));
    }

    #[test]
    fn entry_array_past_end_is_truncated() {
        let gpt = GptImage::new(MIB).partition(34, 100, "a");
        let mut bytes = gpt.to_bytes().unwrap();
        bytes.truncate(4096);
        let err = read_table(&mut Cursor::new(bytes), 512, origin()).unwrap_err();
        assert!(matches!(err, LoopmapError::TruncatedInput { .. }));
    }

    #[test]
    fn checksum_mismatch_is_reported_not_fatal() {
        let gpt = GptImage::new(MIB).partition(34, 100, "a");
        let mut bytes = gpt.to_bytes().unwrap();
        // corrupt the entry name; entries CRC no longer matches
        bytes[1024 + 56] = b'z';
        let table = read_table(&mut Cursor::new(bytes), 512, origin()).unwrap();

        assert!(table.checksums.header.is_valid());
        assert!(!table.checksums.entries.is_valid());
        assert_eq!(table.partitions[0].name, "z");
        let err = table.checksums.verify(origin()).unwrap_err();
        assert!(matches!(
            err,
            LoopmapError::ChecksumMismatch { what: "entry array", .. }
        ));
    }

    #[test]
    fn four_k_blocks() {
        let gpt = GptImage::new(8 * MIB).block_size(4096).partition(6, 100, "a");
        let bytes = gpt.to_bytes().unwrap();
        let table = read_table(&mut Cursor::new(bytes), 4096, origin()).unwrap();
        assert!(table.checksums.is_valid());
        assert_eq!(table.partitions[0].lba_size, 4096);
        assert_eq!(table.partitions[0].mapper_sectors(), Some((48, 95 * 8)));
    }

    #[test]
    fn crafted_lbas_are_errors_not_panics() {
        let bytes = GptImage::new(MIB).partition(0, u64::MAX, "x").to_bytes().unwrap();
        let err = read_table(&mut Cursor::new(bytes), 512, origin()).unwrap_err();
        assert!(matches!(err, LoopmapError::ValidationFailed(_)));

        let first = u64::MAX / 4;
        let bytes = GptImage::new(8 * MIB)
            .block_size(4096)
            .partition(first, first + 1, "x")
            .to_bytes()
            .unwrap();
        let err = read_table(&mut Cursor::new(bytes), 4096, origin()).unwrap_err();
        assert!(matches!(err, LoopmapError::ValidationFailed(_)));
    }

    #[test]
    fn odd_block_sizes_are_rejected() {
        let err = read_table(&mut Cursor::new(vec![0u8; 4096]), 520, origin()).unwrap_err();
        assert!(matches!(err, LoopmapError::ValidationFailed(_)));
    }

    #[test]
    fn parses_image_files() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("three.img");
        three_partition_disk().write_file(&image).unwrap();

        let parts = parse_partition_table(&FakeHal::new(), &image, true).unwrap();
        let numbers: Vec<u32> = parts.iter().map(|p| p.number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(parts[2].first_lba, 150_001);
        assert_eq!(parts[2].sector_count, 50_000);
    }

    #[test]
    fn strict_mode_rejects_bad_header_crc() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("one.img");
        single_partition_disk().write_file(&image).unwrap();
        {
            use std::io::Write;
            let mut file = std::fs::OpenOptions::new().write(true).open(&image).unwrap();
            file.seek(SeekFrom::Start(512 + 16)).unwrap();
            file.write_all(&[0xde, 0xad, 0xbe, 0xef]).unwrap();
        }

        let hal = FakeHal::new();
        assert_eq!(parse_partition_table(&hal, &image, false).unwrap().len(), 1);
        let err = parse_partition_table(&hal, &image, true).unwrap_err();
        assert!(matches!(err, LoopmapError::ChecksumMismatch { what: "header", .. }));
    }

    #[test]
    fn missing_path_is_not_found() {
        let err = parse_partition_table(&FakeHal::new(), Path::new("/nonexistent/x.img"), false)
            .unwrap_err();
        assert!(matches!(err, LoopmapError::NotFound(_)));
    }

    #[test]
    fn partitions_serialize() {
        let bytes = GptImage::new(MIB).partition(34, 100, "a").to_bytes().unwrap();
        let table = read_table(&mut Cursor::new(bytes), 512, origin()).unwrap();
        let json = serde_json::to_value(&table.partitions[0]).unwrap();
        assert_eq!(json["number"], 1);
        assert_eq!(json["sector_count"], 67);
        assert_eq!(json["type_guid"], "0fc63daf-8483-4772-8e79-3d69d8477de4");
    }
}
