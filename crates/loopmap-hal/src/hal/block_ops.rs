//! Block device geometry queries.

use crate::HalResult;
use std::fs::File;

/// Sector size assumed for regular files and by the device-mapper table format.
pub const DEFAULT_BLOCK_SIZE: u32 = 512;

pub trait BlockDeviceOps {
    /// Logical block size of an open file.
    ///
    /// Regular files report [`DEFAULT_BLOCK_SIZE`]; block devices report the
    /// kernel's logical sector size (`BLKSSZGET`).
    fn logical_block_size(&self, file: &File) -> HalResult<u32>;
}
