//! Block-special node creation.

use crate::HalResult;
use std::fmt;
use std::path::Path;

/// A major/minor device number pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceNumber {
    pub major: u32,
    pub minor: u32,
}

impl DeviceNumber {
    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Decode the kernel's 64-bit `dev_t` encoding.
    pub fn from_dev(dev: u64) -> Self {
        Self {
            major: (((dev >> 8) & 0xfff) | ((dev >> 32) & 0xffff_f000)) as u32,
            minor: ((dev & 0xff) | ((dev >> 12) & 0xffff_ff00)) as u32,
        }
    }

    pub fn to_dev(self) -> u64 {
        let major = self.major as u64;
        let minor = self.minor as u64;
        ((major & 0xfffff000) << 32)
            | ((major & 0x0000_0fff) << 8)
            | ((minor & 0xffffff00) << 12)
            | (minor & 0x0000_00ff)
    }
}

impl fmt::Display for DeviceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

pub trait NodeOps {
    /// Create a block-special node at `path` for `dev` (mode 0600).
    ///
    /// The caller removes any stale node first.
    fn make_block_node(&self, path: &Path, dev: DeviceNumber) -> HalResult<()>;
}
