//! Device-mapper control operations.
//!
//! This is the narrow slice of the device-mapper protocol loopmap needs:
//! create a device with a linear table, resume it, query it, list and remove.

use crate::{DeviceNumber, HalResult};
use std::fmt;
use std::path::PathBuf;

/// One `linear` target line: `[start, start + length)` of the new device maps onto
/// `device` beginning at `offset`. All values are 512-byte sectors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearTarget {
    pub start: u64,
    pub length: u64,
    pub device: PathBuf,
    pub offset: u64,
}

impl LinearTarget {
    pub const TARGET_TYPE: &'static str = "linear";

    /// Target parameter string as the kernel expects it (`<device> <offset>`).
    pub fn params(&self) -> String {
        format!("{} {}", self.device.display(), self.offset)
    }
}

impl fmt::Display for LinearTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            self.start,
            self.length,
            Self::TARGET_TYPE,
            self.params()
        )
    }
}

pub trait DeviceMapperOps {
    /// Create device `name` and load `table` into its inactive slot.
    ///
    /// The device stays suspended until [`DeviceMapperOps::dm_resume`]. If the
    /// table load fails the freshly created device is removed again.
    fn dm_create(&self, name: &str, table: &[LinearTarget]) -> HalResult<()>;

    /// Swap in the loaded table and activate the device.
    fn dm_resume(&self, name: &str) -> HalResult<()>;

    /// Block until the device reports an active, unsuspended table.
    ///
    /// Bounded: returns an error once `timeout_ms` elapses.
    fn dm_wait_ready(&self, name: &str, timeout_ms: u64) -> HalResult<()>;

    /// Major/minor of device `name`, or `None` when the kernel has no such device.
    fn dm_device_number(&self, name: &str) -> HalResult<Option<DeviceNumber>>;

    /// Remove device `name`. A missing device yields [`crate::HalError::NotFound`].
    fn dm_remove(&self, name: &str) -> HalResult<()>;

    /// Names of every device-mapper device known to the kernel.
    fn dm_list(&self) -> HalResult<Vec<String>>;
}
