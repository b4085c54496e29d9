//! Loopmap Hardware Abstraction Layer (HAL).
//!
//! Every kernel interaction used by loopmap goes through the traits in [`hal`]:
//! loop control, device-mapper control, block node creation and block device
//! geometry. [`LinuxHal`] talks to the kernel directly through ioctls; [`FakeHal`]
//! simulates the same state in memory so callers can be tested without root.

pub mod error;
pub mod hal;
pub mod paths;
pub mod sysfs;

pub use error::{map_nix_err, HalError, HalResult};
pub use hal::{
    BlockDeviceOps, DeviceMapperOps, DeviceNumber, FakeHal, FakeOp, LinearTarget, LinuxHal,
    LoopBacking, LoopOps, NodeOps, SystemHal,
};
pub use paths::HalPaths;
