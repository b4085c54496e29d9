//! HAL trait definitions and implementations.
//!
//! This module defines the core traits for kernel operations and provides
//! both real (LinuxHal) and fake (FakeHal) implementations.

pub mod block_ops;
pub mod dm_ioctl;
pub mod dm_ops;
pub mod fake_hal;
pub mod linux_hal;
pub mod loop_ioctl;
pub mod loop_ops;
pub mod node_ops;

pub use block_ops::BlockDeviceOps;
pub use dm_ops::{DeviceMapperOps, LinearTarget};
pub use fake_hal::{FakeHal, FakeOp};
pub use linux_hal::LinuxHal;
pub use loop_ops::{LoopBacking, LoopOps};
pub use node_ops::{DeviceNumber, NodeOps};

/// Complete HAL combining all kernel operation traits.
pub trait SystemHal: LoopOps + DeviceMapperOps + NodeOps + BlockDeviceOps + Send + Sync {}

/// Automatically implement SystemHal for any type implementing all required traits.
impl<T> SystemHal for T where T: LoopOps + DeviceMapperOps + NodeOps + BlockDeviceOps + Send + Sync {}
