use loopmap_hal::{DeviceMapperOps, LoopOps};
use std::path::PathBuf;

/// RAII guard that unbinds a loop device when dropped.
#[derive(Debug)]
pub struct LoopGuard<'a, H: LoopOps + ?Sized> {
    hal: &'a H,
    device: PathBuf,
    active: bool,
}

impl<'a, H: LoopOps + ?Sized> LoopGuard<'a, H> {
    pub fn new(hal: &'a H, device: impl Into<PathBuf>) -> Self {
        Self {
            hal,
            device: device.into(),
            active: true,
        }
    }

    /// Prevent automatic unbinding and return the loop device path.
    pub fn release(mut self) -> PathBuf {
        self.active = false;
        std::mem::take(&mut self.device)
    }
}

impl<'a, H: LoopOps + ?Sized> Drop for LoopGuard<'a, H> {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        if let Err(err) = self.hal.loop_clear(&self.device) {
            log::warn!(
                "loop guard failed to unbind {}: {}",
                self.device.display(),
                err
            );
        }
    }
}

/// RAII guard that removes a device-mapper device when dropped.
#[derive(Debug)]
pub struct MappingGuard<'a, H: DeviceMapperOps + ?Sized> {
    hal: &'a H,
    name: String,
    active: bool,
}

impl<'a, H: DeviceMapperOps + ?Sized> MappingGuard<'a, H> {
    pub fn new(hal: &'a H, name: impl Into<String>) -> Self {
        Self {
            hal,
            name: name.into(),
            active: true,
        }
    }

    /// Keep the device and return its name.
    pub fn release(mut self) -> String {
        self.active = false;
        std::mem::take(&mut self.name)
    }
}

impl<'a, H: DeviceMapperOps + ?Sized> Drop for MappingGuard<'a, H> {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        if let Err(err) = self.hal.dm_remove(&self.name) {
            log::warn!("mapping guard failed to remove {}: {}", self.name, err);
        }
    }
}
