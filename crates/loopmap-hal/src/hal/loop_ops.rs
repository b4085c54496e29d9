//! Loop device operations (loop control and per-device ioctls).

use crate::HalResult;
use std::path::{Path, PathBuf};

/// A loop device currently bound to a backing file, as published by the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopBacking {
    pub device: PathBuf,
    pub number: u32,
    pub backing_file: PathBuf,
}

pub trait LoopOps {
    /// Ask the loop control device for a free loop number (`LOOP_CTL_GET_FREE`).
    ///
    /// The kernel instantiates the device node if needed.
    fn loop_get_free(&self) -> HalResult<u32>;

    /// Bind `image` to `device` (`LOOP_SET_FD`). The image is opened read-only
    /// unless `read_write` is set.
    fn loop_bind(&self, device: &Path, image: &Path, read_write: bool) -> HalResult<()>;

    /// Apply status flags to a bound device (`LOOP_SET_STATUS64`).
    fn loop_set_status(&self, device: &Path, image: &Path, read_write: bool) -> HalResult<()>;

    /// Unbind `device` from its backing file (`LOOP_CLR_FD`).
    fn loop_clear(&self, device: &Path) -> HalResult<()>;

    /// Every instantiated loop device that currently has a backing file.
    fn loop_backing_files(&self) -> HalResult<Vec<LoopBacking>>;
}
