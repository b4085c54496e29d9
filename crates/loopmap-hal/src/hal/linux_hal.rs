//! Linux HAL implementation using direct ioctls.
//!
//! No external tools are spawned: loop devices are driven through
//! `/dev/loop-control` and the per-device loop ioctls, device-mapper through
//! `/dev/mapper/control`.

use super::block_ops::DEFAULT_BLOCK_SIZE;
use super::dm_ioctl::{
    self, decode_name_list, encode_linear_table, DmBuffer, DmIoctl, DM_ACTIVE_PRESENT_FLAG,
    DM_BUFFER_FULL_FLAG, DM_SUSPEND_FLAG,
};
use super::loop_ioctl::{self, LoopInfo64};
use super::{
    BlockDeviceOps, DeviceMapperOps, DeviceNumber, LinearTarget, LoopBacking, LoopOps, NodeOps,
};
use crate::sysfs::block::loop_backing_files_in;
use crate::{map_nix_err, HalError, HalPaths, HalResult};
use nix::sys::stat::{makedev, mknod, Mode, SFlag};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::time::{Duration, Instant};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(10);
const LIST_BUFFER_INITIAL: usize = 16 * 1024;
const LIST_BUFFER_MAX: usize = 4 * 1024 * 1024;

// BLKSSZGET = _IO(0x12, 104)
nix::ioctl_read_bad!(blksszget, 0x1268, libc::c_int);

type DmRequest = unsafe fn(libc::c_int, *mut DmIoctl) -> nix::Result<libc::c_int>;

/// Real HAL implementation for Linux systems.
#[derive(Debug, Clone, Default)]
pub struct LinuxHal {
    paths: HalPaths,
}

impl LinuxHal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_paths(paths: HalPaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &HalPaths {
        &self.paths
    }

    fn control(&self) -> HalResult<File> {
        open_control(&self.paths.dm_control, true)
    }

    fn dm_call(
        &self,
        op: &'static str,
        name: &str,
        request: DmRequest,
        buf: &mut DmBuffer,
    ) -> HalResult<DmIoctl> {
        let control = self.control()?;
        // SAFETY: `buf` owns an aligned dm_ioctl header and `data_size` bytes.
        unsafe { request(control.as_raw_fd(), buf.as_mut_ptr()) }
            .map_err(|e| map_nix_err(op, name, e))?;
        Ok(buf.header())
    }

    fn dm_status(&self, name: &str) -> HalResult<DmIoctl> {
        let mut buf = DmBuffer::new(name, 0, &[], 0)?;
        self.dm_call("DM_DEV_STATUS", name, dm_ioctl::dm_dev_status, &mut buf)
    }
}

fn map_io_err(path: &Path, err: io::Error) -> HalError {
    match err.kind() {
        io::ErrorKind::NotFound => HalError::NotFound(path.display().to_string()),
        io::ErrorKind::PermissionDenied => HalError::PermissionDenied(path.display().to_string()),
        _ => HalError::Io(err),
    }
}

/// Control nodes are never "already gone": failing to open one is a hard error.
fn open_control(path: &Path, write: bool) -> HalResult<File> {
    OpenOptions::new()
        .read(true)
        .write(write)
        .open(path)
        .map_err(|source| HalError::ControlUnavailable {
            path: path.display().to_string(),
            source,
        })
}

fn open_path(path: &Path, write: bool) -> HalResult<File> {
    OpenOptions::new()
        .read(true)
        .write(write)
        .open(path)
        .map_err(|e| map_io_err(path, e))
}

impl LoopOps for LinuxHal {
    fn loop_get_free(&self) -> HalResult<u32> {
        let control = open_control(&self.paths.loop_control, false)?;
        // SAFETY: plain ioctl on an open control fd, no argument.
        let number = unsafe { loop_ioctl::loop_ctl_get_free(control.as_raw_fd()) }.map_err(|e| {
            map_nix_err(
                "LOOP_CTL_GET_FREE",
                self.paths.loop_control.display().to_string(),
                e,
            )
        })?;
        u32::try_from(number)
            .map_err(|_| HalError::Parse(format!("kernel returned loop number {}", number)))
    }

    fn loop_bind(&self, device: &Path, image: &Path, read_write: bool) -> HalResult<()> {
        let loop_file = open_path(device, read_write)?;
        let image_file = open_path(image, read_write)?;
        // SAFETY: both descriptors stay open for the duration of the call.
        unsafe { loop_ioctl::loop_set_fd(loop_file.as_raw_fd(), image_file.as_raw_fd()) }
            .map_err(|e| map_nix_err("LOOP_SET_FD", device.display().to_string(), e))?;
        Ok(())
    }

    fn loop_set_status(&self, device: &Path, image: &Path, read_write: bool) -> HalResult<()> {
        let loop_file = open_path(device, false)?;
        let info = LoopInfo64::for_image(image.as_os_str(), read_write);
        // SAFETY: `info` is a fully initialised loop_info64 that outlives the call.
        unsafe { loop_ioctl::loop_set_status64(loop_file.as_raw_fd(), &info) }
            .map_err(|e| map_nix_err("LOOP_SET_STATUS64", device.display().to_string(), e))?;
        Ok(())
    }

    fn loop_clear(&self, device: &Path) -> HalResult<()> {
        let loop_file = open_path(device, false)?;
        // SAFETY: plain ioctl on an open loop fd, no argument.
        unsafe { loop_ioctl::loop_clr_fd(loop_file.as_raw_fd()) }
            .map_err(|e| map_nix_err("LOOP_CLR_FD", device.display().to_string(), e))?;
        Ok(())
    }

    fn loop_backing_files(&self) -> HalResult<Vec<LoopBacking>> {
        loop_backing_files_in(&self.paths.sys_block_dir, &self.paths.dev_dir)
    }
}

impl DeviceMapperOps for LinuxHal {
    fn dm_create(&self, name: &str, table: &[LinearTarget]) -> HalResult<()> {
        let mut create = DmBuffer::new(name, 0, &[], 0)?;
        self.dm_call("DM_DEV_CREATE", name, dm_ioctl::dm_dev_create, &mut create)?;

        let payload = encode_linear_table(table);
        let mut load = DmBuffer::new(name, 0, &payload, 0)?;
        let mut header = load.header();
        header.target_count = table.len() as u32;
        load.set_header(header);

        if let Err(err) = self.dm_call("DM_TABLE_LOAD", name, dm_ioctl::dm_table_load, &mut load) {
            log::warn!("table load for {} failed, removing device: {}", name, err);
            if let Err(rm) = self.dm_remove(name) {
                log::warn!("failed to remove half-created device {}: {}", name, rm);
            }
            return Err(err);
        }
        Ok(())
    }

    fn dm_resume(&self, name: &str) -> HalResult<()> {
        // DM_DEV_SUSPEND without DM_SUSPEND_FLAG resumes
        let mut buf = DmBuffer::new(name, 0, &[], 0)?;
        self.dm_call("DM_DEV_SUSPEND", name, dm_ioctl::dm_dev_suspend, &mut buf)?;
        Ok(())
    }

    fn dm_wait_ready(&self, name: &str, timeout_ms: u64) -> HalResult<()> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            let status = self.dm_status(name)?;
            let active = status.flags & DM_ACTIVE_PRESENT_FLAG != 0;
            let suspended = status.flags & DM_SUSPEND_FLAG != 0;
            if active && !suspended {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(HalError::Other(format!(
                    "{} not active after {}ms (flags={:#x})",
                    name, timeout_ms, status.flags
                )));
            }
            std::thread::sleep(READY_POLL_INTERVAL);
        }
    }

    fn dm_device_number(&self, name: &str) -> HalResult<Option<DeviceNumber>> {
        match self.dm_status(name) {
            Ok(status) => Ok(Some(DeviceNumber::from_dev(status.dev))),
            // ENXIO from the ioctl itself; a missing control node is still an error
            Err(HalError::NotFound(ref target)) if target == name => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn dm_remove(&self, name: &str) -> HalResult<()> {
        let mut buf = DmBuffer::new(name, 0, &[], 0)?;
        self.dm_call("DM_DEV_REMOVE", name, dm_ioctl::dm_dev_remove, &mut buf)?;
        Ok(())
    }

    fn dm_list(&self) -> HalResult<Vec<String>> {
        let mut spare = LIST_BUFFER_INITIAL;
        loop {
            let mut buf = DmBuffer::new("", 0, &[], spare)?;
            let header =
                self.dm_call("DM_LIST_DEVICES", "device list", dm_ioctl::dm_list_devices, &mut buf)?;
            if header.flags & DM_BUFFER_FULL_FLAG == 0 {
                return Ok(decode_name_list(buf.payload())
                    .into_iter()
                    .map(|(_, name)| name)
                    .collect());
            }
            spare *= 2;
            if spare > LIST_BUFFER_MAX {
                return Err(HalError::Other(
                    "device-mapper device list exceeds buffer limit".to_string(),
                ));
            }
        }
    }
}

impl NodeOps for LinuxHal {
    fn make_block_node(&self, path: &Path, dev: DeviceNumber) -> HalResult<()> {
        let devt = makedev(dev.major as u64, dev.minor as u64);
        mknod(path, SFlag::S_IFBLK, Mode::from_bits_truncate(0o600), devt)
            .map_err(|e| map_nix_err("mknod", path.display().to_string(), e))
    }
}

impl BlockDeviceOps for LinuxHal {
    fn logical_block_size(&self, file: &File) -> HalResult<u32> {
        let meta = file.metadata()?;
        if !meta.file_type().is_block_device() {
            return Ok(DEFAULT_BLOCK_SIZE);
        }

        let mut size: libc::c_int = 0;
        // SAFETY: BLKSSZGET writes one int into `size`.
        unsafe { blksszget(file.as_raw_fd(), &mut size) }
            .map_err(|e| map_nix_err("BLKSSZGET", "block device", e))?;
        match u32::try_from(size) {
            Ok(size) if size >= DEFAULT_BLOCK_SIZE && size.is_power_of_two() => Ok(size),
            _ => Err(HalError::Parse(format!(
                "unexpected logical block size {}",
                size
            ))),
        }
    }
}
