//! Fake HAL implementation for testing.
//!
//! This implementation keeps an in-memory model of loop slots and device-mapper
//! devices and records every operation, allowing CI-safe testing without root
//! privileges or real hardware. Individual operations can be told to fail.

use super::block_ops::DEFAULT_BLOCK_SIZE;
use super::{
    BlockDeviceOps, DeviceMapperOps, DeviceNumber, LinearTarget, LoopBacking, LoopOps, NodeOps,
};
use crate::{HalError, HalPaths, HalResult};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Major number the fake hands out for device-mapper devices.
pub const FAKE_DM_MAJOR: u32 = 253;

/// Operation records for testing and verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeOp {
    LoopGetFree {
        number: u32,
    },
    LoopBind {
        device: PathBuf,
        image: PathBuf,
        read_write: bool,
    },
    LoopSetStatus {
        device: PathBuf,
        read_write: bool,
    },
    LoopClear {
        device: PathBuf,
    },
    DmCreate {
        name: String,
        table: Vec<LinearTarget>,
    },
    DmResume {
        name: String,
    },
    DmWaitReady {
        name: String,
    },
    DmRemove {
        name: String,
    },
    MakeBlockNode {
        path: PathBuf,
        dev: DeviceNumber,
    },
}

#[derive(Debug, Clone)]
struct FakeDmDevice {
    minor: u32,
    active: bool,
    table: Vec<LinearTarget>,
}

/// Shared state for FakeHal operations.
#[derive(Debug, Clone, Default)]
struct FakeHalState {
    /// All operations that were recorded
    operations: Vec<FakeOp>,
    /// Bound loop devices: number -> (backing image, read_write)
    loops: BTreeMap<u32, (PathBuf, bool)>,
    /// Device-mapper devices by name
    dm: BTreeMap<String, FakeDmDevice>,
    next_minor: u32,
    /// Operation name -> number of upcoming calls that fail
    failures: HashMap<&'static str, usize>,
    /// Devices whose status never publishes a device number
    hidden: Vec<String>,
}

/// Fake HAL implementation that simulates kernel state without touching it.
///
/// Loop device nodes are reported under `paths.dev_dir`. When that directory
/// exists, binding a loop device also drops a symlink to the image at the
/// device path so readers see the backing file through it. Block nodes are
/// created as empty regular files so node and symlink handling can run in a
/// scratch directory.
#[derive(Debug, Clone, Default)]
pub struct FakeHal {
    paths: HalPaths,
    state: Arc<Mutex<FakeHalState>>,
}

impl FakeHal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_paths(paths: HalPaths) -> Self {
        Self {
            paths,
            state: Arc::default(),
        }
    }

    fn state(&self) -> MutexGuard<'_, FakeHalState> {
        // A panicking test thread must not wedge the others.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Get all recorded operations.
    pub fn operations(&self) -> Vec<FakeOp> {
        self.state().operations.clone()
    }

    /// Get the number of operations recorded.
    pub fn operation_count(&self) -> usize {
        self.state().operations.len()
    }

    /// Check if a specific operation was recorded.
    pub fn has_operation(&self, check: impl Fn(&FakeOp) -> bool) -> bool {
        self.state().operations.iter().any(check)
    }

    /// Clear recorded operations, keeping simulated kernel state.
    pub fn clear(&self) {
        self.state().operations.clear();
    }

    /// Make the next `times` calls of `op` fail.
    ///
    /// `op` is the ioctl-style name: `LOOP_CTL_GET_FREE`, `LOOP_SET_FD`,
    /// `LOOP_SET_STATUS64`, `LOOP_CLR_FD`, `DM_DEV_CREATE`, `DM_DEV_SUSPEND`,
    /// `DM_WAIT_READY`, `DM_DEV_REMOVE`, `DM_LIST_DEVICES` or `mknod`.
    pub fn fail_next(&self, op: &'static str, times: usize) {
        self.state().failures.insert(op, times);
    }

    /// Keep device `name` from publishing a major/minor pair.
    pub fn hide_device_number(&self, name: &str) {
        self.state().hidden.push(name.to_string());
    }

    /// Pretend `image` is already bound to loop `number` by someone else.
    pub fn preload_loop(&self, number: u32, image: impl Into<PathBuf>) {
        self.state().loops.insert(number, (image.into(), true));
    }

    /// Names of the device-mapper devices currently present.
    pub fn dm_devices(&self) -> Vec<String> {
        self.state().dm.keys().cloned().collect()
    }

    /// Table of device `name`, if present.
    pub fn dm_table(&self, name: &str) -> Option<Vec<LinearTarget>> {
        self.state().dm.get(name).map(|d| d.table.clone())
    }

    /// Whether device `name` is present and resumed.
    pub fn dm_is_active(&self, name: &str) -> bool {
        self.state().dm.get(name).map(|d| d.active).unwrap_or(false)
    }

    /// Backing image of loop `number`, if bound.
    pub fn loop_binding(&self, number: u32) -> Option<PathBuf> {
        self.state().loops.get(&number).map(|(image, _)| image.clone())
    }

    fn record_operation(&self, op: FakeOp) {
        self.state().operations.push(op);
    }

    fn check_failure(&self, op: &'static str, target: &str) -> HalResult<()> {
        let mut state = self.state();
        if let Some(remaining) = state.failures.get_mut(op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(HalError::Kernel {
                    op,
                    target: target.to_string(),
                    errno: nix::errno::Errno::EIO,
                });
            }
        }
        Ok(())
    }

    fn loop_number_of(&self, device: &Path) -> HalResult<u32> {
        device
            .file_name()
            .and_then(|n| crate::sysfs::block::loop_number(&n.to_string_lossy()))
            .ok_or_else(|| HalError::NotFound(device.display().to_string()))
    }
}

impl LoopOps for FakeHal {
    fn loop_get_free(&self) -> HalResult<u32> {
        self.check_failure("LOOP_CTL_GET_FREE", "loop-control")?;
        let number = {
            let state = self.state();
            (0u32..)
                .find(|n| !state.loops.contains_key(n))
                .unwrap_or_default()
        };
        log::info!("FAKE HAL: LOOP_CTL_GET_FREE -> {}", number);
        self.record_operation(FakeOp::LoopGetFree { number });
        Ok(number)
    }

    fn loop_bind(&self, device: &Path, image: &Path, read_write: bool) -> HalResult<()> {
        let target = device.display().to_string();
        self.check_failure("LOOP_SET_FD", &target)?;
        if !image.exists() {
            return Err(HalError::NotFound(image.display().to_string()));
        }
        let number = self.loop_number_of(device)?;
        {
            let mut state = self.state();
            if state.loops.contains_key(&number) {
                return Err(HalError::DeviceBusy(target));
            }
            state
                .loops
                .insert(number, (image.to_path_buf(), read_write));
        }
        if device.parent().map(Path::is_dir).unwrap_or(false) {
            let _ = std::fs::remove_file(device);
            std::os::unix::fs::symlink(image, device)?;
        }
        log::info!("FAKE HAL: LOOP_SET_FD {} <- {}", target, image.display());
        self.record_operation(FakeOp::LoopBind {
            device: device.to_path_buf(),
            image: image.to_path_buf(),
            read_write,
        });
        Ok(())
    }

    fn loop_set_status(&self, device: &Path, _image: &Path, read_write: bool) -> HalResult<()> {
        let target = device.display().to_string();
        self.check_failure("LOOP_SET_STATUS64", &target)?;
        let number = self.loop_number_of(device)?;
        {
            let mut state = self.state();
            match state.loops.get_mut(&number) {
                Some(slot) => slot.1 = read_write,
                None => return Err(HalError::NotFound(target)),
            }
        }
        self.record_operation(FakeOp::LoopSetStatus {
            device: device.to_path_buf(),
            read_write,
        });
        Ok(())
    }

    fn loop_clear(&self, device: &Path) -> HalResult<()> {
        let target = device.display().to_string();
        self.check_failure("LOOP_CLR_FD", &target)?;
        let number = self.loop_number_of(device)?;
        if self.state().loops.remove(&number).is_none() {
            // The kernel answers ENXIO for an unbound device.
            return Err(HalError::NotFound(target));
        }
        let is_link = std::fs::symlink_metadata(device)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false);
        if is_link {
            std::fs::remove_file(device)?;
        }
        log::info!("FAKE HAL: LOOP_CLR_FD {}", target);
        self.record_operation(FakeOp::LoopClear {
            device: device.to_path_buf(),
        });
        Ok(())
    }

    fn loop_backing_files(&self) -> HalResult<Vec<LoopBacking>> {
        Ok(self
            .state()
            .loops
            .iter()
            .map(|(number, (image, _))| LoopBacking {
                device: self.paths.loop_device(*number),
                number: *number,
                backing_file: image.clone(),
            })
            .collect())
    }
}

impl DeviceMapperOps for FakeHal {
    fn dm_create(&self, name: &str, table: &[LinearTarget]) -> HalResult<()> {
        self.check_failure("DM_DEV_CREATE", name)?;
        {
            let mut state = self.state();
            if state.dm.contains_key(name) {
                return Err(HalError::DeviceBusy(name.to_string()));
            }
            let minor = state.next_minor;
            state.next_minor += 1;
            state.dm.insert(
                name.to_string(),
                FakeDmDevice {
                    minor,
                    active: false,
                    table: table.to_vec(),
                },
            );
        }
        log::info!("FAKE HAL: DM_DEV_CREATE {} ({} target(s))", name, table.len());
        self.record_operation(FakeOp::DmCreate {
            name: name.to_string(),
            table: table.to_vec(),
        });
        Ok(())
    }

    fn dm_resume(&self, name: &str) -> HalResult<()> {
        self.check_failure("DM_DEV_SUSPEND", name)?;
        match self.state().dm.get_mut(name) {
            Some(dev) => dev.active = true,
            None => return Err(HalError::NotFound(name.to_string())),
        }
        self.record_operation(FakeOp::DmResume {
            name: name.to_string(),
        });
        Ok(())
    }

    fn dm_wait_ready(&self, name: &str, _timeout_ms: u64) -> HalResult<()> {
        self.check_failure("DM_WAIT_READY", name)?;
        self.record_operation(FakeOp::DmWaitReady {
            name: name.to_string(),
        });
        if self.dm_is_active(name) {
            Ok(())
        } else {
            Err(HalError::Other(format!("{} is not active", name)))
        }
    }

    fn dm_device_number(&self, name: &str) -> HalResult<Option<DeviceNumber>> {
        let state = self.state();
        if state.hidden.iter().any(|h| h == name) {
            return Ok(None);
        }
        Ok(state
            .dm
            .get(name)
            .map(|d| DeviceNumber::new(FAKE_DM_MAJOR, d.minor)))
    }

    fn dm_remove(&self, name: &str) -> HalResult<()> {
        self.check_failure("DM_DEV_REMOVE", name)?;
        if self.state().dm.remove(name).is_none() {
            return Err(HalError::NotFound(name.to_string()));
        }
        log::info!("FAKE HAL: DM_DEV_REMOVE {}", name);
        self.record_operation(FakeOp::DmRemove {
            name: name.to_string(),
        });
        Ok(())
    }

    fn dm_list(&self) -> HalResult<Vec<String>> {
        self.check_failure("DM_LIST_DEVICES", "device list")?;
        Ok(self.dm_devices())
    }
}

impl NodeOps for FakeHal {
    fn make_block_node(&self, path: &Path, dev: DeviceNumber) -> HalResult<()> {
        self.check_failure("mknod", &path.display().to_string())?;
        File::create(path)?;
        self.record_operation(FakeOp::MakeBlockNode {
            path: path.to_path_buf(),
            dev,
        });
        Ok(())
    }
}

impl BlockDeviceOps for FakeHal {
    fn logical_block_size(&self, _file: &File) -> HalResult<u32> {
        Ok(DEFAULT_BLOCK_SIZE)
    }
}
