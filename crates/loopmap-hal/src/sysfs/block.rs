//! Helpers related to block devices in sysfs.

use crate::hal::LoopBacking;
use crate::{HalError, HalResult};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub fn device_basename(path: &Path) -> HalResult<String> {
    let name = path
        .file_name()
        .ok_or_else(|| HalError::Parse(format!("invalid device path {}", path.display())))?
        .to_string_lossy()
        .to_string();
    Ok(name)
}

/// Parse the kernel number out of a loop device name such as `loop12`.
pub fn loop_number(name: &str) -> Option<u32> {
    let digits = name.strip_prefix("loop")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Reads `<sys_block_dir>/loop*/loop/backing_file` for every instantiated loop device.
///
/// Devices without a backing file (unbound) are skipped. Device paths are reported
/// relative to `dev_dir`.
pub fn loop_backing_files_in(sys_block_dir: &Path, dev_dir: &Path) -> HalResult<Vec<LoopBacking>> {
    let entries = match fs::read_dir(sys_block_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let mut out = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        let number = match loop_number(&name) {
            Some(n) => n,
            None => continue,
        };
        let backing = match read_backing_file(&sys_block_dir.join(&name)) {
            Some(p) => p,
            None => continue,
        };
        out.push(LoopBacking {
            device: dev_dir.join(&name),
            number,
            backing_file: backing,
        });
    }
    out.sort_by_key(|b| b.number);
    Ok(out)
}

fn read_backing_file(sys_loop_dir: &Path) -> Option<PathBuf> {
    let raw = fs::read(sys_loop_dir.join("loop/backing_file")).ok()?;
    let text = String::from_utf8_lossy(&raw);
    let trimmed = text.trim_end_matches('\0').trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(PathBuf::from(trimmed))
    }
}
