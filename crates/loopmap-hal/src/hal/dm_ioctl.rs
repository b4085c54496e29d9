//! Raw device-mapper ioctls (`linux/dm-ioctl.h`, interface version 4).
//!
//! Every request is a `dm_ioctl` header followed by a command-specific payload
//! in one buffer. `data_start` points at the payload, `data_size` covers both.

use super::LinearTarget;
use crate::{HalError, HalResult};
use std::mem::size_of;
use std::ptr;

pub const DM_NAME_LEN: usize = 128;
pub const DM_UUID_LEN: usize = 129;
const DM_MAX_TYPE_NAME: usize = 16;

pub const DM_VERSION_MAJOR: u32 = 4;
pub const DM_VERSION_MINOR: u32 = 0;
pub const DM_VERSION_PATCHLEVEL: u32 = 0;

pub const DM_SUSPEND_FLAG: u32 = 1 << 1;
pub const DM_ACTIVE_PRESENT_FLAG: u32 = 1 << 5;
pub const DM_BUFFER_FULL_FLAG: u32 = 1 << 8;

/// `sizeof(struct dm_target_spec)`.
const DM_TARGET_SPEC_SIZE: usize = 40;

/// `struct dm_ioctl`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct DmIoctl {
    pub version: [u32; 3],
    pub data_size: u32,
    pub data_start: u32,
    pub target_count: u32,
    pub open_count: i32,
    pub flags: u32,
    pub event_nr: u32,
    pub padding: u32,
    pub dev: u64,
    pub name: [u8; DM_NAME_LEN],
    pub uuid: [u8; DM_UUID_LEN],
    pub data: [u8; 7],
}

nix::ioctl_readwrite!(dm_list_devices, 0xfd, 2, DmIoctl);
nix::ioctl_readwrite!(dm_dev_create, 0xfd, 3, DmIoctl);
nix::ioctl_readwrite!(dm_dev_remove, 0xfd, 4, DmIoctl);
nix::ioctl_readwrite!(dm_dev_suspend, 0xfd, 6, DmIoctl);
nix::ioctl_readwrite!(dm_dev_status, 0xfd, 7, DmIoctl);
nix::ioctl_readwrite!(dm_table_load, 0xfd, 9, DmIoctl);

fn align8(len: usize) -> usize {
    (len + 7) & !7
}

/// Device names end up as path components under the mapper directory.
pub fn validate_name(name: &str) -> HalResult<()> {
    if name.is_empty()
        || name.len() >= DM_NAME_LEN
        || name.contains('/')
        || name == "."
        || name == ".."
    {
        return Err(HalError::Other(format!(
            "invalid device-mapper name {:?}",
            name
        )));
    }
    Ok(())
}

/// An 8-byte aligned ioctl argument: header plus payload.
pub struct DmBuffer {
    words: Vec<u64>,
}

impl DmBuffer {
    /// Header for `name` followed by `payload`, with `spare` extra zeroed bytes
    /// for the kernel to write results into.
    pub fn new(name: &str, flags: u32, payload: &[u8], spare: usize) -> HalResult<Self> {
        if !name.is_empty() {
            validate_name(name)?;
        }

        let header_len = size_of::<DmIoctl>();
        let total = align8(header_len + payload.len() + spare);
        let mut buf = Self {
            words: vec![0u64; total / 8],
        };

        let mut header = DmIoctl {
            version: [DM_VERSION_MAJOR, DM_VERSION_MINOR, DM_VERSION_PATCHLEVEL],
            data_size: total as u32,
            data_start: header_len as u32,
            target_count: 0,
            open_count: 0,
            flags,
            event_nr: 0,
            padding: 0,
            dev: 0,
            name: [0; DM_NAME_LEN],
            uuid: [0; DM_UUID_LEN],
            data: [0; 7],
        };
        header.name[..name.len()].copy_from_slice(name.as_bytes());
        buf.set_header(header);
        buf.bytes_mut()[header_len..header_len + payload.len()].copy_from_slice(payload);
        Ok(buf)
    }

    pub fn header(&self) -> DmIoctl {
        // SAFETY: `words` is 8-byte aligned and always at least one header long.
        unsafe { ptr::read(self.words.as_ptr().cast::<DmIoctl>()) }
    }

    pub fn set_header(&mut self, header: DmIoctl) {
        // SAFETY: see `header`.
        unsafe { ptr::write(self.words.as_mut_ptr().cast::<DmIoctl>(), header) }
    }

    pub fn as_mut_ptr(&mut self) -> *mut DmIoctl {
        self.words.as_mut_ptr().cast::<DmIoctl>()
    }

    pub fn capacity(&self) -> usize {
        self.words.len() * 8
    }

    fn bytes(&self) -> &[u8] {
        // SAFETY: u64 storage reinterpreted as bytes, length in bytes.
        unsafe { std::slice::from_raw_parts(self.words.as_ptr().cast::<u8>(), self.capacity()) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        let len = self.capacity();
        // SAFETY: see `bytes`.
        unsafe { std::slice::from_raw_parts_mut(self.words.as_mut_ptr().cast::<u8>(), len) }
    }

    /// The result region the kernel filled in (`data_start..data_size`).
    pub fn payload(&self) -> &[u8] {
        let header = self.header();
        let start = (header.data_start as usize).min(self.capacity());
        let end = (header.data_size as usize).clamp(start, self.capacity());
        &self.bytes()[start..end]
    }
}

/// Encode `dm_target_spec` records for a `DM_TABLE_LOAD` payload.
///
/// Each record is followed by its NUL-terminated parameter string and padded
/// to 8 bytes; `next` is the distance to the following record.
pub fn encode_linear_table(targets: &[LinearTarget]) -> Vec<u8> {
    let mut out = Vec::new();
    for target in targets {
        let mut params = target.params().into_bytes();
        params.push(0);
        let record_len = align8(DM_TARGET_SPEC_SIZE + params.len());

        let mut target_type = [0u8; DM_MAX_TYPE_NAME];
        let kind = LinearTarget::TARGET_TYPE.as_bytes();
        target_type[..kind.len()].copy_from_slice(kind);

        let start = out.len();
        out.extend_from_slice(&target.start.to_ne_bytes());
        out.extend_from_slice(&target.length.to_ne_bytes());
        out.extend_from_slice(&0i32.to_ne_bytes());
        out.extend_from_slice(&(record_len as u32).to_ne_bytes());
        out.extend_from_slice(&target_type);
        out.extend_from_slice(&params);
        out.resize(start + record_len, 0);
    }
    out
}

/// Decode the `dm_name_list` chain returned by `DM_LIST_DEVICES`.
pub fn decode_name_list(payload: &[u8]) -> Vec<(u64, String)> {
    let mut out = Vec::new();
    let mut offset = 0usize;
    while offset + 12 <= payload.len() {
        let mut dev = [0u8; 8];
        dev.copy_from_slice(&payload[offset..offset + 8]);
        let dev = u64::from_ne_bytes(dev);
        let mut next = [0u8; 4];
        next.copy_from_slice(&payload[offset + 8..offset + 12]);
        let next = u32::from_ne_bytes(next) as usize;

        // dev == 0 on the first record flags an empty list
        if dev == 0 && out.is_empty() {
            break;
        }

        let raw = &payload[offset + 12..];
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        out.push((dev, String::from_utf8_lossy(&raw[..end]).to_string()));

        if next == 0 {
            break;
        }
        offset += next;
    }
    out
}
