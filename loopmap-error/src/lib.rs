use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type HalResult<T> = std::result::Result<T, HalError>;
pub type Result<T> = std::result::Result<T, LoopmapError>;

/// Failures reported by the kernel-facing primitives.
#[derive(Error, Debug)]
pub enum HalError {
    #[error("Device is busy: {0}")]
    DeviceBusy(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("No such device or entry: {0}")]
    NotFound(String),

    /// A control node (`/dev/loop-control`, `/dev/mapper/control`) could not be opened.
    #[error("Control node {path} unavailable: {source}")]
    ControlUnavailable {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("{op} failed on {target}: {errno}")]
    Kernel {
        op: &'static str,
        target: String,
        errno: nix::errno::Errno,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("{0}")]
    Other(String),
}

impl HalError {
    /// True when the failure means the object is already gone.
    pub fn is_absent(&self) -> bool {
        match self {
            HalError::NotFound(_) => true,
            HalError::Io(err) => err.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

/// Translate an errno from an ioctl or syscall into a [`HalError`].
pub fn map_nix_err(op: &'static str, target: impl Into<String>, errno: nix::errno::Errno) -> HalError {
    use nix::errno::Errno;
    let target = target.into();
    match errno {
        Errno::EBUSY => HalError::DeviceBusy(target),
        Errno::EACCES | Errno::EPERM => HalError::PermissionDenied(target),
        Errno::ENXIO | Errno::ENODEV | Errno::ENOENT => HalError::NotFound(target),
        errno => HalError::Kernel { op, target, errno },
    }
}

#[derive(Error, Debug)]
pub enum LoopmapError {
    #[error("Image {} is already attached to {}", .image.display(), .device.display())]
    AlreadyInUse { image: PathBuf, device: PathBuf },

    #[error("Resource unavailable: {}: {source}", .resource.display())]
    ResourceUnavailable {
        resource: PathBuf,
        #[source]
        source: HalError,
    },

    #[error("No GPT signature found on {}", .path.display())]
    InvalidTableKind { path: PathBuf },

    #[error("Truncated partition table on {}: {detail}", .path.display())]
    TruncatedInput { path: PathBuf, detail: String },

    #[error("GPT {what} checksum mismatch on {}: stored {stored:#010x}, computed {computed:#010x}", .path.display())]
    ChecksumMismatch {
        path: PathBuf,
        what: &'static str,
        stored: u32,
        computed: u32,
    },

    #[error("Device-mapper {step} failed for {name}: {source}")]
    TransactionFailure {
        name: String,
        step: &'static str,
        #[source]
        source: HalError,
    },

    #[error("Not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Cleanup of {} hit {failures} error(s), last: {last}", .device.display())]
    PartialFailure {
        device: PathBuf,
        failures: usize,
        last: Box<LoopmapError>,
    },

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Hal(#[from] HalError),
}

impl LoopmapError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        LoopmapError::Io {
            path: path.into(),
            source,
        }
    }
}
