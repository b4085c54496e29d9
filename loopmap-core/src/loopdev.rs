//! Binding image files to kernel loop devices.
//!
//! A loop device is either free or bound to exactly one backing file; all of
//! that state lives in the kernel. Nothing here caches it.

use crate::config::Config;
use crate::guards::LoopGuard;
use loopmap_error::{LoopmapError, Result};
use loopmap_hal::LoopOps;
use std::io;
use std::path::{Path, PathBuf};

/// A loop device bound by [`LoopManager::attach`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopDevice {
    pub path: PathBuf,
    pub number: u32,
    /// Canonical path of the backing image.
    pub backing_file: PathBuf,
    pub read_write: bool,
}

impl AsRef<Path> for LoopDevice {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

pub struct LoopManager<'a, H: LoopOps + ?Sized> {
    hal: &'a H,
    config: &'a Config,
}

fn canonical_image(image: &Path) -> Result<PathBuf> {
    image.canonicalize().map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => LoopmapError::NotFound(image.to_path_buf()),
        _ => LoopmapError::io(image, e),
    })
}

impl<'a, H: LoopOps + ?Sized> LoopManager<'a, H> {
    pub fn new(hal: &'a H, config: &'a Config) -> Self {
        Self { hal, config }
    }

    fn scan(&self, canonical: &Path) -> Result<Option<PathBuf>> {
        let bound = self.hal.loop_backing_files()?;
        Ok(bound
            .into_iter()
            .find(|b| b.backing_file == canonical)
            .map(|b| b.device))
    }

    /// The loop device `image` is currently bound to, if any.
    pub fn find_attached(&self, image: &Path) -> Result<Option<PathBuf>> {
        let canonical = canonical_image(image)?;
        self.scan(&canonical)
    }

    /// Bind `image` to a free loop device.
    ///
    /// The image is opened read-only unless `read_write` is set, and the
    /// device's read-only flag follows the same choice. Fails with
    /// [`LoopmapError::AlreadyInUse`] when some loop device already has the
    /// image as its backing file. That check is not atomic with the bind.
    pub fn attach(&self, image: &Path, read_write: bool) -> Result<LoopDevice> {
        let image = canonical_image(image)?;

        match self.scan(&image) {
            Ok(Some(device)) => {
                return Err(LoopmapError::AlreadyInUse { image, device });
            }
            Ok(None) => {}
            Err(err) => self.config.warn(format!(
                "could not check whether {} is already attached: {}",
                image.display(),
                err
            )),
        }

        let number = self
            .hal
            .loop_get_free()
            .map_err(|source| LoopmapError::ResourceUnavailable {
                resource: self.config.paths.loop_control.clone(),
                source,
            })?;
        let device = self.config.paths.loop_device(number);
        log::debug!("loop control handed out {}", device.display());

        self.hal.loop_bind(&device, &image, read_write)?;
        let guard = LoopGuard::new(self.hal, &device);
        self.hal.loop_set_status(&device, &image, read_write)?;
        let path = guard.release();

        self.config.status(format!(
            "attached {} to {} ({})",
            image.display(),
            path.display(),
            if read_write { "read-write" } else { "read-only" }
        ));

        Ok(LoopDevice {
            path,
            number,
            backing_file: image,
            read_write,
        })
    }

    /// Unbind `device` from its backing file.
    ///
    /// Detaching a device that is not bound is an error. Device-mapper mappings
    /// on top of the device are left alone.
    pub fn detach(&self, device: &Path) -> Result<()> {
        self.hal.loop_clear(device)?;
        self.config.status(format!("detached {}", device.display()));
        Ok(())
    }
}
