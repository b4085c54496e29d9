//! Filesystem locations of the kernel interfaces.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Where the kernel exposes loop control, device-mapper control and block metadata.
///
/// Defaults match a stock Linux system. Tests point these at a scratch directory.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HalPaths {
    /// Directory holding block device nodes (`loopN`, `dm-N`).
    pub dev_dir: PathBuf,
    /// sysfs directory listing block devices.
    pub sys_block_dir: PathBuf,
    /// Directory holding the per-mapping symlinks.
    pub mapper_dir: PathBuf,
    pub loop_control: PathBuf,
    pub dm_control: PathBuf,
}

impl Default for HalPaths {
    fn default() -> Self {
        Self {
            dev_dir: PathBuf::from("/dev"),
            sys_block_dir: PathBuf::from("/sys/block"),
            mapper_dir: PathBuf::from("/dev/mapper"),
            loop_control: PathBuf::from("/dev/loop-control"),
            dm_control: PathBuf::from("/dev/mapper/control"),
        }
    }
}

impl HalPaths {
    /// Lay out every location under a single root, mirroring `/dev` and `/sys/block`.
    pub fn rooted_at(root: &Path) -> Self {
        let dev_dir = root.join("dev");
        Self {
            sys_block_dir: root.join("sys/block"),
            mapper_dir: dev_dir.join("mapper"),
            loop_control: dev_dir.join("loop-control"),
            dm_control: dev_dir.join("mapper/control"),
            dev_dir,
        }
    }

    /// Path of loop device `number`, e.g. `/dev/loop7`.
    pub fn loop_device(&self, number: u32) -> PathBuf {
        self.dev_dir.join(format!("loop{}", number))
    }

    /// Path of the numbered device-mapper node, e.g. `/dev/dm-3`.
    pub fn dm_node(&self, minor: u32) -> PathBuf {
        self.dev_dir.join(format!("dm-{}", minor))
    }

    /// Path of the named mapping symlink, e.g. `/dev/mapper/loop7p1`.
    pub fn mapper_link(&self, name: &str) -> PathBuf {
        self.mapper_dir.join(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_stock_linux() {
        let paths = HalPaths::default();
        assert_eq!(paths.loop_device(7), PathBuf::from("/dev/loop7"));
        assert_eq!(paths.dm_node(3), PathBuf::from("/dev/dm-3"));
        assert_eq!(
            paths.mapper_link("loop7p1"),
            PathBuf::from("/dev/mapper/loop7p1")
        );
    }

    #[test]
    fn rooted_layout_keeps_mapper_under_dev() {
        let paths = HalPaths::rooted_at(Path::new("/tmp/lab"));
        assert_eq!(paths.mapper_dir, PathBuf::from("/tmp/lab/dev/mapper"));
        assert_eq!(paths.mapper_dir.parent(), Some(paths.dev_dir.as_path()));
        assert_eq!(paths.sys_block_dir, PathBuf::from("/tmp/lab/sys/block"));
    }
}
