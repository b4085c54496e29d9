//! loopmap core library.
//!
//! Attaches image files to loop devices, reads their GPT, and exposes each
//! partition as its own device-mapper block device. No external tools are
//! involved: every kernel interaction goes through the `loopmap-hal` traits.
//!
//! ```no_run
//! use loopmap_core::{Config, Loopmap};
//! use std::path::Path;
//!
//! let lm = Loopmap::new(Config::default());
//! let dev = lm.attach(Path::new("/srv/disk.img"), true)?;
//! for mapping in lm.create_mappings(&dev.path)? {
//!     println!("{} -> {:?}", mapping.name, mapping.link());
//! }
//! lm.cleanup_mappings(&dev.path)?;
//! lm.detach(&dev.path)?;
//! # Ok::<(), loopmap_core::LoopmapError>(())
//! ```

pub mod config;
pub mod gpt;
pub mod guards;
pub mod logging;
pub mod loopdev;
pub mod mapper;

pub use config::{Config, Event};
pub use gpt::{ChecksumStatus, Partition, PartitionTable};
pub use loopdev::{LoopDevice, LoopManager};
pub use loopmap_error::{HalError, LoopmapError, Result};
pub use mapper::{Mapper, MappingOutcome, NodeState, Readiness};

use loopmap_hal::{LinuxHal, SystemHal};
use std::path::Path;

/// Owns the kernel handle and configuration; every operation borrows both.
pub struct Loopmap<H: SystemHal = LinuxHal> {
    hal: H,
    config: Config,
}

impl Loopmap<LinuxHal> {
    /// Talk to the running kernel at the locations in `config.paths`.
    pub fn new(config: Config) -> Self {
        let hal = LinuxHal::with_paths(config.paths.clone());
        Self { hal, config }
    }
}

impl<H: SystemHal> Loopmap<H> {
    pub fn with_hal(hal: H, config: Config) -> Self {
        Self { hal, config }
    }

    pub fn hal(&self) -> &H {
        &self.hal
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn loops(&self) -> LoopManager<'_, H> {
        LoopManager::new(&self.hal, &self.config)
    }

    pub fn mapper(&self) -> Mapper<'_, H> {
        Mapper::new(&self.hal, &self.config)
    }

    pub fn attach(&self, image: &Path, read_write: bool) -> Result<LoopDevice> {
        self.loops().attach(image, read_write)
    }

    pub fn detach(&self, device: impl AsRef<Path>) -> Result<()> {
        self.loops().detach(device.as_ref())
    }

    pub fn find_attached(&self, image: &Path) -> Result<Option<std::path::PathBuf>> {
        self.loops().find_attached(image)
    }

    pub fn parse_partition_table(&self, path: &Path) -> Result<Vec<Partition>> {
        gpt::parse_partition_table(&self.hal, path, self.config.strict_checksums)
    }

    /// Header, partitions and checksum status of the GPT on `path`.
    pub fn read_partition_table(&self, path: &Path) -> Result<PartitionTable> {
        gpt::load_table(&self.hal, path, self.config.strict_checksums)
    }

    pub fn create_mappings(&self, loop_device: &Path) -> Result<Vec<MappingOutcome>> {
        self.mapper().create_mappings(loop_device)
    }

    pub fn cleanup_mappings(&self, loop_device: &Path) -> Result<usize> {
        self.mapper().cleanup_mappings(loop_device)
    }
}
