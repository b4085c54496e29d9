//! Per-partition device-mapper devices on top of a loop device.
//!
//! Each used GPT slot `K` on `/dev/loopN` becomes a linear device-mapper device
//! named `loopNpK`, with a block node `<dev>/dm-<minor>` and a symlink
//! `<mapper>/loopNpK` pointing at it. Mappings outlive the loop device: they
//! are only removed by [`Mapper::cleanup_mappings`].

use crate::config::Config;
use crate::gpt::{self, Partition};
use crate::guards::MappingGuard;
use loopmap_error::{HalError, LoopmapError, Result};
use loopmap_hal::sysfs::block::{device_basename, loop_number};
use loopmap_hal::{BlockDeviceOps, DeviceMapperOps, DeviceNumber, LinearTarget, NodeOps};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Whether the kernel confirmed the device active before we moved on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Unconfirmed,
}

/// What happened to the visible nodes of one mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeState {
    Materialized {
        dev: DeviceNumber,
        node: PathBuf,
        link: PathBuf,
    },
    /// The device-mapper device exists but has no usable node under our paths.
    Skipped { reason: String },
}

/// One partition's mapping, as created by [`Mapper::create_mappings`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingOutcome {
    pub name: String,
    pub partition: Partition,
    pub table: LinearTarget,
    pub readiness: Readiness,
    pub node: NodeState,
}

impl MappingOutcome {
    /// The `<mapper>/<name>` symlink, when it was created.
    pub fn link(&self) -> Option<&Path> {
        match &self.node {
            NodeState::Materialized { link, .. } => Some(link),
            NodeState::Skipped { .. } => None,
        }
    }
}

/// Deterministic device-mapper name for partition `partition` of loop `loop_number`.
pub fn mapping_name(loop_number: u32, partition: u32) -> String {
    format!("loop{}p{}", loop_number, partition)
}

/// True for names produced by [`mapping_name`] for `loop_number`.
pub fn is_mapping_of(name: &str, loop_number: u32) -> bool {
    name.strip_prefix(&format!("loop{}p", loop_number))
        .map(|k| !k.is_empty() && k.bytes().all(|b| b.is_ascii_digit()))
        .unwrap_or(false)
}

/// Kernel loop number of `device` (`/dev/loop7` is 7).
pub fn loop_number_of(device: &Path) -> Result<u32> {
    let name = device_basename(device)?;
    loop_number(&name).ok_or_else(|| {
        LoopmapError::ValidationFailed(format!(
            "{} is not a loop device",
            device.display()
        ))
    })
}

fn partition_suffix(name: &str) -> u64 {
    name.rsplit('p')
        .next()
        .and_then(|k| k.parse().ok())
        .unwrap_or(u64::MAX)
}

fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

pub struct Mapper<'a, H: DeviceMapperOps + NodeOps + BlockDeviceOps + ?Sized> {
    hal: &'a H,
    config: &'a Config,
}

impl<'a, H: DeviceMapperOps + NodeOps + BlockDeviceOps + ?Sized> Mapper<'a, H> {
    pub fn new(hal: &'a H, config: &'a Config) -> Self {
        Self { hal, config }
    }

    /// Symlink target for the numbered node: relative when the mapper dir sits
    /// directly under the dev dir.
    fn link_target(&self, node: &Path) -> PathBuf {
        let paths = &self.config.paths;
        match (paths.mapper_dir.parent(), node.file_name()) {
            (Some(parent), Some(file)) if parent == paths.dev_dir => Path::new("..").join(file),
            _ => node.to_path_buf(),
        }
    }

    /// Create one device-mapper device per used partition on `loop_device`.
    ///
    /// Partitions are processed in order. A failure to create, load or resume
    /// a device aborts the remaining partitions; mappings already made stay.
    /// Readiness and node problems are logged and reported per mapping.
    pub fn create_mappings(&self, loop_device: &Path) -> Result<Vec<MappingOutcome>> {
        let number = loop_number_of(loop_device)?;
        self.config.status(format!(
            "setting up device-mapper mappings for {}",
            loop_device.display()
        ));

        let partitions =
            gpt::parse_partition_table(self.hal, loop_device, self.config.strict_checksums)?;
        if partitions.is_empty() {
            self.config.status(format!(
                "no partitions on {}, nothing to map",
                loop_device.display()
            ));
        }

        let mut outcomes = Vec::with_capacity(partitions.len());
        for partition in partitions {
            let outcome = self.map_partition(number, loop_device, partition)?;
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    fn map_partition(
        &self,
        loop_number: u32,
        loop_device: &Path,
        partition: Partition,
    ) -> Result<MappingOutcome> {
        let name = mapping_name(loop_number, partition.number);
        let (offset, length) = partition.mapper_sectors().ok_or_else(|| {
            LoopmapError::ValidationFailed(format!(
                "partition {} of {} does not fit in 512-byte sectors",
                partition.number,
                loop_device.display()
            ))
        })?;
        let table = LinearTarget {
            start: 0,
            length,
            device: loop_device.to_path_buf(),
            offset,
        };
        self.config.status(format!(
            "mapping partition {} as {}: {}",
            partition.number, name, table
        ));

        let transaction = |step: &'static str| {
            let name = name.clone();
            move |source: HalError| LoopmapError::TransactionFailure { name, step, source }
        };

        self.hal
            .dm_create(&name, std::slice::from_ref(&table))
            .map_err(transaction("create"))?;
        log::debug!("{} created (suspended)", name);

        let guard = MappingGuard::new(self.hal, name.as_str());
        self.hal.dm_resume(&name).map_err(transaction("resume"))?;
        guard.release();
        log::debug!("{} resumed (active)", name);

        let readiness = match self.hal.dm_wait_ready(&name, self.config.ready_timeout_ms()) {
            Ok(()) => Readiness::Ready,
            Err(err) => {
                self.config
                    .warn(format!("{} did not report ready: {}", name, err));
                Readiness::Unconfirmed
            }
        };

        let node = self.materialize(&name);
        if let NodeState::Materialized { dev, ref link, .. } = node {
            self.config
                .status(format!("{} ready as {} ({})", name, link.display(), dev));
        }

        Ok(MappingOutcome {
            name,
            partition,
            table,
            readiness,
            node,
        })
    }

    fn skipped(&self, reason: String) -> NodeState {
        self.config.warn(reason.clone());
        NodeState::Skipped { reason }
    }

    /// Replace `dm-<minor>` and the named symlink for device `name`.
    fn materialize(&self, name: &str) -> NodeState {
        let paths = &self.config.paths;
        let dev = match self.hal.dm_device_number(name) {
            Ok(Some(dev)) => dev,
            Ok(None) => return self.skipped(format!("{} has no device number", name)),
            Err(err) => {
                return self.skipped(format!("could not query {}: {}", name, err));
            }
        };

        let node = paths.dm_node(dev.minor);
        if let Err(err) = remove_if_exists(&node) {
            return self.skipped(format!("could not remove stale {}: {}", node.display(), err));
        }
        if let Err(err) = self.hal.make_block_node(&node, dev) {
            return self.skipped(format!("could not create {}: {}", node.display(), err));
        }
        log::debug!("created block node {} ({})", node.display(), dev);

        let link = paths.mapper_link(name);
        let target = self.link_target(&node);
        let linked = fs::create_dir_all(&paths.mapper_dir)
            .and_then(|()| remove_if_exists(&link))
            .and_then(|_| std::os::unix::fs::symlink(&target, &link));
        if let Err(err) = linked {
            return self.skipped(format!(
                "could not link {} -> {}: {}",
                link.display(),
                target.display(),
                err
            ));
        }
        log::debug!("linked {} -> {}", link.display(), target.display());

        NodeState::Materialized { dev, node, link }
    }

    /// Names of every mapping that looks like it belongs to loop `number`.
    ///
    /// Listing failures on either side are reported through `fail` and the
    /// other side is still consulted.
    fn candidates(&self, number: u32, fail: &mut impl FnMut(LoopmapError)) -> Vec<String> {
        let mapper_dir = &self.config.paths.mapper_dir;
        let mut names = Vec::new();

        match fs::read_dir(mapper_dir) {
            Ok(entries) => {
                for entry in entries {
                    match entry {
                        Ok(entry) => {
                            let name = entry.file_name().to_string_lossy().to_string();
                            if is_mapping_of(&name, number) {
                                names.push(name);
                            }
                        }
                        Err(e) => {
                            fail(LoopmapError::io(mapper_dir, e));
                            break;
                        }
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!("{} does not exist", mapper_dir.display());
            }
            Err(e) => fail(LoopmapError::io(mapper_dir, e)),
        }

        match self.hal.dm_list() {
            Ok(listed) => {
                for name in listed {
                    if is_mapping_of(&name, number) && !names.contains(&name) {
                        names.push(name);
                    }
                }
            }
            Err(err) => self
                .config
                .warn(format!("could not list device-mapper devices: {}", err)),
        }

        names.sort_by_key(|n| partition_suffix(n));
        names
    }

    /// The numbered node behind mapping `name`: from its symlink if it has one,
    /// otherwise from the kernel's device number.
    fn resolve_node(&self, name: &str, link: &Path) -> Option<PathBuf> {
        if let Ok(target) = fs::read_link(link) {
            let resolved = match link.parent() {
                Some(parent) if target.is_relative() => parent.join(&target),
                _ => target,
            };
            let is_dm_node = resolved
                .file_name()
                .map(|f| f.to_string_lossy().starts_with("dm-"))
                .unwrap_or(false);
            if is_dm_node {
                return Some(resolved);
            }
        }

        match self.hal.dm_device_number(name) {
            Ok(Some(dev)) => Some(self.config.paths.dm_node(dev.minor)),
            Ok(None) => None,
            Err(err) => {
                log::debug!("no device number for {}: {}", name, err);
                None
            }
        }
    }

    /// Remove every mapping for `loop_device`: symlink, numbered node, then the
    /// device-mapper device.
    ///
    /// Things that are already gone count as removed. Other failures are logged
    /// and processing carries on; if any occurred the last one is returned in
    /// [`LoopmapError::PartialFailure`]. Returns how many names were processed.
    pub fn cleanup_mappings(&self, loop_device: &Path) -> Result<usize> {
        let number = loop_number_of(loop_device)?;

        let mut failures = 0usize;
        let mut last = None;
        let mut fail = |err: LoopmapError| {
            self.config.warn(err.to_string());
            failures += 1;
            last = Some(err);
        };

        let names = self.candidates(number, &mut fail);
        if names.is_empty() {
            self.config.status(format!(
                "no mappings to clean up for {}",
                loop_device.display()
            ));
        }

        for name in &names {
            let link = self.config.paths.mapper_link(name);
            let node = self.resolve_node(name, &link);

            if let Err(e) = remove_if_exists(&link) {
                fail(LoopmapError::io(&link, e));
            }
            if let Some(node) = node {
                match remove_if_exists(&node) {
                    Ok(true) => log::debug!("removed {}", node.display()),
                    Ok(false) => {}
                    Err(e) => fail(LoopmapError::io(&node, e)),
                }
            }
            match self.hal.dm_remove(name) {
                Ok(()) => self.config.status(format!("removed mapping {}", name)),
                Err(err) if err.is_absent() => {
                    log::debug!("{} was already gone from device-mapper", name)
                }
                Err(source @ HalError::ControlUnavailable { .. }) => {
                    fail(LoopmapError::ResourceUnavailable {
                        resource: self.config.paths.dm_control.clone(),
                        source,
                    })
                }
                Err(source) => fail(LoopmapError::TransactionFailure {
                    name: name.clone(),
                    step: "remove",
                    source,
                }),
            }
        }

        match last {
            Some(last) => Err(LoopmapError::PartialFailure {
                device: loop_device.to_path_buf(),
                failures,
                last: Box::new(last),
            }),
            None => Ok(names.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loopmap_hal::{FakeHal, FakeOp, HalPaths, LinuxHal};
    use loopmap_testing::{three_partition_disk, GptImage, MIB};

    struct Lab {
        dir: tempfile::TempDir,
        config: Config,
        hal: FakeHal,
        loop_device: PathBuf,
    }

    impl Lab {
        /// Stand the fixture in for `/dev/loop0` so parsing reads it directly.
        fn new(gpt: &GptImage) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let paths = HalPaths::rooted_at(dir.path());
            fs::create_dir_all(&paths.mapper_dir).unwrap();
            let loop_device = paths.loop_device(0);
            gpt.write_file(&loop_device).unwrap();
            let config = Config {
                paths: paths.clone(),
                ..Config::default()
            };
            Self {
                dir,
                config,
                hal: FakeHal::with_paths(paths),
                loop_device,
            }
        }

        fn mapper(&self) -> Mapper<'_, FakeHal> {
            Mapper::new(&self.hal, &self.config)
        }
    }

    #[test]
    fn names_follow_loop_and_partition() {
        assert_eq!(mapping_name(7, 2), "loop7p2");
        assert!(is_mapping_of("loop7p2", 7));
        assert!(is_mapping_of("loop7p12", 7));
        assert!(!is_mapping_of("loop77p2", 7));
        assert!(!is_mapping_of("loop7p", 7));
        assert!(!is_mapping_of("loop7p2-crypt", 7));
        assert!(!is_mapping_of("control", 7));
    }

    #[test]
    fn non_loop_devices_are_rejected() {
        let err = loop_number_of(Path::new("/dev/sda")).unwrap_err();
        assert!(matches!(err, LoopmapError::ValidationFailed(_)));
        assert_eq!(loop_number_of(Path::new("/dev/loop12")).unwrap(), 12);
    }

    #[test]
    fn creates_one_mapping_per_partition() {
        let lab = Lab::new(&three_partition_disk());
        let outcomes = lab.mapper().create_mappings(&lab.loop_device).unwrap();

        let names: Vec<&str> = outcomes.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["loop0p1", "loop0p2", "loop0p3"]);
        assert!(outcomes.iter().all(|o| o.readiness == Readiness::Ready));

        let first = &outcomes[0];
        assert_eq!(first.table.offset, 2048);
        assert_eq!(first.table.length, 97_953);
        assert_eq!(first.table.device, lab.loop_device);
        assert_eq!(lab.hal.dm_table("loop0p2").unwrap()[0].offset, 100_001);
        assert!(lab.hal.dm_is_active("loop0p3"));

        let link = first.link().unwrap();
        assert_eq!(fs::read_link(link).unwrap(), PathBuf::from("../dm-0"));
        assert!(lab.config.paths.dm_node(0).exists());
        assert!(link.exists());
    }

    #[test]
    fn create_then_resume_in_order() {
        let lab = Lab::new(&GptImage::new(MIB).partition(34, 100, "a"));
        lab.mapper().create_mappings(&lab.loop_device).unwrap();

        let ops: Vec<FakeOp> = lab
            .hal
            .operations()
            .into_iter()
            .filter(|op| !matches!(op, FakeOp::DmWaitReady { .. }))
            .collect();
        assert!(matches!(ops[0], FakeOp::DmCreate { ref name, .. } if name == "loop0p1"));
        assert!(matches!(ops[1], FakeOp::DmResume { ref name } if name == "loop0p1"));
        assert!(matches!(ops[2], FakeOp::MakeBlockNode { .. }));
    }

    #[test]
    fn empty_table_maps_nothing() {
        let lab = Lab::new(&GptImage::new(MIB));
        assert!(lab
            .mapper()
            .create_mappings(&lab.loop_device)
            .unwrap()
            .is_empty());
        assert_eq!(lab.hal.operation_count(), 0);
    }

    #[test]
    fn transaction_failure_keeps_earlier_mappings() {
        let lab = Lab::new(&three_partition_disk());
        // a stale device with the second name makes its create fail
        lab.hal.dm_create("loop0p2", &[]).unwrap();

        let err = lab.mapper().create_mappings(&lab.loop_device).unwrap_err();

        assert!(matches!(
            err,
            LoopmapError::TransactionFailure { ref name, step: "create", .. } if name == "loop0p2"
        ));
        assert!(lab.hal.dm_is_active("loop0p1"));
        assert!(lab.hal.dm_table("loop0p3").is_none());
    }

    #[test]
    fn failed_resume_removes_suspended_device() {
        let lab = Lab::new(&three_partition_disk());
        lab.hal.fail_next("DM_DEV_SUSPEND", 1);

        let err = lab.mapper().create_mappings(&lab.loop_device).unwrap_err();

        assert!(matches!(
            err,
            LoopmapError::TransactionFailure { step: "resume", .. }
        ));
        assert!(lab.hal.dm_devices().is_empty());
    }

    #[test]
    fn soft_failures_are_recorded() {
        let lab = Lab::new(&GptImage::new(MIB).partition(34, 100, "a").partition(101, 200, "b"));
        lab.hal.fail_next("DM_WAIT_READY", 1);
        lab.hal.hide_device_number("loop0p2");

        let outcomes = lab.mapper().create_mappings(&lab.loop_device).unwrap();

        assert_eq!(outcomes[0].readiness, Readiness::Unconfirmed);
        assert!(matches!(outcomes[0].node, NodeState::Materialized { .. }));
        assert_eq!(outcomes[1].readiness, Readiness::Ready);
        assert!(matches!(outcomes[1].node, NodeState::Skipped { .. }));
        assert!(outcomes[1].link().is_none());
    }

    #[test]
    fn failed_mknod_skips_node() {
        let lab = Lab::new(&GptImage::new(MIB).partition(34, 100, "a"));
        lab.hal.fail_next("mknod", 1);

        let outcomes = lab.mapper().create_mappings(&lab.loop_device).unwrap();

        assert!(matches!(outcomes[0].node, NodeState::Skipped { .. }));
        assert!(lab.hal.dm_is_active("loop0p1"));
    }

    #[test]
    fn mapper_dir_outside_dev_gets_absolute_links() {
        let mut lab = Lab::new(&GptImage::new(MIB).partition(34, 100, "a"));
        lab.config.paths.mapper_dir = lab.dir.path().join("links");

        let outcomes = lab.mapper().create_mappings(&lab.loop_device).unwrap();

        let link = outcomes[0].link().unwrap();
        assert_eq!(fs::read_link(link).unwrap(), lab.config.paths.dm_node(0));
    }

    #[test]
    fn cleanup_removes_everything() {
        let lab = Lab::new(&three_partition_disk());
        let outcomes = lab.mapper().create_mappings(&lab.loop_device).unwrap();

        assert_eq!(lab.mapper().cleanup_mappings(&lab.loop_device).unwrap(), 3);

        assert!(lab.hal.dm_devices().is_empty());
        for outcome in &outcomes {
            assert!(fs::symlink_metadata(outcome.link().unwrap()).is_err());
        }
        for minor in 0..3 {
            assert!(!lab.config.paths.dm_node(minor).exists());
        }
        assert_eq!(lab.mapper().cleanup_mappings(&lab.loop_device).unwrap(), 0);
    }

    #[test]
    fn cleanup_finds_kernel_only_mappings() {
        let lab = Lab::new(&GptImage::new(MIB));
        lab.hal.dm_create("loop0p4", &[]).unwrap();
        lab.hal.dm_create("loop1p1", &[]).unwrap();
        fs::write(lab.config.paths.dm_node(0), b"").unwrap();

        assert_eq!(lab.mapper().cleanup_mappings(&lab.loop_device).unwrap(), 1);

        assert_eq!(lab.hal.dm_devices(), vec!["loop1p1".to_string()]);
        assert!(!lab.config.paths.dm_node(0).exists());
    }

    #[test]
    fn cleanup_of_unmapped_device_is_ok() {
        let lab = Lab::new(&GptImage::new(MIB));
        fs::remove_dir(&lab.config.paths.mapper_dir).unwrap();

        let n = lab
            .mapper()
            .cleanup_mappings(Path::new("/dev/loop9999"))
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn cleanup_continues_past_failures() {
        let lab = Lab::new(&three_partition_disk());
        lab.mapper().create_mappings(&lab.loop_device).unwrap();
        lab.hal.fail_next("DM_DEV_REMOVE", 1);

        let err = lab.mapper().cleanup_mappings(&lab.loop_device).unwrap_err();

        match err {
            LoopmapError::PartialFailure { failures, last, .. } => {
                assert_eq!(failures, 1);
                assert!(matches!(
                    *last,
                    LoopmapError::TransactionFailure { step: "remove", .. }
                ));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(lab.hal.dm_devices(), vec!["loop0p1".to_string()]);

        assert_eq!(lab.mapper().cleanup_mappings(&lab.loop_device).unwrap(), 1);
        assert!(lab.hal.dm_devices().is_empty());
    }

    #[test]
    fn cleanup_without_dm_control_is_not_success() {
        let lab = Lab::new(&GptImage::new(MIB));
        let paths = &lab.config.paths;
        fs::write(paths.dm_node(0), b"").unwrap();
        std::os::unix::fs::symlink("../dm-0", paths.mapper_link("loop0p1")).unwrap();
        let hal = LinuxHal::with_paths(paths.clone());

        let err = Mapper::new(&hal, &lab.config)
            .cleanup_mappings(&lab.loop_device)
            .unwrap_err();

        match err {
            LoopmapError::PartialFailure { failures, last, .. } => {
                assert_eq!(failures, 1);
                assert!(matches!(
                    *last,
                    LoopmapError::ResourceUnavailable { ref resource, .. } if *resource == paths.dm_control
                ));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(fs::symlink_metadata(paths.mapper_link("loop0p1")).is_err());
    }

    #[test]
    fn unreadable_mapper_dir_still_cleans_kernel_mappings() {
        let lab = Lab::new(&GptImage::new(MIB));
        let mapper_dir = &lab.config.paths.mapper_dir;
        fs::remove_dir(mapper_dir).unwrap();
        fs::write(mapper_dir, b"not a directory").unwrap();
        lab.hal.dm_create("loop0p1", &[]).unwrap();

        let err = lab.mapper().cleanup_mappings(&lab.loop_device).unwrap_err();

        match err {
            LoopmapError::PartialFailure { failures, last, .. } => {
                // the listing, then the link path beneath the non-directory
                assert_eq!(failures, 2);
                assert!(matches!(*last, LoopmapError::Io { ref path, .. } if path.starts_with(mapper_dir)));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(lab.hal.dm_devices().is_empty());
    }
}
