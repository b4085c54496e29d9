use loopmap_core::{Config, Event, LoopmapError, Loopmap, NodeState, Readiness};
use loopmap_hal::{FakeHal, FakeOp, HalPaths};
use loopmap_testing::{
    single_partition_disk, three_partition_disk, write_blank, write_noise, ImageLab, MIB,
};
use std::fs;
use std::sync::mpsc::sync_channel;

fn lab_loopmap(lab: &ImageLab) -> Loopmap<FakeHal> {
    loopmap_core::logging::init();
    let paths = HalPaths::rooted_at(lab.root());
    fs::create_dir_all(&paths.mapper_dir).expect("create mapper dir");
    let config = Config {
        paths: paths.clone(),
        ..Config::default()
    };
    Loopmap::with_hal(FakeHal::with_paths(paths), config)
}

#[test]
fn single_partition_round_trip() {
    let lab = ImageLab::with_gpt("disk.img", &single_partition_disk()).expect("fixture");
    let lm = lab_loopmap(&lab);

    let dev = lm.attach(lab.image(), true).expect("attach");
    let parts = lm.parse_partition_table(&dev.path).expect("parse");
    assert_eq!(parts.len(), 1);
    assert_eq!(parts[0].first_lba, 2048);
    assert_eq!(parts[0].last_lba, 100_000);
    assert_eq!(parts[0].sector_count, 97_953);

    let mappings = lm.create_mappings(&dev.path).expect("create mappings");
    assert_eq!(mappings.len(), 1);
    assert_eq!(mappings[0].name, format!("loop{}p1", dev.number));
    assert_eq!(mappings[0].readiness, Readiness::Ready);
    let link = mappings[0].link().expect("symlink").to_path_buf();
    assert!(link.exists());

    assert_eq!(lm.cleanup_mappings(&dev.path).expect("cleanup"), 1);
    assert!(fs::symlink_metadata(&link).is_err());
    lm.detach(&dev).expect("detach");

    assert!(lm.hal().dm_devices().is_empty());
    assert!(lm.find_attached(lab.image()).expect("scan").is_none());
}

#[test]
fn three_partitions_get_distinct_mappings() {
    let lab = ImageLab::with_gpt("three.img", &three_partition_disk()).expect("fixture");
    let lm = lab_loopmap(&lab);
    let dev = lm.attach(lab.image(), true).expect("attach");

    let mappings = lm.create_mappings(&dev.path).expect("create mappings");

    let numbers: Vec<u32> = mappings.iter().map(|m| m.partition.number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    let mut nodes: Vec<_> = mappings
        .iter()
        .map(|m| match &m.node {
            NodeState::Materialized { node, .. } => node.clone(),
            NodeState::Skipped { reason } => panic!("{} skipped: {}", m.name, reason),
        })
        .collect();
    nodes.dedup();
    assert_eq!(nodes.len(), 3);

    lm.cleanup_mappings(&dev.path).expect("cleanup");
    lm.detach(&dev).expect("detach");
}

#[test]
fn read_only_attach_still_parses() {
    let lab = ImageLab::with_gpt("ro.img", &single_partition_disk()).expect("fixture");
    let lm = lab_loopmap(&lab);

    let dev = lm.attach(lab.image(), false).expect("attach read-only");
    assert!(!dev.read_write);
    assert!(lm.hal().has_operation(|op| matches!(
        op,
        FakeOp::LoopBind { read_write: false, .. }
    )));
    assert_eq!(lm.parse_partition_table(&dev.path).expect("parse").len(), 1);
    lm.detach(&dev).expect("detach");
}

#[test]
fn blank_and_random_images_have_no_table() {
    let lab = ImageLab::new("blank.img").expect("lab");
    write_blank(lab.image(), 10 * MIB).expect("blank image");
    let lm = lab_loopmap(&lab);
    let dev = lm.attach(lab.image(), true).expect("attach");

    let err = lm.parse_partition_table(&dev.path).unwrap_err();
    assert!(matches!(err, LoopmapError::InvalidTableKind { .. }));
    let err = lm.create_mappings(&dev.path).unwrap_err();
    assert!(matches!(err, LoopmapError::InvalidTableKind { .. }));
    assert!(lm.hal().dm_devices().is_empty());
    lm.detach(&dev).expect("detach");

    write_noise(lab.image(), MIB, 0x5eed).expect("noise image");
    let dev = lm.attach(lab.image(), true).expect("attach");
    let err = lm.parse_partition_table(&dev.path).unwrap_err();
    assert!(matches!(
        err,
        LoopmapError::InvalidTableKind { .. } | LoopmapError::TruncatedInput { .. }
    ));
    lm.detach(&dev).expect("detach");
}

#[test]
fn double_cleanup_and_double_detach() {
    let lab = ImageLab::with_gpt("disk.img", &single_partition_disk()).expect("fixture");
    let lm = lab_loopmap(&lab);
    let dev = lm.attach(lab.image(), true).expect("attach");
    lm.create_mappings(&dev.path).expect("create mappings");

    assert_eq!(lm.cleanup_mappings(&dev.path).expect("first cleanup"), 1);
    assert_eq!(lm.cleanup_mappings(&dev.path).expect("second cleanup"), 0);

    lm.detach(&dev).expect("first detach");
    assert!(lm.detach(&dev).is_err());
}

#[test]
fn mappings_survive_detach() {
    let lab = ImageLab::with_gpt("disk.img", &single_partition_disk()).expect("fixture");
    let lm = lab_loopmap(&lab);
    let dev = lm.attach(lab.image(), true).expect("attach");
    lm.create_mappings(&dev.path).expect("create mappings");

    lm.detach(&dev).expect("detach");
    assert_eq!(lm.hal().dm_devices().len(), 1);

    assert_eq!(lm.cleanup_mappings(&dev.path).expect("cleanup"), 1);
    assert!(lm.hal().dm_devices().is_empty());
}

#[test]
fn cleanup_of_never_mapped_device() {
    let lab = ImageLab::new("unused.img").expect("lab");
    let lm = lab_loopmap(&lab);
    assert_eq!(
        lm.cleanup_mappings(std::path::Path::new("/dev/loop9999"))
            .expect("cleanup"),
        0
    );
}

#[test]
fn events_follow_the_lifecycle() {
    let lab = ImageLab::with_gpt("disk.img", &single_partition_disk()).expect("fixture");
    let (tx, rx) = sync_channel(64);
    let paths = HalPaths::rooted_at(lab.root());
    fs::create_dir_all(&paths.mapper_dir).expect("create mapper dir");
    let config = Config {
        paths: paths.clone(),
        ..Config::default()
    }
    .with_events(tx);
    let lm = Loopmap::with_hal(FakeHal::with_paths(paths), config);

    let dev = lm.attach(lab.image(), true).expect("attach");
    lm.create_mappings(&dev.path).expect("create mappings");

    let events: Vec<Event> = rx.try_iter().collect();
    assert!(matches!(events.first(), Some(Event::Status(msg)) if msg.starts_with("attached")));
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::Status(msg) if msg.contains("loop0p1 ready"))));
    assert!(!events.iter().any(|e| matches!(e, Event::Warning(_))));
}
