//! Link-access policy: property assembly and external-link resolution.
//!
//! Run with: `cargo test`

use std::path::Path;

use tempfile::TempDir;

use chunklink::error::ChunkError;
use chunklink::link_access::{LinkAccess, LinkAccessFields, Locking};
use chunklink::storage::access::{AccessFlags, AccessMode, FileAccess, FileLocking};
use chunklink::storage::container::Container;
use chunklink::storage::layout::DatasetSpec;

fn tmp_dir() -> TempDir {
    tempfile::tempdir().expect("create tempdir")
}

fn unlocked() -> FileAccess {
    let mut access = FileAccess::new();
    access.set_file_locking(false, false);
    access
}

/// Write a closed container at `path` holding dataset `data` with one chunk.
fn write_target(path: &Path) {
    let container = Container::create(path, FileAccess::new()).expect("create target");
    let ds = container
        .create_dataset("data", DatasetSpec::new(&[8], &[4], 1))
        .expect("dataset");
    ds.write_raw_chunk(&[0], b"abcd", 0).expect("write");
    container.close().expect("close target");
}

/// Write a closed container at `path` with a single external link.
fn write_link(path: &Path, name: &str, target_file: &str, target_path: &str) {
    let container = Container::create(path, FileAccess::new()).expect("create source");
    container
        .create_external_link(name, target_file, target_path)
        .expect("link");
    container.close().expect("close source");
}

fn open_ro(path: &Path) -> Container {
    Container::open(path, AccessFlags::RDONLY, FileAccess::new()).expect("open")
}

#[test]
fn test_unset_policy_resolves_to_none() {
    let dir = tmp_dir();
    let container = Container::create(&dir.path().join("a.ckl"), FileAccess::new()).expect("create");

    assert!(LinkAccess::new().resolve(&container).expect("resolve").is_none());

    let singles = [
        LinkAccess::new().with_locking(Locking::Disabled),
        LinkAccess::new().with_mode(AccessMode::ReadOnly),
        LinkAccess::new().with_swmr_mode(false),
        LinkAccess::new().with_prefix("/tmp"),
        LinkAccess::new().with_nlinks(3),
    ];
    for policy in singles {
        assert!(!policy.is_no_policy());
        assert!(policy.resolve(&container).expect("resolve").is_some(), "{policy:?}");
    }
}

#[test]
fn test_locking_tri_state() {
    let dir = tmp_dir();
    let container = Container::create(&dir.path().join("a.ckl"), unlocked()).expect("create");

    let cases = [
        (Locking::Disabled, FileLocking { use_file_locking: false, ignore_when_disabled: false }),
        (Locking::Required, FileLocking { use_file_locking: true, ignore_when_disabled: false }),
        (Locking::BestEffort, FileLocking { use_file_locking: true, ignore_when_disabled: true }),
    ];
    for (locking, expected) in cases {
        let props = LinkAccess::new()
            .with_locking(locking)
            .resolve(&container)
            .expect("resolve")
            .expect("props");
        assert_eq!(props.elink_fapl().expect("fapl").file_locking(), expected);
        assert!(props.elink_acc_flags().is_none());
    }

    // The referencing container's own configuration is copied, not modified.
    assert_eq!(container.access_config(), unlocked());
}

#[test]
fn test_mode_and_swmr_flags() {
    let dir = tmp_dir();
    let container = Container::create(&dir.path().join("a.ckl"), FileAccess::new()).expect("create");

    let flags = |policy: LinkAccess| {
        policy
            .resolve(&container)
            .expect("resolve")
            .expect("props")
            .elink_acc_flags()
            .expect("flags")
    };

    assert_eq!(
        flags(LinkAccess::new().with_mode(AccessMode::ReadOnly).with_swmr_mode(true)),
        AccessFlags::RDONLY | AccessFlags::SWMR_READ
    );
    assert_eq!(
        flags(LinkAccess::new().with_mode(AccessMode::ReadWrite).with_swmr_mode(true)),
        AccessFlags::RDWR | AccessFlags::SWMR_WRITE
    );
    assert_eq!(flags(LinkAccess::new().with_mode(AccessMode::ReadOnly)), AccessFlags::RDONLY);
    // Mode inherited from the read-write referencing container.
    assert_eq!(
        flags(LinkAccess::new().with_swmr_mode(true)),
        AccessFlags::RDWR | AccessFlags::SWMR_WRITE
    );
}

#[test]
fn test_swmr_inherited_from_referencing_container() {
    let dir = tmp_dir();
    let path = dir.path().join("a.ckl");
    Container::create(&path, FileAccess::new())
        .expect("create")
        .close()
        .expect("close");

    let reader = Container::open(&path, AccessFlags::RDONLY | AccessFlags::SWMR_READ, FileAccess::new())
        .expect("open swmr reader");
    assert!(reader.swmr_mode());

    let props = LinkAccess::new()
        .with_mode(AccessMode::ReadOnly)
        .resolve(&reader)
        .expect("resolve")
        .expect("props");
    assert_eq!(props.elink_acc_flags(), Some(AccessFlags::RDONLY | AccessFlags::SWMR_READ));
}

#[test]
fn test_prefix_and_nlinks_attached_verbatim() {
    let dir = tmp_dir();
    let container = Container::create(&dir.path().join("a.ckl"), FileAccess::new()).expect("create");

    let props = LinkAccess::new()
        .update(LinkAccessFields {
            prefix: Some("relative/dir".into()),
            nlinks: Some(7),
            ..Default::default()
        })
        .resolve(&container)
        .expect("resolve")
        .expect("props");
    assert_eq!(props.elink_prefix(), Some("relative/dir"));
    assert_eq!(props.nlinks(), Some(7));
    assert!(props.elink_fapl().is_none());
    assert!(props.elink_acc_flags().is_none());

    assert!(matches!(
        LinkAccess::new().with_nlinks(0).resolve(&container),
        Err(ChunkError::Config(_))
    ));
}

#[test]
fn test_open_external_inherits_mode() {
    let dir = tmp_dir();
    write_target(&dir.path().join("b.ckl"));
    write_link(&dir.path().join("a.ckl"), "ext", "b.ckl", "data");

    let source = open_ro(&dir.path().join("a.ckl"));
    let ds = LinkAccess::new().open_external(&source, "ext").expect("follow");
    assert_eq!(ds.name(), "data");
    assert_eq!(ds.container().mode(), AccessMode::ReadOnly);
    assert_eq!(ds.read_raw_chunk(&[0]).expect("read"), (0, b"abcd".to_vec()));
    assert!(matches!(
        ds.write_raw_chunk(&[4], b"efgh", 0),
        Err(ChunkError::ReadOnly { .. })
    ));
}

#[test]
fn test_open_external_with_explicit_write_mode() {
    let dir = tmp_dir();
    write_target(&dir.path().join("b.ckl"));
    write_link(&dir.path().join("a.ckl"), "ext", "b.ckl", "data");

    let source = open_ro(&dir.path().join("a.ckl"));
    let ds = LinkAccess::new()
        .with_mode(AccessMode::ReadWrite)
        .open_external(&source, "ext")
        .expect("follow");
    ds.write_raw_chunk(&[4], b"efgh", 0).expect("write through link");
    assert_eq!(ds.num_chunks(), 2);
}

#[test]
fn test_prefix_rewrites_relative_target() {
    let dir = tmp_dir();
    let archive = dir.path().join("archive");
    std::fs::create_dir(&archive).expect("mkdir");
    write_target(&archive.join("b.ckl"));
    write_link(&dir.path().join("a.ckl"), "ext", "b.ckl", "data");

    let source = open_ro(&dir.path().join("a.ckl"));
    assert!(matches!(
        LinkAccess::new().open_external(&source, "ext"),
        Err(ChunkError::Storage(_))
    ));

    let prefix = archive.to_str().expect("utf-8 path");
    let ds = LinkAccess::new()
        .with_prefix(prefix)
        .open_external(&source, "ext")
        .expect("follow with prefix");
    assert_eq!(ds.read_raw_chunk(&[0]).expect("read").1, b"abcd".to_vec());

    let ds = LinkAccess::new()
        .with_prefix("${ORIGIN}/archive")
        .open_external(&source, "ext")
        .expect("follow with origin prefix");
    assert_eq!(ds.num_chunks(), 1);
}

#[test]
fn test_link_cycle_exceeds_nlinks() {
    let dir = tmp_dir();
    write_link(&dir.path().join("a.ckl"), "loop", "b.ckl", "loop");
    write_link(&dir.path().join("b.ckl"), "loop", "a.ckl", "loop");

    let source = open_ro(&dir.path().join("a.ckl"));
    match LinkAccess::new().with_nlinks(3).open_external(&source, "loop") {
        Err(ChunkError::LinkDepthExceeded { link, limit }) => {
            assert_eq!(link, "loop");
            assert_eq!(limit, 3);
        }
        Err(other) => panic!("expected LinkDepthExceeded, got {other:?}"),
        Ok(_) => panic!("a link cycle must not resolve"),
    }

    // The engine default also stops the cycle.
    assert!(matches!(
        source.open_external("loop", None),
        Err(ChunkError::LinkDepthExceeded { limit: 16, .. })
    ));
}

#[test]
fn test_link_cycle_from_writable_container() {
    let dir = tmp_dir();
    write_link(&dir.path().join("a.ckl"), "loop", "b.ckl", "loop");
    write_link(&dir.path().join("b.ckl"), "loop", "a.ckl", "loop");

    // The exclusive lock held on a.ckl must not stop the hop count.
    let source = Container::open(&dir.path().join("a.ckl"), AccessFlags::RDWR, FileAccess::new())
        .expect("open rw");
    assert!(matches!(
        LinkAccess::new().with_nlinks(3).open_external(&source, "loop"),
        Err(ChunkError::LinkDepthExceeded { limit: 3, .. })
    ));
    assert!(matches!(
        source.open_external("loop", None),
        Err(ChunkError::LinkDepthExceeded { limit: 16, .. })
    ));
}

#[test]
fn test_link_into_same_writable_container() {
    let dir = tmp_dir();
    let path = dir.path().join("a.ckl");
    let container = Container::create(&path, FileAccess::new()).expect("create");
    container
        .create_dataset("data", DatasetSpec::new(&[8], &[4], 1))
        .expect("dataset");
    container
        .create_external_link("self", "./a.ckl", "data")
        .expect("link");

    let ds = LinkAccess::new().open_external(&container, "self").expect("follow");
    ds.write_raw_chunk(&[4], b"efgh", 0).expect("write through link");
    assert_eq!(container.dataset("data").expect("dataset").num_chunks(), 1);
}

#[test]
fn test_chained_links_within_limit() {
    let dir = tmp_dir();
    write_target(&dir.path().join("c.ckl"));
    write_link(&dir.path().join("b.ckl"), "hop", "c.ckl", "data");
    write_link(&dir.path().join("a.ckl"), "start", "b.ckl", "hop");

    let source = open_ro(&dir.path().join("a.ckl"));
    let ds = LinkAccess::new()
        .with_nlinks(2)
        .open_external(&source, "start")
        .expect("two hops");
    assert_eq!(ds.container().path(), dir.path().join("c.ckl"));

    assert!(matches!(
        LinkAccess::new().with_nlinks(1).open_external(&source, "start"),
        Err(ChunkError::LinkDepthExceeded { limit: 1, .. })
    ));
}

#[test]
fn test_locking_policy_against_held_lock() {
    let dir = tmp_dir();
    let target = dir.path().join("b.ckl");
    write_target(&target);
    write_link(&dir.path().join("a.ckl"), "ext", "b.ckl", "data");

    // Another writer holds an exclusive lock on the target.
    let holder = Container::open(&target, AccessFlags::RDWR, FileAccess::new()).expect("hold lock");

    let source = open_ro(&dir.path().join("a.ckl"));
    assert!(matches!(
        LinkAccess::new().with_locking(Locking::Required).open_external(&source, "ext"),
        Err(ChunkError::LockFailed { .. })
    ));

    let ds = LinkAccess::new()
        .with_locking(Locking::BestEffort)
        .open_external(&source, "ext")
        .expect("best-effort tolerates the held lock");
    assert_eq!(ds.num_chunks(), 1);

    let ds = LinkAccess::new()
        .with_locking(Locking::Disabled)
        .open_external(&source, "ext")
        .expect("no lock requested");
    assert_eq!(ds.num_chunks(), 1);

    holder.close().expect("release");
    LinkAccess::new()
        .with_locking(Locking::Required)
        .open_external(&source, "ext")
        .expect("lock free again");
}

#[test]
fn test_missing_link_is_reported() {
    let dir = tmp_dir();
    write_link(&dir.path().join("a.ckl"), "ext", "b.ckl", "data");
    let source = open_ro(&dir.path().join("a.ckl"));
    assert!(matches!(
        source.open_external("nope", None),
        Err(ChunkError::LinkNotFound { name }) if name == "nope"
    ));
}
