// Behavioural properties of the exFAT engine, checked on freshly built images

use exfat_fs::exfat::directory_entries::{validate_entry_set, EntrySetBuilder};
use exfat_fs::exfat::structures::EXFAT_CLUSTER_END;
use exfat_fs::exfat::upcase::UpcaseTable;
use exfat_fs::test_helpers::{read_fat_entry, ImageBuilder};
use exfat_fs::{ExFat, ExFatError, MountOptions};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const CLUSTER: u64 = 4096;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn entry_set_checksum_survives_decoding() {
    init();
    let upcase = UpcaseTable::generate();
    let mut rng = StdRng::seed_from_u64(0x5eed);

    for _ in 0..64 {
        let length = rng.gen_range(1..=255);
        let name: Vec<u16> = (0..length).map(|_| rng.gen_range(0x20..0xd7ff)).collect();
        let set = EntrySetBuilder::new_file(&name)
            .size(rng.gen_range(1..1 << 40))
            .start_cluster(rng.gen_range(2..0xFFFF_FFF6))
            .contiguous(rng.gen())
            .time(rng.gen_range(315_532_800..4_000_000_000))
            .build(&upcase);

        let decoded = validate_entry_set(&set.records()).unwrap();
        assert_eq!(decoded.checksum(), set.checksum());
        assert_eq!(decoded.name(), name);
    }
}

#[test]
fn truncate_to_same_size_is_a_no_op() {
    init();
    let image = ImageBuilder::new().build();
    let fs = image.mount();
    fs.mknod("/file").unwrap();
    let node = fs.lookup("/file").unwrap();

    fs.truncate(&node, 3 * CLUSTER - 7).unwrap();
    let free = fs.count_free_clusters();
    let start = node.start_cluster();
    let mtime = node.mtime();

    fs.utimes(&node, mtime, 0).unwrap();
    fs.truncate(&node, 3 * CLUSTER - 7).unwrap();
    assert_eq!(fs.count_free_clusters(), free);
    assert_eq!(node.start_cluster(), start);
    // An early return leaves mtime alone.
    assert_eq!(node.mtime(), 0);
}

#[test]
fn grow_then_shrink_returns_every_cluster() {
    init();
    let image = ImageBuilder::new().build();
    let fs = image.mount();
    fs.mknod("/file").unwrap();
    let node = fs.lookup("/file").unwrap();
    let free = fs.count_free_clusters();

    for clusters in [1, 7, 64] {
        fs.truncate(&node, clusters * CLUSTER).unwrap();
        assert_eq!(fs.count_free_clusters() as u64, free as u64 - clusters);
        fs.truncate(&node, 0).unwrap();
        assert_eq!(fs.count_free_clusters(), free);
    }
}

#[test]
fn extending_exposes_zeros() {
    init();
    let image = ImageBuilder::new().build();
    let fs = image.mount();
    fs.mknod("/file").unwrap();
    let node = fs.lookup("/file").unwrap();

    // Leave garbage in the clusters the file will get back.
    fs.pwrite(&node, &[0xAA; 3 * CLUSTER as usize], 0).unwrap();
    fs.truncate(&node, 0).unwrap();
    fs.truncate(&node, 10000).unwrap();

    let mut buffer = vec![0xFFu8; 10000];
    assert_eq!(fs.pread(&node, &mut buffer, 0).unwrap(), 10000);
    assert!(buffer.iter().all(|&b| b == 0));
    assert_eq!(fs.stat(&node).blocks, 3 * CLUSTER / 512);
    assert!(node.is_contiguous());
}

#[test]
fn blocked_growth_drops_contiguity() {
    init();
    let image = ImageBuilder::new().build();
    let fs = image.mount();
    fs.mknod("/a").unwrap();
    fs.mknod("/b").unwrap();
    let a = fs.lookup("/a").unwrap();
    let b = fs.lookup("/b").unwrap();

    fs.truncate(&a, 2 * CLUSTER).unwrap();
    assert!(a.is_contiguous());
    let first = a.start_cluster();
    // Take the cluster right after `a`.
    fs.truncate(&b, CLUSTER).unwrap();
    assert_eq!(b.start_cluster(), first + 2);

    fs.truncate(&a, 3 * CLUSTER).unwrap();
    assert!(!a.is_contiguous());
    let third = read_fat_entry(&image, first + 1);
    assert_eq!(read_fat_entry(&image, first), first + 1);
    assert_ne!(third, first + 2);
    assert_eq!(read_fat_entry(&image, third), EXFAT_CLUSTER_END);

    // The chain is walked through the FAT from now on.
    let payload: Vec<u8> = (0..3 * CLUSTER).map(|i| (i / CLUSTER) as u8 + 1).collect();
    fs.pwrite(&a, &payload, 0).unwrap();
    let mut back = vec![0u8; payload.len()];
    fs.pread(&a, &mut back, 0).unwrap();
    assert_eq!(back, payload);
}

#[test]
fn two_fats_are_rejected() {
    init();
    let image = ImageBuilder::new().fat_count(2).build();
    let err = ExFat::mount(image.path(), MountOptions::default()).err().unwrap();
    assert!(matches!(err, ExFatError::InvalidVolume(_)));
    assert_eq!(err.errno(), -5); // EIO
    // Nothing was marked as mounted.
    assert!(!image.read_super_block().is_mounted());
}

#[test]
fn rename_replaces_target_in_place() {
    init();
    let image = ImageBuilder::new().build();
    let fs = image.mount();
    fs.mknod("/a").unwrap();
    fs.mknod("/b").unwrap();
    {
        let a = fs.lookup("/a").unwrap();
        fs.pwrite(&a, b"from a", 0).unwrap();
        let b = fs.lookup("/b").unwrap();
        fs.truncate(&b, 5 * CLUSTER).unwrap();
    }
    let b_offset = fs.lookup("/b").unwrap().entry_offset();
    let free = fs.count_free_clusters();

    fs.rename("/a", "/b").unwrap();
    assert_eq!(fs.count_free_clusters(), free + 5);
    assert!(matches!(fs.lookup("/a"), Err(ExFatError::NotFound)));
    let moved = fs.lookup("/b").unwrap();
    assert_eq!(moved.entry_offset(), b_offset);
    assert_eq!(moved.size(), 6);
    drop(moved);
    fs.unmount().unwrap();

    // The rewritten run must pass checksum verification.
    let fs = image.mount();
    let node = fs.lookup("/b").unwrap();
    let mut data = [0u8; 6];
    fs.pread(&node, &mut data, 0).unwrap();
    assert_eq!(&data, b"from a");
    assert_eq!(fs.error_count(), 0);
}

#[test]
fn deleting_trailing_entry_shrinks_directory() {
    init();
    let image = ImageBuilder::new().build();
    let fs = image.mount();
    fs.mkdir("/d").unwrap();
    // Three records per name: 43 names need a second cluster.
    for i in 0..43 {
        fs.mknod(&format!("/d/f{:02}", i)).unwrap();
    }
    let dir = fs.lookup("/d").unwrap();
    assert_eq!(dir.size(), 2 * CLUSTER);

    let first = fs.lookup("/d/f00").unwrap();
    fs.unlink(&first).unwrap();
    drop(first);
    assert_eq!(dir.size(), 2 * CLUSTER);

    let last = fs.lookup("/d/f42").unwrap();
    fs.unlink(&last).unwrap();
    drop(last);
    assert_eq!(dir.size(), CLUSTER);
    assert_eq!(fs.list("/d").unwrap().len(), 41);
}

#[test]
fn failed_growth_is_rolled_back() {
    init();
    let image = ImageBuilder::new().build();
    let fs = image.mount();
    fs.mknod("/empty").unwrap();
    fs.mknod("/full").unwrap();
    let empty = fs.lookup("/empty").unwrap();
    let full = fs.lookup("/full").unwrap();
    fs.pwrite(&full, b"two clusters", CLUSTER).unwrap();
    let free = fs.count_free_clusters() as u64;
    let start = full.start_cluster();

    // One cluster more than the volume has left
    let too_big = (free + 1) * CLUSTER;
    assert!(matches!(fs.truncate(&empty, too_big), Err(ExFatError::NoSpace)));
    assert_eq!(empty.size(), 0);
    assert_eq!(empty.start_cluster(), 0);
    assert_eq!(fs.count_free_clusters() as u64, free);

    assert!(matches!(
        fs.truncate(&full, 2 * CLUSTER + too_big),
        Err(ExFatError::NoSpace)
    ));
    assert_eq!(full.size(), CLUSTER + 12);
    assert_eq!(full.start_cluster(), start);
    assert_eq!(fs.count_free_clusters() as u64, free);

    let mut data = [0u8; 12];
    fs.pread(&full, &mut data, CLUSTER).unwrap();
    assert_eq!(&data, b"two clusters");
}

#[test]
fn failed_growth_after_demotion_is_rolled_back() {
    init();
    let image = ImageBuilder::new().build();
    let fs = image.mount();
    fs.mknod("/a").unwrap();
    fs.mknod("/b").unwrap();
    let a = fs.lookup("/a").unwrap();
    let b = fs.lookup("/b").unwrap();
    fs.pwrite(&a, &[0x5A; CLUSTER as usize], 0).unwrap();
    // `b` sits right after `a`, so growing `a` has to leave the run.
    fs.truncate(&b, CLUSTER).unwrap();
    let free = fs.count_free_clusters() as u64;

    assert!(matches!(
        fs.truncate(&a, (free + 2) * CLUSTER),
        Err(ExFatError::NoSpace)
    ));
    assert_eq!(a.size(), CLUSTER);
    assert_eq!(fs.count_free_clusters() as u64, free);
    assert_eq!(read_fat_entry(&image, a.start_cluster()), EXFAT_CLUSTER_END);

    let mut data = vec![0u8; CLUSTER as usize];
    fs.pread(&a, &mut data, 0).unwrap();
    assert!(data.iter().all(|&byte| byte == 0x5A));

    // The volume is still usable afterwards.
    fs.truncate(&a, 3 * CLUSTER).unwrap();
    assert_eq!(fs.count_free_clusters() as u64, free - 2);
}
