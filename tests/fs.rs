//! End-to-end tests against a freshly formatted in-memory NAND image.
//!
//! Several tests double-check the driver through the raw image: the
//! superblock region is stored in plaintext, so the FAT, the FST and the
//! replica versions can be parsed independently of the driver under test.

use nandkit::{
    CLUSTER_DATA_SIZE, Error, FileMode, FileSystem, INTERNAL_FD, NAND_SIZE, NandKeys, SeekMode,
};
use test_log::test;

const TEST_KEYS: ([u8; 20], [u8; 16]) = ([0x11; 20], [0x22; 16]);

fn keys() -> NandKeys {
    NandKeys::new(TEST_KEYS.0, TEST_KEYS.1)
}

fn blank_image() -> Vec<u8> {
    vec![0u8; NAND_SIZE]
}

fn formatted<'n>(image: &'n mut [u8]) -> FileSystem<'n> {
    let mut fs = FileSystem::new(image, keys()).unwrap();
    fs.format(0).unwrap();
    fs
}

fn rw() -> FileMode {
    FileMode::READ | FileMode::WRITE
}

fn none() -> FileMode {
    FileMode::empty()
}

/// A distinctive test payload.
fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 255 + 1) as u8).collect()
}

// ---- raw image helpers (independent re-implementation of the layout) ----

const PAGE_STRIDE: usize = 2048 + 64;
const CLUSTER_STRIDE: usize = 8 * PAGE_STRIDE;

/// Concatenated data halves of one cluster, straight from the image.
fn raw_cluster_data(image: &[u8], cluster: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(0x4000);
    for page in 0..8 {
        let off = cluster * CLUSTER_STRIDE + page * PAGE_STRIDE;
        data.extend_from_slice(&image[off..off + 2048]);
    }
    data
}

/// (replica index, version) of every replica whose magic is valid.
fn raw_superblock_versions(image: &[u8]) -> Vec<(u32, u32)> {
    let mut versions = Vec::new();
    for index in 0..16u32 {
        let first_cluster = 0x7F00 + index as usize * 16;
        let head = &raw_cluster_data(image, first_cluster)[..8];
        if &head[0..4] == b"SFFS" {
            versions.push((index, u32::from_be_bytes(head[4..8].try_into().unwrap())));
        }
    }
    versions
}

/// The full 0x40000 bytes of the newest valid superblock replica.
fn raw_newest_superblock(image: &[u8]) -> Vec<u8> {
    let (index, _) = raw_superblock_versions(image)
        .into_iter()
        .max_by_key(|&(_, version)| version)
        .expect("no valid superblock replica");
    let mut bytes = Vec::with_capacity(0x40000);
    for i in 0..16 {
        bytes.extend_from_slice(&raw_cluster_data(image, 0x7F00 + index as usize * 16 + i));
    }
    bytes
}

fn raw_fat_entry(superblock: &[u8], cluster: usize) -> u16 {
    let off = 0x0C + cluster * 2;
    u16::from_be_bytes(superblock[off..off + 2].try_into().unwrap())
}

/// (name, mode, sub, size) of FST entry `index`.
fn raw_fst_entry(superblock: &[u8], index: usize) -> (Vec<u8>, u8, u16, u32) {
    let off = 0x0C + 0x8000 * 2 + index * 0x20;
    let entry = &superblock[off..off + 0x20];
    let name_len = entry[..12].iter().position(|&b| b == 0).unwrap_or(12);
    (
        entry[..name_len].to_vec(),
        entry[0x0C],
        u16::from_be_bytes(entry[0x0E..0x10].try_into().unwrap()),
        u32::from_be_bytes(entry[0x12..0x16].try_into().unwrap()),
    )
}

// ---- scenarios ----

#[test]
fn operations_fail_until_formatted() {
    let mut image = blank_image();
    let mut fs = FileSystem::new(&mut image, keys()).unwrap();

    assert_eq!(
        fs.create_file(INTERNAL_FD, "/a", 0, rw(), none(), none()),
        Err(Error::SuperblockInitFailed)
    );
    assert_eq!(
        fs.open_file(0, 0, "/a", FileMode::READ).unwrap_err(),
        Error::SuperblockInitFailed
    );

    assert_eq!(fs.format(1), Err(Error::AccessDenied));
    fs.format(0).unwrap();
    assert!(fs.get_nand_stats(INTERNAL_FD).is_ok());
}

#[test]
fn format_then_create() {
    let mut image = blank_image();
    let mut fs = formatted(&mut image);

    let fd = fs.open_fs(0, 0).unwrap();
    fs.create_file(fd, "/a", 0, rw(), none(), none()).unwrap();

    let metadata = fs.get_metadata(fd, "/a").unwrap();
    assert_eq!(metadata.uid, 0);
    assert_eq!(metadata.size, 0);
    assert!(metadata.is_file);
    assert_eq!(metadata.owner_mode, rw());
    assert_eq!(metadata.group_mode, none());
}

#[test]
fn write_and_reread() {
    let mut image = blank_image();
    let mut fs = formatted(&mut image);

    let fd0 = fs.open_fs(0, 0).unwrap();
    fs.create_file(fd0, "/a", 0, rw(), none(), none()).unwrap();
    fs.close(fd0).unwrap();

    let data = pattern(0x5000);
    let fd1 = fs.open_file(0, 0, "/a", FileMode::WRITE).unwrap();
    assert_eq!(fs.write_file(fd1, &data).unwrap(), 0x5000);
    fs.close(fd1).unwrap();

    let fd2 = fs.open_file(0, 0, "/a", FileMode::READ).unwrap();
    let mut read_back = vec![0u8; 0x5000];
    assert_eq!(fs.read_file(fd2, &mut read_back).unwrap(), 0x5000);
    assert_eq!(read_back, data);

    let status = fs.get_file_status(fd2).unwrap();
    assert_eq!(status.size, 0x5000);
    assert_eq!(status.offset, 0x5000);
    fs.close(fd2).unwrap();
    drop(fs);

    // The ciphertext of the file's clusters must not leak the plaintext.
    let on_nand = raw_cluster_data(&image, 64);
    assert_ne!(&on_nand[..0x100], &data[..0x100]);
}

#[test]
fn reads_are_clamped_to_file_size() {
    let mut image = blank_image();
    let mut fs = formatted(&mut image);

    fs.create_file(INTERNAL_FD, "/small", 0, rw(), none(), none())
        .unwrap();
    let fd = fs.open_file(0, 0, "/small", rw()).unwrap();
    fs.write_file(fd, &pattern(100)).unwrap();
    fs.seek_file(fd, 0, SeekMode::Set).unwrap();

    let mut buf = vec![0u8; 1000];
    assert_eq!(fs.read_file(fd, &mut buf).unwrap(), 100);
    assert_eq!(&buf[..100], &pattern(100)[..]);
    fs.close(fd).unwrap();
}

#[test]
fn multi_cluster_round_trip() {
    let mut image = blank_image();
    let mut fs = formatted(&mut image);

    fs.create_file(INTERNAL_FD, "/big", 0, rw(), none(), none())
        .unwrap();

    let data = pattern(0x9000); // three clusters, last one partial
    let fd = fs.open_file(0, 0, "/big", FileMode::WRITE).unwrap();
    assert_eq!(fs.write_file(fd, &data).unwrap(), 0x9000);
    fs.close(fd).unwrap();

    let fd = fs.open_file(0, 0, "/big", FileMode::READ).unwrap();

    // Read a range straddling the first cluster boundary.
    fs.seek_file(fd, 0x3FF0, SeekMode::Set).unwrap();
    let mut straddle = [0u8; 0x20];
    assert_eq!(fs.read_file(fd, &mut straddle).unwrap(), 0x20);
    assert_eq!(&straddle[..], &data[0x3FF0..0x4010]);

    // And the whole thing.
    fs.seek_file(fd, 0, SeekMode::Set).unwrap();
    let mut whole = vec![0u8; 0x9000];
    assert_eq!(fs.read_file(fd, &mut whole).unwrap(), 0x9000);
    assert_eq!(whole, data);
    fs.close(fd).unwrap();
    drop(fs);

    // FAT view: chain of three clusters starting at the file's sub.
    let superblock = raw_newest_superblock(&image);
    let (name, mode, sub, size) = raw_fst_entry(&superblock, 1);
    assert_eq!(name, b"big");
    assert_eq!(mode & 3, 1);
    assert_eq!(size, 0x9000);
    let second = raw_fat_entry(&superblock, sub as usize);
    let third = raw_fat_entry(&superblock, second as usize);
    assert!(sub >= 64 && second >= 64 && third >= 64);
    assert_eq!(raw_fat_entry(&superblock, third as usize), 0xFFFB);
}

#[test]
fn permission_denied_for_other_users() {
    let mut image = blank_image();
    let mut fs = formatted(&mut image);

    fs.create_file(INTERNAL_FD, "/u", 0, rw(), none(), none())
        .unwrap();
    // Hand the file to uid 1 (root may chown; the file is empty).
    fs.set_metadata(INTERNAL_FD, "/u", 1, 1, 0, rw(), none(), none())
        .unwrap();

    assert_eq!(
        fs.open_file(2, 2, "/u", FileMode::READ).unwrap_err(),
        Error::AccessDenied
    );
    // The owner still gets in.
    let fd = fs.open_file(1, 9, "/u", rw()).unwrap();
    fs.close(fd).unwrap();
}

#[test]
fn permission_classes_on_open() {
    let mut image = blank_image();
    let mut fs = formatted(&mut image);

    fs.create_file(INTERNAL_FD, "/shared", 0, rw(), FileMode::READ, none())
        .unwrap();
    fs.set_metadata(
        INTERNAL_FD,
        "/shared",
        1,
        5,
        0,
        rw(),
        FileMode::READ,
        none(),
    )
    .unwrap();

    // Group member may read but not write.
    let fd = fs.open_file(2, 5, "/shared", FileMode::READ).unwrap();
    fs.close(fd).unwrap();
    assert_eq!(
        fs.open_file(2, 5, "/shared", FileMode::WRITE).unwrap_err(),
        Error::AccessDenied
    );

    // An empty open mode is rejected outright.
    assert_eq!(
        fs.open_file(2, 5, "/shared", none()).unwrap_err(),
        Error::Invalid
    );
}

#[test]
fn directory_depth_limit() {
    let mut image = blank_image();
    let mut fs = formatted(&mut image);

    // 8 separators is fine as far as validation goes (the parents do not
    // exist, so resolution fails)...
    assert_eq!(
        fs.create_directory(INTERNAL_FD, "/a/b/c/d/e/f/g/h", 0, rw(), none(), none()),
        Err(Error::NotFound)
    );
    // ...but 9 separators is rejected before resolution.
    assert_eq!(
        fs.create_directory(INTERNAL_FD, "/a/b/c/d/e/f/g/h/i", 0, rw(), none(), none()),
        Err(Error::TooManyPathComponents)
    );
    // Files are not depth-limited; this fails on the missing parent only.
    assert_eq!(
        fs.create_file(INTERNAL_FD, "/a/b/c/d/e/f/g/h/i", 0, rw(), none(), none()),
        Err(Error::NotFound)
    );
}

#[test]
fn path_validation() {
    let mut image = blank_image();
    let mut fs = formatted(&mut image);

    for bad in ["", "/", "a", "/a/", "relative/x"] {
        assert_eq!(
            fs.create_file(INTERNAL_FD, bad, 0, rw(), none(), none()),
            Err(Error::Invalid),
            "path {bad:?} should be invalid"
        );
    }

    // 64 bytes is fine, 65 is not.
    let long = format!("/{}", "d/".repeat(5)) + &"x".repeat(53);
    assert_eq!(long.len(), 64);
    assert_eq!(
        fs.create_file(INTERNAL_FD, &long, 0, rw(), none(), none()),
        Err(Error::NotFound)
    );
    assert_eq!(
        fs.create_file(INTERNAL_FD, &(long + "x"), 0, rw(), none(), none()),
        Err(Error::Invalid)
    );

    // Non-printable bytes are rejected.
    assert_eq!(
        fs.create_file(INTERNAL_FD, "/a\x01b", 0, rw(), none(), none()),
        Err(Error::Invalid)
    );
    assert_eq!(
        fs.create_file(INTERNAL_FD, "/caf\u{e9}", 0, rw(), none(), none()),
        Err(Error::Invalid)
    );
}

#[test]
fn create_rejects_duplicates_and_missing_parents() {
    let mut image = blank_image();
    let mut fs = formatted(&mut image);

    fs.create_directory(INTERNAL_FD, "/dir", 0, rw(), none(), none())
        .unwrap();
    fs.create_file(INTERNAL_FD, "/dir/f", 0, rw(), none(), none())
        .unwrap();

    assert_eq!(
        fs.create_file(INTERNAL_FD, "/dir/f", 0, rw(), none(), none()),
        Err(Error::AlreadyExists)
    );
    assert_eq!(
        fs.create_file(INTERNAL_FD, "/nodir/f", 0, rw(), none(), none()),
        Err(Error::NotFound)
    );
}

#[test]
fn read_directory_lists_newest_first() {
    let mut image = blank_image();
    let mut fs = formatted(&mut image);

    fs.create_file(INTERNAL_FD, "/a", 0, rw(), none(), none())
        .unwrap();
    fs.create_file(INTERNAL_FD, "/b", 0, rw(), none(), none())
        .unwrap();
    fs.create_directory(INTERNAL_FD, "/c", 0, rw(), none(), none())
        .unwrap();

    assert_eq!(fs.read_directory(INTERNAL_FD, "/").unwrap(), ["c", "b", "a"]);
    assert_eq!(fs.read_directory(INTERNAL_FD, "/c").unwrap(), Vec::<String>::new());
    assert_eq!(
        fs.read_directory(INTERNAL_FD, "/a").unwrap_err(),
        Error::Invalid
    );
    assert_eq!(
        fs.read_directory(INTERNAL_FD, "/missing").unwrap_err(),
        Error::NotFound
    );
}

#[test]
fn rename_over_existing_file() {
    let mut image = blank_image();
    let mut fs = formatted(&mut image);

    fs.create_file(INTERNAL_FD, "/x", 0, rw(), none(), none())
        .unwrap();
    fs.create_file(INTERNAL_FD, "/y", 0, rw(), none(), none())
        .unwrap();

    fs.rename(INTERNAL_FD, "/x", "/y").unwrap();

    assert_eq!(fs.get_metadata(INTERNAL_FD, "/x").unwrap_err(), Error::NotFound);
    assert!(fs.get_metadata(INTERNAL_FD, "/y").unwrap().is_file);
    assert_eq!(fs.read_directory(INTERNAL_FD, "/").unwrap(), ["y"]);

    // No duplicate or stale entries: root plus exactly one file.
    let stats = fs.get_nand_stats(INTERNAL_FD).unwrap();
    assert_eq!(stats.used_inodes, 2);
}

#[test]
fn rename_moves_between_directories() {
    let mut image = blank_image();
    let mut fs = formatted(&mut image);

    fs.create_directory(INTERNAL_FD, "/src", 0, rw(), none(), none())
        .unwrap();
    fs.create_directory(INTERNAL_FD, "/dst", 0, rw(), none(), none())
        .unwrap();
    fs.create_file(INTERNAL_FD, "/src/data", 0, rw(), FileMode::READ, none())
        .unwrap();

    fs.rename(INTERNAL_FD, "/src/data", "/dst/moved").unwrap();

    assert!(fs.read_directory(INTERNAL_FD, "/src").unwrap().is_empty());
    assert_eq!(fs.read_directory(INTERNAL_FD, "/dst").unwrap(), ["moved"]);

    // The entry kept its identity: same kind, same access modes.
    let metadata = fs.get_metadata(INTERNAL_FD, "/dst/moved").unwrap();
    assert!(metadata.is_file);
    assert_eq!(metadata.owner_mode, rw());
    assert_eq!(metadata.group_mode, FileMode::READ);
}

#[test]
fn rename_rejects_same_name_and_kind_mismatch() {
    let mut image = blank_image();
    let mut fs = formatted(&mut image);

    fs.create_file(INTERNAL_FD, "/f", 0, rw(), none(), none())
        .unwrap();
    fs.create_directory(INTERNAL_FD, "/d", 0, rw(), none(), none())
        .unwrap();

    // A file rename to the same stored name is a rejected no-op.
    assert_eq!(fs.rename(INTERNAL_FD, "/f", "/f"), Err(Error::Invalid));
    // Files do not replace directories and vice versa.
    assert_eq!(fs.rename(INTERNAL_FD, "/f", "/d"), Err(Error::Invalid));
    assert_eq!(fs.rename(INTERNAL_FD, "/d", "/f"), Err(Error::Invalid));
}

#[test]
fn delete_rejects_open_files() {
    let mut image = blank_image();
    let mut fs = formatted(&mut image);

    fs.create_directory(INTERNAL_FD, "/d", 0, rw(), none(), none())
        .unwrap();
    fs.create_file(INTERNAL_FD, "/d/f", 0, rw(), none(), none())
        .unwrap();

    let fd = fs.open_file(0, 0, "/d/f", rw()).unwrap();
    assert_eq!(fs.delete(INTERNAL_FD, "/d/f"), Err(Error::InUse));
    // A directory containing an open file cannot go either.
    assert_eq!(fs.delete(INTERNAL_FD, "/d"), Err(Error::InUse));
    // Nor can the open file be renamed away.
    assert_eq!(fs.rename(INTERNAL_FD, "/d/f", "/d/g"), Err(Error::InUse));

    fs.close(fd).unwrap();
    fs.delete(INTERNAL_FD, "/d").unwrap();
    assert_eq!(fs.get_metadata(INTERNAL_FD, "/d").unwrap_err(), Error::NotFound);
}

#[test]
fn delete_frees_clusters() {
    let mut image = blank_image();
    let mut fs = formatted(&mut image);

    let baseline = fs.get_nand_stats(INTERNAL_FD).unwrap();

    fs.create_file(INTERNAL_FD, "/victim", 0, rw(), none(), none())
        .unwrap();
    let fd = fs.open_file(0, 0, "/victim", FileMode::WRITE).unwrap();
    fs.write_file(fd, &pattern(0x8000)).unwrap();
    fs.close(fd).unwrap();

    let with_file = fs.get_nand_stats(INTERNAL_FD).unwrap();
    assert_eq!(with_file.used_clusters, baseline.used_clusters + 2);

    fs.delete(INTERNAL_FD, "/victim").unwrap();
    let after = fs.get_nand_stats(INTERNAL_FD).unwrap();
    assert_eq!(after.used_clusters, baseline.used_clusters);
    assert_eq!(after.free_clusters, baseline.free_clusters);
    assert_eq!(after.used_inodes, baseline.used_inodes);
}

#[test]
fn fat_conservation() {
    let mut image = blank_image();
    let mut fs = formatted(&mut image);

    let sizes = [0x1u32, 0x4000, 0x4001, 0x9000];
    for (i, &size) in sizes.iter().enumerate() {
        let path = format!("/file{i}");
        fs.create_file(INTERNAL_FD, &path, 0, rw(), none(), none())
            .unwrap();
        let fd = fs.open_file(0, 0, &path, FileMode::WRITE).unwrap();
        fs.write_file(fd, &pattern(size as usize)).unwrap();
        fs.close(fd).unwrap();
    }

    let expected: u32 = sizes
        .iter()
        .map(|&s| s.div_ceil(CLUSTER_DATA_SIZE as u32))
        .sum();
    let stats = fs.get_nand_stats(INTERNAL_FD).unwrap();
    assert_eq!(stats.used_clusters, expected);
    assert_eq!(stats.cluster_size, 0x4000);

    // The same number via the recursive directory walk.
    let dir_stats = fs.get_directory_stats(INTERNAL_FD, "/").unwrap();
    assert_eq!(dir_stats.used_clusters, expected);
    assert_eq!(dir_stats.used_inodes, 1 + sizes.len() as u32);
}

#[test]
fn copy_on_write_relocates_rewritten_clusters() {
    let mut image = blank_image();
    {
        let mut fs = formatted(&mut image);
        fs.create_file(INTERNAL_FD, "/cow", 0, rw(), none(), none())
            .unwrap();
        let fd = fs.open_file(0, 0, "/cow", FileMode::WRITE).unwrap();
        fs.write_file(fd, &pattern(0x2000)).unwrap();
        fs.close(fd).unwrap();
    }

    // First-fit allocation is deterministic: the first data cluster is 64.
    let superblock = raw_newest_superblock(&image);
    let (_, _, first_cluster, _) = raw_fst_entry(&superblock, 1);
    assert_eq!(first_cluster, 64);

    // Grow the file by writing over the tail of the partial cluster; the
    // rewritten chain position must land on a fresh cluster and the old
    // one must be freed.
    {
        let mut fs = FileSystem::new(&mut image, keys()).unwrap();
        let fd = fs.open_file(0, 0, "/cow", rw()).unwrap();
        fs.seek_file(fd, 0x2000, SeekMode::Set).unwrap();
        fs.write_file(fd, &pattern(0x1000)).unwrap();
        fs.close(fd).unwrap();
    }

    let superblock = raw_newest_superblock(&image);
    let (_, _, new_cluster, size) = raw_fst_entry(&superblock, 1);
    assert_eq!(size, 0x3000);
    assert_ne!(new_cluster, 64);
    assert_eq!(raw_fat_entry(&superblock, 64), 0xFFFE);
    assert_eq!(raw_fat_entry(&superblock, new_cluster as usize), 0xFFFB);
}

#[test]
fn seek_bounds() {
    let mut image = blank_image();
    let mut fs = formatted(&mut image);

    fs.create_file(INTERNAL_FD, "/s", 0, rw(), none(), none())
        .unwrap();
    let fd = fs.open_file(0, 0, "/s", rw()).unwrap();
    fs.write_file(fd, &pattern(100)).unwrap();

    assert_eq!(fs.seek_file(fd, 0, SeekMode::Set).unwrap(), 0);
    assert_eq!(fs.seek_file(fd, 0, SeekMode::End).unwrap(), 100);
    assert_eq!(fs.seek_file(fd, 40, SeekMode::Set).unwrap(), 40);
    assert_eq!(fs.seek_file(fd, 10, SeekMode::Current).unwrap(), 50);
    // Backwards via the wrap-around: 50 + (2^32 - 20) = 30 (mod 2^32).
    assert_eq!(
        fs.seek_file(fd, 20u32.wrapping_neg(), SeekMode::Current).unwrap(),
        30
    );

    // No seeking past the end.
    assert_eq!(fs.seek_file(fd, 101, SeekMode::Set), Err(Error::Invalid));
    assert_eq!(fs.seek_file(fd, 1, SeekMode::End), Err(Error::Invalid));
    // The offset is untouched by a failed seek.
    assert_eq!(fs.get_file_status(fd).unwrap().offset, 30);
    fs.close(fd).unwrap();
}

#[test]
fn file_size_snapshots_per_handle() {
    let mut image = blank_image();
    let mut fs = formatted(&mut image);

    fs.create_file(INTERNAL_FD, "/snap", 0, rw(), none(), none())
        .unwrap();
    let writer = fs.open_file(0, 0, "/snap", FileMode::WRITE).unwrap();
    fs.write_file(writer, &pattern(0x100)).unwrap();
    fs.close(writer).unwrap();

    let reader = fs.open_file(0, 0, "/snap", FileMode::READ).unwrap();
    let writer = fs.open_file(0, 0, "/snap", FileMode::WRITE).unwrap();
    fs.seek_file(writer, 0x100, SeekMode::Set).unwrap();
    fs.write_file(writer, &pattern(0x100)).unwrap();
    fs.close(writer).unwrap();

    // The reader still sees the size captured at open time.
    assert_eq!(fs.get_file_status(reader).unwrap().size, 0x100);
    let mut buf = vec![0u8; 0x200];
    assert_eq!(fs.read_file(reader, &mut buf).unwrap(), 0x100);
    fs.close(reader).unwrap();
}

#[test]
fn descriptor_table_is_bounded() {
    let mut image = blank_image();
    let mut fs = formatted(&mut image);

    let fds: Vec<_> = (0..16).map(|_| fs.open_fs(7, 7).unwrap()).collect();
    assert_eq!(fs.open_fs(7, 7).unwrap_err(), Error::NoFreeHandle);

    // The internal descriptor is not part of the table and keeps working.
    assert!(fs.get_nand_stats(INTERNAL_FD).is_ok());

    fs.close(fds[3]).unwrap();
    assert_eq!(fs.open_fs(7, 7).unwrap(), fds[3]);

    // File operations on an fs-only handle are invalid.
    let mut buf = [0u8; 4];
    assert_eq!(fs.read_file(fds[0], &mut buf), Err(Error::Invalid));
    assert_eq!(fs.get_file_status(fds[0]), Err(Error::Invalid));

    // Unknown descriptors are rejected.
    assert_eq!(fs.close(42), Err(Error::Invalid));
    assert_eq!(fs.close(0xDEAD_BEEF), Err(Error::Invalid));
}

#[test]
fn set_metadata_rules() {
    let mut image = blank_image();
    let mut fs = formatted(&mut image);

    fs.create_file(INTERNAL_FD, "/meta", 0, rw(), none(), none())
        .unwrap();
    fs.set_metadata(INTERNAL_FD, "/meta", 1, 1, 0xAB, rw(), rw(), none())
        .unwrap();
    let metadata = fs.get_metadata(INTERNAL_FD, "/meta").unwrap();
    assert_eq!((metadata.uid, metadata.gid, metadata.attribute), (1, 1, 0xAB));

    // The owner may tweak modes but not give the file away.
    let owner_fd = fs.open_fs(1, 1).unwrap();
    fs.set_metadata(owner_fd, "/meta", 1, 2, 0, rw(), none(), none())
        .unwrap();
    assert_eq!(
        fs.set_metadata(owner_fd, "/meta", 3, 2, 0, rw(), none(), none()),
        Err(Error::AccessDenied)
    );

    // Anyone else is denied.
    let other_fd = fs.open_fs(5, 5).unwrap();
    assert_eq!(
        fs.set_metadata(other_fd, "/meta", 5, 5, 0, rw(), none(), none()),
        Err(Error::AccessDenied)
    );

    // Non-empty files refuse metadata changes.
    let fd = fs.open_file(1, 2, "/meta", FileMode::WRITE).unwrap();
    fs.write_file(fd, &[1, 2, 3]).unwrap();
    fs.close(fd).unwrap();
    assert_eq!(
        fs.set_metadata(INTERNAL_FD, "/meta", 1, 2, 0, rw(), none(), none()),
        Err(Error::FileNotEmpty)
    );

    // Directories are exempt from the emptiness rule.
    fs.create_directory(INTERNAL_FD, "/dir", 0, rw(), none(), none())
        .unwrap();
    fs.create_file(INTERNAL_FD, "/dir/child", 0, rw(), none(), none())
        .unwrap();
    fs.set_metadata(INTERNAL_FD, "/dir", 0, 0, 1, rw(), rw(), rw())
        .unwrap();
}

#[test]
fn directory_stats_and_error_codes() {
    let mut image = blank_image();
    let mut fs = formatted(&mut image);

    fs.create_directory(INTERNAL_FD, "/d", 0, rw(), none(), none())
        .unwrap();
    fs.create_directory(INTERNAL_FD, "/d/e", 0, rw(), none(), none())
        .unwrap();
    fs.create_file(INTERNAL_FD, "/d/f1", 0, rw(), none(), none())
        .unwrap();
    fs.create_file(INTERNAL_FD, "/d/e/f2", 0, rw(), none(), none())
        .unwrap();

    let fd = fs.open_file(0, 0, "/d/e/f2", FileMode::WRITE).unwrap();
    fs.write_file(fd, &pattern(0x4001)).unwrap();
    fs.close(fd).unwrap();

    let stats = fs.get_directory_stats(INTERNAL_FD, "/d").unwrap();
    assert_eq!(stats.used_inodes, 4); // d, e, f1, f2
    assert_eq!(stats.used_clusters, 2);

    // Compatibility quirk: a malformed path surfaces as
    // SuperblockInitFailed, not Invalid.
    assert_eq!(
        fs.get_directory_stats(INTERNAL_FD, "bad").unwrap_err(),
        Error::SuperblockInitFailed
    );
    assert_eq!(
        fs.get_directory_stats(INTERNAL_FD, "/d/f1").unwrap_err(),
        Error::Invalid
    );
}

#[test]
fn superblock_rotation_and_version_counter() {
    let mut image = blank_image();
    {
        let mut fs = FileSystem::new(&mut image, keys()).unwrap();
        for _ in 0..17 {
            fs.format(0).unwrap();
        }
    }

    let versions = raw_superblock_versions(&image);
    // Every replica slot has been written at least once.
    assert_eq!(versions.len(), 16);

    let (newest_index, newest_version) = versions
        .iter()
        .copied()
        .max_by_key(|&(_, version)| version)
        .unwrap();
    assert_eq!(newest_version, 17);
    // 17 flushes starting from index 0 land on (0 + 17) % 16 = 1.
    assert_eq!(newest_index, 1);

    // A fresh driver instance discovers and verifies the newest replica.
    let mut fs = FileSystem::new(&mut image, keys()).unwrap();
    assert!(fs.get_nand_stats(INTERNAL_FD).is_ok());
}

#[test]
fn superblock_version_is_monotonic_across_instances() {
    let mut image = blank_image();

    {
        let mut fs = formatted(&mut image);
        fs.create_file(INTERNAL_FD, "/one", 0, rw(), none(), none())
            .unwrap();
    }
    let first = raw_superblock_versions(&image)
        .into_iter()
        .map(|(_, v)| v)
        .max()
        .unwrap();

    {
        let mut fs = FileSystem::new(&mut image, keys()).unwrap();
        fs.create_file(INTERNAL_FD, "/two", 0, rw(), none(), none())
            .unwrap();
        // The earlier file survived the reload.
        assert!(fs.get_metadata(INTERNAL_FD, "/one").unwrap().is_file);
    }
    let second = raw_superblock_versions(&image)
        .into_iter()
        .map(|(_, v)| v)
        .max()
        .unwrap();

    assert!(second > first);
}

#[test]
fn tampered_data_cluster_fails_verification() {
    let mut image = blank_image();
    {
        let mut fs = formatted(&mut image);
        fs.create_file(INTERNAL_FD, "/t", 0, rw(), none(), none())
            .unwrap();
        let fd = fs.open_file(0, 0, "/t", FileMode::WRITE).unwrap();
        fs.write_file(fd, &pattern(0x4000)).unwrap();
        fs.close(fd).unwrap();
    }

    // Flip one data byte of the file's first cluster (cluster 64).
    image[64 * CLUSTER_STRIDE] ^= 0xFF;

    let mut fs = FileSystem::new(&mut image, keys()).unwrap();
    let fd = fs.open_file(0, 0, "/t", FileMode::READ).unwrap();
    let mut buf = vec![0u8; 0x4000];
    assert_eq!(fs.read_file(fd, &mut buf), Err(Error::CheckFailed));
}

#[test]
fn tampered_superblock_is_rejected() {
    let mut image = blank_image();
    {
        let mut fs = formatted(&mut image);
        fs.create_file(INTERNAL_FD, "/x", 0, rw(), none(), none())
            .unwrap();
    }

    // Corrupt the FAT area of every replica; HMAC verification of the
    // winning candidate must now fail.
    for index in 0..16usize {
        let off = (0x7F00 + index * 16) * CLUSTER_STRIDE + 0x100;
        image[off] ^= 0xFF;
    }

    let mut fs = FileSystem::new(&mut image, keys()).unwrap();
    assert_eq!(
        fs.get_nand_stats(INTERNAL_FD).unwrap_err(),
        Error::SuperblockInitFailed
    );
}

#[test]
fn wrong_keys_cannot_open_an_image() {
    let mut image = blank_image();
    {
        let mut fs = formatted(&mut image);
        fs.create_file(INTERNAL_FD, "/x", 0, rw(), none(), none())
            .unwrap();
    }

    let other_keys = NandKeys::new([0x33; 20], [0x44; 16]);
    let mut fs = FileSystem::new(&mut image, other_keys).unwrap();
    // The superblock region is plaintext, but its HMAC is keyed.
    assert_eq!(
        fs.get_nand_stats(INTERNAL_FD).unwrap_err(),
        Error::SuperblockInitFailed
    );
}
