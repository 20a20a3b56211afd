use nandkit::{FileMode, FileSystem, INTERNAL_FD, NAND_SIZE, NandKeys, Result, SeekMode};

fn main() -> Result<()> {
    env_logger::init();

    // A blank in-memory image; load a real dump here instead if you have one,
    // along with its keys from `NandKeys::load_bootmii_keys`.
    let mut image = vec![0u8; NAND_SIZE];
    let keys = NandKeys::new([0; 20], [0; 16]);

    let mut fs = FileSystem::new(&mut image, keys)?;
    fs.format(0)?;

    let rw = FileMode::READ | FileMode::WRITE;
    fs.create_directory(INTERNAL_FD, "/tmp", 0, rw, rw, rw)?;
    fs.create_file(INTERNAL_FD, "/tmp/hello.txt", 0, rw, FileMode::READ, FileMode::READ)?;

    let fd = fs.open_file(0, 0, "/tmp/hello.txt", rw)?;
    fs.write_file(fd, b"hello from nandkit")?;
    fs.seek_file(fd, 0, SeekMode::Set)?;
    let mut contents = [0u8; 18];
    fs.read_file(fd, &mut contents)?;
    fs.close(fd)?;

    println!("/tmp: {:?}", fs.read_directory(INTERNAL_FD, "/tmp")?);
    println!("contents: {}", String::from_utf8_lossy(&contents));

    let stats = fs.get_nand_stats(INTERNAL_FD)?;
    println!(
        "clusters: {} used, {} free, {} reserved",
        stats.used_clusters, stats.free_clusters, stats.reserved_clusters
    );

    Ok(())
}
