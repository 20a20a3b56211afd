//! **nandkit** - a read/write driver for the Wii's internal NAND file
//! system (SFFS).
//!
//! The driver operates entirely against an in-memory image of the
//! 0x21000000-byte NAND (data pages interleaved with their out-of-band
//! spare bytes) and exposes a POSIX-like interface: open, read, write,
//! seek, create, delete, rename, list and stat. AES-128-CBC encryption of
//! user data, HMAC-SHA1 integrity tags on every cluster, spare-area ECC
//! and the 16-replica versioned superblock ring are handled transparently.
//!
//! # Module overview
//! | Module | Contents |
//! |--------|----------|
//! | [`fs`]     | The [`FileSystem`] driver and its public value types |
//! | [`sffs`]   | On-disk layout: geometry constants, FAT/FST/superblock structures |
//! | [`crypto`] | Pure-Rust AES-128-CBC and HMAC-SHA1 |
//! | [`ecc`]    | Spare-area Hamming ECC per 2048-byte page |
//! | [`keys`]   | The per-console key bundle, loadable from BootMii `keys.bin` |
//!
//! # Example
//! ```no_run
//! use nandkit::{FileMode, FileSystem, NandKeys, NAND_SIZE};
//!
//! # fn main() -> nandkit::Result<()> {
//! let mut image = vec![0u8; NAND_SIZE];
//! let keys = NandKeys::new([0; 20], [0; 16]);
//! let mut fs = FileSystem::new(&mut image, keys)?;
//!
//! fs.format(0)?;
//! let fd = fs.open_fs(0, 0)?;
//! fs.create_directory(fd, "/sys", 0, FileMode::READ | FileMode::WRITE,
//!                     FileMode::READ, FileMode::empty())?;
//! fs.create_file(fd, "/sys/uid.sys", 0, FileMode::READ | FileMode::WRITE,
//!                FileMode::empty(), FileMode::empty())?;
//! # Ok(())
//! # }
//! ```

pub mod crypto;
pub mod ecc;
pub mod error;
pub mod fs;
pub mod keys;
pub mod sffs;
pub mod utils;

pub use error::{Error, Result};
pub use fs::{
    DirectoryStats, Fd, FileMode, FileStatus, FileSystem, INTERNAL_FD, Metadata, NandStats,
    SeekMode,
};
pub use keys::NandKeys;
pub use sffs::{CLUSTER_DATA_SIZE, NAND_SIZE};
