//! The file system driver.
//!
//! [`FileSystem`] owns a mutable borrow of the caller's NAND image for its
//! whole lifetime and exposes a POSIX-like interface: open/read/write/seek
//! on descriptors, create/delete/rename on paths, plus metadata and usage
//! queries. All operations run synchronously on the caller's thread; the
//! driver has no interior concurrency.
//!
//! Durability model: data cluster writes hit the image immediately, but
//! they only become reachable when the superblock that references them is
//! flushed. Metadata operations (create, delete, rename, set_metadata,
//! format) flush before returning; file writes are flushed by
//! [`FileSystem::close`].

mod file;
mod low_level;
mod path;

use bitflags::bitflags;
use log::debug;

use crate::keys::NandKeys;
use crate::sffs::{
    CLUSTER_COUNT, CLUSTER_DATA_SIZE, CLUSTER_BAD_BLOCK, CLUSTER_LAST_IN_CHAIN, CLUSTER_RESERVED,
    CLUSTER_UNUSED, FST_ENTRY_COUNT, FstEntry, NAND_SIZE, SUPERBLOCK_START_CLUSTER, Superblock,
};
use crate::{Error, Result};

use file::{FileCache, Handle};
use low_level::{child_index, fst_index, unused_fst_index};
use path::{has_permission, is_valid_non_root_path, split_path};

/// A file descriptor: 0..=15, or [`INTERNAL_FD`].
pub type Fd = u32;

/// File descriptor for using FS functions internally without taking an
/// entry in the descriptor table. Always valid, acts as root.
pub const INTERNAL_FD: Fd = 0xFFFF_FF00;

bitflags! {
    /// Access mode bits, used both for open modes and the per-class
    /// (owner/group/other) permission fields of an entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FileMode: u8 {
        const READ = 1;
        const WRITE = 2;
    }
}

/// Origin for [`FileSystem::seek_file`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekMode {
    /// Absolute offset.
    Set,
    /// Relative to the current offset (modulo 2^32, which is how callers
    /// seek backwards).
    Current,
    /// Relative to the file size.
    End,
}

/// Metadata for one FST entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    pub uid: u32,
    pub gid: u16,
    pub attribute: u8,
    pub owner_mode: FileMode,
    pub group_mode: FileMode,
    pub other_mode: FileMode,
    pub is_file: bool,
    pub size: u32,
    pub fst_index: u16,
}

/// NAND-wide usage counters from a FAT and FST scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NandStats {
    pub cluster_size: u32,
    pub free_clusters: u32,
    pub used_clusters: u32,
    pub bad_clusters: u32,
    pub reserved_clusters: u32,
    pub free_inodes: u32,
    pub used_inodes: u32,
}

/// Recursive usage counters for one directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DirectoryStats {
    pub used_clusters: u32,
    pub used_inodes: u32,
}

/// Position and size of an open file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStatus {
    /// Current offset in bytes relative to the beginning of the file.
    pub offset: u32,
    /// File size as captured by the handle.
    pub size: u32,
}

/// The SFFS driver over an in-memory NAND image.
pub struct FileSystem<'n> {
    pub(crate) nand: &'n mut [u8],
    pub(crate) keys: NandKeys,
    pub(crate) superblock: Option<Box<Superblock>>,
    pub(crate) superblock_index: u32,
    pub(crate) handles: [Handle; 16],
    pub(crate) internal_handle: Handle,
    pub(crate) cache: FileCache,
}

impl<'n> FileSystem<'n> {
    /// Initialise a file system over `nand`, which must be exactly
    /// [`NAND_SIZE`] (0x21000000) bytes long.
    ///
    /// The image is not required to contain a valid file system yet;
    /// operations will fail with [`Error::SuperblockInitFailed`] until
    /// [`FileSystem::format`] is called.
    pub fn new(nand: &'n mut [u8], keys: NandKeys) -> Result<Self> {
        if nand.len() != NAND_SIZE {
            return Err(Error::Invalid);
        }

        let mut fs = Self {
            nand,
            keys,
            superblock: None,
            superblock_index: 0,
            handles: [Handle::default(); 16],
            internal_handle: Handle::internal(),
            cache: FileCache::default(),
        };

        // Some legacy images mark free clusters with 0xFFFF instead of
        // CLUSTER_UNUSED. Sanitise in memory; the next flush persists it.
        if fs.ensure_superblock().is_ok()
            && let Some(superblock) = fs.superblock.as_mut()
        {
            for cluster in superblock.fat.iter_mut() {
                if *cluster == 0xFFFF {
                    *cluster = CLUSTER_UNUSED;
                }
            }
        }

        Ok(fs)
    }

    /// Format the file system. Only root (uid 0) may format.
    ///
    /// Reserves the boot and superblock regions, frees every data
    /// cluster, installs `/` at FST index 0 and closes all public
    /// descriptors, then flushes. The version counter survives a format
    /// when the image already had a valid superblock.
    pub fn format(&mut self, uid: u32) -> Result<()> {
        if uid != 0 {
            return Err(Error::AccessDenied);
        }

        if self.ensure_superblock().is_err() {
            self.superblock = Some(Box::new(Superblock::new_empty()));
        }
        let Some(superblock) = self.superblock.as_mut() else {
            return Err(Error::UnknownError);
        };

        for (i, cluster) in superblock.fat.iter_mut().enumerate() {
            // The boot1/boot2 and FS metadata regions are never handed out.
            *cluster = if i < 64 || i >= SUPERBLOCK_START_CLUSTER as usize {
                CLUSTER_RESERVED
            } else {
                CLUSTER_UNUSED
            };
        }

        superblock.fst.fill(FstEntry::default());
        let root = &mut superblock.fst[0];
        root.set_name("/");
        root.mode = 0x16;
        root.sub = 0xFFFF;
        root.sib = 0xFFFF;

        for handle in &mut self.handles {
            handle.opened = false;
        }

        self.flush_superblock()
    }

    /// Create a file with the specified path and metadata.
    pub fn create_file(
        &mut self,
        fd: Fd,
        path: &str,
        attribute: u8,
        owner_mode: FileMode,
        group_mode: FileMode,
        other_mode: FileMode,
    ) -> Result<()> {
        self.create_file_or_directory(fd, path, attribute, owner_mode, group_mode, other_mode, true)
    }

    /// Create a directory with the specified path and metadata.
    pub fn create_directory(
        &mut self,
        fd: Fd,
        path: &str,
        attribute: u8,
        owner_mode: FileMode,
        group_mode: FileMode,
        other_mode: FileMode,
    ) -> Result<()> {
        self.create_file_or_directory(
            fd, path, attribute, owner_mode, group_mode, other_mode, false,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn create_file_or_directory(
        &mut self,
        fd: Fd,
        path: &str,
        attribute: u8,
        owner_mode: FileMode,
        group_mode: FileMode,
        other_mode: FileMode,
        is_file: bool,
    ) -> Result<()> {
        let handle = *self.handle(fd).ok_or(Error::Invalid)?;

        // Every byte, separators included, must be printable ASCII.
        if !is_valid_non_root_path(path)
            || path.bytes().any(|c| c.wrapping_sub(0x20) > 0x5E)
        {
            return Err(Error::Invalid);
        }

        if !is_file && path.bytes().filter(|&c| c == b'/').count() > 8 {
            return Err(Error::TooManyPathComponents);
        }

        self.ensure_superblock()?;
        let superblock = self.superblock.as_mut().ok_or(Error::SuperblockInitFailed)?;

        let (parent_path, file_name) = split_path(path);
        let parent_index = fst_index(superblock, parent_path).map_err(|_| Error::NotFound)?;

        if !has_permission(
            &superblock.fst[parent_index as usize],
            handle.uid,
            handle.gid,
            FileMode::WRITE,
        ) {
            return Err(Error::AccessDenied);
        }

        if child_index(superblock, parent_index, file_name).is_ok() {
            return Err(Error::AlreadyExists);
        }

        let child_idx = unused_fst_index(superblock)?;

        let parent_sub = superblock.fst[parent_index as usize].sub;
        let child = &mut superblock.fst[child_idx as usize];
        child.set_name(file_name);
        child.mode = if is_file { 1 } else { 2 };
        child.set_access_mode(owner_mode, group_mode, other_mode);
        child.uid = handle.uid;
        child.gid = handle.gid;
        child.size = 0;
        child.x3 = 0;
        child.attr = attribute;
        // New files have an empty chain; new directories have no children.
        child.sub = if is_file { CLUSTER_LAST_IN_CHAIN } else { 0xFFFF };
        child.sib = parent_sub;
        superblock.fst[parent_index as usize].sub = child_idx;

        self.flush_superblock()
    }

    /// Delete a file or directory with the specified path.
    ///
    /// Directories are deleted recursively. Fails with [`Error::InUse`]
    /// if the target (or any file beneath it) has an open descriptor.
    pub fn delete(&mut self, fd: Fd, path: &str) -> Result<()> {
        let handle = *self.handle(fd).ok_or(Error::Invalid)?;
        if !is_valid_non_root_path(path) {
            return Err(Error::Invalid);
        }

        self.ensure_superblock()?;
        let superblock = self.superblock.as_ref().ok_or(Error::SuperblockInitFailed)?;

        let (parent_path, file_name) = split_path(path);
        let parent = fst_index(superblock, parent_path).map_err(|_| Error::NotFound)?;

        if !has_permission(
            &superblock.fst[parent as usize],
            handle.uid,
            handle.gid,
            FileMode::WRITE,
        ) {
            return Err(Error::AccessDenied);
        }

        let index = child_index(superblock, parent, file_name).map_err(|_| Error::NotFound)?;

        let entry = superblock.fst[index as usize];
        let delete_directory = entry.is_directory() && !self.is_directory_in_use(superblock, index);
        let delete_file_entry = entry.is_file() && !self.is_file_opened(index);

        let superblock = self.superblock.as_mut().ok_or(Error::SuperblockInitFailed)?;
        if delete_directory {
            delete_directory_contents(superblock, index);
        } else if delete_file_entry {
            delete_file(superblock, index);
        } else {
            return Err(Error::InUse);
        }

        remove_fst_entry_from_chain(superblock, parent, index)?;

        self.flush_superblock()
    }

    /// Rename a file or directory.
    ///
    /// If an entry of the same kind already exists at `new_path`, it is
    /// deleted first. The renamed entry is prepended to the new parent's
    /// child list.
    pub fn rename(&mut self, fd: Fd, old_path: &str, new_path: &str) -> Result<()> {
        let handle = *self.handle(fd).ok_or(Error::Invalid)?;
        if !is_valid_non_root_path(old_path) || !is_valid_non_root_path(new_path) {
            return Err(Error::Invalid);
        }

        self.ensure_superblock()?;
        let superblock = self.superblock.as_ref().ok_or(Error::SuperblockInitFailed)?;

        let (old_parent_path, old_name) = split_path(old_path);
        let (new_parent_path, new_name) = split_path(new_path);

        let old_parent = fst_index(superblock, old_parent_path).map_err(|_| Error::NotFound)?;
        let new_parent = fst_index(superblock, new_parent_path).map_err(|_| Error::NotFound)?;

        if !has_permission(
            &superblock.fst[old_parent as usize],
            handle.uid,
            handle.gid,
            FileMode::WRITE,
        ) || !has_permission(
            &superblock.fst[new_parent as usize],
            handle.uid,
            handle.gid,
            FileMode::WRITE,
        ) {
            return Err(Error::AccessDenied);
        }

        let index = child_index(superblock, old_parent, old_name).map_err(|_| Error::NotFound)?;
        let entry = superblock.fst[index as usize];

        // Names are truncated to 12 bytes on disk, so a file rename that
        // agrees on the stored prefix is rejected as a no-op.
        let old_stored = &old_name.as_bytes()[..old_name.len().min(12)];
        let new_stored = &new_name.as_bytes()[..new_name.len().min(12)];
        if entry.is_file() && old_stored == new_stored {
            return Err(Error::Invalid);
        }

        if (entry.is_directory() && self.is_directory_in_use(superblock, index))
            || (entry.is_file() && self.is_file_opened(index))
        {
            return Err(Error::InUse);
        }

        // If there is already something of the same kind at the new path,
        // it will be deleted below.
        let new_index = child_index(superblock, new_parent, new_name).ok();
        let mut replace_directory = false;
        let mut replace_file = false;
        if let Some(new_index) = new_index {
            let target = superblock.fst[new_index as usize];
            if target.mode & 3 != entry.mode & 3 || new_index == index {
                return Err(Error::Invalid);
            }

            replace_directory =
                target.is_directory() && !self.is_directory_in_use(superblock, new_index);
            replace_file = target.is_file() && !self.is_file_opened(new_index);
            if !replace_directory && !replace_file {
                return Err(Error::InUse);
            }
        }

        let superblock = self.superblock.as_mut().ok_or(Error::SuperblockInitFailed)?;
        if let Some(new_index) = new_index {
            if replace_directory {
                delete_directory_contents(superblock, new_index);
            } else if replace_file {
                delete_file(superblock, new_index);
            }
            remove_fst_entry_from_chain(superblock, new_parent, new_index)?;
        }

        // Unlinking clears the mode byte; restore it once relinked.
        let saved_mode = superblock.fst[index as usize].mode;
        remove_fst_entry_from_chain(superblock, old_parent, index)?;

        let new_parent_sub = superblock.fst[new_parent as usize].sub;
        let entry = &mut superblock.fst[index as usize];
        entry.mode = saved_mode;
        entry.set_name(new_name);
        entry.sib = new_parent_sub;
        superblock.fst[new_parent as usize].sub = index;

        self.flush_superblock()
    }

    /// List the children of a directory (non-recursively), newest first.
    pub fn read_directory(&mut self, fd: Fd, path: &str) -> Result<Vec<String>> {
        let handle = *self.handle(fd).ok_or(Error::Invalid)?;
        if path.is_empty() || path.len() > 64 || !path.starts_with('/') {
            return Err(Error::Invalid);
        }

        self.ensure_superblock()?;
        let superblock = self.superblock.as_ref().ok_or(Error::SuperblockInitFailed)?;

        let index = fst_index(superblock, path).map_err(|_| Error::NotFound)?;

        if !has_permission(
            &superblock.fst[index as usize],
            handle.uid,
            handle.gid,
            FileMode::READ,
        ) {
            return Err(Error::AccessDenied);
        }

        if !superblock.fst[index as usize].is_directory() {
            return Err(Error::Invalid);
        }

        let mut children = Vec::new();
        let mut child = superblock.fst[index as usize].sub;
        while (child as usize) < FST_ENTRY_COUNT {
            children.push(superblock.fst[child as usize].name_lossy());
            child = superblock.fst[child as usize].sib;
        }
        Ok(children)
    }

    /// Get metadata about a file or directory.
    ///
    /// Root is always accessible; for any other path the caller needs
    /// Read on the parent directory (the entry itself is not checked).
    pub fn get_metadata(&mut self, fd: Fd, path: &str) -> Result<Metadata> {
        let handle = *self.handle(fd).ok_or(Error::Invalid)?;
        if path.is_empty() {
            return Err(Error::Invalid);
        }

        self.ensure_superblock()?;
        let superblock = self.superblock.as_ref().ok_or(Error::SuperblockInitFailed)?;

        let index = if path == "/" {
            0
        } else if is_valid_non_root_path(path) {
            let (parent_path, file_name) = split_path(path);

            let parent = fst_index(superblock, parent_path).map_err(|_| Error::NotFound)?;

            if !has_permission(
                &superblock.fst[parent as usize],
                handle.uid,
                handle.gid,
                FileMode::READ,
            ) {
                return Err(Error::AccessDenied);
            }

            child_index(superblock, parent, file_name).map_err(|_| Error::NotFound)?
        } else {
            return Err(Error::Invalid);
        };

        let entry = &superblock.fst[index as usize];
        Ok(Metadata {
            uid: entry.uid,
            gid: entry.gid,
            attribute: entry.attr,
            owner_mode: entry.owner_mode(),
            group_mode: entry.group_mode(),
            other_mode: entry.other_mode(),
            is_file: entry.is_file(),
            size: entry.size,
            fst_index: index,
        })
    }

    /// Set metadata for a file or directory.
    ///
    /// Only root or the current owner may change metadata, and an owner
    /// cannot give the entry away. Files must be empty.
    #[allow(clippy::too_many_arguments)]
    pub fn set_metadata(
        &mut self,
        fd: Fd,
        path: &str,
        uid: u32,
        gid: u16,
        attribute: u8,
        owner_mode: FileMode,
        group_mode: FileMode,
        other_mode: FileMode,
    ) -> Result<()> {
        let handle = *self.handle(fd).ok_or(Error::Invalid)?;
        if path.is_empty() || path.len() > 64 || !path.starts_with('/') {
            return Err(Error::Invalid);
        }

        self.ensure_superblock()?;
        let superblock = self.superblock.as_mut().ok_or(Error::SuperblockInitFailed)?;

        let index = fst_index(superblock, path).map_err(|_| Error::NotFound)?;
        let entry = &mut superblock.fst[index as usize];

        if handle.uid != 0 && handle.uid != entry.uid {
            return Err(Error::AccessDenied);
        }

        // Owners may update everything but the owner itself.
        if handle.uid != 0 && entry.uid != uid {
            return Err(Error::AccessDenied);
        }

        if entry.is_file() && entry.size != 0 {
            return Err(Error::FileNotEmpty);
        }

        entry.gid = gid;
        entry.uid = uid;
        entry.attr = attribute;
        entry.set_access_mode(owner_mode, group_mode, other_mode);

        self.flush_superblock()
    }

    /// Get usage information about the NAND (cluster and inode counts).
    pub fn get_nand_stats(&mut self, fd: Fd) -> Result<NandStats> {
        self.handle(fd).ok_or(Error::Invalid)?;

        self.ensure_superblock()?;
        let superblock = self.superblock.as_ref().ok_or(Error::SuperblockInitFailed)?;

        let mut stats = NandStats {
            cluster_size: CLUSTER_DATA_SIZE as u32,
            ..NandStats::default()
        };

        for &cluster in &superblock.fat {
            match cluster {
                CLUSTER_UNUSED | 0xFFFF => stats.free_clusters += 1,
                CLUSTER_RESERVED => stats.reserved_clusters += 1,
                CLUSTER_BAD_BLOCK => stats.bad_clusters += 1,
                _ => stats.used_clusters += 1,
            }
        }

        for entry in &superblock.fst {
            if entry.mode & 3 != 0 {
                stats.used_inodes += 1;
            } else {
                stats.free_inodes += 1;
            }
        }

        Ok(stats)
    }

    /// Get usage information about a directory (recursive cluster and
    /// inode counts).
    pub fn get_directory_stats(&mut self, fd: Fd, path: &str) -> Result<DirectoryStats> {
        self.handle(fd).ok_or(Error::Invalid)?;

        self.ensure_superblock()?;
        let superblock = self.superblock.as_ref().ok_or(Error::SuperblockInitFailed)?;

        // IOS folds the path checks into the superblock check here, so a
        // malformed path surfaces as SuperblockInitFailed.
        if path.is_empty() || path.len() > 64 || !path.starts_with('/') {
            return Err(Error::SuperblockInitFailed);
        }

        let index = fst_index(superblock, path).map_err(|_| Error::NotFound)?;

        if !superblock.fst[index as usize].is_directory() {
            return Err(Error::Invalid);
        }

        Ok(count_directory_recursively(superblock, index))
    }
}

/// Free every cluster used by a file and clear its FST entry.
/// A valid file FST index must be passed.
fn delete_file(superblock: &mut Superblock, file: u16) {
    let mut cluster = superblock.fst[file as usize].sub;
    while (cluster as usize) < CLUSTER_COUNT {
        debug!("delete_file: freeing cluster {cluster:#06x}");
        let next = superblock.fat[cluster as usize];
        superblock.fat[cluster as usize] = CLUSTER_UNUSED;
        cluster = next;
    }

    superblock.fst[file as usize].mode = 0;
}

/// Recursively delete all files in a directory (without flushing).
/// A valid directory FST index must be passed; contained files must all
/// be closed.
fn delete_directory_contents(superblock: &mut Superblock, directory: u16) {
    let mut child = superblock.fst[directory as usize].sub;
    while (child as usize) < FST_ENTRY_COUNT {
        if superblock.fst[child as usize].is_directory() {
            delete_directory_contents(superblock, child);
        } else {
            delete_file(superblock, child);
        }
        child = superblock.fst[child as usize].sib;
    }
}

/// Remove an FST entry (file or directory) from its parent's child chain
/// and clear its mode byte.
fn remove_fst_entry_from_chain(superblock: &mut Superblock, parent: u16, child: u16) -> Result<()> {
    // First case: the parent's sub points directly at the entry.
    //
    // +--------+  sub  +-------+  sib  +------+  sib
    // | parent |------>| child |------>| next |------> ...
    // +--------+       +-------+       +------+
    //
    // becomes
    //
    // +--------+  sub                  +------+  sib
    // | parent |---------------------->| next |------> ...
    // +--------+                       +------+
    if superblock.fst[parent as usize].sub == child {
        superblock.fst[parent as usize].sub = superblock.fst[child as usize].sib;
        superblock.fst[child as usize].mode = 0;
        return Ok(());
    }

    // Second case: the entry sits between two siblings; the previous
    // sibling's sib skips over it.
    let mut previous = superblock.fst[parent as usize].sub;
    if (previous as usize) >= FST_ENTRY_COUNT {
        return Err(Error::NotFound);
    }
    let mut index = superblock.fst[previous as usize].sib;
    while (index as usize) < FST_ENTRY_COUNT {
        if index == child {
            superblock.fst[previous as usize].sib = superblock.fst[child as usize].sib;
            superblock.fst[child as usize].mode = 0;
            return Ok(());
        }
        previous = index;
        index = superblock.fst[index as usize].sib;
    }

    Err(Error::NotFound)
}

fn count_directory_recursively(superblock: &Superblock, directory: u16) -> DirectoryStats {
    let mut stats = DirectoryStats {
        used_clusters: 0,
        used_inodes: 1, // one for the directory itself
    };

    let mut child = superblock.fst[directory as usize].sub;
    while (child as usize) < FST_ENTRY_COUNT {
        let entry = &superblock.fst[child as usize];
        if entry.is_file() {
            stats.used_clusters += entry.size.div_ceil(CLUSTER_DATA_SIZE as u32);
            stats.used_inodes += 1;
        } else {
            let inner = count_directory_recursively(superblock, child);
            stats.used_clusters += inner.used_clusters;
            stats.used_inodes += inner.used_inodes;
        }
        child = entry.sib;
    }
    stats
}
