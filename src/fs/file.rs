//! File descriptors, file I/O and the single-slot write-back cache.

use log::debug;

use crate::fs::{Fd, FileMode, FileStatus, FileSystem, INTERNAL_FD, SeekMode};
use crate::fs::low_level::fst_index;
use crate::fs::path::{has_permission, is_valid_non_root_path};
use crate::sffs::{CLUSTER_DATA_SIZE, FST_ENTRY_COUNT, Superblock};
use crate::{Error, Result};

/// One slot of the descriptor table.
///
/// `file_size` is a snapshot taken at open time and only updated by
/// writes through this handle. If the same file is opened twice and the
/// second handle grows it, the first handle cannot read past the size it
/// captured.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Handle {
    pub opened: bool,
    pub fst_index: u16,
    pub uid: u32,
    pub gid: u16,
    pub mode: FileMode,
    pub file_offset: u32,
    pub file_size: u32,
    pub superblock_flush_needed: bool,
}

impl Default for Handle {
    fn default() -> Self {
        Self {
            opened: false,
            fst_index: 0xFFFF,
            uid: 0,
            gid: 0,
            mode: FileMode::empty(),
            file_offset: 0,
            file_size: 0,
            superblock_flush_needed: false,
        }
    }
}

impl Handle {
    /// The always-open internal handle; uid 0, bound to no file.
    pub(crate) fn internal() -> Self {
        Self {
            opened: true,
            ..Self::default()
        }
    }
}

/// The driver-wide single-slot file cache.
///
/// Holds at most one cluster of one handle's file. `for_write` marks the
/// slot dirty; switching to a different (handle, cluster) pair flushes
/// first.
#[derive(Default)]
pub(crate) struct FileCache {
    pub fd: Option<Fd>,
    pub chain_index: u16,
    pub data: Vec<u8>,
    pub for_write: bool,
}

impl<'n> FileSystem<'n> {
    /// Get a file descriptor for using file system functions.
    pub fn open_fs(&mut self, uid: u32, gid: u16) -> Result<Fd> {
        self.assign_free_handle(uid, gid).ok_or(Error::NoFreeHandle)
    }

    /// Get a file descriptor for accessing the file at `path`.
    ///
    /// `mode` must be Read, Write or both, and the entry's permissions
    /// must grant it to this uid/gid.
    pub fn open_file(&mut self, uid: u32, gid: u16, path: &str, mode: FileMode) -> Result<Fd> {
        if !is_valid_non_root_path(path) || mode.is_empty() {
            return Err(Error::Invalid);
        }

        self.ensure_superblock()?;
        let superblock = self.superblock.as_ref().ok_or(Error::SuperblockInitFailed)?;

        let index = fst_index(superblock, path).map_err(|_| Error::NotFound)?;
        let entry = superblock.fst[index as usize];

        if !entry.is_file() {
            return Err(Error::Invalid);
        }

        if !has_permission(&entry, uid, gid, mode) {
            return Err(Error::AccessDenied);
        }

        let fd = self.assign_free_handle(uid, gid).ok_or(Error::NoFreeHandle)?;
        let Some(handle) = self.handle_mut(fd) else {
            return Err(Error::UnknownError);
        };
        handle.fst_index = index;
        handle.mode = mode;
        handle.file_offset = 0;
        handle.file_size = entry.size;
        Ok(fd)
    }

    /// Close a file descriptor, flushing the cache and (if needed) the
    /// superblock.
    pub fn close(&mut self, fd: Fd) -> Result<()> {
        let handle = *self.handle(fd).ok_or(Error::Invalid)?;

        if self.cache.fd == Some(fd) {
            self.flush_file_cache()?;
            self.cache.fd = None;
            self.cache.data.clear();
        }

        if handle.superblock_flush_needed {
            self.flush_superblock()?;
        }

        *self.handle_raw_mut(fd).ok_or(Error::Invalid)? = Handle::default();
        Ok(())
    }

    /// Read up to `buf.len()` bytes at the current offset. Returns the
    /// number of bytes read, which is clamped to the remaining file size.
    pub fn read_file(&mut self, fd: Fd, buf: &mut [u8]) -> Result<u32> {
        let handle = *self.handle(fd).ok_or(Error::Invalid)?;
        if handle.fst_index as usize >= FST_ENTRY_COUNT {
            return Err(Error::Invalid);
        }

        if !handle.mode.contains(FileMode::READ) {
            return Err(Error::AccessDenied);
        }

        let mut count = buf.len() as u32;
        if count > handle.file_size - handle.file_offset {
            count = handle.file_size - handle.file_offset;
        }

        let mut processed: u32 = 0;
        while processed != count {
            let offset = self.handle_raw(fd).ok_or(Error::Invalid)?.file_offset;
            self.populate_file_cache(fd, offset, false)?;

            let start = (offset - u32::from(self.cache.chain_index) * CLUSTER_DATA_SIZE as u32)
                as usize;
            let copy_length =
                (self.cache.data.len() - start).min((count - processed) as usize);

            buf[processed as usize..processed as usize + copy_length]
                .copy_from_slice(&self.cache.data[start..start + copy_length]);
            self.handle_raw_mut(fd).ok_or(Error::Invalid)?.file_offset += copy_length as u32;
            processed += copy_length as u32;
        }
        Ok(count)
    }

    /// Write `buf` at the current offset, growing the file as needed.
    /// Returns the number of bytes written.
    pub fn write_file(&mut self, fd: Fd, buf: &[u8]) -> Result<u32> {
        let handle = *self.handle(fd).ok_or(Error::Invalid)?;
        if handle.fst_index as usize >= FST_ENTRY_COUNT {
            return Err(Error::Invalid);
        }

        if !handle.mode.contains(FileMode::WRITE) {
            return Err(Error::AccessDenied);
        }

        let count = buf.len() as u32;
        let mut processed: u32 = 0;
        while processed != count {
            let offset = self.handle_raw(fd).ok_or(Error::Invalid)?.file_offset;
            self.populate_file_cache(fd, offset, true)?;

            let start = (offset - u32::from(self.cache.chain_index) * CLUSTER_DATA_SIZE as u32)
                as usize;
            let copy_length =
                (self.cache.data.len() - start).min((count - processed) as usize);

            self.cache.data[start..start + copy_length]
                .copy_from_slice(&buf[processed as usize..processed as usize + copy_length]);
            processed += copy_length as u32;

            let handle = self.handle_raw_mut(fd).ok_or(Error::Invalid)?;
            handle.file_offset += copy_length as u32;
            handle.file_size = handle.file_size.max(handle.file_offset);
        }
        Ok(count)
    }

    /// Reposition the file offset. The new position may not exceed the
    /// handle's file size (this differs from POSIX, which allows seeking
    /// past the end).
    pub fn seek_file(&mut self, fd: Fd, offset: u32, mode: SeekMode) -> Result<u32> {
        let handle = *self.handle(fd).ok_or(Error::Invalid)?;
        if handle.fst_index as usize >= FST_ENTRY_COUNT {
            return Err(Error::Invalid);
        }

        let new_position = match mode {
            SeekMode::Set => offset,
            SeekMode::Current => handle.file_offset.wrapping_add(offset),
            SeekMode::End => handle.file_size.wrapping_add(offset),
        };

        if handle.file_size < new_position {
            return Err(Error::Invalid);
        }

        self.handle_mut(fd).ok_or(Error::Invalid)?.file_offset = new_position;
        Ok(new_position)
    }

    /// Get the current offset and size for an open file.
    pub fn get_file_status(&mut self, fd: Fd) -> Result<FileStatus> {
        let handle = *self.handle(fd).ok_or(Error::Invalid)?;
        if handle.fst_index as usize >= FST_ENTRY_COUNT {
            return Err(Error::Invalid);
        }

        if !handle.mode.contains(FileMode::READ) {
            return Err(Error::AccessDenied);
        }

        Ok(FileStatus {
            offset: handle.file_offset,
            size: handle.file_size,
        })
    }

    /// Bind the cache to (`fd`, cluster containing `offset`), flushing
    /// whatever it held before.
    ///
    /// A block-aligned offset right at the end of the file binds a fresh
    /// zero-filled cluster (file extension); anything else reads the
    /// existing cluster.
    pub(crate) fn populate_file_cache(&mut self, fd: Fd, offset: u32, write: bool) -> Result<()> {
        let chain_index = (offset / CLUSTER_DATA_SIZE as u32) as u16;
        if self.cache.fd == Some(fd) && self.cache.chain_index == chain_index {
            return Ok(());
        }

        self.flush_file_cache()?;

        self.cache.fd = Some(fd);
        self.cache.chain_index = chain_index;
        self.cache.for_write = write;

        let handle = *self.handle_raw(fd).ok_or(Error::Invalid)?;
        if offset % CLUSTER_DATA_SIZE as u32 == 0 && offset == handle.file_size {
            debug!("populate_file_cache: returning new cluster");
            self.cache.data = vec![0; CLUSTER_DATA_SIZE];
        } else {
            debug!("populate_file_cache: reading file");
            self.cache.data = self.read_file_data(handle.fst_index, chain_index)?;
        }

        Ok(())
    }

    /// Write the cache slot back if it is dirty. On success the owning
    /// handle is marked as needing a superblock flush at close.
    pub(crate) fn flush_file_cache(&mut self) -> Result<()> {
        let Some(fd) = self.cache.fd else {
            return Ok(());
        };
        if !self.cache.for_write || self.cache.data.len() != CLUSTER_DATA_SIZE {
            return Ok(());
        }

        debug!("flushing file cache");
        let handle = *self.handle_raw(fd).ok_or(Error::Invalid)?;
        let chain_index = self.cache.chain_index;
        let data = std::mem::take(&mut self.cache.data);
        let result =
            self.write_file_data(handle.fst_index, &data, chain_index, handle.file_size);
        self.cache.data = data;

        if result.is_ok() {
            self.handle_raw_mut(fd).ok_or(Error::Invalid)?.superblock_flush_needed = true;
        }
        result
    }

    /// Claim the first unopened descriptor slot. The fd is the slot
    /// index.
    pub(crate) fn assign_free_handle(&mut self, uid: u32, gid: u16) -> Option<Fd> {
        let slot = self.handles.iter().position(|handle| !handle.opened)?;
        self.handles[slot] = Handle {
            opened: true,
            uid,
            gid,
            ..Handle::default()
        };
        Some(slot as Fd)
    }

    /// Resolve a descriptor, requiring public slots to be open. The
    /// internal descriptor always resolves.
    pub(crate) fn handle(&self, fd: Fd) -> Option<&Handle> {
        if fd == INTERNAL_FD {
            return Some(&self.internal_handle);
        }
        let slot = self.handles.get(fd as usize)?;
        slot.opened.then_some(slot)
    }

    pub(crate) fn handle_mut(&mut self, fd: Fd) -> Option<&mut Handle> {
        if fd == INTERNAL_FD {
            return Some(&mut self.internal_handle);
        }
        let slot = self.handles.get_mut(fd as usize)?;
        slot.opened.then_some(slot)
    }

    /// Resolve a descriptor without the opened check. Cache bindings
    /// outlive their handle's opened flag (a format closes all handles
    /// but does not touch the cache), so cache maintenance goes through
    /// this accessor.
    pub(crate) fn handle_raw(&self, fd: Fd) -> Option<&Handle> {
        if fd == INTERNAL_FD {
            return Some(&self.internal_handle);
        }
        self.handles.get(fd as usize)
    }

    pub(crate) fn handle_raw_mut(&mut self, fd: Fd) -> Option<&mut Handle> {
        if fd == INTERNAL_FD {
            return Some(&mut self.internal_handle);
        }
        self.handles.get_mut(fd as usize)
    }

    /// Check if a file has an open descriptor.
    pub(crate) fn is_file_opened(&self, fst_index: u16) -> bool {
        self.handles
            .iter()
            .any(|handle| handle.opened && handle.fst_index == fst_index)
    }

    /// Recursively check if any file in a directory has an open
    /// descriptor. A valid directory FST index must be passed.
    pub(crate) fn is_directory_in_use(&self, superblock: &Superblock, directory: u16) -> bool {
        let mut child = superblock.fst[directory as usize].sub;
        while (child as usize) < FST_ENTRY_COUNT {
            let entry = &superblock.fst[child as usize];
            if entry.is_file() {
                if self.is_file_opened(child) {
                    return true;
                }
            } else if self.is_directory_in_use(superblock, child) {
                return true;
            }
            child = entry.sib;
        }
        false
    }
}
