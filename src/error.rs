//! Library-wide error and result types.

use std::fmt;

/// Result alias used throughout nandkit.
pub type Result<T> = std::result::Result<T, Error>;

/// All errors the driver can produce.
///
/// These correspond one-to-one to the result codes returned by the Wii's
/// FS IOS module, so callers emulating IOS can map them back without a
/// translation table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A malformed argument: bad path, bad descriptor, bad cluster index,
    /// or an operation that does not apply to the target entry.
    Invalid,
    /// The caller's uid/gid does not grant the requested access mode.
    AccessDenied,
    /// No superblock replica could be written.
    SuperblockWriteFailed,
    /// No valid superblock could be found on the NAND.
    SuperblockInitFailed,
    /// An entry with the same name already exists in the parent directory.
    AlreadyExists,
    /// The path does not resolve to an entry.
    NotFound,
    /// Every FST entry is in use.
    FstFull,
    /// Every data cluster is in use.
    NoFreeSpace,
    /// All 16 file descriptors are open.
    NoFreeHandle,
    /// Directory creation with a path deeper than 8 components.
    TooManyPathComponents,
    /// The entry (or a file inside it) has an open descriptor.
    InUse,
    /// The cluster is marked as a bad block.
    BadBlock,
    /// A correctable ECC error was detected.
    EccError,
    /// An uncorrectable ECC error was detected.
    CriticalEccError,
    /// Metadata changes require the file to be empty.
    FileNotEmpty,
    /// The cluster data did not match either stored HMAC copy.
    CheckFailed,
    /// An unexpected internal failure.
    UnknownError,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Invalid => write!(f, "invalid argument"),
            Error::AccessDenied => write!(f, "access denied"),
            Error::SuperblockWriteFailed => write!(f, "failed to write superblock"),
            Error::SuperblockInitFailed => write!(f, "no valid superblock"),
            Error::AlreadyExists => write!(f, "entry already exists"),
            Error::NotFound => write!(f, "entry not found"),
            Error::FstFull => write!(f, "no free FST entry"),
            Error::NoFreeSpace => write!(f, "no free cluster"),
            Error::NoFreeHandle => write!(f, "no free file descriptor"),
            Error::TooManyPathComponents => write!(f, "too many path components"),
            Error::InUse => write!(f, "entry is in use"),
            Error::BadBlock => write!(f, "bad block"),
            Error::EccError => write!(f, "correctable ECC error"),
            Error::CriticalEccError => write!(f, "uncorrectable ECC error"),
            Error::FileNotEmpty => write!(f, "file is not empty"),
            Error::CheckFailed => write!(f, "HMAC verification failed"),
            Error::UnknownError => write!(f, "unknown error"),
        }
    }
}

impl std::error::Error for Error {}
