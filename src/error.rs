//! Error kinds for every fallible filesystem operation.
//!
//! Internal code propagates these with `?` and never recovers; the VFS
//! boundary collapses them to the kernel's 0/-1 convention after logging
//! the kind.

/// What went wrong. One variant per failure class the filesystem can
/// detect; I/O faults from the block device are folded into `Io`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// No free inode or data block left.
    NoSpace,
    /// Named entry or referenced object does not exist.
    NotFound,
    /// Directory entry with this name already exists.
    Exists,
    /// Operation requires a directory but the target is a file.
    NotADirectory,
    /// Operation requires a file but the target is a directory.
    IsADirectory,
    /// Directory still has entries besides "." and "..".
    NotEmpty,
    /// File name exceeds `FILENAME_MAX` or is malformed.
    NameTooLong,
    /// Resize past the direct-block limit, or transaction overflow.
    TooBig,
    /// File handle not opened for this access.
    BadMode,
    /// Block device failure.
    Io,
    /// On-disk state violates a filesystem invariant.
    Corrupt,
}

pub type Result<T> = core::result::Result<T, Error>;
