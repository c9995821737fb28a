//! kfs: a small transactional block filesystem for a teaching kernel.
//!
//! The crate sits directly above a raw block device and exposes a
//! hierarchical file/directory namespace through a VFS-style adapter.
//! Layers, bottom up:
//!   + `bio`: read/write one aligned block through the `BlockDevice` seam.
//!   + `fs::bitmap`: liveness bitmaps for inodes and data blocks.
//!   + `fs::tx`: per-operation transactions; staging, collapse, commit.
//!   + `fs::inode` / `fs::dir`: inode records, packed linked directories.
//!   + `fs` / `vfs`: path-level operations and the 0/-1 operation table.
//!
//! The surrounding kernel provides the allocator and the disk driver; the
//! crate is `no_std` + `alloc` and holds no locks (single-threaded
//! cooperative scheduling, one operation at a time).

#![no_std]
#![deny(anonymous_parameters)]
#![deny(trivial_numeric_casts)]
#![deny(unused_import_braces)]

extern crate alloc;

pub mod bio;
mod error;
mod file;
mod fs;
pub mod param;
mod vfs;

pub use error::{Error, Result};
pub use file::{File, FileMode};
pub use fs::{FileName, Inode, Kfs, Superblock, Transaction};
pub use vfs::{Dirent, Filesystem, Volume};
