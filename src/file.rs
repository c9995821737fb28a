//! Open-file handles.
//!
//! A `File` carries its own copy of the inode, a byte offset, and the mode
//! bits it was opened with. The copy is updated by reads and writes through
//! this handle; it is not refreshed from other handles (the file layer is
//! single-threaded cooperative, one operation at a time).

use bitflags::bitflags;

use crate::fs::Inode;

bitflags! {
    /// Access bits checked on every read/write.
    pub struct FileMode: u8 {
        const READ = 0x1;
        const WRITE = 0x2;
    }
}

/// An open file: borrowed inode state plus cursor and mode.
#[derive(Debug)]
pub struct File {
    pub(crate) inode: Inode,
    pub(crate) offset: u32,
    pub(crate) mode: FileMode,
}

impl File {
    pub(crate) fn new(inode: Inode, mode: FileMode) -> File {
        File {
            inode,
            offset: 0,
            mode,
        }
    }

    /// Current size of the underlying inode, as this handle sees it.
    pub fn size(&self) -> u32 {
        self.inode.size
    }

    /// Current cursor position.
    pub fn offset(&self) -> u32 {
        self.offset
    }
}
