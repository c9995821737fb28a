use core::mem;

use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use super::bitmap::{Bitmap, BPB};
use super::inode::IPB;
use crate::bio::BlockData;
use crate::error::{Error, Result};
use crate::param::{div_ceil, BSIZE, FS_MAGIC};

/// Disk layout:
/// [ super block | inode bit map | inode blocks | free bit map | data blocks ]
///
/// `format` computes the super block and builds an initial file system. The
/// super block describes the disk layout:
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, AsBytes, FromBytes)]
pub struct Superblock {
    /// Must be FS_MAGIC
    magic: u32,

    /// Block size in bytes; must be BSIZE
    blocksize: u32,

    /// Number of data blocks
    pub num_free_blocks: u32,

    /// Number of inodes
    pub num_inodes: u32,

    /// Block number of first inode bit map block
    inode_bitmap_start: u32,

    /// Block number of first inode block
    inode_start: u32,

    /// Block number of first free map block
    block_bitmap_start: u32,

    /// Block number of first data block
    free_block_start: u32,
}

const_assert!(mem::size_of::<Superblock>() <= BSIZE);

impl Superblock {
    /// Decode and validate the super block read from block 0.
    pub fn new(buf: &BlockData, nblocks: u32) -> Result<Superblock> {
        let mut sb = Superblock::zeroed();
        let len = mem::size_of::<Superblock>();
        sb.as_bytes_mut().copy_from_slice(&buf[..len]);

        if sb.magic != FS_MAGIC || sb.blocksize != BSIZE as u32 {
            return Err(Error::Corrupt);
        }
        let inode_bitmap_blocks = div_ceil(sb.num_inodes, BPB);
        let inode_blocks = div_ceil(sb.num_inodes, IPB as u32);
        let block_bitmap_blocks = div_ceil(sb.num_free_blocks, BPB);
        let regions_ok = sb.inode_bitmap_start == 1
            && sb.inode_start == sb.inode_bitmap_start + inode_bitmap_blocks
            && sb.block_bitmap_start == sb.inode_start + inode_blocks
            && sb.free_block_start == sb.block_bitmap_start + block_bitmap_blocks
            && sb.free_block_start + sb.num_free_blocks <= nblocks;
        if !regions_ok || sb.num_inodes == 0 || sb.num_free_blocks == 0 {
            return Err(Error::Corrupt);
        }
        Ok(sb)
    }

    /// Compute the layout for a device of `nblocks` blocks.
    ///
    /// One inode per four blocks; each region is sized to hold exactly its
    /// bitmap or table, and the data region takes the remainder.
    pub fn format(nblocks: u32) -> Result<Superblock> {
        let num_inodes = nblocks / 4;
        if num_inodes == 0 {
            return Err(Error::NoSpace);
        }
        let inode_bitmap_start = 1;
        let inode_start = inode_bitmap_start + div_ceil(num_inodes, BPB);
        let block_bitmap_start = inode_start + div_ceil(num_inodes, IPB as u32);
        let remaining = nblocks
            .checked_sub(block_bitmap_start)
            .ok_or(Error::NoSpace)?;
        // remaining = bitmap blocks + data blocks
        let block_bitmap_blocks = div_ceil(remaining, BPB + 1);
        let num_free_blocks = remaining - block_bitmap_blocks;
        if num_free_blocks == 0 {
            return Err(Error::NoSpace);
        }
        Ok(Superblock {
            magic: FS_MAGIC,
            blocksize: BSIZE as u32,
            num_free_blocks,
            num_inodes,
            inode_bitmap_start,
            inode_start,
            block_bitmap_start,
            free_block_start: block_bitmap_start + block_bitmap_blocks,
        })
    }

    /// Encode into a block image for block 0.
    pub fn write_to(&self, buf: &mut BlockData) {
        let len = mem::size_of::<Superblock>();
        buf[..len].copy_from_slice(self.as_bytes());
    }

    /// Block containing inode i
    pub const fn iblock(self, inum: u32) -> u32 {
        self.inode_start + (inum - 1) / IPB as u32
    }

    /// Byte offset of inode i within its block
    pub const fn ioffset(self, inum: u32) -> usize {
        (inum as usize - 1) % IPB * super::inode::INODE_SIZE
    }

    /// Device block holding data block `index`.
    pub const fn data_block(self, index: u32) -> u32 {
        self.free_block_start + index
    }

    pub fn inode_bitmap(&self) -> Bitmap {
        Bitmap {
            start: self.inode_bitmap_start,
            nbits: self.num_inodes,
        }
    }

    pub fn block_bitmap(&self) -> Bitmap {
        Bitmap {
            start: self.block_bitmap_start,
            nbits: self.num_free_blocks,
        }
    }

    const fn zeroed() -> Superblock {
        Superblock {
            magic: 0,
            blocksize: 0,
            num_free_blocks: 0,
            num_inodes: 0,
            inode_bitmap_start: 0,
            inode_start: 0,
            block_bitmap_start: 0,
            free_block_start: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;

    #[test]
    fn format_one_mib_device() {
        // 1 MiB = 256 blocks: 64 inodes, both bitmaps fit one block, and the
        // inode table needs two.
        let sb = Superblock::format(256).unwrap();
        assert_eq!(sb.num_inodes, 64);
        assert_eq!(sb.inode_bitmap_start, 1);
        assert_eq!(sb.inode_start, 2);
        assert_eq!(sb.block_bitmap_start, 4);
        assert_eq!(sb.free_block_start, 5);
        assert_eq!(sb.num_free_blocks, 251);
    }

    #[test]
    fn field_offsets_match_the_disk_format() {
        let sb = Superblock::format(256).unwrap();
        let mut buf = [0u8; BSIZE];
        sb.write_to(&mut buf);
        let word = |off: usize| u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]]);
        assert_eq!(word(0), FS_MAGIC);
        assert_eq!(word(4), BSIZE as u32);
        assert_eq!(word(8), sb.num_free_blocks);
        assert_eq!(word(12), sb.num_inodes);
        assert_eq!(word(16), 1);
        assert_eq!(word(20), 2);
        assert_eq!(word(24), 4);
        assert_eq!(word(28), 5);
    }

    #[test]
    fn mount_rejects_bad_magic() {
        let sb = Superblock::format(256).unwrap();
        let mut buf = [0u8; BSIZE];
        sb.write_to(&mut buf);
        buf[0] ^= 0xff;
        assert_eq!(Superblock::new(&buf, 256), Err(Error::Corrupt));
    }

    #[test]
    fn mount_rejects_truncated_device() {
        let sb = Superblock::format(256).unwrap();
        let mut buf = [0u8; BSIZE];
        sb.write_to(&mut buf);
        assert_eq!(Superblock::new(&buf, 128), Err(Error::Corrupt));
    }
}
