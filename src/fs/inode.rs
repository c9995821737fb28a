//! Inodes.
//!
//! An inode describes a single unnamed file or directory: its type, size,
//! link count, and the list of direct data blocks holding its content.
//! Inodes are laid out sequentially on disk starting at the superblock's
//! inode region and are identified by a 1-based number; number 0 means
//! "none". An inode is live iff its bit in the inode bitmap is set, or, for
//! objects born in the current operation, iff the open transaction stages
//! its CREATE.
//!
//! Every mutation goes through the transaction: `get` returns a private
//! copy, the caller edits it, and `stage_save` puts the new image into the
//! transaction. Nothing here writes the device directly except `read_range`,
//! which reads committed state.

use core::mem;

use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use super::bitmap;
use super::tx::{Transaction, TxOp};
use super::Kfs;
use crate::bio::{BlockData, BlockDevice};
use crate::error::{Error, Result};
use crate::param::{BSIZE, NDIRECT};

/// On-disk inode structure, also used as the in-memory working copy.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct Inode {
    /// Inode number (1-based; 0 is "none")
    pub inum: u32,

    /// 1 for directories; `bool` has no stable disk representation
    is_directory: u32,

    /// Size of file (bytes)
    pub size: u32,

    /// Number of valid entries in `addrs`
    pub(crate) naddrs: u32,

    /// Direct data block addresses
    pub(crate) addrs: [u32; NDIRECT],

    /// Number of links to inode in file system
    pub nlink: u32,
}

pub(crate) const INODE_SIZE: usize = mem::size_of::<Inode>();

/// Inodes per block.
pub(crate) const IPB: usize = BSIZE / INODE_SIZE;

const_assert!(IPB >= 1);
const_assert!(INODE_SIZE == 20 + 4 * NDIRECT);

impl Inode {
    pub(crate) fn new(inum: u32, is_directory: bool) -> Inode {
        Inode {
            inum,
            is_directory: is_directory as u32,
            size: 0,
            naddrs: 0,
            addrs: [0; NDIRECT],
            nlink: if is_directory { 1 } else { 0 },
        }
    }

    pub fn is_dir(&self) -> bool {
        self.is_directory != 0
    }

    /// Data block index of the `i`th content block.
    pub(crate) fn addr(&self, i: u32) -> Result<u32> {
        if i < self.naddrs {
            Ok(self.addrs[i as usize])
        } else {
            Err(Error::Corrupt)
        }
    }

    /// The data blocks currently owned by this inode.
    pub(crate) fn blocks(&self) -> impl Iterator<Item = u32> + '_ {
        self.addrs[..self.naddrs as usize].iter().copied()
    }

    fn decode(buf: &BlockData, offset: usize) -> Inode {
        let mut node = Inode::new(0, false);
        node.as_bytes_mut()
            .copy_from_slice(&buf[offset..offset + INODE_SIZE]);
        node
    }
}

impl core::fmt::Debug for Inode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "inode_number: {}, is_directory: {}, sz: {}, naddrs: {}, link_count: {}",
            self.inum,
            self.is_dir(),
            self.size,
            self.naddrs,
            self.nlink
        )
    }
}

impl<D: BlockDevice> Kfs<D> {
    /// Load inode `inum` if it is live on disk. The returned struct is a
    /// private copy.
    pub(crate) fn inode(&mut self, inum: u32) -> Result<Option<Inode>> {
        if inum == 0 || inum > self.sb.num_inodes {
            return Ok(None);
        }
        if !bitmap::check_bit(&mut self.dev, self.sb.inode_bitmap(), inum - 1)? {
            return Ok(None);
        }
        let mut buf: BlockData = [0; BSIZE];
        self.dev.read(self.sb.iblock(inum), &mut buf)?;
        let node = Inode::decode(&buf, self.sb.ioffset(inum));
        if node.inum != inum || node.naddrs > NDIRECT as u32 {
            return Err(Error::Corrupt);
        }
        Ok(Some(node))
    }

    pub(crate) fn inode_required(&mut self, inum: u32) -> Result<Inode> {
        self.inode(inum)?.ok_or(Error::NotFound)
    }

    /// Allocate an inode number and stage the new inode's CREATE.
    /// The bitmap bit flips at commit, not here.
    pub(crate) fn stage_inode_create(
        &mut self,
        tx: &mut Transaction,
        is_directory: bool,
    ) -> Result<Inode> {
        let index = bitmap::find_free(&mut self.dev, self.sb.inode_bitmap(), |i| {
            tx.creates_inode(i + 1)
        })?;
        let node = Inode::new(index + 1, is_directory);
        tx.stage_inode(&node, TxOp::Create)?;
        Ok(node)
    }

    /// Stage the full image of a live inode.
    pub(crate) fn stage_inode_save(&mut self, tx: &mut Transaction, node: &Inode) -> Result<()> {
        if !self.inode_live(tx, node.inum)? {
            return Err(Error::NotFound);
        }
        tx.stage_inode(node, TxOp::Modify)
    }

    /// Drop one link. Directories also lose the link held by their own "."
    /// record, which the caller removes alongside. When the count reaches
    /// zero the inode and all its data blocks are staged for deletion.
    pub(crate) fn stage_inode_drop(&mut self, tx: &mut Transaction, node: &mut Inode) -> Result<()> {
        if node.is_dir() {
            node.nlink = node.nlink.saturating_sub(1);
        }
        node.nlink = node.nlink.saturating_sub(1);
        if node.nlink > 0 {
            return tx.stage_inode(node, TxOp::Modify);
        }
        tx.stage_inode(node, TxOp::Delete)?;
        for addr in node.blocks() {
            tx.stage_block(addr, None, TxOp::Delete)?;
        }
        Ok(())
    }

    fn inode_live(&mut self, tx: &Transaction, inum: u32) -> Result<bool> {
        if tx.creates_inode(inum) {
            return Ok(true);
        }
        if inum == 0 || inum > self.sb.num_inodes {
            return Ok(false);
        }
        bitmap::check_bit(&mut self.dev, self.sb.inode_bitmap(), inum - 1)
    }

    /// Grow or shrink the inode's direct-block list to `nblocks` blocks.
    /// New blocks are staged as zero-filled CREATEs; discarded ones as
    /// DELETEs.
    pub(crate) fn resize(
        &mut self,
        tx: &mut Transaction,
        node: &mut Inode,
        nblocks: u32,
    ) -> Result<()> {
        if nblocks > NDIRECT as u32 {
            return Err(Error::TooBig);
        }
        while node.naddrs < nblocks {
            let index = bitmap::find_free(&mut self.dev, self.sb.block_bitmap(), |i| {
                tx.creates_block(i)
            })?;
            tx.stage_block(index, Some(&[0; BSIZE]), TxOp::Create)?;
            node.addrs[node.naddrs as usize] = index;
            node.naddrs += 1;
        }
        while node.naddrs > nblocks {
            tx.stage_block(node.addrs[node.naddrs as usize - 1], None, TxOp::Delete)?;
            node.addrs[node.naddrs as usize - 1] = 0;
            node.naddrs -= 1;
        }
        Ok(())
    }

    /// Copy `buf` into the inode's content at byte offset `start`, growing
    /// the block list as needed and staging one MODIFY per touched block.
    /// Returns the number of bytes written.
    ///
    /// Each touched block is staged as a full image with the bytes outside
    /// the range zero-filled, matching the block images a fresh write
    /// produces; callers only ever write a file front to back.
    pub(crate) fn write_range(
        &mut self,
        tx: &mut Transaction,
        node: &mut Inode,
        buf: &[u8],
        start: u32,
    ) -> Result<u32> {
        let n = buf.len() as u32;
        if n == 0 {
            return Ok(0);
        }
        let first = start / BSIZE as u32;
        let last = (start + n - 1) / BSIZE as u32;
        if last + 1 > node.naddrs {
            self.resize(tx, node, last + 1)?;
        }

        let mut copied = 0usize;
        for bn in first..=last {
            let mut image: BlockData = [0; BSIZE];
            let begin = if bn == first {
                start as usize % BSIZE
            } else {
                0
            };
            let end = if bn == last {
                (start + n - 1) as usize % BSIZE + 1
            } else {
                BSIZE
            };
            image[begin..end].copy_from_slice(&buf[copied..copied + (end - begin)]);
            self.stage_data_write(tx, node.addr(bn)?, &image)?;
            copied += end - begin;
        }

        if start + n > node.size {
            node.size = start + n;
        }
        self.stage_inode_save(tx, node)?;
        Ok(copied as u32)
    }

    /// Copy the inode's content at byte offset `start` into `buf`. Reads go
    /// straight to the device and do not see uncommitted writes.
    pub(crate) fn read_range(&mut self, node: &Inode, buf: &mut [u8], start: u32) -> Result<u32> {
        let n = buf.len() as u32;
        if n == 0 {
            return Ok(0);
        }
        let first = start / BSIZE as u32;
        let last = (start + n - 1) / BSIZE as u32;

        let mut copied = 0usize;
        let mut block: BlockData = [0; BSIZE];
        for bn in first..=last {
            self.read_data_block(node.addr(bn)?, &mut block)?;
            let begin = if bn == first {
                start as usize % BSIZE
            } else {
                0
            };
            let end = if bn == last {
                (start + n - 1) as usize % BSIZE + 1
            } else {
                BSIZE
            };
            buf[copied..copied + (end - begin)].copy_from_slice(&block[begin..end]);
            copied += end - begin;
        }
        Ok(copied as u32)
    }

    /// Stage a MODIFY of data block `index`. The block must be live on disk
    /// or created by this transaction.
    pub(crate) fn stage_data_write(
        &mut self,
        tx: &mut Transaction,
        index: u32,
        data: &BlockData,
    ) -> Result<()> {
        let live = tx.creates_block(index)
            || bitmap::check_bit(&mut self.dev, self.sb.block_bitmap(), index)?;
        if !live {
            return Err(Error::NotFound);
        }
        tx.stage_block(index, Some(data), TxOp::Modify)
    }

    /// Read live data block `index` through the device.
    pub(crate) fn read_data_block(&mut self, index: u32, data: &mut BlockData) -> Result<()> {
        if !bitmap::check_bit(&mut self.dev, self.sb.block_bitmap(), index)? {
            return Err(Error::NotFound);
        }
        self.dev.read(self.sb.data_block(index), data)
    }
}
