//! Per-operation write-ahead transactions.
//!
//! Every mutation of inodes and data blocks is staged as an entry here and
//! reaches the device only through `commit`. Dropping an uncommitted
//! `Transaction` is the rollback path: staging never writes, so there is
//! nothing to undo. A later stage on a target that already has an entry
//! collapses with it, keeping at most one effective entry per
//! (kind, number).
//!
//! Commit applies entries in two phases:
//!   Phase A: set the bitmap bit of every CREATE.
//!   Phase B: in stage order, write inode records and block payloads;
//!            DELETE clears the bitmap bit instead.
//! A crash between the phases can leave a live but uninitialised object,
//! and a crash during Phase B can leave dangling references; real recovery
//! needs a log region separate from the live ones and is not implemented.

use alloc::boxed::Box;
use arrayvec::ArrayVec;

use super::bitmap;
use super::inode::Inode;
use super::superblock::Superblock;
use crate::bio::{BlockData, BlockDevice};
use crate::error::{Error, Result};
use crate::param::{BSIZE, TXSIZE};
use zerocopy::AsBytes;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxOp {
    Create,
    Modify,
    Delete,
}

/// What an entry targets: an inode image, or a data block with an optional
/// payload (DELETEs and bare CREATEs carry none).
pub(crate) enum Payload {
    Inode(Inode),
    Block(Option<Box<BlockData>>),
}

pub(crate) struct Entry {
    pub op: TxOp,
    pub number: u32,
    pub payload: Payload,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Kind {
    Inode,
    Block,
}

impl Entry {
    fn kind(&self) -> Kind {
        match self.payload {
            Payload::Inode(_) => Kind::Inode,
            Payload::Block(_) => Kind::Block,
        }
    }
}

impl core::fmt::Debug for Entry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let data = match self.kind() {
            Kind::Inode => "inode",
            Kind::Block => "data block",
        };
        write!(f, "op: {:?}, data: {}, number: {}", self.op, data, self.number)
    }
}

/// An in-memory sequence of staged entries, one transaction per VFS
/// operation.
#[derive(Debug, Default)]
pub struct Transaction {
    entries: ArrayVec<Entry, TXSIZE>,
}

impl Transaction {
    pub fn new() -> Transaction {
        Transaction {
            entries: ArrayVec::new(),
        }
    }

    /// Stage a full inode image.
    pub(crate) fn stage_inode(&mut self, node: &Inode, op: TxOp) -> Result<()> {
        self.stage(Entry {
            op,
            number: node.inum,
            payload: Payload::Inode(*node),
        })
    }

    /// Stage a data block by index into the data region.
    pub(crate) fn stage_block(&mut self, number: u32, data: Option<&BlockData>, op: TxOp) -> Result<()> {
        self.stage(Entry {
            op,
            number,
            payload: Payload::Block(data.map(|d| Box::new(*d))),
        })
    }

    /// Does the transaction hold a CREATE for this inode number?
    pub(crate) fn creates_inode(&self, inum: u32) -> bool {
        self.has_create(Kind::Inode, inum)
    }

    /// Does the transaction hold a CREATE for this data block index?
    pub(crate) fn creates_block(&self, index: u32) -> bool {
        self.has_create(Kind::Block, index)
    }

    fn has_create(&self, kind: Kind, number: u32) -> bool {
        self.entries
            .iter()
            .any(|e| e.kind() == kind && e.number == number && e.op == TxOp::Create)
    }

    fn stage(&mut self, entry: Entry) -> Result<()> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.kind() == entry.kind() && e.number == entry.number);
        let pos = match pos {
            Some(pos) => pos,
            None => {
                self.entries.try_push(entry).map_err(|_| Error::TooBig)?;
                return Ok(());
            }
        };

        match (self.entries[pos].op, entry.op) {
            // Created in this transaction: fold changes into the birth.
            (TxOp::Create, TxOp::Modify) => self.entries[pos].payload = entry.payload,
            // Created then deleted before commit: no net effect on disk.
            (TxOp::Create, TxOp::Delete) => {
                let _ = self.entries.remove(pos);
            }
            (TxOp::Modify, TxOp::Modify) => self.entries[pos].payload = entry.payload,
            (TxOp::Modify, TxOp::Delete) => {
                self.entries[pos].op = TxOp::Delete;
                self.entries[pos].payload = entry.payload;
            }
            // The bit stays set on disk, so a reborn target is a rewrite.
            (TxOp::Delete, TxOp::Create) => {
                self.entries[pos].op = TxOp::Modify;
                self.entries[pos].payload = entry.payload;
            }
            (TxOp::Delete, TxOp::Delete) => {}
            // Staging CREATE over a live entry or MODIFY over a deleted one
            // means the allocator or liveness checks were bypassed.
            (TxOp::Create, TxOp::Create)
            | (TxOp::Modify, TxOp::Create)
            | (TxOp::Delete, TxOp::Modify) => return Err(Error::Corrupt),
        }
        Ok(())
    }

    /// Apply the staged entries to the device.
    ///
    /// A device error mid-commit is returned as-is; the operation fails and
    /// the disk may hold any prefix of the writes, in phase order.
    pub(crate) fn commit<D: BlockDevice>(self, sb: &Superblock, dev: &mut D) -> Result<()> {
        log::trace!("kfs: commit, {} entries", self.entries.len());

        // Phase A: allocations become visible in the bitmaps.
        for entry in self.entries.iter().filter(|e| e.op == TxOp::Create) {
            log::trace!("kfs: phase A: {:?}", entry);
            match entry.kind() {
                Kind::Inode => bitmap::set_bit(dev, sb.inode_bitmap(), entry.number - 1)?,
                Kind::Block => bitmap::set_bit(dev, sb.block_bitmap(), entry.number)?,
            }
        }

        // Phase B: payloads land in stage order; deletes drop the bits.
        let mut buf: BlockData = [0; BSIZE];
        for entry in &self.entries {
            log::trace!("kfs: phase B: {:?}", entry);
            match (&entry.payload, entry.op) {
                (Payload::Inode(_), TxOp::Delete) => {
                    bitmap::clear_bit(dev, sb.inode_bitmap(), entry.number - 1)?;
                }
                (Payload::Inode(node), _) => {
                    let blockno = sb.iblock(entry.number);
                    let off = sb.ioffset(entry.number);
                    dev.read(blockno, &mut buf)?;
                    buf[off..off + super::inode::INODE_SIZE].copy_from_slice(node.as_bytes());
                    dev.write(blockno, &buf)?;
                }
                (Payload::Block(_), TxOp::Delete) => {
                    bitmap::clear_bit(dev, sb.block_bitmap(), entry.number)?;
                }
                (Payload::Block(Some(data)), _) => {
                    dev.write(sb.data_block(entry.number), data)?;
                }
                // A CREATE staged without a payload allocates only.
                (Payload::Block(None), _) => {}
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn entries(&self) -> &[Entry] {
        &self.entries
    }
}
