//! File system implementation. Five layers:
//!   + Blocks: bitmap allocator for inodes and raw data blocks.
//!   + Transactions: every operation stages its writes and commits once.
//!   + Inodes: fixed-size records, reading, writing, metadata.
//!   + Directories: inodes whose content is an ordered linked record list.
//!   + Handles: volume/dirent/file objects the kernel's VFS drives.
//!
//! This module holds the filesystem object and the path-level operations;
//! the thin 0/-1 adapter the kernel sees is in `vfs`.
//!
//! Each operation opens a fresh `Transaction`, mutates in-memory copies of
//! inodes, directory lists and data buffers while staging every change,
//! then commits. On any failure the transaction is dropped and the disk is
//! untouched, so a crash between operations finds a consistent image.

pub(crate) mod bitmap;
pub(crate) mod dir;
pub(crate) mod inode;
pub(crate) mod superblock;
pub(crate) mod tx;

pub use dir::FileName;
pub use inode::Inode;
pub use superblock::Superblock;
pub use tx::Transaction;

use dir::{DirList, DirRecord, EMPTY_DIR_BYTES};
use scopeguard::ScopeGuard;

use crate::bio::{BlockData, BlockDevice};
use crate::error::{Error, Result};
use crate::file::{File, FileMode};
use crate::param::{BSIZE, MAXFILE, ROOTINO};
use crate::vfs::Volume;

/// One mounted filesystem: the device and its parsed superblock.
pub struct Kfs<D: BlockDevice> {
    pub(crate) dev: D,
    pub(crate) sb: Superblock,
}

impl<D: BlockDevice> Kfs<D> {
    /// Build a fresh filesystem on `dev`: write the superblock, clear both
    /// bitmaps and the inode table, then create the root directory.
    pub fn format(mut dev: D) -> Result<Kfs<D>> {
        let sb = Superblock::format(dev.nblocks())?;
        let mut buf: BlockData = [0; BSIZE];
        sb.write_to(&mut buf);
        dev.write(0, &buf)?;

        let zero: BlockData = [0; BSIZE];
        for blockno in 1..sb.data_block(0) {
            dev.write(blockno, &zero)?;
        }

        let mut fs = Kfs { dev, sb };
        fs.mkfs_root()?;
        log::debug!("kfs: formatted: {:?}", fs.sb);
        Ok(fs)
    }

    /// Mount the filesystem on `dev`. Validates the superblock and hands
    /// back the volume handle; the root inode is number 1 by construction.
    pub fn mount(mut dev: D, unit: u32) -> Result<(Kfs<D>, Volume)> {
        let mut buf: BlockData = [0; BSIZE];
        dev.read(0, &mut buf)?;
        let sb = Superblock::new(&buf, dev.nblocks())?;
        log::debug!("kfs: mount unit {}: {:?}", unit, sb);
        Ok((
            Kfs { dev, sb },
            Volume {
                unit,
                root_inum: ROOTINO,
            },
        ))
    }

    pub fn superblock(&self) -> &Superblock {
        &self.sb
    }

    /// Give the device back, e.g. to remount.
    pub fn into_device(self) -> D {
        self.dev
    }

    pub(crate) fn commit(&mut self, tx: Transaction) -> Result<()> {
        tx.commit(&self.sb, &mut self.dev)
    }

    fn mkfs_root(&mut self) -> Result<()> {
        let mut tx = Transaction::new();
        let mut root = self.stage_inode_create(&mut tx, true)?;
        if root.inum != ROOTINO {
            return Err(Error::Corrupt);
        }
        // Root is its own parent: it carries both links itself.
        root.nlink = 2;
        let mut body = DirList::empty_dir(root.inum, root.inum);
        self.write_dir(&mut tx, &mut root, &mut body)?;
        self.stage_inode_save(&mut tx, &root)?;
        self.commit(tx)
    }

    /// Create directory `name` under the directory `parent_inum`, with its
    /// "." and ".." body.
    pub fn mkdir(&mut self, parent_inum: u32, name: &str) -> Result<()> {
        let name = FileName::new(name)?;
        let mut tx = Transaction::new();
        let mut parent = self.inode_required(parent_inum)?;
        let mut parent_list = self.read_dir(&parent)?;

        let mut node = self.stage_inode_create(&mut tx, true)?;
        let mut body = DirList::empty_dir(node.inum, parent.inum);
        self.write_dir(&mut tx, &mut node, &mut body)?;

        let rec = DirRecord::new(&name, &mut node);
        parent_list.add(rec, &mut parent)?;
        self.write_dir(&mut tx, &mut parent, &mut parent_list)?;
        self.stage_inode_save(&mut tx, &node)?;
        self.stage_inode_save(&mut tx, &parent)?;
        self.commit(tx)
    }

    /// Create an empty regular file `name` under `parent_inum`.
    pub fn mkfile(&mut self, parent_inum: u32, name: &str) -> Result<()> {
        let name = FileName::new(name)?;
        let mut tx = Transaction::new();
        let mut parent = self.inode_required(parent_inum)?;
        let mut parent_list = self.read_dir(&parent)?;

        let mut node = self.stage_inode_create(&mut tx, false)?;
        let rec = DirRecord::new(&name, &mut node);
        parent_list.add(rec, &mut parent)?;
        self.write_dir(&mut tx, &mut parent, &mut parent_list)?;
        self.stage_inode_save(&mut tx, &node)?;
        self.stage_inode_save(&mut tx, &parent)?;
        self.commit(tx)
    }

    /// Remove the empty directory `name` from `parent_inum`.
    pub fn rmdir(&mut self, parent_inum: u32, name: &str) -> Result<()> {
        let name = FileName::new(name)?;
        if name.as_bytes() == b"." || name.as_bytes() == b".." {
            return Err(Error::NotFound);
        }
        let mut tx = Transaction::new();
        let mut parent = self.inode_required(parent_inum)?;
        let mut list = self.read_dir(&parent)?;

        let slot = list.lookup_exact(&name).ok_or(Error::NotFound)?;
        let mut node = self.inode_required(list.record(slot).inum)?;
        if !node.is_dir() {
            return Err(Error::NotADirectory);
        }
        if node.size != EMPTY_DIR_BYTES {
            return Err(Error::NotEmpty);
        }

        parent.nlink = parent.nlink.saturating_sub(1);
        self.stage_inode_drop(&mut tx, &mut node)?;
        list.remove_named(&name)?;
        self.write_dir(&mut tx, &mut parent, &mut list)?;
        self.stage_inode_save(&mut tx, &parent)?;
        self.commit(tx)
    }

    /// Remove the non-directory entry `name` from `parent_inum`, deleting
    /// the inode once its last link is gone.
    pub fn unlink(&mut self, parent_inum: u32, name: &str) -> Result<()> {
        let name = FileName::new(name)?;
        if name.as_bytes() == b"." || name.as_bytes() == b".." {
            return Err(Error::NotFound);
        }
        let mut tx = Transaction::new();
        let mut parent = self.inode_required(parent_inum)?;
        let mut list = self.read_dir(&parent)?;

        let slot = list.lookup_exact(&name).ok_or(Error::NotFound)?;
        let mut node = self.inode_required(list.record(slot).inum)?;
        if node.is_dir() {
            return Err(Error::IsADirectory);
        }

        list.remove_named(&name)?;
        self.write_dir(&mut tx, &mut parent, &mut list)?;
        self.stage_inode_drop(&mut tx, &mut node)?;
        self.stage_inode_save(&mut tx, &parent)?;
        self.commit(tx)
    }

    /// Add a second name for the non-directory `name` in the same
    /// directory.
    pub fn link(&mut self, parent_inum: u32, name: &str, new_name: &str) -> Result<()> {
        let name = FileName::new(name)?;
        let new_name = FileName::new(new_name)?;
        let mut tx = Transaction::new();
        let mut parent = self.inode_required(parent_inum)?;
        let mut list = self.read_dir(&parent)?;

        let slot = list.lookup_exact(&name).ok_or(Error::NotFound)?;
        let mut node = self.inode_required(list.record(slot).inum)?;
        if node.is_dir() {
            return Err(Error::IsADirectory);
        }

        let rec = DirRecord::new(&new_name, &mut node);
        list.add(rec, &mut parent)?;
        self.write_dir(&mut tx, &mut parent, &mut list)?;
        self.stage_inode_save(&mut tx, &parent)?;
        self.stage_inode_save(&mut tx, &node)?;
        self.commit(tx)
    }

    /// Find `name` in directory `parent_inum`.
    pub fn lookup(&mut self, parent_inum: u32, name: &str) -> Result<Option<Inode>> {
        let name = FileName::new(name)?;
        let parent = self.inode_required(parent_inum)?;
        let list = self.read_dir(&parent)?;
        match list.lookup_exact(&name) {
            Some(slot) => self.inode(list.record(slot).inum),
            None => Ok(None),
        }
    }

    /// Open inode `inum` at offset 0. No I/O beyond loading the inode.
    pub fn open(&mut self, inum: u32, mode: FileMode) -> Result<File> {
        if mode.is_empty() {
            return Err(Error::BadMode);
        }
        let node = self.inode_required(inum)?;
        Ok(File::new(node, mode))
    }

    /// Format the directory's names into `buf`, space-separated, in list
    /// order, skipping "." and "..". Returns the bytes written; stops when
    /// the next name no longer fits.
    pub fn readdir(&mut self, inum: u32, buf: &mut [u8]) -> Result<usize> {
        let node = self.inode_required(inum)?;
        let list = self.read_dir(&node)?;
        let mut total = 0;
        for rec in list.iter() {
            let name = rec.name_bytes();
            if name == b"." || name == b".." {
                continue;
            }
            if buf.len() - total < name.len() + 1 {
                break;
            }
            buf[total..total + name.len()].copy_from_slice(name);
            buf[total + name.len()] = b' ';
            total += name.len() + 1;
        }
        Ok(total)
    }

    /// Read up to `buf.len()` bytes at the handle's offset, clamped to the
    /// file size, advancing the offset by the count transferred.
    pub fn read_file(&mut self, file: &mut File, buf: &mut [u8]) -> Result<u32> {
        if !file.mode.contains(FileMode::READ) {
            return Err(Error::BadMode);
        }
        let start = file.offset;
        let end = start
            .saturating_add(buf.len() as u32)
            .min(file.inode.size);
        if end <= start {
            return Ok(0);
        }
        let n = end - start;
        self.read_range(&file.inode, &mut buf[..n as usize], start)?;
        file.offset = end;
        Ok(n)
    }

    /// Write `buf` at the handle's offset inside one transaction. On any
    /// failure the handle is restored, offset included.
    pub fn write_file(&mut self, file: &mut File, buf: &[u8]) -> Result<u32> {
        if !file.mode.contains(FileMode::WRITE) {
            return Err(Error::BadMode);
        }
        let start = file.offset;
        let snapshot = file.inode;
        let mut file = scopeguard::guard(file, move |f| {
            f.offset = start;
            f.inode = snapshot;
        });

        let end = start.checked_add(buf.len() as u32).ok_or(Error::TooBig)?;
        if end as usize > MAXFILE {
            return Err(Error::TooBig);
        }
        file.offset = end;

        let mut tx = Transaction::new();
        let n = self.write_range(&mut tx, &mut file.inode, buf, start)?;
        self.commit(tx)?;
        let _ = ScopeGuard::into_inner(file);
        Ok(n)
    }
}
