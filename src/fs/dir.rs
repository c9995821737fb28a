//! Directories.
//!
//! A directory's content is a packed array of fixed-size records filling
//! its data blocks in order. The user-visible ordering is a singly linked
//! list threaded through the array by `offset_to_next` (a relative record
//! index, possibly negative, 0 = end of list); the list starts at record 0
//! and visits names in strictly increasing lexicographic order. Insert and
//! remove never shift the array: a new record lands in the last physical
//! slot and removal swaps the last record into the vacated one, patching
//! the links that crossed either slot. `DirList` tracks which of the
//! directory's blocks were touched so `write_dir` stages only those.
//!
//! An empty directory is exactly "." then "..", linked 0 -> 1 -> end.

use alloc::collections::BTreeSet;
use alloc::vec;
use alloc::vec::Vec;

use core::cmp::Ordering;
use core::mem;

use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use super::inode::Inode;
use super::tx::Transaction;
use super::Kfs;
use crate::bio::{BlockData, BlockDevice};
use crate::error::{Error, Result};
use crate::param::{div_ceil, BSIZE, FILENAME_MAX};

/// On-disk directory record.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub(crate) struct DirRecord {
    /// NUL-padded name, at most FILENAME_MAX significant bytes
    name: [u8; FILENAME_MAX + 1],

    /// Referenced inode (1-based)
    pub inum: u32,

    /// Relative record index of the list successor; 0 ends the list
    pub offset_to_next: i32,

    /// Copy of the inode's directory flag, for cheap listings
    is_directory: u32,
}

pub(crate) const RECORD_SIZE: usize = mem::size_of::<DirRecord>();

/// Records in a directory holding only "." and "..".
pub(crate) const EMPTY_DIR_RECORDS: usize = 2;
pub(crate) const EMPTY_DIR_BYTES: u32 = (EMPTY_DIR_RECORDS * RECORD_SIZE) as u32;

const_assert!(RECORD_SIZE == FILENAME_MAX + 1 + 12);
const_assert!(EMPTY_DIR_BYTES as usize <= BSIZE);

/// A validated file name: 1..=FILENAME_MAX bytes, no NUL, no '/'.
#[derive(Clone, Copy, Debug)]
pub struct FileName<'s> {
    bytes: &'s [u8],
}

impl<'s> FileName<'s> {
    pub fn new(name: &'s str) -> Result<FileName<'s>> {
        let bytes = name.as_bytes();
        if bytes.is_empty() || bytes.len() > FILENAME_MAX {
            return Err(Error::NameTooLong);
        }
        if bytes.iter().any(|&b| b == 0 || b == b'/') {
            return Err(Error::NameTooLong);
        }
        Ok(FileName { bytes })
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.bytes
    }
}

impl DirRecord {
    /// Build the record binding `name` to `node`, taking one link on it.
    pub(crate) fn new(name: &FileName<'_>, node: &mut Inode) -> DirRecord {
        let mut rec = DirRecord::zeroed();
        rec.name[..name.as_bytes().len()].copy_from_slice(name.as_bytes());
        rec.inum = node.inum;
        rec.is_directory = node.is_dir() as u32;
        node.nlink += 1;
        rec
    }

    pub(crate) fn is_dir(&self) -> bool {
        self.is_directory != 0
    }

    /// The name without its NUL padding.
    pub(crate) fn name_bytes(&self) -> &[u8] {
        let len = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.name.len());
        &self.name[..len]
    }

    fn cmp_name(&self, other: &[u8]) -> Ordering {
        self.name_bytes().cmp(other)
    }

    fn decode(bytes: &[u8]) -> DirRecord {
        let mut rec = DirRecord::zeroed();
        rec.as_bytes_mut().copy_from_slice(bytes);
        rec
    }

    fn zeroed() -> DirRecord {
        DirRecord {
            name: [0; FILENAME_MAX + 1],
            inum: 0,
            offset_to_next: 0,
            is_directory: 0,
        }
    }

    fn dot(name: &[u8], inum: u32, offset_to_next: i32) -> DirRecord {
        let mut rec = DirRecord::zeroed();
        rec.name[..name.len()].copy_from_slice(name);
        rec.inum = inum;
        rec.offset_to_next = offset_to_next;
        rec.is_directory = 1;
        rec
    }
}

impl core::fmt::Debug for DirRecord {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "filename: {}, inode_number: {}, offset: {}",
            core::str::from_utf8(self.name_bytes()).unwrap_or("<bad utf8>"),
            self.inum,
            self.offset_to_next
        )
    }
}

/// A directory's records plus the set of its blocks modified in memory.
pub(crate) struct DirList {
    records: Vec<DirRecord>,
    dirty: BTreeSet<u32>,
}

impl DirList {
    /// The two-record body of a fresh directory: "." points at the
    /// directory itself, ".." at its parent.
    pub(crate) fn empty_dir(self_inum: u32, parent_inum: u32) -> DirList {
        let mut list = DirList {
            records: vec![
                DirRecord::dot(b".", self_inum, 1),
                DirRecord::dot(b"..", parent_inum, 0),
            ],
            dirty: BTreeSet::new(),
        };
        list.mark(0);
        list.mark(1);
        list
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    pub(crate) fn record(&self, slot: usize) -> &DirRecord {
        &self.records[slot]
    }

    /// Records in linked-list (lexicographic) order. Bounded by the
    /// physical record count, so a corrupt cycle cannot spin forever.
    pub(crate) fn iter(&self) -> impl Iterator<Item = &DirRecord> + '_ {
        let mut slot = if self.records.is_empty() { None } else { Some(0) };
        let mut remaining = self.records.len();
        core::iter::from_fn(move || {
            let i = slot.filter(|&i| i < self.records.len())?;
            if remaining == 0 {
                return None;
            }
            remaining -= 1;
            let rec = &self.records[i];
            slot = match rec.offset_to_next {
                0 => None,
                off => Some((i as i64 + off as i64) as usize),
            };
            Some(rec)
        })
    }

    /// The last record whose name compares strictly less than `name`, in
    /// list order. `None` means `name` sorts at (or before) the head.
    pub(crate) fn lookup_prev(&self, name: &FileName<'_>) -> Option<usize> {
        self.lookup_prev_bytes(name.as_bytes())
    }

    fn lookup_prev_bytes(&self, name: &[u8]) -> Option<usize> {
        let mut slot = 0usize;
        let mut prev = None;
        let mut remaining = self.records.len();
        while remaining > 0 && slot < self.records.len() {
            remaining -= 1;
            let rec = &self.records[slot];
            if rec.cmp_name(name) != Ordering::Less {
                break;
            }
            prev = Some(slot);
            if rec.offset_to_next == 0 {
                break;
            }
            slot = (slot as i64 + rec.offset_to_next as i64) as usize;
        }
        prev
    }

    /// Slot of the record named exactly `name`.
    pub(crate) fn lookup_exact(&self, name: &FileName<'_>) -> Option<usize> {
        let mut slot = 0usize;
        let mut remaining = self.records.len();
        while remaining > 0 && slot < self.records.len() {
            remaining -= 1;
            let rec = &self.records[slot];
            match rec.cmp_name(name.as_bytes()) {
                Ordering::Equal => return Some(slot),
                Ordering::Greater => return None,
                Ordering::Less => {}
            }
            if rec.offset_to_next == 0 {
                return None;
            }
            slot = (slot as i64 + rec.offset_to_next as i64) as usize;
        }
        None
    }

    /// Insert `rec` behind the record at `prev`, or at the logical head
    /// when `prev` is `None`. The new record always occupies the last
    /// physical slot; a head insert swaps through slot 0 so the list still
    /// starts there.
    fn insert_after(&mut self, prev: Option<usize>, mut rec: DirRecord) {
        let new_pos = self.records.len();
        match prev {
            Some(p) => {
                let off = self.records[p].offset_to_next;
                rec.offset_to_next = if off == 0 {
                    0
                } else {
                    p as i32 + off - new_pos as i32
                };
                self.records.push(rec);
                self.records[p].offset_to_next = (new_pos - p) as i32;
                self.mark(p);
            }
            None => {
                let mut old_head = self.records[0];
                old_head.offset_to_next = if old_head.offset_to_next == 0 {
                    0
                } else {
                    old_head.offset_to_next - new_pos as i32
                };
                self.records.push(old_head);
                rec.offset_to_next = new_pos as i32;
                self.records[0] = rec;
                self.mark(0);
            }
        }
        self.mark(new_pos);
    }

    /// Remove the successor of the record at `prev`, swapping the last
    /// physical record into the vacated slot.
    fn remove_after(&mut self, mut prev: usize) -> Result<()> {
        let len = self.records.len();
        if len <= EMPTY_DIR_RECORDS {
            return Err(Error::Corrupt);
        }
        let last = len - 1;
        let to_rm = self.follow(prev)?.ok_or(Error::Corrupt)?;
        let mut next = self.follow(to_rm)?;
        let last_name = self.records[last].name;
        let last_prev = self
            .lookup_prev_bytes(effective(&last_name))
            .ok_or(Error::Corrupt)?;

        if to_rm != last {
            self.records[to_rm] = self.records[last];
            if next == Some(last) {
                next = Some(to_rm);
            }
            if prev == last {
                prev = to_rm;
            }
            let delta = (last - to_rm) as i32;
            if to_rm != last_prev {
                self.records[last_prev].offset_to_next -= delta;
            }
            if self.records[to_rm].offset_to_next != 0 {
                self.records[to_rm].offset_to_next += delta;
            }
            self.mark(to_rm);
            self.mark(last_prev);
        }

        self.records[prev].offset_to_next = match next {
            Some(next) => next as i32 - prev as i32,
            None => 0,
        };
        self.mark(prev);
        self.mark(last);
        let _ = self.records.pop();
        Ok(())
    }

    /// Ordered insert. Fails `Exists` when the name is already present.
    /// A successful insert takes one link on the parent.
    pub(crate) fn add(&mut self, rec: DirRecord, parent: &mut Inode) -> Result<()> {
        if self.records.len() < EMPTY_DIR_RECORDS {
            return Err(Error::Corrupt);
        }
        let prev = self.lookup_prev_bytes(rec.name_bytes());
        let candidate = match prev {
            Some(p) => self.follow(p)?,
            None => Some(0),
        };
        if let Some(c) = candidate {
            if self.records[c].name_bytes() == rec.name_bytes() {
                return Err(Error::Exists);
            }
        }
        self.insert_after(prev, rec);
        parent.nlink += 1;
        Ok(())
    }

    /// Remove the record named `name`.
    pub(crate) fn remove_named(&mut self, name: &FileName<'_>) -> Result<()> {
        let prev = self.lookup_prev(name).ok_or(Error::NotFound)?;
        let target = self.follow(prev)?.ok_or(Error::NotFound)?;
        if self.records[target].cmp_name(name.as_bytes()) != Ordering::Equal {
            return Err(Error::NotFound);
        }
        self.remove_after(prev)
    }

    /// The slot the record at `slot` links to, if any.
    fn follow(&self, slot: usize) -> Result<Option<usize>> {
        let off = self.records[slot].offset_to_next;
        if off == 0 {
            return Ok(None);
        }
        let target = slot as i64 + off as i64;
        if target < 0 || target as usize >= self.records.len() || target as usize == slot {
            return Err(Error::Corrupt);
        }
        Ok(Some(target as usize))
    }

    /// Record the block(s) the byte range of `slot` overlaps.
    fn mark(&mut self, slot: usize) {
        let _ = self.dirty.insert((slot * RECORD_SIZE / BSIZE) as u32);
        let _ = self
            .dirty
            .insert((((slot + 1) * RECORD_SIZE - 1) / BSIZE) as u32);
    }

    #[cfg(test)]
    pub(crate) fn dirty_blocks(&self) -> impl Iterator<Item = u32> + '_ {
        self.dirty.iter().copied()
    }
}

fn effective(name: &[u8; FILENAME_MAX + 1]) -> &[u8] {
    let len = name.iter().position(|&b| b == 0).unwrap_or(name.len());
    &name[..len]
}

impl<D: BlockDevice> Kfs<D> {
    /// Read all of a directory's blocks and decode its record array.
    pub(crate) fn read_dir(&mut self, node: &Inode) -> Result<DirList> {
        if !node.is_dir() {
            return Err(Error::NotADirectory);
        }
        let nrecords = node.size as usize / RECORD_SIZE;
        if node.size as usize % RECORD_SIZE != 0
            || nrecords * RECORD_SIZE > node.naddrs as usize * BSIZE
        {
            return Err(Error::Corrupt);
        }

        let mut buf = vec![0u8; node.naddrs as usize * BSIZE];
        let mut block: BlockData = [0; BSIZE];
        for (i, addr) in node.blocks().enumerate() {
            self.read_data_block(addr, &mut block)?;
            buf[i * BSIZE..(i + 1) * BSIZE].copy_from_slice(&block);
        }

        let mut records = Vec::with_capacity(nrecords);
        for i in 0..nrecords {
            records.push(DirRecord::decode(
                &buf[i * RECORD_SIZE..(i + 1) * RECORD_SIZE],
            ));
        }
        Ok(DirList {
            records,
            dirty: BTreeSet::new(),
        })
    }

    /// Resize the directory to fit the list and stage every dirty block.
    /// Updates the inode's size; the caller stages the inode save.
    pub(crate) fn write_dir(
        &mut self,
        tx: &mut Transaction,
        node: &mut Inode,
        list: &mut DirList,
    ) -> Result<()> {
        let bytes = list.records.len() * RECORD_SIZE;
        let nblocks = div_ceil(bytes as u32, BSIZE as u32);
        self.resize(tx, node, nblocks)?;

        let mut buf = vec![0u8; nblocks as usize * BSIZE];
        for (i, rec) in list.records.iter().enumerate() {
            buf[i * RECORD_SIZE..(i + 1) * RECORD_SIZE].copy_from_slice(rec.as_bytes());
        }
        let mut image: BlockData = [0; BSIZE];
        for bn in 0..nblocks {
            if list.dirty.contains(&bn) {
                image.copy_from_slice(&buf[bn as usize * BSIZE..(bn as usize + 1) * BSIZE]);
                self.stage_data_write(tx, node.addr(bn)?, &image)?;
            }
        }
        node.size = bytes as u32;
        Ok(())
    }
}
