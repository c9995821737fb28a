//! The VFS adapter.
//!
//! The kernel drives the filesystem through opaque handles and the
//! `Filesystem` operation table. Handles carry no borrows: a `Dirent` is an
//! inode number plus a snapshot of its type and size, re-read from disk by
//! every operation, and a `File` owns its inode copy outright. The trait is
//! object-safe so the kernel can hold `&mut dyn Filesystem`.
//!
//! Return convention at this boundary: 0 on success, -1 on any failure
//! (the detailed error kind is logged, not returned); read/write/readdir
//! return byte counts.

use crate::bio::BlockDevice;
use crate::error::Result;
use crate::file::{File, FileMode};
use crate::fs::{Inode, Kfs};

/// A mounted unit: its id and the fixed root inode number.
#[derive(Clone, Copy, Debug)]
pub struct Volume {
    pub(crate) unit: u32,
    pub(crate) root_inum: u32,
}

impl Volume {
    pub fn unit(&self) -> u32 {
        self.unit
    }
}

/// A named node in the tree, as handed to the kernel.
#[derive(Clone, Copy, Debug)]
pub struct Dirent {
    inum: u32,
    is_directory: bool,
    size: u32,
}

impl Dirent {
    fn new(node: &Inode) -> Dirent {
        Dirent {
            inum: node.inum,
            is_directory: node.is_dir(),
            size: node.size,
        }
    }

    pub fn inum(&self) -> u32 {
        self.inum
    }

    pub fn is_dir(&self) -> bool {
        self.is_directory
    }

    pub fn size(&self) -> u32 {
        self.size
    }
}

/// The operation table the kernel sees.
pub trait Filesystem {
    fn root(&mut self, vol: &Volume) -> Option<Dirent>;
    fn umount(&mut self, vol: Volume) -> i32;
    fn readdir(&mut self, dir: &Dirent, buf: &mut [u8]) -> i32;
    fn mkdir(&mut self, dir: &Dirent, name: &str) -> i32;
    fn mkfile(&mut self, dir: &Dirent, name: &str) -> i32;
    fn lookup(&mut self, dir: &Dirent, name: &str) -> Option<Dirent>;
    fn rmdir(&mut self, dir: &Dirent, name: &str) -> i32;
    fn unlink(&mut self, dir: &Dirent, name: &str) -> i32;
    fn link(&mut self, dir: &Dirent, name: &str, new_name: &str) -> i32;
    fn open(&mut self, dir: &Dirent, mode: FileMode) -> Option<File>;
    fn close(&mut self, file: File) -> i32;
    fn read(&mut self, file: &mut File, buf: &mut [u8]) -> i32;
    fn write(&mut self, file: &mut File, buf: &[u8]) -> i32;
}

fn collapse(op: &str, res: Result<()>) -> i32 {
    match res {
        Ok(()) => 0,
        Err(err) => {
            log::warn!("kfs: {} failed: {:?}", op, err);
            -1
        }
    }
}

fn collapse_count(op: &str, res: Result<u32>) -> i32 {
    match res {
        Ok(n) => n as i32,
        Err(err) => {
            log::warn!("kfs: {} failed: {:?}", op, err);
            -1
        }
    }
}

impl<D: BlockDevice> Filesystem for Kfs<D> {
    fn root(&mut self, vol: &Volume) -> Option<Dirent> {
        match self.inode(vol.root_inum) {
            Ok(Some(node)) => Some(Dirent::new(&node)),
            Ok(None) => None,
            Err(err) => {
                log::warn!("kfs: root failed: {:?}", err);
                None
            }
        }
    }

    fn umount(&mut self, vol: Volume) -> i32 {
        // Commit is per-operation; nothing to flush.
        log::debug!("kfs: umount unit {}", vol.unit);
        0
    }

    fn readdir(&mut self, dir: &Dirent, buf: &mut [u8]) -> i32 {
        match Kfs::readdir(self, dir.inum, buf) {
            Ok(total) => total as i32,
            Err(err) => {
                log::warn!("kfs: readdir failed: {:?}", err);
                -1
            }
        }
    }

    fn mkdir(&mut self, dir: &Dirent, name: &str) -> i32 {
        collapse("mkdir", Kfs::mkdir(self, dir.inum, name))
    }

    fn mkfile(&mut self, dir: &Dirent, name: &str) -> i32 {
        collapse("mkfile", Kfs::mkfile(self, dir.inum, name))
    }

    fn lookup(&mut self, dir: &Dirent, name: &str) -> Option<Dirent> {
        match Kfs::lookup(self, dir.inum, name) {
            Ok(node) => node.map(|n| Dirent::new(&n)),
            Err(err) => {
                log::warn!("kfs: lookup failed: {:?}", err);
                None
            }
        }
    }

    fn rmdir(&mut self, dir: &Dirent, name: &str) -> i32 {
        collapse("rmdir", Kfs::rmdir(self, dir.inum, name))
    }

    fn unlink(&mut self, dir: &Dirent, name: &str) -> i32 {
        collapse("unlink", Kfs::unlink(self, dir.inum, name))
    }

    fn link(&mut self, dir: &Dirent, name: &str, new_name: &str) -> i32 {
        collapse("link", Kfs::link(self, dir.inum, name, new_name))
    }

    fn open(&mut self, dir: &Dirent, mode: FileMode) -> Option<File> {
        match Kfs::open(self, dir.inum, mode) {
            Ok(file) => Some(file),
            Err(err) => {
                log::warn!("kfs: open failed: {:?}", err);
                None
            }
        }
    }

    fn close(&mut self, file: File) -> i32 {
        drop(file);
        0
    }

    fn read(&mut self, file: &mut File, buf: &mut [u8]) -> i32 {
        collapse_count("read", self.read_file(file, buf))
    }

    fn write(&mut self, file: &mut File, buf: &[u8]) -> i32 {
        collapse_count("write", self.write_file(file, buf))
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::collections::BTreeSet;
    use std::string::String;
    use std::vec::Vec;

    use super::*;
    use crate::bio::MemDisk;
    use crate::error::Error;
    use crate::fs::dir::EMPTY_DIR_BYTES;
    use crate::fs::{bitmap, Kfs};
    use crate::param::{BSIZE, MAXFILE};

    /// Format a 1 MiB device and mount it.
    fn setup() -> (Kfs<MemDisk>, Volume) {
        let fs = Kfs::format(MemDisk::new(256)).unwrap();
        Kfs::mount(fs.into_device(), 0).unwrap()
    }

    /// Walk the whole volume and assert the universal invariants: bitmap
    /// liveness matches `get`, directory lists are well-linked and sorted,
    /// no data block is shared or dangling, sizes fit the block counts.
    fn check_consistency(fs: &mut Kfs<MemDisk>) {
        let sb = fs.sb;
        let mut owned_blocks = BTreeSet::new();
        for inum in 1..=sb.num_inodes {
            let live = bitmap::check_bit(&mut fs.dev, sb.inode_bitmap(), inum - 1).unwrap();
            let node = fs.inode(inum).unwrap();
            assert_eq!(live, node.is_some(), "bitmap and inode store disagree on {}", inum);
            let node = match node {
                Some(node) => node,
                None => continue,
            };

            assert!(node.size <= node.naddrs * BSIZE as u32);
            if node.naddrs > 0 {
                assert!(node.size > (node.naddrs - 1) * BSIZE as u32);
            }
            for b in node.blocks() {
                assert!(
                    bitmap::check_bit(&mut fs.dev, sb.block_bitmap(), b).unwrap(),
                    "inode {} references freed block {}",
                    inum,
                    b
                );
                assert!(owned_blocks.insert(b), "block {} owned twice", b);
            }

            if node.is_dir() {
                assert!(node.nlink >= 2);
                let list = fs.read_dir(&node).unwrap();
                let mut visited = BTreeSet::new();
                let mut slot = 0usize;
                let mut prev_name: Option<Vec<u8>> = None;
                loop {
                    assert!(visited.insert(slot), "slot {} visited twice", slot);
                    let rec = list.record(slot);
                    let name = rec.name_bytes().to_vec();
                    if let Some(prev) = &prev_name {
                        assert!(*prev < name, "names out of order in inode {}", inum);
                    }
                    prev_name = Some(name);
                    match rec.offset_to_next {
                        0 => break,
                        off => slot = (slot as i64 + off as i64) as usize,
                    }
                }
                assert_eq!(visited.len(), list.len(), "unreachable slots in inode {}", inum);
            }
        }
    }

    #[test]
    fn fresh_volume_has_dot_and_dotdot_root() {
        // S1: a formatted 1 MiB device mounts with a two-record root.
        let (mut fs, vol) = setup();
        let root = fs.root(&vol).unwrap();
        assert_eq!(root.inum(), 1);
        assert!(root.is_dir());
        assert_eq!(root.size(), EMPTY_DIR_BYTES);

        let node = fs.inode(1).unwrap().unwrap();
        let list = fs.read_dir(&node).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list.record(0).name_bytes(), b".");
        assert_eq!(list.record(0).inum, 1);
        assert_eq!(list.record(0).offset_to_next, 1);
        assert_eq!(list.record(1).name_bytes(), b"..");
        assert_eq!(list.record(1).inum, 1);
        assert_eq!(list.record(1).offset_to_next, 0);
        check_consistency(&mut fs);
    }

    #[test]
    fn readdir_lists_names_in_lexicographic_order() {
        // S2, but insertion order differs from name order.
        let (mut fs, vol) = setup();
        let root = fs.root(&vol).unwrap();
        let fsys: &mut dyn Filesystem = &mut fs;
        assert_eq!(fsys.mkdir(&root, "b"), 0);
        assert_eq!(fsys.mkdir(&root, "a"), 0);
        assert_eq!(fsys.mkdir(&root, "c"), 0);

        let mut buf = [0u8; 64];
        let n = fsys.readdir(&root, &mut buf);
        assert_eq!(n, 6);
        assert_eq!(&buf[..6], b"a b c ");
        check_consistency(&mut fs);
    }

    #[test]
    fn readdir_stops_at_buffer_capacity() {
        let (mut fs, vol) = setup();
        let root = fs.root(&vol).unwrap();
        let fsys: &mut dyn Filesystem = &mut fs;
        fsys.mkdir(&root, "aa");
        fsys.mkdir(&root, "bb");
        let mut buf = [0u8; 4];
        assert_eq!(fsys.readdir(&root, &mut buf), 3);
        assert_eq!(&buf[..3], b"aa ");
    }

    #[test]
    fn write_then_read_back_through_handles() {
        // S3: 8 KiB of 0xab survives a close/reopen round trip.
        let (mut fs, vol) = setup();
        let root = fs.root(&vol).unwrap();
        let fsys: &mut dyn Filesystem = &mut fs;
        assert_eq!(fsys.mkfile(&root, "f"), 0);
        let f = fsys.lookup(&root, "f").unwrap();
        assert!(!f.is_dir());

        let mut handle = fsys.open(&f, FileMode::WRITE).unwrap();
        let data = [0xabu8; 2 * BSIZE];
        assert_eq!(fsys.write(&mut handle, &data), 2 * BSIZE as i32);
        assert_eq!(fsys.close(handle), 0);

        let mut handle = fsys.open(&f, FileMode::READ).unwrap();
        let mut back = [0u8; 2 * BSIZE];
        assert_eq!(fsys.read(&mut handle, &mut back), 2 * BSIZE as i32);
        assert!(back.iter().all(|&b| b == 0xab));

        // Mode bits are enforced both ways.
        assert_eq!(fsys.write(&mut handle, &data), -1);
        let mut wr = fsys.open(&f, FileMode::WRITE).unwrap();
        assert_eq!(fsys.read(&mut wr, &mut back), -1);
        check_consistency(&mut fs);
    }

    #[test]
    fn read_clamps_at_end_of_file() {
        let (mut fs, vol) = setup();
        let root = fs.root(&vol).unwrap();
        let fsys: &mut dyn Filesystem = &mut fs;
        fsys.mkfile(&root, "f");
        let f = fsys.lookup(&root, "f").unwrap();
        let mut h = fsys.open(&f, FileMode::READ | FileMode::WRITE).unwrap();
        fsys.write(&mut h, &[7u8; 100]);

        let mut h = fsys.open(&f, FileMode::READ).unwrap();
        let mut buf = [0u8; 256];
        assert_eq!(fsys.read(&mut h, &mut buf), 100);
        // At end of file the transfer count is 0.
        assert_eq!(fsys.read(&mut h, &mut buf), 0);
    }

    #[test]
    fn unlink_frees_inode_and_data_blocks() {
        // S4, with the blocks coming from an explicit 8 KiB write.
        let (mut fs, vol) = setup();
        let root = fs.root(&vol).unwrap();
        {
            let fsys: &mut dyn Filesystem = &mut fs;
            fsys.mkfile(&root, "f");
            let f = fsys.lookup(&root, "f").unwrap();
            let mut h = fsys.open(&f, FileMode::WRITE).unwrap();
            assert_eq!(fsys.write(&mut h, &[1u8; 2 * BSIZE]), 2 * BSIZE as i32);
        }

        let node = fs.lookup(1, "f").unwrap().unwrap();
        let held: Vec<u32> = node.blocks().collect();
        assert_eq!(held.len(), 2);

        let fsys: &mut dyn Filesystem = &mut fs;
        assert_eq!(fsys.unlink(&root, "f"), 0);
        assert!(fsys.lookup(&root, "f").is_none());
        for b in held {
            assert!(!bitmap::check_bit(&mut fs.dev, fs.sb.block_bitmap(), b).unwrap());
        }
        assert!(!bitmap::check_bit(&mut fs.dev, fs.sb.inode_bitmap(), node.inum - 1).unwrap());
        check_consistency(&mut fs);
    }

    #[test]
    fn hard_links_share_the_inode() {
        // S5 plus the link-count property: link, drop the original name,
        // and the content stays reachable with one link left.
        let (mut fs, vol) = setup();
        let root = fs.root(&vol).unwrap();
        let fsys: &mut dyn Filesystem = &mut fs;
        fsys.mkfile(&root, "f");
        let f = fsys.lookup(&root, "f").unwrap();
        let mut h = fsys.open(&f, FileMode::WRITE).unwrap();
        fsys.write(&mut h, b"payload");

        assert_eq!(fsys.link(&root, "f", "g"), 0);
        assert_eq!(fsys.unlink(&root, "f"), 0);

        let g = fsys.lookup(&root, "g").unwrap();
        let mut h = fsys.open(&g, FileMode::READ).unwrap();
        let mut buf = [0u8; 7];
        assert_eq!(fsys.read(&mut h, &mut buf), 7);
        assert_eq!(&buf, b"payload");

        let node = fs.lookup(1, "g").unwrap().unwrap();
        assert_eq!(node.nlink, 1);
        check_consistency(&mut fs);

        // Dropping the last name frees the inode and its block.
        let held: Vec<u32> = node.blocks().collect();
        let fsys: &mut dyn Filesystem = &mut fs;
        assert_eq!(fsys.unlink(&root, "g"), 0);
        for b in held {
            assert!(!bitmap::check_bit(&mut fs.dev, fs.sb.block_bitmap(), b).unwrap());
        }
        check_consistency(&mut fs);
    }

    #[test]
    fn link_refuses_directories_and_duplicates() {
        let (mut fs, vol) = setup();
        let root = fs.root(&vol).unwrap();
        let fsys: &mut dyn Filesystem = &mut fs;
        fsys.mkdir(&root, "d");
        fsys.mkfile(&root, "f");
        assert_eq!(fsys.link(&root, "d", "e"), -1);
        assert_eq!(fsys.link(&root, "f", "d"), -1);
        assert_eq!(fsys.link(&root, "missing", "m"), -1);
        check_consistency(&mut fs);
    }

    #[test]
    fn rmdir_requires_an_empty_directory() {
        // S6: a directory with a file in it refuses rmdir until the file
        // is unlinked; afterwards the root shrinks back to "." and "..".
        let (mut fs, vol) = setup();
        let root = fs.root(&vol).unwrap();
        let fsys: &mut dyn Filesystem = &mut fs;
        assert_eq!(fsys.mkdir(&root, "d"), 0);
        let d = fsys.lookup(&root, "d").unwrap();
        assert!(d.is_dir());
        assert_eq!(fsys.mkfile(&d, "inner"), 0);

        assert_eq!(fsys.rmdir(&root, "d"), -1);
        assert_eq!(fsys.unlink(&d, "inner"), 0);
        assert_eq!(fsys.rmdir(&root, "d"), 0);
        assert!(fsys.lookup(&root, "d").is_none());

        let node = fs.inode(1).unwrap().unwrap();
        let list = fs.read_dir(&node).unwrap();
        assert_eq!(list.len(), 2);
        check_consistency(&mut fs);
    }

    #[test]
    fn rmdir_rejects_files_and_unlink_rejects_directories() {
        let (mut fs, vol) = setup();
        let root = fs.root(&vol).unwrap();
        let fsys: &mut dyn Filesystem = &mut fs;
        fsys.mkdir(&root, "d");
        fsys.mkfile(&root, "f");
        assert_eq!(fsys.rmdir(&root, "f"), -1);
        assert_eq!(fsys.unlink(&root, "d"), -1);
        assert_eq!(fsys.rmdir(&root, "missing"), -1);
        assert_eq!(fsys.unlink(&root, "."), -1);
        check_consistency(&mut fs);
    }

    #[test]
    fn second_mkdir_fails_and_leaves_the_disk_untouched() {
        // Idempotence: the failed duplicate must not move a single byte.
        let (mut fs, vol) = setup();
        let root = fs.root(&vol).unwrap();
        let fsys: &mut dyn Filesystem = &mut fs;
        assert_eq!(fsys.mkdir(&root, "x"), 0);
        let snapshot = fs.dev.clone();
        let fsys: &mut dyn Filesystem = &mut fs;
        assert_eq!(fsys.mkdir(&root, "x"), -1);
        assert!(fs.dev == snapshot);
        check_consistency(&mut fs);
    }

    #[test]
    fn oversized_write_fails_and_restores_the_offset() {
        let (mut fs, vol) = setup();
        let root = fs.root(&vol).unwrap();
        let fsys: &mut dyn Filesystem = &mut fs;
        fsys.mkfile(&root, "f");
        let f = fsys.lookup(&root, "f").unwrap();
        let mut h = fsys.open(&f, FileMode::WRITE).unwrap();
        assert_eq!(fsys.write(&mut h, &[5u8; 10]), 10);
        assert_eq!(h.offset(), 10);

        let too_big = std::vec![0u8; MAXFILE - 9];
        assert_eq!(fsys.write(&mut h, &too_big), -1);
        assert_eq!(h.offset(), 10);

        // A maximal file still fits exactly.
        let mut h = fsys.open(&f, FileMode::WRITE).unwrap();
        let max = std::vec![9u8; MAXFILE];
        assert_eq!(fsys.write(&mut h, &max), MAXFILE as i32);
        check_consistency(&mut fs);
    }

    #[test]
    fn short_overwrite_keeps_the_tail_blocks() {
        let (mut fs, vol) = setup();
        let root = fs.root(&vol).unwrap();
        let fsys: &mut dyn Filesystem = &mut fs;
        fsys.mkfile(&root, "f");
        let f = fsys.lookup(&root, "f").unwrap();
        let mut h = fsys.open(&f, FileMode::WRITE).unwrap();
        assert_eq!(fsys.write(&mut h, &[0x11u8; 2 * BSIZE]), 2 * BSIZE as i32);
        assert_eq!(fsys.close(h), 0);

        // Reopening puts the offset back at 0; a short write at the front
        // must not free the tail block out from under the file's size.
        let mut h = fsys.open(&f, FileMode::WRITE).unwrap();
        assert_eq!(fsys.write(&mut h, &[0x22u8; 10]), 10);

        let node = fs.lookup(1, "f").unwrap().unwrap();
        assert_eq!(node.naddrs, 2);
        assert_eq!(node.size, 2 * BSIZE as u32);
        check_consistency(&mut fs);

        // The overwrite staged a full zero-filled image of block 0; the
        // tail block keeps its data.
        let mut h = fs.open(f.inum(), FileMode::READ).unwrap();
        let mut back = std::vec![0u8; 2 * BSIZE];
        assert_eq!(fs.read_file(&mut h, &mut back).unwrap(), 2 * BSIZE as u32);
        assert!(back[..10].iter().all(|&b| b == 0x22));
        assert!(back[10..BSIZE].iter().all(|&b| b == 0));
        assert!(back[BSIZE..].iter().all(|&b| b == 0x11));
    }

    #[test]
    fn name_too_long_is_rejected() {
        let (mut fs, vol) = setup();
        let root = fs.root(&vol).unwrap();
        let long: String = core::iter::repeat('x').take(300).collect();
        let fsys: &mut dyn Filesystem = &mut fs;
        assert_eq!(fsys.mkdir(&root, &long), -1);
        assert_eq!(fsys.mkfile(&root, &long), -1);
        check_consistency(&mut fs);
    }

    #[test]
    fn mount_rejects_an_unformatted_device() {
        assert_eq!(
            Kfs::mount(MemDisk::new(8), 0).err(),
            Some(Error::Corrupt)
        );
    }

    #[test]
    fn many_entries_span_multiple_directory_blocks() {
        // 40 entries push the root past two blocks and exercise inserts
        // and removals around block boundaries.
        let (mut fs, vol) = setup();
        let root = fs.root(&vol).unwrap();
        let fsys: &mut dyn Filesystem = &mut fs;
        for i in 0..40 {
            let name = std::format!("file{:02}", i);
            assert_eq!(fsys.mkfile(&root, &name), 0);
        }
        check_consistency(&mut fs);

        let node = fs.inode(1).unwrap().unwrap();
        assert!(node.naddrs >= 3);

        let fsys: &mut dyn Filesystem = &mut fs;
        for i in (0..40).step_by(2) {
            let name = std::format!("file{:02}", i);
            assert_eq!(fsys.unlink(&root, &name), 0);
        }
        check_consistency(&mut fs);

        let fsys: &mut dyn Filesystem = &mut fs;
        let mut buf = [0u8; 4096];
        let n = fsys.readdir(&root, &mut buf) as usize;
        let listing = core::str::from_utf8(&buf[..n]).unwrap();
        assert!(listing.starts_with("file01 file03 "));
        assert_eq!(listing.matches("file").count(), 20);
    }

    #[test]
    fn umount_then_remount_sees_the_same_tree() {
        let (mut fs, vol) = setup();
        let root = fs.root(&vol).unwrap();
        let fsys: &mut dyn Filesystem = &mut fs;
        fsys.mkdir(&root, "keep");
        assert_eq!(fsys.umount(vol), 0);

        let (mut fs, vol) = Kfs::mount(fs.into_device(), 1).unwrap();
        assert_eq!(vol.unit(), 1);
        let root = fs.root(&vol).unwrap();
        let fsys: &mut dyn Filesystem = &mut fs;
        assert!(fsys.lookup(&root, "keep").is_some());
    }
}
