//! The file and inode facade.
//!
//! The core only ever duplicates, releases and reads these handles; the
//! on-disk filesystem behind them is a separate concern. Handles are
//! indices into refcounted tables so that `fork` and `exit` can share
//! and drop them without owning the underlying objects.

use array_macro::array;

use crate::kernel::kernel;
use crate::lock::SpinLock;
use crate::param::{NFILE, NINODE};

struct FileSlot {
    refcnt: u32,
}

/// System-wide table of open files.
pub struct FileTable {
    files: SpinLock<[FileSlot; NFILE]>,
}

/// A counted reference to an open file.
pub struct RcFile {
    idx: usize,
}

impl FileTable {
    pub const fn new() -> Self {
        Self {
            files: SpinLock::new("ftable", array![_ => FileSlot { refcnt: 0 }; NFILE]),
        }
    }

    /// Allocates a file structure.
    pub fn alloc(&self) -> Option<RcFile> {
        let mut files = self.files.lock();
        for (idx, f) in files.iter_mut().enumerate() {
            if f.refcnt == 0 {
                f.refcnt = 1;
                return Some(RcFile { idx });
            }
        }
        None
    }

    /// Increments the reference count for file `f`.
    pub fn dup(&self, f: &RcFile) -> RcFile {
        let mut files = self.files.lock();
        assert!(files[f.idx].refcnt >= 1, "filedup");
        files[f.idx].refcnt += 1;
        RcFile { idx: f.idx }
    }

    /// Drops a reference; the last one releases the slot back to the
    /// filesystem.
    pub fn close(&self, f: RcFile) {
        let mut files = self.files.lock();
        assert!(files[f.idx].refcnt >= 1, "fileclose");
        files[f.idx].refcnt -= 1;
        core::mem::forget(f);
    }
}

impl RcFile {
    pub fn dup(&self) -> RcFile {
        kernel().ftable.dup(self)
    }

    pub fn close(self) {
        kernel().ftable.close(self);
    }
}

impl Drop for RcFile {
    fn drop(&mut self) {
        panic!("RcFile must be closed, not dropped");
    }
}

struct InodeSlot {
    refcnt: u32,
    /// Image bytes the inode reads from, if any. The root directory
    /// carries none.
    data: Option<&'static [u8]>,
}

/// In-core inode table.
pub struct ICache {
    inodes: SpinLock<[InodeSlot; NINODE]>,
}

/// A counted reference to an in-core inode.
pub struct RcInode {
    idx: usize,
}

impl ICache {
    pub const fn new() -> Self {
        Self {
            inodes: SpinLock::new(
                "icache",
                // Slot 0 is reserved for the root directory.
                array![_ => InodeSlot { refcnt: 0, data: None }; NINODE],
            ),
        }
    }

    /// Brings an inode in core, backed by `data`.
    pub fn iget(&self, data: Option<&'static [u8]>) -> Option<RcInode> {
        let mut inodes = self.inodes.lock();
        for (idx, ip) in inodes.iter_mut().enumerate().skip(1) {
            if ip.refcnt == 0 {
                ip.refcnt = 1;
                ip.data = data;
                return Some(RcInode { idx });
            }
        }
        None
    }

    fn root(&self) -> RcInode {
        let mut inodes = self.inodes.lock();
        inodes[0].refcnt += 1;
        RcInode { idx: 0 }
    }

    fn idup(&self, ip: &RcInode) -> RcInode {
        let mut inodes = self.inodes.lock();
        assert!(inodes[ip.idx].refcnt >= 1, "idup");
        inodes[ip.idx].refcnt += 1;
        RcInode { idx: ip.idx }
    }

    fn iput(&self, ip: RcInode) {
        let mut inodes = self.inodes.lock();
        assert!(inodes[ip.idx].refcnt >= 1, "iput");
        inodes[ip.idx].refcnt -= 1;
        if inodes[ip.idx].refcnt == 0 {
            inodes[ip.idx].data = None;
        }
        core::mem::forget(ip);
    }

    fn read(&self, ip: &RcInode, dst: &mut [u8], off: u32) -> Result<usize, ()> {
        let inodes = self.inodes.lock();
        let data = inodes[ip.idx].data.ok_or(())?;
        let off = off as usize;
        if off > data.len() {
            return Err(());
        }
        let n = core::cmp::min(dst.len(), data.len() - off);
        dst[..n].copy_from_slice(&data[off..off + n]);
        Ok(n)
    }
}

impl RcInode {
    pub fn dup(&self) -> RcInode {
        kernel().icache.idup(self)
    }

    pub fn put(self) {
        kernel().icache.iput(self);
    }

    /// Reads at most `dst.len()` bytes starting at byte offset `off`.
    pub fn read(&self, dst: &mut [u8], off: u32) -> Result<usize, ()> {
        kernel().icache.read(self, dst, off)
    }
}

impl Drop for RcInode {
    fn drop(&mut self) {
        panic!("RcInode must be put, not dropped");
    }
}

/// Path lookup. With the disk filesystem out of the picture only the
/// root resolves.
pub fn namei(path: &str) -> Option<RcInode> {
    if path == "/" {
        Some(kernel().icache.root())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kalloc::tests::test_arena;
    use crate::mmu::PGSIZE;
    use crate::vm::PageDir;

    #[test]
    fn file_refcounts() {
        let f = kernel().ftable.alloc().unwrap();
        let f2 = f.dup();
        f.close();
        f2.close();
        // The slot is reusable afterwards.
        let again = kernel().ftable.alloc().unwrap();
        again.close();
    }

    #[test]
    fn root_lookup_only() {
        assert!(namei("/console").is_none());
        let root = namei("/").unwrap();
        let root2 = root.dup();
        root.put();
        root2.put();
    }

    #[test]
    fn inode_read_window() {
        static DATA: [u8; 10] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9];
        let ip = kernel().icache.iget(Some(&DATA)).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(ip.read(&mut buf, 3), Ok(4));
        assert_eq!(buf, [3, 4, 5, 6]);
        // Short read at the tail, error past the end.
        assert_eq!(ip.read(&mut buf, 8), Ok(2));
        assert!(ip.read(&mut buf, 11).is_err());
        ip.put();
    }

    #[test]
    fn loaduvm_fills_mapped_pages() {
        static IMAGE: [u8; PGSIZE + 32] = {
            let mut img = [0u8; PGSIZE + 32];
            let mut i = 0;
            while i < img.len() {
                img[i] = (i % 251) as u8;
                i += 1;
            }
            img
        };

        let kmem = test_arena(8);
        let mut d = PageDir::setupkvm(&kmem).unwrap();
        assert_eq!(d.allocuvm(0, 2 * PGSIZE, &kmem), Ok(2 * PGSIZE));

        let ip = kernel().icache.iget(Some(&IMAGE)).unwrap();
        d.loaduvm(0, &ip, 0, IMAGE.len() as u32).unwrap();

        let ka0 = d.uva2ka(0).unwrap();
        let ka1 = d.uva2ka(PGSIZE).unwrap();
        let first = unsafe { core::slice::from_raw_parts(ka0 as *const u8, PGSIZE) };
        let second = unsafe { core::slice::from_raw_parts(ka1 as *const u8, 32) };
        assert_eq!(first, &IMAGE[..PGSIZE]);
        assert_eq!(second, &IMAGE[PGSIZE..]);

        ip.put();
        d.freevm(&kmem);
    }
}
