//! Two-level page-table management.
//!
//! There is one page directory per process, plus the kernel's own full
//! table at `K_PDX_BASE` which the hardware walks. The kernel part of
//! the address space is shared: per-process directories hold only the
//! user gigabyte, and `switchuvm` copies those slots into the live
//! kernel table on every context switch.

use core::cmp::min;
use core::ops::{Deref, DerefMut};
use core::ptr;

use crate::arm;
use crate::cpu::CPUS;
use crate::file::RcInode;
use crate::kalloc::Kmem;
use crate::lock::SpinLock;
use crate::memlayout::{
    p2v, v2p, K_PDX_BASE, K_PTX_BASE, KERNBASE, MMIO_PA, MMIO_SIZE, MMIO_VA, PHYSIZE, PHYSTART,
    TVSIZE, USERBOUND,
};
use crate::mmu::{
    pdx, pgrounddown, pgroundup, ptx, PdEntry, PdeFlags, PtEntry, PteFlags, HVECTORS, MBYTE,
    N_KPD_ENTRIES, N_PD_ENTRIES, N_PT_ENTRIES, PGSIZE,
};
use crate::page::Page;

/// A user page directory: the one-page prefix of the architectural
/// table, covering the user gigabyte.
#[repr(transparent)]
pub struct RawPageDir {
    entries: [PdEntry; N_PD_ENTRIES],
}

/// A second-level page table. The architecture uses the first 1 KiB;
/// the page is allocated whole.
#[repr(transparent)]
pub struct RawPageTable {
    entries: [PtEntry; N_PT_ENTRIES],
}

impl Deref for RawPageDir {
    type Target = [PdEntry; N_PD_ENTRIES];

    fn deref(&self) -> &Self::Target {
        &self.entries
    }
}

impl DerefMut for RawPageDir {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.entries
    }
}

/// An owning handle to a process's page directory. The directory owns
/// its second-level tables and every user page mapped through them;
/// `freevm` is the only way to give that ownership back.
pub struct PageDir {
    ptr: *mut RawPageDir,
}

// A PageDir is only reached through its owning process.
unsafe impl Send for PageDir {}

/// Returns the slot for `va`'s second-level entry, walking (and with
/// `alloc` set, extending) the directory. New second-level tables are
/// tagged with the caller's `l1attr`, so user mappings must pass
/// `PdeFlags::UVM`.
fn walkpgdir<'a>(
    pgdir: &'a mut [PdEntry],
    va: usize,
    l1attr: PdeFlags,
    alloc: Option<&SpinLock<Kmem>>,
) -> Option<&'a mut PtEntry> {
    if pdx(va) >= pgdir.len() {
        return None;
    }
    let pde = &mut pgdir[pdx(va)];
    let pgtab = if !pde.is_unmapped() {
        p2v(pde.addr()) as *mut RawPageTable
    } else {
        let mut page = alloc?.lock().alloc()?;
        // Make sure all those mapped bits are zero.
        page.write_bytes(0);
        let kva = page.into_usize();
        // The permissions here are overly generous; they can be further
        // restricted by the permissions in the page-table entries.
        pde.set(v2p(kva), l1attr);
        kva as *mut RawPageTable
    };
    // SAFETY: pgtab points at a table page owned by this directory, and
    // the entry borrow is tied to the directory borrow.
    Some(unsafe { &mut (*pgtab).entries[ptx(va)] })
}

/// Creates mappings for virtual addresses starting at `va` that refer
/// to physical addresses starting at `pa`. `va` and `size` might not be
/// page-aligned. Section attributes map megabytes directly in the first
/// level; table attributes map 4 KiB pages through the second level.
pub fn mappages(
    pgdir: &mut [PdEntry],
    va: usize,
    size: usize,
    mut pa: usize,
    l1attr: PdeFlags,
    l2attr: PteFlags,
    allocator: &SpinLock<Kmem>,
) -> Result<(), ()> {
    let mut a = pgrounddown(va);
    let last = pgrounddown(va + size - 1);

    if l1attr.contains(PdeFlags::SECTION) {
        while a <= last {
            if !pgdir[pdx(a)].is_unmapped() {
                panic!("remap");
            }
            pgdir[pdx(a)].set(pa, l1attr);
            a += MBYTE;
            pa += MBYTE;
        }
    } else if l1attr.contains(PdeFlags::TABLE) {
        loop {
            let pte = walkpgdir(pgdir, a, l1attr, Some(allocator)).ok_or(())?;
            if !pte.is_unmapped() {
                panic!("remap");
            }
            pte.set(pa, l2attr);
            if a == last {
                break;
            }
            a += PGSIZE;
            pa += PGSIZE;
        }
    } else {
        panic!("unknown page attribute");
    }
    Ok(())
}

impl PageDir {
    fn table(&mut self) -> &mut [PdEntry] {
        unsafe { &mut (*self.ptr).entries }
    }

    /// Kernel virtual address of the directory page, for `switchuvm`.
    fn base(&self) -> usize {
        self.ptr as usize
    }

    /// Sets up a page directory with the kernel part of the address
    /// space. Since the kernel part is shared through the live table,
    /// only the user part is allocated: one page, empty.
    pub fn setupkvm(allocator: &SpinLock<Kmem>) -> Option<PageDir> {
        let mut page = allocator.lock().alloc()?;
        page.write_bytes(0);
        Some(PageDir {
            ptr: page.into_usize() as *mut RawPageDir,
        })
    }

    /// Loads the initcode into address 0. `src` must be shorter than a
    /// page. Used only for the first process.
    pub fn uvminit(&mut self, src: &[u8], allocator: &SpinLock<Kmem>) {
        assert!(src.len() < PGSIZE, "inituvm: more than a page");
        let mut page = allocator.lock().alloc().expect("inituvm: out of memory");
        page.write_bytes(0);
        page[..src.len()].copy_from_slice(src);
        let kva = page.into_usize();
        mappages(
            self.table(),
            0,
            PGSIZE,
            v2p(kva),
            PdeFlags::UVM,
            PteFlags::UVM,
            allocator,
        )
        .expect("inituvm: mappages");
    }

    /// Loads a program segment at `va`, which must be page-aligned; the
    /// pages from `va` to `va + sz` must already be mapped.
    pub fn loaduvm(
        &mut self,
        va: usize,
        ip: &RcInode,
        offset: u32,
        sz: u32,
    ) -> Result<(), ()> {
        assert!(va % PGSIZE == 0, "loaduvm: addr must be page aligned");
        assert!(va + sz as usize <= USERBOUND, "loaduvm: beyond user bound");
        let mut i = 0;
        while i < sz as usize {
            let pte = walkpgdir(self.table(), va + i, PdeFlags::UVM, None)
                .expect("loaduvm: address should exist");
            assert!(!pte.is_unmapped(), "loaduvm: address should exist");
            let pa = pte.addr();
            let n = min(sz as usize - i, PGSIZE);
            let dst = unsafe { core::slice::from_raw_parts_mut(p2v(pa) as *mut u8, n) };
            if ip.read(dst, offset + i as u32)? != n {
                return Err(());
            }
            i += PGSIZE;
        }
        Ok(())
    }

    /// Allocates page tables and physical memory to grow the process
    /// from `oldsz` to `newsz`, which need not be page-aligned. Returns
    /// the new size, or rolls every partial allocation back on failure.
    pub fn allocuvm(
        &mut self,
        oldsz: usize,
        newsz: usize,
        allocator: &SpinLock<Kmem>,
    ) -> Result<usize, ()> {
        if newsz >= USERBOUND {
            return Err(());
        }
        if newsz < oldsz {
            return Ok(oldsz);
        }

        let mut a = pgroundup(oldsz);
        while a < newsz {
            let mut page = match allocator.lock().alloc() {
                Some(page) => page,
                None => {
                    crate::println!("allocuvm out of memory");
                    self.deallocuvm(newsz, oldsz, allocator);
                    return Err(());
                }
            };
            page.write_bytes(0);
            let kva = page.into_usize();
            if mappages(
                self.table(),
                a,
                PGSIZE,
                v2p(kva),
                PdeFlags::UVM,
                PteFlags::UVM,
                allocator,
            )
            .is_err()
            {
                // SAFETY: the page was never inserted into the table.
                allocator.lock().free(unsafe { Page::from_usize(kva) });
                self.deallocuvm(newsz, oldsz, allocator);
                return Err(());
            }
            a += PGSIZE;
        }
        Ok(newsz)
    }

    /// Deallocates user pages to bring the process size from `oldsz` to
    /// `newsz`. `oldsz` can be larger than the actual process size.
    /// Returns the new process size.
    pub fn deallocuvm(&mut self, oldsz: usize, newsz: usize, allocator: &SpinLock<Kmem>) -> usize {
        if newsz >= oldsz {
            return oldsz;
        }

        let mut a = pgroundup(newsz);
        while a < oldsz {
            match walkpgdir(self.table(), a, PdeFlags::UVM, None) {
                None => {
                    // No second-level table covers this span.
                    a += (N_PT_ENTRIES - 1) * PGSIZE;
                }
                Some(pte) if !pte.is_unmapped() => {
                    let pa = pte.addr();
                    if pa == 0 {
                        panic!("kfree");
                    }
                    // SAFETY: the table owned this page; the entry is
                    // cleared before the loop moves on.
                    allocator.lock().free(unsafe { Page::from_usize(p2v(pa)) });
                    pte.clear();
                }
                Some(_) => {}
            }
            a += PGSIZE;
        }
        newsz
    }

    /// Frees every user page, then every second-level table, then the
    /// directory page itself.
    pub fn freevm(mut self, allocator: &SpinLock<Kmem>) {
        self.deallocuvm(USERBOUND, 0, allocator);
        for i in 0..N_PD_ENTRIES {
            let pde = self.table()[i];
            if !pde.is_unmapped() {
                // SAFETY: user directories only ever hold table entries,
                // and the table pages belong to this directory.
                allocator
                    .lock()
                    .free(unsafe { Page::from_usize(p2v(pde.addr())) });
            }
        }
        // SAFETY: the directory page itself came from the allocator.
        allocator
            .lock()
            .free(unsafe { Page::from_usize(self.ptr as usize) });
    }

    /// Given this (parent) directory, builds a deep copy of the first
    /// `sz` bytes for a child: fresh physical pages, identical contents
    /// and attribute bits, no sharing.
    pub fn copyuvm(&mut self, sz: usize, allocator: &SpinLock<Kmem>) -> Result<PageDir, ()> {
        let d = PageDir::setupkvm(allocator).ok_or(())?;
        let mut d = scopeguard::guard(d, |d| d.freevm(allocator));

        let mut i = 0;
        while i < sz {
            let pte = walkpgdir(self.table(), i, PdeFlags::UVM, None)
                .expect("copyuvm: pte should exist");
            assert!(!pte.is_unmapped(), "copyuvm: page not present");
            let pa = pte.addr();
            let flags = pte.flags();
            let mut page = allocator.lock().alloc().ok_or(())?;
            unsafe {
                ptr::copy_nonoverlapping(p2v(pa) as *const u8, page.as_mut_ptr(), PGSIZE);
            }
            let kva = page.into_usize();
            if mappages(
                d.table(),
                i,
                PGSIZE,
                v2p(kva),
                PdeFlags::UVM,
                PteFlags::from_bits_truncate(flags),
                allocator,
            )
            .is_err()
            {
                // SAFETY: the page was never inserted into the table.
                allocator.lock().free(unsafe { Page::from_usize(kva) });
                return Err(());
            }
            i += PGSIZE;
        }
        Ok(scopeguard::ScopeGuard::into_inner(d))
    }

    /// Clears the user-access bits on a page; used to create an
    /// inaccessible guard page beneath the user stack.
    pub fn clearpteu(&mut self, uva: usize) {
        let pte = walkpgdir(self.table(), uva, PdeFlags::UVM, None).expect("clearpteu");
        assert!(!pte.is_unmapped(), "clearpteu");
        let masked = pte.raw() & !PteFlags::AP_USER.bits();
        pte.set_raw(masked);
    }

    /// Translates a user virtual address into the kernel's direct
    /// window, if the page is mapped and user-accessible.
    pub fn uva2ka(&mut self, uva: usize) -> Option<usize> {
        let pte = walkpgdir(self.table(), uva, PdeFlags::UVM, None)?;
        if pte.is_unmapped() || !pte.is_user() {
            return None;
        }
        Some(p2v(pte.addr()))
    }

    /// Copies `src` to user address `va` in this directory, honoring
    /// page boundaries. Most useful when this is not the current
    /// directory; `uva2ka` keeps it to user-accessible pages.
    pub fn copyout(&mut self, mut va: usize, src: &[u8]) -> Result<(), ()> {
        let mut buf = src;
        while !buf.is_empty() {
            let va0 = pgrounddown(va);
            let ka0 = self.uva2ka(va0).ok_or(())?;
            let n = min(PGSIZE - (va - va0), buf.len());
            unsafe {
                ptr::copy_nonoverlapping(buf.as_ptr(), (ka0 + (va - va0)) as *mut u8, n);
            }
            buf = &buf[n..];
            va = va0 + PGSIZE;
        }
        Ok(())
    }
}

/// Row of the kernel mapping table, shared by every address space.
struct KMap {
    virt: usize,
    phys_start: usize,
    phys_end: usize,
    l1attr: PdeFlags,
    l2attr: PteFlags,
}

/// The permanent kernel mappings: the direct RAM window (extended to
/// the probed memory size at apply time), the peripheral window, and a
/// fine-grained page for the high exception vectors.
static KMAP: [KMap; 3] = [
    KMap {
        virt: KERNBASE,
        phys_start: PHYSTART,
        phys_end: PHYSTART + PHYSIZE,
        l1attr: PdeFlags::KVM,
        l2attr: PteFlags::empty(),
    },
    KMap {
        virt: MMIO_VA,
        phys_start: MMIO_PA,
        phys_end: MMIO_PA + MMIO_SIZE,
        l1attr: PdeFlags::KVM_DEV,
        l2attr: PteFlags::empty(),
    },
    KMap {
        virt: HVECTORS,
        phys_start: PHYSTART,
        phys_end: PHYSTART + TVSIZE,
        l1attr: PdeFlags::UVM,
        l2attr: PteFlags::VECTORS,
    },
];

/// The live kernel first-level table the hardware walks.
///
/// # Safety
///
/// Only boot code and `switchuvm` may touch it, and never concurrently.
unsafe fn kernel_pgdir<'a>() -> &'a mut [PdEntry] {
    unsafe { core::slice::from_raw_parts_mut(p2v(K_PDX_BASE) as *mut PdEntry, N_KPD_ENTRIES) }
}

/// Maps the minimum address space needed to run the kernel, before the
/// size of physical memory is known: a conservative `PHYSIZE` window,
/// the peripherals, and the high vectors through the fixed boot-time
/// second-level table. Runs through the boot identity map, so the
/// tables are addressed physically.
///
/// # Safety
///
/// Must be called once, before the allocator or any driver is up.
pub unsafe fn mmu_init_stage1() {
    let l1 = unsafe { core::slice::from_raw_parts_mut(K_PDX_BASE as *mut PdEntry, N_KPD_ENTRIES) };
    let l2 =
        unsafe { core::slice::from_raw_parts_mut(K_PTX_BASE as *mut PtEntry, N_PT_ENTRIES) };

    // The boot assembly already mapped the first megabyte of the kernel
    // window; fill in the rest of the conservative window.
    let mut va = KERNBASE + MBYTE;
    let mut pa = PHYSTART + MBYTE;
    while pa < PHYSTART + PHYSIZE {
        l1[pdx(va)].set(
            pa,
            PdeFlags::SECTION | PdeFlags::AP_KRW | PdeFlags::CACHED | PdeFlags::BUFFERED,
        );
        va += MBYTE;
        pa += MBYTE;
    }

    // Peripheral windows are never cached.
    let mut va = MMIO_VA;
    let mut pa = MMIO_PA;
    while pa < MMIO_PA + MMIO_SIZE {
        l1[pdx(va)].set(pa, PdeFlags::SECTION | PdeFlags::AP_KRW);
        va += MBYTE;
        pa += MBYTE;
    }

    // Double-map the exception vectors at the top of virtual memory.
    l1[pdx(HVECTORS)].set(K_PTX_BASE, PdeFlags::TABLE);
    l2[ptx(HVECTORS)].set(PHYSTART, PteFlags::VECTORS);
}

/// Rebuilds the kernel address space from the `KMAP` table once the
/// mailbox has reported the real memory size, drops the boot identity
/// map of the first megabyte, and flushes. This replaces every mapping
/// stage 1 made; the TLB carries the kernel through the rebuild.
///
/// # Safety
///
/// Must be called once, after the first allocator range is populated.
pub unsafe fn kvmalloc(pm_size: usize, allocator: &SpinLock<Kmem>) {
    assert!(p2v(pm_size) <= MMIO_VA, "kvmalloc: pm_size too high");

    let kpgdir = unsafe { kernel_pgdir() };
    for pde in kpgdir.iter_mut() {
        pde.clear();
    }
    for (i, k) in KMAP.iter().enumerate() {
        let phys_end = if i == 0 { PHYSTART + pm_size } else { k.phys_end };
        mappages(
            kpgdir,
            k.virt,
            phys_end - k.phys_start,
            k.phys_start,
            k.l1attr,
            k.l2attr,
            allocator,
        )
        .expect("kvmalloc");
    }
    // The identity map of the first megabyte stays cleared; low
    // addresses now belong to user space.
    let base = kpgdir.as_ptr() as usize;
    arm::flush_dcache(base, base + N_KPD_ENTRIES * core::mem::size_of::<PdEntry>());
    unsafe { arm::set_pgtbase(v2p(kpgdir.as_ptr() as usize)) };
    arm::dsb_barrier();
    arm::flush_tlb();
}

/// Switches the live translation to process `pgdir` by copying its user
/// slots into the kernel table. Must run with interrupts disabled.
pub fn switchuvm(pgdir: &PageDir) {
    unsafe { CPUS.push_off() };
    unsafe {
        let kpgdir = kernel_pgdir();
        ptr::copy_nonoverlapping(
            pgdir.base() as *const PdEntry,
            kpgdir.as_mut_ptr(),
            N_PD_ENTRIES,
        );
    }
    arm::flush_idcache();
    arm::flush_tlb();
    unsafe { CPUS.pop_off() };
}

/// Switch back to kernel-only translation. Nothing to do: the same
/// directory is shared between kernel and user, and the stale user
/// slots are harmless until the next `switchuvm`.
pub fn switchkvm() {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kalloc::tests::test_arena;

    fn nfree(allocator: &SpinLock<Kmem>) -> usize {
        allocator.lock().nfree()
    }

    #[test]
    fn walk_absent_returns_none() {
        let kmem = test_arena(4);
        let mut d = PageDir::setupkvm(&kmem).unwrap();
        assert!(walkpgdir(d.table(), 0x5000, PdeFlags::UVM, None).is_none());
        d.freevm(&kmem);
    }

    #[test]
    fn walk_allocates_table_pages() {
        let kmem = test_arena(4);
        let mut d = PageDir::setupkvm(&kmem).unwrap();
        let before = nfree(&kmem);
        let pte = walkpgdir(d.table(), 0x5000, PdeFlags::UVM, Some(&kmem)).unwrap();
        assert!(pte.is_unmapped());
        assert_eq!(nfree(&kmem), before - 1);
        // A second walk in the same megabyte reuses the table.
        let _ = walkpgdir(d.table(), 0x6000, PdeFlags::UVM, Some(&kmem)).unwrap();
        assert_eq!(nfree(&kmem), before - 1);
        d.freevm(&kmem);
    }

    #[test]
    #[should_panic(expected = "remap")]
    fn remap_panics() {
        let kmem = test_arena(4);
        let mut d = PageDir::setupkvm(&kmem).unwrap();
        let pa1 = 0x1_0000;
        let pa2 = 0x2_0000;
        mappages(
            d.table(),
            0x10000,
            PGSIZE,
            pa1,
            PdeFlags::UVM,
            PteFlags::UVM,
            &kmem,
        )
        .unwrap();
        let _ = mappages(
            d.table(),
            0x10000,
            PGSIZE,
            pa2,
            PdeFlags::UVM,
            PteFlags::UVM,
            &kmem,
        );
    }

    #[test]
    fn allocuvm_grows_and_deallocuvm_shrinks() {
        let kmem = test_arena(8);
        let mut d = PageDir::setupkvm(&kmem).unwrap();
        let initial = nfree(&kmem);

        // Grow to three pages: three frames plus one table page.
        assert_eq!(d.allocuvm(PGSIZE, 3 * PGSIZE, &kmem), Ok(3 * PGSIZE));
        assert_eq!(nfree(&kmem), initial - 3);
        for va in [PGSIZE, 2 * PGSIZE] {
            let pte = *walkpgdir(d.table(), va, PdeFlags::UVM, None).unwrap();
            assert!(!pte.is_unmapped());
            assert!(pte.is_user());
            assert_eq!(pte.flags(), PteFlags::UVM.bits());
        }
        // Freshly grown memory is zeroed.
        let ka = d.uva2ka(PGSIZE).unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(ka as *const u8, PGSIZE) };
        assert!(bytes.iter().all(|&b| b == 0));

        // Growing to a smaller size is a no-op returning the old size.
        assert_eq!(d.allocuvm(3 * PGSIZE, PGSIZE, &kmem), Ok(3 * PGSIZE));

        // Shrink back down; the frames return to the allocator and the
        // entries go back to zero.
        assert_eq!(d.deallocuvm(3 * PGSIZE, 2 * PGSIZE, &kmem), 2 * PGSIZE);
        assert_eq!(nfree(&kmem), initial - 2);
        let pte = *walkpgdir(d.table(), 2 * PGSIZE, PdeFlags::UVM, None).unwrap();
        assert!(pte.is_unmapped());

        d.freevm(&kmem);
    }

    #[test]
    fn allocuvm_rejects_user_bound() {
        let kmem = test_arena(2);
        let mut d = PageDir::setupkvm(&kmem).unwrap();
        assert_eq!(d.allocuvm(0, USERBOUND, &kmem), Err(()));
        assert_eq!(d.allocuvm(0, USERBOUND + PGSIZE, &kmem), Err(()));
        d.freevm(&kmem);
    }

    #[test]
    fn allocuvm_rolls_back_on_exhaustion() {
        // Room for the directory, one table page and one frame; asking
        // for three frames must fail and undo the partial work.
        let kmem = test_arena(3);
        let mut d = PageDir::setupkvm(&kmem).unwrap();
        let initial = nfree(&kmem);
        assert_eq!(d.allocuvm(0, 3 * PGSIZE, &kmem), Err(()));
        assert_eq!(nfree(&kmem), initial - 1); // only the table page remains
        let pte = *walkpgdir(d.table(), 0, PdeFlags::UVM, None).unwrap();
        assert!(pte.is_unmapped());
        d.freevm(&kmem);
        assert_eq!(nfree(&kmem), 3);
    }

    #[test]
    fn copyuvm_is_a_deep_copy() {
        let kmem = test_arena(8);
        let mut parent = PageDir::setupkvm(&kmem).unwrap();
        assert_eq!(parent.allocuvm(0, 2 * PGSIZE, &kmem), Ok(2 * PGSIZE));
        // Scribble something recognizable into the parent.
        let ka = parent.uva2ka(0).unwrap();
        unsafe { ptr::write_bytes(ka as *mut u8, 0xab, PGSIZE) };
        parent.clearpteu(PGSIZE);

        let mut child = parent.copyuvm(2 * PGSIZE, &kmem).unwrap();
        for va in [0, PGSIZE] {
            let ppte = *walkpgdir(parent.table(), va, PdeFlags::UVM, None).unwrap();
            let cpte = *walkpgdir(child.table(), va, PdeFlags::UVM, None).unwrap();
            // No physical page is shared, attribute bits are identical.
            assert_ne!(ppte.addr(), cpte.addr());
            assert_eq!(ppte.flags(), cpte.flags());
        }
        let cka = child.uva2ka(0).unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(cka as *const u8, PGSIZE) };
        assert!(bytes.iter().all(|&b| b == 0xab));
        // The guard page stayed inaccessible in the child too.
        assert!(child.uva2ka(PGSIZE).is_none());

        child.freevm(&kmem);
        parent.freevm(&kmem);
        assert_eq!(nfree(&kmem), 8);
    }

    #[test]
    fn copyuvm_frees_partial_work_on_exhaustion() {
        let kmem = test_arena(6);
        let mut parent = PageDir::setupkvm(&kmem).unwrap();
        assert_eq!(parent.allocuvm(0, 2 * PGSIZE, &kmem), Ok(2 * PGSIZE));
        let before = nfree(&kmem); // 2 left: directory + table for child, no frames
        assert_eq!(before, 2);
        assert!(parent.copyuvm(2 * PGSIZE, &kmem).is_err());
        assert_eq!(nfree(&kmem), 2);
        parent.freevm(&kmem);
        assert_eq!(nfree(&kmem), 6);
    }

    #[test]
    fn freevm_returns_every_page_exactly_once() {
        let kmem = test_arena(12);
        let mut d = PageDir::setupkvm(&kmem).unwrap();
        assert_eq!(d.allocuvm(0, 4 * PGSIZE, &kmem), Ok(4 * PGSIZE));
        // A mapping in a different megabyte forces a second table page.
        assert!(mappages(
            d.table(),
            3 * MBYTE,
            PGSIZE,
            v2p(kmem.lock().alloc().unwrap().into_usize()),
            PdeFlags::UVM,
            PteFlags::UVM,
            &kmem,
        )
        .is_ok());
        d.freevm(&kmem);
        assert_eq!(nfree(&kmem), 12);
    }

    #[test]
    fn uva2ka_refuses_kernel_only_pages() {
        let kmem = test_arena(4);
        let mut d = PageDir::setupkvm(&kmem).unwrap();
        assert_eq!(d.allocuvm(0, PGSIZE, &kmem), Ok(PGSIZE));
        assert!(d.uva2ka(0).is_some());
        d.clearpteu(0);
        assert!(d.uva2ka(0).is_none());
        assert!(d.uva2ka(PGSIZE).is_none());
        d.freevm(&kmem);
    }

    #[test]
    fn copyout_honors_page_boundaries() {
        let kmem = test_arena(6);
        let mut d = PageDir::setupkvm(&kmem).unwrap();
        assert_eq!(d.allocuvm(0, 2 * PGSIZE, &kmem), Ok(2 * PGSIZE));

        let data: Vec<u8> = (0..=255).cycle().take(600).map(|b| b as u8).collect();
        let va = PGSIZE - 100; // straddles the first page boundary
        d.copyout(va, &data).unwrap();

        let ka0 = d.uva2ka(0).unwrap();
        let ka1 = d.uva2ka(PGSIZE).unwrap();
        let first = unsafe { core::slice::from_raw_parts((ka0 + va) as *const u8, 100) };
        let second = unsafe { core::slice::from_raw_parts(ka1 as *const u8, 500) };
        assert_eq!(first, &data[..100]);
        assert_eq!(second, &data[100..]);

        // Writing past the mapped region fails.
        assert!(d.copyout(2 * PGSIZE - 4, &data[..16]).is_err());
        d.freevm(&kmem);
    }

    #[test]
    fn fuzzed_grow_shrink_never_leaks() {
        let mut state = 0x9e37_79b9u32;
        let mut rand = move || {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state
        };

        let kmem = test_arena(40);
        let mut d = PageDir::setupkvm(&kmem).unwrap();
        let mut sz = 0usize;
        for _ in 0..200 {
            let target = (rand() % 24) as usize * PGSIZE;
            if target > sz {
                match d.allocuvm(sz, target, &kmem) {
                    Ok(newsz) => sz = newsz,
                    Err(()) => {} // exhausted; sz unchanged by rollback
                }
            } else {
                sz = d.deallocuvm(sz, target, &kmem);
            }
        }
        d.freevm(&kmem);
        assert_eq!(nfree(&kmem), 40);
    }
}
