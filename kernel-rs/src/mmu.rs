//! ARMv7 short-descriptor translation-table formats.
//!
//! The table is split into two levels: a page directory whose entries
//! each cover 1 MiB, and 256-entry page tables whose entries each cover
//! one 4 KiB page. A directory entry either maps its megabyte directly
//! (a *section*, used only for the kernel's static mappings) or points
//! at a page table. An entry of zero means unmapped.
//!
//! A virtual address has a three-part structure:
//!
//! ```text
//! +--------12------+-------8--------+---------12----------+
//! | Page Directory |   Page Table   | Offset within Page  |
//! |      Index     |      Index     |                     |
//! +----------------+----------------+---------------------+
//!  \---- pdx(va) --/\---- ptx(va) --/
//! ```
//!
//! Entries are machine words (32 bits on the target). Per-process page
//! directories use only the first `N_PD_ENTRIES` slots so that they fit
//! in a single page, which caps user space at 1 GiB; the kernel's own
//! directory at `K_PDX_BASE` is the full 4096-entry table.

use core::mem;

use bitflags::bitflags;
#[cfg(target_arch = "arm")]
use static_assertions::const_assert_eq;

/// Bytes per page.
pub const PGSIZE: usize = 4096;

/// One megabyte, the span of a single directory entry.
pub const MBYTE: usize = 0x10_0000;

/// Offset of the page-table index in a virtual address.
pub const PTXSHIFT: usize = 12;

/// Offset of the page-directory index in a virtual address.
pub const PDXSHIFT: usize = 20;

/// Directory slots in a per-process page directory (one page's worth;
/// 1024 on the target, capping user VA at 1 GiB by convention).
pub const N_PD_ENTRIES: usize = PGSIZE / mem::size_of::<PdEntry>();

/// Directory slots in the kernel's full table.
pub const N_KPD_ENTRIES: usize = 4096;

/// Entries in a second-level page table. The table itself is 1 KiB; it
/// is stored in a page of its own.
pub const N_PT_ENTRIES: usize = 256;

/// High virtual address the exception vectors are mapped at.
pub const HVECTORS: usize = 0xffff_0000;

// The 1024-slot convention is what makes a user pgdir exactly one page.
#[cfg(target_arch = "arm")]
const_assert_eq!(N_PD_ENTRIES, 1024);

/// Page-directory index of `va`.
#[inline]
pub const fn pdx(va: usize) -> usize {
    (va >> PDXSHIFT) & 0xfff
}

/// Page-table index of `va`.
#[inline]
pub const fn ptx(va: usize) -> usize {
    (va >> PTXSHIFT) & 0xff
}

#[inline]
pub const fn pgroundup(sz: usize) -> usize {
    sz.wrapping_add(PGSIZE - 1) & !(PGSIZE - 1)
}

#[inline]
pub const fn pgrounddown(a: usize) -> usize {
    a & !(PGSIZE - 1)
}

/// Access-permission field values (before placement into an entry).
pub const AP_NOACCESS: usize = 0;
pub const AP_KRW: usize = 1;
pub const AP_UAP: usize = 2;
pub const AP_URW: usize = 3;

/// Place an AP value into subfield `n` of a page-table entry.
const fn access_perm(n: usize, ap: usize) -> usize {
    (ap & 3) << (n * 2 + 4)
}

/// AP bits for a directory entry (single field, bits 11:10).
pub const fn pdx_ap(ap: usize) -> usize {
    access_perm(3, ap)
}

/// AP bits for a page-table entry (replicated over all four subpages).
pub const fn ptx_ap(ap: usize) -> usize {
    access_perm(3, ap) | access_perm(2, ap) | access_perm(1, ap) | access_perm(0, ap)
}

bitflags! {
    /// First-level (page directory) entry attributes. Domain 0 is used
    /// for everything, which contributes no bits.
    pub struct PdeFlags: usize {
        /// Entry points at a second-level page table.
        const TABLE = 0x1;
        /// Entry maps a 1 MiB section directly.
        const SECTION = 0x2;
        const BUFFERED = 0x4;
        const CACHED = 0x8;
        const AP_KRW = pdx_ap(AP_KRW);
        const AP_URW = pdx_ap(AP_URW);

        /// User page directories: a plain table pointer. The permissive
        /// attributes are tightened per page in the L2 entries.
        const UVM = Self::TABLE.bits;
        /// Kernel RAM window sections.
        const KVM = Self::SECTION.bits | Self::AP_URW.bits
                  | Self::CACHED.bits | Self::BUFFERED.bits;
        /// Device sections: never cached or buffered.
        const KVM_DEV = Self::SECTION.bits | Self::AP_URW.bits;
    }
}

bitflags! {
    /// Second-level (page table) entry attributes for small pages.
    pub struct PteFlags: usize {
        /// Execute-never (small pages place XN at bit 0).
        const XN = 0x1;
        /// Small-page marker.
        const SMALL = 0x2;
        const BUFFERED = 0x4;
        const CACHED = 0x8;
        /// Access-permission extension: no mode may write.
        const APX = 1 << 9;
        const SHAREABLE = 1 << 10;
        const NG = 1 << 11;
        /// All four AP subfields, kernel-only read/write.
        const AP_KRW = ptx_ap(AP_KRW);
        /// All four AP subfields, user+kernel read/write.
        const AP_URW = ptx_ap(AP_URW);
        /// The user-visible bit of each AP subfield; clearing it turns a
        /// user mapping into a kernel-only one.
        const AP_USER = ptx_ap(AP_UAP);

        /// User pages: user-RW, cached, buffered small page (0xdfe).
        const UVM = (Self::AP_URW.bits ^ Self::APX.bits)
                  | Self::CACHED.bits | Self::BUFFERED.bits | Self::SMALL.bits;
        /// The high exception-vector page: kernel-only small page.
        const VECTORS = Self::AP_KRW.bits | Self::SMALL.bits;
    }
}

/// A first-level entry: upper bits hold a section base or a table base,
/// low bits the attributes. Zero is unmapped.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct PdEntry(usize);

/// A second-level small-page entry. Zero is unmapped.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct PtEntry(usize);

impl PdEntry {
    pub const fn is_unmapped(self) -> bool {
        self.0 == 0
    }

    pub fn is_section(self) -> bool {
        self.0 & PdeFlags::SECTION.bits() != 0
    }

    pub fn is_table(self) -> bool {
        self.0 & PdeFlags::TABLE.bits() != 0
    }

    /// Physical base the entry points at (table or section).
    pub const fn addr(self) -> usize {
        self.0 & !0xfff
    }

    pub const fn raw(self) -> usize {
        self.0
    }

    pub fn set(&mut self, pa: usize, attr: PdeFlags) {
        self.0 = pa | attr.bits();
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

impl PtEntry {
    pub const fn is_unmapped(self) -> bool {
        self.0 == 0
    }

    /// Physical page base.
    pub const fn addr(self) -> usize {
        self.0 & !0xfff
    }

    /// Attribute bits.
    pub const fn flags(self) -> usize {
        self.0 & 0xfff
    }

    pub const fn raw(self) -> usize {
        self.0
    }

    pub fn is_user(self) -> bool {
        self.0 & PteFlags::AP_USER.bits() != 0
    }

    pub fn set(&mut self, pa: usize, attr: PteFlags) {
        self.0 = pa | attr.bits();
    }

    pub fn set_raw(&mut self, raw: usize) {
        self.0 = raw;
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_extraction() {
        let va = 0x1234_5678;
        assert_eq!(pdx(va), 0x123);
        assert_eq!(ptx(va), 0x45);
        // Recombining indices and offset gives back the address.
        assert_eq!(pdx(va) << PDXSHIFT | ptx(va) << PTXSHIFT | (va & 0xfff), va);
    }

    #[test]
    fn rounding() {
        assert_eq!(pgroundup(0), 0);
        assert_eq!(pgroundup(1), PGSIZE);
        assert_eq!(pgroundup(PGSIZE), PGSIZE);
        assert_eq!(pgrounddown(PGSIZE + 7), PGSIZE);
        assert_eq!(pgrounddown(PGSIZE - 1), 0);
    }

    #[test]
    fn user_page_attributes() {
        // The canonical user small-page attribute word: user-RW with the
        // APX restriction removed, cached, buffered, small.
        assert_eq!(PteFlags::UVM.bits(), 0xdfe);
        assert_eq!(PteFlags::VECTORS.bits(), 0x552);
        assert_eq!(PdeFlags::KVM.bits(), 0xc0e);
        assert_eq!(PdeFlags::UVM.bits(), 0x1);
    }

    #[test]
    fn clearing_user_access() {
        let mut pte = PtEntry::default();
        pte.set(0x8000, PteFlags::UVM);
        assert!(pte.is_user());
        let masked = pte.raw() & !PteFlags::AP_USER.bits();
        pte.set_raw(masked);
        assert!(!pte.is_user());
        // The page stays mapped and kernel-writable.
        assert!(!pte.is_unmapped());
        assert_eq!(pte.addr(), 0x8000);
    }
}
