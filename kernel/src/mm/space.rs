//! Address spaces
//!
//! One `AddressSpace` per task plus the kernel space. The kernel half of
//! every PML4 is shared (copied from the kernel space at creation); the
//! user half is owned by the task.
//!
//! All mapping state lives in the page tables themselves. Leaf entries
//! carry the logical protection in the software-available high bits, so a
//! non-present entry can describe a lazy mapping and a read-only hardware
//! entry can still record that the page is logically writable
//! (copy-on-write). Policy summary:
//!
//! - lazy zero-fill: non-present entry, materialized by `force_alloc`
//! - copy-on-write:  present read-only entry sharing a refcounted frame
//! - alias:          present entry sharing a refcounted frame (IPC grants)
//! - MMIO:           present entry outside refcounting (`map_physical`)

use core::sync::atomic::{AtomicPtr, Ordering};

use x86_64::instructions::tlb;
use x86_64::registers::control::{Cr3, Cr3Flags};
use x86_64::structures::paging::PhysFrame;
use x86_64::{PhysAddr, VirtAddr};

use super::layout::{page_aligned, PAGE_SIZE};
use super::phys;
use crate::error::KernErr;

/// Logical page protection and mapping policy bits.
///
/// `R`/`W`/`X`/`USER` describe access; `LAZY`, `COW` and `ONE` select the
/// mapping policy and never appear on the syscall surface except `ONE`
/// (eager allocation in `alloc_region`).
bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Prot: u32 {
        const R = 1 << 0;
        const W = 1 << 1;
        const X = 1 << 2;
        const USER = 1 << 3;
        /// Populate on first touch instead of at map time
        const LAZY = 1 << 4;
        /// Share the frame read-only, copy on the first write fault
        const COW = 1 << 5;
        /// Allocate eagerly (overrides the lazy default of `alloc_region`)
        const ONE = 1 << 6;
    }
}

/// The access bits a user task may request.
pub const PROT_ALL: Prot = Prot::R.union(Prot::W).union(Prot::X);

/// Hardware PTE bits.
mod pte {
    pub const PRESENT: u64 = 1 << 0;
    pub const WRITABLE: u64 = 1 << 1;
    pub const USER: u64 = 1 << 2;
    /// Software: non-present entry describing a lazy mapping
    pub const LAZY: u64 = 1 << 9;
    /// Software: present entry shared copy-on-write
    pub const COW: u64 = 1 << 10;
    /// Software: frame is MMIO / outside refcounting
    pub const MMIO: u64 = 1 << 11;
    pub const NX: u64 = 1 << 63;
    pub const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;
    /// Logical protection is stashed in the software-available high bits
    pub const PROT_SHIFT: u32 = 52;
    pub const PROT_MASK: u64 = 0x7F << PROT_SHIFT;
}

const ENTRIES: usize = 512;
/// PML4 slots 0..256 cover the lower (user) half
const USER_PML4_SLOTS: usize = 256;

fn hw_bits(prot: Prot) -> u64 {
    let mut e = pte::PRESENT;
    if prot.contains(Prot::W) {
        e |= pte::WRITABLE;
    }
    if prot.contains(Prot::USER) {
        e |= pte::USER;
    }
    if !prot.contains(Prot::X) {
        e |= pte::NX;
    }
    e
}

fn stash(prot: Prot) -> u64 {
    ((prot.bits() & 0x7F) as u64) << pte::PROT_SHIFT
}

/// Logical protection recorded in a leaf entry.
pub fn stored_prot(entry: u64) -> Prot {
    Prot::from_bits_truncate(((entry & pte::PROT_MASK) >> pte::PROT_SHIFT) as u32)
}

fn level_index(va: u64, level: u32) -> usize {
    ((va >> (12 + 9 * level)) & 0x1FF) as usize
}

unsafe fn table_ptr(table_pa: u64) -> *mut u64 {
    phys::phys_to_virt(table_pa) as *mut u64
}

/// An address space: the physical address of its PML4, or 0 before
/// `init`/after `destroy`.
#[repr(C)]
pub struct AddressSpace {
    pml4: u64,
}

/// The kernel's own address space (the loader's page tables).
static mut KSPACE: AddressSpace = AddressSpace::empty();

/// The address space currently loaded in CR3.
static CURRENT_SPACE: AtomicPtr<AddressSpace> = AtomicPtr::new(core::ptr::null_mut());

/// Adopt the boot page tables as the kernel space.
///
/// # Safety
/// Must run once, before the first `AddressSpace::init`.
pub unsafe fn adopt_boot_space() {
    let kspace = &mut *(&raw mut KSPACE);
    kspace.pml4 = Cr3::read().0.start_address().as_u64();
    CURRENT_SPACE.store(kspace, Ordering::SeqCst);
}

/// The kernel address space.
pub fn kspace() -> *mut AddressSpace {
    &raw mut KSPACE
}

/// The address space currently active on the CPU.
pub fn current_space() -> *mut AddressSpace {
    CURRENT_SPACE.load(Ordering::SeqCst)
}

/// Activate `space`, returning the previously active one.
///
/// # Safety
/// `space` must be initialized and stay alive while active.
pub unsafe fn switch_space(space: *mut AddressSpace) -> *mut AddressSpace {
    let prev = CURRENT_SPACE.swap(space, Ordering::SeqCst);
    if (*space).pml4 != (*prev).pml4 {
        Cr3::write(
            PhysFrame::containing_address(PhysAddr::new((*space).pml4)),
            Cr3Flags::empty(),
        );
    }
    prev
}

impl AddressSpace {
    /// An address space with no page tables yet.
    pub const fn empty() -> Self {
        AddressSpace { pml4: 0 }
    }

    /// Whether the space has page tables.
    pub fn is_initialized(&self) -> bool {
        self.pml4 != 0
    }

    fn is_active(&self) -> bool {
        unsafe { (*current_space()).pml4 == self.pml4 && self.pml4 != 0 }
    }

    fn flush(&self, va: u64) {
        if self.is_active() {
            tlb::flush(VirtAddr::new(va));
        }
    }

    /// Allocate a PML4 and share the kernel half.
    pub fn init(&mut self) -> Result<(), KernErr> {
        debug_assert!(!self.is_initialized());
        let pml4 = phys::alloc_zeroed().ok_or(KernErr::NoMem)?;
        unsafe {
            let src = table_ptr((*kspace()).pml4);
            let dst = table_ptr(pml4);
            for i in USER_PML4_SLOTS..ENTRIES {
                *dst.add(i) = *src.add(i);
            }
        }
        self.pml4 = pml4;
        Ok(())
    }

    /// Walk to the leaf entry for `va`, optionally creating intermediate
    /// tables.
    fn pte_ptr(&self, va: u64, create: bool) -> Option<*mut u64> {
        if self.pml4 == 0 {
            return None;
        }
        let mut table_pa = self.pml4;
        unsafe {
            for level in [3u32, 2, 1] {
                let entry = table_ptr(table_pa).add(level_index(va, level));
                if *entry & pte::PRESENT == 0 {
                    if !create {
                        return None;
                    }
                    let frame = phys::alloc_zeroed()?;
                    *entry = frame | pte::PRESENT | pte::WRITABLE | pte::USER;
                }
                table_pa = *entry & pte::ADDR_MASK;
            }
            Some(table_ptr(table_pa).add(level_index(va, 0)))
        }
    }

    /// Read the leaf entry for `va`, if any mapping (present or lazy)
    /// exists.
    pub fn lookup(&self, va: u64) -> Option<u64> {
        let entry = unsafe { *self.pte_ptr(va, false)? };
        if entry == 0 {
            None
        } else {
            Some(entry)
        }
    }

    /// Visit every non-empty leaf entry in `[start, end)`, sparsely.
    fn for_each_leaf(&self, start: u64, end: u64, mut f: impl FnMut(u64, *mut u64)) {
        if self.pml4 == 0 || start >= end {
            return;
        }
        unsafe {
            let l4 = table_ptr(self.pml4);
            for i4 in level_index(start, 3)..=level_index(end - 1, 3).min(USER_PML4_SLOTS - 1) {
                let e4 = *l4.add(i4);
                if e4 & pte::PRESENT == 0 {
                    continue;
                }
                let l3 = table_ptr(e4 & pte::ADDR_MASK);
                for i3 in 0..ENTRIES {
                    let base3 = ((i4 as u64) << 39) + ((i3 as u64) << 30);
                    if base3 + (1 << 30) <= start || base3 >= end {
                        continue;
                    }
                    let e3 = *l3.add(i3);
                    if e3 & pte::PRESENT == 0 {
                        continue;
                    }
                    let l2 = table_ptr(e3 & pte::ADDR_MASK);
                    for i2 in 0..ENTRIES {
                        let base2 = base3 + ((i2 as u64) << 21);
                        if base2 + (1 << 21) <= start || base2 >= end {
                            continue;
                        }
                        let e2 = *l2.add(i2);
                        if e2 & pte::PRESENT == 0 {
                            continue;
                        }
                        let l1 = table_ptr(e2 & pte::ADDR_MASK);
                        for i1 in 0..ENTRIES {
                            let va = base2 + ((i1 as u64) << 12);
                            if va < start || va >= end {
                                continue;
                            }
                            let leaf = l1.add(i1);
                            if *leaf != 0 {
                                f(va, leaf);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Drop one leaf entry, releasing the frame reference if owned.
    unsafe fn drop_leaf(&self, va: u64, leaf: *mut u64) {
        let entry = *leaf;
        if entry & pte::PRESENT != 0 && entry & pte::MMIO == 0 {
            phys::dec_ref(entry & pte::ADDR_MASK);
        }
        *leaf = 0;
        self.flush(va);
    }

    /// Map fresh memory at `[va, va + size)`.
    ///
    /// Lazy zero-fill by default; `Prot::ONE` allocates eagerly. An
    /// existing mapping at any page is replaced.
    pub fn map_alloc(&mut self, va: u64, size: u64, prot: Prot) -> Result<(), KernErr> {
        debug_assert!(page_aligned(va));
        let end = va.checked_add(super::layout::page_up(size)).ok_or(KernErr::Inval)?;
        let mut page = va;
        while page < end {
            let leaf = self.pte_ptr(page, true).ok_or(KernErr::NoMem)?;
            unsafe {
                if *leaf != 0 {
                    self.drop_leaf(page, leaf);
                }
                if prot.contains(Prot::ONE) {
                    let frame = phys::alloc_zeroed().ok_or(KernErr::NoMem)?;
                    *leaf = frame | hw_bits(prot) | stash(prot);
                } else {
                    *leaf = pte::LAZY | stash(prot);
                }
            }
            self.flush(page);
            page += PAGE_SIZE as u64;
        }
        Ok(())
    }

    /// Map `[src_va, src_va + size)` of `src` at `dst_va` here.
    ///
    /// Plain calls alias the source frames; `Prot::COW` (or `LAZY`)
    /// demotes both sides to read-only copy-on-write sharing. Unmapped
    /// source pages are skipped.
    ///
    /// For an alias, granting `W` on a page whose source mapping is not
    /// logically writable fails with `Inval`. A copy-on-write transfer
    /// instead intersects the requested protection with the source's,
    /// so a whole-space copy tolerates read-only text pages.
    pub fn map_from(
        &mut self,
        dst_va: u64,
        src: &AddressSpace,
        src_va: u64,
        size: u64,
        prot: Prot,
    ) -> Result<(), KernErr> {
        debug_assert!(page_aligned(src_va) && page_aligned(dst_va));
        let end = src_va.checked_add(super::layout::page_up(size)).ok_or(KernErr::Inval)?;
        let cow = prot.contains(Prot::COW) || prot.contains(Prot::LAZY);
        let mut err = None;
        src.for_each_leaf(src_va, end, |va, src_leaf| {
            if err.is_some() {
                return;
            }
            let entry = unsafe { *src_leaf };
            let src_prot = stored_prot(entry);
            if !cow && prot.contains(Prot::W) && !src_prot.contains(Prot::W) {
                err = Some(KernErr::Inval);
                return;
            }
            let target = dst_va + (va - src_va);
            let Some(dst_leaf) = self.pte_ptr(target, true) else {
                err = Some(KernErr::NoMem);
                return;
            };
            let granted = if cow {
                (prot & src_prot & PROT_ALL) | Prot::USER
            } else {
                (prot & PROT_ALL) | Prot::USER
            };
            unsafe {
                if *dst_leaf != 0 {
                    self.drop_leaf(target, dst_leaf);
                }
                if entry & pte::PRESENT == 0 {
                    // Lazy source page: propagate the lazy entry
                    *dst_leaf = pte::LAZY | stash(granted | Prot::LAZY);
                } else {
                    let frame = entry & pte::ADDR_MASK;
                    let mmio = entry & pte::MMIO;
                    if mmio == 0 {
                        phys::inc_ref(frame);
                    }
                    if cow && mmio == 0 {
                        // Demote the source to read-only sharing
                        *src_leaf = frame
                            | (hw_bits(src_prot) & !pte::WRITABLE)
                            | pte::COW
                            | stash(src_prot);
                        src.flush(va);
                        *dst_leaf =
                            frame | (hw_bits(granted) & !pte::WRITABLE) | pte::COW | stash(granted);
                    } else {
                        *dst_leaf = frame | hw_bits(granted) | mmio | stash(granted);
                    }
                }
            }
            self.flush(target);
        });
        match err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Map physical `[pa, pa + size)` at `va` (MMIO; no refcounting).
    pub fn map_physical(&mut self, va: u64, pa: u64, size: u64, prot: Prot) -> Result<(), KernErr> {
        debug_assert!(page_aligned(va) && page_aligned(pa));
        let end = va.checked_add(super::layout::page_up(size)).ok_or(KernErr::Inval)?;
        let mut page = va;
        let mut frame = pa;
        while page < end {
            let leaf = self.pte_ptr(page, true).ok_or(KernErr::NoMem)?;
            unsafe {
                if *leaf != 0 {
                    self.drop_leaf(page, leaf);
                }
                *leaf = frame | hw_bits(prot) | pte::MMIO | stash(prot);
            }
            self.flush(page);
            page += PAGE_SIZE as u64;
            frame += PAGE_SIZE as u64;
        }
        Ok(())
    }

    /// Remove every mapping in `[va, va + size)`. Idempotent.
    pub fn unmap(&mut self, va: u64, size: u64) {
        let Some(end) = va.checked_add(super::layout::page_up(size)) else {
            return;
        };
        self.for_each_leaf(va, end, |page, leaf| unsafe {
            // SAFETY: leaf comes from this space's own tables
            let entry = *leaf;
            if entry & pte::PRESENT != 0 && entry & pte::MMIO == 0 {
                phys::dec_ref(entry & pte::ADDR_MASK);
            }
            *leaf = 0;
            self.flush(page);
        });
    }

    /// Resolve a fault at `va`: materialize a lazy page or break
    /// copy-on-write sharing. Returns `Err` for anything else.
    pub fn force_alloc(&mut self, va: u64) -> Result<(), ()> {
        let page = super::layout::page_down(va);
        let leaf = self.pte_ptr(page, false).ok_or(())?;
        let entry = unsafe { *leaf };
        if entry & pte::PRESENT == 0 {
            if entry & pte::LAZY == 0 {
                return Err(());
            }
            let prot = stored_prot(entry);
            let frame = phys::alloc_zeroed().ok_or(())?;
            unsafe {
                *leaf = frame | hw_bits(prot) | stash(prot);
            }
            self.flush(page);
            return Ok(());
        }
        if entry & pte::COW != 0 {
            let prot = stored_prot(entry);
            let old = entry & pte::ADDR_MASK;
            unsafe {
                if phys::refcount(old) > 1 {
                    let new = phys::alloc_zeroed().ok_or(())?;
                    core::ptr::copy_nonoverlapping(
                        phys::phys_to_virt(old) as *const u8,
                        phys::phys_to_virt(new) as *mut u8,
                        PAGE_SIZE,
                    );
                    phys::dec_ref(old);
                    *leaf = new | hw_bits(prot) | stash(prot);
                } else {
                    *leaf = old | hw_bits(prot) | stash(prot);
                }
            }
            self.flush(page);
            return Ok(());
        }
        Err(())
    }

    /// Highest frame reference count over `[va, va + size)`.
    pub fn region_maxref(&self, va: u64, size: u64) -> i64 {
        let Some(end) = va.checked_add(size) else {
            return 0;
        };
        let mut max = 0i64;
        self.for_each_leaf(va, super::layout::page_up(end), |_, leaf| {
            let entry = unsafe { *leaf };
            if entry & pte::PRESENT != 0 && entry & pte::MMIO == 0 {
                max = max.max(phys::refcount(entry & pte::ADDR_MASK) as i64);
            }
        });
        max
    }

    /// Tear down the user half and release all page-table frames.
    pub fn destroy(&mut self) {
        if self.pml4 == 0 {
            return;
        }
        debug_assert!(!self.is_active());
        unsafe {
            let l4 = table_ptr(self.pml4);
            for i4 in 0..USER_PML4_SLOTS {
                let e4 = *l4.add(i4);
                if e4 & pte::PRESENT == 0 {
                    continue;
                }
                let l3 = table_ptr(e4 & pte::ADDR_MASK);
                for i3 in 0..ENTRIES {
                    let e3 = *l3.add(i3);
                    if e3 & pte::PRESENT == 0 {
                        continue;
                    }
                    let l2 = table_ptr(e3 & pte::ADDR_MASK);
                    for i2 in 0..ENTRIES {
                        let e2 = *l2.add(i2);
                        if e2 & pte::PRESENT == 0 {
                            continue;
                        }
                        let l1 = table_ptr(e2 & pte::ADDR_MASK);
                        for i1 in 0..ENTRIES {
                            let leaf = *l1.add(i1);
                            if leaf & pte::PRESENT != 0 && leaf & pte::MMIO == 0 {
                                phys::dec_ref(leaf & pte::ADDR_MASK);
                            }
                        }
                        phys::dec_ref(e2 & pte::ADDR_MASK);
                    }
                    phys::dec_ref(e3 & pte::ADDR_MASK);
                }
                phys::dec_ref(e4 & pte::ADDR_MASK);
            }
            phys::dec_ref(self.pml4);
        }
        self.pml4 = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prot_roundtrips_through_stash() {
        for prot in [
            Prot::R,
            Prot::R | Prot::W,
            PROT_ALL | Prot::USER,
            Prot::R | Prot::USER | Prot::LAZY,
        ] {
            assert_eq!(stored_prot(stash(prot)), prot);
        }
    }

    #[test]
    fn hw_bits_reflect_prot() {
        let rw = hw_bits(Prot::R | Prot::W | Prot::USER);
        assert_ne!(rw & pte::WRITABLE, 0);
        assert_ne!(rw & pte::USER, 0);
        assert_ne!(rw & pte::NX, 0);
        let rx = hw_bits(Prot::R | Prot::X);
        assert_eq!(rx & pte::WRITABLE, 0);
        assert_eq!(rx & pte::NX, 0);
    }

    #[test]
    fn level_indices() {
        let va = 0x7FFF_FFE0_0000u64;
        assert!(level_index(va, 3) < 256);
        assert_eq!(level_index(0, 3), 0);
        assert_eq!(level_index(0x1000, 0), 1);
        assert_eq!(level_index(1 << 21, 1), 1);
    }

    #[test]
    fn empty_space_has_no_mappings() {
        let space = AddressSpace::empty();
        assert!(!space.is_initialized());
        assert!(space.lookup(0x1000).is_none());
        assert_eq!(space.region_maxref(0, 1 << 30), 0);
    }
}
