//! Physical frame allocator
//!
//! A free list threaded through the frames themselves, built from the
//! loader's memory map, plus a reference count per frame. The counts back
//! copy-on-write sharing and the `region_refs` syscall.
//!
//! Frames above `MAX_TRACKED` are never handed out (MMIO mappings may
//! still point at them; those bypass refcounting entirely).

use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use super::layout::PAGE_SIZE;
use crate::boot::{BootInfo, MemoryKind, MemoryRegion};

/// Highest physical address the allocator manages (1 GiB)
const MAX_TRACKED: u64 = 1 << 30;
const MAX_FRAMES: usize = (MAX_TRACKED / PAGE_SIZE as u64) as usize;

/// Base of the loader-provided direct map of physical memory
static PHYS_MAP_OFFSET: AtomicU64 = AtomicU64::new(0);

/// Per-frame reference counts
static mut REFCOUNTS: [u16; MAX_FRAMES] = [0; MAX_FRAMES];

struct FreeList {
    /// Physical address of the first free frame, 0 when exhausted
    head: u64,
    free: usize,
}

static FREE_LIST: Mutex<FreeList> = Mutex::new(FreeList { head: 0, free: 0 });

/// Kernel virtual address of a physical address, through the direct map.
#[inline]
pub fn phys_to_virt(pa: u64) -> u64 {
    PHYS_MAP_OFFSET.load(Ordering::Relaxed) + pa
}

fn refcount_slot(pa: u64) -> Option<&'static mut u16> {
    if pa >= MAX_TRACKED {
        return None;
    }
    let idx = (pa / PAGE_SIZE as u64) as usize;
    unsafe { Some(&mut (*(&raw mut REFCOUNTS))[idx]) }
}

/// Build the free list from the loader's memory map.
///
/// # Safety
/// Must be called once, before any mapping is created, with the direct
/// map already active.
pub unsafe fn init(boot: &BootInfo) {
    PHYS_MAP_OFFSET.store(boot.phys_map_offset, Ordering::Relaxed);

    let mut list = FREE_LIST.lock();
    for region in boot.memory_map() {
        if region.kind != MemoryKind::Usable as u32 {
            continue;
        }
        push_region(&mut list, region);
    }
    log::info!(
        target: "mm",
        "physical allocator: {} frames free ({} MiB)",
        list.free,
        list.free * PAGE_SIZE / (1024 * 1024)
    );
}

unsafe fn push_region(list: &mut FreeList, region: &MemoryRegion) {
    let start = super::layout::page_up(region.base);
    let end = super::layout::page_down(region.base + region.length).min(MAX_TRACKED);
    let mut pa = start;
    while pa < end {
        // Never hand out the zero frame; a 0 link terminates the list
        if pa != 0 {
            *(phys_to_virt(pa) as *mut u64) = list.head;
            list.head = pa;
            list.free += 1;
        }
        pa += PAGE_SIZE as u64;
    }
}

/// Allocate one zeroed frame with refcount 1.
pub fn alloc_zeroed() -> Option<u64> {
    let mut list = FREE_LIST.lock();
    let pa = list.head;
    if pa == 0 {
        return None;
    }
    unsafe {
        list.head = *(phys_to_virt(pa) as *const u64);
        list.free -= 1;
        core::ptr::write_bytes(phys_to_virt(pa) as *mut u8, 0, PAGE_SIZE);
    }
    if let Some(rc) = refcount_slot(pa) {
        debug_assert_eq!(*rc, 0);
        *rc = 1;
    }
    Some(pa)
}

/// Add a reference to a frame. MMIO frames outside the tracked range are
/// silently ignored.
pub fn inc_ref(pa: u64) {
    if let Some(rc) = refcount_slot(pa) {
        *rc += 1;
    }
}

/// Drop a reference; the frame returns to the free list at zero.
pub fn dec_ref(pa: u64) {
    let Some(rc) = refcount_slot(pa) else {
        return;
    };
    debug_assert!(*rc > 0);
    *rc -= 1;
    if *rc == 0 {
        let mut list = FREE_LIST.lock();
        unsafe {
            *(phys_to_virt(pa) as *mut u64) = list.head;
        }
        list.head = pa;
        list.free += 1;
    }
}

/// Current reference count of a frame (0 for untracked frames).
pub fn refcount(pa: u64) -> u16 {
    refcount_slot(pa).map(|rc| *rc).unwrap_or(0)
}

/// Number of frames currently free.
pub fn free_frames() -> usize {
    FREE_LIST.lock().free
}
