//! Memory management
//!
//! The core consumes address spaces through a small surface: create,
//! destroy, switch, map (fresh, from another space, or physical), unmap,
//! and `force_alloc` for fault resolution. The policy (lazy zero-fill,
//! copy-on-write, aliasing) lives in `space`; `user` holds the rules for
//! touching user memory from kernel mode.

pub mod layout;
pub mod phys;
pub mod space;
pub mod user;

use core::sync::atomic::{AtomicU64, Ordering};

pub use space::{current_space, kspace, switch_space, AddressSpace, Prot, PROT_ALL};
pub use user::{user_mem_assert, user_mem_check, UserWindow};

use crate::boot::BootInfo;

static KERNEL_VIRT_BASE: AtomicU64 = AtomicU64::new(0);
static KERNEL_PHYS_BASE: AtomicU64 = AtomicU64::new(0);

/// Physical address of a kernel-image virtual address.
///
/// The loader places the kernel contiguously, so image addresses
/// translate by a constant offset. Used to expose kernel statics (task
/// table, vsyscall page) to user space read-only.
pub fn kernel_virt_to_phys(va: u64) -> u64 {
    va - KERNEL_VIRT_BASE.load(Ordering::Relaxed) + KERNEL_PHYS_BASE.load(Ordering::Relaxed)
}

/// Bring up the memory manager: frame allocator and the kernel space.
///
/// # Safety
/// Must run once, before any address-space or mapping call, with the
/// loader's page tables (including the physical direct map) active.
pub unsafe fn init(boot: &BootInfo) {
    KERNEL_VIRT_BASE.store(boot.kernel_virtual_base, Ordering::Relaxed);
    KERNEL_PHYS_BASE.store(boot.kernel_physical_base, Ordering::Relaxed);
    phys::init(boot);
    space::adopt_boot_space();
}
