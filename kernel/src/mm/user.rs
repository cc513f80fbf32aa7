//! User memory access
//!
//! Validation of user-supplied pointers and the one sanctioned way for
//! kernel code to write through another task's mappings.
//!
//! Validation is destructive by policy: a syscall handing the kernel a
//! bad pointer costs the caller its life, not an error return.

use x86_64::registers::control::{Cr0, Cr0Flags};

use super::layout::{page_down, MAX_USER_ADDRESS, PAGE_SIZE};
use super::space::{stored_prot, AddressSpace, Prot};

/// Check that `[va, va + len)` lies in user space and every page grants
/// `prot`. Returns the first offending address on failure.
pub fn user_mem_check(
    space: &AddressSpace,
    va: u64,
    len: usize,
    prot: Prot,
) -> Result<(), u64> {
    let end = va.checked_add(len as u64).ok_or(va)?;
    if end > MAX_USER_ADDRESS {
        return Err(va.max(MAX_USER_ADDRESS));
    }
    let mut page = page_down(va);
    while page < end {
        let granted = match space.lookup(page) {
            Some(entry) => stored_prot(entry),
            None => return Err(page.max(va)),
        };
        if !granted.contains(prot | Prot::USER) {
            return Err(page.max(va));
        }
        page += PAGE_SIZE as u64;
    }
    Ok(())
}

/// Validate a user pointer on behalf of the current task; destroy the
/// task and reschedule on failure.
///
/// Only returns when the whole range is accessible with `prot`.
pub fn user_mem_assert(va: u64, len: usize, prot: Prot) {
    let table = crate::task::table();
    let slot = table
        .current_slot()
        .expect("user_mem_assert with no current task");
    if let Err(bad) = user_mem_check(&table.get(slot).space, va, len, prot) {
        log::warn!(
            target: "task",
            "[{:08x}] invalid user pointer {:#x} (range {:#x}+{:#x}), destroying",
            table.get(slot).id,
            bad,
            va,
            len
        );
        crate::task::destroy(slot);
        // The current task is gone; pick another
        crate::sched::schedule();
    }
}

/// A scoped writable view of another task's memory.
///
/// Switches to the target address space and lifts CR0.WP so kernel-mode
/// stores ignore user read-only protections; both are restored on drop,
/// on every exit path. This is the only place kernel code may bypass
/// user page protections.
pub struct UserWindow {
    prev: *mut AddressSpace,
}

impl UserWindow {
    /// Open a window into `space`.
    ///
    /// # Safety
    /// `space` must be initialized. The caller must ensure every address
    /// written through the window is mapped (force-allocate first): a
    /// fault while the window is open may recurse into the page-fault
    /// path.
    pub unsafe fn open(space: *mut AddressSpace) -> Self {
        let prev = super::space::switch_space(space);
        let mut cr0 = Cr0::read();
        cr0.remove(Cr0Flags::WRITE_PROTECT);
        Cr0::write(cr0);
        UserWindow { prev }
    }

    /// Copy bytes into the target space.
    ///
    /// # Safety
    /// `dst_va` must be mapped in the window's space for `src.len()` bytes.
    pub unsafe fn write(&self, dst_va: u64, src: &[u8]) {
        core::ptr::copy_nonoverlapping(src.as_ptr(), dst_va as *mut u8, src.len());
    }

    /// Copy one value into the target space.
    ///
    /// # Safety
    /// Same as [`UserWindow::write`]; `dst_va` must be suitably aligned.
    pub unsafe fn write_val<T: Copy>(&self, dst_va: u64, val: &T) {
        core::ptr::write_unaligned(dst_va as *mut T, *val);
    }
}

impl Drop for UserWindow {
    fn drop(&mut self) {
        unsafe {
            let mut cr0 = Cr0::read();
            cr0.insert(Cr0Flags::WRITE_PROTECT);
            Cr0::write(cr0);
            super::space::switch_space(self.prev);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_rejects_kernel_range() {
        let space = AddressSpace::empty();
        assert!(user_mem_check(&space, MAX_USER_ADDRESS, 1, Prot::R).is_err());
        assert!(user_mem_check(&space, MAX_USER_ADDRESS - 4, 16, Prot::R).is_err());
        assert!(user_mem_check(&space, u64::MAX - 8, 16, Prot::R).is_err());
    }

    #[test]
    fn check_rejects_unmapped() {
        let space = AddressSpace::empty();
        assert_eq!(user_mem_check(&space, 0x1000, 8, Prot::R), Err(0x1000));
    }
}
