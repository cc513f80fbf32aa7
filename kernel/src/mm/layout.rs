//! Virtual address map
//!
//! Everything below `MAX_USER_ADDRESS` belongs to the task; the kernel
//! half is shared between all address spaces. Fixed user-visible pages
//! sit just below the user limit:
//!
//! | address                    | contents                              |
//! |----------------------------|---------------------------------------|
//! | `MAX_USER_ADDRESS`         | end of user space (exclusive)         |
//! | `UVSYS`                    | read-only vsyscall page               |
//! | `UENVS`                    | read-only task table                  |
//! | `USER_EXCEPTION_STACK_TOP` | top of the upcall exception stack     |
//! | `USER_STACK_TOP`           | top of the initial user stack         |

/// Page size; the only translation granule the kernel maps with
pub const PAGE_SIZE: usize = 4096;

/// First address outside user space (exclusive upper bound)
pub const MAX_USER_ADDRESS: u64 = 0x8000_0000_0000;

/// Read-only vsyscall page, mapped user-accessible into every task
pub const UVSYS: u64 = 0x7FFF_FFE0_0000;

/// Read-only view of the task table, mapped user-accessible into every task
pub const UENVS: u64 = 0x7FFF_FFC0_0000;

/// Top of the dedicated user exception stack (one page below)
pub const USER_EXCEPTION_STACK_TOP: u64 = 0x7FFF_FFA0_0000;

/// Top of the initial user stack
pub const USER_STACK_TOP: u64 = 0x7FFF_FF80_0000;

/// Size of the initial user stack mapping
pub const USER_STACK_SIZE: u64 = 16 * PAGE_SIZE as u64;

/// Round `addr` down to a page boundary
pub const fn page_down(addr: u64) -> u64 {
    addr & !(PAGE_SIZE as u64 - 1)
}

/// Round `addr` up to a page boundary
pub const fn page_up(addr: u64) -> u64 {
    (addr + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1)
}

/// Whether `addr` is page-aligned
pub const fn page_aligned(addr: u64) -> bool {
    addr & (PAGE_SIZE as u64 - 1) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding() {
        assert_eq!(page_down(0x1fff), 0x1000);
        assert_eq!(page_up(0x1001), 0x2000);
        assert_eq!(page_up(0x1000), 0x1000);
        assert!(page_aligned(0));
        assert!(page_aligned(0x3000));
        assert!(!page_aligned(0x3001));
    }

    #[test]
    fn user_windows_are_ordered_and_aligned() {
        assert!(USER_STACK_TOP < USER_EXCEPTION_STACK_TOP);
        assert!(USER_EXCEPTION_STACK_TOP < UENVS);
        assert!(UENVS < UVSYS);
        assert!(UVSYS < MAX_USER_ADDRESS);
        for addr in [UVSYS, UENVS, USER_EXCEPTION_STACK_TOP, USER_STACK_TOP] {
            assert!(page_aligned(addr));
        }
    }
}
