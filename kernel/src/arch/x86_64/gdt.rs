//! Global Descriptor Table (GDT)
//!
//! In long mode segmentation is mostly vestigial, but privilege switching
//! still needs:
//!
//! - Null descriptor (required)
//! - Kernel code/data segments (ring 0)
//! - User data/code segments (ring 3)
//! - TSS descriptor, for the trap-time stack (RSP0) and the dedicated
//!   page-fault stack (IST1)
//!
//! The trap entry stubs and the saved-frame layout bake the selector
//! values in; `init` asserts the table produced the expected ones.

use spin::Lazy;
use x86_64::instructions::segmentation::{Segment, CS, DS, ES, SS};
use x86_64::instructions::tables::load_tss;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

/// Size of the kernel trap stack and the page-fault stack
const STACK_SIZE: usize = 4096 * 5; // 20 KB

/// Interrupt Stack Table index for the page-fault handler.
///
/// Page faults get their own stack: they are the one exception that can
/// legally occur while the kernel itself touches user memory.
pub const PAGE_FAULT_IST_INDEX: u16 = 0;

/// Interrupt Stack Table index for double faults
pub const DOUBLE_FAULT_IST_INDEX: u16 = 1;

/// Kernel code segment selector
pub const KERNEL_CS: u16 = 0x08;
/// Kernel data segment selector
pub const KERNEL_DS: u16 = 0x10;
/// User data segment selector (RPL 3)
pub const USER_DS: u16 = 0x18 | 3;
/// User code segment selector (RPL 3)
pub const USER_CS: u16 = 0x20 | 3;

/// Kernel stack used when a trap arrives from ring 3
static mut KERNEL_STACK: [u8; STACK_SIZE] = [0; STACK_SIZE];

/// Task State Segment
static TSS: Lazy<TaskStateSegment> = Lazy::new(|| {
    let mut tss = TaskStateSegment::new();

    // RSP0: stack the CPU switches to on a ring-3 trap
    tss.privilege_stack_table[0] = {
        let stack_start = VirtAddr::from_ptr(&raw const KERNEL_STACK);
        stack_start + STACK_SIZE as u64
    };

    tss.interrupt_stack_table[PAGE_FAULT_IST_INDEX as usize] = {
        static mut STACK: [u8; STACK_SIZE] = [0; STACK_SIZE];
        let stack_start = VirtAddr::from_ptr(&raw const STACK);
        stack_start + STACK_SIZE as u64
    };

    tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = {
        static mut STACK: [u8; STACK_SIZE] = [0; STACK_SIZE];
        let stack_start = VirtAddr::from_ptr(&raw const STACK);
        stack_start + STACK_SIZE as u64
    };

    tss
});

/// GDT and segment selectors
struct Gdt {
    gdt: GlobalDescriptorTable,
    kernel_code: SegmentSelector,
    kernel_data: SegmentSelector,
    user_code: SegmentSelector,
    user_data: SegmentSelector,
    tss: SegmentSelector,
}

static GDT: Lazy<Gdt> = Lazy::new(|| {
    let mut gdt = GlobalDescriptorTable::new();

    let kernel_code = gdt.append(Descriptor::kernel_code_segment());
    let kernel_data = gdt.append(Descriptor::kernel_data_segment());
    let user_data = gdt.append(Descriptor::user_data_segment());
    let user_code = gdt.append(Descriptor::user_code_segment());
    let tss = gdt.append(Descriptor::tss_segment(&TSS));

    Gdt {
        gdt,
        kernel_code,
        kernel_data,
        user_code,
        user_data,
        tss,
    }
});

/// Top of the kernel trap stack.
///
/// The scheduler resets to this before halting: every wake-up re-enters
/// the trap path from a clean stack.
pub fn kernel_stack_top() -> u64 {
    VirtAddr::from_ptr(&raw const KERNEL_STACK).as_u64() + STACK_SIZE as u64
}

/// Initialize the GDT
///
/// Loads the GDT, reloads the segment registers and the TSS.
pub fn init() {
    GDT.gdt.load();

    debug_assert_eq!(GDT.kernel_code.0, KERNEL_CS);
    debug_assert_eq!(GDT.kernel_data.0, KERNEL_DS);
    debug_assert_eq!(GDT.user_code.0, USER_CS);
    debug_assert_eq!(GDT.user_data.0, USER_DS);

    unsafe {
        CS::set_reg(GDT.kernel_code);
        DS::set_reg(GDT.kernel_data);
        ES::set_reg(GDT.kernel_data);
        SS::set_reg(GDT.kernel_data);
        load_tss(GDT.tss);
    }

    log::debug!(target: "trap", "gdt loaded, rsp0 at {:#x}", kernel_stack_top());
}
