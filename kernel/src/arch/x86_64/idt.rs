//! Interrupt Descriptor Table and trap entry stubs
//!
//! Every vector the kernel handles funnels through one naked entry
//! path that builds a complete [`Trapframe`](crate::trap::Trapframe) on
//! the kernel stack: vector and error code first (a dummy 0 for vectors
//! without one), then the data segments and all general-purpose
//! registers, in the exact order of the struct. The common tail loads
//! kernel data segments and calls `trap::trap`, which never returns;
//! the way back into a task is `trap::pop_frame`.
//!
//! All gates are interrupt gates, so the handler always starts with
//! interrupts disabled. The page-fault gate runs on its own IST stack:
//! page faults are the one trap the kernel can take while touching user
//! memory on the trap stack.

use core::arch::naked_asm;
use spin::Lazy;
use x86_64::structures::idt::InterruptDescriptorTable;
use x86_64::{PrivilegeLevel, VirtAddr};

use super::gdt;
use super::pic::IRQ_OFFSET;

/// Common save path: finish the frame begun by a vector stub, switch to
/// kernel data segments and hand the frame to the dispatcher.
#[unsafe(naked)]
extern "C" fn trap_common() {
    naked_asm!(
        // ds/es slots (no direct push of segment registers in long mode)
        "sub rsp, 16",
        "mov qword ptr [rsp + 8], 0",
        "mov qword ptr [rsp], 0",
        "mov word ptr [rsp + 8], ds",
        "mov word ptr [rsp], es",
        // General-purpose registers, rax first so r15 lands lowest
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rbp",
        "push rdi",
        "push rsi",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        // Kernel data segments for the handler
        "mov ax, {kdata}",
        "mov ds, ax",
        "mov es, ax",
        // The frame base is the argument; trap() never returns
        "mov rdi, rsp",
        "call {trap}",
        "ud2",
        kdata = const gdt::KERNEL_DS,
        trap = sym crate::trap::trap,
    )
}

/// Define an entry stub for a vector without a hardware error code.
macro_rules! trap_stub {
    ($name:ident, $vec:expr) => {
        #[unsafe(naked)]
        extern "C" fn $name() {
            naked_asm!(
                "push 0",
                "push {vec}",
                "jmp {common}",
                vec = const $vec,
                common = sym trap_common,
            )
        }
    };
    ($name:ident, $vec:expr, has_err) => {
        #[unsafe(naked)]
        extern "C" fn $name() {
            naked_asm!(
                "push {vec}",
                "jmp {common}",
                vec = const $vec,
                common = sym trap_common,
            )
        }
    };
}

trap_stub!(stub_divide, 0u8);
trap_stub!(stub_debug, 1u8);
trap_stub!(stub_nmi, 2u8);
trap_stub!(stub_breakpoint, 3u8);
trap_stub!(stub_overflow, 4u8);
trap_stub!(stub_bound, 5u8);
trap_stub!(stub_invalid_op, 6u8);
trap_stub!(stub_device, 7u8);
trap_stub!(stub_double_fault, 8u8, has_err);
trap_stub!(stub_invalid_tss, 10u8, has_err);
trap_stub!(stub_seg_not_present, 11u8, has_err);
trap_stub!(stub_stack_fault, 12u8, has_err);
trap_stub!(stub_gp_fault, 13u8, has_err);
trap_stub!(stub_page_fault, 14u8, has_err);
trap_stub!(stub_fp_error, 16u8);
trap_stub!(stub_alignment, 17u8, has_err);
trap_stub!(stub_machine_check, 18u8);
trap_stub!(stub_simd_error, 19u8);

trap_stub!(stub_irq_timer, 32u8);
trap_stub!(stub_irq_keyboard, 33u8);
trap_stub!(stub_irq_serial, 36u8);
trap_stub!(stub_irq_spurious, 39u8);
trap_stub!(stub_irq_clock, 40u8);

trap_stub!(stub_syscall, 0x30u8);

fn addr(stub: extern "C" fn()) -> VirtAddr {
    VirtAddr::new(stub as usize as u64)
}

static IDT: Lazy<InterruptDescriptorTable> = Lazy::new(|| {
    let mut idt = InterruptDescriptorTable::new();

    unsafe {
        idt.divide_error.set_handler_addr(addr(stub_divide));
        idt.debug.set_handler_addr(addr(stub_debug));
        idt.non_maskable_interrupt.set_handler_addr(addr(stub_nmi));
        idt.breakpoint
            .set_handler_addr(addr(stub_breakpoint))
            .set_privilege_level(PrivilegeLevel::Ring3);
        idt.overflow.set_handler_addr(addr(stub_overflow));
        idt.bound_range_exceeded.set_handler_addr(addr(stub_bound));
        idt.invalid_opcode.set_handler_addr(addr(stub_invalid_op));
        idt.device_not_available.set_handler_addr(addr(stub_device));
        idt.double_fault
            .set_handler_addr(addr(stub_double_fault))
            .set_stack_index(gdt::DOUBLE_FAULT_IST_INDEX);
        idt.invalid_tss.set_handler_addr(addr(stub_invalid_tss));
        idt.segment_not_present
            .set_handler_addr(addr(stub_seg_not_present));
        idt.stack_segment_fault
            .set_handler_addr(addr(stub_stack_fault));
        idt.general_protection_fault
            .set_handler_addr(addr(stub_gp_fault));
        idt.page_fault
            .set_handler_addr(addr(stub_page_fault))
            .set_stack_index(gdt::PAGE_FAULT_IST_INDEX);
        idt.x87_floating_point.set_handler_addr(addr(stub_fp_error));
        idt.alignment_check.set_handler_addr(addr(stub_alignment));
        idt.machine_check.set_handler_addr(addr(stub_machine_check));
        idt.simd_floating_point
            .set_handler_addr(addr(stub_simd_error));

        idt[IRQ_OFFSET].set_handler_addr(addr(stub_irq_timer));
        idt[IRQ_OFFSET + 1].set_handler_addr(addr(stub_irq_keyboard));
        idt[IRQ_OFFSET + 4].set_handler_addr(addr(stub_irq_serial));
        idt[IRQ_OFFSET + 7].set_handler_addr(addr(stub_irq_spurious));
        idt[IRQ_OFFSET + 8].set_handler_addr(addr(stub_irq_clock));

        // Reachable from ring 3 via `int 0x30`
        idt[0x30]
            .set_handler_addr(addr(stub_syscall))
            .set_privilege_level(PrivilegeLevel::Ring3);
    }

    idt
});

/// Load the IDT.
pub fn init() {
    IDT.load();
    log::debug!(target: "trap", "idt loaded");
}
