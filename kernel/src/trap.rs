//! Trap handling
//!
//! Every trap, fault and interrupt funnels through `trap()`: the entry
//! stubs in `arch::x86_64::idt` push a complete [`Trapframe`] and call in
//! with interrupts disabled. The dispatcher copies the frame into the
//! current task, routes by trap number, and leaves through either
//! `task::run` or the scheduler. Nothing here ever returns to the stub.
//!
//! Page faults take a fast path before any bookkeeping: `force_alloc`
//! resolves lazy and copy-on-write faults (from kernel or user mode) and
//! resumes on the spot. Everything else becomes a user upcall or a death
//! sentence.

use core::arch::naked_asm;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use x86_64::registers::control::Cr2;

use crate::arch::x86_64::pic::{self, irq, IRQ_OFFSET};
use crate::arch::x86_64::{pit, rtc};
use crate::mm::layout::{page_down, PAGE_SIZE, USER_EXCEPTION_STACK_TOP};
use crate::mm::{self, Prot, UserWindow};
use crate::task::{self, TaskStatus};
use crate::{console, sched, syscall, vsys};

/// Trap vector numbers
pub mod vector {
    pub const DIVIDE: u64 = 0;
    pub const DEBUG: u64 = 1;
    pub const NMI: u64 = 2;
    pub const BREAKPOINT: u64 = 3;
    pub const OVERFLOW: u64 = 4;
    pub const BOUND: u64 = 5;
    pub const INVALID_OP: u64 = 6;
    pub const DEVICE: u64 = 7;
    pub const DOUBLE_FAULT: u64 = 8;
    pub const INVALID_TSS: u64 = 10;
    pub const SEG_NOT_PRESENT: u64 = 11;
    pub const STACK_FAULT: u64 = 12;
    pub const GP_FAULT: u64 = 13;
    pub const PAGE_FAULT: u64 = 14;
    pub const FP_ERROR: u64 = 16;
    pub const ALIGNMENT: u64 = 17;
    pub const MACHINE_CHECK: u64 = 18;
    pub const SIMD_ERROR: u64 = 19;
    pub const SYSCALL: u64 = 0x30;

    pub const IRQ_TIMER: u64 = super::IRQ_OFFSET as u64 + super::irq::TIMER as u64;
    pub const IRQ_KEYBOARD: u64 = super::IRQ_OFFSET as u64 + super::irq::KEYBOARD as u64;
    pub const IRQ_SERIAL: u64 = super::IRQ_OFFSET as u64 + super::irq::COM1 as u64;
    pub const IRQ_SPURIOUS: u64 = super::IRQ_OFFSET as u64 + super::irq::SPURIOUS as u64;
    pub const IRQ_CLOCK: u64 = super::IRQ_OFFSET as u64 + super::irq::RTC as u64;
}

/// Page-fault error code bits
pub mod fault_err {
    /// Fault was a protection violation (not a missing page)
    pub const PRESENT: u64 = 1 << 0;
    /// Fault was caused by a write
    pub const WRITE: u64 = 1 << 1;
    /// Fault came from user mode
    pub const USER: u64 = 1 << 2;
    /// Fault was an instruction fetch
    pub const FETCH: u64 = 1 << 4;
}

/// General-purpose registers in saved-frame order.
///
/// Field order matches the entry-stub push sequence; the offsets are load
/// bearing for the stubs and for the user-space trampoline.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct PushRegs {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
}

/// A complete saved register frame, as built by the trap entry stubs.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Trapframe {
    pub regs: PushRegs,
    pub es: u64,
    pub ds: u64,
    pub trapno: u64,
    /// Hardware error code, 0 for vectors that do not push one
    pub err: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl Trapframe {
    pub const fn zeroed() -> Self {
        Trapframe {
            regs: PushRegs {
                r15: 0,
                r14: 0,
                r13: 0,
                r12: 0,
                r11: 0,
                r10: 0,
                r9: 0,
                r8: 0,
                rsi: 0,
                rdi: 0,
                rbp: 0,
                rdx: 0,
                rcx: 0,
                rbx: 0,
                rax: 0,
            },
            es: 0,
            ds: 0,
            trapno: 0,
            err: 0,
            rip: 0,
            cs: 0,
            rflags: 0,
            rsp: 0,
            ss: 0,
        }
    }

    /// Whether the frame was saved while executing in user mode.
    pub fn from_user(&self) -> bool {
        self.cs & 3 == 3
    }
}

/// The frame the kernel hands to the user upcall, on the user's stack.
///
/// Field offsets are shared with the user trampoline; `err` doubles as
/// the signal number for signal frames.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct UTrapframe {
    pub err: u64,
    pub fault_va: u64,
    pub regs: PushRegs,
    pub rflags: u64,
    pub rip: u64,
    pub rsp: u64,
}

/// No recursive kernel page faults: set on entry to the fault path and
/// cleared before resuming.
static IN_PAGE_FAULT: AtomicBool = AtomicBool::new(false);

/// Ticks since boot
static TICKS: AtomicU64 = AtomicU64::new(0);
/// Wall-clock seconds at boot, sampled from the RTC
static BOOT_EPOCH: AtomicU64 = AtomicU64::new(0);

/// Seed the wall clock and publish the first vsyscall value.
pub fn init_clock() {
    let epoch = rtc::epoch_now();
    BOOT_EPOCH.store(epoch, Ordering::Relaxed);
    vsys::publish(vsys::VSYS_GETTIME, epoch as u32);
    log::info!(target: "trap", "wall clock at {} seconds since epoch", epoch);
}

/// Current wall-clock seconds (boot reading advanced by the tick count).
pub fn wall_clock() -> u64 {
    BOOT_EPOCH.load(Ordering::Relaxed) + TICKS.load(Ordering::Relaxed) / pit::TICK_HZ as u64
}

/// Clear the fault-recursion flag.
///
/// Called when the task that faulted is destroyed mid-handling, so the
/// next fault starts clean.
pub fn reset_page_fault_flag() {
    IN_PAGE_FAULT.store(false, Ordering::Relaxed);
}

fn tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
    vsys::publish(vsys::VSYS_GETTIME, wall_clock() as u32);
}

/// Human-readable trap name
fn trap_name(trapno: u64) -> &'static str {
    match trapno {
        vector::DIVIDE => "divide error",
        vector::DEBUG => "debug",
        vector::NMI => "non-maskable interrupt",
        vector::BREAKPOINT => "breakpoint",
        vector::OVERFLOW => "overflow",
        vector::BOUND => "bound range exceeded",
        vector::INVALID_OP => "invalid opcode",
        vector::DEVICE => "device not available",
        vector::DOUBLE_FAULT => "double fault",
        vector::INVALID_TSS => "invalid TSS",
        vector::SEG_NOT_PRESENT => "segment not present",
        vector::STACK_FAULT => "stack fault",
        vector::GP_FAULT => "general protection",
        vector::PAGE_FAULT => "page fault",
        vector::FP_ERROR => "x87 floating-point error",
        vector::ALIGNMENT => "alignment check",
        vector::MACHINE_CHECK => "machine check",
        vector::SIMD_ERROR => "SIMD floating-point exception",
        vector::SYSCALL => "system call",
        v if (32..48).contains(&v) => "hardware interrupt",
        _ => "(unknown trap)",
    }
}

/// Dump a saved frame to the log.
pub fn log_trapframe(tf: &Trapframe) {
    log::error!(target: "trap", "trap {:#x} ({}) err {:#x}", tf.trapno, trap_name(tf.trapno), tf.err);
    log::error!(target: "trap", "  rip {:#018x} cs {:#x} rflags {:#018x}", tf.rip, tf.cs, tf.rflags);
    log::error!(target: "trap", "  rsp {:#018x} ss {:#x} ds {:#x} es {:#x}", tf.rsp, tf.ss, tf.ds, tf.es);
    let r = &tf.regs;
    log::error!(target: "trap", "  rax {:#018x} rbx {:#018x} rcx {:#018x}", r.rax, r.rbx, r.rcx);
    log::error!(target: "trap", "  rdx {:#018x} rsi {:#018x} rdi {:#018x}", r.rdx, r.rsi, r.rdi);
    log::error!(target: "trap", "  rbp {:#018x} r8  {:#018x} r9  {:#018x}", r.rbp, r.r8, r.r9);
    log::error!(target: "trap", "  r10 {:#018x} r11 {:#018x} r12 {:#018x}", r.r10, r.r11, r.r12);
    log::error!(target: "trap", "  r13 {:#018x} r14 {:#018x} r15 {:#018x}", r.r13, r.r14, r.r15);
    if tf.trapno == vector::PAGE_FAULT {
        log::error!(
            target: "trap",
            "  fault [{}, {}, {}]",
            if tf.err & fault_err::USER != 0 { "user" } else { "kernel" },
            if tf.err & fault_err::WRITE != 0 {
                "write"
            } else if tf.err & fault_err::FETCH != 0 {
                "execute"
            } else {
                "read"
            },
            if tf.err & fault_err::PRESENT != 0 { "protection" } else { "not-present" },
        );
    }
}

/// Restore a saved frame and return to the interrupted context.
///
/// # Safety
/// `tf` must point at a complete, valid frame whose code segment and
/// stack are safe to return into. The frame must stay readable for the
/// duration of the restore (task frames live in the static task table).
#[unsafe(naked)]
pub unsafe extern "C" fn pop_frame(tf: *const Trapframe) -> ! {
    naked_asm!(
        "mov rsp, rdi",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rsi",
        "pop rdi",
        "pop rbp",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "mov es, word ptr [rsp]",
        "mov ds, word ptr [rsp + 8]",
        "add rsp, 32", // skip es, ds, trapno, err
        "iretq",
    )
}

/// Main trap entry, called from the stubs with a full frame on the
/// kernel stack and interrupts disabled.
///
/// # Safety
/// Only the entry stubs may call this.
pub unsafe extern "C" fn trap(tf: &mut Trapframe) -> ! {
    debug_assert!(!x86_64::registers::rflags::read()
        .contains(x86_64::registers::rflags::RFlags::INTERRUPT_FLAG));

    // Page-fault fast path: lazy and copy-on-write resolution, valid for
    // kernel-mode faults too (the kernel writes through user mappings).
    if tf.trapno == vector::PAGE_FAULT {
        assert!(
            !IN_PAGE_FAULT.swap(true, Ordering::Relaxed),
            "recursive kernel page fault"
        );
        let va = Cr2::read_raw();
        let space = mm::current_space();
        let resolved = (*space).force_alloc(va).is_ok();
        log::trace!(
            target: "pagefault",
            "fault va={:#x} rip={:#x} err={:#x} -> {}",
            va,
            tf.rip,
            tf.err,
            if resolved { "resolved by kernel" } else { "unresolved" }
        );
        if resolved {
            IN_PAGE_FAULT.store(false, Ordering::Relaxed);
            pop_frame(tf);
        }

        match task::table().current_slot() {
            Some(slot) => {
                task::table().get_mut(slot).frame = *tf;
                page_fault_handler(slot, va);
            }
            None => {
                log_trapframe(tf);
                panic!("page fault with no current task");
            }
        }
    }

    let Some(slot) = task::table().current_slot() else {
        // Interrupt while halted in the scheduler: service it and rescan
        idle_trap(tf);
    };

    // Copy the frame so the task restarts at the trap point; everything
    // below operates on the saved copy, not the stack frame.
    task::table().get_mut(slot).frame = *tf;

    log::trace!(
        target: "trap",
        "[{:08x}] trap {:#x} ({})",
        task::table().get(slot).id,
        tf.trapno,
        trap_name(tf.trapno)
    );

    dispatch(slot, &mut task::table().get_mut(slot).frame);

    // No other task was scheduled on the way; resume the current one if
    // that still makes sense.
    let table = task::table();
    match table.current_slot() {
        Some(slot) if table.get(slot).status == TaskStatus::Running => task::run(slot),
        _ => sched::schedule(),
    }
}

/// Interrupts that arrive while no task is current (the halt loop).
fn idle_trap(tf: &Trapframe) -> ! {
    match tf.trapno {
        vector::IRQ_TIMER => {
            pic::end_of_interrupt(irq::TIMER);
            tick();
        }
        vector::IRQ_CLOCK => {
            rtc::ack();
            pic::end_of_interrupt(irq::RTC);
        }
        vector::IRQ_KEYBOARD => {
            console::keyboard_interrupt();
            pic::end_of_interrupt(irq::KEYBOARD);
        }
        vector::IRQ_SERIAL => {
            console::serial_interrupt();
            pic::end_of_interrupt(irq::COM1);
        }
        vector::IRQ_SPURIOUS => {}
        _ => {
            log_trapframe(tf);
            panic!("unhandled trap {:#x} while idle", tf.trapno);
        }
    }
    sched::schedule();
}

/// Route one trap for the current task. `tf` aliases the task's saved
/// frame.
fn dispatch(slot: usize, tf: &mut Trapframe) {
    match tf.trapno {
        vector::SYSCALL => {
            let r = &tf.regs;
            let ret = syscall::dispatch(r.rax, r.rdx, r.rcx, r.rbx, r.rdi, r.rsi, r.r8);
            tf.regs.rax = ret as u64;
        }
        vector::BREAKPOINT => {
            // No interactive monitor; report and resume
            log::info!(
                target: "trap",
                "[{:08x}] breakpoint at {:#x}",
                task::table().get(slot).id,
                tf.rip
            );
        }
        vector::IRQ_TIMER => {
            pic::end_of_interrupt(irq::TIMER);
            tick();
            sched::schedule();
        }
        vector::IRQ_CLOCK => {
            rtc::ack();
            pic::end_of_interrupt(irq::RTC);
            tick();
            sched::schedule();
        }
        vector::IRQ_KEYBOARD => {
            console::keyboard_interrupt();
            pic::end_of_interrupt(irq::KEYBOARD);
            sched::schedule();
        }
        vector::IRQ_SERIAL => {
            console::serial_interrupt();
            pic::end_of_interrupt(irq::COM1);
            sched::schedule();
        }
        vector::IRQ_SPURIOUS => {
            if pic::is_spurious() {
                log::trace!(target: "trap", "spurious interrupt on irq 7");
            } else {
                pic::end_of_interrupt(irq::SPURIOUS);
            }
        }
        _ => {
            log_trapframe(tf);
            if !tf.from_user() {
                panic!("unhandled trap {:#x} in kernel", tf.trapno);
            }
            log::warn!(
                target: "task",
                "[{:08x}] killed by unhandled {}",
                task::table().get(slot).id,
                trap_name(tf.trapno)
            );
            task::destroy(slot);
        }
    }
}

/// Unresolved page fault: panic for kernel mode, divert user mode into
/// the page-fault upcall.
fn page_fault_handler(slot: usize, va: u64) -> ! {
    let frame = task::table().get(slot).frame;

    if !frame.from_user() {
        log_trapframe(&frame);
        panic!("kernel page fault at {:#x}", va);
    }

    if task::table().get(slot).upcall == 0 {
        log::warn!(
            target: "pagefault",
            "[{:08x}] user fault va={:#x} rip={:#x} err={:#x}, no upcall",
            task::table().get(slot).id,
            va,
            frame.rip,
            frame.err
        );
        task::destroy(slot);
        sched::schedule();
    }

    // Keep the frame copy out of the fault path: materialize the
    // exception stack page before writing through the user mapping.
    let _ = task::table()
        .get_mut(slot)
        .space
        .force_alloc(USER_EXCEPTION_STACK_TOP - PAGE_SIZE as u64);

    // Recursive faults stay on the exception stack, leaving one scratch
    // word for the trampoline's return; fresh faults start at the top.
    let exception_base = USER_EXCEPTION_STACK_TOP - PAGE_SIZE as u64;
    let utf_size = core::mem::size_of::<UTrapframe>() as u64;
    let utf_va = if frame.rsp > exception_base && frame.rsp < USER_EXCEPTION_STACK_TOP {
        frame.rsp - 8 - utf_size
    } else {
        USER_EXCEPTION_STACK_TOP - utf_size
    };

    mm::user_mem_assert(utf_va, utf_size as usize, Prot::W);

    let utf = UTrapframe {
        err: frame.err,
        fault_va: va,
        regs: frame.regs,
        rflags: frame.rflags,
        rip: frame.rip,
        rsp: frame.rsp,
    };

    {
        let task = task::table().get_mut(slot);
        task.frame.rsp = utf_va;
        task.frame.rip = task.upcall;
    }

    unsafe {
        let _ = task::table().get_mut(slot).space.force_alloc(page_down(utf_va));
        let window = UserWindow::open(&mut task::table().get_mut(slot).space);
        window.write_val(utf_va, &utf);
    }

    reset_page_fault_flag();
    task::run(slot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{offset_of, size_of};

    #[test]
    fn frame_layouts_match_the_abi() {
        assert_eq!(size_of::<PushRegs>(), 120);
        assert_eq!(size_of::<Trapframe>(), 192);
        assert_eq!(size_of::<UTrapframe>(), 160);

        // Offsets the entry stubs and trampoline depend on
        assert_eq!(offset_of!(Trapframe, es), 120);
        assert_eq!(offset_of!(Trapframe, ds), 128);
        assert_eq!(offset_of!(Trapframe, trapno), 136);
        assert_eq!(offset_of!(Trapframe, err), 144);
        assert_eq!(offset_of!(Trapframe, rip), 152);
        assert_eq!(offset_of!(Trapframe, rsp), 176);
        assert_eq!(offset_of!(UTrapframe, rip), 144);
        assert_eq!(offset_of!(UTrapframe, rsp), 152);
    }

    #[test]
    fn user_mode_detection() {
        let mut tf = Trapframe::zeroed();
        tf.cs = crate::arch::x86_64::gdt::USER_CS as u64;
        assert!(tf.from_user());
        tf.cs = crate::arch::x86_64::gdt::KERNEL_CS as u64;
        assert!(!tf.from_user());
    }
}
