//! Signals
//!
//! A small POSIX-flavored signal layer built on the page-fault upcall
//! machinery. The kernel never calls a handler: it queues `{action
//! snapshot, siginfo}` pairs, and at the moment a task is about to
//! resume, rewrites the saved frame so the task re-enters user space in
//! its upcall trampoline with the pending signal on its stack. The
//! trampoline invokes the handler and returns through
//! `env_set_trapframe`.
//!
//! KILL, STOP and CONT never reach the queue: they act on the task
//! synchronously at post time.

pub mod queue;

pub use queue::{QueuedSignal, SignalQueue, SIG_QUEUE_SIZE};

use crate::error::{KernErr, SysResult};
use crate::mm::layout::page_down;
use crate::mm::{Prot, UserWindow};
use crate::task::{self, TaskId};
use crate::trap::UTrapframe;

/// Signal numbers (wire values).
pub const SIGINT: i32 = 1;
pub const SIGKILL: i32 = 2;
pub const SIGPIPE: i32 = 3;
pub const SIGUSR1: i32 = 4;
pub const SIGUSR2: i32 = 5;
pub const SIGTERM: i32 = 6;
pub const SIGCHLD: i32 = 7;
pub const SIGSTOP: i32 = 8;
pub const SIGCONT: i32 = 9;

/// Number of signals
pub const NSIG: i32 = 9;

/// Handler sentinel: default action
pub const SIG_DFL: u64 = 0;
/// Handler sentinel: ignore
pub const SIG_IGN: u64 = 1;

/// `sigaction` flags
pub mod sa_flags {
    /// Don't raise SIGCHLD when a child stops or continues
    pub const NOCLDSTOP: u32 = 0x0000_0001;
    /// Handler takes `(signo, siginfo, context)` instead of `(signo)`
    pub const SIGINFO: u32 = 0x0000_0004;
    /// Don't add the delivered signal to the mask during handling
    pub const NODEFER: u32 = 0x4000_0000;
    /// Reset the action after one delivery
    pub const RESETHAND: u32 = 0x8000_0000;
    /// Every flag the kernel understands
    pub const ALL: u32 = NOCLDSTOP | SIGINFO | NODEFER | RESETHAND;
}

/// `sigprocmask` operations
pub mod sig_how {
    pub const BLOCK: u64 = 0;
    pub const UNBLOCK: u64 = 1;
    pub const SETMASK: u64 = 2;
}

/// Mask bit for a signal number.
pub const fn mask_bit(signo: i32) -> u32 {
    1 << (signo - 1)
}

/// Mask of every defined signal.
pub const ALL_SIGNALS: u32 = (1 << NSIG) - 1;

/// Signals that can never be blocked, waited for, or have their action
/// changed.
pub const UNCATCHABLE: u32 = mask_bit(SIGKILL) | mask_bit(SIGSTOP) | mask_bit(SIGCONT);

/// Whether `signo` names a defined signal.
pub const fn valid_signo(signo: i32) -> bool {
    signo >= SIGINT && signo <= NSIG
}

/// Signals whose default (and RESETHAND reset) action is ignore rather
/// than termination.
pub const fn default_ignored(signo: i32) -> bool {
    matches!(signo, SIGUSR1 | SIGUSR2 | SIGCHLD | SIGCONT)
}

/// Strip undefined and unblockable bits from a user-supplied mask.
pub const fn sanitize_mask(set: u32) -> u32 {
    set & ALL_SIGNALS & !UNCATCHABLE
}

/// One entry of the per-task action table.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SigAction {
    /// User VA of the handler, or `SIG_DFL` / `SIG_IGN`
    pub handler: u64,
    /// Blocked while the handler runs
    pub mask: u32,
    pub flags: u32,
}

impl SigAction {
    pub const fn zeroed() -> Self {
        SigAction {
            handler: SIG_DFL,
            mask: 0,
            flags: 0,
        }
    }
}

/// What the handler learns about a delivery.
///
/// `marker` is always `0xffff_ffff` for queued signals: the upcall
/// trampoline reads it to tell a signal frame from a page-fault frame.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SigInfo {
    pub signo: i32,
    pub code: i32,
    /// Id of the posting task
    pub pid: i32,
    pub marker: u32,
    /// Faulting address, 0 for queued signals
    pub addr: u64,
    /// Value passed to `sigqueue`
    pub value: u64,
}

impl SigInfo {
    pub const fn zeroed() -> Self {
        SigInfo {
            signo: 0,
            code: 0,
            pid: 0,
            marker: 0,
            addr: 0,
            value: 0,
        }
    }
}

/// Action table for a root task: default everything, except the signals
/// whose default is ignore.
pub fn root_actions() -> [SigAction; NSIG as usize] {
    let mut actions = [SigAction::zeroed(); NSIG as usize];
    for signo in SIGINT..=NSIG {
        if default_ignored(signo) {
            actions[(signo - 1) as usize].handler = SIG_IGN;
        }
    }
    actions
}

/// Size of the argument block pushed on the user stack for a delivery:
/// the queued signal, the saved mask word plus padding, the trap-time
/// frame, and a trailing pad keeping the block 16-byte aligned.
pub const SIG_FRAME_SIZE: u64 = 48 + 4 + 4 + 160 + 8;

/// Offset of the saved mask inside the argument block.
const FRAME_MASK_OFFSET: u64 = 48;
/// Offset of the saved trap-time frame inside the argument block.
const FRAME_UTF_OFFSET: u64 = 56;

/// Post a signal to `target`.
///
/// KILL destroys, STOP/CONT toggle the stopped flag (notifying the
/// parent unless its CHLD action has `NOCLDSTOP`), everything else is
/// queued with a snapshot of the current action. Does not return if the
/// post destroys the calling task itself.
pub fn post(target: TaskId, signo: i32, value: u64) -> SysResult {
    if !valid_signo(signo) {
        return Err(KernErr::Inval);
    }

    let table = task::table();
    let slot = table.resolve(target, false)?;
    let sender = table.current_slot().map(|s| table.get(s).id).unwrap_or(0);

    log::trace!(
        target: "signal",
        "post signo {} from {:08x} to {:08x}",
        signo,
        sender,
        table.get(slot).id
    );

    match signo {
        SIGKILL => {
            task::destroy(slot);
            return Ok(0);
        }
        SIGSTOP => {
            table.get_mut(slot).sig.stopped = true;
            return notify_parent(slot);
        }
        SIGCONT if table.get(slot).sig.stopped => {
            table.get_mut(slot).sig.stopped = false;
            return notify_parent(slot);
        }
        _ => {}
    }

    let action = table.get(slot).sig.actions[(signo - 1) as usize];

    if table.get(slot).upcall == 0 {
        // Nothing to divert into: apply the default disposition now.
        if action.handler == SIG_DFL {
            task::destroy(slot);
            return Ok(0);
        } else if action.handler == SIG_IGN {
            return Ok(0);
        }
        // A real handler without an upcall still queues; the task dies
        // at delivery when the zero upcall is resumed.
    }

    let entry = QueuedSignal {
        action,
        info: SigInfo {
            signo,
            code: 0,
            pid: sender,
            marker: 0xffff_ffff,
            addr: 0,
            value,
        },
    };

    let sig = &mut table.get_mut(slot).sig;
    if sig.queue.push(entry).is_err() {
        return Err(KernErr::Again);
    }

    if action.flags & sa_flags::RESETHAND != 0 {
        let live = &mut sig.actions[(signo - 1) as usize];
        live.handler = if default_ignored(signo) { SIG_IGN } else { SIG_DFL };
        live.flags &= !sa_flags::SIGINFO;
    }

    Ok(0)
}

/// Raise SIGCHLD on the parent of `slot` after a stop or continue,
/// honoring the parent's `NOCLDSTOP`.
fn notify_parent(slot: usize) -> SysResult {
    let table = task::table();
    let parent = table.get(slot).parent;
    if parent == 0 {
        return Ok(0);
    }
    let pslot = table.resolve(parent, false)?;
    let chld = table.get(pslot).sig.actions[(SIGCHLD - 1) as usize];
    if chld.flags & sa_flags::NOCLDSTOP == 0 {
        post(parent, SIGCHLD, 0)?;
    }
    Ok(0)
}

/// Divert `slot` (the task about to be resumed) into its upcall with
/// `entry` on its stack. Never returns.
///
/// The argument block layout, from the rewritten `rsp` upward:
/// `[QueuedSignal, blocked mask + pad, trap-time UTrapframe, pad]`, the
/// whole block 16-byte aligned per the System V AMD64 convention.
pub fn deliver(slot: usize, entry: QueuedSignal) -> ! {
    let table = task::table();

    log::trace!(
        target: "signal",
        "[{:08x}] delivering signo {}",
        table.get(slot).id,
        entry.info.signo
    );

    let frame = table.get(slot).frame;
    let utf = UTrapframe {
        err: entry.info.signo as u64,
        fault_va: 0,
        regs: frame.regs,
        rflags: frame.rflags,
        rip: frame.rip,
        rsp: frame.rsp,
    };

    let rsp = (frame.rsp & !0xF).wrapping_sub(SIG_FRAME_SIZE);
    debug_assert_eq!(rsp & 0xF, 0);

    crate::mm::user_mem_assert(rsp, SIG_FRAME_SIZE as usize, Prot::W);

    let saved_mask = table.get(slot).sig.mask;

    unsafe {
        // The block may straddle a page boundary; materialize both ends
        // before opening the window.
        let space = &mut task::table().get_mut(slot).space;
        let _ = space.force_alloc(page_down(rsp));
        let _ = space.force_alloc(page_down(rsp + SIG_FRAME_SIZE - 1));
        let window = UserWindow::open(space);
        window.write_val(rsp, &entry);
        window.write_val(rsp + FRAME_MASK_OFFSET, &saved_mask);
        window.write_val(rsp + FRAME_UTF_OFFSET, &utf);
    }

    {
        let task = task::table().get_mut(slot);
        task.sig.mask |= entry.action.mask;
        if entry.action.flags & sa_flags::NODEFER == 0 {
            task.sig.mask |= mask_bit(entry.info.signo);
        }
        task.frame.rsp = rsp;
        task.frame.rip = task.upcall;
    }

    unsafe {
        crate::mm::switch_space(&mut task::table().get_mut(slot).space);
        crate::trap::pop_frame(&task::table().get(slot).frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::size_of;

    #[test]
    fn wire_layouts() {
        assert_eq!(size_of::<SigAction>(), 16);
        assert_eq!(size_of::<SigInfo>(), 32);
        assert_eq!(size_of::<QueuedSignal>(), 48);
        // Queued signal + mask word + pad + UTrapframe + alignment pad
        assert_eq!(SIG_FRAME_SIZE, 224);
        assert_eq!(SIG_FRAME_SIZE % 16, 0);
    }

    #[test]
    fn mask_bits_match_wire_numbers() {
        assert_eq!(mask_bit(SIGINT), 0x001);
        assert_eq!(mask_bit(SIGCONT), 0x100);
        assert_eq!(ALL_SIGNALS, 0x1FF);
        assert_eq!(UNCATCHABLE, 0x182);
    }

    #[test]
    fn sanitize_strips_special_and_undefined() {
        assert_eq!(sanitize_mask(u32::MAX), ALL_SIGNALS & !UNCATCHABLE);
        assert_eq!(sanitize_mask(mask_bit(SIGKILL)), 0);
        assert_eq!(sanitize_mask(mask_bit(SIGTERM)), mask_bit(SIGTERM));
    }

    #[test]
    fn root_action_defaults() {
        let actions = root_actions();
        assert_eq!(actions[(SIGUSR1 - 1) as usize].handler, SIG_IGN);
        assert_eq!(actions[(SIGCHLD - 1) as usize].handler, SIG_IGN);
        assert_eq!(actions[(SIGCONT - 1) as usize].handler, SIG_IGN);
        assert_eq!(actions[(SIGINT - 1) as usize].handler, SIG_DFL);
        assert_eq!(actions[(SIGKILL - 1) as usize].handler, SIG_DFL);
    }
}
