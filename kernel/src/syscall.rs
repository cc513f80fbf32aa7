//! System calls
//!
//! The user-facing surface: a thin validating shim over the task table,
//! address spaces, IPC and signals. Calls arrive through trap vector
//! 0x30 with the number in `rax` and arguments in `rdx`, `rcx`, `rbx`,
//! `rdi`, `rsi`, `r8`; the router's return value lands back in `rax`.
//!
//! Pointer validation is destructive: a bad user pointer destroys the
//! caller instead of returning an error. Everything else reports
//! through negative return codes.

use crate::error::{KernErr, SysResult};
use crate::ipc;
use crate::mm::layout::{page_aligned, page_up, MAX_USER_ADDRESS};
use crate::mm::{user_mem_assert, AddressSpace, Prot, PROT_ALL};
use crate::signal::{self, sa_flags, sig_how, SigAction};
use crate::task::{self, TaskStatus, TaskType};
use crate::trap::Trapframe;
use crate::{console, sched};

/// Syscall numbers. A closed enumeration: anything else is `NoSys`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum Sys {
    Cputs = 0,
    Cgetc = 1,
    GetTaskId = 2,
    TaskDestroy = 3,
    AllocRegion = 4,
    MapRegion = 5,
    MapPhysicalRegion = 6,
    UnmapRegion = 7,
    RegionRefs = 8,
    Exofork = 9,
    TaskSetStatus = 10,
    TaskSetTrapframe = 11,
    TaskSetUpcall = 12,
    Yield = 13,
    IpcTrySend = 14,
    IpcRecv = 15,
    GetTime = 16,
    SigQueue = 17,
    SigWait = 18,
    SigActionSet = 19,
    SigProcMask = 20,
}

impl TryFrom<u64> for Sys {
    type Error = KernErr;

    fn try_from(num: u64) -> Result<Self, KernErr> {
        Ok(match num {
            0 => Sys::Cputs,
            1 => Sys::Cgetc,
            2 => Sys::GetTaskId,
            3 => Sys::TaskDestroy,
            4 => Sys::AllocRegion,
            5 => Sys::MapRegion,
            6 => Sys::MapPhysicalRegion,
            7 => Sys::UnmapRegion,
            8 => Sys::RegionRefs,
            9 => Sys::Exofork,
            10 => Sys::TaskSetStatus,
            11 => Sys::TaskSetTrapframe,
            12 => Sys::TaskSetUpcall,
            13 => Sys::Yield,
            14 => Sys::IpcTrySend,
            15 => Sys::IpcRecv,
            16 => Sys::GetTime,
            17 => Sys::SigQueue,
            18 => Sys::SigWait,
            19 => Sys::SigActionSet,
            20 => Sys::SigProcMask,
            _ => return Err(KernErr::NoSys),
        })
    }
}

/// Read a value from the calling task's memory. Validate first.
unsafe fn read_user<T: Copy>(va: u64) -> T {
    core::ptr::read_unaligned(va as *const T)
}

/// Write a value into the calling task's memory. Validate first; a
/// lazy or copy-on-write page resolves through the fault fast path.
unsafe fn write_user<T: Copy>(va: u64, val: T) {
    core::ptr::write_unaligned(va as *mut T, val);
}

/// Route one system call. Diverging calls (`yield`, `ipc_recv`,
/// `sigwait`, self-destruction) enter the scheduler and never return
/// here.
pub fn dispatch(num: u64, a1: u64, a2: u64, a3: u64, a4: u64, a5: u64, a6: u64) -> i64 {
    let sys = match Sys::try_from(num) {
        Ok(sys) => sys,
        Err(e) => {
            log::debug!(target: "syscall", "unknown syscall {}", num);
            return e.code();
        }
    };

    let slot = task::table()
        .current_slot()
        .expect("syscall with no current task");

    log::trace!(
        target: "syscall",
        "[{:08x}] {:?}({:#x}, {:#x}, {:#x}, {:#x}, {:#x}, {:#x})",
        task::table().get(slot).id,
        sys,
        a1,
        a2,
        a3,
        a4,
        a5,
        a6
    );

    let result = match sys {
        Sys::Cputs => sys_cputs(a1, a2),
        Sys::Cgetc => Ok(console::getc() as u64),
        Sys::GetTaskId => Ok(task::table().get(slot).id as u64),
        Sys::TaskDestroy => sys_task_destroy(a1),
        Sys::AllocRegion => sys_alloc_region(a1, a2, a3, a4),
        Sys::MapRegion => sys_map_region(a1, a2, a3, a4, a5, a6),
        Sys::MapPhysicalRegion => sys_map_physical_region(slot, a1, a2, a3, a4, a5),
        Sys::UnmapRegion => sys_unmap_region(a1, a2, a3),
        Sys::RegionRefs => sys_region_refs(slot, a1, a2, a3, a4),
        Sys::Exofork => sys_exofork(slot),
        Sys::TaskSetStatus => sys_task_set_status(a1, a2),
        Sys::TaskSetTrapframe => sys_task_set_trapframe(a1, a2),
        Sys::TaskSetUpcall => sys_task_set_upcall(a1, a2),
        Sys::Yield => sched::schedule(),
        Sys::IpcTrySend => ipc::try_send(
            task::table(),
            slot,
            a1 as i64 as i32,
            a2 as u32,
            a3,
            a4,
            a5 as u32,
        ),
        Sys::IpcRecv => sys_ipc_recv(slot, a1, a2),
        Sys::GetTime => Ok(crate::trap::wall_clock()),
        Sys::SigQueue => signal::post(a1 as i64 as i32, a2 as i64 as i32, a3),
        Sys::SigWait => sys_sigwait(slot, a1, a2),
        Sys::SigActionSet => sys_sigaction(slot, a1, a2, a3),
        Sys::SigProcMask => sys_sigprocmask(slot, a1, a2, a3),
    };

    match result {
        Ok(v) => v as i64,
        Err(e) => {
            log::debug!(target: "syscall", "{:?} -> {}", sys, e);
            e.code()
        }
    }
}

/// Write `len` bytes at `va` to the console.
fn sys_cputs(va: u64, len: u64) -> SysResult {
    user_mem_assert(va, len as usize, Prot::R);
    let bytes = unsafe { core::slice::from_raw_parts(va as *const u8, len as usize) };
    console::write_bytes(bytes);
    Ok(0)
}

fn sys_task_destroy(id: u64) -> SysResult {
    let slot = task::table().resolve(id as i64 as i32, false)?;
    if task::table().current_slot() == Some(slot) {
        log::debug!(target: "task", "[{:08x}] exiting", task::table().get(slot).id);
    }
    task::destroy(slot);
    Ok(0)
}

/// Allocate a child with a copy of the caller's registers, not yet
/// runnable. The child observes 0 in its return register; the parent
/// gets the child's id.
fn sys_exofork(slot: usize) -> SysResult {
    let parent_id = task::table().get(slot).id;
    let child = task::alloc(parent_id, TaskType::User)?;

    let frame = task::table().get(slot).frame;
    let table = task::table();
    let child_task = table.get_mut(child);
    child_task.frame = frame;
    child_task.frame.regs.rax = 0;
    child_task.status = TaskStatus::NotRunnable;

    Ok(child_task.id as u64)
}

fn sys_task_set_status(id: u64, status: u64) -> SysResult {
    let slot = task::table().resolve(id as i64 as i32, true)?;
    let status = match status {
        s if s == TaskStatus::Runnable as u64 => TaskStatus::Runnable,
        s if s == TaskStatus::NotRunnable as u64 => TaskStatus::NotRunnable,
        _ => return Err(KernErr::Inval),
    };
    task::table().get_mut(slot).status = status;
    Ok(0)
}

/// Overwrite a task's saved frame with a user-supplied one, forcing
/// user segments, IF set, and only the low 12 rflags bits preserved.
fn sys_task_set_trapframe(id: u64, tf_va: u64) -> SysResult {
    use crate::arch::x86_64::gdt;

    let slot = task::table().resolve(id as i64 as i32, true)?;
    user_mem_assert(tf_va, core::mem::size_of::<Trapframe>(), Prot::R);
    let mut frame: Trapframe = unsafe { read_user(tf_va) };

    frame.cs = gdt::USER_CS as u64;
    frame.ds = gdt::USER_DS as u64;
    frame.es = gdt::USER_DS as u64;
    frame.ss = gdt::USER_DS as u64;
    frame.rflags &= 0xFFF;
    frame.rflags |= 1 << 9; // IF

    task::table().get_mut(slot).frame = frame;
    Ok(0)
}

fn sys_task_set_upcall(id: u64, entry: u64) -> SysResult {
    let slot = task::table().resolve(id as i64 as i32, true)?;
    task::table().get_mut(slot).upcall = entry;
    Ok(0)
}

/// Validate a user-space region argument: page-aligned and entirely
/// below the user limit.
fn check_user_region(va: u64, size: u64) -> Result<u64, KernErr> {
    if !page_aligned(va) || va >= MAX_USER_ADDRESS {
        return Err(KernErr::Inval);
    }
    let end = va.checked_add(page_up(size)).ok_or(KernErr::Inval)?;
    if end > MAX_USER_ADDRESS {
        return Err(KernErr::Inval);
    }
    Ok(end)
}

fn sys_alloc_region(id: u64, va: u64, size: u64, perm: u64) -> SysResult {
    let slot = task::table().resolve(id as i64 as i32, true)?;
    check_user_region(va, size)?;

    let prot = Prot::from_bits(perm as u32).ok_or(KernErr::Inval)?;
    if !(PROT_ALL | Prot::ONE).contains(prot) || !prot.intersects(PROT_ALL) {
        return Err(KernErr::Inval);
    }

    task::table()
        .get_mut(slot)
        .space
        .map_alloc(va, size, prot | Prot::USER)
        .map_err(|_| KernErr::NoMem)?;
    Ok(0)
}

fn sys_map_region(
    src_id: u64,
    src_va: u64,
    dst_id: u64,
    dst_va: u64,
    size: u64,
    perm: u64,
) -> SysResult {
    let table = task::table();
    let src_slot = table.resolve(src_id as i64 as i32, true)?;
    let dst_slot = table.resolve(dst_id as i64 as i32, true)?;

    check_user_region(src_va, size)?;
    check_user_region(dst_va, size)?;

    let prot = Prot::from_bits(perm as u32).ok_or(KernErr::Inval)?;
    if !(PROT_ALL | Prot::LAZY | Prot::COW).contains(prot) {
        return Err(KernErr::Inval);
    }

    if src_slot == dst_slot {
        // Aliasing within one address space
        let space = &mut table.get_mut(src_slot).space as *mut AddressSpace;
        unsafe { (*space).map_from(dst_va, &*space, src_va, size, prot | Prot::USER)? };
    } else {
        let (src, dst) = table.pair_mut(src_slot, dst_slot);
        dst.space
            .map_from(dst_va, &src.space, src_va, size, prot | Prot::USER)?;
    }
    Ok(0)
}

/// Map physical memory into a task. Reserved for the filesystem
/// server's device access.
fn sys_map_physical_region(slot: usize, pa: u64, id: u64, va: u64, size: u64, perm: u64) -> SysResult {
    if task::table().get(slot).kind != TaskType::FsServer {
        return Err(KernErr::BadTask);
    }
    let target = task::table().resolve(id as i64 as i32, true)?;

    check_user_region(va, size)?;
    if !page_aligned(pa) || !page_aligned(size) {
        return Err(KernErr::Inval);
    }
    let prot = Prot::from_bits(perm as u32).ok_or(KernErr::Inval)?;
    if !PROT_ALL.contains(prot) {
        return Err(KernErr::Inval);
    }

    task::table()
        .get_mut(target)
        .space
        .map_physical(va, pa, size, prot | Prot::USER)
        .map_err(|_| KernErr::NoMem)?;
    Ok(0)
}

fn sys_unmap_region(id: u64, va: u64, size: u64) -> SysResult {
    let slot = task::table().resolve(id as i64 as i32, true)?;
    check_user_region(va, size)?;
    task::table().get_mut(slot).space.unmap(va, size);
    Ok(0)
}

/// Difference between the maximal frame refcount over two regions of
/// the caller's space (or just the first, if the second is out of
/// range).
fn sys_region_refs(slot: usize, va: u64, size: u64, va2: u64, size2: u64) -> SysResult {
    let space = &task::table().get(slot).space;
    let first = space.region_maxref(va, size);
    let diff = if va2 < MAX_USER_ADDRESS {
        first - space.region_maxref(va2, size2)
    } else {
        first
    };
    Ok(diff as u64)
}

fn sys_ipc_recv(slot: usize, dst_va: u64, maxsz: u64) -> SysResult {
    ipc::park_recv(task::table(), slot, dst_va, maxsz)?;
    sched::schedule()
}

/// Block until one of the signals in `*set_va` is posted; the consumed
/// signal number is stored to `*sig_va` by the scheduler on wake-up.
fn sys_sigwait(slot: usize, set_va: u64, sig_va: u64) -> SysResult {
    user_mem_assert(set_va, core::mem::size_of::<u32>(), Prot::R);
    let set: u32 = unsafe { read_user(set_va) };

    if set & signal::UNCATCHABLE != 0 {
        return Err(KernErr::Inval);
    }
    let set = set & signal::ALL_SIGNALS;
    if set == 0 {
        return Err(KernErr::Inval);
    }

    if sig_va != 0 {
        user_mem_assert(sig_va, core::mem::size_of::<i32>(), Prot::R | Prot::W);
    }

    let task = task::table().get_mut(slot);
    task.sig.awaiting = set;
    task.sig.caught_ptr = sig_va;
    task.status = TaskStatus::NotRunnable;
    task.frame.regs.rax = 0;

    log::trace!(target: "signal", "[{:08x}] sigwait on {:#x}", task.id, set);
    sched::schedule()
}

/// Inspect or replace the caller's action for one signal.
fn sys_sigaction(slot: usize, signo: u64, act_va: u64, oldact_va: u64) -> SysResult {
    let signo = signo as i64 as i32;
    if !signal::valid_signo(signo) {
        return Err(KernErr::Inval);
    }
    if matches!(signo, signal::SIGKILL | signal::SIGSTOP | signal::SIGCONT) {
        return Err(KernErr::Inval);
    }

    if oldact_va != 0 {
        user_mem_assert(oldact_va, core::mem::size_of::<SigAction>(), Prot::R | Prot::W);
        let old = task::table().get(slot).sig.actions[(signo - 1) as usize];
        unsafe { write_user(oldact_va, old) };
    }

    if act_va == 0 {
        return Ok(0);
    }

    user_mem_assert(act_va, core::mem::size_of::<SigAction>(), Prot::R);
    let act: SigAction = unsafe { read_user(act_va) };
    if act.flags & !sa_flags::ALL != 0 {
        return Err(KernErr::Inval);
    }

    task::table().get_mut(slot).sig.actions[(signo - 1) as usize] = act;
    Ok(0)
}

/// Examine or change the caller's blocked-signal mask. KILL, STOP and
/// CONT can never be blocked.
fn sys_sigprocmask(slot: usize, how: u64, set_va: u64, oldset_va: u64) -> SysResult {
    if oldset_va != 0 {
        user_mem_assert(oldset_va, core::mem::size_of::<u32>(), Prot::R | Prot::W);
        let mask = task::table().get(slot).sig.mask;
        unsafe { write_user(oldset_va, mask) };
    }

    if set_va == 0 {
        return Ok(0);
    }

    user_mem_assert(set_va, core::mem::size_of::<u32>(), Prot::R);
    let set = signal::sanitize_mask(unsafe { read_user::<u32>(set_va) });

    let task = task::table().get_mut(slot);
    let new_mask = match how {
        h if h == sig_how::BLOCK => task.sig.mask | set,
        h if h == sig_how::UNBLOCK => task.sig.mask & !set,
        h if h == sig_how::SETMASK => set,
        _ => return Err(KernErr::Inval),
    };

    log::trace!(
        target: "signal",
        "[{:08x}] mask {:#x} -> {:#x}",
        task.id,
        task.sig.mask,
        new_mask
    );
    task.sig.mask = new_mask;
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syscall_numbers_round_trip() {
        for num in 0..=20u64 {
            let sys = Sys::try_from(num).unwrap();
            assert_eq!(sys as u64, num);
        }
        assert_eq!(Sys::try_from(21), Err(KernErr::NoSys));
        assert_eq!(Sys::try_from(u64::MAX), Err(KernErr::NoSys));
    }

    #[test]
    fn region_argument_validation() {
        assert!(check_user_region(0x1000, 0x1000).is_ok());
        // Unaligned base
        assert_eq!(check_user_region(0x1001, 0x1000), Err(KernErr::Inval));
        // Above the user limit
        assert_eq!(check_user_region(MAX_USER_ADDRESS, 0x1000), Err(KernErr::Inval));
        // Straddling the limit
        assert_eq!(
            check_user_region(MAX_USER_ADDRESS - 0x1000, 0x2000),
            Err(KernErr::Inval)
        );
        // Size rounds up
        assert_eq!(check_user_region(0, 1), Ok(0x1000));
    }
}
