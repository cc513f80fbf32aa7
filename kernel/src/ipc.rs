//! Synchronous IPC rendezvous
//!
//! One mailbox per task, one-shot semantics. A receiver parks itself
//! with `park_recv` (not runnable until someone sends); a sender
//! delivers a value and optionally a memory region with `try_send`,
//! which never blocks: if the target is not parked, the send fails
//! immediately.
//!
//! A region moves only when both sides opted in (sender passed a source
//! VA below the user limit, receiver a destination VA). The transfer is
//! an alias mapping: after the rendezvous both tasks see the same
//! frames.

use crate::error::{KernErr, SysResult};
use crate::mm::layout::{page_aligned, MAX_USER_ADDRESS};
use crate::mm::{Prot, PROT_ALL};
use crate::task::{TaskId, TaskStatus, TaskTable};

/// Park `slot` waiting for a sender.
///
/// `dst_va` below `MAX_USER_ADDRESS` announces willingness to accept a
/// region of at most `maxsz` bytes there. On success the task is no
/// longer runnable and its saved return register already reads 0; the
/// caller must enter the scheduler and never complete the syscall
/// normally.
pub fn park_recv(table: &mut TaskTable, slot: usize, dst_va: u64, maxsz: u64) -> SysResult {
    if !page_aligned(maxsz) {
        return Err(KernErr::Inval);
    }
    if dst_va < MAX_USER_ADDRESS && (maxsz == 0 || !page_aligned(dst_va)) {
        return Err(KernErr::Inval);
    }

    let task = table.get_mut(slot);
    task.ipc.recving = true;
    task.ipc.dst_va = if dst_va < MAX_USER_ADDRESS {
        dst_va
    } else {
        MAX_USER_ADDRESS
    };
    task.ipc.maxsz = if dst_va < MAX_USER_ADDRESS { maxsz } else { 0 };
    task.status = TaskStatus::NotRunnable;
    // The sender completes the syscall on the receiver's behalf
    task.frame.regs.rax = 0;

    log::trace!(target: "ipc", "[{:08x}] waiting for message", task.id);
    Ok(0)
}

/// Send `value` from `slot` to `target`, optionally granting the region
/// at `src_va`. Non-blocking: fails with `IpcNotRecv` unless the target
/// is parked in `park_recv`.
pub fn try_send(
    table: &mut TaskTable,
    slot: usize,
    target: TaskId,
    value: u32,
    src_va: u64,
    size: u64,
    perm: u32,
) -> SysResult {
    let dst_slot = table.resolve(target, false)?;
    if dst_slot == slot {
        // A task cannot rendezvous with itself
        return Err(KernErr::IpcNotRecv);
    }

    let (sender, receiver) = table.pair_mut(slot, dst_slot);

    if !receiver.ipc.recving {
        return Err(KernErr::IpcNotRecv);
    }
    if src_va < MAX_USER_ADDRESS && !page_aligned(src_va) {
        return Err(KernErr::Inval);
    }

    if src_va < MAX_USER_ADDRESS && receiver.ipc.dst_va < MAX_USER_ADDRESS {
        // Both sides agreed on a region transfer
        let prot = Prot::from_bits(perm).ok_or(KernErr::Inval)?;
        if !PROT_ALL.contains(prot) {
            return Err(KernErr::Inval);
        }
        let granted = size.min(receiver.ipc.maxsz);
        receiver
            .space
            .map_from(
                receiver.ipc.dst_va,
                &sender.space,
                src_va,
                granted,
                prot | Prot::USER,
            )
            .map_err(|e| match e {
                KernErr::Inval => KernErr::Inval,
                _ => KernErr::NoMem,
            })?;
        receiver.ipc.perm = perm;
        receiver.ipc.maxsz = granted;
    } else {
        receiver.ipc.perm = 0;
    }

    receiver.ipc.recving = false;
    receiver.ipc.from = sender.id;
    receiver.ipc.value = value;
    receiver.status = TaskStatus::Runnable;

    log::trace!(
        target: "ipc",
        "[{:08x}] sent {:#x} to {:08x} (perm {:#x})",
        sender.id,
        value,
        receiver.id,
        receiver.ipc.perm
    );
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskType;

    fn fresh_table() -> std::boxed::Box<TaskTable> {
        let mut t = std::boxed::Box::new(TaskTable::new());
        t.init();
        t
    }

    #[test]
    fn value_rendezvous() {
        let mut t = fresh_table();
        let a = t.alloc_slot(0, TaskType::User).unwrap();
        let b = t.alloc_slot(0, TaskType::User).unwrap();
        let a_id = t.get(a).id;
        let b_id = t.get(b).id;

        // Receiver parks, declining a region
        assert_eq!(park_recv(&mut t, b, MAX_USER_ADDRESS, 0), Ok(0));
        assert_eq!(t.get(b).status, TaskStatus::NotRunnable);
        assert_eq!(t.get(b).frame.regs.rax, 0);

        // Sender declines a region too: pure value transfer
        assert_eq!(
            try_send(&mut t, a, b_id, 42, MAX_USER_ADDRESS, 0, 0),
            Ok(0)
        );

        let receiver = t.get(b);
        assert!(!receiver.ipc.recving);
        assert_eq!(receiver.ipc.from, a_id);
        assert_eq!(receiver.ipc.value, 42);
        assert_eq!(receiver.ipc.perm, 0);
        assert_eq!(receiver.status, TaskStatus::Runnable);
    }

    #[test]
    fn send_to_non_receiver_fails() {
        let mut t = fresh_table();
        let a = t.alloc_slot(0, TaskType::User).unwrap();
        let b = t.alloc_slot(0, TaskType::User).unwrap();
        let b_id = t.get(b).id;

        assert_eq!(
            try_send(&mut t, a, b_id, 1, MAX_USER_ADDRESS, 0, 0),
            Err(KernErr::IpcNotRecv)
        );

        // One rendezvous consumes the receive; a second send fails
        park_recv(&mut t, b, MAX_USER_ADDRESS, 0).unwrap();
        try_send(&mut t, a, b_id, 1, MAX_USER_ADDRESS, 0, 0).unwrap();
        assert_eq!(
            try_send(&mut t, a, b_id, 2, MAX_USER_ADDRESS, 0, 0),
            Err(KernErr::IpcNotRecv)
        );
        assert_eq!(t.get(b).ipc.value, 1);
    }

    #[test]
    fn recv_argument_validation() {
        let mut t = fresh_table();
        let a = t.alloc_slot(0, TaskType::User).unwrap();

        // Unaligned maxsz
        assert_eq!(
            park_recv(&mut t, a, MAX_USER_ADDRESS, 123),
            Err(KernErr::Inval)
        );
        // In-range destination must be aligned and sized
        assert_eq!(park_recv(&mut t, a, 0x800_0123, 0x1000), Err(KernErr::Inval));
        assert_eq!(park_recv(&mut t, a, 0x800_0000, 0), Err(KernErr::Inval));
        assert!(!t.get(a).ipc.recving);
    }

    #[test]
    fn send_validates_source_alignment_and_target() {
        let mut t = fresh_table();
        let a = t.alloc_slot(0, TaskType::User).unwrap();
        let b = t.alloc_slot(0, TaskType::User).unwrap();
        let a_id = t.get(a).id;
        let b_id = t.get(b).id;

        assert_eq!(
            try_send(&mut t, a, 0x7FFF, 0, MAX_USER_ADDRESS, 0, 0),
            Err(KernErr::BadTask)
        );

        park_recv(&mut t, b, MAX_USER_ADDRESS, 0).unwrap();
        assert_eq!(
            try_send(&mut t, a, b_id, 0, 0x123, 0, 0),
            Err(KernErr::Inval)
        );

        // Self-send is refused
        park_recv(&mut t, a, MAX_USER_ADDRESS, 0).unwrap();
        assert_eq!(
            try_send(&mut t, a, a_id, 0, MAX_USER_ADDRESS, 0, 0),
            Err(KernErr::IpcNotRecv)
        );
    }
}
