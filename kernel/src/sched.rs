//! Scheduler
//!
//! Cooperative round-robin over the task table. The scan starts just
//! after the current task and takes the first eligible slot; with
//! nothing to run, the CPU halts with interrupts enabled until a tick
//! re-enters the trap path.
//!
//! The scan doubles as the `sigwait` wake-up point: a waiting task with
//! a matching queued signal has the signal consumed (blocked or not),
//! its number stored to the waiter's pointer, and becomes runnable.

use core::arch::asm;

use crate::mm::layout::page_down;
use crate::mm::UserWindow;
use crate::signal::{mask_bit, QueuedSignal};
use crate::task::{self, TaskStatus, TaskTable, NTASK};

/// Pick the next task to run, starting after `current`.
///
/// Performs the sigwait wake-up as a side effect: when a waiting task
/// is chosen, the consumed signal is handed to `on_wake` (which stores
/// the signal number for the waiter) and the task is made runnable.
/// Factored out of [`schedule`] so the policy is testable.
pub fn pick_next(
    table: &mut TaskTable,
    mut on_wake: impl FnMut(&mut task::Task, QueuedSignal),
) -> Option<usize> {
    let start = table.current_slot().unwrap_or(NTASK - 1);

    for offset in 1..=NTASK {
        let slot = (start + offset) % NTASK;
        let t = table.get_mut(slot);

        if t.sig.stopped {
            continue;
        }

        if t.sig.awaiting != 0 {
            // Waiting in sigwait: eligible only if a wanted signal is
            // already queued; consuming it wakes the task.
            let awaiting = t.sig.awaiting;
            let Some(entry) = t
                .sig
                .queue
                .dequeue_where(|qs| awaiting & mask_bit(qs.info.signo) != 0)
            else {
                continue;
            };
            t.sig.awaiting = 0;
            t.status = TaskStatus::Runnable;
            on_wake(t, entry);
            return Some(slot);
        }

        match t.status {
            TaskStatus::Runnable | TaskStatus::Running => return Some(slot),
            _ => continue,
        }
    }
    None
}

/// Enter the scheduler: run the next eligible task or halt. Never
/// returns.
pub fn schedule() -> ! {
    let picked = pick_next(task::table(), |t, entry| {
        // Store the consumed signal number where the waiter asked
        let ptr = t.sig.caught_ptr;
        t.sig.caught_ptr = 0;
        if ptr != 0 {
            unsafe {
                let _ = t.space.force_alloc(page_down(ptr));
                let window = UserWindow::open(&mut t.space);
                window.write_val(ptr, &entry.info.signo);
            }
        }
        log::trace!(
            target: "signal",
            "[{:08x}] sigwait consumed signo {}",
            t.id,
            entry.info.signo
        );
    });

    match picked {
        Some(slot) => task::run(slot),
        None => halt(),
    }
}

/// Nothing to run: wait for the next interrupt.
///
/// Resets to the top of the kernel stack first, so repeated halts do
/// not grow it, then enables interrupts and sleeps. The next tick
/// arrives through the trap path and calls back into [`schedule`].
fn halt() -> ! {
    task::table().set_current(None);
    log::trace!(target: "sched", "no runnable tasks, halting");

    unsafe {
        asm!(
            "mov rsp, {stack}",
            "sti",
            "2:",
            "hlt",
            "jmp 2b",
            stack = in(reg) crate::arch::x86_64::gdt::kernel_stack_top(),
            options(noreturn),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{self, SigInfo};
    use crate::task::TaskType;

    fn fresh_table() -> std::boxed::Box<TaskTable> {
        let mut t = std::boxed::Box::new(TaskTable::new());
        t.init();
        t
    }

    fn queued(signo: i32) -> QueuedSignal {
        QueuedSignal {
            action: signal::SigAction::zeroed(),
            info: SigInfo {
                signo,
                code: 0,
                pid: 0,
                marker: 0xffff_ffff,
                addr: 0,
                value: 0,
            },
        }
    }

    #[test]
    fn round_robin_starts_after_current() {
        let mut t = fresh_table();
        let a = t.alloc_slot(0, TaskType::User).unwrap();
        let b = t.alloc_slot(0, TaskType::User).unwrap();
        let c = t.alloc_slot(0, TaskType::User).unwrap();

        t.set_current(Some(a));
        t.get_mut(a).status = TaskStatus::Running;
        assert_eq!(pick_next(&mut t, |_, _| ()), Some(b));

        t.set_current(Some(b));
        assert_eq!(pick_next(&mut t, |_, _| ()), Some(c));

        // Wraps around to the running task when nothing else is eligible
        t.get_mut(b).status = TaskStatus::NotRunnable;
        t.get_mut(c).status = TaskStatus::NotRunnable;
        t.set_current(Some(a));
        assert_eq!(pick_next(&mut t, |_, _| ()), Some(a));
    }

    #[test]
    fn every_runnable_task_gets_a_turn() {
        let mut t = fresh_table();
        let mut slots = std::vec::Vec::new();
        for _ in 0..5 {
            slots.push(t.alloc_slot(0, TaskType::User).unwrap());
        }
        let mut seen = std::collections::BTreeSet::new();
        for _ in 0..NTASK {
            let slot = pick_next(&mut t, |_, _| ()).unwrap();
            seen.insert(slot);
            t.set_current(Some(slot));
            t.get_mut(slot).status = TaskStatus::Running;
        }
        for slot in slots {
            assert!(seen.contains(&slot));
        }
    }

    #[test]
    fn stopped_and_blocked_tasks_are_skipped() {
        let mut t = fresh_table();
        let a = t.alloc_slot(0, TaskType::User).unwrap();
        let b = t.alloc_slot(0, TaskType::User).unwrap();

        t.get_mut(a).sig.stopped = true;
        assert_eq!(pick_next(&mut t, |_, _| ()), Some(b));

        t.get_mut(b).status = TaskStatus::NotRunnable;
        assert_eq!(pick_next(&mut t, |_, _| ()), None);

        t.get_mut(a).sig.stopped = false;
        assert_eq!(pick_next(&mut t, |_, _| ()), Some(a));
    }

    #[test]
    fn sigwait_wakes_only_on_awaited_signals() {
        let mut t = fresh_table();
        let slot = t.alloc_slot(0, TaskType::User).unwrap();
        {
            let task = t.get_mut(slot);
            task.status = TaskStatus::NotRunnable;
            task.sig.awaiting = mask_bit(signal::SIGUSR1);
            task.sig.queue.push(queued(signal::SIGTERM)).unwrap();
        }
        // A queued signal outside the awaited set does not wake
        assert_eq!(pick_next(&mut t, |_, _| ()), None);

        t.get_mut(slot).sig.queue.push(queued(signal::SIGUSR1)).unwrap();
        let mut woken = None;
        let picked = pick_next(&mut t, |task, entry| {
            woken = Some((task.id, entry.info.signo));
        });
        assert_eq!(picked, Some(slot));
        assert_eq!(woken, Some((t.get(slot).id, signal::SIGUSR1)));

        let task = t.get(slot);
        assert_eq!(task.sig.awaiting, 0);
        assert_eq!(task.status, TaskStatus::Runnable);
        // The unrelated signal stays queued
        assert_eq!(task.sig.queue.len(), 1);
    }

    #[test]
    fn sigwait_consumes_blocked_signals_too() {
        let mut t = fresh_table();
        let slot = t.alloc_slot(0, TaskType::User).unwrap();
        {
            let task = t.get_mut(slot);
            task.status = TaskStatus::NotRunnable;
            task.sig.mask = mask_bit(signal::SIGTERM);
            task.sig.awaiting = mask_bit(signal::SIGTERM);
            for _ in 0..3 {
                task.sig.queue.push(queued(signal::SIGTERM)).unwrap();
            }
        }
        assert_eq!(pick_next(&mut t, |_, _| ()), Some(slot));
        // Exactly one entry was consumed by the wait
        assert_eq!(t.get(slot).sig.queue.len(), 2);
    }
}
