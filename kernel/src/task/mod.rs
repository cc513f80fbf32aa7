//! Tasks
//!
//! The task table is a fixed array of slots with a free list threaded
//! through the unused ones. Identifiers are generation-stamped: the low
//! bits are the slot index, the high bits a counter bumped on every
//! reuse, so a stale id held by user space resolves to nothing.
//!
//! Single CPU; the table is mutated only from trap context with
//! interrupts disabled, so it is a plain static reached through
//! [`table`].

pub mod load;

use crate::arch::x86_64::gdt;
use crate::error::KernErr;
use crate::mm::layout::{
    page_up, UENVS, USER_STACK_SIZE, USER_STACK_TOP, UVSYS,
};
use crate::mm::{self, AddressSpace, Prot};
use crate::signal::{self, SigAction, SignalQueue, NSIG};
use crate::trap::Trapframe;

/// Task table capacity. The id scheme needs `NTASK` to be a power of
/// two no larger than `1 << GEN_SHIFT`.
pub const NTASK: usize = 64;

/// Bits below the generation stamp in a task id
const GEN_SHIFT: u32 = 12;

/// Task identifier: `generation << GEN_SHIFT | slot`, never 0 for a
/// live task. 0 passed to a syscall means "the calling task".
pub type TaskId = i32;

/// RFLAGS interrupt-enable bit
const FLAG_IF: u64 = 1 << 9;
/// RFLAGS I/O privilege level 3
const FLAG_IOPL3: u64 = 3 << 12;

/// Lifecycle state of a slot
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Free = 0,
    Dying,
    Runnable,
    Running,
    NotRunnable,
}

/// What kind of code the task runs
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    User = 0,
    /// The filesystem server; may map physical MMIO regions and gets
    /// I/O port access
    FsServer,
    Kernel,
}

/// Rendezvous state for synchronous IPC
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct IpcState {
    /// Blocked in `ipc_recv`
    pub recving: bool,
    /// Where the receiver wants a granted region, `MAX_USER_ADDRESS`
    /// when it declined
    pub dst_va: u64,
    /// Receiver's size cap; after a grant, the granted size
    pub maxsz: u64,
    /// Sender of the last received message
    pub from: TaskId,
    /// Last received value
    pub value: u32,
    /// Protection of the granted region, 0 if none was transferred
    pub perm: u32,
}

impl IpcState {
    const fn cleared() -> Self {
        IpcState {
            recving: false,
            dst_va: 0,
            maxsz: 0,
            from: 0,
            value: 0,
            perm: 0,
        }
    }
}

/// Per-task signal state
#[repr(C)]
pub struct SignalState {
    /// Live action table, indexed by `signo - 1`
    pub actions: [SigAction; NSIG as usize],
    /// Currently blocked signals
    pub mask: u32,
    /// Non-zero while blocked in `sigwait`
    pub awaiting: u32,
    /// User VA to store the consumed signal number on sigwait wake-up
    pub caught_ptr: u64,
    /// Stopped by SIGSTOP
    pub stopped: bool,
    /// Pending signals
    pub queue: SignalQueue,
}

impl SignalState {
    const fn cleared() -> Self {
        SignalState {
            actions: [SigAction::zeroed(); NSIG as usize],
            mask: 0,
            awaiting: 0,
            caught_ptr: 0,
            stopped: false,
            queue: SignalQueue::new(),
        }
    }
}

/// One schedulable unit: an address space plus a saved register frame.
#[repr(C)]
pub struct Task {
    pub id: TaskId,
    pub parent: TaskId,
    pub status: TaskStatus,
    pub kind: TaskType,
    /// Saved register frame, restored on resume
    pub frame: Trapframe,
    /// The task's address space
    pub space: AddressSpace,
    /// Times this task has been scheduled
    pub runs: u32,
    /// Next free slot when this one is on the free list, -1 at the end
    link: i32,
    pub ipc: IpcState,
    /// User VA of the fault/signal upcall entry, 0 until installed
    pub upcall: u64,
    pub sig: SignalState,
    /// Loaded program image, kept for debugging
    pub image: u64,
}

impl Task {
    const fn empty() -> Self {
        Task {
            id: 0,
            parent: 0,
            status: TaskStatus::Free,
            kind: TaskType::User,
            frame: Trapframe::zeroed(),
            space: AddressSpace::empty(),
            runs: 0,
            link: -1,
            ipc: IpcState::cleared(),
            upcall: 0,
            sig: SignalState::cleared(),
            image: 0,
        }
    }
}

/// The task table. Page-aligned so it can be mapped read-only into user
/// space at `UENVS`.
#[repr(C, align(4096))]
pub struct TaskTable {
    pub tasks: [Task; NTASK],
    free_head: i32,
    current: i32,
}

impl TaskTable {
    pub const fn new() -> Self {
        TaskTable {
            tasks: [const { Task::empty() }; NTASK],
            free_head: -1,
            current: -1,
        }
    }

    /// Thread the free list through every slot, in index order.
    pub fn init(&mut self) {
        for (i, task) in self.tasks.iter_mut().enumerate() {
            task.id = 0;
            task.status = TaskStatus::Free;
            task.link = if i + 1 < NTASK { (i + 1) as i32 } else { -1 };
        }
        self.free_head = 0;
        self.current = -1;
    }

    pub fn get(&self, slot: usize) -> &Task {
        &self.tasks[slot]
    }

    pub fn get_mut(&mut self, slot: usize) -> &mut Task {
        &mut self.tasks[slot]
    }

    /// Two distinct slots, mutably.
    pub fn pair_mut(&mut self, a: usize, b: usize) -> (&mut Task, &mut Task) {
        assert_ne!(a, b);
        if a < b {
            let (lo, hi) = self.tasks.split_at_mut(b);
            (&mut lo[a], &mut hi[0])
        } else {
            let (lo, hi) = self.tasks.split_at_mut(a);
            (&mut hi[0], &mut lo[b])
        }
    }

    /// Slot of the running task, if any.
    pub fn current_slot(&self) -> Option<usize> {
        if self.current >= 0 {
            Some(self.current as usize)
        } else {
            None
        }
    }

    pub fn set_current(&mut self, slot: Option<usize>) {
        self.current = slot.map(|s| s as i32).unwrap_or(-1);
    }

    /// The running task, if any.
    pub fn current(&mut self) -> Option<&mut Task> {
        match self.current {
            c if c >= 0 => Some(&mut self.tasks[c as usize]),
            _ => None,
        }
    }

    /// Map an id to a slot, rejecting stale and unknown ids.
    ///
    /// Id 0 resolves to the calling task. With `check_perm`, the target
    /// must be the caller or the caller's immediate child.
    pub fn resolve(&self, id: TaskId, check_perm: bool) -> Result<usize, KernErr> {
        if id == 0 {
            return self.current_slot().ok_or(KernErr::BadTask);
        }
        let slot = (id as u32 as usize) & (NTASK - 1);
        let task = &self.tasks[slot];
        if task.status == TaskStatus::Free || task.id != id {
            return Err(KernErr::BadTask);
        }
        if check_perm {
            let cur = self.current_slot().ok_or(KernErr::BadTask)?;
            let cur_id = self.tasks[cur].id;
            if task.id != cur_id && task.parent != cur_id {
                return Err(KernErr::BadTask);
            }
        }
        Ok(slot)
    }

    /// Take a slot off the free list and initialize everything that
    /// does not touch hardware.
    ///
    /// Children inherit the parent's action table and upcall entry;
    /// root tasks start from the default table.
    pub fn alloc_slot(&mut self, parent: TaskId, kind: TaskType) -> Result<usize, KernErr> {
        let slot = match self.free_head {
            s if s >= 0 => s as usize,
            _ => return Err(KernErr::NoFreeTask),
        };

        let inherited = if parent != 0 {
            self.resolve(parent, false)
                .ok()
                .map(|p| (self.tasks[p].sig.actions, self.tasks[p].upcall))
        } else {
            None
        };

        let task = &mut self.tasks[slot];
        self.free_head = task.link;
        task.link = -1;

        // Bump the generation, skipping zero and negative ids
        let mut generation = (task.id + (1 << GEN_SHIFT)) & !(NTASK as i32 - 1);
        if generation <= 0 {
            generation = 1 << GEN_SHIFT;
        }
        task.id = generation | slot as i32;

        task.parent = parent;
        task.kind = kind;
        task.status = TaskStatus::Runnable;
        task.runs = 0;
        task.image = 0;

        // Fresh register state; segment selectors and IF for ring 3
        task.frame = Trapframe::zeroed();
        task.frame.cs = gdt::USER_CS as u64;
        task.frame.ds = gdt::USER_DS as u64;
        task.frame.es = gdt::USER_DS as u64;
        task.frame.ss = gdt::USER_DS as u64;
        task.frame.rsp = USER_STACK_TOP;
        task.frame.rflags = FLAG_IF
            | if kind == TaskType::FsServer {
                FLAG_IOPL3
            } else {
                0
            };

        task.ipc = IpcState::cleared();
        task.sig = SignalState::cleared();
        match inherited {
            Some((actions, upcall)) => {
                task.sig.actions = actions;
                task.upcall = upcall;
            }
            None => {
                task.sig.actions = signal::root_actions();
                task.upcall = 0;
            }
        }

        Ok(slot)
    }

    /// Return a slot to the free list. The id stays for the next
    /// generation bump.
    pub fn free_slot(&mut self, slot: usize) {
        let task = &mut self.tasks[slot];
        task.status = TaskStatus::Free;
        task.link = self.free_head;
        self.free_head = slot as i32;
        if self.current == slot as i32 {
            self.current = -1;
        }
    }
}

/// The global task table.
static mut TASK_TABLE: TaskTable = TaskTable::new();

/// Access the global task table.
///
/// Sound under the single-CPU model: all mutation happens in trap
/// context with interrupts disabled.
#[allow(static_mut_refs)]
pub fn table() -> &'static mut TaskTable {
    unsafe { &mut *(&raw mut TASK_TABLE) }
}

/// Initialize the task table.
pub fn init() {
    table().init();
    log::info!(target: "task", "task table ready, {} slots", NTASK);
}

/// Allocate a task: a slot, an address space, and the fixed read-only
/// user mappings (task table at `UENVS`, vsyscall page at `UVSYS`).
pub fn alloc(parent: TaskId, kind: TaskType) -> Result<usize, KernErr> {
    let slot = table().alloc_slot(parent, kind)?;

    let result = (|| {
        let task = table().get_mut(slot);
        task.space.init()?;

        let table_va = &raw const TASK_TABLE as u64;
        let table_size = page_up(core::mem::size_of::<TaskTable>() as u64);
        task.space.map_physical(
            UENVS,
            mm::kernel_virt_to_phys(table_va),
            table_size,
            Prot::R | Prot::USER,
        )?;

        let task = table().get_mut(slot);
        task.space.map_physical(
            UVSYS,
            mm::kernel_virt_to_phys(crate::vsys::page_addr()),
            crate::mm::layout::PAGE_SIZE as u64,
            Prot::R | Prot::USER,
        )?;
        Ok(())
    })();

    if let Err(e) = result {
        let task = table().get_mut(slot);
        task.space.destroy();
        table().free_slot(slot);
        return Err(e);
    }

    log::debug!(
        target: "task",
        "[{:08x}] new task {:08x}",
        table().current().map(|t| t.id).unwrap_or(0),
        table().get(slot).id
    );
    Ok(slot)
}

/// Create a root task from an ELF image. Boot-time only.
pub fn create(binary: &[u8], kind: TaskType) -> Result<usize, KernErr> {
    let slot = alloc(0, kind)?;

    let entry = {
        let task = table().get_mut(slot);
        match load::load_image(&mut task.space, binary) {
            Ok(entry) => entry,
            Err(e) => {
                task.space.destroy();
                table().free_slot(slot);
                return Err(e);
            }
        }
    };

    let stack_base = USER_STACK_TOP - USER_STACK_SIZE;
    {
        let task = table().get_mut(slot);
        task.space
            .map_alloc(stack_base, USER_STACK_SIZE, Prot::R | Prot::W | Prot::USER)?;
        task.frame.rip = entry;
        task.image = binary.as_ptr() as u64;
    }

    log::info!(
        target: "task",
        "[{:08x}] created from image, entry {:#x}",
        table().get(slot).id,
        entry
    );
    Ok(slot)
}

/// Release a task's resources and return its slot to the free list.
fn free(slot: usize) {
    log::debug!(
        target: "task",
        "[{:08x}] free task {:08x}",
        table().current().map(|t| t.id).unwrap_or(0),
        table().get(slot).id
    );

    // Never tear down the active page tables
    let task = table().get_mut(slot);
    let space_ptr = &mut task.space as *mut AddressSpace;
    if mm::current_space() == space_ptr {
        unsafe {
            mm::switch_space(mm::kspace());
        }
    }
    task.space.destroy();
    table().free_slot(slot);
}

/// Destroy a task: notify the parent with SIGCHLD, release the slot,
/// and if the task destroyed itself, reschedule. Only returns when a
/// task other than the current one was destroyed.
pub fn destroy(slot: usize) {
    let (id, parent) = {
        let t = table().get(slot);
        (t.id, t.parent)
    };
    log::debug!(target: "task", "[{:08x}] destroying", id);

    if parent != 0 {
        // Best effort: the parent may itself be gone
        let _ = signal::post(parent, signal::SIGCHLD, 0);
    }

    let was_current = table().current_slot() == Some(slot);
    table().get_mut(slot).status = TaskStatus::Dying;
    free(slot);

    // A task destroyed from the fault path leaves the recursion flag
    // set; the next fault starts clean.
    crate::trap::reset_page_fault_flag();

    if was_current {
        table().set_current(None);
        crate::sched::schedule();
    }
}

/// Context switch to `slot` and resume it in user mode.
///
/// The pending-signal check runs here, at the last moment before the
/// frame is restored: if a non-blocked signal is queued, the task is
/// diverted into its upcall instead of its interrupted code.
pub fn run(slot: usize) -> ! {
    let table = table();

    if let Some(prev) = table.current() {
        if prev.status == TaskStatus::Running {
            prev.status = TaskStatus::Runnable;
        }
    }

    table.set_current(Some(slot));
    let task = table.get_mut(slot);
    task.status = TaskStatus::Running;
    task.runs += 1;

    let mask = task.sig.mask;
    if let Some(entry) = task
        .sig
        .queue
        .dequeue_where(|qs| mask & signal::mask_bit(qs.info.signo) == 0)
    {
        signal::deliver(slot, entry);
    }

    unsafe {
        mm::switch_space(&mut task.space);
        crate::trap::pop_frame(&task.frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_table() -> std::boxed::Box<TaskTable> {
        let mut t = std::boxed::Box::new(TaskTable::new());
        t.init();
        t
    }

    #[test]
    fn alloc_pulls_slots_in_order() {
        let mut t = fresh_table();
        let a = t.alloc_slot(0, TaskType::User).unwrap();
        let b = t.alloc_slot(0, TaskType::User).unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_ne!(t.get(a).id, 0);
        assert_ne!(t.get(a).id, t.get(b).id);
    }

    #[test]
    fn ids_encode_the_slot() {
        let mut t = fresh_table();
        for _ in 0..5 {
            let slot = t.alloc_slot(0, TaskType::User).unwrap();
            let id = t.get(slot).id;
            assert_eq!((id as u32 as usize) & (NTASK - 1), slot);
            assert!(id > 0);
            t.free_slot(slot);
        }
    }

    #[test]
    fn stale_ids_are_rejected() {
        let mut t = fresh_table();
        let slot = t.alloc_slot(0, TaskType::User).unwrap();
        let old_id = t.get(slot).id;
        assert_eq!(t.resolve(old_id, false), Ok(slot));

        t.free_slot(slot);
        assert_eq!(t.resolve(old_id, false), Err(KernErr::BadTask));

        // The slot is reused with a new generation; the old id stays dead
        let again = t.alloc_slot(0, TaskType::User).unwrap();
        assert_eq!(again, slot);
        assert_ne!(t.get(slot).id, old_id);
        assert_eq!(t.resolve(old_id, false), Err(KernErr::BadTask));
        assert_eq!(t.resolve(t.get(slot).id, false), Ok(slot));
    }

    #[test]
    fn resolve_zero_is_the_current_task() {
        let mut t = fresh_table();
        assert_eq!(t.resolve(0, false), Err(KernErr::BadTask));
        let slot = t.alloc_slot(0, TaskType::User).unwrap();
        t.set_current(Some(slot));
        assert_eq!(t.resolve(0, false), Ok(slot));
    }

    #[test]
    fn permission_needs_identity_or_parenthood() {
        let mut t = fresh_table();
        let parent = t.alloc_slot(0, TaskType::User).unwrap();
        let parent_id = t.get(parent).id;
        let child = t.alloc_slot(parent_id, TaskType::User).unwrap();
        let child_id = t.get(child).id;
        let other = t.alloc_slot(0, TaskType::User).unwrap();
        let other_id = t.get(other).id;

        t.set_current(Some(parent));
        assert!(t.resolve(child_id, true).is_ok());
        assert!(t.resolve(parent_id, true).is_ok());
        assert_eq!(t.resolve(other_id, true), Err(KernErr::BadTask));

        // The child may not touch its parent
        t.set_current(Some(child));
        assert_eq!(t.resolve(parent_id, true), Err(KernErr::BadTask));
    }

    #[test]
    fn table_exhaustion() {
        let mut t = fresh_table();
        for _ in 0..NTASK {
            t.alloc_slot(0, TaskType::User).unwrap();
        }
        assert_eq!(
            t.alloc_slot(0, TaskType::User),
            Err(KernErr::NoFreeTask)
        );
    }

    #[test]
    fn children_inherit_actions_and_upcall() {
        let mut t = fresh_table();
        let parent = t.alloc_slot(0, TaskType::User).unwrap();
        let parent_id = t.get(parent).id;
        t.get_mut(parent).upcall = 0xdead_f000;
        t.get_mut(parent).sig.actions[0].handler = 0x4444;

        let child = t.alloc_slot(parent_id, TaskType::User).unwrap();
        assert_eq!(t.get(child).upcall, 0xdead_f000);
        assert_eq!(t.get(child).sig.actions[0].handler, 0x4444);

        // Root tasks get the default table instead
        let root = t.alloc_slot(0, TaskType::User).unwrap();
        assert_eq!(t.get(root).upcall, 0);
        assert_eq!(t.get(root).sig.actions[0].handler, signal::SIG_DFL);
        assert_eq!(
            t.get(root).sig.actions[(signal::SIGUSR1 - 1) as usize].handler,
            signal::SIG_IGN
        );
    }

    #[test]
    fn fresh_frames_run_ring3_with_interrupts() {
        let mut t = fresh_table();
        let slot = t.alloc_slot(0, TaskType::User).unwrap();
        let frame = &t.get(slot).frame;
        assert_eq!(frame.cs, gdt::USER_CS as u64);
        assert_eq!(frame.ss, gdt::USER_DS as u64);
        assert_ne!(frame.rflags & FLAG_IF, 0);
        assert_eq!(frame.rflags & FLAG_IOPL3, 0);
        assert_eq!(frame.rsp, USER_STACK_TOP);

        let fs = t.alloc_slot(0, TaskType::FsServer).unwrap();
        assert_eq!(t.get(fs).frame.rflags & FLAG_IOPL3, FLAG_IOPL3);
    }
}
