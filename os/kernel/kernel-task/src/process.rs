//! # Processes
//!
//! A [`Process`] owns its address space, its kernel stack (user-mode
//! processes only), its mailbox and two register snapshots:
//!
//! * `kernel_regs`: the context saved when the process was switched away
//!   from; resumed by default.
//! * `user_regs`: the user context at the last system call; resumed instead
//!   when a fork returns in the parent or a blocked system call is retried.
//!
//! ## Fresh Process Stack
//!
//! ```text
//! 0xC000_0000  ┌──────────────────────────┐ KERNEL_BASE
//!              │ (unused)                 │
//! 0xBFFF_FFF8  │ n_args                   │
//! 0xBFFF_FFF4  │ args                     │
//! 0xBFFF_FFF0  │ exit trampoline          │ ← esp = ebp
//!              │ ...                      │
//! 0xBFFF_C000  └──────────────────────────┘ PROCESS_STACK_BOTTOM
//! ```
//!
//! The entry point sees a conventional call frame; returning from it lands
//! in the exit trampoline.

use crate::fatal::Fatal;
use crate::ipc::Message;
use crate::process_ref::{Liveness, ProcessRef};
use crate::registers::CpuRegisters;
use alloc::collections::VecDeque;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use bitfield_struct::bitfield;
use core::fmt;
use kernel_info::memory::{
    INITIAL_STACK_POINTER, KERNEL_STACK_PAGES, PAGE_SIZE, PROCESS_STACK_BOTTOM,
    PROCESS_STACK_PAGES, USER_HEAP_BASE,
};
use kernel_info::sched::{INIT_PID, KERNEL_PID, PRIORITY_LEVELS};
use kernel_memory_addresses::VirtualAddress;
use kernel_sync::SpinLock;
use kernel_vmem::{AddressSpace, KernelMapper, KernelMemory, MemoryError, PageEntryBits};
use log::{debug, warn};
use utils_accessors_derive::{Getters, Setters};

#[derive(Debug, Default, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ProcessId(u32);

impl ProcessId {
    /// The kernel itself; only ever a parent.
    pub const KERNEL: Self = Self(KERNEL_PID);
    pub const INIT: Self = Self(INIT_PID);

    #[must_use]
    pub const fn new(pid: u32) -> Self {
        Self(pid)
    }

    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `Runnable → {Waiting, Forking, Dead}`, `Waiting → Runnable`,
/// `Forking → Runnable`. `Dead` is final.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ProcessState {
    Runnable,
    Waiting,
    /// Parent of a fork, resumes from `user_regs` when next scheduled.
    Forking,
    Dead,
}

/// What a `Waiting` process waits for.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum WaitReason {
    /// Put to sleep explicitly; only `wake` resumes it.
    Sleep,
    Message,
    /// A specific child, or any with `None`.
    Child(Option<ProcessId>),
    /// Clock deadline in milliseconds.
    Timer(u64),
    Irq(u8),
}

#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct ProcessFlags {
    /// Free the process as soon as it dies instead of keeping it for `wait`.
    pub delete_on_exit: bool,
    /// Runs in ring 3 on its own kernel stack.
    pub user_mode: bool,
    /// The next switch resumes `user_regs` to retry a blocked system call.
    pub resume_user: bool,
    #[bits(5)]
    __: u8,
}

/// Lowest priority; larger requests are clamped to it.
#[allow(clippy::cast_possible_truncation)]
pub const LOWEST_PRIORITY: u8 = (PRIORITY_LEVELS - 1) as u8;

/// Ticks spent in user and in kernel mode.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub struct Times {
    pub user: u32,
    pub system: u32,
}

impl Times {
    #[must_use]
    pub const fn total(&self) -> u32 {
        self.user.saturating_add(self.system)
    }

    pub const fn accumulate(&mut self, other: Self) {
        self.user = self.user.saturating_add(other.user);
        self.system = self.system.saturating_add(other.system);
    }
}

/// How to start a process.
///
/// ```
/// use kernel_task::SpawnOptions;
///
/// let opts = SpawnOptions::new("init", 0x0804_8000).with_priority(2).with_user_mode(true);
/// assert_eq!(opts.priority(), 2);
/// assert!(opts.delete_on_exit());
/// ```
#[derive(Debug, Clone, Copy, Setters, Getters)]
pub struct SpawnOptions<'a> {
    #[getters(copy)]
    name: &'a str,
    #[getters(copy)]
    entry: u32,
    /// Address of the argument block, passed on the stack.
    #[getters(copy)]
    args: u32,
    #[getters(copy)]
    n_args: u32,
    #[getters(copy)]
    priority: u8,
    #[getters(copy)]
    user_mode: bool,
    #[getters(copy)]
    delete_on_exit: bool,
    /// Enqueue right away.
    #[getters(copy)]
    schedule: bool,
}

impl<'a> SpawnOptions<'a> {
    /// A kernel-mode process at priority 0, scheduled right away and freed
    /// on exit.
    #[must_use]
    pub const fn new(name: &'a str, entry: u32) -> Self {
        Self {
            name,
            entry,
            args: 0,
            n_args: 0,
            priority: 0,
            user_mode: false,
            delete_on_exit: true,
            schedule: true,
        }
    }
}

/// Resources a dead process gives back once nothing runs on them anymore.
#[derive(Debug, Default)]
pub struct Retired {
    space: Option<AddressSpace>,
    kernel_stack: Option<VirtualAddress>,
}

impl Retired {
    pub fn release<M: KernelMapper>(self, mem: &mut KernelMemory<M>) {
        if let Some(space) = self.space {
            space.release(mem);
        }
        if let Some(stack) = self.kernel_stack
            && let Err(e) = mem.munmap(stack, KERNEL_STACK_PAGES)
        {
            warn!("releasing kernel stack {stack}: {e}");
        }
    }
}

#[derive(Getters)]
pub struct Process {
    #[getters(copy)]
    id: ProcessId,
    #[getters(copy)]
    pub(crate) parent: ProcessId,
    #[getters(skip)]
    name: String,
    #[getters(copy)]
    priority: u8,
    #[getters(copy)]
    pub(crate) state: ProcessState,
    pub(crate) kernel_regs: CpuRegisters,
    pub(crate) user_regs: CpuRegisters,
    #[getters(skip)]
    address_space: Option<AddressSpace>,
    /// Base of the kernel stack mapping.
    #[getters(copy)]
    kernel_stack: Option<VirtualAddress>,
    #[getters(skip)]
    pub(crate) children: Vec<ProcessId>,
    #[getters(skip)]
    messages: SpinLock<VecDeque<Message>>,
    #[getters(copy)]
    pub(crate) break_val: u32,
    #[getters(copy)]
    pub(crate) flags: ProcessFlags,
    #[getters(copy)]
    pub(crate) times: Times,
    /// Times of children already collected.
    #[getters(copy)]
    pub(crate) child_times: Times,
    #[getters(copy)]
    pub(crate) exit_code: Option<u32>,
    #[getters(copy)]
    pub(crate) wait_reason: Option<WaitReason>,
    /// Deadline of a pending `sleep_ms`, kept across retries.
    #[getters(copy)]
    pub(crate) sleep_deadline: Option<u64>,
    /// One bit per IRQ line that fired while the process was blocked on it.
    #[getters(copy)]
    pub(crate) irq_pending: u16,
    #[getters(skip)]
    liveness: Liveness,
}

impl Process {
    /// Builds a process with a fresh address space and stack.
    ///
    /// # Errors
    /// Out of frames or kernel window; nothing stays allocated.
    pub fn spawn<M: KernelMapper>(
        mem: &mut KernelMemory<M>,
        id: ProcessId,
        parent: ProcessId,
        options: &SpawnOptions<'_>,
        exit_trampoline: u32,
    ) -> Result<Self, MemoryError> {
        let mut space = AddressSpace::new(mem)?;
        if let Err(e) = Self::build_stack(mem, &mut space, options, exit_trampoline) {
            space.release(mem);
            return Err(e);
        }

        let kernel_stack = if options.user_mode {
            match mem.mmap(KERNEL_STACK_PAGES) {
                Ok(va) => Some(va),
                Err(e) => {
                    space.release(mem);
                    return Err(e);
                }
            }
        } else {
            None
        };

        let mut regs = CpuRegisters::entry(options.entry, options.user_mode);
        regs.esp = INITIAL_STACK_POINTER;
        regs.ebp = INITIAL_STACK_POINTER;
        regs.cr3 = space.directory().as_u32();
        regs.kernel_stack = kernel_stack.map_or(0, stack_top);

        debug!(
            "process {id} ({}): entry {:#010X}, cr3 {}",
            options.name,
            options.entry,
            space.directory()
        );
        Ok(Self {
            id,
            parent,
            name: options.name.to_string(),
            priority: options.priority.min(LOWEST_PRIORITY),
            state: ProcessState::Runnable,
            kernel_regs: regs,
            user_regs: regs,
            address_space: Some(space),
            kernel_stack,
            children: Vec::new(),
            messages: SpinLock::new(VecDeque::new()),
            break_val: USER_HEAP_BASE,
            flags: ProcessFlags::new()
                .with_user_mode(options.user_mode)
                .with_delete_on_exit(options.delete_on_exit),
            times: Times::default(),
            child_times: Times::default(),
            exit_code: None,
            wait_reason: None,
            sleep_deadline: None,
            irq_pending: 0,
            liveness: Liveness::new(),
        })
    }

    fn build_stack<M: KernelMapper>(
        mem: &mut KernelMemory<M>,
        space: &mut AddressSpace,
        options: &SpawnOptions<'_>,
        exit_trampoline: u32,
    ) -> Result<(), MemoryError> {
        for page in 0..PROCESS_STACK_PAGES {
            let va = VirtualAddress::new(PROCESS_STACK_BOTTOM + page * PAGE_SIZE);
            space.map_new(mem, va, PageEntryBits::user_rw())?;
        }
        let mut frame = [0_u8; 12];
        for (word, value) in frame
            .chunks_exact_mut(4)
            .zip([exit_trampoline, options.args, options.n_args])
        {
            word.copy_from_slice(&value.to_le_bytes());
        }
        space.write(mem, VirtualAddress::new(INITIAL_STACK_POINTER), &frame)
    }

    /// Duplicates `parent` for `fork`. The child is `Runnable`, keeps its
    /// parent's registers and gets a copy of every private page.
    ///
    /// # Errors
    /// Out of memory, or `parent` has already given up its address space.
    pub fn fork_from<M: KernelMapper>(
        parent: &Self,
        mem: &mut KernelMemory<M>,
        id: ProcessId,
    ) -> Result<Self, Fatal> {
        let Some(space) = parent.address_space.as_ref() else {
            return Err(Fatal::DeadProcessScheduled(parent.id));
        };
        let space = space.duplicate(mem)?;

        let kernel_stack = if parent.flags.user_mode() {
            match mem.mmap(KERNEL_STACK_PAGES) {
                Ok(va) => Some(va),
                Err(e) => {
                    space.release(mem);
                    return Err(e.into());
                }
            }
        } else {
            None
        };

        let mut kernel_regs = parent.kernel_regs;
        let mut user_regs = parent.user_regs;
        for regs in [&mut kernel_regs, &mut user_regs] {
            regs.cr3 = space.directory().as_u32();
            if let Some(stack) = kernel_stack {
                regs.kernel_stack = stack_top(stack);
            }
        }

        Ok(Self {
            id,
            parent: parent.id,
            name: parent.name.clone(),
            priority: parent.priority,
            state: ProcessState::Runnable,
            kernel_regs,
            user_regs,
            address_space: Some(space),
            kernel_stack,
            children: Vec::new(),
            messages: SpinLock::new(VecDeque::new()),
            break_val: parent.break_val,
            flags: ProcessFlags::new().with_user_mode(parent.flags.user_mode()),
            times: Times::default(),
            child_times: Times::default(),
            exit_code: None,
            wait_reason: None,
            sleep_deadline: None,
            irq_pending: 0,
            liveness: Liveness::new(),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn children(&self) -> &[ProcessId] {
        &self.children
    }

    #[must_use]
    pub const fn address_space(&self) -> Option<&AddressSpace> {
        self.address_space.as_ref()
    }

    pub const fn address_space_mut(&mut self) -> Option<&mut AddressSpace> {
        self.address_space.as_mut()
    }

    #[must_use]
    pub fn downgrade(&self) -> ProcessRef {
        self.liveness.handle(self.id)
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.liveness.is_alive()
    }

    #[must_use]
    pub const fn is_waiting_for(&self, reason: WaitReason) -> bool {
        matches!(self.state, ProcessState::Waiting)
            && matches!(self.wait_reason, Some(r) if matches_reason(r, reason))
    }

    pub fn push_message(&self, message: Message) {
        self.messages.lock().push_back(message);
    }

    /// Oldest message, from any channel.
    pub fn pop_message(&self) -> Option<Message> {
        self.messages.lock().pop_front()
    }

    /// Oldest message sent on `channel`.
    pub fn pop_message_on(&self, channel: &str) -> Option<Message> {
        self.take_message(|m| m.channel() == channel)
    }

    /// Removes the oldest message `select` accepts.
    pub fn take_message(&self, mut select: impl FnMut(&Message) -> bool) -> Option<Message> {
        let mut queue = self.messages.lock();
        let at = queue.iter().position(|m| select(m))?;
        queue.remove(at)
    }

    #[must_use]
    pub fn has_message_on(&self, channel: &str) -> bool {
        self.messages.lock().iter().any(|m| m.channel() == channel)
    }

    #[must_use]
    pub fn pending_messages(&self) -> usize {
        self.messages.lock().len()
    }

    /// Marks the process dead and hands out what must be freed. Handles to
    /// it become stale and its mailbox is dropped.
    pub(crate) fn retire(&mut self, code: u32) -> Retired {
        self.state = ProcessState::Dead;
        self.exit_code = Some(code);
        self.wait_reason = None;
        self.liveness.invalidate();
        self.messages.lock().clear();
        Retired {
            space: self.address_space.take(),
            kernel_stack: self.kernel_stack.take(),
        }
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("parent", &self.parent)
            .field("priority", &self.priority)
            .field("state", &self.state)
            .field("eip", &format_args!("{:#010X}", self.kernel_regs.eip))
            .finish_non_exhaustive()
    }
}

/// `Child(None)` is satisfied by any child.
const fn matches_reason(waiting: WaitReason, event: WaitReason) -> bool {
    match (waiting, event) {
        (WaitReason::Child(None), WaitReason::Child(_)) => true,
        (WaitReason::Child(Some(a)), WaitReason::Child(Some(b))) => a.0 == b.0,
        (WaitReason::Irq(a), WaitReason::Irq(b)) => a == b,
        (WaitReason::Sleep, WaitReason::Sleep)
        | (WaitReason::Message, WaitReason::Message)
        | (WaitReason::Timer(_), WaitReason::Timer(_)) => true,
        _ => false,
    }
}

const fn stack_top(base: VirtualAddress) -> u32 {
    base.as_u32() + KERNEL_STACK_PAGES * PAGE_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_pack_into_a_byte() {
        let flags = ProcessFlags::new().with_delete_on_exit(true).with_resume_user(true);
        assert_eq!(flags.into_bits(), 0b101);
    }

    #[test]
    fn any_child_matches_every_child() {
        let pid = ProcessId::new(4);
        assert!(matches_reason(WaitReason::Child(None), WaitReason::Child(Some(pid))));
        assert!(matches_reason(WaitReason::Child(Some(pid)), WaitReason::Child(Some(pid))));
        assert!(!matches_reason(
            WaitReason::Child(Some(pid)),
            WaitReason::Child(Some(ProcessId::new(5)))
        ));
        assert!(!matches_reason(WaitReason::Irq(1), WaitReason::Irq(3)));
        assert!(!matches_reason(WaitReason::Message, WaitReason::Sleep));
    }

    #[test]
    fn times_saturate() {
        let mut t = Times { user: u32::MAX, system: 1 };
        t.accumulate(Times { user: 1, system: 2 });
        assert_eq!(t, Times { user: u32::MAX, system: 3 });
        assert_eq!(t.total(), u32::MAX);
    }
}
