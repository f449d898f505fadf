use crate::arch::Platform;
use crate::fatal::Fatal;
use crate::ipc::ChannelRegistry;
use crate::process::{Process, ProcessId, ProcessState, Retired, SpawnOptions, Times, WaitReason};
use crate::scheduler::{SchedError, Scheduler};
use crate::work::WorkQueue;
use alloc::collections::BTreeSet;
use alloc::vec::Vec;
use core::task::Poll;
use kernel_info::cpu::{IRQ_LINES, TIMER_IRQ};
use kernel_info::memory::{PAGE_SIZE, PROCESS_STACK_BOTTOM, USER_HEAP_BASE};
use kernel_info::sched::{MS_PER_TICK, RUN_TIMESLICE};
use kernel_memory_addresses::{Size4K, VirtualAddress};
use kernel_sync::IrqGuard;
use kernel_vmem::fault::{FaultResolution, PageFaultError, handle_page_fault};
use kernel_vmem::{KernelMapper, KernelMemory};
use log::{debug, info, warn};
use stdlib::syscall_abi::Tms;

/// Exit code of a process the kernel terminated.
pub const EXIT_KILLED: u32 = u32::MAX;

/// The process and memory core: everything the interrupt glue talks to.
///
/// All methods run with interrupts masked unless stated otherwise. There is
/// exactly one CPU, so that is the only synchronization the kernel state
/// needs.
pub struct Kernel<M: KernelMapper, P: Platform> {
    pub(crate) memory: KernelMemory<M>,
    pub(crate) platform: P,
    pub(crate) scheduler: Scheduler,
    pub(crate) channels: ChannelRegistry,
    pub(crate) work: WorkQueue,
    ticks: u64,
    /// `(deadline in ms, sleeper)`, earliest first.
    timers: BTreeSet<(u64, ProcessId)>,
    irq_waiters: [Vec<ProcessId>; IRQ_LINES],
    /// Resources of processes that died while current.
    retired: Vec<(ProcessId, Retired)>,
    pub(crate) timeslice: u32,
    pub(crate) bootstrap: bool,
    multitasking: bool,
}

impl<M: KernelMapper, P: Platform> Kernel<M, P> {
    #[must_use]
    pub fn new(memory: KernelMemory<M>, platform: P) -> Self {
        Self::with_scheduler(memory, platform, Scheduler::new())
    }

    #[must_use]
    pub const fn with_scheduler(memory: KernelMemory<M>, platform: P, scheduler: Scheduler) -> Self {
        Self {
            memory,
            platform,
            scheduler,
            channels: ChannelRegistry::new(),
            work: WorkQueue::new(),
            ticks: 0,
            timers: BTreeSet::new(),
            irq_waiters: [const { Vec::new() }; IRQ_LINES],
            retired: Vec::new(),
            timeslice: RUN_TIMESLICE,
            bootstrap: false,
            multitasking: false,
        }
    }

    #[must_use]
    pub const fn memory(&self) -> &KernelMemory<M> {
        &self.memory
    }

    pub const fn memory_mut(&mut self) -> &mut KernelMemory<M> {
        &mut self.memory
    }

    #[must_use]
    pub const fn platform(&self) -> &P {
        &self.platform
    }

    pub const fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    #[must_use]
    pub const fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub const fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    #[must_use]
    pub const fn ticks(&self) -> u64 {
        self.ticks
    }

    #[must_use]
    pub const fn uptime_ms(&self) -> u64 {
        self.ticks * MS_PER_TICK
    }

    /// Cleared while the CPU idles for lack of runnable processes.
    #[must_use]
    pub const fn is_multitasking(&self) -> bool {
        self.multitasking
    }

    #[must_use]
    pub const fn timeslice(&self) -> u32 {
        self.timeslice
    }

    /// Creates a process as a child of the current one (or of the kernel).
    ///
    /// # Errors
    /// Out of memory.
    pub fn spawn(&mut self, options: &SpawnOptions<'_>) -> Result<ProcessId, Fatal> {
        let pid = self.scheduler.allocate_pid();
        self.spawn_as(pid, options, options.schedule())
    }

    fn spawn_as(
        &mut self,
        pid: ProcessId,
        options: &SpawnOptions<'_>,
        schedule_now: bool,
    ) -> Result<ProcessId, Fatal> {
        let parent = self.scheduler.current().unwrap_or(ProcessId::KERNEL);
        let exit_trampoline = self.platform.exit_trampoline();
        let process = Process::spawn(&mut self.memory, pid, parent, options, exit_trampoline)?;
        if let Some(parent) = self.scheduler.lookup_mut(parent) {
            parent.children.push(pid);
        }
        info!(
            "spawned process {pid} ({}) at priority {}",
            process.name(),
            process.priority()
        );
        self.scheduler.spawn(process, schedule_now);
        Ok(pid)
    }

    /// Creates the first process and makes it current. Runs once, before
    /// [`start`](Self::start).
    ///
    /// # Errors
    /// Out of memory.
    pub fn spawn_init(&mut self, options: &SpawnOptions<'_>) -> Result<ProcessId, Fatal> {
        if self.scheduler.lookup(ProcessId::INIT).is_some() {
            warn!("init already exists");
            return Ok(ProcessId::INIT);
        }
        let pid = self.spawn_as(ProcessId::INIT, options, false)?;
        self.scheduler.set_current(Some(pid));
        Ok(pid)
    }

    /// Arms the bootstrap path: the next [`enter`](Self::enter) loads the
    /// current process without saving anything.
    pub const fn start(&mut self) {
        self.bootstrap = true;
        self.multitasking = true;
        self.timeslice = RUN_TIMESLICE;
    }

    /// Duplicates the current process. The child becomes current and the
    /// parent is queued to resume from its system call with the child's PID
    /// in `eax`.
    ///
    /// # Errors
    /// No current process or out of memory.
    pub fn fork(&mut self) -> Result<ProcessId, Fatal> {
        let parent_id = self.scheduler.current().ok_or(Fatal::NoCurrentProcess)?;
        let child_id = self.scheduler.allocate_pid();
        let parent = self
            .scheduler
            .lookup(parent_id)
            .ok_or(Fatal::NoCurrentProcess)?;
        let child = Process::fork_from(parent, &mut self.memory, child_id)?;

        let parent = self
            .scheduler
            .lookup_mut(parent_id)
            .ok_or(Fatal::NoCurrentProcess)?;
        parent.children.push(child_id);
        parent.user_regs.eax = child_id.as_u32();
        self.scheduler.spawn(child, false);
        self.scheduler
            .add_to_runqueue(parent_id)
            .map_err(|_| Fatal::DeadProcessScheduled(parent_id))?;
        if let Some(parent) = self.scheduler.lookup_mut(parent_id) {
            parent.state = ProcessState::Forking;
        }
        self.scheduler.set_current(Some(child_id));
        info!("process {parent_id} forked {child_id}");
        Ok(child_id)
    }

    /// Picks the next process and makes it current. Halts while nothing is
    /// runnable, delivering the interrupts that arrive meanwhile.
    ///
    /// Returns with interrupts masked.
    ///
    /// # Errors
    /// [`Fatal::Idle`] when halting can never end.
    pub fn schedule(&mut self) -> Result<ProcessId, Fatal> {
        self.platform.disable();
        loop {
            if let Some(pid) = self.scheduler.pick_next() {
                if !self.multitasking {
                    debug!("leaving idle");
                    self.multitasking = true;
                }
                return Ok(pid);
            }

            if self.multitasking {
                debug!("nothing runnable, idling");
                self.multitasking = false;
            }
            self.scheduler.set_current(None);
            self.platform.enable();
            let irq = self.platform.wait_for_interrupt();
            self.platform.disable();
            match irq {
                Some(TIMER_IRQ) => {
                    self.timer_tick(false);
                }
                Some(irq) => {
                    if let Err(e) = self.irq_fired(irq) {
                        warn!("idle: {e}");
                    }
                }
                None => return Err(Fatal::Idle),
            }
        }
    }

    /// Parks `pid` until [`wake`](Self::wake).
    ///
    /// # Errors
    /// Unknown or dead process.
    pub fn sleep(&mut self, pid: ProcessId) -> Result<(), SchedError> {
        self.scheduler.sleep(pid, WaitReason::Sleep)
    }

    /// Makes a sleeping process runnable. Drivers may call this with
    /// interrupts enabled.
    pub fn wake(&mut self, pid: ProcessId) -> bool {
        let _masked = IrqGuard::new(&self.platform);
        self.scheduler.wake(pid)
    }

    /// Terminates `pid`: its handles go stale, it leaves the run queues and
    /// its memory is released (deferred while it is still current). Dead
    /// children are reaped, live ones are handed to the kernel, and a parent
    /// waiting for it is woken.
    ///
    /// # Errors
    /// Unknown process.
    pub fn exit(&mut self, pid: ProcessId, code: u32) -> Result<(), SchedError> {
        let process = self
            .scheduler
            .lookup_mut(pid)
            .ok_or(SchedError::UnknownProcess(pid))?;
        if process.state() == ProcessState::Dead {
            return Ok(());
        }
        let retired = process.retire(code);
        let parent = process.parent();
        let delete = process.flags().delete_on_exit();
        let children = core::mem::take(&mut process.children);
        let mut times = process.times();
        times.accumulate(process.child_times());

        self.scheduler.remove_from_runqueues(pid);
        self.timers.retain(|&(_, p)| p != pid);
        for waiters in &mut self.irq_waiters {
            waiters.retain(|&p| p != pid);
        }
        let owned = self.channels.remove_owned_by(pid);
        if owned > 0 {
            debug!("dropped {owned} channels of process {pid}");
        }
        if self.scheduler.current() == Some(pid) {
            self.retired.push((pid, retired));
        } else {
            retired.release(&mut self.memory);
        }

        for child in children {
            match self.scheduler.lookup_mut(child) {
                Some(c) if c.state() == ProcessState::Dead => {
                    self.scheduler.remove(child);
                    debug!("reaped zombie {child} of {pid}");
                }
                Some(c) => {
                    c.parent = ProcessId::KERNEL;
                    c.flags.set_delete_on_exit(true);
                }
                None => {}
            }
        }

        if delete {
            self.scheduler.remove(pid);
            if let Some(parent) = self.scheduler.lookup_mut(parent) {
                parent.children.retain(|&c| c != pid);
                parent.child_times.accumulate(times);
            }
        }
        self.scheduler.wake_for(parent, WaitReason::Child(Some(pid)));
        info!("process {pid} exited with {code}");
        Ok(())
    }

    /// Frees memory of processes that died while current, once another
    /// process runs.
    pub fn reclaim(&mut self) {
        let current = self.scheduler.current();
        let mut i = 0;
        while i < self.retired.len() {
            if Some(self.retired[i].0) == current {
                i += 1;
            } else {
                let (pid, retired) = self.retired.swap_remove(i);
                retired.release(&mut self.memory);
                debug!("reclaimed memory of process {pid}");
            }
        }
    }

    /// `process::wait()`: the exit code of `child` once it died.
    ///
    /// # Errors
    /// `child` is not a child of `parent`.
    pub fn wait_child(
        &mut self,
        parent: ProcessId,
        child: ProcessId,
    ) -> Result<Poll<u32>, SchedError> {
        let owner = self
            .scheduler
            .lookup(parent)
            .ok_or(SchedError::UnknownProcess(parent))?;
        if !owner.children().contains(&child) {
            return Err(SchedError::NotAChild { parent, child });
        }
        let process = self
            .scheduler
            .lookup_mut(child)
            .ok_or(SchedError::NotAChild { parent, child })?;
        process.flags.set_delete_on_exit(false);
        if process.state() == ProcessState::Dead {
            return Ok(Poll::Ready(self.collect(parent, child)));
        }
        self.scheduler.sleep(parent, WaitReason::Child(Some(child)))?;
        Ok(Poll::Pending)
    }

    /// POSIX `wait`: the first dead child and its exit code.
    ///
    /// # Errors
    /// `parent` has no children.
    pub fn wait_any(&mut self, parent: ProcessId) -> Result<Poll<(ProcessId, u32)>, SchedError> {
        let owner = self
            .scheduler
            .lookup(parent)
            .ok_or(SchedError::UnknownProcess(parent))?;
        if owner.children().is_empty() {
            return Err(SchedError::NoChildren(parent));
        }
        let dead = owner.children().iter().copied().find(|&c| {
            self.scheduler
                .lookup(c)
                .is_none_or(|p| p.state() == ProcessState::Dead)
        });
        if let Some(child) = dead {
            return Ok(Poll::Ready((child, self.collect(parent, child))));
        }
        let children = owner.children().to_vec();
        for child in children {
            if let Some(c) = self.scheduler.lookup_mut(child) {
                c.flags.set_delete_on_exit(false);
            }
        }
        self.scheduler.sleep(parent, WaitReason::Child(None))?;
        Ok(Poll::Pending)
    }

    /// Removes a dead child and returns its exit code.
    fn collect(&mut self, parent: ProcessId, child: ProcessId) -> u32 {
        let (code, times) = match self.scheduler.remove(child) {
            Some(c) => {
                let mut times = c.times();
                times.accumulate(c.child_times());
                (c.exit_code().unwrap_or(0), times)
            }
            None => (0, Times::default()),
        };
        if let Some(p) = self.scheduler.lookup_mut(parent) {
            p.children.retain(|&c| c != child);
            p.child_times.accumulate(times);
        }
        debug!("process {parent} collected {child} (code {code})");
        code
    }

    /// Moves the break of `pid` by `increment` bytes and returns the old
    /// break. Pages given back are unmapped. Growing into the stack kills the
    /// process.
    ///
    /// # Errors
    /// Break below the heap base, or [`SchedError::HeapCollision`].
    pub fn sbrk(&mut self, pid: ProcessId, increment: i32) -> Result<u32, SchedError> {
        let process = self
            .scheduler
            .lookup_mut(pid)
            .ok_or(SchedError::UnknownProcess(pid))?;
        let old = process.break_val();
        let Some(new) = old.checked_add_signed(increment) else {
            warn!("process {pid}: break overflow");
            return Err(SchedError::InvalidBreak { pid, requested: old });
        };
        if new < USER_HEAP_BASE {
            warn!("process {pid}: break {new:#010X} below heap base");
            return Err(SchedError::InvalidBreak { pid, requested: new });
        }
        if new > PROCESS_STACK_BOTTOM {
            warn!("process {pid}: heap at {new:#010X} runs into the stack, terminating");
            self.exit(pid, EXIT_KILLED)?;
            return Err(SchedError::HeapCollision(pid));
        }
        process.break_val = new;

        if new < old
            && let Some(space) = process.address_space_mut()
        {
            let first = page_above(new);
            let end = page_above(old);
            let mut page = first;
            while page < end {
                let va = VirtualAddress::new(page);
                if space.get(&mut self.memory, va).is_some() {
                    space.unmap(&mut self.memory, va)?;
                }
                page += PAGE_SIZE;
            }
        }
        debug!("process {pid}: break {old:#010X} -> {new:#010X}");
        Ok(old)
    }

    /// Ticks of `pid` and of its children, and ticks since boot.
    ///
    /// # Errors
    /// Unknown process.
    pub fn times(&self, pid: ProcessId) -> Result<(Tms, u64), SchedError> {
        let process = self
            .scheduler
            .lookup(pid)
            .ok_or(SchedError::UnknownProcess(pid))?;
        let mut children = process.child_times();
        for child in process.children() {
            if let Some(c) = self.scheduler.lookup(*child) {
                children.accumulate(c.times());
                children.accumulate(c.child_times());
            }
        }
        let own = process.times();
        let tms = Tms {
            tms_utime: own.user,
            tms_stime: own.system,
            tms_cutime: children.user,
            tms_cstime: children.system,
        };
        Ok((tms, self.ticks))
    }

    /// One timer interrupt: advances the clock, charges the current process,
    /// expires timers. Returns whether the timeslice ran out.
    pub fn timer_tick(&mut self, from_user: bool) -> bool {
        self.ticks += 1;
        if let Some(process) = self.scheduler.current_process_mut() {
            if from_user {
                process.times.user = process.times.user.saturating_add(1);
            } else {
                process.times.system = process.times.system.saturating_add(1);
            }
        }

        let now = self.uptime_ms();
        while let Some(&(deadline, pid)) = self.timers.first()
            && deadline <= now
        {
            self.timers.pop_first();
            self.scheduler.wake_for(pid, WaitReason::Timer(deadline));
        }

        self.timeslice = self.timeslice.saturating_sub(1);
        self.timeslice == 0
    }

    /// Blocks `pid` for `ms` milliseconds. A retried call after the deadline
    /// completes.
    ///
    /// # Errors
    /// Unknown process.
    pub fn sleep_ms(&mut self, pid: ProcessId, ms: u64) -> Result<Poll<()>, SchedError> {
        let now = self.uptime_ms();
        let process = self
            .scheduler
            .lookup_mut(pid)
            .ok_or(SchedError::UnknownProcess(pid))?;
        let deadline = match process.sleep_deadline() {
            Some(deadline) if now >= deadline => {
                process.sleep_deadline = None;
                return Ok(Poll::Ready(()));
            }
            Some(deadline) => deadline,
            None if ms == 0 => return Ok(Poll::Ready(())),
            None => now.saturating_add(ms),
        };
        process.sleep_deadline = Some(deadline);
        self.timers.insert((deadline, pid));
        self.scheduler.sleep(pid, WaitReason::Timer(deadline))?;
        Ok(Poll::Pending)
    }

    /// Blocks `pid` until `irq` fires. A retried call after the IRQ completes.
    ///
    /// # Errors
    /// Unknown process or IRQ line.
    pub fn block_for_irq(&mut self, pid: ProcessId, irq: u8) -> Result<Poll<()>, SchedError> {
        let waiters = self
            .irq_waiters
            .get_mut(usize::from(irq))
            .ok_or(SchedError::InvalidIrq(irq))?;
        let process = self
            .scheduler
            .lookup_mut(pid)
            .ok_or(SchedError::UnknownProcess(pid))?;
        let line = 1_u16 << irq;
        if process.irq_pending & line != 0 {
            process.irq_pending &= !line;
            waiters.retain(|&p| p != pid);
            return Ok(Poll::Ready(()));
        }
        if !waiters.contains(&pid) {
            waiters.push(pid);
        }
        self.scheduler.sleep(pid, WaitReason::Irq(irq))?;
        Ok(Poll::Pending)
    }

    /// Delivers `irq` to the processes blocked on it and returns how many
    /// were woken.
    ///
    /// # Errors
    /// No such IRQ line.
    pub fn irq_fired(&mut self, irq: u8) -> Result<usize, SchedError> {
        let _masked = IrqGuard::new(&self.platform);
        let waiters = self
            .irq_waiters
            .get_mut(usize::from(irq))
            .map(core::mem::take)
            .ok_or(SchedError::InvalidIrq(irq))?;
        let mut woken = 0;
        for pid in waiters {
            if let Some(process) = self.scheduler.lookup_mut(pid) {
                process.irq_pending |= 1 << irq;
            }
            if self.scheduler.wake_for(pid, WaitReason::Irq(irq)) {
                woken += 1;
            }
        }
        debug!("IRQ {irq} woke {woken} processes");
        Ok(woken)
    }

    /// Resolves a page fault of the current process.
    ///
    /// # Errors
    /// Null dereferences, kernel protection violations and exhaustion.
    pub fn page_fault(
        &mut self,
        address: VirtualAddress,
        error: PageFaultError,
        eip: u32,
    ) -> Result<FaultResolution, Fatal> {
        let space = self
            .scheduler
            .current_process_mut()
            .and_then(Process::address_space_mut);
        handle_page_fault(&mut self.memory, space, address, error, eip).map_err(Fatal::from)
    }
}

/// First page boundary at or above `address`.
const fn page_above(address: u32) -> u32 {
    match VirtualAddress::new(address).checked_align_up::<Size4K>() {
        Some(va) => va.as_u32(),
        None => u32::MAX,
    }
}
