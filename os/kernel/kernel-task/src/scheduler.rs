//! # Priority Scheduler
//!
//! One FIFO run queue per priority level; level 0 drains completely before
//! level 1 is looked at. The scheduler owns the process table and knows the
//! current process. It never switches contexts itself, see
//! [`Kernel::enter`](crate::Kernel::enter).
//!
//! Run-queue membership follows the process state: a `Runnable` process is
//! queued exactly once unless it is the current one, `Waiting` and `Dead`
//! processes are not queued.

use crate::process::{Process, ProcessId, ProcessState, WaitReason};
use crate::process_ref::{ProcessRef, StaleReference};
use alloc::collections::{BTreeMap, VecDeque};
use kernel_info::sched::{FIRST_DYNAMIC_PID, PID_OVERFLOW_RESTART, PRIORITY_LEVELS};
use kernel_vmem::MemoryError;
use log::{debug, warn};

#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum SchedError {
    #[error("no process {0}")]
    UnknownProcess(ProcessId),
    #[error("process {0} is dead")]
    Dead(ProcessId),
    #[error("process {child} is not a child of {parent}")]
    NotAChild { parent: ProcessId, child: ProcessId },
    #[error("process {0} has no children")]
    NoChildren(ProcessId),
    #[error("break {requested:#010X} of process {pid} is out of range")]
    InvalidBreak { pid: ProcessId, requested: u32 },
    #[error("process {0} ran its heap into its stack")]
    HeapCollision(ProcessId),
    #[error("IRQ {0} does not exist")]
    InvalidIrq(u8),
    #[error(transparent)]
    Stale(#[from] StaleReference),
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

pub struct Scheduler {
    processes: BTreeMap<ProcessId, Process>,
    run_queues: [VecDeque<ProcessId>; PRIORITY_LEVELS],
    current: Option<ProcessId>,
    next_pid: u32,
    /// Set once the PID space wrapped; from then on allocation probes.
    overflowed: bool,
}

impl Scheduler {
    #[must_use]
    pub const fn new() -> Self {
        Self::starting_at(FIRST_DYNAMIC_PID)
    }

    /// A scheduler whose next PID is `next_pid`.
    #[must_use]
    pub const fn starting_at(next_pid: u32) -> Self {
        Self {
            processes: BTreeMap::new(),
            run_queues: [const { VecDeque::new() }; PRIORITY_LEVELS],
            current: None,
            next_pid,
            overflowed: false,
        }
    }

    /// Hands out the next PID. After the 32-bit space wrapped, allocation
    /// restarts at [`PID_OVERFLOW_RESTART`] and skips PIDs still in the table.
    pub fn allocate_pid(&mut self) -> ProcessId {
        loop {
            let pid = self.next_pid;
            self.next_pid = if let Some(next) = pid.checked_add(1) {
                next
            } else {
                warn!("PID space wrapped, restarting at {PID_OVERFLOW_RESTART}");
                self.overflowed = true;
                PID_OVERFLOW_RESTART
            };
            let pid = ProcessId::new(pid);
            if !self.overflowed || !self.processes.contains_key(&pid) {
                return pid;
            }
        }
    }

    /// Adds `process` to the table, and to its run queue if `schedule_now`.
    pub fn spawn(&mut self, process: Process, schedule_now: bool) {
        let pid = process.id();
        if self.processes.insert(pid, process).is_some() {
            warn!("process {pid} replaced an existing entry");
        }
        if schedule_now {
            if let Err(e) = self.add_to_runqueue(pid) {
                warn!("scheduling new process {pid}: {e}");
            }
        }
    }

    /// Marks `pid` runnable and appends it to its run queue, unless it is
    /// already queued. Returns whether it was appended.
    ///
    /// # Errors
    /// Unknown or dead process.
    pub fn add_to_runqueue(&mut self, pid: ProcessId) -> Result<bool, SchedError> {
        let process = self
            .processes
            .get_mut(&pid)
            .ok_or(SchedError::UnknownProcess(pid))?;
        if process.state() == ProcessState::Dead {
            warn!("refusing to enqueue dead process {pid}");
            return Err(SchedError::Dead(pid));
        }
        process.state = ProcessState::Runnable;
        process.wait_reason = None;

        let queue = &mut self.run_queues[usize::from(process.priority())];
        if queue.contains(&pid) {
            return Ok(false);
        }
        queue.push_back(pid);
        Ok(true)
    }

    /// Returns whether `pid` was queued anywhere.
    pub fn remove_from_runqueues(&mut self, pid: ProcessId) -> bool {
        let mut found = false;
        for queue in &mut self.run_queues {
            let before = queue.len();
            queue.retain(|&p| p != pid);
            found |= queue.len() != before;
        }
        found
    }

    /// Pops the head of the highest-priority non-empty queue and makes it
    /// current. Dead entries are skipped, and freed if they asked for it.
    /// `None` means idle.
    pub fn pick_next(&mut self) -> Option<ProcessId> {
        for queue in &mut self.run_queues {
            while let Some(pid) = queue.pop_front() {
                match self.processes.get(&pid) {
                    None => {}
                    Some(p) if p.state() == ProcessState::Dead => {
                        if p.flags().delete_on_exit() {
                            self.processes.remove(&pid);
                            debug!("freed dead process {pid}");
                        }
                    }
                    Some(_) => {
                        self.current = Some(pid);
                        return Some(pid);
                    }
                }
            }
        }
        None
    }

    #[must_use]
    pub const fn current(&self) -> Option<ProcessId> {
        self.current
    }

    pub const fn set_current(&mut self, pid: Option<ProcessId>) {
        self.current = pid;
    }

    #[must_use]
    pub fn current_process(&self) -> Option<&Process> {
        self.current.and_then(|pid| self.processes.get(&pid))
    }

    pub fn current_process_mut(&mut self) -> Option<&mut Process> {
        self.current.and_then(|pid| self.processes.get_mut(&pid))
    }

    #[must_use]
    pub fn lookup(&self, pid: ProcessId) -> Option<&Process> {
        self.processes.get(&pid)
    }

    pub fn lookup_mut(&mut self, pid: ProcessId) -> Option<&mut Process> {
        self.processes.get_mut(&pid)
    }

    /// Dereferences a weak handle.
    ///
    /// # Errors
    /// The process died, even if its PID has been reused since.
    pub fn get(&self, handle: &ProcessRef) -> Result<&Process, StaleReference> {
        let pid = handle.upgrade()?;
        self.processes.get(&pid).ok_or(StaleReference(pid))
    }

    /// Mutable variant of [`get`](Self::get).
    ///
    /// # Errors
    /// The process died.
    pub fn get_mut(&mut self, handle: &ProcessRef) -> Result<&mut Process, StaleReference> {
        let pid = handle.upgrade()?;
        self.processes.get_mut(&pid).ok_or(StaleReference(pid))
    }

    /// Parks `pid` until it is woken.
    ///
    /// # Errors
    /// Unknown or dead process.
    pub fn sleep(&mut self, pid: ProcessId, reason: WaitReason) -> Result<(), SchedError> {
        let process = self
            .processes
            .get_mut(&pid)
            .ok_or(SchedError::UnknownProcess(pid))?;
        if process.state() == ProcessState::Dead {
            return Err(SchedError::Dead(pid));
        }
        process.state = ProcessState::Waiting;
        process.wait_reason = Some(reason);
        self.remove_from_runqueues(pid);
        debug!("process {pid} waits for {reason:?}");
        Ok(())
    }

    /// Makes a waiting process runnable again. Returns whether it was waiting.
    pub fn wake(&mut self, pid: ProcessId) -> bool {
        match self.processes.get(&pid) {
            Some(p) if p.state() == ProcessState::Waiting => {
                debug!("waking process {pid}");
                self.add_to_runqueue(pid).is_ok()
            }
            _ => false,
        }
    }

    /// Wakes `pid` only if it waits for `event`.
    pub fn wake_for(&mut self, pid: ProcessId, event: WaitReason) -> bool {
        match self.processes.get(&pid) {
            Some(p) if p.is_waiting_for(event) => self.wake(pid),
            _ => false,
        }
    }

    /// Takes `pid` out of the table and every queue.
    pub(crate) fn remove(&mut self, pid: ProcessId) -> Option<Process> {
        self.remove_from_runqueues(pid);
        self.processes.remove(&pid)
    }

    pub fn processes(&self) -> impl Iterator<Item = &Process> {
        self.processes.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.processes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    /// Queued PIDs of one level, head first.
    pub fn run_queue(&self, priority: u8) -> impl Iterator<Item = ProcessId> + '_ {
        self.run_queues
            .get(usize::from(priority))
            .into_iter()
            .flatten()
            .copied()
    }

    #[must_use]
    pub fn is_queued(&self, pid: ProcessId) -> bool {
        self.run_queues.iter().any(|q| q.contains(&pid))
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SpawnOptions;
    use kernel_info::boot::MemoryRegion;
    use kernel_vmem::hosted::{self, HostedMapper};
    use kernel_vmem::KernelMemory;

    fn memory() -> KernelMemory<HostedMapper> {
        hosted::boot(&[MemoryRegion::available(0, 16 << 20)]).unwrap()
    }

    fn process(mem: &mut KernelMemory<HostedMapper>, pid: u32, priority: u8) -> Process {
        let opts = SpawnOptions::new("t", 0x0804_8000).with_priority(priority);
        Process::spawn(mem, ProcessId::new(pid), ProcessId::KERNEL, &opts, 0x0804_0000).unwrap()
    }

    #[test]
    fn dead_entries_are_skipped_and_freed() {
        let mut mem = memory();
        let mut sched = Scheduler::new();
        sched.spawn(process(&mut mem, 2, 0), true);
        sched.spawn(process(&mut mem, 3, 0), true);
        let retired = sched.lookup_mut(ProcessId::new(2)).unwrap().retire(0);
        retired.release(&mut mem);

        assert_eq!(sched.pick_next(), Some(ProcessId::new(3)));
        assert!(sched.lookup(ProcessId::new(2)).is_none(), "delete-on-exit entry freed");
        assert_eq!(sched.pick_next(), None);
    }

    #[test]
    fn overflow_probes_past_live_pids() {
        let mut mem = memory();
        let mut sched = Scheduler::starting_at(u32::MAX);
        assert_eq!(sched.allocate_pid(), ProcessId::new(u32::MAX));
        for pid in [777, 778, 780] {
            sched.spawn(process(&mut mem, pid, 3), false);
        }
        assert_eq!(sched.allocate_pid(), ProcessId::new(779));
        assert_eq!(sched.allocate_pid(), ProcessId::new(781));
    }
}
