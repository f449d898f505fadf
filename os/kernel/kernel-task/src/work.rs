//! # Deferred Work
//!
//! Jobs that should not run in the context that produced them are queued
//! for a kernel-mode worker process. The worker owns two channels:
//!
//! * [`READY_CHANNEL`] (inverse multicast): spawners signal new work to the
//!   worker;
//! * [`FINISHED_CHANNEL`] (multicast): the worker announces finished jobs to
//!   whoever listens, payload being the little-endian [`WorkId`].
//!
//! Jobs run in the order they were queued. A finished job's code is kept
//! until the spawner collects it with [`Kernel::wait_work`] or dies; jobs
//! scheduled with `auto_remove` are forgotten as soon as they ran.

use crate::arch::Platform;
use crate::fatal::Fatal;
use crate::ipc::{ChannelMode, IpcError};
use crate::kernel::Kernel;
use crate::process::{Process, ProcessId, SpawnOptions, WaitReason};
use crate::process_ref::ProcessRef;
use crate::scheduler::SchedError;
use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use core::fmt;
use core::task::Poll;
use kernel_vmem::KernelMapper;
use log::{debug, info, warn};

pub const READY_CHANNEL: &str = "kworker.ready";
pub const FINISHED_CHANNEL: &str = "kworker.finished";

/// A unit of deferred work and its exit code.
pub type Job = Box<dyn FnOnce() -> u32 + Send>;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct WorkId(u64);

impl WorkId {
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    const fn to_le_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }
}

impl fmt::Display for WorkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum WorkError {
    #[error("no worker process running")]
    NoWorker,
    #[error("unknown work item {0}")]
    Unknown(WorkId),
    #[error(transparent)]
    Ipc(#[from] IpcError),
    #[error(transparent)]
    Sched(#[from] SchedError),
    #[error(transparent)]
    Fatal(#[from] Fatal),
}

struct WorkItem {
    id: WorkId,
    spawner: ProcessRef,
    job: Job,
    auto_remove: bool,
}

struct Finished {
    spawner: ProcessRef,
    code: u32,
}

pub struct WorkQueue {
    worker: Option<ProcessId>,
    next_id: u64,
    pending: VecDeque<WorkItem>,
    finished: BTreeMap<WorkId, Finished>,
}

impl WorkQueue {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            worker: None,
            next_id: 0,
            pending: VecDeque::new(),
            finished: BTreeMap::new(),
        }
    }

    #[must_use]
    pub const fn worker(&self) -> Option<ProcessId> {
        self.worker
    }

    /// Jobs not yet run.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Finished jobs whose code nobody collected yet.
    #[must_use]
    pub fn uncollected(&self) -> usize {
        self.finished.len()
    }

    #[must_use]
    pub fn is_finished(&self, id: WorkId) -> bool {
        self.finished.contains_key(&id)
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkQueue")
            .field("worker", &self.worker)
            .field("pending", &self.pending.len())
            .field("finished", &self.finished.len())
            .finish()
    }
}

impl<M: KernelMapper, P: Platform> Kernel<M, P> {
    #[must_use]
    pub const fn work(&self) -> &WorkQueue {
        &self.work
    }

    /// Spawns the worker at `entry` and registers its channels. Does nothing
    /// while a worker is alive.
    ///
    /// # Errors
    /// Out of memory, or the channel names are taken by another process.
    pub fn start_worker(&mut self, entry: u32) -> Result<ProcessId, WorkError> {
        if let Some(pid) = self.work.worker
            && self.scheduler.lookup(pid).is_some_and(Process::is_alive)
        {
            return Ok(pid);
        }
        let pid = self.spawn(&SpawnOptions::new("kworker", entry))?;
        self.register_channel(READY_CHANNEL, ChannelMode::InverseMulticast, pid)?;
        self.register_channel(FINISHED_CHANNEL, ChannelMode::Multicast, pid)?;
        self.work.worker = Some(pid);
        info!("kernel worker {pid} started");
        Ok(pid)
    }

    /// Queues `job` on behalf of `spawner` and signals the worker.
    ///
    /// # Errors
    /// No worker, or `spawner` does not exist.
    pub fn schedule_work(
        &mut self,
        spawner: ProcessId,
        job: Job,
        auto_remove: bool,
    ) -> Result<WorkId, WorkError> {
        let worker = self.work.worker.ok_or(WorkError::NoWorker)?;
        let handle = self
            .scheduler
            .lookup(spawner)
            .ok_or(SchedError::UnknownProcess(spawner))?
            .downgrade();

        let id = WorkId(self.work.next_id);
        self.work.next_id += 1;
        self.work.pending.push_back(WorkItem {
            id,
            spawner: handle,
            job,
            auto_remove,
        });

        if spawner == worker {
            self.scheduler.wake_for(worker, WaitReason::Message);
        } else {
            self.send(spawner, READY_CHANNEL, &id.to_le_bytes(), None)?;
        }
        debug!("process {spawner} queued work {id}");
        Ok(id)
    }

    /// One round of the worker: runs every queued job, announces the ones
    /// somebody may wait for, forgets results of dead spawners and parks the
    /// worker until new work is signalled. Returns how many jobs ran.
    ///
    /// # Errors
    /// No worker.
    pub fn run_worker(&mut self) -> Result<usize, WorkError> {
        let worker = self.work.worker.ok_or(WorkError::NoWorker)?;
        if let Some(process) = self.scheduler.lookup(worker) {
            while process.pop_message_on(READY_CHANNEL).is_some() {}
        }

        let mut ran = 0;
        while let Some(item) = self.work.pending.pop_front() {
            let code = (item.job)();
            ran += 1;
            debug!("work {} finished with {code}", item.id);
            if item.auto_remove {
                continue;
            }
            self.work.finished.insert(
                item.id,
                Finished {
                    spawner: item.spawner,
                    code,
                },
            );
            if let Err(e) = self.send(worker, FINISHED_CHANNEL, &item.id.to_le_bytes(), None) {
                warn!("announcing work {}: {e}", item.id);
            }
        }

        let before = self.work.finished.len();
        self.work.finished.retain(|_, f| f.spawner.is_valid());
        let reaped = before - self.work.finished.len();
        if reaped > 0 {
            debug!("dropped {reaped} results of dead spawners");
        }

        let signalled = self
            .scheduler
            .lookup(worker)
            .is_some_and(|p| p.has_message_on(READY_CHANNEL));
        if self.work.pending.is_empty() && !signalled {
            self.scheduler.sleep(worker, WaitReason::Message)?;
        }
        Ok(ran)
    }

    /// The code of work `id` once it ran, or parks `pid` until the worker
    /// announces it.
    ///
    /// # Errors
    /// `id` was never queued, was collected already or removed itself.
    pub fn wait_work(&mut self, pid: ProcessId, id: WorkId) -> Result<Poll<u32>, WorkError> {
        // Announcements only wake the caller; `finished` holds the results.
        if let Some(process) = self.scheduler.lookup(pid) {
            while process
                .take_message(|m| m.channel() == FINISHED_CHANNEL)
                .is_some()
            {}
        }

        if let Some(finished) = self.work.finished.remove(&id) {
            if let Err(e) = self.listen(pid, FINISHED_CHANNEL, false) {
                debug!("process {pid} stops listening for work: {e}");
            }
            return Ok(Poll::Ready(finished.code));
        }
        if !self.work.pending.iter().any(|w| w.id == id) {
            return Err(WorkError::Unknown(id));
        }
        self.listen(pid, FINISHED_CHANNEL, true)?;
        self.scheduler.sleep(pid, WaitReason::Message)?;
        Ok(Poll::Pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_display_with_hash() {
        assert_eq!(alloc::format!("{}", WorkId(12)), "#12");
        assert_eq!(WorkId(0x0102).to_le_bytes()[..2], [2, 1]);
    }
}
