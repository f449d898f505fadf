use core::task::Poll;
use kernel_info::boot::MemoryRegion;
use kernel_task::hosted::{self, HostedKernel};
use kernel_task::work::{FINISHED_CHANNEL, READY_CHANNEL};
use kernel_task::{ChannelMode, ProcessId, ProcessState, SpawnOptions, WorkError};
use std::sync::{Arc, Mutex};

const MIB: u64 = 1024 * 1024;
const ENTRY: u32 = 0x0804_8000;
const WORKER_ENTRY: u32 = 0xC010_0000;
const INIT: ProcessId = ProcessId::INIT;

fn boot_with_worker() -> (HostedKernel, ProcessId) {
    let mut kernel = hosted::boot(&[MemoryRegion::available(0, 16 * MIB)]).unwrap();
    kernel
        .spawn_init(&SpawnOptions::new("init", ENTRY))
        .unwrap();
    let worker = kernel.start_worker(WORKER_ENTRY).unwrap();
    (kernel, worker)
}

fn state(kernel: &HostedKernel, pid: ProcessId) -> ProcessState {
    kernel.scheduler().lookup(pid).unwrap().state()
}

#[test]
fn the_worker_owns_its_channels() {
    let (mut kernel, worker) = boot_with_worker();
    assert_eq!(kernel.start_worker(WORKER_ENTRY), Ok(worker), "already running");
    assert_eq!(kernel.work().worker(), Some(worker));

    let ready = kernel.channels().get(READY_CHANNEL).unwrap();
    assert_eq!(ready.mode(), ChannelMode::InverseMulticast);
    assert_eq!(ready.owner(), worker);
    let finished = kernel.channels().get(FINISHED_CHANNEL).unwrap();
    assert_eq!(finished.mode(), ChannelMode::Multicast);
    assert_eq!(finished.owner(), worker);
    assert_eq!(kernel.scheduler().lookup(worker).unwrap().name(), "kworker");
}

#[test]
fn nothing_is_queued_without_a_worker() {
    let mut kernel = hosted::boot(&[MemoryRegion::available(0, 16 * MIB)]).unwrap();
    kernel
        .spawn_init(&SpawnOptions::new("init", ENTRY))
        .unwrap();
    assert!(matches!(
        kernel.schedule_work(INIT, Box::new(|| 0), false),
        Err(WorkError::NoWorker)
    ));
    assert!(matches!(kernel.run_worker(), Err(WorkError::NoWorker)));
}

#[test]
fn spawners_wait_for_their_results() {
    let (mut kernel, worker) = boot_with_worker();
    assert_eq!(kernel.run_worker().unwrap(), 0);
    assert_eq!(state(&kernel, worker), ProcessState::Waiting);

    let id = kernel.schedule_work(INIT, Box::new(|| 42), false).unwrap();
    assert_eq!(state(&kernel, worker), ProcessState::Runnable);
    assert_eq!(kernel.work().pending(), 1);

    assert_eq!(kernel.wait_work(INIT, id).unwrap(), Poll::Pending);
    assert_eq!(state(&kernel, INIT), ProcessState::Waiting);
    assert!(kernel.channels().get(FINISHED_CHANNEL).unwrap().is_listening(INIT));

    assert_eq!(kernel.run_worker().unwrap(), 1);
    assert!(kernel.work().is_finished(id));
    assert_eq!(state(&kernel, INIT), ProcessState::Runnable);
    assert_eq!(state(&kernel, worker), ProcessState::Waiting);

    assert_eq!(kernel.wait_work(INIT, id).unwrap(), Poll::Ready(42));
    assert_eq!(kernel.scheduler().lookup(INIT).unwrap().pending_messages(), 0);
    assert!(!kernel.channels().get(FINISHED_CHANNEL).unwrap().is_listening(INIT));
    assert_eq!(kernel.work().uncollected(), 0);
    assert!(matches!(
        kernel.wait_work(INIT, id),
        Err(WorkError::Unknown(unknown)) if unknown == id
    ));
}

#[test]
fn collecting_clears_announcements_of_other_jobs() {
    let (mut kernel, _) = boot_with_worker();
    let other = kernel.spawn(&SpawnOptions::new("other", ENTRY)).unwrap();
    let mine = kernel.schedule_work(INIT, Box::new(|| 1), false).unwrap();
    let theirs = kernel.schedule_work(other, Box::new(|| 2), false).unwrap();

    assert_eq!(kernel.wait_work(INIT, mine).unwrap(), Poll::Pending);
    assert_eq!(kernel.run_worker().unwrap(), 2);
    assert_eq!(kernel.scheduler().lookup(INIT).unwrap().pending_messages(), 2);

    assert_eq!(kernel.wait_work(INIT, mine).unwrap(), Poll::Ready(1));
    assert_eq!(kernel.scheduler().lookup(INIT).unwrap().pending_messages(), 0);
    assert_eq!(kernel.wait_for_message(INIT), Ok(Poll::Pending));

    assert_eq!(kernel.wait_work(other, theirs).unwrap(), Poll::Ready(2));
    assert_eq!(kernel.scheduler().lookup(other).unwrap().pending_messages(), 0);
    assert_eq!(kernel.work().uncollected(), 0);
}

#[test]
fn jobs_run_in_queue_order() {
    let (mut kernel, _) = boot_with_worker();
    let log = Arc::new(Mutex::new(Vec::new()));
    let ids: Vec<_> = (0..4_u32)
        .map(|n| {
            let log = Arc::clone(&log);
            let job = Box::new(move || {
                log.lock().unwrap().push(n);
                n
            });
            kernel.schedule_work(INIT, job, true).unwrap()
        })
        .collect();
    assert!(ids.windows(2).all(|w| w[0] < w[1]));

    assert_eq!(kernel.run_worker().unwrap(), 4);
    assert_eq!(*log.lock().unwrap(), [0, 1, 2, 3]);
    assert_eq!(kernel.work().uncollected(), 0, "auto-removed jobs leave nothing");
    assert!(matches!(
        kernel.wait_work(INIT, ids[0]),
        Err(WorkError::Unknown(_))
    ));
}

#[test]
fn work_queued_by_the_worker_wakes_it_directly() {
    let (mut kernel, worker) = boot_with_worker();
    kernel.run_worker().unwrap();
    kernel.schedule_work(worker, Box::new(|| 1), true).unwrap();
    assert_eq!(state(&kernel, worker), ProcessState::Runnable);
    assert_eq!(kernel.scheduler().lookup(worker).unwrap().pending_messages(), 0);
    assert_eq!(kernel.run_worker().unwrap(), 1);
}

#[test]
fn results_of_dead_spawners_are_dropped() {
    let (mut kernel, _) = boot_with_worker();
    let spawner = kernel.spawn(&SpawnOptions::new("spawner", ENTRY)).unwrap();
    let id = kernel.schedule_work(spawner, Box::new(|| 9), false).unwrap();
    kernel.exit(spawner, 0).unwrap();

    assert_eq!(kernel.run_worker().unwrap(), 1);
    assert!(!kernel.work().is_finished(id));
    assert_eq!(kernel.work().uncollected(), 0);
}

#[test]
fn a_dead_worker_is_replaced() {
    let (mut kernel, worker) = boot_with_worker();
    kernel.exit(worker, 0).unwrap();
    assert!(kernel.channels().get(READY_CHANNEL).is_none());

    let replacement = kernel.start_worker(WORKER_ENTRY).unwrap();
    assert_ne!(replacement, worker);
    assert_eq!(
        kernel.channels().get(READY_CHANNEL).unwrap().owner(),
        replacement
    );
}
