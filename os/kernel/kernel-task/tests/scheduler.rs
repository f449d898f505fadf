use kernel_info::boot::MemoryRegion;
use kernel_info::sched::FIRST_DYNAMIC_PID;
use kernel_sync::InterruptControl;
use kernel_task::hosted::{self, HostedKernel};
use kernel_task::{Fatal, ProcessId, ProcessState, SchedError, SpawnOptions, WaitReason};
use std::collections::BTreeSet;

const MIB: u64 = 1024 * 1024;
const ENTRY: u32 = 0x0804_8000;

fn boot() -> HostedKernel {
    hosted::boot(&[MemoryRegion::available(0, 16 * MIB)]).unwrap()
}

#[test]
fn higher_priority_runs_first_regardless_of_enqueue_order() {
    let mut kernel = boot();
    let low = kernel
        .spawn(&SpawnOptions::new("low", ENTRY).with_priority(2))
        .unwrap();
    let high = kernel
        .spawn(&SpawnOptions::new("high", ENTRY).with_priority(0))
        .unwrap();

    assert_eq!(kernel.schedule(), Ok(high));
    assert_eq!(kernel.scheduler().current(), Some(high));
    assert_eq!(kernel.schedule(), Ok(low));
}

#[test]
fn run_queues_are_fifo_within_a_level() {
    let mut kernel = boot();
    let pids: Vec<_> = (0..3)
        .map(|i| {
            kernel
                .spawn(&SpawnOptions::new("worker", ENTRY + i * 0x10).with_priority(4))
                .unwrap()
        })
        .collect();
    assert_eq!(kernel.scheduler().run_queue(4).collect::<Vec<_>>(), pids);
    for pid in pids {
        assert_eq!(kernel.schedule(), Ok(pid));
    }
}

#[test]
fn enqueue_is_idempotent() {
    let mut kernel = boot();
    let pid = kernel.spawn(&SpawnOptions::new("p", ENTRY)).unwrap();
    assert_eq!(kernel.scheduler_mut().add_to_runqueue(pid), Ok(false));
    assert_eq!(kernel.scheduler().run_queue(0).count(), 1);
}

#[test]
fn priorities_are_clamped() {
    let mut kernel = boot();
    let pid = kernel
        .spawn(&SpawnOptions::new("p", ENTRY).with_priority(200))
        .unwrap();
    let process = kernel.scheduler().lookup(pid).unwrap();
    assert_eq!(process.priority(), kernel_task::process::LOWEST_PRIORITY);
}

#[test]
fn pids_are_unique() {
    let mut kernel = boot();
    let pids: BTreeSet<_> = (0..16)
        .map(|_| kernel.spawn(&SpawnOptions::new("p", ENTRY)).unwrap())
        .collect();
    assert_eq!(pids.len(), 16);
    assert_eq!(pids.first(), Some(&ProcessId::new(FIRST_DYNAMIC_PID)));
}

#[test]
fn unscheduled_spawn_stays_out_of_the_queues() {
    let mut kernel = boot();
    let pid = kernel
        .spawn(&SpawnOptions::new("p", ENTRY).with_schedule(false))
        .unwrap();
    assert!(!kernel.scheduler().is_queued(pid));
    assert!(!kernel.wake(pid), "a runnable process is not woken");
    assert_eq!(kernel.scheduler_mut().add_to_runqueue(pid), Ok(true));
    assert_eq!(kernel.schedule(), Ok(pid));
}

#[test]
fn sleep_and_wake() {
    let mut kernel = boot();
    let a = kernel.spawn(&SpawnOptions::new("a", ENTRY)).unwrap();
    let b = kernel.spawn(&SpawnOptions::new("b", ENTRY)).unwrap();

    kernel.sleep(a).unwrap();
    let process = kernel.scheduler().lookup(a).unwrap();
    assert_eq!(process.state(), ProcessState::Waiting);
    assert_eq!(process.wait_reason(), Some(WaitReason::Sleep));
    assert!(!kernel.scheduler().is_queued(a));

    assert_eq!(kernel.schedule(), Ok(b));
    kernel.platform().enable();
    assert!(kernel.wake(a));
    assert!(kernel.platform().enabled(), "waking restores the interrupt flag");
    assert!(!kernel.wake(a));
    assert_eq!(kernel.schedule(), Ok(a));

    assert_eq!(
        kernel.sleep(ProcessId::new(99)),
        Err(SchedError::UnknownProcess(ProcessId::new(99)))
    );
}

#[test]
fn idle_cpu_delivers_interrupts_until_work_appears() {
    let mut kernel = boot();
    let waiter = kernel.spawn(&SpawnOptions::new("waiter", ENTRY)).unwrap();
    assert!(kernel.block_for_irq(waiter, 4).unwrap().is_pending());

    kernel.platform_mut().raise(0);
    kernel.platform_mut().raise(0);
    kernel.platform_mut().raise(4);
    assert_eq!(kernel.schedule(), Ok(waiter));
    assert_eq!(kernel.platform().halts(), 3);
    assert_eq!(kernel.ticks(), 2);
    assert!(kernel.is_multitasking());
    assert!(kernel.block_for_irq(waiter, 4).unwrap().is_ready());
}

#[test]
fn pending_interrupts_are_tracked_per_line() {
    let mut kernel = boot();
    let waiter = kernel.spawn(&SpawnOptions::new("waiter", ENTRY)).unwrap();
    assert!(kernel.block_for_irq(waiter, 4).unwrap().is_pending());
    assert_eq!(kernel.irq_fired(4), Ok(1));
    assert_eq!(kernel.scheduler().lookup(waiter).unwrap().irq_pending(), 1 << 4);

    assert!(kernel.block_for_irq(waiter, 5).unwrap().is_pending(), "IRQ 4 is not IRQ 5");
    assert_eq!(kernel.irq_fired(5), Ok(1));
    assert!(kernel.block_for_irq(waiter, 5).unwrap().is_ready());
    assert!(kernel.block_for_irq(waiter, 4).unwrap().is_ready());
    assert_eq!(kernel.scheduler().lookup(waiter).unwrap().irq_pending(), 0);
}

#[test]
fn idling_without_interrupt_sources_is_fatal() {
    let mut kernel = boot();
    assert_eq!(kernel.schedule(), Err(Fatal::Idle));
    assert!(!kernel.is_multitasking());
    assert_eq!(kernel.scheduler().current(), None);
}

#[test]
fn irq_lines_are_checked() {
    let mut kernel = boot();
    let pid = kernel.spawn(&SpawnOptions::new("p", ENTRY)).unwrap();
    assert_eq!(kernel.irq_fired(16), Err(SchedError::InvalidIrq(16)));
    assert_eq!(kernel.block_for_irq(pid, 200), Err(SchedError::InvalidIrq(200)));
    assert_eq!(kernel.irq_fired(3), Ok(0));
}
