use core::task::Poll;
use kernel_info::boot::MemoryRegion;
use kernel_info::memory::{PAGE_SIZE, USER_HEAP_BASE};
use kernel_memory_addresses::VirtualAddress;
use kernel_task::hosted::{self, HostedKernel};
use kernel_task::{
    EXIT_KILLED, Fatal, ProcessId, ProcessState, SchedError, SpawnOptions, StaleReference,
    WaitReason,
};
use kernel_vmem::fault::{FaultResolution, PageFaultError};
use stdlib::syscall_abi::Tms;

const MIB: u64 = 1024 * 1024;
const ENTRY: u32 = 0x0804_8000;
const INIT: ProcessId = ProcessId::INIT;

fn boot_with_init() -> HostedKernel {
    let mut kernel = hosted::boot(&[MemoryRegion::available(0, 16 * MIB)]).unwrap();
    kernel
        .spawn_init(&SpawnOptions::new("init", ENTRY))
        .unwrap();
    kernel
}

fn spawn(kernel: &mut HostedKernel, name: &str) -> ProcessId {
    kernel.spawn(&SpawnOptions::new(name, ENTRY)).unwrap()
}

#[test]
fn waiting_for_a_child_collects_its_exit_code() {
    let mut kernel = boot_with_init();
    let child = spawn(&mut kernel, "child");

    assert_eq!(kernel.wait_child(INIT, child), Ok(Poll::Pending));
    let init = kernel.scheduler().lookup(INIT).unwrap();
    assert_eq!(init.state(), ProcessState::Waiting);
    assert_eq!(init.wait_reason(), Some(WaitReason::Child(Some(child))));
    let waited = kernel.scheduler().lookup(child).unwrap();
    assert!(!waited.flags().delete_on_exit(), "kept for the waiting parent");

    kernel.exit(child, 7).unwrap();
    assert_eq!(
        kernel.scheduler().lookup(INIT).unwrap().state(),
        ProcessState::Runnable
    );
    let zombie = kernel.scheduler().lookup(child).unwrap();
    assert_eq!(zombie.state(), ProcessState::Dead);
    assert_eq!(zombie.exit_code(), Some(7));
    assert!(zombie.address_space().is_none());

    assert_eq!(kernel.wait_child(INIT, child), Ok(Poll::Ready(7)));
    assert!(kernel.scheduler().lookup(child).is_none());
    assert!(kernel.scheduler().lookup(INIT).unwrap().children().is_empty());
}

#[test]
fn waiting_for_a_stranger_fails() {
    let mut kernel = boot_with_init();
    let stranger = ProcessId::new(50);
    assert_eq!(
        kernel.wait_child(INIT, stranger),
        Err(SchedError::NotAChild {
            parent: INIT,
            child: stranger
        })
    );
    assert_eq!(kernel.wait_any(INIT), Err(SchedError::NoChildren(INIT)));
}

#[test]
fn wait_any_returns_the_first_child_to_die() {
    let mut kernel = boot_with_init();
    let a = spawn(&mut kernel, "a");
    let b = spawn(&mut kernel, "b");

    assert_eq!(kernel.wait_any(INIT), Ok(Poll::Pending));
    kernel.exit(b, 2).unwrap();
    assert_eq!(
        kernel.scheduler().lookup(INIT).unwrap().state(),
        ProcessState::Runnable
    );
    assert_eq!(kernel.wait_any(INIT), Ok(Poll::Ready((b, 2))));
    assert_eq!(kernel.scheduler().lookup(INIT).unwrap().children(), &[a]);
}

#[test]
fn orphans_go_to_the_kernel_and_zombies_are_reaped() {
    let mut kernel = boot_with_init();
    let parent = spawn(&mut kernel, "parent");

    kernel.scheduler_mut().set_current(Some(parent));
    let live = spawn(&mut kernel, "live");
    let zombie = spawn(&mut kernel, "zombie");
    assert_eq!(kernel.wait_child(parent, zombie), Ok(Poll::Pending));
    kernel.exit(zombie, 0).unwrap();
    assert!(kernel.scheduler().lookup(zombie).is_some());

    let free_before = kernel.memory().frames().free_frames();
    kernel.exit(parent, 1).unwrap();
    assert!(kernel.scheduler().lookup(parent).is_none());
    assert!(kernel.scheduler().lookup(zombie).is_none());
    let orphan = kernel.scheduler().lookup(live).unwrap();
    assert_eq!(orphan.parent(), ProcessId::KERNEL);
    assert!(orphan.flags().delete_on_exit());
    assert!(!kernel.scheduler().lookup(INIT).unwrap().children().contains(&parent));
    assert_eq!(
        kernel.memory().frames().free_frames(),
        free_before,
        "the exiting process is still current"
    );

    kernel.scheduler_mut().set_current(Some(INIT));
    kernel.reclaim();
    assert!(kernel.memory().frames().free_frames() > free_before);
}

#[test]
fn exit_is_idempotent_and_invalidates_handles() {
    let mut kernel = boot_with_init();
    let child = kernel
        .spawn(&SpawnOptions::new("child", ENTRY).with_delete_on_exit(false))
        .unwrap();
    let handle = kernel.scheduler().lookup(child).unwrap().downgrade();
    assert!(kernel.scheduler().get(&handle).is_ok());

    kernel.exit(child, 4).unwrap();
    kernel.exit(child, 5).unwrap();
    assert_eq!(
        kernel.scheduler().lookup(child).unwrap().exit_code(),
        Some(4)
    );
    assert!(!handle.is_valid());
    assert_eq!(
        kernel.scheduler().get(&handle).err(),
        Some(StaleReference(child))
    );
}

#[test]
fn sbrk_moves_the_break_and_unmaps_returned_pages() {
    let mut kernel = boot_with_init();
    assert_eq!(kernel.sbrk(INIT, 0), Ok(USER_HEAP_BASE));
    assert_eq!(kernel.sbrk(INIT, 0x2000), Ok(USER_HEAP_BASE));
    let heap_page = USER_HEAP_BASE + PAGE_SIZE;
    kernel.copy_to_user(INIT, heap_page + 0x800, b"x").unwrap();

    let mapped = |kernel: &HostedKernel| {
        kernel
            .scheduler()
            .lookup(INIT)
            .unwrap()
            .address_space()
            .unwrap()
            .mapped_pages()
    };
    let with_heap = mapped(&kernel);

    assert_eq!(kernel.sbrk(INIT, -0x2000), Ok(USER_HEAP_BASE + 0x2000));
    assert_eq!(kernel.scheduler().lookup(INIT).unwrap().break_val(), USER_HEAP_BASE);
    assert_eq!(mapped(&kernel), with_heap - 1);

    assert_eq!(
        kernel.sbrk(INIT, -1),
        Err(SchedError::InvalidBreak {
            pid: INIT,
            requested: USER_HEAP_BASE - 1
        })
    );
}

#[test]
fn growing_the_heap_into_the_stack_kills_the_process() {
    let mut kernel = boot_with_init();
    let greedy = kernel
        .spawn(&SpawnOptions::new("greedy", ENTRY).with_delete_on_exit(false))
        .unwrap();
    assert_eq!(kernel.sbrk(greedy, 0x7000_0000), Ok(USER_HEAP_BASE));
    assert_eq!(
        kernel.sbrk(greedy, 0x4000_0000),
        Err(SchedError::HeapCollision(greedy))
    );
    let process = kernel.scheduler().lookup(greedy).unwrap();
    assert_eq!(process.state(), ProcessState::Dead);
    assert_eq!(process.exit_code(), Some(EXIT_KILLED));
}

#[test]
fn times_split_user_system_and_children() {
    let mut kernel = boot_with_init();
    for from_user in [true, true, true, false] {
        kernel.timer_tick(from_user);
    }
    let child = spawn(&mut kernel, "child");
    kernel.scheduler_mut().set_current(Some(child));
    kernel.timer_tick(true);
    kernel.timer_tick(true);

    let (tms, ticks) = kernel.times(INIT).unwrap();
    assert_eq!(
        tms,
        Tms {
            tms_utime: 3,
            tms_stime: 1,
            tms_cutime: 2,
            tms_cstime: 0,
        }
    );
    assert_eq!(ticks, 6);

    kernel.scheduler_mut().set_current(Some(INIT));
    assert_eq!(kernel.wait_child(INIT, child), Ok(Poll::Pending));
    kernel.exit(child, 0).unwrap();
    assert_eq!(kernel.wait_child(INIT, child), Ok(Poll::Ready(0)));
    assert_eq!(kernel.times(INIT).unwrap().0.tms_cutime, 2, "collected children still count");
}

#[test]
fn sleep_ms_blocks_until_the_deadline() {
    let mut kernel = boot_with_init();
    assert_eq!(kernel.sleep_ms(INIT, 0), Ok(Poll::Ready(())));
    assert_eq!(kernel.sleep_ms(INIT, 3), Ok(Poll::Pending));
    let deadline = kernel.uptime_ms() + 3;
    assert_eq!(
        kernel.scheduler().lookup(INIT).unwrap().wait_reason(),
        Some(WaitReason::Timer(deadline))
    );

    kernel.timer_tick(false);
    kernel.timer_tick(false);
    assert_eq!(
        kernel.scheduler().lookup(INIT).unwrap().state(),
        ProcessState::Waiting
    );
    kernel.timer_tick(false);
    assert_eq!(
        kernel.scheduler().lookup(INIT).unwrap().state(),
        ProcessState::Runnable
    );
    assert_eq!(kernel.sleep_ms(INIT, 3), Ok(Poll::Ready(())));
    assert_eq!(kernel.scheduler().lookup(INIT).unwrap().sleep_deadline(), None);
}

#[test]
fn page_faults_map_user_pages_on_demand() {
    let mut kernel = boot_with_init();
    let address = VirtualAddress::new(USER_HEAP_BASE + 0x5000);
    let not_present = PageFaultError::new().with_user(true).with_write(true);

    let resolution = kernel.page_fault(address, not_present, ENTRY).unwrap();
    assert!(matches!(resolution, FaultResolution::UserMapped(_)));
    kernel.copy_to_user(INIT, address.as_u32(), b"ok").unwrap();

    let protection = PageFaultError::new().with_present(true);
    assert_eq!(
        kernel.page_fault(address, protection.with_user(true), ENTRY),
        Ok(FaultResolution::ProtectionViolation)
    );
    assert_eq!(
        kernel.page_fault(address, protection, ENTRY),
        Err(Fatal::KernelProtection { address, eip: ENTRY })
    );

    let null = VirtualAddress::new(0x10);
    assert_eq!(
        kernel.page_fault(null, not_present, ENTRY),
        Err(Fatal::NullDereference {
            address: null,
            eip: ENTRY
        })
    );
}
