use kernel_info::boot::MemoryRegion;
use kernel_info::cpu::EFLAGS_IF;
use kernel_info::sched::RUN_TIMESLICE;
use kernel_sync::InterruptControl;
use kernel_task::hosted::{self, HostedKernel};
use kernel_task::{Fatal, ProcessId, ProcessState, RegisterDump, SpawnOptions, Trap};
use stdlib::syscall_abi::{SYSCALL_ERROR, Sysno};

const MIB: u64 = 1024 * 1024;
const INIT_ENTRY: u32 = 0x0804_8000;
const OTHER_ENTRY: u32 = 0x0805_0000;

fn boot_into_init(options: SpawnOptions<'_>) -> (HostedKernel, RegisterDump) {
    let mut kernel = hosted::boot(&[MemoryRegion::available(0, 16 * MIB)]).unwrap();
    kernel.spawn_init(&options).unwrap();
    kernel.start();
    let mut dump = RegisterDump::default();
    kernel.enter(&mut dump, Trap::Timer).unwrap();
    (kernel, dump)
}

/// Executes `int 0x5C` at the current instruction pointer.
fn syscall(
    kernel: &mut HostedKernel,
    dump: &mut RegisterDump,
    sysno: Sysno,
    args: [u32; 5],
) -> Result<(), Fatal> {
    let regs = dump.registers_mut();
    regs.eax = sysno as u32;
    [regs.ebx, regs.ecx, regs.edx, regs.esi, regs.edi] = args;
    regs.eip += 2;
    kernel.enter(dump, Trap::SoftwareInterrupt)
}

#[test]
fn bootstrap_resumes_init_with_its_fresh_stack() {
    let (kernel, dump) = boot_into_init(SpawnOptions::new("init", INIT_ENTRY));
    let regs = dump.registers();
    assert_eq!(regs.eip, INIT_ENTRY);
    assert_eq!(regs.esp, 0xBFFF_FFF0);
    assert_eq!(regs.ebp, 0xBFFF_FFF0);
    assert_ne!(regs.eflags & EFLAGS_IF, 0);
    assert!(!regs.is_user_mode());
    let init = kernel.scheduler().lookup(ProcessId::INIT).unwrap();
    assert_eq!(regs.cr3, init.address_space().unwrap().directory().as_u32());
}

#[test]
fn user_mode_processes_get_a_kernel_stack_in_the_tss() {
    let (kernel, dump) =
        boot_into_init(SpawnOptions::new("init", INIT_ENTRY).with_user_mode(true));
    assert!(dump.registers().is_user_mode());
    let init = kernel.scheduler().lookup(ProcessId::INIT).unwrap();
    let top = init.kernel_regs().kernel_stack;
    assert_ne!(top, 0);
    assert_eq!(kernel.platform().kernel_stack(), top);
    assert_eq!(dump.registers().kernel_stack, 0, "the dump keeps its own field");
}

#[test]
fn system_calls_return_in_eax_without_switching() {
    let (mut kernel, mut dump) = boot_into_init(SpawnOptions::new("init", INIT_ENTRY));
    kernel.spawn(&SpawnOptions::new("other", OTHER_ENTRY)).unwrap();

    let unmasks = kernel.platform().unmasks();
    syscall(&mut kernel, &mut dump, Sysno::GetPid, [0; 5]).unwrap();
    assert_eq!(dump.registers().eax, ProcessId::INIT.as_u32());
    assert_eq!(kernel.platform().unmasks(), unmasks, "dispatch runs masked");
    assert!(!kernel.platform().enabled());
    assert_eq!(dump.registers().eip, INIT_ENTRY + 2);
    assert_eq!(kernel.scheduler().current(), Some(ProcessId::INIT));

    syscall(&mut kernel, &mut dump, Sysno::Sleep, [0; 5]).unwrap();
    assert_eq!(dump.registers().eax, 0, "sleeping zero milliseconds completes");

    let regs = dump.registers_mut();
    regs.eax = 99;
    regs.eip += 2;
    kernel.enter(&mut dump, Trap::SoftwareInterrupt).unwrap();
    assert_eq!(dump.registers().eax, SYSCALL_ERROR);
}

#[test]
fn yield_switches_and_saves_the_context() {
    let (mut kernel, mut dump) = boot_into_init(SpawnOptions::new("init", INIT_ENTRY));
    let other = kernel.spawn(&SpawnOptions::new("other", OTHER_ENTRY)).unwrap();

    syscall(&mut kernel, &mut dump, Sysno::Yield, [0x1234, 0, 0, 0, 0]).unwrap();
    assert_eq!(kernel.scheduler().current(), Some(other));
    assert_eq!(dump.registers().eip, OTHER_ENTRY);

    syscall(&mut kernel, &mut dump, Sysno::Yield, [0; 5]).unwrap();
    assert_eq!(kernel.scheduler().current(), Some(ProcessId::INIT));
    assert_eq!(dump.registers().eip, INIT_ENTRY + 2);
    assert_eq!(dump.registers().ebx, 0x1234);
}

#[test]
fn an_exhausted_timeslice_preempts() {
    let (mut kernel, mut dump) = boot_into_init(SpawnOptions::new("init", INIT_ENTRY));
    let other = kernel.spawn(&SpawnOptions::new("other", OTHER_ENTRY)).unwrap();

    for _ in 1..RUN_TIMESLICE {
        kernel.enter(&mut dump, Trap::Timer).unwrap();
        assert_eq!(dump.registers().eip, INIT_ENTRY);
    }
    kernel.enter(&mut dump, Trap::Timer).unwrap();
    assert_eq!(kernel.scheduler().current(), Some(other));
    assert_eq!(dump.registers().eip, OTHER_ENTRY);
    assert_eq!(kernel.timeslice(), RUN_TIMESLICE);

    let init = kernel.scheduler().lookup(ProcessId::INIT).unwrap();
    assert_eq!(init.times().system, RUN_TIMESLICE);
    assert_eq!(init.times().user, 0);
    assert_eq!(kernel.ticks(), u64::from(RUN_TIMESLICE));
}

#[test]
fn blocked_calls_rewind_and_retry() {
    let (mut kernel, mut dump) = boot_into_init(SpawnOptions::new("init", INIT_ENTRY));
    for _ in 0..5 {
        kernel.platform_mut().raise(0);
    }

    syscall(&mut kernel, &mut dump, Sysno::Sleep, [5, 0, 0, 0, 0]).unwrap();
    assert_eq!(kernel.platform().halts(), 5);
    assert_eq!(kernel.uptime_ms(), 5);
    assert_eq!(kernel.scheduler().current(), Some(ProcessId::INIT));
    assert_eq!(dump.registers().eip, INIT_ENTRY, "back on the int instruction");
    assert_eq!(dump.registers().eax, Sysno::Sleep as u32);

    syscall(&mut kernel, &mut dump, Sysno::Sleep, [5, 0, 0, 0, 0]).unwrap();
    assert_eq!(dump.registers().eax, 0);
    assert_eq!(dump.registers().eip, INIT_ENTRY + 2);
    let init = kernel.scheduler().lookup(ProcessId::INIT).unwrap();
    assert_eq!(init.sleep_deadline(), None);
    assert!(!init.flags().resume_user());
}

#[test]
fn blocking_with_nothing_left_to_wake_is_fatal() {
    let (mut kernel, mut dump) = boot_into_init(SpawnOptions::new("init", INIT_ENTRY));
    assert_eq!(
        syscall(&mut kernel, &mut dump, Sysno::Sleep, [100, 0, 0, 0, 0]),
        Err(Fatal::Idle)
    );
}

#[test]
fn exiting_switches_away_and_frees_memory_later() {
    let (mut kernel, mut dump) = boot_into_init(SpawnOptions::new("init", INIT_ENTRY));
    let child = kernel.spawn(&SpawnOptions::new("child", OTHER_ENTRY)).unwrap();
    syscall(&mut kernel, &mut dump, Sysno::Yield, [0; 5]).unwrap();
    assert_eq!(kernel.scheduler().current(), Some(child));
    let free_while_running = kernel.memory().frames().free_frames();

    syscall(&mut kernel, &mut dump, Sysno::Exit, [3, 0, 0, 0, 0]).unwrap();
    assert_eq!(kernel.scheduler().current(), Some(ProcessId::INIT));
    assert!(kernel.scheduler().lookup(child).is_none(), "spawned children are freed on exit");
    assert_eq!(
        kernel.memory().frames().free_frames(),
        free_while_running,
        "nothing freed while the dead process was current"
    );

    kernel.enter(&mut dump, Trap::Timer).unwrap();
    assert!(kernel.memory().frames().free_frames() > free_while_running);
}

#[test]
fn fork_returns_twice() {
    let (mut kernel, mut dump) =
        boot_into_init(SpawnOptions::new("init", INIT_ENTRY).with_user_mode(true));
    syscall(&mut kernel, &mut dump, Sysno::Fork, [0, 0, 0xFEED, 0, 0]).unwrap();
    let child = kernel.scheduler().current().unwrap();
    assert_ne!(child, ProcessId::INIT);
    assert_eq!(dump.registers().eax, 0, "the child sees 0");
    let fork_site = dump.registers().eip;
    let child_stack = kernel.platform().kernel_stack();

    let parent = kernel.scheduler().lookup(ProcessId::INIT).unwrap();
    assert_eq!(parent.state(), ProcessState::Forking);
    assert_ne!(child_stack, parent.kernel_regs().kernel_stack);

    syscall(&mut kernel, &mut dump, Sysno::Yield, [0; 5]).unwrap();
    assert_eq!(kernel.scheduler().current(), Some(ProcessId::INIT));
    assert_eq!(dump.registers().eax, child.as_u32(), "the parent sees the child");
    assert_eq!(dump.registers().eip, fork_site);
    assert_eq!(dump.registers().edx, 0xFEED);
    let parent = kernel.scheduler().lookup(ProcessId::INIT).unwrap();
    assert_eq!(parent.state(), ProcessState::Runnable);
}
