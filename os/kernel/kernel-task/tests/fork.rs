use kernel_info::boot::MemoryRegion;
use kernel_info::memory::USER_HEAP_BASE;
use kernel_task::hosted::{self, HostedKernel};
use kernel_task::{ProcessId, ProcessState, SpawnOptions};

const MIB: u64 = 1024 * 1024;
const ENTRY: u32 = 0x0804_8000;

fn boot_with_init() -> HostedKernel {
    let mut kernel = hosted::boot(&[MemoryRegion::available(0, 16 * MIB)]).unwrap();
    kernel
        .spawn_init(&SpawnOptions::new("init", ENTRY).with_priority(0))
        .unwrap();
    kernel
}

#[test]
fn writes_after_fork_stay_private() {
    let mut kernel = boot_with_init();
    kernel
        .copy_to_user(ProcessId::INIT, USER_HEAP_BASE, b"parent")
        .unwrap();

    let child = kernel.fork().unwrap();
    assert_eq!(
        kernel.copy_from_user(child, USER_HEAP_BASE, 6).unwrap(),
        b"parent"
    );

    kernel.copy_to_user(child, USER_HEAP_BASE, b"child!").unwrap();
    assert_eq!(
        kernel.copy_from_user(ProcessId::INIT, USER_HEAP_BASE, 6).unwrap(),
        b"parent"
    );

    kernel
        .copy_to_user(ProcessId::INIT, USER_HEAP_BASE, b"PARENT")
        .unwrap();
    assert_eq!(
        kernel.copy_from_user(child, USER_HEAP_BASE, 6).unwrap(),
        b"child!"
    );
}

#[test]
fn fork_copies_the_stack_contents() {
    let mut kernel = boot_with_init();
    let frame = kernel
        .copy_from_user(ProcessId::INIT, 0xBFFF_FFF0, 12)
        .unwrap();
    assert_eq!(frame[..4], hosted::HOSTED_EXIT_TRAMPOLINE.to_le_bytes());

    let child = kernel.fork().unwrap();
    assert_eq!(kernel.copy_from_user(child, 0xBFFF_FFF0, 12).unwrap(), frame);
}

#[test]
fn both_sides_are_schedulable_with_identical_registers() {
    let mut kernel = boot_with_init();
    let child = kernel.fork().unwrap();
    assert_ne!(child, ProcessId::INIT);
    assert_eq!(kernel.scheduler().current(), Some(child));

    let parent = kernel.scheduler().lookup(ProcessId::INIT).unwrap();
    let forked = kernel.scheduler().lookup(child).unwrap();
    assert_eq!(parent.state(), ProcessState::Forking);
    assert_eq!(forked.state(), ProcessState::Runnable);
    assert_eq!(forked.parent(), ProcessId::INIT);
    assert_eq!(parent.children(), &[child]);
    assert_eq!(forked.name(), "init");
    assert_eq!(forked.break_val(), parent.break_val());
    assert!(!forked.flags().delete_on_exit(), "forked children wait to be collected");

    let parent_regs = *parent.user_regs();
    let child_regs = *forked.user_regs();
    assert_eq!(parent_regs.eax, child.as_u32());
    assert_ne!(parent_regs.cr3, child_regs.cr3);
    let mut expected = parent_regs;
    expected.eax = child_regs.eax;
    expected.cr3 = child_regs.cr3;
    assert_eq!(child_regs, expected);
    assert_eq!(
        forked.kernel_regs().cr3,
        forked.address_space().unwrap().directory().as_u32()
    );

    assert_eq!(kernel.schedule(), Ok(ProcessId::INIT));
    assert_eq!(kernel.scheduler_mut().add_to_runqueue(child), Ok(true));
    assert_eq!(kernel.schedule(), Ok(child));
}

#[test]
fn user_mode_children_get_their_own_kernel_stack() {
    let mut kernel = hosted::boot(&[MemoryRegion::available(0, 16 * MIB)]).unwrap();
    kernel
        .spawn_init(&SpawnOptions::new("init", ENTRY).with_user_mode(true))
        .unwrap();
    let child = kernel.fork().unwrap();

    let parent = kernel.scheduler().lookup(ProcessId::INIT).unwrap();
    let forked = kernel.scheduler().lookup(child).unwrap();
    assert!(forked.flags().user_mode());
    assert!(forked.kernel_stack().is_some());
    assert_ne!(forked.kernel_stack(), parent.kernel_stack());
    assert_eq!(forked.user_regs().kernel_stack, forked.kernel_regs().kernel_stack);
    assert_ne!(forked.user_regs().kernel_stack, parent.user_regs().kernel_stack);
}

#[test]
fn fork_without_a_current_process_is_fatal() {
    let mut kernel = hosted::boot(&[MemoryRegion::available(0, 16 * MIB)]).unwrap();
    assert_eq!(kernel.fork(), Err(kernel_task::Fatal::NoCurrentProcess));
}
