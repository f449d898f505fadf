//! # Scheduler Tuning

/// Number of priority levels; 0 is the highest.
pub const PRIORITY_LEVELS: usize = 16;

/// Timer ticks a process may run before it is preempted.
pub const RUN_TIMESLICE: u32 = 50;

/// Milliseconds added to the system clock per timer tick.
pub const MS_PER_TICK: u64 = 1;

/// Reserved for the kernel, used only as a parent.
pub const KERNEL_PID: u32 = 0;

/// The first process, started through the bootstrap path.
pub const INIT_PID: u32 = 1;

/// First PID handed out by the allocator.
pub const FIRST_DYNAMIC_PID: u32 = 2;

/// Where PID allocation restarts once the 32-bit space wrapped.
pub const PID_OVERFLOW_RESTART: u32 = 777;

/// A resumed context must have its instruction pointer at or above this.
pub const MIN_ENTRY_POINT: u32 = 0x1000;

const _: () = {
    assert!(PRIORITY_LEVELS > 0 && PRIORITY_LEVELS <= 256);
    assert!(RUN_TIMESLICE > 0);
    assert!(FIRST_DYNAMIC_PID > INIT_PID && INIT_PID > KERNEL_PID);
    assert!(PID_OVERFLOW_RESTART > FIRST_DYNAMIC_PID);
};
