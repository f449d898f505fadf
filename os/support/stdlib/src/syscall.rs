//! User-side stubs. Each returns `None` where the kernel reported
//! [`SYSCALL_ERROR`].

use crate::syscall_abi::{ChannelMode, MessageInfo, SYSCALL_ERROR, Sysno, Tms, WAIT_ANY};

/// Raw system call with up to five arguments.
///
/// # Safety
/// Pointer arguments must be valid for what the call does with them.
#[cfg(target_arch = "x86")]
#[inline(always)]
#[allow(clippy::inline_always)]
pub unsafe fn syscall(n: Sysno, args: [u32; 5]) -> u32 {
    let frame = [n as u32, args[0], args[1], args[2], args[3], args[4]];
    let ret: u32;
    // `esi` cannot be an operand on x86, so it is loaded from the frame and
    // saved around the call.
    unsafe {
        core::arch::asm!(
            "push esi",
            "mov ebx, [eax + 4]",
            "mov ecx, [eax + 8]",
            "mov edx, [eax + 12]",
            "mov esi, [eax + 16]",
            "mov edi, [eax + 20]",
            "mov eax, [eax]",
            "int 0x5C",
            "pop esi",
            inout("eax") frame.as_ptr() => ret,
            out("ebx") _,
            out("ecx") _,
            out("edx") _,
            out("edi") _,
        );
    }
    ret
}

#[cfg(not(target_arch = "x86"))]
#[allow(clippy::missing_safety_doc)]
pub unsafe fn syscall(_n: Sysno, _args: [u32; 5]) -> u32 {
    SYSCALL_ERROR
}

#[inline]
const fn checked(ret: u32) -> Option<u32> {
    if ret == SYSCALL_ERROR { None } else { Some(ret) }
}

#[allow(clippy::cast_possible_truncation)]
fn addr<T: ?Sized>(p: *const T) -> u32 {
    p.cast::<u8>() as usize as u32
}

#[allow(clippy::cast_possible_truncation)]
const fn len(bytes: &[u8]) -> u32 {
    bytes.len() as u32
}

pub fn yield_now() {
    unsafe { syscall(Sysno::Yield, [0; 5]) };
}

/// `Some(0)` in the child, `Some(child)` in the parent.
#[must_use]
pub fn fork() -> Option<u32> {
    checked(unsafe { syscall(Sysno::Fork, [0; 5]) })
}

pub fn exit(code: u32) -> ! {
    loop {
        unsafe { syscall(Sysno::Exit, [code, 0, 0, 0, 0]) };
    }
}

/// Waits for `pid`, or any child with `None`. Returns `(pid, exit code)`.
#[must_use]
pub fn wait(pid: Option<u32>) -> Option<(u32, u32)> {
    let mut status = 0_u32;
    let pid = pid.unwrap_or(WAIT_ANY);
    let ret = unsafe { syscall(Sysno::Wait, [pid, addr(&raw mut status), 0, 0, 0]) };
    checked(ret).map(|pid| (pid, status))
}

#[must_use]
pub fn getpid() -> u32 {
    unsafe { syscall(Sysno::GetPid, [0; 5]) }
}

/// Moves the break by `increment` bytes and returns the previous break.
#[must_use]
#[allow(clippy::cast_sign_loss)]
pub fn sbrk(increment: i32) -> Option<u32> {
    checked(unsafe { syscall(Sysno::Sbrk, [increment as u32, 0, 0, 0, 0]) })
}

/// Process times and ticks since boot.
#[must_use]
pub fn times() -> Option<(Tms, u32)> {
    let mut tms = Tms::default();
    let ret = unsafe { syscall(Sysno::Times, [addr(&raw mut tms), 0, 0, 0, 0]) };
    checked(ret).map(|ticks| (tms, ticks))
}

pub fn sleep_ms(ms: u32) {
    unsafe { syscall(Sysno::Sleep, [ms, 0, 0, 0, 0]) };
}

#[must_use]
pub fn register_channel(name: &str, mode: ChannelMode) -> Option<()> {
    let ret = unsafe {
        syscall(
            Sysno::RegisterChannel,
            [addr(name.as_ptr()), len(name.as_bytes()), mode as u32, 0, 0],
        )
    };
    checked(ret).map(|_| ())
}

#[must_use]
pub fn listen(name: &str, enable: bool) -> Option<()> {
    let ret = unsafe {
        syscall(
            Sysno::Listen,
            [addr(name.as_ptr()), len(name.as_bytes()), u32::from(enable), 0, 0],
        )
    };
    checked(ret).map(|_| ())
}

/// Sends `data` on a channel; `target` names the recipient of a unicast
/// channel. Returns the number of recipients.
#[must_use]
pub fn send(name: &str, data: &[u8], target: Option<u32>) -> Option<u32> {
    let ret = unsafe {
        syscall(
            Sysno::Send,
            [
                addr(name.as_ptr()),
                len(name.as_bytes()),
                addr(data.as_ptr()),
                len(data),
                target.unwrap_or(0),
            ],
        )
    };
    checked(ret)
}

/// Blocks until a message arrives on `name`, or on any channel for an empty
/// name, and copies as much of its payload as fits into `buf`.
#[must_use]
pub fn receive(name: &str, buf: &mut [u8]) -> Option<MessageInfo> {
    let mut info = MessageInfo::default();
    let ret = unsafe {
        syscall(
            Sysno::Receive,
            [
                addr(name.as_ptr()),
                len(name.as_bytes()),
                addr(buf.as_mut_ptr()),
                len(buf),
                addr(&raw mut info),
            ],
        )
    };
    checked(ret).map(|_| info)
}
