//! # QEMU Debug Console Support
//!
//! Log output for a kernel that has no console driver of its own. Bytes are
//! written to an I/O port that QEMU forwards to the host when started with
//! `-debugcon`:
//!
//! ```bash
//! qemu-system-i386 -kernel kernel.elf -debugcon stdio
//! qemu-system-i386 -kernel kernel.elf -debugcon file:debug.log
//! ```
//!
//! ## Output Path
//!
//! ```text
//! log::info!(..)          qemu_trace!(..)
//!        ↓                      ↓
//!   QemuLogger ──→ format_record ──→ QemuSink (fmt::Write)
//!                                        ↓
//!                              out dx, al  (port 0x402)
//! ```
//!
//! [`QemuLogger`] implements `log::Log`, so the rest of the kernel only ever
//! uses the `log` macros. [`qemu_trace!`] bypasses the logger for the few
//! places that run before it is installed, such as the fatal error path.
//!
//! ## `enabled` Feature (default)
//!
//! Without it, the sink compiles to nothing and no port I/O is emitted. Hosted
//! builds on other architectures behave the same way.
//!
//! ## Setup
//!
//! ```rust,no_run
//! use kernel_qemu::QemuLogger;
//! use log::{LevelFilter, info};
//!
//! QemuLogger::new(LevelFilter::Debug).init().expect("logger installed once");
//! info!("paging enabled");
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod logger;

pub use logger::{QemuLogger, format_record};
pub use qemu_fmt::QemuSink;

/// The port QEMU's `-debugcon` device listens on.
pub const QEMU_DEBUG_PORT: u16 = 0x402;

#[doc(hidden)]
pub mod qemu_fmt {
    use core::fmt::{self, Write};

    /// `fmt::Write` adapter over a byte-wide I/O port.
    #[derive(Debug, Copy, Clone)]
    pub struct QemuSink {
        port: u16,
    }

    impl QemuSink {
        #[must_use]
        pub const fn new(port: u16) -> Self {
            Self { port }
        }

        #[must_use]
        pub const fn port(&self) -> u16 {
            self.port
        }

        #[inline]
        pub fn putc(&self, byte: u8) {
            #[cfg(all(feature = "enabled", any(target_arch = "x86", target_arch = "x86_64")))]
            unsafe {
                core::arch::asm!(
                    "out dx, al",
                    in("dx") self.port,
                    in("al") byte,
                    options(nomem, nostack, preserves_flags)
                );
            }
            #[cfg(not(all(feature = "enabled", any(target_arch = "x86", target_arch = "x86_64"))))]
            let _ = byte;
        }
    }

    impl Default for QemuSink {
        fn default() -> Self {
            Self::new(crate::QEMU_DEBUG_PORT)
        }
    }

    impl Write for QemuSink {
        #[inline]
        fn write_str(&mut self, s: &str) -> fmt::Result {
            for b in s.bytes() {
                self.putc(b);
            }
            Ok(())
        }
    }

    #[doc(hidden)]
    #[inline]
    pub fn qemu_write(args: fmt::Arguments) {
        // Best effort; there is nowhere to report a failed debug write.
        let _ = fmt::write(&mut QemuSink::default(), args);
    }
}

/// Writes straight to the debug port, bypassing `log`.
#[macro_export]
macro_rules! qemu_trace {
    ($($arg:tt)*) => {{
        $crate::qemu_fmt::qemu_write(core::format_args!($($arg)*));
    }};
}
