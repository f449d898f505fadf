use crate::qemu_fmt::QemuSink;
use core::fmt::{self, Write};
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

/// Routes `log` records to a QEMU debug port.
#[derive(Debug)]
pub struct QemuLogger {
    max_level: LevelFilter,
    sink: QemuSink,
}

impl QemuLogger {
    #[must_use]
    pub const fn new(max_level: LevelFilter) -> Self {
        Self::with_port(max_level, crate::QEMU_DEBUG_PORT)
    }

    /// Logs to a different port, e.g. COM1 at `0x3F8` on real hardware.
    #[must_use]
    pub const fn with_port(max_level: LevelFilter, port: u16) -> Self {
        Self {
            max_level,
            sink: QemuSink::new(port),
        }
    }

    /// Installs the logger. Call this once during early init.
    ///
    /// # Errors
    /// Fails if another logger was installed first.
    #[allow(static_mut_refs)]
    pub fn init(self) -> Result<(), SetLoggerError> {
        static mut LOGGER: QemuLogger = QemuLogger::new(LevelFilter::Off);

        let max_level = self.max_level;
        // SAFETY: runs once, before interrupts are enabled, so nothing reads
        // LOGGER while it is being replaced.
        unsafe {
            LOGGER = self;
            log::set_logger(&*core::ptr::addr_of!(LOGGER))?;
        }
        log::set_max_level(max_level);
        Ok(())
    }
}

/// Formats one record as `"[LEVEL] target: message\n"`.
///
/// # Errors
/// Propagates errors of the underlying writer.
pub fn format_record<W: Write>(out: &mut W, record: &Record) -> fmt::Result {
    writeln!(out, "[{}] {}: {}", record.level(), record.target(), record.args())
}

impl Log for QemuLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut sink = self.sink;
        let _ = format_record(&mut sink, record);
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Level;

    #[test]
    fn record_format() {
        let mut out = String::new();
        let record = Record::builder()
            .level(Level::Warn)
            .target("kernel_task::scheduler")
            .args(format_args!("run queue {} empty", 3))
            .build();
        format_record(&mut out, &record).unwrap();
        assert_eq!(out, "[WARN] kernel_task::scheduler: run queue 3 empty\n");
    }

    #[test]
    fn level_filter() {
        let logger = QemuLogger::new(LevelFilter::Info);
        let debug = Metadata::builder().level(Level::Debug).build();
        let error = Metadata::builder().level(Level::Error).build();
        assert!(!logger.enabled(&debug));
        assert!(logger.enabled(&error));
    }
}
