//! Kernel logging backend
//!
//! Routes the [`log`] facade to the serial port. Subsystems log with
//! per-target names (`"task"`, `"sched"`, `"trap"`, `"pagefault"`,
//! `"signal"`, `"ipc"`, `"syscall"`), so a debugging session can raise the
//! max level and grep the stream by subsystem.

use log::{LevelFilter, Log, Metadata, Record};

struct SerialLogger;

impl Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        crate::serial_println!("[{:5} {}] {}", record.level(), record.target(), record.args());
    }

    fn flush(&self) {}
}

static LOGGER: SerialLogger = SerialLogger;

/// Install the serial logger.
///
/// Called once, early in boot, before any subsystem logs. Repeated calls
/// are ignored.
pub fn init(level: LevelFilter) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}
