//! `log` facade backend writing to the serial port.

use log::{LevelFilter, Metadata, Record};

struct SerialLogger;

impl log::Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        serial_println!(
            "[{:>5}] {}: {}",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}

static LOGGER: SerialLogger = SerialLogger;

/// Install the serial logger. Safe to call exactly once, before memory
/// init so allocation failures are visible.
pub fn init() {
    log::set_logger(&LOGGER).expect("logger already set");
    log::set_max_level(LevelFilter::Info);
}

/// Raise or lower verbosity at runtime (used by the shell-less debug
/// builds via serial commands).
#[allow(dead_code)]
pub fn set_level(level: LevelFilter) {
    log::set_max_level(level);
}
