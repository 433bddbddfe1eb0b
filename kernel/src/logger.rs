//! `log` facade backed by the serial console.

use log::{Level, LevelFilter, Metadata, Record};

struct SerialLogger;

static LOGGER: SerialLogger = SerialLogger;

impl log::Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Trace
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let (level, color) = match record.level() {
            Level::Error => ("\x1b[31mERROR\x1b[0m", "\x1b[31m"),
            Level::Warn => ("\x1b[33mWARN\x1b[0m", "\x1b[33m"),
            Level::Info => ("\x1b[32mINFO\x1b[0m", "\x1b[37m"),
            Level::Debug => ("\x1b[90mDEBUG\x1b[0m", "\x1b[90m"),
            Level::Trace => ("\x1b[90mTRACE\x1b[0m", "\x1b[90m"),
        };
        crate::arch::x86_64::serial::_print(format_args!(
            "[{}] {}{}\x1b[0m\n",
            level,
            color,
            record.args()
        ));
    }

    fn flush(&self) {}
}

/// Install the serial logger. Serial must already be initialized.
pub fn init() {
    log::set_logger(&LOGGER)
        .map(|()| log::set_max_level(LevelFilter::Debug))
        .expect("logger installed twice");
}
