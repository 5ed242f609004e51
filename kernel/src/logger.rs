//! Kernel logger
//!
//! Every record goes to the serial port; Info and louder is mirrored to
//! the VGA console so a machine without a serial line still shows the
//! bring-up story.

use log::{Level, LevelFilter, Log, Metadata, Record};

struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Debug
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        crate::serial_println!(
            "[{:5}] {}: {}",
            record.level(),
            record.target(),
            record.args()
        );
        if record.level() <= Level::Info {
            crate::println!("[{:5}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Debug);
    }
}
