//! Kernel console output.
//!
//! Early boot installs a raw character sink (a bare MMIO write on QEMU
//! virt); once the PL011 is probed from the device tree it replaces the
//! sink with the real driver. The `log` facade is routed through the same
//! sink so every subsystem logs with `log::{trace,debug,info,warn,error}`.

use core::fmt::{self, Write};

use spin::Mutex;

/// Character sink installed by the console driver.
pub type ConsoleSink = fn(&str);

static CONSOLE: Mutex<Option<ConsoleSink>> = Mutex::new(None);

/// Install (or replace) the active console sink.
pub fn set_console(sink: ConsoleSink) {
    *CONSOLE.lock() = Some(sink);
}

struct ConsoleWriter;

impl Write for ConsoleWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        // Interrupt handlers log too; mask so a tick cannot spin on the
        // console lock its interrupted owner holds.
        let _irq = crate::arch::interrupt_guard();
        if let Some(sink) = *CONSOLE.lock() {
            sink(s);
        }
        Ok(())
    }
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    let _ = ConsoleWriter.write_fmt(args);
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::print::_print(format_args!($($arg)*)));
}

#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

/// `log::Log` implementation writing through the console sink.
struct ConsoleLogger;

static LOGGER: ConsoleLogger = ConsoleLogger;

impl log::Log for ConsoleLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            println!("[{:5}] {}: {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Register the console logger with the `log` facade.
///
/// Called once from the boot path; repeated calls are ignored.
pub fn init_logging(level: log::LevelFilter) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}
