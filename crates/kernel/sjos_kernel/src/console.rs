//! Formatted console output and the kernel logger.
//!
//! The console device itself is outside the kernel core; boot code
//! registers a function writing a string to it with [`init()`].

use core::{
    fmt::{self, Write as _},
    sync::atomic::{AtomicBool, Ordering},
};

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use spin::{Mutex, MutexGuard, Once};

static SINK: Once<fn(&str)> = Once::new();

// lock to avoid interleaving concurrent print's.
struct Print {
    locking: AtomicBool,
    lock: Mutex<()>,
}

static PRINT: Print = Print {
    locking: AtomicBool::new(true),
    lock: Mutex::new(()),
};

impl Print {
    fn lock(&self) -> Writer<'_> {
        let guard = self
            .locking
            .load(Ordering::Relaxed)
            .then(|| self.lock.lock());
        Writer { _guard: guard }
    }
}

struct Writer<'a> {
    _guard: Option<MutexGuard<'a, ()>>,
}

impl fmt::Write for Writer<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if let Some(put_str) = SINK.get() {
            put_str(s);
        }
        Ok(())
    }
}

/// Registers the console output function. Only the first call has effect.
pub fn init(put_str: fn(&str)) {
    SINK.call_once(|| put_str);
}

/// Stops serializing output, so that a panicking CPU can print even if
/// another CPU died holding the console.
pub fn disable_locking() {
    PRINT.locking.store(false, Ordering::Relaxed);
}

pub fn _print(args: fmt::Arguments) {
    let mut writer = PRINT.lock();
    // `Writer` itself never fails
    let _ = writer.write_fmt(args);
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        #[expect(clippy::used_underscore_items)]
        $crate::console::_print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! println {
    () => {
        $crate::print!("\n")
    };
    ($($arg:tt)*) => {
        $crate::print!("{}\n", format_args!($($arg)*))
    };
}

/// `log` backend printing to the console.
pub struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

fn write_record<W>(w: &mut W, record: &Record) -> fmt::Result
where
    W: fmt::Write,
{
    writeln!(w, "[{} {}] {}", record.level(), record.target(), record.args())
}

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut writer = PRINT.lock();
        // `Writer` itself never fails
        let _ = write_record(&mut writer, record);
    }

    fn flush(&self) {}
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    use crate::arch::{Arch as _, x86::X86};

    X86::disable_interrupts();
    disable_locking();
    crate::println!("kernel panic: {info}");
    X86::monitor()
}

/// Installs [`KernelLogger`] as the global logger.
pub fn init_logger(level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER)?;
    log::set_max_level(level);
    Ok(())
}
