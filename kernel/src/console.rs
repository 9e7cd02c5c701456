//! Console sink contract
//!
//! The UART driver lives outside the core; at boot it registers a
//! [`ConsoleSink`] here and everything printed through the kernel's `print!`
//! macros and the [`log`] backend flows into it. On the host (unit tests)
//! output falls through to stdout instead.

use core::fmt::{self, Write};

use spin::Once;

/// Contract implemented by the external console driver.
pub trait ConsoleSink: Sync {
    /// Write a string to the console. Must not sleep.
    fn put_str(&self, s: &str);

    /// Receive-interrupt entry, forwarded from the trap path.
    fn intr(&self) {}
}

static CONSOLE: Once<&'static dyn ConsoleSink> = Once::new();

/// Install the console driver. Later registrations are ignored.
pub fn register(sink: &'static dyn ConsoleSink) {
    CONSOLE.call_once(|| sink);
}

/// UART interrupt entry, called from the interrupt dispatcher.
pub fn uart_intr() {
    if let Some(c) = CONSOLE.get() {
        c.intr();
    }
}

struct SinkWriter(&'static dyn ConsoleSink);

impl fmt::Write for SinkWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.put_str(s);
        Ok(())
    }
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    #[cfg(not(target_os = "none"))]
    {
        use std::io::Write as _;
        let _ = std::write!(std::io::stdout(), "{}", args);
        return;
    }

    #[allow(unreachable_code)]
    if let Some(c) = CONSOLE.get() {
        let _ = SinkWriter(*c).write_fmt(args);
    }
}
