//! `log` backend that writes to a serial port.
//!
//! Each record is written as `[LEVEL] target: message` followed by CRLF.
//! The port sits behind a spin mutex; records from different cores never
//! interleave within a line.

use core::fmt::{self, Write};

use kestrel_hal::Serial;
use log::{LevelFilter, Log, Metadata, Record};
use spin::Mutex;

/// A [`Log`] implementation over any [`Serial`] port.
pub struct SerialLogger<S: Serial + Send> {
    port: Mutex<S>,
    level: LevelFilter,
}

impl<S: Serial + Send> SerialLogger<S> {
    /// Wrap `port`, dropping records above `level`.
    pub const fn new(port: S, level: LevelFilter) -> Self {
        Self {
            port: Mutex::new(port),
            level,
        }
    }

    /// Maximum level this logger emits.
    pub fn level(&self) -> LevelFilter {
        self.level
    }
}

struct SerialWriter<'a, S: Serial>(&'a mut S);

impl<S: Serial> Write for SerialWriter<'_, S> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.0.write_byte(b'\r');
            }
            self.0.write_byte(byte);
        }
        Ok(())
    }
}

impl<S: Serial + Send> Log for SerialLogger<S> {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut port = self.port.lock();
        // A serial port cannot fail; formatting errors are dropped.
        let _ = writeln!(
            SerialWriter(&mut *port),
            "[{:>5}] {}: {}",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}
