//! Serial port driver for x86_64.
//!
//! COM1 (0x3F8) carries the kernel log.

use kestrel_hal::Serial;
use log::{LevelFilter, SetLoggerError};
use spin::Mutex;
use uart_16550::SerialPort;
use x86_64::instructions::port::Port;

use crate::logger::SerialLogger;

/// COM1 I/O port address.
const COM1_PORT: u16 = 0x3F8;

/// Line status register offset and its "data ready" bit.
const LINE_STATUS: u16 = 5;
const DATA_READY: u8 = 1;

/// Global serial port instance, lazily initialized.
pub static SERIAL: spin::Once<Mutex<SerialPort>> = spin::Once::new();

static LOGGER: spin::Once<SerialLogger<Com1>> = spin::Once::new();

/// Initializes the global serial port.
///
/// Idempotent.
pub fn init() -> &'static Mutex<SerialPort> {
    SERIAL.call_once(|| {
        // SAFETY: COM1_PORT (0x3F8) is a well-known x86 serial port address.
        // We're running in kernel mode with full I/O port access.
        let mut serial = unsafe { SerialPort::new(COM1_PORT) };
        serial.init();
        Mutex::new(serial)
    })
}

/// COM1 as a HAL serial port.
pub struct Com1;

impl Serial for Com1 {
    fn write_byte(&mut self, byte: u8) {
        init().lock().send(byte);
    }

    fn read_byte(&mut self) -> Option<u8> {
        let mut port = init().lock();
        let mut status = Port::<u8>::new(COM1_PORT + LINE_STATUS);
        // SAFETY: reading the line status register has no side effects.
        if unsafe { status.read() } & DATA_READY != 0 {
            Some(port.receive())
        } else {
            None
        }
    }
}

/// Route the `log` facade to COM1.
pub fn init_logging(level: LevelFilter) -> Result<(), SetLoggerError> {
    init();
    let logger = LOGGER.call_once(|| SerialLogger::new(Com1, level));
    log::set_logger(logger)?;
    log::set_max_level(level);
    Ok(())
}
