//! COM1 serial logger behind the `log` facade.
//!
//! QEMU and most lab boards mirror COM1 somewhere convenient, which makes
//! the serial line the kernel's primary log sink. Off target the port writes
//! compile to nothing; the records are still formatted, so host builds keep
//! the same code paths honest.

use core::fmt::{self, Write};
use kernel_sync::SpinLock;
use log::{LevelFilter, Metadata, Record};

const COM1: u16 = 0x3f8;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn outb(port: u16, value: u8) {
    // Safety: port I/O on a port the kernel owns.
    unsafe {
        core::arch::asm!("out dx, al", in("dx") port, in("al") value,
            options(nomem, nostack, preserves_flags));
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn inb(port: u16) -> u8 {
    let value: u8;
    // Safety: port I/O on a port the kernel owns.
    unsafe {
        core::arch::asm!("in al, dx", out("al") value, in("dx") port,
            options(nomem, nostack, preserves_flags));
    }
    value
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
fn outb(_port: u16, _value: u8) {}

// Line status reads back "transmit buffer empty" so the wait loop below
// terminates off target.
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
fn inb(_port: u16) -> u8 {
    0x20
}

/// 16550-style UART on fixed I/O ports.
struct SerialPort;

impl SerialPort {
    fn init(&mut self) {
        outb(COM1 + 1, 0x00); // mask UART interrupts, we poll
        outb(COM1 + 3, 0x80); // DLAB on
        outb(COM1, 0x01); // divisor 1: 115200 baud
        outb(COM1 + 1, 0x00);
        outb(COM1 + 3, 0x03); // 8n1, DLAB off
        outb(COM1 + 2, 0xc7); // FIFOs on and cleared
    }

    fn write_byte(&mut self, byte: u8) {
        while inb(COM1 + 5) & 0x20 == 0 {
            core::hint::spin_loop();
        }
        outb(COM1, byte);
    }
}

impl fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for b in s.bytes() {
            if b == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(b);
        }
        Ok(())
    }
}

/// [`log::Log`] sink writing one line per record to COM1.
pub struct SerialLogger {
    port: SpinLock<SerialPort>,
}

impl log::Log for SerialLogger {
    fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
        // Filtering happens via `log::set_max_level`.
        true
    }

    fn log(&self, record: &Record<'_>) {
        let _nmi = crate::no_preempt();
        let mut port = self.port.lock();
        let _ = writeln!(
            port,
            "[{:5}] {}: {}",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}

static LOGGER: SerialLogger = SerialLogger {
    port: SpinLock::new(SerialPort),
};

/// Route the `log` macros to COM1. Call once, as early as possible.
pub fn init(level: LevelFilter) {
    LOGGER.port.lock().init();
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}
