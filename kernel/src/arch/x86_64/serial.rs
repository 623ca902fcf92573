/// Serial port driver (COM1, 0x3F8) for diagnostic output.
///
/// The primary debug channel for bare-metal bring-up; QEMU redirects it
/// to the host terminal. Configured for 38400 baud, 8 data bits, no
/// parity, one stop bit, FIFO enabled.
use core::fmt;
use spin::Mutex;

const COM1: u16 = 0x3F8;

/// Baud rate divisor: 115200 / 3 = 38400.
const BAUD_DIVISOR: u8 = 3;

pub static SERIAL: Mutex<Serial> = Mutex::new(Serial::new(COM1));

pub struct Serial {
    port: u16,
}

impl Serial {
    pub const fn new(port: u16) -> Self {
        Self { port }
    }

    /// Initialize the serial port (38400 baud, 8N1, FIFO on).
    pub fn init(&self) {
        super::outb(self.port + 1, 0x00); // Disable interrupts
        super::outb(self.port + 3, 0x80); // Enable DLAB (set baud rate divisor)
        super::outb(self.port, BAUD_DIVISOR); // Divisor low byte
        super::outb(self.port + 1, 0x00); // Divisor high byte
        super::outb(self.port + 3, 0x03); // 8 bits, no parity, one stop bit
        super::outb(self.port + 2, 0xC7); // Enable FIFO, clear, 14-byte threshold
        super::outb(self.port + 4, 0x0B); // IRQs enabled, RTS/DSR set
    }

    /// Check if the transmit buffer is empty.
    fn is_transmit_empty(&self) -> bool {
        super::inb(self.port + 5) & 0x20 != 0
    }

    /// Write a single byte, waiting for the transmit buffer.
    pub fn write_byte(&self, byte: u8) {
        while !self.is_transmit_empty() {
            core::hint::spin_loop();
        }
        super::outb(self.port, byte);
    }

    /// Write a string, expanding `\n` to `\r\n`.
    pub fn write_str_raw(&self, s: &str) {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
    }
}

impl fmt::Write for Serial {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_str_raw(s);
        Ok(())
    }
}

/// Print to the serial console.
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        {
            use core::fmt::Write;
            let mut serial = $crate::arch::x86_64::serial::SERIAL.lock();
            let _ = write!(serial, $($arg)*);
        }
    };
}

/// Print to the serial console with a newline.
#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => {
        $crate::serial_print!("{}\n", format_args!($($arg)*))
    };
}
