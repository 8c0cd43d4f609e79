//! COM1 serial output used for kernel logging.

use core::fmt;
use spin::Mutex;
#[cfg(target_arch = "x86_64")]
use uart_16550::SerialPort;

const COM1_PORT: u16 = 0x3F8;

#[cfg(target_arch = "x86_64")]
pub static SERIAL1: Mutex<SerialPort> = Mutex::new(unsafe { SerialPort::new(COM1_PORT) });

pub fn init() {
    #[cfg(target_arch = "x86_64")]
    SERIAL1.lock().init();
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    #[cfg(all(target_arch = "x86_64", not(test)))]
    {
        use core::fmt::Write;
        x86_64::instructions::interrupts::without_interrupts(|| {
            SERIAL1
                .lock()
                .write_fmt(args)
                .expect("serial write failed");
        });
    }

    #[cfg(test)]
    std::print!("{}", args);

    #[cfg(all(not(target_arch = "x86_64"), not(test)))]
    let _ = args;
}

/// Print to COM1.
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::serial::_print(format_args!($($arg)*))
    };
}

/// Print to COM1 with a trailing newline.
#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($fmt:expr) => ($crate::serial_print!(concat!($fmt, "\n")));
    ($fmt:expr, $($arg:tt)*) => ($crate::serial_print!(concat!($fmt, "\n"), $($arg)*));
}
