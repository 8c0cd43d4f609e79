//! Core PIT-backed timer facilities (1 kHz, 1 ms resolution).

use core::sync::atomic::{AtomicU64, Ordering};

#[cfg(not(test))]
const PIT_INPUT_FREQ_HZ: u32 = 1_193_182;
#[cfg(not(test))]
const PIT_HZ: u32 = 1000; // 1 kHz => 1 ms per tick
#[cfg(all(target_arch = "x86_64", not(test)))]
const PIT_COMMAND_PORT: u16 = 0x43;
#[cfg(all(target_arch = "x86_64", not(test)))]
const PIT_CHANNEL0_PORT: u16 = 0x40;

/// Global monotonic tick counter (1 tick == 1 ms).
static TICKS: AtomicU64 = AtomicU64::new(0);

/// Program the PIT to generate periodic interrupts at `PIT_HZ`.
#[cfg(not(test))]
pub fn init() {
    let divisor: u16 = (PIT_INPUT_FREQ_HZ / PIT_HZ) as u16;
    unsafe {
        use x86_64::instructions::port::Port;
        let mut cmd: Port<u8> = Port::new(PIT_COMMAND_PORT);
        let mut ch0: Port<u8> = Port::new(PIT_CHANNEL0_PORT);

        // Counter 0, lobyte/hibyte, mode 3 (square wave), binary
        cmd.write(0x36);

        // Divisor LSB then MSB
        ch0.write((divisor & 0xFF) as u8);
        ch0.write((divisor >> 8) as u8);
    }

    log::info!("timer initialized at {} Hz", PIT_HZ);
}

/// Invoked from the CPU-side interrupt stub every 1 ms.
#[inline]
pub fn timer_interrupt() {
    TICKS.fetch_add(1, Ordering::Relaxed);
}

/// Raw tick counter.
#[inline]
pub fn tick_count() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Busy-wait for roughly `us` microseconds.
///
/// Used by the NVMe reset loops before interrupts are live, so it must not
/// depend on the tick counter. A write to port 0x80 takes about 1 µs on
/// every chipset that matters.
#[cfg(not(test))]
pub fn spinsleep(us: u64) {
    unsafe {
        use x86_64::instructions::port::Port;
        let mut dummy: Port<u8> = Port::new(0x80);
        for _ in 0..us {
            dummy.write(0u8);
        }
    }
}

/// Host-test rendition: no port to pace against, nothing is really waiting.
#[cfg(test)]
pub fn spinsleep(_us: u64) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_counter_is_monotonic() {
        let before = tick_count();
        timer_interrupt();
        timer_interrupt();
        assert!(tick_count() >= before + 2);
    }
}
