//! Kernel core: preemptive tasking, four-level paging and NVMe storage.
//!
//! The crate is a library; the EFI/bootloader side hands control to
//! [`init`] with the boot information it gathered. Everything hardware
//! specific (CR3, port I/O, LAPIC MMIO, FXSAVE) is reachable from here but
//! kept behind small helpers so the core logic stays testable on a host.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
pub mod serial;
pub mod logger;

pub mod apic;
pub mod drivers;
pub mod gdt;
pub mod interrupts;
pub mod memory;
pub mod sync;
pub mod task;
pub mod time;

#[cfg(not(test))]
use bootloader_api::BootInfo;

/// Set once `kmain` finished its boot work; the kernel task drains out of
/// the ready queue after this point.
pub use task::scheduler::kmain_completed;

/// Bring the kernel up far enough to run tasks and serve block I/O.
///
/// Ordering matters: logging first, then descriptor tables, then physical
/// and virtual memory, then time sources and the interrupt fabric, finally
/// device discovery and the tasking system.
#[cfg(not(test))]
pub fn init(boot_info: &'static mut BootInfo) {
    serial::init();
    logger::init();

    log::info!("kernel core starting");

    gdt::init();
    interrupts::init_idt();

    memory::init(boot_info);

    time::timer::init();
    apic::init();
    interrupts::enable_irqs();

    let nvme_devices = drivers::pci::scan_nvme_controllers();
    let disks = drivers::nvme::init(&nvme_devices);
    log::info!("{} nvme disk(s) online", disks);

    task::init_tasking(apic::cpu_count());
}

/// Halt the current CPU. Fatal paths (internal-cache refill failure,
/// cleaner double free) end up here.
#[cfg(not(test))]
pub fn halt() -> ! {
    loop {
        x86_64::instructions::hlt();
    }
}

/// Host-test rendition: a halt is a failed invariant.
#[cfg(test)]
pub fn halt() -> ! {
    panic!("cpu halt requested");
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    log::error!("KERNEL PANIC: {}", info);
    serial_println!("KERNEL PANIC: {}", info);
    halt();
}
