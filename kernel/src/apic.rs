//! Local APIC: identification, EOI, the preemption timer and MSI target
//! addresses. The legacy PICs are remapped out of the exception range and
//! masked before the APIC takes over.

#![allow(dead_code)]

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Vector the task-switch timer fires on.
pub const TASK_SWITCH_VECTOR: u8 = 0x60;

/// Spurious-interrupt vector.
const SPURIOUS_VECTOR: u8 = 0xFF;

// Local APIC register offsets.
const LAPIC_ID: u64 = 0x20;
const LAPIC_EOI: u64 = 0xB0;
const LAPIC_SPURIOUS: u64 = 0xF0;
const LAPIC_LVT_TIMER: u64 = 0x320;
const LAPIC_TIMER_INITIAL: u64 = 0x380;
const LAPIC_TIMER_DIVIDE: u64 = 0x3E0;

const TIMER_PERIODIC: u32 = 1 << 17;

/// Virtual base the LAPIC window is reachable at (0 until `init`).
static LAPIC_BASE: AtomicU64 = AtomicU64::new(0);

/// CPUs known to the platform bootstrap (BSP included).
static CPU_COUNT: AtomicU32 = AtomicU32::new(1);

#[inline]
fn reg(offset: u64) -> *mut u32 {
    (LAPIC_BASE.load(Ordering::Acquire) + offset) as *mut u32
}

fn read(offset: u64) -> u32 {
    if LAPIC_BASE.load(Ordering::Acquire) == 0 {
        return 0;
    }
    unsafe { core::ptr::read_volatile(reg(offset)) }
}

fn write(offset: u64, value: u32) {
    if LAPIC_BASE.load(Ordering::Acquire) == 0 {
        return;
    }
    unsafe { core::ptr::write_volatile(reg(offset), value) }
}

/// Map the LAPIC window, mask the legacy PICs, enable the APIC and start
/// the periodic task-switch timer.
#[cfg(all(target_arch = "x86_64", not(test)))]
pub fn init() {
    use crate::memory::frame_allocator::{self, FrameBlock, FrameKind};
    use crate::memory::paging::{self, MapSize};
    use x86_64::registers::model_specific::Msr;
    use x86_64::structures::paging::PageTableFlags;
    use x86_64::PhysAddr;

    // Remap the PICs away from the exception vectors, then mask them;
    // interrupt delivery belongs to the APIC from here on.
    let mut pics = unsafe { pic8259::ChainedPics::new(0x20, 0x28) };
    unsafe {
        pics.initialize();
        // Leave only the PIT line open for the tick counter.
        pics.write_masks(0xFE, 0xFF);
    }

    const IA32_APIC_BASE: u32 = 0x1B;
    let base_msr = unsafe { Msr::new(IA32_APIC_BASE).read() };
    let base_pa = PhysAddr::new(base_msr & 0xFFFF_F000);

    let bar = FrameBlock::new(base_pa, 1, FrameKind::Reserved);
    frame_allocator::register_reserved(bar);

    let va = crate::memory::phys_to_virt(base_pa);
    if let Some(space) = paging::kernel_space() {
        space
            .map_to(
                va,
                base_pa,
                MapSize::Size4KiB,
                PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE | PageTableFlags::NO_CACHE,
            )
            .expect("cannot map lapic window");
    }

    LAPIC_BASE.store(va.as_u64(), Ordering::Release);

    // Software-enable with the spurious vector.
    write(LAPIC_SPURIOUS, 0x100 | SPURIOUS_VECTOR as u32);

    // Periodic preemption timer on the task-switch vector.
    write(LAPIC_TIMER_DIVIDE, 0b1011); // divide by 1
    write(LAPIC_LVT_TIMER, TASK_SWITCH_VECTOR as u32 | TIMER_PERIODIC);
    write(LAPIC_TIMER_INITIAL, 10_000_000);

    log::info!("lapic online, id {}", local_id());
}

#[cfg(any(not(target_arch = "x86_64"), test))]
pub fn init() {}

/// APIC id of the executing CPU.
#[inline]
pub fn local_id() -> u32 {
    read(LAPIC_ID) >> 24
}

/// Signal end-of-interrupt.
#[inline]
pub fn eoi() {
    write(LAPIC_EOI, 0);
}

/// End-of-interrupt as a plain C function for the new-task trampoline.
pub extern "C" fn eoi_thunk() {
    eoi();
}

/// Record the CPU count discovered by the platform bootstrap.
pub fn set_cpu_count(count: u32) {
    CPU_COUNT.store(count.max(1), Ordering::Release);
}

/// CPUs in the system (BSP + APs).
#[inline]
pub fn cpu_count() -> u32 {
    CPU_COUNT.load(Ordering::Acquire)
}

/// Application processors only.
#[inline]
pub fn ap_count() -> u32 {
    cpu_count().saturating_sub(1)
}

/// MSI message address targeting the given CPU.
#[inline]
pub fn msi_address(apic_id: u32) -> u64 {
    0xFEE0_0000 | ((apic_id as u64) << 12)
}
