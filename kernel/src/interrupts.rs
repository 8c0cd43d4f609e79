//! IDT setup and interrupt dispatch.
//!
//! Entry points are `global_asm!` stubs registered with
//! `set_handler_addr`: the stubs preserve the caller-saved registers,
//! call a plain `extern "C"` Rust handler and `iretq`. Vector 0x60 is the
//! task-switch IRQ; a small pool of vectors starting at 0x70 is handed
//! out to MSI-X users.

#![cfg(target_arch = "x86_64")]

use core::arch::global_asm;
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use spin::Once;
use x86_64::structures::idt::InterruptDescriptorTable;
use x86_64::VirtAddr;

/// Legacy PIC lines start here after remap.
pub const PIC_VECTOR_BASE: u8 = 0x20;

/// Task switch IRQ.
pub const TASK_SWITCH_VECTOR: u8 = crate::apic::TASK_SWITCH_VECTOR;

/// Dynamically assigned MSI-X vectors.
pub const MSIX_VECTOR_BASE: u8 = 0x70;
pub const MSIX_VECTOR_COUNT: usize = 8;

static IDT: Once<InterruptDescriptorTable> = Once::new();

global_asm!(
    r#"
.global irq_stub_pit
.global irq_stub_task_switch
.global irq_stub_spurious
.global irq_stub_msix_0
.global irq_stub_msix_1
.global irq_stub_msix_2
.global irq_stub_msix_3
.global irq_stub_msix_4
.global irq_stub_msix_5
.global irq_stub_msix_6
.global irq_stub_msix_7
.global exc_stub_double_fault
.global exc_stub_gp_fault
.global exc_stub_page_fault

// Save the caller-saved registers, call the C handler in rdi-less form,
// restore and return. Nine pushes keep the ABI stack alignment intact.
.macro IRQ_BODY handler, arg
    push rax
    push rcx
    push rdx
    push rsi
    push rdi
    push r8
    push r9
    push r10
    push r11
    mov rdi, \arg
    call \handler
    pop r11
    pop r10
    pop r9
    pop r8
    pop rdi
    pop rsi
    pop rdx
    pop rcx
    pop rax
    iretq
.endm

irq_stub_pit:
    IRQ_BODY pit_tick_handler, 0

irq_stub_task_switch:
    IRQ_BODY task_switch_irq_handler, 0

irq_stub_spurious:
    iretq

irq_stub_msix_0:
    IRQ_BODY msix_dispatch, 0
irq_stub_msix_1:
    IRQ_BODY msix_dispatch, 1
irq_stub_msix_2:
    IRQ_BODY msix_dispatch, 2
irq_stub_msix_3:
    IRQ_BODY msix_dispatch, 3
irq_stub_msix_4:
    IRQ_BODY msix_dispatch, 4
irq_stub_msix_5:
    IRQ_BODY msix_dispatch, 5
irq_stub_msix_6:
    IRQ_BODY msix_dispatch, 6
irq_stub_msix_7:
    IRQ_BODY msix_dispatch, 7

// Fatal exceptions: the handlers never return, no state to preserve.
exc_stub_double_fault:
    mov rdi, 8
    mov rsi, [rsp]
    call fatal_exception_handler

exc_stub_gp_fault:
    mov rdi, 13
    mov rsi, [rsp]
    call fatal_exception_handler

exc_stub_page_fault:
    mov rdi, 14
    mov rsi, [rsp]
    call fatal_exception_handler
"#
);

extern "C" {
    fn irq_stub_pit();
    fn irq_stub_task_switch();
    fn irq_stub_spurious();
    fn irq_stub_msix_0();
    fn irq_stub_msix_1();
    fn irq_stub_msix_2();
    fn irq_stub_msix_3();
    fn irq_stub_msix_4();
    fn irq_stub_msix_5();
    fn irq_stub_msix_6();
    fn irq_stub_msix_7();
    fn exc_stub_double_fault();
    fn exc_stub_gp_fault();
    fn exc_stub_page_fault();
}

#[no_mangle]
extern "C" fn pit_tick_handler(_arg: u64) {
    crate::time::timer::timer_interrupt();

    // Legacy PIC EOI for IRQ0.
    #[cfg(not(test))]
    unsafe {
        use x86_64::instructions::port::Port;
        Port::<u8>::new(0x20).write(0x20u8);
    }
}

#[no_mangle]
extern "C" fn task_switch_irq_handler(_arg: u64) {
    crate::task::scheduler::preemption_tick();
}

#[no_mangle]
extern "C" fn fatal_exception_handler(vector: u64, error_code: u64) -> ! {
    log::error!(
        "fatal exception {} (error code {:#x})",
        vector,
        error_code
    );
    serial_println!("fatal exception {} (error code {:#x})", vector, error_code);
    crate::halt();
}

/// Registered MSI-X handlers, one slot per pooled vector. Stored as raw
/// fn pointers so the ISR path stays lock free.
static MSIX_HANDLERS: [AtomicUsize; MSIX_VECTOR_COUNT] = [
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
];

static NEXT_MSIX_SLOT: AtomicU8 = AtomicU8::new(0);

#[no_mangle]
extern "C" fn msix_dispatch(slot: u64) {
    let raw = MSIX_HANDLERS[slot as usize].load(Ordering::Acquire);
    if raw != 0 {
        let handler: fn(u8) = unsafe { core::mem::transmute(raw) };
        handler(MSIX_VECTOR_BASE + slot as u8);
    } else {
        log::warn!("msi-x interrupt on unclaimed slot {}", slot);
        crate::apic::eoi();
    }
}

/// Claim an MSI-X vector from the pool and bind its handler.
pub fn allocate_msix_vector(handler: fn(u8)) -> Option<u8> {
    let slot = NEXT_MSIX_SLOT.fetch_add(1, Ordering::AcqRel);
    if slot as usize >= MSIX_VECTOR_COUNT {
        return None;
    }
    MSIX_HANDLERS[slot as usize].store(handler as usize, Ordering::Release);
    Some(MSIX_VECTOR_BASE + slot)
}

pub fn init_idt() {
    let idt = IDT.call_once(|| {
        let mut idt = InterruptDescriptorTable::new();

        unsafe {
            idt.double_fault
                .set_handler_addr(VirtAddr::new(exc_stub_double_fault as usize as u64))
                .set_stack_index(crate::gdt::DOUBLE_FAULT_IST_INDEX);
            idt.general_protection_fault
                .set_handler_addr(VirtAddr::new(exc_stub_gp_fault as usize as u64));
            idt.page_fault
                .set_handler_addr(VirtAddr::new(exc_stub_page_fault as usize as u64));

            // PIT on the first remapped PIC line.
            idt[PIC_VECTOR_BASE]
                .set_handler_addr(VirtAddr::new(irq_stub_pit as usize as u64));

            idt[TASK_SWITCH_VECTOR]
                .set_handler_addr(VirtAddr::new(irq_stub_task_switch as usize as u64));

            idt[0xFF].set_handler_addr(VirtAddr::new(irq_stub_spurious as usize as u64));

            let msix_stubs: [unsafe extern "C" fn(); MSIX_VECTOR_COUNT] = [
                irq_stub_msix_0,
                irq_stub_msix_1,
                irq_stub_msix_2,
                irq_stub_msix_3,
                irq_stub_msix_4,
                irq_stub_msix_5,
                irq_stub_msix_6,
                irq_stub_msix_7,
            ];
            for (i, stub) in msix_stubs.iter().enumerate() {
                idt[MSIX_VECTOR_BASE + i as u8]
                    .set_handler_addr(VirtAddr::new(*stub as usize as u64));
            }
        }

        idt
    });

    #[cfg(not(test))]
    idt.load();

    #[cfg(test)]
    let _ = idt;

    log::info!("idt installed");
}

/// Turn external interrupts on once the handlers are in place.
#[cfg(not(test))]
pub fn enable_irqs() {
    x86_64::instructions::interrupts::enable();
}

#[cfg(test)]
pub fn enable_irqs() {}
