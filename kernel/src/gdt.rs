//! GDT and TSS setup.
//!
//! The double-fault handler runs on its own IST stack so a corrupted
//! kernel stack cannot take the machine down with it. The remaining IST
//! slots are wired up by the tasking init once it has allocated the
//! interrupt stack block.

#![cfg(target_arch = "x86_64")]

use conquer_once::spin::OnceCell;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

const FALLBACK_STACK_SIZE: usize = 4096 * 5;

/// Boot-time stack for the double-fault IST entry, replaced by the
/// tasking stack block later.
static mut FALLBACK_STACK: [u8; FALLBACK_STACK_SIZE] = [0; FALLBACK_STACK_SIZE];

static mut TSS: TaskStateSegment = TaskStateSegment::new();

struct Selectors {
    code: SegmentSelector,
    data: SegmentSelector,
    tss: SegmentSelector,
}

static GDT: OnceCell<(GlobalDescriptorTable, Selectors)> = OnceCell::uninit();

pub fn init() {
    let gdt = GDT.get_or_init(|| {
        unsafe {
            let stack_start = VirtAddr::new(core::ptr::addr_of!(FALLBACK_STACK) as u64);
            TSS.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] =
                stack_start + FALLBACK_STACK_SIZE as u64;
        }

        let mut gdt = GlobalDescriptorTable::new();
        let code = gdt.append(Descriptor::kernel_code_segment());
        let data = gdt.append(Descriptor::kernel_data_segment());
        let tss = gdt.append(Descriptor::tss_segment(unsafe {
            &*core::ptr::addr_of!(TSS)
        }));
        (gdt, Selectors { code, data, tss })
    });

    #[cfg(not(test))]
    {
        use x86_64::instructions::segmentation::{Segment, CS, SS};
        use x86_64::instructions::tables::load_tss;

        gdt.0.load();
        unsafe {
            CS::set_reg(gdt.1.code);
            SS::set_reg(gdt.1.data);
            load_tss(gdt.1.tss);
        }
    }

    #[cfg(test)]
    let _ = gdt;

    log::info!("gdt and tss loaded");
}

/// Point the privilege-0 and IST stacks at slices of the tasking stack
/// block: `count` stacks of `stack_size` bytes, growing down from
/// `bottom + n * stack_size`.
pub fn set_interrupt_stacks(bottom: VirtAddr, stack_size: u64, count: usize) {
    unsafe {
        let tss = &mut *core::ptr::addr_of_mut!(TSS);
        for i in 0..count.min(7) {
            tss.interrupt_stack_table[i] = bottom + (i as u64 + 1) * stack_size;
        }
        tss.privilege_stack_table[0] = bottom + (count as u64) * stack_size;
    }
}
