//! Physical and virtual memory management.

pub mod frame_allocator;
pub mod heap;
pub mod paging;

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use x86_64::{PhysAddr, VirtAddr};

/// 4 KiB frames everywhere.
pub const FRAME_SIZE: u64 = 4096;

/// Errors surfaced by the memory subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    /// Address or size does not resolve to a legal table path.
    OutOfRange,
    /// Walk hit an absent entry.
    NotPresent,
    /// Frame or heap exhaustion.
    AllocFailure,
    /// Caller asked for something the manager refuses (e.g. destroying
    /// the live hierarchy).
    InvalidArgument,
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::OutOfRange => write!(f, "address out of range"),
            MemoryError::NotPresent => write!(f, "mapping not present"),
            MemoryError::AllocFailure => write!(f, "frame allocation failed"),
            MemoryError::InvalidArgument => write!(f, "invalid argument"),
        }
    }
}

/// Offset of the direct physical-memory window. Page-table storage is
/// always reachable at `phys_offset + pa`.
static PHYSICAL_MEMORY_OFFSET: AtomicU64 = AtomicU64::new(0);

pub fn set_physical_memory_offset(offset: VirtAddr) {
    PHYSICAL_MEMORY_OFFSET.store(offset.as_u64(), Ordering::Release);
}

#[inline]
pub fn physical_memory_offset() -> VirtAddr {
    VirtAddr::new(PHYSICAL_MEMORY_OFFSET.load(Ordering::Acquire))
}

/// Virtual address at which the given physical address is kept reachable.
#[inline]
pub fn phys_to_virt(pa: PhysAddr) -> VirtAddr {
    physical_memory_offset() + pa.as_u64()
}

/// Kernel image sections handed to the first page-table build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    Text,
    Rodata,
    Data,
    Bss,
    Heap,
}

#[derive(Debug, Clone, Copy)]
pub struct Section {
    pub kind: SectionKind,
    pub virt_start: VirtAddr,
    pub phys_start: PhysAddr,
    pub size: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct FramebufferRegion {
    pub phys_start: PhysAddr,
    pub size: u64,
}

/// Everything the paging manager needs to map the kernel image.
#[derive(Debug, Clone)]
pub struct KernelLayout {
    pub sections: alloc::vec::Vec<Section>,
    pub framebuffer: Option<FramebufferRegion>,
}

/// Bring up physical frames, the kernel address space and the heap.
#[cfg(not(test))]
pub fn init(boot_info: &'static mut bootloader_api::BootInfo) {
    let phys_offset = match &boot_info.physical_memory_offset {
        bootloader_api::info::Optional::Some(offset) => *offset,
        bootloader_api::info::Optional::None => {
            panic!("bootloader did not map physical memory")
        }
    };
    set_physical_memory_offset(VirtAddr::new(phys_offset));

    frame_allocator::init(&boot_info.memory_regions);

    let layout = kernel_layout(boot_info);
    let kernel_space =
        paging::build_kernel_space(&layout).expect("cannot build kernel page tables");
    paging::switch(&kernel_space);

    let heap = layout
        .sections
        .iter()
        .find(|s| s.kind == SectionKind::Heap)
        .copied()
        .expect("kernel layout without heap section");
    heap::init_kernel_heap(heap.virt_start, heap.size);

    log::info!(
        "memory online: phys offset {:#x}, kernel heap {:#x}+{:#x}",
        phys_offset,
        heap.virt_start.as_u64(),
        heap.size
    );
}

/// Assemble the section list from the linker-provided image layout.
#[cfg(not(test))]
fn kernel_layout(boot_info: &bootloader_api::BootInfo) -> KernelLayout {
    extern "C" {
        static __text_start: u8;
        static __text_end: u8;
        static __rodata_start: u8;
        static __rodata_end: u8;
        static __data_start: u8;
        static __data_end: u8;
        static __bss_start: u8;
        static __bss_end: u8;
        static __kheap_bottom: u8;
        static __kheap_top: u8;
    }

    let image_virt = boot_info.kernel_image_offset;
    let image_phys = boot_info.kernel_addr;
    let virt_to_phys = |va: u64| PhysAddr::new(va - image_virt + image_phys);

    let section = |kind, start: u64, end: u64| {
        let start = start & !(FRAME_SIZE - 1);
        let size = (end - start + FRAME_SIZE - 1) & !(FRAME_SIZE - 1);
        Section {
            kind,
            virt_start: VirtAddr::new(start),
            phys_start: virt_to_phys(start),
            size,
        }
    };

    let sections = unsafe {
        alloc::vec![
            section(
                SectionKind::Text,
                &__text_start as *const _ as u64,
                &__text_end as *const _ as u64
            ),
            section(
                SectionKind::Rodata,
                &__rodata_start as *const _ as u64,
                &__rodata_end as *const _ as u64
            ),
            section(
                SectionKind::Data,
                &__data_start as *const _ as u64,
                &__data_end as *const _ as u64
            ),
            section(
                SectionKind::Bss,
                &__bss_start as *const _ as u64,
                &__bss_end as *const _ as u64
            ),
            section(
                SectionKind::Heap,
                &__kheap_bottom as *const _ as u64,
                &__kheap_top as *const _ as u64
            ),
        ]
    };

    let framebuffer = match &boot_info.framebuffer {
        bootloader_api::info::Optional::Some(fb) => {
            let info = fb.info();
            Some(FramebufferRegion {
                // The bootloader places the framebuffer inside the
                // physical window; its buffer address translates directly.
                phys_start: PhysAddr::new(
                    fb.buffer().as_ptr() as u64 - physical_memory_offset().as_u64(),
                ),
                size: info.byte_len as u64,
            })
        }
        bootloader_api::info::Optional::None => None,
    };

    KernelLayout {
        sections,
        framebuffer,
    }
}
