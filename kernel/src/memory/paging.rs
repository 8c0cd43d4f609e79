//! Four-level page-table management.
//!
//! An [`AddressSpace`] is a handle to a P4 root. Table storage is owned by
//! the manager itself: interior tables for ordinary mappings come from a
//! two-slot internal frame cache that refills itself from the frame
//! allocator and maps every new cache block before first use, which breaks
//! the circular dependency of needing mapped memory to grow the hierarchy.
//! Deep copies draw their interior tables from the general allocator so a
//! failed copy can be unwound without touching the cache.
//!
//! All table accesses go through the physical-memory window
//! (`phys_offset + pa`); with a zero offset that degenerates to the
//! identity view the hierarchy was originally designed around.

use super::frame_allocator::{self, FrameBlock, FrameKind};
use super::{
    phys_to_virt, FramebufferRegion, KernelLayout, MemoryError, SectionKind, FRAME_SIZE,
};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use spin::Mutex;
use x86_64::structures::paging::page_table::PageTableEntry;
use x86_64::structures::paging::{PageTable, PageTableFlags, PhysFrame};
use x86_64::{PhysAddr, VirtAddr};

const ENTRY_COUNT: usize = 512;

/// Frames per internal-cache block.
const NODE_CACHE_BLOCK: u64 = 64;

const SIZE_2M: u64 = 0x20_0000;
const SIZE_1G: u64 = 0x4000_0000;

/// Base of the fixed high window the framebuffer is mapped into.
pub const FRAMEBUFFER_WINDOW_BASE: u64 = 64 << 40; // 64 TiB

/// Granularity of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapSize {
    Size4KiB,
    Size2MiB,
    Size1GiB,
}

impl MapSize {
    #[inline]
    pub fn bytes(self) -> u64 {
        match self {
            MapSize::Size4KiB => FRAME_SIZE,
            MapSize::Size2MiB => SIZE_2M,
            MapSize::Size1GiB => SIZE_1G,
        }
    }
}

/// Attribute bits `toggle_flags` may flip.
pub const TOGGLEABLE_FLAGS: PageTableFlags = PageTableFlags::WRITABLE
    .union(PageTableFlags::NO_EXECUTE)
    .union(PageTableFlags::USER_ACCESSIBLE);

// ---------------------------------------------------------------------------
// Internal frame cache
// ---------------------------------------------------------------------------

/// Two pools of frames reserved for hierarchy nodes. When the first runs
/// dry the second takes its place; when the first falls below half a block
/// the second is refilled with a freshly mapped block.
struct NodeCache {
    slot1_start: u64,
    slot1_count: u64,
    slot2_start: u64,
    slot2_count: u64,
}

impl NodeCache {
    const fn empty() -> Self {
        Self {
            slot1_start: 0,
            slot1_count: 0,
            slot2_start: 0,
            slot2_count: 0,
        }
    }

    fn promote(&mut self) {
        if self.slot1_count == 0 {
            self.slot1_start = self.slot2_start;
            self.slot1_count = self.slot2_count;
            self.slot2_start = 0;
            self.slot2_count = 0;
        }
    }
}

static NODE_CACHE: Mutex<NodeCache> = Mutex::new(NodeCache::empty());

/// Re-entrancy guard: refilling the cache maps the new block, and those
/// mappings draw nodes from slot1.
static REFILLING: AtomicBool = AtomicBool::new(false);

/// Physical root of the hardware-active hierarchy (0 = none yet).
static ACTIVE_ROOT: AtomicU64 = AtomicU64::new(0);

static KERNEL_SPACE: Mutex<Option<AddressSpace>> = Mutex::new(None);

fn zero_table(pa: PhysAddr) {
    let va = phys_to_virt(pa);
    unsafe {
        core::ptr::write_bytes(va.as_mut_ptr::<u8>(), 0, FRAME_SIZE as usize);
    }
}

/// Take one zeroed frame from the cache for a hierarchy node. Refill
/// failure is fatal: without node storage no further mapping can succeed.
fn cache_node() -> PhysAddr {
    let needs_refill = {
        let mut cache = NODE_CACHE.lock();
        cache.promote();
        cache.slot1_count < (NODE_CACHE_BLOCK / 2) && cache.slot2_count == 0
    };

    if needs_refill && !REFILLING.swap(true, Ordering::Acquire) {
        refill_slot2();
        REFILLING.store(false, Ordering::Release);
    }

    let mut cache = NODE_CACHE.lock();
    cache.promote();
    if cache.slot1_count == 0 {
        log::error!("page-table node cache exhausted; halting");
        drop(cache);
        crate::halt();
    }

    let pa = PhysAddr::new(cache.slot1_start);
    cache.slot1_start += FRAME_SIZE;
    cache.slot1_count -= 1;
    drop(cache);

    zero_table(pa);
    pa
}

/// Allocate a fresh block and map every frame of it at its window address
/// before publishing it as slot2. A node must be reachable through the
/// hierarchy it will later serve.
fn refill_slot2() {
    log::debug!("refilling page-table node cache");

    let block = match frame_allocator::allocate_frames(NODE_CACHE_BLOCK, FrameKind::Reserved) {
        Ok(block) => block,
        Err(_) => {
            log::error!("cannot refill page-table node cache; halting");
            crate::halt();
        }
    };

    if let Some(space) = active_space().or_else(kernel_space) {
        for pa in block.frames() {
            if space
                .map_to(
                    phys_to_virt(pa),
                    pa,
                    MapSize::Size4KiB,
                    PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE,
                )
                .is_err()
            {
                log::error!("cannot map page-table node cache block; halting");
                crate::halt();
            }
        }
    }

    let mut cache = NODE_CACHE.lock();
    cache.slot2_start = block.start_address().as_u64();
    cache.slot2_count = block.count;
}

/// A node for a deep copy: taken from the general allocator (so failure is
/// reportable), mapped at its window address, zeroed.
fn fresh_node() -> Result<PhysAddr, MemoryError> {
    let block = frame_allocator::allocate_frames(1, FrameKind::Reserved)?;
    let pa = block.start_address();

    if let Some(space) = active_space().or_else(kernel_space) {
        space.map_to(
            phys_to_virt(pa),
            pa,
            MapSize::Size4KiB,
            PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE,
        )?;
    }

    zero_table(pa);
    Ok(pa)
}

// ---------------------------------------------------------------------------
// AddressSpace
// ---------------------------------------------------------------------------

/// Handle to one four-level hierarchy. Copyable: the hierarchy itself owns
/// its storage, the handle is just the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpace {
    p4: PhysFrame,
}

impl AddressSpace {
    pub fn from_root(root: PhysAddr) -> Self {
        Self {
            p4: PhysFrame::containing_address(root),
        }
    }

    #[inline]
    pub fn root(&self) -> PhysAddr {
        self.p4.start_address()
    }

    /// View the table stored at `pa` through the physical window.
    ///
    /// Callers hold the tables exclusively by construction: every mutation
    /// path is bracketed by interrupt-disable sections (one CPU) or runs
    /// during single-threaded bring-up.
    #[allow(clippy::mut_from_ref)]
    fn table_mut(&self, pa: PhysAddr) -> &'static mut PageTable {
        unsafe { &mut *(phys_to_virt(pa).as_mut_ptr::<PageTable>()) }
    }

    fn next_table<'a>(
        &self,
        entry: &'a mut PageTableEntry,
    ) -> Result<&'static mut PageTable, MemoryError> {
        if entry.is_unused() {
            let node = cache_node();
            entry.set_addr(node, PageTableFlags::PRESENT | PageTableFlags::WRITABLE);
            Ok(self.table_mut(node))
        } else if entry.flags().contains(PageTableFlags::HUGE_PAGE) {
            Err(MemoryError::InvalidArgument)
        } else {
            Ok(self.table_mut(entry.addr()))
        }
    }

    /// Install a mapping of the given size. Interior tables are created on
    /// demand from the node cache. Re-adding an existing leaf is a no-op:
    /// the original attributes stay.
    pub fn map_to(
        &self,
        va: VirtAddr,
        pa: PhysAddr,
        size: MapSize,
        flags: PageTableFlags,
    ) -> Result<(), MemoryError> {
        let align = size.bytes();
        if va.as_u64() % align != 0 || pa.as_u64() % align != 0 {
            return Err(MemoryError::OutOfRange);
        }

        let p4 = self.table_mut(self.root());
        let p3 = self.next_table(&mut p4[usize::from(va.p4_index())])?;

        let p3e = &mut p3[usize::from(va.p3_index())];
        if size == MapSize::Size1GiB {
            if !p3e.is_unused() {
                return Ok(());
            }
            p3e.set_addr(
                pa,
                flags | PageTableFlags::PRESENT | PageTableFlags::HUGE_PAGE,
            );
            return Ok(());
        }

        let p2 = self.next_table(p3e)?;
        let p2e = &mut p2[usize::from(va.p2_index())];
        if size == MapSize::Size2MiB {
            if !p2e.is_unused() {
                return Ok(());
            }
            p2e.set_addr(
                pa,
                flags | PageTableFlags::PRESENT | PageTableFlags::HUGE_PAGE,
            );
            return Ok(());
        }

        let p1 = self.next_table(p2e)?;
        let p1e = &mut p1[usize::from(va.p1_index())];
        if !p1e.is_unused() {
            return Ok(());
        }
        p1e.set_addr(pa, flags | PageTableFlags::PRESENT);
        Ok(())
    }

    /// Byte-accurate virtual-to-physical translation, hugepages included.
    pub fn translate(&self, va: VirtAddr) -> Result<PhysAddr, MemoryError> {
        let p4 = self.table_mut(self.root());
        let p4e = &p4[usize::from(va.p4_index())];
        if p4e.is_unused() {
            return Err(MemoryError::NotPresent);
        }

        let p3 = self.table_mut(p4e.addr());
        let p3e = &p3[usize::from(va.p3_index())];
        if p3e.is_unused() {
            return Err(MemoryError::NotPresent);
        }
        if p3e.flags().contains(PageTableFlags::HUGE_PAGE) {
            return Ok(PhysAddr::new(
                p3e.addr().as_u64() + (va.as_u64() & (SIZE_1G - 1)),
            ));
        }

        let p2 = self.table_mut(p3e.addr());
        let p2e = &p2[usize::from(va.p2_index())];
        if p2e.is_unused() {
            return Err(MemoryError::NotPresent);
        }
        if p2e.flags().contains(PageTableFlags::HUGE_PAGE) {
            return Ok(PhysAddr::new(
                p2e.addr().as_u64() + (va.as_u64() & (SIZE_2M - 1)),
            ));
        }

        let p1 = self.table_mut(p2e.addr());
        let p1e = &p1[usize::from(va.p1_index())];
        if p1e.is_unused() {
            return Err(MemoryError::NotPresent);
        }
        Ok(PhysAddr::new(
            p1e.addr().as_u64() + (va.as_u64() & (FRAME_SIZE - 1)),
        ))
    }

    /// Remove the leaf covering `va`, returning the aligned physical
    /// address it mapped. Interior tables left empty are handed back to
    /// the frame allocator; the mapped data frames are never touched.
    pub fn unmap(&self, va: VirtAddr) -> Result<PhysAddr, MemoryError> {
        let p4 = self.table_mut(self.root());
        let p4e = &mut p4[usize::from(va.p4_index())];
        if p4e.is_unused() {
            return Err(MemoryError::NotPresent);
        }

        let p3_pa = p4e.addr();
        let p3 = self.table_mut(p3_pa);
        let p3e = &mut p3[usize::from(va.p3_index())];
        if p3e.is_unused() {
            return Err(MemoryError::NotPresent);
        }

        let freed;

        if p3e.flags().contains(PageTableFlags::HUGE_PAGE) {
            freed = p3e.addr();
            p3e.set_unused();
        } else {
            let p2_pa = p3e.addr();
            let p2 = self.table_mut(p2_pa);
            let p2e = &mut p2[usize::from(va.p2_index())];
            if p2e.is_unused() {
                return Err(MemoryError::NotPresent);
            }

            if p2e.flags().contains(PageTableFlags::HUGE_PAGE) {
                freed = p2e.addr();
                p2e.set_unused();
            } else {
                let p1_pa = p2e.addr();
                let p1 = self.table_mut(p1_pa);
                let p1e = &mut p1[usize::from(va.p1_index())];
                if p1e.is_unused() {
                    return Err(MemoryError::NotPresent);
                }
                freed = p1e.addr();
                p1e.set_unused();

                if table_is_empty(p1) {
                    p2e.set_unused();
                    release_node(p1_pa);
                }
            }

            if table_is_empty(p2) {
                p3e.set_unused();
                release_node(p2_pa);
            }
        }

        if table_is_empty(p3) {
            p4e.set_unused();
            release_node(p3_pa);
        }

        flush_tlb(va);
        Ok(freed)
    }

    /// Flip writable / no-execute / user-accessible bits on the resolved
    /// leaf, leaving the mapping itself alone.
    pub fn toggle_flags(&self, va: VirtAddr, mask: PageTableFlags) -> Result<(), MemoryError> {
        let mask = mask & TOGGLEABLE_FLAGS;

        let entry = self.leaf_entry(va)?;
        entry.set_flags(entry.flags() ^ mask);
        flush_tlb(va);
        Ok(())
    }

    fn leaf_entry(&self, va: VirtAddr) -> Result<&'static mut PageTableEntry, MemoryError> {
        let p4 = self.table_mut(self.root());
        let p4e = &mut p4[usize::from(va.p4_index())];
        if p4e.is_unused() {
            return Err(MemoryError::NotPresent);
        }

        let p3 = self.table_mut(p4e.addr());
        let p3e = &mut p3[usize::from(va.p3_index())];
        if p3e.is_unused() {
            return Err(MemoryError::NotPresent);
        }
        if p3e.flags().contains(PageTableFlags::HUGE_PAGE) {
            return Ok(unsafe { &mut *(p3e as *mut PageTableEntry) });
        }

        let p2 = self.table_mut(p3e.addr());
        let p2e = &mut p2[usize::from(va.p2_index())];
        if p2e.is_unused() {
            return Err(MemoryError::NotPresent);
        }
        if p2e.flags().contains(PageTableFlags::HUGE_PAGE) {
            return Ok(unsafe { &mut *(p2e as *mut PageTableEntry) });
        }

        let p1 = self.table_mut(p2e.addr());
        let p1e = &mut p1[usize::from(va.p1_index())];
        if p1e.is_unused() {
            return Err(MemoryError::NotPresent);
        }
        Ok(unsafe { &mut *(p1e as *mut PageTableEntry) })
    }

    #[cfg(test)]
    pub fn leaf_flags(&self, va: VirtAddr) -> Result<PageTableFlags, MemoryError> {
        self.leaf_entry(va).map(|e| e.flags())
    }

    /// Deep-copy the whole hierarchy. Interior tables are fresh; leaf
    /// frame numbers are shared by value. A failed allocation unwinds the
    /// partial copy.
    pub fn deep_copy(&self) -> Result<AddressSpace, MemoryError> {
        let new_root = fresh_node()?;
        let new = AddressSpace::from_root(new_root);

        if let Err(err) = self.copy_levels_into(&new) {
            // Unwind whatever got built; the source is untouched.
            let _ = new.destroy();
            return Err(err);
        }

        Ok(new)
    }

    fn copy_levels_into(&self, new: &AddressSpace) -> Result<(), MemoryError> {
        let src_p4 = self.table_mut(self.root());
        let dst_p4 = new.table_mut(new.root());

        for i4 in 0..ENTRY_COUNT {
            if src_p4[i4].is_unused() {
                continue;
            }

            let p3_node = fresh_node()?;
            dst_p4[i4].set_addr(p3_node, src_p4[i4].flags());

            let src_p3 = self.table_mut(src_p4[i4].addr());
            let dst_p3 = new.table_mut(p3_node);

            for i3 in 0..ENTRY_COUNT {
                if src_p3[i3].is_unused() {
                    continue;
                }
                if src_p3[i3].flags().contains(PageTableFlags::HUGE_PAGE) {
                    dst_p3[i3] = src_p3[i3].clone();
                    continue;
                }

                let p2_node = fresh_node()?;
                dst_p3[i3].set_addr(p2_node, src_p3[i3].flags());

                let src_p2 = self.table_mut(src_p3[i3].addr());
                let dst_p2 = new.table_mut(p2_node);

                for i2 in 0..ENTRY_COUNT {
                    if src_p2[i2].is_unused() {
                        continue;
                    }
                    if src_p2[i2].flags().contains(PageTableFlags::HUGE_PAGE) {
                        dst_p2[i2] = src_p2[i2].clone();
                        continue;
                    }

                    let p1_node = fresh_node()?;
                    dst_p2[i2].set_addr(p1_node, src_p2[i2].flags());

                    // Leaf level: copy the whole table by value.
                    let src_p1 = self.table_mut(src_p2[i2].addr());
                    let dst_p1 = new.table_mut(p1_node);
                    dst_p1.clone_from(src_p1);
                }
            }
        }

        Ok(())
    }

    /// Deep copy whose interior tables are carved sequentially from a
    /// caller-supplied physical window (AP bring-up, guest setup). The
    /// window's lifetime is the caller's problem; a partial copy is not
    /// unwound since the storage never came from the allocator.
    pub fn deep_copy_into_frames(&self, region: &FrameBlock) -> Result<AddressSpace, MemoryError> {
        let mut cursor = NodeCarver {
            next: region.start_address().as_u64(),
            end: region.start_address().as_u64() + region.size_bytes(),
        };

        let new_root = cursor.take(self)?;
        let new = AddressSpace::from_root(new_root);

        let src_p4 = self.table_mut(self.root());
        let dst_p4 = new.table_mut(new.root());

        for i4 in 0..ENTRY_COUNT {
            if src_p4[i4].is_unused() {
                continue;
            }

            let p3_node = cursor.take(self)?;
            dst_p4[i4].set_addr(p3_node, src_p4[i4].flags());

            let src_p3 = self.table_mut(src_p4[i4].addr());
            let dst_p3 = new.table_mut(p3_node);

            for i3 in 0..ENTRY_COUNT {
                if src_p3[i3].is_unused() {
                    continue;
                }
                if src_p3[i3].flags().contains(PageTableFlags::HUGE_PAGE) {
                    dst_p3[i3] = src_p3[i3].clone();
                    continue;
                }

                let p2_node = cursor.take(self)?;
                dst_p3[i3].set_addr(p2_node, src_p3[i3].flags());

                let src_p2 = self.table_mut(src_p3[i3].addr());
                let dst_p2 = new.table_mut(p2_node);

                for i2 in 0..ENTRY_COUNT {
                    if src_p2[i2].is_unused() {
                        continue;
                    }
                    if src_p2[i2].flags().contains(PageTableFlags::HUGE_PAGE) {
                        dst_p2[i2] = src_p2[i2].clone();
                        continue;
                    }

                    let p1_node = cursor.take(self)?;
                    dst_p2[i2].set_addr(p1_node, src_p2[i2].flags());

                    let src_p1 = self.table_mut(src_p2[i2].addr());
                    let dst_p1 = new.table_mut(p1_node);
                    dst_p1.clone_from(src_p1);
                }
            }
        }

        Ok(new)
    }

    /// Free every interior table of the hierarchy. Leaf data frames are
    /// untouched. Destroying the hardware-active hierarchy is refused.
    pub fn destroy(self) -> Result<(), MemoryError> {
        if ACTIVE_ROOT.load(Ordering::Acquire) == self.root().as_u64() {
            return Err(MemoryError::InvalidArgument);
        }

        let p4 = self.table_mut(self.root());

        for i4 in 0..ENTRY_COUNT {
            if p4[i4].is_unused() {
                continue;
            }
            let p3_pa = p4[i4].addr();
            let p3 = self.table_mut(p3_pa);

            for i3 in 0..ENTRY_COUNT {
                if p3[i3].is_unused() || p3[i3].flags().contains(PageTableFlags::HUGE_PAGE) {
                    continue;
                }
                let p2_pa = p3[i3].addr();
                let p2 = self.table_mut(p2_pa);

                for i2 in 0..ENTRY_COUNT {
                    if p2[i2].is_unused() || p2[i2].flags().contains(PageTableFlags::HUGE_PAGE) {
                        continue;
                    }
                    release_node(p2[i2].addr());
                }

                release_node(p2_pa);
            }

            release_node(p3_pa);
        }

        release_node(self.root());
        Ok(())
    }
}

fn table_is_empty(table: &PageTable) -> bool {
    table.iter().all(|e| e.is_unused())
}

fn release_node(pa: PhysAddr) {
    frame_allocator::release_frames(&FrameBlock::new(pa, 1, FrameKind::Reserved));
}

struct NodeCarver {
    next: u64,
    end: u64,
}

impl NodeCarver {
    fn take(&mut self, space: &AddressSpace) -> Result<PhysAddr, MemoryError> {
        if self.next + FRAME_SIZE > self.end {
            return Err(MemoryError::AllocFailure);
        }
        let pa = PhysAddr::new(self.next);
        self.next += FRAME_SIZE;

        // Make the node reachable through its window address before it is
        // written through the source hierarchy's view.
        space.map_to(
            phys_to_virt(pa),
            pa,
            MapSize::Size4KiB,
            PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE,
        )?;
        zero_table(pa);
        Ok(pa)
    }
}

#[cfg(all(target_arch = "x86_64", not(test)))]
fn flush_tlb(va: VirtAddr) {
    x86_64::instructions::tlb::flush(va);
}

#[cfg(any(not(target_arch = "x86_64"), test))]
fn flush_tlb(_va: VirtAddr) {}

// ---------------------------------------------------------------------------
// Globals: active root, kernel space, first-time build
// ---------------------------------------------------------------------------

/// Swap the hardware-active hierarchy, returning the previous one.
pub fn switch(space: &AddressSpace) -> Option<AddressSpace> {
    let old = ACTIVE_ROOT.swap(space.root().as_u64(), Ordering::AcqRel);

    #[cfg(all(target_arch = "x86_64", not(test)))]
    unsafe {
        use x86_64::registers::control::{Cr3, Cr3Flags};
        Cr3::write(
            PhysFrame::containing_address(space.root()),
            Cr3Flags::empty(),
        );
    }

    (old != 0).then(|| AddressSpace::from_root(PhysAddr::new(old)))
}

/// The hardware-active hierarchy, if one was ever switched in.
pub fn active_space() -> Option<AddressSpace> {
    let root = ACTIVE_ROOT.load(Ordering::Acquire);
    (root != 0).then(|| AddressSpace::from_root(PhysAddr::new(root)))
}

/// The kernel hierarchy built at boot.
pub fn kernel_space() -> Option<AddressSpace> {
    *KERNEL_SPACE.lock()
}

/// Build the kernel hierarchy: bootstrap the node cache from the first
/// block (the root is its first frame), map the cache block itself, then
/// the image sections, then the framebuffer window.
pub fn build_kernel_space(layout: &KernelLayout) -> Result<AddressSpace, MemoryError> {
    let block = frame_allocator::allocate_frames(NODE_CACHE_BLOCK, FrameKind::Reserved)?;

    let root = block.start_address();
    zero_table(root);

    {
        let mut cache = NODE_CACHE.lock();
        cache.slot1_start = root.as_u64() + FRAME_SIZE;
        cache.slot1_count = NODE_CACHE_BLOCK - 1;
        cache.slot2_start = 0;
        cache.slot2_count = 0;
    }

    let space = AddressSpace::from_root(root);

    // Self-map: the cache block (root included) must be reachable once
    // this hierarchy goes live.
    for pa in block.frames() {
        space.map_to(
            phys_to_virt(pa),
            pa,
            MapSize::Size4KiB,
            PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE,
        )?;
    }

    for section in &layout.sections {
        let flags = section_flags(section.kind);
        let mut offset = 0;
        while offset < section.size {
            space.map_to(
                section.virt_start + offset,
                section.phys_start + offset,
                MapSize::Size4KiB,
                flags,
            )?;
            offset += FRAME_SIZE;
        }
        log::debug!(
            "mapped {:?} section {:#x}+{:#x}",
            section.kind,
            section.virt_start.as_u64(),
            section.size
        );
    }

    if let Some(fb) = &layout.framebuffer {
        map_framebuffer(&space, fb)?;
    }

    *KERNEL_SPACE.lock() = Some(space);
    Ok(space)
}

fn section_flags(kind: SectionKind) -> PageTableFlags {
    match kind {
        // Executable, read-only.
        SectionKind::Text => PageTableFlags::empty(),
        SectionKind::Rodata => PageTableFlags::NO_EXECUTE,
        SectionKind::Data | SectionKind::Bss | SectionKind::Heap => {
            PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE
        }
    }
}

/// Framebuffer lives at a fixed high window: 2 MiB pages while both sides
/// stay aligned, 4 KiB for the tail.
fn map_framebuffer(space: &AddressSpace, fb: &FramebufferRegion) -> Result<(), MemoryError> {
    let mut pa = fb.phys_start.as_u64();
    let mut va = FRAMEBUFFER_WINDOW_BASE + pa;
    let mut remaining = fb.size;
    let flags = PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE;

    while remaining > 0 {
        let step = if remaining >= SIZE_2M && va % SIZE_2M == 0 && pa % SIZE_2M == 0 {
            space.map_to(
                VirtAddr::new(va),
                PhysAddr::new(pa),
                MapSize::Size2MiB,
                flags,
            )?;
            SIZE_2M
        } else {
            space.map_to(
                VirtAddr::new(va),
                PhysAddr::new(pa),
                MapSize::Size4KiB,
                flags,
            )?;
            FRAME_SIZE
        };
        remaining = remaining.saturating_sub(step);
        pa += step;
        va += step;
    }

    Ok(())
}

#[cfg(test)]
pub fn reset_for_tests() {
    *NODE_CACHE.lock() = NodeCache::empty();
    REFILLING.store(false, Ordering::Release);
    ACTIVE_ROOT.store(0, Ordering::Release);
    *KERNEL_SPACE.lock() = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::test_support;

    fn build() -> AddressSpace {
        build_kernel_space(&test_support::synthetic_layout()).unwrap()
    }

    #[test]
    fn four_kib_round_trip() {
        let _env = test_support::setup();
        let space = build();

        let va = VirtAddr::new(0x5555_0000);
        let pa = PhysAddr::new(0x1234_5000);
        space
            .map_to(va, pa, MapSize::Size4KiB, PageTableFlags::WRITABLE)
            .unwrap();

        assert_eq!(space.translate(va).unwrap(), pa);
        assert_eq!(
            space.translate(va + 0x123u64).unwrap(),
            PhysAddr::new(pa.as_u64() + 0x123)
        );
    }

    #[test]
    fn hugepage_translation_includes_offset() {
        let _env = test_support::setup();
        let space = build();

        let va2m = VirtAddr::new(0x7000_0000);
        let pa2m = PhysAddr::new(0x4060_0000);
        space
            .map_to(va2m, pa2m, MapSize::Size2MiB, PageTableFlags::WRITABLE)
            .unwrap();
        assert_eq!(
            space.translate(va2m + 0x12_345u64).unwrap(),
            PhysAddr::new(pa2m.as_u64() + 0x12_345)
        );

        let va1g = VirtAddr::new(0x80_0000_0000);
        let pa1g = PhysAddr::new(0x1_0000_0000);
        space
            .map_to(va1g, pa1g, MapSize::Size1GiB, PageTableFlags::WRITABLE)
            .unwrap();
        assert_eq!(
            space.translate(va1g + 0x1234_567u64).unwrap(),
            PhysAddr::new(pa1g.as_u64() + 0x1234_567)
        );
    }

    #[test]
    fn misaligned_hugepage_is_rejected() {
        let _env = test_support::setup();
        let space = build();

        let err = space
            .map_to(
                VirtAddr::new(0x7000_1000),
                PhysAddr::new(0x4000_0000),
                MapSize::Size2MiB,
                PageTableFlags::WRITABLE,
            )
            .unwrap_err();
        assert_eq!(err, MemoryError::OutOfRange);
    }

    #[test]
    fn readding_keeps_original_attributes() {
        let _env = test_support::setup();
        let space = build();

        let va = VirtAddr::new(0x5555_0000);
        let pa = PhysAddr::new(0x1234_5000);
        space
            .map_to(va, pa, MapSize::Size4KiB, PageTableFlags::NO_EXECUTE)
            .unwrap();

        // Second add with different attributes and a different target
        // must change nothing.
        space
            .map_to(
                va,
                PhysAddr::new(0x9999_9000),
                MapSize::Size4KiB,
                PageTableFlags::WRITABLE,
            )
            .unwrap();

        assert_eq!(space.translate(va).unwrap(), pa);
        let flags = space.leaf_flags(va).unwrap();
        assert!(flags.contains(PageTableFlags::NO_EXECUTE));
        assert!(!flags.contains(PageTableFlags::WRITABLE));
    }

    #[test]
    fn unmap_returns_frame_and_clears_translation() {
        let _env = test_support::setup();
        let space = build();

        let va = VirtAddr::new(0x5555_0000);
        let pa = PhysAddr::new(0x1234_5000);
        space
            .map_to(va, pa, MapSize::Size4KiB, PageTableFlags::WRITABLE)
            .unwrap();

        assert_eq!(space.unmap(va).unwrap(), pa);
        assert_eq!(space.translate(va).unwrap_err(), MemoryError::NotPresent);
        assert_eq!(space.unmap(va).unwrap_err(), MemoryError::NotPresent);
    }

    #[test]
    fn unmap_hugepage_returns_aligned_address() {
        let _env = test_support::setup();
        let space = build();

        let va = VirtAddr::new(0x7000_0000);
        let pa = PhysAddr::new(0x4060_0000);
        space
            .map_to(va, pa, MapSize::Size2MiB, PageTableFlags::WRITABLE)
            .unwrap();

        assert_eq!(space.unmap(va).unwrap(), pa);
    }

    #[test]
    fn toggle_flips_only_requested_bits() {
        let _env = test_support::setup();
        let space = build();

        let va = VirtAddr::new(0x5555_0000);
        space
            .map_to(
                va,
                PhysAddr::new(0x1234_5000),
                MapSize::Size4KiB,
                PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE,
            )
            .unwrap();

        space.toggle_flags(va, PageTableFlags::WRITABLE).unwrap();
        let flags = space.leaf_flags(va).unwrap();
        assert!(!flags.contains(PageTableFlags::WRITABLE));
        assert!(flags.contains(PageTableFlags::NO_EXECUTE));

        space.toggle_flags(va, PageTableFlags::WRITABLE).unwrap();
        assert!(space
            .leaf_flags(va)
            .unwrap()
            .contains(PageTableFlags::WRITABLE));
    }

    #[test]
    fn sections_are_mapped_with_expected_attributes() {
        let _env = test_support::setup();
        let space = build();
        let layout = test_support::synthetic_layout();

        for section in &layout.sections {
            assert_eq!(
                space.translate(section.virt_start).unwrap(),
                section.phys_start
            );
        }

        let text = layout.sections[0];
        let flags = space.leaf_flags(text.virt_start).unwrap();
        assert!(!flags.contains(PageTableFlags::NO_EXECUTE));
        assert!(!flags.contains(PageTableFlags::WRITABLE));
    }

    #[test]
    fn framebuffer_window_uses_2mib_and_tail() {
        let _env = test_support::setup();
        let space = build();
        let fb = test_support::synthetic_layout().framebuffer.unwrap();

        let base = VirtAddr::new(FRAMEBUFFER_WINDOW_BASE + fb.phys_start.as_u64());
        assert_eq!(space.translate(base).unwrap(), fb.phys_start);

        // Head is one 2 MiB page.
        let head_flags = space.leaf_flags(base).unwrap();
        assert!(head_flags.contains(PageTableFlags::HUGE_PAGE));

        // Tail past the 2 MiB boundary is 4 KiB mapped.
        let tail = base + SIZE_2M;
        let tail_flags = space.leaf_flags(tail).unwrap();
        assert!(!tail_flags.contains(PageTableFlags::HUGE_PAGE));
        assert_eq!(
            space.translate(tail).unwrap(),
            PhysAddr::new(fb.phys_start.as_u64() + SIZE_2M)
        );
    }

    #[test]
    fn deep_copy_preserves_translations_independently() {
        let _env = test_support::setup();
        let space = build();

        let va = VirtAddr::new(0x5555_0000);
        let pa = PhysAddr::new(0x1234_5000);
        space
            .map_to(va, pa, MapSize::Size4KiB, PageTableFlags::WRITABLE)
            .unwrap();

        let copy = space.deep_copy().unwrap();
        assert_eq!(copy.translate(va).unwrap(), pa);

        // Unmapping in the copy leaves the source alone.
        copy.unmap(va).unwrap();
        assert_eq!(copy.translate(va).unwrap_err(), MemoryError::NotPresent);
        assert_eq!(space.translate(va).unwrap(), pa);

        copy.destroy().unwrap();
        assert_eq!(space.translate(va).unwrap(), pa);
    }

    #[test]
    fn destroying_the_active_hierarchy_is_refused() {
        let _env = test_support::setup();
        let space = build();
        switch(&space);

        assert_eq!(space.destroy().unwrap_err(), MemoryError::InvalidArgument);

        // A copy of the live table can be destroyed.
        let copy = space.deep_copy().unwrap();
        copy.destroy().unwrap();
    }

    #[test]
    fn switch_returns_previous_root() {
        let _env = test_support::setup();
        let space = build();

        assert!(switch(&space).is_none());
        let copy = space.deep_copy().unwrap();
        let old = switch(&copy).unwrap();
        assert_eq!(old.root(), space.root());
        assert_eq!(active_space().unwrap().root(), copy.root());
    }

    #[test]
    fn copy_into_frames_carves_the_supplied_window() {
        let _env = test_support::setup();
        let space = build();

        let region = frame_allocator::allocate_frames(128, FrameKind::Reserved).unwrap();
        let copy = space.deep_copy_into_frames(&region).unwrap();

        assert!(region.contains(copy.root()));
        let layout = test_support::synthetic_layout();
        for section in &layout.sections {
            assert_eq!(
                copy.translate(section.virt_start).unwrap(),
                section.phys_start
            );
        }
    }

    #[test]
    fn node_cache_refills_transparently() {
        let _env = test_support::setup();
        let space = build();

        // Chew through far more interior tables than one cache block by
        // mapping pages spread across distinct P2 groups.
        for i in 0..200u64 {
            let va = VirtAddr::new(0x6000_0000 + i * SIZE_2M + 0x1000);
            space
                .map_to(
                    va,
                    PhysAddr::new(0x5_0000_0000 + i * FRAME_SIZE),
                    MapSize::Size4KiB,
                    PageTableFlags::WRITABLE,
                )
                .unwrap();
            assert!(space.translate(va).is_ok());
        }
    }
}
