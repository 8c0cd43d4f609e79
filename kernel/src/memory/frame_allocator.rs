//! Physical frame allocation.
//!
//! Hands out contiguous runs of 4 KiB frames from the usable regions of
//! the firmware memory map. Released blocks go to a free list and are
//! reused before the bump pointer advances. MMIO windows (device BARs)
//! are tracked in a separate reserved-range registry.

use super::{MemoryError, FRAME_SIZE};
use alloc::vec::Vec;
use spin::Mutex;
use x86_64::structures::paging::PhysFrame;
use x86_64::PhysAddr;

/// Maximum number of usable memory regions we support.
const MAX_REGIONS: usize = 128;

/// Low memory floor - frames below 1 MiB are never handed out. Avoids
/// frame 0, firmware areas and legacy device memory.
const LOW_MEMORY_FLOOR: u64 = 0x100000;

/// What a block of frames is used for. `Used` blocks back task stacks and
/// heaps, `Reserved` blocks back DMA/page-table storage, `OldReserved`
/// marks boot-time reservations that die with the boot tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Used,
    Reserved,
    OldReserved,
}

/// A contiguous run of physical frames.
#[derive(Debug, Clone, Copy)]
pub struct FrameBlock {
    pub start: PhysFrame,
    pub count: u64,
    pub kind: FrameKind,
}

impl FrameBlock {
    pub fn new(start: PhysAddr, count: u64, kind: FrameKind) -> Self {
        Self {
            start: PhysFrame::containing_address(start),
            count,
            kind,
        }
    }

    #[inline]
    pub fn start_address(&self) -> PhysAddr {
        self.start.start_address()
    }

    #[inline]
    pub fn size_bytes(&self) -> u64 {
        self.count * FRAME_SIZE
    }

    #[inline]
    pub fn contains(&self, pa: PhysAddr) -> bool {
        let start = self.start_address().as_u64();
        pa.as_u64() >= start && pa.as_u64() < start + self.size_bytes()
    }

    /// Iterate the frame start addresses of the block.
    pub fn frames(&self) -> impl Iterator<Item = PhysAddr> + '_ {
        let base = self.start_address().as_u64();
        (0..self.count).map(move |i| PhysAddr::new(base + i * FRAME_SIZE))
    }
}

#[derive(Debug, Clone, Copy)]
struct UsableRegion {
    start: u64,
    end: u64,
    /// Bump pointer for fresh allocations within the region.
    next: u64,
}

struct RegionTable {
    regions: [Option<UsableRegion>; MAX_REGIONS],
    region_count: usize,
}

static MEMORY_INFO: Mutex<Option<RegionTable>> = Mutex::new(None);

/// Free list of released blocks, first-fit with splitting.
static FREE_BLOCKS: Mutex<Vec<(u64, u64)>> = Mutex::new(Vec::new());

/// Registered MMIO / firmware reservations (not general-purpose memory).
static RESERVED_RANGES: Mutex<Vec<FrameBlock>> = Mutex::new(Vec::new());

/// Initialize from raw `(start, end)` byte ranges.
pub fn init_from_ranges(ranges: &[(u64, u64)]) {
    let mut regions = [None; MAX_REGIONS];
    let mut region_count = 0;
    let mut total = 0u64;

    for &(start, end) in ranges {
        if end <= LOW_MEMORY_FLOOR || region_count == MAX_REGIONS {
            continue;
        }
        let start = start.max(LOW_MEMORY_FLOOR);
        let start = (start + FRAME_SIZE - 1) & !(FRAME_SIZE - 1);
        let end = end & !(FRAME_SIZE - 1);
        if start >= end {
            continue;
        }
        regions[region_count] = Some(UsableRegion {
            start,
            end,
            next: start,
        });
        region_count += 1;
        total += end - start;
    }

    *MEMORY_INFO.lock() = Some(RegionTable {
        regions,
        region_count,
    });
    FREE_BLOCKS.lock().clear();
    RESERVED_RANGES.lock().clear();

    log::info!(
        "frame allocator: {} MiB usable in {} region(s)",
        total / (1024 * 1024),
        region_count
    );
}

/// Initialize from the bootloader memory map.
#[cfg(not(test))]
pub fn init(memory_regions: &bootloader_api::info::MemoryRegions) {
    use bootloader_api::info::MemoryRegionKind;

    let mut ranges = [(0u64, 0u64); MAX_REGIONS];
    let mut n = 0;
    for region in memory_regions.iter() {
        if region.kind == MemoryRegionKind::Usable && n < MAX_REGIONS {
            ranges[n] = (region.start, region.end);
            n += 1;
        }
    }
    init_from_ranges(&ranges[..n]);
}

/// Allocate `count` contiguous frames.
///
/// The free list is consulted first; a larger free block is split and the
/// tail kept. Falls back to bumping a region pointer.
pub fn allocate_frames(count: u64, kind: FrameKind) -> Result<FrameBlock, MemoryError> {
    if count == 0 {
        return Err(MemoryError::InvalidArgument);
    }

    let bytes = count * FRAME_SIZE;

    if let Some(mut free) = FREE_BLOCKS.try_lock() {
        if let Some(pos) = free.iter().position(|&(_, c)| c >= count) {
            let (start, c) = free[pos];
            if c == count {
                free.swap_remove(pos);
            } else {
                free[pos] = (start + bytes, c - count);
            }
            return Ok(FrameBlock::new(PhysAddr::new(start), count, kind));
        }
    }

    let mut info = MEMORY_INFO.lock();
    let info = info.as_mut().ok_or(MemoryError::AllocFailure)?;

    for i in 0..info.region_count {
        if let Some(region) = info.regions[i].as_mut() {
            if region.next + bytes <= region.end {
                let start = region.next;
                region.next += bytes;
                return Ok(FrameBlock::new(PhysAddr::new(start), count, kind));
            }
        }
    }

    log::error!("frame allocator exhausted: {} frame(s) requested", count);
    Err(MemoryError::AllocFailure)
}

/// Return a block to the allocator. The caller owns the exactly-once
/// contract; a lost race against an interrupt-context caller only leaks.
pub fn release_frames(block: &FrameBlock) {
    if block.start_address().as_u64() < LOW_MEMORY_FLOOR {
        log::warn!(
            "refusing to release frames below the low memory floor: {:#x}",
            block.start_address().as_u64()
        );
        return;
    }

    if let Some(mut free) = FREE_BLOCKS.try_lock() {
        free.push((block.start_address().as_u64(), block.count));
    } else {
        log::warn!(
            "frame release lost to lock contention: {:#x}+{}",
            block.start_address().as_u64(),
            block.count
        );
    }
}

/// Record an MMIO/firmware range so later lookups can find it.
pub fn register_reserved(block: FrameBlock) {
    RESERVED_RANGES.lock().push(block);
}

/// Look up the reserved range containing `pa`, if any.
pub fn reserved_block_containing(pa: PhysAddr) -> Option<FrameBlock> {
    RESERVED_RANGES
        .lock()
        .iter()
        .find(|b| b.contains(pa))
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::test_support;

    #[test]
    fn contiguous_blocks_do_not_overlap() {
        let _env = test_support::setup();

        let a = allocate_frames(4, FrameKind::Used).unwrap();
        let b = allocate_frames(4, FrameKind::Used).unwrap();

        let a_end = a.start_address().as_u64() + a.size_bytes();
        assert!(b.start_address().as_u64() >= a_end || {
            let b_end = b.start_address().as_u64() + b.size_bytes();
            a.start_address().as_u64() >= b_end
        });
    }

    #[test]
    fn released_blocks_are_reused() {
        let _env = test_support::setup();

        let a = allocate_frames(8, FrameKind::Used).unwrap();
        let start = a.start_address();
        release_frames(&a);

        let b = allocate_frames(8, FrameKind::Used).unwrap();
        assert_eq!(b.start_address(), start);
    }

    #[test]
    fn splitting_keeps_the_tail() {
        let _env = test_support::setup();

        let a = allocate_frames(8, FrameKind::Used).unwrap();
        release_frames(&a);

        let b = allocate_frames(2, FrameKind::Used).unwrap();
        let c = allocate_frames(6, FrameKind::Used).unwrap();
        assert_eq!(b.start_address(), a.start_address());
        assert_eq!(
            c.start_address().as_u64(),
            a.start_address().as_u64() + 2 * FRAME_SIZE
        );
    }

    #[test]
    fn reserved_registry_finds_containing_block() {
        let _env = test_support::setup();

        let bar = FrameBlock::new(PhysAddr::new(0xF000_0000), 4, FrameKind::Reserved);
        register_reserved(bar);

        let hit = reserved_block_containing(PhysAddr::new(0xF000_2010)).unwrap();
        assert_eq!(hit.start_address(), bar.start_address());
        assert!(reserved_block_containing(PhysAddr::new(0xE000_0000)).is_none());
    }

    #[test]
    fn zero_count_is_rejected() {
        let _env = test_support::setup();
        assert_eq!(
            allocate_frames(0, FrameKind::Used).unwrap_err(),
            MemoryError::InvalidArgument
        );
    }
}
