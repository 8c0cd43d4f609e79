//! Kernel heap and per-task heaps.

use core::alloc::Layout;
use linked_list_allocator::Heap;
use spin::Mutex;
use x86_64::VirtAddr;

#[cfg(not(test))]
#[global_allocator]
static KERNEL_HEAP: linked_list_allocator::LockedHeap = linked_list_allocator::LockedHeap::empty();

/// Hand the mapped kernel heap region to the allocator.
#[cfg(not(test))]
pub fn init_kernel_heap(start: VirtAddr, size: u64) {
    unsafe {
        KERNEL_HEAP
            .lock()
            .init(start.as_mut_ptr::<u8>(), size as usize);
    }
}

/// Heaps above this size get the bucketed layout; small ones a single
/// first-fit arena.
pub const HASHED_HEAP_THRESHOLD: u64 = 16 << 20; // 16 MiB

const BUCKET_COUNT: usize = 4;

/// Size-class boundaries for the bucketed heap. Allocations larger than
/// the last boundary land in the final bucket.
const BUCKET_LIMITS: [usize; BUCKET_COUNT - 1] = [64, 512, 4096];

/// A task-private heap over the task's mapped heap region.
pub enum TaskHeap {
    /// One first-fit arena over the whole region.
    Simple(Mutex<Heap>),
    /// Size-class buckets, each its own arena over an equal slice of the
    /// region. Spreads distinct allocation sizes so churn in one class
    /// cannot fragment the others.
    Hashed([Mutex<Heap>; BUCKET_COUNT]),
}

impl TaskHeap {
    /// Build a heap over `[start, start + size)`.
    ///
    /// # Safety
    /// The region must be mapped, writable, and owned by this heap for its
    /// whole lifetime.
    pub unsafe fn new(start: VirtAddr, size: u64) -> Self {
        if size > HASHED_HEAP_THRESHOLD {
            let slice = size as usize / BUCKET_COUNT;
            let bucket = |i: usize| {
                let mut heap = Heap::empty();
                heap.init((start.as_u64() as usize + i * slice) as *mut u8, slice);
                Mutex::new(heap)
            };
            TaskHeap::Hashed([bucket(0), bucket(1), bucket(2), bucket(3)])
        } else {
            let mut heap = Heap::empty();
            heap.init(start.as_mut_ptr::<u8>(), size as usize);
            TaskHeap::Simple(Mutex::new(heap))
        }
    }

    fn bucket_index(layout: &Layout) -> usize {
        BUCKET_LIMITS
            .iter()
            .position(|&limit| layout.size() <= limit)
            .unwrap_or(BUCKET_COUNT - 1)
    }

    pub fn allocate(&self, layout: Layout) -> Option<VirtAddr> {
        let arena = match self {
            TaskHeap::Simple(heap) => heap,
            TaskHeap::Hashed(buckets) => &buckets[Self::bucket_index(&layout)],
        };

        arena
            .lock()
            .allocate_first_fit(layout)
            .ok()
            .map(|ptr| VirtAddr::new(ptr.as_ptr() as u64))
    }

    /// # Safety
    /// `va` must come from a matching `allocate` with the same layout.
    pub unsafe fn deallocate(&self, va: VirtAddr, layout: Layout) {
        let arena = match self {
            TaskHeap::Simple(heap) => heap,
            TaskHeap::Hashed(buckets) => &buckets[Self::bucket_index(&layout)],
        };

        arena.lock().deallocate(
            core::ptr::NonNull::new_unchecked(va.as_mut_ptr::<u8>()),
            layout,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::frame_allocator::{self, FrameKind};
    use crate::memory::test_support;

    #[test]
    fn simple_heap_allocates_within_region() {
        let _env = test_support::setup();

        let block = frame_allocator::allocate_frames(16, FrameKind::Used).unwrap();
        let start = VirtAddr::new(block.start_address().as_u64());
        let heap = unsafe { TaskHeap::new(start, block.size_bytes()) };

        let layout = Layout::from_size_align(256, 16).unwrap();
        let a = heap.allocate(layout).unwrap();
        let b = heap.allocate(layout).unwrap();

        assert_ne!(a, b);
        for va in [a, b] {
            assert!(va >= start);
            assert!(va.as_u64() + 256 <= start.as_u64() + block.size_bytes());
        }

        unsafe {
            heap.deallocate(a, layout);
            heap.deallocate(b, layout);
        }
    }

    #[test]
    fn small_region_gets_the_simple_variant() {
        let _env = test_support::setup();

        let block = frame_allocator::allocate_frames(4, FrameKind::Used).unwrap();
        let heap =
            unsafe { TaskHeap::new(VirtAddr::new(block.start_address().as_u64()), block.size_bytes()) };
        assert!(matches!(heap, TaskHeap::Simple(_)));
    }

    #[test]
    fn bucket_selection_follows_size_classes() {
        let layout = |size| Layout::from_size_align(size, 8).unwrap();
        assert_eq!(TaskHeap::bucket_index(&layout(16)), 0);
        assert_eq!(TaskHeap::bucket_index(&layout(128)), 1);
        assert_eq!(TaskHeap::bucket_index(&layout(2048)), 2);
        assert_eq!(TaskHeap::bucket_index(&layout(1 << 20)), 3);
    }
}
