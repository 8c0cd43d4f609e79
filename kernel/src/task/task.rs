//! Task control blocks.

use super::context::{FxArea, TaskContext};
use crate::memory::frame_allocator::FrameBlock;
use crate::memory::heap::TaskHeap;
use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use crossbeam_queue::SegQueue;
use spin::Mutex;
use x86_64::{PhysAddr, VirtAddr};

pub type TaskId = u64;

/// Task id 0 is the kernel task.
pub const KERNEL_TASK_ID: TaskId = 0;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(KERNEL_TASK_ID + 1);

/// Monotonically increasing, unique for the lifetime of the system.
pub fn allocate_task_id() -> TaskId {
    NEXT_TASK_ID.fetch_add(1, Ordering::SeqCst)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Running,
    Suspended,
    Ended,
}

/// Why a task is not currently runnable. Orthogonal to [`TaskState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskWait {
    None,
    Sleep { wake_tick: u64 },
    Messages,
    Future,
}

pub type Message = Vec<u8>;
pub type MessageQueue = SegQueue<Message>;

/// A mapped, frame-backed virtual region owned by one task.
#[derive(Debug, Clone, Copy)]
pub struct OwnedRegion {
    pub va: VirtAddr,
    pub size: u64,
    pub frames: FrameBlock,
}

/// Byte sink/source carved out of a task's private heap (or the kernel
/// heap for the kernel task). Fixed capacity, append semantics.
pub struct IoBuffer {
    base: *mut u8,
    capacity: usize,
    len: Mutex<usize>,
}

// The raw base pointer targets memory owned by the task for the buffer's
// whole lifetime.
unsafe impl Send for IoBuffer {}
unsafe impl Sync for IoBuffer {}

impl IoBuffer {
    /// Wrap raw task-heap storage.
    ///
    /// # Safety
    /// `base..base+capacity` must stay mapped and exclusively owned by
    /// this buffer.
    pub unsafe fn from_raw(base: VirtAddr, capacity: usize) -> Self {
        Self {
            base: base.as_mut_ptr(),
            capacity,
            len: Mutex::new(0),
        }
    }

    /// Buffer backed by the global heap (the kernel task's stdio).
    pub fn allocate(capacity: usize) -> Self {
        let storage: &'static mut [u8] = Box::leak(alloc::vec![0u8; capacity].into_boxed_slice());
        Self {
            base: storage.as_mut_ptr(),
            capacity,
            len: Mutex::new(0),
        }
    }

    /// Append bytes; returns how many fit.
    pub fn write(&self, data: &[u8]) -> usize {
        let mut len = self.len.lock();
        let room = self.capacity - *len;
        let n = data.len().min(room);
        unsafe {
            core::ptr::copy_nonoverlapping(data.as_ptr(), self.base.add(*len), n);
        }
        *len += n;
        n
    }

    /// Copy out the current contents and reset the buffer.
    pub fn drain(&self, out: &mut [u8]) -> usize {
        let mut len = self.len.lock();
        let n = (*len).min(out.len());
        unsafe {
            core::ptr::copy_nonoverlapping(self.base, out.as_mut_ptr(), n);
        }
        *len = 0;
        n
    }

    pub fn len(&self) -> usize {
        *self.len.lock()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// The task's input/output/error byte streams.
pub struct Stdio {
    pub input: IoBuffer,
    pub output: IoBuffer,
    pub error: IoBuffer,
}

/// One schedulable unit of execution.
pub struct Task {
    pub id: TaskId,
    pub name: String,

    pub state: TaskState,
    pub wait: TaskWait,
    pub interruptible: bool,
    pub interrupt_received: bool,

    pub context: TaskContext,
    pub fx: Box<FxArea>,

    /// Owned stack; `None` for the kernel task (it runs on the boot
    /// stack).
    pub stack: Option<OwnedRegion>,
    /// Owned heap region and the allocator over it.
    pub heap_region: Option<OwnedRegion>,
    pub heap: Option<Arc<TaskHeap>>,

    /// Root of the hierarchy the task runs under (shared kernel space
    /// for ordinary tasks).
    pub page_table: PhysAddr,

    pub message_queues: Vec<Arc<MessageQueue>>,

    /// Physical address of the VMCS when this task hosts a guest.
    pub vmcs_phys: Option<u64>,

    pub stdio: Stdio,

    pub last_tick_count: u64,
    pub task_switch_count: u64,
}

impl Task {
    /// The kernel task: id 0, already running on the boot stack.
    pub fn kernel(page_table: PhysAddr, mxcsr_mask: u32) -> Self {
        let fx = Box::new(FxArea::primed(mxcsr_mask));
        let context = TaskContext::zeroed(fx.as_ref());

        Self {
            id: KERNEL_TASK_ID,
            name: String::from("kernel"),
            state: TaskState::Created,
            wait: TaskWait::None,
            interruptible: false,
            interrupt_received: false,
            context,
            fx,
            stack: None,
            heap_region: None,
            heap: None,
            page_table,
            message_queues: Vec::new(),
            vmcs_phys: None,
            stdio: Stdio {
                input: IoBuffer::allocate(0x1000),
                output: IoBuffer::allocate(0x1000),
                error: IoBuffer::allocate(0x1000),
            },
            last_tick_count: 0,
            task_switch_count: 0,
        }
    }

    /// Any message queue with something in it?
    pub fn has_pending_message(&self) -> bool {
        self.message_queues.iter().any(|q| !q.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_buffer_appends_and_drains() {
        let buf = IoBuffer::allocate(8);
        assert_eq!(buf.write(b"hello"), 5);
        assert_eq!(buf.write(b"world"), 3); // only 3 fit
        assert_eq!(buf.len(), 8);

        let mut out = [0u8; 16];
        let n = buf.drain(&mut out);
        assert_eq!(&out[..n], b"hellowor");
        assert!(buf.is_empty());
    }

    #[test]
    fn kernel_task_has_reserved_id() {
        let task = Task::kernel(PhysAddr::new(0x1000), 0xFFBF);
        assert_eq!(task.id, KERNEL_TASK_ID);
        assert_eq!(task.state, TaskState::Created);
        assert!(task.stack.is_none());
    }

    #[test]
    fn task_ids_are_monotonic() {
        let a = allocate_task_id();
        let b = allocate_task_id();
        assert!(b > a);
    }
}
