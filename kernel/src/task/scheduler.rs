//! Per-CPU preemptive scheduler.
//!
//! One global ready queue (FIFO with skips), a cleaner queue for ended
//! tasks, and per-CPU current/idle slots indexed by APIC id. The switch
//! path does its bookkeeping under the scheduler lock, then performs the
//! register swap outside it; the exit-prep step sends EOI and re-enables
//! interrupts according to per-CPU flags set by whoever initiated the
//! switch.

use super::context::{switch_context, vmclear, vmptrld, FxArea, TaskContext};
use super::task::{
    allocate_task_id, IoBuffer, OwnedRegion, Stdio, Task, TaskId, TaskState, TaskWait,
    KERNEL_TASK_ID,
};
use super::TaskError;
use crate::memory::frame_allocator::{self, FrameKind};
use crate::memory::heap::TaskHeap;
use crate::memory::paging::{self, AddressSpace, MapSize};
use crate::memory::{phys_to_virt, FRAME_SIZE};
use crate::time::timer;
use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::alloc::Layout;
use core::sync::atomic::{AtomicBool, Ordering};
use crossbeam_queue::SegQueue;
use spin::Mutex;
use x86_64::structures::paging::PageTableFlags;
use x86_64::PhysAddr;

/// A task keeps the CPU for at most this many ticks before the switch
/// path stops quick-accepting it.
pub const MAX_TICK_COUNT: u64 = 10;

/// Stacks carved for the TSS interrupt stack table at tasking init.
const IST_STACK_SIZE: u64 = 0x4000;
const IST_STACK_COUNT: u64 = 9;

static KMAIN_COMPLETED: AtomicBool = AtomicBool::new(false);

/// Mark boot work done; the kernel task drains out of the ready set on
/// its next pass through the switch path.
pub fn kmain_completed() {
    KMAIN_COMPLETED.store(true, Ordering::Release);
}

#[cfg(test)]
pub fn set_kmain_completed(value: bool) {
    KMAIN_COMPLETED.store(value, Ordering::Release);
}

/// Everything the assembly switch needs once the lock is dropped.
pub struct SwitchPlan {
    pub prev_id: TaskId,
    pub next_id: TaskId,
    pub prev_ctx: *mut TaskContext,
    pub next_ctx: *const TaskContext,
    pub prev_vmcs: Option<u64>,
    pub next_vmcs: Option<u64>,
}

pub struct Scheduler {
    tasks: BTreeMap<TaskId, Arc<Mutex<Task>>>,
    ready: VecDeque<TaskId>,
    cleaner: SegQueue<TaskId>,

    current: Vec<Option<TaskId>>,
    idle: Vec<TaskId>,
    need_eoi: Vec<bool>,
    need_sti: Vec<bool>,

    mxcsr_mask: u32,
}

impl Scheduler {
    /// Boot-CPU construction: the kernel task occupies both the current
    /// and the idle slot of the booting CPU.
    pub fn new(cpu_count: usize, boot_cpu: usize, kernel_root: PhysAddr, mxcsr_mask: u32) -> Self {
        let kernel = Task::kernel(kernel_root, mxcsr_mask);

        let mut tasks = BTreeMap::new();
        tasks.insert(KERNEL_TASK_ID, Arc::new(Mutex::new(kernel)));

        let mut current = Vec::new();
        current.resize(cpu_count, None);
        current[boot_cpu] = Some(KERNEL_TASK_ID);

        let mut idle = Vec::new();
        idle.resize(cpu_count, KERNEL_TASK_ID);

        Self {
            tasks,
            ready: VecDeque::new(),
            cleaner: SegQueue::new(),
            current,
            idle,
            need_eoi: alloc::vec![false; cpu_count],
            need_sti: alloc::vec![false; cpu_count],
            mxcsr_mask,
        }
    }

    pub fn task(&self, id: TaskId) -> Option<Arc<Mutex<Task>>> {
        self.tasks.get(&id).cloned()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn task_ids(&self) -> Vec<TaskId> {
        self.tasks.keys().copied().collect()
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub fn current_id(&self, apic_id: usize) -> Option<TaskId> {
        self.current.get(apic_id).copied().flatten()
    }

    pub fn set_switch_flags(&mut self, apic_id: usize, need_eoi: bool, need_sti: bool) {
        if apic_id < self.need_eoi.len() {
            self.need_eoi[apic_id] = need_eoi;
            self.need_sti[apic_id] = need_sti;
        }
    }

    pub fn take_exit_flags(&self, apic_id: usize) -> (bool, bool) {
        (
            *self.need_eoi.get(apic_id).unwrap_or(&false),
            *self.need_sti.get(apic_id).unwrap_or(&false),
        )
    }

    /// FIFO with skips. The first queue entry that passes the selection
    /// rule wins; ended entries are detoured to the cleaner queue along
    /// the way. Falls back to this CPU's idle task.
    pub fn find_next_task(&mut self, apic_id: usize, now: u64) -> TaskId {
        let mut idx = 0;
        while idx < self.ready.len() {
            let id = self.ready[idx];
            let Some(entry) = self.tasks.get(&id) else {
                self.ready.remove(idx);
                continue;
            };

            let mut task = entry.lock();

            if task.state == TaskState::Ended {
                drop(task);
                self.ready.remove(idx);
                self.cleaner.push(id);
                continue;
            }

            match task.wait {
                TaskWait::Future => {
                    idx += 1;
                }
                TaskWait::Sleep { wake_tick } => {
                    if wake_tick < now {
                        task.wait = TaskWait::None;
                        drop(task);
                        self.ready.remove(idx);
                        return id;
                    }
                    idx += 1;
                }
                TaskWait::Messages => {
                    if task.interruptible && task.interrupt_received {
                        task.interrupt_received = false;
                        task.wait = TaskWait::None;
                        drop(task);
                        self.ready.remove(idx);
                        return id;
                    }
                    if task.has_pending_message() {
                        task.wait = TaskWait::None;
                        drop(task);
                        self.ready.remove(idx);
                        return id;
                    }
                    idx += 1;
                }
                TaskWait::None => {
                    drop(task);
                    self.ready.remove(idx);
                    return id;
                }
            }
        }

        self.idle[apic_id]
    }

    /// The switch protocol minus the register swap. Returns what the
    /// assembly needs, or `None` when no switch should happen (no
    /// current, quick-accept, or the same task re-selected).
    pub fn plan_switch(&mut self, apic_id: usize, now: u64) -> Option<SwitchPlan> {
        let prev_id = self.current_id(apic_id)?;
        let prev_arc = self.tasks.get(&prev_id)?.clone();

        let (prev_ctx, prev_vmcs) = {
            let mut prev = prev_arc.lock();

            // Quick accept: a healthy task inside its tick budget stays.
            if prev.state != TaskState::Ended
                && prev.wait == TaskWait::None
                && now > prev.last_tick_count
                && now - prev.last_tick_count < MAX_TICK_COUNT
            {
                return None;
            }

            if prev.state == TaskState::Ended {
                self.cleaner.push(prev_id);
            } else {
                prev.state = TaskState::Suspended;
                let drain_kernel =
                    prev_id == KERNEL_TASK_ID && KMAIN_COMPLETED.load(Ordering::Acquire);
                if !drain_kernel {
                    self.ready.push_back(prev_id);
                }
            }

            (&mut prev.context as *mut TaskContext, prev.vmcs_phys)
        };

        if prev_id == KERNEL_TASK_ID && !self.cleaner.is_empty() {
            self.drain_cleaner();
        }

        let next_id = self.find_next_task(apic_id, now);
        let next_arc = self.tasks.get(&next_id)?.clone();

        {
            let mut next = next_arc.lock();
            next.last_tick_count = now;
            next.task_switch_count += 1;
            next.state = TaskState::Running;
        }

        self.current[apic_id] = Some(next_id);

        if next_id == prev_id {
            return None;
        }

        let next = next_arc.lock();
        Some(SwitchPlan {
            prev_id,
            next_id,
            prev_ctx,
            next_ctx: &next.context as *const TaskContext,
            prev_vmcs,
            next_vmcs: next.vmcs_phys,
        })
    }

    /// Free everything an ended task owns. Runs in the kernel task's
    /// switch path; each task passes through here exactly once because
    /// the map entry is removed first.
    pub fn drain_cleaner(&mut self) {
        while let Some(id) = self.cleaner.pop() {
            let Some(entry) = self.tasks.remove(&id) else {
                log::error!("cleaner queue holds unknown task {:#x}; halting", id);
                crate::halt();
            };

            let task = match Arc::try_unwrap(entry) {
                Ok(mutex) => mutex.into_inner(),
                Err(_) => {
                    log::error!("task {:#x} still referenced during cleanup; halting", id);
                    crate::halt();
                }
            };

            log::debug!("cleaning task {} '{}'", task.id, task.name);
            cleanup_task(task);
        }
    }

    /// Allocate and queue a new task.
    ///
    /// Stack and heap sizes round up to whole frames; the stack carries
    /// the start trampoline, the heap carries the allocator and the
    /// task's stdio buffers. Every allocation is unwound on failure.
    pub fn create_task(
        &mut self,
        heap_size: u64,
        stack_size: u64,
        entry_point: extern "C" fn(u64),
        arg: u64,
        name: &str,
    ) -> Result<TaskId, TaskError> {
        let space = kernel_address_space().ok_or(TaskError::AllocFailure)?;

        let stack_frames_cnt = (stack_size + FRAME_SIZE - 1) / FRAME_SIZE;
        let stack_size = stack_frames_cnt * FRAME_SIZE;
        let stack_frames = frame_allocator::allocate_frames(stack_frames_cnt, FrameKind::Used)
            .map_err(|_| TaskError::AllocFailure)?;

        let heap_frames_cnt = (heap_size + FRAME_SIZE - 1) / FRAME_SIZE;
        let heap_size = heap_frames_cnt * FRAME_SIZE;
        let heap_frames = match frame_allocator::allocate_frames(heap_frames_cnt, FrameKind::Used)
        {
            Ok(frames) => frames,
            Err(_) => {
                frame_allocator::release_frames(&stack_frames);
                return Err(TaskError::AllocFailure);
            }
        };

        let stack_va = phys_to_virt(stack_frames.start_address());
        let heap_va = phys_to_virt(heap_frames.start_address());

        let unwind = |mapped_stack: u64, mapped_heap: u64| {
            for i in 0..mapped_stack {
                let _ = space.unmap(stack_va + i * FRAME_SIZE);
            }
            for i in 0..mapped_heap {
                let _ = space.unmap(heap_va + i * FRAME_SIZE);
            }
            frame_allocator::release_frames(&stack_frames);
            frame_allocator::release_frames(&heap_frames);
        };

        for (i, pa) in stack_frames.frames().enumerate() {
            if space
                .map_to(
                    stack_va + i as u64 * FRAME_SIZE,
                    pa,
                    MapSize::Size4KiB,
                    PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE,
                )
                .is_err()
            {
                unwind(i as u64, 0);
                return Err(TaskError::AllocFailure);
            }
        }

        for (i, pa) in heap_frames.frames().enumerate() {
            if space
                .map_to(
                    heap_va + i as u64 * FRAME_SIZE,
                    pa,
                    MapSize::Size4KiB,
                    PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE,
                )
                .is_err()
            {
                unwind(stack_frames_cnt, i as u64);
                return Err(TaskError::AllocFailure);
            }
        }

        unsafe {
            core::ptr::write_bytes(stack_va.as_mut_ptr::<u8>(), 0, stack_size as usize);
        }

        let heap = Arc::new(unsafe { TaskHeap::new(heap_va, heap_size) });

        let io_layout = Layout::from_size_align(0x1000, 16).unwrap();
        let mut io_bufs = Vec::new();
        for _ in 0..3 {
            match heap.allocate(io_layout) {
                Some(va) => io_bufs.push(unsafe { IoBuffer::from_raw(va, io_layout.size()) }),
                None => {
                    unwind(stack_frames_cnt, heap_frames_cnt);
                    return Err(TaskError::AllocFailure);
                }
            }
        }
        let error = io_bufs.pop().unwrap();
        let output = io_bufs.pop().unwrap();
        let input = io_bufs.pop().unwrap();

        let id = allocate_task_id();

        let fx = Box::new(FxArea::primed(self.mxcsr_mask));
        let mut context = TaskContext::zeroed(fx.as_ref());

        // Start trampoline: the first switch-in pops EOI, STI, the entry
        // point, and finally the exit path once the entry returns.
        let rbp = stack_va.as_u64() + stack_size - 16;
        unsafe {
            let top = rbp as *mut u64;
            top.offset(-1).write(task_exit_thunk as u64);
            top.offset(-2).write(entry_point as u64);
            top.offset(-3).write(sti_thunk as u64);
            top.offset(-4).write(crate::apic::eoi_thunk as u64);
        }
        context.rbp = rbp;
        context.rsp = rbp - 32;
        context.rdi = arg;

        let task = Task {
            id,
            name: String::from(name),
            state: TaskState::Created,
            wait: TaskWait::None,
            interruptible: false,
            interrupt_received: false,
            context,
            fx,
            stack: Some(OwnedRegion {
                va: stack_va,
                size: stack_size,
                frames: stack_frames,
            }),
            heap_region: Some(OwnedRegion {
                va: heap_va,
                size: heap_size,
                frames: heap_frames,
            }),
            heap: Some(heap),
            page_table: space.root(),
            message_queues: Vec::new(),
            vmcs_phys: None,
            stdio: Stdio {
                input,
                output,
                error,
            },
            last_tick_count: 0,
            task_switch_count: 0,
        };

        log::info!(
            "task {} '{}' created: stack {:#x}+{:#x}, heap {:#x}+{:#x}",
            id,
            name,
            stack_va.as_u64(),
            stack_size,
            heap_va.as_u64(),
            heap_size
        );

        self.tasks.insert(id, Arc::new(Mutex::new(task)));
        self.ready.push_back(id);

        Ok(id)
    }

    /// Install a dedicated HLT-loop idle task for a CPU. Until this runs
    /// the idle slot points at the kernel task.
    pub fn create_idle_task(&mut self, apic_id: usize) -> Result<TaskId, TaskError> {
        let id = self.create_task(0x4000, 0x1000, idle_task_entry, 0, "idle")?;

        // The idle task is a fallback, not a queue citizen.
        self.ready.retain(|&t| t != id);
        self.idle[apic_id] = id;
        Ok(id)
    }

    /// Mark a task ended. `force` additionally cleans an already-ended
    /// task immediately instead of waiting for a scheduler pass.
    pub fn kill_task(&mut self, id: TaskId, force: bool) -> Result<(), TaskError> {
        let entry = self.tasks.get(&id).cloned().ok_or(TaskError::NotFound)?;

        {
            let mut task = entry.lock();
            if task.state == TaskState::Ended {
                drop(task);
                drop(entry);
                if force {
                    self.ready.retain(|&t| t != id);
                    self.cleaner.push(id);
                    self.drain_cleaner();
                }
                return Ok(());
            }

            task.wait = TaskWait::None;
            task.interruptible = false;
            task.state = TaskState::Ended;
        }

        log::info!("task {:#x} will be ended", id);
        Ok(())
    }
}

/// Release an ended task's mapped regions and frames, exactly once.
fn cleanup_task(task: Task) {
    let space = AddressSpace::from_root(task.page_table);

    for region in [task.stack.as_ref(), task.heap_region.as_ref()]
        .into_iter()
        .flatten()
    {
        unsafe {
            core::ptr::write_bytes(region.va.as_mut_ptr::<u8>(), 0, region.size as usize);
        }

        for i in 0..region.frames.count {
            if space.unmap(region.va + i * FRAME_SIZE).is_err() {
                log::error!(
                    "cannot unmap task region at {:#x}; halting",
                    (region.va + i * FRAME_SIZE).as_u64()
                );
                crate::halt();
            }
        }

        frame_allocator::release_frames(&region.frames);
    }
}

fn kernel_address_space() -> Option<AddressSpace> {
    paging::kernel_space().or_else(paging::active_space)
}

extern "C" fn idle_task_entry(_arg: u64) {
    loop {
        #[cfg(all(target_arch = "x86_64", not(test)))]
        x86_64::instructions::hlt();
        #[cfg(any(not(target_arch = "x86_64"), test))]
        core::hint::spin_loop();
    }
}

/// Return-path of a task whose entry point returned, and the body of
/// `end_task`: mark ended and give the CPU away.
pub extern "C" fn task_exit_thunk() {
    super::end_task();
    loop {
        core::hint::spin_loop();
    }
}

pub extern "C" fn sti_thunk() {
    #[cfg(all(target_arch = "x86_64", not(test)))]
    x86_64::instructions::interrupts::enable();
}

// ---------------------------------------------------------------------------
// Global scheduler instance
// ---------------------------------------------------------------------------

static SCHEDULER: Mutex<Option<Scheduler>> = Mutex::new(None);

fn irq_free<R>(f: impl FnOnce() -> R) -> R {
    #[cfg(all(target_arch = "x86_64", not(test)))]
    {
        x86_64::instructions::interrupts::without_interrupts(f)
    }
    #[cfg(any(not(target_arch = "x86_64"), test))]
    {
        f()
    }
}

/// Run `f` against the scheduler with interrupts held off.
pub fn with_scheduler<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&mut Scheduler) -> R,
{
    irq_free(|| SCHEDULER.lock().as_mut().map(f))
}

/// Bring the tasking system up on the boot CPU: interrupt stacks for the
/// TSS, the kernel task, and the per-CPU slots.
pub fn init_tasking(cpu_count: u32) {
    let kernel_root = kernel_address_space()
        .map(|s| s.root())
        .unwrap_or(PhysAddr::new(0));

    // Interrupt stack block: one run of stacks handed to the TSS.
    match frame_allocator::allocate_frames(
        IST_STACK_SIZE / FRAME_SIZE * IST_STACK_COUNT,
        FrameKind::Reserved,
    ) {
        Ok(block) => {
            let bottom = phys_to_virt(block.start_address());
            let mut mapped = true;
            if let Some(space) = kernel_address_space() {
                for (i, pa) in block.frames().enumerate() {
                    if space
                        .map_to(
                            bottom + i as u64 * FRAME_SIZE,
                            pa,
                            MapSize::Size4KiB,
                            PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE,
                        )
                        .is_err()
                    {
                        mapped = false;
                        break;
                    }
                }
            }
            if mapped {
                #[cfg(target_arch = "x86_64")]
                crate::gdt::set_interrupt_stacks(bottom, IST_STACK_SIZE, 7);
            } else {
                log::error!("cannot map interrupt stacks");
            }
        }
        Err(_) => log::error!("cannot allocate interrupt stacks"),
    }

    let mxcsr_mask = super::context::read_mxcsr_mask();
    log::info!("mxcsr mask {:#x}", mxcsr_mask);

    let boot_cpu = crate::apic::local_id() as usize;
    let scheduler = Scheduler::new(cpu_count as usize, boot_cpu, kernel_root, mxcsr_mask);

    irq_free(|| {
        *SCHEDULER.lock() = Some(scheduler);
    });

    log::info!(
        "tasking initialized: {} cpu(s), boot cpu {}",
        cpu_count,
        boot_cpu
    );
}

/// The full switch: bookkeeping under the lock, register swap outside
/// it, then exit prep in whichever task ends up running here.
pub fn switch_task() {
    let apic_id = crate::apic::local_id() as usize;
    let now = timer::tick_count();

    let plan = with_scheduler(|s| s.plan_switch(apic_id, now)).flatten();

    if let Some(plan) = plan {
        unsafe {
            if let Some(pa) = plan.prev_vmcs {
                if vmclear(pa).is_err() {
                    log::error!("vmclear failed for task {:#x}", plan.prev_id);
                    return;
                }
            }
            if let Some(pa) = plan.next_vmcs {
                if vmptrld(pa).is_err() {
                    log::error!("vmptrld failed for task {:#x}", plan.next_id);
                }
            }

            // The plan's pointers stay valid: both tasks are in the map
            // and an ended prev is cleaned only by a later kernel pass.
            switch_context(plan.prev_ctx, plan.next_ctx);
        }
    }

    exit_prep(apic_id);
}

fn exit_prep(apic_id: usize) {
    let (need_eoi, need_sti) =
        with_scheduler(|s| s.take_exit_flags(apic_id)).unwrap_or((false, false));

    if need_eoi {
        crate::apic::eoi();
    }
    if need_sti {
        #[cfg(all(target_arch = "x86_64", not(test)))]
        x86_64::instructions::interrupts::enable();
    }
}

/// Timer-IRQ entry: EOI owed, interrupts re-enabled by iretq.
pub fn preemption_tick() {
    let apic_id = crate::apic::local_id() as usize;
    with_scheduler(|s| s.set_switch_flags(apic_id, true, false));
    switch_task();
}

/// Voluntary yield; skipped when nobody else could run.
pub fn yield_now() {
    let ready = with_scheduler(|s| s.ready_len()).unwrap_or(0);
    if ready == 0 {
        return;
    }

    #[cfg(all(target_arch = "x86_64", not(test)))]
    x86_64::instructions::interrupts::disable();

    let apic_id = crate::apic::local_id() as usize;
    with_scheduler(|s| s.set_switch_flags(apic_id, false, true));
    switch_task();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::test_support;
    use crate::memory::MemoryError;
    use crate::task::MessageQueue;

    extern "C" fn test_entry(_arg: u64) {}

    fn boot() -> (test_support::TestEnv, Scheduler) {
        let env = test_support::setup();
        let space =
            paging::build_kernel_space(&test_support::synthetic_layout()).unwrap();
        let scheduler = Scheduler::new(1, 0, space.root(), 0xFFBF);
        (env, scheduler)
    }

    fn task_state(s: &Scheduler, id: TaskId) -> TaskState {
        s.task(id).unwrap().lock().state
    }

    #[test]
    fn boot_state_has_kernel_task_current() {
        let (_env, s) = boot();

        assert_eq!(s.task_count(), 1);
        assert_eq!(s.current_id(0), Some(KERNEL_TASK_ID));
        assert_eq!(s.ready_len(), 0);

        let kernel = s.task(KERNEL_TASK_ID).unwrap();
        let kernel = kernel.lock();
        assert_eq!(kernel.name, "kernel");
        assert_eq!(kernel.task_switch_count, 0);
    }

    #[test]
    fn created_task_is_selected_after_one_switch() {
        let (_env, mut s) = boot();

        let id = s
            .create_task(0x10000, 0x4000, test_entry, 0, "t1")
            .unwrap();
        assert_eq!(s.ready_len(), 1);

        let plan = s.plan_switch(0, 0).expect("switch expected");
        assert_eq!(plan.prev_id, KERNEL_TASK_ID);
        assert_eq!(plan.next_id, id);
        assert_eq!(s.current_id(0), Some(id));
        assert_eq!(task_state(&s, id), TaskState::Running);
        assert_eq!(task_state(&s, KERNEL_TASK_ID), TaskState::Suspended);
        assert_eq!(s.task(id).unwrap().lock().task_switch_count, 1);
    }

    #[test]
    fn selection_order_matches_insertion_order() {
        let (_env, mut s) = boot();

        let t1 = s.create_task(0x10000, 0x4000, test_entry, 0, "t1").unwrap();
        let t2 = s.create_task(0x10000, 0x4000, test_entry, 0, "t2").unwrap();
        let t3 = s.create_task(0x10000, 0x4000, test_entry, 0, "t3").unwrap();

        let mut order = alloc::vec::Vec::new();
        for _ in 0..3 {
            let plan = s.plan_switch(0, 0).unwrap();
            order.push(plan.next_id);
        }

        assert_eq!(order, alloc::vec![t1, t2, t3]);
    }

    #[test]
    fn future_wait_blocks_selection_until_cleared() {
        let (_env, mut s) = boot();

        let t1 = s.create_task(0x10000, 0x4000, test_entry, 0, "t1").unwrap();
        let t2 = s.create_task(0x10000, 0x4000, test_entry, 0, "t2").unwrap();

        s.task(t1).unwrap().lock().wait = TaskWait::Future;

        assert_eq!(s.find_next_task(0, 0), t2);
        // Still parked, only the idle fallback remains.
        assert_eq!(s.find_next_task(0, 0), KERNEL_TASK_ID);

        s.task(t1).unwrap().lock().wait = TaskWait::None;
        assert_eq!(s.find_next_task(0, 0), t1);
    }

    #[test]
    fn sleeper_wakes_strictly_after_its_tick() {
        let (_env, mut s) = boot();

        let t1 = s.create_task(0x10000, 0x4000, test_entry, 0, "t1").unwrap();
        s.task(t1).unwrap().lock().wait = TaskWait::Sleep { wake_tick: 100 };

        assert_eq!(s.find_next_task(0, 99), KERNEL_TASK_ID);
        assert_eq!(s.find_next_task(0, 100), KERNEL_TASK_ID);
        assert_eq!(s.find_next_task(0, 101), t1);
        assert_eq!(s.task(t1).unwrap().lock().wait, TaskWait::None);
    }

    #[test]
    fn message_wait_clears_on_pending_message_or_interrupt() {
        let (_env, mut s) = boot();

        let t1 = s.create_task(0x10000, 0x4000, test_entry, 0, "t1").unwrap();
        let queue = Arc::new(MessageQueue::new());
        {
            let entry = s.task(t1).unwrap();
            let mut task = entry.lock();
            task.message_queues.push(queue.clone());
            task.wait = TaskWait::Messages;
        }

        assert_eq!(s.find_next_task(0, 0), KERNEL_TASK_ID);

        queue.push(alloc::vec![1, 2, 3]);
        assert_eq!(s.find_next_task(0, 0), t1);
        assert_eq!(s.task(t1).unwrap().lock().wait, TaskWait::None);

        // Interruptible wait broken by a received interrupt.
        let t2 = s.create_task(0x10000, 0x4000, test_entry, 0, "t2").unwrap();
        {
            let entry = s.task(t2).unwrap();
            let mut task = entry.lock();
            task.wait = TaskWait::Messages;
            task.interruptible = true;
            task.interrupt_received = true;
        }
        assert_eq!(s.find_next_task(0, 0), t2);
        let entry = s.task(t2).unwrap();
        let task = entry.lock();
        assert_eq!(task.wait, TaskWait::None);
        assert!(!task.interrupt_received);
    }

    #[test]
    fn killed_task_is_cleaned_on_a_kernel_pass() {
        let (_env, mut s) = boot();

        let t1 = s.create_task(0x10000, 0x4000, test_entry, 0, "t1").unwrap();
        let (stack_va, stack_count, heap_count) = {
            let entry = s.task(t1).unwrap();
            let task = entry.lock();
            let stack = task.stack.as_ref().unwrap();
            let heap = task.heap_region.as_ref().unwrap();
            (stack.va, stack.frames.count, heap.frames.count)
        };

        s.kill_task(t1, false).unwrap();
        assert_eq!(task_state(&s, t1), TaskState::Ended);

        // First kernel pass detours the ended task to the cleaner queue.
        assert!(s.plan_switch(0, 0).is_none());
        assert!(s.task(t1).is_some());

        // Second pass (cleaner now nonempty) reclaims it.
        assert!(s.plan_switch(0, 0).is_none());
        assert!(s.task(t1).is_none());

        let space = paging::kernel_space().unwrap();
        assert_eq!(
            space.translate(stack_va).unwrap_err(),
            MemoryError::NotPresent
        );

        // Stack and heap frames are back in the allocator.
        let reused_stack =
            frame_allocator::allocate_frames(stack_count, FrameKind::Used).unwrap();
        assert_eq!(reused_stack.start_address().as_u64(), stack_va.as_u64());
        assert!(frame_allocator::allocate_frames(heap_count, FrameKind::Used).is_ok());
    }

    #[test]
    fn force_kill_of_ended_task_cleans_immediately() {
        let (_env, mut s) = boot();

        let t1 = s.create_task(0x10000, 0x4000, test_entry, 0, "t1").unwrap();
        s.kill_task(t1, false).unwrap();
        s.kill_task(t1, true).unwrap();
        assert!(s.task(t1).is_none());

        assert_eq!(s.kill_task(t1, false).unwrap_err(), TaskError::NotFound);
    }

    #[test]
    fn quick_accept_keeps_task_within_tick_budget() {
        let (_env, mut s) = boot();

        s.task(KERNEL_TASK_ID).unwrap().lock().last_tick_count = 5;

        assert!(s.plan_switch(0, 6).is_none());
        assert_eq!(s.current_id(0), Some(KERNEL_TASK_ID));
        // Quick accept leaves the ready queue untouched.
        assert_eq!(s.ready_len(), 0);

        // Budget exhausted: the full path runs (and re-selects the only
        // task in the system).
        assert!(s.plan_switch(0, 5 + MAX_TICK_COUNT).is_none());
        assert_eq!(s.current_id(0), Some(KERNEL_TASK_ID));
    }

    #[test]
    fn kernel_task_drains_after_kmain_completes() {
        let (_env, mut s) = boot();
        set_kmain_completed(true);

        let t1 = s.create_task(0x10000, 0x4000, test_entry, 0, "t1").unwrap();
        let plan = s.plan_switch(0, 0).unwrap();
        assert_eq!(plan.next_id, t1);

        // The kernel task was not re-enqueued.
        assert!(!s.ready.contains(&KERNEL_TASK_ID));

        set_kmain_completed(false);
    }

    #[test]
    fn start_trampoline_matches_stack_layout() {
        let (_env, mut s) = boot();

        let t1 = s
            .create_task(0x10000, 0x4000, test_entry, 0x1234, "t1")
            .unwrap();
        let entry = s.task(t1).unwrap();
        let task = entry.lock();
        let stack = task.stack.as_ref().unwrap();

        let rbp = stack.va.as_u64() + stack.size - 16;
        assert_eq!(task.context.rbp, rbp);
        assert_eq!(task.context.rsp, rbp - 32);
        assert_eq!(task.context.rdi, 0x1234);
        assert_eq!(task.context.rflags, 0x202);

        let words = unsafe {
            [
                ((rbp - 8) as *const u64).read(),
                ((rbp - 16) as *const u64).read(),
                ((rbp - 24) as *const u64).read(),
                ((rbp - 32) as *const u64).read(),
            ]
        };
        assert_eq!(words[0], task_exit_thunk as u64);
        assert_eq!(words[1], test_entry as u64);
        assert_eq!(words[2], sti_thunk as u64);
        assert_eq!(words[3], crate::apic::eoi_thunk as u64);

        // FX area primed with the default control word.
        assert_eq!(
            u16::from_le_bytes(task.fx.0[0..2].try_into().unwrap()),
            0x037F
        );
    }

    #[test]
    fn failed_creation_unwinds_partial_allocations() {
        let (_env, mut s) = boot();

        // Predict where the stack block will land.
        let probe = frame_allocator::allocate_frames(1, FrameKind::Used).unwrap();
        let expected_stack = probe.start_address().as_u64() + FRAME_SIZE;

        // Heap request larger than the whole test pool.
        let err = s
            .create_task(1 << 30, 0x4000, test_entry, 0, "doomed")
            .unwrap_err();
        assert_eq!(err, TaskError::AllocFailure);
        assert_eq!(s.task_count(), 1);
        assert_eq!(s.ready_len(), 0);

        // The stack block was released and is reusable.
        let reused = frame_allocator::allocate_frames(4, FrameKind::Used).unwrap();
        assert_eq!(reused.start_address().as_u64(), expected_stack);
    }

    #[test]
    fn idle_task_replaces_kernel_fallback() {
        let (_env, mut s) = boot();

        let idle = s.create_idle_task(0).unwrap();
        assert_eq!(s.ready_len(), 0);
        assert_eq!(s.find_next_task(0, 0), idle);
    }
}
