//! Tasking: task control blocks, the scheduler and the public task API.

pub mod context;
pub mod scheduler;
#[allow(clippy::module_inception)]
mod task;

pub use scheduler::{init_tasking, switch_task, yield_now, MAX_TICK_COUNT};
pub use task::{
    IoBuffer, Message, MessageQueue, Task, TaskId, TaskState, TaskWait, KERNEL_TASK_ID,
};

use alloc::string::String;
use alloc::sync::Arc;
use core::fmt::{self, Write};
use scheduler::with_scheduler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskError {
    AllocFailure,
    NotFound,
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::AllocFailure => write!(f, "allocation failed"),
            TaskError::NotFound => write!(f, "no such task"),
        }
    }
}

/// Create a task and queue it for execution.
pub fn create_task(
    heap_size: u64,
    stack_size: u64,
    entry_point: extern "C" fn(u64),
    arg: u64,
    name: &str,
) -> Result<TaskId, TaskError> {
    with_scheduler(|s| s.create_task(heap_size, stack_size, entry_point, arg, name))
        .unwrap_or(Err(TaskError::AllocFailure))
}

/// Id of the task running on this CPU.
pub fn current_task_id() -> Option<TaskId> {
    let apic_id = crate::apic::local_id() as usize;
    with_scheduler(|s| s.current_id(apic_id)).flatten()
}

fn with_current_task<F>(f: F)
where
    F: FnOnce(&mut Task),
{
    let apic_id = crate::apic::local_id() as usize;
    with_scheduler(|s| {
        if let Some(id) = s.current_id(apic_id) {
            if let Some(entry) = s.task(id) {
                f(&mut entry.lock());
            }
        }
    });
}

fn with_task<F>(id: TaskId, f: F) -> Result<(), TaskError>
where
    F: FnOnce(&mut Task),
{
    with_scheduler(|s| match s.task(id) {
        Some(entry) => {
            f(&mut entry.lock());
            Ok(())
        }
        None => Err(TaskError::NotFound),
    })
    .unwrap_or(Err(TaskError::NotFound))
}

/// End the current task: clear its wait state, mark it ended and give
/// the CPU away. The cleaner reclaims it on a later kernel pass.
pub fn end_task() {
    with_current_task(|task| {
        if let Some(pa) = task.vmcs_phys {
            if unsafe { context::vmclear(pa) }.is_err() {
                log::error!("vmclear failed for task {:#x}", task.id);
            }
        }
        task.wait = TaskWait::None;
        task.interruptible = false;
        task.state = TaskState::Ended;
    });

    yield_now();
}

/// Mark a task ended (reclaimed on the next scheduler pass). With
/// `force`, an already-ended task is cleaned immediately.
pub fn kill_task(id: TaskId, force: bool) -> Result<(), TaskError> {
    with_scheduler(|s| s.kill_task(id, force)).unwrap_or(Err(TaskError::NotFound))
}

/// Put the current task to sleep until the given tick has passed.
pub fn sleep_until(wake_tick: u64) {
    with_current_task(|task| {
        task.wait = TaskWait::Sleep { wake_tick };
    });
    yield_now();
}

/// Attach a message queue to the current task.
pub fn add_message_queue(queue: Arc<MessageQueue>) {
    with_current_task(|task| task.message_queues.push(queue));
}

/// Fetch a task's nth message queue.
pub fn message_queue(id: TaskId, index: usize) -> Option<Arc<MessageQueue>> {
    with_scheduler(|s| {
        s.task(id)
            .and_then(|entry| entry.lock().message_queues.get(index).cloned())
    })
    .flatten()
}

/// Park the current task until one of its queues has a message.
pub fn set_message_waiting() {
    with_current_task(|task| task.wait = TaskWait::Messages);
}

pub fn clear_message_waiting(id: TaskId) {
    if with_task(id, |task| {
        if task.wait == TaskWait::Messages {
            task.wait = TaskWait::None;
        }
    })
    .is_err()
    {
        log::error!("task not found {:#x}", id);
    }
}

/// Allow interrupts to cut this task's message wait short.
pub fn set_interruptible() {
    with_current_task(|task| task.interruptible = true);
}

pub fn set_interrupt_received(id: TaskId) {
    if with_task(id, |task| task.interrupt_received = true).is_err() {
        log::error!("task not found {:#x}", id);
    }
}

/// Park a task on a pending future.
pub fn set_wait_for_future(id: TaskId) {
    if id == KERNEL_TASK_ID {
        return;
    }
    let _ = with_task(id, |task| task.wait = TaskWait::Future);
}

/// Unpark a task whose future resolved.
pub fn clear_wait_for_future(id: TaskId) {
    if id == KERNEL_TASK_ID {
        return;
    }
    let _ = with_task(id, |task| {
        if task.wait == TaskWait::Future {
            task.wait = TaskWait::None;
        }
    });
}

/// Bind a VMCS to the current task (hypervisor hosts only).
pub fn set_vmcs_physical_address(pa: u64) {
    with_current_task(|task| task.vmcs_phys = Some(pa));
}

/// Append to the current task's output stream; returns bytes accepted.
pub fn stdio_write_output(data: &[u8]) -> usize {
    let mut written = 0;
    with_current_task(|task| written = task.stdio.output.write(data));
    written
}

/// Drain the current task's input stream into `buf`.
pub fn stdio_read_input(buf: &mut [u8]) -> usize {
    let mut read = 0;
    with_current_task(|task| read = task.stdio.input.drain(buf));
    read
}

/// Feed a task's input stream (console/IPC producers).
pub fn stdio_feed_input(id: TaskId, data: &[u8]) -> Result<usize, TaskError> {
    let mut written = 0;
    with_task(id, |task| written = task.stdio.input.write(data))?;
    Ok(written)
}

/// One line per live task: accounting, wait state, resources.
pub fn tasks_report() -> String {
    let mut out = String::new();

    with_scheduler(|s| {
        for id in s.task_ids() {
            if let Some(entry) = s.task(id) {
                let task = entry.lock();
                let _ = writeln!(
                    out,
                    "task {} '{}' state {:?} wait {:?} switched {} stack {:#x} heap {:#x}",
                    task.id,
                    task.name,
                    task.state,
                    task.wait,
                    task.task_switch_count,
                    task.stack.as_ref().map(|r| r.va.as_u64()).unwrap_or(0),
                    task.heap_region.as_ref().map(|r| r.va.as_u64()).unwrap_or(0),
                );
            }
        }
    });

    out
}
