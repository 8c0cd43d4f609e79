//! One-shot completion lock and the future that wraps it.
//!
//! The submit side creates the lock in the locked state and hands out a
//! [`CommandFuture`]; the interrupt handler releases the lock exactly once
//! when the matching completion arrives. No general async runtime is
//! involved: the future is pollable (it carries an `AtomicWaker`) and also
//! blockingly awaitable from a task context.

use alloc::sync::Arc;
use core::future::Future;
use core::pin::Pin;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use core::task::{Context, Poll};
use futures_util::task::AtomicWaker;

/// A lock born held. `release` flips it exactly once; later calls are
/// ignored and reported to the caller.
#[derive(Debug)]
pub struct CompletionLock {
    released: AtomicBool,
    waker: AtomicWaker,
    /// Task id parked on this lock (0 = nobody / kernel task).
    waiting_task: AtomicU64,
}

impl CompletionLock {
    pub fn new_locked() -> Arc<Self> {
        Arc::new(Self {
            released: AtomicBool::new(false),
            waker: AtomicWaker::new(),
            waiting_task: AtomicU64::new(0),
        })
    }

    /// Release the lock, waking any poller and unparking any blocked task.
    /// Returns false if the lock had already been released.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }

        self.waker.wake();

        let tid = self.waiting_task.swap(0, Ordering::AcqRel);
        if tid != 0 {
            crate::task::clear_wait_for_future(tid);
        }

        true
    }

    #[inline]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    fn park_current(&self) {
        if let Some(tid) = crate::task::current_task_id() {
            if tid != crate::task::KERNEL_TASK_ID {
                self.waiting_task.store(tid, Ordering::Release);
                // Somebody may have released between the check and the
                // store; re-check before actually parking.
                if self.is_released() {
                    self.waiting_task.store(0, Ordering::Release);
                    return;
                }
                crate::task::set_wait_for_future(tid);
            }
        }
    }
}

/// Future resolved exactly once by a completion interrupt.
#[derive(Debug)]
pub struct CommandFuture {
    lock: Arc<CompletionLock>,
}

impl CommandFuture {
    pub fn new(lock: Arc<CompletionLock>) -> Self {
        Self { lock }
    }

    /// Block until the command completes.
    ///
    /// From a task this parks the task in the future-wait state so the
    /// scheduler skips it until the interrupt handler unparks it; before
    /// tasking is live it degrades to a yield-spin.
    pub fn wait(self) {
        if self.lock.is_released() {
            return;
        }

        self.lock.park_current();

        while !self.lock.is_released() {
            crate::task::yield_now();
            core::hint::spin_loop();
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.lock.is_released()
    }
}

impl Future for CommandFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.lock.is_released() {
            return Poll::Ready(());
        }

        self.lock.waker.register(cx.waker());

        if self.lock.is_released() {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_resolves_exactly_once() {
        let lock = CompletionLock::new_locked();
        let fut = CommandFuture::new(lock.clone());

        assert!(!fut.is_resolved());
        assert!(lock.release());
        assert!(fut.is_resolved());

        // Second release is rejected.
        assert!(!lock.release());
    }

    #[test]
    fn wait_returns_after_release() {
        let lock = CompletionLock::new_locked();
        let fut = CommandFuture::new(lock.clone());
        lock.release();
        fut.wait();
    }

    #[test]
    fn two_locks_resolve_independently() {
        let a = CompletionLock::new_locked();
        let b = CompletionLock::new_locked();
        let fa = CommandFuture::new(a.clone());
        let fb = CommandFuture::new(b.clone());

        a.release();
        assert!(fa.is_resolved());
        assert!(!fb.is_resolved());

        b.release();
        assert!(fb.is_resolved());
    }
}
