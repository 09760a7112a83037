//! A wait primitive: a FIFO of blocked tasks plus an event counter that
//! absorbs wake-ups racing ahead of any waiter.
use core::ptr;
use core::sync::atomic::{AtomicU16, Ordering};

use crate::task::Task;

/// Hard limit on outstanding, un-consumed signals. Saturating past this
/// is reported as [`crate::Error::ENoData`] rather than silently wrapping;
/// see the saturation-strategy decision in `DESIGN.md`.
pub const MAX_EVENTS: u16 = 0xFFFF;

/// A FIFO of tasks blocked on a condition, plus a saturating counter of
/// signals that arrived before any task was waiting.
///
/// Invariant: `last.is_null()` iff there is no waiter; `nrevent > 0`
/// permits that many future `wait`s to return immediately without
/// blocking.
pub struct WaitQueue {
    nrevent: AtomicU16,
    /// Tail of the circular FIFO threaded through `Task::next`; `None`
    /// when empty.
    last: *mut Task,
}

// SAFETY: all mutation of `last` happens under the scheduler's own
// single-writer discipline (scheduler-interrupt priority); `nrevent` is a
// real atomic.
unsafe impl Send for WaitQueue {}
unsafe impl Sync for WaitQueue {}

impl WaitQueue {
    pub const fn new() -> Self {
        WaitQueue {
            nrevent: AtomicU16::new(0),
            last: ptr::null_mut(),
        }
    }

    pub fn has_waiter(&self) -> bool {
        !self.last.is_null()
    }

    pub fn event_count(&self) -> u16 {
        self.nrevent.load(Ordering::Relaxed)
    }

    /// Detaches the FIFO head (the task right after `last`), clears its
    /// `wait_for` slot, and returns it. Only ever called by the scheduler
    /// while folding a WAITFOR task or draining the wake-up pipeline.
    ///
    /// # Safety
    /// Every task reachable from `last` must be a live `Task` whose
    /// `next` link is exclusively owned by this queue.
    pub unsafe fn pop_front(&mut self) -> Option<*mut Task> {
        if self.last.is_null() {
            return None;
        }
        let last = self.last;
        let first = (*last).next();
        if first == last {
            self.last = ptr::null_mut();
        } else {
            (*last).set_next((*first).next());
        }
        (*first).set_slot(crate::task::Slot::None);
        Some(first)
    }

    /// Appends `task` as the new FIFO tail.
    ///
    /// # Safety
    /// `task` must not already be linked into any FIFO.
    pub unsafe fn push_back(&mut self, task: *mut Task) {
        if self.last.is_null() {
            (*task).set_next(task);
        } else {
            let first = (*self.last).next();
            (*self.last).set_next(task);
            (*task).set_next(first);
        }
        self.last = task;
    }

    /// Records a signal with nobody waiting: increments the event counter,
    /// saturating at [`MAX_EVENTS`]. Returns `Err` if it was already
    /// saturated, per the saturation strategy decided in `DESIGN.md`.
    pub fn record_event(&self) -> crate::Result<()> {
        let mut old = self.nrevent.load(Ordering::Relaxed);
        loop {
            if old == MAX_EVENTS {
                return Err(crate::Error::ENoData);
            }
            match self.nrevent.compare_exchange_weak(
                old,
                old + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(cur) => old = cur,
            }
        }
    }

    /// Consumes one outstanding event, if any. Used when a task enters
    /// WAITFOR and finds the counter already positive.
    pub fn consume_event(&self) -> bool {
        let mut old = self.nrevent.load(Ordering::Relaxed);
        loop {
            if old == 0 {
                return false;
            }
            match self.nrevent.compare_exchange_weak(
                old,
                old - 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(cur) => old = cur,
            }
        }
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}
