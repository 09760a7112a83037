//! Bounded single-producer / single-consumer rings used to hand a wake-up
//! from a task-context producer to the scheduler without a lock.
//!
//! Two concrete rings exist: [`ResumeRing`] (carries task pointers, used
//! by `resume_qd_task`) and [`WakeupRing`] (carries wait-primitive
//! pointers, used by `wakeup_qd_task`). Both follow the same shape as the
//! source's `task_queue_t`/`task_wakeup_t`: an 8-bit head/tail pair, a
//! `keep` TTL that holds the ring on the scheduler's active list for a
//! few extra rounds after it drains (so a producer that immediately
//! refills it doesn't pay list-unlink/relink costs every round), and an
//! intrusive `next` link so the scheduler can walk all active rings
//! without a separate allocation.
use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

/// Ring capacity; must be a power of two so index wraparound is a mask.
pub const RING_CAPACITY: usize = 8;
const RING_MASK: u8 = (RING_CAPACITY - 1) as u8;

/// Number of scheduling rounds a drained ring is kept on the active list
/// before being unlinked.
const KEEP_ROUNDS: u8 = 3;

macro_rules! define_ring {
    ($name:ident, $payload:ty) => {
        pub struct $name {
            buf: [UnsafeCell<*mut $payload>; RING_CAPACITY],
            /// Consumer-owned read index.
            head: AtomicU8,
            /// Producer-owned write index.
            tail: AtomicU8,
            keep: AtomicU8,
            next: AtomicPtr<$name>,
        }

        // SAFETY: exactly one producer and one consumer access `buf`, each
        // through its own half of the head/tail protocol; `head`/`tail`
        // themselves are real atomics with acquire/release ordering.
        unsafe impl Sync for $name {}

        impl $name {
            pub const fn new() -> Self {
                const NULL: UnsafeCell<*mut $payload> = UnsafeCell::new(ptr::null_mut());
                $name {
                    buf: [NULL; RING_CAPACITY],
                    head: AtomicU8::new(0),
                    tail: AtomicU8::new(0),
                    keep: AtomicU8::new(0),
                    next: AtomicPtr::new(ptr::null_mut()),
                }
            }

            /// Producer side: pushes `value`. Returns `Err(EBusy)` if the
            /// ring is full; the caller (a task, never an interrupt that
            /// cannot yield) is expected to `yield_task` and retry.
            pub fn write(&self, value: *mut $payload) -> crate::Result<()> {
                let tail = self.tail.load(Ordering::Relaxed);
                let next_tail = tail.wrapping_add(1) & RING_MASK;
                if next_tail == self.head.load(Ordering::Acquire) & RING_MASK {
                    return Err(crate::Error::EBusy);
                }
                // SAFETY: single producer owns this slot until `tail` is published.
                unsafe {
                    *self.buf[(tail & RING_MASK) as usize].get() = value;
                }
                self.tail.store(tail.wrapping_add(1), Ordering::Release);
                Ok(())
            }

            /// Consumer side: pops the oldest entry, if any.
            fn read(&self) -> Option<*mut $payload> {
                let head = self.head.load(Ordering::Relaxed);
                if head == self.tail.load(Ordering::Acquire) {
                    return None;
                }
                // SAFETY: single consumer; slot was published by `write`'s release store.
                let value = unsafe { *self.buf[(head & RING_MASK) as usize].get() };
                self.head.store(head.wrapping_add(1), Ordering::Release);
                Some(value)
            }

            /// Drains every entry currently in the ring, calling `f` for
            /// each. Returns whether anything was drained.
            pub fn drain(&self, mut f: impl FnMut(*mut $payload)) -> bool {
                let mut drained = false;
                while let Some(v) = self.read() {
                    f(v);
                    drained = true;
                }
                drained
            }

            pub fn keep(&self) -> u8 {
                self.keep.load(Ordering::Relaxed)
            }

            pub fn set_keep(&self, v: u8) {
                self.keep.store(v, Ordering::Relaxed);
            }

            pub fn decrement_keep(&self) -> u8 {
                let k = self.keep.load(Ordering::Relaxed);
                if k > 1 {
                    self.keep.store(k - 1, Ordering::Relaxed);
                    k - 1
                } else {
                    self.keep.store(0, Ordering::Relaxed);
                    0
                }
            }

            pub fn next(&self) -> *mut Self {
                self.next.load(Ordering::Relaxed)
            }

            pub fn set_next(&self, next: *mut Self) {
                self.next.store(next, Ordering::Relaxed);
            }

            /// If this ring was empty (`keep == 0`) before `write`, links
            /// it onto `list_head` (a CAS-push, matching the source's
            /// `swap_atomic` loop over `s_queue_last`/`s_wakeup_last`) so
            /// the scheduler discovers it on the next drain.
            pub fn link_if_newly_active(&self, list_head: &AtomicPtr<Self>) {
                if self.keep() == 0 {
                    self.set_keep(KEEP_ROUNDS);
                    let self_ptr = self as *const Self as *mut Self;
                    loop {
                        let old = list_head.load(Ordering::Relaxed);
                        self.set_next(old);
                        if list_head
                            .compare_exchange_weak(
                                old,
                                self_ptr,
                                Ordering::AcqRel,
                                Ordering::Relaxed,
                            )
                            .is_ok()
                        {
                            break;
                        }
                    }
                }
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }
    };
}

define_ring!(ResumeRing, crate::task::Task);
define_ring!(WakeupRing, crate::wait::WaitQueue);

/// Walks the intrusive active-ring list headed by `list_head`, draining
/// each ring via `on_entry`, aging its `keep` TTL, and unlinking any ring
/// whose TTL has just expired. Mirrors `process_queuelist`/
/// `process_wakeuplist` in the source scheduler.
pub fn drain_list<T, R>(list_head: &AtomicPtr<R>, mut on_entry: impl FnMut(*mut T))
where
    R: RingOps<T>,
{
    let head = list_head.load(Ordering::Acquire);
    if head.is_null() {
        return;
    }
    // SAFETY: every node on the list was linked by `link_if_newly_active`
    // and stays live until unlinked here; the scheduler is the sole walker.
    let head_ref = unsafe { &*head };

    // The head ages and retires the same as every other node, but it has
    // no `prev` node to rewrite: unlinking it means swinging `list_head`
    // itself, via a CAS so a concurrent `link_if_newly_active` prepending a
    // fresh head is never silently overwritten.
    let head_still_alive = if head_ref.keep_ops() > 1 {
        head_ref.decrement_keep_ops();
        true
    } else {
        head_ref.set_keep_ops(0);
        false
    };
    let head_drained = head_ref.drain_ops(&mut on_entry);
    if head_still_alive && head_drained {
        head_ref.set_keep_ops(KEEP_ROUNDS);
    }
    if !head_still_alive {
        // Best-effort: a lost race just means this head is retried on the
        // next drain, the same as any other node that loses its unlink race.
        let _ = list_head.compare_exchange(
            head,
            head_ref.next_ops(),
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }

    let mut prev = head;
    let mut cur = head_ref.next_ops();
    while !cur.is_null() {
        let cur_ref = unsafe { &*cur };
        let next = cur_ref.next_ops();

        let still_alive = if cur_ref.keep_ops() > 1 {
            cur_ref.decrement_keep_ops();
            prev = cur;
            true
        } else {
            // SAFETY: `prev` remains on the list (we hold the only cursor).
            unsafe { (*prev).set_next_ops(next) };
            cur_ref.set_keep_ops(0);
            false
        };

        let drained = cur_ref.drain_ops(&mut on_entry);
        if still_alive && drained {
            cur_ref.set_keep_ops(KEEP_ROUNDS);
        }

        cur = next;
    }
}

/// Adapter trait letting [`drain_list`] walk either concrete ring type
/// without duplicating the list-maintenance loop.
pub trait RingOps<T> {
    fn drain_ops(&self, f: &mut dyn FnMut(*mut T)) -> bool;
    fn keep_ops(&self) -> u8;
    fn set_keep_ops(&self, v: u8);
    fn decrement_keep_ops(&self) -> u8;
    fn next_ops(&self) -> *mut Self;
    /// # Safety: caller must hold exclusive access to `self` (the scheduler
    /// walking its own list single-threadedly).
    unsafe fn set_next_ops(&self, next: *mut Self);
}

impl RingOps<crate::task::Task> for ResumeRing {
    fn drain_ops(&self, f: &mut dyn FnMut(*mut crate::task::Task)) -> bool {
        self.drain(f)
    }
    fn keep_ops(&self) -> u8 {
        self.keep()
    }
    fn set_keep_ops(&self, v: u8) {
        self.set_keep(v)
    }
    fn decrement_keep_ops(&self) -> u8 {
        self.decrement_keep()
    }
    fn next_ops(&self) -> *mut Self {
        self.next()
    }
    unsafe fn set_next_ops(&self, next: *mut Self) {
        self.set_next(next)
    }
}

impl RingOps<crate::wait::WaitQueue> for WakeupRing {
    fn drain_ops(&self, f: &mut dyn FnMut(*mut crate::wait::WaitQueue)) -> bool {
        self.drain(f)
    }
    fn keep_ops(&self) -> u8 {
        self.keep()
    }
    fn set_keep_ops(&self, v: u8) {
        self.set_keep(v)
    }
    fn decrement_keep_ops(&self) -> u8 {
        self.decrement_keep()
    }
    fn next_ops(&self) -> *mut Self {
        self.next()
    }
    unsafe fn set_next_ops(&self, next: *mut Self) {
        self.set_next(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicPtr;

    #[test]
    fn resume_ring_write_read_roundtrip() {
        let ring = ResumeRing::new();
        let mut a = 1u32;
        let mut b = 2u32;
        let pa = (&mut a as *mut u32).cast::<crate::task::Task>();
        let pb = (&mut b as *mut u32).cast::<crate::task::Task>();
        ring.write(pa).unwrap();
        ring.write(pb).unwrap();
        let mut seen = alloc_free_vec();
        ring.drain(|p| seen.push(p));
        assert_eq!(seen.as_slice(), [pa, pb]);
    }

    #[test]
    fn resume_ring_reports_full() {
        let ring = ResumeRing::new();
        for _ in 0..RING_CAPACITY - 1 {
            ring.write(ptr::null_mut()).unwrap();
        }
        assert_eq!(ring.write(ptr::null_mut()), Err(crate::Error::EBusy));
    }

    #[test]
    fn drain_list_ages_and_unlinks_an_idle_head() {
        let ring = ResumeRing::new();
        let head: AtomicPtr<ResumeRing> = AtomicPtr::new(ptr::null_mut());
        let mut dummy = 7u32;
        let p = (&mut dummy as *mut u32).cast::<crate::task::Task>();
        ring.write(p).unwrap();
        ring.link_if_newly_active(&head);
        assert_eq!(ring.keep(), KEEP_ROUNDS);

        // First drain consumes the one entry; keep refreshes because
        // something was drained this round.
        drain_list(&head, |_: *mut crate::task::Task| {});
        assert_eq!(ring.keep(), KEEP_ROUNDS);
        assert_eq!(head.load(Ordering::Relaxed), &ring as *const _ as *mut _);

        // With nothing left to drain, keep only counts down; once it hits
        // zero the head must be unlinked from `list_head`, not left stuck.
        for _ in 0..KEEP_ROUNDS {
            drain_list(&head, |_: *mut crate::task::Task| {});
        }
        assert!(head.load(Ordering::Relaxed).is_null());
    }

    #[test]
    fn link_if_newly_active_pushes_once() {
        let ring = ResumeRing::new();
        let head: AtomicPtr<ResumeRing> = AtomicPtr::new(ptr::null_mut());
        ring.link_if_newly_active(&head);
        assert_eq!(head.load(Ordering::Relaxed), &ring as *const _ as *mut _);
        // A second call while still active must not re-push or corrupt `next`.
        ring.link_if_newly_active(&head);
        assert!(ring.next().is_null());
    }

    // Tiny heapless helper so these unit tests don't need `alloc`.
    fn alloc_free_vec() -> heapless_vec::Vec {
        heapless_vec::Vec::new()
    }

    mod heapless_vec {
        pub struct Vec {
            buf: [*mut crate::task::Task; 4],
            len: usize,
        }
        impl Vec {
            pub fn new() -> Self {
                Vec {
                    buf: [core::ptr::null_mut(); 4],
                    len: 0,
                }
            }
            pub fn push(&mut self, v: *mut crate::task::Task) {
                self.buf[self.len] = v;
                self.len += 1;
            }
            pub fn as_slice(&self) -> &[*mut crate::task::Task] {
                &self.buf[..self.len]
            }
        }
    }
}
