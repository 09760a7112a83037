//! A counting semaphore layered on [`crate::wait::WaitQueue`].
//!
//! The sign convention avoids a separate waiter counter: a positive value
//! is the number of outstanding permits, a negative value is (the
//! negation of) the number of tasks currently waiting.
use core::sync::atomic::{AtomicU32, Ordering};

use crate::ports::Port;
use crate::scheduler::Scheduler;
use crate::task::Task;
use crate::wait::WaitQueue;

pub struct Semaphore {
    value: AtomicU32,
    wait: WaitQueue,
}

impl Semaphore {
    pub const fn new(initial: i32) -> Self {
        Semaphore {
            value: AtomicU32::new(initial as u32),
            wait: WaitQueue::new(),
        }
    }

    pub fn value(&self) -> i32 {
        self.value.load(Ordering::Relaxed) as i32
    }

    /// Atomic increment; wakes a waiter through the fast (bitmap) path if
    /// the post-increment value is `<= 0`.
    pub fn signal<P: Port>(&self, sched: &mut Scheduler<P>) {
        let new = self.value.fetch_add(1, Ordering::AcqRel).wrapping_add(1) as i32;
        if new <= 0 {
            sched.wakeup_wait_queue(&self.wait);
        }
    }

    /// Same as [`Semaphore::signal`] but posts through the deferred ring,
    /// for callers (typically interrupts) that cannot take the fast path
    /// safely.
    pub fn signal_qd<P: Port>(&self, sched: &mut Scheduler<P>) -> crate::Result<()> {
        let new = self.value.fetch_add(1, Ordering::AcqRel).wrapping_add(1) as i32;
        if new <= 0 {
            sched.wakeup_qd_wait_queue(&self.wait)?;
        }
        Ok(())
    }

    /// Atomic decrement; blocks the calling task if the post-decrement
    /// value is negative.
    pub fn wait<P: Port>(&self, sched: &mut Scheduler<P>, current: &mut Task) {
        let new = self.value.fetch_sub(1, Ordering::AcqRel).wrapping_sub(1) as i32;
        if new < 0 {
            sched.wait_task(current, &self.wait);
        }
    }

    /// Non-blocking variant: succeeds only if a permit was immediately
    /// available, leaving the value unmodified otherwise.
    pub fn try_wait(&self) -> crate::Result<()> {
        let mut old = self.value.load(Ordering::Relaxed) as i32;
        loop {
            if old <= 0 {
                return Err(crate::Error::EAgain);
            }
            let new = (old - 1) as u32;
            match self.value.compare_exchange_weak(
                old as u32,
                new,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(cur) => old = cur as i32,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_wait_respects_value() {
        let sem = Semaphore::new(1);
        assert!(sem.try_wait().is_ok());
        assert_eq!(sem.try_wait(), Err(crate::Error::EAgain));
    }

    #[test]
    fn initial_value_roundtrips() {
        let sem = Semaphore::new(3);
        assert_eq!(sem.value(), 3);
    }

    #[test]
    fn wait_blocks_and_signal_wakes() {
        use crate::ports::mock::MockPort;
        use crate::task::init_task;

        extern "C" fn dummy(_arg: usize) {}

        let mut sched = Scheduler::new(MockPort::new());
        let mut main = Task::new();
        init_task(&mut main, 0, dummy, 0).unwrap();
        let mut idle_task = Task::new();
        init_task(&mut idle_task, 7, dummy, 0).unwrap();

        let main_ptr = &mut main as *mut Task;
        let mut tasks = [main_ptr, &mut idle_task as *mut Task];
        sched.init(&mut tasks, main_ptr).unwrap();

        let sem = Semaphore::new(0);
        // `main` blocks; the lower-priority task keeps the scheduler from
        // idling forever with nothing runnable.
        sem.wait(&mut sched, &mut main);
        assert_eq!(sem.value(), -1);
        assert_eq!(main.state(), crate::task::State::WaitFor);

        sem.signal(&mut sched);
        assert_eq!(sem.value(), 0);
        assert_eq!(main.state(), crate::task::State::Active);
    }
}
