//! Task table, priority bitmap, sleep bitmap, wake-up bitmap, the deferred
//! wake-up pipeline, and the context-switch policy function.
//!
//! Mirrors the source's `scheduler_t` field for field: `idmap`/`priotask`
//! are the same redundant-by-design pair (id lookup and O(1) priority
//! selection), `priomask`/`sleepmask`/`wakeupmask` are the same three
//! 32-bit bitmaps (MSB = priority 0), and `freeid` is the same
//! next-candidate-id cursor. Only the bitmap/table cells are atomic here,
//! matching the source: a task's own fields are touched only by itself or
//! by the scheduler at the one scheduling point that observes it, never
//! concurrently, so they need no atomics of their own.
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU32, AtomicU8, Ordering};

use crate::atomic;
use crate::mpu::MpuPort;
use crate::ports::Port;
use crate::ring::{self, ResumeRing, WakeupRing};
use crate::task::{Req, Slot, State, Task};
use crate::wait::WaitQueue;
use crate::{Error, Result};

/// Number of id slots (entry 0 unused; id 1 is reserved for the main task).
pub const MAX_IDS: usize = 32;
/// Number of priority slots. Only the top 8 (priorities 0-7) are ever
/// populated, matching the 3-bit priority field on [`Task`].
pub const MAX_PRIORITIES: usize = 32;

const fn priobit(priority: u8) -> u32 {
    1u32 << (31 - priority as u32)
}

/// States from which [`ResumeRing`]/wake-up-bitmap promotion to `ACTIVE`
/// is valid. `WAITFOR` is deliberately excluded: that path runs exclusively
/// through a task's own [`WaitQueue`], via [`WakeupRing`] or the
/// synchronous `signal` path, never through a bare resume.
fn is_resumeable(state: State) -> bool {
    matches!(state, State::Suspend | State::Sleep)
}

/// The single MPU region installed over a task's guard-band: a 256-byte
/// region with only the eighth sub-region (the guard-band itself) enabled.
fn guard_band_region(task: &Task) -> crate::mpu::Region {
    crate::mpu::Region {
        base_addr: task.guard_base() as u32,
        size_log2: 8,
        subregion_disable: !(1 << 3),
        priv_access: crate::mpu::Access::Read,
        unpriv_access: crate::mpu::Access::Read,
    }
}

/// The scheduler core: task table, bitmaps, and the two deferred-wake-up
/// ring lists. One instance exists per CPU; embedding applications hold
/// it in a `static` and drive it from `init_scheduler`, their own
/// `PendSV`-equivalent handler, and a periodic tick interrupt.
pub struct Scheduler<P: Port> {
    port: P,
    current: AtomicPtr<Task>,
    freeid: AtomicU8,
    idmap: [AtomicPtr<Task>; MAX_IDS],
    priotask: [AtomicPtr<Task>; MAX_PRIORITIES],
    priomask: AtomicU32,
    sleepmask: AtomicU32,
    wakeupmask: AtomicU32,
    resume_list: AtomicPtr<ResumeRing>,
    wakeup_list: AtomicPtr<WakeupRing>,
    /// Built-in deferred rings for the common case of a single producer
    /// using the convenience `*_qd_*` wrappers. Callers needing several
    /// independent producers can construct their own rings and link them
    /// into [`Scheduler::resume_list`]/[`Scheduler::wakeup_list`] via
    /// [`ring::ResumeRing::link_if_newly_active`] directly.
    default_resume_ring: ResumeRing,
    default_wakeup_ring: WakeupRing,
}

impl<P: Port> Scheduler<P> {
    pub const fn new(port: P) -> Self {
        const NULL_TASK: AtomicPtr<Task> = AtomicPtr::new(ptr::null_mut());
        Scheduler {
            port,
            current: AtomicPtr::new(ptr::null_mut()),
            freeid: AtomicU8::new(2),
            idmap: [NULL_TASK; MAX_IDS],
            priotask: [NULL_TASK; MAX_PRIORITIES],
            priomask: AtomicU32::new(0),
            sleepmask: AtomicU32::new(0),
            wakeupmask: AtomicU32::new(0),
            resume_list: AtomicPtr::new(ptr::null_mut()),
            wakeup_list: AtomicPtr::new(ptr::null_mut()),
            default_resume_ring: ResumeRing::new(),
            default_wakeup_ring: WakeupRing::new(),
        }
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    pub fn current(&self) -> *mut Task {
        self.current.load(Ordering::Relaxed)
    }

    /// Clears every table and bitmap and disables the scheduler's own
    /// interrupt priority and MPU region. Exists so a host test harness
    /// can reuse one `Scheduler` across independent scenarios; real
    /// firmware calls `init` exactly once at boot.
    pub fn reset(&mut self) {
        for slot in &self.idmap {
            slot.store(ptr::null_mut(), Ordering::Relaxed);
        }
        for slot in &self.priotask {
            slot.store(ptr::null_mut(), Ordering::Relaxed);
        }
        self.priomask.store(0, Ordering::Relaxed);
        self.sleepmask.store(0, Ordering::Relaxed);
        self.wakeupmask.store(0, Ordering::Relaxed);
        self.resume_list.store(ptr::null_mut(), Ordering::Relaxed);
        self.wakeup_list.store(ptr::null_mut(), Ordering::Relaxed);
        self.freeid.store(2, Ordering::Relaxed);
        self.current.store(ptr::null_mut(), Ordering::Relaxed);
        self.port.mpu().clear(0, 1);
    }

    /// Validates and admits the initial task set. `tasks` must contain
    /// `main` exactly once, every entry must be a freshly initialized,
    /// unstarted task with a unique priority, and none may already be
    /// admitted elsewhere. On any violation, returns `EInval` with no
    /// state mutated.
    pub fn init(&mut self, tasks: &mut [*mut Task], main: *mut Task) -> Result<()> {
        if tasks.len() >= MAX_IDS {
            return Err(Error::EInval);
        }

        let mut seen_priority_mask = 0u32;
        let mut found_main = false;
        for &t in tasks.iter() {
            if t.is_null() {
                return Err(Error::EInval);
            }
            // SAFETY: caller-provided, caller-owned task records.
            let task = unsafe { &*t };
            if t == main {
                found_main = true;
            }
            if !task.is_init() {
                return Err(Error::EInval);
            }
            let bit = priobit(task.priority());
            if seen_priority_mask & bit != 0 {
                return Err(Error::EInval);
            }
            seen_priority_mask |= bit;
        }
        if !found_main {
            return Err(Error::EInval);
        }

        self.reset();

        for (i, &t) in tasks.iter().enumerate() {
            let id = (1 + i) as u8;
            // SAFETY: validated above; each task appears once.
            let task = unsafe { &mut *t };
            task.set_state(State::Active);
            task.set_id(id);
            self.idmap[id as usize].store(t, Ordering::Relaxed);
            self.priotask[task.priority() as usize].store(t, Ordering::Relaxed);
        }
        self.freeid.store((tasks.len() + 1) as u8, Ordering::Relaxed);
        self.priomask.store(seen_priority_mask, Ordering::Relaxed);

        // Re-point the main task to id 1, swapping whichever task currently
        // holds it, matching the source's main-task id fixup.
        // SAFETY: `main` was validated above to be one of `tasks`.
        let main_ref = unsafe { &mut *main };
        if main_ref.id() != 1 {
            let other = self.idmap[1].load(Ordering::Relaxed);
            self.idmap[main_ref.id() as usize].store(other, Ordering::Relaxed);
            if let Some(other_ref) = unsafe { other.as_mut() } {
                other_ref.set_id(main_ref.id());
            }
            self.idmap[1].store(main, Ordering::Relaxed);
            main_ref.set_id(1);
        }

        let region = guard_band_region(main_ref);
        if !self
            .port
            .mpu()
            .config(&[region], crate::mpu::BackgroundPolicy::AllowPrivilegedDefault)
        {
            return Err(Error::EInval);
        }
        self.port.set_scheduler_interrupt_lowest_priority();

        self.current.store(main, Ordering::Relaxed);
        Ok(())
    }

    /// Admits an additional task at runtime. Claims a free id via
    /// compare-and-swap, then claims the task's priority slot the same
    /// way; on a claimed-id-but-lost-priority race, releases the id and
    /// reports `EALREADY`.
    pub fn add_task(&self, task: &mut Task) -> Result<()> {
        if !task.is_init() {
            return Err(Error::EInval);
        }
        let task_ptr = task as *mut Task;

        for pass in 0..2 {
            let start = if pass == 0 {
                self.freeid.load(Ordering::Relaxed)
            } else {
                2
            };
            for id in start..(MAX_IDS as u8) {
                if atomic::swap_ptr(&self.idmap[id as usize], ptr::null_mut(), task_ptr) {
                    let pri_cell = &self.priotask[task.priority() as usize];
                    if !atomic::swap_ptr(pri_cell, ptr::null_mut(), task_ptr) {
                        self.idmap[id as usize].store(ptr::null_mut(), Ordering::Relaxed);
                        self.freeid.store(id, Ordering::Relaxed);
                        return Err(Error::EAlready);
                    }
                    task.set_id(id);
                    self.freeid.store(id + 1, Ordering::Relaxed);
                    atomic::bit_set(&self.wakeupmask, priobit(task.priority()));
                    return Ok(());
                }
            }
        }
        Err(Error::ENoMem)
    }

    fn promote_ready(&self, task: &mut Task) {
        task.set_state(State::Active);
        atomic::bit_set(&self.priomask, task.priobit());
    }

    /// Finalizes a pending `stop_task` request observed while promoting a
    /// blocked task: rather than waking it up, removes it from the tables
    /// directly. This is the "unchain from the FIFO at the next scheduling
    /// point" resolution: the FIFO unlink already happened as part of
    /// popping the task to promote it, so this only needs to redirect the
    /// destination from `ACTIVE` to `END`.
    fn finalize_end(&self, task: &mut Task) {
        task.set_state(State::End);
        self.priotask[task.priority() as usize].store(ptr::null_mut(), Ordering::Relaxed);
        self.idmap[task.id() as usize].store(ptr::null_mut(), Ordering::Relaxed);
    }

    fn promote_or_end(&self, task: &mut Task) {
        if task.req() == Req::End {
            self.finalize_end(task);
        } else {
            self.promote_ready(task);
        }
    }

    /// Folds a non-`ACTIVE` task into the structure matching its state,
    /// exactly as `task_scheduler`'s first phase does.
    fn fold(&self, task: &mut Task) {
        let bit = task.priobit();
        atomic::bit_clear(&self.priomask, bit);

        match task.state() {
            State::Suspend => {
                if task.req() == Req::End {
                    task.set_state(State::End);
                    self.priotask[task.priority() as usize].store(ptr::null_mut(), Ordering::Relaxed);
                    self.idmap[task.id() as usize].store(ptr::null_mut(), Ordering::Relaxed);
                }
            }
            State::WaitFor => {
                let wq = match task.slot() {
                    Slot::WaitFor(wq) => *wq,
                    _ => {
                        debug_assert!(false, "WAITFOR task without a wait target");
                        return;
                    }
                };
                // SAFETY: `wq` outlives every task waiting on it by construction.
                let wq_ref = unsafe { &mut *wq };
                if wq_ref.consume_event() {
                    self.promote_or_end(task);
                } else {
                    // SAFETY: `task` is not currently linked into any other FIFO.
                    unsafe { wq_ref.push_back(task as *mut Task) };
                }
            }
            State::Sleep => {
                atomic::bit_set(&self.sleepmask, bit);
            }
            State::Active | State::End => {
                debug_assert!(false, "fold() called on a task that needs no folding");
            }
        }
    }

    /// Drains the three wake-up sources into `priomask`/`sleepmask`.
    fn process_wakeup(&self) {
        ring::drain_list(&self.wakeup_list, |wq: *mut WaitQueue| {
            // SAFETY: every entry came from a live `WaitQueue` reference.
            let wq_ref = unsafe { &mut *wq };
            if wq_ref.has_waiter() {
                // SAFETY: list invariants upheld by `push_back`/`pop_front`.
                if let Some(first) = unsafe { wq_ref.pop_front() } {
                    // SAFETY: popped from a live FIFO of live tasks.
                    let first_ref = unsafe { &mut *first };
                    self.promote_or_end(first_ref);
                }
            } else {
                let _ = wq_ref.record_event();
            }
        });

        ring::drain_list(&self.resume_list, |t: *mut Task| {
            // SAFETY: every entry came from a live `Task` reference.
            let task = unsafe { &mut *t };
            if is_resumeable(task.state()) {
                atomic::bit_clear(&self.sleepmask, task.priobit());
                self.promote_or_end(task);
            }
        });

        let pending = self.wakeupmask.swap(0, Ordering::AcqRel);
        let mut wm = pending;
        while wm != 0 {
            let pri = wm.leading_zeros() as u8;
            let bit = priobit(pri);
            wm &= !bit;
            let t = self.priotask[pri as usize].load(Ordering::Relaxed);
            if let Some(task) = unsafe { t.as_mut() } {
                if is_resumeable(task.state()) {
                    atomic::bit_clear(&self.sleepmask, bit);
                    self.promote_or_end(task);
                }
            }
        }
    }

    /// The context-switch policy function: folds `outgoing` into the
    /// scheduler's structures if it left `ACTIVE`, drains the wake-up
    /// pipeline, idles while nothing is runnable, and selects the
    /// highest-priority runnable task. Pure aside from the idle callback.
    pub fn reschedule(&mut self, outgoing: &mut Task) -> *mut Task {
        // Canary check: the software backstop for platforms (or the mock
        // port) with no MPU. On a port with a real MPU this is redundant,
        // since an overrun already raised a hardware fault before control
        // ever reached here, but it is cheap and harmless to run anyway.
        if !outgoing.guard_intact() {
            self.port.on_guard_fault(outgoing as *mut Task);
        }

        let mut folding: *mut Task = outgoing as *mut Task;
        loop {
            // SAFETY: `folding` is always a live task: `outgoing` on entry,
            // or a `priotask` entry re-selected below.
            let task = unsafe { &mut *folding };
            if task.state() != State::Active {
                self.fold(task);
            }

            self.process_wakeup();
            while self.priomask.load(Ordering::Relaxed) == 0 {
                self.port.idle();
                self.process_wakeup();
            }

            let pri = self.priomask.load(Ordering::Relaxed).leading_zeros() as usize;
            let next = self.priotask[pri].load(Ordering::Relaxed);
            debug_assert!(!next.is_null(), "priomask bit set with no matching task");

            // SAFETY: non-null per the invariant above.
            let next_ref = unsafe { &mut *next };
            if next_ref.req() == Req::End {
                next_ref.set_state(State::Suspend);
                folding = next;
                continue;
            }

            // Move the guard-band MPU region onto the incoming task before
            // it runs. `ports::cortex_m::switch::jrtos_pendsv_select` only
            // ever reaches the incoming task's context through this call,
            // so the real hardware path gets this for free.
            let region = guard_band_region(next_ref);
            self.port.mpu().update(0, &[region]);

            self.current.store(next, Ordering::Relaxed);
            return next;
        }
    }

    /// Called from a higher-priority timer interrupt. Decrements every
    /// sleeping task's remaining time by `delta_ms`; tasks reaching zero
    /// are posted to `wakeupmask`. Returns how many became runnable, so
    /// the caller can decide whether to raise the scheduler interrupt.
    pub fn periodic(&self, delta_ms: u32) -> u32 {
        let mut sleepmask = self.sleepmask.load(Ordering::Relaxed);
        let mut wakeupmask = 0u32;
        let mut count = 0u32;

        while sleepmask != 0 {
            let pri = sleepmask.leading_zeros() as u8;
            let bit = priobit(pri);
            sleepmask &= !bit;
            let t = self.priotask[pri as usize].load(Ordering::Relaxed);
            let Some(task) = (unsafe { t.as_mut() }) else {
                continue;
            };
            if let Slot::SleepMs(ms) = *task.slot() {
                if ms > delta_ms {
                    task.set_slot(Slot::SleepMs(ms - delta_ms));
                } else if ms != 0 {
                    task.set_slot(Slot::SleepMs(0));
                    wakeupmask |= bit;
                    count += 1;
                }
            }
        }

        if wakeupmask != 0 {
            atomic::bit_set(&self.wakeupmask, wakeupmask);
        }
        count
    }

    // -- Task-local operations (caller must be the task itself) --

    pub fn yield_task(&mut self, current: &mut Task) -> *mut Task {
        self.reschedule(current)
    }

    pub fn sleep_ms_task(&mut self, current: &mut Task, ms: u32) -> *mut Task {
        current.set_slot(Slot::SleepMs(ms));
        current.set_state(State::Sleep);
        self.reschedule(current)
    }

    pub fn suspend_task(&mut self, current: &mut Task) -> *mut Task {
        current.set_state(State::Suspend);
        self.reschedule(current)
    }

    pub fn end_task(&mut self, current: &mut Task) -> *mut Task {
        current.set_state(State::Suspend);
        current.set_req(Req::End);
        self.reschedule(current)
    }

    pub fn wait_task(&mut self, current: &mut Task, wq: &WaitQueue) -> *mut Task {
        current.set_slot(Slot::WaitFor(wq as *const WaitQueue as *mut WaitQueue));
        current.set_state(State::WaitFor);
        self.reschedule(current)
    }

    // -- Remote operations (caller is another task or an interrupt) --

    /// Synchronous resume through the caller's own resume ring, then
    /// yields. Task-context only: see the `resume_task`/`resume_qd_task`
    /// split recorded in `DESIGN.md`.
    pub fn resume_task(&mut self, current: &mut Task, target: &mut Task) -> Result<*mut Task> {
        self.default_resume_ring.write(target as *mut Task)?;
        self.default_resume_ring.link_if_newly_active(&self.resume_list);
        Ok(self.yield_task(current))
    }

    /// Enqueues a deferred resume and returns without yielding; safe from
    /// an interrupt.
    pub fn resume_qd_task(&self, target: &mut Task) -> Result<()> {
        self.default_resume_ring.write(target as *mut Task)?;
        self.default_resume_ring.link_if_newly_active(&self.resume_list);
        Ok(())
    }

    /// Queues an END request against `target`; observed at its next
    /// scheduling point.
    pub fn stop_task(&self, target: &mut Task) {
        target.set_req(Req::End);
    }

    /// Synchronous wake-up of `wq`'s FIFO head (or counter bump if empty).
    pub fn wakeup_wait_queue(&self, wq: &WaitQueue) {
        // SAFETY: `&WaitQueue` is a valid live reference; interior mutation
        // is confined to the atomic counter and the FIFO link fields,
        // which only the scheduler touches.
        let wq_ptr = wq as *const WaitQueue as *mut WaitQueue;
        let wq_mut = unsafe { &mut *wq_ptr };
        if wq_mut.has_waiter() {
            if let Some(first) = unsafe { wq_mut.pop_front() } {
                let first_ref = unsafe { &mut *first };
                self.promote_or_end(first_ref);
            }
        } else {
            let _ = wq_mut.record_event();
        }
    }

    /// Deferred wake-up of `wq` through the built-in wakeup ring.
    pub fn wakeup_qd_wait_queue(&self, wq: &WaitQueue) -> Result<()> {
        let wq_ptr = wq as *const WaitQueue as *mut WaitQueue;
        self.default_wakeup_ring.write(wq_ptr)?;
        self.default_wakeup_ring.link_if_newly_active(&self.wakeup_list);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::mock::MockPort;
    use crate::task::init_task;

    extern "C" fn dummy(_arg: usize) {}

    fn new_sched() -> Scheduler<MockPort> {
        Scheduler::new(MockPort::new())
    }

    #[test]
    fn init_requires_main_task_present() {
        let mut sched = new_sched();
        let mut main = Task::new();
        init_task(&mut main, 0, dummy, 0).unwrap();
        let mut other = Task::new();
        init_task(&mut other, 1, dummy, 0).unwrap();

        let main_ptr = &mut main as *mut Task;
        let mut tasks = [&mut other as *mut Task];
        assert_eq!(sched.init(&mut tasks, main_ptr), Err(Error::EInval));
    }

    #[test]
    fn init_assigns_main_id_one() {
        let mut sched = new_sched();
        let mut main = Task::new();
        init_task(&mut main, 0, dummy, 0).unwrap();
        let mut second = Task::new();
        init_task(&mut second, 1, dummy, 0).unwrap();

        let main_ptr = &mut main as *mut Task;
        let mut tasks = [main_ptr, &mut second as *mut Task];
        sched.init(&mut tasks, main_ptr).unwrap();

        assert_eq!(main.id(), 1);
        assert_eq!(main.state(), State::Active);
        assert_eq!(second.state(), State::Active);
    }

    #[test]
    fn reschedule_picks_highest_priority_runnable() {
        let mut sched = new_sched();
        let mut main = Task::new();
        init_task(&mut main, 2, dummy, 0).unwrap();
        let mut high = Task::new();
        init_task(&mut high, 0, dummy, 0).unwrap();

        let main_ptr = &mut main as *mut Task;
        let mut tasks = [main_ptr, &mut high as *mut Task];
        sched.init(&mut tasks, main_ptr).unwrap();

        // main yields; the higher-priority task must be selected.
        let next = sched.yield_task(&mut main);
        assert_eq!(next, &mut high as *mut Task);
    }

    #[test]
    fn end_task_removes_from_tables() {
        let mut sched = new_sched();
        let mut main = Task::new();
        init_task(&mut main, 0, dummy, 0).unwrap();
        let mut other = Task::new();
        init_task(&mut other, 1, dummy, 0).unwrap();

        let main_ptr = &mut main as *mut Task;
        let mut tasks = [main_ptr, &mut other as *mut Task];
        sched.init(&mut tasks, main_ptr).unwrap();

        let id = other.id();
        let _ = sched.end_task(&mut other);
        assert_eq!(other.state(), State::End);
        assert!(sched.idmap[id as usize].load(Ordering::Relaxed).is_null());
    }
}
