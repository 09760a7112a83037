//! A host-testable [`Port`] with no MPU and a non-blocking idle.
//!
//! Grounded on the source's own `Mok` platform: the same idea of a
//! do-nothing port that lets the portable core run and be exercised off
//! real hardware, just reworked onto the [`Port`]/[`MpuPort`] seam instead
//! of a config-flag-selected free-function module.
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use core::ptr;

use crate::mpu::{BackgroundPolicy, Region};
use crate::ports::Port;
use crate::task::Task;

/// An MPU that accepts any region but enforces nothing; the crate falls
/// back to the canary-word check on this port, matching the documented
/// degraded guarantee for MPU-less targets.
#[derive(Default)]
pub struct MockMpu {
    configured: [Option<Region>; 1],
}

impl crate::mpu::MpuPort for MockMpu {
    fn config(&mut self, regions: &[Region], _policy: BackgroundPolicy) -> bool {
        if regions.len() != 1 || !regions[0].is_well_formed() {
            return false;
        }
        self.configured[0] = Some(regions[0]);
        true
    }

    fn update(&mut self, first_index: u8, regions: &[Region]) {
        if first_index == 0 && !regions.is_empty() {
            self.configured[0] = Some(regions[0]);
        }
    }

    fn clear(&mut self, first_index: u8, _n: u8) {
        if first_index == 0 {
            self.configured[0] = None;
        }
    }

    fn nextfree(&self, first_index: u8) -> Option<u8> {
        if first_index == 0 && self.configured[0].is_none() {
            Some(0)
        } else {
            None
        }
    }
}

/// Idles by spinning once and returning; a test scenario that relies on
/// `idle` to be called is free to observe [`MockPort::idle_calls`].
pub struct MockPort {
    mpu: MockMpu,
    idled: AtomicBool,
    switch_requested: AtomicBool,
    faulted_task: AtomicPtr<Task>,
}

impl MockPort {
    pub const fn new() -> Self {
        MockPort {
            mpu: MockMpu { configured: [None] },
            idled: AtomicBool::new(false),
            switch_requested: AtomicBool::new(false),
            faulted_task: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub fn idle_calls(&self) -> bool {
        self.idled.load(Ordering::Relaxed)
    }

    pub fn switch_was_requested(&self) -> bool {
        self.switch_requested.load(Ordering::Relaxed)
    }

    /// The task last reported through [`Port::on_guard_fault`], if any.
    pub fn faulted_task(&self) -> *mut Task {
        self.faulted_task.load(Ordering::Relaxed)
    }

    /// Clears every observation flag, for a test harness that reuses one
    /// `MockPort` across independent scenarios.
    pub fn reset_observations(&self) {
        self.idled.store(false, Ordering::Relaxed);
        self.switch_requested.store(false, Ordering::Relaxed);
        self.faulted_task.store(ptr::null_mut(), Ordering::Relaxed);
    }
}

impl Default for MockPort {
    fn default() -> Self {
        Self::new()
    }
}

impl Port for MockPort {
    type Mpu = MockMpu;

    fn idle(&mut self) {
        self.idled.store(true, Ordering::Relaxed);
    }

    fn mpu(&mut self) -> &mut MockMpu {
        &mut self.mpu
    }

    fn set_scheduler_interrupt_lowest_priority(&mut self) {}

    fn request_switch(&mut self) {
        self.switch_requested.store(true, Ordering::Relaxed);
    }

    fn on_guard_fault(&mut self, task: *mut Task) {
        self.faulted_task.store(task, Ordering::Relaxed);
    }
}
