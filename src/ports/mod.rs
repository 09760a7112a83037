//! Target-specific glue: the context-switch trampoline, the idle
//! instruction, the interrupt priority for the scheduler's own exception,
//! and an [`crate::mpu::MpuPort`] implementation.
//!
//! Everything in `scheduler`/`task`/`wait`/`ring`/`semaphore` is portable;
//! this is the only layer that differs per architecture, mirroring how the
//! source isolates `context_switch.S` and the MPU register access behind a
//! narrow port boundary.
#[cfg(any(feature = "mock", test))]
pub mod mock;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "arm")] {
        pub mod cortex_m;
    }
}

use crate::mpu::MpuPort;
use crate::task::Task;

/// The narrow set of operations the scheduler needs from the underlying
/// CPU: an idle wait, access to the MPU, and the ability to park its own
/// interrupt at the lowest priority so a context switch never preempts
/// itself.
pub trait Port {
    type Mpu: MpuPort;

    /// Blocks (e.g. `wfe`) until the next interrupt, called only when
    /// `priomask` is observed to be zero.
    fn idle(&mut self);

    fn mpu(&mut self) -> &mut Self::Mpu;

    /// Configures the scheduler's own exception (PendSV on Cortex-M) to the
    /// lowest priority in the system, so it always runs after every other
    /// interrupt has finished folding its wake-ups into the bitmaps.
    fn set_scheduler_interrupt_lowest_priority(&mut self);

    /// Requests a context switch at the next opportunity (pends PendSV on
    /// Cortex-M). Not used by the synchronous host-testable path, which
    /// calls [`crate::scheduler::Scheduler::reschedule`] directly.
    fn request_switch(&mut self);

    /// The fault hook: called by [`crate::scheduler::Scheduler::reschedule`]
    /// when a task's canary-word guard band no longer reads back the
    /// planted pattern. On a port with a real MPU this is a redundant
    /// backstop (the overrun already raised a hardware fault synchronously,
    /// before execution ever reached this context switch); on an MPU-less
    /// port it is the only detection this runtime offers, delayed until the
    /// offending task's next switch rather than synchronous.
    fn on_guard_fault(&mut self, task: *mut Task);
}
