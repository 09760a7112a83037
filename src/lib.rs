//! A cooperative, priority-scheduled task runtime for single-CPU,
//! interrupt-driven targets.
//!
//! A fixed set of fixed-stack tasks run under strict priority: the
//! highest-priority `ACTIVE` task always has the CPU, and a task only
//! gives it up by yielding, sleeping, suspending, or blocking on a
//! [`wait::WaitQueue`] (directly, or through [`semaphore::Semaphore`]).
//! Everything in the crate except `ports` is portable; `ports` is the
//! narrow seam where the context-switch trampoline and the MPU guard-band
//! backend differ by target.
//!
//! No heap allocation: every [`task::Task`] is a caller-owned, statically
//! sized record, and the deferred wake-up path ([`ring`]) uses fixed
//!-capacity ring buffers rather than a queue.
#![no_std]

pub mod atomic;
pub mod error;
pub mod iframe;
pub mod mpu;
pub mod ports;
pub mod ring;
pub mod scheduler;
pub mod semaphore;
pub mod task;
pub mod wait;

pub use error::{Error, Result};
pub use scheduler::Scheduler;
pub use semaphore::Semaphore;
pub use task::{init_main_task, init_task, Task};
