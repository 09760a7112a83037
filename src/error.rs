//! Numeric error codes returned by fallible operations.
//!
//! None of these are raised as panics: a caller that passes a bad priority or
//! races an exhausted id space gets a `Result::Err` back, the way the
//! original C core returned `int` error codes from every public entry point.

/// Error codes returned by task, wait, semaphore and scheduler operations.
///
/// Mirrors the numeric codes of the C core (`EINVAL`, `EALREADY`, ...) one
/// for one; no new failure kind is introduced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// Malformed arguments: unknown priority, misaligned task, duplicate
    /// priority at init, or a null task table entry.
    EInval,
    /// The priority slot a task is trying to claim is already occupied.
    EAlready,
    /// All task ids are in use, or no deferred-ring slot is available.
    ENoMem,
    /// `try_wait` on a semaphore whose value is `<= 0`.
    EAgain,
    /// An internal queue was asked to yield an entry while empty.
    ///
    /// Signals a consistency violation in the caller's own bookkeeping
    /// (e.g. a wait-wakeup ring entry that does not correspond to a queued
    /// waiter); the operation is aborted rather than undefined.
    ENoData,
    /// A synchronous resume was attempted on a ring that is already in
    /// flight and the current caller has no way to yield and retry.
    EBusy,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = core::result::Result<T, Error>;
