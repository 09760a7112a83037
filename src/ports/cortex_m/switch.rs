//! The `PendSV` context-switch trampoline.
//!
//! Grounded on the source's own PendSV handler in shape (stack the
//! callee-saved registers of the outgoing task, hand off to Rust to pick
//! the next one, restore its registers, return) but adapted to this
//! runtime's design: there is no separate task-list-plus-index table to
//! offset into, because [`crate::task::Task::sp`] already locates the
//! owning record from the stack pointer alone (`sp & !(TASK_ALIGN - 1)`),
//! so the handler only ever needs the single saved stack pointer cell.
use core::arch::naked_asm;

use crate::scheduler::Scheduler;
use crate::task::Task;

use super::CortexMPort;

/// Called from the naked trampoline with the outgoing task's saved process
/// stack pointer. Runs the context-switch policy and returns the incoming
/// task's saved stack pointer for the trampoline to restore into `psp`.
///
/// # Safety
/// Must only be called from [`PendSV`] with `outgoing_psp` equal to the
/// process stack pointer at the moment of the exception, already adjusted
/// past the 8-word hardware frame.
#[unsafe(no_mangle)]
unsafe extern "C" fn jrtos_pendsv_select(
    outgoing_psp: *mut u32,
    scheduler: *mut Scheduler<CortexMPort>,
) -> *mut u32 {
    let outgoing_ptr = (outgoing_psp as usize & !(crate::task::TASK_ALIGN - 1)) as *mut Task;
    // SAFETY: every task-owned stack lives inside a `Task` record aligned
    // and sized to `TASK_ALIGN`, so masking the stack pointer always
    // recovers the owning record.
    let outgoing = unsafe { &mut *outgoing_ptr };
    unsafe { outgoing.set_sp(outgoing_psp) };

    // SAFETY: `CURRENT_SCHEDULER` is set once at boot before PendSV is
    // ever enabled.
    let scheduler = unsafe { &mut *scheduler };
    let incoming = scheduler.reschedule(outgoing);
    // SAFETY: `reschedule` always returns a live, admitted task.
    unsafe { (*incoming).sp() }
}

/// PendSV handler: the context-switch trampoline.
///
/// On entry the hardware has already pushed `{r0-r3, r12, lr, pc, psr}`
/// onto the outgoing task's process stack. This handler pushes the
/// remaining callee-saved registers, calls [`jrtos_pendsv_select`] to pick
/// the next task, and pops that task's registers before returning; the
/// hardware then restores its half of the frame.
///
/// Naked so the compiler neither spills anything of its own onto the
/// outgoing task's stack nor clobbers a register before it is saved.
#[unsafe(no_mangle)]
#[unsafe(naked)]
pub unsafe extern "C" fn PendSV() {
    naked_asm!(
        "mrs r0, psp",
        "stmdb r0!, {{r4-r11, lr}}",
        "ldr r1, ={scheduler}",
        "ldr r1, [r1]",
        "bl {select}",
        "ldmia r0!, {{r4-r11, lr}}",
        "msr psp, r0",
        "bx lr",
        scheduler = sym CURRENT_SCHEDULER,
        select = sym jrtos_pendsv_select,
    );
}

/// Set once at boot by whichever application owns the single
/// `Scheduler<CortexMPort>` instance; read by the trampoline on every
/// switch. A raw pointer rather than a `static Scheduler` because the
/// scheduler's size and task table are a host-application concern.
#[unsafe(no_mangle)]
pub static mut CURRENT_SCHEDULER: *mut Scheduler<CortexMPort> = core::ptr::null_mut();
