//! Layout of the stack frame the CPU pushes on exception entry, and the
//! `EXC_RETURN` linkage value used to resume a task in thread mode on its
//! own stack with no FPU state.
//!
//! Indices are word offsets into the 8-word exception frame `{r0, r1, r2,
//! r3, r12, lr, pc, psr}`; this is exactly what Cortex-M pushes (without an
//! FPU extended frame) before entering an exception handler, and what it
//! pops on `bx lr` with a thread-mode `EXC_RETURN`.

/// Number of words in the base (non-FPU, non-padded) exception frame.
pub const FRAME_LEN: usize = 8;

pub const R0: usize = 0;
pub const R1: usize = 1;
pub const R2: usize = 2;
pub const R3: usize = 3;
pub const R12: usize = 4;
pub const LR: usize = 5;
pub const PC: usize = 6;
pub const PSR: usize = 7;

/// Thumb-state bit (bit 24) that must be set in the saved `PSR` of any task
/// entry point, since Cortex-M has no ARM-mode execution.
pub const PSR_THUMB: u32 = 1 << 24;

/// `EXC_RETURN` value selecting: return to thread mode, use the process
/// stack pointer, no floating-point context. This is the linkage word
/// saved/restored as `task.lr` across every context switch.
pub const EXC_RETURN_THREAD_PSP_NOFPU: u32 = 0xFFFF_FFFD;

/// Poison value stored in a freshly initialized task's saved `LR` slot
/// inside its first frame; the entry function must never return, so any
/// attempt shows up as a jump to this unmapped address.
pub const POISON_LR: u32 = 0xFFFF_FFFF;

/// Builds the initial 8-word exception frame for a task that has never run,
/// ready to be popped by the first `bx lr` that dispatches it.
pub const fn initial_frame(entry: u32, arg: u32) -> [u32; FRAME_LEN] {
    let mut frame = [0u32; FRAME_LEN];
    frame[R0] = arg;
    frame[LR] = POISON_LR;
    frame[PC] = entry;
    frame[PSR] = PSR_THUMB;
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_frame_fields() {
        let frame = initial_frame(0x2000_1234, 42);
        assert_eq!(frame[R0], 42);
        assert_eq!(frame[LR], POISON_LR);
        assert_eq!(frame[PC], 0x2000_1234);
        assert_eq!(frame[PSR], PSR_THUMB);
    }
}
