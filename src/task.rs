//! The per-task record: saved context, lifecycle state, and the fixed
//! stack a task runs on.
//!
//! A [`Task`] is exactly [`TASK_ALIGN`] bytes, aligned to [`TASK_ALIGN`].
//! That is what lets the context-switch trampoline recover the owning
//! task from nothing but the process stack pointer: `sp & !(TASK_ALIGN -
//! 1)` is the task's address, an O(1) lookup with no side table. The
//! trampoline itself lives in `ports::*::switch`; this module only
//! describes the record it operates on.
use core::ptr;

use crate::iframe;
use crate::wait::WaitQueue;

/// Size, and required alignment, of every [`Task`]. Must stay a power of
/// two so the stack-pointer mask trick is valid.
pub const TASK_ALIGN: usize = 1024;

/// Words reserved for the MPU guard-band sub-region placed directly above
/// a task's usable stack (32 bytes = one eighth of a 256-byte MPU region).
pub const GUARD_WORDS: usize = 8;

/// Lifecycle state of a task, per the scheduler's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum State {
    Active,
    Sleep,
    Suspend,
    WaitFor,
    End,
}

/// Deferred request another task or interrupt may post against this task,
/// observed only at the task's own next scheduling point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Req {
    None,
    End,
}

/// The state-dependent union field: valid interpretation depends on
/// [`Task::state`]. Kept as a tagged enum rather than a raw C union since
/// nothing in the context-switch trampoline needs to address it directly.
#[derive(Debug, Clone, Copy)]
pub enum Slot {
    None,
    /// Valid when `state == WaitFor`: the wait primitive this task blocks on.
    WaitFor(*mut WaitQueue),
    /// Valid when `state == Sleep`: remaining milliseconds.
    SleepMs(u32),
    /// Valid while another task is suspended awaiting completion of a
    /// deferred request made against it.
    ReqTask(*mut Task),
}

/// Function signature a task's entry point must have: `entry(arg)`,
/// non-returning.
pub type TaskEntry = extern "C" fn(usize);

#[repr(C)]
struct Header {
    /// Saved process stack pointer. Field 0: the trampoline reads/writes
    /// this directly, so it must never move without updating the asm in
    /// `ports::*::switch`.
    sp: *mut u32,
    /// Unused: reserved so `Header`'s size matches the callee-saved
    /// register set the real trampoline stacks. The Cortex-M `PendSV`
    /// handler saves/restores r4-r11 on the task's own stack via
    /// `stmdb`/`ldmia` rather than through this field; nothing reads or
    /// writes it at runtime.
    regs: [u32; 8],
    /// Unused placeholder for the same reason as `regs`; the live
    /// `EXC_RETURN` value lives in the trampoline's own stack frame, saved
    /// and restored alongside r4-r11.
    lr: u32,
    priobit: u32,
    state: State,
    req: Req,
    id: u8,
    priority: u8,
    slot: Slot,
    /// FIFO link used while queued on a [`WaitQueue`].
    next: *mut Task,
    /// Guard-band words; the MPU (or canary check) watches the first one.
    guard: [u32; GUARD_WORDS],
}

const HEADER_SIZE: usize = core::mem::size_of::<Header>();
const STACK_BYTES: usize = TASK_ALIGN - HEADER_SIZE;
/// Number of `u32` words available for the task's own stack.
pub const STACK_WORDS: usize = STACK_BYTES / 4;

/// A schedulable unit of work: saved context, priority, lifecycle state,
/// and its own fixed stack. Caller-allocated; the runtime never heap
/// allocates a task.
#[repr(C, align(1024))]
pub struct Task {
    header: Header,
    stack: [u32; STACK_WORDS],
}

const _: () = assert!(
    core::mem::size_of::<Task>() == TASK_ALIGN,
    "Task record grew past TASK_ALIGN; the stack-pointer masking trick requires size == alignment"
);

impl Task {
    /// A blank, `SUSPEND`-state task record suitable for `static` arrays;
    /// callers must still run it through [`init_task`] or [`init_main_task`]
    /// before handing it to the scheduler.
    pub const fn new() -> Self {
        Task {
            header: Header {
                sp: ptr::null_mut(),
                regs: [0; 8],
                lr: 0,
                priobit: 0,
                state: State::Suspend,
                req: Req::None,
                id: 0,
                priority: 0,
                slot: Slot::None,
                next: ptr::null_mut(),
                guard: [0; GUARD_WORDS],
            },
            stack: [0; STACK_WORDS],
        }
    }

    pub fn state(&self) -> State {
        self.header.state
    }

    pub fn set_state(&mut self, state: State) {
        self.header.state = state;
    }

    pub fn req(&self) -> Req {
        self.header.req
    }

    pub fn set_req(&mut self, req: Req) {
        self.header.req = req;
    }

    pub fn id(&self) -> u8 {
        self.header.id
    }

    pub fn set_id(&mut self, id: u8) {
        self.header.id = id;
    }

    pub fn priority(&self) -> u8 {
        self.header.priority
    }

    pub fn priobit(&self) -> u32 {
        self.header.priobit
    }

    pub fn slot(&self) -> &Slot {
        &self.header.slot
    }

    pub fn set_slot(&mut self, slot: Slot) {
        self.header.slot = slot;
    }

    pub fn next(&self) -> *mut Task {
        self.header.next
    }

    pub fn set_next(&mut self, next: *mut Task) {
        self.header.next = next;
    }

    pub fn sp(&self) -> *mut u32 {
        self.header.sp
    }

    /// # Safety
    /// Must only be called by the context-switch trampoline with a value
    /// that points within this task's own stack region.
    pub unsafe fn set_sp(&mut self, sp: *mut u32) {
        self.header.sp = sp;
    }

    /// Reads back the `EXC_RETURN` value planted by [`init_task`]. Not
    /// consulted by the real trampoline (see the field's doc comment on
    /// `Header`); kept readable for introspection and tests.
    pub fn lr(&self) -> u32 {
        self.header.lr
    }

    /// First guard-band word, used by the canary-word degradation path.
    pub fn guard_word(&self) -> u32 {
        self.header.guard[0]
    }

    pub fn plant_guard_canary(&mut self) {
        self.header.guard[0] = crate::mpu::plant_canary();
    }

    pub fn guard_intact(&self) -> bool {
        crate::mpu::check_canary(self.header.guard[0])
    }

    /// Overwrites the first guard-band word directly. Never called by a
    /// correctly behaving task; exists so tests can simulate a stack
    /// overflow into the guard band on the canary-word degradation path.
    pub fn set_guard_word(&mut self, word: u32) {
        self.header.guard[0] = word;
    }

    /// Base address of the guard-band, for programming an MPU region over it.
    pub fn guard_base(&self) -> *const u32 {
        self.header.guard.as_ptr()
    }

    /// Whether `self` looks like a record that has been initialized but
    /// never admitted to a scheduler: correct alignment, `SUSPEND` state,
    /// id still zero, not linked into any FIFO.
    pub fn is_init(&self) -> bool {
        self.header.state == State::Suspend
            && self.header.id == 0
            && self.header.next.is_null()
            && (self as *const Task as usize) % TASK_ALIGN == 0
    }
}

impl Default for Task {
    fn default() -> Self {
        Task::new()
    }
}

/// Builds a task ready to run `entry(arg)` on its own stack the first
/// time it is dispatched. Fails with [`crate::Error::EInval`] if
/// `priority` is out of `[0, 7]`.
pub fn init_task(task: &mut Task, priority: u8, entry: TaskEntry, arg: usize) -> crate::Result<()> {
    if priority > 7 {
        return Err(crate::Error::EInval);
    }

    *task = Task::new();
    task.plant_guard_canary();

    let frame = iframe::initial_frame(entry as usize as u32, arg as u32);
    let top = task.stack.len() - iframe::FRAME_LEN;
    task.stack[top..].copy_from_slice(&frame);

    // SAFETY: `top` is within `task.stack`, which is part of `task` itself.
    unsafe {
        let sp = task.stack.as_mut_ptr().add(top);
        task.set_sp(sp);
    }
    task.header.lr = iframe::EXC_RETURN_THREAD_PSP_NOFPU;
    task.header.state = State::Suspend;
    task.header.priority = priority;
    task.header.priobit = 1u32 << (31 - priority as u32);
    task.header.id = 0;
    Ok(())
}

/// Adopts the currently running context as `task`, at `priority`. No
/// initial frame is constructed: the live CPU context becomes this task's
/// context at the first context switch away from it.
pub fn init_main_task(task: &mut Task, priority: u8) -> crate::Result<()> {
    if priority > 7 {
        return Err(crate::Error::EInval);
    }
    *task = Task::new();
    task.plant_guard_canary();
    task.header.state = State::Suspend;
    task.header.priority = priority;
    task.header.priobit = 1u32 << (31 - priority as u32);
    task.header.id = 0;
    Ok(())
}
