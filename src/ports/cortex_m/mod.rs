//! Real Cortex-M4 port: PendSV as the context-switch trampoline, the MPU
//! peripheral as the guard-band backend, and `wfe` as the idle instruction.
pub mod switch;

use cortex_m::peripheral::{Peripherals, MPU, SCB};

use crate::mpu::{Access, BackgroundPolicy, MpuPort, Region};
use crate::ports::Port;
use crate::task::Task;

/// Lowest priority value on a Cortex-M4 with the common 4 implemented
/// priority bits (`0xF0`): every other interrupt in the system is
/// configured at a numerically smaller (higher) priority than this.
const PENDSV_LOWEST_PRIORITY: u8 = 0xFF;

pub struct CortexMMpu {
    mpu: MPU,
}

impl MpuPort for CortexMMpu {
    fn config(&mut self, regions: &[Region], policy: BackgroundPolicy) -> bool {
        if regions.is_empty() || regions.len() > 8 {
            return false;
        }
        for r in regions {
            if !r.is_well_formed() {
                return false;
            }
        }
        // SAFETY: disabling then reprogramming region 0.. is the documented
        // sequence for changing MPU regions while no task is mid-access;
        // this is only ever called from `init`, before any task has run.
        unsafe {
            self.mpu.ctrl.write(0);
            for (i, r) in regions.iter().enumerate() {
                self.write_region(i as u8, r);
            }
            let privdefena = matches!(policy, BackgroundPolicy::AllowPrivilegedDefault) as u32;
            self.mpu.ctrl.write(0b1 | (privdefena << 2));
        }
        true
    }

    fn update(&mut self, first_index: u8, regions: &[Region]) {
        for (i, r) in regions.iter().enumerate() {
            // SAFETY: region write while the MPU stays enabled is permitted
            // for a region not currently covering the executing code/stack
            // other than the guard-band being replaced, per the Cortex-M
            // MPU's documented `RNR`/`RBAR`/`RASR` write sequence.
            unsafe { self.write_region(first_index + i as u8, r) };
        }
    }

    fn clear(&mut self, first_index: u8, n: u8) {
        for i in first_index..first_index + n {
            unsafe {
                self.mpu.rnr.write(i as u32);
                self.mpu.rasr.write(0);
            }
        }
    }

    fn nextfree(&self, first_index: u8) -> Option<u8> {
        for i in first_index..8 {
            // SAFETY: RNR/RASR reads are side-effect-free.
            unsafe {
                self.mpu.rnr.write(i as u32);
                if self.mpu.rasr.read() & 1 == 0 {
                    return Some(i);
                }
            }
        }
        None
    }
}

impl CortexMMpu {
    /// # Safety
    /// Caller must not concurrently access the MPU registers from another
    /// context; held exclusively by the one `Scheduler` that owns this port.
    unsafe fn write_region(&mut self, index: u8, r: &Region) {
        self.mpu.rnr.write(index as u32);
        self.mpu.rbar.write(r.base_addr);
        let ap = match (r.priv_access, r.unpriv_access) {
            (Access::ReadWrite, Access::ReadWrite) => 0b011,
            (Access::ReadWrite, Access::None) => 0b001,
            (Access::Read, Access::Read) => 0b110,
            (Access::Read, Access::None) => 0b101,
            (Access::None, Access::None) => 0b000,
            _ => 0b110,
        };
        let rasr = 1u32
            | ((r.size_log2 as u32 - 1) << 1)
            | ((r.subregion_disable as u32) << 8)
            | (ap << 24)
            | (1 << 28); // XN: guard band is never executable
        self.mpu.rasr.write(rasr);
    }
}

pub struct CortexMPort {
    mpu: CortexMMpu,
    scb: SCB,
}

impl CortexMPort {
    /// # Safety
    /// Must be called at most once; takes ownership of the core
    /// peripherals, matching `cortex_m::Peripherals::take`'s own contract.
    pub unsafe fn new() -> Option<Self> {
        let p = Peripherals::take()?;
        Some(CortexMPort {
            mpu: CortexMMpu { mpu: p.MPU },
            scb: p.SCB,
        })
    }
}

impl Port for CortexMPort {
    type Mpu = CortexMMpu;

    fn idle(&mut self) {
        cortex_m::asm::wfe();
    }

    fn mpu(&mut self) -> &mut CortexMMpu {
        &mut self.mpu
    }

    fn set_scheduler_interrupt_lowest_priority(&mut self) {
        // SAFETY: PendSV's priority register is safe to write at any time;
        // it only takes effect the next time PendSV is pended.
        unsafe {
            self.scb.set_priority(cortex_m::peripheral::scb::SystemHandler::PendSV, PENDSV_LOWEST_PRIORITY);
        }
    }

    fn request_switch(&mut self) {
        SCB::set_pendsv();
    }

    fn on_guard_fault(&mut self, task: *mut Task) {
        // SAFETY: reported by `reschedule` with a live, currently-switching
        // task pointer.
        let id = unsafe { (*task).id() };
        #[cfg(feature = "defmt")]
        defmt::error!("guard-band canary mismatch on task {}", id);
        #[cfg(not(feature = "defmt"))]
        let _ = id;
        SCB::sys_reset();
    }
}
