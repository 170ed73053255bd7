/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Anillo OS authors
 */

//! CPU identity, the saved execution context, and the context-switch seam.
//!
//! The scheduler decides *which* thread runs next; the architecture decides
//! *how* the register state moves. The three switch flavors of
//! [`interface::CpuOps`] are the only way kernel code ever reaches the
//! register-saving assembly.

use {core::time::Duration, static_assertions::const_assert_eq};

//--------------------------------------------------------------------------------------------------
// Public Definitions
//--------------------------------------------------------------------------------------------------

/// Logical index of a CPU, dense from zero.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CpuId(usize);

/// Saved floating-point/vector state, in the architecture's save-area
/// format (FXSAVE-compatible sizing).
#[repr(C, align(16))]
#[derive(Clone)]
pub struct FpArea {
    pub data: [u8; 512],
}

/// General-purpose register count in the saved context.
pub const GP_REGS: usize = 16;

/// A thread's saved execution state.
///
/// Written out on the switch-from path and loaded on the switch-to path;
/// never mutated while its thread is running.
#[repr(C)]
#[derive(Clone)]
pub struct ExecutionContext {
    /// Program counter to resume at.
    pub pc: u64,
    /// Stack pointer.
    pub sp: u64,
    /// Architectural flags word (RFLAGS / PSTATE).
    pub cpu_flags: u64,
    /// General-purpose registers.
    pub gp: [u64; GP_REGS],
    /// Interrupt-disable nesting depth to restore.
    pub interrupt_disable: u32,
    /// Whether the context runs privileged. A privilege change on the way
    /// out is what triggers the GS-base swap on x86-64.
    pub privileged: bool,
    /// Floating-point/vector save area.
    pub fp: FpArea,
}

/// The register file pushed by an interrupt entry, patched in place for a
/// delayed switch.
#[repr(C)]
#[derive(Clone)]
pub struct InterruptFrame {
    pub pc: u64,
    pub sp: u64,
    pub cpu_flags: u64,
    pub gp: [u64; GP_REGS],
}

/// Context-switch seam interfaces.
pub mod interface {
    use super::{CpuId, Duration, ExecutionContext, InterruptFrame};

    /// Per-architecture CPU operations.
    ///
    /// # Safety
    ///
    /// The switch entry points consume and produce raw register state; the
    /// scheduler must guarantee `from`/`to` point at live, exclusively
    /// owned contexts.
    pub unsafe trait CpuOps: Send + Sync {
        /// The CPU executing the caller.
        fn current(&self) -> CpuId;

        /// Number of CPUs brought up at boot.
        fn count(&self) -> usize;

        /// Immediate (voluntary) switch: write the caller's state to
        /// `from`, load `to`, continue there.
        unsafe fn switch_immediate(&self, from: *mut ExecutionContext, to: *const ExecutionContext);

        /// Delayed switch from inside an interrupt: save the interrupted
        /// state from `frame` into `from`, then patch `frame` so the
        /// interrupt return lands in `to`.
        unsafe fn switch_deferred(
            &self,
            frame: *mut InterruptFrame,
            from: *mut ExecutionContext,
            to: *const ExecutionContext,
        );

        /// Bootstrap switch: no current thread; synthesize `frame` from
        /// `to` and return through it.
        unsafe fn switch_bootstrap(&self, frame: *mut InterruptFrame, to: *const ExecutionContext);

        /// Arm the per-CPU preemption timer to fire once after `after`.
        fn arm_preemption_timer(&self, after: Duration);
    }
}

//--------------------------------------------------------------------------------------------------
// Public Code
//--------------------------------------------------------------------------------------------------

const_assert_eq!(core::mem::size_of::<FpArea>(), 512);
const_assert_eq!(core::mem::align_of::<FpArea>(), 16);

impl CpuId {
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl FpArea {
    /// Fresh state with all exceptions masked (x87 FCW 0x037f, MXCSR
    /// 0x1f80).
    pub const fn initial() -> Self {
        let mut data = [0u8; 512];
        data[0] = 0x7f;
        data[1] = 0x03;
        data[24] = 0x80;
        data[25] = 0x1f;
        Self { data }
    }
}

impl Default for FpArea {
    fn default() -> Self {
        Self::initial()
    }
}

impl ExecutionContext {
    /// Context that will begin execution at `pc` on stack `sp`, privileged,
    /// with interrupts deliverable.
    pub fn at_entry(pc: u64, sp: u64) -> Self {
        Self {
            pc,
            sp,
            cpu_flags: 0,
            gp: [0; GP_REGS],
            interrupt_disable: 0,
            privileged: true,
            fp: FpArea::initial(),
        }
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::at_entry(0, 0)
    }
}

impl Default for InterruptFrame {
    fn default() -> Self {
        Self {
            pc: 0,
            sp: 0,
            cpu_flags: 0,
            gp: [0; GP_REGS],
        }
    }
}
