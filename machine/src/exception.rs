/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Anillo OS authors
 */

//! Exception handling seams.
//!
//! Only the asynchronous (IRQ) side is needed by the nucleus: every kernel
//! spinlock masks local interrupts for its critical section, and the
//! masking itself is architecture work that registers here at boot.

pub mod asynchronous {
    use {alloc::boxed::Box, once_cell::race::OnceBox};

    //----------------------------------------------------------------------------------------------
    // Public Definitions
    //----------------------------------------------------------------------------------------------

    /// Opaque saved-interrupt-state token, as produced by the architecture
    /// (DAIF on AArch64, RFLAGS.IF on x86-64).
    pub type IrqState = u64;

    /// Asynchronous exception seam interfaces.
    pub mod interface {
        use super::IrqState;

        /// Local IRQ masking for the executing CPU.
        pub trait IrqMask: Send + Sync {
            /// Whether local IRQs are currently masked.
            fn is_masked(&self) -> bool;

            /// Mask local IRQs, returning the previous state.
            fn mask_save(&self) -> IrqState;

            /// Restore a state previously returned by
            /// [`Self::mask_save`].
            fn restore(&self, saved: IrqState);
        }
    }

    //----------------------------------------------------------------------------------------------
    // Public Code
    //----------------------------------------------------------------------------------------------

    static IRQ_MASK: OnceBox<&'static dyn interface::IrqMask> = OnceBox::new();

    /// Install the architecture's IRQ masking implementation. Boot-time,
    /// once.
    pub fn register_irq_mask(mask: &'static dyn interface::IrqMask) {
        if IRQ_MASK.set(Box::new(mask)).is_err() {
            panic!("IRQ mask implementation registered twice");
        }
    }

    fn irq_mask() -> Option<&'static dyn interface::IrqMask> {
        IRQ_MASK.get().copied()
    }

    /// Whether local IRQs are masked. Before registration (early boot,
    /// plain unit tests) they are considered unmasked.
    pub fn is_local_irq_masked() -> bool {
        irq_mask().map(|m| m.is_masked()).unwrap_or(false)
    }

    /// Mask local IRQs and return the state to restore later.
    pub fn local_irq_mask_save() -> IrqState {
        irq_mask().map(|m| m.mask_save()).unwrap_or(0)
    }

    /// Restore a saved IRQ state.
    pub fn local_irq_restore(saved: IrqState) {
        if let Some(m) = irq_mask() {
            m.restore(saved);
        }
    }

    /// Executes the provided closure while local IRQs are masked.
    pub fn exec_with_irq_masked<R>(f: impl FnOnce() -> R) -> R {
        let saved = local_irq_mask_save();
        let ret = f();
        local_irq_restore(saved);

        ret
    }
}
