/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Anillo OS authors
 */

//! Hardware seam layer for the Anillo nucleus.
//!
//! Everything the core kernel must ask the machine for (typed addresses,
//! translation tables, the saved CPU context, interrupt masking, the
//! monotonic clock) is defined here as data types plus `interface` traits.
//! Production implementations of those traits live in the per-architecture
//! shims; the `hosted` feature provides in-memory implementations so the
//! nucleus can be exercised on a development host.

#![cfg_attr(not(any(test, feature = "hosted")), no_std)]
#![allow(clippy::upper_case_acronyms)]
#![allow(missing_docs)] // Temp: switch to deny

extern crate alloc;

pub mod cpu;
pub mod exception;
pub mod memory;
pub mod mm;
pub mod synchronization;
pub mod time;

cfg_if::cfg_if! {
    if #[cfg(feature = "hosted")] {
        pub mod hosted;
    }
}

/// Version string.
pub fn version() -> &'static str {
    concat!(
        env!("CARGO_PKG_NAME"),
        " version ",
        env!("CARGO_PKG_VERSION")
    )
}
