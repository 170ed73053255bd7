/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Anillo OS authors
 */

//! Memory management.
//!
//! Three layers, lowest first: [`frame`] owns physical memory, [`address_space`]
//! owns translation and per-space virtual ranges, and [`pool`] serves
//! sub-page kernel objects on top of both.

pub mod address_space;
pub mod frame;
pub mod pool;

pub use {
    address_space::AddressSpace,
    frame::{FrameAllocator, FrameRegion},
    pool::{Allocation, MemoryPool, PoolFlags},
};
