/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Anillo OS authors
 */

//! The kernel-wide status taxonomy.
//!
//! Every fallible nucleus operation returns one of these values; success is
//! `Result::Ok`. Recoverable conditions (full queue, timeout, exhausted
//! memory) propagate to the caller unchanged; violated invariants panic
//! instead of surfacing here.

use {machine::memory::mmu::MapError, snafu::Snafu};

//--------------------------------------------------------------------------------------------------
// Public Definitions
//--------------------------------------------------------------------------------------------------

/// Enumerated kernel errors.
#[derive(Debug, Snafu, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Caller bug: bad size, bad flag combination, bad handle.
    InvalidArgument,
    /// No memory (or no bucket can satisfy the request); caller may retry
    /// after releasing resources.
    ResourceExhausted,
    /// The resource is busy or was raced away; caller may retry
    /// immediately.
    TemporaryOutage,
    /// The resource is gone: thread dead, peer closed, server torn down.
    PermanentOutage,
    /// The requested state already holds or is already pending.
    AlreadyInProgress,
    /// Named lookup miss.
    NoSuchResource,
    /// A no-wait operation would have had to block.
    WouldBlock,
    /// A timed wait elapsed without the event occurring.
    Timeout,
    /// The operation was cancelled by peer action.
    Cancelled,
    /// A supplied buffer is too small; required sizes are reported through
    /// the operation's out-parameters.
    TooBig,
    /// Atomic-retry marker: the caller must restart the sequence from the
    /// beginning.
    ShouldRestart,
}

/// Shorthand used across the nucleus.
pub type Result<T> = core::result::Result<T, Status>;

//--------------------------------------------------------------------------------------------------
// Public Code
//--------------------------------------------------------------------------------------------------

impl From<MapError> for Status {
    fn from(err: MapError) -> Self {
        match err {
            MapError::TableExhausted => Status::ResourceExhausted,
            // A racing reservation may clear; a block-overlap never will.
            MapError::AlreadyMapped => Status::TemporaryOutage,
            MapError::BlockOverlap => Status::InvalidArgument,
            MapError::NotMapped => Status::NoSuchResource,
        }
    }
}
