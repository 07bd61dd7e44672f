//! Platform consumers of the shared-memory heap.
//!
//! Boot firmware publishes a handful of well-known items into the shared
//! heap before this processor starts. This crate reads the two every boot
//! needs, through the heap's narrow read interface only:
//!
//! - the usable-RAM partition table, turned into a sorted DRAM bank list
//!   with a fallback to the firmware-provided memory map ([`dram`]);
//! - the hardware/software build id, carrying the device serial number
//!   ([`socinfo`]).
//!
//! Lookup failures here are recoverable by design: a missing or not-yet
//! populated item means "use the fallback source", never a fatal boot
//! error.

#![no_std]

#[cfg(test)]
#[macro_use]
extern crate std;

pub mod dram;
pub mod socinfo;

use smem::SmemError;
use thiserror::Error;

/// Errors reported by the platform item readers.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PlatformError {
    /// The underlying heap lookup failed.
    #[error("shared memory lookup failed: {0}")]
    Smem(#[from] SmemError),
    /// Neither the heap item nor the fallback produced a memory map.
    #[error("no usable memory map from any source")]
    NoMemoryMap,
    /// The item is too small for the fields this revision expects.
    #[error("item too small for the requested field")]
    Truncated,
}

pub type Result<T> = core::result::Result<T, PlatformError>;
