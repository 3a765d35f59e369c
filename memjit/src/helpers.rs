//! Runtime helpers
//!
//! These functions are what `CallHelper` instructions reach: the embedder
//! callbacks selected by width, and the monitor operations wrapped around
//! them for the host-call exclusive family.
//!
//! Values travel as `u128` zero-extended from the access width; callbacks
//! report guest aborts as [`MemoryAbort`].

use crate::callbacks::{CallbackResult, MemoryAbort, MemoryCallbacks};
use crate::host::Width;
use crate::monitor::ExclusiveMonitor;

/// Read `width` bits at `vaddr` through the callbacks.
pub fn read(callbacks: &dyn MemoryCallbacks, width: Width, vaddr: u64) -> CallbackResult<u128> {
    Ok(match width {
        Width::B8 => callbacks.memory_read_8(vaddr)? as u128,
        Width::B16 => callbacks.memory_read_16(vaddr)? as u128,
        Width::B32 => callbacks.memory_read_32(vaddr)? as u128,
        Width::B64 => callbacks.memory_read_64(vaddr)? as u128,
        Width::B128 => callbacks.memory_read_128(vaddr)?,
    })
}

/// Write the low `width` bits of `value` at `vaddr` through the callbacks.
pub fn write(
    callbacks: &dyn MemoryCallbacks,
    width: Width,
    vaddr: u64,
    value: u128,
) -> CallbackResult<()> {
    match width {
        Width::B8 => callbacks.memory_write_8(vaddr, value as u8),
        Width::B16 => callbacks.memory_write_16(vaddr, value as u16),
        Width::B32 => callbacks.memory_write_32(vaddr, value as u32),
        Width::B64 => callbacks.memory_write_64(vaddr, value as u64),
        Width::B128 => callbacks.memory_write_128(vaddr, value),
    }
}

/// Conditional write: store `value` only if memory still holds `expected`.
pub fn write_exclusive(
    callbacks: &dyn MemoryCallbacks,
    width: Width,
    vaddr: u64,
    value: u128,
    expected: u128,
) -> CallbackResult<bool> {
    match width {
        Width::B8 => callbacks.memory_write_exclusive_8(vaddr, value as u8, expected as u8),
        Width::B16 => callbacks.memory_write_exclusive_16(vaddr, value as u16, expected as u16),
        Width::B32 => callbacks.memory_write_exclusive_32(vaddr, value as u32, expected as u32),
        Width::B64 => callbacks.memory_write_exclusive_64(vaddr, value as u64, expected as u64),
        Width::B128 => callbacks.memory_write_exclusive_128(vaddr, value, expected),
    }
}

/// Load-exclusive: read through the callbacks and mark the reservation.
pub fn exclusive_read(
    monitor: &ExclusiveMonitor,
    processor: usize,
    callbacks: &dyn MemoryCallbacks,
    width: Width,
    vaddr: u64,
) -> CallbackResult<u128> {
    monitor.read_and_mark(processor, vaddr, || read(callbacks, width, vaddr))
}

/// Store-exclusive: succeeds only if `processor` still holds a reservation
/// on `vaddr` and memory still holds the marked value.
pub fn exclusive_write(
    monitor: &ExclusiveMonitor,
    processor: usize,
    callbacks: &dyn MemoryCallbacks,
    width: Width,
    vaddr: u64,
    value: u128,
) -> CallbackResult<bool> {
    monitor.do_exclusive_operation(processor, vaddr, |expected| {
        write_exclusive(callbacks, width, vaddr, value, expected)
    })
}

/// Status register value generated code expects from a store-exclusive.
#[inline]
pub fn exclusive_status(result: &Result<bool, MemoryAbort>) -> u64 {
    match result {
        Ok(true) => 0,
        _ => 1,
    }
}
