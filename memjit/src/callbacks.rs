//! Embedder memory callbacks.
//!
//! The callback table is the slow path of every strategy and the only path
//! when neither fastmem nor a page table is configured. Callbacks may report
//! a guest access violation with [`MemoryAbort`]; generated code then halts
//! the block after the access.

use std::sync::Arc;
use thiserror::Error;

use crate::host::{HostMemory, Width};

/// Guest-level access violation reported by a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("guest memory abort at {vaddr:#x}")]
pub struct MemoryAbort {
    pub vaddr: u64,
}

pub type CallbackResult<T> = Result<T, MemoryAbort>;

/// Guest memory access functions, selected by width and direction.
///
/// `memory_write_exclusive_*` must store `value` only if memory still holds
/// `expected`, atomically, and return whether the store happened.
pub trait MemoryCallbacks: Send + Sync {
    fn memory_read_8(&self, vaddr: u64) -> CallbackResult<u8>;
    fn memory_read_16(&self, vaddr: u64) -> CallbackResult<u16>;
    fn memory_read_32(&self, vaddr: u64) -> CallbackResult<u32>;
    fn memory_read_64(&self, vaddr: u64) -> CallbackResult<u64>;

    fn memory_read_128(&self, vaddr: u64) -> CallbackResult<u128> {
        let lo = self.memory_read_64(vaddr)?;
        let hi = self.memory_read_64(vaddr.wrapping_add(8))?;
        Ok((hi as u128) << 64 | lo as u128)
    }

    fn memory_write_8(&self, vaddr: u64, value: u8) -> CallbackResult<()>;
    fn memory_write_16(&self, vaddr: u64, value: u16) -> CallbackResult<()>;
    fn memory_write_32(&self, vaddr: u64, value: u32) -> CallbackResult<()>;
    fn memory_write_64(&self, vaddr: u64, value: u64) -> CallbackResult<()>;

    fn memory_write_128(&self, vaddr: u64, value: u128) -> CallbackResult<()> {
        self.memory_write_64(vaddr, value as u64)?;
        self.memory_write_64(vaddr.wrapping_add(8), (value >> 64) as u64)
    }

    fn memory_write_exclusive_8(&self, vaddr: u64, value: u8, expected: u8) -> CallbackResult<bool>;
    fn memory_write_exclusive_16(
        &self,
        vaddr: u64,
        value: u16,
        expected: u16,
    ) -> CallbackResult<bool>;
    fn memory_write_exclusive_32(
        &self,
        vaddr: u64,
        value: u32,
        expected: u32,
    ) -> CallbackResult<bool>;
    fn memory_write_exclusive_64(
        &self,
        vaddr: u64,
        value: u64,
        expected: u64,
    ) -> CallbackResult<bool>;
    fn memory_write_exclusive_128(
        &self,
        vaddr: u64,
        value: u128,
        expected: u128,
    ) -> CallbackResult<bool>;
}

/// Guest RAM backed by one contiguous block of host memory: guest address
/// `v` lives at host address `base + v` for `v < size`.
///
/// This is the same mapping fastmem assumes, which makes it the natural
/// callback table for an embedder that also enables fastmem.
pub struct ArenaCallbacks {
    memory: Arc<HostMemory>,
    base: u64,
    size: u64,
}

impl ArenaCallbacks {
    pub fn new(memory: Arc<HostMemory>, base: u64, size: u64) -> Self {
        Self { memory, base, size }
    }

    fn host(&self, vaddr: u64, width: Width) -> CallbackResult<u64> {
        match vaddr.checked_add(width.bytes() as u64) {
            Some(end) if end <= self.size => Ok(self.base + vaddr),
            _ => Err(MemoryAbort { vaddr }),
        }
    }

    fn load(&self, vaddr: u64, width: Width) -> CallbackResult<u128> {
        let host = self.host(vaddr, width)?;
        self.memory.read(host, width).map_err(|_| MemoryAbort { vaddr })
    }

    fn store(&self, vaddr: u64, width: Width, value: u128) -> CallbackResult<()> {
        let host = self.host(vaddr, width)?;
        self.memory
            .write(host, width, value)
            .map_err(|_| MemoryAbort { vaddr })
    }

    fn cas(&self, vaddr: u64, width: Width, value: u128, expected: u128) -> CallbackResult<bool> {
        let host = self.host(vaddr, width)?;
        self.memory
            .compare_exchange(host, width, expected, value)
            .map(|outcome| outcome.is_ok())
            .map_err(|_| MemoryAbort { vaddr })
    }
}

impl MemoryCallbacks for ArenaCallbacks {
    fn memory_read_8(&self, vaddr: u64) -> CallbackResult<u8> {
        self.load(vaddr, Width::B8).map(|v| v as u8)
    }

    fn memory_read_16(&self, vaddr: u64) -> CallbackResult<u16> {
        self.load(vaddr, Width::B16).map(|v| v as u16)
    }

    fn memory_read_32(&self, vaddr: u64) -> CallbackResult<u32> {
        self.load(vaddr, Width::B32).map(|v| v as u32)
    }

    fn memory_read_64(&self, vaddr: u64) -> CallbackResult<u64> {
        self.load(vaddr, Width::B64).map(|v| v as u64)
    }

    fn memory_read_128(&self, vaddr: u64) -> CallbackResult<u128> {
        self.load(vaddr, Width::B128)
    }

    fn memory_write_8(&self, vaddr: u64, value: u8) -> CallbackResult<()> {
        self.store(vaddr, Width::B8, value as u128)
    }

    fn memory_write_16(&self, vaddr: u64, value: u16) -> CallbackResult<()> {
        self.store(vaddr, Width::B16, value as u128)
    }

    fn memory_write_32(&self, vaddr: u64, value: u32) -> CallbackResult<()> {
        self.store(vaddr, Width::B32, value as u128)
    }

    fn memory_write_64(&self, vaddr: u64, value: u64) -> CallbackResult<()> {
        self.store(vaddr, Width::B64, value as u128)
    }

    fn memory_write_128(&self, vaddr: u64, value: u128) -> CallbackResult<()> {
        self.store(vaddr, Width::B128, value)
    }

    fn memory_write_exclusive_8(
        &self,
        vaddr: u64,
        value: u8,
        expected: u8,
    ) -> CallbackResult<bool> {
        self.cas(vaddr, Width::B8, value as u128, expected as u128)
    }

    fn memory_write_exclusive_16(
        &self,
        vaddr: u64,
        value: u16,
        expected: u16,
    ) -> CallbackResult<bool> {
        self.cas(vaddr, Width::B16, value as u128, expected as u128)
    }

    fn memory_write_exclusive_32(
        &self,
        vaddr: u64,
        value: u32,
        expected: u32,
    ) -> CallbackResult<bool> {
        self.cas(vaddr, Width::B32, value as u128, expected as u128)
    }

    fn memory_write_exclusive_64(
        &self,
        vaddr: u64,
        value: u64,
        expected: u64,
    ) -> CallbackResult<bool> {
        self.cas(vaddr, Width::B64, value as u128, expected as u128)
    }

    fn memory_write_exclusive_128(
        &self,
        vaddr: u64,
        value: u128,
        expected: u128,
    ) -> CallbackResult<bool> {
        self.cas(vaddr, Width::B128, value, expected)
    }
}
