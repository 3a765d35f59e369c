//! Per-processor persistent state block.
//!
//! Generated code reads and writes a handful of bytes in the processor's
//! state block directly. Offsets are validated once, when the guest
//! architecture builds its [`StateLayout`], and carried around as typed
//! [`StateField`]s so no emission site hardcodes an offset.
//!
//! ## A64 layout
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │ Offset │ Size  │ Field                         │
//! ├────────────────────────────────────────────────┤
//! │ 0x000  │ 0x100 │ X0..X30 + SP                  │
//! │ 0x100  │ 0x008 │ PC                            │
//! │ 0x108  │ 0x001 │ halt reason                   │
//! │ 0x109  │ 0x001 │ exclusive state               │
//! │ 0x10A  │ 0x006 │ reserved                      │
//! └────────────────────────────────────────────────┘
//! ```
//!
//! A32 uses the same shape after sixteen 32-bit registers (PC at 0x40).

use std::marker::PhantomData;

use crate::error::{JitError, Result};

/// Halt reason bits stored in the state block.
pub mod halt_reasons {
    /// A memory callback reported a guest access violation.
    pub const MEMORY_ABORT: u8 = 1 << 0;
}

/// A64 state block offsets.
pub mod a64_offsets {
    pub const PC: usize = 0x100;
    pub const HALT_REASON: usize = 0x108;
    pub const EXCLUSIVE_STATE: usize = 0x109;
    pub const SIZE: usize = 0x110;
}

/// A32 state block offsets.
pub mod a32_offsets {
    pub const PC: usize = 0x40;
    pub const HALT_REASON: usize = 0x48;
    pub const EXCLUSIVE_STATE: usize = 0x49;
    pub const SIZE: usize = 0x50;
}

/// Scalar that can live in the state block.
pub trait StateScalar: Copy {
    const SIZE: usize;
    fn read_le(bytes: &[u8]) -> Self;
    fn write_le(self, bytes: &mut [u8]);
}

macro_rules! impl_state_scalar {
    ($($ty:ty),*) => {$(
        impl StateScalar for $ty {
            const SIZE: usize = std::mem::size_of::<$ty>();

            fn read_le(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(&bytes[..Self::SIZE]);
                <$ty>::from_le_bytes(raw)
            }

            fn write_le(self, bytes: &mut [u8]) {
                bytes[..Self::SIZE].copy_from_slice(&self.to_le_bytes());
            }
        }
    )*};
}

impl_state_scalar!(u8, u32, u64);

/// Validated offset of a `T` inside the state block.
#[derive(Debug)]
pub struct StateField<T> {
    offset: usize,
    marker: PhantomData<fn() -> T>,
}

impl<T> Clone for StateField<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for StateField<T> {}

impl<T: StateScalar> StateField<T> {
    /// Check that a `T` at `offset` fits in a block of `block_size` bytes.
    pub fn new(offset: usize, block_size: usize) -> Result<Self> {
        match offset.checked_add(T::SIZE) {
            Some(end) if end <= block_size => Ok(Self {
                offset,
                marker: PhantomData,
            }),
            _ => Err(JitError::StateLayout {
                offset,
                size: T::SIZE,
                block: block_size,
            }),
        }
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }
}

/// Fields of the state block touched by memory-access code.
#[derive(Debug, Clone, Copy)]
pub struct StateLayout {
    pub size: usize,
    pub pc: StateField<u64>,
    pub halt_reason: StateField<u8>,
    pub exclusive_state: StateField<u8>,
}

impl StateLayout {
    pub fn new(size: usize, pc: usize, halt_reason: usize, exclusive_state: usize) -> Result<Self> {
        Ok(Self {
            size,
            pc: StateField::new(pc, size)?,
            halt_reason: StateField::new(halt_reason, size)?,
            exclusive_state: StateField::new(exclusive_state, size)?,
        })
    }
}

/// Opaque per-processor state block.
#[derive(Debug, Clone)]
pub struct ProcessorState {
    layout: StateLayout,
    bytes: Vec<u8>,
}

impl ProcessorState {
    pub fn new(layout: StateLayout) -> Self {
        Self {
            layout,
            bytes: vec![0; layout.size],
        }
    }

    pub fn layout(&self) -> &StateLayout {
        &self.layout
    }

    pub fn get<T: StateScalar>(&self, field: StateField<T>) -> T {
        T::read_le(&self.bytes[field.offset()..])
    }

    pub fn set<T: StateScalar>(&mut self, field: StateField<T>, value: T) {
        value.write_le(&mut self.bytes[field.offset()..]);
    }

    /// Raw byte access used by generated code; out-of-range offsets are a
    /// layout bug.
    pub(crate) fn byte(&self, offset: usize) -> Result<u8> {
        self.bytes.get(offset).copied().ok_or(JitError::StateLayout {
            offset,
            size: 1,
            block: self.bytes.len(),
        })
    }

    pub(crate) fn set_byte(&mut self, offset: usize, value: u8) -> Result<()> {
        let block = self.bytes.len();
        let slot = self.bytes.get_mut(offset).ok_or(JitError::StateLayout {
            offset,
            size: 1,
            block,
        })?;
        *slot = value;
        Ok(())
    }

    pub fn exclusive_state(&self) -> bool {
        self.get(self.layout.exclusive_state) != 0
    }

    pub fn set_exclusive_state(&mut self, set: bool) {
        let field = self.layout.exclusive_state;
        self.set(field, set as u8);
    }

    pub fn halt_reason(&self) -> u8 {
        self.get(self.layout.halt_reason)
    }

    pub fn raise_halt(&mut self, reason: u8) {
        let field = self.layout.halt_reason;
        let current = self.get(field);
        self.set(field, current | reason);
    }

    pub fn clear_halt(&mut self) {
        let field = self.layout.halt_reason;
        self.set(field, 0);
    }

    pub fn pc(&self) -> u64 {
        self.get(self.layout.pc)
    }

    pub fn set_pc(&mut self, pc: u64) {
        let field = self.layout.pc;
        self.set(field, pc);
    }
}
