//! Guest architecture parameterization.
//!
//! Every emitter is generic over a [`GuestArch`], which supplies the
//! guest's address width, the widest access it can issue and the layout of
//! its processor state block.

use serde::Serialize;
use std::fmt;

use crate::error::{JitError, Result};
use crate::host::Width;
use crate::state::{a32_offsets, a64_offsets, StateLayout};

/// Identity of a compiled basic block: the guest location it starts at,
/// including any mode bits the frontend folds into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct LocationDescriptor(pub u64);

impl fmt::Display for LocationDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{:016x}}}", self.0)
    }
}

/// Guest-specific facts needed by the memory emitters.
pub trait GuestArch: Send + Sync + 'static {
    const NAME: &'static str;

    /// Number of significant bits in a guest virtual address.
    const ADDRESS_BITS: u32;

    /// Widest memory access the guest can issue.
    const MAX_WIDTH: Width;

    /// Size in bytes of one guest instruction, used to derive guest PCs of
    /// access sites.
    const INSTRUCTION_SIZE: u64;

    fn state_layout() -> Result<StateLayout>;

    fn check_width(width: Width) -> Result<()> {
        if width > Self::MAX_WIDTH {
            Err(JitError::UnsupportedWidth {
                arch: Self::NAME,
                bits: width.bits(),
            })
        } else {
            Ok(())
        }
    }
}

/// 32-bit ARM guest.
#[derive(Debug, Clone, Copy, Default)]
pub struct A32;

impl GuestArch for A32 {
    const NAME: &'static str = "A32";
    const ADDRESS_BITS: u32 = 32;
    const MAX_WIDTH: Width = Width::B64;
    const INSTRUCTION_SIZE: u64 = 4;

    fn state_layout() -> Result<StateLayout> {
        StateLayout::new(
            a32_offsets::SIZE,
            a32_offsets::PC,
            a32_offsets::HALT_REASON,
            a32_offsets::EXCLUSIVE_STATE,
        )
    }
}

/// 64-bit ARM guest.
#[derive(Debug, Clone, Copy, Default)]
pub struct A64;

impl GuestArch for A64 {
    const NAME: &'static str = "A64";
    const ADDRESS_BITS: u32 = 64;
    const MAX_WIDTH: Width = Width::B128;
    const INSTRUCTION_SIZE: u64 = 4;

    fn state_layout() -> Result<StateLayout> {
        StateLayout::new(
            a64_offsets::SIZE,
            a64_offsets::PC,
            a64_offsets::HALT_REASON,
            a64_offsets::EXCLUSIVE_STATE,
        )
    }
}
