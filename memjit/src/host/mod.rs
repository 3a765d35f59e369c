//! Host machine model targeted by the code generator.
//!
//! Generated code runs on a fixed-width register machine whose register file
//! mirrors x86-64: sixteen 64-bit general-purpose registers and sixteen
//! 128-bit vector registers. Every instruction occupies one 4-byte slot, so a
//! host instruction address is `region base + 4 * index`.
//!
//! - [`inst`]: the instruction set
//! - [`code`]: append-only code buffers with labels
//! - [`memory`]: the flat host address space shared by all processors

pub mod code;
pub mod inst;
pub mod memory;

pub use code::{CodeArena, CodeBuffer, Label};
pub use inst::{Address, Cond, Helper, HelperArgs, HostInst};
pub use memory::{HostMemory, MemoryFault};

use serde::Serialize;
use std::fmt;

/// Size of one host instruction slot in bytes.
pub const INST_SIZE: u64 = 4;

/// Address of a host instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct HostAddr(pub u64);

impl HostAddr {
    /// Address of the instruction following this one.
    #[inline]
    pub const fn next(self) -> Self {
        HostAddr(self.0 + INST_SIZE)
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HostAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// General-purpose host register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[repr(u8)]
pub enum Gpr {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Gpr {
    pub const ALL: [Gpr; 16] = [
        Gpr::Rax,
        Gpr::Rcx,
        Gpr::Rdx,
        Gpr::Rbx,
        Gpr::Rsp,
        Gpr::Rbp,
        Gpr::Rsi,
        Gpr::Rdi,
        Gpr::R8,
        Gpr::R9,
        Gpr::R10,
        Gpr::R11,
        Gpr::R12,
        Gpr::R13,
        Gpr::R14,
        Gpr::R15,
    ];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn name(self) -> &'static str {
        match self {
            Gpr::Rax => "rax",
            Gpr::Rcx => "rcx",
            Gpr::Rdx => "rdx",
            Gpr::Rbx => "rbx",
            Gpr::Rsp => "rsp",
            Gpr::Rbp => "rbp",
            Gpr::Rsi => "rsi",
            Gpr::Rdi => "rdi",
            Gpr::R8 => "r8",
            Gpr::R9 => "r9",
            Gpr::R10 => "r10",
            Gpr::R11 => "r11",
            Gpr::R12 => "r12",
            Gpr::R13 => "r13",
            Gpr::R14 => "r14",
            Gpr::R15 => "r15",
        }
    }
}

/// 128-bit vector register (`xmm0`..`xmm15`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Xmm(pub u8);

impl Xmm {
    pub const COUNT: usize = 16;

    #[inline]
    pub const fn index(self) -> usize {
        (self.0 & 0xF) as usize
    }
}

/// Either kind of host register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum HostReg {
    Gpr(Gpr),
    Xmm(Xmm),
}

impl From<Gpr> for HostReg {
    fn from(gpr: Gpr) -> Self {
        HostReg::Gpr(gpr)
    }
}

impl From<Xmm> for HostReg {
    fn from(xmm: Xmm) -> Self {
        HostReg::Xmm(xmm)
    }
}

impl fmt::Display for HostReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostReg::Gpr(gpr) => f.write_str(gpr.name()),
            HostReg::Xmm(xmm) => write!(f, "xmm{}", xmm.index()),
        }
    }
}

/// Operand width of a memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Width {
    B8,
    B16,
    B32,
    B64,
    B128,
}

impl Width {
    pub const ALL: [Width; 5] = [Width::B8, Width::B16, Width::B32, Width::B64, Width::B128];

    #[inline]
    pub const fn bits(self) -> u32 {
        match self {
            Width::B8 => 8,
            Width::B16 => 16,
            Width::B32 => 32,
            Width::B64 => 64,
            Width::B128 => 128,
        }
    }

    #[inline]
    pub const fn bytes(self) -> usize {
        (self.bits() / 8) as usize
    }

    /// Mask selecting the low `bits()` bits of a value.
    #[inline]
    pub const fn mask(self) -> u128 {
        match self {
            Width::B128 => u128::MAX,
            _ => (1u128 << self.bits()) - 1,
        }
    }

    pub const fn from_bits(bits: u32) -> Option<Width> {
        match bits {
            8 => Some(Width::B8),
            16 => Some(Width::B16),
            32 => Some(Width::B32),
            64 => Some(Width::B64),
            128 => Some(Width::B128),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_addr_next() {
        assert_eq!(HostAddr(0x1000).next(), HostAddr(0x1004));
    }

    #[test]
    fn test_width_masks() {
        assert_eq!(Width::B8.mask(), 0xFF);
        assert_eq!(Width::B64.mask(), u64::MAX as u128);
        assert_eq!(Width::B128.mask(), u128::MAX);
        for width in Width::ALL {
            assert_eq!(Width::from_bits(width.bits()), Some(width));
        }
        assert_eq!(Width::from_bits(24), None);
    }

    #[test]
    fn test_gpr_order_matches_encoding() {
        for (i, gpr) in Gpr::ALL.iter().enumerate() {
            assert_eq!(gpr.index(), i);
        }
    }
}
