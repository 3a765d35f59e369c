//! Register allocator contract.
//!
//! The general register allocator belongs to the surrounding translator. The
//! memory emitters only need temporaries for the duration of one operation
//! and, for wide exclusive stores, specific registers demanded by the host
//! compare-exchange instruction.

use crate::error::{JitError, Result};
use crate::host::{Gpr, HostReg, Xmm};

/// What the memory emitters ask of the register allocator.
pub trait RegAlloc {
    /// A general-purpose register holding no live value, free until
    /// [`end_of_instruction`](RegAlloc::end_of_instruction).
    fn scratch_gpr(&mut self) -> Result<Gpr>;

    /// A vector register holding no live value.
    fn scratch_xmm(&mut self) -> Result<Xmm>;

    /// Take `gpr` as a temporary for the current operation.
    ///
    /// Returns `true` when `gpr` holds a live value; the caller must then
    /// save and restore it around its use.
    fn claim_gpr(&mut self, gpr: Gpr) -> Result<bool>;

    /// Release every temporary handed out for the current operation.
    fn end_of_instruction(&mut self);
}

/// Preference order for temporaries: caller-saved registers the frontend
/// rarely assigns first, the compare-exchange quartet last.
const SCRATCH_ORDER: [Gpr; 14] = [
    Gpr::R10,
    Gpr::R11,
    Gpr::R12,
    Gpr::R13,
    Gpr::R14,
    Gpr::R8,
    Gpr::R9,
    Gpr::Rsi,
    Gpr::Rdi,
    Gpr::Rbp,
    Gpr::Rbx,
    Gpr::Rcx,
    Gpr::Rdx,
    Gpr::Rax,
];

/// Allocator for a block whose register assignment is already fixed.
///
/// Every register named by the block is treated as live for the whole block.
/// `rsp` is the host stack pointer and `r15` is reserved for the translator's
/// own bookkeeping; neither is ever handed out.
#[derive(Debug, Clone)]
pub struct LinearRegAlloc {
    live_gpr: u16,
    live_xmm: u16,
    taken_gpr: u16,
    taken_xmm: u16,
}

impl LinearRegAlloc {
    pub fn new(live: impl IntoIterator<Item = HostReg>) -> Self {
        let mut alloc = Self {
            live_gpr: 0,
            live_xmm: 0,
            taken_gpr: 0,
            taken_xmm: 0,
        };
        for reg in live {
            match reg {
                HostReg::Gpr(gpr) => alloc.live_gpr |= 1 << gpr.index(),
                HostReg::Xmm(xmm) => alloc.live_xmm |= 1 << xmm.index(),
            }
        }
        alloc
    }

    pub fn is_live(&self, gpr: Gpr) -> bool {
        self.live_gpr & (1 << gpr.index()) != 0
    }

    fn busy_gpr(&self) -> u16 {
        self.live_gpr | self.taken_gpr | 1 << Gpr::Rsp.index() | 1 << Gpr::R15.index()
    }
}

impl RegAlloc for LinearRegAlloc {
    fn scratch_gpr(&mut self) -> Result<Gpr> {
        let busy = self.busy_gpr();
        let gpr = SCRATCH_ORDER
            .iter()
            .copied()
            .find(|gpr| busy & (1 << gpr.index()) == 0)
            .ok_or(JitError::OutOfRegisters("general-purpose"))?;
        self.taken_gpr |= 1 << gpr.index();
        Ok(gpr)
    }

    fn scratch_xmm(&mut self) -> Result<Xmm> {
        let busy = self.live_xmm | self.taken_xmm;
        let index = (0..Xmm::COUNT)
            .find(|i| busy & (1 << i) == 0)
            .ok_or(JitError::OutOfRegisters("vector"))?;
        self.taken_xmm |= 1 << index;
        Ok(Xmm(index as u8))
    }

    fn claim_gpr(&mut self, gpr: Gpr) -> Result<bool> {
        let bit = 1 << gpr.index();
        if self.taken_gpr & bit != 0 || matches!(gpr, Gpr::Rsp | Gpr::R15) {
            return Err(JitError::OutOfRegisters(gpr.name()));
        }
        self.taken_gpr |= bit;
        Ok(self.live_gpr & bit != 0)
    }

    fn end_of_instruction(&mut self) {
        self.taken_gpr = 0;
        self.taken_xmm = 0;
    }
}
