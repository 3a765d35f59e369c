//! Memory operations handed to the code generator.
//!
//! The frontend decodes guest instructions and assigns host registers; the
//! memory code generator only sees the resulting [`MemOp`]s, each carrying
//! its [`AccessDescriptor`] and the host registers holding its operands.

use crate::error::{JitError, Result};
use crate::guest::{GuestArch, LocationDescriptor};
use crate::host::{Gpr, HostReg, Width};

/// Ordering requirement derived from the guest instruction's access type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum AccessOrdering {
    Unordered,
    /// Acquire/release semantics: fenced before loads and after stores.
    Ordered,
}

/// What an access looks like to the emitters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccessDescriptor {
    pub width: Width,
    pub ordering: AccessOrdering,
    pub exclusive: bool,
}

impl AccessDescriptor {
    pub const fn new(width: Width, ordering: AccessOrdering) -> Self {
        Self {
            width,
            ordering,
            exclusive: false,
        }
    }

    pub const fn unordered(width: Width) -> Self {
        Self::new(width, AccessOrdering::Unordered)
    }

    pub const fn ordered(width: Width) -> Self {
        Self::new(width, AccessOrdering::Ordered)
    }

    pub const fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    #[inline]
    pub const fn is_ordered(&self) -> bool {
        matches!(self.ordering, AccessOrdering::Ordered)
    }
}

/// One guest memory operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemOp {
    Read {
        access: AccessDescriptor,
        vaddr: Gpr,
        dst: HostReg,
    },
    Write {
        access: AccessDescriptor,
        vaddr: Gpr,
        src: HostReg,
    },
    ExclusiveRead {
        access: AccessDescriptor,
        vaddr: Gpr,
        dst: HostReg,
    },
    /// `status` receives 0 on success and 1 on failure.
    ExclusiveWrite {
        access: AccessDescriptor,
        vaddr: Gpr,
        src: HostReg,
        status: Gpr,
    },
    /// Clears the processor's exclusive flag.
    ClearExclusive,
}

impl MemOp {
    pub fn read(access: AccessDescriptor, vaddr: Gpr, dst: impl Into<HostReg>) -> Self {
        MemOp::Read {
            access,
            vaddr,
            dst: dst.into(),
        }
    }

    pub fn write(access: AccessDescriptor, vaddr: Gpr, src: impl Into<HostReg>) -> Self {
        MemOp::Write {
            access,
            vaddr,
            src: src.into(),
        }
    }

    pub fn exclusive_read(access: AccessDescriptor, vaddr: Gpr, dst: impl Into<HostReg>) -> Self {
        MemOp::ExclusiveRead {
            access: access.exclusive(),
            vaddr,
            dst: dst.into(),
        }
    }

    pub fn exclusive_write(
        access: AccessDescriptor,
        vaddr: Gpr,
        src: impl Into<HostReg>,
        status: Gpr,
    ) -> Self {
        MemOp::ExclusiveWrite {
            access: access.exclusive(),
            vaddr,
            src: src.into(),
            status,
        }
    }

    pub fn access(&self) -> Option<AccessDescriptor> {
        match self {
            MemOp::Read { access, .. }
            | MemOp::Write { access, .. }
            | MemOp::ExclusiveRead { access, .. }
            | MemOp::ExclusiveWrite { access, .. } => Some(*access),
            MemOp::ClearExclusive => None,
        }
    }

    /// Host registers named by this operation.
    pub fn registers(&self) -> Vec<HostReg> {
        match *self {
            MemOp::Read { vaddr, dst, .. } | MemOp::ExclusiveRead { vaddr, dst, .. } => {
                vec![vaddr.into(), dst]
            }
            MemOp::Write { vaddr, src, .. } => vec![vaddr.into(), src],
            MemOp::ExclusiveWrite {
                vaddr, src, status, ..
            } => vec![vaddr.into(), src, status.into()],
            MemOp::ClearExclusive => Vec::new(),
        }
    }

    /// Check width support and operand kinds: 128-bit values live in vector
    /// registers, narrower values in general-purpose registers.
    pub fn validate<G: GuestArch>(&self) -> Result<()> {
        let Some(access) = self.access() else {
            return Ok(());
        };
        G::check_width(access.width)?;
        let value = match *self {
            MemOp::Read { dst, .. } | MemOp::ExclusiveRead { dst, .. } => dst,
            MemOp::Write { src, .. } | MemOp::ExclusiveWrite { src, .. } => src,
            MemOp::ClearExclusive => return Ok(()),
        };
        check_operand(access.width, value)?;
        if let MemOp::ExclusiveWrite { vaddr, status, .. } = *self {
            if status == vaddr || value == HostReg::Gpr(status) {
                return Err(JitError::OperandMismatch {
                    width: access.width,
                    reg: status.into(),
                });
            }
        }
        for gpr in self.registers().into_iter().filter_map(|reg| match reg {
            HostReg::Gpr(gpr) => Some(gpr),
            HostReg::Xmm(_) => None,
        }) {
            if gpr == Gpr::Rsp {
                return Err(JitError::OperandMismatch {
                    width: access.width,
                    reg: gpr.into(),
                });
            }
        }
        Ok(())
    }
}

pub(crate) fn check_operand(width: Width, reg: HostReg) -> Result<()> {
    match (width, reg) {
        (Width::B128, HostReg::Xmm(_)) => Ok(()),
        (Width::B128, _) | (_, HostReg::Xmm(_)) => Err(JitError::OperandMismatch { width, reg }),
        _ => Ok(()),
    }
}

/// A guest basic block reduced to its memory operations.
#[derive(Debug, Clone)]
pub struct Block {
    pub location: LocationDescriptor,
    pub ops: Vec<MemOp>,
    /// Registers whose values are live across the whole block in addition
    /// to the operands of `ops`.
    pub live_in: Vec<HostReg>,
}

impl Block {
    pub fn new(location: LocationDescriptor) -> Self {
        Self {
            location,
            ops: Vec::new(),
            live_in: Vec::new(),
        }
    }

    pub fn with_ops(location: LocationDescriptor, ops: Vec<MemOp>) -> Self {
        Self {
            location,
            ops,
            live_in: Vec::new(),
        }
    }

    pub fn push(&mut self, op: MemOp) -> &mut Self {
        self.ops.push(op);
        self
    }

    /// Guest PC of the `index`-th operation.
    pub fn guest_pc<G: GuestArch>(&self, index: usize) -> u64 {
        self.location
            .0
            .wrapping_add(G::INSTRUCTION_SIZE * index as u64)
    }
}
