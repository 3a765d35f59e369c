//! Host instruction set.

use super::code::Label;
use super::{Gpr, HostAddr, HostReg, Width, Xmm};

/// Effective address `base + index * scale + disp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address {
    pub base: Gpr,
    pub index: Option<(Gpr, u8)>,
    pub disp: i64,
}

impl Address {
    pub const fn base(base: Gpr) -> Self {
        Self {
            base,
            index: None,
            disp: 0,
        }
    }

    pub const fn base_index(base: Gpr, index: Gpr, scale: u8) -> Self {
        Self {
            base,
            index: Some((index, scale)),
            disp: 0,
        }
    }

    pub const fn with_disp(mut self, disp: i64) -> Self {
        self.disp = disp;
        self
    }
}

/// Branch condition on the zero flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    Zero,
    NotZero,
}

/// Host runtime routine reached through [`HostInst::CallHelper`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Helper {
    /// Embedder read callback.
    Read(Width),
    /// Embedder write callback.
    Write(Width),
    /// Monitor read-and-mark around the embedder read callback.
    ExclusiveRead(Width),
    /// Monitor compare-and-clear around the embedder exclusive-write callback.
    ExclusiveWrite(Width),
    /// Embedder exclusive-write callback alone; the caller already holds the
    /// monitor and has cleared the reservation.
    ExclusiveWriteFallback(Width),
}

/// Register operands of a helper call.
///
/// `value` is the destination for reads and the source for writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HelperArgs {
    pub vaddr: Gpr,
    pub value: HostReg,
    pub expected: Option<HostReg>,
    pub status: Option<Gpr>,
}

/// One host instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostInst {
    MovImm { dst: Gpr, imm: u64 },
    Mov { dst: Gpr, src: Gpr },
    /// `dst = hi:lo`
    MovToXmm { dst: Xmm, lo: Gpr, hi: Gpr },
    /// `hi:lo = src`
    MovFromXmm { lo: Gpr, hi: Gpr, src: Xmm },
    AndImm { dst: Gpr, imm: u64 },
    ShrImm { dst: Gpr, imm: u8 },
    Add { dst: Gpr, src: Gpr },
    /// `zf = (src & imm) == 0`
    TestImm { src: Gpr, imm: u64 },
    /// `zf = (a & b) == 0`
    Test { a: Gpr, b: Gpr },
    /// `zf = a == b`
    Cmp { a: Gpr, b: Gpr },
    /// `dst = cond ? 1 : 0`
    SetCond { cond: Cond, dst: Gpr },
    Jmp(Label),
    Jcc { cond: Cond, target: Label },
    Call(HostAddr),
    Ret,
    Push(Gpr),
    Pop(Gpr),

    /// Zero-extending load; 128-bit loads target a vector register.
    Load { width: Width, dst: HostReg, addr: Address },
    Store { width: Width, src: HostReg, addr: Address },
    /// Single-copy-atomic 128-bit load used for ordered accesses.
    AtomicLoad128 { dst: Xmm, addr: Address },
    /// Single-copy-atomic 128-bit store used for ordered accesses.
    AtomicStore128 { src: Xmm, addr: Address },
    Fence,
    /// Compare `rax` with memory and store `new` if equal; `zf` reports
    /// success, `rax` receives the current value on failure.
    LockCmpXchg { width: Width, addr: Address, new: Gpr },
    /// Compare `rdx:rax` with memory and store `rcx:rbx` if equal; `zf`
    /// reports success, `rdx:rax` receives the current value on failure.
    LockCmpXchg16b { addr: Address },

    /// Byte store into the processor state block.
    StateStore8 { offset: usize, imm: u8 },
    /// `zf = state[offset] == imm`
    StateCmp8 { offset: usize, imm: u8 },

    MonitorLock,
    MonitorUnlock,
    /// `zf = monitor.address[processor] == granule(vaddr)`
    MonitorCmpAddress { processor: usize, vaddr: Gpr },
    MonitorLoadValue {
        processor: usize,
        width: Width,
        dst: HostReg,
    },
    /// Records `(granule(vaddr), value)` as the processor's reservation.
    MonitorMark {
        processor: usize,
        vaddr: Gpr,
        width: Width,
        value: HostReg,
    },
    /// Clears every processor's reservation on the granule of `vaddr`.
    MonitorTestAndClear { vaddr: Gpr },

    CallHelper { helper: Helper, args: HelperArgs },
    /// Leaves the block with a memory abort if a callback requested a halt.
    ExitIfHalted { guest_pc: u64 },
}

impl HostInst {
    /// Whether this instruction dereferences host memory and can therefore
    /// raise a host memory fault.
    pub fn touches_host_memory(&self) -> bool {
        matches!(
            self,
            HostInst::Load { .. }
                | HostInst::Store { .. }
                | HostInst::AtomicLoad128 { .. }
                | HostInst::AtomicStore128 { .. }
                | HostInst::LockCmpXchg { .. }
                | HostInst::LockCmpXchg16b { .. }
        )
    }
}
