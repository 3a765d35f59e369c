//! Error type shared by the emitters, the session and the host machine.

use thiserror::Error;

use crate::host::{HostAddr, HostReg, Width};

/// Errors raised while generating or running memory-access code.
///
/// Exclusive-store failures are not errors: they are reported to generated
/// code as a status value.
#[derive(Debug, Error)]
pub enum JitError {
    #[error("exclusive access emitted without a configured global monitor")]
    MonitorNotConfigured,

    #[error("{arch} does not support {bits}-bit memory accesses")]
    UnsupportedWidth { arch: &'static str, bits: u32 },

    #[error("{width:?} access cannot use operand {reg:?}")]
    OperandMismatch { width: Width, reg: HostReg },

    #[error("register allocator has no free {0} register")]
    OutOfRegisters(&'static str),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("state field at offset {offset} (size {size}) lies outside a {block}-byte state block")]
    StateLayout {
        offset: usize,
        size: usize,
        block: usize,
    },

    #[error("unrecoverable host fault at rip {rip} (address {addr:#x})\n{listing}")]
    UnrecoverableFault {
        rip: HostAddr,
        addr: u64,
        listing: String,
    },

    #[error("label {0} used before being bound")]
    UnboundLabel(usize),

    #[error("no host code at {0}")]
    BadCodeAddress(HostAddr),

    #[error("host stack underflow at {0}")]
    StackUnderflow(HostAddr),

    #[error("step limit of {0} host instructions exceeded")]
    StepLimit(u64),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, JitError>;
