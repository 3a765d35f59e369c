//! Memory-access code generation for a dynamic binary translator.
//!
//! Guest loads, stores and exclusive accesses are compiled to host code
//! using one of three strategies per access site:
//!
//! - fastmem: a direct host access at `fastmem_pointer + vaddr`, recovered
//!   through the fault ledger when the host page is not backed
//! - page table: a software lookup in an embedder-owned table
//! - callbacks: a call into the embedder's memory functions
//!
//! A [`CodegenSession`] compiles [`Block`]s of [`MemOp`]s and resolves host
//! faults; a [`HostMachine`] runs the generated code for one processor.

pub mod cache;
pub mod callbacks;
pub mod compiler;
pub mod deferred;
pub mod disasm;
pub mod emit;
pub mod error;
pub mod guest;
pub mod helpers;
pub mod host;
pub mod ir;
pub mod ledger;
pub mod monitor;
pub mod regalloc;
pub mod runtime;
pub mod selector;
pub mod session;
pub mod state;
pub mod trace;
pub mod types;

pub use callbacks::{ArenaCallbacks, CallbackResult, MemoryAbort, MemoryCallbacks};
pub use error::{JitError, Result};
pub use guest::{GuestArch, LocationDescriptor, A32, A64};
pub use host::{Gpr, HostAddr, HostMemory, HostReg, Width, Xmm};
pub use ir::{AccessDescriptor, AccessOrdering, Block, MemOp};
pub use ledger::{
    ExceptionHandler, FakeCall, FaultRedirect, InvalidationSink, MarkerState, NoFastmem,
};
pub use monitor::ExclusiveMonitor;
pub use runtime::HostMachine;
pub use selector::{AccessMarker, AccessStrategy};
pub use session::CodegenSession;
pub use types::{ExitReason, JitConfig, JitStats, PageTableConfig};
