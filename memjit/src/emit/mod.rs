//! Memory access emitters.
//!
//! [`emit_op`] selects a strategy for one [`MemOp`] and hands it to the
//! matching emitter:
//!
//! - [`fastmem`]: direct host access with fault-based recovery
//! - [`page_table`]: software translation with an in-line miss path
//! - [`callback`]: a plain call into the embedder
//! - [`exclusive`]: load/store-exclusive, host-call and inline families
//!
//! Slow paths are queued on the [`DeferredQueue`] and fallbacks live in
//! shared [`thunks`].

pub mod callback;
pub mod exclusive;
pub mod fastmem;
pub mod page_table;
pub mod thunks;

use crate::deferred::DeferredQueue;
use crate::error::Result;
use crate::guest::{GuestArch, LocationDescriptor};
use crate::host::{CodeBuffer, Gpr, Helper, HelperArgs, HostAddr, HostInst, HostReg};
use crate::ir::{AccessDescriptor, MemOp};
use crate::regalloc::RegAlloc;
use crate::selector::{self, AccessMarker, AccessStrategy, OptOutSet, SelectorInputs};
use crate::state::StateLayout;
use crate::types::{JitConfig, JitStats};

use thunks::{ThunkCache, ThunkKey};

/// Everything an emitter may touch while compiling one block.
pub struct EmitContext<'a> {
    pub config: &'a JitConfig,
    pub code: &'a mut CodeBuffer,
    pub thunk_code: &'a mut CodeBuffer,
    pub thunks: &'a mut ThunkCache,
    pub regs: &'a mut dyn RegAlloc,
    pub deferred: &'a mut DeferredQueue,
    pub opt_out: &'a OptOutSet,
    pub supports_fastmem: bool,
    pub layout: StateLayout,
    pub location: LocationDescriptor,
    pub stats: &'a mut JitStats,
}

impl EmitContext<'_> {
    pub fn emit(&mut self, inst: HostInst) -> HostAddr {
        self.code.emit(inst)
    }

    /// Fallback thunk calling `helper` with the given registers.
    pub fn thunk(
        &mut self,
        helper: Helper,
        access: AccessDescriptor,
        args: HelperArgs,
    ) -> HostAddr {
        let before = self.thunks.len();
        let addr = self.thunks.get_or_emit(
            self.thunk_code,
            ThunkKey {
                helper,
                ordering: access.ordering,
                args,
            },
        );
        if self.thunks.len() != before {
            self.stats.thunks += 1;
        }
        addr
    }

    pub fn selector_inputs(&self) -> SelectorInputs<'_> {
        SelectorInputs {
            fastmem_enabled: self.config.fastmem_pointer.is_some(),
            page_table_enabled: self.config.page_table.is_some(),
            supports_fastmem: self.supports_fastmem,
            opt_out: self.opt_out,
        }
    }

    /// `Some(marker)` if the access at `index` may use fastmem.
    pub fn should_fastmem(&self, index: usize) -> Option<AccessMarker> {
        selector::should_fastmem(&self.selector_inputs(), AccessMarker::new(self.location, index))
    }

    pub(crate) fn exclusive_state_offset(&self) -> usize {
        self.layout.exclusive_state.offset()
    }
}

pub(crate) fn helper_args(vaddr: Gpr, value: HostReg) -> HelperArgs {
    HelperArgs {
        vaddr,
        value,
        expected: None,
        status: None,
    }
}

/// Emit the hot path of `op`, the `index`-th operation of the block, whose
/// guest instruction sits at `guest_pc`.
pub fn emit_op<G: GuestArch>(
    ctx: &mut EmitContext<'_>,
    index: usize,
    guest_pc: u64,
    op: &MemOp,
) -> Result<()> {
    op.validate::<G>()?;
    let strategy = selector::select(&ctx.selector_inputs(), AccessMarker::new(ctx.location, index));
    let result = match *op {
        MemOp::Read { access, vaddr, dst } => {
            match strategy {
                AccessStrategy::Fastmem(marker) => {
                    ctx.stats.fastmem_sites += 1;
                    fastmem::emit_read::<G>(ctx, access, vaddr, dst, marker, guest_pc)
                }
                AccessStrategy::PageTable => {
                    ctx.stats.page_table_sites += 1;
                    page_table::emit_read::<G>(ctx, access, vaddr, dst, guest_pc)
                }
                AccessStrategy::Callback => {
                    ctx.stats.callback_sites += 1;
                    callback::emit_read(ctx, access, vaddr, dst, guest_pc);
                    Ok(())
                }
            }
        }
        MemOp::Write { access, vaddr, src } => {
            match strategy {
                AccessStrategy::Fastmem(marker) => {
                    ctx.stats.fastmem_sites += 1;
                    fastmem::emit_write::<G>(ctx, access, vaddr, src, marker, guest_pc)
                }
                AccessStrategy::PageTable => {
                    ctx.stats.page_table_sites += 1;
                    page_table::emit_write::<G>(ctx, access, vaddr, src, guest_pc)
                }
                AccessStrategy::Callback => {
                    ctx.stats.callback_sites += 1;
                    callback::emit_write(ctx, access, vaddr, src, guest_pc);
                    Ok(())
                }
            }
        }
        MemOp::ExclusiveRead { access, vaddr, dst } => {
            exclusive::emit_read::<G>(ctx, index, access, vaddr, dst, guest_pc)
        }
        MemOp::ExclusiveWrite {
            access,
            vaddr,
            src,
            status,
        } => exclusive::emit_write::<G>(ctx, index, access, vaddr, src, status, guest_pc),
        MemOp::ClearExclusive => {
            exclusive::emit_clear(ctx);
            Ok(())
        }
    };
    ctx.regs.end_of_instruction();
    result
}
