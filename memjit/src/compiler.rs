//! Block compiler: drives the memory emitters over one block.
//!
//! The hot path of every operation is emitted in order, followed by a single
//! `ret`. Slow paths queued by the emitters are materialized after the `ret`,
//! which is also when their fault ledger entries are registered.

use crate::cache::CompiledBlock;
use crate::deferred::DeferredQueue;
use crate::disasm;
use crate::emit::thunks::ThunkCache;
use crate::emit::{self, EmitContext};
use crate::error::Result;
use crate::guest::GuestArch;
use crate::host::{CodeArena, HostInst, INST_SIZE};
use crate::ir::{Block, MemOp};
use crate::ledger::FaultLedger;
use crate::regalloc::LinearRegAlloc;
use crate::selector::OptOutSet;
use crate::state::StateLayout;
use crate::types::{JitConfig, JitStats};

/// Borrowed view of a session used for one compilation.
pub struct JitCompiler<'a> {
    pub config: &'a JitConfig,
    pub layout: StateLayout,
    pub supports_fastmem: bool,
    pub arena: &'a mut CodeArena,
    pub thunks: &'a mut ThunkCache,
    pub ledger: &'a mut FaultLedger,
    pub opt_out: &'a OptOutSet,
    pub stats: &'a mut JitStats,
}

impl JitCompiler<'_> {
    /// Compile `block` into the block region.
    ///
    /// An emission error is a translator bug; whatever was emitted before it
    /// stays in the region unreachable and no ledger entry is registered.
    pub fn compile<G: GuestArch>(&mut self, block: &Block) -> Result<CompiledBlock> {
        let entry = self.arena.blocks.current();
        let ledger_before = self.ledger.len();
        let mut regs = LinearRegAlloc::new(
            block
                .live_in
                .iter()
                .copied()
                .chain(block.ops.iter().flat_map(MemOp::registers)),
        );
        let mut deferred = DeferredQueue::new();

        {
            let mut ctx = EmitContext {
                config: self.config,
                code: &mut self.arena.blocks,
                thunk_code: &mut self.arena.thunks,
                thunks: &mut *self.thunks,
                regs: &mut regs,
                deferred: &mut deferred,
                opt_out: self.opt_out,
                supports_fastmem: self.supports_fastmem,
                layout: self.layout,
                location: block.location,
                stats: &mut *self.stats,
            };
            for (index, op) in block.ops.iter().enumerate() {
                emit::emit_op::<G>(&mut ctx, index, block.guest_pc::<G>(index), op)?;
            }
            ctx.emit(HostInst::Ret);
        }

        let slow_paths = deferred.materialize(&mut self.arena.blocks, self.ledger);
        let end = self.arena.blocks.current();
        let compiled = CompiledBlock {
            location: block.location,
            entry,
            host_insts: ((end.0 - entry.0) / INST_SIZE) as usize,
            ops: block.ops.len(),
            fastmem_sites: self.ledger.len() - ledger_before,
        };
        self.stats.blocks_compiled += 1;

        log::debug!(
            "[memjit] compiled {} at {} ({} ops, {} host insts, {} slow paths, {} fault sites)",
            block.location,
            entry,
            compiled.ops,
            compiled.host_insts,
            slow_paths,
            compiled.fastmem_sites
        );
        if self.config.debug_listing {
            log::debug!(
                "[memjit] {} listing:\n{}",
                block.location,
                disasm::listing_range(&self.arena.blocks, entry, end)
            );
        }
        Ok(compiled)
    }
}
