//! Exclusive access emitter.
//!
//! Two families implement load/store-exclusive:
//!
//! - host-call: the monitor is driven entirely by runtime helpers
//!   (`ExclusiveRead` marks, `ExclusiveWrite` compares and clears).
//! - inline: generated code takes the monitor lock, checks and clears the
//!   reservation itself and performs the store with a host compare-exchange
//!   at the translated address. Used when `fastmem_exclusive_access` is set,
//!   a fastmem arena is configured and the host delivers faults.
//!
//! The inline store needs the compare-exchange operand registers: `rax` for
//! accesses up to 64 bits, `rax`/`rbx`/`rcx`/`rdx` for 128 bits. Live values
//! in those registers are pushed after taking the lock and popped before
//! releasing it.

use crate::deferred::{FaultSite, SlowPath};
use crate::error::{JitError, Result};
use crate::guest::GuestArch;
use crate::host::{
    Address, Cond, Gpr, Helper, HelperArgs, HostAddr, HostInst, HostReg, Label, Width,
};
use crate::ir::AccessDescriptor;
use crate::selector::{self, AccessMarker, AccessStrategy};

use super::{fastmem, helper_args, page_table, EmitContext};

const QUARTET: [Gpr; 4] = [Gpr::Rax, Gpr::Rbx, Gpr::Rcx, Gpr::Rdx];

fn require_monitor(ctx: &EmitContext<'_>) -> Result<()> {
    if ctx.config.global_monitor.is_none() {
        return Err(JitError::MonitorNotConfigured);
    }
    Ok(())
}

fn use_inline(ctx: &EmitContext<'_>) -> bool {
    ctx.config.fastmem_exclusive_access
        && ctx.config.fastmem_pointer.is_some()
        && ctx.supports_fastmem
}

pub fn emit_read<G: GuestArch>(
    ctx: &mut EmitContext<'_>,
    index: usize,
    access: AccessDescriptor,
    vaddr: Gpr,
    dst: HostReg,
    guest_pc: u64,
) -> Result<()> {
    require_monitor(ctx)?;
    if use_inline(ctx) {
        ctx.stats.exclusive_inline_sites += 1;
        emit_read_inline::<G>(ctx, index, access, vaddr, dst, guest_pc)
    } else {
        ctx.stats.exclusive_call_sites += 1;
        emit_read_call(ctx, access, vaddr, dst, guest_pc);
        Ok(())
    }
}

pub fn emit_write<G: GuestArch>(
    ctx: &mut EmitContext<'_>,
    index: usize,
    access: AccessDescriptor,
    vaddr: Gpr,
    src: HostReg,
    status: Gpr,
    guest_pc: u64,
) -> Result<()> {
    require_monitor(ctx)?;
    if use_inline(ctx) {
        ctx.stats.exclusive_inline_sites += 1;
        emit_write_inline::<G>(ctx, index, access, vaddr, src, status, guest_pc)
    } else {
        ctx.stats.exclusive_call_sites += 1;
        emit_write_call(ctx, access, vaddr, src, status, guest_pc);
        Ok(())
    }
}

/// Clear the processor's exclusive flag.
pub fn emit_clear(ctx: &mut EmitContext<'_>) {
    let offset = ctx.exclusive_state_offset();
    ctx.emit(HostInst::StateStore8 { offset, imm: 0 });
}

// ═══════════════════════════════════════════════════════════════════════════
// Host-call family
// ═══════════════════════════════════════════════════════════════════════════

fn emit_read_call(
    ctx: &mut EmitContext<'_>,
    access: AccessDescriptor,
    vaddr: Gpr,
    dst: HostReg,
    guest_pc: u64,
) {
    let offset = ctx.exclusive_state_offset();
    ctx.emit(HostInst::StateStore8 { offset, imm: 1 });
    if access.is_ordered() {
        ctx.emit(HostInst::Fence);
    }
    ctx.emit(HostInst::CallHelper {
        helper: Helper::ExclusiveRead(access.width),
        args: helper_args(vaddr, dst),
    });
    ctx.emit(HostInst::ExitIfHalted { guest_pc });
}

fn emit_write_call(
    ctx: &mut EmitContext<'_>,
    access: AccessDescriptor,
    vaddr: Gpr,
    src: HostReg,
    status: Gpr,
    guest_pc: u64,
) {
    let offset = ctx.exclusive_state_offset();
    let end = ctx.code.new_label();
    ctx.emit(HostInst::MovImm { dst: status, imm: 1 });
    ctx.emit(HostInst::StateCmp8 { offset, imm: 0 });
    ctx.emit(HostInst::Jcc {
        cond: Cond::Zero,
        target: end,
    });
    ctx.emit(HostInst::StateStore8 { offset, imm: 0 });
    ctx.emit(HostInst::CallHelper {
        helper: Helper::ExclusiveWrite(access.width),
        args: HelperArgs {
            status: Some(status),
            ..helper_args(vaddr, src)
        },
    });
    if access.is_ordered() {
        ctx.emit(HostInst::Fence);
    }
    ctx.emit(HostInst::ExitIfHalted { guest_pc });
    ctx.code.bind(end);
}

// ═══════════════════════════════════════════════════════════════════════════
// Inline family
// ═══════════════════════════════════════════════════════════════════════════

fn inline_strategy(ctx: &EmitContext<'_>, index: usize) -> AccessStrategy {
    selector::select(&ctx.selector_inputs(), AccessMarker::new(ctx.location, index))
}

fn emit_read_inline<G: GuestArch>(
    ctx: &mut EmitContext<'_>,
    index: usize,
    access: AccessDescriptor,
    vaddr: Gpr,
    dst: HostReg,
    guest_pc: u64,
) -> Result<()> {
    let processor = ctx.config.processor_id;
    let offset = ctx.exclusive_state_offset();

    // The read may overwrite the address register.
    let mark_vaddr = if dst == HostReg::Gpr(vaddr) {
        let tmp = ctx.regs.scratch_gpr()?;
        ctx.emit(HostInst::Mov { dst: tmp, src: vaddr });
        tmp
    } else {
        vaddr
    };

    ctx.emit(HostInst::StateStore8 { offset, imm: 1 });
    ctx.emit(HostInst::MonitorLock);
    match inline_strategy(ctx, index) {
        AccessStrategy::Fastmem(marker) => {
            let recompile = ctx.config.recompile_on_exclusive_fastmem_failure;
            fastmem::emit_read_with::<G>(ctx, access, vaddr, dst, marker, recompile, None)?;
        }
        AccessStrategy::PageTable => {
            page_table::emit_read_with::<G>(ctx, access, vaddr, dst, None)?;
        }
        AccessStrategy::Callback => {
            let thunk = ctx.thunk(Helper::Read(access.width), access, helper_args(vaddr, dst));
            ctx.emit(HostInst::Call(thunk));
        }
    }
    ctx.emit(HostInst::MonitorMark {
        processor,
        vaddr: mark_vaddr,
        width: access.width,
        value: dst,
    });
    ctx.emit(HostInst::MonitorUnlock);
    ctx.emit(HostInst::ExitIfHalted { guest_pc });
    Ok(())
}

/// Copy `gpr` into a fresh temporary if the compare-exchange will clobber it.
fn evacuate(ctx: &mut EmitContext<'_>, gpr: Gpr, reserved: &[Gpr]) -> Result<Gpr> {
    if reserved.contains(&gpr) {
        let tmp = ctx.regs.scratch_gpr()?;
        ctx.emit(HostInst::Mov { dst: tmp, src: gpr });
        Ok(tmp)
    } else {
        Ok(gpr)
    }
}

fn emit_cmpxchg(
    ctx: &mut EmitContext<'_>,
    width: Width,
    addr: Address,
    new: HostReg,
) -> Result<HostAddr> {
    let inst = match (width, new) {
        (Width::B128, _) => HostInst::LockCmpXchg16b { addr },
        (_, HostReg::Gpr(new)) => HostInst::LockCmpXchg { width, addr, new },
        (_, reg @ HostReg::Xmm(_)) => return Err(JitError::OperandMismatch { width, reg }),
    };
    Ok(ctx.emit(inst))
}

fn emit_write_inline<G: GuestArch>(
    ctx: &mut EmitContext<'_>,
    index: usize,
    access: AccessDescriptor,
    vaddr: Gpr,
    src: HostReg,
    status: Gpr,
    guest_pc: u64,
) -> Result<()> {
    let processor = ctx.config.processor_id;
    let offset = ctx.exclusive_state_offset();
    let width = access.width;
    let reserved: &[Gpr] = if width == Width::B128 {
        &QUARTET
    } else {
        &QUARTET[..1]
    };

    // The compare-exchange operands come first so no temporary lands on them.
    let mut saved = Vec::with_capacity(reserved.len());
    for &gpr in reserved {
        if ctx.regs.claim_gpr(gpr)? {
            saved.push(gpr);
        }
    }
    let vaddr = evacuate(ctx, vaddr, reserved)?;
    let src = match src {
        HostReg::Gpr(gpr) => HostReg::Gpr(evacuate(ctx, gpr, reserved)?),
        xmm => xmm,
    };
    let status_tmp = ctx.regs.scratch_gpr()?;
    let expected: HostReg = if width == Width::B128 {
        ctx.regs.scratch_xmm()?.into()
    } else {
        Gpr::Rax.into()
    };

    let end = ctx.code.new_label();
    ctx.emit(HostInst::MonitorLock);
    for &gpr in &saved {
        ctx.emit(HostInst::Push(gpr));
    }
    ctx.emit(HostInst::MovImm {
        dst: status_tmp,
        imm: 1,
    });
    ctx.emit(HostInst::StateCmp8 { offset, imm: 0 });
    ctx.emit(HostInst::Jcc {
        cond: Cond::Zero,
        target: end,
    });
    ctx.emit(HostInst::StateStore8 { offset, imm: 0 });
    ctx.emit(HostInst::MonitorCmpAddress { processor, vaddr });
    ctx.emit(HostInst::Jcc {
        cond: Cond::NotZero,
        target: end,
    });
    ctx.emit(HostInst::MonitorTestAndClear { vaddr });
    ctx.emit(HostInst::MonitorLoadValue {
        processor,
        width,
        dst: expected,
    });
    if let (HostReg::Xmm(expected), HostReg::Xmm(src)) = (expected, src) {
        ctx.emit(HostInst::MovFromXmm {
            lo: Gpr::Rax,
            hi: Gpr::Rdx,
            src: expected,
        });
        ctx.emit(HostInst::MovFromXmm {
            lo: Gpr::Rbx,
            hi: Gpr::Rcx,
            src,
        });
    }

    let thunk = ctx.thunk(
        Helper::ExclusiveWriteFallback(width),
        access,
        HelperArgs {
            vaddr,
            value: src,
            expected: Some(expected),
            status: Some(status_tmp),
        },
    );
    match inline_strategy(ctx, index) {
        AccessStrategy::Fastmem(marker) => {
            let abort = ctx.code.new_label();
            let addr = fastmem::emit_fastmem_vaddr::<G>(ctx, vaddr, abort)?;
            let site = emit_cmpxchg(ctx, width, addr, src)?;
            ctx.emit(HostInst::SetCond {
                cond: Cond::NotZero,
                dst: status_tmp,
            });
            let recompile = ctx.config.recompile_on_exclusive_fastmem_failure;
            let fault = FaultSite {
                addr: site,
                marker,
                recompile,
            };
            defer_fallback(ctx, abort, end, thunk, Some(fault));
        }
        AccessStrategy::PageTable => {
            let abort = ctx.code.new_label();
            let addr = page_table::emit_vaddr_lookup::<G>(ctx, width, vaddr, abort)?;
            emit_cmpxchg(ctx, width, addr, src)?;
            ctx.emit(HostInst::SetCond {
                cond: Cond::NotZero,
                dst: status_tmp,
            });
            defer_fallback(ctx, abort, end, thunk, None);
        }
        AccessStrategy::Callback => {
            ctx.emit(HostInst::Call(thunk));
        }
    }

    ctx.code.bind(end);
    for &gpr in saved.iter().rev() {
        ctx.emit(HostInst::Pop(gpr));
    }
    ctx.emit(HostInst::Mov {
        dst: status,
        src: status_tmp,
    });
    if access.is_ordered() {
        ctx.emit(HostInst::Fence);
    }
    ctx.emit(HostInst::MonitorUnlock);
    ctx.emit(HostInst::ExitIfHalted { guest_pc });
    Ok(())
}

fn defer_fallback(
    ctx: &mut EmitContext<'_>,
    abort: Label,
    end: Label,
    thunk: HostAddr,
    fault: Option<FaultSite>,
) {
    ctx.deferred.push(SlowPath {
        abort,
        end,
        thunk,
        fault,
        exit_check: None,
    });
}
