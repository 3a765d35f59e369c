//! Page-table emitter.
//!
//! Translates the guest address in generated code:
//!
//! ```text
//!     test   vaddr, align-1           ; detect_misaligned
//!     jnz    abort
//!     test   vaddr, ~space            ; address beyond the table, no mirroring
//!     jnz    abort
//!     mov    idx, vaddr
//!     shr    idx, page_bits
//!     and    idx, entries-1           ; mirroring
//!     mov    page, table
//!     mov    page, [page + idx*8]
//!     test   page, page
//!     jz     abort
//!     mov    idx, vaddr               ; omitted for absolute offsets
//!     and    idx, page_mask
//!     <access> [page + idx]
//! end:
//! ```
//!
//! A miss is handled synchronously by the deferred slow path; page-table
//! accesses never enter the fault ledger.

use crate::deferred::SlowPath;
use crate::error::{JitError, Result};
use crate::guest::GuestArch;
use crate::host::{Address, Cond, Gpr, Helper, HostInst, HostReg, Label, Width};
use crate::ir::AccessDescriptor;
use crate::types::PageTableConfig;

use super::fastmem::{emit_load, emit_store};
use super::{helper_args, EmitContext};

/// Compute the host address of `vaddr` through the page table, branching to
/// `abort` on a miss.
pub(crate) fn emit_vaddr_lookup<G: GuestArch>(
    ctx: &mut EmitContext<'_>,
    width: Width,
    vaddr: Gpr,
    abort: Label,
) -> Result<Address> {
    let pt: PageTableConfig = ctx
        .config
        .page_table
        .ok_or_else(|| JitError::InvalidConfig("page table emitted without page_table".into()))?;

    if pt.detects_misaligned(width) && width != Width::B8 {
        ctx.emit(HostInst::TestImm {
            src: vaddr,
            imm: width.bytes() as u64 - 1,
        });
        ctx.emit(HostInst::Jcc {
            cond: Cond::NotZero,
            target: abort,
        });
    }

    let bounded = pt.address_space_bits < G::ADDRESS_BITS;
    if bounded && !pt.silently_mirror {
        ctx.emit(HostInst::TestImm {
            src: vaddr,
            imm: !((1u64 << pt.address_space_bits) - 1),
        });
        ctx.emit(HostInst::Jcc {
            cond: Cond::NotZero,
            target: abort,
        });
    }

    let index = ctx.regs.scratch_gpr()?;
    let page = ctx.regs.scratch_gpr()?;
    ctx.emit(HostInst::Mov {
        dst: index,
        src: vaddr,
    });
    ctx.emit(HostInst::ShrImm {
        dst: index,
        imm: pt.page_bits as u8,
    });
    if bounded && pt.silently_mirror {
        ctx.emit(HostInst::AndImm {
            dst: index,
            imm: pt.entry_count() - 1,
        });
    }
    ctx.emit(HostInst::MovImm {
        dst: page,
        imm: pt.pointer,
    });
    ctx.emit(HostInst::Load {
        width: Width::B64,
        dst: page.into(),
        addr: Address::base_index(page, index, 8),
    });
    ctx.emit(HostInst::Test { a: page, b: page });
    ctx.emit(HostInst::Jcc {
        cond: Cond::Zero,
        target: abort,
    });

    if pt.absolute_offset {
        return Ok(Address::base_index(page, vaddr, 1));
    }
    ctx.emit(HostInst::Mov {
        dst: index,
        src: vaddr,
    });
    ctx.emit(HostInst::AndImm {
        dst: index,
        imm: pt.page_mask(),
    });
    Ok(Address::base_index(page, index, 1))
}

pub fn emit_read<G: GuestArch>(
    ctx: &mut EmitContext<'_>,
    access: AccessDescriptor,
    vaddr: Gpr,
    dst: HostReg,
    guest_pc: u64,
) -> Result<()> {
    emit_read_with::<G>(ctx, access, vaddr, dst, Some(guest_pc))
}

/// Page-table read; `exit_check` as for the fastmem read.
pub(crate) fn emit_read_with<G: GuestArch>(
    ctx: &mut EmitContext<'_>,
    access: AccessDescriptor,
    vaddr: Gpr,
    dst: HostReg,
    exit_check: Option<u64>,
) -> Result<()> {
    let abort = ctx.code.new_label();
    let end = ctx.code.new_label();
    let addr = emit_vaddr_lookup::<G>(ctx, access.width, vaddr, abort)?;
    emit_load(ctx, access, dst, addr)?;
    ctx.code.bind(end);

    let thunk = ctx.thunk(Helper::Read(access.width), access, helper_args(vaddr, dst));
    ctx.deferred.push(SlowPath {
        abort,
        end,
        thunk,
        fault: None,
        exit_check,
    });
    Ok(())
}

pub fn emit_write<G: GuestArch>(
    ctx: &mut EmitContext<'_>,
    access: AccessDescriptor,
    vaddr: Gpr,
    src: HostReg,
    guest_pc: u64,
) -> Result<()> {
    let abort = ctx.code.new_label();
    let end = ctx.code.new_label();
    let addr = emit_vaddr_lookup::<G>(ctx, access.width, vaddr, abort)?;
    emit_store(ctx, access, src, addr)?;
    ctx.code.bind(end);

    let thunk = ctx.thunk(Helper::Write(access.width), access, helper_args(vaddr, src));
    ctx.deferred.push(SlowPath {
        abort,
        end,
        thunk,
        fault: None,
        exit_check: Some(guest_pc),
    });
    Ok(())
}
