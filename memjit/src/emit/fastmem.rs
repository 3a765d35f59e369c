//! Fastmem emitter.
//!
//! The guest address space is mapped 1:1 at `fastmem_pointer`, so an access
//! is one host load or store at `pointer + vaddr`. Nothing checks whether
//! the page is backed: an unbacked access raises a host fault and the
//! fault handler redirects it to the fallback thunk registered in the
//! ledger for that instruction.

use crate::deferred::{FaultSite, SlowPath};
use crate::error::{JitError, Result};
use crate::guest::GuestArch;
use crate::host::{Address, Cond, Gpr, Helper, HostAddr, HostInst, HostReg, Label, Width, Xmm};
use crate::ir::AccessDescriptor;
use crate::selector::AccessMarker;

use super::{helper_args, EmitContext};

/// Compute the host address of `vaddr` inside the fastmem arena.
///
/// When the guest can form addresses beyond `fastmem_address_space_bits`,
/// those addresses are either wrapped into the arena or sent to `abort`.
pub(crate) fn emit_fastmem_vaddr<G: GuestArch>(
    ctx: &mut EmitContext<'_>,
    vaddr: Gpr,
    abort: Label,
) -> Result<Address> {
    let pointer = ctx
        .config
        .fastmem_pointer
        .ok_or_else(|| JitError::InvalidConfig("fastmem emitted without fastmem_pointer".into()))?;
    let base = ctx.regs.scratch_gpr()?;
    ctx.emit(HostInst::MovImm {
        dst: base,
        imm: pointer,
    });

    let bits = ctx.config.fastmem_address_space_bits;
    if bits >= G::ADDRESS_BITS {
        return Ok(Address::base_index(base, vaddr, 1));
    }

    let in_range = (1u64 << bits) - 1;
    if ctx.config.silently_mirror_fastmem {
        let tmp = ctx.regs.scratch_gpr()?;
        ctx.emit(HostInst::Mov { dst: tmp, src: vaddr });
        ctx.emit(HostInst::AndImm {
            dst: tmp,
            imm: in_range,
        });
        Ok(Address::base_index(base, tmp, 1))
    } else {
        ctx.emit(HostInst::TestImm {
            src: vaddr,
            imm: !in_range,
        });
        ctx.emit(HostInst::Jcc {
            cond: Cond::NotZero,
            target: abort,
        });
        Ok(Address::base_index(base, vaddr, 1))
    }
}

fn xmm_operand(width: Width, reg: HostReg) -> Result<Xmm> {
    match reg {
        HostReg::Xmm(xmm) => Ok(xmm),
        HostReg::Gpr(_) => Err(JitError::OperandMismatch { width, reg }),
    }
}

/// Emit the load itself and return its address, the potential fault site.
///
/// Ordered loads are preceded by a fence; ordered 128-bit loads use the
/// single-copy-atomic form.
pub(crate) fn emit_load(
    ctx: &mut EmitContext<'_>,
    access: AccessDescriptor,
    dst: HostReg,
    addr: Address,
) -> Result<HostAddr> {
    if access.is_ordered() {
        ctx.emit(HostInst::Fence);
    }
    let inst = if access.width == Width::B128 && access.is_ordered() {
        HostInst::AtomicLoad128 {
            dst: xmm_operand(access.width, dst)?,
            addr,
        }
    } else {
        HostInst::Load {
            width: access.width,
            dst,
            addr,
        }
    };
    Ok(ctx.emit(inst))
}

/// Emit the store itself and return its address, the potential fault site.
///
/// Ordered stores are followed by a fence.
pub(crate) fn emit_store(
    ctx: &mut EmitContext<'_>,
    access: AccessDescriptor,
    src: HostReg,
    addr: Address,
) -> Result<HostAddr> {
    let inst = if access.width == Width::B128 && access.is_ordered() {
        HostInst::AtomicStore128 {
            src: xmm_operand(access.width, src)?,
            addr,
        }
    } else {
        HostInst::Store {
            width: access.width,
            src,
            addr,
        }
    };
    let site = ctx.emit(inst);
    if access.is_ordered() {
        ctx.emit(HostInst::Fence);
    }
    Ok(site)
}

/// Fastmem read whose slow path calls the plain read fallback.
///
/// `exit_check` is forwarded to the slow path; callers that hold the
/// monitor lock pass `None` and check for aborts themselves.
pub(crate) fn emit_read_with<G: GuestArch>(
    ctx: &mut EmitContext<'_>,
    access: AccessDescriptor,
    vaddr: Gpr,
    dst: HostReg,
    marker: AccessMarker,
    recompile: bool,
    exit_check: Option<u64>,
) -> Result<()> {
    let abort = ctx.code.new_label();
    let end = ctx.code.new_label();
    let addr = emit_fastmem_vaddr::<G>(ctx, vaddr, abort)?;
    let fault_site = emit_load(ctx, access, dst, addr)?;
    ctx.code.bind(end);

    let thunk = ctx.thunk(Helper::Read(access.width), access, helper_args(vaddr, dst));
    ctx.deferred.push(SlowPath {
        abort,
        end,
        thunk,
        fault: Some(FaultSite {
            addr: fault_site,
            marker,
            recompile,
        }),
        exit_check,
    });
    Ok(())
}

pub fn emit_read<G: GuestArch>(
    ctx: &mut EmitContext<'_>,
    access: AccessDescriptor,
    vaddr: Gpr,
    dst: HostReg,
    marker: AccessMarker,
    guest_pc: u64,
) -> Result<()> {
    let recompile = ctx.config.recompile_on_fastmem_failure;
    emit_read_with::<G>(ctx, access, vaddr, dst, marker, recompile, Some(guest_pc))
}

pub fn emit_write<G: GuestArch>(
    ctx: &mut EmitContext<'_>,
    access: AccessDescriptor,
    vaddr: Gpr,
    src: HostReg,
    marker: AccessMarker,
    guest_pc: u64,
) -> Result<()> {
    let abort = ctx.code.new_label();
    let end = ctx.code.new_label();
    let addr = emit_fastmem_vaddr::<G>(ctx, vaddr, abort)?;
    let fault_site = emit_store(ctx, access, src, addr)?;
    ctx.code.bind(end);

    let thunk = ctx.thunk(Helper::Write(access.width), access, helper_args(vaddr, src));
    ctx.deferred.push(SlowPath {
        abort,
        end,
        thunk,
        fault: Some(FaultSite {
            addr: fault_site,
            marker,
            recompile: ctx.config.recompile_on_fastmem_failure,
        }),
        exit_check: Some(guest_pc),
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emit::fixture::Fixture;
    use crate::guest::{A32, A64};

    const POINTER: u64 = 0x1_0000_0000;

    fn fixture() -> Fixture {
        Fixture::with(|config| config.fastmem_pointer = Some(POINTER))
    }

    fn marker() -> AccessMarker {
        AccessMarker::new(crate::guest::LocationDescriptor(0x1000), 0)
    }

    #[test]
    fn test_read_registers_one_ledger_entry() {
        let mut fx = fixture();
        {
            let mut ctx = fx.ctx(true);
            let access = AccessDescriptor::unordered(Width::B32);
            emit_read::<A32>(&mut ctx, access, Gpr::Rsi, Gpr::Rdi.into(), marker(), 0x1000)
                .unwrap();
        }
        fx.materialize();
        assert_eq!(fx.ledger.len(), 1);
        let (site, entry) = fx.ledger.entries().next().map(|(s, e)| (*s, *e)).unwrap();
        assert!(matches!(
            fx.code.fetch(site),
            Some(HostInst::Load { width: Width::B32, .. })
        ));
        assert_eq!(
            fx.code.fetch(entry.resume),
            Some(&HostInst::ExitIfHalted { guest_pc: 0x1000 })
        );
        assert!(matches!(
            fx.code.fetch(HostAddr(entry.resume.0 - 4)),
            Some(HostInst::Call(t)) if *t == entry.fallback
        ));
        assert!(entry.recompile);
    }

    #[test]
    fn test_a32_needs_no_bounds_check() {
        let mut fx = fixture();
        let mut ctx = fx.ctx(true);
        let access = AccessDescriptor::unordered(Width::B8);
        emit_read::<A32>(&mut ctx, access, Gpr::Rsi, Gpr::Rdi.into(), marker(), 0).unwrap();
        assert!(!fx
            .insts()
            .iter()
            .any(|i| matches!(i, HostInst::TestImm { .. } | HostInst::AndImm { .. })));
    }

    #[test]
    fn test_a64_bounds_check_or_mirror() {
        let mut fx = Fixture::with(|config| {
            config.fastmem_pointer = Some(POINTER);
            config.silently_mirror_fastmem = false;
        });
        {
            let mut ctx = fx.ctx(true);
            let access = AccessDescriptor::unordered(Width::B64);
            emit_read::<A64>(&mut ctx, access, Gpr::Rsi, Gpr::Rdi.into(), marker(), 0).unwrap();
        }
        assert!(fx.insts().contains(&HostInst::TestImm {
            src: Gpr::Rsi,
            imm: !((1u64 << 36) - 1)
        }));

        let mut fx = fixture();
        {
            let mut ctx = fx.ctx(true);
            let access = AccessDescriptor::unordered(Width::B64);
            emit_read::<A64>(&mut ctx, access, Gpr::Rsi, Gpr::Rdi.into(), marker(), 0).unwrap();
        }
        assert!(fx
            .insts()
            .iter()
            .any(|i| matches!(i, HostInst::AndImm { imm, .. } if *imm == (1u64 << 36) - 1)));
    }

    #[test]
    fn test_ordered_128_uses_atomic_forms() {
        let mut fx = fixture();
        {
            let mut ctx = fx.ctx(true);
            let access = AccessDescriptor::ordered(Width::B128);
            emit_read::<A64>(&mut ctx, access, Gpr::Rsi, Xmm(1).into(), marker(), 0).unwrap();
            emit_write::<A64>(&mut ctx, access, Gpr::Rsi, Xmm(1).into(), marker(), 4).unwrap();
        }
        let insts = fx.insts();
        assert!(insts.iter().any(|i| matches!(i, HostInst::AtomicLoad128 { .. })));
        assert!(insts.iter().any(|i| matches!(i, HostInst::AtomicStore128 { .. })));
    }
}
