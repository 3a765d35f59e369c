//! Callback emitter: the access is a direct call into the embedder.

use crate::host::{Gpr, Helper, HostInst, HostReg};
use crate::ir::AccessDescriptor;

use super::{helper_args, EmitContext};

pub fn emit_read(
    ctx: &mut EmitContext<'_>,
    access: AccessDescriptor,
    vaddr: Gpr,
    dst: HostReg,
    guest_pc: u64,
) {
    if access.is_ordered() {
        ctx.emit(HostInst::Fence);
    }
    ctx.emit(HostInst::CallHelper {
        helper: Helper::Read(access.width),
        args: helper_args(vaddr, dst),
    });
    ctx.emit(HostInst::ExitIfHalted { guest_pc });
}

pub fn emit_write(
    ctx: &mut EmitContext<'_>,
    access: AccessDescriptor,
    vaddr: Gpr,
    src: HostReg,
    guest_pc: u64,
) {
    ctx.emit(HostInst::CallHelper {
        helper: Helper::Write(access.width),
        args: helper_args(vaddr, src),
    });
    if access.is_ordered() {
        ctx.emit(HostInst::Fence);
    }
    ctx.emit(HostInst::ExitIfHalted { guest_pc });
}
