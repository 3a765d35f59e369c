//! Host code listings.
//!
//! Renders host instructions as assembly-like text for debug logs and for
//! the diagnostic dump around an unrecoverable fault.

use std::fmt::{self, Write as _};

use crate::host::{
    Address, CodeArena, CodeBuffer, Cond, Helper, HelperArgs, HostAddr, HostInst, Width, Xmm,
    INST_SIZE,
};

fn width_suffix(width: Width) -> u32 {
    width.bits()
}

fn xmm(reg: Xmm) -> String {
    format!("xmm{}", reg.index())
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}", self.base.name())?;
        if let Some((index, scale)) = self.index {
            write!(f, " + {}*{}", index.name(), scale)?;
        }
        match self.disp {
            0 => {}
            d if d < 0 => write!(f, " - {:#x}", d.unsigned_abs())?,
            d => write!(f, " + {:#x}", d)?,
        }
        f.write_str("]")
    }
}

impl fmt::Display for Helper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (name, width) = match *self {
            Helper::Read(w) => ("read", w),
            Helper::Write(w) => ("write", w),
            Helper::ExclusiveRead(w) => ("exclusive_read", w),
            Helper::ExclusiveWrite(w) => ("exclusive_write", w),
            Helper::ExclusiveWriteFallback(w) => ("exclusive_write_fallback", w),
        };
        write!(f, "{}_{}", name, width.bits())
    }
}

impl fmt::Display for HelperArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vaddr={}, value={}", self.vaddr.name(), self.value)?;
        if let Some(expected) = self.expected {
            write!(f, ", expected={}", expected)?;
        }
        if let Some(status) = self.status {
            write!(f, ", status={}", status.name())?;
        }
        Ok(())
    }
}

fn cond_suffix(cond: Cond) -> &'static str {
    match cond {
        Cond::Zero => "z",
        Cond::NotZero => "nz",
    }
}

impl fmt::Display for HostInst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            HostInst::MovImm { dst, imm } => write!(f, "mov {}, {:#x}", dst.name(), imm),
            HostInst::Mov { dst, src } => write!(f, "mov {}, {}", dst.name(), src.name()),
            HostInst::MovToXmm { dst, lo, hi } => {
                write!(f, "movq2x {}, {}:{}", xmm(dst), hi.name(), lo.name())
            }
            HostInst::MovFromXmm { lo, hi, src } => {
                write!(f, "movx2q {}:{}, {}", hi.name(), lo.name(), xmm(src))
            }
            HostInst::AndImm { dst, imm } => write!(f, "and {}, {:#x}", dst.name(), imm),
            HostInst::ShrImm { dst, imm } => write!(f, "shr {}, {}", dst.name(), imm),
            HostInst::Add { dst, src } => write!(f, "add {}, {}", dst.name(), src.name()),
            HostInst::TestImm { src, imm } => write!(f, "test {}, {:#x}", src.name(), imm),
            HostInst::Test { a, b } => write!(f, "test {}, {}", a.name(), b.name()),
            HostInst::Cmp { a, b } => write!(f, "cmp {}, {}", a.name(), b.name()),
            HostInst::SetCond { cond, dst } => write!(f, "set{} {}", cond_suffix(cond), dst.name()),
            HostInst::Jmp(label) => write!(f, "jmp L{}", label.id()),
            HostInst::Jcc { cond, target } => write!(f, "j{} L{}", cond_suffix(cond), target.id()),
            HostInst::Call(target) => write!(f, "call {}", target),
            HostInst::Ret => f.write_str("ret"),
            HostInst::Push(gpr) => write!(f, "push {}", gpr.name()),
            HostInst::Pop(gpr) => write!(f, "pop {}", gpr.name()),
            HostInst::Load { width, dst, addr } => {
                write!(f, "ld{} {}, {}", width_suffix(width), dst, addr)
            }
            HostInst::Store { width, src, addr } => {
                write!(f, "st{} {}, {}", width_suffix(width), addr, src)
            }
            HostInst::AtomicLoad128 { dst, addr } => {
                write!(f, "ld128.atomic {}, {}", xmm(dst), addr)
            }
            HostInst::AtomicStore128 { src, addr } => {
                write!(f, "st128.atomic {}, {}", addr, xmm(src))
            }
            HostInst::Fence => f.write_str("mfence"),
            HostInst::LockCmpXchg { width, addr, new } => {
                write!(f, "lock cmpxchg{} {}, {}", width_suffix(width), addr, new.name())
            }
            HostInst::LockCmpXchg16b { addr } => write!(f, "lock cmpxchg16b {}", addr),
            HostInst::StateStore8 { offset, imm } => {
                write!(f, "mov byte [state + {:#x}], {}", offset, imm)
            }
            HostInst::StateCmp8 { offset, imm } => {
                write!(f, "cmp byte [state + {:#x}], {}", offset, imm)
            }
            HostInst::MonitorLock => f.write_str("monitor.lock"),
            HostInst::MonitorUnlock => f.write_str("monitor.unlock"),
            HostInst::MonitorCmpAddress { processor, vaddr } => {
                write!(f, "monitor.cmp_address cpu{}, {}", processor, vaddr.name())
            }
            HostInst::MonitorLoadValue {
                processor,
                width,
                dst,
            } => write!(f, "monitor.load_value{} {}, cpu{}", width_suffix(width), dst, processor),
            HostInst::MonitorMark {
                processor,
                vaddr,
                width,
                value,
            } => write!(
                f,
                "monitor.mark{} cpu{}, {}, {}",
                width_suffix(width),
                processor,
                vaddr.name(),
                value
            ),
            HostInst::MonitorTestAndClear { vaddr } => {
                write!(f, "monitor.clear_granule {}", vaddr.name())
            }
            HostInst::CallHelper { helper, args } => write!(f, "call_helper {} ({})", helper, args),
            HostInst::ExitIfHalted { guest_pc } => write!(f, "exit_if_halted pc={:#x}", guest_pc),
        }
    }
}

/// Render `[from, to)` of `code`, one instruction per line, with label
/// definitions interleaved.
pub fn listing_range(code: &CodeBuffer, from: HostAddr, to: HostAddr) -> String {
    let mut out = String::new();
    let labels = code.bound_labels();
    for (addr, inst) in code.range(from, to) {
        for label in labels.iter().filter(|(_, at)| *at == addr) {
            let _ = writeln!(out, "L{}:", label.0.id());
        }
        let _ = writeln!(out, "  {}  {}", addr, inst);
    }
    out
}

/// Render all of `code`.
pub fn listing(code: &CodeBuffer) -> String {
    listing_range(code, code.base(), code.current())
}

/// Render `radius` instructions either side of `center`, marking `center`
/// with `=>`.
pub fn dump_window(arena: &CodeArena, center: HostAddr, radius: usize) -> String {
    let Some(region) = arena.region(center) else {
        return format!("<no host code at {}>\n", center);
    };
    let span = radius as u64 * INST_SIZE;
    let from = HostAddr(center.0.saturating_sub(span).max(region.base().0));
    let to = HostAddr(center.0 + span + INST_SIZE);
    let mut out = String::new();
    for (addr, inst) in region.range(from, to) {
        let mark = if addr == center { "=>" } else { "  " };
        let _ = writeln!(out, "{} {}  {}", mark, addr, inst);
    }
    out
}
