//! Host machine: executes generated host code for one processor.
//!
//! The machine plays the part of the host CPU and its signal handler. A
//! load or store that touches unmapped host memory does not complete;
//! instead the session's fault ledger is consulted and the faulting context
//! is rewritten into a call to the fallback thunk that returns to the
//! resume address, exactly what a real fault handler does with the
//! interrupted register context.
//!
//! ## Host stack
//!
//! ```text
//!   ┌──────────────┐
//!   │ EXIT_ADDRESS │  pushed on entry; `ret` to it leaves the block
//!   ├──────────────┤
//!   │ saved regs   │  push/pop around inline exclusive stores
//!   ├──────────────┤
//!   │ return addr  │  `call` to a fallback thunk, or a fake call
//!   └──────────────┘
//! ```

use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use crate::callbacks::{MemoryAbort, MemoryCallbacks};
use crate::error::{JitError, Result};
use crate::guest::GuestArch;
use crate::helpers;
use crate::host::{
    Address, CodeArena, Cond, Gpr, Helper, HelperArgs, HostAddr, HostInst, HostMemory, HostReg,
    MemoryFault, Width, Xmm,
};
use crate::monitor::ExclusiveMonitor;
use crate::session::CodegenSession;
use crate::state::{halt_reasons, ProcessorState, StateLayout};
use crate::trace::TraceEvent;
use crate::types::ExitReason;

/// Return address that leaves the block.
const EXIT_ADDRESS: u64 = 0;

/// Outcome of one instruction.
enum Flow {
    Next,
    Jump(HostAddr),
    Exit(ExitReason),
}

/// Why an instruction did not complete.
enum Trap {
    Fault(MemoryFault),
    Error(JitError),
}

impl From<MemoryFault> for Trap {
    fn from(fault: MemoryFault) -> Self {
        Trap::Fault(fault)
    }
}

impl From<JitError> for Trap {
    fn from(err: JitError) -> Self {
        Trap::Error(err)
    }
}

/// Collaborators taken from the session configuration for one run.
struct Env<'a> {
    callbacks: &'a dyn MemoryCallbacks,
    monitor: Option<&'a ExclusiveMonitor>,
    processor: usize,
}

impl Env<'_> {
    fn monitor(&self) -> Result<&ExclusiveMonitor> {
        self.monitor.ok_or(JitError::MonitorNotConfigured)
    }
}

/// One processor's host register file, host stack and state block.
pub struct HostMachine {
    gprs: [u64; 16],
    xmms: [u128; Xmm::COUNT],
    zf: bool,
    stack: Vec<u64>,
    state: ProcessorState,
    memory: Arc<HostMemory>,
    holds_monitor: bool,
    retired: u64,
}

impl HostMachine {
    pub fn new(layout: StateLayout, memory: Arc<HostMemory>) -> Self {
        Self {
            gprs: [0; 16],
            xmms: [0; Xmm::COUNT],
            zf: false,
            stack: Vec::new(),
            state: ProcessorState::new(layout),
            memory,
            holds_monitor: false,
            retired: 0,
        }
    }

    /// Machine with the state block layout of guest `G`.
    pub fn for_guest<G: GuestArch>(memory: Arc<HostMemory>) -> Result<Self> {
        Ok(Self::new(G::state_layout()?, memory))
    }

    pub fn gpr(&self, gpr: Gpr) -> u64 {
        self.gprs[gpr.index()]
    }

    pub fn set_gpr(&mut self, gpr: Gpr, value: u64) {
        self.gprs[gpr.index()] = value;
    }

    pub fn xmm(&self, xmm: Xmm) -> u128 {
        self.xmms[xmm.index()]
    }

    pub fn set_xmm(&mut self, xmm: Xmm, value: u128) {
        self.xmms[xmm.index()] = value;
    }

    pub fn reg(&self, reg: HostReg) -> u128 {
        match reg {
            HostReg::Gpr(gpr) => self.gpr(gpr) as u128,
            HostReg::Xmm(xmm) => self.xmm(xmm),
        }
    }

    pub fn set_reg(&mut self, reg: HostReg, value: u128) {
        match reg {
            HostReg::Gpr(gpr) => self.set_gpr(gpr, value as u64),
            HostReg::Xmm(xmm) => self.set_xmm(xmm, value),
        }
    }

    pub fn state(&self) -> &ProcessorState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut ProcessorState {
        &mut self.state
    }

    pub fn memory(&self) -> &Arc<HostMemory> {
        &self.memory
    }

    /// Host instructions retired by the last [`execute`](Self::execute).
    pub fn retired(&self) -> u64 {
        self.retired
    }

    /// Run host code from `entry` until it returns or exits.
    ///
    /// Host faults are resolved through `session`; a fault it cannot map to
    /// a fallback ends the run with [`JitError::UnrecoverableFault`]. The
    /// monitor lock is never left held, whatever the outcome.
    pub fn execute<G: GuestArch>(
        &mut self,
        session: &mut CodegenSession<G>,
        entry: HostAddr,
    ) -> Result<ExitReason> {
        let config = session.config();
        let callbacks = Arc::clone(&config.callbacks);
        let monitor = config.global_monitor.clone();
        let processor = config.processor_id;
        let step_limit = config.step_limit;
        let env = Env {
            callbacks: callbacks.as_ref(),
            monitor: monitor.as_deref(),
            processor,
        };

        self.stack.clear();
        self.stack.push(EXIT_ADDRESS);
        self.retired = 0;
        let result = self.run(session, &env, entry, step_limit);

        if self.holds_monitor {
            if let Some(monitor) = env.monitor {
                monitor.unlock();
            }
            self.holds_monitor = false;
            log::warn!("[runtime] released monitor lock held at block exit");
        }
        result
    }

    fn run<G: GuestArch>(
        &mut self,
        session: &mut CodegenSession<G>,
        env: &Env<'_>,
        entry: HostAddr,
        step_limit: u64,
    ) -> Result<ExitReason> {
        let mut rip = entry;
        loop {
            if step_limit != 0 && self.retired >= step_limit {
                return Err(JitError::StepLimit(step_limit));
            }
            self.retired += 1;

            let inst = session.arena().fetch(rip)?;
            match self.step(session.arena(), env, rip, inst) {
                Ok(Flow::Next) => rip = rip.next(),
                Ok(Flow::Jump(target)) => rip = target,
                Ok(Flow::Exit(reason)) => {
                    if let ExitReason::MemoryAbort { guest_pc } = reason {
                        session.trace_mut().push(TraceEvent::MemoryAbort { guest_pc });
                    }
                    return Ok(reason);
                }
                Err(Trap::Fault(fault)) => {
                    let call = session.handle_fault(rip, fault.addr)?;
                    log::trace!(
                        "[runtime] fault at {} ({:#x}): call {} resume {}",
                        rip,
                        fault.addr,
                        call.call_target,
                        call.resume
                    );
                    self.stack.push(call.resume.0);
                    rip = call.call_target;
                }
                Err(Trap::Error(err)) => return Err(err),
            }
        }
    }

    fn effective(&self, addr: Address) -> u64 {
        let index = addr
            .index
            .map_or(0, |(gpr, scale)| self.gpr(gpr).wrapping_mul(scale as u64));
        self.gpr(addr.base)
            .wrapping_add(index)
            .wrapping_add(addr.disp as u64)
    }

    fn cond(&self, cond: Cond) -> bool {
        match cond {
            Cond::Zero => self.zf,
            Cond::NotZero => !self.zf,
        }
    }

    fn pop(&mut self, rip: HostAddr) -> Result<u64> {
        // The exit sentinel is only consumed by `ret`.
        if self.stack.len() <= 1 {
            return Err(JitError::StackUnderflow(rip));
        }
        self.stack.pop().ok_or(JitError::StackUnderflow(rip))
    }

    fn step(
        &mut self,
        arena: &CodeArena,
        env: &Env<'_>,
        rip: HostAddr,
        inst: HostInst,
    ) -> std::result::Result<Flow, Trap> {
        match inst {
            HostInst::MovImm { dst, imm } => self.set_gpr(dst, imm),
            HostInst::Mov { dst, src } => self.set_gpr(dst, self.gpr(src)),
            HostInst::MovToXmm { dst, lo, hi } => {
                self.set_xmm(dst, (self.gpr(hi) as u128) << 64 | self.gpr(lo) as u128)
            }
            HostInst::MovFromXmm { lo, hi, src } => {
                let value = self.xmm(src);
                self.set_gpr(lo, value as u64);
                self.set_gpr(hi, (value >> 64) as u64);
            }
            HostInst::AndImm { dst, imm } => self.set_gpr(dst, self.gpr(dst) & imm),
            HostInst::ShrImm { dst, imm } => {
                self.set_gpr(dst, self.gpr(dst).checked_shr(imm as u32).unwrap_or(0))
            }
            HostInst::Add { dst, src } => {
                self.set_gpr(dst, self.gpr(dst).wrapping_add(self.gpr(src)))
            }
            HostInst::TestImm { src, imm } => self.zf = self.gpr(src) & imm == 0,
            HostInst::Test { a, b } => self.zf = self.gpr(a) & self.gpr(b) == 0,
            HostInst::Cmp { a, b } => self.zf = self.gpr(a) == self.gpr(b),
            HostInst::SetCond { cond, dst } => self.set_gpr(dst, self.cond(cond) as u64),
            HostInst::Jmp(label) => return Ok(Flow::Jump(arena.resolve(rip, label)?)),
            HostInst::Jcc { cond, target } => {
                if self.cond(cond) {
                    return Ok(Flow::Jump(arena.resolve(rip, target)?));
                }
            }
            HostInst::Call(target) => {
                self.stack.push(rip.next().0);
                return Ok(Flow::Jump(target));
            }
            HostInst::Ret => {
                let target = self.stack.pop().ok_or(JitError::StackUnderflow(rip))?;
                if target == EXIT_ADDRESS {
                    return Ok(Flow::Exit(ExitReason::Returned));
                }
                return Ok(Flow::Jump(HostAddr(target)));
            }
            HostInst::Push(gpr) => self.stack.push(self.gpr(gpr)),
            HostInst::Pop(gpr) => {
                let value = self.pop(rip)?;
                self.set_gpr(gpr, value);
            }

            HostInst::Load { width, dst, addr } => {
                let value = self.memory.read(self.effective(addr), width)?;
                self.set_reg(dst, value);
            }
            HostInst::Store { width, src, addr } => {
                let value = self.reg(src) & width.mask();
                self.memory.write(self.effective(addr), width, value)?;
            }
            HostInst::AtomicLoad128 { dst, addr } => {
                let value = self.memory.read(self.effective(addr), Width::B128)?;
                self.set_xmm(dst, value);
            }
            HostInst::AtomicStore128 { src, addr } => {
                self.memory.write(self.effective(addr), Width::B128, self.xmm(src))?;
            }
            HostInst::Fence => fence(Ordering::SeqCst),
            HostInst::LockCmpXchg { width, addr, new } => {
                let expected = self.gpr(Gpr::Rax) as u128 & width.mask();
                let new = self.gpr(new) as u128 & width.mask();
                match self.memory.compare_exchange(self.effective(addr), width, expected, new)? {
                    Ok(_) => self.zf = true,
                    Err(current) => {
                        self.zf = false;
                        self.set_gpr(Gpr::Rax, current as u64);
                    }
                }
            }
            HostInst::LockCmpXchg16b { addr } => {
                let expected = (self.gpr(Gpr::Rdx) as u128) << 64 | self.gpr(Gpr::Rax) as u128;
                let new = (self.gpr(Gpr::Rcx) as u128) << 64 | self.gpr(Gpr::Rbx) as u128;
                match self
                    .memory
                    .compare_exchange(self.effective(addr), Width::B128, expected, new)?
                {
                    Ok(_) => self.zf = true,
                    Err(current) => {
                        self.zf = false;
                        self.set_gpr(Gpr::Rax, current as u64);
                        self.set_gpr(Gpr::Rdx, (current >> 64) as u64);
                    }
                }
            }

            HostInst::StateStore8 { offset, imm } => self.state.set_byte(offset, imm)?,
            HostInst::StateCmp8 { offset, imm } => self.zf = self.state.byte(offset)? == imm,

            HostInst::MonitorLock => {
                env.monitor()?.lock();
                self.holds_monitor = true;
            }
            HostInst::MonitorUnlock => {
                env.monitor()?.unlock();
                self.holds_monitor = false;
            }
            HostInst::MonitorCmpAddress { processor, vaddr } => {
                self.zf = env.monitor()?.address_matches(processor, self.gpr(vaddr));
            }
            HostInst::MonitorLoadValue {
                processor,
                width,
                dst,
            } => {
                let value = env.monitor()?.marked_value(processor) & width.mask();
                self.set_reg(dst, value);
            }
            HostInst::MonitorMark {
                processor,
                vaddr,
                width,
                value,
            } => {
                let value = self.reg(value) & width.mask();
                env.monitor()?.mark(processor, self.gpr(vaddr), value);
            }
            HostInst::MonitorTestAndClear { vaddr } => {
                env.monitor()?.clear_reservations_on(self.gpr(vaddr));
            }

            HostInst::CallHelper { helper, args } => self.call_helper(env, helper, args)?,
            HostInst::ExitIfHalted { guest_pc } => {
                if self.state.halt_reason() & halt_reasons::MEMORY_ABORT != 0 {
                    self.state.clear_halt();
                    self.state.set_pc(guest_pc);
                    log::debug!("[runtime] memory abort, leaving block at pc {:#x}", guest_pc);
                    return Ok(Flow::Exit(ExitReason::MemoryAbort { guest_pc }));
                }
            }
        }
        Ok(Flow::Next)
    }

    fn abort(&mut self, abort: MemoryAbort) {
        log::debug!("[runtime] callback abort at guest {:#x}", abort.vaddr);
        self.state.raise_halt(halt_reasons::MEMORY_ABORT);
    }

    fn set_status(&mut self, args: &HelperArgs, result: &std::result::Result<bool, MemoryAbort>) {
        if let Some(status) = args.status {
            self.set_gpr(status, helpers::exclusive_status(result));
        }
    }

    fn call_helper(&mut self, env: &Env<'_>, helper: Helper, args: HelperArgs) -> Result<()> {
        let vaddr = self.gpr(args.vaddr);
        match helper {
            Helper::Read(width) => match helpers::read(env.callbacks, width, vaddr) {
                Ok(value) => self.set_reg(args.value, value),
                Err(abort) => self.abort(abort),
            },
            Helper::Write(width) => {
                let value = self.reg(args.value) & width.mask();
                if let Err(abort) = helpers::write(env.callbacks, width, vaddr, value) {
                    self.abort(abort);
                }
            }
            Helper::ExclusiveRead(width) => {
                let monitor = env.monitor()?;
                match helpers::exclusive_read(monitor, env.processor, env.callbacks, width, vaddr) {
                    Ok(value) => self.set_reg(args.value, value),
                    Err(abort) => self.abort(abort),
                }
            }
            Helper::ExclusiveWrite(width) => {
                let monitor = env.monitor()?;
                let value = self.reg(args.value) & width.mask();
                let result = helpers::exclusive_write(
                    monitor,
                    env.processor,
                    env.callbacks,
                    width,
                    vaddr,
                    value,
                );
                self.set_status(&args, &result);
                if let Err(abort) = result {
                    self.abort(abort);
                }
            }
            Helper::ExclusiveWriteFallback(width) => {
                let expected = args.expected.ok_or(JitError::OperandMismatch {
                    width,
                    reg: args.value,
                })?;
                let expected = self.reg(expected) & width.mask();
                let value = self.reg(args.value) & width.mask();
                let result = helpers::write_exclusive(env.callbacks, width, vaddr, value, expected);
                self.set_status(&args, &result);
                if let Err(abort) = result {
                    self.abort(abort);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::ArenaCallbacks;
    use crate::guest::{LocationDescriptor, A64};
    use crate::ir::{AccessDescriptor, Block, MemOp};
    use crate::ledger::FaultRedirect;
    use crate::types::JitConfig;

    const ARENA: u64 = 0x1_0000_0000;
    const ARENA_SIZE: u64 = 0x1000;

    fn setup(fastmem: bool) -> (CodegenSession<A64>, HostMachine) {
        let memory = Arc::new(HostMemory::new());
        memory.map(ARENA, ARENA_SIZE as usize);
        let mut config = JitConfig::new(Arc::new(ArenaCallbacks::new(
            Arc::clone(&memory),
            ARENA,
            ARENA_SIZE,
        )));
        if fastmem {
            config.fastmem_pointer = Some(ARENA);
        }
        let session = CodegenSession::new(config, Arc::new(FaultRedirect)).unwrap();
        let machine = HostMachine::for_guest::<A64>(memory).unwrap();
        (session, machine)
    }

    fn copy_block() -> Block {
        Block::with_ops(
            LocationDescriptor(0x1000),
            vec![
                MemOp::read(AccessDescriptor::unordered(Width::B32), Gpr::Rsi, Gpr::Rdi),
                MemOp::write(AccessDescriptor::unordered(Width::B32), Gpr::Rdx, Gpr::Rdi),
            ],
        )
    }

    #[test]
    fn test_fastmem_block_runs() {
        let (mut session, mut machine) = setup(true);
        machine
            .memory()
            .write(ARENA + 0x10, Width::B32, 0xCAFE)
            .unwrap();
        let entry = session.get_or_compile(&copy_block()).unwrap();

        machine.set_gpr(Gpr::Rsi, 0x10);
        machine.set_gpr(Gpr::Rdx, 0x20);
        assert_eq!(machine.execute(&mut session, entry).unwrap(), ExitReason::Returned);
        assert_eq!(machine.gpr(Gpr::Rdi), 0xCAFE);
        assert_eq!(machine.memory().read(ARENA + 0x20, Width::B32).unwrap(), 0xCAFE);
        assert_eq!(session.stats().faults_recovered, 0);
    }

    #[test]
    fn test_fault_beyond_arena_aborts_through_fallback() {
        let (mut session, mut machine) = setup(true);
        let entry = session.get_or_compile(&copy_block()).unwrap();

        machine.set_gpr(Gpr::Rsi, 0x8000);
        let exit = machine.execute(&mut session, entry).unwrap();
        assert_eq!(exit, ExitReason::MemoryAbort { guest_pc: 0x1000 });
        assert_eq!(machine.state().pc(), 0x1000);
        assert_eq!(session.stats().faults_recovered, 1);
        assert_eq!(session.opt_out().len(), 1);
    }

    #[test]
    fn test_callback_block_runs() {
        let (mut session, mut machine) = setup(false);
        machine.memory().write(ARENA + 0x10, Width::B32, 7).unwrap();
        let entry = session.get_or_compile(&copy_block()).unwrap();

        machine.set_gpr(Gpr::Rsi, 0x10);
        machine.set_gpr(Gpr::Rdx, 0x24);
        assert_eq!(machine.execute(&mut session, entry).unwrap(), ExitReason::Returned);
        assert_eq!(machine.memory().read(ARENA + 0x24, Width::B32).unwrap(), 7);
    }

    #[test]
    fn test_step_limit() {
        let (mut session, mut machine) = setup(false);
        let entry = session.get_or_compile(&copy_block()).unwrap();
        let mut config = session.config().clone();
        config.step_limit = 1;
        let mut limited = CodegenSession::<A64>::new(config, Arc::new(FaultRedirect)).unwrap();
        let entry_limited = limited.get_or_compile(&copy_block()).unwrap();
        assert!(matches!(
            machine.execute(&mut limited, entry_limited),
            Err(JitError::StepLimit(1))
        ));
        machine.set_gpr(Gpr::Rsi, 0x10);
        assert!(machine.execute(&mut session, entry).is_ok());
    }

    #[test]
    fn test_bad_entry() {
        let (mut session, mut machine) = setup(false);
        assert!(matches!(
            machine.execute(&mut session, HostAddr(0x10)),
            Err(JitError::BadCodeAddress(HostAddr(0x10)))
        ));
    }
}
