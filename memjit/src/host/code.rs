//! Host code buffers.
//!
//! A [`CodeBuffer`] collects host instructions for one code region and hands
//! out their addresses as they are emitted. Branch targets are [`Label`]s,
//! bound to an address once the target is emitted and resolved when the
//! branch executes.
//!
//! A session owns one [`CodeArena`] with two regions: compiled blocks (hot
//! paths followed by their deferred slow paths) and the fallback thunks
//! shared by every block.

use super::{HostAddr, HostInst, INST_SIZE};
use crate::error::{JitError, Result};

/// Base address of the compiled-block region.
pub const BLOCK_REGION_BASE: HostAddr = HostAddr(0x4000_0000);

/// Base address of the fallback-thunk region.
pub const THUNK_REGION_BASE: HostAddr = HostAddr(0x3000_0000);

/// Branch target inside a [`CodeBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(pub(crate) usize);

impl Label {
    pub fn id(self) -> usize {
        self.0
    }
}

/// Append-only buffer of host instructions.
#[derive(Debug, Clone)]
pub struct CodeBuffer {
    base: HostAddr,
    insts: Vec<HostInst>,
    labels: Vec<Option<HostAddr>>,
}

impl CodeBuffer {
    pub fn new(base: HostAddr) -> Self {
        Self {
            base,
            insts: Vec::new(),
            labels: Vec::new(),
        }
    }

    pub fn base(&self) -> HostAddr {
        self.base
    }

    /// Address the next emitted instruction will occupy.
    pub fn current(&self) -> HostAddr {
        HostAddr(self.base.0 + self.insts.len() as u64 * INST_SIZE)
    }

    /// Emit an instruction and return its address.
    pub fn emit(&mut self, inst: HostInst) -> HostAddr {
        let at = self.current();
        self.insts.push(inst);
        at
    }

    /// Emit multiple instructions.
    pub fn emit_all(&mut self, insts: impl IntoIterator<Item = HostInst>) {
        self.insts.extend(insts);
    }

    /// Reserve a label; it must be bound before any branch to it executes.
    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind `label` to the current position.
    pub fn bind(&mut self, label: Label) {
        let here = self.current();
        debug_assert!(self.labels[label.0].is_none(), "label bound twice");
        self.labels[label.0] = Some(here);
    }

    pub fn label_addr(&self, label: Label) -> Result<HostAddr> {
        self.labels
            .get(label.0)
            .copied()
            .flatten()
            .ok_or(JitError::UnboundLabel(label.0))
    }

    /// Bound labels with their addresses, in label order.
    pub fn bound_labels(&self) -> Vec<(Label, HostAddr)> {
        self.labels
            .iter()
            .enumerate()
            .filter_map(|(id, at)| at.map(|at| (Label(id), at)))
            .collect()
    }

    pub fn contains(&self, addr: HostAddr) -> bool {
        addr.0 >= self.base.0
            && addr.0 < self.current().0
            && (addr.0 - self.base.0) % INST_SIZE == 0
    }

    pub fn fetch(&self, addr: HostAddr) -> Option<&HostInst> {
        if !self.contains(addr) {
            return None;
        }
        self.insts.get(((addr.0 - self.base.0) / INST_SIZE) as usize)
    }

    /// Instructions in `[from, to)` paired with their addresses.
    pub fn range(
        &self,
        from: HostAddr,
        to: HostAddr,
    ) -> impl Iterator<Item = (HostAddr, &HostInst)> {
        let base = self.base.0;
        let start = (from.0.saturating_sub(base) / INST_SIZE) as usize;
        let end = ((to.0.saturating_sub(base) / INST_SIZE) as usize).min(self.insts.len());
        self.insts[start.min(end)..end]
            .iter()
            .enumerate()
            .map(move |(i, inst)| (HostAddr(base + (start + i) as u64 * INST_SIZE), inst))
    }

    pub fn len(&self) -> usize {
        self.insts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insts.is_empty()
    }

    /// Drop all code and labels.
    pub fn clear(&mut self) {
        self.insts.clear();
        self.labels.clear();
    }
}

/// The two code regions of a session.
#[derive(Debug, Clone)]
pub struct CodeArena {
    pub blocks: CodeBuffer,
    pub thunks: CodeBuffer,
}

impl CodeArena {
    pub fn new() -> Self {
        Self {
            blocks: CodeBuffer::new(BLOCK_REGION_BASE),
            thunks: CodeBuffer::new(THUNK_REGION_BASE),
        }
    }

    /// Region holding `addr`, if any.
    pub fn region(&self, addr: HostAddr) -> Option<&CodeBuffer> {
        if self.blocks.contains(addr) {
            Some(&self.blocks)
        } else if self.thunks.contains(addr) {
            Some(&self.thunks)
        } else {
            None
        }
    }

    pub fn fetch(&self, addr: HostAddr) -> Result<HostInst> {
        self.region(addr)
            .and_then(|region| region.fetch(addr))
            .copied()
            .ok_or(JitError::BadCodeAddress(addr))
    }

    /// Resolve a label used by the instruction at `at`.
    pub fn resolve(&self, at: HostAddr, label: Label) -> Result<HostAddr> {
        self.region(at)
            .ok_or(JitError::BadCodeAddress(at))?
            .label_addr(label)
    }
}

impl Default for CodeArena {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::Gpr;

    #[test]
    fn test_emit_assigns_consecutive_addresses() {
        let mut code = CodeBuffer::new(HostAddr(0x1000));
        let a = code.emit(HostInst::Fence);
        let b = code.emit(HostInst::Ret);
        assert_eq!(a, HostAddr(0x1000));
        assert_eq!(b, HostAddr(0x1004));
        assert_eq!(code.current(), HostAddr(0x1008));
        assert_eq!(code.fetch(b), Some(&HostInst::Ret));
        assert_eq!(code.fetch(HostAddr(0x1002)), None);
        assert_eq!(code.fetch(HostAddr(0x1008)), None);
    }

    #[test]
    fn test_labels_resolve_after_bind() {
        let mut code = CodeBuffer::new(HostAddr(0x2000));
        let end = code.new_label();
        code.emit(HostInst::Jmp(end));
        assert!(matches!(code.label_addr(end), Err(JitError::UnboundLabel(0))));
        code.emit(HostInst::MovImm { dst: Gpr::Rax, imm: 1 });
        code.bind(end);
        code.emit(HostInst::Ret);
        assert_eq!(code.label_addr(end).unwrap(), HostAddr(0x2008));
    }

    #[test]
    fn test_arena_routes_by_region() {
        let mut arena = CodeArena::new();
        let block = arena.blocks.emit(HostInst::Ret);
        let thunk = arena.thunks.emit(HostInst::Fence);
        assert_eq!(arena.fetch(block).unwrap(), HostInst::Ret);
        assert_eq!(arena.fetch(thunk).unwrap(), HostInst::Fence);
        assert!(matches!(
            arena.fetch(HostAddr(0x10)),
            Err(JitError::BadCodeAddress(_))
        ));
    }

    #[test]
    fn test_range_window() {
        let mut code = CodeBuffer::new(HostAddr(0x100));
        for _ in 0..8 {
            code.emit(HostInst::Fence);
        }
        let window: Vec<_> = code.range(HostAddr(0x108), HostAddr(0x110)).collect();
        assert_eq!(window.len(), 2);
        assert_eq!(window[0].0, HostAddr(0x108));
        assert_eq!(code.range(HostAddr(0x0), HostAddr(0x1000)).count(), 8);
    }
}
