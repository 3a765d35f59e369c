//! Deferred slow-path emission.
//!
//! Emitters do not write their slow paths inline. They queue a [`SlowPath`]
//! describing it and the compiler materializes the queue after the block's
//! hot path, so the hot path stays contiguous. Items are materialized in the
//! order they were queued.

use crate::host::{CodeBuffer, HostAddr, HostInst, Label};
use crate::ledger::{FaultLedger, FaultRecoveryEntry};
use crate::selector::AccessMarker;

/// Fastmem instruction whose fault is recovered through this slow path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultSite {
    pub addr: HostAddr,
    pub marker: AccessMarker,
    pub recompile: bool,
}

/// One out-of-line slow path.
///
/// Materializes as:
///
/// ```text
/// abort:
///     call   thunk
///     ; resume address of `fault`, if any
///     exit-if-halted guest_pc       ; only with `exit_check`
///     jmp    end
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlowPath {
    pub abort: Label,
    pub end: Label,
    pub thunk: HostAddr,
    pub fault: Option<FaultSite>,
    /// Guest PC reported if the fallback raised a memory abort. `None` when
    /// the hot path performs the check itself after `end`.
    pub exit_check: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct DeferredQueue {
    items: Vec<SlowPath>,
}

impl DeferredQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: SlowPath) {
        self.items.push(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Emit every queued slow path into `code`, registering fault sites in
    /// `ledger`. Returns the number of slow paths emitted.
    pub fn materialize(&mut self, code: &mut CodeBuffer, ledger: &mut FaultLedger) -> usize {
        let count = self.items.len();
        for item in self.items.drain(..) {
            code.bind(item.abort);
            code.emit(HostInst::Call(item.thunk));
            if let Some(fault) = item.fault {
                ledger.register(
                    fault.addr,
                    FaultRecoveryEntry {
                        fallback: item.thunk,
                        resume: code.current(),
                        marker: fault.marker,
                        recompile: fault.recompile,
                    },
                );
            }
            if let Some(guest_pc) = item.exit_check {
                code.emit(HostInst::ExitIfHalted { guest_pc });
            }
            code.emit(HostInst::Jmp(item.end));
        }
        count
    }
}
