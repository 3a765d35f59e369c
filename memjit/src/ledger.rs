//! Fault/patch ledger.
//!
//! Every fastmem load or store registers the host address of its memory
//! instruction here together with the recovery action for a fault at that
//! address. The host's fault handler asks the session for a [`FakeCall`]:
//! the faulting context is rewritten to call the fallback thunk, which
//! returns to the resume address past the slow path.
//!
//! ```text
//!   hot path                           deferred slow path
//!   ─────────                          ──────────────────
//!   compute host address               abort:
//!   load [host]  ──fault──┐              call <thunk>   <─ fake call target
//!   end: ...              │              <resume>       <─ fake call returns here
//!                         └──────────>   exit-if-halted
//!                                        jmp end
//! ```

use std::collections::HashMap;

use serde::Serialize;

use crate::guest::LocationDescriptor;
use crate::host::HostAddr;
use crate::selector::AccessMarker;

/// Recovery action for one fastmem access instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FaultRecoveryEntry {
    /// Thunk performing the access through the embedder callbacks.
    pub fallback: HostAddr,
    /// Where the fallback returns to.
    pub resume: HostAddr,
    pub marker: AccessMarker,
    /// Opt the site out of fastmem and invalidate its block on fault.
    pub recompile: bool,
}

/// Context rewrite handed back to the fault handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FakeCall {
    pub call_target: HostAddr,
    pub resume: HostAddr,
}

impl From<&FaultRecoveryEntry> for FakeCall {
    fn from(entry: &FaultRecoveryEntry) -> Self {
        FakeCall {
            call_target: entry.fallback,
            resume: entry.resume,
        }
    }
}

/// Map from faulting host instruction address to recovery action.
///
/// Entries are never removed while code is live; entries for invalidated
/// blocks simply stop being reachable.
#[derive(Debug, Clone, Default)]
pub struct FaultLedger {
    entries: HashMap<HostAddr, FaultRecoveryEntry>,
}

impl FaultLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, fault_site: HostAddr, entry: FaultRecoveryEntry) {
        let previous = self.entries.insert(fault_site, entry);
        debug_assert!(previous.is_none(), "fault site {fault_site} registered twice");
    }

    pub fn lookup(&self, rip: HostAddr) -> Option<&FaultRecoveryEntry> {
        self.entries.get(&rip)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&HostAddr, &FaultRecoveryEntry)> {
        self.entries.iter()
    }

    /// Drop every entry. Only valid once the code they describe is gone.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Per-site fastmem state within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MarkerState {
    FastmemActive,
    FastmemDisabled,
}

/// Host exception-handling layer, reduced to the capability query the code
/// generator needs.
pub trait ExceptionHandler: Send + Sync {
    /// Whether host memory faults raised by generated code are delivered to
    /// the session for recovery.
    fn supports_fastmem(&self) -> bool;
}

/// Handler that redirects every host memory fault through the ledger.
#[derive(Debug, Clone, Copy, Default)]
pub struct FaultRedirect;

impl ExceptionHandler for FaultRedirect {
    fn supports_fastmem(&self) -> bool {
        true
    }
}

/// Handler for hosts without fault delivery; fastmem is never used.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFastmem;

impl ExceptionHandler for NoFastmem {
    fn supports_fastmem(&self) -> bool {
        false
    }
}

/// Receiver of block invalidation requests, typically the dispatcher's
/// block lookup table.
pub trait InvalidationSink: Send + Sync {
    fn invalidate(&self, location: LocationDescriptor);
}
