//! Fallback thunks.
//!
//! A thunk is a tiny callable routine in the thunk region wrapping one
//! runtime helper for a fixed set of registers:
//!
//! ```text
//!     fence                 ; ordered reads
//!     call-helper <helper>  ; vaddr/value/expected/status registers baked in
//!     fence                 ; ordered writes
//!     ret
//! ```
//!
//! Slow paths `call` a thunk, and the fault handler fake-calls one when a
//! fastmem access faults. Thunks are generated on first use and shared by
//! every block of the session.

use std::collections::HashMap;

use crate::host::{CodeBuffer, Helper, HelperArgs, HostAddr, HostInst};
use crate::ir::AccessOrdering;

/// Identity of a thunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThunkKey {
    pub helper: Helper,
    pub ordering: AccessOrdering,
    pub args: HelperArgs,
}

#[derive(Debug, Clone, Default)]
pub struct ThunkCache {
    entries: HashMap<ThunkKey, HostAddr>,
}

impl ThunkCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Address of the thunk for `key`, emitting it into `code` if needed.
    pub fn get_or_emit(&mut self, code: &mut CodeBuffer, key: ThunkKey) -> HostAddr {
        *self.entries.entry(key).or_insert_with(|| {
            let entry = code.current();
            let ordered = matches!(key.ordering, AccessOrdering::Ordered);
            let is_read = matches!(key.helper, Helper::Read(_) | Helper::ExclusiveRead(_));
            if ordered && is_read {
                code.emit(HostInst::Fence);
            }
            code.emit(HostInst::CallHelper {
                helper: key.helper,
                args: key.args,
            });
            if ordered && !is_read {
                code.emit(HostInst::Fence);
            }
            code.emit(HostInst::Ret);
            log::trace!("[thunk] {:?} {:?} at {}", key.helper, key.ordering, entry);
            entry
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget every thunk; the thunk region must be cleared alongside.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
