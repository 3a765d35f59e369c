//! Code generation session for one guest address space.
//!
//! The session owns everything that outlives a single compiled block: the
//! code arena, the shared fallback thunks, the fault ledger, the fastmem
//! opt-out set and the block cache. It is also the fault handler's entry
//! point: [`CodegenSession::fastmem_callback`] turns a faulting host
//! instruction address into a fake call to the fallback, and applies the
//! recompile policy of the faulting site.
//!
//! ## Per-site fastmem state
//!
//! ```text
//!   ┌────────────────┐   fault, recompile policy   ┌──────────────────┐
//!   │ FastmemActive  │────────────────────────────►│ FastmemDisabled  │
//!   └────────────────┘                             └──────────────────┘
//!          │ fault, no recompile policy                    (terminal)
//!          └──► stays active; every fault takes the fallback
//! ```

use std::marker::PhantomData;
use std::sync::Arc;

use crate::cache::{BlockCache, CompiledBlock};
use crate::compiler::JitCompiler;
use crate::disasm;
use crate::emit::thunks::ThunkCache;
use crate::error::{JitError, Result};
use crate::guest::{GuestArch, LocationDescriptor};
use crate::host::{CodeArena, HostAddr};
use crate::ir::Block;
use crate::ledger::{ExceptionHandler, FakeCall, FaultLedger, InvalidationSink, MarkerState};
use crate::selector::{AccessMarker, OptOutSet};
use crate::state::StateLayout;
use crate::trace::{TraceBuffer, TraceEvent};
use crate::types::{JitConfig, JitStats};

/// Instructions shown either side of an unrecoverable fault.
const DUMP_RADIUS: usize = 8;

/// Trace buffer capacity when tracing is enabled.
const TRACE_CAPACITY: usize = 1000;

pub struct CodegenSession<G: GuestArch> {
    config: JitConfig,
    handler: Arc<dyn ExceptionHandler>,
    layout: StateLayout,
    arena: CodeArena,
    thunks: ThunkCache,
    ledger: FaultLedger,
    opt_out: OptOutSet,
    cache: BlockCache,
    stats: JitStats,
    trace: TraceBuffer,
    sink: Option<Arc<dyn InvalidationSink>>,
    guest: PhantomData<G>,
}

impl<G: GuestArch> CodegenSession<G> {
    /// Create a session after validating `config` for guest `G`.
    pub fn new(config: JitConfig, handler: Arc<dyn ExceptionHandler>) -> Result<Self> {
        config.validate::<G>()?;
        let layout = G::state_layout()?;
        let trace_capacity = if config.trace_enabled {
            TRACE_CAPACITY
        } else {
            0
        };
        let mut trace = TraceBuffer::new(trace_capacity);
        if config.trace_enabled {
            trace.enable();
        }
        log::info!(
            "[memjit] {} session: fastmem={} page_table={} monitor={} host faults={}",
            G::NAME,
            config.fastmem_pointer.is_some(),
            config.page_table.is_some(),
            config.global_monitor.is_some(),
            handler.supports_fastmem()
        );

        Ok(Self {
            cache: BlockCache::new(config.max_cache_size),
            config,
            handler,
            layout,
            arena: CodeArena::new(),
            thunks: ThunkCache::new(),
            ledger: FaultLedger::new(),
            opt_out: OptOutSet::new(),
            stats: JitStats::default(),
            trace,
            sink: None,
            guest: PhantomData,
        })
    }

    /// Register the dispatcher to notify when a location is invalidated.
    pub fn set_invalidation_sink(&mut self, sink: Arc<dyn InvalidationSink>) {
        self.sink = Some(sink);
    }

    /// Compile `block` and cache it, replacing any cached block at the same
    /// location.
    pub fn compile(&mut self, block: &Block) -> Result<CompiledBlock> {
        let compiled = JitCompiler {
            config: &self.config,
            layout: self.layout,
            supports_fastmem: self.handler.supports_fastmem(),
            arena: &mut self.arena,
            thunks: &mut self.thunks,
            ledger: &mut self.ledger,
            opt_out: &self.opt_out,
            stats: &mut self.stats,
        }
        .compile::<G>(block)?;

        self.cache.insert(compiled);
        self.trace.push(TraceEvent::Compile {
            location: compiled.location,
            entry: compiled.entry,
            host_insts: compiled.host_insts,
            fastmem_sites: compiled.fastmem_sites,
        });
        Ok(compiled)
    }

    /// Entry point of the cached block at `location`, if any.
    pub fn lookup(&mut self, location: LocationDescriptor) -> Option<HostAddr> {
        let found = self.cache.get(location);
        if found.is_some() {
            self.stats.cache_hits += 1;
        } else {
            self.stats.cache_misses += 1;
        }
        self.trace.push(TraceEvent::CacheLookup {
            location,
            hit: found.is_some(),
        });
        found.map(|block| block.entry)
    }

    /// Entry point of `block`, compiling it on a cache miss.
    pub fn get_or_compile(&mut self, block: &Block) -> Result<HostAddr> {
        match self.lookup(block.location) {
            Some(entry) => Ok(entry),
            None => self.compile(block).map(|compiled| compiled.entry),
        }
    }

    /// Recovery action for a host fault at `rip`, or `None` if `rip` is not
    /// a registered fastmem access.
    ///
    /// A site with the recompile policy is opted out of fastmem and its
    /// location invalidated the first time it faults; later faults from
    /// code still running only take the fallback.
    pub fn fastmem_callback(&mut self, rip: HostAddr) -> Option<FakeCall> {
        let entry = *self.ledger.lookup(rip)?;
        self.stats.faults_recovered += 1;
        log::debug!(
            "[memjit] fastmem fault at {} ({}), redirecting to {}",
            rip,
            entry.marker,
            entry.fallback
        );
        self.trace.push(TraceEvent::FaultRecovered {
            rip,
            marker: entry.marker,
        });

        if entry.recompile && self.opt_out.insert(entry.marker) {
            self.stats.recompile_requests += 1;
            log::info!(
                "[memjit] disabling fastmem for {} and recompiling {}",
                entry.marker,
                entry.marker.location
            );
            self.trace.push(TraceEvent::FastmemDisabled {
                marker: entry.marker,
            });
            self.invalidate_location(entry.marker.location, "fastmem fault");
        }
        Some(FakeCall::from(&entry))
    }

    /// [`fastmem_callback`](Self::fastmem_callback), with an unknown `rip`
    /// reported as an unrecoverable fault carrying a listing of the code
    /// around it.
    pub fn handle_fault(&mut self, rip: HostAddr, addr: u64) -> Result<FakeCall> {
        if let Some(call) = self.fastmem_callback(rip) {
            return Ok(call);
        }
        let listing = disasm::dump_window(&self.arena, rip, DUMP_RADIUS);
        log::error!(
            "[memjit] unrecoverable host fault at {} accessing {:#x}\n{}",
            rip,
            addr,
            listing
        );
        self.trace.push(TraceEvent::Unrecoverable { rip, addr });
        Err(JitError::UnrecoverableFault { rip, addr, listing })
    }

    /// Drop compiled code for `location` so the next dispatch recompiles it.
    ///
    /// Code already running keeps running. Returns whether a cached block
    /// was dropped.
    pub fn invalidate_location(
        &mut self,
        location: LocationDescriptor,
        reason: &'static str,
    ) -> bool {
        let dropped = self.cache.invalidate(location);
        self.stats.invalidations += 1;
        if let Some(sink) = &self.sink {
            sink.invalidate(location);
        }
        log::debug!("[memjit] invalidated {} ({})", location, reason);
        self.trace.push(TraceEvent::Invalidate {
            location: Some(location),
            reason,
        });
        dropped
    }

    /// Drop every cached block. Opt-outs survive.
    pub fn clear_cache(&mut self) {
        self.cache.clear();
        self.trace.push(TraceEvent::Invalidate {
            location: None,
            reason: "clear",
        });
    }

    pub fn marker_state(&self, marker: AccessMarker) -> MarkerState {
        if self.opt_out.contains(&marker) {
            MarkerState::FastmemDisabled
        } else {
            MarkerState::FastmemActive
        }
    }

    pub fn supports_fastmem(&self) -> bool {
        self.handler.supports_fastmem()
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub fn layout(&self) -> &StateLayout {
        &self.layout
    }

    pub fn arena(&self) -> &CodeArena {
        &self.arena
    }

    pub fn ledger(&self) -> &FaultLedger {
        &self.ledger
    }

    pub fn opt_out(&self) -> &OptOutSet {
        &self.opt_out
    }

    pub fn cache(&self) -> &BlockCache {
        &self.cache
    }

    pub fn stats(&self) -> &JitStats {
        &self.stats
    }

    pub fn trace(&self) -> &TraceBuffer {
        &self.trace
    }

    pub fn trace_mut(&mut self) -> &mut TraceBuffer {
        &mut self.trace
    }
}
