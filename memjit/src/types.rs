//! Configuration and result types.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::callbacks::MemoryCallbacks;
use crate::error::{JitError, Result};
use crate::guest::GuestArch;
use crate::host::Width;
use crate::monitor::ExclusiveMonitor;

/// Embedder-owned software page table.
///
/// The table is an array of 64-bit entries indexed by guest page number.
/// A zero entry means the page is not mapped and the access goes to the
/// callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTableConfig {
    /// Host address of entry 0.
    pub pointer: u64,

    /// log2 of the guest page size.
    pub page_bits: u32,

    /// Number of guest address bits the table covers.
    pub address_space_bits: u32,

    /// Wrap addresses beyond `address_space_bits` instead of sending them to
    /// the callbacks.
    pub silently_mirror: bool,

    /// Entries hold `host page - guest page base`, so the host address is
    /// `entry + vaddr` instead of `entry + page offset`.
    pub absolute_offset: bool,

    /// Bit set of access sizes in bytes (`1 << log2(bytes)`, 128 bits is
    /// `0x10`) for which a misaligned address takes the slow path.
    pub detect_misaligned: u8,
}

impl PageTableConfig {
    pub fn new(pointer: u64, address_space_bits: u32) -> Self {
        Self {
            pointer,
            page_bits: 12,                 // 4 KiB pages
            address_space_bits,
            silently_mirror: false,        // Out-of-range addresses use callbacks
            absolute_offset: false,
            detect_misaligned: 0,          // Misaligned accesses take the fast path
        }
    }

    #[inline]
    pub fn page_mask(&self) -> u64 {
        (1u64 << self.page_bits) - 1
    }

    pub fn detects_misaligned(&self, width: Width) -> bool {
        self.detect_misaligned & width.bytes() as u8 != 0
    }

    /// Number of entries in the table.
    pub fn entry_count(&self) -> u64 {
        1u64 << (self.address_space_bits - self.page_bits)
    }
}

/// Code generation configuration for one processor.
#[derive(Clone)]
pub struct JitConfig {
    /// Memory access functions: the fallback of every strategy and the only
    /// strategy when neither fastmem nor a page table is configured.
    pub callbacks: Arc<dyn MemoryCallbacks>,

    /// Host address guest address 0 is mapped at for fastmem.
    pub fastmem_pointer: Option<u64>,

    /// Number of guest address bits backed by the fastmem arena. Only
    /// consulted when the guest address space is wider.
    pub fastmem_address_space_bits: u32,

    /// Wrap addresses beyond `fastmem_address_space_bits` instead of sending
    /// them to the callbacks.
    pub silently_mirror_fastmem: bool,

    /// Inline exclusive accesses using host atomics on the fastmem or page
    /// table path.
    pub fastmem_exclusive_access: bool,

    /// Software translation table.
    pub page_table: Option<PageTableConfig>,

    /// Monitor shared by all processors; required for exclusive accesses.
    pub global_monitor: Option<Arc<ExclusiveMonitor>>,

    /// Index of this processor in the global monitor.
    pub processor_id: usize,

    /// Opt a faulting fastmem site out of fastmem and recompile its block.
    pub recompile_on_fastmem_failure: bool,

    /// Same as `recompile_on_fastmem_failure`, for inline exclusive accesses.
    pub recompile_on_exclusive_fastmem_failure: bool,

    /// Maximum compiled blocks kept in the block cache.
    pub max_cache_size: usize,

    /// Record compile and fault events in the trace buffer.
    pub trace_enabled: bool,

    /// Log the listing of every compiled block at debug level.
    pub debug_listing: bool,

    /// Host instructions one `execute` call may retire (0 = unlimited).
    pub step_limit: u64,
}

impl JitConfig {
    pub fn new(callbacks: Arc<dyn MemoryCallbacks>) -> Self {
        Self {
            callbacks,
            fastmem_pointer: None,
            fastmem_address_space_bits: 36,     // 64 GiB arena
            silently_mirror_fastmem: true,
            fastmem_exclusive_access: false,    // Host-call exclusives
            page_table: None,
            global_monitor: None,
            processor_id: 0,
            recompile_on_fastmem_failure: true,
            recompile_on_exclusive_fastmem_failure: true,
            max_cache_size: 1024,               // 1K compiled blocks
            trace_enabled: false,
            debug_listing: false,
            step_limit: 1_000_000,              // Catches runaway loops in tests
        }
    }

    /// Check the configuration against guest `G`.
    pub fn validate<G: GuestArch>(&self) -> Result<()> {
        if self.fastmem_pointer.is_some()
            && !(1..=64).contains(&self.fastmem_address_space_bits)
        {
            return Err(JitError::InvalidConfig(format!(
                "fastmem_address_space_bits must be in 1..=64, got {}",
                self.fastmem_address_space_bits
            )));
        }
        if let Some(pt) = &self.page_table {
            if pt.page_bits == 0 || pt.page_bits >= pt.address_space_bits {
                return Err(JitError::InvalidConfig(format!(
                    "page_bits {} must be non-zero and below address_space_bits {}",
                    pt.page_bits, pt.address_space_bits
                )));
            }
            if pt.address_space_bits > G::ADDRESS_BITS {
                return Err(JitError::InvalidConfig(format!(
                    "page table covers {} bits but {} addresses are {} bits",
                    pt.address_space_bits,
                    G::NAME,
                    G::ADDRESS_BITS
                )));
            }
        }
        if let Some(monitor) = &self.global_monitor {
            if self.processor_id >= monitor.processor_count() {
                return Err(JitError::InvalidConfig(format!(
                    "processor_id {} out of range for a {}-processor monitor",
                    self.processor_id,
                    monitor.processor_count()
                )));
            }
        }
        if self.max_cache_size == 0 {
            return Err(JitError::InvalidConfig("max_cache_size must be non-zero".into()));
        }
        Ok(())
    }
}

impl fmt::Debug for JitConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JitConfig")
            .field("fastmem_pointer", &self.fastmem_pointer)
            .field("fastmem_address_space_bits", &self.fastmem_address_space_bits)
            .field("silently_mirror_fastmem", &self.silently_mirror_fastmem)
            .field("fastmem_exclusive_access", &self.fastmem_exclusive_access)
            .field("page_table", &self.page_table)
            .field("global_monitor", &self.global_monitor.is_some())
            .field("processor_id", &self.processor_id)
            .field("recompile_on_fastmem_failure", &self.recompile_on_fastmem_failure)
            .field(
                "recompile_on_exclusive_fastmem_failure",
                &self.recompile_on_exclusive_fastmem_failure,
            )
            .field("max_cache_size", &self.max_cache_size)
            .finish_non_exhaustive()
    }
}

/// Code generation and fault statistics.
#[derive(Debug, Default, Clone, Serialize)]
pub struct JitStats {
    /// Blocks compiled
    pub blocks_compiled: u64,
    /// Block cache hits
    pub cache_hits: u64,
    /// Block cache misses
    pub cache_misses: u64,
    /// Accesses emitted with fastmem
    pub fastmem_sites: u64,
    /// Accesses emitted with a page table lookup
    pub page_table_sites: u64,
    /// Accesses emitted as callback calls
    pub callback_sites: u64,
    /// Exclusive accesses emitted inline with host atomics
    pub exclusive_inline_sites: u64,
    /// Exclusive accesses emitted as helper calls
    pub exclusive_call_sites: u64,
    /// Fallback thunks generated
    pub thunks: u64,
    /// Fastmem faults redirected to a fallback
    pub faults_recovered: u64,
    /// Faults that opted a site out and requested recompilation
    pub recompile_requests: u64,
    /// Block invalidations performed
    pub invalidations: u64,
}

/// Why a block returned to its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExitReason {
    /// The block ran to completion.
    Returned,
    /// A callback reported a guest memory abort at `guest_pc`.
    MemoryAbort { guest_pc: u64 },
}
