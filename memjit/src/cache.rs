//! Compiled-block cache with LRU eviction.
//!
//! Maps a guest location to the host entry point of its compiled block.
//!
//! ## Block lifecycle
//!
//! ```text
//!            ┌─────────────────┐
//!            │     Cold        │◄─────────────────────┐
//!            │  (not cached)   │                      │
//!            └────────┬────────┘                      │
//!                     │ compile                       │ invalidate /
//!                     ▼                               │ LRU eviction
//!            ┌─────────────────┐                      │
//!            │     Cached      │──────────────────────┘
//!            │ (entry point)   │───── dispatch runs host code
//!            └─────────────────┘
//! ```
//!
//! Evicting or invalidating an entry never frees its host code: a processor
//! may still be running it, and its fault ledger entries stay valid until
//! that execution completes. The next dispatch of the location recompiles.

use lru::LruCache;
use std::num::NonZeroUsize;

use serde::Serialize;

use crate::guest::LocationDescriptor;
use crate::host::HostAddr;

/// A compiled block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CompiledBlock {
    /// Guest location the block was compiled from
    pub location: LocationDescriptor,
    /// First host instruction of the hot path
    pub entry: HostAddr,
    /// Host instructions emitted, slow paths included
    pub host_insts: usize,
    /// Memory operations in the block
    pub ops: usize,
    /// Operations that were emitted with fastmem
    pub fastmem_sites: usize,
}

/// Cache statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    /// Cache lookup hits
    pub hits: u64,
    /// Cache lookup misses
    pub misses: u64,
    /// Number of entries inserted
    pub insertions: u64,
    /// Number of entries evicted (by LRU)
    pub evictions: u64,
    /// Number of entries invalidated
    pub invalidations: u64,
}

impl CacheStats {
    /// Calculate hit ratio.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Compiled blocks by guest location.
pub struct BlockCache {
    blocks: LruCache<LocationDescriptor, CompiledBlock>,
    stats: CacheStats,
}

impl BlockCache {
    /// Create cache holding at most `max_entries` blocks.
    pub fn new(max_entries: usize) -> Self {
        Self {
            blocks: LruCache::new(NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN)),
            stats: CacheStats::default(),
        }
    }

    /// Insert a compiled block, evicting the least recently used one if the
    /// cache is full. Replaces any previous block at the same location.
    pub fn insert(&mut self, block: CompiledBlock) {
        if let Some((evicted, _)) = self.blocks.push(block.location, block) {
            if evicted != block.location {
                self.stats.evictions += 1;
                log::debug!("[cache] evicted {}", evicted);
            }
        }
        self.stats.insertions += 1;
    }

    /// Look up a block (updates LRU order).
    pub fn get(&mut self, location: LocationDescriptor) -> Option<CompiledBlock> {
        match self.blocks.get(&location) {
            Some(block) => {
                self.stats.hits += 1;
                Some(*block)
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Look up a block without touching LRU order or statistics.
    pub fn peek(&self, location: LocationDescriptor) -> Option<&CompiledBlock> {
        self.blocks.peek(&location)
    }

    pub fn contains(&self, location: LocationDescriptor) -> bool {
        self.blocks.contains(&location)
    }

    /// Drop the block at `location`. Returns whether one was cached.
    pub fn invalidate(&mut self, location: LocationDescriptor) -> bool {
        if self.blocks.pop(&location).is_some() {
            self.stats.invalidations += 1;
            true
        } else {
            false
        }
    }

    /// Drop every block.
    pub fn clear(&mut self) {
        self.stats.invalidations += self.blocks.len() as u64;
        self.blocks.clear();
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.blocks.cap().get()
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}
