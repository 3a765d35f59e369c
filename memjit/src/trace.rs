//! Code generation and fault tracing for debugging.

use std::collections::VecDeque;

use crate::guest::LocationDescriptor;
use crate::host::HostAddr;
use crate::selector::AccessMarker;

/// Trace event types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    /// Block compiled
    Compile {
        location: LocationDescriptor,
        entry: HostAddr,
        host_insts: usize,
        fastmem_sites: usize,
    },
    /// Block cache lookup
    CacheLookup {
        location: LocationDescriptor,
        hit: bool,
    },
    /// Host fault redirected to a fallback thunk
    FaultRecovered {
        rip: HostAddr,
        marker: AccessMarker,
    },
    /// Site opted out of fastmem after a fault
    FastmemDisabled { marker: AccessMarker },
    /// Compiled code invalidated
    Invalidate {
        location: Option<LocationDescriptor>, // None = whole cache
        reason: &'static str,
    },
    /// Host fault with no ledger entry
    Unrecoverable { rip: HostAddr, addr: u64 },
    /// Block left early because a callback reported an abort
    MemoryAbort { guest_pc: u64 },
}

/// Trace buffer with ring-buffer semantics.
pub struct TraceBuffer {
    events: VecDeque<TraceEvent>,
    capacity: usize,
    enabled: bool,
    /// Sequence number for ordering
    sequence: u64,
}

impl TraceBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
            enabled: false,
            sequence: 0,
        }
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn push(&mut self, event: TraceEvent) {
        if !self.enabled || self.capacity == 0 {
            return;
        }
        if self.events.len() >= self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
        self.sequence += 1;
    }

    pub fn clear(&mut self) {
        self.events.clear();
        self.sequence = 0;
    }

    pub fn iter(&self) -> impl Iterator<Item = &TraceEvent> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Get the current sequence number.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Log the most recent events at info level.
    pub fn dump_recent(&self, count: usize) {
        let start = self.events.len().saturating_sub(count);
        log::info!("═══ Recent {} memjit events ═══", count);
        for (i, event) in self.events.iter().skip(start).enumerate() {
            log::info!("{}", format_event(i, event));
        }
    }

    /// Get statistics from trace buffer.
    pub fn stats(&self) -> TraceStats {
        let mut stats = TraceStats::default();
        for event in &self.events {
            match event {
                TraceEvent::Compile { host_insts, .. } => {
                    stats.compilations += 1;
                    stats.total_host_insts += host_insts;
                }
                TraceEvent::CacheLookup { hit: true, .. } => stats.cache_hits += 1,
                TraceEvent::CacheLookup { hit: false, .. } => stats.cache_misses += 1,
                TraceEvent::FaultRecovered { .. } => stats.faults_recovered += 1,
                TraceEvent::FastmemDisabled { .. } => stats.fastmem_disabled += 1,
                TraceEvent::Invalidate { .. } => stats.invalidations += 1,
                TraceEvent::Unrecoverable { .. } => stats.unrecoverable += 1,
                TraceEvent::MemoryAbort { .. } => stats.memory_aborts += 1,
            }
        }
        stats
    }

    /// Find events matching a predicate.
    pub fn filter<F>(&self, predicate: F) -> Vec<&TraceEvent>
    where
        F: Fn(&TraceEvent) -> bool,
    {
        self.events.iter().filter(|e| predicate(e)).collect()
    }

    /// Find all events for a guest location.
    pub fn events_for_location(&self, location: LocationDescriptor) -> Vec<&TraceEvent> {
        self.filter(|e| match e {
            TraceEvent::Compile { location: l, .. } => *l == location,
            TraceEvent::CacheLookup { location: l, .. } => *l == location,
            TraceEvent::FaultRecovered { marker, .. } => marker.location == location,
            TraceEvent::FastmemDisabled { marker } => marker.location == location,
            TraceEvent::Invalidate { location: l, .. } => l.map_or(true, |l| l == location),
            _ => false,
        })
    }
}

/// Format a trace event for display.
fn format_event(index: usize, event: &TraceEvent) -> String {
    match event {
        TraceEvent::Compile {
            location,
            entry,
            host_insts,
            fastmem_sites,
        } => format!(
            "[{:4}] COMPILE {} at {} ({} insts, {} fastmem)",
            index, location, entry, host_insts, fastmem_sites
        ),
        TraceEvent::CacheLookup { location, hit } => {
            let status = if *hit { "HIT" } else { "MISS" };
            format!("[{:4}] CACHE {} {}", index, status, location)
        }
        TraceEvent::FaultRecovered { rip, marker } => {
            format!("[{:4}] FAULT {} → fallback ({})", index, rip, marker)
        }
        TraceEvent::FastmemDisabled { marker } => {
            format!("[{:4}] FASTMEM_OFF {}", index, marker)
        }
        TraceEvent::Invalidate { location, reason } => match location {
            Some(location) => format!("[{:4}] INVALIDATE {} ({})", index, location, reason),
            None => format!("[{:4}] INVALIDATE_ALL ({})", index, reason),
        },
        TraceEvent::Unrecoverable { rip, addr } => {
            format!("[{:4}] UNRECOVERABLE {} addr={:#x}", index, rip, addr)
        }
        TraceEvent::MemoryAbort { guest_pc } => {
            format!("[{:4}] ABORT pc={:016x}", index, guest_pc)
        }
    }
}

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct TraceStats {
    pub compilations: u64,
    pub total_host_insts: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub faults_recovered: u64,
    pub fastmem_disabled: u64,
    pub invalidations: u64,
    pub unrecoverable: u64,
    pub memory_aborts: u64,
}

impl TraceStats {
    /// Calculate cache hit ratio.
    pub fn cache_hit_ratio(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }

    /// Calculate average compiled block size in host instructions.
    pub fn avg_block_insts(&self) -> f64 {
        if self.compilations == 0 {
            0.0
        } else {
            self.total_host_insts as f64 / self.compilations as f64
        }
    }

    /// Format stats as a string for display.
    pub fn format(&self) -> String {
        format!(
            "memjit trace:\n\
             ├─ Compilations: {} (avg {:.1} host insts)\n\
             ├─ Cache: {} hits / {} misses ({:.1}% hit rate)\n\
             ├─ Faults recovered: {}\n\
             ├─ Sites opted out of fastmem: {}\n\
             ├─ Invalidations: {}\n\
             ├─ Unrecoverable faults: {}\n\
             └─ Memory aborts: {}",
            self.compilations,
            self.avg_block_insts(),
            self.cache_hits,
            self.cache_misses,
            self.cache_hit_ratio() * 100.0,
            self.faults_recovered,
            self.fastmem_disabled,
            self.invalidations,
            self.unrecoverable,
            self.memory_aborts,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(location: u64, hit: bool) -> TraceEvent {
        TraceEvent::CacheLookup {
            location: LocationDescriptor(location),
            hit,
        }
    }

    #[test]
    fn test_trace_buffer_capacity() {
        let mut buffer = TraceBuffer::new(3);
        buffer.enable();

        // Push 5 events into buffer of capacity 3
        for i in 0..5u64 {
            buffer.push(lookup(i * 0x100, false));
        }

        assert_eq!(buffer.len(), 3);
        let locations: Vec<u64> = buffer
            .iter()
            .filter_map(|e| match e {
                TraceEvent::CacheLookup { location, .. } => Some(location.0),
                _ => None,
            })
            .collect();
        assert_eq!(locations, vec![0x200, 0x300, 0x400]);
        assert_eq!(buffer.sequence(), 5);
    }

    #[test]
    fn test_trace_buffer_disabled() {
        let mut buffer = TraceBuffer::new(10);
        // Buffer is disabled by default
        buffer.push(lookup(0x1000, true));
        assert!(buffer.is_empty());
        assert_eq!(buffer.sequence(), 0);

        buffer.enable();
        buffer.push(lookup(0x1000, true));
        buffer.disable();
        buffer.push(lookup(0x1000, true));
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_trace_stats_calculation() {
        let mut buffer = TraceBuffer::new(100);
        buffer.enable();
        let marker = AccessMarker::new(LocationDescriptor(0x1000), 2);

        buffer.push(TraceEvent::Compile {
            location: LocationDescriptor(0x1000),
            entry: HostAddr(0x4000_0000),
            host_insts: 10,
            fastmem_sites: 1,
        });
        buffer.push(TraceEvent::Compile {
            location: LocationDescriptor(0x2000),
            entry: HostAddr(0x4000_0028),
            host_insts: 20,
            fastmem_sites: 0,
        });
        buffer.push(lookup(0x1000, true));
        buffer.push(lookup(0x3000, false));
        buffer.push(TraceEvent::FaultRecovered {
            rip: HostAddr(0x4000_0008),
            marker,
        });
        buffer.push(TraceEvent::FastmemDisabled { marker });

        let stats = buffer.stats();
        assert_eq!(stats.compilations, 2);
        assert_eq!(stats.avg_block_insts(), 15.0);
        assert_eq!(stats.cache_hit_ratio(), 0.5);
        assert_eq!(stats.faults_recovered, 1);
        assert_eq!(stats.fastmem_disabled, 1);
        assert!(stats.format().contains("Faults recovered: 1"));
    }

    #[test]
    fn test_events_for_location() {
        let mut buffer = TraceBuffer::new(100);
        buffer.enable();
        buffer.push(lookup(0x1000, false));
        buffer.push(lookup(0x2000, false));
        buffer.push(TraceEvent::FastmemDisabled {
            marker: AccessMarker::new(LocationDescriptor(0x1000), 0),
        });
        buffer.push(TraceEvent::Invalidate {
            location: None,
            reason: "clear",
        });

        assert_eq!(buffer.events_for_location(LocationDescriptor(0x1000)).len(), 3);
        assert_eq!(buffer.events_for_location(LocationDescriptor(0x2000)).len(), 2);
    }

    #[test]
    fn test_clear() {
        let mut buffer = TraceBuffer::new(10);
        buffer.enable();
        buffer.push(TraceEvent::MemoryAbort { guest_pc: 4 });
        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.sequence(), 0);
    }

    #[test]
    fn test_trace_stats_default() {
        let stats = TraceStats::default();
        assert_eq!(stats.cache_hit_ratio(), 0.0);
        assert_eq!(stats.avg_block_insts(), 0.0);
    }
}
