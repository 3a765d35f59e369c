//! Flat host address space.
//!
//! Host memory is a set of mapped regions shared by every processor. The
//! fastmem arena, the embedder's page table and any host pages the page table
//! points at all live here. Touching an unmapped byte is a host memory fault.

use parking_lot::RwLock;
use thiserror::Error;

use super::Width;

/// Access to an unmapped host address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("host memory fault at {addr:#x}")]
pub struct MemoryFault {
    pub addr: u64,
}

#[derive(Debug)]
struct Region {
    base: u64,
    bytes: Vec<u8>,
}

impl Region {
    fn end(&self) -> u64 {
        self.base + self.bytes.len() as u64
    }

    fn span(&self, addr: u64, len: usize) -> Option<std::ops::Range<usize>> {
        let end = addr.checked_add(len as u64)?;
        if addr >= self.base && end <= self.end() {
            let start = (addr - self.base) as usize;
            Some(start..start + len)
        } else {
            None
        }
    }
}

/// Shared host memory.
#[derive(Debug, Default)]
pub struct HostMemory {
    regions: RwLock<Vec<Region>>,
}

impl HostMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `size` zeroed bytes at `base`.
    ///
    /// # Panics
    /// Panics if the new region overlaps an existing one.
    pub fn map(&self, base: u64, size: usize) {
        let mut regions = self.regions.write();
        let end = base + size as u64;
        assert!(
            regions.iter().all(|r| end <= r.base || base >= r.end()),
            "host region {base:#x}..{end:#x} overlaps an existing mapping"
        );
        regions.push(Region {
            base,
            bytes: vec![0; size],
        });
        log::debug!("[host] mapped {:#x}..{:#x}", base, end);
    }

    pub fn is_mapped(&self, addr: u64, len: usize) -> bool {
        self.regions
            .read()
            .iter()
            .any(|r| r.span(addr, len).is_some())
    }

    pub fn read(&self, addr: u64, width: Width) -> Result<u128, MemoryFault> {
        let regions = self.regions.read();
        let (region, span) = locate(&regions, addr, width.bytes())?;
        Ok(decode(&region.bytes[span]))
    }

    pub fn write(&self, addr: u64, width: Width, value: u128) -> Result<(), MemoryFault> {
        let mut regions = self.regions.write();
        let (region, span) = locate_mut(&mut regions, addr, width.bytes())?;
        encode(&mut region.bytes[span], value);
        Ok(())
    }

    /// Atomically replace the value at `addr` with `new` if it equals
    /// `expected`.
    ///
    /// Returns `Ok(Ok(previous))` on success and `Ok(Err(current))` when the
    /// comparison failed.
    pub fn compare_exchange(
        &self,
        addr: u64,
        width: Width,
        expected: u128,
        new: u128,
    ) -> Result<Result<u128, u128>, MemoryFault> {
        let mut regions = self.regions.write();
        let (region, span) = locate_mut(&mut regions, addr, width.bytes())?;
        let bytes = &mut region.bytes[span];
        let current = decode(bytes);
        if current == expected & width.mask() {
            encode(bytes, new);
            Ok(Ok(current))
        } else {
            Ok(Err(current))
        }
    }

    pub fn read_bytes(&self, addr: u64, out: &mut [u8]) -> Result<(), MemoryFault> {
        let regions = self.regions.read();
        let (region, span) = locate(&regions, addr, out.len())?;
        out.copy_from_slice(&region.bytes[span]);
        Ok(())
    }

    pub fn write_bytes(&self, addr: u64, data: &[u8]) -> Result<(), MemoryFault> {
        let mut regions = self.regions.write();
        let (region, span) = locate_mut(&mut regions, addr, data.len())?;
        region.bytes[span].copy_from_slice(data);
        Ok(())
    }
}

fn locate<'a>(
    regions: &'a [Region],
    addr: u64,
    len: usize,
) -> Result<(&'a Region, std::ops::Range<usize>), MemoryFault> {
    regions
        .iter()
        .find_map(|r| r.span(addr, len).map(|span| (r, span)))
        .ok_or(MemoryFault { addr })
}

fn locate_mut<'a>(
    regions: &'a mut [Region],
    addr: u64,
    len: usize,
) -> Result<(&'a mut Region, std::ops::Range<usize>), MemoryFault> {
    regions
        .iter_mut()
        .find_map(|r| r.span(addr, len).map(|span| (r, span)))
        .ok_or(MemoryFault { addr })
}

fn decode(bytes: &[u8]) -> u128 {
    bytes
        .iter()
        .enumerate()
        .fold(0u128, |acc, (i, b)| acc | (*b as u128) << (i * 8))
}

fn encode(bytes: &mut [u8], value: u128) {
    for (i, b) in bytes.iter_mut().enumerate() {
        *b = (value >> (i * 8)) as u8;
    }
}
