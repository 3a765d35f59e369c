//! Fastmem fault recovery through the ledger, the recompile policy and the
//! invalidation path.

mod common;

use std::sync::Arc;

use common::{Guest, Route, FASTMEM_BASE, GUEST_RAM, PAGE_TABLE_BASE};
use memjit::{
    AccessDescriptor, ArenaCallbacks, Block, CallbackResult, ExitReason, Gpr, InvalidationSink,
    JitError, LocationDescriptor, MarkerState, MemOp, MemoryCallbacks, Width,
};
use parking_lot::Mutex;

const LOCATION: LocationDescriptor = LocationDescriptor(0x40_0000);
const MMIO_BASE: u64 = 0x8000_0000;
const MMIO_VALUE: u64 = 0xABCD;

#[derive(Default)]
struct RecordingSink(Mutex<Vec<LocationDescriptor>>);

impl InvalidationSink for RecordingSink {
    fn invalidate(&self, location: LocationDescriptor) {
        self.0.lock().push(location);
    }
}

/// Guest RAM plus a device register window that host memory does not back.
struct Mmio {
    ram: ArenaCallbacks,
    writes: Mutex<Vec<(u64, u64)>>,
}

impl Mmio {
    fn new(guest: &Guest) -> Self {
        Self {
            ram: ArenaCallbacks::new(Arc::clone(&guest.memory), FASTMEM_BASE, GUEST_RAM),
            writes: Mutex::new(Vec::new()),
        }
    }

    fn is_device(vaddr: u64) -> bool {
        vaddr >= MMIO_BASE
    }

    fn device_write(&self, vaddr: u64, value: u64) -> CallbackResult<()> {
        self.writes.lock().push((vaddr, value));
        Ok(())
    }
}

impl MemoryCallbacks for Mmio {
    fn memory_read_8(&self, vaddr: u64) -> CallbackResult<u8> {
        if Self::is_device(vaddr) {
            Ok(MMIO_VALUE as u8)
        } else {
            self.ram.memory_read_8(vaddr)
        }
    }
    fn memory_read_16(&self, vaddr: u64) -> CallbackResult<u16> {
        if Self::is_device(vaddr) {
            Ok(MMIO_VALUE as u16)
        } else {
            self.ram.memory_read_16(vaddr)
        }
    }
    fn memory_read_32(&self, vaddr: u64) -> CallbackResult<u32> {
        if Self::is_device(vaddr) {
            Ok(MMIO_VALUE as u32)
        } else {
            self.ram.memory_read_32(vaddr)
        }
    }
    fn memory_read_64(&self, vaddr: u64) -> CallbackResult<u64> {
        if Self::is_device(vaddr) {
            Ok(MMIO_VALUE)
        } else {
            self.ram.memory_read_64(vaddr)
        }
    }

    fn memory_write_8(&self, vaddr: u64, value: u8) -> CallbackResult<()> {
        if Self::is_device(vaddr) {
            self.device_write(vaddr, value as u64)
        } else {
            self.ram.memory_write_8(vaddr, value)
        }
    }
    fn memory_write_16(&self, vaddr: u64, value: u16) -> CallbackResult<()> {
        if Self::is_device(vaddr) {
            self.device_write(vaddr, value as u64)
        } else {
            self.ram.memory_write_16(vaddr, value)
        }
    }
    fn memory_write_32(&self, vaddr: u64, value: u32) -> CallbackResult<()> {
        if Self::is_device(vaddr) {
            self.device_write(vaddr, value as u64)
        } else {
            self.ram.memory_write_32(vaddr, value)
        }
    }
    fn memory_write_64(&self, vaddr: u64, value: u64) -> CallbackResult<()> {
        if Self::is_device(vaddr) {
            self.device_write(vaddr, value)
        } else {
            self.ram.memory_write_64(vaddr, value)
        }
    }

    fn memory_write_exclusive_8(
        &self,
        vaddr: u64,
        value: u8,
        expected: u8,
    ) -> CallbackResult<bool> {
        self.ram.memory_write_exclusive_8(vaddr, value, expected)
    }
    fn memory_write_exclusive_16(
        &self,
        vaddr: u64,
        value: u16,
        expected: u16,
    ) -> CallbackResult<bool> {
        self.ram.memory_write_exclusive_16(vaddr, value, expected)
    }
    fn memory_write_exclusive_32(
        &self,
        vaddr: u64,
        value: u32,
        expected: u32,
    ) -> CallbackResult<bool> {
        self.ram.memory_write_exclusive_32(vaddr, value, expected)
    }
    fn memory_write_exclusive_64(
        &self,
        vaddr: u64,
        value: u64,
        expected: u64,
    ) -> CallbackResult<bool> {
        self.ram.memory_write_exclusive_64(vaddr, value, expected)
    }
    fn memory_write_exclusive_128(
        &self,
        vaddr: u64,
        value: u128,
        expected: u128,
    ) -> CallbackResult<bool> {
        self.ram.memory_write_exclusive_128(vaddr, value, expected)
    }
}

fn copy_block() -> Block {
    Block::with_ops(
        LOCATION,
        vec![
            MemOp::read(AccessDescriptor::unordered(Width::B32), Gpr::Rsi, Gpr::Rdi),
            MemOp::write(AccessDescriptor::unordered(Width::B32), Gpr::Rdx, Gpr::Rdi),
        ],
    )
}

#[test]
fn test_no_fault_never_touches_ledger() {
    let guest = Guest::new(1);
    guest.write(0x100, Width::B32, 0x1234);
    let mut session = guest.session(guest.config(Route::Fastmem));
    let mut machine = guest.machine();

    let compiled = session.compile(&copy_block()).unwrap();
    assert_eq!(compiled.fastmem_sites, 2);
    machine.set_gpr(Gpr::Rsi, 0x100);
    machine.set_gpr(Gpr::Rdx, 0x200);
    assert_eq!(machine.execute(&mut session, compiled.entry).unwrap(), ExitReason::Returned);

    assert_eq!(guest.read(0x200, Width::B32), 0x1234);
    assert_eq!(session.stats().faults_recovered, 0);
    assert!(session.opt_out().is_empty());
    for (_, entry) in session.ledger().entries() {
        assert_eq!(session.marker_state(entry.marker), MarkerState::FastmemActive);
    }
}

#[test]
fn test_device_access_recovers_and_recompiles_once() {
    let guest = Guest::new(1);
    let mmio = Arc::new(Mmio::new(&guest));
    let mut config = guest.config(Route::Fastmem);
    config.callbacks = mmio.clone();
    let mut session = guest.session(config);
    let sink = Arc::new(RecordingSink::default());
    session.set_invalidation_sink(sink.clone());
    let mut machine = guest.machine();

    let first = session.get_or_compile(&copy_block()).unwrap();
    machine.set_gpr(Gpr::Rsi, MMIO_BASE + 0x10);
    machine.set_gpr(Gpr::Rdx, 0x300);
    assert_eq!(machine.execute(&mut session, first).unwrap(), ExitReason::Returned);
    assert_eq!(machine.gpr(Gpr::Rdi), MMIO_VALUE);
    assert_eq!(guest.read(0x300, Width::B32), MMIO_VALUE as u128);

    // Only the load faulted; it is opted out and the block dropped.
    assert_eq!(session.stats().faults_recovered, 1);
    assert_eq!(session.stats().recompile_requests, 1);
    assert_eq!(session.opt_out().len(), 1);
    assert_eq!(*sink.0.lock(), vec![LOCATION]);
    assert!(session.lookup(LOCATION).is_none());

    // Stale code still runs and recovers, without a second invalidation.
    assert_eq!(machine.execute(&mut session, first).unwrap(), ExitReason::Returned);
    assert_eq!(session.stats().faults_recovered, 2);
    assert_eq!(sink.0.lock().len(), 1);

    // The new copy calls out for the load and keeps fastmem for the store.
    let second = session.compile(&copy_block()).unwrap();
    assert_ne!(second.entry, first);
    assert_eq!(second.fastmem_sites, 1);
    machine.set_gpr(Gpr::Rdx, 0x304);
    assert_eq!(machine.execute(&mut session, second.entry).unwrap(), ExitReason::Returned);
    assert_eq!(guest.read(0x304, Width::B32), MMIO_VALUE as u128);
    assert_eq!(session.stats().faults_recovered, 2);

    let trace = session.trace().stats();
    assert_eq!(trace.fastmem_disabled, 1);
    assert_eq!(trace.faults_recovered, 2);
}

#[test]
fn test_device_store_reaches_callback() {
    let guest = Guest::new(1);
    let mmio = Arc::new(Mmio::new(&guest));
    let mut config = guest.config(Route::Fastmem);
    config.callbacks = mmio.clone();
    let mut session = guest.session(config);
    let mut machine = guest.machine();

    guest.write(0x20, Width::B32, 0x55);
    let entry = session.get_or_compile(&copy_block()).unwrap();
    machine.set_gpr(Gpr::Rsi, 0x20);
    machine.set_gpr(Gpr::Rdx, MMIO_BASE + 0x8);
    assert_eq!(machine.execute(&mut session, entry).unwrap(), ExitReason::Returned);
    assert_eq!(*mmio.writes.lock(), vec![(MMIO_BASE + 0x8, 0x55)]);
}

#[test]
fn test_without_recompile_policy_block_survives() {
    let guest = Guest::new(1);
    let mmio = Arc::new(Mmio::new(&guest));
    let mut config = guest.config(Route::Fastmem);
    config.callbacks = mmio;
    config.recompile_on_fastmem_failure = false;
    let mut session = guest.session(config);
    let mut machine = guest.machine();

    let entry = session.get_or_compile(&copy_block()).unwrap();
    machine.set_gpr(Gpr::Rsi, MMIO_BASE);
    machine.set_gpr(Gpr::Rdx, 0x40);
    for _ in 0..3 {
        assert_eq!(machine.execute(&mut session, entry).unwrap(), ExitReason::Returned);
    }
    assert_eq!(session.stats().faults_recovered, 3);
    assert_eq!(session.stats().invalidations, 0);
    assert!(session.opt_out().is_empty());
    assert_eq!(session.lookup(LOCATION), Some(entry));
}

#[test]
fn test_guest_abort_after_fault() {
    let guest = Guest::new(1);
    let mut session = guest.session(guest.config(Route::Fastmem));
    let mut machine = guest.machine();

    let entry = session.get_or_compile(&copy_block()).unwrap();
    machine.set_gpr(Gpr::Rsi, GUEST_RAM);
    machine.set_gpr(Gpr::Rdx, 0x40);
    let exit = machine.execute(&mut session, entry).unwrap();
    assert_eq!(exit, ExitReason::MemoryAbort { guest_pc: LOCATION.0 });
    assert_eq!(machine.state().pc(), LOCATION.0);
    assert_eq!(machine.state().halt_reason(), 0);
    assert_eq!(session.trace().stats().memory_aborts, 1);
}

#[test]
fn test_fault_outside_ledger_is_unrecoverable() {
    let guest = Guest::new(1);
    // Page 0 points at host memory that does not exist.
    guest
        .memory
        .write(PAGE_TABLE_BASE, Width::B64, 0x9_0000_0000)
        .unwrap();
    let mut session = guest.session(guest.config(Route::PageTable));
    let mut machine = guest.machine();

    let entry = session.get_or_compile(&copy_block()).unwrap();
    machine.set_gpr(Gpr::Rsi, 0x10);
    match machine.execute(&mut session, entry) {
        Err(JitError::UnrecoverableFault { rip, addr, listing }) => {
            assert!(session.arena().blocks.contains(rip));
            assert_eq!(addr, 0x9_0000_0010);
            assert!(listing.contains("=> "));
        }
        other => panic!("expected unrecoverable fault, got {:?}", other),
    }
    assert_eq!(session.trace().stats().unrecoverable, 1);
}
