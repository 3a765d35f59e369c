//! Global exclusive monitor.
//!
//! One monitor is shared by every processor of a guest system. Each
//! processor owns one reservation slot holding the reservation granule it
//! last marked and the value it read there. A compare-and-clear on a granule
//! drops every processor's reservation on that granule, so at most one
//! store-exclusive can succeed per marked value.
//!
//! The monitor lock is a spin lock held across a short critical section:
//! either one of the methods below, or a sequence of generated code between
//! `MonitorLock` and `MonitorUnlock`. The slot table itself sits behind a
//! `parking_lot::Mutex` so that slot accessors stay memory safe even when
//! called without the monitor lock.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Reservations cover aligned 16-byte granules.
pub const RESERVATION_GRANULE_MASK: u64 = !0xF;

// Never a granule address: the low nibble is non-zero.
const INVALID_ADDRESS: u64 = 0xDEAD_DEAD_DEAD_DEAD;

#[derive(Debug, Clone, Copy)]
struct Slot {
    address: u64,
    value: u128,
}

impl Slot {
    const EMPTY: Slot = Slot {
        address: INVALID_ADDRESS,
        value: 0,
    };
}

#[inline]
fn granule(vaddr: u64) -> u64 {
    vaddr & RESERVATION_GRANULE_MASK
}

/// Exclusive monitor shared by all processors.
#[derive(Debug)]
pub struct ExclusiveMonitor {
    lock: AtomicBool,
    slots: Mutex<Vec<Slot>>,
}

impl ExclusiveMonitor {
    pub fn new(processor_count: usize) -> Self {
        Self {
            lock: AtomicBool::new(false),
            slots: Mutex::new(vec![Slot::EMPTY; processor_count]),
        }
    }

    pub fn processor_count(&self) -> usize {
        self.slots.lock().len()
    }

    /// Acquire the monitor lock, spinning until it is free.
    pub fn lock(&self) {
        while self
            .lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.lock.load(Ordering::Relaxed) {
                std::hint::spin_loop();
            }
        }
    }

    pub fn unlock(&self) {
        self.lock.store(false, Ordering::Release);
    }

    pub fn is_locked(&self) -> bool {
        self.lock.load(Ordering::Relaxed)
    }

    /// Mark `vaddr` for `processor` and record the value produced by `op`.
    ///
    /// The previous reservation of `processor` is overwritten. If `op` fails
    /// the processor is left without a reservation.
    pub fn read_and_mark<E>(
        &self,
        processor: usize,
        vaddr: u64,
        op: impl FnOnce() -> Result<u128, E>,
    ) -> Result<u128, E> {
        self.lock();
        let result = op();
        self.slots.lock()[processor] = match result {
            Ok(value) => Slot {
                address: granule(vaddr),
                value,
            },
            Err(_) => Slot::EMPTY,
        };
        self.unlock();
        result
    }

    /// Run `op` with the value `processor` marked at `vaddr` if its
    /// reservation still covers `vaddr`.
    ///
    /// Returns `Ok(false)` without calling `op` when the reservation does not
    /// match. Otherwise every reservation on the granule is cleared before
    /// `op` runs and its outcome is returned.
    pub fn do_exclusive_operation<E>(
        &self,
        processor: usize,
        vaddr: u64,
        op: impl FnOnce(u128) -> Result<bool, E>,
    ) -> Result<bool, E> {
        self.lock();
        let expected = {
            let mut slots = self.slots.lock();
            let target = granule(vaddr);
            if slots[processor].address != target {
                None
            } else {
                let expected = slots[processor].value;
                clear_granule(&mut slots, target);
                Some(expected)
            }
        };
        let result = match expected {
            Some(expected) => op(expected),
            None => Ok(false),
        };
        self.unlock();
        result
    }

    /// Drop the reservation of one processor.
    pub fn clear_processor(&self, processor: usize) {
        self.lock();
        self.slots.lock()[processor] = Slot::EMPTY;
        self.unlock();
    }

    /// Drop every reservation.
    pub fn clear(&self) {
        self.lock();
        self.slots.lock().fill(Slot::EMPTY);
        self.unlock();
    }

    /// Current reservation of `processor` as `(granule, value)`.
    pub fn reservation(&self, processor: usize) -> Option<(u64, u128)> {
        self.slots
            .lock()
            .get(processor)
            .filter(|slot| slot.address != INVALID_ADDRESS)
            .map(|slot| (slot.address, slot.value))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Slot accessors used by generated code between MonitorLock/MonitorUnlock
    // ═══════════════════════════════════════════════════════════════════════

    pub(crate) fn address_matches(&self, processor: usize, vaddr: u64) -> bool {
        self.slots.lock()[processor].address == granule(vaddr)
    }

    pub(crate) fn marked_value(&self, processor: usize) -> u128 {
        self.slots.lock()[processor].value
    }

    pub(crate) fn mark(&self, processor: usize, vaddr: u64, value: u128) {
        self.slots.lock()[processor] = Slot {
            address: granule(vaddr),
            value,
        };
    }

    pub(crate) fn clear_reservations_on(&self, vaddr: u64) {
        clear_granule(&mut self.slots.lock(), granule(vaddr));
    }
}

fn clear_granule(slots: &mut [Slot], target: u64) {
    for slot in slots.iter_mut().filter(|slot| slot.address == target) {
        *slot = Slot::EMPTY;
    }
}
