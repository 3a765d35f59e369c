//! Shared setup for the integration tests: 64 KiB of guest RAM mapped in
//! host memory, optionally reachable through fastmem or a page table.

#![allow(dead_code)]

use std::sync::Arc;

use memjit::{
    ArenaCallbacks, CodegenSession, ExclusiveMonitor, FaultRedirect, HostMachine, HostMemory,
    JitConfig, PageTableConfig, Width, A64,
};

pub const FASTMEM_BASE: u64 = 0x1_0000_0000;
pub const GUEST_RAM: u64 = 64 * 1024;
pub const PAGE_TABLE_BASE: u64 = 0x2_0000_0000;
pub const PAGE_SIZE: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Fastmem,
    PageTable,
    Callback,
}

pub struct Guest {
    pub memory: Arc<HostMemory>,
    pub monitor: Arc<ExclusiveMonitor>,
}

impl Guest {
    pub fn new(processors: usize) -> Self {
        let memory = Arc::new(HostMemory::new());
        memory.map(FASTMEM_BASE, GUEST_RAM as usize);

        let pt = page_table();
        memory.map(PAGE_TABLE_BASE, (pt.entry_count() * 8) as usize);
        for page in 0..GUEST_RAM / PAGE_SIZE {
            memory
                .write(
                    PAGE_TABLE_BASE + page * 8,
                    Width::B64,
                    (FASTMEM_BASE + page * PAGE_SIZE) as u128,
                )
                .unwrap();
        }

        Self {
            memory,
            monitor: Arc::new(ExclusiveMonitor::new(processors)),
        }
    }

    pub fn config(&self, route: Route) -> JitConfig {
        let mut config = JitConfig::new(Arc::new(ArenaCallbacks::new(
            Arc::clone(&self.memory),
            FASTMEM_BASE,
            GUEST_RAM,
        )));
        config.global_monitor = Some(Arc::clone(&self.monitor));
        config.trace_enabled = true;
        match route {
            Route::Fastmem => config.fastmem_pointer = Some(FASTMEM_BASE),
            Route::PageTable => config.page_table = Some(page_table()),
            Route::Callback => {}
        }
        config
    }

    pub fn session(&self, config: JitConfig) -> CodegenSession<A64> {
        CodegenSession::new(config, Arc::new(FaultRedirect)).unwrap()
    }

    pub fn machine(&self) -> HostMachine {
        HostMachine::for_guest::<A64>(Arc::clone(&self.memory)).unwrap()
    }

    pub fn read(&self, vaddr: u64, width: Width) -> u128 {
        self.memory.read(FASTMEM_BASE + vaddr, width).unwrap()
    }

    pub fn write(&self, vaddr: u64, width: Width, value: u128) {
        self.memory.write(FASTMEM_BASE + vaddr, width, value).unwrap();
    }
}

/// 20-bit guest space of 4 KiB pages; pages past guest RAM are unmapped.
pub fn page_table() -> PageTableConfig {
    PageTableConfig::new(PAGE_TABLE_BASE, 20)
}
