//! memjit demo driver
//!
//! Compiles a small block of guest memory operations with the chosen
//! strategy, runs it on the host machine and prints the generated code and
//! the session statistics.
//!
//! Usage:
//!   cargo run --bin memjit -- --strategy fastmem --width 64 --ordered
//!   cargo run --bin memjit -- --strategy fastmem --fault --listing

use std::error::Error;
use std::sync::Arc;

use clap::{Parser, ValueEnum};

use memjit::disasm;
use memjit::{
    AccessDescriptor, ArenaCallbacks, Block, CodegenSession, ExclusiveMonitor, FaultRedirect, Gpr,
    HostMachine, HostMemory, HostReg, JitConfig, LocationDescriptor, MemOp, PageTableConfig, Width,
    Xmm, A64,
};

/// Host address of guest address 0 in the fastmem arena.
const ARENA_BASE: u64 = 0x1_0000_0000;
/// Backed guest memory.
const ARENA_SIZE: u64 = 64 * 1024;
/// Host address of the page table.
const PAGE_TABLE_BASE: u64 = 0x2_0000_0000;
/// Guest address bits the page table covers.
const PAGE_TABLE_BITS: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Strategy {
    Fastmem,
    PageTable,
    Callback,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Compile and run a block of guest memory operations")]
struct Args {
    /// Access strategy to configure
    #[arg(short, long, value_enum, default_value_t = Strategy::Fastmem)]
    strategy: Strategy,

    /// Access width in bits (8, 16, 32, 64 or 128)
    #[arg(short, long, default_value_t = 32)]
    width: u32,

    /// Use ordered (acquire/release) accesses
    #[arg(long)]
    ordered: bool,

    /// Add a load-exclusive/store-exclusive pair
    #[arg(long)]
    exclusive: bool,

    /// Inline exclusive accesses with host atomics
    #[arg(long)]
    inline_exclusive: bool,

    /// Run a second time with an address outside guest memory
    #[arg(long)]
    fault: bool,

    /// Print the generated host code
    #[arg(short, long)]
    listing: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn build_block(width: Width, ordered: bool, exclusive: bool) -> Block {
    let access = if ordered {
        AccessDescriptor::ordered(width)
    } else {
        AccessDescriptor::unordered(width)
    };
    let value: HostReg = if width == Width::B128 {
        Xmm(0).into()
    } else {
        Gpr::Rdi.into()
    };

    let mut block = Block::new(LocationDescriptor(0x40_0000));
    block
        .push(MemOp::read(access, Gpr::Rsi, value))
        .push(MemOp::write(access, Gpr::Rdx, value));
    if exclusive {
        block
            .push(MemOp::exclusive_read(access, Gpr::Rdx, value))
            .push(MemOp::exclusive_write(access, Gpr::Rdx, value, Gpr::R8));
    }
    block
}

fn map_page_table(memory: &HostMemory) -> Result<PageTableConfig, Box<dyn Error>> {
    let pt = PageTableConfig::new(PAGE_TABLE_BASE, PAGE_TABLE_BITS);
    memory.map(PAGE_TABLE_BASE, (pt.entry_count() * 8) as usize);
    let page_size = 1u64 << pt.page_bits;
    for page in 0..ARENA_SIZE / page_size {
        memory.write(
            PAGE_TABLE_BASE + page * 8,
            Width::B64,
            (ARENA_BASE + page * page_size) as u128,
        )?;
    }
    Ok(pt)
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let width = Width::from_bits(args.width)
        .ok_or_else(|| format!("unsupported width {}", args.width))?;

    let memory = Arc::new(HostMemory::new());
    memory.map(ARENA_BASE, ARENA_SIZE as usize);
    memory.write(ARENA_BASE + 0x100, Width::B128, 0x0123_4567_89AB_CDEF_FEDC_BA98_7654_3210)?;

    let mut config = JitConfig::new(Arc::new(ArenaCallbacks::new(
        Arc::clone(&memory),
        ARENA_BASE,
        ARENA_SIZE,
    )));
    config.global_monitor = Some(Arc::new(ExclusiveMonitor::new(1)));
    config.fastmem_exclusive_access = args.inline_exclusive;
    config.debug_listing = args.verbose;
    config.trace_enabled = true;
    match args.strategy {
        Strategy::Fastmem => config.fastmem_pointer = Some(ARENA_BASE),
        Strategy::PageTable => config.page_table = Some(map_page_table(&memory)?),
        Strategy::Callback => {}
    }

    let mut session = CodegenSession::<A64>::new(config, Arc::new(FaultRedirect))?;
    let mut machine = HostMachine::for_guest::<A64>(Arc::clone(&memory))?;
    let block = build_block(width, args.ordered, args.exclusive);

    let entry = session.get_or_compile(&block)?;
    machine.set_gpr(Gpr::Rsi, 0x100);
    machine.set_gpr(Gpr::Rdx, 0x200);
    let exit = machine.execute(&mut session, entry)?;
    println!("run 1: {:?}, {} host instructions", exit, machine.retired());
    println!(
        "guest[0x200] = {:#x}",
        memory.read(ARENA_BASE + 0x200, width)?
    );
    if args.exclusive {
        println!("store-exclusive status = {}", machine.gpr(Gpr::R8));
    }

    if args.fault {
        machine.set_gpr(Gpr::Rsi, ARENA_SIZE + 0x1000);
        let entry = session.get_or_compile(&block)?;
        let exit = machine.execute(&mut session, entry)?;
        println!("run 2: {:?}, {} host instructions", exit, machine.retired());
        let entry = session.get_or_compile(&block)?;
        println!("run 3 recompiled at {}", entry);
    }

    if args.listing {
        println!("\n── block region ──\n{}", disasm::listing(&session.arena().blocks));
        println!("── thunk region ──\n{}", disasm::listing(&session.arena().thunks));
    }
    println!("{}", session.trace().stats().format());
    println!("{}", serde_json::to_string_pretty(session.stats())?);
    Ok(())
}
