//! Load/store-exclusive through both code families.

mod common;

use std::thread;

use common::{Guest, Route, GUEST_RAM};
use memjit::{
    AccessDescriptor, Block, CodegenSession, ExitReason, Gpr, HostMachine, JitConfig,
    LocationDescriptor, MemOp, Width, Xmm, A64,
};
use rstest::rstest;

const LOAD_AT: LocationDescriptor = LocationDescriptor(0x40_0000);
const STORE_AT: LocationDescriptor = LocationDescriptor(0x40_1000);

#[derive(Debug, Clone, Copy)]
enum Family {
    Call,
    Inline,
}

fn config(guest: &Guest, route: Route, family: Family) -> JitConfig {
    let mut config = guest.config(route);
    config.fastmem_exclusive_access = matches!(family, Family::Inline);
    config
}

fn load_exclusive(width: Width) -> Block {
    Block::with_ops(
        LOAD_AT,
        vec![MemOp::exclusive_read(AccessDescriptor::unordered(width), Gpr::Rsi, Gpr::Rdi)],
    )
}

fn store_exclusive(width: Width) -> Block {
    Block::with_ops(
        STORE_AT,
        vec![MemOp::exclusive_write(
            AccessDescriptor::ordered(width),
            Gpr::Rsi,
            Gpr::Rdx,
            Gpr::R8,
        )],
    )
}

fn run(session: &mut CodegenSession<A64>, machine: &mut HostMachine, block: &Block) -> ExitReason {
    let entry = session.get_or_compile(block).unwrap();
    machine.execute(session, entry).unwrap()
}

#[rstest]
#[case(Route::Fastmem, Family::Call)]
#[case(Route::Fastmem, Family::Inline)]
#[case(Route::PageTable, Family::Call)]
#[case(Route::Callback, Family::Call)]
fn test_load_store_exclusive_sequence(#[case] route: Route, #[case] family: Family) {
    let guest = Guest::new(1);
    guest.write(0x1008, Width::B32, 0x77);
    let mut session = guest.session(config(&guest, route, family));
    let mut machine = guest.machine();

    machine.set_gpr(Gpr::Rsi, 0x1008);
    assert_eq!(run(&mut session, &mut machine, &load_exclusive(Width::B32)), ExitReason::Returned);
    assert_eq!(machine.gpr(Gpr::Rdi), 0x77);
    assert!(machine.state().exclusive_state());
    assert_eq!(guest.monitor.reservation(0), Some((0x1000, 0x77)));

    machine.set_gpr(Gpr::Rdx, 0x78);
    assert_eq!(run(&mut session, &mut machine, &store_exclusive(Width::B32)), ExitReason::Returned);
    assert_eq!(machine.gpr(Gpr::R8), 0);
    assert_eq!(guest.read(0x1008, Width::B32), 0x78);
    assert!(!machine.state().exclusive_state());
    assert_eq!(guest.monitor.reservation(0), None);

    // Nothing is reserved any more.
    machine.set_gpr(Gpr::Rdx, 0x79);
    assert_eq!(run(&mut session, &mut machine, &store_exclusive(Width::B32)), ExitReason::Returned);
    assert_eq!(machine.gpr(Gpr::R8), 1);
    assert_eq!(guest.read(0x1008, Width::B32), 0x78);
    assert!(!guest.monitor.is_locked());
}

#[rstest]
#[case(Family::Call)]
#[case(Family::Inline)]
fn test_intervening_store_fails_exclusive(#[case] family: Family) {
    let guest = Guest::new(2);
    guest.write(0x2000, Width::B64, 5);
    let mut session = guest.session(config(&guest, Route::Fastmem, family));
    let mut machine = guest.machine();

    machine.set_gpr(Gpr::Rsi, 0x2000);
    run(&mut session, &mut machine, &load_exclusive(Width::B64));
    // Another agent changes the value behind the reservation.
    guest.write(0x2000, Width::B64, 6);

    machine.set_gpr(Gpr::Rdx, 9);
    run(&mut session, &mut machine, &store_exclusive(Width::B64));
    assert_eq!(machine.gpr(Gpr::R8), 1);
    assert_eq!(guest.read(0x2000, Width::B64), 6);
}

#[rstest]
#[case(Family::Call)]
#[case(Family::Inline)]
fn test_store_to_other_granule_fails_and_clears_flag(#[case] family: Family) {
    let guest = Guest::new(1);
    guest.write(0x1008, Width::B32, 0x77);
    guest.write(0x3000, Width::B32, 0x77);
    let mut session = guest.session(config(&guest, Route::Fastmem, family));
    let mut machine = guest.machine();

    machine.set_gpr(Gpr::Rsi, 0x1008);
    run(&mut session, &mut machine, &load_exclusive(Width::B32));
    assert!(machine.state().exclusive_state());

    machine.set_gpr(Gpr::Rsi, 0x3000);
    machine.set_gpr(Gpr::Rdx, 0x99);
    let exit = run(&mut session, &mut machine, &store_exclusive(Width::B32));
    assert_eq!(exit, ExitReason::Returned);
    assert_eq!(machine.gpr(Gpr::R8), 1);
    assert_eq!(guest.read(0x3000, Width::B32), 0x77);
    assert!(!machine.state().exclusive_state());
    assert!(!guest.monitor.is_locked());

    // The flag is gone, so even the marked address fails now.
    machine.set_gpr(Gpr::Rsi, 0x1008);
    run(&mut session, &mut machine, &store_exclusive(Width::B32));
    assert_eq!(machine.gpr(Gpr::R8), 1);
    assert_eq!(guest.read(0x1008, Width::B32), 0x77);
}

#[rstest]
#[case(Family::Call)]
#[case(Family::Inline)]
fn test_concurrent_increment(#[case] family: Family) {
    const PROCESSORS: usize = 4;
    const INCREMENTS: u64 = 200;
    const COUNTER: u64 = 0x4000;

    let guest = Guest::new(PROCESSORS);
    thread::scope(|scope| {
        for processor in 0..PROCESSORS {
            let guest = &guest;
            scope.spawn(move || {
                let mut config = config(guest, Route::Fastmem, family);
                config.processor_id = processor;
                let mut session = guest.session(config);
                let mut machine = guest.machine();
                let load = load_exclusive(Width::B64);
                let store = store_exclusive(Width::B64);

                machine.set_gpr(Gpr::Rsi, COUNTER);
                for _ in 0..INCREMENTS {
                    loop {
                        run(&mut session, &mut machine, &load);
                        let next = machine.gpr(Gpr::Rdi) + 1;
                        machine.set_gpr(Gpr::Rdx, next);
                        run(&mut session, &mut machine, &store);
                        if machine.gpr(Gpr::R8) == 0 {
                            break;
                        }
                    }
                }
            });
        }
    });

    assert_eq!(guest.read(COUNTER, Width::B64), (PROCESSORS as u64 * INCREMENTS) as u128);
    assert!(!guest.monitor.is_locked());
}

#[rstest]
#[case(Family::Call)]
#[case(Family::Inline)]
fn test_128_bit_pair_keeps_live_quartet(#[case] family: Family) {
    const SENTINELS: [(Gpr, u64); 4] = [
        (Gpr::Rax, 0xAAAA),
        (Gpr::Rbx, 0xBBBB),
        (Gpr::Rcx, 0xCCCC),
        (Gpr::Rdx, 0xDDDD),
    ];
    let old = 0x1111_2222_3333_4444_5555_6666_7777_8888u128;
    let new = 0x9999_AAAA_BBBB_CCCC_DDDD_EEEE_FFFF_0000u128;

    let guest = Guest::new(1);
    guest.write(0x3000, Width::B128, old);
    let mut session = guest.session(config(&guest, Route::Fastmem, family));
    let mut machine = guest.machine();

    let access = AccessDescriptor::ordered(Width::B128);
    let mut block = Block::with_ops(
        LocationDescriptor(0x40_2000),
        vec![
            MemOp::exclusive_read(access, Gpr::Rsi, Xmm(0)),
            MemOp::exclusive_write(access, Gpr::Rsi, Xmm(1), Gpr::R8),
        ],
    );
    block.live_in = SENTINELS.iter().map(|&(gpr, _)| gpr.into()).collect();

    for (gpr, value) in SENTINELS {
        machine.set_gpr(gpr, value);
    }
    machine.set_gpr(Gpr::Rsi, 0x3000);
    machine.set_xmm(Xmm(1), new);
    assert_eq!(run(&mut session, &mut machine, &block), ExitReason::Returned);

    assert_eq!(machine.gpr(Gpr::R8), 0);
    assert_eq!(machine.xmm(Xmm(0)), old);
    assert_eq!(guest.read(0x3000, Width::B128), new);
    for (gpr, value) in SENTINELS {
        assert_eq!(machine.gpr(gpr), value, "{:?}", gpr);
    }
}

#[test]
fn test_inline_abort_releases_monitor() {
    let guest = Guest::new(1);
    let mut session = guest.session(config(&guest, Route::Fastmem, Family::Inline));
    let mut machine = guest.machine();

    machine.set_gpr(Gpr::Rsi, GUEST_RAM + 0x40);
    let exit = run(&mut session, &mut machine, &load_exclusive(Width::B32));
    assert_eq!(exit, ExitReason::MemoryAbort { guest_pc: LOAD_AT.0 });
    assert!(!guest.monitor.is_locked());
    // The faulting site was opted out; the recompiled load calls out.
    assert_eq!(session.opt_out().len(), 1);
    let recompiled = session.compile(&load_exclusive(Width::B32)).unwrap();
    assert_eq!(recompiled.fastmem_sites, 0);
}

#[test]
fn test_clear_exclusive_fails_next_store() {
    let guest = Guest::new(1);
    let mut session = guest.session(config(&guest, Route::Fastmem, Family::Call));
    let mut machine = guest.machine();

    machine.set_gpr(Gpr::Rsi, 0x500);
    run(&mut session, &mut machine, &load_exclusive(Width::B16));
    assert!(machine.state().exclusive_state());

    let clear = Block::with_ops(LocationDescriptor(0x40_3000), vec![MemOp::ClearExclusive]);
    run(&mut session, &mut machine, &clear);
    assert!(!machine.state().exclusive_state());

    machine.set_gpr(Gpr::Rdx, 0x1234);
    run(&mut session, &mut machine, &store_exclusive(Width::B16));
    assert_eq!(machine.gpr(Gpr::R8), 1);
    assert_eq!(guest.read(0x500, Width::B16), 0);
}
