//! End-to-end tests of the block cache, backpatching and dispatcher

use std::collections::BTreeSet;

use og_core::config::{CpuBackend, JitConfig};
use og_core::error::JitError;
use og_jit::host::UNLINKED;
use og_jit::{
    BlockKey, CodeRegion, DebugChecks, Dispatcher, HostRange, Jit, RunOutcome, SiteState, WatchKind, Watchpoint,
};
use og_memory::{AccessSize, AddressSpace, MemoryBus, PageFlags};
use og_ppu::{CoreTiming, PpcExceptions, PpuInterpreter, PpuState, TimingService};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

fn memory_with(programs: &[(u32, &[u32])]) -> MemoryBus {
    let mut memory = MemoryBus::empty();
    memory.map_ram(0, 0x10000, PageFlags::RWX).unwrap();
    for (base, words) in programs {
        memory.load_program(*base, words).unwrap();
    }
    memory
}

fn config(backend: CpuBackend) -> JitConfig {
    JitConfig {
        backend,
        code_size: 64 * 1024,
        far_code_size: 16 * 1024,
        ..JitConfig::default()
    }
}

// 5 x addi r3, r3, 1 then b 0x2000
const BLOCK_A: [u32; 6] = [0x3863_0001, 0x3863_0001, 0x3863_0001, 0x3863_0001, 0x3863_0001, 0x4800_0FEC];
// 5 x addi r3, r3, 1 then b 0x1000
const BLOCK_B: [u32; 6] = [0x3863_0001, 0x3863_0001, 0x3863_0001, 0x3863_0001, 0x3863_0001, 0x4BFF_EFEC];

fn ping_pong() -> Dispatcher {
    let memory = memory_with(&[(0x1000, &BLOCK_A), (0x2000, &BLOCK_B)]);
    Dispatcher::new(&config(CpuBackend::Recompiler), memory, PpuState::new(0x1000))
        .with_timing(Box::new(CoreTiming::new(10)))
}

#[test]
fn test_allocation_reuses_released_space() {
    let mut region = CodeRegion::new("near", 0, 4096);

    let first = region.allocate(1000).unwrap();
    let first = region.commit(first, 1000).unwrap();
    let second = region.allocate(1000).unwrap();
    let second = region.commit(second, 1000).unwrap();
    assert_eq!(first, HostRange::new(0, 1000));
    assert_eq!(second, HostRange::new(1000, 2000));

    region.release(first).unwrap();
    let third = region.allocate(1500).unwrap();
    assert_eq!(third.start(), 2000);
    let third = region.commit(third, 1500).unwrap();
    assert_eq!(third, HostRange::new(2000, 3500));
    assert_eq!(region.free_ranges().total_free(), 1000 + 596);
}

#[test]
fn test_allocation_needs_coalesced_neighbours() {
    let mut region = CodeRegion::new("near", 0, 4096);
    let mut taken = Vec::new();
    for _ in 0..3 {
        let reservation = region.allocate(1000).unwrap();
        taken.push(region.commit(reservation, 1000).unwrap());
    }
    assert!(matches!(
        region.allocate(1500),
        Err(JitError::OutOfCodeSpace { requested: 1500, largest_free: 1096 })
    ));

    region.release(taken[0]).unwrap();
    assert!(region.allocate(1500).is_err());

    region.release(taken[1]).unwrap();
    assert_eq!(region.largest_free(), 2000);
    let reservation = region.allocate(1500).unwrap();
    assert_eq!(reservation.start(), 0);
    region.abort(reservation).unwrap();
}

#[test]
fn test_random_allocations_never_overlap() {
    let mut rng = ChaCha8Rng::seed_from_u64(0x6B6B);
    let mut region = CodeRegion::new("near", 0x4000, 64 * 1024);
    let mut live: Vec<HostRange> = Vec::new();

    for _ in 0..2000 {
        if !live.is_empty() && rng.gen_bool(0.4) {
            let victim = live.swap_remove(rng.gen_range(0..live.len()));
            region.release(victim).unwrap();
        } else {
            let wanted = rng.gen_range(16..2048usize);
            let Ok(reservation) = region.allocate(wanted) else {
                assert!((region.largest_free() as usize) < wanted);
                continue;
            };
            assert!(reservation.capacity() >= wanted);
            let used = rng.gen_range(1..=wanted);
            let range = region.commit(reservation, used).unwrap();
            assert_eq!(range.len() as usize, used);
            assert!(live.iter().all(|other| !other.overlaps(&range)));
            live.push(range);
        }

        let used: u64 = live.iter().map(|r| r.len() as u64).sum();
        assert_eq!(used + region.free_ranges().total_free(), region.size() as u64);
    }
}

#[test]
fn test_faulting_access_is_patched_once() {
    let program = [
        0x38A0_0001, // li r5, 1
        0x8083_0000, // lwz r4, 0(r3)
        0x7CC4_2A14, // add r6, r4, r5
        0x4800_0000, // b .
    ];
    let mut memory = memory_with(&[(0x1000, &program)]);
    memory.write_bytes(0x3000, &0xDEAD_BEEFu32.to_be_bytes()).unwrap();
    memory.protect_fastmem(0x3000, 4);

    let mut jit = Jit::new(&config(CpuBackend::Recompiler));
    let mut exceptions = PpcExceptions::new();
    let breakpoints = BTreeSet::new();
    let mut state = PpuState::new(0x1000);
    state.gpr[3] = 0x3000;
    state.downcount = 100;

    let id = jit.translate(&state, &mut memory, &breakpoints).unwrap();
    let site = jit.blocks().get(id).unwrap().sites[0];
    assert_eq!(jit.sites().get(site).unwrap().state, SiteState::FastPath);

    for _ in 0..2 {
        state.pc = 0x1000;
        state.gpr[4] = 0;
        jit.execute(id, &mut state, &mut memory, &PpuInterpreter, &mut exceptions, &mut DebugChecks::new(&breakpoints))
            .unwrap();
        assert_eq!(state.gpr[4], 0xDEAD_BEEF);
        assert_eq!(state.gpr[6], 0xDEAD_BEF0);
        assert_eq!(state.pc, 0x100C);
    }

    assert_eq!(jit.traps().faults(), 1);
    assert_eq!(jit.sites().patched(), 1);
    let patched = jit.sites().get(site).unwrap();
    assert_eq!(patched.state, SiteState::SlowPath);
    assert!(patched.trampoline.is_some_and(|t| jit.code().far.contains(t.start)));
    assert_eq!(jit.stats().guest_faults, 0);

    // Same block against unprotected memory
    memory.unprotect_fastmem(0x3000, 4);
    let mut reference = Jit::new(&config(CpuBackend::Recompiler));
    let mut expected = PpuState::new(0x1000);
    expected.gpr[3] = 0x3000;
    expected.downcount = 100;
    let id = reference.translate(&expected, &mut memory, &breakpoints).unwrap();
    reference
        .execute(id, &mut expected, &mut memory, &PpuInterpreter, &mut exceptions, &mut DebugChecks::new(&breakpoints))
        .unwrap();
    assert_eq!(reference.traps().faults(), 0);
    assert!(expected.same_registers(&state));
    jit.check_invariants().unwrap();
}

#[test]
fn test_unbacked_access_becomes_dsi() {
    // lwz r4, 0(r3) with r3 outside RAM; b .
    let program = [0x8083_0000, 0x4800_0000];
    let mut memory = memory_with(&[(0x1000, &program)]);
    let mut jit = Jit::new(&config(CpuBackend::Recompiler));
    let mut exceptions = PpcExceptions::new();
    let breakpoints = BTreeSet::new();
    let mut state = PpuState::new(0x1000);
    state.gpr[3] = 0x0100_0000;
    state.downcount = 100;

    let id = jit.translate(&state, &mut memory, &breakpoints).unwrap();
    let exit = jit
        .execute(id, &mut state, &mut memory, &PpuInterpreter, &mut exceptions, &mut DebugChecks::new(&breakpoints))
        .unwrap();
    assert_eq!(exit, og_jit::BlockExit::Exception);
    assert_eq!(state.pc, 0x1000);
    assert_eq!(state.dar, 0x0100_0000);
    assert_eq!(jit.stats().guest_faults, 1);
}

#[test]
fn test_quantum_expires_after_overrun() {
    let mut d = ping_pong();
    assert_eq!(d.run_quanta(1).unwrap(), RunOutcome::QuantaElapsed);
    assert_eq!(d.state().downcount, -2);
    assert_eq!(d.state().pc, 0x1000);
    assert_eq!(d.state().gpr[3], 10);
    assert_eq!(d.timing().slices(), 1);
    assert_eq!(d.jit().stats().cache_misses, 2);

    d.run_quanta(1).unwrap();
    assert_eq!(d.timing().ticks(), 12);
    assert!(d.jit().stats().chained >= 1);
    assert_eq!(d.jit().stats().cache_hits, 1);
    assert_eq!(d.state().gpr[3], 20);
}

#[test]
fn test_erased_successor_is_unlinked_and_retranslated() {
    let mut d = ping_pong();
    d.run_quanta(1).unwrap();
    let mode = d.state().feature_flags();
    let a = d.jit().blocks().lookup(BlockKey::new(0x1000, mode)).unwrap();
    let slot = {
        let exit = &d.jit().blocks().get(a).unwrap().exits[0];
        assert_eq!(exit.target, 0x2000);
        assert!(exit.is_linked());
        exit.slot
    };

    assert_eq!(d.jit_mut().erase_blocks_at(0x2000).unwrap(), 1);
    let exit = &d.jit().blocks().get(a).unwrap().exits[0];
    assert!(!exit.is_linked());
    let entry = &d.jit().code().bytes_from(slot + 4).unwrap()[..4];
    assert_eq!(u32::from_le_bytes([entry[0], entry[1], entry[2], entry[3]]), UNLINKED);
    d.jit().check_invariants().unwrap();

    let misses = d.jit().stats().cache_misses;
    d.run_quanta(1).unwrap();
    assert_eq!(d.jit().stats().cache_misses, misses + 1);
    assert!(d.jit().blocks().get(a).unwrap().exits[0].is_linked());
    d.jit().check_invariants().unwrap();
}

#[test]
fn test_posted_erase_applies_at_boundary() {
    let mut d = ping_pong();
    d.run_quanta(1).unwrap();
    let control = d.control();
    let handle = std::thread::spawn(move || control.erase_block_at(0x2000));
    handle.join().unwrap();

    assert_eq!(d.jit().blocks().len(), 2);
    let misses = d.jit().stats().cache_misses;
    d.run_quanta(1).unwrap();
    assert_eq!(d.jit().stats().blocks_invalidated, 1);
    assert_eq!(d.jit().stats().cache_misses, misses + 1);
}

#[test]
fn test_self_modifying_store_takes_effect() {
    let patcher = [
        0x3880_2000, // li r4, 0x2000
        0x3CA0_3860, // lis r5, 0x3860
        0x60A5_0007, // ori r5, r5, 7
        0x90A4_0000, // stw r5, 0(r4)
        0x4800_0FF0, // b 0x2000
    ];
    let target = [
        0x3860_0001, // li r3, 1
        0x4BFF_EFFC, // b 0x1000
    ];
    let memory = memory_with(&[(0x1000, &patcher), (0x2000, &target)]);
    let mut d = Dispatcher::new(&config(CpuBackend::Recompiler), memory, PpuState::new(0x2000))
        .with_timing(Box::new(CoreTiming::new(100)));

    d.run_quanta(1).unwrap();
    assert_eq!(d.state().gpr[3], 7);
    assert!(d.jit().stats().blocks_invalidated >= 1);
    assert_eq!(
        d.memory_mut().read(AddressSpace::Physical, 0x2000, AccessSize::Word).unwrap(),
        0x3860_0007
    );
    d.jit().check_invariants().unwrap();
}

/// Program that fills a small table and parks on a branch-to-self
const TABLE_FILL: [u32; 9] = [
    0x3860_0000, // li r3, 0
    0x3880_000A, // li r4, 10
    0x38A0_3000, // li r5, 0x3000
    0x7C89_03A6, // mtctr r4
    0x3863_0003, // addi r3, r3, 3
    0x9465_0004, // stwu r3, 4(r5)
    0x4200_FFF8, // bdnz -8
    0x80C5_0000, // lwz r6, 0(r5)
    0x4800_0000, // b .
];

fn table_fill(cfg: &JitConfig, protect_table: bool) -> Dispatcher {
    let mut memory = memory_with(&[(0x1000, &TABLE_FILL)]);
    if protect_table {
        memory.protect_fastmem(0x3000, 48);
    }
    Dispatcher::new(cfg, memory, PpuState::new(0x1000)).with_timing(Box::new(CoreTiming::new(50)))
}

fn run_backend(cfg: &JitConfig, protect_table: bool) -> (PpuState, Vec<u8>) {
    let mut d = table_fill(cfg, protect_table);
    d.run_quanta(8).unwrap();
    d.jit().check_invariants().unwrap();
    (d.state().clone(), d.memory().read_bytes(0x3000, 48).unwrap())
}

fn reference_table_fill() -> (PpuState, Vec<u8>) {
    let mut memory = memory_with(&[(0x1000, &TABLE_FILL)]);
    let mut expected = PpuState::new(0x1000);
    let mut exceptions = PpcExceptions::new();
    for _ in 0..64 {
        PpuInterpreter.step(&mut expected, &mut memory, &mut exceptions);
    }
    assert_eq!(expected.pc, 0x1020);
    assert_eq!(expected.gpr[6], 30);
    (expected, memory.read_bytes(0x3000, 48).unwrap())
}

#[test]
fn test_backends_match_reference_interpreter() {
    let (expected, table) = reference_table_fill();
    let recompiler = config(CpuBackend::Recompiler);

    let rows = [
        ("linked", recompiler.clone(), false),
        ("unlinked", JitConfig { block_linking: false, ..recompiler.clone() }, false),
        ("no fastmem", JitConfig { fastmem: false, ..recompiler.clone() }, false),
        ("mmu", JitConfig { mmu: true, ..recompiler.clone() }, false),
        ("protected table", recompiler.clone(), true),
        ("cached interpreter", config(CpuBackend::CachedInterpreter), false),
    ];
    for (name, cfg, protect_table) in rows {
        let (state, bytes) = run_backend(&cfg, protect_table);
        assert!(state.same_registers(&expected), "{} diverged", name);
        assert_eq!(bytes, table, "{} wrote a different table", name);
    }
}

#[test]
fn test_clear_between_quanta_matches_reference() {
    let (expected, table) = reference_table_fill();
    for backend in [CpuBackend::Recompiler, CpuBackend::CachedInterpreter] {
        let mut d = table_fill(&config(backend), false);
        for _ in 0..8 {
            d.run_quanta(1).unwrap();
            d.clear_cache();
            assert!(d.jit().blocks().is_empty());
        }
        assert_eq!(d.jit().stats().full_clears, 8);
        assert!(d.state().same_registers(&expected), "{:?} diverged", backend);
        assert_eq!(d.memory().read_bytes(0x3000, 48).unwrap(), table);
    }
}

#[test]
fn test_exhausted_far_region_flushes_at_next_boundary() {
    // lwz r4, 0(r3); b .-4
    let program = [0x8083_0000, 0x4BFF_FFFC];
    let mut memory = memory_with(&[(0x1000, &program)]);
    memory.write_bytes(0x3000, &0x1234_5678u32.to_be_bytes()).unwrap();
    memory.protect_fastmem(0x3000, 4);
    // Too small for a single trampoline
    let cfg = JitConfig {
        far_code_size: 16,
        ..config(CpuBackend::Recompiler)
    };
    let mut state = PpuState::new(0x1000);
    state.gpr[3] = 0x3000;
    let mut d = Dispatcher::new(&cfg, memory, state).with_timing(Box::new(CoreTiming::new(10)));

    d.run_quanta(3).unwrap();
    let stats = *d.jit().stats();
    assert!(d.jit().sites().inline_emulations() >= 3);
    assert_eq!(stats.full_clears, d.jit().sites().inline_emulations());
    assert_eq!(stats.cache_hits, 0);
    assert_eq!(stats.chained, 0);
    assert_eq!(d.jit().sites().patched(), 0);
    assert_eq!(d.state().gpr[4], 0x1234_5678);
    d.jit().check_invariants().unwrap();
}

#[test]
fn test_watchpoints_stop_both_backends() {
    let program = [
        0x3880_3000, // li r4, 0x3000
        0x3860_0005, // li r3, 5
        0x9064_0000, // stw r3, 0(r4)
        0x80A4_0000, // lwz r5, 0(r4)
        0x4800_0000, // b .
    ];
    for backend in [CpuBackend::Recompiler, CpuBackend::CachedInterpreter] {
        let memory = memory_with(&[(0x1000, &program)]);
        let mut d = Dispatcher::new(&config(backend), memory, PpuState::new(0x1000))
            .with_timing(Box::new(CoreTiming::new(40)));
        d.watchpoints().insert(Watchpoint::new(0x3000, 4, WatchKind::Access));

        assert_eq!(
            d.run_quanta(1).unwrap(),
            RunOutcome::Watchpoint { pc: 0x1008, addr: 0x3000 },
            "{:?}",
            backend
        );
        assert_eq!(d.state().gpr[3], 5);
        assert_eq!(d.memory().read_bytes(0x3000, 4).unwrap(), vec![0; 4]);
        // Charged up to the halted instruction
        assert_eq!(d.state().downcount, 38);

        // Stepping over the store stops at the load behind it
        assert_eq!(
            d.run_quanta(1).unwrap(),
            RunOutcome::Watchpoint { pc: 0x100C, addr: 0x3000 }
        );
        assert_eq!(d.memory().read_bytes(0x3000, 4).unwrap(), vec![0, 0, 0, 5]);
        assert_eq!(d.state().gpr[5], 0);

        assert_eq!(d.run_quanta(1).unwrap(), RunOutcome::QuantaElapsed);
        assert_eq!(d.state().gpr[5], 5);
        assert_eq!(d.state().pc, 0x1010);
        assert_eq!(d.jit().stats().guest_faults, 0);
        d.jit().check_invariants().unwrap();
    }
}
