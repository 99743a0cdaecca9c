//! Oxidized-Gekko - block-translation cache demo runner
//!
//! Loads a small guest program into MEM1, runs it through the dispatcher for a
//! number of timing quanta and reports the cache statistics.

use anyhow::{Context, Result};
use og_core::config::Config;
use og_debug::JitDebugger;
use og_jit::{Dispatcher, RunOutcome};
use og_memory::MemoryBus;
use og_ppu::{PpuState, TimingService};

/// Physical load address of the demo program
const ENTRY: u32 = 0x0000_3100;
const DEFAULT_QUANTA: u64 = 64;

/// Fills a table at 0x4000 with multiples of three, patches its own loop
/// counter once and spins on a branch-to-self
const DEMO_PROGRAM: [u32; 14] = [
    0x3860_0000, // li r3, 0
    0x3880_0040, // li r4, 64
    0x38A0_4000, // li r5, 0x4000
    0x7C89_03A6, // mtctr r4
    0x3863_0003, // addi r3, r3, 3
    0x9465_0004, // stwu r3, 4(r5)
    0x4200_FFF8, // bdnz -8
    0x38C0_3104, // li r6, 0x3104
    0x3CE0_3880, // lis r7, 0x3880
    0x60E7_0010, // ori r7, r7, 0x10
    0x90E6_0000, // stw r7, 0(r6)
    0x80C5_0000, // lwz r6, 0(r5)
    0x3900_0001, // li r8, 1
    0x4800_0000, // b .
];

fn main() -> Result<()> {
    // Load config to get initial log level
    let config = Config::load().unwrap_or_default();

    // Initialize logging with reloadable filter
    og_core::logging::init_with_reload(config.debug.log_level);
    config.validate().context("Invalid configuration")?;

    let quanta = match std::env::args().nth(1) {
        Some(arg) => arg
            .parse::<u64>()
            .with_context(|| format!("Quantum count '{}' is not a number", arg))?,
        None => DEFAULT_QUANTA,
    };

    tracing::info!("Starting Oxidized-Gekko with the {:?} backend", config.jit.backend);

    let mut memory = MemoryBus::new().context("Failed to map guest memory")?;
    memory
        .load_program(ENTRY, &DEMO_PROGRAM)
        .context("Failed to load the demo program")?;

    let mut dispatcher = Dispatcher::new(&config.jit, memory, PpuState::new(ENTRY));
    dispatcher.jit_mut().set_dump_blocks(config.debug.dump_blocks);

    let outcome = dispatcher.run_quanta(quanta).map_err(|e| {
        tracing::error!("Execution stopped on an unrecoverable cache error: {}", e);
        e
    });
    let outcome = outcome.context("Block cache failure")?;
    match outcome {
        RunOutcome::Breakpoint(pc) => tracing::info!("Stopped at breakpoint 0x{:08x}", pc),
        RunOutcome::Watchpoint { pc, addr } => {
            tracing::info!("Stopped at 0x{:08x} by a watchpoint on 0x{:08x}", pc, addr)
        }
        RunOutcome::Stopped => tracing::info!("Stopped on request"),
        RunOutcome::QuantaElapsed => tracing::info!("Ran {} quanta", quanta),
    }

    let state = dispatcher.state();
    println!("pc      = 0x{:08x}", state.pc);
    println!("r3      = {}", state.gpr[3]);
    println!("r6      = {}", state.gpr[6]);
    println!("ticks   = {}", dispatcher.timing().ticks());
    println!("{:#?}", dispatcher.jit().stats());

    let debugger = JitDebugger::new(&mut dispatcher);
    println!("hottest blocks:");
    for block in debugger.hot_blocks(4) {
        println!(
            "  {:08x}: {} instructions, {} host bytes, {} runs ({} dispatched), {}/{} exits linked",
            block.address,
            block.instructions,
            block.host_size,
            block.runs,
            block.dispatches,
            block.linked_exits,
            block.total_exits
        );
        if config.debug.dump_blocks {
            if let Some(listing) = debugger.disassemble_block(block.address) {
                print!("{}", listing);
            }
        }
    }
    Ok(())
}
