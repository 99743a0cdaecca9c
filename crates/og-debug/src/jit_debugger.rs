//! Inspection and control of the block cache

use og_core::error::JitError;
use og_jit::{BlockKey, Dispatcher, JitStats, RunOutcome};

use crate::breakpoint::BreakpointManager;
use crate::disassembler::PpcDisassembler;

/// Summary of one translated block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSummary {
    pub address: u32,
    pub mode: u32,
    pub instructions: u32,
    pub cycles: u32,
    /// Host bytes
    pub host_size: u32,
    pub dispatches: u64,
    /// Dispatches plus entries through a chained exit
    pub runs: u64,
    /// Exits currently linked to another block
    pub linked_exits: usize,
    pub total_exits: usize,
}

/// Guest and host listing of a block
#[derive(Debug, Clone)]
pub struct BlockListing {
    pub key: BlockKey,
    pub guest: Vec<String>,
    pub host: Vec<String>,
}

impl std::fmt::Display for BlockListing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Block {:08x} (mode {})", self.key.address, self.key.mode)?;
        writeln!(f, "  guest:")?;
        for line in &self.guest {
            writeln!(f, "    {}", line)?;
        }
        writeln!(f, "  host:")?;
        for line in &self.host {
            writeln!(f, "    {}", line)?;
        }
        Ok(())
    }
}

/// Debugger front end for a stopped dispatcher
pub struct JitDebugger<'a> {
    dispatcher: &'a mut Dispatcher,
}

impl<'a> JitDebugger<'a> {
    pub fn new(dispatcher: &'a mut Dispatcher) -> Self {
        Self { dispatcher }
    }

    /// Breakpoint manager bound to the dispatcher's breakpoint and watchpoint sets
    pub fn breakpoint_manager(&self) -> BreakpointManager {
        BreakpointManager::new(
            self.dispatcher.breakpoints().clone(),
            self.dispatcher.watchpoints().clone(),
            self.dispatcher.control(),
        )
    }

    /// Erase the blocks starting at `address`; returns how many were dropped
    pub fn erase_block(&mut self, address: u32) -> Result<usize, JitError> {
        let erased = self.dispatcher.jit_mut().erase_blocks_at(address)?;
        tracing::info!("Debugger erased {} block(s) at 0x{:08x}", erased, address);
        Ok(erased)
    }

    /// Drop every translated block
    pub fn clear(&mut self) {
        self.dispatcher.clear_cache();
    }

    pub fn stats(&self) -> JitStats {
        *self.dispatcher.jit().stats()
    }

    /// Guest disassembly and host listing of the block at `address` under the current mode
    pub fn disassemble_block(&self, address: u32) -> Option<BlockListing> {
        let jit = self.dispatcher.jit();
        let key = BlockKey::new(address, self.dispatcher.state().feature_flags());
        let id = jit.blocks().lookup(key)?;
        let block = jit.blocks().get(id)?;

        let guest = match self.dispatcher.memory().read_bytes(block.physical_start, block.guest_len) {
            Ok(bytes) => PpcDisassembler::disassemble_range(&bytes, address)
                .iter()
                .map(ToString::to_string)
                .collect(),
            Err(e) => vec![format!("<guest code unreadable: {}>", e)],
        };
        let host = jit.disassemble_block(id).unwrap_or_default();
        Some(BlockListing { key, guest, host })
    }

    /// Live blocks, most run first
    pub fn hot_blocks(&self, limit: usize) -> Vec<BlockSummary> {
        let mut blocks: Vec<BlockSummary> = self
            .dispatcher
            .jit()
            .blocks()
            .iter()
            .map(|(_, block)| BlockSummary {
                address: block.key.address,
                mode: block.key.mode,
                instructions: block.instructions,
                cycles: block.cycles,
                host_size: block.host_range.len(),
                dispatches: block.dispatches,
                runs: block.runs,
                linked_exits: block.exits.iter().filter(|exit| exit.is_linked()).count(),
                total_exits: block.exits.len(),
            })
            .collect();
        blocks.sort_by(|a, b| b.runs.cmp(&a.runs).then(a.address.cmp(&b.address)));
        blocks.truncate(limit);
        blocks
    }

    /// Execute one guest instruction outside the cache
    pub fn step(&mut self) -> Result<u32, JitError> {
        self.dispatcher.single_step()?;
        Ok(self.dispatcher.state().pc)
    }

    /// Resume for up to `quanta` timing slices
    pub fn resume(&mut self, quanta: u64) -> Result<RunOutcome, JitError> {
        self.dispatcher.run_quanta(quanta)
    }
}
