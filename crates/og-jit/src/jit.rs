//! Translation cache front end
//!
//! [`Jit`] ties the code regions, block cache, backpatch table and backend
//! together: it translates on a miss, recovers from a full code space by
//! flushing once, runs blocks and applies invalidations at block boundaries.

use std::collections::BTreeSet;

use og_core::config::{CpuBackend, JitConfig};
use og_core::error::JitError;
use og_memory::MemoryBus;
use og_ppu::{AnalyzedBlock, ExceptionController, InstructionAnalyzer, PpuAnalyzer, PpuState, Semantics};

use crate::backpatch::{BackpatchSite, BackpatchTable};
use crate::block::{BlockId, BlockKey, CodeBlock, ExitLink};
use crate::block_cache::BlockCache;
use crate::code_region::{CodeSpace, HostAddr, HostRange, TRAP_FILL};
use crate::host::Emitter;
use crate::invalidation::{InvalidationQueue, InvalidationRequest, JitControl};
use crate::translator::{
    create_backend, BlockExit, DebugChecks, ExecEnv, JitBackend, SiteSpec, TranslateOptions,
};
use crate::trap::TrapDispatcher;

/// Cache and execution counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct JitStats {
    pub translations: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Direct block-to-block transfers
    pub chained: u64,
    pub full_clears: u64,
    /// Translations that ran out of space and were retried after a flush
    pub out_of_space_retries: u64,
    pub translation_faults: u64,
    /// Guest data faults delivered as DSI
    pub guest_faults: u64,
    pub blocks_invalidated: u64,
}

pub struct Jit {
    config: JitConfig,
    dump_blocks: bool,
    code: CodeSpace,
    blocks: BlockCache,
    sites: BackpatchTable,
    traps: TrapDispatcher,
    backend: Box<dyn JitBackend>,
    analyzer: Box<dyn InstructionAnalyzer + Send>,
    invalidations: InvalidationQueue,
    stats: JitStats,
    clear_requested: bool,
    memcheck: bool,
}

impl Jit {
    pub fn new(config: &JitConfig) -> Self {
        Self::with_analyzer(config, Box::new(PpuAnalyzer::new()))
    }

    pub fn with_analyzer(config: &JitConfig, analyzer: Box<dyn InstructionAnalyzer + Send>) -> Self {
        let backend = create_backend(config.backend);
        let mut traps = TrapDispatcher::new();
        if config.fastmem && !config.mmu && backend.kind() == CpuBackend::Recompiler {
            traps.install();
        }
        let linking = config.block_linking && backend.kind() == CpuBackend::Recompiler;
        tracing::info!(
            target: "jit",
            "Block cache: {:?} backend, {} KiB near / {} KiB far, fastmem={}, linking={}",
            config.backend,
            config.code_size / 1024,
            config.far_code_size / 1024,
            traps.is_installed(),
            linking
        );
        Self {
            config: config.clone(),
            dump_blocks: false,
            code: CodeSpace::new(config.code_size as u32, config.far_code_size as u32),
            blocks: BlockCache::new(linking),
            sites: BackpatchTable::new(),
            traps,
            backend,
            analyzer,
            invalidations: InvalidationQueue::new(),
            stats: JitStats::default(),
            clear_requested: false,
            memcheck: false,
        }
    }

    /// Log every translated block
    pub fn set_dump_blocks(&mut self, dump: bool) {
        self.dump_blocks = dump;
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub fn backend_kind(&self) -> CpuBackend {
        self.backend.kind()
    }

    pub fn stats(&self) -> &JitStats {
        &self.stats
    }

    pub(crate) fn stats_mut(&mut self) -> &mut JitStats {
        &mut self.stats
    }

    pub fn blocks(&self) -> &BlockCache {
        &self.blocks
    }

    pub fn code(&self) -> &CodeSpace {
        &self.code
    }

    pub fn sites(&self) -> &BackpatchTable {
        &self.sites
    }

    pub fn traps(&self) -> &TrapDispatcher {
        &self.traps
    }

    pub fn analyzer(&self) -> &dyn InstructionAnalyzer {
        self.analyzer.as_ref()
    }

    /// Handle for posting invalidations from other threads
    pub fn control(&self) -> JitControl {
        self.invalidations.control()
    }

    /// Block for the current pc and mode
    #[inline]
    pub fn lookup(&self, state: &PpuState) -> Option<BlockId> {
        self.blocks.lookup(BlockKey::new(state.pc, state.feature_flags()))
    }

    /// Flush everything at the next block boundary
    pub fn request_clear(&mut self) {
        self.clear_requested = true;
    }

    /// Whether a flush is waiting for a block boundary
    pub fn clear_pending(&self) -> bool {
        self.clear_requested || self.sites.clear_requested()
    }

    pub fn memcheck(&self) -> bool {
        self.memcheck
    }

    /// Switch memory-check translation on or off. Blocks translated under the
    /// other setting are flushed at the next boundary.
    pub fn set_memcheck(&mut self, on: bool) {
        if self.memcheck != on {
            self.memcheck = on;
            self.clear_requested = true;
            tracing::info!(target: "jit", "Memory checks {}", if on { "enabled" } else { "disabled" });
        }
    }

    /// Translate the block at `state.pc`
    ///
    /// A guest fetch failure is reported as [`JitError::TranslationFault`]; the
    /// caller raises the instruction storage exception. Running out of code space
    /// flushes the cache and retries once; a second failure is returned.
    pub fn translate(
        &mut self,
        state: &PpuState,
        memory: &mut MemoryBus,
        breakpoints: &BTreeSet<u32>,
    ) -> Result<BlockId, JitError> {
        let threshold = self.config.clear_threshold;
        if self.config.no_block_cache
            || self.clear_pending()
            || self.code.near.is_almost_full(threshold)
            || self.code.far.is_almost_full(threshold)
        {
            if !self.config.no_block_cache {
                tracing::warn!(
                    target: "jit",
                    "flushing code caches (near {:.0}% used, far {:.0}% used)",
                    self.code.near.occupancy() * 100.0,
                    self.code.far.occupancy() * 100.0
                );
            }
            self.clear(memory);
        }

        let block = self.analyzer.analyze(
            memory,
            state.instruction_space(),
            state.pc,
            self.config.max_block_instructions,
        );
        if block.memory_exception || block.is_empty() {
            self.stats.translation_faults += 1;
            return Err(JitError::TranslationFault { addr: state.pc });
        }

        let mode = state.feature_flags();
        let id = match self.try_translate(&block, mode, breakpoints) {
            Ok(id) => id,
            Err(JitError::OutOfCodeSpace { requested, largest_free }) => {
                tracing::warn!(
                    target: "jit",
                    "Out of code space translating {:08x} ({} bytes wanted, {} free); flushing block cache",
                    state.pc,
                    requested,
                    largest_free
                );
                self.stats.out_of_space_retries += 1;
                self.clear(memory);
                self.try_translate(&block, mode, breakpoints).map_err(|e| {
                    tracing::error!(target: "jit", "Translation of {:08x} failed on an empty cache: {}", state.pc, e);
                    e
                })?
            }
            Err(e) => return Err(e),
        };

        memory.watch_code(block.physical_start, block.byte_len());
        self.stats.translations += 1;
        og_core::jit_trace!(
            "Translated {:08x}: {} instructions, {} cycles",
            block.start,
            block.instructions.len(),
            block.cycles()
        );
        if self.dump_blocks {
            if let Some(listing) = self.disassemble_block(id) {
                tracing::debug!(target: "jit", "Block {:08x}:\n{}", block.start, listing.join("\n"));
            }
        }
        Ok(id)
    }

    fn try_translate(
        &mut self,
        block: &AnalyzedBlock,
        mode: u32,
        breakpoints: &BTreeSet<u32>,
    ) -> Result<BlockId, JitError> {
        let key = BlockKey::new(block.start, mode);
        let options = TranslateOptions {
            fastmem: self.config.fastmem,
            mmu: self.config.mmu,
            memcheck: self.memcheck,
            mode,
            breakpoints,
        };
        let max_size = self.backend.max_code_size(block, &options);
        let reservation = self.code.near.allocate(max_size)?;
        let id = self.blocks.allocate_block(key);

        let mut emitter = Emitter::new(reservation.start(), reservation.capacity());
        let translation = match self.backend.translate(block, &options, &mut emitter) {
            Ok(translation) => translation,
            Err(e) => {
                self.blocks.discard(id);
                self.code.near.abort(reservation)?;
                return Err(e);
            }
        };
        let bytes = emitter.into_bytes();
        if let Err(e) = self.code.near.write(reservation.start(), &bytes) {
            self.blocks.discard(id);
            self.code.near.abort(reservation)?;
            return Err(e);
        }
        let host_range = self.code.near.commit(reservation, bytes.len())?;

        let record = CodeBlock {
            key,
            guest_len: block.byte_len(),
            physical_start: block.physical_start,
            entry: host_range.start,
            host_range,
            exits: translation
                .exits
                .iter()
                .map(|&(target, slot)| ExitLink {
                    target,
                    slot,
                    linked_to: None,
                })
                .collect(),
            sites: translation.sites.iter().map(|s| s.host).collect(),
            instructions: block.instructions.len() as u32,
            cycles: block.cycles(),
            dispatches: 0,
            runs: 0,
        };
        let mut registered = Vec::with_capacity(translation.sites.len());
        if let Err(e) = self.publish(id, record, &translation.sites, &mut registered) {
            self.abandon(id, host_range, &registered)?;
            return Err(e);
        }
        Ok(id)
    }

    fn publish(
        &mut self,
        id: BlockId,
        record: CodeBlock,
        sites: &[SiteSpec],
        registered: &mut Vec<HostAddr>,
    ) -> Result<(), JitError> {
        for site in sites {
            self.sites
                .register(BackpatchSite::new(site.host, site.len, site.access, id))?;
            registered.push(site.host);
        }
        self.blocks.finalize_block(id, record, &mut self.code)
    }

    /// Undo a committed translation that could not be published
    fn abandon(&mut self, id: BlockId, host_range: HostRange, registered: &[HostAddr]) -> Result<(), JitError> {
        self.sites.remove_owned_by(id, registered, &mut self.code.far)?;
        if self.blocks.erase_block(id, &mut self.code)?.is_none() {
            self.blocks.discard(id);
            self.code.near.fill(host_range, TRAP_FILL)?;
            self.code.near.release(host_range)?;
        }
        Ok(())
    }

    /// Run a block until control returns to the dispatcher
    pub fn execute(
        &mut self,
        id: BlockId,
        state: &mut PpuState,
        memory: &mut MemoryBus,
        semantics: &dyn Semantics,
        exceptions: &mut dyn ExceptionController,
        checks: &mut DebugChecks<'_>,
    ) -> Result<BlockExit, JitError> {
        let entry = match self.blocks.get_mut(id) {
            Some(block) => {
                block.dispatches += 1;
                block.runs += 1;
                block.entry
            }
            None => {
                return Err(JitError::CacheInvariantViolation(format!(
                    "dispatch to dead block {:?}",
                    id
                )))
            }
        };
        let mut env = ExecEnv {
            state,
            memory,
            semantics,
            exceptions,
            code: &mut self.code,
            sites: &mut self.sites,
            traps: &mut self.traps,
            blocks: &mut self.blocks,
            breakpoints: checks.breakpoints,
            watchpoints: checks.watchpoints,
            step_over: &mut checks.step_over,
            invalidations: &self.invalidations,
            stats: &mut self.stats,
        };
        self.backend.run(&mut env, entry)
    }

    fn drop_block(&mut self, id: BlockId, block: &CodeBlock) -> Result<(), JitError> {
        self.sites.remove_owned_by(id, &block.sites, &mut self.code.far)?;
        self.stats.blocks_invalidated += 1;
        Ok(())
    }

    /// Erase one block
    pub fn erase_block(&mut self, id: BlockId) -> Result<bool, JitError> {
        match self.blocks.erase_block(id, &mut self.code)? {
            Some(block) => {
                self.drop_block(id, &block)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Erase blocks starting at `address` in any mode
    pub fn erase_blocks_at(&mut self, address: u32) -> Result<usize, JitError> {
        let ids = self.blocks.blocks_at(address);
        let mut erased = 0;
        for id in ids {
            if self.erase_block(id)? {
                erased += 1;
            }
        }
        Ok(erased)
    }

    /// Erase blocks whose guest range covers `address`
    pub fn erase_blocks_containing(&mut self, address: u32) -> Result<usize, JitError> {
        let ids = self.blocks.blocks_containing(address);
        let mut erased = 0;
        for id in ids {
            if self.erase_block(id)? {
                erased += 1;
            }
        }
        Ok(erased)
    }

    /// Erase blocks whose physical source overlaps the range
    pub fn invalidate_range(&mut self, start: u32, len: u32) -> Result<usize, JitError> {
        let erased = self.blocks.invalidate_range(start, len, &mut self.code)?;
        for (id, block) in &erased {
            self.drop_block(*id, block)?;
        }
        if !erased.is_empty() {
            og_core::jit_debug!("Invalidated {} blocks at {:08x}+{:#x}", erased.len(), start, len);
        }
        Ok(erased.len())
    }

    /// Drop every block, site and trampoline
    pub fn clear(&mut self, memory: &mut MemoryBus) {
        let blocks = self.blocks.len();
        self.blocks.clear();
        self.sites.clear();
        self.code.reset();
        memory.clear_code_watch();
        self.clear_requested = false;
        self.stats.full_clears += 1;
        tracing::info!(target: "jit", "Block cache cleared ({} blocks)", blocks);
    }

    /// Apply queued requests, guest code writes and pending flushes; call only
    /// between blocks
    pub fn apply_invalidations(&mut self, memory: &mut MemoryBus) -> Result<usize, JitError> {
        let mut erased = 0;
        for request in self.invalidations.drain() {
            match request {
                InvalidationRequest::Range { start, len } => erased += self.invalidate_range(start, len)?,
                InvalidationRequest::EraseAt { address } => erased += self.erase_blocks_at(address)?,
                InvalidationRequest::EraseContaining { address } => {
                    erased += self.erase_blocks_containing(address)?
                }
                InvalidationRequest::Clear => self.clear(memory),
            }
        }
        for write in memory.take_code_writes() {
            erased += self.invalidate_range(write.addr, write.len)?;
        }
        if self.clear_pending() {
            tracing::warn!(
                target: "jit",
                "flushing code caches on request ({} blocks, {} sites)",
                self.blocks.len(),
                self.sites.len()
            );
            self.clear(memory);
        }
        Ok(erased)
    }

    /// Host code listing of a block
    pub fn disassemble_block(&self, id: BlockId) -> Option<Vec<String>> {
        let block = self.blocks.get(id)?;
        let bytes = self.code.read(block.host_range)?;
        Some(self.backend.disassemble(bytes, block.host_range.start))
    }

    pub fn check_invariants(&self) -> Result<(), JitError> {
        self.blocks.check_invariants(&self.code)?;
        for (id, block) in self.blocks.iter() {
            for host in &block.sites {
                match self.sites.get(*host) {
                    Some(site) if site.owner == id => {}
                    _ => {
                        return Err(JitError::CacheInvariantViolation(format!(
                            "block {:08x} lost its site at {:#x}",
                            block.key.address, host
                        )))
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytemuck::Zeroable;
    use og_memory::PageFlags;
    use og_ppu::{PpcExceptions, PpuInterpreter};

    use crate::host::{size, MemArgs};

    fn config(backend: CpuBackend) -> JitConfig {
        JitConfig {
            backend,
            code_size: 64 * 1024,
            far_code_size: 16 * 1024,
            ..JitConfig::default()
        }
    }

    fn memory(program: &[u32]) -> MemoryBus {
        let mut memory = MemoryBus::empty();
        memory.map_ram(0, 0x10000, PageFlags::RWX).unwrap();
        memory.load_program(0x1000, program).unwrap();
        memory
    }

    #[test]
    fn test_translate_registers_block_and_sites() {
        let mut memory = memory(&[0x8064_0000, 0x4E80_0020]);
        let mut jit = Jit::new(&config(CpuBackend::Recompiler));
        let state = PpuState::new(0x1000);
        let id = jit.translate(&state, &mut memory, &BTreeSet::new()).unwrap();

        assert_eq!(jit.lookup(&state), Some(id));
        assert_eq!(jit.sites().len(), 1);
        assert_eq!(jit.stats().translations, 1);
        assert!(memory.is_code_page(0x1000));
        jit.check_invariants().unwrap();
    }

    #[test]
    fn test_unfetchable_pc_is_translation_fault() {
        let mut memory = memory(&[]);
        let mut jit = Jit::new(&config(CpuBackend::Recompiler));
        let state = PpuState::new(0x0080_0000);
        assert_eq!(
            jit.translate(&state, &mut memory, &BTreeSet::new()),
            Err(JitError::TranslationFault { addr: 0x0080_0000 })
        );
        assert_eq!(jit.stats().translation_faults, 1);
    }

    #[test]
    fn test_full_region_flushes_and_retries() {
        let program = vec![0x6000_0000; 64]; // nop x64
        let mut memory = memory(&program);
        let mut cfg = config(CpuBackend::Recompiler);
        cfg.code_size = 2048;
        cfg.clear_threshold = 1.0;
        cfg.max_block_instructions = 8;
        let mut jit = Jit::new(&cfg);

        let mut pc = 0x1000;
        for _ in 0..40 {
            let state = PpuState::new(pc);
            jit.translate(&state, &mut memory, &BTreeSet::new()).unwrap();
            pc += 32;
        }
        assert!(jit.stats().out_of_space_retries >= 1);
        assert_eq!(jit.stats().full_clears, jit.stats().out_of_space_retries);
        jit.check_invariants().unwrap();
    }

    #[test]
    fn test_block_larger_than_region_is_fatal() {
        let program = vec![0x6000_0000; 64];
        let mut memory = memory(&program);
        let mut cfg = config(CpuBackend::Recompiler);
        cfg.code_size = 1024;
        let mut jit = Jit::new(&cfg);
        let result = jit.translate(&PpuState::new(0x1000), &mut memory, &BTreeSet::new());
        assert!(matches!(result, Err(JitError::OutOfCodeSpace { .. })));
        assert!(jit.blocks().is_empty());
    }

    #[test]
    fn test_code_write_invalidates_at_boundary() {
        let mut memory = memory(&[0x3860_0001, 0x4E80_0020]);
        let mut jit = Jit::new(&config(CpuBackend::Recompiler));
        let state = PpuState::new(0x1000);
        jit.translate(&state, &mut memory, &BTreeSet::new()).unwrap();

        memory
            .write(og_memory::AddressSpace::Physical, 0x1000, og_memory::AccessSize::Word, 0x3860_0002)
            .unwrap();
        assert!(jit.lookup(&state).is_some());
        assert_eq!(jit.apply_invalidations(&mut memory).unwrap(), 1);
        assert!(jit.lookup(&state).is_none());
        jit.check_invariants().unwrap();
    }

    #[test]
    fn test_control_requests_apply_later() {
        let mut memory = memory(&[0x3860_0001, 0x4E80_0020]);
        let mut jit = Jit::new(&config(CpuBackend::CachedInterpreter));
        let state = PpuState::new(0x1000);
        jit.translate(&state, &mut memory, &BTreeSet::new()).unwrap();
        assert!(jit.sites().is_empty());

        let control = jit.control();
        control.erase_block_at(0x1000);
        assert!(jit.lookup(&state).is_some());
        jit.apply_invalidations(&mut memory).unwrap();
        assert!(jit.lookup(&state).is_none());

        control.clear();
        jit.apply_invalidations(&mut memory).unwrap();
        assert_eq!(jit.stats().full_clears, 1);
    }

    #[test]
    fn test_no_block_cache_clears_every_time() {
        let mut memory = memory(&[0x3860_0001, 0x4E80_0020]);
        let mut cfg = config(CpuBackend::Recompiler);
        cfg.no_block_cache = true;
        let mut jit = Jit::new(&cfg);
        let state = PpuState::new(0x1000);
        jit.translate(&state, &mut memory, &BTreeSet::new()).unwrap();
        jit.translate(&state, &mut memory, &BTreeSet::new()).unwrap();
        assert_eq!(jit.stats().full_clears, 2);
        assert_eq!(jit.blocks().len(), 1);
    }

    #[test]
    fn test_failed_publish_releases_everything() {
        // lwz r3, 0(r4); lwz r3, 0(r4); blr
        let mut memory = memory(&[0x8064_0000, 0x8064_0000, 0x4E80_0020]);
        let cfg = config(CpuBackend::Recompiler);
        let mut jit = Jit::new(&cfg);
        let stray = BackpatchSite::new(size::MEM as u32, size::MEM as u32, MemArgs::zeroed(), BlockId(7));
        jit.sites.register(stray).unwrap();

        let result = jit.translate(&PpuState::new(0x1000), &mut memory, &BTreeSet::new());
        assert!(matches!(result, Err(JitError::CacheInvariantViolation(_))));
        assert!(jit.blocks().is_empty());
        assert_eq!(jit.code().near.largest_free(), cfg.code_size as u32);
        assert_eq!(jit.sites().len(), 1);
        assert!(jit.sites().get(0).is_none());
        assert_eq!(jit.stats().translations, 0);
        jit.check_invariants().unwrap();

        // The handle is reusable once the stray site is gone
        jit.request_clear();
        let id = jit.translate(&PpuState::new(0x1000), &mut memory, &BTreeSet::new()).unwrap();
        assert_eq!(jit.sites().len(), 2);
        assert!(jit.blocks().get(id).is_some());
    }

    #[test]
    fn test_long_block_charges_every_cycle() {
        // divw r3, r4, r5 x5000; b .
        let mut program = vec![0x7C64_2BD6; 5000];
        program.push(0x4800_0000);
        let mut memory = memory(&program);
        let mut cfg = config(CpuBackend::Recompiler);
        cfg.code_size = 256 * 1024;
        cfg.max_block_instructions = 6000;
        let mut jit = Jit::new(&cfg);
        let mut exceptions = PpcExceptions::new();
        let breakpoints = BTreeSet::new();

        let mut state = PpuState::new(0x1000);
        state.gpr[4] = 84;
        state.gpr[5] = 1;
        state.downcount = 200_000;
        let id = jit.translate(&state, &mut memory, &breakpoints).unwrap();
        let cycles = jit.blocks().get(id).unwrap().cycles;
        assert_eq!(cycles, 5000 * 19 + 1);

        let exit = jit
            .execute(id, &mut state, &mut memory, &PpuInterpreter, &mut exceptions, &mut DebugChecks::new(&breakpoints))
            .unwrap();
        assert_eq!(exit, BlockExit::Normal);
        assert_eq!(state.downcount, 200_000 - cycles as i64);
        assert_eq!(state.pc, 0x1000 + 5000 * 4);
        assert_eq!(state.gpr[3], 84);
    }

    #[test]
    fn test_requested_clear_applies_at_boundary() {
        let mut memory = memory(&[0x3860_0001, 0x4E80_0020]);
        let mut jit = Jit::new(&config(CpuBackend::Recompiler));
        let state = PpuState::new(0x1000);
        jit.translate(&state, &mut memory, &BTreeSet::new()).unwrap();

        jit.request_clear();
        assert!(jit.clear_pending());
        assert_eq!(jit.apply_invalidations(&mut memory).unwrap(), 0);
        assert!(!jit.clear_pending());
        assert!(jit.lookup(&state).is_none());
        assert_eq!(jit.stats().full_clears, 1);

        // A queued clear is not applied twice
        jit.translate(&state, &mut memory, &BTreeSet::new()).unwrap();
        jit.control().clear();
        jit.request_clear();
        jit.apply_invalidations(&mut memory).unwrap();
        assert_eq!(jit.stats().full_clears, 2);
    }

    #[test]
    fn test_memcheck_toggle_flushes_and_drops_fastmem() {
        let mut memory = memory(&[0x8064_0000, 0x4E80_0020]);
        let mut jit = Jit::new(&config(CpuBackend::Recompiler));
        let state = PpuState::new(0x1000);
        jit.translate(&state, &mut memory, &BTreeSet::new()).unwrap();
        assert_eq!(jit.sites().len(), 1);

        jit.set_memcheck(true);
        jit.set_memcheck(true);
        jit.apply_invalidations(&mut memory).unwrap();
        assert_eq!(jit.stats().full_clears, 1);
        jit.translate(&state, &mut memory, &BTreeSet::new()).unwrap();
        assert!(jit.sites().is_empty());
        jit.check_invariants().unwrap();
    }
}
