//! Translation backends
//!
//! A backend turns an analyzed guest block into host code inside a reservation
//! and later runs that code. Both backends share the same execution
//! environment and block exit protocol, so the dispatcher does not care which
//! one produced a block.

mod cached_interpreter;
mod recompiler;

use std::collections::BTreeSet;

use og_core::config::CpuBackend;
use og_core::error::JitError;
use og_memory::MemoryBus;
use og_ppu::{AnalyzedBlock, ExceptionController, ExceptionKind, MemAccess, Msr, PpuState, Semantics};

use crate::backpatch::BackpatchTable;
use crate::code_region::{CodeSpace, HostAddr};
use crate::host::{Emitter, MemArgs};
use crate::invalidation::InvalidationQueue;
use crate::jit::JitStats;
use crate::block_cache::BlockCache;
use crate::trap::TrapDispatcher;
use crate::watchpoint::Watchpoint;

pub use cached_interpreter::CachedInterpreter;
pub use recompiler::Recompiler;

/// Options fixed at translation time
#[derive(Debug, Clone, Copy)]
pub struct TranslateOptions<'a> {
    pub fastmem: bool,
    pub mmu: bool,
    /// Mode key of the block
    pub mode: u32,
    /// Check every load and store against the watchpoints
    pub memcheck: bool,
    /// Guest addresses that get a breakpoint check
    pub breakpoints: &'a BTreeSet<u32>,
}

impl TranslateOptions<'_> {
    /// Whether loads and stores go straight to the fastmem view
    pub fn native_memory(&self) -> bool {
        self.fastmem && !self.mmu && !self.memcheck
    }
}

/// Debugger state consulted while blocks run
#[derive(Debug, Clone)]
pub struct DebugChecks<'a> {
    pub breakpoints: &'a BTreeSet<u32>,
    pub watchpoints: &'a [Watchpoint],
    /// Guest address whose checks are skipped until the block chains on
    pub step_over: Option<u32>,
}

impl<'a> DebugChecks<'a> {
    pub fn new(breakpoints: &'a BTreeSet<u32>) -> Self {
        Self {
            breakpoints,
            watchpoints: &[],
            step_over: None,
        }
    }

    pub fn with_watchpoints(mut self, watchpoints: &'a [Watchpoint]) -> Self {
        self.watchpoints = watchpoints;
        self
    }

    pub fn with_step_over(mut self, step_over: Option<u32>) -> Self {
        self.step_over = step_over;
        self
    }
}

/// A fast-path access emitted into the block
#[derive(Debug, Clone, Copy)]
pub struct SiteSpec {
    pub host: HostAddr,
    pub len: u32,
    pub access: MemArgs,
}

/// Emission result besides the bytes themselves
#[derive(Debug, Clone, Default)]
pub struct Translation {
    /// Static successors and the host address of their link slots
    pub exits: Vec<(u32, HostAddr)>,
    pub sites: Vec<SiteSpec>,
}

/// Why control returned to the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockExit {
    /// Reached the end of a block; `pc` holds the successor
    Normal,
    /// An exception was raised and awaits delivery
    Exception,
    /// Stopped in front of a breakpoint at the given address
    Breakpoint(u32),
    /// Stopped in front of the access at `pc` touching a watched address
    Watchpoint { pc: u32, addr: u32 },
}

/// Everything host code may touch while it runs
pub struct ExecEnv<'a> {
    pub state: &'a mut PpuState,
    pub memory: &'a mut MemoryBus,
    pub semantics: &'a dyn Semantics,
    pub exceptions: &'a mut dyn ExceptionController,
    pub code: &'a mut CodeSpace,
    pub sites: &'a mut BackpatchTable,
    pub traps: &'a mut TrapDispatcher,
    pub blocks: &'a mut BlockCache,
    pub breakpoints: &'a BTreeSet<u32>,
    pub watchpoints: &'a [Watchpoint],
    /// Address to step over, cleared once execution chains into another block
    pub step_over: &'a mut Option<u32>,
    pub invalidations: &'a InvalidationQueue,
    pub stats: &'a mut JitStats,
}

impl ExecEnv<'_> {
    /// Whether execution must stop in front of `pc`
    pub fn breakpoint_hit(&self, pc: u32) -> bool {
        *self.step_over != Some(pc) && self.breakpoints.contains(&pc)
    }

    /// Watched address the access at `pc` would touch
    pub fn watchpoint_hit(&self, pc: u32, access: &MemAccess) -> Option<u32> {
        if self.watchpoints.is_empty() || *self.step_over == Some(pc) {
            return None;
        }
        let addr = access.effective_address(self.state);
        self.watchpoints
            .iter()
            .any(|w| w.matches(addr, access.size.bytes(), access.store))
            .then_some(addr)
    }

    /// Stop in front of the instruction at `pc` without running it
    pub fn halt_before(&mut self, pc: u32, cycles_before: u32) {
        self.state.pc = pc;
        self.state.downcount -= cycles_before as i64;
    }

    /// Account a direct jump into the block at `entry`
    pub fn enter_chained(&mut self, entry: HostAddr) {
        *self.step_over = None;
        self.stats.chained += 1;
        if let Some(block) = self
            .blocks
            .block_at_entry(entry)
            .and_then(|id| self.blocks.get_mut(id))
        {
            block.runs += 1;
        }
    }

    pub fn fpu_enabled(&self) -> bool {
        self.state.msr.contains(Msr::FP)
    }

    /// Chaining is allowed while the quantum lasts, the mode matches the block
    /// and no cache mutation is waiting for a boundary
    pub fn may_chain(&self, mode: u8) -> bool {
        self.state.downcount > 0
            && self.state.feature_flags() == mode as u32
            && !self.memory.has_code_writes()
            && self.invalidations.is_empty()
            && !self.sites.clear_requested()
    }

    /// Stop at the instruction `pc` with an exception pending
    pub fn raise(&mut self, pc: u32, cycles: u32, kind: ExceptionKind) -> BlockExit {
        self.state.pc = pc;
        self.state.downcount -= cycles as i64;
        self.exceptions.raise(self.state, kind);
        BlockExit::Exception
    }

    /// A guest access that no path could complete
    pub fn guest_fault(&mut self, access: &MemArgs, addr: u32) -> BlockExit {
        let store = access.flags().contains(crate::host::MemFlags::STORE);
        let error = JitError::GuestMemoryFault { addr, pc: access.pc };
        og_core::jit_debug!("{}", error);
        self.stats.guest_faults += 1;
        self.raise(access.pc, access.cycles, ExceptionKind::Dsi { addr, store })
    }
}

/// A translation backend
pub trait JitBackend: Send {
    fn kind(&self) -> CpuBackend;

    /// Upper bound on the bytes [`JitBackend::translate`] emits for `block`
    fn max_code_size(&self, block: &AnalyzedBlock, options: &TranslateOptions<'_>) -> usize;

    /// Emit host code for `block`
    fn translate(
        &self,
        block: &AnalyzedBlock,
        options: &TranslateOptions<'_>,
        emitter: &mut Emitter,
    ) -> Result<Translation, JitError>;

    /// Run host code from `entry` until control returns to the dispatcher
    fn run(&self, env: &mut ExecEnv<'_>, entry: HostAddr) -> Result<BlockExit, JitError>;

    fn disassemble(&self, code: &[u8], base: HostAddr) -> Vec<String>;
}

/// Backend for the configured kind
pub fn create_backend(kind: CpuBackend) -> Box<dyn JitBackend> {
    match kind {
        CpuBackend::Recompiler => Box::new(Recompiler::new()),
        CpuBackend::CachedInterpreter => Box::new(CachedInterpreter::new()),
    }
}

pub(crate) fn invariant(message: String) -> JitError {
    JitError::CacheInvariantViolation(message)
}
