//! Execution loop
//!
//! The dispatcher alternates between two phases. In ADVANCE_TIME the timing
//! service accounts for the finished slice and hands out a new downcount, and
//! pending exceptions are delivered. In DISPATCH the block for the current pc
//! is looked up (translated on a miss) and run. A block that returns with
//! downcount left goes straight back to DISPATCH; time only advances once the
//! quantum is spent or a block reports an exception, breakpoint or watchpoint.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use og_core::config::JitConfig;
use og_core::error::JitError;
use og_memory::MemoryBus;
use og_ppu::{
    CoreTiming, ExceptionController, ExceptionKind, PpcExceptions, PpuInterpreter, PpuState, RunState,
    Semantics, Step, TimingService,
};
use parking_lot::{RwLock, RwLockReadGuard};

use crate::invalidation::JitControl;
use crate::jit::Jit;
use crate::translator::{BlockExit, DebugChecks};
use crate::watchpoint::WatchpointSet;

/// Breakpoint addresses shared between the CPU thread and a debugger
#[derive(Debug, Clone, Default)]
pub struct BreakpointSet {
    inner: Arc<RwLock<BTreeSet<u32>>>,
}

impl BreakpointSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the address was not already set
    pub fn insert(&self, address: u32) -> bool {
        self.inner.write().insert(address)
    }

    pub fn remove(&self, address: u32) -> bool {
        self.inner.write().remove(&address)
    }

    pub fn contains(&self, address: u32) -> bool {
        self.inner.read().contains(&address)
    }

    pub fn clear(&self) {
        self.inner.write().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn read(&self) -> RwLockReadGuard<'_, BTreeSet<u32>> {
        self.inner.read()
    }
}

/// Asks a running dispatcher to return at the next quantum boundary
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn request_stop(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    fn take(&self) -> bool {
        self.flag.swap(false, Ordering::AcqRel)
    }
}

/// Why a run returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// A stop was requested
    Stopped,
    /// Halted in front of a breakpoint
    Breakpoint(u32),
    /// Halted in front of the access at `pc` that touches watched `addr`
    Watchpoint { pc: u32, addr: u32 },
    /// The requested number of quanta elapsed
    QuantaElapsed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AdvanceTime,
    Dispatch,
}

/// Drives guest execution through the block cache
pub struct Dispatcher {
    state: PpuState,
    memory: MemoryBus,
    jit: Jit,
    semantics: Box<dyn Semantics + Send>,
    exceptions: Box<dyn ExceptionController + Send>,
    timing: Box<dyn TimingService + Send>,
    breakpoints: BreakpointSet,
    watchpoints: WatchpointSet,
    stop: StopHandle,
    /// Halt address to run past on resume
    step_over: Option<u32>,
    phase: Phase,
}

impl Dispatcher {
    /// Dispatcher with the reference interpreter, exception controller and timing
    pub fn new(config: &JitConfig, memory: MemoryBus, state: PpuState) -> Self {
        Self {
            state,
            memory,
            jit: Jit::new(config),
            semantics: Box::new(PpuInterpreter::new()),
            exceptions: Box::new(PpcExceptions::new()),
            timing: Box::new(CoreTiming::default()),
            breakpoints: BreakpointSet::new(),
            watchpoints: WatchpointSet::new(),
            stop: StopHandle::default(),
            step_over: None,
            phase: Phase::AdvanceTime,
        }
    }

    pub fn with_timing(mut self, timing: Box<dyn TimingService + Send>) -> Self {
        self.timing = timing;
        self
    }

    pub fn with_semantics(mut self, semantics: Box<dyn Semantics + Send>) -> Self {
        self.semantics = semantics;
        self
    }

    pub fn with_exceptions(mut self, exceptions: Box<dyn ExceptionController + Send>) -> Self {
        self.exceptions = exceptions;
        self
    }

    pub fn with_jit(mut self, jit: Jit) -> Self {
        self.jit = jit;
        self
    }

    pub fn state(&self) -> &PpuState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut PpuState {
        &mut self.state
    }

    pub fn memory(&self) -> &MemoryBus {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut MemoryBus {
        &mut self.memory
    }

    pub fn jit(&self) -> &Jit {
        &self.jit
    }

    pub fn jit_mut(&mut self) -> &mut Jit {
        &mut self.jit
    }

    pub fn timing(&self) -> &dyn TimingService {
        self.timing.as_ref()
    }

    pub fn exceptions(&self) -> &dyn ExceptionController {
        self.exceptions.as_ref()
    }

    pub fn breakpoints(&self) -> &BreakpointSet {
        &self.breakpoints
    }

    pub fn watchpoints(&self) -> &WatchpointSet {
        &self.watchpoints
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn control(&self) -> JitControl {
        self.jit.control()
    }

    /// Drop every translated block now
    pub fn clear_cache(&mut self) {
        self.jit.clear(&mut self.memory);
    }

    /// Run until a stop is requested or a breakpoint or watchpoint is hit
    pub fn run(&mut self) -> Result<RunOutcome, JitError> {
        self.run_until(None)
    }

    /// Run at most `quanta` timing slices
    pub fn run_quanta(&mut self, quanta: u64) -> Result<RunOutcome, JitError> {
        self.run_until(Some(quanta))
    }

    fn run_until(&mut self, limit: Option<u64>) -> Result<RunOutcome, JitError> {
        self.state.run_state = RunState::Running;
        let mut advanced = 0u64;

        loop {
            match self.phase {
                Phase::AdvanceTime => {
                    if self.stop.take() {
                        self.state.run_state = RunState::Halted;
                        og_core::ppu_debug!("Stop requested at {:08x}", self.state.pc);
                        return Ok(RunOutcome::Stopped);
                    }
                    if limit.is_some_and(|n| advanced >= n) {
                        return Ok(RunOutcome::QuantaElapsed);
                    }
                    self.timing.advance(&mut self.state, self.exceptions.as_mut());
                    self.exceptions.check_exceptions(&mut self.state);
                    advanced += 1;
                    self.phase = Phase::Dispatch;
                }
                Phase::Dispatch => {
                    if let Some(exit) = self.dispatch_one()? {
                        match exit {
                            BlockExit::Normal if self.state.downcount > 0 => {}
                            BlockExit::Normal | BlockExit::Exception => self.phase = Phase::AdvanceTime,
                            BlockExit::Breakpoint(pc) => {
                                self.state.run_state = RunState::Halted;
                                self.step_over = Some(pc);
                                og_core::ppu_debug!("Breakpoint hit at {:08x}", pc);
                                return Ok(RunOutcome::Breakpoint(pc));
                            }
                            BlockExit::Watchpoint { pc, addr } => {
                                self.state.run_state = RunState::Halted;
                                self.step_over = Some(pc);
                                og_core::ppu_debug!("Watchpoint hit at {:08x} accessing {:08x}", pc, addr);
                                return Ok(RunOutcome::Watchpoint { pc, addr });
                            }
                        }
                    }
                }
            }
        }
    }

    /// Look up or translate the block at pc and run it.
    /// Returns `None` when translation raised an instruction storage exception.
    fn dispatch_one(&mut self) -> Result<Option<BlockExit>, JitError> {
        self.jit.set_memcheck(!self.watchpoints.is_empty());
        self.jit.apply_invalidations(&mut self.memory)?;
        let breakpoints = self.breakpoints.read();
        let watches = self.watchpoints.read();

        let id = match self.jit.lookup(&self.state) {
            Some(id) => {
                self.jit.stats_mut().cache_hits += 1;
                id
            }
            None => {
                self.jit.stats_mut().cache_misses += 1;
                match self.jit.translate(&self.state, &mut self.memory, &breakpoints) {
                    Ok(id) => id,
                    Err(JitError::TranslationFault { addr }) => {
                        og_core::ppu_debug!("Instruction fetch failed at {:08x}", addr);
                        self.exceptions.raise(&mut self.state, ExceptionKind::Isi);
                        self.phase = Phase::AdvanceTime;
                        return Ok(None);
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        // The step-over applies to the first block after resuming only
        let mut checks = DebugChecks::new(&breakpoints)
            .with_watchpoints(&watches)
            .with_step_over(self.step_over.take());
        let exit = self.jit.execute(
            id,
            &mut self.state,
            &mut self.memory,
            self.semantics.as_ref(),
            self.exceptions.as_mut(),
            &mut checks,
        )?;
        Ok(Some(exit))
    }

    /// Execute one instruction through the semantics, bypassing the cache
    pub fn single_step(&mut self) -> Result<(), JitError> {
        self.jit.apply_invalidations(&mut self.memory)?;
        self.step_over = None;
        let pc = self.state.pc;
        let space = self.state.instruction_space();

        let opcode = match self.memory.fetch(space, pc) {
            Ok(opcode) => opcode,
            Err(_) => {
                self.exceptions.raise(&mut self.state, ExceptionKind::Isi);
                self.exceptions.check_exceptions(&mut self.state);
                return Ok(());
            }
        };
        let cycles = self
            .jit
            .analyzer()
            .analyze(&self.memory, space, pc, 1)
            .cycles()
            .max(1);

        match self.semantics.execute(&mut self.state, &mut self.memory, pc, opcode) {
            Step::Next => self.state.pc = pc.wrapping_add(4),
            Step::Jump(target) => self.state.pc = target,
            Step::Exception(kind) => {
                self.state.pc = pc;
                self.exceptions.raise(&mut self.state, kind);
            }
        }
        self.exceptions.check_exceptions(&mut self.state);
        self.state.downcount -= cycles as i64;
        self.jit.apply_invalidations(&mut self.memory)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use og_memory::{AddressSpace, PageFlags};
    use og_ppu::Msr;

    use crate::watchpoint::{WatchKind, Watchpoint};

    fn dispatcher(program: &[u32]) -> Dispatcher {
        let mut memory = MemoryBus::empty();
        memory.map_ram(0, 0x10000, PageFlags::RWX).unwrap();
        memory.load_program(0x1000, program).unwrap();
        let config = JitConfig {
            code_size: 64 * 1024,
            far_code_size: 16 * 1024,
            ..JitConfig::default()
        };
        Dispatcher::new(&config, memory, PpuState::new(0x1000)).with_timing(Box::new(CoreTiming::new(100)))
    }

    #[test]
    fn test_loop_runs_and_chains() {
        // li r3, 0; addi r3, r3, 1; b -4
        let mut d = dispatcher(&[0x3860_0000, 0x3863_0001, 0x4BFF_FFFC]);
        assert_eq!(d.run_quanta(3).unwrap(), RunOutcome::QuantaElapsed);
        assert!(d.state().gpr[3] > 50);
        assert!(d.jit().stats().chained > 0);
        let stats = *d.jit().stats();
        let runs: u64 = d.jit().blocks().iter().map(|(_, b)| b.runs).sum();
        let dispatches: u64 = d.jit().blocks().iter().map(|(_, b)| b.dispatches).sum();
        assert_eq!(dispatches, stats.cache_hits + stats.cache_misses);
        assert_eq!(runs, dispatches + stats.chained);
        d.jit().check_invariants().unwrap();
    }

    #[test]
    fn test_breakpoint_halts_and_resumes() {
        let mut d = dispatcher(&[0x3860_0001, 0x3880_0002, 0x38A0_0003, 0x4800_0000]);
        d.breakpoints().insert(0x1004);
        assert_eq!(d.run_quanta(1).unwrap(), RunOutcome::Breakpoint(0x1004));
        assert_eq!(d.state().pc, 0x1004);
        assert_eq!(d.state().gpr[3], 1);
        assert_eq!(d.state().gpr[4], 0);
        assert_eq!(d.state().run_state, RunState::Halted);

        // Resuming steps over the breakpoint once
        assert_eq!(d.run_quanta(1).unwrap(), RunOutcome::QuantaElapsed);
        assert_eq!(d.state().gpr[4], 2);
        assert_eq!(d.state().gpr[5], 3);
    }

    #[test]
    fn test_stop_request_returns_at_boundary() {
        let mut d = dispatcher(&[0x4800_0000]); // b .
        let stop = d.stop_handle();
        stop.request_stop();
        assert_eq!(d.run().unwrap(), RunOutcome::Stopped);
        assert!(!stop.is_stop_requested());
        assert_eq!(d.state().run_state, RunState::Halted);
    }

    #[test]
    fn test_unmapped_pc_raises_isi() {
        let mut d = dispatcher(&[]);
        d.state_mut().pc = 0x0080_0000;
        // Park the ISI handler on a branch-to-self
        d.memory_mut().load_program(0x400, &[0x4800_0000]).unwrap();
        d.run_quanta(2).unwrap();
        assert_eq!(d.state().srr0, 0x0080_0000);
        assert_eq!(d.state().pc, 0x400);
        assert_eq!(d.jit().stats().translation_faults, 1);
    }

    #[test]
    fn test_single_step_matches_semantics() {
        let mut d = dispatcher(&[0x3860_0005, 0x3863_0001]);
        d.single_step().unwrap();
        d.single_step().unwrap();
        assert_eq!(d.state().gpr[3], 6);
        assert_eq!(d.state().pc, 0x1008);
        assert!(d.jit().blocks().is_empty());
    }

    #[test]
    fn test_fpu_unavailable_from_block() {
        // fadd f1, f2, f3 with MSR[FP] clear
        let mut d = dispatcher(&[0xFC22_182A]);
        d.memory_mut().load_program(0x800, &[0x4800_0000]).unwrap();
        d.run_quanta(2).unwrap();
        assert_eq!(d.state().srr0, 0x1000);
        assert_eq!(d.state().pc, 0x800);
        assert!(!d.state().msr.contains(Msr::FP));
    }

    #[test]
    fn test_watchpoint_halts_before_store() {
        // li r4, 0x3000; li r3, 5; stw r3, 0(r4); b .
        let mut d = dispatcher(&[0x3880_3000, 0x3860_0005, 0x9064_0000, 0x4800_0000]);
        d.watchpoints().insert(Watchpoint::new(0x3000, 4, WatchKind::Write));
        assert_eq!(
            d.run_quanta(1).unwrap(),
            RunOutcome::Watchpoint { pc: 0x1008, addr: 0x3000 }
        );
        assert!(d.jit().memcheck());
        assert_eq!(d.state().run_state, RunState::Halted);
        assert_eq!(d.memory().fetch(AddressSpace::Physical, 0x3000).unwrap(), 0);

        d.run_quanta(1).unwrap();
        assert_eq!(d.memory().fetch(AddressSpace::Physical, 0x3000).unwrap(), 5);

        d.watchpoints().clear();
        d.run_quanta(1).unwrap();
        assert!(!d.jit().memcheck());
    }
}
