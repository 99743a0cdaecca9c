//! Guest exception raising and delivery

use bitflags::bitflags;

use crate::state::{Msr, PpuState};

bitflags! {
    /// Pending exception bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ExceptionFlags: u32 {
        const ISI             = 1 << 0;
        const DSI             = 1 << 1;
        const ALIGNMENT       = 1 << 2;
        const PROGRAM         = 1 << 3;
        const FPU_UNAVAILABLE = 1 << 4;
        const SYSCALL         = 1 << 5;
        const EXTERNAL_INT    = 1 << 6;
        const DECREMENTER     = 1 << 7;

        /// Exceptions caused by the instruction stream itself
        const SYNCHRONOUS = Self::ISI.bits()
            | Self::DSI.bits()
            | Self::ALIGNMENT.bits()
            | Self::PROGRAM.bits()
            | Self::FPU_UNAVAILABLE.bits()
            | Self::SYSCALL.bits();
    }
}

/// An exception raised by execution or by the timing service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionKind {
    /// Instruction fetch could not be translated
    Isi,
    /// Data access fault
    Dsi { addr: u32, store: bool },
    Alignment { addr: u32 },
    /// Illegal or privileged instruction
    Program,
    FpUnavailable,
    Syscall,
    External,
    Decrementer,
}

impl ExceptionKind {
    /// Pending bit for this kind
    pub fn flag(self) -> ExceptionFlags {
        match self {
            ExceptionKind::Isi => ExceptionFlags::ISI,
            ExceptionKind::Dsi { .. } => ExceptionFlags::DSI,
            ExceptionKind::Alignment { .. } => ExceptionFlags::ALIGNMENT,
            ExceptionKind::Program => ExceptionFlags::PROGRAM,
            ExceptionKind::FpUnavailable => ExceptionFlags::FPU_UNAVAILABLE,
            ExceptionKind::Syscall => ExceptionFlags::SYSCALL,
            ExceptionKind::External => ExceptionFlags::EXTERNAL_INT,
            ExceptionKind::Decrementer => ExceptionFlags::DECREMENTER,
        }
    }
}

/// Raises guest exceptions and redirects the core to their vectors
pub trait ExceptionController {
    /// Record an exception; for synchronous kinds `state.pc` is the faulting instruction
    fn raise(&mut self, state: &mut PpuState, kind: ExceptionKind);

    /// Deliver the highest-priority deliverable exception; returns whether one was taken
    fn check_exceptions(&mut self, state: &mut PpuState) -> bool;

    /// Number of exceptions delivered so far
    fn delivered(&self) -> u64;
}

/// Exception vector offsets
pub mod vectors {
    pub const DSI: u32 = 0x300;
    pub const ISI: u32 = 0x400;
    pub const EXTERNAL: u32 = 0x500;
    pub const ALIGNMENT: u32 = 0x600;
    pub const PROGRAM: u32 = 0x700;
    pub const FPU_UNAVAILABLE: u32 = 0x800;
    pub const DECREMENTER: u32 = 0x900;
    pub const SYSCALL: u32 = 0xC00;
}

/// SRR1 bits preserved from MSR on exception entry
const SRR1_MSR_MASK: u32 = 0x87C0_FFFF;
/// MSR bits cleared on exception entry
const MSR_CLEAR_ON_ENTRY: u32 = 0x0004_EF36;

/// Gekko exception controller
#[derive(Debug, Default)]
pub struct PpcExceptions {
    delivered: u64,
}

impl PpcExceptions {
    pub fn new() -> Self {
        Self::default()
    }

    fn enter(&mut self, state: &mut PpuState, flag: ExceptionFlags, vector: u32, srr0: u32) {
        state.srr0 = srr0;
        state.srr1 = state.msr.bits() & SRR1_MSR_MASK;
        let prefix = if state.msr.contains(Msr::IP) { 0xFFF0_0000 } else { 0 };
        state.msr = Msr::from_bits_retain(state.msr.bits() & !MSR_CLEAR_ON_ENTRY);
        state.exceptions.remove(flag);
        state.pc = prefix | vector;
        self.delivered += 1;
        og_core::ppu_debug!(
            "Exception {:?} delivered, srr0=0x{:08x} vector=0x{:08x}",
            flag,
            srr0,
            state.pc
        );
    }
}

impl ExceptionController for PpcExceptions {
    fn raise(&mut self, state: &mut PpuState, kind: ExceptionKind) {
        match kind {
            ExceptionKind::Dsi { addr, store } => {
                state.dar = addr;
                state.dsisr = if store { 0x0A00_0000 } else { 0x0800_0000 };
            }
            ExceptionKind::Alignment { addr } => state.dar = addr,
            _ => {}
        }
        og_core::ppu_trace!("Raised {:?} at pc 0x{:08x}", kind, state.pc);
        state.exceptions.insert(kind.flag());
    }

    fn check_exceptions(&mut self, state: &mut PpuState) -> bool {
        let pending = state.exceptions;
        if pending.is_empty() {
            return false;
        }
        let pc = state.pc;

        // Synchronous exceptions, in architectural priority order
        let synchronous = [
            (ExceptionFlags::ISI, vectors::ISI, pc),
            (ExceptionFlags::PROGRAM, vectors::PROGRAM, pc),
            (ExceptionFlags::SYSCALL, vectors::SYSCALL, pc.wrapping_add(4)),
            (ExceptionFlags::FPU_UNAVAILABLE, vectors::FPU_UNAVAILABLE, pc),
            (ExceptionFlags::DSI, vectors::DSI, pc),
            (ExceptionFlags::ALIGNMENT, vectors::ALIGNMENT, pc),
        ];
        for (flag, vector, srr0) in synchronous {
            if pending.contains(flag) {
                self.enter(state, flag, vector, srr0);
                return true;
            }
        }

        if state.msr.contains(Msr::EE) {
            if pending.contains(ExceptionFlags::EXTERNAL_INT) {
                self.enter(state, ExceptionFlags::EXTERNAL_INT, vectors::EXTERNAL, pc);
                return true;
            }
            if pending.contains(ExceptionFlags::DECREMENTER) {
                self.enter(state, ExceptionFlags::DECREMENTER, vectors::DECREMENTER, pc);
                return true;
            }
        }
        false
    }

    fn delivered(&self) -> u64 {
        self.delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dsi_delivery() {
        let mut exc = PpcExceptions::new();
        let mut state = PpuState::new(0x8000_1000);
        state.msr = Msr::IR | Msr::DR | Msr::EE | Msr::FP;
        exc.raise(&mut state, ExceptionKind::Dsi { addr: 0x1234, store: true });
        assert_eq!(state.dar, 0x1234);
        assert!(exc.check_exceptions(&mut state));
        assert_eq!(state.pc, vectors::DSI);
        assert_eq!(state.srr0, 0x8000_1000);
        assert_eq!(state.srr1 & (Msr::IR | Msr::DR).bits(), (Msr::IR | Msr::DR).bits());
        assert!(!state.msr.contains(Msr::IR));
        assert!(!state.msr.contains(Msr::EE));
        assert!(state.exceptions.is_empty());
        assert_eq!(exc.delivered(), 1);
    }

    #[test]
    fn test_syscall_returns_past_sc() {
        let mut exc = PpcExceptions::new();
        let mut state = PpuState::new(0x100);
        exc.raise(&mut state, ExceptionKind::Syscall);
        assert!(exc.check_exceptions(&mut state));
        assert_eq!(state.srr0, 0x104);
        assert_eq!(state.pc, vectors::SYSCALL);
    }

    #[test]
    fn test_external_interrupt_waits_for_ee() {
        let mut exc = PpcExceptions::new();
        let mut state = PpuState::new(0x200);
        exc.raise(&mut state, ExceptionKind::External);
        assert!(!exc.check_exceptions(&mut state));
        assert_eq!(state.pc, 0x200);
        state.msr.insert(Msr::EE);
        assert!(exc.check_exceptions(&mut state));
        assert_eq!(state.pc, vectors::EXTERNAL);
    }

    #[test]
    fn test_exception_prefix() {
        let mut exc = PpcExceptions::new();
        let mut state = PpuState::new(0x200);
        state.msr = Msr::IP;
        exc.raise(&mut state, ExceptionKind::Program);
        assert!(exc.check_exceptions(&mut state));
        assert_eq!(state.pc, 0xFFF0_0700);
    }
}
