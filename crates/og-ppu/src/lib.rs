//! Gekko (PowerPC 750CL) CPU collaborators for oxidized-gekko
//!
//! The translation engine consumes the guest CPU through narrow interfaces:
//! [`InstructionAnalyzer`] to split code into blocks, [`Semantics`] for
//! per-instruction effects, [`ExceptionController`] to deliver exceptions and
//! [`TimingService`] to hand out scheduling quanta. This crate defines those
//! interfaces together with the guest state and reference implementations.

pub mod access;
pub mod analyzer;
pub mod decoder;
pub mod exceptions;
pub mod interpreter;
pub mod state;
pub mod timing;

pub use access::{AccessOffset, AccessPath, AccessTarget, MemAccess};
pub use analyzer::{AnalyzedBlock, AnalyzedInstruction, InstructionAnalyzer, InstructionFlags, PpuAnalyzer};
pub use decoder::PpuDecoder;
pub use exceptions::{ExceptionController, ExceptionFlags, ExceptionKind, PpcExceptions};
pub use interpreter::{PpuInterpreter, Semantics, Step};
pub use state::{Msr, PpuState, RunState};
pub use timing::{CoreTiming, TimedEvent, TimingService};
