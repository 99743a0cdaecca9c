//! Debugging tools for oxidized-gekko
//!
//! This crate provides the control surface of the block cache:
//! - execution breakpoints that force retranslation of affected blocks
//! - read, write and access watchpoints
//! - a Gekko disassembler for guest listings
//! - block inspection, erase and clear on a stopped dispatcher

pub mod breakpoint;
pub mod disassembler;
pub mod jit_debugger;

pub use breakpoint::{Breakpoint, BreakpointManager, BreakpointType};
pub use disassembler::{DisassembledInstruction, PpcDisassembler};
pub use jit_debugger::{BlockListing, BlockSummary, JitDebugger};
