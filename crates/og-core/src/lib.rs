//! Core infrastructure for oxidized-gekko
//!
//! Configuration, error types and logging shared by every crate in the workspace.

pub mod config;
pub mod error;
pub mod logging;

pub use config::{Config, CpuBackend, JitConfig, LogLevel};
pub use error::{EmulatorError, JitError, MemoryError, PpuError, Result};
