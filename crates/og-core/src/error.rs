//! Error types for oxidized-gekko

use thiserror::Error;

/// Top-level emulator error
#[derive(Error, Debug)]
pub enum EmulatorError {
    #[error("JIT error: {0}")]
    Jit(#[from] JitError),

    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("PPU error: {0}")]
    Ppu(#[from] PpuError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Translation cache and execution engine errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JitError {
    /// No free range in a code region is large enough for a reservation
    #[error("out of code space: requested {requested} bytes, largest free range is {largest_free}")]
    OutOfCodeSpace { requested: usize, largest_free: usize },

    /// The guest instruction fetch at `addr` could not be translated
    #[error("instruction fetch at 0x{addr:08x} is not translatable")]
    TranslationFault { addr: u32 },

    /// A guest load/store hit unmapped or protected memory
    #[error("guest memory fault at 0x{addr:08x} (pc 0x{pc:08x})")]
    GuestMemoryFault { addr: u32, pc: u32 },

    /// A host fault did not land inside any recorded access site
    #[error("host fault at 0x{host:08x} matches no backpatch site")]
    BackpatchSiteMismatch { host: u32 },

    /// Internal bookkeeping is inconsistent
    #[error("cache invariant violated: {0}")]
    CacheInvariantViolation(String),
}

/// Guest memory errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("unmapped address 0x{0:08x}")]
    Unmapped(u32),

    #[error("access violation at 0x{addr:08x}")]
    AccessViolation { addr: u32 },

    #[error("region 0x{base:08x}+0x{size:x} overlaps an existing mapping")]
    RegionOverlap { base: u32, size: u32 },

    #[error("invalid region 0x{base:08x}+0x{size:x}")]
    InvalidRegion { base: u32, size: u32 },

    #[error("write to read-only address 0x{0:08x}")]
    ReadOnly(u32),
}

/// Guest CPU errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PpuError {
    #[error("invalid instruction at 0x{addr:08x}: 0x{opcode:08x}")]
    InvalidInstruction { addr: u32, opcode: u32 },

    #[error("instruction fetch failed at 0x{addr:08x}")]
    FetchFailed { addr: u32 },
}

/// Result type alias
pub type Result<T> = std::result::Result<T, EmulatorError>;
