//! Block translation cache and execution engine for oxidized-gekko
//!
//! Guest code is split into blocks by the instruction analyzer and translated
//! into a host encoding that lives in a fixed pair of code regions. Translated
//! blocks are indexed by guest address and mode, linked directly to each other
//! where possible and invalidated when the guest rewrites its code. Loads and
//! stores start out on a fast path against the fastmem view and are patched
//! into slow-path trampolines the first time they fault.

pub mod backpatch;
pub mod block;
pub mod block_cache;
pub mod code_region;
pub mod dispatcher;
pub mod host;
pub mod invalidation;
pub mod jit;
pub mod translator;
pub mod trap;
pub mod watchpoint;

pub use backpatch::{BackpatchSite, BackpatchTable, SiteState};
pub use block::{BlockId, BlockKey, CodeBlock, ExitLink};
pub use block_cache::BlockCache;
pub use code_region::{CodeRegion, CodeSpace, HostAddr, HostRange, Reservation};
pub use dispatcher::{BreakpointSet, Dispatcher, RunOutcome, StopHandle};
pub use invalidation::{InvalidationQueue, InvalidationRequest, JitControl};
pub use jit::{Jit, JitStats};
pub use translator::{create_backend, BlockExit, DebugChecks, JitBackend};
pub use trap::{HostContext, HostFault, TrapDispatcher, TrapHandler, TrapOutcome};
pub use watchpoint::{WatchKind, Watchpoint, WatchpointSet};
