//! Guest memory for oxidized-gekko
//!
//! Guest RAM is exposed as one contiguous, partially unbacked view so translated
//! code can index it directly. Anything the fast view cannot serve (MMIO, pages
//! withdrawn for protection or code watching, page-crossing accesses) faults and
//! is completed through the slow accessors on [`MemoryBus`].

pub mod bus;
pub mod constants;
pub mod fastmem;
pub mod mmio;
pub mod pages;

pub use bus::{CodeWrite, MemoryBus};
pub use fastmem::{FastmemArena, RamRegion, View};
pub use mmio::{MmioDevice, RegisterBank};
pub use pages::{AccessSize, AddressSpace, PageFlags};
