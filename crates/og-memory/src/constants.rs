//! Gekko memory map constants

/// MEM1 (main RAM) physical base address
pub const MEM1_BASE: u32 = 0x0000_0000;
/// MEM1 size (24 MB)
pub const MEM1_SIZE: u32 = 0x0180_0000;

/// MEM2 (extended RAM) physical base address
pub const MEM2_BASE: u32 = 0x1000_0000;
/// MEM2 size (64 MB)
pub const MEM2_SIZE: u32 = 0x0400_0000;

/// Hardware register (MMIO) physical base
pub const MMIO_BASE: u32 = 0x0C00_0000;
/// Hardware register window size
pub const MMIO_SIZE: u32 = 0x0001_0000;

/// Cached logical mirror of physical memory
pub const LOGICAL_CACHED_BASE: u32 = 0x8000_0000;
/// Uncached logical mirror of physical memory
pub const LOGICAL_UNCACHED_BASE: u32 = 0xC000_0000;
/// Mask applied to a mirrored logical address to obtain the physical address
pub const LOGICAL_MIRROR_MASK: u32 = 0x3FFF_FFFF;

/// Standard page size (4 KB)
pub const PAGE_SIZE: u32 = 0x1000;
/// log2(PAGE_SIZE)
pub const PAGE_SHIFT: u32 = 12;

/// Total address space size (4 GB, 32-bit)
pub const ADDRESS_SPACE_SIZE: usize = 0x1_0000_0000;

/// Number of pages in the address space
pub const NUM_PAGES: usize = ADDRESS_SPACE_SIZE / PAGE_SIZE as usize;
