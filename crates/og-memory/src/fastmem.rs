//! Fastmem arena
//!
//! All guest RAM lives in one backing buffer. Two page tables (a read view and a
//! write view) map every physical page of the 32-bit space either to a backing page
//! or to nothing. Translated code indexes these views directly; a page that is not
//! present in a view produces [`MemoryError::AccessViolation`], which is the host
//! fault the backpatch machinery reacts to. Pages can be withdrawn from a view
//! without unmapping the RAM behind them, which is how MMIO holes, protected pages
//! and write-watched code pages are kept off the fast path.

use og_core::error::MemoryError;

use crate::constants::{NUM_PAGES, PAGE_SHIFT, PAGE_SIZE};
use crate::pages::{AccessSize, PageFlags};

/// View entry for a page with no backing in that view
const UNBACKED: u32 = u32::MAX;

/// A block of guest RAM mapped at a fixed physical address
#[derive(Debug, Clone)]
pub struct RamRegion {
    pub base: u32,
    pub size: u32,
    pub flags: PageFlags,
    offset: usize,
}

impl RamRegion {
    /// Whether `[addr, addr + len)` lies entirely inside this region
    pub fn contains(&self, addr: u32, len: u32) -> bool {
        let end = addr as u64 + len as u64;
        addr >= self.base && end <= self.base as u64 + self.size as u64
    }
}

/// Which of the two page tables to consult
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum View {
    Read,
    Write,
}

/// Contiguous, partially unbacked guest memory view
pub struct FastmemArena {
    backing: Vec<u8>,
    regions: Vec<RamRegion>,
    read_view: Box<[u32]>,
    write_view: Box<[u32]>,
}

impl FastmemArena {
    /// Create an arena with no RAM mapped
    pub fn new() -> Self {
        Self {
            backing: Vec::new(),
            regions: Vec::new(),
            read_view: vec![UNBACKED; NUM_PAGES].into_boxed_slice(),
            write_view: vec![UNBACKED; NUM_PAGES].into_boxed_slice(),
        }
    }

    /// Map a RAM region at a page-aligned physical address
    pub fn map_region(&mut self, base: u32, size: u32, flags: PageFlags) -> Result<(), MemoryError> {
        if size == 0
            || base % PAGE_SIZE != 0
            || size % PAGE_SIZE != 0
            || base.checked_add(size - 1).is_none()
        {
            return Err(MemoryError::InvalidRegion { base, size });
        }
        let end = base as u64 + size as u64;
        if self
            .regions
            .iter()
            .any(|r| (base as u64) < r.base as u64 + r.size as u64 && end > r.base as u64)
        {
            return Err(MemoryError::RegionOverlap { base, size });
        }

        let offset = self.backing.len();
        self.backing.resize(offset + size as usize, 0);
        self.regions.push(RamRegion {
            base,
            size,
            flags,
            offset,
        });

        let first_page = base >> PAGE_SHIFT;
        for i in 0..(size >> PAGE_SHIFT) {
            self.restore_page(first_page + i, true, true);
        }
        tracing::debug!(target: "mem", "Mapped RAM 0x{:08x}+0x{:x} ({:?})", base, size, flags);
        Ok(())
    }

    /// All mapped regions
    pub fn regions(&self) -> &[RamRegion] {
        &self.regions
    }

    /// Region containing `[addr, addr + len)`, if one does
    pub fn region_for(&self, addr: u32, len: u32) -> Option<&RamRegion> {
        self.regions.iter().find(|r| r.contains(addr, len))
    }

    /// Whether the physical page is backed by RAM at all
    pub fn is_ram_page(&self, page: u32) -> bool {
        self.region_for(page << PAGE_SHIFT, 1).is_some()
    }

    /// Recompute a page's view entries from its region, limited by `allow_read` / `allow_write`
    pub fn restore_page(&mut self, page: u32, allow_read: bool, allow_write: bool) {
        let addr = page << PAGE_SHIFT;
        let (read, write) = match self.region_for(addr, 1) {
            Some(region) => {
                let backing_page = ((region.offset + (addr - region.base) as usize)
                    >> PAGE_SHIFT) as u32;
                let read = if allow_read && region.flags.contains(PageFlags::READ) {
                    backing_page
                } else {
                    UNBACKED
                };
                let write = if allow_write && region.flags.contains(PageFlags::WRITE) {
                    backing_page
                } else {
                    UNBACKED
                };
                (read, write)
            }
            None => (UNBACKED, UNBACKED),
        };
        self.read_view[page as usize] = read;
        self.write_view[page as usize] = write;
    }

    /// Whether a page is present in a view
    pub fn is_fast(&self, view: View, page: u32) -> bool {
        self.table(view)[page as usize] != UNBACKED
    }

    fn table(&self, view: View) -> &[u32] {
        match view {
            View::Read => &self.read_view,
            View::Write => &self.write_view,
        }
    }

    /// Backing offset for a direct access; accesses crossing a page boundary always miss
    fn fast_offset(&self, view: View, addr: u32, len: u32) -> Result<usize, MemoryError> {
        let page = addr >> PAGE_SHIFT;
        let in_page = addr & (PAGE_SIZE - 1);
        if in_page + len > PAGE_SIZE {
            return Err(MemoryError::AccessViolation { addr });
        }
        match self.table(view)[page as usize] {
            UNBACKED => Err(MemoryError::AccessViolation { addr }),
            backing_page => Ok(((backing_page as usize) << PAGE_SHIFT) + in_page as usize),
        }
    }

    /// Direct big-endian load through the read view
    #[inline]
    pub fn read_fast(&self, addr: u32, size: AccessSize) -> Result<u64, MemoryError> {
        let len = size.bytes();
        let offset = self.fast_offset(View::Read, addr, len)?;
        Ok(read_be(&self.backing[offset..offset + len as usize]))
    }

    /// Direct big-endian store through the write view
    #[inline]
    pub fn write_fast(&mut self, addr: u32, size: AccessSize, value: u64) -> Result<(), MemoryError> {
        let len = size.bytes();
        let offset = self.fast_offset(View::Write, addr, len)?;
        write_be(&mut self.backing[offset..offset + len as usize], value);
        Ok(())
    }

    /// RAM bytes for `[addr, addr + len)` ignoring the views; `None` outside a single region
    pub fn ram(&self, addr: u32, len: u32) -> Option<&[u8]> {
        let region = self.region_for(addr, len)?;
        let start = region.offset + (addr - region.base) as usize;
        Some(&self.backing[start..start + len as usize])
    }

    /// Mutable counterpart of [`FastmemArena::ram`]
    pub fn ram_mut(&mut self, addr: u32, len: u32) -> Option<&mut [u8]> {
        let region = self.region_for(addr, len)?;
        let start = region.offset + (addr - region.base) as usize;
        Some(&mut self.backing[start..start + len as usize])
    }
}

impl Default for FastmemArena {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode a big-endian value of `bytes.len()` bytes
#[inline]
pub(crate) fn read_be(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64)
}

/// Encode the low `bytes.len()` bytes of `value` big-endian
#[inline]
pub(crate) fn write_be(bytes: &mut [u8], value: u64) {
    let len = bytes.len();
    for (i, b) in bytes.iter_mut().enumerate() {
        *b = (value >> (8 * (len - 1 - i))) as u8;
    }
}
