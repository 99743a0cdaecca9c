//! Guest memory bus
//!
//! [`MemoryBus`] combines the fastmem arena with MMIO devices and tracks which
//! physical pages hold translated code. It offers two families of accessors:
//!
//! - `read_fast` / `write_fast`: direct indexing into the arena views. Any page
//!   that is not present in a view faults with `AccessViolation`.
//! - `read` / `write`: the slow path. Performs address translation, permission
//!   checks, MMIO dispatch, unaligned and page-crossing accesses, and records
//!   writes that land on watched code pages.

use std::collections::HashSet;

use og_core::error::MemoryError;

use crate::constants::*;
use crate::fastmem::{read_be, write_be, FastmemArena};
use crate::mmio::MmioDevice;
use crate::pages::{AccessSize, AddressSpace, PageFlags};

struct MmioMapping {
    base: u32,
    size: u32,
    device: Box<dyn MmioDevice>,
}

/// A guest write that touched a watched code page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeWrite {
    /// Physical address of the first byte written
    pub addr: u32,
    pub len: u32,
}

/// Guest memory with fast and slow accessors
pub struct MemoryBus {
    arena: FastmemArena,
    mmio: Vec<MmioMapping>,
    protected: HashSet<u32>,
    code_pages: HashSet<u32>,
    code_writes: Vec<CodeWrite>,
}

impl MemoryBus {
    /// Create a bus with no RAM mapped
    pub fn empty() -> Self {
        Self {
            arena: FastmemArena::new(),
            mmio: Vec::new(),
            protected: HashSet::new(),
            code_pages: HashSet::new(),
            code_writes: Vec::new(),
        }
    }

    /// Create a bus with MEM1 and MEM2 mapped
    pub fn new() -> Result<Self, MemoryError> {
        let mut bus = Self::empty();
        bus.map_ram(MEM1_BASE, MEM1_SIZE, PageFlags::RWX)?;
        bus.map_ram(MEM2_BASE, MEM2_SIZE, PageFlags::RWX)?;
        Ok(bus)
    }

    /// Map a RAM region
    pub fn map_ram(&mut self, base: u32, size: u32, flags: PageFlags) -> Result<(), MemoryError> {
        if self.mmio_at(base, size).is_some() {
            return Err(MemoryError::RegionOverlap { base, size });
        }
        self.arena.map_region(base, size, flags)
    }

    /// Attach an MMIO device to a physical window; MMIO is never reachable on the fast path
    pub fn map_mmio(
        &mut self,
        base: u32,
        size: u32,
        device: Box<dyn MmioDevice>,
    ) -> Result<(), MemoryError> {
        if size == 0 || base.checked_add(size - 1).is_none() {
            return Err(MemoryError::InvalidRegion { base, size });
        }
        let overlaps_ram = self.arena.regions().iter().any(|r| {
            (base as u64) < r.base as u64 + r.size as u64
                && base as u64 + size as u64 > r.base as u64
        });
        if overlaps_ram || self.mmio_at(base, size).is_some() {
            return Err(MemoryError::RegionOverlap { base, size });
        }
        tracing::debug!(target: "mem", "Mapped MMIO {} at 0x{:08x}+0x{:x}", device.name(), base, size);
        self.mmio.push(MmioMapping { base, size, device });
        Ok(())
    }

    fn mmio_at(&self, addr: u32, len: u32) -> Option<usize> {
        let end = addr as u64 + len as u64;
        self.mmio
            .iter()
            .position(|m| (addr as u64) < m.base as u64 + m.size as u64 && end > m.base as u64)
    }

    /// The underlying arena
    pub fn arena(&self) -> &FastmemArena {
        &self.arena
    }

    /// Translate an effective address to a physical address
    #[inline]
    pub fn translate(&self, space: AddressSpace, addr: u32) -> Result<u32, MemoryError> {
        match space {
            AddressSpace::Physical => Ok(addr),
            AddressSpace::Logical if addr >= LOGICAL_CACHED_BASE => Ok(addr & LOGICAL_MIRROR_MASK),
            AddressSpace::Logical => Err(MemoryError::Unmapped(addr)),
        }
    }

    /// Fast-path load; faults on anything that is not plain, present RAM
    #[inline]
    pub fn read_fast(&self, space: AddressSpace, addr: u32, size: AccessSize) -> Result<u64, MemoryError> {
        let phys = self
            .translate(space, addr)
            .map_err(|_| MemoryError::AccessViolation { addr })?;
        self.arena
            .read_fast(phys, size)
            .map_err(|_| MemoryError::AccessViolation { addr })
    }

    /// Fast-path store; faults on anything that is not plain, present, unwatched RAM
    #[inline]
    pub fn write_fast(
        &mut self,
        space: AddressSpace,
        addr: u32,
        size: AccessSize,
        value: u64,
    ) -> Result<(), MemoryError> {
        let phys = self
            .translate(space, addr)
            .map_err(|_| MemoryError::AccessViolation { addr })?;
        self.arena
            .write_fast(phys, size, value)
            .map_err(|_| MemoryError::AccessViolation { addr })
    }

    /// Slow-path load
    pub fn read(&mut self, space: AddressSpace, addr: u32, size: AccessSize) -> Result<u64, MemoryError> {
        let phys = self.translate(space, addr)?;
        let len = size.bytes();
        if let Some(index) = self.mmio_at(phys, len) {
            let mapping = &mut self.mmio[index];
            return Ok(mapping.device.read(phys - mapping.base, size) & size.mask());
        }
        match self.arena.region_for(phys, len) {
            Some(region) if !region.flags.contains(PageFlags::READ) => {
                Err(MemoryError::AccessViolation { addr })
            }
            Some(_) => self
                .arena
                .ram(phys, len)
                .map(read_be)
                .ok_or(MemoryError::Unmapped(addr)),
            None => Err(MemoryError::Unmapped(addr)),
        }
    }

    /// Slow-path store
    pub fn write(
        &mut self,
        space: AddressSpace,
        addr: u32,
        size: AccessSize,
        value: u64,
    ) -> Result<(), MemoryError> {
        let phys = self.translate(space, addr)?;
        let len = size.bytes();
        if let Some(index) = self.mmio_at(phys, len) {
            let mapping = &mut self.mmio[index];
            mapping.device.write(phys - mapping.base, size, value & size.mask());
            return Ok(());
        }
        let writable = match self.arena.region_for(phys, len) {
            Some(region) => region.flags.contains(PageFlags::WRITE),
            None => return Err(MemoryError::Unmapped(addr)),
        };
        if !writable {
            return Err(MemoryError::ReadOnly(addr));
        }
        let bytes = self.arena.ram_mut(phys, len).ok_or(MemoryError::Unmapped(addr))?;
        write_be(bytes, value);
        self.note_write(phys, len);
        Ok(())
    }

    /// Instruction fetch through the slow path
    pub fn fetch(&self, space: AddressSpace, addr: u32) -> Result<u32, MemoryError> {
        let phys = self.translate(space, addr)?;
        match self.arena.region_for(phys, 4) {
            Some(region) if region.flags.contains(PageFlags::EXECUTE) => self
                .arena
                .ram(phys, 4)
                .map(|b| read_be(b) as u32)
                .ok_or(MemoryError::Unmapped(addr)),
            Some(_) => Err(MemoryError::AccessViolation { addr }),
            None => Err(MemoryError::Unmapped(addr)),
        }
    }

    /// Host-side write of raw bytes at a physical address (loaders, debugger pokes)
    pub fn write_bytes(&mut self, phys: u32, data: &[u8]) -> Result<(), MemoryError> {
        let len = data.len() as u32;
        let bytes = self.arena.ram_mut(phys, len).ok_or(MemoryError::Unmapped(phys))?;
        bytes.copy_from_slice(data);
        self.note_write(phys, len);
        Ok(())
    }

    /// Host-side read of raw bytes at a physical address
    pub fn read_bytes(&self, phys: u32, len: u32) -> Result<Vec<u8>, MemoryError> {
        self.arena
            .ram(phys, len)
            .map(<[u8]>::to_vec)
            .ok_or(MemoryError::Unmapped(phys))
    }

    /// Store a sequence of big-endian instruction words at a physical address
    pub fn load_program(&mut self, phys: u32, words: &[u32]) -> Result<(), MemoryError> {
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_be_bytes()).collect();
        self.write_bytes(phys, &bytes)
    }

    /// Withdraw physical pages from the fast path without unmapping them
    pub fn protect_fastmem(&mut self, phys: u32, len: u32) {
        for page in page_span(phys, len) {
            self.protected.insert(page);
            self.refresh_page(page);
        }
    }

    /// Return protected pages to the fast path
    pub fn unprotect_fastmem(&mut self, phys: u32, len: u32) {
        for page in page_span(phys, len) {
            self.protected.remove(&page);
            self.refresh_page(page);
        }
    }

    /// Start tracking writes to physical pages holding translated code
    ///
    /// Watched pages leave the fast write view, so every store to them takes the
    /// slow path and is recorded.
    pub fn watch_code(&mut self, phys: u32, len: u32) {
        for page in page_span(phys, len) {
            if self.code_pages.insert(page) {
                self.refresh_page(page);
            }
        }
    }

    /// Stop tracking all code pages
    pub fn clear_code_watch(&mut self) {
        let pages: Vec<u32> = self.code_pages.drain().collect();
        for page in pages {
            self.refresh_page(page);
        }
        self.code_writes.clear();
    }

    /// Whether a physical address lies on a watched code page
    pub fn is_code_page(&self, phys: u32) -> bool {
        self.code_pages.contains(&(phys >> PAGE_SHIFT))
    }

    /// Whether any code write is waiting to be consumed
    pub fn has_code_writes(&self) -> bool {
        !self.code_writes.is_empty()
    }

    /// Consume the recorded code writes
    pub fn take_code_writes(&mut self) -> Vec<CodeWrite> {
        std::mem::take(&mut self.code_writes)
    }

    fn note_write(&mut self, phys: u32, len: u32) {
        if page_span(phys, len).any(|page| self.code_pages.contains(&page)) {
            og_core::mem_trace!("Code write at 0x{:08x} ({} bytes)", phys, len);
            self.code_writes.push(CodeWrite { addr: phys, len });
        }
    }

    fn refresh_page(&mut self, page: u32) {
        let protected = self.protected.contains(&page);
        let code = self.code_pages.contains(&page);
        self.arena.restore_page(page, !protected, !protected && !code);
    }
}

fn page_span(phys: u32, len: u32) -> impl Iterator<Item = u32> {
    let first = phys >> PAGE_SHIFT;
    let last = (phys as u64 + len.max(1) as u64 - 1).min(u32::MAX as u64) as u32 >> PAGE_SHIFT;
    first..=last
}
