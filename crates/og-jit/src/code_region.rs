//! Executable code regions and their free-space allocator
//!
//! A [`CodeRegion`] is a fixed-size arena of host code bytes. Free space is kept
//! as a set of disjoint ranges indexed both by start address (to merge neighbours
//! on release) and by size (for best-fit allocation). Because the exact size of a
//! translation is only known once emission is finished, allocation hands out a
//! [`Reservation`] covering a whole free range; [`CodeRegion::commit`] then keeps
//! the bytes actually written and returns the tail to the free set.
//!
//! The near region holds block code, the far region holds trampolines. Together
//! they form a [`CodeSpace`] with one flat, disjoint host address space.

use std::collections::{BTreeMap, BTreeSet};

use og_core::error::JitError;

/// Address in the flat host code space
pub type HostAddr = u32;

/// Half-open range of host code bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostRange {
    pub start: HostAddr,
    pub end: HostAddr,
}

impl HostRange {
    pub fn new(start: HostAddr, end: HostAddr) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u32 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, addr: HostAddr) -> bool {
        addr >= self.start && addr < self.end
    }

    pub fn overlaps(&self, other: &HostRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Disjoint free ranges of one region
#[derive(Debug, Clone)]
pub struct FreeRanges {
    span: HostRange,
    by_start: BTreeMap<HostAddr, HostAddr>,
    by_size: BTreeSet<(u32, HostAddr)>,
}

impl FreeRanges {
    pub fn new(span: HostRange) -> Self {
        let mut ranges = Self {
            span,
            by_start: BTreeMap::new(),
            by_size: BTreeSet::new(),
        };
        ranges.reset();
        ranges
    }

    /// Make the whole span one free range again
    pub fn reset(&mut self) {
        self.by_start.clear();
        self.by_size.clear();
        if !self.span.is_empty() {
            self.insert_raw(self.span);
        }
    }

    fn insert_raw(&mut self, range: HostRange) {
        self.by_start.insert(range.start, range.end);
        self.by_size.insert((range.len(), range.start));
    }

    fn remove_raw(&mut self, range: HostRange) {
        self.by_start.remove(&range.start);
        self.by_size.remove(&(range.len(), range.start));
    }

    /// Smallest free range of at least `min_len` bytes (lowest address on ties)
    pub fn best_fit(&self, min_len: u32) -> Option<HostRange> {
        self.by_size
            .range((min_len, 0)..)
            .next()
            .map(|&(len, start)| HostRange::new(start, start + len))
    }

    /// Remove a range previously returned by [`FreeRanges::best_fit`]
    pub fn take(&mut self, range: HostRange) {
        self.remove_raw(range);
    }

    /// Return a range to the free set, merging with adjacent free neighbours
    pub fn release(&mut self, range: HostRange) -> Result<(), JitError> {
        if range.is_empty() {
            return Ok(());
        }
        if range.start < self.span.start || range.end > self.span.end {
            return Err(JitError::CacheInvariantViolation(format!(
                "release of {:#x}..{:#x} outside region {:#x}..{:#x}",
                range.start, range.end, self.span.start, self.span.end
            )));
        }

        let mut merged = range;
        let before = self
            .by_start
            .range(..=range.start)
            .next_back()
            .map(|(&s, &e)| HostRange::new(s, e));
        if let Some(prev) = before {
            if prev.overlaps(&range) {
                return Err(double_release(range, prev));
            }
            if prev.end == range.start {
                self.remove_raw(prev);
                merged.start = prev.start;
            }
        }
        let after = self
            .by_start
            .range(range.start..)
            .next()
            .map(|(&s, &e)| HostRange::new(s, e));
        if let Some(next) = after {
            if next.overlaps(&range) {
                return Err(double_release(range, next));
            }
            if next.start == range.end {
                self.remove_raw(next);
                merged.end = next.end;
            }
        }
        self.insert_raw(merged);
        Ok(())
    }

    pub fn total_free(&self) -> u64 {
        self.by_size.iter().map(|&(len, _)| len as u64).sum()
    }

    pub fn largest(&self) -> u32 {
        self.by_size.iter().next_back().map_or(0, |&(len, _)| len)
    }

    pub fn count(&self) -> usize {
        self.by_start.len()
    }

    /// Free ranges in address order
    pub fn iter(&self) -> impl Iterator<Item = HostRange> + '_ {
        self.by_start.iter().map(|(&s, &e)| HostRange::new(s, e))
    }
}

fn double_release(range: HostRange, free: HostRange) -> JitError {
    debug_assert!(false, "double release of code range {:?} (free {:?})", range, free);
    JitError::CacheInvariantViolation(format!(
        "release of {:#x}..{:#x} overlaps free range {:#x}..{:#x}",
        range.start, range.end, free.start, free.end
    ))
}

/// An uncommitted allocation: the whole free range chosen by best fit
#[derive(Debug)]
#[must_use = "a reservation must be committed or aborted"]
pub struct Reservation {
    range: HostRange,
}

impl Reservation {
    /// First byte the emitter may write
    pub fn start(&self) -> HostAddr {
        self.range.start
    }

    /// Bytes available to the emitter
    pub fn capacity(&self) -> usize {
        self.range.len() as usize
    }
}

/// Fixed-size arena of host code with a free-space allocator
pub struct CodeRegion {
    name: &'static str,
    span: HostRange,
    bytes: Vec<u8>,
    free: FreeRanges,
}

/// Filler written over dead code; executing it is an internal error
pub const TRAP_FILL: u8 = 0xCC;

impl CodeRegion {
    pub fn new(name: &'static str, base: HostAddr, size: u32) -> Self {
        let span = HostRange::new(base, base + size);
        Self {
            name,
            span,
            bytes: vec![TRAP_FILL; size as usize],
            free: FreeRanges::new(span),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn span(&self) -> HostRange {
        self.span
    }

    pub fn size(&self) -> u32 {
        self.span.len()
    }

    pub fn contains(&self, addr: HostAddr) -> bool {
        self.span.contains(addr)
    }

    pub fn free_ranges(&self) -> &FreeRanges {
        &self.free
    }

    /// Forget every allocation
    pub fn reset(&mut self) {
        self.free.reset();
    }

    /// Reserve the best-fit free range of at least `max_size` bytes
    pub fn allocate(&mut self, max_size: usize) -> Result<Reservation, JitError> {
        let wanted = u32::try_from(max_size).unwrap_or(u32::MAX).max(1);
        match self.free.best_fit(wanted) {
            Some(range) => {
                self.free.take(range);
                Ok(Reservation { range })
            }
            None => Err(JitError::OutOfCodeSpace {
                requested: max_size,
                largest_free: self.free.largest() as usize,
            }),
        }
    }

    /// Keep the first `used` bytes of a reservation and free the rest
    pub fn commit(&mut self, reservation: Reservation, used: usize) -> Result<HostRange, JitError> {
        let range = reservation.range;
        if used > range.len() as usize {
            self.free.release(range)?;
            return Err(JitError::OutOfCodeSpace {
                requested: used,
                largest_free: self.free.largest() as usize,
            });
        }
        let split = range.start + used as u32;
        self.free.release(HostRange::new(split, range.end))?;
        Ok(HostRange::new(range.start, split))
    }

    /// Give a reservation back untouched
    pub fn abort(&mut self, reservation: Reservation) -> Result<(), JitError> {
        self.free.release(reservation.range)
    }

    /// Return a committed range
    pub fn release(&mut self, range: HostRange) -> Result<(), JitError> {
        self.free.release(range)
    }

    /// Fraction of the region not free
    pub fn occupancy(&self) -> f64 {
        if self.span.is_empty() {
            return 1.0;
        }
        1.0 - self.free.total_free() as f64 / self.span.len() as f64
    }

    pub fn largest_free(&self) -> u32 {
        self.free.largest()
    }

    /// High-water check used to decide on a whole-cache flush
    pub fn is_almost_full(&self, threshold: f64) -> bool {
        self.occupancy() >= threshold
    }

    fn offset(&self, addr: HostAddr, len: usize) -> Option<usize> {
        let offset = addr.checked_sub(self.span.start)? as usize;
        (offset + len <= self.bytes.len()).then_some(offset)
    }

    /// Bytes from `addr` to the end of the region
    pub fn bytes_from(&self, addr: HostAddr) -> Option<&[u8]> {
        let offset = self.offset(addr, 0)?;
        Some(&self.bytes[offset..])
    }

    pub fn read(&self, range: HostRange) -> Option<&[u8]> {
        let offset = self.offset(range.start, range.len() as usize)?;
        Some(&self.bytes[offset..offset + range.len() as usize])
    }

    pub fn write(&mut self, addr: HostAddr, data: &[u8]) -> Result<(), JitError> {
        let offset = self.offset(addr, data.len()).ok_or_else(|| {
            JitError::CacheInvariantViolation(format!(
                "write of {} bytes at {:#x} outside {} region",
                data.len(),
                addr,
                self.name
            ))
        })?;
        self.bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn fill(&mut self, range: HostRange, byte: u8) -> Result<(), JitError> {
        let offset = self.offset(range.start, range.len() as usize).ok_or_else(|| {
            JitError::CacheInvariantViolation(format!("fill of {:?} outside {} region", range, self.name))
        })?;
        self.bytes[offset..offset + range.len() as usize].fill(byte);
        Ok(())
    }
}

/// Near (block) and far (trampoline) regions sharing one host address space
pub struct CodeSpace {
    pub near: CodeRegion,
    pub far: CodeRegion,
}

impl CodeSpace {
    pub fn new(near_size: u32, far_size: u32) -> Self {
        Self {
            near: CodeRegion::new("near", 0, near_size),
            far: CodeRegion::new("far", near_size, far_size),
        }
    }

    pub fn reset(&mut self) {
        self.near.reset();
        self.far.reset();
    }

    pub fn region(&self, addr: HostAddr) -> Option<&CodeRegion> {
        if self.near.contains(addr) {
            Some(&self.near)
        } else if self.far.contains(addr) {
            Some(&self.far)
        } else {
            None
        }
    }

    pub fn region_mut(&mut self, addr: HostAddr) -> Option<&mut CodeRegion> {
        if self.near.contains(addr) {
            Some(&mut self.near)
        } else if self.far.contains(addr) {
            Some(&mut self.far)
        } else {
            None
        }
    }

    /// Bytes from `addr` to the end of its region
    pub fn bytes_from(&self, addr: HostAddr) -> Option<&[u8]> {
        self.region(addr)?.bytes_from(addr)
    }

    pub fn read(&self, range: HostRange) -> Option<&[u8]> {
        self.region(range.start)?.read(range)
    }

    pub fn write(&mut self, addr: HostAddr, data: &[u8]) -> Result<(), JitError> {
        match self.region_mut(addr) {
            Some(region) => region.write(addr, data),
            None => Err(JitError::CacheInvariantViolation(format!(
                "write at {:#x} outside the code space",
                addr
            ))),
        }
    }
}
