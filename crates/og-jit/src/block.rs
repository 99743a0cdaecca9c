//! Translated block records

use crate::code_region::{HostAddr, HostRange};

/// Guest start address plus the mode key the block was translated under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockKey {
    pub address: u32,
    pub mode: u32,
}

impl BlockKey {
    pub fn new(address: u32, mode: u32) -> Self {
        Self { address, mode }
    }
}

/// Stable handle into the block cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub(crate) u32);

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Link site in a block's exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitLink {
    /// Guest destination
    pub target: u32,
    /// Host address of the rewritable slot
    pub slot: HostAddr,
    /// Entry currently written into the slot, if linked
    pub linked_to: Option<BlockId>,
}

impl ExitLink {
    pub fn is_linked(&self) -> bool {
        self.linked_to.is_some()
    }
}

/// One translated block
#[derive(Debug, Clone)]
pub struct CodeBlock {
    pub key: BlockKey,
    /// Guest bytes covered, starting at `key.address`
    pub guest_len: u32,
    pub physical_start: u32,
    pub entry: HostAddr,
    pub host_range: HostRange,
    pub exits: Vec<ExitLink>,
    /// Backpatch sites owned by the block
    pub sites: Vec<HostAddr>,
    pub instructions: u32,
    pub cycles: u32,
    /// Times the dispatcher entered the block
    pub dispatches: u64,
    /// Times the block ran, chained entries included
    pub runs: u64,
}

impl CodeBlock {
    pub fn guest_end(&self) -> u32 {
        self.key.address.wrapping_add(self.guest_len)
    }

    pub fn contains_guest(&self, address: u32) -> bool {
        address.wrapping_sub(self.key.address) < self.guest_len
    }

    /// Whether the block's physical source overlaps `[start, start + len)`
    pub fn overlaps_physical(&self, start: u32, len: u32) -> bool {
        let block_end = self.physical_start as u64 + self.guest_len as u64;
        let end = start as u64 + len as u64;
        (self.physical_start as u64) < end && (start as u64) < block_end
    }
}
