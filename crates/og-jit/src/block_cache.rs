//! Block cache
//!
//! Maps `(guest address, mode)` to translated blocks and owns every auxiliary
//! index that must stay consistent with that map: incoming links by target key,
//! blocks by physical page (for invalidation) and blocks by host entry.
//!
//! Block handles are reserved before emission so link slots and backpatch sites
//! can name their owner; a reservation is either finalized or discarded.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use og_core::error::JitError;
use og_memory::constants::PAGE_SHIFT;

use crate::block::{BlockId, BlockKey, CodeBlock, ExitLink};
use crate::code_region::{CodeSpace, HostAddr, HostRange, TRAP_FILL};
use crate::host::{LINK_ENTRY_OFFSET, UNLINKED};

#[derive(Debug)]
enum Slot {
    Free,
    Reserved(BlockKey),
    Live(CodeBlock),
}

/// Translated block storage and lookup
#[derive(Debug)]
pub struct BlockCache {
    slots: Vec<Slot>,
    free_ids: Vec<BlockId>,
    map: HashMap<BlockKey, BlockId>,
    /// Blocks with an exit aimed at the key
    links_to: HashMap<BlockKey, BTreeSet<BlockId>>,
    /// Blocks whose physical source touches the page
    pages: HashMap<u32, BTreeSet<BlockId>>,
    by_entry: BTreeMap<HostAddr, BlockId>,
    linking: bool,
}

fn pages_of(start: u32, len: u32) -> impl Iterator<Item = u32> {
    let first = start >> PAGE_SHIFT;
    let last = (start as u64 + len.max(1) as u64 - 1) >> PAGE_SHIFT;
    first..=(last as u32)
}

impl BlockCache {
    pub fn new(linking: bool) -> Self {
        Self {
            slots: Vec::new(),
            free_ids: Vec::new(),
            map: HashMap::new(),
            links_to: HashMap::new(),
            pages: HashMap::new(),
            by_entry: BTreeMap::new(),
            linking,
        }
    }

    pub fn linking(&self) -> bool {
        self.linking
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    #[inline]
    pub fn lookup(&self, key: BlockKey) -> Option<BlockId> {
        self.map.get(&key).copied()
    }

    pub fn get(&self, id: BlockId) -> Option<&CodeBlock> {
        match self.slots.get(id.index()) {
            Some(Slot::Live(block)) => Some(block),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, id: BlockId) -> Option<&mut CodeBlock> {
        match self.slots.get_mut(id.index()) {
            Some(Slot::Live(block)) => Some(block),
            _ => None,
        }
    }

    /// Live blocks in handle order
    pub fn iter(&self) -> impl Iterator<Item = (BlockId, &CodeBlock)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| match slot {
            Slot::Live(block) => Some((BlockId(i as u32), block)),
            _ => None,
        })
    }

    /// Block whose host code contains `addr`
    pub fn find_by_host(&self, addr: HostAddr) -> Option<BlockId> {
        let (_, &id) = self.by_entry.range(..=addr).next_back()?;
        self.get(id)
            .filter(|block| block.host_range.contains(addr))
            .map(|_| id)
    }

    /// Block whose entry point is exactly `entry`
    #[inline]
    pub fn block_at_entry(&self, entry: HostAddr) -> Option<BlockId> {
        self.by_entry.get(&entry).copied()
    }

    /// Live blocks starting at `address` under any mode
    pub fn blocks_at(&self, address: u32) -> Vec<BlockId> {
        self.map
            .iter()
            .filter(|(key, _)| key.address == address)
            .map(|(_, &id)| id)
            .collect()
    }

    /// Live blocks whose guest range covers `address`
    pub fn blocks_containing(&self, address: u32) -> Vec<BlockId> {
        self.iter()
            .filter(|(_, block)| block.contains_guest(address))
            .map(|(id, _)| id)
            .collect()
    }

    /// Reserve a handle for a block about to be emitted
    pub fn allocate_block(&mut self, key: BlockKey) -> BlockId {
        match self.free_ids.pop() {
            Some(id) => {
                self.slots[id.index()] = Slot::Reserved(key);
                id
            }
            None => {
                self.slots.push(Slot::Reserved(key));
                BlockId(self.slots.len() as u32 - 1)
            }
        }
    }

    /// Drop a reservation whose emission failed
    pub fn discard(&mut self, id: BlockId) {
        if let Some(slot) = self.slots.get_mut(id.index()) {
            if matches!(slot, Slot::Reserved(_)) {
                *slot = Slot::Free;
                self.free_ids.push(id);
            }
        }
    }

    /// Publish a reserved block and link it with its neighbours in both directions
    pub fn finalize_block(
        &mut self,
        id: BlockId,
        mut block: CodeBlock,
        code: &mut CodeSpace,
    ) -> Result<(), JitError> {
        let key = match self.slots.get(id.index()) {
            Some(Slot::Reserved(key)) => *key,
            _ => {
                return Err(JitError::CacheInvariantViolation(format!(
                    "finalize of unreserved block handle {:?}",
                    id
                )))
            }
        };
        if key != block.key {
            return Err(JitError::CacheInvariantViolation(format!(
                "block {:?} reserved for {:08x} finalized as {:08x}",
                id, key.address, block.key.address
            )));
        }
        if let Some(existing) = self.map.get(&key) {
            return Err(JitError::CacheInvariantViolation(format!(
                "block {:08x} already live as {:?}",
                key.address, existing
            )));
        }

        if let Err(e) = self.link_outgoing(id, &mut block, code) {
            self.unregister_exits(id, key.mode, &block.exits);
            return Err(e);
        }

        for page in pages_of(block.physical_start, block.guest_len) {
            self.pages.entry(page).or_default().insert(id);
        }
        self.by_entry.insert(block.entry, id);
        let entry = block.entry;
        self.slots[id.index()] = Slot::Live(block);
        self.map.insert(key, id);

        // Incoming links, including a block that loops onto itself
        if self.linking {
            let sources: Vec<BlockId> = self
                .links_to
                .get(&key)
                .map(|s| s.iter().copied().collect())
                .unwrap_or_default();
            for source in sources {
                if let Some(Slot::Live(src)) = self.slots.get_mut(source.index()) {
                    for exit in src.exits.iter_mut().filter(|e| e.target == key.address) {
                        write_slot(code, exit.slot, entry)?;
                        exit.linked_to = Some(id);
                    }
                }
            }
        }

        og_core::jit_trace!(
            "Block {:08x} (mode {}) finalized at host {:#x}",
            key.address,
            key.mode,
            entry
        );
        Ok(())
    }

    fn link_outgoing(&mut self, id: BlockId, block: &mut CodeBlock, code: &mut CodeSpace) -> Result<(), JitError> {
        let mode = block.key.mode;
        for exit in &mut block.exits {
            let target = BlockKey::new(exit.target, mode);
            self.links_to.entry(target).or_default().insert(id);
            if self.linking {
                if let Some(target_id) = self.map.get(&target).copied() {
                    if let Some(entry) = self.get(target_id).map(|b| b.entry) {
                        write_slot(code, exit.slot, entry)?;
                        exit.linked_to = Some(target_id);
                    }
                }
            }
        }
        Ok(())
    }

    fn unregister_exits(&mut self, id: BlockId, mode: u32, exits: &[ExitLink]) {
        for exit in exits {
            let target = BlockKey::new(exit.target, mode);
            if let Some(set) = self.links_to.get_mut(&target) {
                set.remove(&id);
                if set.is_empty() {
                    self.links_to.remove(&target);
                }
            }
        }
    }

    /// Remove a live block: unlink incoming jumps, fill its code with traps and free it.
    /// Returns the removed record so the caller can drop its backpatch sites.
    pub fn erase_block(&mut self, id: BlockId, code: &mut CodeSpace) -> Result<Option<CodeBlock>, JitError> {
        let block = match self.slots.get_mut(id.index()) {
            Some(slot) if matches!(slot, Slot::Live(_)) => match std::mem::replace(slot, Slot::Free) {
                Slot::Live(block) => block,
                _ => return Ok(None),
            },
            _ => return Ok(None),
        };
        self.free_ids.push(id);
        let key = block.key;
        self.map.remove(&key);
        self.by_entry.remove(&block.entry);
        for page in pages_of(block.physical_start, block.guest_len) {
            if let Some(set) = self.pages.get_mut(&page) {
                set.remove(&id);
                if set.is_empty() {
                    self.pages.remove(&page);
                }
            }
        }

        self.unregister_exits(id, key.mode, &block.exits);

        // Incoming sources stay registered so a retranslation relinks them
        let sources: Vec<BlockId> = self
            .links_to
            .get(&key)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        for source in sources {
            if let Some(Slot::Live(src)) = self.slots.get_mut(source.index()) {
                for exit in src.exits.iter_mut().filter(|e| e.linked_to == Some(id)) {
                    write_slot(code, exit.slot, UNLINKED)?;
                    exit.linked_to = None;
                }
            }
        }

        code.near.fill(block.host_range, TRAP_FILL)?;
        code.near.release(block.host_range)?;
        og_core::jit_trace!("Block {:08x} (mode {}) erased", key.address, key.mode);
        Ok(Some(block))
    }

    /// Erase every block whose physical source overlaps `[start, start + len)`
    pub fn invalidate_range(
        &mut self,
        start: u32,
        len: u32,
        code: &mut CodeSpace,
    ) -> Result<Vec<(BlockId, CodeBlock)>, JitError> {
        let mut victims = BTreeSet::new();
        for page in pages_of(start, len) {
            if let Some(set) = self.pages.get(&page) {
                for &id in set {
                    if self.get(id).is_some_and(|b| b.overlaps_physical(start, len)) {
                        victims.insert(id);
                    }
                }
            }
        }
        let mut erased = Vec::with_capacity(victims.len());
        for id in victims {
            if let Some(block) = self.erase_block(id, code)? {
                erased.push((id, block));
            }
        }
        Ok(erased)
    }

    /// Forget every block. Host code is not touched; the caller resets the regions.
    pub fn clear(&mut self) {
        let linking = self.linking;
        *self = Self::new(linking);
    }

    /// Verify that every index agrees with the block map
    pub fn check_invariants(&self, code: &CodeSpace) -> Result<(), JitError> {
        let violation = |msg: String| Err(JitError::CacheInvariantViolation(msg));

        for (key, &id) in &self.map {
            let Some(block) = self.get(id) else {
                return violation(format!("map entry {:08x} points at dead handle {:?}", key.address, id));
            };
            if block.key != *key {
                return violation(format!("map entry {:08x} holds block {:08x}", key.address, block.key.address));
            }
            if self.by_entry.get(&block.entry) != Some(&id) {
                return violation(format!("block {:08x} missing from entry index", key.address));
            }
            for page in pages_of(block.physical_start, block.guest_len) {
                if !self.pages.get(&page).is_some_and(|s| s.contains(&id)) {
                    return violation(format!("block {:08x} missing from page {:#x}", key.address, page));
                }
            }
            for free in code.near.free_ranges().iter() {
                if free.overlaps(&block.host_range) {
                    return violation(format!("block {:08x} host code overlaps free space", key.address));
                }
            }
            for exit in &block.exits {
                let raw = read_slot(code, exit.slot)?;
                match exit.linked_to {
                    Some(target) => {
                        let Some(target_block) = self.get(target) else {
                            return violation(format!("block {:08x} links to dead block", key.address));
                        };
                        if raw != target_block.entry || target_block.key.address != exit.target {
                            return violation(format!("block {:08x} has a stale link", key.address));
                        }
                    }
                    None if raw != UNLINKED => {
                        return violation(format!("block {:08x} has an untracked link", key.address));
                    }
                    None => {}
                }
            }
        }

        let live = self.iter().count();
        if live != self.map.len() {
            return violation(format!("{} live blocks but {} mapped", live, self.map.len()));
        }

        let mut ranges: Vec<HostRange> = self.iter().map(|(_, b)| b.host_range).collect();
        ranges.sort();
        if ranges.windows(2).any(|w| w[0].overlaps(&w[1])) {
            return violation("two blocks share host code".to_string());
        }
        Ok(())
    }
}

fn write_slot(code: &mut CodeSpace, slot: HostAddr, entry: HostAddr) -> Result<(), JitError> {
    code.write(slot + LINK_ENTRY_OFFSET, &entry.to_le_bytes())
}

fn read_slot(code: &CodeSpace, slot: HostAddr) -> Result<HostAddr, JitError> {
    let at = slot + LINK_ENTRY_OFFSET;
    let bytes = code
        .read(HostRange::new(at, at + 4))
        .ok_or_else(|| JitError::CacheInvariantViolation(format!("link slot {:#x} outside code space", slot)))?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::Emitter;

    /// Emit a stub block with one exit per target and return its record
    fn emit_block(code: &mut CodeSpace, key: BlockKey, physical: u32, targets: &[u32]) -> CodeBlock {
        let reservation = code.near.allocate(64).unwrap();
        let mut emitter = Emitter::new(reservation.start(), reservation.capacity());
        emitter.nop();
        let slots = emitter.exit(key.address + 4, 1, key.mode as u8, targets);
        let bytes = emitter.into_bytes();
        code.near.write(reservation.start(), &bytes).unwrap();
        let host_range = code.near.commit(reservation, bytes.len()).unwrap();
        CodeBlock {
            key,
            guest_len: 4,
            physical_start: physical,
            entry: host_range.start,
            host_range,
            exits: targets
                .iter()
                .zip(slots)
                .map(|(&target, slot)| ExitLink { target, slot, linked_to: None })
                .collect(),
            sites: Vec::new(),
            instructions: 1,
            cycles: 1,
            dispatches: 0,
            runs: 0,
        }
    }

    fn insert(cache: &mut BlockCache, code: &mut CodeSpace, address: u32, targets: &[u32]) -> BlockId {
        let key = BlockKey::new(address, 0);
        let id = cache.allocate_block(key);
        let block = emit_block(code, key, address & 0x3FFF_FFFF, targets);
        cache.finalize_block(id, block, code).unwrap();
        id
    }

    #[test]
    fn test_links_both_directions() {
        let mut code = CodeSpace::new(4096, 1024);
        let mut cache = BlockCache::new(true);

        // A exits to B before B exists
        let a = insert(&mut cache, &mut code, 0x8000_1000, &[0x8000_2000]);
        assert!(!cache.get(a).unwrap().exits[0].is_linked());

        let b = insert(&mut cache, &mut code, 0x8000_2000, &[0x8000_1000]);
        let b_entry = cache.get(b).unwrap().entry;
        let a_entry = cache.get(a).unwrap().entry;
        assert_eq!(cache.get(a).unwrap().exits[0].linked_to, Some(b));
        assert_eq!(read_slot(&code, cache.get(a).unwrap().exits[0].slot).unwrap(), b_entry);
        assert_eq!(read_slot(&code, cache.get(b).unwrap().exits[0].slot).unwrap(), a_entry);
        cache.check_invariants(&code).unwrap();
    }

    #[test]
    fn test_erase_unlinks_incoming() {
        let mut code = CodeSpace::new(4096, 1024);
        let mut cache = BlockCache::new(true);
        let a = insert(&mut cache, &mut code, 0x8000_1000, &[0x8000_2000]);
        let b = insert(&mut cache, &mut code, 0x8000_2000, &[]);

        let erased = cache.erase_block(b, &mut code).unwrap().unwrap();
        assert_eq!(erased.key.address, 0x8000_2000);
        let exit = cache.get(a).unwrap().exits[0];
        assert!(!exit.is_linked());
        assert_eq!(read_slot(&code, exit.slot).unwrap(), UNLINKED);
        assert!(cache.lookup(BlockKey::new(0x8000_2000, 0)).is_none());
        cache.check_invariants(&code).unwrap();

        // Retranslation relinks the surviving source
        let b2 = insert(&mut cache, &mut code, 0x8000_2000, &[]);
        assert_eq!(cache.get(a).unwrap().exits[0].linked_to, Some(b2));
        cache.check_invariants(&code).unwrap();
    }

    #[test]
    fn test_self_loop_links() {
        let mut code = CodeSpace::new(4096, 1024);
        let mut cache = BlockCache::new(true);
        let a = insert(&mut cache, &mut code, 0x8000_1000, &[0x8000_1000]);
        assert_eq!(cache.get(a).unwrap().exits[0].linked_to, Some(a));
        cache.erase_block(a, &mut code).unwrap();
        assert!(cache.is_empty());
        cache.check_invariants(&code).unwrap();
    }

    #[test]
    fn test_modes_do_not_link() {
        let mut code = CodeSpace::new(4096, 1024);
        let mut cache = BlockCache::new(true);
        let a = insert(&mut cache, &mut code, 0x8000_1000, &[0x8000_2000]);
        let key = BlockKey::new(0x8000_2000, 3);
        let id = cache.allocate_block(key);
        let block = emit_block(&mut code, key, 0x2000, &[]);
        cache.finalize_block(id, block, &mut code).unwrap();
        assert!(!cache.get(a).unwrap().exits[0].is_linked());
    }

    #[test]
    fn test_linking_disabled() {
        let mut code = CodeSpace::new(4096, 1024);
        let mut cache = BlockCache::new(false);
        let a = insert(&mut cache, &mut code, 0x8000_1000, &[0x8000_2000]);
        insert(&mut cache, &mut code, 0x8000_2000, &[]);
        assert!(!cache.get(a).unwrap().exits[0].is_linked());
    }

    #[test]
    fn test_invalidate_range_by_physical_page() {
        let mut code = CodeSpace::new(4096, 1024);
        let mut cache = BlockCache::new(true);
        insert(&mut cache, &mut code, 0x8000_1000, &[]);
        insert(&mut cache, &mut code, 0x8000_1FFC, &[]);
        insert(&mut cache, &mut code, 0x8000_3000, &[]);

        let erased = cache.invalidate_range(0x1FFC, 8, &mut code).unwrap();
        assert_eq!(erased.len(), 1);
        assert_eq!(erased[0].1.key.address, 0x8000_1FFC);
        assert_eq!(cache.len(), 2);
        cache.check_invariants(&code).unwrap();
    }

    #[test]
    fn test_erased_code_is_trapped_and_freed() {
        let mut code = CodeSpace::new(4096, 1024);
        let mut cache = BlockCache::new(true);
        let a = insert(&mut cache, &mut code, 0x8000_1000, &[]);
        let range = cache.get(a).unwrap().host_range;
        cache.erase_block(a, &mut code).unwrap();
        assert!(code.read(range).unwrap().iter().all(|&b| b == TRAP_FILL));
        assert_eq!(code.near.largest_free(), 4096);
    }

    #[test]
    fn test_discard_reuses_handle() {
        let mut cache = BlockCache::new(true);
        let id = cache.allocate_block(BlockKey::new(0x8000_0000, 0));
        cache.discard(id);
        let again = cache.allocate_block(BlockKey::new(0x8000_0004, 0));
        assert_eq!(id, again);
        assert!(cache.get(again).is_none());
    }

    #[test]
    fn test_find_by_host() {
        let mut code = CodeSpace::new(4096, 1024);
        let mut cache = BlockCache::new(true);
        let a = insert(&mut cache, &mut code, 0x8000_1000, &[]);
        let range = cache.get(a).unwrap().host_range;
        assert_eq!(cache.find_by_host(range.start + 1), Some(a));
        assert_eq!(cache.find_by_host(range.end), None);
    }

    #[test]
    fn test_failed_finalize_leaves_no_links() {
        let mut code = CodeSpace::new(4096, 1024);
        let mut cache = BlockCache::new(true);
        let b = insert(&mut cache, &mut code, 0x2000, &[0x2004]);

        let key = BlockKey::new(0x1000, 0);
        let a = cache.allocate_block(key);
        let mut block = emit_block(&mut code, key, 0x1000, &[0x2000]);
        block.exits[0].slot = 0xFFFF_FF00;
        assert!(cache.finalize_block(a, block, &mut code).is_err());

        assert!(!cache.links_to.contains_key(&BlockKey::new(0x2000, 0)));
        assert!(cache.lookup(key).is_none());
        cache.discard(a);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(b).is_some());
        cache.check_invariants(&code).unwrap();
    }
}
