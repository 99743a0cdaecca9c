//! Breakpoint management for debugging
//!
//! Execution breakpoints are compiled into translated blocks as checks in
//! front of the breakpointed instruction. Adding or removing one therefore asks
//! the cache to drop every block covering the address, so the next translation
//! picks up the new set.
//!
//! Read, write and access breakpoints are memory watchpoints. They live in the
//! dispatcher's watchpoint set; the dispatcher retranslates with memory checks
//! while the set is non-empty.

use std::collections::HashMap;

use og_jit::{BreakpointSet, JitControl, WatchKind, Watchpoint, WatchpointSet};

/// Breakpoint type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointType {
    /// Execution breakpoint
    Execution,
    /// Memory read
    Read,
    /// Memory write
    Write,
    /// Memory read or write
    Access,
}

impl From<WatchKind> for BreakpointType {
    fn from(kind: WatchKind) -> Self {
        match kind {
            WatchKind::Read => BreakpointType::Read,
            WatchKind::Write => BreakpointType::Write,
            WatchKind::Access => BreakpointType::Access,
        }
    }
}

/// A single breakpoint
#[derive(Debug, Clone)]
pub struct Breakpoint {
    /// Unique breakpoint ID
    pub id: u32,
    /// Guest address of the breakpoint
    pub address: u32,
    /// Watched bytes from `address`; 4 for execution breakpoints
    pub len: u32,
    pub kind: BreakpointType,
    pub enabled: bool,
    /// Number of times execution stopped here
    pub hit_count: u64,
    pub label: Option<String>,
}

impl Breakpoint {
    pub fn new(id: u32, address: u32) -> Self {
        Self {
            id,
            address,
            len: 4,
            kind: BreakpointType::Execution,
            enabled: true,
            hit_count: 0,
            label: None,
        }
    }

    pub fn watch(id: u32, address: u32, len: u32, kind: WatchKind) -> Self {
        let watchpoint = Watchpoint::new(address, len, kind);
        Self {
            len: watchpoint.len,
            kind: kind.into(),
            ..Self::new(id, address)
        }
    }

    /// The memory watchpoint this breakpoint arms, if it is one
    pub fn watchpoint(&self) -> Option<Watchpoint> {
        let kind = match self.kind {
            BreakpointType::Execution => return None,
            BreakpointType::Read => WatchKind::Read,
            BreakpointType::Write => WatchKind::Write,
            BreakpointType::Access => WatchKind::Access,
        };
        Some(Watchpoint::new(self.address, self.len, kind))
    }
}

/// Breakpoint manager
pub struct BreakpointManager {
    /// All breakpoints indexed by ID
    breakpoints: HashMap<u32, Breakpoint>,
    /// Execution breakpoint ID by address
    by_address: HashMap<u32, u32>,
    next_id: u32,
    /// Addresses the translator checks
    active: BreakpointSet,
    watches: WatchpointSet,
    control: JitControl,
}

impl BreakpointManager {
    /// Manage the breakpoint and watchpoint sets of a dispatcher
    pub fn new(active: BreakpointSet, watches: WatchpointSet, control: JitControl) -> Self {
        Self {
            breakpoints: HashMap::new(),
            by_address: HashMap::new(),
            next_id: 0,
            active,
            watches,
            control,
        }
    }

    /// Add an execution breakpoint; an existing one at the address is returned instead
    pub fn add(&mut self, address: u32) -> u32 {
        if let Some(&id) = self.by_address.get(&address) {
            return id;
        }
        let id = self.next_id;
        self.next_id += 1;

        self.breakpoints.insert(id, Breakpoint::new(id, address));
        self.by_address.insert(address, id);
        self.arm(address);

        tracing::debug!("Added breakpoint {} at 0x{:08x}", id, address);
        id
    }

    /// Add a breakpoint with a label
    pub fn add_labeled(&mut self, address: u32, label: &str) -> u32 {
        let id = self.add(address);
        if let Some(bp) = self.breakpoints.get_mut(&id) {
            bp.label = Some(label.to_string());
        }
        id
    }

    /// Watch `len` bytes from `address`
    pub fn add_watchpoint(&mut self, address: u32, len: u32, kind: WatchKind) -> u32 {
        let id = self.next_id;
        self.next_id += 1;

        let bp = Breakpoint::watch(id, address, len, kind);
        self.arm_entry(&bp);
        self.breakpoints.insert(id, bp);

        tracing::debug!("Added {:?} watchpoint {} at 0x{:08x}+{}", kind, id, address, len);
        id
    }

    pub fn add_read_watchpoint(&mut self, address: u32, len: u32) -> u32 {
        self.add_watchpoint(address, len, WatchKind::Read)
    }

    pub fn add_write_watchpoint(&mut self, address: u32, len: u32) -> u32 {
        self.add_watchpoint(address, len, WatchKind::Write)
    }

    pub fn add_access_watchpoint(&mut self, address: u32, len: u32) -> u32 {
        self.add_watchpoint(address, len, WatchKind::Access)
    }

    /// Remove a breakpoint by ID
    pub fn remove(&mut self, id: u32) -> Option<Breakpoint> {
        let bp = self.breakpoints.remove(&id)?;
        if bp.kind == BreakpointType::Execution {
            self.by_address.remove(&bp.address);
        }
        if bp.enabled {
            self.disarm_entry(&bp);
        }
        tracing::debug!("Removed breakpoint {} at 0x{:08x}", id, bp.address);
        Some(bp)
    }

    /// Remove the breakpoint at an address
    pub fn remove_at(&mut self, address: u32) -> Option<Breakpoint> {
        let id = *self.by_address.get(&address)?;
        self.remove(id)
    }

    pub fn enable(&mut self, id: u32) -> bool {
        match self.breakpoints.get_mut(&id) {
            Some(bp) if !bp.enabled => {
                bp.enabled = true;
                let bp = bp.clone();
                self.arm_entry(&bp);
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    pub fn disable(&mut self, id: u32) -> bool {
        match self.breakpoints.get_mut(&id) {
            Some(bp) if bp.enabled => {
                bp.enabled = false;
                let bp = bp.clone();
                self.disarm_entry(&bp);
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Count a stop at `address`; returns the breakpoint if one is armed there
    pub fn record_hit(&mut self, address: u32) -> Option<&Breakpoint> {
        let id = *self.by_address.get(&address)?;
        let bp = self.breakpoints.get_mut(&id)?;
        if !bp.enabled {
            return None;
        }
        bp.hit_count += 1;
        Some(bp)
    }

    /// Count a watchpoint stop on an access to `addr`
    pub fn record_watch_hit(&mut self, addr: u32, store: bool) -> Option<&Breakpoint> {
        let id = self
            .breakpoints
            .values()
            .filter(|bp| bp.enabled)
            .filter(|bp| bp.watchpoint().is_some_and(|w| w.matches(addr, 1, store)))
            .map(|bp| bp.id)
            .min()?;
        let bp = self.breakpoints.get_mut(&id)?;
        bp.hit_count += 1;
        Some(bp)
    }

    pub fn get(&self, id: u32) -> Option<&Breakpoint> {
        self.breakpoints.get(&id)
    }

    /// Breakpoints ordered by address
    pub fn list(&self) -> Vec<&Breakpoint> {
        let mut list: Vec<&Breakpoint> = self.breakpoints.values().collect();
        list.sort_by_key(|bp| bp.address);
        list
    }

    pub fn count(&self) -> usize {
        self.breakpoints.len()
    }

    pub fn clear(&mut self) {
        let armed: Vec<Breakpoint> = self
            .breakpoints
            .values()
            .filter(|bp| bp.enabled)
            .cloned()
            .collect();
        for bp in &armed {
            self.disarm_entry(bp);
        }
        self.breakpoints.clear();
        self.by_address.clear();
        tracing::debug!("Cleared all breakpoints");
    }

    fn arm_entry(&self, bp: &Breakpoint) {
        match bp.watchpoint() {
            Some(watchpoint) => {
                self.watches.insert(watchpoint);
            }
            None => self.arm(bp.address),
        }
    }

    fn disarm_entry(&self, bp: &Breakpoint) {
        match bp.watchpoint() {
            Some(watchpoint) => {
                self.watches.remove(&watchpoint);
            }
            None => self.disarm(bp.address),
        }
    }

    fn arm(&self, address: u32) {
        self.active.insert(address);
        self.control.erase_blocks_containing(address);
    }

    fn disarm(&self, address: u32) {
        self.active.remove(address);
        self.control.erase_blocks_containing(address);
    }
}
