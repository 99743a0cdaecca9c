//! Memory watchpoints
//!
//! While any watchpoint is armed the cache runs in memory-check mode: every
//! load and store is translated as a slow-path access preceded by a check of
//! its effective address, and execution halts in front of an access that
//! touches a watched range.

use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard};

/// Accesses a watchpoint reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
    Read,
    Write,
    Access,
}

/// A watched range of effective addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watchpoint {
    pub start: u32,
    pub len: u32,
    pub kind: WatchKind,
}

impl Watchpoint {
    pub fn new(start: u32, len: u32, kind: WatchKind) -> Self {
        Self {
            start,
            len: len.max(1),
            kind,
        }
    }

    /// Whether an access of `size` bytes at `addr` triggers the watchpoint
    pub fn matches(&self, addr: u32, size: u32, store: bool) -> bool {
        let wanted = match self.kind {
            WatchKind::Read => !store,
            WatchKind::Write => store,
            WatchKind::Access => true,
        };
        let end = self.start as u64 + self.len as u64;
        let access_end = addr as u64 + size as u64;
        wanted && (addr as u64) < end && (self.start as u64) < access_end
    }
}

/// Watchpoints shared between the CPU thread and a debugger
#[derive(Debug, Clone, Default)]
pub struct WatchpointSet {
    inner: Arc<RwLock<Vec<Watchpoint>>>,
}

impl WatchpointSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the set was empty before
    pub fn insert(&self, watchpoint: Watchpoint) -> bool {
        let mut inner = self.inner.write();
        inner.push(watchpoint);
        inner.len() == 1
    }

    /// Remove one copy of `watchpoint`; returns true if it was present
    pub fn remove(&self, watchpoint: &Watchpoint) -> bool {
        let mut inner = self.inner.write();
        match inner.iter().position(|w| w == watchpoint) {
            Some(index) => {
                inner.swap_remove(index);
                true
            }
            None => false,
        }
    }

    pub fn clear(&self) {
        self.inner.write().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Vec<Watchpoint>> {
        self.inner.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_and_overlap() {
        let write = Watchpoint::new(0x3000, 4, WatchKind::Write);
        assert!(write.matches(0x3000, 4, true));
        assert!(write.matches(0x3003, 1, true));
        assert!(write.matches(0x2FFE, 4, true));
        assert!(!write.matches(0x3004, 4, true));
        assert!(!write.matches(0x3000, 4, false));

        let access = Watchpoint::new(0xFFFF_FFFC, 8, WatchKind::Access);
        assert!(access.matches(0xFFFF_FFFF, 1, false));
    }

    #[test]
    fn test_set_reports_first_insert() {
        let set = WatchpointSet::new();
        let wp = Watchpoint::new(0x100, 0, WatchKind::Read);
        assert_eq!(wp.len, 1);
        assert!(set.insert(wp));
        assert!(!set.insert(wp));
        assert!(set.remove(&wp));
        assert_eq!(set.len(), 1);
        assert!(set.remove(&wp));
        assert!(!set.remove(&wp));
        assert!(set.is_empty());
    }
}
