//! Cross-thread invalidation requests
//!
//! The cache is owned by the CPU thread. Other threads (debugger, DMA) post
//! requests through a [`JitControl`] handle; the dispatcher applies them at the
//! next block boundary, so no block is ever erased while it runs.

use crossbeam::channel::{unbounded, Receiver, Sender};

/// Deferred cache mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationRequest {
    /// Erase blocks whose physical source overlaps the range
    Range { start: u32, len: u32 },
    /// Erase blocks starting at a guest address, in every mode
    EraseAt { address: u32 },
    /// Erase blocks whose guest range covers an address
    EraseContaining { address: u32 },
    /// Drop every block
    Clear,
}

/// Clonable, thread-safe handle for posting requests
#[derive(Debug, Clone)]
pub struct JitControl {
    tx: Sender<InvalidationRequest>,
}

impl JitControl {
    pub fn invalidate_range(&self, start: u32, len: u32) {
        self.post(InvalidationRequest::Range { start, len });
    }

    pub fn erase_block_at(&self, address: u32) {
        self.post(InvalidationRequest::EraseAt { address });
    }

    pub fn erase_blocks_containing(&self, address: u32) {
        self.post(InvalidationRequest::EraseContaining { address });
    }

    pub fn clear(&self) {
        self.post(InvalidationRequest::Clear);
    }

    fn post(&self, request: InvalidationRequest) {
        // The receiver lives as long as the cache; a send error means it is gone
        if self.tx.send(request).is_err() {
            og_core::jit_debug!("Dropping {:?}: block cache no longer exists", request);
        }
    }
}

/// Receiving side, owned by the cache
#[derive(Debug)]
pub struct InvalidationQueue {
    tx: Sender<InvalidationRequest>,
    rx: Receiver<InvalidationRequest>,
}

impl InvalidationQueue {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    pub fn control(&self) -> JitControl {
        JitControl { tx: self.tx.clone() }
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Take every request posted so far
    pub fn drain(&self) -> Vec<InvalidationRequest> {
        self.rx.try_iter().collect()
    }
}

impl Default for InvalidationQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requests_cross_threads() {
        let queue = InvalidationQueue::new();
        let control = queue.control();
        std::thread::spawn(move || {
            control.erase_block_at(0x8000_1000);
            control.invalidate_range(0x2000, 0x20);
        })
        .join()
        .unwrap();

        assert!(!queue.is_empty());
        assert_eq!(
            queue.drain(),
            vec![
                InvalidationRequest::EraseAt { address: 0x8000_1000 },
                InvalidationRequest::Range { start: 0x2000, len: 0x20 },
            ]
        );
        assert!(queue.is_empty());
    }
}
