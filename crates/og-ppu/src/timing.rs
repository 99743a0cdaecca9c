//! Cycle accounting and scheduled events

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::exceptions::{ExceptionController, ExceptionKind};
use crate::state::PpuState;

/// Supplies scheduling quanta to the execution loop
pub trait TimingService {
    /// Account for the cycles consumed since the previous call, fire due events
    /// (which may raise interrupts) and load a fresh downcount into `state`
    fn advance(&mut self, state: &mut PpuState, exceptions: &mut dyn ExceptionController);

    /// Total emulated cycles
    fn ticks(&self) -> u64;

    /// Number of quanta handed out so far
    fn slices(&self) -> u64;
}

/// Event fired by [`CoreTiming`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TimedEvent {
    ExternalInterrupt,
    Decrementer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Scheduled {
    at: u64,
    seq: u64,
    event: TimedEvent,
}

/// Fixed-quantum timing service with one-shot events
#[derive(Debug)]
pub struct CoreTiming {
    quantum: u32,
    ticks: u64,
    slice_length: i64,
    slices: u64,
    seq: u64,
    events: BinaryHeap<Reverse<Scheduled>>,
}

impl CoreTiming {
    pub const DEFAULT_QUANTUM: u32 = 20_000;

    pub fn new(quantum: u32) -> Self {
        Self {
            quantum: quantum.max(1),
            ticks: 0,
            slice_length: 0,
            slices: 0,
            seq: 0,
            events: BinaryHeap::new(),
        }
    }

    /// Length of every full slice
    pub fn quantum(&self) -> u32 {
        self.quantum
    }

    /// Fire `event` once `cycles_from_now` more cycles have elapsed
    pub fn schedule(&mut self, cycles_from_now: u64, event: TimedEvent) {
        let at = self.ticks + cycles_from_now;
        self.seq += 1;
        self.events.push(Reverse(Scheduled {
            at,
            seq: self.seq,
            event,
        }));
    }

    pub fn pending_events(&self) -> usize {
        self.events.len()
    }
}

impl Default for CoreTiming {
    fn default() -> Self {
        Self::new(Self::DEFAULT_QUANTUM)
    }
}

impl TimingService for CoreTiming {
    fn advance(&mut self, state: &mut PpuState, exceptions: &mut dyn ExceptionController) {
        let executed = (self.slice_length - state.downcount).max(0) as u64;
        self.ticks += executed;

        while let Some(Reverse(next)) = self.events.peek().copied() {
            if next.at > self.ticks {
                break;
            }
            self.events.pop();
            let kind = match next.event {
                TimedEvent::ExternalInterrupt => ExceptionKind::External,
                TimedEvent::Decrementer => ExceptionKind::Decrementer,
            };
            og_core::ppu_trace!("Timed event {:?} at tick {}", next.event, self.ticks);
            exceptions.raise(state, kind);
        }

        let until_event = self
            .events
            .peek()
            .map(|Reverse(e)| e.at - self.ticks)
            .unwrap_or(u64::MAX);
        let slice = until_event.clamp(1, self.quantum as u64) as i64;
        self.slice_length = slice;
        state.downcount = slice;
        self.slices += 1;
    }

    fn ticks(&self) -> u64 {
        self.ticks
    }

    fn slices(&self) -> u64 {
        self.slices
    }
}
