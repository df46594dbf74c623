//! Virtual time clock.
//!
//! Time only moves when the runtime is told to advance it, so WAIT-style
//! functions and the history debounce are deterministic under test. The CLI
//! drives the same clock from a real timer in `--realtime` mode.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use rustc_hash::FxHashSet;

use crate::arena::BlockId;

/// Handle to a scheduled one-shot timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// What a timer wakes up when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerTarget {
    /// Calls `Function::on_timer` on the block.
    Block(BlockId),
    /// Captures a pending history snapshot of the flow.
    History(BlockId),
}

#[derive(Debug, Clone)]
struct TimerEntry {
    fire_at_ms: u64,
    id: TimerId,
    target: TimerTarget,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at_ms == other.fire_at_ms && self.id == other.id
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap on deadline; equal deadlines fire in scheduling order
        other
            .fire_at_ms
            .cmp(&self.fire_at_ms)
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// A timer that came due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FiredTimer {
    pub id: TimerId,
    pub target: TimerTarget,
    pub fire_at_ms: u64,
}

#[derive(Debug, Default)]
pub struct Clock {
    current_time_ms: u64,
    next_id: u64,
    pending_timers: BinaryHeap<TimerEntry>,
    /// Ids still armed. Cancelled entries stay in the heap and are skipped.
    live: FxHashSet<TimerId>,
}

impl Clock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now_ms(&self) -> u64 {
        self.current_time_ms
    }

    /// Arm a one-shot timer `delay_ms` from now.
    pub fn schedule(&mut self, delay_ms: u64, target: TimerTarget) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.pending_timers.push(TimerEntry {
            fire_at_ms: self.current_time_ms.saturating_add(delay_ms),
            id,
            target,
        });
        self.live.insert(id);
        id
    }

    /// Disarm a timer. Returns `false` if it already fired or was cancelled.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        self.live.remove(&id)
    }

    pub fn is_armed(&self, id: TimerId) -> bool {
        self.live.contains(&id)
    }

    /// Pop the next live timer due at or before `until_ms`, moving the clock
    /// to its deadline.
    pub fn pop_due(&mut self, until_ms: u64) -> Option<FiredTimer> {
        while let Some(entry) = self.pending_timers.peek() {
            if entry.fire_at_ms > until_ms {
                return None;
            }
            let entry = self.pending_timers.pop()?;
            if !self.live.remove(&entry.id) {
                continue;
            }
            self.current_time_ms = self.current_time_ms.max(entry.fire_at_ms);
            return Some(FiredTimer {
                id: entry.id,
                target: entry.target,
                fire_at_ms: entry.fire_at_ms,
            });
        }
        None
    }

    /// Move time forward without firing anything.
    pub fn advance_to(&mut self, time_ms: u64) {
        self.current_time_ms = self.current_time_ms.max(time_ms);
    }

    pub fn has_pending_timers(&self) -> bool {
        !self.live.is_empty()
    }

    /// Time until the next live timer fires, if any.
    pub fn time_to_next_timer(&self) -> Option<u64> {
        self.pending_timers
            .iter()
            .filter(|entry| self.live.contains(&entry.id))
            .map(|entry| entry.fire_at_ms.saturating_sub(self.current_time_ms))
            .min()
    }

    pub fn clear_timers(&mut self) {
        self.pending_timers.clear();
        self.live.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::{Arena, BlockId};

    fn block() -> BlockId {
        let mut arena: Arena<BlockId, ()> = Arena::new();
        arena.alloc(())
    }

    #[test]
    fn clock_starts_at_zero() {
        assert_eq!(Clock::new().now_ms(), 0);
    }

    #[test]
    fn timer_fires_at_deadline_once() {
        let mut clock = Clock::new();
        let target = TimerTarget::Block(block());
        let id = clock.schedule(1000, target);
        assert!(clock.has_pending_timers());

        assert_eq!(clock.pop_due(500), None);
        let fired = clock.pop_due(1000).unwrap();
        assert_eq!(fired.id, id);
        assert_eq!(fired.target, target);
        assert_eq!(clock.now_ms(), 1000);

        // one-shot
        assert_eq!(clock.pop_due(5000), None);
        assert!(!clock.has_pending_timers());
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let mut clock = Clock::new();
        let id = clock.schedule(10, TimerTarget::Block(block()));
        assert!(clock.cancel(id));
        assert!(!clock.cancel(id));
        assert_eq!(clock.pop_due(100), None);
        assert_eq!(clock.time_to_next_timer(), None);
    }

    #[test]
    fn equal_deadlines_fire_in_schedule_order() {
        let mut clock = Clock::new();
        let b = block();
        let first = clock.schedule(5, TimerTarget::Block(b));
        let second = clock.schedule(5, TimerTarget::History(b));
        assert_eq!(clock.pop_due(5).map(|t| t.id), Some(first));
        assert_eq!(clock.pop_due(5).map(|t| t.id), Some(second));
    }

    #[test]
    fn time_to_next_timer() {
        let mut clock = Clock::new();
        assert!(clock.time_to_next_timer().is_none());
        clock.schedule(1000, TimerTarget::Block(block()));
        assert_eq!(clock.time_to_next_timer(), Some(1000));
        clock.advance_to(300);
        assert_eq!(clock.time_to_next_timer(), Some(700));
    }
}
