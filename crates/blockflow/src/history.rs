//! Debounced undo/redo history per flow.
//!
//! Persisted changes inside a flow arm a debounce timer on the virtual
//! clock. When it fires, the flow's snapshot is captured if it differs from
//! the current one. Undo and redo flush a pending capture first, then move
//! the flow to the neighbouring snapshot through `live_update`.

use serde_json::Value as Json;

use crate::arena::BlockId;
use crate::block::Write;
use crate::clock::{TimerId, TimerTarget};
use crate::error::{FlowError, Result};
use crate::property::{HAS_CHANGE, HAS_REDO, HAS_UNDO};
use crate::runtime::Runtime;
use crate::value::Value;

#[derive(Debug, Default)]
pub(crate) struct FlowHistory {
    snapshots: Vec<Json>,
    cursor: usize,
    timer: Option<TimerId>,
    /// Snapshot `@has-change` compares against.
    baseline: Json,
    /// Set while undo/redo rewrites the flow.
    applying: bool,
}

impl FlowHistory {
    fn current(&self) -> Option<&Json> {
        self.snapshots.get(self.cursor)
    }

    fn can_undo(&self) -> bool {
        self.cursor > 0
    }

    fn can_redo(&self) -> bool {
        self.cursor + 1 < self.snapshots.len()
    }

    fn has_change(&self) -> bool {
        self.current() != Some(&self.baseline)
    }

    /// Record `snapshot` after the cursor, dropping the redo tail.
    fn push(&mut self, snapshot: Json, limit: usize) -> bool {
        if self.current() == Some(&snapshot) {
            return false;
        }
        self.snapshots.truncate(self.cursor + 1);
        self.snapshots.push(snapshot);
        let limit = limit.max(1);
        if self.snapshots.len() > limit {
            let excess = self.snapshots.len() - limit;
            self.snapshots.drain(..excess);
        }
        self.cursor = self.snapshots.len() - 1;
        true
    }
}

impl Runtime {
    fn history(&self, flow: BlockId) -> Option<&FlowHistory> {
        self.blocks.get(flow)?.flow_state()?.history.as_ref()
    }

    fn history_mut(&mut self, flow: BlockId) -> Option<&mut FlowHistory> {
        self.blocks.get_mut(flow)?.flow_state_mut()?.history.as_mut()
    }

    /// Start recording history for a flow. The current state becomes the
    /// first snapshot and the `@has-change` baseline.
    pub fn enable_history(&mut self, flow: BlockId) -> Result<()> {
        if !self.check_live(flow) {
            return Err(FlowError::Destroyed(flow));
        }
        let snapshot = self.save(flow);
        let Some(state) = self.blocks.get_mut(flow).and_then(|b| b.flow_state_mut()) else {
            return Err(FlowError::InvalidTarget(format!("{flow:?} is not a flow")));
        };
        if state.history.is_none() {
            log::debug!("history enabled on {flow:?}");
            state.history = Some(FlowHistory {
                snapshots: vec![snapshot.clone()],
                cursor: 0,
                timer: None,
                baseline: snapshot,
                applying: false,
            });
        }
        self.publish_history(flow);
        Ok(())
    }

    pub fn has_history(&self, flow: BlockId) -> bool {
        self.history(flow).is_some()
    }

    /// Note a persisted change inside the block's flow scope.
    pub(crate) fn track_change(&mut self, block: BlockId) {
        let Some(flow) = self.blocks.get(block).and_then(|b| b.flow) else {
            return;
        };
        let delay = self.config.history_debounce_ms;
        let previous = match self.history(flow) {
            Some(history) if !history.applying => history.timer,
            _ => return,
        };
        if let Some(previous) = previous {
            self.clock.cancel(previous);
        }
        let timer = self.clock.schedule(delay, TimerTarget::History(flow));
        if let Some(history) = self.history_mut(flow) {
            history.timer = Some(timer);
        }
    }

    /// Debounce timer fired.
    pub(crate) fn capture_history(&mut self, flow: BlockId, timer: TimerId) {
        if self.history(flow).and_then(|history| history.timer) != Some(timer) {
            return;
        }
        self.capture_now(flow);
    }

    fn capture_now(&mut self, flow: BlockId) {
        let snapshot = self.save(flow);
        let limit = self.config.history_limit;
        let Some(history) = self.history_mut(flow) else {
            return;
        };
        history.timer = None;
        if history.push(snapshot, limit) {
            log::debug!("history snapshot {} on {flow:?}", history.cursor);
        }
        self.publish_history(flow);
    }

    /// Capture a pending change right away.
    fn flush_history(&mut self, flow: BlockId) {
        let Some(timer) = self.history(flow).and_then(|history| history.timer) else {
            return;
        };
        self.clock.cancel(timer);
        self.capture_now(flow);
    }

    pub(crate) fn cancel_history_timer(&mut self, block: BlockId) {
        let Some(timer) = self.history_mut(block).and_then(|history| history.timer.take()) else {
            return;
        };
        self.clock.cancel(timer);
    }

    /// Step back one snapshot. Returns whether anything changed.
    pub fn undo(&mut self, flow: BlockId) -> Result<bool> {
        self.step_history(flow, false)
    }

    pub fn redo(&mut self, flow: BlockId) -> Result<bool> {
        self.step_history(flow, true)
    }

    fn step_history(&mut self, flow: BlockId, forward: bool) -> Result<bool> {
        if !self.check_live(flow) {
            return Err(FlowError::Destroyed(flow));
        }
        self.flush_history(flow);
        let Some(history) = self.history_mut(flow) else {
            return Ok(false);
        };
        let possible = if forward { history.can_redo() } else { history.can_undo() };
        if !possible {
            return Ok(false);
        }
        history.cursor = if forward { history.cursor + 1 } else { history.cursor - 1 };
        let snapshot = history.current().cloned().unwrap_or(Json::Null);
        history.applying = true;
        let result = self.live_update(flow, &snapshot);
        if let Some(history) = self.history_mut(flow) {
            history.applying = false;
        }
        self.publish_history(flow);
        result.map(|()| true)
    }

    /// Make the current state the `@has-change` baseline.
    pub(crate) fn mark_history_saved(&mut self, flow: BlockId) {
        self.flush_history(flow);
        let snapshot = self.save(flow);
        if let Some(history) = self.history_mut(flow) {
            history.baseline = snapshot;
        }
        self.publish_history(flow);
    }

    fn publish_history(&mut self, flow: BlockId) {
        let Some(history) = self.history(flow) else {
            return;
        };
        let flags = [
            (HAS_UNDO, history.can_undo()),
            (HAS_REDO, history.can_redo()),
            (HAS_CHANGE, history.has_change()),
        ];
        for (name, value) in flags {
            self.write(flow, name, Value::Bool(value), Write::Transient);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn setup() -> (Runtime, BlockId) {
        let mut rt = Runtime::default();
        let flow = rt.add_flow("main", &json!({"a": 1})).unwrap();
        rt.enable_history(flow).unwrap();
        (rt, flow)
    }

    fn flag(rt: &Runtime, flow: BlockId, name: &str) -> bool {
        rt.get_value(flow, name) == Value::Bool(true)
    }

    #[test]
    fn changes_are_debounced_into_one_snapshot() {
        let (mut rt, flow) = setup();
        assert!(!flag(&rt, flow, "@has-undo"));
        rt.set_value(flow, "a", 2).unwrap();
        rt.advance_time(100);
        rt.set_value(flow, "a", 3).unwrap();
        rt.advance_time(100);
        assert!(!flag(&rt, flow, "@has-undo"));
        rt.advance_time(150);
        assert!(flag(&rt, flow, "@has-undo"));
        assert!(flag(&rt, flow, "@has-change"));

        assert!(rt.undo(flow).unwrap());
        assert_eq!(rt.get_value(flow, "a"), Value::from(1));
        assert!(!flag(&rt, flow, "@has-undo"));
        assert!(flag(&rt, flow, "@has-redo"));
        assert!(!flag(&rt, flow, "@has-change"));
    }

    #[test]
    fn undo_flushes_pending_capture() {
        let (mut rt, flow) = setup();
        rt.set_value(flow, "a", 2).unwrap();
        assert!(rt.undo(flow).unwrap());
        assert_eq!(rt.get_value(flow, "a"), Value::from(1));
        assert!(rt.redo(flow).unwrap());
        assert_eq!(rt.get_value(flow, "a"), Value::from(2));
        assert!(!rt.redo(flow).unwrap());
    }

    #[test]
    fn undo_does_not_record_itself() {
        let (mut rt, flow) = setup();
        rt.set_value(flow, "a", 2).unwrap();
        rt.advance_time(300);
        rt.undo(flow).unwrap();
        rt.advance_time(300);
        assert!(flag(&rt, flow, "@has-redo"));
    }

    #[test]
    fn new_change_drops_redo_tail() {
        let (mut rt, flow) = setup();
        rt.set_value(flow, "a", 2).unwrap();
        rt.advance_time(300);
        rt.undo(flow).unwrap();
        rt.set_value(flow, "b", true).unwrap();
        rt.advance_time(300);
        assert!(!flag(&rt, flow, "@has-redo"));
        assert!(flag(&rt, flow, "@has-undo"));
    }

    #[test]
    fn transient_writes_are_not_history() {
        let (mut rt, flow) = setup();
        rt.update_value(flow, "a", 5).unwrap();
        rt.advance_time(300);
        assert!(!flag(&rt, flow, "@has-undo"));
    }

    #[test]
    fn snapshots_are_capped() {
        let mut rt = Runtime::new(crate::runtime::RuntimeConfig {
            history_limit: 3,
            ..Default::default()
        });
        let flow = rt.add_flow("main", &json!({})).unwrap();
        rt.enable_history(flow).unwrap();
        for value in 0..5 {
            rt.set_value(flow, "a", value).unwrap();
            rt.advance_time(300);
        }
        assert!(rt.undo(flow).unwrap());
        assert!(rt.undo(flow).unwrap());
        assert!(!rt.undo(flow).unwrap());
        assert_eq!(rt.get_value(flow, "a"), Value::from(2));
    }

    #[test]
    fn nested_block_changes_count_for_the_flow() {
        let (mut rt, flow) = setup();
        let block = rt.create_block(flow, "b", None).unwrap();
        rt.advance_time(300);
        rt.set_value(block, "x", 1).unwrap();
        rt.advance_time(300);
        rt.undo(flow).unwrap();
        let block = rt.get_value(flow, "b").as_block().unwrap();
        assert!(rt.get_value(block, "x").is_undefined());
    }

    #[test]
    fn history_requires_a_flow() {
        let mut rt = Runtime::default();
        let flow = rt.add_flow("main", &json!({})).unwrap();
        let block = rt.create_block(flow, "b", None).unwrap();
        assert!(matches!(rt.enable_history(block), Err(FlowError::InvalidTarget(_))));
        assert!(!rt.undo(block).unwrap());
    }
}
