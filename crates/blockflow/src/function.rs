//! The pluggable behavior attached to a block.

use std::sync::Arc;

use crate::arena::BlockId;
use crate::block::Write;
use crate::clock::{TimerId, TimerTarget};
use crate::error::FunctionError;
use crate::event::ErrorEvent;
use crate::property::{PropertyKind, OUTPUT};
use crate::runtime::Runtime;
use crate::value::Value;

/// Outcome of `run`, `on_timer` and `on_wake`.
#[derive(Debug, Clone)]
pub enum RunResult {
    Done,
    /// Suspended until a timer or wake callback completes the run.
    Wait,
    /// Domain failure, emitted on `#emit` as data.
    Error(ErrorEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// `#cancel` or `Runtime::cancel_block`.
    Manual,
    /// `#is` swapped or the function was unregistered.
    Reconfigure,
    Destroy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelMode {
    /// The function may refuse by returning `false`.
    Soft,
    /// The block leaves WAIT whatever the function answers.
    Hard,
}

/// Behavior object attached to a block through `#is`.
///
/// Every hook runs with the function taken out of its block, so hooks may
/// freely mutate the runtime through the context, including the owning
/// block. Panics in any hook are caught and turned into an `ErrorEvent` on
/// `#output` and `#emit`.
pub trait Function: 'static {
    fn init(&mut self, _ctx: &mut FunctionContext<'_>) {}

    fn run(&mut self, ctx: &mut FunctionContext<'_>) -> Result<RunResult, FunctionError>;

    /// A `#...` or `+...` property changed. Return `true` to request a run.
    fn config_changed(&mut self, _ctx: &mut FunctionContext<'_>, _name: &str, _value: &Value) -> bool {
        true
    }

    /// An input property changed. Return `true` to request a run.
    fn input_changed(&mut self, _ctx: &mut FunctionContext<'_>, _name: &str, _value: &Value) -> bool {
        true
    }

    /// The block is being forced out of WAIT. Release external resources.
    fn cancel(&mut self, _ctx: &mut FunctionContext<'_>, _reason: CancelReason, _mode: CancelMode) -> bool {
        true
    }

    fn cleanup(&mut self, _ctx: &mut FunctionContext<'_>) {}

    fn destroy(&mut self, _ctx: &mut FunctionContext<'_>) {}

    fn on_timer(&mut self, _ctx: &mut FunctionContext<'_>, _timer: TimerId) -> Result<RunResult, FunctionError> {
        Ok(RunResult::Done)
    }

    fn on_wake(&mut self, _ctx: &mut FunctionContext<'_>, _payload: &Value) -> Result<RunResult, FunctionError> {
        Ok(RunResult::Done)
    }
}

/// View of the runtime from inside a function hook.
pub struct FunctionContext<'a> {
    runtime: &'a mut Runtime,
    block: BlockId,
}

impl<'a> FunctionContext<'a> {
    pub(crate) fn new(runtime: &'a mut Runtime, block: BlockId) -> Self {
        Self { runtime, block }
    }

    pub fn block(&self) -> BlockId {
        self.block
    }

    pub fn tick(&self) -> i64 {
        self.runtime.tick()
    }

    pub fn now_ms(&self) -> u64 {
        self.runtime.now_ms()
    }

    /// Current value of a property on the owning block.
    pub fn input(&self, name: &str) -> Value {
        self.runtime.peek(self.block, name)
    }

    /// All input-kind properties in declaration order.
    pub fn inputs(&self) -> Vec<(Arc<str>, Value)> {
        self.runtime
            .block(self.block)
            .map(|block| {
                block
                    .properties()
                    .filter(|property| property.kind() == PropertyKind::Input)
                    .map(|property| (property.name_arc().clone(), property.value().clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn output(&mut self, value: impl Into<Value>) {
        self.output_to(OUTPUT, value);
    }

    pub fn output_to(&mut self, name: &str, value: impl Into<Value>) {
        // Hooks may run for a block that is already gone; never strict-check
        self.runtime.write(self.block, name, value.into(), Write::Transient);
    }

    /// An error event stamped with the current tick.
    pub fn error(&self, kind: &str, message: impl Into<Arc<str>>) -> ErrorEvent {
        ErrorEvent::new(kind, message, self.tick())
    }

    /// Arm a one-shot timer that calls `Function::on_timer`.
    pub fn set_timer(&mut self, delay_ms: u64) -> TimerId {
        let timer = self.runtime.clock.schedule(delay_ms, TimerTarget::Block(self.block));
        if let Some(block) = self.runtime.blocks.get_mut(self.block) {
            block.timers.push(timer);
        }
        timer
    }

    pub fn clear_timer(&mut self, timer: TimerId) -> bool {
        if let Some(block) = self.runtime.blocks.get_mut(self.block) {
            block.timers.retain(|t| *t != timer);
        }
        self.runtime.clock.cancel(timer)
    }

    /// Full runtime access, for functions that build sub-graphs.
    pub fn runtime(&mut self) -> &mut Runtime {
        &mut *self.runtime
    }
}
