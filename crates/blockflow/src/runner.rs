//! Block invocation: run requests, hook guarding, WAIT continuations,
//! cancellation and function attach/detach.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::arena::BlockId;
use crate::block::{RunMode, RunState, Write};
use crate::clock::{TimerId, TimerTarget};
use crate::error::FunctionError;
use crate::event::{ErrorEvent, Event};
use crate::function::{CancelMode, CancelReason, Function, FunctionContext, RunResult};
use crate::property::{EMIT, MODE, OUTPUT, WAIT};
use crate::registry::FunctionEntry;
use crate::runtime::Runtime;
use crate::value::Value;

/// Why a run was requested. Decides how `#mode` filters it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunCause {
    Attach,
    Change,
    Call,
    /// Catch-up for a change recorded while the block could not run.
    Pending,
}

pub(crate) enum Invocation {
    Run,
    Timer(TimerId),
    Wake(Value),
}

type HookOutcome = Result<Result<RunResult, FunctionError>, String>;

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "function panicked".to_string()
    }
}

impl Runtime {
    pub(crate) fn request_run(&mut self, id: BlockId, cause: RunCause) {
        let Some(block) = self.blocks.get(id) else {
            return;
        };
        if block.destroying || (block.function.is_none() && !block.busy) {
            return;
        }
        let allowed = match cause {
            RunCause::Attach => block.mode.runs_on_attach(),
            RunCause::Change => block.mode.runs_on_change(),
            RunCause::Call | RunCause::Pending => true,
        };
        if !allowed {
            return;
        }
        let state = block.state;
        let queued = block.queued;
        let blocked = block.busy || matches!(state, RunState::Running | RunState::Waiting) || self.is_disabled(id);
        if blocked {
            if let Some(block) = self.blocks.get_mut(id) {
                block.pending = true;
            }
            return;
        }
        if queued {
            // Already listed; a swapped function may have reset the state.
            if let Some(block) = self.blocks.get_mut(id) {
                block.state = RunState::Queued;
            }
            return;
        }
        if state == RunState::Queued {
            return;
        }
        self.schedule(id);
    }

    fn schedule(&mut self, id: BlockId) {
        let sync = self.blocks.get(id).is_some_and(|block| block.sync);
        if sync && self.sync_depth < self.config.sync_depth_limit {
            self.sync_depth += 1;
            self.invoke(id, Invocation::Run);
            self.sync_depth -= 1;
        } else {
            self.queue_block(id);
        }
    }

    pub(crate) fn invoke(&mut self, id: BlockId, invocation: Invocation) {
        let Some(block) = self.blocks.get_mut(id) else {
            return;
        };
        if block.busy {
            block.pending = true;
            return;
        }
        let Some(mut function) = block.function.take() else {
            return;
        };
        block.busy = true;
        block.state = RunState::Running;
        if matches!(invocation, Invocation::Run) {
            block.pending = false;
        }
        let epoch = block.function_epoch;
        let outcome = self.guarded(id, function.as_mut(), |function, ctx| match invocation {
            Invocation::Run => function.run(ctx),
            Invocation::Timer(timer) => function.on_timer(ctx, timer),
            Invocation::Wake(payload) => function.on_wake(ctx, &payload),
        });
        self.restore_function(id, epoch, function);
        self.finish(id, epoch, outcome);
    }

    /// Run a hook with panics caught.
    fn guarded<R>(
        &mut self,
        id: BlockId,
        function: &mut dyn Function,
        hook: impl FnOnce(&mut dyn Function, &mut FunctionContext<'_>) -> R,
    ) -> Result<R, String> {
        let mut ctx = FunctionContext::new(self, id);
        panic::catch_unwind(AssertUnwindSafe(|| hook(function, &mut ctx))).map_err(panic_message)
    }

    /// Call a non-run hook on the block's function. `None` when there is no
    /// function, it is busy, or the hook panicked.
    pub(crate) fn call_hook<R>(
        &mut self,
        id: BlockId,
        hook: impl FnOnce(&mut dyn Function, &mut FunctionContext<'_>) -> R,
    ) -> Option<R> {
        let block = self.blocks.get_mut(id)?;
        if block.busy {
            return None;
        }
        let mut function = block.function.take()?;
        block.busy = true;
        let epoch = block.function_epoch;
        let outcome = self.guarded(id, function.as_mut(), hook);
        self.restore_function(id, epoch, function);
        match outcome {
            Ok(value) => {
                self.resume_pending(id);
                Some(value)
            }
            Err(message) => {
                self.publish_error(id, FunctionError::panic(message), true);
                None
            }
        }
    }

    /// Put a function back after a hook. If it was replaced or its block
    /// destroyed meanwhile, it is retired instead.
    fn restore_function(&mut self, id: BlockId, epoch: u32, function: Box<dyn Function>) {
        match self.blocks.get_mut(id) {
            Some(block) if block.function_epoch == epoch => {
                block.function = Some(function);
                block.busy = false;
            }
            _ => self.retire_function(id, function),
        }
    }

    fn retire_function(&mut self, id: BlockId, mut function: Box<dyn Function>) {
        let outcome = self.guarded(id, function.as_mut(), |function, ctx| {
            function.cleanup(ctx);
            function.destroy(ctx);
        });
        if let Err(message) = outcome {
            log::error!("function teardown on {id:?} panicked: {message}");
        }
    }

    fn finish(&mut self, id: BlockId, epoch: u32, outcome: HookOutcome) {
        let Some(block) = self.blocks.get_mut(id) else {
            return;
        };
        if block.function_epoch != epoch {
            // detached while running; the result belongs to nobody
            return;
        }
        let result = match outcome {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(error)) => Err((error, false)),
            Err(message) => Err((FunctionError::panic(message), true)),
        };
        let waiting = matches!(result, Ok(RunResult::Wait));
        block.state = if waiting {
            RunState::Waiting
        } else if block.queued {
            RunState::Queued
        } else {
            RunState::Idle
        };
        if waiting || self.peek(id, WAIT).is_truthy() {
            self.write(id, WAIT, Value::Bool(waiting), Write::Transient);
        }
        let tick = self.tick();
        match result {
            Ok(RunResult::Done) => self.write(id, EMIT, Event::complete(tick).into(), Write::Transient),
            Ok(RunResult::Wait) => {}
            Ok(RunResult::Error(error)) => self.write(id, EMIT, error.into(), Write::Transient),
            Err((error, panicked)) => self.publish_error(id, error, panicked),
        }
        self.resume_pending(id);
    }

    /// Queue the one run a block owes after it became idle again.
    fn resume_pending(&mut self, id: BlockId) {
        let owes = self
            .blocks
            .get(id)
            .is_some_and(|block| block.pending && !block.busy && block.state == RunState::Idle);
        if !owes || self.is_disabled(id) {
            return;
        }
        if let Some(block) = self.blocks.get_mut(id) {
            block.pending = false;
        }
        self.request_run(id, RunCause::Pending);
    }

    fn publish_error(&mut self, id: BlockId, error: FunctionError, panicked: bool) {
        if panicked {
            log::error!("function on {id:?} panicked: {}", error.message);
        } else {
            log::warn!("function on {id:?} failed: {error}");
        }
        let event = ErrorEvent::new(error.kind, error.message, self.tick());
        self.write(id, OUTPUT, event.clone().into(), Write::Transient);
        self.write(id, EMIT, event.into(), Write::Transient);
    }

    // ----- attach / detach -----

    /// React to a new `#is` value.
    pub(crate) fn set_function_id(&mut self, id: BlockId, value: &Value) {
        let key: Option<Arc<str>> = value.as_str().filter(|key| !key.is_empty()).map(Arc::from);
        let Some(block) = self.blocks.get_mut(id) else {
            return;
        };
        let old = std::mem::replace(&mut block.function_id, key.clone());
        if old == key {
            return;
        }
        if let Some(old) = old {
            self.registry.unlisten(&old, id);
        }
        self.detach_function(id, CancelReason::Reconfigure);
        if let Some(key) = key {
            match self.registry.listen(&key, id) {
                Some(entry) => self.attach_function(id, entry),
                None => log::debug!("{id:?} waits for function '{key}'"),
            }
        }
    }

    pub(crate) fn attach_function(&mut self, id: BlockId, entry: Arc<FunctionEntry>) {
        if self.blocks.get(id).is_none_or(|block| block.destroying) {
            return;
        }
        self.detach_function(id, CancelReason::Reconfigure);
        let function = entry.create();
        let desc = entry.desc();
        let mode = self.peek(id, MODE);
        let Some(block) = self.blocks.get_mut(id) else {
            return;
        };
        block.function_epoch = block.function_epoch.wrapping_add(1);
        block.busy = false;
        block.priority = desc.priority.min(3) as i8;
        block.default_mode = desc.mode;
        block.mode = mode.as_str().and_then(RunMode::parse).unwrap_or(desc.mode);
        block.function = Some(function);
        log::debug!("attached '{}' to {id:?}", entry.key());
        self.call_hook(id, |function, ctx| function.init(ctx));
        self.request_run(id, RunCause::Attach);
    }

    pub(crate) fn detach_function(&mut self, id: BlockId, reason: CancelReason) {
        let Some(block) = self.blocks.get(id) else {
            return;
        };
        if block.state == RunState::Waiting {
            self.cancel_waiting(id, reason, CancelMode::Hard);
        }
        let Some(block) = self.blocks.get_mut(id) else {
            return;
        };
        block.function_epoch = block.function_epoch.wrapping_add(1);
        block.busy = false;
        block.priority = -1;
        block.state = if block.queued { RunState::Queued } else { RunState::Idle };
        block.pending = false;
        let function = block.function.take();
        self.clear_block_timers(id);
        if let Some(function) = function {
            log::debug!("detaching function from {id:?} ({reason:?})");
            self.retire_function(id, function);
        }
    }

    // ----- WAIT -----

    /// Force a waiting block out of WAIT. With [`CancelMode::Soft`] the
    /// function may refuse.
    pub(crate) fn cancel_waiting(&mut self, id: BlockId, reason: CancelReason, mode: CancelMode) -> bool {
        if self.blocks.get(id).map(|block| block.state) != Some(RunState::Waiting) {
            return false;
        }
        let accepted = self
            .call_hook(id, |function, ctx| function.cancel(ctx, reason, mode))
            .unwrap_or(true);
        if !accepted && mode == CancelMode::Soft {
            return false;
        }
        self.clear_block_timers(id);
        if let Some(block) = self.blocks.get_mut(id) {
            block.state = RunState::Idle;
            block.pending = false;
        }
        self.write(id, WAIT, Value::Bool(false), Write::Transient);
        true
    }

    /// Cancel a waiting block. Returns whether it left WAIT.
    pub fn cancel_block(&mut self, block: BlockId) -> bool {
        if !self.check_live(block) {
            return false;
        }
        self.cancel_waiting(block, CancelReason::Manual, CancelMode::Soft)
    }

    /// Resume a waiting block through `Function::on_wake`.
    pub fn wake(&mut self, block: BlockId, payload: impl Into<Value>) -> bool {
        if !self.check_live(block) {
            return false;
        }
        let waiting = self
            .blocks
            .get(block)
            .is_some_and(|b| b.state == RunState::Waiting && !b.busy);
        if waiting {
            self.invoke(block, Invocation::Wake(payload.into()));
        }
        waiting
    }

    /// Move the virtual clock forward, firing due timers in deadline order
    /// and draining the scheduler after each.
    pub fn advance_time(&mut self, ms: u64) {
        let target = self.clock.now_ms().saturating_add(ms);
        while let Some(fired) = self.clock.pop_due(target) {
            match fired.target {
                TimerTarget::Block(block) => self.fire_block_timer(block, fired.id),
                TimerTarget::History(flow) => self.capture_history(flow, fired.id),
            }
            self.run_all(self.config.run_all_limit);
        }
        self.clock.advance_to(target);
        self.run_all(self.config.run_all_limit);
    }

    fn fire_block_timer(&mut self, id: BlockId, timer: TimerId) {
        let Some(block) = self.blocks.get_mut(id) else {
            return;
        };
        let before = block.timers.len();
        block.timers.retain(|t| *t != timer);
        if block.timers.len() == before {
            return;
        }
        self.invoke(id, Invocation::Timer(timer));
    }

    pub(crate) fn clear_block_timers(&mut self, id: BlockId) {
        let Some(block) = self.blocks.get_mut(id) else {
            return;
        };
        for timer in std::mem::take(&mut block.timers) {
            self.clock.cancel(timer);
        }
    }
}
