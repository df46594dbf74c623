//! `delay`: republish `input` after `delay` milliseconds.

use crate::clock::TimerId;
use crate::error::FunctionError;
use crate::function::{CancelMode, CancelReason, Function, FunctionContext, RunResult};
use crate::registry::{FunctionCategory, FunctionDesc, PropDesc};
use crate::runtime::Runtime;
use crate::value::Value;

#[derive(Default)]
pub struct Delay {
    timer: Option<TimerId>,
    /// Input captured when the wait started.
    held: Value,
}

impl Function for Delay {
    fn run(&mut self, ctx: &mut FunctionContext<'_>) -> Result<RunResult, FunctionError> {
        let delay = ctx
            .input("delay")
            .as_number()
            .filter(|ms| ms.is_finite() && *ms >= 0.0)
            .unwrap_or(0.0);
        self.held = ctx.input("input");
        self.timer = Some(ctx.set_timer(delay as u64));
        Ok(RunResult::Wait)
    }

    fn on_timer(&mut self, ctx: &mut FunctionContext<'_>, timer: TimerId) -> Result<RunResult, FunctionError> {
        if self.timer != Some(timer) {
            return Ok(RunResult::Wait);
        }
        self.timer = None;
        ctx.output(std::mem::take(&mut self.held));
        Ok(RunResult::Done)
    }

    fn cancel(&mut self, ctx: &mut FunctionContext<'_>, _reason: CancelReason, _mode: CancelMode) -> bool {
        if let Some(timer) = self.timer.take() {
            ctx.clear_timer(timer);
        }
        self.held = Value::Undefined;
        true
    }
}

pub(crate) fn register(runtime: &mut Runtime) {
    let desc = FunctionDesc::new("delay")
        .category(FunctionCategory::Timing)
        .property(PropDesc::input("input"))
        .property(PropDesc::input("delay").describe("milliseconds"))
        .property(PropDesc::output("#output"))
        .describe("Outputs its input after a delay");
    runtime.register_function(|| Box::<Delay>::default(), desc, None);
}
