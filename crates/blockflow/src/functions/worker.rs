//! Flow-backed functions.
//!
//! A worker block builds a private nested flow from the registered data and
//! keeps it under `#flow`. Each run publishes the worker's inputs on the
//! nested flow as the `#inputs` object; whatever the nested flow writes to
//! its `result` property is republished as the worker's `#output`.

use std::sync::Arc;

use serde_json::Value as Json;

use crate::arena::BlockId;
use crate::block::{BlockKind, FlowState};
use crate::error::{FunctionError, Result};
use crate::function::{Function, FunctionContext, RunResult};
use crate::property::{Listener, PropRef, OUTPUT};
use crate::registry::{FunctionCategory, FunctionDesc, PropDesc};
use crate::runtime::Runtime;
use crate::value::Value;

/// Property of the worker holding its nested flow.
pub const FLOW_SLOT: &str = "#flow";
/// Property of the nested flow receiving the worker's inputs.
pub const INPUTS: &str = "#inputs";
/// Property of the nested flow republished as the worker's output.
pub const RESULT: &str = "result";

pub struct FlowFunction {
    function_type: Arc<str>,
    data: Arc<Json>,
    flow: Option<BlockId>,
}

impl FlowFunction {
    pub fn new(function_type: Arc<str>, data: Arc<Json>) -> Self {
        Self { function_type, data, flow: None }
    }

    /// Descriptor built from the flow data's `@inputs` and `@description`.
    pub fn describe(id: &str, data: &Json) -> FunctionDesc {
        let mut desc = FunctionDesc::new(id).category(FunctionCategory::Flow);
        if let Some(inputs) = data.get("@inputs").and_then(Json::as_array) {
            for input in inputs.iter().filter_map(Json::as_str) {
                desc = desc.property(PropDesc::input(input));
            }
        }
        desc = desc.property(PropDesc::output(OUTPUT));
        match data.get("@description").and_then(Json::as_str) {
            Some(description) => desc.describe(description),
            None => desc,
        }
    }
}

impl Function for FlowFunction {
    fn init(&mut self, ctx: &mut FunctionContext<'_>) {
        let worker = ctx.block();
        match ctx.runtime().build_worker_flow(worker, &self.function_type, &self.data) {
            Ok(flow) => self.flow = Some(flow),
            Err(error) => log::warn!("building flow for '{}' on {worker:?} failed: {error}", self.function_type),
        }
    }

    fn run(&mut self, ctx: &mut FunctionContext<'_>) -> std::result::Result<RunResult, FunctionError> {
        let Some(flow) = self.flow else {
            return Err(FunctionError::new("flow", format!("'{}' has no flow", self.function_type)));
        };
        let inputs = ctx.inputs();
        let inputs = Value::object(inputs.into_iter().map(|(name, value)| (name.to_string(), value)));
        ctx.runtime().update_value(flow, INPUTS, inputs)?;
        Ok(RunResult::Done)
    }

    fn config_changed(&mut self, _ctx: &mut FunctionContext<'_>, name: &str, _value: &Value) -> bool {
        name != FLOW_SLOT
    }

    fn cleanup(&mut self, ctx: &mut FunctionContext<'_>) {
        if self.flow.take().is_some() {
            let worker = ctx.block();
            if let Err(error) = ctx.runtime().delete_value(worker, FLOW_SLOT) {
                log::warn!("removing flow of {worker:?} failed: {error}");
            }
        }
    }
}

impl Runtime {
    fn build_worker_flow(&mut self, worker: BlockId, function_type: &Arc<str>, data: &Json) -> Result<BlockId> {
        let state = FlowState {
            history: None,
            function_type: Some(function_type.clone()),
        };
        let flow = self.create_child(worker, FLOW_SLOT, BlockKind::Flow(Box::new(state)), None)?;
        self.load(flow, data)?;
        let name = self.ensure_prop(flow, RESULT);
        let result = PropRef::new(flow, name);
        if let Some(property) = self.prop_mut(&result) {
            property.dispatcher.listen(Listener::Forward(PropRef::new(worker, OUTPUT)));
        }
        let current = self.peek(flow, RESULT);
        if !current.is_undefined() {
            self.output(worker, current, OUTPUT);
        }
        log::debug!("built flow {flow:?} for '{function_type}' on {worker:?}");
        Ok(flow)
    }
}
