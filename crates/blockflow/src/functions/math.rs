//! Arithmetic over numbered inputs `0`..`n-1`, where `n` comes from the
//! `+num` structural config (2 by default). Any missing or non-numeric input
//! makes the output undefined.

use serde_json::json;

use crate::error::FunctionError;
use crate::function::{Function, FunctionContext, RunResult};
use crate::registry::{FunctionCategory, FunctionDesc, PropDesc};
use crate::runtime::Runtime;
use crate::value::Value;

const NUM: &str = "+num";
const DEFAULT_INPUTS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MathOp {
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl MathOp {
    pub const ALL: [MathOp; 4] = [MathOp::Add, MathOp::Subtract, MathOp::Multiply, MathOp::Divide];

    pub fn id(self) -> &'static str {
        match self {
            MathOp::Add => "add",
            MathOp::Subtract => "subtract",
            MathOp::Multiply => "multiply",
            MathOp::Divide => "divide",
        }
    }

    fn apply(self, lhs: f64, rhs: f64) -> f64 {
        match self {
            MathOp::Add => lhs + rhs,
            MathOp::Subtract => lhs - rhs,
            MathOp::Multiply => lhs * rhs,
            MathOp::Divide => lhs / rhs,
        }
    }
}

pub struct MathFunction {
    op: MathOp,
}

impl MathFunction {
    pub fn new(op: MathOp) -> Self {
        Self { op }
    }

    fn compute(&self, ctx: &FunctionContext<'_>) -> Option<f64> {
        let count = ctx
            .input(NUM)
            .as_number()
            .filter(|n| n.is_finite() && *n >= 0.0)
            .map_or(DEFAULT_INPUTS, |n| n as usize);
        let mut result: Option<f64> = None;
        for index in 0..count {
            let operand = ctx.input(&index.to_string()).as_number()?;
            result = Some(match result {
                Some(acc) => self.op.apply(acc, operand),
                None => operand,
            });
        }
        result
    }
}

impl Function for MathFunction {
    fn run(&mut self, ctx: &mut FunctionContext<'_>) -> Result<RunResult, FunctionError> {
        let value = self.compute(ctx).map(Value::Number).unwrap_or_default();
        ctx.output(value);
        Ok(RunResult::Done)
    }
}

pub(crate) fn register(runtime: &mut Runtime) {
    for op in MathOp::ALL {
        let desc = FunctionDesc::new(op.id())
            .category(FunctionCategory::Math)
            .property(PropDesc::input("0"))
            .property(PropDesc::input("1"))
            .property(PropDesc::config(NUM, json!(DEFAULT_INPUTS)).describe("number of operands"))
            .property(PropDesc::output("#output"));
        runtime.register_function(move || Box::new(MathFunction::new(op)), desc, None);
    }
}
