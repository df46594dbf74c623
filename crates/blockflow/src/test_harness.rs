//! Recording functions and watchers shared by the unit tests.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::block::{BlockWatcher, ChildChange};
use crate::error::FunctionError;
use crate::function::{Function, FunctionContext, RunResult};
use crate::registry::FunctionDesc;
use crate::value::Value;

pub fn counter() -> Rc<Cell<usize>> {
    Rc::new(Cell::new(0))
}

/// Counts runs.
pub struct Probe {
    runs: Rc<Cell<usize>>,
}

impl Probe {
    pub fn new(runs: Rc<Cell<usize>>) -> Self {
        Self { runs }
    }
}

impl Function for Probe {
    fn run(&mut self, _ctx: &mut FunctionContext<'_>) -> Result<RunResult, FunctionError> {
        self.runs.set(self.runs.get() + 1);
        Ok(RunResult::Done)
    }
}

pub fn probe_desc(id: &str) -> FunctionDesc {
    FunctionDesc::new(id).describe("test probe")
}

/// Subscription callback collecting every delivered value.
pub fn record_values() -> (Rc<RefCell<Vec<Value>>>, impl FnMut(&Value) + 'static) {
    let values = Rc::new(RefCell::new(Vec::new()));
    let sink = values.clone();
    (values, move |value: &Value| sink.borrow_mut().push(value.clone()))
}

#[derive(Default)]
pub struct RecordingWatcher {
    changes: RefCell<Vec<ChildChange>>,
}

impl RecordingWatcher {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn changes(&self) -> Vec<ChildChange> {
        self.changes.borrow().clone()
    }
}

impl BlockWatcher for RecordingWatcher {
    fn on_child_change(&self, change: &ChildChange) {
        self.changes.borrow_mut().push(change.clone());
    }
}

pub fn run_log() -> Rc<RefCell<Vec<String>>> {
    Rc::new(RefCell::new(Vec::new()))
}

/// Logs the name its block lives under on every run and outputs the run
/// count, so anything bound to its output changes each time.
pub struct LoggingFunction {
    log: Rc<RefCell<Vec<String>>>,
    runs: i64,
}

impl LoggingFunction {
    pub fn new(log: Rc<RefCell<Vec<String>>>) -> Self {
        Self { log, runs: 0 }
    }
}

impl Function for LoggingFunction {
    fn run(&mut self, ctx: &mut FunctionContext<'_>) -> Result<RunResult, FunctionError> {
        let block = ctx.block();
        let name = ctx
            .runtime()
            .block(block)
            .and_then(|b| b.parent())
            .map(|parent| parent.name.to_string())
            .unwrap_or_default();
        self.log.borrow_mut().push(name);
        self.runs += 1;
        ctx.output(self.runs);
        Ok(RunResult::Done)
    }
}

/// Waits until woken, then outputs the wake payload.
pub struct Waiter;

impl Function for Waiter {
    fn run(&mut self, _ctx: &mut FunctionContext<'_>) -> Result<RunResult, FunctionError> {
        Ok(RunResult::Wait)
    }

    fn on_wake(&mut self, ctx: &mut FunctionContext<'_>, payload: &Value) -> Result<RunResult, FunctionError> {
        ctx.output(payload.clone());
        Ok(RunResult::Done)
    }
}

pub enum Failing {
    Err,
    Panic,
}

impl Function for Failing {
    fn run(&mut self, _ctx: &mut FunctionContext<'_>) -> Result<RunResult, FunctionError> {
        match self {
            Failing::Err => Err(FunctionError::new("test", "failed on purpose")),
            Failing::Panic => panic!("boom"),
        }
    }
}
