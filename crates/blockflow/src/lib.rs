//! Reactive block/property dataflow engine.
//!
//! A [`Runtime`] owns a graph of blocks. Properties hold literals or bind
//! through paths to other properties; a priority scheduler re-runs only the
//! blocks whose inputs changed, inside one synchronous tick.

pub mod arena;
pub mod binding;
pub mod block;
pub mod clock;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod flow;
pub mod function;
pub mod functions;
pub mod history;
pub mod path;
pub mod property;
pub mod registry;
pub mod runner;
pub mod runtime;
pub mod scheduler;
pub mod shared;
pub mod snapshot;
pub mod storage;
pub mod value;
pub mod view;

#[cfg(test)]
mod test_harness;

pub use arena::{BindingId, BlockId};
pub use block::{Block, BlockKind, BlockWatcher, ChildChange, RunMode, RunState};
pub use clock::TimerId;
pub use error::{FlowError, FunctionError, Result};
pub use event::{ErrorEvent, Event, EventType};
pub use function::{CancelMode, CancelReason, Function, FunctionContext, RunResult};
pub use path::{Path, Segment};
pub use property::{Property, PropertyKind, PropRef, SubscriptionId};
pub use registry::{FunctionCategory, FunctionDesc, PropDesc};
pub use runtime::{Runtime, RuntimeConfig};
pub use storage::{FileStorage, MemoryStorage, Storage};
pub use value::{SameValue, Value};
pub use view::{BlockView, PropertyAccessor, ViewMode};
