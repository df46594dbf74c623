//! Built-in functions.

pub mod math;
pub mod timer;
pub mod worker;

use crate::runtime::Runtime;

pub fn register_builtins(runtime: &mut Runtime) {
    math::register(runtime);
    timer::register(runtime);
}
