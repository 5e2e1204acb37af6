//! Kind-specific run behaviors, dispatched from `runtime::node`.

pub mod common;
pub mod event;
pub mod flow;
pub mod subprocess;
pub mod thread;
