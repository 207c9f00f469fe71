//! Instance lifecycle: the registry of live handles and the runtime that
//! starts and stops them.

mod registry;
mod runtime;

pub use registry::{LiveHandle, LiveSummary, Registry};
pub use runtime::InstanceRuntime;
