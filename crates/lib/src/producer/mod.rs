//! Producers: versioned computations from input artifacts to output artifacts.

pub mod cmd;
pub mod hooks;
pub mod types;

pub use cmd::CommandCompute;
pub use hooks::{Hook, HookError, HookEvent, HookFailure, HookPoint, Hooks};
pub use types::{BuildContext, Compute, ComputeError, InputBinding, OutputBinding, Producer};
