//! Command execution: the executor seam, the per-run worker pool and the
//! runtime toggles threaded through every stage.

mod context;
mod executor;
mod pool;

pub use context::ExecutionContext;
#[cfg(test)]
pub use executor::MockCommandExecutor;
pub use executor::{CommandExecutor, Invocation, SubprocessExecutor};
pub use pool::WorkerPool;
