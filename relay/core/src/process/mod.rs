//! External tool execution

mod invocation;
mod orchestrator;

pub use invocation::PreparedInvocation;
pub use orchestrator::{Fragment, ProcessConfig, ProcessOrchestrator, ProcessOutput};
