pub mod engine;
mod host;
mod instrument;
pub mod wasi;

pub use engine::{check_capabilities, ExecutionReport, ExecutionRequest, SandboxConfig, SandboxEngine};
