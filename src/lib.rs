//! sandtrace: runs untrusted WebAssembly modules for HTTP clients and
//! exports one correlated trace per execution.

pub mod collector;
pub mod config;
pub mod error;
pub mod exporter;
pub mod guest;
pub mod http;
pub mod observability;
pub mod runner;
pub mod sandbox;
pub mod span;
pub mod storage;

pub use collector::{HostContext, TraceCollector};
pub use config::Config;
pub use error::{ExecutionErrorKind, Result, SandtraceError};
pub use runner::{ModuleRunner, RunOutput, RunRequest};
