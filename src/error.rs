use serde::Serialize;
use thiserror::Error;

/// Why a guest execution ended abnormally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "code", rename_all = "snake_case")]
pub enum ExecutionErrorKind {
    /// Illegal instruction, out-of-bounds access, unreachable, stack overflow.
    Trap,
    /// Wall-clock deadline exceeded; the instance was interrupted.
    Timeout,
    /// The guest called `proc_exit` with a non-zero status.
    Exit(i32),
}

impl std::fmt::Display for ExecutionErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionErrorKind::Trap => write!(f, "trap"),
            ExecutionErrorKind::Timeout => write!(f, "timeout"),
            ExecutionErrorKind::Exit(code) => write!(f, "exit({})", code),
        }
    }
}

#[derive(Error, Debug)]
pub enum SandtraceError {
    #[error("Invalid upload: {0}")]
    InvalidUpload(String),

    #[error("Module not found: {0}")]
    ModuleNotFound(String),

    #[error("Instantiation failure: {0}")]
    InstantiationFailure(String),

    #[error("Execution error ({kind}): {message}")]
    Execution {
        kind: ExecutionErrorKind,
        message: String,
    },

    #[error("Invalid span reference: {0}")]
    InvalidSpanReference(u64),

    #[error("Span limit of {0} reached")]
    SpanLimitExceeded(usize),

    #[error("Trace {0} already finalized")]
    AlreadyFinalized(String),

    #[error("Export failure: {0}")]
    ExportFailure(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SandtraceError {
    pub fn execution(kind: ExecutionErrorKind, message: impl Into<String>) -> Self {
        SandtraceError::Execution {
            kind,
            message: message.into(),
        }
    }

    /// HTTP status the error surfaces as.
    pub fn status_code(&self) -> u16 {
        match self {
            SandtraceError::InvalidUpload(_) => 400,
            SandtraceError::ModuleNotFound(_) => 404,
            _ => 500,
        }
    }

    /// Stable label used in responses, metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            SandtraceError::InvalidUpload(_) => "invalid_upload",
            SandtraceError::ModuleNotFound(_) => "module_not_found",
            SandtraceError::InstantiationFailure(_) => "instantiation_failure",
            SandtraceError::Execution { kind, .. } => match kind {
                ExecutionErrorKind::Trap => "trap",
                ExecutionErrorKind::Timeout => "timeout",
                ExecutionErrorKind::Exit(_) => "exit",
            },
            SandtraceError::InvalidSpanReference(_) => "invalid_span_reference",
            SandtraceError::SpanLimitExceeded(_) => "span_limit_exceeded",
            SandtraceError::AlreadyFinalized(_) => "already_finalized",
            SandtraceError::ExportFailure(_) => "export_failure",
            SandtraceError::Storage(_) => "storage",
            SandtraceError::Config(_) => "config",
            SandtraceError::Io(_) => "io",
            SandtraceError::Json(_) => "json",
        }
    }
}

pub type Result<T> = std::result::Result<T, SandtraceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(SandtraceError::InvalidUpload("x".into()).status_code(), 400);
        assert_eq!(SandtraceError::ModuleNotFound("demo".into()).status_code(), 404);
        assert_eq!(
            SandtraceError::execution(ExecutionErrorKind::Timeout, "slow").status_code(),
            500
        );
        assert_eq!(
            SandtraceError::InstantiationFailure("bad magic".into()).status_code(),
            500
        );
    }

    #[test]
    fn test_execution_kind_labels() {
        let err = SandtraceError::execution(ExecutionErrorKind::Exit(3), "exited");
        assert_eq!(err.kind(), "exit");
        assert_eq!(err.to_string(), "Execution error (exit(3)): exited");
    }
}
