//! Run Logger
//!
//! Keeps a bounded in-memory history of module runs and optionally appends
//! each entry to a JSON-lines file.

use crate::error::{Result, SandtraceError};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

/// One module run as seen by the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLogEntry {
    pub timestamp: DateTime<Utc>,
    pub run_id: String,
    pub module_name: String,
    pub trace_id: String,
    pub client_ip: Option<String>,
    pub execution_time_ms: u64,
    pub stdin_bytes: usize,
    pub stdout_bytes: usize,
    pub success: bool,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub spans_retained: Option<usize>,
    pub spans_truncated: Option<usize>,
}

pub struct RunLogger {
    log_file: Option<PathBuf>,
    entries: Mutex<VecDeque<RunLogEntry>>,
    max_in_memory_logs: usize,
}

impl RunLogger {
    pub fn new(log_file: Option<PathBuf>, max_in_memory_logs: usize) -> Self {
        Self {
            log_file,
            entries: Mutex::new(VecDeque::new()),
            max_in_memory_logs,
        }
    }

    /// Record a run
    pub fn log_run(&self, entry: RunLogEntry) -> Result<()> {
        if let Some(ref log_file) = self.log_file {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_file)
                .map_err(|e| SandtraceError::Storage(format!("Failed to open run log {}: {}", log_file.display(), e)))?;
            let json = serde_json::to_string(&entry)?;
            writeln!(file, "{}", json)
                .map_err(|e| SandtraceError::Storage(format!("Failed to write run log: {}", e)))?;
        }

        let mut entries = self.entries.lock();
        entries.push_back(entry);
        while entries.len() > self.max_in_memory_logs {
            entries.pop_front();
        }
        Ok(())
    }

    /// Most recent runs first
    pub fn recent(&self, limit: usize) -> Vec<RunLogEntry> {
        self.entries.lock().iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RunLogger {
    fn default() -> Self {
        Self::new(None, 1000)
    }
}
