//! Execution request and result types.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exit code reported for timeouts, stalls and exhausted reattaches.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Per-call execution options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOptions {
    /// Working directory for this call only.
    pub cwd: Option<String>,
    /// Total time budget for the call, across reattaches.
    pub timeout: Option<Duration>,
}

impl ExecOptions {
    /// Options with no overrides.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the command in `cwd`.
    #[must_use]
    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Override the call timeout.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Structured result of one `execute` call.
///
/// Session continuity problems never surface as errors; they show up as
/// notices appended to `stderr`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

impl ExecResult {
    /// Whether the command exited with status 0.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Append a line to `stderr`.
    pub fn push_notice(&mut self, notice: &str) {
        if !self.stderr.is_empty() && !self.stderr.ends_with('\n') {
            self.stderr.push('\n');
        }
        self.stderr.push_str(notice);
    }
}
