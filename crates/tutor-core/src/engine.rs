//! The sandboxed code execution seam.
//!
//! The controller only talks to an [`ExecutionEngine`]; the Docker-backed
//! implementation lives in the `tutor-sandbox` crate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Outcome of a single code run.
///
/// A run that raised inside the interpreter is still a result: its traceback
/// is in `stderr` and `success` is `false`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// `true` when the run exited cleanly and wrote nothing to stderr.
    pub success: bool,
}

impl ExecutionResult {
    /// Creates a successful result with the given output.
    #[must_use]
    pub fn succeeded(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            success: true,
        }
    }

    /// Creates a failed result with the given error text.
    #[must_use]
    pub fn failed(stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            success: false,
        }
    }
}

/// A sandboxed Python interpreter.
///
/// A single instance is shared by the whole session. Runs are not queued;
/// implementations must tolerate concurrent `execute` calls.
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// Prepares the interpreter. Called once at bootstrap.
    async fn initialize(&self) -> Result<()>;

    /// Returns `true` once [`initialize`](Self::initialize) has succeeded.
    fn ready(&self) -> bool;

    /// Runs `code` and captures its output.
    ///
    /// Interpreter-level failures are reported inside the result. An `Err`
    /// means the engine itself could not run the code.
    async fn execute(&self, code: &str) -> Result<ExecutionResult>;

    /// Clears per-session interpreter state.
    async fn reset(&self) -> Result<()>;
}
