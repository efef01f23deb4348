//! Tutor Python sandbox
//!
//! Runs student code inside a long-lived Docker container via bollard.
//!
//! The container is started once with `sleep infinity`; every run is a
//! separate `python3 -c` exec, so a crashed program never takes the sandbox
//! down with it.

mod manager;
mod python;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tutor_core::TutorError;

pub use manager::{ContainerManager, CreateContainerOptions};
pub use python::PythonSandbox;

/// Errors that can occur during sandbox operations.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Failed to pull the sandbox image.
    #[error("failed to pull image {image}: {message}")]
    PullFailed {
        /// Image reference.
        image: String,
        /// Underlying failure.
        message: String,
    },

    /// Failed to create container.
    #[error("failed to create container: {0}")]
    CreateFailed(String),

    /// Failed to start container.
    #[error("failed to start container: {0}")]
    StartFailed(String),

    /// Failed to stop container.
    #[error("failed to stop container: {0}")]
    StopFailed(String),

    /// Failed to remove container.
    #[error("failed to remove container: {0}")]
    RemoveFailed(String),

    /// An exec inside the container could not be run.
    #[error("failed to run command in container: {0}")]
    ExecFailed(String),

    /// No container has been started yet.
    #[error("sandbox container is not running")]
    NotStarted,

    /// Docker API error.
    #[error("docker API error: {0}")]
    DockerApi(#[from] bollard::errors::Error),

    /// Invalid container state for the requested operation.
    #[error("invalid container state: expected {expected}, found {actual}")]
    InvalidState {
        /// The expected container state.
        expected: ContainerStatus,
        /// The actual container state.
        actual: ContainerStatus,
    },
}

impl SandboxError {
    /// Maps a startup failure into the engine-initialization error.
    #[must_use]
    pub fn into_init_error(self) -> TutorError {
        TutorError::engine_init(self.to_string())
    }
}

impl From<SandboxError> for TutorError {
    fn from(err: SandboxError) -> Self {
        Self::execution(err.to_string())
    }
}

/// Status of a Docker container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    /// Container has been created but not started.
    #[default]
    Created,
    /// Container is currently running.
    Running,
    /// Container has been stopped.
    Stopped,
    /// Container no longer exists.
    Gone,
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Gone => write!(f, "gone"),
        }
    }
}

/// A Docker container managed by the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    /// Unique identifier assigned by Docker.
    pub id: String,
    /// Human-readable name for the container.
    pub name: String,
    /// Docker image used to create this container.
    pub image: String,
    /// Current status of the container.
    pub status: ContainerStatus,
    /// Timestamp when the container was created.
    pub created_at: DateTime<Utc>,
}

impl Container {
    /// Creates a new container representation.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            image: image.into(),
            status: ContainerStatus::default(),
            created_at: Utc::now(),
        }
    }

    /// Sets the container status.
    #[must_use]
    pub const fn with_status(mut self, status: ContainerStatus) -> Self {
        self.status = status;
        self
    }

    /// Returns whether the container is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.status == ContainerStatus::Running
    }

    /// Returns whether the container can be started.
    #[must_use]
    pub const fn can_start(&self) -> bool {
        matches!(
            self.status,
            ContainerStatus::Created | ContainerStatus::Stopped
        )
    }

    /// Returns whether the container can be stopped.
    #[must_use]
    pub const fn can_stop(&self) -> bool {
        matches!(self.status, ContainerStatus::Running)
    }
}

/// Output of one command run inside the container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutput {
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Exit code, `None` if Docker did not report one.
    pub exit_code: Option<i64>,
    /// `true` when the run was cut off by the timeout.
    pub timed_out: bool,
}

impl RunOutput {
    /// Returns `true` when the command exited with 0 and wrote nothing to stderr.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0) && self.stderr.is_empty()
    }
}
