//! Docker container manager for the Python sandbox.
//!
//! This module provides the [`ContainerManager`] struct for the container
//! lifecycle and for running commands inside a container through bollard.

use std::time::Duration;

use bollard::container::{
    Config as BollardConfig, CreateContainerOptions as BollardCreateOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures::StreamExt;
use tracing::{debug, info, instrument, warn};

use crate::{Container, ContainerStatus, RunOutput, SandboxError};

/// Default memory cap for a sandbox container (256 MiB).
const DEFAULT_MEMORY_LIMIT: i64 = 256 * 1024 * 1024;

/// Seconds Docker waits before killing a container on stop.
const STOP_GRACE_SECS: i64 = 2;

/// Options for creating a new Docker container.
///
/// # Example
///
/// ```no_run
/// use tutor_sandbox::CreateContainerOptions;
///
/// let options = CreateContainerOptions::new("tutor-sandbox", "python:3.12-alpine")
///     .with_cmd(vec!["sleep", "infinity"])
///     .with_env("PYTHONUNBUFFERED", "1");
/// ```
#[derive(Debug, Clone)]
pub struct CreateContainerOptions {
    /// Human-readable name for the container.
    pub name: String,
    /// Docker image to use.
    pub image: String,
    /// Environment variables to set in the container.
    pub env: Option<Vec<String>>,
    /// Optional command to run instead of the image's default.
    pub cmd: Option<Vec<String>>,
    /// Memory cap in bytes.
    pub memory_limit: i64,
    /// Disables networking inside the container.
    pub network_disabled: bool,
}

impl CreateContainerOptions {
    /// Creates options with no network and the default memory cap.
    #[must_use]
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            env: None,
            cmd: None,
            memory_limit: DEFAULT_MEMORY_LIMIT,
            network_disabled: true,
        }
    }

    /// Adds an environment variable as a `KEY=VALUE` string.
    #[must_use]
    pub fn with_env(mut self, key: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        let env_var = format!("{}={}", key.as_ref(), value.as_ref());
        match &mut self.env {
            Some(env) => env.push(env_var),
            None => self.env = Some(vec![env_var]),
        }
        self
    }

    /// Sets the command to run in the container.
    ///
    /// This overrides the image's default `CMD` instruction.
    #[must_use]
    pub fn with_cmd(mut self, cmd: Vec<impl Into<String>>) -> Self {
        self.cmd = Some(cmd.into_iter().map(Into::into).collect());
        self
    }

    /// Sets the memory cap in bytes.
    #[must_use]
    pub const fn with_memory_limit(mut self, bytes: i64) -> Self {
        self.memory_limit = bytes;
        self
    }
}

/// Manages Docker container operations for the sandbox.
///
/// `ContainerManager` wraps a bollard [`Docker`] client.
///
/// # Example
///
/// ```no_run
/// use tutor_sandbox::ContainerManager;
///
/// # async fn example() -> Result<(), tutor_sandbox::SandboxError> {
/// let manager = ContainerManager::new()?;
/// manager.health_check().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ContainerManager {
    docker: Docker,
}

impl ContainerManager {
    /// Connects to the local Docker daemon.
    ///
    /// Uses the Unix socket on Linux/macOS and the named pipe on Windows.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::DockerApi`] if the connection fails.
    pub fn new() -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()?;
        debug!("Connected to Docker daemon");
        Ok(Self { docker })
    }

    /// Checks that the Docker daemon is reachable.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::DockerApi`] if the ping fails, which usually
    /// means the daemon is not running.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), SandboxError> {
        self.docker.ping().await?;
        debug!("Docker daemon health check passed");
        Ok(())
    }

    /// Pulls `image` unless it is already present locally.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::PullFailed`] if the pull stream reports an error.
    #[instrument(skip(self))]
    pub async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => {
                debug!("Image already present");
                return Ok(());
            }
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => return Err(e.into()),
        }

        info!("Pulling sandbox image, this can take a moment");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            let progress = progress.map_err(|e| SandboxError::PullFailed {
                image: image.to_string(),
                message: e.to_string(),
            })?;
            if let Some(status) = progress.status {
                debug!(status = %status, "Pull progress");
            }
        }

        info!("Image pulled");
        Ok(())
    }

    /// Creates a new container with the specified options.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::CreateFailed`] if the Docker API rejects the
    /// request.
    #[instrument(skip(self), fields(name = %options.name, image = %options.image))]
    pub async fn create_container(
        &self,
        options: CreateContainerOptions,
    ) -> Result<Container, SandboxError> {
        let host_config = HostConfig {
            memory: Some(options.memory_limit),
            network_mode: options.network_disabled.then(|| "none".to_string()),
            ..Default::default()
        };

        let config = BollardConfig {
            image: Some(options.image.clone()),
            env: options.env.clone(),
            cmd: options.cmd.clone(),
            network_disabled: Some(options.network_disabled),
            host_config: Some(host_config),
            ..Default::default()
        };

        let create_options = BollardCreateOptions {
            name: options.name.as_str(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(create_options), config)
            .await
            .map_err(|e| SandboxError::CreateFailed(e.to_string()))?;

        for warning in &response.warnings {
            warn!(container_id = %response.id, warning = %warning, "Docker warning during container creation");
        }

        info!(container_id = %response.id, "Container created");

        Ok(Container::new(&response.id, &options.name, &options.image)
            .with_status(ContainerStatus::Created))
    }

    /// Starts a created or stopped container.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::InvalidState`] if the container cannot be
    /// started, or [`SandboxError::StartFailed`] on a Docker failure.
    #[instrument(skip(self, container), fields(container_id = %container.id))]
    pub async fn start_container(&self, container: &mut Container) -> Result<(), SandboxError> {
        if !container.can_start() {
            return Err(SandboxError::InvalidState {
                expected: ContainerStatus::Created,
                actual: container.status,
            });
        }

        self.docker
            .start_container(&container.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::StartFailed(e.to_string()))?;

        container.status = ContainerStatus::Running;
        info!("Container started");
        Ok(())
    }

    /// Stops a running container.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::StopFailed`] on a Docker failure.
    #[instrument(skip(self, container), fields(container_id = %container.id))]
    pub async fn stop_container(&self, container: &mut Container) -> Result<(), SandboxError> {
        if !container.can_stop() {
            debug!(status = %container.status, "Container not running, nothing to stop");
            return Ok(());
        }

        self.docker
            .stop_container(
                &container.id,
                Some(StopContainerOptions {
                    t: STOP_GRACE_SECS,
                }),
            )
            .await
            .map_err(|e| SandboxError::StopFailed(e.to_string()))?;

        container.status = ContainerStatus::Stopped;
        info!("Container stopped");
        Ok(())
    }

    /// Force-removes a container.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::RemoveFailed`] on a Docker failure.
    #[instrument(skip(self, container), fields(container_id = %container.id))]
    pub async fn remove_container(&self, container: &mut Container) -> Result<(), SandboxError> {
        self.docker
            .remove_container(
                &container.id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| SandboxError::RemoveFailed(e.to_string()))?;

        container.status = ContainerStatus::Gone;
        info!("Container removed");
        Ok(())
    }

    /// Runs `cmd` inside a running container and captures its output.
    ///
    /// Standard output and standard error are collected separately. If the
    /// command does not finish within `limit`, the partial output is returned
    /// with `timed_out` set; the process itself is left for the caller to kill.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::NotStarted`] if the container is not running,
    /// or [`SandboxError::ExecFailed`] if the exec cannot be created or
    /// attached.
    #[instrument(skip(self, container, cmd), fields(container_id = %container.id))]
    pub async fn exec(
        &self,
        container: &Container,
        cmd: Vec<String>,
        limit: Duration,
    ) -> Result<RunOutput, SandboxError> {
        if !container.is_running() {
            return Err(SandboxError::NotStarted);
        }

        let exec = self
            .docker
            .create_exec(
                &container.id,
                CreateExecOptions {
                    cmd: Some(cmd),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| SandboxError::ExecFailed(e.to_string()))?;

        let started = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| SandboxError::ExecFailed(e.to_string()))?;

        let StartExecResults::Attached { mut output, .. } = started else {
            return Err(SandboxError::ExecFailed(
                "exec started detached, no output to collect".to_string(),
            ));
        };

        let mut run = RunOutput::default();
        let collect = async {
            while let Some(chunk) = output.next().await {
                match chunk.map_err(|e| SandboxError::ExecFailed(e.to_string()))? {
                    LogOutput::StdOut { message } | LogOutput::Console { message } => {
                        run.stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    LogOutput::StdErr { message } => {
                        run.stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    LogOutput::StdIn { .. } => {}
                }
            }
            Ok::<(), SandboxError>(())
        };

        let collected = tokio::time::timeout(limit, collect).await;
        match collected {
            Ok(collected) => collected?,
            Err(_) => {
                warn!(limit_secs = limit.as_secs(), "Exec timed out");
                run.timed_out = true;
                return Ok(run);
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| SandboxError::ExecFailed(e.to_string()))?;
        run.exit_code = inspect.exit_code;

        debug!(
            exit_code = ?run.exit_code,
            stdout_bytes = run.stdout.len(),
            stderr_bytes = run.stderr.len(),
            "Exec finished"
        );
        Ok(run)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn create_container_options_defaults() {
        let options = CreateContainerOptions::new("tutor-sandbox", "python:3.12-alpine");
        assert_eq!(options.name, "tutor-sandbox");
        assert_eq!(options.image, "python:3.12-alpine");
        assert!(options.env.is_none());
        assert!(options.cmd.is_none());
        assert!(options.network_disabled);
        assert_eq!(options.memory_limit, DEFAULT_MEMORY_LIMIT);
    }

    #[test]
    fn create_container_options_builders() {
        let options = CreateContainerOptions::new("t", "python:3.12-alpine")
            .with_env("PYTHONUNBUFFERED", "1")
            .with_env("PYTHONDONTWRITEBYTECODE", "1")
            .with_cmd(vec!["sleep", "infinity"])
            .with_memory_limit(64 * 1024 * 1024);

        let env = options.env.expect("env should be Some");
        assert_eq!(env, vec!["PYTHONUNBUFFERED=1", "PYTHONDONTWRITEBYTECODE=1"]);
        assert_eq!(options.cmd.expect("cmd should be Some"), vec!["sleep", "infinity"]);
        assert_eq!(options.memory_limit, 64 * 1024 * 1024);
    }

    #[tokio::test]
    #[ignore = "requires running Docker daemon"]
    async fn health_check_succeeds_with_running_docker() {
        let manager = ContainerManager::new().expect("Failed to create manager");
        assert_ok!(manager.health_check().await);
    }

    #[tokio::test]
    #[ignore = "requires running Docker daemon"]
    async fn exec_separates_stdout_and_stderr() {
        let manager = ContainerManager::new().expect("Failed to create manager");
        manager.ensure_image("alpine:latest").await.unwrap();

        let options = CreateContainerOptions::new("tutor-test-exec", "alpine:latest")
            .with_cmd(vec!["sleep", "infinity"]);
        let mut container = manager.create_container(options).await.unwrap();
        manager.start_container(&mut container).await.unwrap();

        let cmd = vec![
            "sh".to_string(),
            "-c".to_string(),
            "echo out; echo err >&2; exit 3".to_string(),
        ];
        let run = assert_ok!(manager.exec(&container, cmd, Duration::from_secs(10)).await);

        assert_eq!(run.stdout, "out\n");
        assert_eq!(run.stderr, "err\n");
        assert_eq!(run.exit_code, Some(3));
        assert!(!run.is_clean());

        manager.remove_container(&mut container).await.unwrap();
        assert_eq!(container.status, ContainerStatus::Gone);
    }

    #[tokio::test]
    async fn exec_requires_running_container() {
        let Ok(manager) = ContainerManager::new() else {
            return;
        };
        let container = Container::new("missing", "t", "alpine:latest");
        let err = assert_err!(
            manager
                .exec(&container, vec!["true".into()], Duration::from_secs(1))
                .await
        );
        assert!(matches!(err, SandboxError::NotStarted));
    }
}
