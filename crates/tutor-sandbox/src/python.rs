//! [`ExecutionEngine`] backed by a Docker container running Python.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use tutor_core::{ExecutionEngine, ExecutionResult, Result, SandboxConfig, TutorError};

use crate::manager::{ContainerManager, CreateContainerOptions};
use crate::{Container, RunOutput, SandboxError};

/// Upper bound for housekeeping execs such as killing runaway programs.
const HOUSEKEEPING_TIMEOUT: Duration = Duration::from_secs(5);

struct Session {
    manager: ContainerManager,
    container: Container,
}

/// Python interpreter living in a long-running sandbox container.
///
/// The container is created by [`ExecutionEngine::initialize`] and torn down
/// by [`PythonSandbox::shutdown`].
pub struct PythonSandbox {
    config: SandboxConfig,
    session: Mutex<Option<Session>>,
    ready: AtomicBool,
}

impl std::fmt::Debug for PythonSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PythonSandbox")
            .field("image", &self.config.image)
            .field("ready", &self.ready())
            .finish_non_exhaustive()
    }
}

impl PythonSandbox {
    /// Creates an uninitialized sandbox.
    #[must_use]
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            session: Mutex::new(None),
            ready: AtomicBool::new(false),
        }
    }

    /// Stops and removes the container unless `keepContainer` is set.
    ///
    /// # Errors
    ///
    /// Returns an error if Docker refuses to stop or remove the container.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> std::result::Result<(), SandboxError> {
        self.ready.store(false, Ordering::SeqCst);
        let Some(mut session) = self.session.lock().await.take() else {
            return Ok(());
        };

        if self.config.keep_container {
            info!(container = %session.container.name, "Keeping sandbox container");
            return Ok(());
        }

        session.manager.stop_container(&mut session.container).await?;
        session
            .manager
            .remove_container(&mut session.container)
            .await?;
        Ok(())
    }

    async fn start(&self) -> std::result::Result<Session, SandboxError> {
        let manager = ContainerManager::new()?;
        manager.health_check().await?;
        manager.ensure_image(&self.config.image).await?;

        let name = format!(
            "tutor-sandbox-{}-{}",
            std::process::id(),
            Utc::now().timestamp_millis()
        );
        let options = CreateContainerOptions::new(name, &self.config.image)
            .with_env("PYTHONUNBUFFERED", "1")
            .with_env("PYTHONDONTWRITEBYTECODE", "1")
            .with_cmd(vec!["sleep", "infinity"]);

        let mut container = manager.create_container(options).await?;
        if let Err(err) = manager.start_container(&mut container).await {
            manager.remove_container(&mut container).await.ok();
            return Err(err);
        }

        Ok(Session { manager, container })
    }

    async fn running(&self) -> Result<(ContainerManager, Container)> {
        let guard = self.session.lock().await;
        guard
            .as_ref()
            .map(|s| (s.manager.clone(), s.container.clone()))
            .ok_or(TutorError::EngineNotReady)
    }
}

#[async_trait]
impl ExecutionEngine for PythonSandbox {
    #[instrument(skip(self), fields(image = %self.config.image))]
    async fn initialize(&self) -> Result<()> {
        let mut guard = self.session.lock().await;
        if guard.is_some() {
            debug!("Sandbox already initialized");
            return Ok(());
        }

        let session = self.start().await.map_err(SandboxError::into_init_error)?;
        info!(
            container_id = %session.container.id,
            created_at = %session.container.created_at,
            "Python sandbox ready"
        );
        *guard = Some(session);
        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    #[instrument(skip(self, code), fields(code_len = code.len()))]
    async fn execute(&self, code: &str) -> Result<ExecutionResult> {
        let (manager, container) = self.running().await?;
        let limit = self.config.run_timeout();

        let cmd = vec!["python3".to_string(), "-c".to_string(), code.to_string()];
        let run = manager.exec(&container, cmd, limit).await?;

        if run.timed_out {
            kill_python(&manager, &container).await;
        }
        Ok(to_execution_result(run, limit))
    }

    #[instrument(skip(self))]
    async fn reset(&self) -> Result<()> {
        if let Ok((manager, container)) = self.running().await {
            kill_python(&manager, &container).await;
            debug!("Sandbox interpreter reset");
        }
        Ok(())
    }
}

/// Kills every Python process left in the container.
async fn kill_python(manager: &ContainerManager, container: &Container) {
    let cmd = vec!["pkill".to_string(), "-x".to_string(), "python3".to_string()];
    if let Err(err) = manager.exec(container, cmd, HOUSEKEEPING_TIMEOUT).await {
        warn!(error = %err, "Failed to kill leftover Python processes");
    }
}

/// Turns raw exec output into what the controller shows the student.
fn to_execution_result(run: RunOutput, limit: Duration) -> ExecutionResult {
    if run.timed_out {
        return ExecutionResult::failed(
            run.stdout,
            format!("Execution timed out after {}s", limit.as_secs()),
        );
    }
    if run.is_clean() {
        return ExecutionResult::succeeded(run.stdout);
    }

    let stderr = if run.stderr.is_empty() {
        match run.exit_code {
            Some(code) => format!("Process exited with code {code}"),
            None => "Process ended without an exit code".to_string(),
        }
    } else {
        run.stderr
    };
    ExecutionResult::failed(run.stdout, stderr)
}
