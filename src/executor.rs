//! Execution orchestrator.
//!
//! One call to [`Executor::execute`] owns one request end to end: it stages
//! the code in a fresh temporary directory, starts a single isolated run with
//! that directory mounted, races the run against the deadline, and shapes
//! whatever happened into an [`ExecutionResult`]. The staging directory is a
//! [`TempDir`], so it is removed on every exit path including unwinding.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::backend::{BackendError, IsolationBackend, Mount, RunOutput, RunSpec};
use crate::config::Config;

/// Stderr text reported for a run that hit its deadline.
pub const TIMEOUT_MESSAGE: &str = "Execution timed out";

/// Appended to a stream that exceeded the output cap.
pub const TRUNCATION_MARKER: &str = "\n[output truncated]";

const STAGING_PREFIX: &str = "cell-exec-";

/// Result of one execution request.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    /// Wall-clock seconds, or exactly the timeout when the deadline fired.
    pub execution_time_seconds: f64,
    pub failed: bool,
}

impl ExecutionResult {
    fn failure(stderr: String, start: Instant) -> Self {
        Self {
            stdout: String::new(),
            stderr,
            execution_time_seconds: start.elapsed().as_secs_f64(),
            failed: true,
        }
    }

    fn timed_out(timeout: Duration) -> Self {
        Self {
            stdout: String::new(),
            stderr: TIMEOUT_MESSAGE.to_string(),
            execution_time_seconds: timeout.as_secs_f64(),
            failed: true,
        }
    }

    fn completed(output: RunOutput, start: Instant) -> Self {
        let failed = !output.success();
        let mut stdout = output.stdout;
        let mut stderr = output.stderr;
        if output.stdout_truncated {
            stdout.push_str(TRUNCATION_MARKER);
        }
        if output.stderr_truncated {
            stderr.push_str(TRUNCATION_MARKER);
        }
        Self {
            stdout,
            stderr,
            execution_time_seconds: start.elapsed().as_secs_f64(),
            failed,
        }
    }
}

/// How a request ended. Only used for logging; callers see [`ExecutionResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Success,
    NonZeroExit,
    TimeoutExceeded,
    SandboxLaunchFailure,
    StagingFailure,
    CodeTooLarge,
}

impl ExecutionOutcome {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::NonZeroExit => "non_zero_exit",
            Self::TimeoutExceeded => "timeout",
            Self::SandboxLaunchFailure => "launch_failure",
            Self::StagingFailure => "staging_failure",
            Self::CodeTooLarge => "code_too_large",
        }
    }
}

/// Runs untrusted code in throwaway sandboxes.
///
/// Holds only immutable configuration and a shared backend handle, so one
/// executor serves any number of concurrent requests.
pub struct Executor<B> {
    config: Arc<Config>,
    backend: Arc<B>,
}

impl<B> Clone for Executor<B> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            backend: Arc::clone(&self.backend),
        }
    }
}

impl<B: IsolationBackend + 'static> Executor<B> {
    pub fn new(config: Config, backend: B) -> Self {
        Self {
            config: Arc::new(config),
            backend: Arc::new(backend),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Execute `code` with a hard wall-clock `timeout`.
    ///
    /// Never fails: launch errors, non-zero exits, timeouts and staging
    /// problems all come back as a result with `failed` set. Dropping the
    /// returned future before it completes still kills the sandbox and removes
    /// the staging directory, in the background.
    #[instrument(skip(self, code), fields(code_len = code.len()))]
    pub async fn execute(&self, code: &[u8], timeout: Duration) -> ExecutionResult {
        let start = Instant::now();

        let limit = self.config.limits.max_code_bytes;
        if code.len() > limit {
            log_outcome(ExecutionOutcome::CodeTooLarge, start);
            return ExecutionResult::failure(
                format!("Code is {} bytes, the limit is {limit} bytes", code.len()),
                start,
            );
        }

        let staging = match self.stage(code).await {
            Ok(dir) => dir,
            Err(e) => {
                log_outcome(ExecutionOutcome::StagingFailure, start);
                return ExecutionResult::failure(
                    format!("Failed to stage code: {e}"),
                    start,
                );
            }
        };

        let spec = self.run_spec(staging.path());
        let mut guard = RunGuard {
            backend: Arc::clone(&self.backend),
            name: spec.name.clone(),
            kill_timeout: self.config.kill_timeout(),
            staging: Some(staging),
            task: None,
            armed: false,
        };

        let (result, outcome) = guard.run_with_deadline(spec, timeout, start).await;
        log_outcome(outcome, start);
        guard.release();

        result
    }

    /// Create a unique staging directory holding the code verbatim.
    async fn stage(&self, code: &[u8]) -> std::io::Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(STAGING_PREFIX);
        let dir = match &self.config.staging_dir {
            Some(root) => builder.tempdir_in(root)?,
            None => builder.tempdir()?,
        };

        tokio::fs::write(dir.path().join(&self.config.file_name), code).await?;
        debug!(path = %dir.path().display(), "Staged code");
        Ok(dir)
    }

    /// Describe the single run for a staging directory.
    ///
    /// The run is named after the directory, which makes the name as unique
    /// as the directory itself.
    fn run_spec(&self, staging: &Path) -> RunSpec {
        let name = staging
            .file_name()
            .map_or_else(|| STAGING_PREFIX.to_string(), |n| n.to_string_lossy().into_owned());

        RunSpec {
            name,
            image: self.config.image.clone(),
            mounts: vec![Mount {
                host: staging.to_path_buf(),
                target: self.config.mount_point.clone(),
                read_only: false,
            }],
            command: self.config.entry_command(),
            network: self.config.network.clone(),
            memory_mb: self.config.memory_mb,
            max_output_bytes: self.config.limits.max_output_bytes,
        }
    }
}

type RunTask = JoinHandle<Result<RunOutput, BackendError>>;

/// Owns everything one in-flight run leaves behind: the staging directory,
/// the run task and the sandbox named `name`.
///
/// While armed, dropping the guard aborts the task, kills the sandbox and
/// only then removes the staging directory, on a background task.
struct RunGuard<B: IsolationBackend + 'static> {
    backend: Arc<B>,
    name: String,
    kill_timeout: Duration,
    staging: Option<TempDir>,
    task: Option<RunTask>,
    armed: bool,
}

impl<B: IsolationBackend + 'static> RunGuard<B> {
    /// Race the run against the deadline; the loser is cancelled.
    async fn run_with_deadline(
        &mut self,
        spec: RunSpec,
        timeout: Duration,
        start: Instant,
    ) -> (ExecutionResult, ExecutionOutcome) {
        let backend = Arc::clone(&self.backend);
        self.armed = true;
        let task = self
            .task
            .insert(tokio::spawn(async move { backend.run(&spec).await }));

        let joined = tokio::time::timeout(timeout, task).await;
        let Ok(joined) = joined else {
            self.cancel().await;
            return (
                ExecutionResult::timed_out(timeout),
                ExecutionOutcome::TimeoutExceeded,
            );
        };

        self.task = None;
        self.armed = false;

        match joined {
            Ok(Ok(output)) => {
                let outcome = classify(&output);
                (ExecutionResult::completed(output, start), outcome)
            }
            Ok(Err(e)) => (
                ExecutionResult::failure(e.to_string(), start),
                ExecutionOutcome::SandboxLaunchFailure,
            ),
            Err(join_error) => {
                warn!(error = %join_error, "Sandbox run task failed");
                (
                    ExecutionResult::failure("Sandbox run panicked".to_string(), start),
                    ExecutionOutcome::SandboxLaunchFailure,
                )
            }
        }
    }

    /// Abort the run task and kill the sandbox.
    ///
    /// Stays armed until the kill finished, so a drop in the middle still
    /// cleans up.
    async fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            // Nothing may touch the staging directory once this returns.
            let _ = task.await;
        }
        kill_sandbox(self.backend.as_ref(), &self.name, self.kill_timeout).await;
        self.armed = false;
    }

    /// Remove the staging directory after the run is over.
    fn release(mut self) {
        if let Some(staging) = self.staging.take() {
            let path = staging.path().to_path_buf();
            if let Err(e) = staging.close() {
                warn!(path = %path.display(), error = %e, "Failed to remove staging directory");
            }
        }
    }
}

impl<B: IsolationBackend + 'static> Drop for RunGuard<B> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let task = self.task.take();
        if let Some(task) = &task {
            task.abort();
        }
        let staging = self.staging.take();
        let backend = Arc::clone(&self.backend);
        let name = std::mem::take(&mut self.name);
        let kill_timeout = self.kill_timeout;

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(name = %name, "Execution dropped outside a runtime, sandbox not killed");
            return;
        };

        warn!(name = %name, "Execution dropped while the sandbox was live, killing it");
        runtime.spawn(async move {
            if let Some(task) = task {
                let _ = task.await;
            }
            kill_sandbox(backend.as_ref(), &name, kill_timeout).await;
            drop(staging);
        });
    }
}

/// Map a completed run to its outcome label.
const fn classify(output: &RunOutput) -> ExecutionOutcome {
    if output.runtime_failed {
        ExecutionOutcome::SandboxLaunchFailure
    } else if matches!(output.exit_code, Some(0)) {
        ExecutionOutcome::Success
    } else {
        ExecutionOutcome::NonZeroExit
    }
}

async fn kill_sandbox<B: IsolationBackend>(backend: &B, name: &str, kill_timeout: Duration) {
    match tokio::time::timeout(kill_timeout, backend.kill(name)).await {
        Ok(Ok(())) => debug!(name, "Sandbox killed"),
        Ok(Err(e)) => warn!(name, error = %e, "Failed to kill sandbox"),
        Err(_) => warn!(name, "Kill of sandbox did not finish in time"),
    }
}

fn log_outcome(outcome: ExecutionOutcome, start: Instant) {
    info!(
        outcome = outcome.as_str(),
        elapsed_ms = start.elapsed().as_millis(),
        "Execution finished"
    );
}
