//! Isolation backend trait and implementations.
//!
//! A backend knows how to start one throwaway container for a prepared
//! staging directory and how to tear it down by force. Staging, timing and
//! result shaping live in the executor.

mod docker;

pub use docker::DockerBackend;

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

/// A bind mount from the host into the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host: PathBuf,
    pub target: String,
    pub read_only: bool,
}

/// Everything a backend needs to launch one isolated run.
#[derive(Debug, Clone)]
pub struct RunSpec {
    /// Unique name, used to address the run when killing it.
    pub name: String,
    pub image: String,
    pub mounts: Vec<Mount>,
    /// Fixed entry command. Never built from request data.
    pub command: Vec<String>,
    pub network: Option<String>,
    pub memory_mb: Option<u64>,
    /// Bytes kept per output stream; the rest is discarded.
    pub max_output_bytes: usize,
}

/// Output of a run that ran to completion.
#[derive(Debug, Clone, Default)]
pub struct RunOutput {
    /// Exit code of the process. `None` when it was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    /// The runtime itself failed (daemon unreachable, image missing) rather
    /// than the code inside the sandbox.
    pub runtime_failed: bool,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Backend faults. Every variant ends up as a failed result, never a crash.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to launch sandbox via `{runtime}`: {source}")]
    Launch {
        runtime: String,
        #[source]
        source: std::io::Error,
    },

    #[error("lost contact with sandbox process: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to kill sandbox `{name}`: {message}")]
    Kill { name: String, message: String },
}

/// Trait for isolation backends.
///
/// Implementations must be safe to call concurrently: the executor shares a
/// single backend across all in-flight requests.
#[async_trait]
pub trait IsolationBackend: Send + Sync {
    /// Start the run described by `spec` and wait for it to exit.
    ///
    /// Dropping the returned future must stop the local client process; the
    /// sandbox itself is only guaranteed gone after [`Self::kill`].
    async fn run(&self, spec: &RunSpec) -> Result<RunOutput, BackendError>;

    /// Forcibly terminate and remove the run named `name`, whatever state it
    /// is in (created but never started, running, or exited).
    ///
    /// Killing a run that no longer exists is not an error.
    async fn kill(&self, name: &str) -> Result<(), BackendError>;
}
