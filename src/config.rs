//! Daemon configuration.
//!
//! Defaults describe the stock `blockzie-python` image. A deployment can
//! override any field with JSON in the `CELL_SANDBOX_CONFIG` environment
//! variable, and a few common knobs with dedicated variables.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

/// Top-level configuration for the daemon.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Pre-built image containing the interpreter.
    pub image: String,

    /// Container runtime CLI (`docker`, or a compatible drop-in like `podman`).
    pub runtime: String,

    /// Interpreter command; the staged file path is appended to it.
    pub interpreter: Vec<String>,

    /// Where the staging directory is mounted inside the container.
    pub mount_point: String,

    /// Name of the staged source file.
    pub file_name: String,

    /// Container network mode. `None` keeps the image/daemon default.
    pub network: Option<String>,

    /// Container memory limit in megabytes.
    pub memory_mb: Option<u64>,

    /// Parent directory for staging areas. `None` uses the system temp dir.
    pub staging_dir: Option<PathBuf>,

    /// Timeout applied when a request does not ask for one.
    pub timeout_seconds: u64,

    /// Upper bound on how long the forced kill may take after a timeout.
    pub kill_timeout_seconds: u64,

    /// Size and time caps applied to every request.
    pub limits: Limits,
}

/// Per-request caps.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Largest accepted code payload, in bytes.
    pub max_code_bytes: usize,

    /// Largest stdout or stderr kept per run, in bytes.
    pub max_output_bytes: usize,

    /// Requests asking for a longer timeout are clamped to this.
    pub max_timeout_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            image: "blockzie-python".into(),
            runtime: "docker".into(),
            interpreter: vec!["python".into()],
            mount_point: "/workspace".into(),
            file_name: "cell_exec.py".into(),
            network: None,
            memory_mb: None,
            staging_dir: None,
            timeout_seconds: default_timeout(),
            kill_timeout_seconds: 5,
            limits: Limits::default(),
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_code_bytes: 1024 * 1024,
            max_output_bytes: 1024 * 1024,
            max_timeout_seconds: 300,
        }
    }
}

impl Config {
    /// Load configuration from the environment.
    ///
    /// Priority: `SANDBOX_IMAGE` / `SANDBOX_TIMEOUT` / `SANDBOX_RUNTIME` >
    /// `CELL_SANDBOX_CONFIG` JSON > defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var("CELL_SANDBOX_CONFIG") {
            Ok(json) => {
                serde_json::from_str(&json).context("Failed to parse CELL_SANDBOX_CONFIG")?
            }
            Err(_) => {
                debug!("CELL_SANDBOX_CONFIG not set, using defaults");
                Self::default()
            }
        };

        if let Ok(image) = std::env::var("SANDBOX_IMAGE") {
            config.image = image;
        }
        if let Ok(runtime) = std::env::var("SANDBOX_RUNTIME") {
            config.runtime = runtime;
        }
        if let Ok(timeout) = std::env::var("SANDBOX_TIMEOUT") {
            config.timeout_seconds = timeout
                .parse()
                .with_context(|| format!("SANDBOX_TIMEOUT is not a number: {timeout}"))?;
        }

        Ok(config)
    }

    /// Reject configurations that could never produce a working run.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.image.trim().is_empty(), "image must not be empty");
        anyhow::ensure!(!self.runtime.trim().is_empty(), "runtime must not be empty");
        anyhow::ensure!(
            self.interpreter.first().is_some_and(|cmd| !cmd.is_empty()),
            "interpreter must name a command"
        );
        anyhow::ensure!(
            self.mount_point.starts_with('/'),
            "mount_point must be absolute: {}",
            self.mount_point
        );
        anyhow::ensure!(
            !self.file_name.is_empty() && !self.file_name.contains('/'),
            "file_name must be a bare file name: {}",
            self.file_name
        );
        anyhow::ensure!(
            self.limits.max_output_bytes > 0,
            "limits.max_output_bytes must be positive"
        );
        anyhow::ensure!(self.timeout_seconds > 0, "timeout_seconds must be positive");
        anyhow::ensure!(
            self.limits.max_timeout_seconds > 0,
            "limits.max_timeout_seconds must be positive"
        );
        anyhow::ensure!(
            self.timeout_seconds <= self.limits.max_timeout_seconds,
            "timeout_seconds ({}) exceeds limits.max_timeout_seconds ({})",
            self.timeout_seconds,
            self.limits.max_timeout_seconds
        );
        Ok(())
    }

    /// Path of the staged file as seen from inside the container.
    pub fn container_file_path(&self) -> String {
        format!("{}/{}", self.mount_point.trim_end_matches('/'), self.file_name)
    }

    /// The fixed entry command: interpreter followed by the staged file.
    pub fn entry_command(&self) -> Vec<String> {
        let mut command = self.interpreter.clone();
        command.push(self.container_file_path());
        command
    }

    /// Resolve a requested timeout against the default and the cap.
    ///
    /// `None` or zero falls back to `timeout_seconds`.
    pub fn effective_timeout(&self, requested: Option<u64>) -> Duration {
        let secs = requested
            .filter(|&secs| secs > 0)
            .unwrap_or(self.timeout_seconds)
            .min(self.limits.max_timeout_seconds);
        Duration::from_secs(secs)
    }

    pub const fn kill_timeout(&self) -> Duration {
        Duration::from_secs(self.kill_timeout_seconds)
    }

    /// Create a config from a JSON string (for testing).
    #[cfg(test)]
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse JSON")?;
        Ok(config)
    }
}

const fn default_timeout() -> u64 {
    15
}
