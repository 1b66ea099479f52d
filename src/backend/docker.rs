//! Docker CLI backend.
//!
//! Each run is a `docker run --rm` child process. The container gets a
//! unique `--name` so a timed-out run can be removed with `docker rm -f`;
//! killing the CLI client alone would leave the container behind.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use super::{BackendError, IsolationBackend, RunOutput, RunSpec};

/// Exit status the docker CLI uses for its own failures (daemon unreachable,
/// image missing, bad flags) as opposed to the container's.
const DOCKER_CLI_FAILURE: i32 = 125;

const READ_CHUNK: usize = 8 * 1024;

/// Backend that shells out to a docker-compatible CLI.
#[derive(Debug, Clone)]
pub struct DockerBackend {
    runtime: String,
}

impl DockerBackend {
    /// Create a backend driving the given CLI binary (e.g. `docker`).
    pub fn new(runtime: impl Into<String>) -> Self {
        Self {
            runtime: runtime.into(),
        }
    }
}

impl Default for DockerBackend {
    fn default() -> Self {
        Self::new("docker")
    }
}

/// Build the argument list for `docker run`.
fn run_args(spec: &RunSpec) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "--rm".to_string(),
        "--name".to_string(),
        spec.name.clone(),
    ];

    for mount in &spec.mounts {
        let mut volume = format!("{}:{}", mount.host.display(), mount.target);
        if mount.read_only {
            volume.push_str(":ro");
        }
        args.push("-v".to_string());
        args.push(volume);
    }

    if let Some(network) = &spec.network {
        args.push("--network".to_string());
        args.push(network.clone());
    }
    if let Some(memory) = spec.memory_mb {
        args.push("--memory".to_string());
        args.push(format!("{memory}m"));
    }

    args.push(spec.image.clone());
    args.extend(spec.command.iter().cloned());
    args
}

/// Build the argument list that force-removes a run.
///
/// `rm -f` also covers a container that was created but never started,
/// which `--rm` never cleans up.
fn kill_args(name: &str) -> Vec<String> {
    vec!["rm".to_string(), "-f".to_string(), name.to_string()]
}

/// Whether an exit status came from the docker CLI rather than the container.
const fn is_runtime_failure(exit_code: Option<i32>) -> bool {
    matches!(exit_code, Some(DOCKER_CLI_FAILURE))
}

/// Read a stream to EOF, keeping at most `cap` bytes.
///
/// Bytes past the cap are read and dropped so the writer never stalls on a
/// full pipe.
async fn read_capped<R: AsyncRead + Unpin>(
    mut reader: R,
    cap: usize,
) -> std::io::Result<(Vec<u8>, bool)> {
    let mut kept = Vec::new();
    let mut truncated = false;
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        let room = cap.saturating_sub(kept.len());
        let take = room.min(n);
        kept.extend_from_slice(&chunk[..take]);
        if take < n {
            truncated = true;
        }
    }

    Ok((kept, truncated))
}

#[async_trait]
impl IsolationBackend for DockerBackend {
    #[instrument(skip(self, spec), fields(name = %spec.name, image = %spec.image))]
    async fn run(&self, spec: &RunSpec) -> Result<RunOutput, BackendError> {
        let args = run_args(spec);
        debug!(runtime = %self.runtime, ?args, "Launching container");

        let mut child = Command::new(&self.runtime)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| BackendError::Launch {
                runtime: self.runtime.clone(),
                source,
            })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stdout not captured")
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stderr not captured")
        })?;

        let (out, err) = tokio::join!(
            read_capped(stdout, spec.max_output_bytes),
            read_capped(stderr, spec.max_output_bytes),
        );
        let (stdout_buf, stdout_truncated) = out?;
        let (stderr_buf, stderr_truncated) = err?;

        let status = child.wait().await?;

        let output = RunOutput {
            exit_code: status.code(),
            runtime_failed: is_runtime_failure(status.code()),
            stdout: String::from_utf8_lossy(&stdout_buf).into_owned(),
            stderr: String::from_utf8_lossy(&stderr_buf).into_owned(),
            stdout_truncated,
            stderr_truncated,
        };

        if output.runtime_failed {
            warn!(stderr = %output.stderr.trim(), "Container runtime refused to start the run");
        } else {
            debug!(exit_code = ?output.exit_code, "Container exited");
        }

        Ok(output)
    }

    #[instrument(skip(self))]
    async fn kill(&self, name: &str) -> Result<(), BackendError> {
        let output = Command::new(&self.runtime)
            .args(kill_args(name))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| BackendError::Launch {
                runtime: self.runtime.clone(),
                source,
            })?;

        if output.status.success() {
            debug!("Container removed");
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if already_gone(&stderr) {
            debug!("Container already removed");
            return Ok(());
        }

        Err(BackendError::Kill {
            name: name.to_string(),
            message: stderr.trim().to_string(),
        })
    }
}

/// Whether a failed `docker rm -f` means the container no longer exists.
fn already_gone(stderr: &str) -> bool {
    stderr.contains("No such container")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Mount;
    use std::path::PathBuf;

    fn spec() -> RunSpec {
        RunSpec {
            name: "cell-exec-abc123".to_string(),
            image: "blockzie-python".to_string(),
            mounts: vec![Mount {
                host: PathBuf::from("/tmp/cell-exec-abc123"),
                target: "/workspace".to_string(),
                read_only: false,
            }],
            command: vec!["python".to_string(), "/workspace/cell_exec.py".to_string()],
            network: None,
            memory_mb: None,
            max_output_bytes: 1024,
        }
    }

    #[test]
    fn run_args_basic() {
        assert_eq!(
            run_args(&spec()),
            vec![
                "run",
                "--rm",
                "--name",
                "cell-exec-abc123",
                "-v",
                "/tmp/cell-exec-abc123:/workspace",
                "blockzie-python",
                "python",
                "/workspace/cell_exec.py",
            ]
        );
    }

    #[test]
    fn run_args_with_limits() {
        let mut spec = spec();
        spec.network = Some("none".to_string());
        spec.memory_mb = Some(256);
        spec.mounts[0].read_only = true;

        let args = run_args(&spec);
        assert!(args.contains(&"/tmp/cell-exec-abc123:/workspace:ro".to_string()));

        let net = args.iter().position(|a| a == "--network").unwrap();
        assert_eq!(args[net + 1], "none");
        let mem = args.iter().position(|a| a == "--memory").unwrap();
        assert_eq!(args[mem + 1], "256m");

        // Options precede the image; the command comes last
        let image = args.iter().position(|a| a == "blockzie-python").unwrap();
        assert!(net < image && mem < image);
        assert_eq!(args.last().unwrap(), "/workspace/cell_exec.py");
    }

    #[tokio::test]
    async fn read_capped_keeps_prefix() {
        let data = vec![b'x'; 20_000];
        let (kept, truncated) = read_capped(&data[..], 100).await.unwrap();
        assert_eq!(kept.len(), 100);
        assert!(truncated);

        let (kept, truncated) = read_capped(&b"hello\n"[..], 100).await.unwrap();
        assert_eq!(kept, b"hello\n");
        assert!(!truncated);
    }

    #[tokio::test]
    async fn read_capped_exact_fit_is_not_truncated() {
        let (kept, truncated) = read_capped(&b"abcd"[..], 4).await.unwrap();
        assert_eq!(kept, b"abcd");
        assert!(!truncated);
    }

    #[test]
    fn kill_args_force_remove() {
        assert_eq!(kill_args("cell-exec-abc123"), vec!["rm", "-f", "cell-exec-abc123"]);
    }

    #[test]
    fn kill_tolerates_removed_container() {
        assert!(already_gone(
            "Error response from daemon: No such container: cell-exec-abc123"
        ));
        // A created-but-never-started container must still be removed
        assert!(!already_gone(
            "Error response from daemon: Cannot kill container: x: Container x is not running"
        ));
        assert!(!already_gone("permission denied while trying to connect"));
    }

    #[test]
    fn cli_status_125_is_runtime_failure() {
        assert!(is_runtime_failure(Some(125)));
        assert!(!is_runtime_failure(Some(1)));
        assert!(!is_runtime_failure(Some(0)));
        assert!(!is_runtime_failure(None));
    }

    #[tokio::test]
    async fn missing_runtime_is_launch_error() {
        let backend = DockerBackend::new("/nonexistent/docker-binary");
        let err = backend.run(&spec()).await.unwrap_err();
        assert!(matches!(err, BackendError::Launch { .. }));
        assert!(err.to_string().contains("/nonexistent/docker-binary"));

        let err = backend.kill("cell-exec-abc123").await.unwrap_err();
        assert!(matches!(err, BackendError::Launch { .. }));
    }

    #[tokio::test]
    async fn test_run_hello() {
        // Needs a docker daemon and the blockzie-python image, skip in CI
        if std::env::var("CELL_SANDBOX_DOCKER_TEST").is_err() {
            return;
        }

        let dir = tempfile::Builder::new().prefix("cell-exec-").tempdir().unwrap();
        std::fs::write(dir.path().join("cell_exec.py"), "print(\"hello\")\n").unwrap();

        let mut spec = spec();
        spec.name = dir
            .path()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .into_owned();
        spec.mounts[0].host = dir.path().to_path_buf();

        let output = DockerBackend::default().run(&spec).await.unwrap();
        assert!(output.success());
        assert_eq!(output.stdout, "hello\n");
    }
}
