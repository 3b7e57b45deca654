use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use quarry_core::JobInput;

/// Environment variables an executor reads to resolve script modules.
pub const ENV_MODULE_PATH: &str = "QUARRY_MODULE_PATH";
/// Node-compatible alias of [`ENV_MODULE_PATH`].
pub const ENV_NODE_PATH: &str = "NODE_PATH";

/// Cap on captured stderr bytes; the rest is drained and discarded.
pub const MAX_STDERR_CAPTURE: usize = 256 * 1024;

/// What the child left behind when it exited.
#[derive(Debug)]
pub struct ExitReport {
    /// Exit code; -1 when the child was killed by a signal.
    pub code: i32,
    /// Captured stderr, up to [`MAX_STDERR_CAPTURE`] bytes.
    pub stderr: Vec<u8>,
}

/// The stdin writer shared between the job-descriptor write and ack sends.
/// A single lock serializes all supervisor → child writes.
pub type SharedWriter = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// Control side of a spawned child: reap and kill.
#[async_trait]
pub trait ChildHandle: Send {
    /// Block until the child exits; returns its code and captured stderr.
    async fn wait(&mut self) -> anyhow::Result<ExitReport>;

    /// Best-effort, idempotent termination.
    async fn kill(&mut self);
}

/// A launched executor child with its pipes split out.
pub struct SpawnedChild {
    /// The child's framed output stream.
    pub stdout: Box<dyn AsyncRead + Send + Sync + Unpin>,
    /// Serialized writer delivering acks after the job descriptor.
    pub stdin: SharedWriter,
    /// Reap/kill control.
    pub handle: Box<dyn ChildHandle>,
}

/// Process lifecycle abstraction the orchestrator runs against.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Spawn a child for `input` and deliver the job descriptor line.
    async fn start(&self, input: &JobInput) -> anyhow::Result<SpawnedChild>;
}

/// Configuration for the real process-backed executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Path to the executor binary.
    pub executor_bin: PathBuf,
    /// Module-resolution override exported to the child, if any.
    pub module_path_override: Option<String>,
    /// Extra environment for the child; later entries win per name.
    pub env: Vec<(String, String)>,
}

/// Spawns the configured executor binary with piped stdio.
pub struct ProcessExecutor {
    cfg: ExecutorConfig,
}

impl ProcessExecutor {
    /// Create an executor from its configuration.
    pub fn new(cfg: ExecutorConfig) -> Self {
        ProcessExecutor { cfg }
    }

    fn child_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        for (name, value) in &self.cfg.env {
            env.insert(name.clone(), value.clone());
        }
        if let Some(path) = &self.cfg.module_path_override {
            env.insert(ENV_MODULE_PATH.to_string(), path.clone());
            env.insert(ENV_NODE_PATH.to_string(), path.clone());
        }
        env
    }
}

#[async_trait]
impl Executor for ProcessExecutor {
    async fn start(&self, input: &JobInput) -> anyhow::Result<SpawnedChild> {
        let mut cmd = Command::new(&self.cfg.executor_bin);
        cmd.arg(&input.job.target)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (name, value) in self.child_env() {
            cmd.env(name, value);
        }

        let mut child = cmd.spawn().with_context(|| {
            format!("spawn executor {}", self.cfg.executor_bin.display())
        })?;

        let mut stdin = child
            .stdin
            .take()
            .context("executor child has no stdin pipe")?;
        let stdout = child
            .stdout
            .take()
            .context("executor child has no stdout pipe")?;
        let stderr = child
            .stderr
            .take()
            .context("executor child has no stderr pipe")?;

        let line = input.to_line()?;
        stdin
            .write_all(line.as_bytes())
            .await
            .context("write job descriptor")?;
        stdin.flush().await.context("flush job descriptor")?;

        let stderr_task = tokio::spawn(capture_stderr(stderr));

        Ok(SpawnedChild {
            stdout: Box::new(stdout),
            stdin: Arc::new(Mutex::new(Box::new(stdin))),
            handle: Box::new(ProcessHandle {
                child,
                stderr_task: Some(stderr_task),
            }),
        })
    }
}

async fn capture_stderr(mut stderr: tokio::process::ChildStderr) -> Vec<u8> {
    let mut captured = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = MAX_STDERR_CAPTURE.saturating_sub(captured.len());
                captured.extend_from_slice(&buf[..n.min(room)]);
                // Keep draining past the cap so the child never blocks on
                // a full stderr pipe.
            }
        }
    }
    captured
}

struct ProcessHandle {
    child: tokio::process::Child,
    stderr_task: Option<JoinHandle<Vec<u8>>>,
}

#[async_trait]
impl ChildHandle for ProcessHandle {
    async fn wait(&mut self) -> anyhow::Result<ExitReport> {
        let status = self.child.wait().await.context("wait for executor")?;
        let stderr = match self.stderr_task.take() {
            Some(task) => task.await.unwrap_or_default(),
            None => Vec::new(),
        };
        Ok(ExitReport {
            code: status.code().unwrap_or(-1),
            stderr,
        })
    }

    async fn kill(&mut self) {
        if let Err(err) = self.child.kill().await {
            tracing::debug!(error = %err, "kill executor child");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_is_deduplicated_last_wins() {
        let exec = ProcessExecutor::new(ExecutorConfig {
            executor_bin: PathBuf::from("/usr/bin/quarry-exec"),
            module_path_override: Some("/opt/quarry/modules".to_string()),
            env: vec![
                ("A".to_string(), "1".to_string()),
                ("B".to_string(), "2".to_string()),
                ("A".to_string(), "3".to_string()),
            ],
        });
        let env = exec.child_env();
        assert_eq!(env.get("A").map(String::as_str), Some("3"));
        assert_eq!(env.get("B").map(String::as_str), Some("2"));
        assert_eq!(
            env.get(ENV_MODULE_PATH).map(String::as_str),
            Some("/opt/quarry/modules")
        );
        assert_eq!(
            env.get(ENV_NODE_PATH).map(String::as_str),
            Some("/opt/quarry/modules")
        );
    }
}
