//! One-shot tool processes.
//!
//! A tool process receives its parameters as a single JSON line on stdin
//! (stdin is then closed) and answers with JSON on stdout. The process, and
//! the container it may front, is owned by a [`ProcessGuard`] that tears it
//! down on every exit path, including when the awaiting future is dropped.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use super::container;
use crate::mcp_client::lifecycle::truncate_capture;
use crate::proxy_core::errors::ProxyError;

/// Output beyond this many bytes per stream is discarded.
const MAX_CAPTURE_BYTES: u64 = 16 * 1024 * 1024;

/// Grace period for stream readers after the process has exited.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Docker's own exit code for "container could not be started".
const DOCKER_START_FAILURE: i32 = 125;

// ─── Prepared Command ───────────────────────────────────────────────────────

/// A fully resolved command line for one tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Named container started by this command, removed on teardown.
    pub container: Option<String>,
}

// ─── Guard ──────────────────────────────────────────────────────────────────

/// Owns a running tool process. Dropping it kills the process, stops the
/// output readers and force-removes the container, unless the process was
/// already reaped.
struct ProcessGuard {
    child: Child,
    docker: Option<(String, String)>,
    readers: Vec<JoinHandle<Vec<u8>>>,
    /// Feeds the parameters to stdin; may still be blocked on a full pipe.
    feeder: Option<JoinHandle<()>>,
    reaped: bool,
}

impl ProcessGuard {
    /// Kill and reap the process now.
    async fn terminate(&mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::debug!(error = %e, "kill on tool process failed");
        }
        self.reaped = true;
        self.abort_tasks();
        if let Some((docker, name)) = self.docker.take() {
            container::remove_container(&docker, &name).await;
        }
    }

    fn abort_tasks(&mut self) {
        for reader in &self.readers {
            reader.abort();
        }
        if let Some(feeder) = self.feeder.take() {
            feeder.abort();
        }
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        self.abort_tasks();
        if !self.reaped {
            if let Err(e) = self.child.start_kill() {
                tracing::debug!(error = %e, "kill on drop failed");
            }
        }
        if let Some((docker, name)) = self.docker.take() {
            container::remove_container_detached(docker, name);
        }
    }
}

// ─── Running ────────────────────────────────────────────────────────────────

/// Run a prepared command to completion and decode its result.
pub async fn run(
    tool_id: &str,
    command: PreparedCommand,
    params: &serde_json::Value,
    timeout: Duration,
) -> Result<serde_json::Value, ProxyError> {
    let start = Instant::now();
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .envs(&command.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(target_os = "windows")]
    {
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    let mut child = cmd.spawn().map_err(|e| ProxyError::BackendUnavailable {
        backend: command.program.clone(),
        reason: format!("failed to spawn: {e}"),
    })?;
    tracing::debug!(
        tool_id,
        program = %command.program,
        pid = child.id().unwrap_or_default(),
        "tool process started"
    );

    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let mut guard = ProcessGuard {
        child,
        docker: command
            .container
            .clone()
            .map(|name| (command.program.clone(), name)),
        readers: Vec::new(),
        feeder: None,
        reaped: false,
    };
    let stdout_task = spawn_reader(stdout);
    let stderr_task = spawn_reader(stderr);
    guard.readers = vec![stdout_task, stderr_task];

    if let Some(mut stdin) = stdin {
        let mut line = serde_json::to_vec(params)?;
        line.push(b'\n');
        let id = tool_id.to_string();
        // The write runs beside the wait so a tool that never drains a large
        // payload still hits the timeout.
        guard.feeder = Some(tokio::spawn(async move {
            // A tool that never reads its input closes the pipe early; that
            // is not an error by itself.
            if let Err(e) = stdin.write_all(&line).await {
                tracing::debug!(tool_id = %id, error = %e, "tool did not consume stdin");
            }
        }));
    }

    let status = match tokio::time::timeout(timeout, guard.child.wait()).await {
        Ok(Ok(status)) => {
            guard.reaped = true;
            status
        }
        Ok(Err(e)) => {
            guard.terminate().await;
            return Err(ProxyError::RuntimeFailure {
                tool_id: tool_id.to_string(),
                reason: format!("failed to wait for process: {e}"),
            });
        }
        Err(_) => {
            guard.terminate().await;
            tracing::warn!(tool_id, timeout_ms = timeout.as_millis() as u64, "tool process killed on timeout");
            return Err(ProxyError::Timeout {
                tool_id: tool_id.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            });
        }
    };

    let mut readers = std::mem::take(&mut guard.readers).into_iter();
    let stdout = collect(readers.next()).await;
    let stderr = collect(readers.next()).await;
    let stderr = truncate_capture(String::from_utf8_lossy(&stderr).into_owned());
    // The container is gone with `--rm`; nothing left to clean up.
    guard.docker = None;
    drop(guard);

    tracing::debug!(
        tool_id,
        code = status.code(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "tool process exited"
    );

    if !status.success() {
        let code = status.code();
        if command.container.is_some() && code == Some(DOCKER_START_FAILURE) {
            return Err(ProxyError::BackendUnavailable {
                backend: command.program,
                reason: format!("container failed to start: {}", stderr.trim()),
            });
        }
        let code = code.map_or_else(|| "signal".to_string(), |c| c.to_string());
        return Err(ProxyError::RuntimeFailure {
            tool_id: tool_id.to_string(),
            reason: format!("exited with {code}{}", stderr_suffix(&stderr)),
        });
    }

    let stdout = String::from_utf8_lossy(&stdout);
    let value = parse_output(&stdout).ok_or_else(|| ProxyError::RuntimeFailure {
        tool_id: tool_id.to_string(),
        reason: format!("produced no JSON output{}", stderr_suffix(&stderr)),
    })?;
    unwrap_envelope(tool_id, value)
}

fn spawn_reader<R>(stream: Option<R>) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(stream) = stream {
            let mut limited = stream.take(MAX_CAPTURE_BYTES);
            if let Err(e) = limited.read_to_end(&mut buf).await {
                tracing::debug!(error = %e, "tool output read failed");
            }
        }
        buf
    })
}

async fn collect(reader: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    let Some(reader) = reader else {
        return Vec::new();
    };
    match tokio::time::timeout(DRAIN_TIMEOUT, reader).await {
        Ok(Ok(buf)) => buf,
        _ => Vec::new(),
    }
}

fn stderr_suffix(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(": {trimmed}")
    }
}

// ─── Output Decoding ────────────────────────────────────────────────────────

/// Find the tool's JSON answer: all of stdout, else its last JSON line.
pub fn parse_output(stdout: &str) -> Option<serde_json::Value> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }
    trimmed
        .lines()
        .rev()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .find_map(|l| serde_json::from_str(l).ok())
}

/// Apply the result envelope: `{"result": x}` yields `x`, a non-null
/// `{"error": e}` is a failure, anything else is the result itself.
pub fn unwrap_envelope(
    tool_id: &str,
    value: serde_json::Value,
) -> Result<serde_json::Value, ProxyError> {
    let serde_json::Value::Object(mut map) = value else {
        return Ok(value);
    };
    match map.get("error") {
        Some(serde_json::Value::Null) | None => {}
        Some(error) => {
            let reason = match error {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Object(o) => o
                    .get("message")
                    .and_then(|m| m.as_str())
                    .map(String::from)
                    .unwrap_or_else(|| error.to_string()),
                other => other.to_string(),
            };
            return Err(ProxyError::RuntimeFailure {
                tool_id: tool_id.to_string(),
                reason,
            });
        }
    }
    if let Some(result) = map.remove("result") {
        return Ok(result);
    }
    Ok(serde_json::Value::Object(map))
}

// ─── Tests ──────────────────────────────────────────────────────────────────
