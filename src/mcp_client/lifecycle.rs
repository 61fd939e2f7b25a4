//! Downstream server lifecycle management.
//!
//! Spawns stdio servers, performs the MCP `initialize` handshake (shared with
//! the HTTP transport), and shuts server processes down.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::Mutex;

use super::errors::McpError;
use super::transport::{extract_result, StdioTransport};
use super::types::{InitializeResult, ServerConfig, ServerInfo, PROTOCOL_VERSION};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Time allowed for a killed server process to be reaped.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Cap on stderr captured into error messages.
const STDERR_CAPTURE_LIMIT: usize = 2000;

// ─── ManagedServer ───────────────────────────────────────────────────────────

/// A running stdio MCP server process with its transport.
pub struct ManagedServer {
    /// Server id, as registered with the proxy.
    pub name: String,
    /// JSON-RPC transport (stdin/stdout).
    pub transport: StdioTransport,
    /// Identity reported by the server during `initialize`.
    pub server_info: Option<ServerInfo>,
    process: Mutex<Child>,
}

impl ManagedServer {
    /// Check if the server process is still running.
    pub async fn is_alive(&self) -> bool {
        matches!(self.process.lock().await.try_wait(), Ok(None))
    }

    /// Terminate the server process and reap it.
    pub async fn shutdown(&self) {
        let mut process = self.process.lock().await;
        if matches!(process.try_wait(), Ok(Some(_))) {
            return;
        }

        if let Err(e) = process.start_kill() {
            tracing::warn!(server = %self.name, error = %e, "failed to kill server process");
        }
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, process.wait())
            .await
            .is_err()
        {
            tracing::warn!(server = %self.name, "server did not exit after kill");
        }
        tracing::info!(server = %self.name, "server stopped");
    }
}

// ─── Spawning ────────────────────────────────────────────────────────────────

/// Spawn a stdio MCP server and perform the initialization handshake.
pub async fn spawn_server(
    name: &str,
    config: &ServerConfig,
    init_timeout: Duration,
) -> Result<ManagedServer, McpError> {
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args);
    for (key, value) in &config.env {
        cmd.env(key, value);
    }
    if let Some(dir) = config.cwd.as_deref() {
        cmd.current_dir(dir);
    }

    #[cfg(target_os = "windows")]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd.stdin(std::process::Stdio::piped());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
        name: name.to_string(),
        reason: format!("{e}"),
    })?;

    let stdin = child.stdin.take().ok_or(McpError::SpawnFailed {
        name: name.to_string(),
        reason: "failed to capture stdin".into(),
    })?;
    let stdout = child.stdout.take().ok_or(McpError::SpawnFailed {
        name: name.to_string(),
        reason: "failed to capture stdout".into(),
    })?;
    let stderr_handle = child.stderr.take();

    let transport = StdioTransport::new(name, stdin, stdout);

    let handshake = async {
        let result = extract_result(
            transport
                .request("initialize", Some(initialize_params()))
                .await?,
        )?;
        let info = parse_initialize_result(name, result)?;
        transport.notify("notifications/initialized", None).await?;
        Ok::<_, McpError>(info)
    };

    let server_info = match tokio::time::timeout(init_timeout, handshake).await {
        Ok(Ok(info)) => info,
        Ok(Err(e)) => {
            let _ = child.kill().await;
            let stderr_ctx = read_stderr_on_failure(stderr_handle).await;
            if !stderr_ctx.is_empty() {
                tracing::warn!(server = name, stderr = %stderr_ctx, "server stderr captured on failure");
            }
            return Err(McpError::InitFailed {
                name: name.to_string(),
                reason: format!("{e}{}", format_stderr_suffix(&stderr_ctx)),
            });
        }
        Err(_) => {
            let _ = child.kill().await;
            let stderr_ctx = read_stderr_on_failure(stderr_handle).await;
            if !stderr_ctx.is_empty() {
                tracing::warn!(server = name, stderr = %stderr_ctx, "server stderr captured on timeout");
            }
            return Err(McpError::InitFailed {
                name: name.to_string(),
                reason: format!(
                    "initialization timed out after {}ms{}",
                    init_timeout.as_millis(),
                    format_stderr_suffix(&stderr_ctx)
                ),
            });
        }
    };

    if let Some(stderr) = stderr_handle {
        forward_stderr(name.to_string(), stderr);
    }

    tracing::info!(
        server = name,
        command = %config.command,
        pid = child.id().unwrap_or_default(),
        "server initialized"
    );

    Ok(ManagedServer {
        name: name.to_string(),
        transport,
        server_info,
        process: Mutex::new(child),
    })
}

// ─── Handshake ───────────────────────────────────────────────────────────────

/// Parameters sent with `initialize`.
pub fn initialize_params() -> serde_json::Value {
    serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}

/// Parse the `initialize` result, returning the server's self-description.
pub fn parse_initialize_result(
    server_name: &str,
    result: serde_json::Value,
) -> Result<Option<ServerInfo>, McpError> {
    let init: InitializeResult =
        serde_json::from_value(result).map_err(|e| McpError::InitFailed {
            name: server_name.to_string(),
            reason: format!("failed to parse initialize response: {e}"),
        })?;

    if let Some(version) = init.protocol_version.as_deref() {
        if version != PROTOCOL_VERSION {
            tracing::debug!(server = server_name, version, "server negotiated a different protocol version");
        }
    }
    Ok(init.server_info)
}

// ─── Stderr ──────────────────────────────────────────────────────────────────

/// Drain a healthy server's stderr into the log so the pipe never fills.
fn forward_stderr(server: String, stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(server = %server, "{line}");
        }
    });
}

/// Read any available stderr output from a failed server process.
async fn read_stderr_on_failure(stderr_handle: Option<ChildStderr>) -> String {
    use tokio::io::AsyncReadExt;

    let Some(mut stderr) = stderr_handle else {
        return String::new();
    };

    let mut buf = String::new();
    match tokio::time::timeout(Duration::from_millis(500), stderr.read_to_string(&mut buf)).await
    {
        Ok(Ok(_)) => truncate_capture(buf),
        _ => String::new(),
    }
}

/// Trim captured output to [`STDERR_CAPTURE_LIMIT`] bytes on a char boundary.
pub fn truncate_capture(mut buf: String) -> String {
    if buf.len() > STDERR_CAPTURE_LIMIT {
        let mut cut = STDERR_CAPTURE_LIMIT;
        while !buf.is_char_boundary(cut) {
            cut -= 1;
        }
        buf.truncate(cut);
        buf.push_str("...(truncated)");
    }
    buf
}

/// Format a stderr suffix for error messages (empty string if no stderr).
fn format_stderr_suffix(stderr: &str) -> String {
    if stderr.trim().is_empty() {
        String::new()
    } else {
        format!(" | stderr: {}", stderr.trim())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
