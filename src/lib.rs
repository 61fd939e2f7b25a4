pub mod commands;
pub mod config;
pub mod mcp_client;
pub mod proxy_core;
pub mod runtime;
pub mod server;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;

use commands::ToolProxy;
use config::ProxyConfig;

/// Initialize the tracing subscriber, writing structured logs to the data
/// directory. Stdout carries the JSON-RPC stream, so nothing is logged there.
///
/// On each startup:
/// 1. Rotates existing logs (toolproxy.log → .1 → .2 → .3, keeps last 3).
/// 2. Opens a fresh toolproxy.log with a line-flushing writer.
/// 3. Logs a startup banner with the data directory path.
fn init_tracing(data_dir: &Path) -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create {}", data_dir.display()))?;
    let log_path = data_dir.join("toolproxy.log");

    rotate_log_file(&log_path, 3);

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("failed to open {}", log_path.display()))?;

    let filter = EnvFilter::try_from_env("TOOLPROXY_LOG")
        .unwrap_or_else(|_| EnvFilter::new("toolproxy=info,warn"));

    fmt::fmt()
        .with_env_filter(filter)
        .with_writer(FlushingWriter::new(log_file))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir.display(),
        log_file = %log_path.display(),
        pid = std::process::id(),
        "=== toolproxy starting ==="
    );
    Ok(())
}

/// Rotate log files: `toolproxy.log` → `toolproxy.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write, so
/// each log line is on disk even if the process is killed.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Locate and load `toolproxy.yaml`, falling back to defaults.
fn resolve_config() -> anyhow::Result<(ProxyConfig, Option<std::path::PathBuf>)> {
    let cwd = std::env::current_dir().context("cannot read current directory")?;
    Ok(config::load_or_default(&cwd)?)
}

/// Run the proxy: load config, restore the registry, then serve JSON-RPC on
/// stdin/stdout until stdin closes or the process is interrupted.
pub async fn run() -> anyhow::Result<()> {
    let (config, config_path) = resolve_config()?;
    let data_dir = config.resolved_data_dir();
    init_tracing(&data_dir)?;

    match &config_path {
        Some(path) => tracing::info!(path = %path.display(), "config loaded"),
        None => tracing::info!("no config file found, using defaults"),
    }

    let proxy = Arc::new(
        ToolProxy::from_config(&config)
            .await
            .context("failed to start proxy")?,
    );

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();

    let outcome = tokio::select! {
        served = server::serve(Arc::clone(&proxy), stdin, stdout) => {
            served.context("transport failed")
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received");
            Ok(())
        }
    };

    proxy.shutdown().await;
    outcome
}
