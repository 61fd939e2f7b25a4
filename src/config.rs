//! Proxy configuration loading and validation.
//!
//! Reads `toolproxy.yaml` and resolves environment variables. Every field
//! has a default, so running without a config file is valid.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::mcp_client::ServerDescriptor;

/// Config file name searched for on startup.
pub const CONFIG_FILE_NAME: &str = "toolproxy.yaml";

/// Env var pointing at an explicit config file.
pub const CONFIG_ENV_VAR: &str = "TOOLPROXY_CONFIG";

// ─── Errors ──────────────────────────────────────────────────────────────────

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse config: {reason}")]
    Parse { reason: String },

    #[error("invalid config: {reason}")]
    Invalid { reason: String },
}

// ─── Public Types ────────────────────────────────────────────────────────────

/// Interpreter and container CLI used for each tool kind.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub node: String,
    pub python: String,
    pub docker: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            node: "node".into(),
            python: if cfg!(windows) { "python" } else { "python3" }.into(),
            docker: "docker".into(),
        }
    }
}

/// Top-level proxy configuration (mirrors `toolproxy.yaml`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Directory for the database and log file.
    pub data_dir: Option<PathBuf>,
    /// Registry database. Defaults to `<data_dir>/registry.db`.
    pub database_path: Option<PathBuf>,
    /// Execution bound for tools without their own `timeout_ms`.
    pub default_timeout_ms: u64,
    /// Bound on one `tools/list` round trip.
    pub discovery_timeout_ms: u64,
    /// Bound on the downstream `initialize` handshake.
    pub init_timeout_ms: u64,
    pub runtimes: RuntimeConfig,
    /// Downstream servers registered at startup.
    pub servers: BTreeMap<String, ServerDescriptor>,
    /// Discover every known server concurrently at startup.
    pub discover_on_startup: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            database_path: None,
            default_timeout_ms: 30_000,
            discovery_timeout_ms: 15_000,
            init_timeout_ms: 30_000,
            runtimes: RuntimeConfig::default(),
            servers: BTreeMap::new(),
            discover_on_startup: true,
        }
    }
}

impl ProxyConfig {
    /// The data directory: configured, else the platform data dir.
    pub fn resolved_data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.data_dir {
            return dir.clone();
        }
        dirs::data_dir()
            .map(|d| d.join("toolproxy"))
            .unwrap_or_else(|| PathBuf::from(".toolproxy"))
    }

    /// The registry database path.
    pub fn resolved_database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| self.resolved_data_dir().join("registry.db"))
    }

    /// Reject values the proxy cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("default_timeout_ms", self.default_timeout_ms),
            ("discovery_timeout_ms", self.discovery_timeout_ms),
            ("init_timeout_ms", self.init_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    reason: format!("{name} must be greater than zero"),
                });
            }
        }
        for id in self.servers.keys() {
            if id.trim().is_empty() || id.contains(':') {
                return Err(ConfigError::Invalid {
                    reason: format!("server id '{id}' must be non-empty and must not contain ':'"),
                });
            }
        }
        Ok(())
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate the config file.
///
/// `TOOLPROXY_CONFIG` wins when set (and must exist). Otherwise searches
/// upward from `start` for `toolproxy.yaml`. `None` means run on defaults.
pub fn find_config_path(start: &Path) -> Result<Option<PathBuf>, ConfigError> {
    if let Ok(explicit) = std::env::var(CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(expand_tilde(&explicit));
        if candidate.exists() {
            return Ok(Some(candidate));
        }
        return Err(ConfigError::Read {
            path: candidate.display().to_string(),
            reason: format!("file named by {CONFIG_ENV_VAR} does not exist"),
        });
    }

    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.exists() {
            return Ok(Some(candidate));
        }
        if !dir.pop() {
            break;
        }
    }
    Ok(None)
}

/// Load, interpolate and validate a config file.
///
/// String values may use `${VAR_NAME}` or `${VAR_NAME:-default}`.
pub fn load_config(path: &Path) -> Result<ProxyConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    parse_config(&raw)
}

/// Parse config text. An empty document yields the defaults.
pub fn parse_config(raw: &str) -> Result<ProxyConfig, ConfigError> {
    let interpolated = interpolate_env_vars(raw);
    let mut config: ProxyConfig = if interpolated.trim().is_empty() {
        ProxyConfig::default()
    } else {
        serde_yaml::from_str(&interpolated).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?
    };

    config.data_dir = config.data_dir.map(|p| expand_tilde_path(&p));
    config.database_path = config.database_path.map(|p| expand_tilde_path(&p));
    config.validate()?;
    Ok(config)
}

/// Find and load the config, falling back to defaults when none exists.
pub fn load_or_default(start: &Path) -> Result<(ProxyConfig, Option<PathBuf>), ConfigError> {
    match find_config_path(start)? {
        Some(path) => Ok((load_config(&path)?, Some(path))),
        None => Ok((ProxyConfig::default(), None)),
    }
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    if let Some((var_name, default)) = expr.split_once(":-") {
        std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
    } else {
        std::env::var(expr).unwrap_or_default()
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

fn expand_tilde_path(path: &Path) -> PathBuf {
    match path.to_str() {
        Some(s) => PathBuf::from(expand_tilde(s)),
        None => path.to_path_buf(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interpolate_env_vars_with_default() {
        std::env::remove_var("__TOOLPROXY_TEST_UNSET__");
        let result = interpolate_env_vars("${__TOOLPROXY_TEST_UNSET__:-/fallback/path}");
        assert_eq!(result, "/fallback/path");
    }

    #[test]
    fn test_interpolate_env_vars_with_value() {
        std::env::set_var("__TOOLPROXY_TEST_VAR__", "/custom/path");
        let result = interpolate_env_vars("${__TOOLPROXY_TEST_VAR__:-/fallback/path}");
        assert_eq!(result, "/custom/path");
        std::env::remove_var("__TOOLPROXY_TEST_VAR__");
    }

    #[test]
    fn test_interpolate_no_vars() {
        let input = "plain text with no variables";
        assert_eq!(interpolate_env_vars(input), input);
    }

    #[test]
    fn test_expand_tilde() {
        let result = expand_tilde("~/Documents");
        assert!(!result.starts_with('~'));
        assert!(result.ends_with("/Documents"));
    }

    #[test]
    fn test_empty_config_is_default() {
        let config = parse_config("").unwrap();
        assert_eq!(config.default_timeout_ms, 30_000);
        assert!(config.discover_on_startup);
        assert!(config.servers.is_empty());
    }

    #[test]
    fn test_full_config() {
        let yaml = r#"
            data_dir: /var/lib/toolproxy
            default_timeout_ms: 5000
            runtimes:
              python: /usr/bin/python3.12
            servers:
              files:
                command: npx
                args: ["-y", "@modelcontextprotocol/server-filesystem", "/tmp"]
              web:
                url: http://localhost:9000/mcp
            discover_on_startup: false
        "#;
        let config = parse_config(yaml).unwrap();
        assert_eq!(config.default_timeout_ms, 5000);
        assert_eq!(config.runtimes.python, "/usr/bin/python3.12");
        assert_eq!(config.runtimes.node, "node");
        assert_eq!(config.servers.len(), 2);
        assert!(matches!(config.servers["web"], ServerDescriptor::Http(_)));
        assert_eq!(
            config.resolved_database_path(),
            PathBuf::from("/var/lib/toolproxy/registry.db")
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            parse_config("default_timeout_ms: 0"),
            Err(ConfigError::Invalid { .. })
        ));
        let yaml = "servers:\n  'a:b':\n    url: http://x\n";
        assert!(matches!(parse_config(yaml), Err(ConfigError::Invalid { .. })));
        assert!(matches!(
            parse_config("default_timeout_ms: [1"),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_find_config_walks_upward() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join(CONFIG_FILE_NAME), "discover_on_startup: false\n")
            .unwrap();
        let nested = root.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();

        // Only meaningful when the env override is not set by the harness.
        if std::env::var(CONFIG_ENV_VAR).is_err() {
            let found = find_config_path(&nested).unwrap().unwrap();
            assert_eq!(found, root.path().join(CONFIG_FILE_NAME));
            let (config, _) = load_or_default(&nested).unwrap();
            assert!(!config.discover_on_startup);
        }
    }
}
