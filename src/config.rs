use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Default location consulted when no `--config` path is given.
pub const DEFAULT_CONFIG_PATH: &str = "config/harness.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config from {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config from {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// One configured tool-server process. `pool` groups interchangeable servers
/// under a shared capability name for load-balanced routing.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub workdir: Option<PathBuf>,
    pub pool: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// How long `execute` waits for the child before handing over to
    /// background monitoring.
    pub capture_window_ms: u64,
    /// Interval between background delta reports for handed-over executions.
    pub monitor_interval_ms: u64,
    /// Per-stream byte cap on captured output.
    pub output_limit_bytes: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            capture_window_ms: 10_000,
            monitor_interval_ms: 60_000,
            output_limit_bytes: 512 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Approximate token ceiling; exceeding it triggers aggressive cleanup.
    pub token_ceiling: usize,
    /// Payloads longer than this many characters are truncated at append time.
    pub inline_threshold: usize,
    /// Most-recent tool calls kept at full detail and never discarded.
    pub recent_tool_calls: usize,
    /// Most-recent execution input/output entries kept at full detail.
    pub recent_executions: usize,
    /// Hard cap on total entries; oldest summarized entries evicted first.
    pub hard_cap: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            token_ceiling: 24_000,
            inline_threshold: 512,
            recent_tool_calls: 10,
            recent_executions: 5,
            hard_cap: 200,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub servers: Vec<ServerConfig>,
    pub execution: ExecutionConfig,
    pub history: HistoryConfig,
}

#[derive(Debug, Deserialize, Default)]
struct RawConfig {
    #[serde(default)]
    servers: Vec<RawServer>,
    #[serde(default)]
    execution: ExecutionConfig,
    #[serde(default)]
    history: HistoryConfig,
}

#[derive(Debug, Deserialize)]
struct RawServer {
    name: String,
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    workdir: Option<String>,
    pool: Option<String>,
}

impl AppConfig {
    /// Load from an explicit path, or from the default path if present; a
    /// missing default file yields the built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return read_config(path);
        }
        let default_path = Path::new(DEFAULT_CONFIG_PATH);
        match read_config(default_path) {
            Ok(config) => Ok(config),
            Err(ConfigError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                info!("Configuration file not found; using defaults");
                Ok(Self::default())
            }
            Err(other) => Err(other),
        }
    }
}

fn read_config(path: &Path) -> Result<AppConfig, ConfigError> {
    debug!(path = %path.display(), "Reading harness configuration file");
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let parsed: RawConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(AppConfig {
        servers: parsed.servers.into_iter().map(ServerConfig::from).collect(),
        execution: parsed.execution,
        history: parsed.history,
    })
}

impl From<RawServer> for ServerConfig {
    fn from(raw: RawServer) -> Self {
        let workdir = raw
            .workdir
            .map(|dir| PathBuf::from(shellexpand::tilde(&dir).into_owned()));
        Self {
            name: raw.name,
            command: raw.command,
            args: raw.args,
            env: raw.env,
            workdir,
            pool: raw.pool,
        }
    }
}
