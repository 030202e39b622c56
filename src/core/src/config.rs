use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::detach::DEFAULT_DETACH_KEYS;
use crate::error::{MuxError, Result};
use crate::frame::DEFAULT_MAX_FRAME_PAYLOAD;
use crate::runtime::ContainerStatus;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Unix socket serving the HTTP compat API
    pub api_socket: PathBuf,

    /// Unix socket serving the upgraded RPC API (disabled when unset)
    pub rpc_socket: Option<PathBuf>,

    /// Shut down after this many seconds without connections (0 = never)
    pub idle_timeout_secs: u64,

    /// Detach sequence used when a client does not override it
    pub detach_keys: String,

    /// How long a finished session waits for pumps and the runtime to unwind
    pub drain_timeout_ms: u64,

    /// Largest inbound frame payload accepted
    pub max_frame_payload: usize,

    /// Largest payload emitted in one outbound frame
    pub pump_chunk_size: usize,

    /// Chunks buffered per output stream before the runtime blocks
    pub pump_queue_depth: usize,

    /// Log level
    pub log_level: LogLevel,

    /// Log output format
    pub log_format: LogFormat,

    /// Containers served by the process-backed runtime
    pub containers: Vec<ContainerSpec>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            api_socket: default_api_socket(),
            rpc_socket: None,
            idle_timeout_secs: 0,
            detach_keys: DEFAULT_DETACH_KEYS.to_string(),
            drain_timeout_ms: 5_000,
            max_frame_payload: DEFAULT_MAX_FRAME_PAYLOAD,
            pump_chunk_size: 32 * 1024,
            pump_queue_depth: 64,
            log_level: LogLevel::Info,
            log_format: LogFormat::Text,
            containers: Vec::new(),
        }
    }
}

fn default_api_socket() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("podmux")
        .join("podmux.sock")
}

impl ServerConfig {
    /// Load configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            MuxError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config: ServerConfig = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the streaming layer cannot honor.
    pub fn validate(&self) -> Result<()> {
        crate::detach::parse(&self.detach_keys)?;
        if self.pump_chunk_size == 0 {
            return Err(MuxError::Config("pump_chunk_size must be positive".into()));
        }
        if self.pump_queue_depth == 0 {
            return Err(MuxError::Config("pump_queue_depth must be positive".into()));
        }
        if self.pump_chunk_size > self.max_frame_payload {
            return Err(MuxError::Config(format!(
                "pump_chunk_size {} exceeds max_frame_payload {}",
                self.pump_chunk_size, self.max_frame_payload
            )));
        }
        for spec in &self.containers {
            if spec.command.is_empty() {
                return Err(MuxError::Config(format!(
                    "container {} has an empty command",
                    spec.name
                )));
            }
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// A container declared for the process-backed runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Container name, also used as its ID
    pub name: String,

    /// Command run on attach
    pub command: Vec<String>,

    /// Whether the process runs with a terminal
    #[serde(default)]
    pub tty: bool,

    /// Extra environment (KEY=VALUE)
    #[serde(default)]
    pub env: Vec<String>,

    /// Reported lifecycle state
    #[serde(default = "default_container_state")]
    pub state: ContainerStatus,
}

fn default_container_state() -> ContainerStatus {
    ContainerStatus::Running
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(format!("unknown log level: '{}'", s)),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: '{}' (supported: text, json)", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.detach_keys, "ctrl-p,ctrl-q");
        assert!(config.idle_timeout().is_none());
        assert!(config.api_socket.ends_with("podmux.sock"));
    }

    #[test]
    fn test_load_partial_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "idle_timeout_secs: 30\nlog_format: json\ncontainers:\n  - name: web\n    command: [\"/bin/cat\"]"
        )
        .unwrap();

        let config = ServerConfig::load(file.path()).unwrap();
        assert_eq!(config.idle_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.containers.len(), 1);
        assert_eq!(config.containers[0].state, ContainerStatus::Running);
        assert!(!config.containers[0].tty);
        assert_eq!(config.pump_queue_depth, 64);
    }

    #[test]
    fn test_invalid_detach_keys_rejected() {
        let config = ServerConfig {
            detach_keys: "ctrl-1".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_chunk_larger_than_frame_rejected() {
        let config = ServerConfig {
            pump_chunk_size: 1024,
            max_frame_payload: 512,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(MuxError::Config(_))));
    }

    #[test]
    fn test_empty_command_rejected() {
        let config = ServerConfig {
            containers: vec![ContainerSpec {
                name: "broken".to_string(),
                command: vec![],
                tty: false,
                env: vec![],
                state: ContainerStatus::Running,
            }],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file() {
        let err = ServerConfig::load("/nonexistent/podmux.yaml").unwrap_err();
        assert!(matches!(err, MuxError::Config(_)));
    }

    #[test]
    fn test_log_level_from_str() {
        assert_eq!("WARN".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!(tracing::Level::from(LogLevel::Debug), tracing::Level::DEBUG);
        assert!("trace".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_log_format_from_str() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
