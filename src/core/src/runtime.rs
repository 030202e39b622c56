//! Interfaces to the container runtime.
//!
//! The streaming layer never manages containers itself. It looks containers
//! up, checks their state, and hands their attach/exec calls a set of I/O
//! endpoints wired to the client connection.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::terminal::TerminalSize;

/// Container lifecycle state as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Configured,
    Created,
    Running,
    Paused,
    Stopped,
    Exited,
}

impl ContainerStatus {
    /// Attach is allowed to created or running containers.
    pub fn is_attachable(&self) -> bool {
        matches!(self, ContainerStatus::Created | ContainerStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerStatus::Configured => "configured",
            ContainerStatus::Created => "created",
            ContainerStatus::Running => "running",
            ContainerStatus::Paused => "paused",
            ContainerStatus::Stopped => "stopped",
            ContainerStatus::Exited => "exited",
        }
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Destination for one container output stream.
///
/// `write` fails with `StreamClosed` once the sink has been closed; runtimes
/// treat that as the signal to stop copying.
#[async_trait]
pub trait OutputSink: Send + Sync {
    async fn write(&self, buf: &[u8]) -> Result<usize>;

    /// No more data will be written. Fails if already closed.
    async fn close(&self) -> Result<()>;
}

/// Boxed client input stream.
pub type InputStream = Box<dyn AsyncRead + Send + Unpin>;

/// Streams handed to a runtime attach or exec call. Absent streams were not
/// requested by the client.
#[derive(Default)]
pub struct AttachIo {
    pub stdin: Option<InputStream>,
    pub stdout: Option<Box<dyn OutputSink>>,
    pub stderr: Option<Box<dyn OutputSink>>,
}

impl fmt::Debug for AttachIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachIo")
            .field("stdin", &self.stdin.is_some())
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .finish()
    }
}

/// Resize events for one session, in arrival order.
pub type ResizeReceiver = mpsc::Receiver<TerminalSize>;

/// Parameters of a command executed inside a running container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecConfig {
    pub cmd: Vec<String>,
    #[serde(default)]
    pub tty: bool,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub privileged: bool,
}

/// A container as seen by the streaming layer.
#[async_trait]
pub trait Container: Send + Sync {
    fn id(&self) -> &str;

    fn state(&self) -> ContainerStatus;

    /// Whether the container's process spec requests a pseudo-terminal.
    fn terminal(&self) -> bool;

    /// Attach to the container's main process.
    ///
    /// `detach_keys` is `None` when the client asked for nothing (runtime
    /// default applies) and `Some("")` when detaching is disabled. Blocks
    /// until the process streams close or the client detaches
    /// (`MuxError::Detached`).
    async fn attach(
        &self,
        io: AttachIo,
        detach_keys: Option<String>,
        resize: ResizeReceiver,
    ) -> Result<()>;

    /// Run a command in the container and return its exit code.
    async fn exec(
        &self,
        config: ExecConfig,
        io: AttachIo,
        detach_keys: Option<String>,
        resize: ResizeReceiver,
    ) -> Result<i32>;
}

/// Container lookup.
pub trait ContainerRuntime: Send + Sync {
    fn lookup(&self, name_or_id: &str) -> Result<Arc<dyn Container>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attachable_states() {
        assert!(ContainerStatus::Created.is_attachable());
        assert!(ContainerStatus::Running.is_attachable());
        assert!(!ContainerStatus::Paused.is_attachable());
        assert!(!ContainerStatus::Exited.is_attachable());
    }

    #[test]
    fn test_status_serde() {
        let json = serde_json::to_string(&ContainerStatus::Running).unwrap();
        assert_eq!(json, "\"running\"");
        let parsed: ContainerStatus = serde_json::from_str("\"exited\"").unwrap();
        assert_eq!(parsed, ContainerStatus::Exited);
    }

    #[test]
    fn test_attach_io_debug() {
        let io = AttachIo::default();
        let debug = format!("{:?}", io);
        assert!(debug.contains("stdin: false"));
    }
}
