//! Exec session registry.
//!
//! An exec session is created by one request and started by a later one, so
//! its configuration is parked here between the two calls.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;

use podmux_core::{ExecConfig, MuxError, Result, TerminalSize};

use crate::session::StreamSelection;

/// One exec session.
#[derive(Debug)]
pub struct ExecSession {
    pub id: String,
    pub container: String,
    pub config: ExecConfig,
    pub streams: StreamSelection,
    pub detach_keys: Option<String>,
    started: AtomicBool,
    running: AtomicBool,
    exit_code: Mutex<Option<i32>>,
    resize: Mutex<Option<mpsc::Sender<TerminalSize>>>,
}

impl ExecSession {
    /// Claim the session for starting. Only the first caller succeeds.
    pub fn begin(&self) -> Result<()> {
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(MuxError::InvalidState {
                id: self.id.clone(),
                state: "started".to_string(),
                message: "exec session can only be started once".to_string(),
            });
        }
        self.running.store(true, Ordering::Release);
        Ok(())
    }

    /// Record the result of a finished session.
    pub fn finish(&self, exit_code: Option<i32>) {
        self.running.store(false, Ordering::Release);
        *self.exit_code.lock() = exit_code;
        self.resize.lock().take();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock()
    }

    /// Route out-of-band resize requests to the running session.
    pub fn set_resize(&self, tx: mpsc::Sender<TerminalSize>) {
        *self.resize.lock() = Some(tx);
    }

    pub fn resize(&self, size: TerminalSize) -> Result<()> {
        let tx = self.resize.lock().clone();
        match tx {
            Some(tx) => tx.try_send(size).map_err(|_| MuxError::InvalidState {
                id: self.id.clone(),
                state: "busy".to_string(),
                message: "resize queue unavailable".to_string(),
            }),
            None => Err(MuxError::InvalidState {
                id: self.id.clone(),
                state: "stopped".to_string(),
                message: "exec session is not running".to_string(),
            }),
        }
    }

    pub fn inspect(&self) -> ExecInspect {
        ExecInspect {
            id: self.id.clone(),
            container_id: self.container.clone(),
            running: self.is_running(),
            exit_code: self.exit_code(),
            open_stdin: self.streams.stdin,
            open_stdout: self.streams.stdout,
            open_stderr: self.streams.stderr,
            process_config: ProcessConfig {
                entrypoint: self.config.cmd.first().cloned().unwrap_or_default(),
                arguments: self.config.cmd.iter().skip(1).cloned().collect(),
                tty: self.config.tty,
                user: self.config.user.clone().unwrap_or_default(),
                privileged: self.config.privileged,
            },
        }
    }
}

/// `GET /exec/{id}/json` body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecInspect {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "ContainerID")]
    pub container_id: String,
    pub running: bool,
    pub exit_code: Option<i32>,
    pub open_stdin: bool,
    pub open_stdout: bool,
    pub open_stderr: bool,
    pub process_config: ProcessConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessConfig {
    pub entrypoint: String,
    pub arguments: Vec<String>,
    pub tty: bool,
    pub user: String,
    pub privileged: bool,
}

/// Exec sessions keyed by id.
#[derive(Debug, Default)]
pub struct ExecRegistry {
    sessions: DashMap<String, Arc<ExecSession>>,
}

impl ExecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(
        &self,
        container: &str,
        config: ExecConfig,
        streams: StreamSelection,
        detach_keys: Option<String>,
    ) -> Arc<ExecSession> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let session = Arc::new(ExecSession {
            id: id.clone(),
            container: container.to_string(),
            config,
            streams,
            detach_keys,
            started: AtomicBool::new(false),
            running: AtomicBool::new(false),
            exit_code: Mutex::new(None),
            resize: Mutex::new(None),
        });
        self.sessions.insert(id, Arc::clone(&session));
        tracing::debug!(exec_id = %session.id, container, "exec session created");
        session
    }

    pub fn get(&self, id: &str) -> Result<Arc<ExecSession>> {
        self.sessions
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| MuxError::ExecSessionNotFound(id.to_string()))
    }

    pub fn remove(&self, id: &str) -> Option<Arc<ExecSession>> {
        self.sessions.remove(id).map(|(_, session)| session)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
