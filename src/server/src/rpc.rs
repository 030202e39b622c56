//! Upgraded RPC transport.
//!
//! A call is a single NUL-terminated JSON object:
//!
//! ```text
//! {"method":"io.podman.AttachContainer","parameters":{"name":"web"},"upgrade":true}\0
//! ```
//!
//! Streaming methods must be called with `upgrade: true`. Once the call is
//! accepted the server replies `{"parameters":{}}\0` and the socket carries
//! upgraded frames (stdout 0, stdin 1, stderr 2, resize 3, quit 4) until the
//! session ends with a quit frame holding the exit code.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

use podmux_core::{ContainerRuntime, EventEmitter, ExecConfig, MuxError, Result};

use crate::error::rpc_error_name;
use crate::server::bind_unix;
use crate::session::{
    AttachSession, SessionLimits, SessionRequest, SessionTarget, StreamSelection, Transport,
};
use crate::tracker::{ConnId, ConnState, ConnectionTracker};

pub const ATTACH_METHOD: &str = "io.podman.AttachContainer";
pub const EXEC_METHOD: &str = "io.podman.ExecContainer";

/// Largest call message accepted.
const MAX_CALL_LEN: u64 = 1024 * 1024;

/// One RPC call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Call {
    pub method: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub upgrade: bool,
}

/// One RPC reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub parameters: serde_json::Value,
}

impl Reply {
    pub fn ok() -> Self {
        Self {
            error: None,
            parameters: serde_json::json!({}),
        }
    }

    pub fn error(name: &str, reason: impl Into<String>) -> Self {
        Self {
            error: Some(name.to_string()),
            parameters: serde_json::json!({ "reason": reason.into() }),
        }
    }

    pub fn from_error(err: &MuxError) -> Self {
        Self::error(rpc_error_name(err), err.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct AttachParams {
    name: String,
    #[serde(default, alias = "detachKeys")]
    keys: Option<String>,
    #[serde(default = "default_true")]
    stdin: bool,
}

#[derive(Debug, Deserialize)]
struct ExecParams {
    opts: ExecOpts,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecOpts {
    name: String,
    cmd: Vec<String>,
    #[serde(default)]
    tty: bool,
    #[serde(default)]
    privileged: bool,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    workdir: Option<String>,
    #[serde(default)]
    env: Vec<String>,
    #[serde(default)]
    detach_keys: Option<String>,
}

fn default_true() -> bool {
    true
}

/// RPC server on its own Unix socket.
pub struct RpcServer {
    socket_path: PathBuf,
    runtime: Arc<dyn ContainerRuntime>,
    tracker: Arc<ConnectionTracker>,
    events: EventEmitter,
    limits: SessionLimits,
    default_detach_keys: String,
}

impl RpcServer {
    pub fn new(
        socket_path: PathBuf,
        runtime: Arc<dyn ContainerRuntime>,
        tracker: Arc<ConnectionTracker>,
        events: EventEmitter,
        limits: SessionLimits,
        default_detach_keys: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            socket_path,
            runtime,
            tracker,
            events,
            limits,
            default_detach_keys,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accept connections until `shutdown` resolves.
    pub async fn serve<F>(self: &Arc<Self>, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let listener = bind_unix(&self.socket_path)?;
        tracing::info!(socket = %self.socket_path.display(), "RPC server listening");
        self.serve_listener(listener, shutdown).await
    }

    pub async fn serve_listener<F>(self: &Arc<Self>, listener: UnixListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!(socket = %self.socket_path.display(), "RPC server stopping");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let stream = match accepted {
                        Ok((stream, _)) => stream,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let conn = self.tracker.next_conn_id();
                    self.tracker.on_state(conn, ConnState::New);
                    let server = Arc::clone(self);
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(conn, stream).await {
                            tracing::debug!(conn, error = %e, "RPC connection failed");
                        }
                        server.tracker.on_state(conn, ConnState::Closed);
                    });
                }
            }
        }
    }

    async fn handle_connection(&self, conn: ConnId, stream: UnixStream) -> Result<()> {
        let mut stream = BufReader::new(stream);

        loop {
            let Some(call) = read_call(&mut stream).await? else {
                return Ok(());
            };
            self.tracker.on_state(conn, ConnState::Active);
            tracing::debug!(conn, method = %call.method, upgrade = call.upgrade, "RPC call");

            let session = match self.negotiate(&call) {
                Ok(session) => session,
                Err(reply) => {
                    write_reply(&mut stream, &reply).await?;
                    self.tracker.on_state(conn, ConnState::Idle);
                    continue;
                }
            };

            let _guard = self.tracker.hijack(conn);
            write_reply(&mut stream, &Reply::ok()).await?;
            let report = session.run(stream).await;
            tracing::debug!(conn, exit_code = ?report.exit_code, "RPC session finished");
            return Ok(());
        }
    }

    /// Check a call and build its session, or produce the error reply.
    fn negotiate(&self, call: &Call) -> std::result::Result<AttachSession, Reply> {
        let (name, request) = match call.method.as_str() {
            ATTACH_METHOD => {
                let params: AttachParams = parse_params(&call.parameters)?;
                let request = SessionRequest {
                    transport: Transport::Upgraded,
                    target: SessionTarget::Attach,
                    streams: StreamSelection {
                        stdin: params.stdin,
                        stdout: true,
                        stderr: true,
                    },
                    detach_keys: params.keys,
                };
                (params.name, request)
            }
            EXEC_METHOD => {
                let params: ExecParams = parse_params(&call.parameters)?;
                let opts = params.opts;
                if opts.cmd.is_empty() {
                    return Err(Reply::error("io.podman.ErrorOccurred", "exec requires a command"));
                }
                let config = ExecConfig {
                    cmd: opts.cmd,
                    tty: opts.tty,
                    env: opts.env,
                    user: opts.user,
                    working_dir: opts.workdir,
                    privileged: opts.privileged,
                };
                let request = SessionRequest {
                    transport: Transport::Upgraded,
                    target: SessionTarget::Exec(config),
                    streams: StreamSelection::all(),
                    detach_keys: opts.detach_keys,
                };
                (opts.name, request)
            }
            other => {
                return Err(Reply::error(
                    "org.varlink.service.MethodNotFound",
                    format!("unknown method {}", other),
                ))
            }
        };

        if !call.upgrade {
            return Err(Reply::error(
                "io.podman.ErrorOccurred",
                format!("{} must be called with upgrade", call.method),
            ));
        }

        AttachSession::negotiate(
            self.runtime.as_ref(),
            &name,
            request,
            &self.default_detach_keys,
            self.limits,
            self.events.clone(),
        )
        .map_err(|e| Reply::from_error(&e))
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(value: &serde_json::Value) -> std::result::Result<T, Reply> {
    serde_json::from_value(value.clone())
        .map_err(|e| Reply::error("org.varlink.service.InvalidParameter", e.to_string()))
}

/// Read one NUL-terminated call. `None` when the peer closed cleanly.
pub async fn read_call<R>(reader: &mut R) -> Result<Option<Call>>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    (&mut *reader).take(MAX_CALL_LEN).read_until(0, &mut buf).await?;
    if buf.is_empty() {
        return Ok(None);
    }
    if buf.pop() != Some(0) {
        return Err(MuxError::Framing("RPC message truncated or too long".to_string()));
    }
    Ok(Some(serde_json::from_slice(&buf)?))
}

/// Write one NUL-terminated reply.
pub async fn write_reply<W>(writer: &mut W, reply: &Reply) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut buf = serde_json::to_vec(reply)?;
    buf.push(0);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}
