//! Attach session orchestration.
//!
//! A session owns one hijacked client connection from the moment the
//! protocol switch is sent until the connection is closed:
//!
//! 1. **Negotiate** (before hijack): look the container up, check its state,
//!    validate detach keys and decide between terminal and multiplexed output.
//! 2. **Wire**: start one pump per requested output stream, connect client
//!    input to the container's stdin (raw on the compat transport, de-framed
//!    on the upgraded one).
//! 3. **Run**: wait for the first of pump EOF, pump error, inbound framing
//!    error or the runtime call returning.
//! 4. **Drain**: close every pump, give the runtime call a bounded grace
//!    period, then wait for buffered output to reach the wire.
//! 5. **Report**: errors can no longer become HTTP statuses, so they are
//!    written into the connection and logged.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

use podmux_core::detach;
use podmux_core::event::{events, EventEmitter, MuxEvent};
use podmux_core::frame::{encode_exit_code, FrameCodec, FrameWriter, StreamKind};
use podmux_core::{
    AttachIo, Container, ContainerRuntime, ContainerStatus, ExecConfig, MuxError, OutputSink,
    ResizeReceiver, Result, ServerConfig, TerminalSize,
};

use crate::error::exec_exit_code;
use crate::pump::{self, PumpHandle, PumpOptions};

/// Resize events buffered per session.
const RESIZE_QUEUE_DEPTH: usize = 16;

/// Client input buffered between the inbound demultiplexer and the runtime.
const STDIN_BUFFER: usize = 64 * 1024;

/// Wire generation of the hijacked connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Hijacked HTTP connection, Docker compatible numbering.
    Compat,
    /// Upgraded RPC connection with resize and quit frames.
    Upgraded,
}

impl Transport {
    pub fn codec(&self) -> FrameCodec {
        match self {
            Transport::Compat => FrameCodec::compat(),
            Transport::Upgraded => FrameCodec::upgraded(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Compat => "compat",
            Transport::Upgraded => "upgraded",
        }
    }
}

/// Which standard streams the client asked for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamSelection {
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
}

impl StreamSelection {
    pub fn all() -> Self {
        Self {
            stdin: true,
            stdout: true,
            stderr: true,
        }
    }
}

/// What the session runs.
#[derive(Debug, Clone)]
pub enum SessionTarget {
    /// The container's main process.
    Attach,
    /// A command started in the running container.
    Exec(ExecConfig),
}

/// Client parameters of one session.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub transport: Transport,
    pub target: SessionTarget,
    pub streams: StreamSelection,
    /// `None` uses the runtime default, `Some("")` disables detaching.
    pub detach_keys: Option<String>,
}

/// Per-session resource limits.
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    pub drain_timeout: Duration,
    pub max_frame_payload: usize,
    pub pump: PumpOptions,
}

impl SessionLimits {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            drain_timeout: config.drain_timeout(),
            max_frame_payload: config.max_frame_payload,
            pump: PumpOptions {
                chunk_size: config.pump_chunk_size,
                queue_depth: config.pump_queue_depth,
            },
        }
    }
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default())
    }
}

/// First event that ended the wait phase.
#[derive(Debug)]
pub enum WaitOutcome {
    /// The runtime call returned successfully.
    Normal { exit_code: Option<i32> },
    /// The client typed the detach sequence.
    Detached,
    /// An output stream reached EOF.
    Eof(StreamKind),
    /// A pump, the inbound stream or the runtime failed.
    Failed(MuxError),
}

/// Result of a finished session.
#[derive(Debug)]
pub struct SessionReport {
    pub outcome: WaitOutcome,
    /// Exit code of the session's process when known.
    pub exit_code: Option<i32>,
}

impl SessionReport {
    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, WaitOutcome::Failed(_))
    }
}

/// A negotiated session, ready to take over a connection.
pub struct AttachSession {
    container: Arc<dyn Container>,
    request: SessionRequest,
    terminal: bool,
    limits: SessionLimits,
    events: EventEmitter,
    resize_tx: mpsc::Sender<TerminalSize>,
    resize_rx: ResizeReceiver,
}

impl AttachSession {
    /// Run every check that must happen before the connection is hijacked.
    pub fn negotiate(
        runtime: &dyn ContainerRuntime,
        name: &str,
        request: SessionRequest,
        default_detach_keys: &str,
        limits: SessionLimits,
        events: EventEmitter,
    ) -> Result<Self> {
        let container = runtime.lookup(name)?;
        let state = container.state();

        let terminal = match &request.target {
            SessionTarget::Attach => {
                if !state.is_attachable() {
                    return Err(MuxError::InvalidState {
                        id: container.id().to_string(),
                        state: state.to_string(),
                        message: "can only attach to created or running containers".to_string(),
                    });
                }
                container.terminal()
            }
            SessionTarget::Exec(config) => {
                if state != ContainerStatus::Running {
                    return Err(MuxError::InvalidState {
                        id: container.id().to_string(),
                        state: state.to_string(),
                        message: "can only exec in running containers".to_string(),
                    });
                }
                config.tty
            }
        };

        detach::resolve(request.detach_keys.as_deref(), default_detach_keys)?;

        let (resize_tx, resize_rx) = mpsc::channel(RESIZE_QUEUE_DEPTH);
        Ok(Self {
            container,
            request,
            terminal,
            limits,
            events,
            resize_tx,
            resize_rx,
        })
    }

    pub fn container_id(&self) -> &str {
        self.container.id()
    }

    /// Whether output is written raw instead of multiplexed.
    pub fn is_raw(&self) -> bool {
        self.terminal && self.request.transport == Transport::Compat
    }

    /// Sender for out-of-band resize requests.
    pub fn resize_handle(&self) -> mpsc::Sender<TerminalSize> {
        self.resize_tx.clone()
    }

    /// Take over `stream` and run the session to completion.
    pub async fn run<S>(self, stream: S) -> SessionReport
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let raw = self.is_raw();
        let AttachSession {
            container,
            request,
            terminal,
            limits,
            events,
            resize_tx,
            resize_rx,
        } = self;
        let id = container.id().to_string();
        let transport = request.transport;

        let codec = transport.codec().with_max_payload(limits.max_frame_payload);
        let (reader, writer) = tokio::io::split(stream);
        let out = Arc::new(FrameWriter::new(codec, writer));

        tracing::info!(
            container = %id,
            transport = transport.as_str(),
            terminal,
            "session attached"
        );
        events.emit(
            MuxEvent::new(events::SESSION_ATTACHED)
                .with("container", id.as_str())
                .with("transport", transport.as_str()),
        );

        // Wire outputs.
        let (signals, mut signal_rx) = pump::signal_queues();
        let mut pumps: Vec<PumpHandle> = Vec::new();
        let mut io = AttachIo::default();

        if request.streams.stdout {
            if raw {
                io.stdout = Some(Box::new(RawWriter::new(Arc::clone(&out))));
            } else {
                let (sink, handle) =
                    pump::spawn(StreamKind::Stdout, Arc::clone(&out), signals.clone(), limits.pump);
                io.stdout = Some(Box::new(sink));
                pumps.push(handle);
            }
        }
        // A terminal merges stderr into stdout.
        if request.streams.stderr && !terminal {
            let (sink, handle) =
                pump::spawn(StreamKind::Stderr, Arc::clone(&out), signals.clone(), limits.pump);
            io.stderr = Some(Box::new(sink));
            pumps.push(handle);
        }
        drop(signals);

        // Wire input.
        let mut inbound: BoxFuture<'static, Result<()>> = match transport {
            Transport::Compat => {
                if request.streams.stdin {
                    io.stdin = Some(Box::new(reader));
                }
                Box::pin(futures::future::pending())
            }
            Transport::Upgraded => {
                let stdin = if request.streams.stdin {
                    let (client_side, container_side) = tokio::io::duplex(STDIN_BUFFER);
                    io.stdin = Some(Box::new(container_side));
                    Some(client_side)
                } else {
                    None
                };
                Box::pin(demux(reader, codec, stdin, resize_tx.clone()))
            }
        };
        drop(resize_tx);

        let detach_keys = request.detach_keys.clone();
        let is_exec = matches!(request.target, SessionTarget::Exec(_));
        let mut runtime_call: BoxFuture<'static, Result<Option<i32>>> = match request.target {
            SessionTarget::Attach => {
                let container = Arc::clone(&container);
                Box::pin(async move {
                    container.attach(io, detach_keys, resize_rx).await?;
                    Ok(None)
                })
            }
            SessionTarget::Exec(config) => {
                let container = Arc::clone(&container);
                Box::pin(async move {
                    let code = container.exec(config, io, detach_keys, resize_rx).await?;
                    Ok(Some(code))
                })
            }
        };

        // Run: first event wins.
        let mut inbound_open = true;
        let mut runtime_done = false;
        let outcome = loop {
            tokio::select! {
                result = &mut runtime_call => {
                    runtime_done = true;
                    break match result {
                        Ok(exit_code) => WaitOutcome::Normal { exit_code },
                        Err(MuxError::Detached) => WaitOutcome::Detached,
                        Err(e) => WaitOutcome::Failed(e),
                    };
                }
                Some(kind) = signal_rx.eof.recv() => break WaitOutcome::Eof(kind),
                Some(failure) = signal_rx.errors.recv() => {
                    tracing::debug!(container = %id, stream = %failure.kind, "pump failed");
                    break WaitOutcome::Failed(failure.error);
                }
                result = &mut inbound, if inbound_open => {
                    inbound_open = false;
                    match result {
                        Ok(()) => tracing::debug!(container = %id, "client input finished"),
                        Err(e) => break WaitOutcome::Failed(e),
                    }
                }
            }
        };
        drop(inbound);

        // Drain.
        for handle in &pumps {
            handle.close();
        }

        let mut exit_code = match &outcome {
            WaitOutcome::Normal { exit_code } => *exit_code,
            _ => None,
        };
        if !runtime_done {
            match tokio::time::timeout(limits.drain_timeout, &mut runtime_call).await {
                Ok(Ok(code)) => exit_code = code,
                Ok(Err(MuxError::Detached)) | Ok(Err(MuxError::StreamClosed)) => {}
                Ok(Err(e)) => {
                    tracing::warn!(container = %id, error = %e, "runtime failed after session ended")
                }
                Err(_) => {
                    tracing::warn!(container = %id, "runtime call did not return in time, dropping it")
                }
            }
        }
        drop(runtime_call);

        for handle in pumps {
            handle.join(limits.drain_timeout).await;
        }
        // Late pump events are discarded; the session is already over.
        drop(signal_rx);

        if let WaitOutcome::Failed(e) = &outcome {
            if is_exec && exit_code.is_none() {
                exit_code = Some(exec_exit_code(e));
            }
        }

        // Report.
        report(&out, transport, &outcome, exit_code, &id).await;
        if let Err(e) = out.shutdown().await {
            tracing::debug!(container = %id, error = %e, "connection shutdown failed");
        }

        emit_outcome(&events, &id, &outcome, exit_code);
        SessionReport { outcome, exit_code }
    }
}

/// Best-effort reporting of the session's end over the hijacked connection.
async fn report(
    out: &FrameWriter,
    transport: Transport,
    outcome: &WaitOutcome,
    exit_code: Option<i32>,
    id: &str,
) {
    let error = match outcome {
        WaitOutcome::Failed(e) => {
            if e.is_disconnect() {
                tracing::debug!(container = %id, error = %e, "client went away");
                return;
            }
            tracing::error!(container = %id, error = %e, "session failed");
            Some(e)
        }
        _ => None,
    };

    let written = match transport {
        Transport::Compat => match error {
            Some(e) => out.write_raw(format!("{}\n", e).as_bytes()).await,
            None => Ok(()),
        },
        Transport::Upgraded => {
            let code = exit_code.unwrap_or(if error.is_some() { 125 } else { 0 });
            let stderr = match error {
                Some(e) => out.write_frame(StreamKind::Stderr, format!("{}\n", e).as_bytes()).await,
                None => Ok(()),
            };
            match stderr {
                Ok(()) => out.write_frame(StreamKind::Quit, &encode_exit_code(code)).await,
                Err(e) => Err(e),
            }
        }
    };
    if let Err(e) = written {
        tracing::debug!(container = %id, error = %e, "could not report session end to client");
    }
}

fn emit_outcome(events: &EventEmitter, id: &str, outcome: &WaitOutcome, exit_code: Option<i32>) {
    let event = match outcome {
        WaitOutcome::Detached => {
            tracing::info!(container = %id, "client detached");
            MuxEvent::new(events::SESSION_DETACHED)
        }
        WaitOutcome::Failed(e) => MuxEvent::new(events::SESSION_FAILED).with("error", e.to_string()),
        WaitOutcome::Normal { .. } | WaitOutcome::Eof(_) => {
            tracing::info!(container = %id, exit_code = ?exit_code, "session ended");
            MuxEvent::new(events::SESSION_ENDED)
        }
    };
    let mut event = event.with("container", id);
    if let Some(code) = exit_code {
        event = event.with("exit_code", code.to_string());
    }
    events.emit(event);
}

/// Split the upgraded client stream into stdin bytes, resize events and the
/// end of input. Returns when the client quits or closes its side.
async fn demux<R>(
    mut reader: R,
    codec: FrameCodec,
    mut stdin: Option<DuplexStream>,
    resize: mpsc::Sender<TerminalSize>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        let Some(frame) = codec.read_frame(&mut reader).await? else {
            return Ok(());
        };

        match frame.kind {
            StreamKind::Stdin => {
                let Some(writer) = stdin.as_mut() else {
                    continue;
                };
                if let Err(e) = writer.write_all(&frame.payload).await {
                    tracing::debug!(error = %e, "container stopped reading stdin");
                    stdin = None;
                }
            }
            StreamKind::Resize => match TerminalSize::from_json(&frame.payload) {
                Ok(size) => {
                    if let Err(mpsc::error::TrySendError::Full(_)) = resize.try_send(size) {
                        tracing::warn!(width = size.width, height = size.height, "resize queue full, dropping event");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "ignoring malformed resize frame"),
            },
            StreamKind::Quit => return Ok(()),
            other => tracing::debug!(stream = %other, "ignoring inbound frame"),
        }
    }
}

/// Unframed stdout for terminal sessions on the compat transport.
pub struct RawWriter {
    out: Arc<FrameWriter>,
    closed: AtomicBool,
}

impl RawWriter {
    pub fn new(out: Arc<FrameWriter>) -> Self {
        Self {
            out,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl OutputSink for RawWriter {
    async fn write(&self, buf: &[u8]) -> Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MuxError::StreamClosed);
        }
        self.out.write_raw(buf).await?;
        Ok(buf.len())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(MuxError::AlreadyClosed(StreamKind::Stdout.to_string()));
        }
        self.out.flush().await
    }
}
