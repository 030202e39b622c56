//! Output stream pumps.
//!
//! A pump moves one container output stream (stdout or stderr) onto the
//! session connection as frames. The runtime pushes bytes through the
//! [`PumpWriter`] half; a spawned task drains them and writes one frame per
//! chunk under the connection lock.
//!
//! Every pump reports exactly one terminal event on the session's signal
//! queues: EOF when its input is closed and drained, or the error that
//! stopped it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use podmux_core::frame::{FrameWriter, StreamKind};
use podmux_core::runtime::OutputSink;
use podmux_core::{MuxError, Result};

/// Terminal error reported by a pump.
#[derive(Debug)]
pub struct PumpFailure {
    pub kind: StreamKind,
    pub error: MuxError,
}

/// Sending halves of a session's EOF and error queues.
#[derive(Clone)]
pub struct PumpSignals {
    eof: mpsc::UnboundedSender<StreamKind>,
    errors: mpsc::UnboundedSender<PumpFailure>,
}

/// Receiving halves, owned by the session orchestrator.
pub struct SignalReceivers {
    pub eof: mpsc::UnboundedReceiver<StreamKind>,
    pub errors: mpsc::UnboundedReceiver<PumpFailure>,
}

/// Create the EOF and error queues shared by all pumps of one session.
pub fn signal_queues() -> (PumpSignals, SignalReceivers) {
    let (eof_tx, eof_rx) = mpsc::unbounded_channel();
    let (err_tx, err_rx) = mpsc::unbounded_channel();
    (
        PumpSignals {
            eof: eof_tx,
            errors: err_tx,
        },
        SignalReceivers {
            eof: eof_rx,
            errors: err_rx,
        },
    )
}

/// Buffering limits for one pump.
#[derive(Debug, Clone, Copy)]
pub struct PumpOptions {
    /// Largest payload per emitted frame.
    pub chunk_size: usize,
    /// Chunks buffered before `write` waits.
    pub queue_depth: usize,
}

impl Default for PumpOptions {
    fn default() -> Self {
        Self {
            chunk_size: 32 * 1024,
            queue_depth: 64,
        }
    }
}

struct PumpState {
    kind: StreamKind,
    /// Set once, never cleared.
    got_eof: AtomicBool,
    /// Source side of the internal buffer; `None` once closed.
    tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    /// Wakes writers waiting for queue space when EOF is recorded.
    closed: watch::Sender<bool>,
}

impl PumpState {
    fn record_eof(&self) {
        self.got_eof.store(true, Ordering::Release);
        self.tx.lock().take();
        self.closed.send_replace(true);
    }

    fn is_eof(&self) -> bool {
        self.got_eof.load(Ordering::Acquire)
    }
}

/// Runtime-facing half of a pump.
pub struct PumpWriter {
    state: Arc<PumpState>,
    chunk_size: usize,
}

#[async_trait]
impl OutputSink for PumpWriter {
    async fn write(&self, buf: &[u8]) -> Result<usize> {
        if self.state.is_eof() {
            return Err(MuxError::StreamClosed);
        }
        let tx = self.state.tx.lock().clone().ok_or(MuxError::StreamClosed)?;
        let mut closed = self.state.closed.subscribe();

        // EOF is checked per chunk: nothing is queued once the pump is closed,
        // even in the middle of a write.
        for chunk in buf.chunks(self.chunk_size) {
            let permit = tokio::select! {
                biased;
                _ = closed.wait_for(|closed| *closed) => return Err(MuxError::StreamClosed),
                permit = tx.reserve() => permit.map_err(|_| MuxError::StreamClosed)?,
            };
            if self.state.is_eof() {
                return Err(MuxError::StreamClosed);
            }
            permit.send(Bytes::copy_from_slice(chunk));
        }
        Ok(buf.len())
    }

    async fn close(&self) -> Result<()> {
        match self.state.tx.lock().take() {
            Some(_) => Ok(()),
            None => Err(MuxError::AlreadyClosed(self.state.kind.to_string())),
        }
    }
}

/// Orchestrator-facing half of a pump.
pub struct PumpHandle {
    state: Arc<PumpState>,
    task: JoinHandle<()>,
}

impl PumpHandle {
    pub fn kind(&self) -> StreamKind {
        self.state.kind
    }

    pub fn is_eof(&self) -> bool {
        self.state.is_eof()
    }

    /// Stop accepting data. Already buffered chunks are still written.
    /// Safe to call any number of times.
    pub fn close(&self) {
        self.state.record_eof();
    }

    /// Wait for the pump task to finish, aborting it after `timeout`.
    pub async fn join(mut self, timeout: Duration) {
        if tokio::time::timeout(timeout, &mut self.task).await.is_err() {
            tracing::warn!(stream = %self.state.kind, "pump did not drain in time, aborting");
            self.task.abort();
            let _ = self.task.await;
        }
    }
}

/// Start a pump for `kind` writing through `out`.
pub fn spawn(
    kind: StreamKind,
    out: Arc<FrameWriter>,
    signals: PumpSignals,
    options: PumpOptions,
) -> (PumpWriter, PumpHandle) {
    let (tx, rx) = mpsc::channel(options.queue_depth.max(1));
    let state = Arc::new(PumpState {
        kind,
        got_eof: AtomicBool::new(false),
        tx: Mutex::new(Some(tx)),
        closed: watch::channel(false).0,
    });

    let task = tokio::spawn(run(Arc::clone(&state), rx, out, signals));
    let writer = PumpWriter {
        state: Arc::clone(&state),
        chunk_size: options.chunk_size.max(1),
    };
    (writer, PumpHandle { state, task })
}

async fn run(
    state: Arc<PumpState>,
    mut rx: mpsc::Receiver<Bytes>,
    out: Arc<FrameWriter>,
    signals: PumpSignals,
) {
    let kind = state.kind;
    loop {
        let Some(chunk) = rx.recv().await else {
            state.record_eof();
            tracing::debug!(stream = %kind, "output stream drained");
            let _ = signals.eof.send(kind);
            return;
        };

        if let Err(error) = out.write_frame(kind, &chunk).await {
            state.record_eof();
            tracing::debug!(stream = %kind, error = %error, "pump write failed");
            let _ = signals.errors.send(PumpFailure { kind, error });
            return;
        }
    }
}
