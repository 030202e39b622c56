//! Scripted fake runtime shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};

use podmux_core::frame::{Frame, FrameCodec};
use podmux_core::{
    AttachIo, Container, ContainerRuntime, ContainerStatus, ExecConfig, MuxError, OutputSink,
    ResizeReceiver, Result,
};

/// Everything a runtime call receives.
pub struct Call {
    pub io: AttachIo,
    pub detach_keys: Option<String>,
    pub resize: ResizeReceiver,
    pub exec: Option<ExecConfig>,
}

pub type Script = Arc<dyn Fn(Call) -> BoxFuture<'static, Result<i32>> + Send + Sync>;

pub fn script<F, Fut>(f: F) -> Script
where
    F: Fn(Call) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<i32>> + Send + 'static,
{
    Arc::new(move |call| Box::pin(f(call)))
}

/// Writes `payload` to stdout, closes every output and exits with `code`.
pub fn print_stdout(payload: &'static [u8], code: i32) -> Script {
    script(move |call| async move {
        if let Some(stdout) = call.io.stdout.as_deref() {
            stdout.write(payload).await?;
        }
        close_outputs(&call.io).await;
        Ok(code)
    })
}

/// Close stdout and stderr. Only the sinks are held across awaits, so the
/// future stays `Send` even though `AttachIo` is not `Sync`.
pub fn close_outputs(io: &AttachIo) -> impl Future<Output = ()> + Send + '_ {
    let sinks: Vec<&dyn OutputSink> = [io.stdout.as_deref(), io.stderr.as_deref()]
        .into_iter()
        .flatten()
        .collect();
    async move {
        for sink in sinks {
            let _ = sink.close().await;
        }
    }
}

pub struct FakeContainer {
    id: String,
    state: ContainerStatus,
    terminal: bool,
    script: Script,
    detach_keys_seen: Mutex<Vec<Option<String>>>,
}

impl FakeContainer {
    pub fn new(id: &str, script: Script) -> Self {
        Self {
            id: id.to_string(),
            state: ContainerStatus::Running,
            terminal: false,
            script,
            detach_keys_seen: Mutex::new(Vec::new()),
        }
    }

    pub fn with_state(mut self, state: ContainerStatus) -> Self {
        self.state = state;
        self
    }

    pub fn with_terminal(mut self) -> Self {
        self.terminal = true;
        self
    }

    /// Detach keys passed to every call so far.
    pub fn detach_keys_seen(&self) -> Vec<Option<String>> {
        self.detach_keys_seen.lock().clone()
    }
}

#[async_trait]
impl Container for FakeContainer {
    fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> ContainerStatus {
        self.state
    }

    fn terminal(&self) -> bool {
        self.terminal
    }

    async fn attach(
        &self,
        io: AttachIo,
        detach_keys: Option<String>,
        resize: ResizeReceiver,
    ) -> Result<()> {
        self.detach_keys_seen.lock().push(detach_keys.clone());
        let call = Call {
            io,
            detach_keys,
            resize,
            exec: None,
        };
        (self.script)(call).await.map(|_| ())
    }

    async fn exec(
        &self,
        config: ExecConfig,
        io: AttachIo,
        detach_keys: Option<String>,
        resize: ResizeReceiver,
    ) -> Result<i32> {
        self.detach_keys_seen.lock().push(detach_keys.clone());
        let call = Call {
            io,
            detach_keys,
            resize,
            exec: Some(config),
        };
        (self.script)(call).await
    }
}

#[derive(Default)]
pub struct FakeRuntime {
    containers: Mutex<HashMap<String, Arc<FakeContainer>>>,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, container: FakeContainer) -> Arc<FakeContainer> {
        let container = Arc::new(container);
        self.containers
            .lock()
            .insert(container.id.clone(), Arc::clone(&container));
        container
    }
}

impl ContainerRuntime for FakeRuntime {
    fn lookup(&self, name_or_id: &str) -> Result<Arc<dyn Container>> {
        self.containers
            .lock()
            .get(name_or_id)
            .map(|c| Arc::clone(c) as Arc<dyn Container>)
            .ok_or_else(|| MuxError::ContainerNotFound(name_or_id.to_string()))
    }
}

/// Read the peer until EOF and decode every frame.
pub async fn read_frames<R>(reader: &mut R, codec: FrameCodec) -> Vec<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut frames = Vec::new();
    while let Some(frame) = codec.read_frame(reader).await.expect("valid frame stream") {
        frames.push(frame);
    }
    frames
}

/// Read the peer until EOF.
pub async fn read_to_end<R>(reader: &mut R) -> Vec<u8>
where
    R: AsyncRead + Unpin,
{
    let mut raw = Vec::new();
    reader.read_to_end(&mut raw).await.expect("read");
    raw
}
