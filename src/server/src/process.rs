//! Process-backed reference runtime.
//!
//! Each configured container is a command line. Attaching runs the command,
//! exec runs the requested one; both stream the process's stdio through the
//! session. Processes are started per call and killed if the session drops
//! them.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::oneshot;

use podmux_core::detach::{self, copy_detachable};
use podmux_core::{
    AttachIo, Container, ContainerRuntime, ContainerSpec, ContainerStatus, ExecConfig, MuxError,
    OutputSink, ResizeReceiver, Result, ServerConfig,
};

/// Runtime serving the containers declared in the server configuration.
pub struct ProcessRuntime {
    containers: HashMap<String, Arc<ProcessContainer>>,
}

impl ProcessRuntime {
    pub fn new(specs: Vec<ContainerSpec>, default_detach_keys: &str) -> Self {
        let containers = specs
            .into_iter()
            .map(|spec| {
                let container = ProcessContainer {
                    spec,
                    default_detach_keys: default_detach_keys.to_string(),
                };
                (container.spec.name.clone(), Arc::new(container))
            })
            .collect();
        Self { containers }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(config.containers.clone(), &config.detach_keys)
    }

    pub fn len(&self) -> usize {
        self.containers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }
}

impl ContainerRuntime for ProcessRuntime {
    fn lookup(&self, name_or_id: &str) -> Result<Arc<dyn Container>> {
        self.containers
            .get(name_or_id)
            .map(|c| Arc::clone(c) as Arc<dyn Container>)
            .ok_or_else(|| MuxError::ContainerNotFound(name_or_id.to_string()))
    }
}

/// A container backed by a host command.
pub struct ProcessContainer {
    spec: ContainerSpec,
    default_detach_keys: String,
}

#[async_trait]
impl Container for ProcessContainer {
    fn id(&self) -> &str {
        &self.spec.name
    }

    fn state(&self) -> ContainerStatus {
        self.spec.state
    }

    fn terminal(&self) -> bool {
        self.spec.tty
    }

    async fn attach(
        &self,
        io: AttachIo,
        detach_keys: Option<String>,
        resize: ResizeReceiver,
    ) -> Result<()> {
        let keys = detach::resolve(detach_keys.as_deref(), &self.default_detach_keys)?;
        let launch = Launch {
            command: &self.spec.command,
            env: self.spec.env.clone(),
            working_dir: None,
        };
        let code = run_process(self.id(), launch, io, keys, resize).await?;
        tracing::debug!(container = %self.id(), exit_code = code, "attached process exited");
        Ok(())
    }

    async fn exec(
        &self,
        config: ExecConfig,
        io: AttachIo,
        detach_keys: Option<String>,
        resize: ResizeReceiver,
    ) -> Result<i32> {
        let keys = detach::resolve(detach_keys.as_deref(), &self.default_detach_keys)?;
        let mut env = self.spec.env.clone();
        env.extend(config.env.iter().cloned());
        if config.user.is_some() || config.privileged {
            tracing::debug!(container = %self.id(), "user and privileged settings are ignored by the process runtime");
        }
        let launch = Launch {
            command: &config.cmd,
            env,
            working_dir: config.working_dir.as_deref(),
        };
        run_process(self.id(), launch, io, keys, resize).await
    }
}

struct Launch<'a> {
    command: &'a [String],
    env: Vec<String>,
    working_dir: Option<&'a str>,
}

fn piped_if(requested: bool) -> Stdio {
    if requested {
        Stdio::piped()
    } else {
        Stdio::null()
    }
}

async fn run_process(
    id: &str,
    launch: Launch<'_>,
    io: AttachIo,
    keys: Vec<u8>,
    mut resize: ResizeReceiver,
) -> Result<i32> {
    let (program, args) = launch
        .command
        .split_first()
        .ok_or_else(|| MuxError::Runtime(format!("container {} has no command", id)))?;

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(piped_if(io.stdin.is_some()))
        .stdout(piped_if(io.stdout.is_some()))
        .stderr(piped_if(io.stderr.is_some()))
        .kill_on_drop(true);
    for pair in &launch.env {
        if let Some((key, value)) = pair.split_once('=') {
            command.env(key, value);
        }
    }
    if let Some(dir) = launch.working_dir {
        command.current_dir(dir);
    }

    let mut child = command.spawn()?;
    tracing::debug!(container = %id, program = %program, pid = ?child.id(), "process started");

    // Client input, stopped early by the detach sequence.
    let (detach_tx, mut detach_rx) = oneshot::channel::<()>();
    let stdin_task = match (io.stdin, child.stdin.take()) {
        (Some(mut input), Some(mut pipe)) => Some(tokio::spawn(async move {
            match copy_detachable(&mut input, &mut pipe, keys).await {
                Err(MuxError::Detached) => {
                    let _ = detach_tx.send(());
                }
                Err(e) => tracing::debug!(error = %e, "stdin copy ended"),
                Ok(_) => {}
            }
        })),
        _ => None,
    };

    // No pseudo-terminal to resize; drain so senders never block.
    let resize_task = tokio::spawn(async move {
        while let Some(size) = resize.recv().await {
            tracing::debug!(width = size.width, height = size.height, "resize ignored");
        }
    });

    let stdout_sink = io.stdout;
    let stderr_sink = io.stderr;
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let run = async {
        let (out, err) = tokio::join!(
            forward(stdout, stdout_sink.as_deref()),
            forward(stderr, stderr_sink.as_deref()),
        );
        // Both streams close together once the process output is drained.
        for sink in [stdout_sink.as_deref(), stderr_sink.as_deref()].into_iter().flatten() {
            let _ = sink.close().await;
        }
        out?;
        err?;
        let status = child.wait().await?;
        Ok::<i32, MuxError>(exit_code(status))
    };

    let result = tokio::select! {
        biased;
        Ok(()) = &mut detach_rx => Err(MuxError::Detached),
        result = run => result,
    };

    if let Some(task) = stdin_task {
        task.abort();
    }
    resize_task.abort();
    result
}

async fn forward<R>(source: Option<R>, sink: Option<&dyn OutputSink>) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let (Some(mut source), Some(sink)) = (source, sink) else {
        return Ok(());
    };
    let mut buf = vec![0u8; 32 * 1024];
    loop {
        let n = source.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        sink.write(&buf[..n]).await?;
    }
}

#[cfg(unix)]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(125)
}

#[cfg(not(unix))]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(125)
}
