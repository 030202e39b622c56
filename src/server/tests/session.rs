//! Session orchestration over in-memory connections.

mod common;

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use podmux_core::event::{events, EventEmitter};
use podmux_core::frame::{decode_exit_code, FrameCodec, StreamKind};
use podmux_core::{ContainerStatus, ExecConfig, MuxError, TerminalSize};
use podmux_server::{
    AttachSession, SessionLimits, SessionRequest, SessionTarget, StreamSelection, Transport,
    WaitOutcome,
};

use common::{close_outputs, print_stdout, script, FakeContainer, FakeRuntime};

fn limits() -> SessionLimits {
    SessionLimits {
        drain_timeout: Duration::from_millis(100),
        ..Default::default()
    }
}

fn request(transport: Transport, streams: StreamSelection) -> SessionRequest {
    SessionRequest {
        transport,
        target: SessionTarget::Attach,
        streams,
        detach_keys: None,
    }
}

fn stdout_only() -> StreamSelection {
    StreamSelection {
        stdin: false,
        stdout: true,
        stderr: false,
    }
}

fn negotiate(runtime: &FakeRuntime, request: SessionRequest) -> AttachSession {
    AttachSession::negotiate(
        runtime,
        "web",
        request,
        "ctrl-p,ctrl-q",
        limits(),
        EventEmitter::default(),
    )
    .expect("negotiation succeeds")
}

#[tokio::test]
async fn test_stdout_only_hello_is_one_frame() {
    let runtime = FakeRuntime::new();
    runtime.add(FakeContainer::new(
        "web",
        script(|call| async move {
            assert!(call.io.stderr.is_none());
            assert!(call.io.stdin.is_none());
            let stdout = call.io.stdout.as_deref().expect("stdout requested");
            stdout.write(b"hello").await?;
            stdout.close().await?;
            Ok(0)
        }),
    ));

    let session = negotiate(&runtime, request(Transport::Compat, stdout_only()));
    let (mut client, server) = tokio::io::duplex(64 * 1024);
    let report = session.run(server).await;
    assert!(!report.is_failure());

    let raw = common::read_to_end(&mut client).await;
    assert_eq!(raw, b"\x01\x00\x00\x00\x00\x00\x00\x05hello");
}

#[tokio::test]
async fn test_empty_detach_keys_reach_runtime() {
    let runtime = FakeRuntime::new();
    let container = runtime.add(FakeContainer::new("web", print_stdout(b"", 0)));

    let mut req = request(Transport::Compat, stdout_only());
    req.detach_keys = Some(String::new());
    let (_client, server) = tokio::io::duplex(1024);
    negotiate(&runtime, req).run(server).await;

    let (_client, server) = tokio::io::duplex(1024);
    negotiate(&runtime, request(Transport::Compat, stdout_only()))
        .run(server)
        .await;

    assert_eq!(container.detach_keys_seen(), vec![Some(String::new()), None]);
}

#[tokio::test]
async fn test_resize_arrives_before_later_stdin() {
    let runtime = FakeRuntime::new();
    runtime.add(FakeContainer::new(
        "web",
        script(|mut call| async move {
            let mut stdin = call.io.stdin.take().expect("stdin requested");
            let mut byte = [0u8; 1];
            stdin.read_exact(&mut byte).await?;
            assert_eq!(&byte, b"x");

            let first = call.resize.try_recv().expect("first resize queued");
            let second = call.resize.try_recv().expect("second resize queued");
            assert_eq!(first, TerminalSize::new(1, 1));
            assert_eq!(second, TerminalSize::new(80, 24));

            close_outputs(&call.io).await;
            Ok(0)
        }),
    ));

    let session = negotiate(&runtime, request(Transport::Upgraded, StreamSelection::all()));
    let (mut client, server) = tokio::io::duplex(64 * 1024);
    let codec = FrameCodec::upgraded();
    for (kind, payload) in [
        (StreamKind::Resize, TerminalSize::new(1, 1).to_json().unwrap()),
        (StreamKind::Resize, br#"{"Width":80,"Height":24}"#.to_vec()),
        (StreamKind::Stdin, b"x".to_vec()),
    ] {
        client
            .write_all(&codec.encode(kind, &payload).unwrap())
            .await
            .unwrap();
    }

    let report = session.run(server).await;
    assert!(!report.is_failure(), "unexpected outcome {:?}", report.outcome);

    let frames = common::read_frames(&mut client, codec).await;
    let last = frames.last().expect("quit frame");
    assert_eq!(last.kind, StreamKind::Quit);
    assert_eq!(decode_exit_code(&last.payload).unwrap(), 0);
}

#[tokio::test]
async fn test_upgraded_exec_reports_exit_code() {
    let runtime = FakeRuntime::new();
    runtime.add(FakeContainer::new(
        "web",
        script(|call| async move {
            assert_eq!(call.exec.as_ref().unwrap().cmd, vec!["false".to_string()]);
            if let Some(stderr) = call.io.stderr.as_deref() {
                stderr.write(b"warn").await?;
            }
            close_outputs(&call.io).await;
            Ok(42)
        }),
    ));

    let req = SessionRequest {
        transport: Transport::Upgraded,
        target: SessionTarget::Exec(ExecConfig {
            cmd: vec!["false".to_string()],
            ..Default::default()
        }),
        streams: StreamSelection::all(),
        detach_keys: None,
    };
    let session = negotiate(&runtime, req);
    let (mut client, server) = tokio::io::duplex(64 * 1024);
    client.shutdown().await.unwrap();

    let report = session.run(server).await;
    assert_eq!(report.exit_code, Some(42));

    let frames = common::read_frames(&mut client, FrameCodec::upgraded()).await;
    let kinds: Vec<StreamKind> = frames.iter().map(|f| f.kind).collect();
    assert_eq!(kinds, vec![StreamKind::Stderr, StreamKind::Quit]);
    assert_eq!(&frames[0].payload[..], b"warn");
    assert_eq!(decode_exit_code(&frames[1].payload).unwrap(), 42);
}

#[tokio::test]
async fn test_exec_launch_failure_maps_exit_code() {
    let runtime = FakeRuntime::new();
    runtime.add(FakeContainer::new(
        "web",
        script(|_call| async move {
            Err(MuxError::Io(std::io::Error::from(std::io::ErrorKind::NotFound)))
        }),
    ));

    let req = SessionRequest {
        transport: Transport::Upgraded,
        target: SessionTarget::Exec(ExecConfig {
            cmd: vec!["missing".to_string()],
            ..Default::default()
        }),
        streams: StreamSelection::all(),
        detach_keys: None,
    };
    let session = negotiate(&runtime, req);
    let (mut client, server) = tokio::io::duplex(64 * 1024);
    client.shutdown().await.unwrap();

    let report = session.run(server).await;
    assert!(report.is_failure());
    assert_eq!(report.exit_code, Some(127));

    let frames = common::read_frames(&mut client, FrameCodec::upgraded()).await;
    let quit = frames.last().expect("quit frame");
    assert_eq!(quit.kind, StreamKind::Quit);
    assert_eq!(decode_exit_code(&quit.payload).unwrap(), 127);
}

#[tokio::test]
async fn test_runtime_failure_written_as_plain_bytes() {
    let runtime = FakeRuntime::new();
    runtime.add(FakeContainer::new(
        "web",
        script(|_call| async move { Err(MuxError::Runtime("boom".to_string())) }),
    ));

    let session = negotiate(&runtime, request(Transport::Compat, StreamSelection::all()));
    let (mut client, server) = tokio::io::duplex(64 * 1024);
    let report = session.run(server).await;
    assert!(matches!(report.outcome, WaitOutcome::Failed(MuxError::Runtime(_))));

    let raw = common::read_to_end(&mut client).await;
    assert_eq!(raw, b"runtime error: boom\n");
}

#[tokio::test]
async fn test_framing_error_tears_down_session() {
    let runtime = FakeRuntime::new();
    runtime.add(FakeContainer::new(
        "web",
        script(|_call| async move {
            futures::future::pending::<()>().await;
            Ok(0)
        }),
    ));

    let session = negotiate(&runtime, request(Transport::Upgraded, StreamSelection::all()));
    let (mut client, server) = tokio::io::duplex(64 * 1024);
    client.write_all(&[1, 0, 0]).await.unwrap();
    client.shutdown().await.unwrap();

    let report = session.run(server).await;
    assert!(matches!(report.outcome, WaitOutcome::Failed(MuxError::Framing(_))));

    let frames = common::read_frames(&mut client, FrameCodec::upgraded()).await;
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].kind, StreamKind::Stderr);
    assert!(String::from_utf8_lossy(&frames[0].payload).contains("framing error"));
    assert_eq!(frames[1].kind, StreamKind::Quit);
    assert_eq!(decode_exit_code(&frames[1].payload).unwrap(), 125);
}

#[tokio::test]
async fn test_first_eof_ends_session() {
    let runtime = FakeRuntime::new();
    runtime.add(FakeContainer::new(
        "web",
        script(|call| async move {
            let stdout = call.io.stdout.as_deref().expect("stdout");
            stdout.write(b"x").await?;
            stdout.close().await?;
            // The container keeps running after its stdout closes.
            futures::future::pending::<()>().await;
            Ok(0)
        }),
    ));

    let session = negotiate(&runtime, request(Transport::Compat, StreamSelection::all()));
    let (mut client, server) = tokio::io::duplex(64 * 1024);
    let report = tokio::time::timeout(Duration::from_secs(5), session.run(server))
        .await
        .expect("session ends without the runtime returning");
    assert!(matches!(report.outcome, WaitOutcome::Eof(StreamKind::Stdout)));
    assert_eq!(report.exit_code, None);

    let frames = common::read_frames(&mut client, FrameCodec::compat()).await;
    assert_eq!(frames.len(), 1);
    assert_eq!(&frames[0].payload[..], b"x");
}

#[tokio::test]
async fn test_terminal_compat_session_is_raw() {
    let runtime = FakeRuntime::new();
    runtime.add(
        FakeContainer::new(
            "web",
            script(|call| async move {
                assert!(call.io.stderr.is_none(), "terminal merges stderr");
                let stdout = call.io.stdout.as_deref().expect("stdout");
                stdout.write(b"$ ").await?;
                stdout.close().await?;
                Ok(0)
            }),
        )
        .with_terminal(),
    );

    let session = negotiate(&runtime, request(Transport::Compat, StreamSelection::all()));
    assert!(session.is_raw());
    let (mut client, server) = tokio::io::duplex(1024);
    session.run(server).await;

    assert_eq!(common::read_to_end(&mut client).await, b"$ ");
}

#[tokio::test]
async fn test_detach_emits_event() {
    let runtime = FakeRuntime::new();
    runtime.add(FakeContainer::new(
        "web",
        script(|_call| async move { Err(MuxError::Detached) }),
    ));

    let emitter = EventEmitter::default();
    let mut rx = emitter.subscribe();
    let session = AttachSession::negotiate(
        runtime.as_ref(),
        "web",
        request(Transport::Compat, StreamSelection::all()),
        "ctrl-p,ctrl-q",
        limits(),
        emitter,
    )
    .unwrap();
    let (mut client, server) = tokio::io::duplex(1024);
    let report = session.run(server).await;
    assert!(matches!(report.outcome, WaitOutcome::Detached));
    assert!(common::read_to_end(&mut client).await.is_empty());

    assert_eq!(rx.recv().await.unwrap().key, events::SESSION_ATTACHED);
    let ended = rx.recv().await.unwrap();
    assert_eq!(ended.key, events::SESSION_DETACHED);
    assert_eq!(ended.attribute("container"), Some("web"));
}

#[tokio::test]
async fn test_negotiation_errors() {
    let runtime = FakeRuntime::new();
    runtime.add(FakeContainer::new("web", print_stdout(b"", 0)));
    runtime.add(FakeContainer::new("old", print_stdout(b"", 0)).with_state(ContainerStatus::Exited));
    runtime.add(FakeContainer::new("new", print_stdout(b"", 0)).with_state(ContainerStatus::Created));

    let attempt = |name: &str, req: SessionRequest| {
        AttachSession::negotiate(
            runtime.as_ref(),
            name,
            req,
            "ctrl-p,ctrl-q",
            limits(),
            EventEmitter::default(),
        )
        .err()
    };

    let missing = attempt("nope", request(Transport::Compat, stdout_only()));
    assert!(matches!(missing, Some(MuxError::ContainerNotFound(_))));

    let exited = attempt("old", request(Transport::Compat, stdout_only()));
    assert!(matches!(exited, Some(MuxError::InvalidState { .. })));

    assert!(attempt("new", request(Transport::Compat, stdout_only())).is_none());

    let exec = SessionRequest {
        transport: Transport::Compat,
        target: SessionTarget::Exec(ExecConfig {
            cmd: vec!["sh".to_string()],
            ..Default::default()
        }),
        streams: stdout_only(),
        detach_keys: None,
    };
    assert!(matches!(
        attempt("new", exec),
        Some(MuxError::InvalidState { .. })
    ));

    let mut bad_keys = request(Transport::Compat, stdout_only());
    bad_keys.detach_keys = Some("ctrl-1".to_string());
    assert!(matches!(
        attempt("web", bad_keys),
        Some(MuxError::InvalidDetachKeys(_))
    ));
}
