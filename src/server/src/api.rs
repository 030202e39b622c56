//! HTTP compat API.
//!
//! Routes the handful of endpoints needed to start and steer streaming
//! sessions. Every endpoint accepts an optional `/v{version}` prefix and an
//! optional `/libpod` prefix. Attach and exec-start take the connection over
//! with a `101` response; everything that can fail is checked before that.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use hyper::header::{CONNECTION, CONTENT_TYPE, UPGRADE};
use hyper::http::response::Builder;
use hyper::{Body, Method, Request, Response, StatusCode};
use serde::Deserialize;
use tokio::sync::mpsc;

use podmux_core::{
    detach, AttachIo, ContainerRuntime, ContainerStatus, EventEmitter, ExecConfig, MuxError,
    TerminalSize,
};

use crate::error::ApiError;
use crate::exec::{ExecRegistry, ExecSession};
use crate::session::{
    AttachSession, SessionLimits, SessionRequest, SessionTarget, StreamSelection, Transport,
};
use crate::tracker::{ConnId, ConnectionTracker};

/// Content type of a terminal (unframed) session.
pub const RAW_STREAM: &str = "application/vnd.docker.raw-stream";
/// Content type of a multiplexed session.
pub const MULTIPLEXED_STREAM: &str = "application/vnd.docker.multiplexed-stream";

/// API version reported by `/_ping`.
pub const API_VERSION: &str = "1.40";

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Shared state of the HTTP API.
pub struct ApiState {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub tracker: Arc<ConnectionTracker>,
    pub execs: ExecRegistry,
    pub events: EventEmitter,
    pub limits: SessionLimits,
    pub default_detach_keys: String,
    /// Resize queues of live attach sessions, keyed by container id.
    resize_routes: DashMap<String, mpsc::Sender<TerminalSize>>,
}

impl ApiState {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        tracker: Arc<ConnectionTracker>,
        events: EventEmitter,
        limits: SessionLimits,
        default_detach_keys: impl Into<String>,
    ) -> Self {
        Self {
            runtime,
            tracker,
            execs: ExecRegistry::new(),
            events,
            limits,
            default_detach_keys: default_detach_keys.into(),
            resize_routes: DashMap::new(),
        }
    }
}

/// Decoded query string. Presence of a key is kept even for empty values.
#[derive(Debug, Default)]
pub struct Query(HashMap<String, String>);

impl Query {
    pub fn parse(raw: Option<&str>) -> Self {
        let mut params = HashMap::new();
        for pair in raw.unwrap_or_default().split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            params.insert(decode(key), decode(value));
        }
        Self(params)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Boolean parameter; absent keys are `false`.
    pub fn flag(&self, key: &str) -> bool {
        self.get(key).map(bool_value).unwrap_or(false)
    }

    fn dimension(&self, key: &str) -> ApiResult<u16> {
        let raw = self
            .get(key)
            .ok_or_else(|| ApiError::BadRequest(format!("missing query parameter {}", key)))?;
        raw.parse()
            .map_err(|_| ApiError::BadRequest(format!("invalid {} value: {}", key, raw)))
    }

    fn terminal_size(&self) -> ApiResult<TerminalSize> {
        Ok(TerminalSize::new(self.dimension("w")?, self.dimension("h")?))
    }
}

fn decode(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|s| s.into_owned())
        .unwrap_or(spaced)
}

fn bool_value(raw: &str) -> bool {
    !matches!(
        raw.to_ascii_lowercase().as_str(),
        "" | "0" | "no" | "false" | "none"
    )
}

/// Entry point for every request on connection `conn`.
pub async fn handle(state: Arc<ApiState>, conn: ConnId, req: Request<Body>) -> Response<Body> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    tracing::debug!(conn, %method, path = %path, "request");

    match route(state, conn, req).await {
        Ok(response) => response,
        Err(e) => {
            tracing::debug!(conn, %method, path = %path, error = %e, "request failed");
            e.into_response()
        }
    }
}

async fn route(state: Arc<ApiState>, conn: ConnId, req: Request<Body>) -> ApiResult<Response<Body>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let segments = strip_prefixes(&path);

    match (&method, segments.as_slice()) {
        (&Method::GET, ["_ping"]) | (&Method::HEAD, ["_ping"]) => Ok(ping()),
        (&Method::POST, ["containers", name, "attach"]) => {
            let name = name.to_string();
            attach(state, conn, req, &name).await
        }
        (&Method::POST, ["containers", name, "resize"]) => {
            let name = name.to_string();
            resize_container(&state, &req, &name)
        }
        (&Method::POST, ["containers", name, "exec"]) => {
            let name = name.to_string();
            exec_create(&state, req, &name).await
        }
        (&Method::POST, ["exec", id, "start"]) => {
            let id = id.to_string();
            exec_start(state, conn, req, &id).await
        }
        (&Method::POST, ["exec", id, "resize"]) => {
            let id = id.to_string();
            let size = Query::parse(req.uri().query()).terminal_size()?;
            state.execs.get(&id)?.resize(size)?;
            Ok(empty(StatusCode::OK))
        }
        (&Method::GET, ["exec", id, "json"]) => {
            let inspect = state.execs.get(id)?.inspect();
            json(StatusCode::OK, &serde_json::to_value(inspect)?)
        }
        _ => Err(ApiError::RouteNotFound),
    }
}

/// Split a path into segments, dropping `/v{version}` and `/libpod`.
fn strip_prefixes(path: &str) -> Vec<&str> {
    let mut segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if let Some(first) = segments.first() {
        let is_version = first
            .strip_prefix('v')
            .map(|v| !v.is_empty() && v.chars().all(|c| c.is_ascii_digit() || c == '.'))
            .unwrap_or(false);
        if is_version {
            segments.remove(0);
        }
    }
    if segments.first() == Some(&"libpod") {
        segments.remove(0);
    }
    segments
}

fn ping() -> Response<Body> {
    build(
        Response::builder()
            .status(StatusCode::OK)
            .header("API-Version", API_VERSION)
            .header(CONTENT_TYPE, "text/plain"),
        Body::from("OK"),
    )
}

/// Reject requests whose connection cannot be taken over.
fn require_upgrade(req: &Request<Body>) -> ApiResult<()> {
    let headers = req.headers();
    let connection = headers
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade")))
        .unwrap_or(false);
    let upgrade = headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().eq_ignore_ascii_case("tcp"))
        .unwrap_or(false);

    if connection && upgrade {
        Ok(())
    } else {
        Err(MuxError::HijackUnsupported(
            "request must carry Connection: Upgrade and Upgrade: tcp".to_string(),
        )
        .into())
    }
}

async fn attach(
    state: Arc<ApiState>,
    conn: ConnId,
    req: Request<Body>,
    name: &str,
) -> ApiResult<Response<Body>> {
    let query = Query::parse(req.uri().query());
    if !query.get("stream").map(bool_value).unwrap_or(true) {
        return Err(ApiError::BadRequest("only stream=true attach is supported".to_string()));
    }
    if query.flag("logs") {
        return Err(ApiError::BadRequest(
            "logs replay on attach is not supported".to_string(),
        ));
    }
    let request = SessionRequest {
        transport: Transport::Compat,
        target: SessionTarget::Attach,
        streams: StreamSelection {
            stdin: query.flag("stdin"),
            stdout: query.flag("stdout"),
            stderr: query.flag("stderr"),
        },
        detach_keys: query.get("detachKeys").map(str::to_string),
    };
    require_upgrade(&req)?;

    let session = AttachSession::negotiate(
        state.runtime.as_ref(),
        name,
        request,
        &state.default_detach_keys,
        state.limits,
        state.events.clone(),
    )?;

    let container_id = session.container_id().to_string();
    let resize = session.resize_handle();
    state.resize_routes.insert(container_id.clone(), resize.clone());

    let content_type = if session.is_raw() { RAW_STREAM } else { MULTIPLEXED_STREAM };
    hijack(&state, conn, req, session, move |state, _report| {
        state
            .resize_routes
            .remove_if(&container_id, |_, tx| tx.same_channel(&resize));
    });
    Ok(switching_protocols(content_type))
}

fn resize_container(state: &ApiState, req: &Request<Body>, name: &str) -> ApiResult<Response<Body>> {
    let size = Query::parse(req.uri().query()).terminal_size()?;
    let container = state.runtime.lookup(name)?;
    let tx = state
        .resize_routes
        .get(container.id())
        .map(|entry| entry.value().clone())
        .ok_or_else(|| MuxError::InvalidState {
            id: container.id().to_string(),
            state: container.state().to_string(),
            message: "no attach session to resize".to_string(),
        })?;
    if tx.try_send(size).is_err() {
        tracing::warn!(container = %container.id(), "resize queue unavailable, dropping event");
    }
    Ok(empty(StatusCode::OK))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct ExecCreateBody {
    cmd: Vec<String>,
    tty: bool,
    attach_stdin: bool,
    attach_stdout: bool,
    attach_stderr: bool,
    env: Vec<String>,
    user: Option<String>,
    working_dir: Option<String>,
    privileged: bool,
    detach_keys: Option<String>,
}

async fn exec_create(state: &ApiState, req: Request<Body>, name: &str) -> ApiResult<Response<Body>> {
    let body = read_body(req).await?;
    let body: ExecCreateBody = serde_json::from_slice(&body)?;
    if body.cmd.is_empty() {
        return Err(ApiError::BadRequest("exec requires a command".to_string()));
    }

    let container = state.runtime.lookup(name)?;
    let status = container.state();
    if status != ContainerStatus::Running {
        return Err(MuxError::InvalidState {
            id: container.id().to_string(),
            state: status.to_string(),
            message: "can only create exec sessions on running containers".to_string(),
        }
        .into());
    }
    if let Some(keys) = &body.detach_keys {
        detach::parse(keys)?;
    }

    let config = ExecConfig {
        cmd: body.cmd,
        tty: body.tty,
        env: body.env,
        user: body.user,
        working_dir: body.working_dir,
        privileged: body.privileged,
    };
    let streams = StreamSelection {
        stdin: body.attach_stdin,
        stdout: body.attach_stdout,
        stderr: body.attach_stderr,
    };
    let session = state
        .execs
        .create(container.id(), config, streams, body.detach_keys);
    json(StatusCode::CREATED, &serde_json::json!({ "Id": session.id }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct ExecStartBody {
    detach: bool,
    tty: bool,
}

async fn exec_start(
    state: Arc<ApiState>,
    conn: ConnId,
    mut req: Request<Body>,
    id: &str,
) -> ApiResult<Response<Body>> {
    let raw = hyper::body::to_bytes(req.body_mut())
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let body: ExecStartBody = if raw.is_empty() {
        ExecStartBody::default()
    } else {
        serde_json::from_slice(&raw)?
    };

    let exec = state.execs.get(id)?;
    if body.detach {
        return exec_detached(&state, exec).await;
    }
    require_upgrade(&req)?;

    let mut config = exec.config.clone();
    config.tty = config.tty || body.tty;
    let request = SessionRequest {
        transport: Transport::Compat,
        target: SessionTarget::Exec(config),
        streams: exec.streams,
        detach_keys: exec.detach_keys.clone(),
    };
    let session = AttachSession::negotiate(
        state.runtime.as_ref(),
        &exec.container,
        request,
        &state.default_detach_keys,
        state.limits,
        state.events.clone(),
    )?;
    exec.begin()?;
    exec.set_resize(session.resize_handle());

    let content_type = if session.is_raw() { RAW_STREAM } else { MULTIPLEXED_STREAM };
    hijack(&state, conn, req, session, move |_state, report| {
        exec.finish(report.and_then(|r| r.exit_code));
    });
    Ok(switching_protocols(content_type))
}

/// Start an exec session without attaching any stream.
async fn exec_detached(state: &ApiState, exec: Arc<ExecSession>) -> ApiResult<Response<Body>> {
    let container = state.runtime.lookup(&exec.container)?;
    if container.state() != ContainerStatus::Running {
        return Err(MuxError::InvalidState {
            id: container.id().to_string(),
            state: container.state().to_string(),
            message: "can only exec in running containers".to_string(),
        }
        .into());
    }
    exec.begin()?;

    let (resize_tx, resize_rx) = mpsc::channel(1);
    exec.set_resize(resize_tx);
    let detach_keys = exec.detach_keys.clone();
    tokio::spawn(async move {
        let result = container
            .exec(exec.config.clone(), AttachIo::default(), detach_keys, resize_rx)
            .await;
        let code = match result {
            Ok(code) => code,
            Err(e) => {
                tracing::warn!(exec_id = %exec.id, error = %e, "detached exec failed");
                crate::error::exec_exit_code(&e)
            }
        };
        exec.finish(Some(code));
    });
    Ok(empty(StatusCode::OK))
}

/// Mark the connection hijacked and run `session` on the upgraded stream in
/// the background. `finish` runs once the session is over, with its report
/// if it ever started.
fn hijack<F>(state: &Arc<ApiState>, conn: ConnId, mut req: Request<Body>, session: AttachSession, finish: F)
where
    F: FnOnce(&ApiState, Option<&crate::session::SessionReport>) + Send + 'static,
{
    // Recorded before the 101 goes out so the accept loop's close of this
    // connection is never counted.
    let guard = state.tracker.hijack(conn);
    let on_upgrade = hyper::upgrade::on(&mut req);
    let state = Arc::clone(state);

    tokio::spawn(async move {
        let _guard = guard;
        match on_upgrade.await {
            Ok(upgraded) => {
                let report = session.run(upgraded).await;
                finish(&*state, Some(&report));
            }
            Err(e) => {
                tracing::error!(conn, error = %e, "connection upgrade failed");
                finish(&*state, None);
            }
        }
    });
}

async fn read_body(req: Request<Body>) -> ApiResult<hyper::body::Bytes> {
    hyper::body::to_bytes(req.into_body())
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))
}

fn switching_protocols(content_type: &'static str) -> Response<Body> {
    build(
        Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(CONNECTION, "Upgrade")
            .header(UPGRADE, "tcp")
            .header(CONTENT_TYPE, content_type),
        Body::empty(),
    )
}

fn json(status: StatusCode, value: &serde_json::Value) -> ApiResult<Response<Body>> {
    Ok(build(
        Response::builder()
            .status(status)
            .header(CONTENT_TYPE, "application/json"),
        Body::from(value.to_string()),
    ))
}

fn empty(status: StatusCode) -> Response<Body> {
    build(Response::builder().status(status), Body::empty())
}

fn build(builder: Builder, body: Body) -> Response<Body> {
    builder.body(body).unwrap_or_else(|e| {
        tracing::error!(error = %e, "invalid response");
        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        response
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_prefixes() {
        assert_eq!(strip_prefixes("/_ping"), vec!["_ping"]);
        assert_eq!(
            strip_prefixes("/v1.40/containers/web/attach"),
            vec!["containers", "web", "attach"]
        );
        assert_eq!(
            strip_prefixes("/v4.0.0/libpod/exec/abc/start"),
            vec!["exec", "abc", "start"]
        );
        assert_eq!(strip_prefixes("/version"), vec!["version"]);
    }

    #[test]
    fn test_query_presence() {
        let query = Query::parse(Some("stdout=1&detachKeys="));
        assert!(query.flag("stdout"));
        assert!(!query.flag("stderr"));
        assert_eq!(query.get("detachKeys"), Some(""));
        assert_eq!(Query::parse(Some("stdout=1")).get("detachKeys"), None);
    }

    #[test]
    fn test_query_decoding() {
        let query = Query::parse(Some("detachKeys=ctrl-a%2Cctrl-b&stdin=true&logs=False"));
        assert_eq!(query.get("detachKeys"), Some("ctrl-a,ctrl-b"));
        assert!(query.flag("stdin"));
        assert!(!query.flag("logs"));
    }

    #[test]
    fn test_terminal_size_query() {
        let size = Query::parse(Some("h=24&w=80")).terminal_size().unwrap();
        assert_eq!(size, TerminalSize::new(80, 24));
        assert!(Query::parse(Some("h=24")).terminal_size().is_err());
        assert!(Query::parse(Some("h=x&w=1")).terminal_size().is_err());
    }

    #[test]
    fn test_require_upgrade() {
        let req = Request::post("/containers/web/attach")
            .header(CONNECTION, "Upgrade")
            .header(UPGRADE, "tcp")
            .body(Body::empty())
            .unwrap();
        assert!(require_upgrade(&req).is_ok());

        let req = Request::post("/containers/web/attach").body(Body::empty()).unwrap();
        let err = require_upgrade(&req).unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }
}
