//! Error conversions for the HTTP and RPC surfaces.

use hyper::{Body, Response, StatusCode};
use thiserror::Error;

use podmux_core::MuxError;

/// Errors raised while handling an API request, before any hijack.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Mux(#[from] MuxError),

    /// Malformed query, body or headers.
    #[error("{0}")]
    BadRequest(String),

    /// No route matched.
    #[error("page not found")]
    RouteNotFound,
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Mux(e) => status_code(e),
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::RouteNotFound => StatusCode::NOT_FOUND,
        }
    }

    /// JSON error response in the Docker API shape.
    pub fn into_response(self) -> Response<Body> {
        let status = self.status_code();
        let body = serde_json::json!({ "message": self.to_string() });
        Response::builder()
            .status(status)
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap_or_else(|_| Response::new(Body::empty()))
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

/// HTTP status for a negotiation error.
pub fn status_code(err: &MuxError) -> StatusCode {
    match err {
        MuxError::ContainerNotFound(_) | MuxError::ExecSessionNotFound(_) => StatusCode::NOT_FOUND,
        MuxError::InvalidState { .. } => StatusCode::CONFLICT,
        MuxError::HijackUnsupported(_)
        | MuxError::InvalidDetachKeys(_)
        | MuxError::Serialization(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// RPC error name for a failed call.
pub fn rpc_error_name(err: &MuxError) -> &'static str {
    match err {
        MuxError::ContainerNotFound(_) => "io.podman.ContainerNotFound",
        MuxError::ExecSessionNotFound(_) => "io.podman.NoContainerRunning",
        MuxError::InvalidState { .. } => "io.podman.InvalidState",
        _ => "io.podman.ErrorOccurred",
    }
}

/// Exit code reported for an exec that failed before or while running.
///
/// 127 when the command cannot be found, 126 when it cannot be invoked,
/// 125 for everything else.
pub fn exec_exit_code(err: &MuxError) -> i32 {
    match err {
        MuxError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => 127,
        MuxError::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied => 126,
        MuxError::InvalidState { .. } => 126,
        _ => 125,
    }
}
