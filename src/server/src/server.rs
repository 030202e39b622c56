//! Unix socket servers and daemon wiring.
//!
//! The HTTP server drives hyper connections by hand so every connection's
//! lifecycle can be reported to the [`ConnectionTracker`].

use std::convert::Infallible;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hyper::server::conn::Http;
use hyper::service::service_fn;
use tokio::net::{UnixListener, UnixStream};

use podmux_core::{ContainerRuntime, EventEmitter, Result, ServerConfig};

use crate::api::{self, ApiState};
use crate::rpc::RpcServer;
use crate::session::SessionLimits;
use crate::tracker::{ConnId, ConnState, ConnectionTracker};

/// Bind a Unix listener, replacing a stale socket file.
pub fn bind_unix(path: &Path) -> Result<UnixListener> {
    // Remove existing socket file if present
    if path.exists() {
        std::fs::remove_file(path)?;
    }

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    Ok(UnixListener::bind(path)?)
}

/// HTTP compat API server.
pub struct ApiServer {
    socket_path: PathBuf,
    state: Arc<ApiState>,
}

impl ApiServer {
    pub fn new(socket_path: PathBuf, state: Arc<ApiState>) -> Self {
        Self { socket_path, state }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accept connections until `shutdown` resolves.
    pub async fn serve<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let listener = bind_unix(&self.socket_path)?;
        tracing::info!(socket = %self.socket_path.display(), "API server listening");
        self.serve_listener(listener, shutdown).await
    }

    /// Accept connections from an already bound listener.
    pub async fn serve_listener<F>(&self, listener: UnixListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!(socket = %self.socket_path.display(), "API server stopping");
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
                    let conn = self.state.tracker.next_conn_id();
                    self.state.tracker.on_state(conn, ConnState::New);
                    tokio::spawn(serve_connection(Arc::clone(&self.state), conn, stream));
                }
            }
        }
    }
}

async fn serve_connection(state: Arc<ApiState>, conn: ConnId, stream: UnixStream) {
    let tracker = Arc::clone(&state.tracker);
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        async move {
            state.tracker.on_state(conn, ConnState::Active);
            let response = api::handle(Arc::clone(&state), conn, req).await;
            state.tracker.on_state(conn, ConnState::Idle);
            Ok::<_, Infallible>(response)
        }
    });

    if let Err(e) = Http::new()
        .http1_only(true)
        .serve_connection(stream, service)
        .with_upgrades()
        .await
    {
        tracing::debug!(conn, error = %e, "connection closed with error");
    }
    tracker.on_state(conn, ConnState::Closed);
}

/// The streaming daemon: HTTP API, optional RPC socket and idle shutdown.
pub struct Daemon {
    config: ServerConfig,
    runtime: Arc<dyn ContainerRuntime>,
    events: EventEmitter,
}

impl Daemon {
    pub fn new(config: ServerConfig, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            config,
            runtime,
            events: EventEmitter::default(),
        }
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    /// Serve until the idle timer fires or `shutdown` resolves.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let tracker = ConnectionTracker::new(self.config.idle_timeout(), self.events.clone());
        let limits = SessionLimits::from_config(&self.config);

        let state = Arc::new(ApiState::new(
            Arc::clone(&self.runtime),
            Arc::clone(&tracker),
            self.events.clone(),
            limits,
            self.config.detach_keys.clone(),
        ));
        let api = ApiServer::new(self.config.api_socket.clone(), state);

        let rpc = self.config.rpc_socket.clone().map(|path| {
            RpcServer::new(
                path,
                Arc::clone(&self.runtime),
                Arc::clone(&tracker),
                self.events.clone(),
                limits,
                self.config.detach_keys.clone(),
            )
        });

        let idle = async {
            if self.config.idle_timeout().is_some() {
                tracker.wait_idle().await;
            } else {
                futures::future::pending::<()>().await;
            }
        };
        let stop = async {
            tokio::select! {
                _ = idle => tracing::info!("idle timeout reached, shutting down"),
                _ = shutdown => tracing::info!("shutdown requested"),
            }
        };
        tokio::pin!(stop);

        let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
        let wait_stop = |mut rx: tokio::sync::watch::Receiver<bool>| async move {
            let _ = rx.wait_for(|stopped| *stopped).await;
        };

        let api_task = api.serve(wait_stop(stop_rx.clone()));
        let rpc_task = async {
            match &rpc {
                Some(rpc) => rpc.serve(wait_stop(stop_rx.clone())).await,
                None => Ok(()),
            }
        };
        let servers = async { tokio::try_join!(api_task, rpc_task) };
        tokio::pin!(servers);

        tokio::select! {
            result = &mut servers => {
                result?;
            }
            _ = &mut stop => {
                let _ = stop_tx.send(true);
                servers.await?;
            }
        }

        for path in std::iter::once(&self.config.api_socket).chain(self.config.rpc_socket.iter()) {
            if let Err(e) = std::fs::remove_file(path) {
                tracing::debug!(socket = %path.display(), error = %e, "could not remove socket");
            }
        }
        Ok(())
    }
}
