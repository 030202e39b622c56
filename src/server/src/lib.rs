//! podmux Server - Attach/Exec Streaming Daemon
//!
//! Serves interactive attach and exec sessions over a Docker compatible HTTP
//! API (hijacked connections) and an upgraded RPC socket, multiplexing each
//! session's stdio onto one duplex connection.

pub mod api;
pub mod error;
pub mod exec;
pub mod process;
pub mod pump;
pub mod rpc;
pub mod server;
pub mod session;
pub mod tracker;

pub use api::ApiState;
pub use process::ProcessRuntime;
pub use rpc::RpcServer;
pub use server::{ApiServer, Daemon};
pub use session::{
    AttachSession, SessionLimits, SessionReport, SessionRequest, SessionTarget, StreamSelection,
    Transport, WaitOutcome,
};
pub use tracker::{ConnId, ConnState, ConnectionTracker, HijackGuard};
