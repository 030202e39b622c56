//! podmux Core - Framing, Runtime Interfaces, and Shared Types
//!
//! This crate provides the wire codec and the types shared by the attach/exec
//! streaming server and its runtime backends.

pub mod config;
pub mod detach;
pub mod error;
pub mod event;
pub mod frame;
pub mod runtime;
pub mod terminal;

// Re-export commonly used types
pub use config::{ContainerSpec, LogFormat, LogLevel, ServerConfig};
pub use error::{MuxError, Result};
pub use event::{EventEmitter, MuxEvent};
pub use frame::{Frame, FrameCodec, FrameWriter, StreamKind, TagTable, COMPAT_TAGS, UPGRADED_TAGS};
pub use runtime::{
    AttachIo, Container, ContainerRuntime, ContainerStatus, ExecConfig, OutputSink,
    ResizeReceiver,
};
pub use terminal::TerminalSize;

/// podmux version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
