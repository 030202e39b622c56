use thiserror::Error;

/// podmux error types
#[derive(Error, Debug)]
pub enum MuxError {
    /// No container matches the requested name or ID
    #[error("no such container: {0}")]
    ContainerNotFound(String),

    /// Container exists but is not in a state that allows the operation
    #[error("container {id} is {state}: {message}")]
    InvalidState {
        id: String,
        state: String,
        message: String,
    },

    /// No exec session matches the requested ID
    #[error("no such exec session: {0}")]
    ExecSessionNotFound(String),

    /// The client connection cannot be taken over for raw streaming
    #[error("connection cannot be hijacked: {0}")]
    HijackUnsupported(String),

    /// Write attempted on a stream that has already recorded EOF
    #[error("stream is closed")]
    StreamClosed,

    /// Close attempted on a stream that was already closed
    #[error("stream {0} is already closed")]
    AlreadyClosed(String),

    /// Malformed multiplexed stream
    #[error("framing error: {0}")]
    Framing(String),

    /// Detach key specification could not be parsed
    #[error("invalid detach keys: {0}")]
    InvalidDetachKeys(String),

    /// The client typed the detach sequence
    #[error("detached from container")]
    Detached,

    /// Failure reported by the container runtime
    #[error("runtime error: {0}")]
    Runtime(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl MuxError {
    /// Whether this error means the peer went away rather than a server fault.
    pub fn is_disconnect(&self) -> bool {
        match self {
            MuxError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for MuxError {
    fn from(err: serde_json::Error) -> Self {
        MuxError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for MuxError {
    fn from(err: serde_yaml::Error) -> Self {
        MuxError::Serialization(err.to_string())
    }
}

/// Result type alias for podmux operations
pub type Result<T> = std::result::Result<T, MuxError>;
