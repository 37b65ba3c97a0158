use thiserror::Error;

/// All errors produced by voxbridge-core.
#[derive(Debug, Error)]
pub enum VoxError {
    /// Bad descriptor, port, path or tuning value. Raised before any I/O starts.
    #[error("configuration error: {0}")]
    Config(String),

    /// The reference clip is missing, unreadable or too short.
    #[error("reference error: {0}")]
    Reference(String),

    /// The external model failed. Recoverable during streaming.
    #[error("model error: {0}")]
    Model(String),

    /// Decode/encode/socket/device fault. Recoverable per endpoint.
    #[error("transport error: {0}")]
    Transport(String),

    /// A graceful-shutdown deadline elapsed.
    #[error("timed out after {after_ms} ms waiting for {what}")]
    Timeout { what: String, after_ms: u64 },

    #[error("operation `{op}` not allowed in session state {state}")]
    InvalidState { op: &'static str, state: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VoxError {
    /// Short machine-readable name, used in error payloads and stats.
    pub fn kind(&self) -> &'static str {
        match self {
            VoxError::Config(_) => "config_error",
            VoxError::Reference(_) => "reference_error",
            VoxError::Model(_) => "model_error",
            VoxError::Transport(_) => "transport_error",
            VoxError::Timeout { .. } => "timeout_error",
            VoxError::InvalidState { .. } => "invalid_state",
            VoxError::Io(_) => "io_error",
            VoxError::Other(_) => "internal_error",
        }
    }
}

impl From<hound::Error> for VoxError {
    fn from(err: hound::Error) -> Self {
        match err {
            hound::Error::IoError(e) => VoxError::Io(e),
            other => VoxError::Transport(format!("wav: {other}")),
        }
    }
}

pub type Result<T> = std::result::Result<T, VoxError>;
