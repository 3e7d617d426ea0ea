#[derive(Debug, thiserror::Error)]
pub enum GuestError {
    #[error("Guest connection timeout after {timeout_ms}ms")]
    ConnectTimeout { timeout_ms: u64 },

    #[error("request timed out after {timeout_ms}ms")]
    RequestTimeout { timeout_ms: u64 },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("command failed with exit code {exit_code}: {command}\n{stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("read failed: {path}: {detail}")]
    ReadFailed { path: String, detail: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GuestError>;
