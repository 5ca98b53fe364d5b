//! Server error types.

use tas_protocol::ErrorCode;
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] tas_protocol::ProtocolError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("handshake required")]
    NotReady,

    #[error("unsupported protocol version: {0}")]
    UnsupportedProtocol(u16),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("{0}")]
    Usage(String),

    #[error("no session bound")]
    NoSession,

    #[error("session mismatch: {0}")]
    SessionMismatch(String),

    #[error("target not found: {0}")]
    TargetNotFound(String),

    #[error("channel setup refused: {0}")]
    ChannelSetup(String),

    #[error("channel {0} receive queue full")]
    ChannelBusy(u8),

    #[error("no message on channel {0}")]
    ChannelTimeout(u8),

    #[error("server shutting down")]
    ShuttingDown,
}

impl ServerError {
    /// Converts to protocol error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ServerError::Io(_) => ErrorCode::InternalError,
            ServerError::Protocol(_) => ErrorCode::BadRequest,
            ServerError::Json(_) => ErrorCode::BadRequest,
            ServerError::NotReady => ErrorCode::BadRequest,
            ServerError::UnsupportedProtocol(_) => ErrorCode::UnsupportedProtocol,
            ServerError::InvalidRequest(_) => ErrorCode::BadRequest,
            ServerError::InvalidParam(_) => ErrorCode::InvalidParam,
            ServerError::Usage(_) => ErrorCode::Usage,
            ServerError::NoSession => ErrorCode::NoSession,
            ServerError::SessionMismatch(_) => ErrorCode::SessionMismatch,
            ServerError::TargetNotFound(_) => ErrorCode::TargetNotFound,
            ServerError::ChannelSetup(_) => ErrorCode::ChannelSetup,
            ServerError::ChannelBusy(_) => ErrorCode::ChannelBusy,
            ServerError::ChannelTimeout(_) => ErrorCode::ChannelTimeout,
            ServerError::ShuttingDown => ErrorCode::InternalError,
        }
    }

    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.error_code().is_retryable()
    }
}
