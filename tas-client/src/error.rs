//! Client error types.

use std::fmt;
use tas_protocol::ErrorCode;
use thiserror::Error;

/// Coarse result classification exposed to callers.
///
/// `None` denotes success; every other kind corresponds to one family of
/// [`ClientError`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    None,
    /// Link failure, timeout waiting for the server or malformed traffic.
    ServerConnection,
    /// Invalid arguments or a call made in the wrong state.
    Usage,
    TargetNotFound,
    /// Channel receive expired.
    Timeout,
    /// Fault reported by the device or its access path.
    Device,
}

impl ErrorKind {
    /// Classifies a result, mapping `Ok` to [`ErrorKind::None`].
    pub fn of<T>(result: &Result<T, ClientError>) -> Self {
        match result {
            Ok(_) => ErrorKind::None,
            Err(e) => e.kind(),
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::None => write!(f, "None"),
            ErrorKind::ServerConnection => write!(f, "ServerConnectionError"),
            ErrorKind::Usage => write!(f, "UsageError"),
            ErrorKind::TargetNotFound => write!(f, "TargetNotFoundError"),
            ErrorKind::Timeout => write!(f, "TimeoutError"),
            ErrorKind::Device => write!(f, "DeviceError"),
        }
    }
}

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] tas_protocol::ProtocolError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request timeout")]
    Timeout,

    #[error("server does not support protocol version {0}")]
    VersionMismatch(u16),

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("usage error: {0}")]
    Usage(String),

    #[error("target not found: {0}")]
    TargetNotFound(String),

    #[error("no message on channel {chl} within {timeout_ms} ms")]
    ReceiveTimeout { chl: u8, timeout_ms: u32 },

    #[error("device error {code} at {addr:#x}")]
    Device { code: ErrorCode, addr: u64 },

    #[error("server error: {code} - {message}")]
    ServerError {
        code: ErrorCode,
        message: String,
        retryable: bool,
    },
}

impl ClientError {
    pub(crate) fn usage(message: impl Into<String>) -> Self {
        ClientError::Usage(message.into())
    }

    /// Returns the caller-facing classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Io(_)
            | ClientError::Protocol(_)
            | ClientError::Json(_)
            | ClientError::NotConnected
            | ClientError::ConnectionClosed
            | ClientError::Timeout
            | ClientError::VersionMismatch(_)
            | ClientError::UnexpectedResponse(_) => ErrorKind::ServerConnection,
            ClientError::Usage(_) => ErrorKind::Usage,
            ClientError::TargetNotFound(_) => ErrorKind::TargetNotFound,
            ClientError::ReceiveTimeout { .. } => ErrorKind::Timeout,
            ClientError::Device { .. } => ErrorKind::Device,
            ClientError::ServerError { code, .. } => kind_of_code(*code),
        }
    }

    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::ReceiveTimeout { .. } => true,
            ClientError::ServerError { retryable, .. } => *retryable,
            ClientError::Device { code, .. } => code.is_retryable(),
            _ => false,
        }
    }

    /// Returns the wire error code carried by this error, if any.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ClientError::Device { code, .. } | ClientError::ServerError { code, .. } => Some(*code),
            _ => None,
        }
    }
}

fn kind_of_code(code: ErrorCode) -> ErrorKind {
    match code {
        ErrorCode::UnsupportedProtocol | ErrorCode::BadRequest | ErrorCode::InternalError => {
            ErrorKind::ServerConnection
        }
        ErrorCode::Usage
        | ErrorCode::InvalidParam
        | ErrorCode::NotSupported
        | ErrorCode::NoSession
        | ErrorCode::SessionMismatch
        | ErrorCode::ChannelSetup => ErrorKind::Usage,
        ErrorCode::TargetNotFound => ErrorKind::TargetNotFound,
        ErrorCode::ChannelTimeout => ErrorKind::Timeout,
        ErrorCode::DeviceAccess
        | ErrorCode::DeviceLocked
        | ErrorCode::AddrMap
        | ErrorCode::AddrBlocked
        | ErrorCode::BusError
        | ErrorCode::Consequential
        | ErrorCode::ChannelBusy => ErrorKind::Device,
    }
}
