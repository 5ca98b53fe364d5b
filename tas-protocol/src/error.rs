//! Protocol error types and error codes.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Protocol-level errors that can occur during framing or message handling.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid magic bytes: expected 'TASP', got {0:?}")]
    InvalidMagic([u8; 4]),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u16),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: u32 },

    #[error("CRC mismatch: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("invalid frame flags: {0:#x}")]
    InvalidFlags(u16),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid UTF-8 in payload")]
    InvalidUtf8,
}

/// Stable error codes returned in error responses and per-item results.
///
/// These codes are part of the protocol contract and must remain stable
/// across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Protocol errors
    UnsupportedProtocol,
    BadRequest,

    // Caller errors
    Usage,
    InvalidParam,
    NotSupported,
    NoSession,
    SessionMismatch,
    TargetNotFound,

    // Device access errors
    DeviceAccess,
    DeviceLocked,
    AddrMap,
    AddrBlocked,
    BusError,
    Consequential,

    // Channel errors
    ChannelSetup,
    ChannelBusy,
    ChannelTimeout,

    // System errors
    InternalError,
}

impl ErrorCode {
    /// Returns whether this error is potentially retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::DeviceAccess | ErrorCode::ChannelBusy | ErrorCode::ChannelTimeout
        )
    }

    /// Returns whether this code reports a fault of the device or its
    /// access path rather than a malformed request.
    pub fn is_device_fault(&self) -> bool {
        matches!(
            self,
            ErrorCode::DeviceAccess
                | ErrorCode::DeviceLocked
                | ErrorCode::AddrMap
                | ErrorCode::AddrBlocked
                | ErrorCode::BusError
                | ErrorCode::Consequential
                | ErrorCode::ChannelBusy
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::UnsupportedProtocol => write!(f, "UNSUPPORTED_PROTOCOL"),
            ErrorCode::BadRequest => write!(f, "BAD_REQUEST"),
            ErrorCode::Usage => write!(f, "USAGE"),
            ErrorCode::InvalidParam => write!(f, "INVALID_PARAM"),
            ErrorCode::NotSupported => write!(f, "NOT_SUPPORTED"),
            ErrorCode::NoSession => write!(f, "NO_SESSION"),
            ErrorCode::SessionMismatch => write!(f, "SESSION_MISMATCH"),
            ErrorCode::TargetNotFound => write!(f, "TARGET_NOT_FOUND"),
            ErrorCode::DeviceAccess => write!(f, "DEVICE_ACCESS"),
            ErrorCode::DeviceLocked => write!(f, "DEVICE_LOCKED"),
            ErrorCode::AddrMap => write!(f, "ADDR_MAP"),
            ErrorCode::AddrBlocked => write!(f, "ADDR_BLOCKED"),
            ErrorCode::BusError => write!(f, "BUS_ERROR"),
            ErrorCode::Consequential => write!(f, "CONSEQUENTIAL"),
            ErrorCode::ChannelSetup => write!(f, "CHANNEL_SETUP"),
            ErrorCode::ChannelBusy => write!(f, "CHANNEL_BUSY"),
            ErrorCode::ChannelTimeout => write!(f, "CHANNEL_TIMEOUT"),
            ErrorCode::InternalError => write!(f, "INTERNAL_ERROR"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_retryable() {
        assert!(ErrorCode::DeviceAccess.is_retryable());
        assert!(ErrorCode::ChannelBusy.is_retryable());
        assert!(ErrorCode::ChannelTimeout.is_retryable());

        assert!(!ErrorCode::BadRequest.is_retryable());
        assert!(!ErrorCode::AddrBlocked.is_retryable());
        assert!(!ErrorCode::TargetNotFound.is_retryable());
        assert!(!ErrorCode::Consequential.is_retryable());
    }

    #[test]
    fn test_device_fault_classification() {
        assert!(ErrorCode::BusError.is_device_fault());
        assert!(ErrorCode::AddrBlocked.is_device_fault());
        assert!(ErrorCode::Consequential.is_device_fault());

        assert!(!ErrorCode::Usage.is_device_fault());
        assert!(!ErrorCode::ChannelTimeout.is_device_fault());
        assert!(!ErrorCode::TargetNotFound.is_device_fault());
    }

    #[test]
    fn test_display_matches_wire_name() {
        for code in [
            ErrorCode::UnsupportedProtocol,
            ErrorCode::SessionMismatch,
            ErrorCode::AddrMap,
            ErrorCode::ChannelTimeout,
            ErrorCode::InternalError,
        ] {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json.trim_matches('"'), code.to_string());
        }
    }

    #[test]
    fn test_error_code_serialization() {
        let json = serde_json::to_string(&ErrorCode::BusError).unwrap();
        assert_eq!(json, "\"BUS_ERROR\"");

        let parsed: ErrorCode = serde_json::from_str("\"TARGET_NOT_FOUND\"").unwrap();
        assert_eq!(parsed, ErrorCode::TargetNotFound);
    }

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::InvalidMagic(*b"XXXX");
        assert!(err.to_string().contains("magic"));

        let err = ProtocolError::FrameTooLarge { size: 100, max: 50 };
        assert!(err.to_string().contains("100"));

        let err = ProtocolError::CrcMismatch {
            expected: 0xABC,
            actual: 0xDEF,
        };
        assert!(err.to_string().contains("0xabc"));

        let err = ProtocolError::InvalidFlags(0xFF);
        assert!(err.to_string().contains("0xff"));
    }
}
