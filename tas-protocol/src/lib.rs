//! # tas-protocol
//!
//! Wire protocol shared by the TAS client and server.
//!
//! This crate provides:
//! - Binary framing with length prefix and CRC32C validation
//! - JSON request/response envelopes and per-operation payloads
//! - Target, client and channel description types
//! - Error codes and protocol constants

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;
pub mod types;

pub use codec::{Decoder, Encoder};
pub use error::{ErrorCode, ProtocolError};
pub use frame::{Frame, FrameFlags, FRAME_HEADER_SIZE, MAGIC};
pub use message::{
    AccessKind, Operation, Request, Response, ResponseError, ResponseMeta, ResponseStatus, RwItem,
    RwItemResult,
};
pub use types::{
    device_id_hash, hash_to_str, ChannelDirection, ChannelMode, ClientInfo, ClientType, ConInfo,
    DeviceConnection, ResetMode, ServerInfo, TargetInfo,
};

/// Protocol version supported by this implementation.
pub const PROTOCOL_VERSION: u16 = 1;

/// Default port of a TAS server.
pub const DEFAULT_PORT: u16 = 24817;

/// Maximum frame payload size (4 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 4 * 1024 * 1024;

/// Largest single device access in bytes.
pub const MAX_BLOCK_SIZE: u32 = 1024;

/// Number of channel ids; valid ids are `0..MAX_CHANNELS`.
pub const MAX_CHANNELS: u8 = 32;

/// Numerically highest (least urgent) channel priority.
pub const CHL_LOWEST_PRIORITY: u8 = 31;

/// Upper bound for one channel message in either direction.
pub const CHL_MAX_MSG_SIZE: u16 = 1024;
