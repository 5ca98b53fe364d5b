//! JSON message types for TAS requests and responses.

use crate::error::ErrorCode;
use crate::types::{
    ChannelDirection, ChannelMode, ClientInfo, ClientType, ResetMode, ServerInfo, TargetInfo,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// TAS operation types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    // Server connection
    Hello,
    Bye,

    // Discovery
    GetTargets,
    GetTargetClients,

    // Session
    SessionStart,
    Ping,
    DeviceConnect,

    // Memory access
    Rw,

    // Channels
    ChlSubscribe,
    ChlUnsubscribe,
    ChlSend,
    ChlRcv,
    ChlList,
}

/// Request message envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Message type, always "request".
    #[serde(rename = "type")]
    pub msg_type: String,

    /// Unique request ID for correlation.
    pub id: String,

    pub op: Operation,

    #[serde(default)]
    pub params: Value,
}

impl Request {
    pub fn new(id: impl Into<String>, op: Operation) -> Self {
        Self {
            msg_type: "request".to_string(),
            id: id.into(),
            op,
            params: Value::Object(Default::default()),
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }
}

/// Response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Ok,
    Error,
}

/// Error details in a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: ErrorCode,

    /// Human-readable error message.
    pub message: String,

    pub retryable: bool,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub details: HashMap<String, Value>,
}

impl ResponseError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            retryable: code.is_retryable(),
            code,
            message: message.into(),
            details: HashMap::new(),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

/// Response metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseMeta {
    /// Reset counter of the bound device, present once a session is bound.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_count: Option<u32>,

    /// Additional metadata fields (for forward compatibility).
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// Response message envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Message type, always "response".
    #[serde(rename = "type")]
    pub msg_type: String,

    /// Request ID this response correlates to.
    pub id: String,

    pub status: ResponseStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,

    #[serde(default, skip_serializing_if = "is_meta_empty")]
    pub meta: ResponseMeta,
}

fn is_meta_empty(meta: &ResponseMeta) -> bool {
    meta.reset_count.is_none() && meta.extra.is_empty()
}

impl Response {
    pub fn ok(id: impl Into<String>, result: Value) -> Self {
        Self {
            msg_type: "response".to_string(),
            id: id.into(),
            status: ResponseStatus::Ok,
            result: Some(result),
            error: None,
            meta: ResponseMeta::default(),
        }
    }

    pub fn error(id: impl Into<String>, error: ResponseError) -> Self {
        Self {
            msg_type: "response".to_string(),
            id: id.into(),
            status: ResponseStatus::Error,
            result: None,
            error: Some(error),
            meta: ResponseMeta::default(),
        }
    }

    pub fn with_meta(mut self, meta: ResponseMeta) -> Self {
        self.meta = meta;
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }

    pub fn is_error(&self) -> bool {
        self.status == ResponseStatus::Error
    }
}

/// Serde adapter carrying byte payloads as lowercase hex strings.
pub mod hex_data {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Operation-specific parameter types
// ============================================================================

/// Parameters for HELLO request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloParams {
    pub protocol_version: u16,
    pub client_name: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub client_pid: u32,
    #[serde(default)]
    pub client_type: ClientType,
}

/// Result for HELLO response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloResult {
    pub protocol_version: u16,
    pub server: ServerInfo,
}

/// Result for GET_TARGETS response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetTargetsResult {
    pub targets: Vec<TargetInfo>,
}

/// Parameters for GET_TARGET_CLIENTS request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetTargetClientsParams {
    pub identifier: String,
}

/// Result for GET_TARGET_CLIENTS response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetTargetClientsResult {
    pub session_name: String,
    /// Microseconds since server start; zero when no session exists.
    pub session_start_time_us: u64,
    pub clients: Vec<ClientInfo>,
}

/// Parameters for SESSION_START request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStartParams {
    pub identifier: String,
    #[serde(default)]
    pub session_name: String,
    #[serde(default)]
    pub session_pw: String,
}

/// Parameters for DEVICE_CONNECT request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConnectParams {
    pub mode: ResetMode,
}

/// Result for DEVICE_CONNECT response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConnectResult {
    pub reset_count: u32,
    pub halted: bool,
}

/// Kind of a single device access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessKind {
    Read,
    Write,
    /// Repeat a 64-bit pattern over an 8-aligned range.
    Fill,
}

/// One naturally aligned device access inside an RW batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RwItem {
    pub kind: AccessKind,
    pub addr: u64,
    #[serde(default)]
    pub addr_map: u8,
    pub num_bytes: u32,
    /// Write payload.
    #[serde(default, with = "hex_data", skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<u8>,
    /// Fill pattern.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<u64>,
}

impl RwItem {
    pub fn read(addr: u64, num_bytes: u32) -> Self {
        Self {
            kind: AccessKind::Read,
            addr,
            addr_map: 0,
            num_bytes,
            data: Vec::new(),
            pattern: None,
        }
    }

    pub fn write(addr: u64, data: Vec<u8>) -> Self {
        Self {
            kind: AccessKind::Write,
            addr,
            addr_map: 0,
            num_bytes: data.len() as u32,
            data,
            pattern: None,
        }
    }

    pub fn fill(addr: u64, num_bytes: u32, pattern: u64) -> Self {
        Self {
            kind: AccessKind::Fill,
            addr,
            addr_map: 0,
            num_bytes,
            data: Vec::new(),
            pattern: Some(pattern),
        }
    }

    pub fn with_addr_map(mut self, addr_map: u8) -> Self {
        self.addr_map = addr_map;
        self
    }
}

/// Parameters for RW request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RwParams {
    pub items: Vec<RwItem>,
}

/// Outcome of one device access, parallel to the request items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RwItemResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorCode>,
    pub num_bytes_ok: u32,
    /// Read data.
    #[serde(default, with = "hex_data", skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<u8>,
}

impl RwItemResult {
    pub fn ok(num_bytes: u32, data: Vec<u8>) -> Self {
        Self {
            error: None,
            num_bytes_ok: num_bytes,
            data,
        }
    }

    pub fn failed(code: ErrorCode) -> Self {
        Self {
            error: Some(code),
            num_bytes_ok: 0,
            data: Vec::new(),
        }
    }
}

/// Result for RW response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RwResult {
    pub results: Vec<RwItemResult>,
}

/// Parameters for CHL_SUBSCRIBE request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChlSubscribeParams {
    pub chl: u8,
    pub direction: ChannelDirection,
    #[serde(default)]
    pub mode: ChannelMode,
    /// Requested priority; the server assigns one when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prio: Option<u8>,
}

/// Result for CHL_SUBSCRIBE response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChlSubscribeResult {
    pub chl: u8,
    pub prio: u8,
}

/// Parameters for CHL_UNSUBSCRIBE request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChlUnsubscribeParams {
    pub chl: u8,
}

/// Result for CHL_UNSUBSCRIBE response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChlUnsubscribeResult {
    pub chl: u8,
    pub removed: bool,
}

/// Parameters for CHL_SEND request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChlSendParams {
    pub chl: u8,
    #[serde(with = "hex_data")]
    pub data: Vec<u8>,
}

/// Result for CHL_SEND response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChlSendResult {
    pub num_bytes: u32,
}

/// Parameters for CHL_RCV request (long poll).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChlRcvParams {
    pub chl: u8,
    pub timeout_ms: u32,
}

/// Result for CHL_RCV response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChlRcvResult {
    pub chl: u8,
    #[serde(with = "hex_data")]
    pub data: Vec<u8>,
    /// Set when this fragment starts a new logical message.
    pub first: bool,
}

/// Result for CHL_LIST response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChlListResult {
    pub channels: Vec<u8>,
}
