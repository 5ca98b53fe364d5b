//! Domain types shared by client and server: server capabilities, target
//! descriptions, client registry entries and the channel/reset enumerations.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Server identity and capabilities, returned by the HELLO handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub server_name: String,
    pub v_major: u16,
    pub v_minor: u16,
    /// Build date of the server.
    pub date: String,
    /// Bit `n` set when protocol version `n` is supported.
    pub supp_protoc_ver: u16,
    /// Bit `n` set when channel target kind `n` is supported.
    pub supp_chl_target: u16,
    /// Bit `n` set when trace type `n` is supported.
    pub supp_trc_type: u16,
    /// Server start, microseconds since the Unix epoch.
    pub start_time_us: u64,
}

impl ServerInfo {
    pub fn supports_protocol(&self, version: u16) -> bool {
        version < 16 && self.supp_protoc_ver & (1 << version) != 0
    }

    pub fn version_string(&self) -> String {
        format!("{}.{}", self.v_major, self.v_minor)
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        i64::try_from(self.start_time_us)
            .ok()
            .and_then(|us| Utc.timestamp_micros(us).single())
    }
}

/// Physical connection between the access hardware and the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceConnection {
    #[default]
    Unknown,
    Jtag,
    Dap,
    Swd,
    Eth,
}

/// One target reachable through the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetInfo {
    /// Stable identifier used to bind a session.
    pub identifier: String,
    pub device_type: u32,
    pub device_id: [u32; 4],
    #[serde(default)]
    pub dev_con_phys: DeviceConnection,
    /// Number of clients currently attached to this target.
    pub num_client: u32,
}

/// Kind of client attached to a target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientType {
    #[default]
    Unknown,
    Rw,
    Chl,
    /// Read/write and channel traffic over one connection.
    Mixed,
}

/// A peer attached to the same target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub client_name: String,
    pub user_name: String,
    pub client_pid: u32,
    pub client_type: ClientType,
    /// Microseconds since server start.
    pub client_connect_time: u64,
    pub num_byte_c2s: u64,
    pub num_byte_s2c: u64,
}

/// Link parameters of a bound session, as reported by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConInfo {
    pub identifier: String,
    pub device_type: u32,
    pub device_id: [u32; 4],
    /// Maximum number of device accesses in one RW batch.
    pub max_batch_items: u32,
    /// Smallest access unit the device supports, in bytes.
    pub access_width: u8,
    /// Bit `n` set when address map `n` is supported.
    pub addr_map_mask: u32,
    pub msg_length_c2d: u16,
    pub msg_length_d2c: u16,
    pub msg_num_c2d: u8,
    pub msg_num_d2c: u8,
    /// Device reset counter at the time of the response.
    pub reset_count: u32,
}

/// Device reset/attach behaviour for DEVICE_CONNECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetMode {
    /// Attach without touching the running device.
    HotAttach,
    Reset,
    ResetAndHalt,
}

/// Direction of a channel, seen from the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelDirection {
    /// Client to device only.
    Send,
    /// Device to client only.
    Receive,
    Bidirectional,
}

impl ChannelDirection {
    pub fn can_send(&self) -> bool {
        matches!(self, Self::Send | Self::Bidirectional)
    }

    pub fn can_receive(&self) -> bool {
        matches!(self, Self::Receive | Self::Bidirectional)
    }
}

/// Sharing mode of a channel subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelMode {
    #[default]
    Default,
    /// No other client may hold the channel at the same time.
    Exclusive,
}

const HASH_ALPHABET: &[u8; 32] = b"ABCDEFGHJKLMNPQRTUVWXYZ012346789";
const HASH_LETTERS: u32 = 22;

/// Content hash of a 128-bit device id (CRC-32C over its little-endian bytes).
pub fn device_id_hash(device_id: &[u32; 4]) -> u32 {
    let mut bytes = [0u8; 16];
    for (chunk, word) in bytes.chunks_exact_mut(4).zip(device_id) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    crc32c::crc32c(&bytes)
}

/// Renders a 32-bit hash as six symbols; the first symbol is always a letter.
pub fn hash_to_str(hash: u32) -> String {
    let mut out = [0u8; 6];
    let mut value = hash;
    for slot in out[1..].iter_mut().rev() {
        *slot = HASH_ALPHABET[(value % 32) as usize];
        value /= 32;
    }
    out[0] = HASH_ALPHABET[(value % HASH_LETTERS) as usize];
    out.iter().map(|&b| b as char).collect()
}
