//! # tas-client
//!
//! Client library for TAS servers.
//!
//! This crate provides:
//! - Session management: handshake, target discovery, session binding
//! - Memory read/write with client-side alignment handling and batching
//! - Directional channel messaging with timeout-bounded receive
//! - Result classification into coarse error kinds

pub mod channel;
pub mod client;
pub mod connection;
pub mod error;
pub mod plan;
pub mod rw;
pub mod stream;

pub use channel::{ChannelMessage, Channels, Subscription};
pub use client::{Client, ConnectionInfo, TargetClients};
pub use connection::{Connection, ConnectionConfig, Endpoint};
pub use error::{ClientError, ErrorKind};
pub use rw::{DeviceFault, Rw, RwOp, RwTransaction, TransOutcome};
pub use stream::ClientStream;
pub use tas_protocol::{ChannelDirection, ChannelMode, ResetMode};
