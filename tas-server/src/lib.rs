//! # tas-server
//!
//! Simulated TAS server.
//!
//! This crate provides:
//! - TCP and in-memory connection handling with async I/O
//! - Protocol framing and message dispatch
//! - Session management and per-target session binding
//! - Simulated targets with memory regions, protected ranges and resets
//! - A channel hub routing messages between the clients of a target

pub mod channel;
pub mod config;
pub mod error;
pub mod handler;
pub mod server;
pub mod session;
pub mod target;

pub use channel::{ChannelHub, Fragment};
pub use config::{ChannelLimits, Config, ConfigError, NetworkConfig, RangeConfig, TargetConfig};
pub use error::ServerError;
pub use handler::CommandHandler;
pub use server::{Server, ServerConfig, ServerStats};
pub use session::Session;
pub use target::{Target, TargetRegistry};
