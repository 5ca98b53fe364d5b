//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via TAS_CONFIG)
//! 3. Environment variables

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tas_protocol::{DeviceConnection, CHL_MAX_MSG_SIZE, DEFAULT_PORT};

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network configuration.
    pub network: NetworkConfig,
    /// Simulated targets served by this instance.
    pub targets: Vec<TargetConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            targets: vec![
                TargetConfig::simulated("sim-tc3x-0", 1, [0x1000_0001, 0, 0, 0x0000_0390]),
                TargetConfig::simulated("sim-tc3x-1", 4, [0x1000_0002, 0, 0, 0x0000_0390]),
            ],
        }
    }
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("TAS_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
    }

    /// Checks target descriptions for consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for target in &self.targets {
            if !seen.insert(target.identifier.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate target identifier '{}'",
                    target.identifier
                )));
            }
            target.validate()?;
        }
        Ok(())
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Idle connection timeout in seconds.
    pub idle_timeout_secs: u64,
    /// Maximum concurrent connections.
    pub max_connections: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            idle_timeout_secs: 300,
            max_connections: 64,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("TAS_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }

        if let Ok(timeout) = std::env::var("TAS_IDLE_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.idle_timeout_secs = secs;
            }
        }

        if let Ok(max) = std::env::var("TAS_MAX_CONNECTIONS") {
            if let Ok(n) = max.parse() {
                self.max_connections = n;
            }
        }
    }

    /// Returns idle timeout as Duration.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// An address range `[start, start + size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeConfig {
    pub start: u64,
    pub size: u64,
}

impl RangeConfig {
    pub fn new(start: u64, size: u64) -> Self {
        Self { start, size }
    }

    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.size)
    }

    pub fn contains(&self, addr: u64, len: u64) -> bool {
        addr >= self.start && addr.saturating_add(len) <= self.end()
    }

    pub fn overlaps(&self, addr: u64, len: u64) -> bool {
        addr < self.end() && addr.saturating_add(len) > self.start
    }
}

/// Channel limits of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelLimits {
    /// Longest client-to-device message.
    pub msg_length_c2d: u16,
    /// Longest device-to-client fragment; longer messages are split.
    pub msg_length_d2c: u16,
    pub msg_num_c2d: u8,
    /// Fragments queued per subscriber before sends are refused.
    pub msg_num_d2c: u8,
}

impl Default for ChannelLimits {
    fn default() -> Self {
        Self {
            msg_length_c2d: 256,
            msg_length_d2c: 128,
            msg_num_c2d: 8,
            msg_num_d2c: 64,
        }
    }
}

/// Description of one simulated target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub identifier: String,
    #[serde(default)]
    pub device_type: u32,
    #[serde(default)]
    pub device_id: [u32; 4],
    #[serde(default)]
    pub dev_con_phys: DeviceConnection,
    /// Smallest access unit in bytes (1, 2, 4 or 8).
    #[serde(default = "default_access_width")]
    pub access_width: u8,
    #[serde(default = "default_max_batch_items")]
    pub max_batch_items: u32,
    /// Bit `n` set when address map `n` is supported.
    #[serde(default = "default_addr_map_mask")]
    pub addr_map_mask: u32,
    /// Backed memory; accesses outside every region are bus errors.
    #[serde(default)]
    pub regions: Vec<RangeConfig>,
    /// Ranges inside regions that refuse access.
    #[serde(default)]
    pub protected: Vec<RangeConfig>,
    #[serde(default)]
    pub channels: ChannelLimits,
}

fn default_access_width() -> u8 {
    1
}

fn default_max_batch_items() -> u32 {
    256
}

fn default_addr_map_mask() -> u32 {
    1
}

impl TargetConfig {
    /// A target with two RAM regions and a protected window at the top of
    /// the first one.
    pub fn simulated(identifier: &str, access_width: u8, device_id: [u32; 4]) -> Self {
        Self {
            identifier: identifier.to_string(),
            device_type: 0x0000_9200,
            device_id,
            dev_con_phys: DeviceConnection::Dap,
            access_width,
            max_batch_items: default_max_batch_items(),
            addr_map_mask: default_addr_map_mask(),
            regions: vec![
                RangeConfig::new(0x7000_0000, 0x1_0000),
                RangeConfig::new(0x9000_0000, 0x4000),
            ],
            protected: vec![RangeConfig::new(0x7000_F000, 0x1000)],
            channels: ChannelLimits::default(),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: String| {
            Err(ConfigError::ValidationError(format!(
                "target '{}': {}",
                self.identifier, msg
            )))
        };

        if self.identifier.is_empty() {
            return Err(ConfigError::ValidationError(
                "target identifier must not be empty".to_string(),
            ));
        }
        if !matches!(self.access_width, 1 | 2 | 4 | 8) {
            return fail(format!("invalid access_width {}", self.access_width));
        }
        if self.max_batch_items == 0 {
            return fail("max_batch_items must be positive".to_string());
        }
        if self.addr_map_mask & 1 == 0 {
            return fail("address map 0 must be supported".to_string());
        }
        for region in &self.regions {
            if region.size == 0 || region.size > 64 * 1024 * 1024 {
                return fail(format!("region {:#x} has invalid size", region.start));
            }
        }
        for (i, a) in self.regions.iter().enumerate() {
            if self.regions[i + 1..]
                .iter()
                .any(|b| a.overlaps(b.start, b.size))
            {
                return fail(format!("region {:#x} overlaps another region", a.start));
            }
        }
        let limits = &self.channels;
        if limits.msg_length_c2d == 0
            || limits.msg_length_d2c == 0
            || limits.msg_length_c2d > CHL_MAX_MSG_SIZE
            || limits.msg_length_d2c > CHL_MAX_MSG_SIZE
        {
            return fail("channel message lengths must be within 1..=1024".to_string());
        }
        if limits.msg_num_d2c == 0 {
            return fail("msg_num_d2c must be positive".to_string());
        }
        Ok(())
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Custom serde module for SocketAddr (to handle as string in YAML).
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.bind_addr.port(), 24817);
        assert_eq!(config.targets.len(), 2);
        assert_eq!(config.targets[0].access_width, 1);
        assert_eq!(config.targets[1].access_width, 4);
        config.validate().unwrap();
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.network.bind_addr, config.network.bind_addr);
        assert_eq!(parsed.targets[1].regions, config.targets[1].regions);
    }

    #[test]
    fn test_from_file_with_partial_target() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "network:\n  bind_addr: \"0.0.0.0:9000\"\ntargets:\n  - identifier: bench\n    regions:\n      - {{ start: 4096, size: 256 }}"
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.network.bind_addr.port(), 9000);
        assert_eq!(config.network.idle_timeout_secs, 300);
        let target = &config.targets[0];
        assert_eq!(target.identifier, "bench");
        assert_eq!(target.access_width, 1);
        assert_eq!(target.max_batch_items, 256);
        assert_eq!(target.regions, vec![RangeConfig::new(4096, 256)]);
        config.validate().unwrap();
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tas.yaml");
        Config::default().save(&path).unwrap();
        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.targets[0].identifier, "sim-tc3x-0");
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_file("/nonexistent/tas.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::IoError(_, _)));
    }

    #[test]
    fn test_validation_rejects_bad_targets() {
        let mut config = Config::default();
        config.targets[1].identifier = config.targets[0].identifier.clone();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.targets[0].access_width = 3;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.targets[0]
            .regions
            .push(RangeConfig::new(0x7000_8000, 0x100));
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.targets[0].channels.msg_length_d2c = 2048;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_range_helpers() {
        let r = RangeConfig::new(0x100, 0x10);
        assert!(r.contains(0x100, 0x10));
        assert!(!r.contains(0x108, 0x10));
        assert!(r.overlaps(0xF8, 0x10));
        assert!(!r.overlaps(0x110, 4));
        assert!(!r.overlaps(0xFC, 4));
    }
}
