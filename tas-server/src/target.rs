//! Simulated targets: device memory, session binding, attached clients and
//! reset handling.

use crate::channel::ChannelHub;
use crate::config::{RangeConfig, TargetConfig};
use crate::error::ServerError;
use crate::session::ClientIdentity;
use dashmap::DashMap;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tas_protocol::message::DeviceConnectResult;
use tas_protocol::{
    AccessKind, ClientInfo, ConInfo, ErrorCode, ResetMode, RwItem, RwItemResult, TargetInfo,
    MAX_BLOCK_SIZE,
};

/// Bytes moved over one client connection.
#[derive(Debug, Default)]
pub struct TrafficStats {
    pub bytes_c2s: AtomicU64,
    pub bytes_s2c: AtomicU64,
}

impl TrafficStats {
    pub fn record_in(&self, n: usize) {
        self.bytes_c2s.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_out(&self, n: usize) {
        self.bytes_s2c.fetch_add(n as u64, Ordering::Relaxed);
    }
}

struct Binding {
    session_name: String,
    pw_digest: String,
    start_time_us: u64,
}

/// A client attached to a target.
pub struct AttachedClient {
    pub session_id: String,
    pub identity: ClientIdentity,
    /// Microseconds since server start.
    pub connect_time_us: u64,
    pub traffic: Arc<TrafficStats>,
}

struct Region {
    range: RangeConfig,
    mem: Vec<u8>,
}

impl Region {
    fn new(range: RangeConfig) -> Self {
        Self {
            range,
            mem: vec![0; range.size as usize],
        }
    }
}

struct TargetState {
    regions: Vec<Region>,
    reset_count: u32,
    halted: bool,
    binding: Option<Binding>,
    clients: Vec<AttachedClient>,
}

/// One simulated device.
pub struct Target {
    config: TargetConfig,
    state: Mutex<TargetState>,
    hub: ChannelHub,
}

impl Target {
    pub fn new(config: TargetConfig) -> Self {
        let regions = config.regions.iter().copied().map(Region::new).collect();
        Self {
            hub: ChannelHub::new(config.channels),
            state: Mutex::new(TargetState {
                regions,
                reset_count: 0,
                halted: false,
                binding: None,
                clients: Vec::new(),
            }),
            config,
        }
    }

    pub fn identifier(&self) -> &str {
        &self.config.identifier
    }

    pub fn config(&self) -> &TargetConfig {
        &self.config
    }

    pub fn hub(&self) -> &ChannelHub {
        &self.hub
    }

    pub fn reset_count(&self) -> u32 {
        self.state.lock().reset_count
    }

    pub fn info(&self) -> TargetInfo {
        TargetInfo {
            identifier: self.config.identifier.clone(),
            device_type: self.config.device_type,
            device_id: self.config.device_id,
            dev_con_phys: self.config.dev_con_phys,
            num_client: self.state.lock().clients.len() as u32,
        }
    }

    pub fn con_info(&self) -> ConInfo {
        let limits = &self.config.channels;
        ConInfo {
            identifier: self.config.identifier.clone(),
            device_type: self.config.device_type,
            device_id: self.config.device_id,
            max_batch_items: self.config.max_batch_items,
            access_width: self.config.access_width,
            addr_map_mask: self.config.addr_map_mask,
            msg_length_c2d: limits.msg_length_c2d,
            msg_length_d2c: limits.msg_length_d2c,
            msg_num_c2d: limits.msg_num_c2d,
            msg_num_d2c: limits.msg_num_d2c,
            reset_count: self.reset_count(),
        }
    }

    /// Attaches a client. The first client opens the session; later ones
    /// must present the same name and password.
    pub fn attach(
        &self,
        client: AttachedClient,
        session_name: &str,
        session_pw: &str,
        now_us: u64,
    ) -> Result<(), ServerError> {
        let digest = hex::encode(Sha256::digest(session_pw.as_bytes()));
        let mut state = self.state.lock();

        if let Some(binding) = &state.binding {
            if binding.session_name != session_name {
                return Err(ServerError::SessionMismatch(format!(
                    "target {} is in session '{}'",
                    self.config.identifier, binding.session_name
                )));
            }
            if binding.pw_digest != digest {
                return Err(ServerError::SessionMismatch(format!(
                    "wrong password for session '{}'",
                    session_name
                )));
            }
        }
        if state.binding.is_none() {
            tracing::info!(
                "Target {}: session '{}' opened",
                self.config.identifier,
                session_name
            );
            state.binding = Some(Binding {
                session_name: session_name.to_string(),
                pw_digest: digest,
                start_time_us: now_us,
            });
        }

        state.clients.push(client);
        Ok(())
    }

    /// Detaches a client and releases its channels. The session closes with
    /// its last client.
    pub fn detach(&self, session_id: &str) {
        self.hub.release_client(session_id);
        let mut state = self.state.lock();
        state.clients.retain(|c| c.session_id != session_id);
        if state.clients.is_empty() {
            if let Some(binding) = state.binding.take() {
                tracing::info!(
                    "Target {}: session '{}' closed",
                    self.config.identifier,
                    binding.session_name
                );
            }
        }
    }

    /// Session name, session start and the attached clients.
    pub fn clients(&self) -> (String, u64, Vec<ClientInfo>) {
        let state = self.state.lock();
        let (name, start) = state
            .binding
            .as_ref()
            .map(|b| (b.session_name.clone(), b.start_time_us))
            .unwrap_or_default();
        let clients = state
            .clients
            .iter()
            .map(|c| ClientInfo {
                client_name: c.identity.client_name.clone(),
                user_name: c.identity.user_name.clone(),
                client_pid: c.identity.client_pid,
                client_type: c.identity.client_type,
                client_connect_time: c.connect_time_us,
                num_byte_c2s: c.traffic.bytes_c2s.load(Ordering::Relaxed),
                num_byte_s2c: c.traffic.bytes_s2c.load(Ordering::Relaxed),
            })
            .collect();
        (name, start, clients)
    }

    /// Attaches to the device, optionally resetting it. A reset clears
    /// memory and releases every channel subscription.
    pub fn connect(&self, mode: ResetMode) -> DeviceConnectResult {
        let mut state = self.state.lock();
        match mode {
            ResetMode::HotAttach => {}
            ResetMode::Reset | ResetMode::ResetAndHalt => {
                state.reset_count = state.reset_count.wrapping_add(1);
                state.halted = mode == ResetMode::ResetAndHalt;
                for region in &mut state.regions {
                    region.mem.fill(0);
                }
                self.hub.clear();
                tracing::info!(
                    "Target {}: reset #{} ({:?})",
                    self.config.identifier,
                    state.reset_count,
                    mode
                );
            }
        }
        DeviceConnectResult {
            reset_count: state.reset_count,
            halted: state.halted,
        }
    }

    /// Executes a batch in order. After the first failing item every later
    /// item reports [`ErrorCode::Consequential`]; earlier effects stay.
    pub fn execute(&self, items: &[RwItem]) -> Result<Vec<RwItemResult>, ServerError> {
        if items.len() > self.config.max_batch_items as usize {
            return Err(ServerError::InvalidParam(format!(
                "{} items exceed the batch limit of {}",
                items.len(),
                self.config.max_batch_items
            )));
        }
        for (i, item) in items.iter().enumerate() {
            self.check_shape(item)
                .map_err(|msg| ServerError::InvalidParam(format!("item {}: {}", i, msg)))?;
        }

        let mut state = self.state.lock();
        let mut failed = false;
        let results = items
            .iter()
            .map(|item| {
                if failed {
                    return RwItemResult::failed(ErrorCode::Consequential);
                }
                match self.access(&mut state, item) {
                    Ok(data) => RwItemResult::ok(item.num_bytes, data),
                    Err(code) => {
                        tracing::debug!(
                            "Target {}: {:?} at {:#x} failed with {}",
                            self.config.identifier,
                            item.kind,
                            item.addr,
                            code
                        );
                        failed = true;
                        RwItemResult::failed(code)
                    }
                }
            })
            .collect();
        Ok(results)
    }

    fn check_shape(&self, item: &RwItem) -> Result<(), String> {
        let len = item.num_bytes;
        let addr = item.addr;
        if len == 0 {
            return Err("zero-length access".to_string());
        }
        if addr.checked_add(len as u64 - 1).is_none() {
            return Err("range exceeds the address space".to_string());
        }

        match item.kind {
            AccessKind::Read | AccessKind::Write => {
                let aligned = match len {
                    1 | 2 | 4 => addr % len as u64 == 0,
                    n => n % 8 == 0 && n <= MAX_BLOCK_SIZE && addr % 8 == 0,
                };
                if !aligned {
                    return Err(format!("{} bytes at {:#x} not naturally aligned", len, addr));
                }
                let width = self.config.access_width as u64;
                if addr % width != 0 || len as u64 % width != 0 {
                    return Err(format!("device requires {}-byte accesses", width));
                }
                if item.kind == AccessKind::Write && item.data.len() != len as usize {
                    return Err(format!(
                        "payload of {} bytes for a {}-byte write",
                        item.data.len(),
                        len
                    ));
                }
            }
            AccessKind::Fill => {
                if item.pattern.is_none() {
                    return Err("fill without pattern".to_string());
                }
                if addr % 8 != 0 || len % 8 != 0 {
                    return Err("fill must be 8-byte aligned".to_string());
                }
            }
        }
        Ok(())
    }

    fn access(&self, state: &mut TargetState, item: &RwItem) -> Result<Vec<u8>, ErrorCode> {
        if item.addr_map >= 32 || self.config.addr_map_mask & (1 << item.addr_map) == 0 {
            return Err(ErrorCode::AddrMap);
        }
        let len = item.num_bytes as u64;
        let region = state
            .regions
            .iter_mut()
            .find(|r| r.range.contains(item.addr, len))
            .ok_or(ErrorCode::BusError)?;
        if self
            .config
            .protected
            .iter()
            .any(|p| p.overlaps(item.addr, len))
        {
            return Err(ErrorCode::AddrBlocked);
        }

        let off = (item.addr - region.range.start) as usize;
        let span = &mut region.mem[off..off + len as usize];
        match item.kind {
            AccessKind::Read => Ok(span.to_vec()),
            AccessKind::Write => {
                span.copy_from_slice(&item.data);
                Ok(Vec::new())
            }
            AccessKind::Fill => {
                let unit = item.pattern.unwrap_or_default().to_le_bytes();
                for (dst, src) in span.iter_mut().zip(unit.iter().cycle()) {
                    *dst = *src;
                }
                Ok(Vec::new())
            }
        }
    }
}

/// Targets by identifier.
pub struct TargetRegistry {
    targets: DashMap<String, Arc<Target>>,
}

impl TargetRegistry {
    pub fn new(configs: &[TargetConfig]) -> Self {
        let targets = DashMap::new();
        for config in configs {
            targets.insert(
                config.identifier.clone(),
                Arc::new(Target::new(config.clone())),
            );
        }
        Self { targets }
    }

    pub fn get(&self, identifier: &str) -> Option<Arc<Target>> {
        self.targets.get(identifier).map(|t| t.value().clone())
    }

    /// All targets, ordered by identifier.
    pub fn list(&self) -> Vec<Arc<Target>> {
        let mut targets: Vec<Arc<Target>> =
            self.targets.iter().map(|t| t.value().clone()).collect();
        targets.sort_by(|a, b| a.identifier().cmp(b.identifier()));
        targets
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    const RAM: u64 = 0x7000_0000;

    fn target(width: u8) -> Target {
        Target::new(TargetConfig::simulated("t", width, [1, 2, 3, 4]))
    }

    fn attach(t: &Target, id: &str, name: &str, pw: &str) -> Result<(), ServerError> {
        let client = AttachedClient {
            session_id: id.to_string(),
            identity: ClientIdentity::default(),
            connect_time_us: 0,
            traffic: Arc::new(TrafficStats::default()),
        };
        t.attach(client, name, pw, 100)
    }

    #[test]
    fn test_session_binding() {
        let t = target(1);
        attach(&t, "a", "lab", "pw").unwrap();
        assert!(matches!(
            attach(&t, "b", "lab", "nope"),
            Err(ServerError::SessionMismatch(_))
        ));
        assert!(matches!(
            attach(&t, "b", "other", "pw"),
            Err(ServerError::SessionMismatch(_))
        ));
        attach(&t, "b", "lab", "pw").unwrap();
        assert_eq!(t.info().num_client, 2);

        let (name, start, clients) = t.clients();
        assert_eq!((name.as_str(), start, clients.len()), ("lab", 100, 2));

        t.detach("a");
        t.detach("b");
        let (name, start, clients) = t.clients();
        assert_eq!((name.as_str(), start, clients.len()), ("", 0, 0));

        attach(&t, "c", "fresh", "").unwrap();
    }

    #[test]
    fn test_execute_read_write_fill() {
        let t = target(1);
        let results = t
            .execute(&[
                RwItem::write(RAM + 8, vec![1, 2, 3, 4, 5, 6, 7, 8]),
                RwItem::read(RAM + 10, 2),
                RwItem::fill(RAM + 16, 16, 0x0807_0605_0403_0201),
                RwItem::read(RAM + 16, 16),
            ])
            .unwrap();
        assert!(results.iter().all(|r| r.error.is_none()));
        assert_eq!(results[1].data, vec![3, 4]);
        assert_eq!(results[3].data, [1, 2, 3, 4, 5, 6, 7, 8].repeat(2));
        assert_eq!(results[0].num_bytes_ok, 8);
    }

    #[test]
    fn test_execute_faults() {
        let t = target(1);
        let results = t
            .execute(&[
                RwItem::read(RAM, 4),
                RwItem::read(0x7000_F000, 4),
                RwItem::write(RAM, vec![9; 4]),
            ])
            .unwrap();
        assert_eq!(results[0].error, None);
        assert_eq!(results[1].error, Some(ErrorCode::AddrBlocked));
        assert_eq!(results[2].error, Some(ErrorCode::Consequential));
        assert_eq!(t.execute(&[RwItem::read(RAM, 4)]).unwrap()[0].data, vec![0; 4]);

        let results = t.execute(&[RwItem::read(0x10, 4)]).unwrap();
        assert_eq!(results[0].error, Some(ErrorCode::BusError));

        let results = t.execute(&[RwItem::read(RAM, 4).with_addr_map(3)]).unwrap();
        assert_eq!(results[0].error, Some(ErrorCode::AddrMap));

        let results = t.execute(&[RwItem::read(0x9000_3FF8, 16)]).unwrap();
        assert_eq!(results[0].error, Some(ErrorCode::BusError));
    }

    #[test]
    fn test_execute_rejects_malformed_items() {
        let t = target(4);
        let bad = [
            RwItem::read(RAM, 0),
            RwItem::read(RAM + 1, 2),
            RwItem::read(RAM + 2, 2),
            RwItem::read(RAM, 12),
            RwItem::fill(RAM + 4, 8, 0),
            RwItem {
                num_bytes: 8,
                ..RwItem::write(RAM, vec![0; 4])
            },
        ];
        for item in bad {
            assert!(
                matches!(t.execute(&[item.clone()]), Err(ServerError::InvalidParam(_))),
                "{:?}",
                item
            );
        }

        let too_many = vec![RwItem::read(RAM, 4); 257];
        assert!(t.execute(&too_many).is_err());
        assert!(t.execute(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_reset_clears_memory_and_channels() {
        let t = target(1);
        t.execute(&[RwItem::write(RAM, vec![0xAA; 4])]).unwrap();
        t.hub()
            .subscribe(
                "a",
                1,
                tas_protocol::ChannelDirection::Send,
                tas_protocol::ChannelMode::Default,
                None,
            )
            .unwrap();

        let hot = t.connect(ResetMode::HotAttach);
        assert_eq!((hot.reset_count, hot.halted), (0, false));
        assert_eq!(t.hub().list("a"), vec![1]);

        let reset = t.connect(ResetMode::ResetAndHalt);
        assert_eq!((reset.reset_count, reset.halted), (1, true));
        assert!(t.hub().list("a").is_empty());
        assert_eq!(t.execute(&[RwItem::read(RAM, 4)]).unwrap()[0].data, vec![0; 4]);
        assert_eq!(t.con_info().reset_count, 1);
    }

    #[test]
    fn test_registry_is_sorted() {
        let mut config = Config::default();
        config.targets.reverse();
        let registry = TargetRegistry::new(&config.targets);
        let ids: Vec<String> = registry
            .list()
            .iter()
            .map(|t| t.identifier().to_string())
            .collect();
        assert_eq!(ids, vec!["sim-tc3x-0", "sim-tc3x-1"]);
        assert!(registry.get("sim-tc3x-1").is_some());
        assert!(registry.get("missing").is_none());
    }
}
