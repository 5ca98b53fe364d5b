//! Session manager: the high-level client API.

use crate::channel::{ChannelTable, Channels};
use crate::connection::{into_result, Connection, ConnectionConfig, Endpoint};
use crate::error::ClientError;
use crate::rw::Rw;
use crate::stream::ClientStream;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tas_protocol::message::{
    DeviceConnectParams, DeviceConnectResult, GetTargetClientsParams,
    GetTargetClientsResult, GetTargetsResult, SessionStartParams,
};
use tas_protocol::{
    device_id_hash, hash_to_str, ClientInfo, ConInfo, ErrorCode, Operation, ResetMode, ServerInfo,
    TargetInfo,
};

/// Identity and link limits of the bound target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub identifier: String,
    pub device_type: u32,
    pub device_id: [u32; 4],
    /// Content hash of `device_id`.
    pub device_id_hash: u32,
    /// Six-symbol rendering of `device_id_hash`.
    pub device_id_hash_str: String,
    pub max_batch_items: u32,
    pub access_width: u8,
    pub addr_map_mask: u32,
    pub msg_length_c2d: u16,
    pub msg_length_d2c: u16,
    pub msg_num_c2d: u8,
    pub msg_num_d2c: u8,
    pub reset_count: u32,
}

impl From<ConInfo> for ConnectionInfo {
    fn from(info: ConInfo) -> Self {
        let hash = device_id_hash(&info.device_id);
        Self {
            identifier: info.identifier,
            device_type: info.device_type,
            device_id: info.device_id,
            device_id_hash: hash,
            device_id_hash_str: hash_to_str(hash),
            max_batch_items: info.max_batch_items,
            access_width: info.access_width,
            addr_map_mask: info.addr_map_mask,
            msg_length_c2d: info.msg_length_c2d,
            msg_length_d2c: info.msg_length_d2c,
            msg_num_c2d: info.msg_num_c2d,
            msg_num_d2c: info.msg_num_d2c,
            reset_count: info.reset_count,
        }
    }
}

/// Clients attached to one target and the session they share.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetClients {
    pub clients: Vec<ClientInfo>,
    pub session_name: String,
    /// Microseconds since server start; zero when no session exists.
    pub session_start_time_us: u64,
}

#[derive(Debug, Default)]
struct SessionState {
    con_info: Option<ConnectionInfo>,
    /// Reset counter at the last `device_reset_occurred` or `reset_device`.
    reset_seen: u32,
}

/// High-level client for a TAS server.
///
/// One client owns one connection and can be bound to at most one target.
/// Memory access goes through [`Client::rw`], channel messaging through
/// [`Client::chl`].
pub struct Client {
    conn: Connection,
    session: Mutex<SessionState>,
    pub(crate) channels: tokio::sync::Mutex<ChannelTable>,
    closed: AtomicBool,
}

impl Client {
    /// Connects to the server described by `config`.
    pub async fn connect(config: ConnectionConfig) -> Result<Self, ClientError> {
        let conn = Connection::connect(config).await?;
        Ok(Self::from_connection(conn))
    }

    /// Connects to `endpoint` (`host[:port]`) with default settings.
    pub async fn connect_to(endpoint: &str) -> Result<Self, ClientError> {
        let endpoint: Endpoint = endpoint.parse()?;
        Self::connect(ConnectionConfig::new(endpoint)).await
    }

    /// Runs the client over an already established stream.
    pub async fn with_stream(
        config: ConnectionConfig,
        stream: ClientStream,
    ) -> Result<Self, ClientError> {
        let conn = Connection::with_stream(config, stream).await?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        tracing::info!(
            "Connected to {} {}",
            conn.server_info().server_name,
            conn.server_info().version_string()
        );
        Self {
            conn,
            session: Mutex::new(SessionState::default()),
            channels: tokio::sync::Mutex::new(ChannelTable::default()),
            closed: AtomicBool::new(false),
        }
    }

    /// Returns whether the connection is still usable.
    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    pub fn server_info(&self) -> &ServerInfo {
        self.conn.server_info()
    }

    // =========================================================================
    // Helper methods
    // =========================================================================

    pub(crate) async fn call(&self, op: Operation, params: Value) -> Result<Value, ClientError> {
        into_result(self.conn.request(op, params).await?)
    }

    pub(crate) async fn call_within(
        &self,
        op: Operation,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, ClientError> {
        into_result(self.conn.request_within(op, params, timeout).await?)
    }

    pub(crate) fn link_timeout(&self) -> Duration {
        self.conn.config().request_timeout
    }

    pub(crate) fn reset_count(&self) -> u32 {
        self.conn.reset_count()
    }

    /// Connection information of the bound target.
    pub(crate) fn bound_info(&self) -> Result<ConnectionInfo, ClientError> {
        self.session
            .lock()
            .con_info
            .clone()
            .ok_or_else(|| ClientError::usage("no session bound"))
    }

    // =========================================================================
    // Targets and sessions
    // =========================================================================

    /// Lists the targets reachable through the server.
    pub async fn list_targets(&self) -> Result<Vec<TargetInfo>, ClientError> {
        let result = self.call(Operation::GetTargets, json!({})).await?;
        let result: GetTargetsResult = serde_json::from_value(result)?;
        Ok(result.targets)
    }

    /// Binds this client to `target` under `session_name`.
    pub async fn bind_session(
        &self,
        target: &str,
        session_name: &str,
    ) -> Result<ConnectionInfo, ClientError> {
        self.bind_session_with_password(target, session_name, "")
            .await
    }

    /// Binds this client to `target`. The first client of a target sets the
    /// session name and password; later clients must present the same.
    pub async fn bind_session_with_password(
        &self,
        target: &str,
        session_name: &str,
        session_pw: &str,
    ) -> Result<ConnectionInfo, ClientError> {
        if self.session.lock().con_info.is_some() {
            return Err(ClientError::usage("session already bound"));
        }

        let params = SessionStartParams {
            identifier: target.to_string(),
            session_name: session_name.to_string(),
            session_pw: session_pw.to_string(),
        };
        let result = match self
            .call(Operation::SessionStart, serde_json::to_value(params)?)
            .await
        {
            Err(ClientError::ServerError {
                code: ErrorCode::TargetNotFound,
                ..
            }) => return Err(ClientError::TargetNotFound(target.to_string())),
            other => other?,
        };
        let info = ConnectionInfo::from(serde_json::from_value::<ConInfo>(result)?);

        tracing::info!(
            "Bound to target {} ({}) in session '{}'",
            info.identifier,
            info.device_id_hash_str,
            session_name
        );
        let mut session = self.session.lock();
        session.reset_seen = info.reset_count;
        session.con_info = Some(info.clone());
        Ok(info)
    }

    /// Connection information of the bound target.
    pub fn connection_info(&self) -> Result<ConnectionInfo, ClientError> {
        self.bound_info()
    }

    /// Checks the target is still reachable and refreshes the connection
    /// information.
    pub async fn target_ping(&self) -> Result<ConnectionInfo, ClientError> {
        self.bound_info()?;
        let result = self.call(Operation::Ping, json!({})).await?;
        let info = ConnectionInfo::from(serde_json::from_value::<ConInfo>(result)?);
        self.session.lock().con_info = Some(info.clone());
        Ok(info)
    }

    /// Clients attached to `target` and the session they share.
    pub async fn get_target_clients(&self, target: &str) -> Result<TargetClients, ClientError> {
        let params = GetTargetClientsParams {
            identifier: target.to_string(),
        };
        let result = match self
            .call(Operation::GetTargetClients, serde_json::to_value(params)?)
            .await
        {
            Err(ClientError::ServerError {
                code: ErrorCode::TargetNotFound,
                ..
            }) => return Err(ClientError::TargetNotFound(target.to_string())),
            other => other?,
        };
        let result: GetTargetClientsResult = serde_json::from_value(result)?;
        Ok(TargetClients {
            clients: result.clients,
            session_name: result.session_name,
            session_start_time_us: result.session_start_time_us,
        })
    }

    /// Resets and/or halts the bound device. Channel subscriptions released
    /// by the reset are dropped on the next channel operation.
    pub async fn reset_device(&self, mode: ResetMode) -> Result<(), ClientError> {
        self.bound_info()?;
        let params = DeviceConnectParams { mode };
        let result = self
            .call(Operation::DeviceConnect, serde_json::to_value(params)?)
            .await?;
        let result: DeviceConnectResult = serde_json::from_value(result)?;

        tracing::info!(
            "Device connect {:?}: reset_count={} halted={}",
            mode,
            result.reset_count,
            result.halted
        );
        let mut session = self.session.lock();
        session.reset_seen = result.reset_count;
        if let Some(info) = session.con_info.as_mut() {
            info.reset_count = result.reset_count;
        }
        Ok(())
    }

    /// Returns true when the device was reset since the previous call or
    /// the last [`Client::reset_device`].
    pub async fn device_reset_occurred(&self) -> Result<bool, ClientError> {
        let info = self.target_ping().await?;
        let mut session = self.session.lock();
        let occurred = info.reset_count != session.reset_seen;
        session.reset_seen = info.reset_count;
        Ok(occurred)
    }

    // =========================================================================
    // Subsystems
    // =========================================================================

    /// Memory access on the bound target.
    pub fn rw(&self) -> Rw<'_> {
        Rw::new(self)
    }

    /// Channel messaging on the bound target.
    pub fn chl(&self) -> Channels<'_> {
        Channels::new(self)
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Releases all channels and closes the connection. Further calls are
    /// no-ops.
    pub async fn close(&self) -> Result<(), ClientError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let subs = self.channels.lock().await.drain();
        if self.conn.is_connected() {
            for sub in subs {
                let params = json!({ "chl": sub.chl });
                if let Err(e) = self.call(Operation::ChlUnsubscribe, params).await {
                    tracing::debug!("Releasing channel {} failed: {}", sub.chl, e);
                }
            }
            if let Err(e) = self.call(Operation::Bye, json!({})).await {
                tracing::debug!("BYE failed: {}", e);
            }
        }

        self.session.lock().con_info = None;
        self.conn.close().await?;
        tracing::info!("Client closed");
        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            tracing::debug!("Client dropped without close; dropping transport");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::rw::{RwOp, RwTransaction};
    use std::sync::Arc;
    use tas_protocol::{ChannelDirection, ChannelMode};
    use tas_server::{Config, Server};
    use tokio::time::Instant;

    /// Target with byte-granular access.
    const BYTE_TARGET: &str = "sim-tc3x-0";
    /// Target requiring 32-bit accesses.
    const WORD_TARGET: &str = "sim-tc3x-1";
    const RAM: u64 = 0x7000_0000;
    const PROTECTED: u64 = 0x7000_F000;

    fn sim_server() -> Arc<Server> {
        Arc::new(Server::from_config(&Config::default()))
    }

    async fn connect(server: &Arc<Server>) -> Client {
        let stream = server.connect_in_memory();
        let config = ConnectionConfig::default().with_client_name("test");
        Client::with_stream(config, stream.into()).await.unwrap()
    }

    async fn bound(server: &Arc<Server>, target: &str) -> Client {
        let client = connect(server).await;
        client.bind_session(target, "test").await.unwrap();
        client
    }

    // =========================================================================
    // Session manager
    // =========================================================================

    #[tokio::test]
    async fn test_list_targets() {
        let server = sim_server();
        let client = connect(&server).await;

        let targets = client.list_targets().await.unwrap();
        let ids: Vec<&str> = targets.iter().map(|t| t.identifier.as_str()).collect();
        assert_eq!(ids, vec![BYTE_TARGET, WORD_TARGET]);
        assert!(client.server_info().supports_protocol(1));
    }

    #[tokio::test]
    async fn test_bind_session() {
        let server = sim_server();
        let client = connect(&server).await;

        let err = client.connection_info().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Usage);

        let info = client.bind_session(BYTE_TARGET, "lab").await.unwrap();
        assert_eq!(info.identifier, BYTE_TARGET);
        assert_eq!(info.access_width, 1);
        assert_eq!(info.device_id_hash_str, hash_to_str(info.device_id_hash));
        assert_eq!(client.connection_info().unwrap(), info);

        let again = client.bind_session(WORD_TARGET, "lab").await;
        assert_eq!(ErrorKind::of(&again), ErrorKind::Usage);
    }

    #[tokio::test]
    async fn test_bind_unknown_target() {
        let server = sim_server();
        let client = connect(&server).await;

        let result = client.bind_session("no-such-target", "lab").await;
        assert_eq!(ErrorKind::of(&result), ErrorKind::TargetNotFound);
        assert!(client.connection_info().is_err());
    }

    #[tokio::test]
    async fn test_session_name_and_password_must_match() {
        let server = sim_server();
        let first = connect(&server).await;
        first
            .bind_session_with_password(BYTE_TARGET, "lab", "secret")
            .await
            .unwrap();

        let wrong_pw = connect(&server).await;
        let result = wrong_pw
            .bind_session_with_password(BYTE_TARGET, "lab", "guess")
            .await;
        assert_eq!(ErrorKind::of(&result), ErrorKind::Usage);

        let wrong_name = connect(&server).await;
        let result = wrong_name
            .bind_session_with_password(BYTE_TARGET, "other", "secret")
            .await;
        assert_eq!(ErrorKind::of(&result), ErrorKind::Usage);

        let ok = connect(&server).await;
        ok.bind_session_with_password(BYTE_TARGET, "lab", "secret")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_get_target_clients() {
        let server = sim_server();
        let a = bound(&server, BYTE_TARGET).await;
        let _b = bound(&server, BYTE_TARGET).await;

        let clients = a.get_target_clients(BYTE_TARGET).await.unwrap();
        assert_eq!(clients.session_name, "test");
        assert_eq!(clients.clients.len(), 2);
        assert!(clients.clients.iter().all(|c| c.client_name == "test"));

        let empty = a.get_target_clients(WORD_TARGET).await.unwrap();
        assert!(empty.clients.is_empty());
        assert_eq!(empty.session_start_time_us, 0);

        let missing = a.get_target_clients("nope").await;
        assert_eq!(ErrorKind::of(&missing), ErrorKind::TargetNotFound);
    }

    #[tokio::test]
    async fn test_reset_detection() {
        let server = sim_server();
        let a = bound(&server, BYTE_TARGET).await;
        let b = bound(&server, BYTE_TARGET).await;

        assert!(!a.device_reset_occurred().await.unwrap());
        b.reset_device(ResetMode::Reset).await.unwrap();
        assert!(!b.device_reset_occurred().await.unwrap());

        assert!(a.device_reset_occurred().await.unwrap());
        assert!(!a.device_reset_occurred().await.unwrap());

        b.reset_device(ResetMode::HotAttach).await.unwrap();
        assert!(!a.device_reset_occurred().await.unwrap());
    }

    #[tokio::test]
    async fn test_reset_requires_session() {
        let server = sim_server();
        let client = connect(&server).await;
        let result = client.reset_device(ResetMode::ResetAndHalt).await;
        assert_eq!(ErrorKind::of(&result), ErrorKind::Usage);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let server = sim_server();
        let client = bound(&server, BYTE_TARGET).await;
        client
            .chl()
            .subscribe(1, ChannelDirection::Bidirectional, ChannelMode::Default)
            .await
            .unwrap();

        tokio_test::assert_ok!(client.close().await);
        tokio_test::assert_ok!(client.close().await);
        assert!(!client.is_connected());

        let result = client.list_targets().await;
        assert_eq!(ErrorKind::of(&result), ErrorKind::ServerConnection);
        assert_eq!(ErrorKind::of(&client.chl().unsubscribe().await), ErrorKind::None);

        let observer = connect(&server).await;
        let clients = observer.get_target_clients(BYTE_TARGET).await.unwrap();
        assert!(clients.clients.is_empty());
    }

    #[tokio::test]
    async fn test_calls_fail_after_server_disconnect() {
        let server = sim_server();
        let client = bound(&server, BYTE_TARGET).await;
        server.shutdown();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let result = client.rw().read32(RAM).await;
        assert_eq!(ErrorKind::of(&result), ErrorKind::ServerConnection);
        let result = client.rw().read32(RAM).await;
        assert_eq!(ErrorKind::of(&result), ErrorKind::ServerConnection);
        client.close().await.unwrap();
    }

    // =========================================================================
    // Transaction engine
    // =========================================================================

    #[tokio::test]
    async fn test_rw_requires_session() {
        let server = sim_server();
        let client = connect(&server).await;
        let result = client.rw().read32(RAM).await;
        assert_eq!(ErrorKind::of(&result), ErrorKind::Usage);
    }

    #[tokio::test]
    async fn test_alignment_round_trip() {
        let server = sim_server();
        for target in [BYTE_TARGET, WORD_TARGET] {
            let client = bound(&server, target).await;
            let rw = client.rw();
            for offset in 0..8u64 {
                let addr = RAM + 0x100 + offset;
                rw.write8(addr, 0xA5).await.unwrap();
                assert_eq!(rw.read8(addr).await.unwrap(), 0xA5);
                rw.write16(addr, 0xBEEF).await.unwrap();
                assert_eq!(rw.read16(addr).await.unwrap(), 0xBEEF);
                rw.write32(addr, 0xDEAD_BEEF).await.unwrap();
                assert_eq!(rw.read32(addr).await.unwrap(), 0xDEAD_BEEF);
                rw.write64(addr, 0x0123_4567_89AB_CDEF).await.unwrap();
                assert_eq!(rw.read64(addr).await.unwrap(), 0x0123_4567_89AB_CDEF);
            }
            client.close().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_write_containment() {
        let server = sim_server();
        for target in [BYTE_TARGET, WORD_TARGET] {
            let client = bound(&server, target).await;
            let rw = client.rw();
            let base = RAM + 0x200;
            for k in 0..4u64 {
                rw.write(base, &[0u8; 16]).await.unwrap();
                rw.write16(base + k, 0xEB33).await.unwrap();
                rw.write16(base + k + 2, 0xEB33).await.unwrap();

                let mem = rw.read(base, 16).await.unwrap();
                let k = k as usize;
                assert_eq!(&mem[k..k + 4], &[0x33, 0xEB, 0x33, 0xEB]);
                assert!(mem[..k].iter().all(|&b| b == 0), "{:?}", mem);
                assert!(mem[k + 4..].iter().all(|&b| b == 0), "{:?}", mem);
            }
        }
    }

    #[tokio::test]
    async fn test_fill32() {
        let server = sim_server();
        let client = bound(&server, BYTE_TARGET).await;
        let rw = client.rw();
        let addr = RAM + 0x304;

        rw.write(addr - 4, &[0x11; 16]).await.unwrap();
        rw.fill32(addr, 0xBEBA_CAFE, 8).await.unwrap();

        let mem = rw.read(addr - 4, 16).await.unwrap();
        assert_eq!(&mem[..4], &[0x11; 4]);
        assert_eq!(&mem[4..12], &[0xFE, 0xCA, 0xBA, 0xBE, 0xFE, 0xCA, 0xBA, 0xBE]);
        assert_eq!(&mem[12..], &[0x11; 4]);

        let bad = rw.fill32(addr, 0, 6).await;
        assert_eq!(ErrorKind::of(&bad), ErrorKind::Usage);
        let bad = rw.fill32(addr + 1, 0, 8).await;
        assert_eq!(ErrorKind::of(&bad), ErrorKind::Usage);
    }

    #[tokio::test]
    async fn test_fill64() {
        let server = sim_server();
        let client = bound(&server, WORD_TARGET).await;
        let rw = client.rw();

        rw.fill64(RAM + 0x400, 0x0102_0304_0506_0708, 32).await.unwrap();
        assert_eq!(rw.read64(RAM + 0x418).await.unwrap(), 0x0102_0304_0506_0708);
        assert_eq!(rw.read32(RAM + 0x420).await.unwrap(), 0);

        let bad = rw.fill64(RAM + 0x404, 0, 8).await;
        assert_eq!(ErrorKind::of(&bad), ErrorKind::Usage);
    }

    #[tokio::test]
    async fn test_large_unaligned_transfer() {
        let server = sim_server();
        let client = bound(&server, BYTE_TARGET).await;
        let rw = client.rw();

        let data: Vec<u8> = (0..6000u32).map(|i| (i % 251) as u8).collect();
        rw.write(RAM + 0x1001, &data).await.unwrap();
        assert_eq!(rw.read(RAM + 0x1001, 6000).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_device_faults() {
        let server = sim_server();
        let client = bound(&server, BYTE_TARGET).await;
        let rw = client.rw();

        let err = rw.read32(PROTECTED).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Device);
        assert_eq!(err.code(), Some(ErrorCode::AddrBlocked));

        let err = rw.read32(0x10).await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::BusError));

        let err = client.rw().with_addr_map(5).read32(RAM).await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::AddrMap));

        let zero = rw.read(RAM, 0).await;
        assert_eq!(ErrorKind::of(&zero), ErrorKind::Usage);
    }

    #[tokio::test]
    async fn test_access_at_top_of_address_space() {
        let server = sim_server();
        let byte = bound(&server, BYTE_TARGET).await;
        let word = bound(&server, WORD_TARGET).await;

        for client in [&byte, &word] {
            let rw = client.rw();
            let err = rw.write8(u64::MAX, 0xAA).await.unwrap_err();
            assert_eq!(err.code(), Some(ErrorCode::BusError));
            let err = rw.write16(u64::MAX - 1, 0xBEEF).await.unwrap_err();
            assert_eq!(err.code(), Some(ErrorCode::BusError));
            let err = rw.read8(u64::MAX).await.unwrap_err();
            assert_eq!(err.code(), Some(ErrorCode::BusError));
            let err = rw.fill32(u64::MAX - 7, 0xBEBA_CAFE, 8).await.unwrap_err();
            assert_eq!(err.code(), Some(ErrorCode::BusError));
            let err = rw.fill64(u64::MAX - 7, 1, 8).await.unwrap_err();
            assert_eq!(err.code(), Some(ErrorCode::BusError));
        }

        let past_end = byte.rw().write16(u64::MAX, 0).await;
        assert_eq!(ErrorKind::of(&past_end), ErrorKind::Usage);
    }

    #[tokio::test]
    async fn test_unaligned_read_stays_inside_range() {
        let server = sim_server();
        let client = bound(&server, BYTE_TARGET).await;
        let rw = client.rw();

        // The byte before a protected window is readable on its own.
        rw.write8(PROTECTED - 1, 0x5A).await.unwrap();
        assert_eq!(rw.read8(PROTECTED - 1).await.unwrap(), 0x5A);
        rw.write32(PROTECTED - 5, 0x1122_3344).await.unwrap();
        assert_eq!(rw.read32(PROTECTED - 5).await.unwrap(), 0x1122_3344);
    }

    #[tokio::test]
    async fn test_batch_ordering_and_visibility() {
        let server = sim_server();
        let client = bound(&server, BYTE_TARGET).await;
        let addr = RAM + 0x500;

        let mut batch = vec![
            RwTransaction::write(addr, vec![1, 2, 3, 4, 5, 6, 7, 8]),
            RwTransaction::read(addr + 1, 6),
            RwTransaction::fill32(addr, 0xBEBA_CAFE, 8),
            RwTransaction::read(addr, 8),
        ];
        client.rw().execute_trans(&mut batch).await.unwrap();

        assert!(batch.iter().all(|t| t.outcome.map(|o| o.is_ok()) == Some(true)));
        assert_eq!(batch[1].data, vec![2, 3, 4, 5, 6, 7]);
        assert_eq!(batch[1].outcome.unwrap().num_bytes_ok, 6);
        assert_eq!(batch[2].op, RwOp::Fill32(0xBEBA_CAFE));
        assert_eq!(batch[2].data, vec![0xFE, 0xCA, 0xBA, 0xBE, 0xFE, 0xCA, 0xBA, 0xBE]);
        assert_eq!(batch[3].data, batch[2].data);
    }

    #[tokio::test]
    async fn test_batch_stops_at_first_fault() {
        let server = sim_server();
        let client = bound(&server, BYTE_TARGET).await;
        let addr = RAM + 0x600;

        let mut batch = vec![
            RwTransaction::write(addr, vec![9; 4]),
            RwTransaction::read(PROTECTED, 4),
            RwTransaction::write(addr, vec![7; 4]),
        ];
        client.rw().execute_trans(&mut batch).await.unwrap();

        assert!(batch[0].outcome.unwrap().is_ok());
        let fault = batch[1].outcome.unwrap().fault.unwrap();
        assert_eq!(fault.code, ErrorCode::AddrBlocked);
        assert_eq!(fault.addr, PROTECTED);
        let later = batch[2].outcome.unwrap().fault.unwrap();
        assert_eq!(later.code, ErrorCode::Consequential);

        assert_eq!(client.rw().read(addr, 4).await.unwrap(), vec![9; 4]);
    }

    #[tokio::test]
    async fn test_batch_validation() {
        let server = sim_server();
        let client = bound(&server, WORD_TARGET).await;
        let rw = client.rw();

        rw.execute_trans(&mut []).await.unwrap();

        let mut zero = vec![RwTransaction::read(RAM, 0)];
        assert_eq!(ErrorKind::of(&rw.execute_trans(&mut zero).await), ErrorKind::Usage);

        let mut unaligned = vec![RwTransaction::write(RAM + 1, vec![1, 2])];
        assert_eq!(
            ErrorKind::of(&rw.execute_trans(&mut unaligned).await),
            ErrorKind::Usage
        );
        assert!(unaligned[0].outcome.is_none());

        let mut too_many: Vec<_> = (0..1000)
            .map(|i| RwTransaction::read(RAM + i * 4, 4))
            .collect();
        assert_eq!(
            ErrorKind::of(&rw.execute_trans(&mut too_many).await),
            ErrorKind::Usage
        );
    }

    // =========================================================================
    // Channels
    // =========================================================================

    #[tokio::test]
    async fn test_channel_round_trip() {
        let server = sim_server();
        let tx = bound(&server, BYTE_TARGET).await;
        let rx = bound(&server, BYTE_TARGET).await;

        rx.chl()
            .subscribe(2, ChannelDirection::Receive, ChannelMode::Default)
            .await
            .unwrap();
        let sub = tx
            .chl()
            .subscribe(2, ChannelDirection::Send, ChannelMode::Default)
            .await
            .unwrap();
        assert!(sub.prio <= tas_protocol::CHL_LOWEST_PRIORITY);

        tx.chl().send_string("hello").await.unwrap();
        let (text, first) = rx.chl().rcv_string(1000).await.unwrap();
        assert_eq!(text, "hello");
        assert!(first);

        tx.chl().send_msg(&[1, 2, 0]).await.unwrap();
        let msg = rx.chl().rcv_msg(1000).await.unwrap();
        assert_eq!(msg.data, vec![1, 2, 0]);
    }

    #[tokio::test]
    async fn test_long_message_is_fragmented() {
        let server = sim_server();
        let tx = bound(&server, BYTE_TARGET).await;
        let rx = bound(&server, BYTE_TARGET).await;
        let limit = rx.connection_info().unwrap().msg_length_d2c as usize;

        rx.chl()
            .subscribe(4, ChannelDirection::Receive, ChannelMode::Default)
            .await
            .unwrap();
        tx.chl()
            .subscribe(4, ChannelDirection::Send, ChannelMode::Default)
            .await
            .unwrap();

        let payload: Vec<u8> = (0..(limit + 10)).map(|i| i as u8).collect();
        tx.chl().send_msg(&payload).await.unwrap();

        let first = rx.chl().rcv_msg(1000).await.unwrap();
        let second = rx.chl().rcv_msg(1000).await.unwrap();
        assert!(first.is_first_fragment);
        assert!(!second.is_first_fragment);
        assert_eq!([first.data, second.data].concat(), payload);
    }

    #[tokio::test]
    async fn test_channel_direction_enforced() {
        let server = sim_server();
        let client = bound(&server, BYTE_TARGET).await;
        let chl = client.chl();

        chl.subscribe(3, ChannelDirection::Receive, ChannelMode::Default)
            .await
            .unwrap();
        assert_eq!(ErrorKind::of(&chl.send_string("x").await), ErrorKind::Usage);

        chl.subscribe(5, ChannelDirection::Send, ChannelMode::Default)
            .await
            .unwrap();
        assert_eq!(ErrorKind::of(&chl.rcv_msg(10).await), ErrorKind::Usage);
        assert_eq!(ErrorKind::of(&chl.rcv_msg_on(3, 10).await), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_bidirectional_sends_and_receives() {
        let server = sim_server();
        let client = bound(&server, BYTE_TARGET).await;
        let chl = client.chl();

        chl.subscribe(4, ChannelDirection::Bidirectional, ChannelMode::Default)
            .await
            .unwrap();
        chl.send_string("loop").await.unwrap();
        let (text, first) = chl.rcv_string(1000).await.unwrap();
        assert_eq!(text, "loop");
        assert!(first);
    }

    #[tokio::test]
    async fn test_subscribe_errors() {
        let server = sim_server();
        let a = bound(&server, BYTE_TARGET).await;
        let b = bound(&server, BYTE_TARGET).await;

        let out_of_range = a
            .chl()
            .subscribe(32, ChannelDirection::Send, ChannelMode::Default)
            .await;
        assert_eq!(ErrorKind::of(&out_of_range), ErrorKind::Usage);

        a.chl()
            .subscribe(6, ChannelDirection::Bidirectional, ChannelMode::Exclusive)
            .await
            .unwrap();
        let twice = a
            .chl()
            .subscribe(6, ChannelDirection::Send, ChannelMode::Default)
            .await;
        assert_eq!(ErrorKind::of(&twice), ErrorKind::Usage);

        let taken = b
            .chl()
            .subscribe(6, ChannelDirection::Receive, ChannelMode::Default)
            .await;
        assert_eq!(ErrorKind::of(&taken), ErrorKind::Usage);

        let unbound = connect(&server).await;
        let result = unbound
            .chl()
            .subscribe(1, ChannelDirection::Send, ChannelMode::Default)
            .await;
        assert_eq!(ErrorKind::of(&result), ErrorKind::Usage);
    }

    #[tokio::test]
    async fn test_receive_timeout() {
        let server = sim_server();
        let client = bound(&server, BYTE_TARGET).await;
        client
            .chl()
            .subscribe(7, ChannelDirection::Receive, ChannelMode::Default)
            .await
            .unwrap();

        let start = Instant::now();
        let result = client.chl().rcv_msg(200).await;
        let elapsed = start.elapsed();

        assert!(matches!(
            result,
            Err(ClientError::ReceiveTimeout {
                chl: 7,
                timeout_ms: 200
            })
        ));
        assert!(elapsed >= Duration::from_millis(200), "{:?}", elapsed);
        assert!(elapsed < Duration::from_secs(2), "{:?}", elapsed);
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_unsubscribe_twice() {
        let server = sim_server();
        let client = bound(&server, BYTE_TARGET).await;
        let chl = client.chl();

        assert_eq!(ErrorKind::of(&chl.unsubscribe().await), ErrorKind::None);
        chl.subscribe(8, ChannelDirection::Send, ChannelMode::Default)
            .await
            .unwrap();
        chl.subscribe(9, ChannelDirection::Send, ChannelMode::Default)
            .await
            .unwrap();

        chl.unsubscribe().await.unwrap();
        assert_eq!(chl.current().await.map(|s| s.chl), Some(8));
        chl.unsubscribe_channel(9).await.unwrap();
        chl.unsubscribe().await.unwrap();
        chl.unsubscribe().await.unwrap();
        assert!(chl.subscriptions().await.is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_after_link_loss_forgets_channel() {
        let server = sim_server();
        let client = bound(&server, BYTE_TARGET).await;
        client
            .chl()
            .subscribe(13, ChannelDirection::Send, ChannelMode::Default)
            .await
            .unwrap();

        server.shutdown();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let result = client.chl().unsubscribe_channel(13).await;
        assert_eq!(ErrorKind::of(&result), ErrorKind::ServerConnection);
        assert!(client.chl().subscriptions().await.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_client_releases_channels() {
        let server = sim_server();
        let first = bound(&server, BYTE_TARGET).await;
        first
            .chl()
            .subscribe(12, ChannelDirection::Bidirectional, ChannelMode::Exclusive)
            .await
            .unwrap();

        let second = bound(&server, BYTE_TARGET).await;
        let held = second
            .chl()
            .subscribe(12, ChannelDirection::Receive, ChannelMode::Exclusive)
            .await;
        assert_eq!(ErrorKind::of(&held), ErrorKind::Usage);

        drop(first);

        // The server detaches the client once it sees the pipe close.
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let result = second
                .chl()
                .subscribe(12, ChannelDirection::Receive, ChannelMode::Exclusive)
                .await;
            if result.is_ok() {
                break;
            }
            assert!(Instant::now() < deadline, "channel still held: {:?}", result);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let clients = second.get_target_clients(BYTE_TARGET).await.unwrap();
        assert_eq!(clients.clients.len(), 1);
    }

    #[tokio::test]
    async fn test_reset_releases_channels() {
        let server = sim_server();
        let a = bound(&server, BYTE_TARGET).await;
        let b = bound(&server, BYTE_TARGET).await;

        a.chl()
            .subscribe(10, ChannelDirection::Bidirectional, ChannelMode::Default)
            .await
            .unwrap();
        b.reset_device(ResetMode::Reset).await.unwrap();

        a.target_ping().await.unwrap();
        let result = a.chl().send_string("after reset").await;
        assert_eq!(ErrorKind::of(&result), ErrorKind::Usage);
        assert!(a.chl().subscriptions().await.is_empty());

        a.chl()
            .subscribe(10, ChannelDirection::Bidirectional, ChannelMode::Default)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_oversize_send_rejected() {
        let server = sim_server();
        let client = bound(&server, BYTE_TARGET).await;
        let limit = client.connection_info().unwrap().msg_length_c2d as usize;
        client
            .chl()
            .subscribe(11, ChannelDirection::Send, ChannelMode::Default)
            .await
            .unwrap();

        let result = client.chl().send_msg(&vec![0u8; limit + 1]).await;
        assert_eq!(ErrorKind::of(&result), ErrorKind::Usage);
        let result = client.chl().send_msg(&[]).await;
        assert_eq!(ErrorKind::of(&result), ErrorKind::Usage);
    }
}
