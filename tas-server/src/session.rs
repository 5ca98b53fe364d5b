//! Session management.

use crate::target::{Target, TrafficStats};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tas_protocol::message::HelloParams;
use tas_protocol::ClientType;
use uuid::Uuid;

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Initial state, waiting for HELLO.
    Connected,
    /// Handshake complete, ready for commands.
    Ready,
    /// Session is closing.
    Closing,
}

/// Identity the client announced in HELLO.
#[derive(Debug, Clone, Default)]
pub struct ClientIdentity {
    pub client_name: String,
    pub user_name: String,
    pub client_pid: u32,
    pub client_type: ClientType,
}

impl From<HelloParams> for ClientIdentity {
    fn from(hello: HelloParams) -> Self {
        Self {
            client_name: hello.client_name,
            user_name: hello.user_name,
            client_pid: hello.client_pid,
            client_type: hello.client_type,
        }
    }
}

/// A client session.
pub struct Session {
    /// Unique session ID.
    pub id: String,

    /// Peer description used in logs.
    pub peer: String,

    state: SessionState,

    protocol_version: u16,

    identity: ClientIdentity,

    /// Microseconds since server start at connect time.
    connect_time_us: u64,

    /// Target this session is bound to.
    bound: Option<Arc<Target>>,

    /// Byte counters shared with the target's client registry.
    traffic: Arc<TrafficStats>,

    request_count: AtomicU64,

    created_at: Instant,

    last_activity: parking_lot::Mutex<Instant>,
}

impl Session {
    /// Creates a new session.
    pub fn new(peer: impl Into<String>, connect_time_us: u64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            peer: peer.into(),
            state: SessionState::Connected,
            protocol_version: 0,
            identity: ClientIdentity::default(),
            connect_time_us,
            bound: None,
            traffic: Arc::new(TrafficStats::default()),
            request_count: AtomicU64::new(0),
            created_at: Instant::now(),
            last_activity: parking_lot::Mutex::new(Instant::now()),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }

    pub fn protocol_version(&self) -> u16 {
        self.protocol_version
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    pub fn connect_time_us(&self) -> u64 {
        self.connect_time_us
    }

    /// Completes the handshake.
    pub fn complete_handshake(&mut self, protocol_version: u16, identity: ClientIdentity) {
        self.protocol_version = protocol_version;
        self.identity = identity;
        self.state = SessionState::Ready;
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    /// Returns the bound target, if any.
    pub fn target(&self) -> Option<&Arc<Target>> {
        self.bound.as_ref()
    }

    pub fn bind(&mut self, target: Arc<Target>) {
        self.bound = Some(target);
    }

    /// Detaches from the bound target, releasing its channels.
    pub fn unbind(&mut self) -> Option<Arc<Target>> {
        let target = self.bound.take()?;
        target.detach(&self.id);
        Some(target)
    }

    pub fn traffic(&self) -> &Arc<TrafficStats> {
        &self.traffic
    }

    /// Records a request.
    pub fn record_request(&self) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        *self.last_activity.lock() = Instant::now();
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    /// Returns the time since last activity.
    pub fn idle_duration(&self) -> std::time::Duration {
        self.last_activity.lock().elapsed()
    }

    /// Returns the session age.
    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_creation() {
        let session = Session::new("127.0.0.1:12345", 42);
        assert_eq!(session.state(), SessionState::Connected);
        assert!(!session.is_ready());
        assert!(session.target().is_none());
        assert_eq!(session.connect_time_us(), 42);
    }

    #[test]
    fn test_session_handshake() {
        let mut session = Session::new("in-memory", 0);
        session.complete_handshake(
            1,
            ClientIdentity {
                client_name: "probe".to_string(),
                client_type: ClientType::Rw,
                ..Default::default()
            },
        );

        assert!(session.is_ready());
        assert_eq!(session.protocol_version(), 1);
        assert_eq!(session.identity().client_name, "probe");
    }

    #[test]
    fn test_record_request() {
        let session = Session::new("in-memory", 0);
        session.record_request();
        session.record_request();
        assert_eq!(session.request_count(), 2);
        assert!(session.idle_duration() <= session.age());
    }

    #[test]
    fn test_unbind_without_target() {
        let mut session = Session::new("in-memory", 0);
        assert!(session.unbind().is_none());
    }
}
