//! Connection management.
//!
//! A [`Connection`] is a strictly serialized request/response link: at most
//! one request is outstanding, enforced by the link mutex. There is no
//! background reader; the task that sends a request also reads its response.

use crate::error::ClientError;
use crate::stream::ClientStream;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tas_protocol::message::{HelloParams, HelloResult};
use tas_protocol::{
    ClientType, Decoder, Encoder, Operation, Request, Response, ServerInfo, DEFAULT_PORT,
    PROTOCOL_VERSION,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Default bound for one request/response round trip.
pub const DEFAULT_LINK_TIMEOUT: Duration = Duration::from_secs(10);

pub const MIN_LINK_TIMEOUT: Duration = Duration::from_millis(100);

pub const MAX_LINK_TIMEOUT: Duration = Duration::from_secs(100);

/// Host and port of a TAS server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new("localhost", DEFAULT_PORT)
    }
}

impl FromStr for Endpoint {
    type Err = ClientError;

    /// Accepts `host`, `host:port`, `[v6]`, `[v6]:port` and bare IPv6
    /// addresses. An empty string yields the default endpoint.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Self::default());
        }

        let parse_port = |p: &str| {
            p.parse::<u16>()
                .map_err(|_| ClientError::usage(format!("invalid port in endpoint '{}'", s)))
        };

        if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| ClientError::usage(format!("unterminated '[' in '{}'", s)))?;
            let port = match tail.strip_prefix(':') {
                Some(p) => parse_port(p)?,
                None if tail.is_empty() => DEFAULT_PORT,
                None => return Err(ClientError::usage(format!("invalid endpoint '{}'", s))),
            };
            return Ok(Self::new(host, port));
        }

        match s.matches(':').count() {
            0 => Ok(Self::new(s, DEFAULT_PORT)),
            1 => {
                let (host, port) = s.split_once(':').unwrap_or((s, ""));
                if host.is_empty() {
                    return Err(ClientError::usage(format!("missing host in '{}'", s)));
                }
                Ok(Self::new(host, parse_port(port)?))
            }
            _ => Ok(Self::new(s, DEFAULT_PORT)),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub endpoint: Endpoint,
    pub connect_timeout: Duration,
    /// Bound for one request/response round trip.
    pub request_timeout: Duration,
    /// Client name reported to the server.
    pub client_name: String,
    pub user_name: String,
    pub client_pid: u32,
    pub client_type: ClientType,
    /// Read buffer size for socket reads.
    pub read_buffer_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::new(Endpoint::default())
    }
}

impl ConnectionConfig {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            connect_timeout: Duration::from_secs(10),
            request_timeout: DEFAULT_LINK_TIMEOUT,
            client_name: env!("CARGO_PKG_NAME").to_string(),
            user_name: std::env::var("USER")
                .or_else(|_| std::env::var("USERNAME"))
                .unwrap_or_default(),
            client_pid: std::process::id(),
            client_type: ClientType::Mixed,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }

    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = name.into();
        self
    }

    pub fn with_user_name(mut self, name: impl Into<String>) -> Self {
        self.user_name = name.into();
        self
    }

    pub fn with_client_type(mut self, client_type: ClientType) -> Self {
        self.client_type = client_type;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the link timeout, clamped to 100 ms..=100 s.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout.clamp(MIN_LINK_TIMEOUT, MAX_LINK_TIMEOUT);
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }
}

struct Link {
    stream: ClientStream,
    decoder: Decoder,
    buf: Vec<u8>,
}

impl Link {
    fn new(stream: ClientStream, buffer_size: usize) -> Self {
        Self {
            stream,
            decoder: Decoder::new(),
            buf: vec![0u8; buffer_size],
        }
    }

    async fn exchange(&mut self, encoded: &[u8]) -> Result<Response, ClientError> {
        self.stream.write_all(encoded).await?;
        self.stream.flush().await?;

        loop {
            if let Some(response) = self.decoder.decode_response()? {
                return Ok(response);
            }
            let n = self.stream.read(&mut self.buf).await?;
            if n == 0 {
                tracing::debug!("Connection closed by server");
                return Err(ClientError::ConnectionClosed);
            }
            self.decoder.extend(&self.buf[..n]);
        }
    }
}

/// A connection to a TAS server.
pub struct Connection {
    config: ConnectionConfig,
    link: Mutex<Option<Link>>,
    next_id: AtomicU64,
    /// Set after a link failure; the connection cannot be reused.
    broken: AtomicBool,
    closing: watch::Sender<bool>,
    server_info: ServerInfo,
    /// Last device reset counter reported by the server.
    reset_count: AtomicU32,
}

impl Connection {
    /// Opens a TCP connection and performs the HELLO handshake.
    pub async fn connect(config: ConnectionConfig) -> Result<Self, ClientError> {
        tracing::debug!("Connecting to {}...", config.endpoint);

        let endpoint = config.endpoint.clone();
        let tcp_stream = tokio::time::timeout(
            config.connect_timeout,
            TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
        )
        .await
        .map_err(|_| {
            tracing::debug!("Connection timeout");
            ClientError::Timeout
        })?
        .map_err(|e| {
            tracing::debug!("Connection failed: {}", e);
            ClientError::Io(e)
        })?;

        tcp_stream.set_nodelay(true).ok();

        Self::with_stream(config, ClientStream::from(tcp_stream)).await
    }

    /// Performs the HELLO handshake over an already established stream.
    pub async fn with_stream(
        config: ConnectionConfig,
        stream: ClientStream,
    ) -> Result<Self, ClientError> {
        let (closing, _) = watch::channel(false);
        let link = Link::new(stream, config.read_buffer_size);
        let mut conn = Self {
            config,
            link: Mutex::new(Some(link)),
            next_id: AtomicU64::new(1),
            broken: AtomicBool::new(false),
            closing,
            server_info: ServerInfo::default(),
            reset_count: AtomicU32::new(0),
        };

        conn.server_info = conn.handshake().await?;
        tracing::debug!(
            "Handshake complete: {} {}",
            conn.server_info.server_name,
            conn.server_info.version_string()
        );
        Ok(conn)
    }

    async fn handshake(&self) -> Result<ServerInfo, ClientError> {
        let hello = HelloParams {
            protocol_version: PROTOCOL_VERSION,
            client_name: self.config.client_name.clone(),
            user_name: self.config.user_name.clone(),
            client_pid: self.config.client_pid,
            client_type: self.config.client_type,
        };

        let response = self
            .request(Operation::Hello, serde_json::to_value(hello)?)
            .await?;
        let value = into_result(response)?;
        let result: HelloResult = serde_json::from_value(value)?;

        if !result.server.supports_protocol(PROTOCOL_VERSION) {
            return Err(ClientError::VersionMismatch(PROTOCOL_VERSION));
        }
        Ok(result.server)
    }

    /// Sends a request and waits for its response within the link timeout.
    pub async fn request(
        &self,
        op: Operation,
        params: serde_json::Value,
    ) -> Result<Response, ClientError> {
        self.request_within(op, params, self.config.request_timeout)
            .await
    }

    /// Sends a request and waits up to `timeout` for its response.
    ///
    /// Any transport failure, timeout or uncorrelated response marks the
    /// connection broken and releases the stream.
    pub async fn request_within(
        &self,
        op: Operation,
        params: serde_json::Value,
        timeout: Duration,
    ) -> Result<Response, ClientError> {
        let mut closing = self.closing.subscribe();
        if *closing.borrow() {
            return Err(ClientError::ConnectionClosed);
        }
        if self.broken.load(Ordering::SeqCst) {
            return Err(ClientError::NotConnected);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        let request = Request::new(&id, op).with_params(params);
        let encoded = Encoder::encode_request(&request)?;

        let mut guard = self.link.lock().await;
        let link = match guard.as_mut() {
            Some(link) => link,
            None => return Err(ClientError::NotConnected),
        };

        tracing::debug!("Sending request id={} op={:?} ({} bytes)", id, op, encoded.len());

        let outcome = tokio::select! {
            result = tokio::time::timeout(timeout, link.exchange(&encoded)) => {
                result.unwrap_or(Err(ClientError::Timeout))
            }
            _ = closing.wait_for(|closed| *closed) => Err(ClientError::ConnectionClosed),
        };

        let outcome = outcome.and_then(|response| {
            if response.id == id {
                Ok(response)
            } else {
                Err(ClientError::UnexpectedResponse(format!(
                    "expected id {}, got {}",
                    id, response.id
                )))
            }
        });

        match outcome {
            Ok(response) => {
                if let Some(count) = response.meta.reset_count {
                    self.reset_count.store(count, Ordering::SeqCst);
                }
                tracing::debug!("Request id={} got response ok={}", id, response.is_ok());
                Ok(response)
            }
            Err(e) => {
                tracing::warn!("Request id={} op={:?} failed: {}", id, op, e);
                self.broken.store(true, Ordering::SeqCst);
                *guard = None;
                Err(e)
            }
        }
    }

    /// Returns whether the link is usable for further requests.
    pub fn is_connected(&self) -> bool {
        !self.broken.load(Ordering::SeqCst) && !*self.closing.borrow()
    }

    pub fn server_info(&self) -> &ServerInfo {
        &self.server_info
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Last device reset counter seen in a response.
    pub fn reset_count(&self) -> u32 {
        self.reset_count.load(Ordering::SeqCst)
    }

    /// Closes the connection. An outstanding request fails with
    /// [`ClientError::ConnectionClosed`]. Calling this more than once is
    /// harmless.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.closing.send_replace(true);

        let link = self.link.lock().await.take();
        if let Some(mut link) = link {
            tracing::debug!("Shutting down transport");
            let _ = link.stream.shutdown().await;
        }
        Ok(())
    }
}

/// Converts an error response into a [`ClientError`], returning the result
/// payload otherwise.
pub(crate) fn into_result(response: Response) -> Result<serde_json::Value, ClientError> {
    if let Some(err) = response.error {
        return Err(ClientError::ServerError {
            code: err.code,
            message: err.message,
            retryable: err.retryable,
        });
    }
    Ok(response.result.unwrap_or(serde_json::Value::Null))
}
