//! TCP server implementation.

use crate::config::{Config, NetworkConfig};
use crate::error::ServerError;
use crate::handler::CommandHandler;
use crate::session::{Session, SessionState};
use crate::target::TargetRegistry;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tas_protocol::{Decoder, Encoder, DEFAULT_PORT};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Buffer size of in-memory connections.
const IN_MEMORY_BUFFER: usize = 64 * 1024;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Idle connection timeout.
    pub idle_timeout: Duration,
    /// Maximum concurrent connections.
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            idle_timeout: Duration::from_secs(300),
            max_connections: 64,
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }
}

impl From<&NetworkConfig> for ServerConfig {
    fn from(network: &NetworkConfig) -> Self {
        Self {
            bind_addr: network.bind_addr,
            idle_timeout: network.idle_timeout(),
            max_connections: network.max_connections,
        }
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub requests_total: AtomicU64,
    pub errors_total: AtomicU64,
}

/// TAS server simulating the targets of its registry.
pub struct Server {
    config: ServerConfig,
    handler: Arc<CommandHandler>,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Server {
    /// Creates a new server.
    pub fn new(config: ServerConfig, handler: CommandHandler) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            handler: Arc::new(handler),
            stats: Arc::new(ServerStats::default()),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    /// Creates a server with the network settings and targets of `config`.
    pub fn from_config(config: &Config) -> Self {
        let registry = Arc::new(TargetRegistry::new(&config.targets));
        Self::new(
            ServerConfig::from(&config.network),
            CommandHandler::new(registry),
        )
    }

    pub fn handler(&self) -> &Arc<CommandHandler> {
        &self.handler
    }

    /// Binds the configured address and runs the server.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accepts connections on `listener` until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(
            "Server listening on {} ({} targets)",
            listener.local_addr()?,
            self.handler.registry().len()
        );

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((tcp_stream, addr)) => {
                            if self.stats.connections_active.load(Ordering::Relaxed)
                                >= self.config.max_connections as u64
                            {
                                tracing::warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }
                            if let Err(e) = tcp_stream.set_nodelay(true) {
                                tracing::debug!("[{}] set_nodelay failed: {}", addr, e);
                            }
                            self.spawn_connection(tcp_stream, addr.to_string());
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Server shutting down");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Opens a connection that never touches the network. Must be called
    /// inside a tokio runtime.
    pub fn connect_in_memory(&self) -> DuplexStream {
        let (client, server) = tokio::io::duplex(IN_MEMORY_BUFFER);
        self.spawn_connection(server, "in-memory".to_string());
        client
    }

    fn spawn_connection<S>(&self, stream: S, peer: String)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
        self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

        let handler = self.handler.clone();
        let stats = self.stats.clone();
        let config = self.config.clone();
        let mut conn_shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let result = Self::handle_connection(
                stream,
                &peer,
                handler,
                &stats,
                &config,
                &mut conn_shutdown,
            )
            .await;

            if let Err(e) = result {
                tracing::debug!("Connection {} error: {}", peer, e);
                stats.errors_total.fetch_add(1, Ordering::Relaxed);
            }

            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
            tracing::info!("Client disconnected: {}", peer);
        });
    }

    /// Handles a single connection. Whatever the session holds on its target
    /// is released when the connection ends.
    async fn handle_connection<S>(
        mut stream: S,
        peer: &str,
        handler: Arc<CommandHandler>,
        stats: &ServerStats,
        config: &ServerConfig,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), ServerError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        tracing::info!("Client connected: {}", peer);

        let mut session = Session::new(peer, handler.uptime_us());
        let result = Self::serve_session(
            &mut stream,
            &mut session,
            &handler,
            stats,
            config,
            shutdown,
        )
        .await;
        handler.disconnect(&mut session);
        result
    }

    async fn serve_session<S>(
        stream: &mut S,
        session: &mut Session,
        handler: &CommandHandler,
        stats: &ServerStats,
        config: &ServerConfig,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), ServerError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut decoder = Decoder::new();
        let mut buf = [0u8; 8192];

        loop {
            tokio::select! {
                result = stream.read(&mut buf) => {
                    match result {
                        Ok(0) => {
                            tracing::debug!("[{}] Connection closed by client", session.peer);
                            return Ok(());
                        }
                        Ok(n) => {
                            tracing::debug!("[{}] Received {} bytes", session.peer, n);
                            session.traffic().record_in(n);
                            decoder.extend(&buf[..n]);
                        }
                        Err(e) => {
                            tracing::debug!("[{}] Read error: {}", session.peer, e);
                            return Err(ServerError::Io(e));
                        }
                    }
                }

                _ = tokio::time::sleep(config.idle_timeout) => {
                    if session.idle_duration() > config.idle_timeout {
                        tracing::debug!("[{}] Idle timeout", session.peer);
                        return Ok(());
                    }
                }

                _ = shutdown.recv() => {
                    tracing::debug!("[{}] Shutdown signal received", session.peer);
                    return Err(ServerError::ShuttingDown);
                }
            }

            while let Some(request) = decoder.decode_request()? {
                tracing::info!(
                    "[{}] Request: {:?} (id={})",
                    session.peer,
                    request.op,
                    request.id
                );
                stats.requests_total.fetch_add(1, Ordering::Relaxed);

                let response = tokio::select! {
                    response = handler.dispatch(session, &request) => response,
                    _ = shutdown.recv() => {
                        tracing::debug!("[{}] Shutdown during {:?}", session.peer, request.op);
                        return Err(ServerError::ShuttingDown);
                    }
                };

                tracing::info!(
                    "[{}] Response: {} (id={})",
                    session.peer,
                    if response.is_ok() { "OK" } else { "ERROR" },
                    response.id
                );

                let response_bytes = Encoder::encode_response(&response)?;
                tracing::debug!("[{}] Writing {} bytes", session.peer, response_bytes.len());
                stream.write_all(&response_bytes).await?;
                session.traffic().record_out(response_bytes.len());

                if session.state() == SessionState::Closing {
                    tracing::debug!("[{}] Session closing", session.peer);
                    stream.shutdown().await?;
                    return Ok(());
                }
            }
        }
    }

    /// Initiates server shutdown. Open connections are closed as well.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Returns whether the server is accepting TCP connections.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tas_protocol::{Operation, Request, Response};

    fn test_server() -> Server {
        Server::from_config(&Config::default())
    }

    async fn roundtrip(stream: &mut DuplexStream, request: &Request) -> Response {
        let bytes = Encoder::encode_request(request).unwrap();
        stream.write_all(&bytes).await.unwrap();

        let mut decoder = Decoder::new();
        let mut buf = [0u8; 4096];
        loop {
            if let Some(response) = decoder.decode_response().unwrap() {
                return response;
            }
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "connection closed");
            decoder.extend(&buf[..n]);
        }
    }

    fn hello() -> Request {
        Request::new("1", Operation::Hello).with_params(json!({
            "protocol_version": 1,
            "client_name": "raw",
        }))
    }

    #[tokio::test]
    async fn test_server_basic() {
        let server = test_server();
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_in_memory_session() {
        let server = test_server();
        let mut stream = server.connect_in_memory();

        assert!(roundtrip(&mut stream, &hello()).await.is_ok());
        let response = roundtrip(&mut stream, &Request::new("2", Operation::GetTargets)).await;
        assert!(response.is_ok());
        assert_eq!(response.id, "2");

        let response = roundtrip(&mut stream, &Request::new("3", Operation::Bye)).await;
        assert!(response.is_ok());

        let mut buf = [0u8; 16];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
        assert_eq!(server.stats().requests_total.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_disconnect_releases_target() {
        let server = test_server();
        let mut stream = server.connect_in_memory();
        roundtrip(&mut stream, &hello()).await;
        let bind = Request::new("2", Operation::SessionStart)
            .with_params(json!({"identifier": "sim-tc3x-0"}));
        assert!(roundtrip(&mut stream, &bind).await.is_ok());

        let target = server.handler().registry().get("sim-tc3x-0").unwrap();
        assert_eq!(target.info().num_client, 1);

        drop(stream);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(target.info().num_client, 0);
        assert_eq!(server.stats().connections_active.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections() {
        let server = test_server();
        let mut stream = server.connect_in_memory();
        roundtrip(&mut stream, &hello()).await;

        server.shutdown();
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(1), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_tcp_serve() {
        let server = Arc::new(test_server());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let task = {
            let server = server.clone();
            tokio::spawn(async move { server.serve(listener).await })
        };

        let mut tcp = tokio::net::TcpStream::connect(addr).await.unwrap();
        let bytes = Encoder::encode_request(&hello()).unwrap();
        tcp.write_all(&bytes).await.unwrap();

        let mut decoder = Decoder::new();
        let mut buf = [0u8; 4096];
        let response = loop {
            if let Some(response) = decoder.decode_response().unwrap() {
                break response;
            }
            let n = tcp.read(&mut buf).await.unwrap();
            assert!(n > 0);
            decoder.extend(&buf[..n]);
        };
        assert!(response.is_ok());
        assert!(server.is_running());

        server.shutdown();
        task.await.unwrap().unwrap();
        assert!(!server.is_running());
    }
}
