//! WebSocket Server
//!
//! Accepts TCP connections, performs the WebSocket upgrade and drives one
//! [`Connection`] per client from its own task.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::error::{Error as WsError, ProtocolError as WsProtocolError};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, error, info, instrument, warn};

use crate::game::handoff::CommandHandoff;
use crate::network::auth::{SessionAuthenticator, UpgradeParams};
use crate::network::dispatcher::{Connection, ConnectionHandler, DispatchContext};
use crate::network::registry::ClientRegistry;
use crate::network::session::{ClientSession, SessionState};
use crate::network::transport::{ChannelTransport, Outbound, Transport};

/// Close code sent to clients when the server stops.
const CLOSE_GOING_AWAY: u16 = 1001;

/// Close code reported when the peer vanished without a close frame.
const CLOSE_ABNORMAL: u16 = 1006;

/// How long a finished connection may spend flushing queued frames.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Time a new connection gets to complete the WebSocket upgrade.
    pub connection_timeout: Duration,
    /// Per-connection outbound frame buffer. Replies wait while it is full.
    pub outbound_buffer: usize,
    /// Companions present in the simulation at startup.
    pub companions: Vec<String>,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 1000,
            connection_timeout: Duration::from_secs(30),
            outbound_buffer: 64,
            companions: Vec::new(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ServerConfig {
    /// Create config from environment variables, falling back to defaults.
    ///
    /// `COMPANIONS` is a comma-separated list of companion ids.
    pub fn from_env() -> Result<Self, ServerError> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("BIND_ADDR") {
            config.bind_addr = addr
                .parse()
                .map_err(|e| ServerError::Config(format!("BIND_ADDR `{}`: {}", addr, e)))?;
        }
        if let Ok(max) = std::env::var("MAX_CONNECTIONS") {
            config.max_connections = max
                .parse()
                .map_err(|e| ServerError::Config(format!("MAX_CONNECTIONS `{}`: {}", max, e)))?;
        }
        if let Ok(secs) = std::env::var("CONNECTION_TIMEOUT_SECS") {
            let secs: u64 = secs
                .parse()
                .map_err(|e| ServerError::Config(format!("CONNECTION_TIMEOUT_SECS `{}`: {}", secs, e)))?;
            config.connection_timeout = Duration::from_secs(secs);
        }
        if let Ok(buffer) = std::env::var("OUTBOUND_BUFFER") {
            config.outbound_buffer = buffer
                .parse()
                .map_err(|e| ServerError::Config(format!("OUTBOUND_BUFFER `{}`: {}", buffer, e)))?;
        }
        if let Ok(companions) = std::env::var("COMPANIONS") {
            config.companions = companions
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .collect();
        }

        Ok(config)
    }
}

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Decrements the live connection count when a connection task ends.
struct ConnectionGuard(Arc<AtomicUsize>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Resolves once shutdown was requested, even if that happened before the
/// call. A dropped server counts as a shutdown.
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// The WebSocket server.
pub struct BridgeServer {
    /// Server configuration.
    config: ServerConfig,
    /// Collaborators handed to every connection.
    ctx: DispatchContext,
    /// Open connections, authenticated or not.
    connections: Arc<AtomicUsize>,
    /// Shutdown flag, observed by the accept loop and every connection task.
    shutdown_tx: watch::Sender<bool>,
}

impl BridgeServer {
    /// Create a new server.
    pub fn new(
        config: ServerConfig,
        authenticator: SessionAuthenticator,
        handoff: CommandHandoff,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config,
            ctx: DispatchContext {
                authenticator,
                registry: ClientRegistry::new(),
                handoff,
            },
            connections: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
        }
    }

    /// Registry of authenticated clients, for broadcasting.
    pub fn registry(&self) -> &ClientRegistry {
        &self.ctx.registry
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        Ok(TcpListener::bind(&self.config.bind_addr).await?)
    }

    /// Bind and serve until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serve connections from `listener` until shutdown.
    #[instrument(skip_all)]
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        info!("Companion link listening on {}", listener.local_addr()?);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if self.connection_count() >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            debug!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_requested(&mut shutdown_rx) => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Spawn the task serving one TCP connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        self.connections.fetch_add(1, Ordering::SeqCst);
        let guard = ConnectionGuard(self.connections.clone());
        let ctx = self.ctx.clone();
        let buffer = self.config.outbound_buffer;
        let handshake_timeout = self.config.connection_timeout;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let _guard = guard;

            let mut params = UpgradeParams::default();
            let callback = |req: &Request, resp: Response| {
                params = UpgradeParams::from_uri(req.uri());
                Ok::<_, ErrorResponse>(resp)
            };
            let handshake = tokio::time::timeout(handshake_timeout, accept_hdr_async(stream, callback));
            let ws_stream = tokio::select! {
                result = handshake => match result {
                    Ok(Ok(ws)) => ws,
                    Ok(Err(e)) => {
                        error!("WebSocket handshake failed for {}: {}", addr, e);
                        return;
                    }
                    Err(_) => {
                        warn!("WebSocket handshake from {} timed out", addr);
                        return;
                    }
                },
                _ = shutdown_requested(&mut shutdown_rx) => {
                    debug!("Shutdown before {} finished its handshake", addr);
                    return;
                }
            };

            serve_socket(ws_stream, params, ctx, buffer, shutdown_rx).await;
            debug!("Connection {} finished", addr);
        });
    }

    /// Stop accepting connections and close open ones.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Open connection count.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

/// Why a socket stopped delivering frames.
#[derive(Debug)]
enum SocketEnd {
    /// Close frame, dropped stream or server shutdown.
    Closed { code: u16, reason: String },
    /// Read error.
    Failed(WsError),
}

/// Drive one upgraded socket through its whole lifecycle.
async fn serve_socket(
    ws_stream: WebSocketStream<TcpStream>,
    params: UpgradeParams,
    ctx: DispatchContext,
    buffer: usize,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let (ws_sender, mut ws_receiver) = ws_stream.split();
    let (transport, out_rx) = ChannelTransport::new(buffer);
    let transport = Arc::new(transport);
    let mut writer = tokio::spawn(write_frames(ws_sender, out_rx));

    let mut conn = Connection::new(ClientSession::new(transport.clone()), ctx);

    if conn.on_connect(&params).await == SessionState::Authenticated {
        let end = tokio::select! {
            end = read_frames(&mut conn, &mut ws_receiver) => end,
            _ = shutdown_requested(&mut shutdown_rx) => {
                let reason = "Server shutting down";
                let closing = transport.close(CLOSE_GOING_AWAY, reason);
                if !matches!(tokio::time::timeout(FLUSH_TIMEOUT, closing).await, Ok(Ok(()))) {
                    debug!("Close frame not queued on shutdown");
                }
                SocketEnd::Closed { code: CLOSE_GOING_AWAY, reason: reason.to_string() }
            }
        };

        match end {
            SocketEnd::Closed { code, reason } => conn.on_close(code, &reason).await,
            SocketEnd::Failed(e) => conn.on_error(&e).await,
        }
    } else {
        // Let the peer answer the policy-violation close frame.
        let drain = async {
            while let Some(Ok(msg)) = ws_receiver.next().await {
                if msg.is_close() {
                    break;
                }
            }
        };
        let _ = tokio::time::timeout(FLUSH_TIMEOUT, drain).await;
    }

    // Dropping every transport handle ends the writer once it has flushed.
    drop(conn);
    drop(transport);
    if tokio::time::timeout(FLUSH_TIMEOUT, &mut writer).await.is_err() {
        warn!("Writer did not flush in time, aborting");
        writer.abort();
    }
}

/// Hand inbound frames to `conn` until the socket closes or fails.
///
/// Lifecycle events are returned instead of delivered so that a shutdown
/// cancelling this future never interrupts registry bookkeeping.
async fn read_frames(
    conn: &mut Connection,
    ws_receiver: &mut SplitStream<WebSocketStream<TcpStream>>,
) -> SocketEnd {
    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => conn.on_message(&text).await,
            Ok(Message::Binary(data)) => conn.on_message(&String::from_utf8_lossy(&data)).await,
            Ok(Message::Close(frame)) => {
                let (code, reason) = close_details(frame);
                return SocketEnd::Closed { code, reason };
            }
            Ok(_) => {}
            Err(WsError::Protocol(WsProtocolError::ResetWithoutClosingHandshake))
            | Err(WsError::ConnectionClosed) => break,
            Err(e) => return SocketEnd::Failed(e),
        }
    }
    SocketEnd::Closed {
        code: CLOSE_ABNORMAL,
        reason: "connection dropped".to_string(),
    }
}

/// Code and reason of a received close frame; 1005 when it carried none.
fn close_details(frame: Option<CloseFrame<'_>>) -> (u16, String) {
    frame
        .map(|f| (u16::from(f.code), f.reason.into_owned()))
        .unwrap_or((u16::from(CloseCode::Status), String::new()))
}

/// Forward queued frames to the socket until the queue closes or a close
/// frame is sent.
async fn write_frames(
    mut ws_sender: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut out_rx: mpsc::Receiver<Outbound>,
) {
    while let Some(frame) = out_rx.recv().await {
        match frame {
            Outbound::Text(text) => {
                if let Err(e) = ws_sender.send(Message::Text(text)).await {
                    debug!(error = %e, "Socket write failed");
                    break;
                }
            }
            Outbound::Close { code, reason } => {
                let frame = CloseFrame {
                    code: CloseCode::from(code),
                    reason: reason.into(),
                };
                if let Err(e) = ws_sender.send(Message::Close(Some(frame))).await {
                    debug!(error = %e, "Close frame write failed");
                }
                break;
            }
        }
    }
}
