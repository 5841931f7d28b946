//! WebSocket World Server
//!
//! Accepts WebSocket connections, runs the connect handshake, and pumps
//! frames between each connection and the shared [`World`].
//!
//! Every connection gets two tasks: the reader (this module's loop), which
//! dispatches inbound commands, and a writer, which drains the session's
//! outbound queue and sends each batch as one text frame.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, error, info, instrument, warn};

use crate::network::auth::{validate_token, AuthConfig, AuthError};
use crate::network::protocol::{
    encode_batch, Command, ConnectRequest, ConnectedInfo, ErrorCode, InboundEnvelope, Packet,
    ServerError, ServerMessage,
};
use crate::network::session::{ConnectionSerial, PlayerSession, SessionId, SessionProfile};
use crate::world::instance::{World, WorldConfig, WorldError};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Skin assigned when the handshake names none.
const DEFAULT_SKIN: &str = "base";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Outbound batches buffered per session before deliveries fail.
    pub outbox_capacity: usize,
    /// Time a new connection has to send its handshake.
    pub handshake_timeout: Duration,
    /// Server version string.
    pub version: String,
    /// World to serve.
    pub world: WorldConfig,
    /// Token validation.
    pub auth: AuthConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 1000,
            outbox_capacity: 256,
            handshake_timeout: Duration::from_secs(10),
            version: env!("CARGO_PKG_VERSION").to_string(),
            world: WorldConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Create config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: env_parse("VOXEL_BIND_ADDR").unwrap_or(defaults.bind_addr),
            max_connections: env_parse("VOXEL_MAX_CONNECTIONS").unwrap_or(defaults.max_connections),
            outbox_capacity: env_parse("VOXEL_OUTBOX_CAPACITY").unwrap_or(defaults.outbox_capacity),
            handshake_timeout: env_parse("VOXEL_HANDSHAKE_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.handshake_timeout),
            version: defaults.version,
            world: WorldConfig::from_env(),
            auth: AuthConfig::from_env(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring unparsable {}={:?}", key, raw);
            None
        }
    }
}

/// World server errors.
#[derive(Debug, thiserror::Error)]
pub enum WorldServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// World could not be opened.
    #[error("World error: {0}")]
    World(#[from] WorldError),
}

/// Decrements the connection count when a connection task ends.
struct ConnectionSlot(Arc<AtomicUsize>);

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The world server.
pub struct WorldServer {
    /// Server configuration.
    config: Arc<ServerConfig>,
    /// Shared world.
    world: Arc<World>,
    /// Open connections.
    connections: Arc<AtomicUsize>,
    /// Shutdown signal.
    shutdown_tx: broadcast::Sender<()>,
}

impl WorldServer {
    /// Create a server for an already opened world.
    pub fn new(config: ServerConfig, world: Arc<World>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config: Arc::new(config),
            world,
            connections: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
        }
    }

    /// Open the configured world and create a server for it.
    pub fn open(config: ServerConfig) -> Result<Self, WorldServerError> {
        let world = Arc::new(World::open(&config.world)?);
        Ok(Self::new(config, world))
    }

    /// The served world.
    pub fn world(&self) -> &Arc<World> {
        &self.world
    }

    /// Bind and run until shutdown.
    pub async fn run(&self) -> Result<(), WorldServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` until shutdown.
    #[instrument(skip(self, listener))]
    pub async fn serve(&self, listener: TcpListener) -> Result<(), WorldServerError> {
        info!("World server listening on {}", listener.local_addr()?);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if self.connections.load(Ordering::SeqCst) >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            info!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Spawn the task owning one connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        self.connections.fetch_add(1, Ordering::SeqCst);
        let slot = ConnectionSlot(self.connections.clone());
        let world = self.world.clone();
        let config = self.config.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let _slot = slot;
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    error!("WebSocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };

            let (ws_sender, ws_receiver) = ws_stream.split();
            run_connection(addr, ws_sender, ws_receiver, world, config, shutdown_rx).await;
            info!("Client {} cleaned up", addr);
        });
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get open connection count.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_connection(
    addr: SocketAddr,
    mut ws_sender: WsSink,
    mut ws_receiver: WsSource,
    world: Arc<World>,
    config: Arc<ServerConfig>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let (request, correlation) = match read_handshake(&mut ws_receiver, config.handshake_timeout).await {
        Ok(handshake) => handshake,
        Err(rejection) => {
            reject(&mut ws_sender, addr, rejection).await;
            return;
        }
    };
    let profile = match authenticate(&request, &config.auth) {
        Ok(profile) => profile,
        Err(rejection) => {
            reject(&mut ws_sender, addr, rejection).await;
            return;
        }
    };

    let id = profile.id;
    let username = profile.username.clone();
    let (msg_tx, mut msg_rx) = mpsc::channel::<Vec<Packet>>(config.outbox_capacity.max(1));

    // Spawn message sender task
    let sender_task = tokio::spawn(async move {
        while let Some(batch) = msg_rx.recv().await {
            let text = match encode_batch(&batch) {
                Ok(t) => t,
                Err(e) => {
                    error!("Failed to serialize batch: {}", e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    let connected = Packet::reply(
        ServerMessage::Connected(ConnectedInfo {
            session_id: id,
            world_id: world.id().to_string(),
            server_version: config.version.clone(),
        }),
        correlation,
    );
    if msg_tx.send(vec![connected]).await.is_err() {
        return;
    }

    let session = PlayerSession::new(profile, msg_tx);
    let serial = session.serial();
    let closer = session.close_signal();
    world.join(session).await;
    info!("Client {} authenticated as {} ({})", addr, username, id);

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => handle_frame(&world, id, serial, &text).await,
                    Some(Ok(Message::Binary(_))) => {
                        debug!("Ignoring binary frame from {}", addr);
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("Client {} disconnected", addr);
                        break;
                    }
                    Some(Err(e)) => {
                        error!("WebSocket error for {}: {}", addr, e);
                        break;
                    }
                    _ => {}
                }
            }
            _ = closer.notified() => {
                info!("Session {} replaced by a newer connection", id);
                break;
            }
            _ = shutdown_rx.recv() => {
                break;
            }
        }
    }

    world.leave(id, serial).await;

    // The writer stops once the world drops the session's queue.
    if tokio::time::timeout(Duration::from_secs(1), sender_task).await.is_err() {
        debug!("Writer for {} did not finish in time", addr);
    }
}

async fn handle_frame(world: &World, id: SessionId, serial: ConnectionSerial, text: &str) {
    let envelope = match InboundEnvelope::from_json(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!("Invalid frame from {}: {}", id, e);
            return;
        }
    };

    match world.dispatch(&envelope, id, serial).await {
        Ok(report) if !report.failed.is_empty() => {
            debug!("{} from {}: {} deliveries failed", envelope.name, id, report.failed.len());
        }
        Ok(_) => {}
        Err(WorldError::Protocol(e)) => debug!("Dropped command from {}: {}", id, e),
        Err(e) => warn!("{} from {} failed: {}", envelope.name, id, e),
    }
}

async fn read_handshake(
    ws_receiver: &mut WsSource,
    timeout: Duration,
) -> Result<(ConnectRequest, Option<String>), ServerError> {
    let not_authenticated = |message: &str| ServerError {
        code: ErrorCode::NotAuthenticated,
        message: message.to_string(),
    };

    let text = loop {
        let frame = tokio::time::timeout(timeout, ws_receiver.next())
            .await
            .map_err(|_| not_authenticated("Handshake timed out"))?;
        match frame {
            Some(Ok(Message::Text(text))) => break text,
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            _ => return Err(not_authenticated("Expected connect")),
        }
    };

    let envelope = InboundEnvelope::from_json(&text).map_err(|_| ServerError {
        code: ErrorCode::InvalidInput,
        message: "Invalid message format".to_string(),
    })?;
    match Command::decode(&envelope) {
        Ok(Command::Connect(request)) => Ok((request, envelope.id)),
        Ok(_) => Err(not_authenticated("Expected connect")),
        Err(e) => Err(ServerError {
            code: ErrorCode::InvalidInput,
            message: e.to_string(),
        }),
    }
}

/// Resolve the identity a handshake establishes.
///
/// With authentication configured the token decides the identity; without
/// it the client may pick its own UUID or gets a random one.
pub fn authenticate(request: &ConnectRequest, auth: &AuthConfig) -> Result<SessionProfile, ServerError> {
    let (id, claimed_name) = if auth.is_configured() {
        let token = request.token.as_deref().ok_or_else(|| ServerError {
            code: ErrorCode::AuthFailed,
            message: "Token required".to_string(),
        })?;
        let claims = validate_token(token, auth).map_err(|e| ServerError {
            code: match e {
                AuthError::Expired => ErrorCode::TokenExpired,
                _ => ErrorCode::InvalidToken,
            },
            message: e.to_string(),
        })?;
        (claims.session_id(), claims.name)
    } else {
        let id = match request.user_id.as_deref() {
            Some(raw) => SessionId::parse(raw).ok_or_else(|| ServerError {
                code: ErrorCode::InvalidInput,
                message: format!("Invalid user id {:?}", raw),
            })?,
            None => SessionId::random(),
        };
        (id, None)
    };

    let username = claimed_name.unwrap_or_else(|| request.username.trim().to_string());
    if username.is_empty() {
        return Err(ServerError {
            code: ErrorCode::InvalidInput,
            message: "Username required".to_string(),
        });
    }

    Ok(SessionProfile {
        id,
        username,
        skin: request.skin.clone().unwrap_or_else(|| DEFAULT_SKIN.to_string()),
    })
}

async fn reject(ws_sender: &mut WsSink, addr: SocketAddr, rejection: ServerError) {
    info!("Rejecting {}: {}", addr, rejection.message);
    if let Ok(text) = encode_batch(&[Packet::new(ServerMessage::Error(rejection))]) {
        let _ = ws_sender.send(Message::Text(text)).await;
    }
    let _ = ws_sender.close().await;
}
