//! WebSocket Relay Server
//!
//! Async WebSocket server for 1v1 pairing and relay.
//! Handles authentication, matchmaking, and routing of moves, chat and
//! results between the two members of a room.

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::time::interval;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, accept_hdr_async, WebSocketStream};
use tracing::{debug, error, info, instrument, warn};

use crate::core::{ConnectionId, Identity, ReportedOutcome};
use crate::network::auth::{
    token_fingerprint, token_from_parts, AuthConfig, AuthError, IdentityResolver,
};
use crate::network::pairing::{Arrival, PairingError, PairingQueue};
use crate::network::protocol::{
    AuthRequest, AuthResult, ClientMessage, ErrorCode, MatchSummary, MatchmakingResponse,
    MatchmakingStatus, MovePayload, ProfileInfo, ServerMessage,
};
use crate::network::registry::{try_notify, ClientSender, ConnectionRegistry};
use crate::network::session::{
    Conclusion, Delivery, Participant, RoomConfig, RoomError, RoomManager,
};
use crate::rating::{LedgerConfig, RatingLedger};
use crate::store::{StoreError, UserStore};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// How long a connection without a handshake token has to send `auth`.
    pub auth_timeout: Duration,
    /// Connections silent for longer than this are closed.
    pub idle_timeout: Duration,
    /// Period of the idle/forfeit/cleanup sweep.
    pub sweep_interval: Duration,
    /// Server version string.
    pub version: String,
    /// Token validation.
    pub auth: AuthConfig,
    /// Room lifecycle.
    pub rooms: RoomConfig,
    /// Rating persistence.
    pub ledger: LedgerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 1000,
            auth_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(5),
            version: env!("CARGO_PKG_VERSION").to_string(),
            auth: AuthConfig::default(),
            rooms: RoomConfig::default(),
            ledger: LedgerConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: env_parse("BIND_ADDR").unwrap_or(defaults.bind_addr),
            max_connections: env_parse("MAX_CONNECTIONS").unwrap_or(defaults.max_connections),
            auth_timeout: env_parse("AUTH_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.auth_timeout),
            idle_timeout: env_parse("IDLE_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.idle_timeout),
            sweep_interval: env_parse("SWEEP_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
            version: defaults.version,
            auth: AuthConfig::from_env(),
            rooms: RoomConfig::from_env(),
            ledger: LedgerConfig::from_env(),
        }
    }
}

/// How long a rejected connection gets to complete its handshake.
const REJECT_TIMEOUT: Duration = Duration::from_secs(5);

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// State shared by every connection task.
struct Shared {
    config: ServerConfig,
    registry: ConnectionRegistry,
    rooms: Arc<RoomManager>,
    pairing: PairingQueue,
    resolver: IdentityResolver,
    store: Arc<dyn UserStore>,
    /// One permit per open connection, held until its task ends.
    permits: Arc<Semaphore>,
}

/// Per-connection flags.
#[derive(Debug, Default)]
struct ConnectionState {
    authenticated: bool,
    /// A closing frame was queued; inbound messages are ignored.
    closing: bool,
}

/// The relay server.
pub struct GameServer {
    shared: Arc<Shared>,
    /// Shutdown signal.
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    /// Create a new server backed by `store`. Spawns the pairing and
    /// ledger tasks, so it must be called inside a tokio runtime.
    pub fn new(config: ServerConfig, store: Arc<dyn UserStore>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        let ledger = RatingLedger::spawn(store.clone(), config.ledger.clone());
        let rooms = Arc::new(RoomManager::new(config.rooms.clone(), ledger));
        let pairing = PairingQueue::spawn(rooms.clone());
        let resolver = IdentityResolver::new(config.auth.clone(), store.clone());
        let permits = Arc::new(Semaphore::new(config.max_connections));

        Self {
            shared: Arc::new(Shared {
                config,
                registry: ConnectionRegistry::new(),
                rooms,
                pairing,
                resolver,
                store,
                permits,
            }),
            shutdown_tx,
        }
    }

    /// Bind the configured address and serve until shutdown.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), GameServerError> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from `listener` until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), GameServerError> {
        info!("Relay server listening on {}", listener.local_addr()?);

        let cleanup_handle = tokio::spawn(Self::run_cleanup_loop(self.shared.clone()));
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            match self.shared.permits.clone().try_acquire_owned() {
                                Ok(permit) => {
                                    debug!("New connection from {}", addr);
                                    self.handle_connection(stream, addr, permit);
                                }
                                Err(_) => {
                                    warn!("Connection limit reached, rejecting {}", addr);
                                    tokio::spawn(reject_overloaded(stream, addr));
                                }
                            }
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

        cleanup_handle.abort();

        Ok(())
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr, permit: OwnedSemaphorePermit) {
        let shared = self.shared.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let _permit = permit;
            let (ws_stream, token) = match accept_with_token(stream).await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("WebSocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };

            let conn = ConnectionId::new();
            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(64);

            shared.registry.register(conn, msg_tx.clone()).await;
            info!("Connection {} opened from {}", conn.short(), addr);

            // Writer ends after a closing frame or when the socket fails
            let mut sender_task = tokio::spawn(async move {
                while let Some(msg) = msg_rx.recv().await {
                    let text = match msg.to_json() {
                        Ok(t) => t,
                        Err(e) => {
                            error!("Failed to serialize message: {}", e);
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        return;
                    }
                    if msg.closes_connection() {
                        let _ = ws_sender.close().await;
                        return;
                    }
                }
            });
            let mut sender_done = false;

            let mut state = ConnectionState::default();
            if let Some(token) = token {
                Self::authenticate(&shared, conn, &mut state, Some(&token), &msg_tx).await;
            }

            let auth_deadline = tokio::time::sleep(shared.config.auth_timeout);
            tokio::pin!(auth_deadline);

            loop {
                tokio::select! {
                    _ = &mut sender_task, if !sender_done => {
                        sender_done = true;
                        break;
                    }
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) if !state.closing => {
                                Self::dispatch(&shared, conn, &mut state, ClientMessage::from_json(&text), &msg_tx).await;
                            }
                            Some(Ok(Message::Binary(data))) if !state.closing => {
                                Self::dispatch(&shared, conn, &mut state, ClientMessage::from_bytes(&data), &msg_tx).await;
                            }
                            Some(Ok(Message::Ping(_))) => {
                                shared.registry.touch(&conn).await;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("Connection {} closed by peer", conn.short());
                                break;
                            }
                            Some(Err(e)) => {
                                warn!("WebSocket error for {}: {}", conn.short(), e);
                                break;
                            }
                            _ => {}
                        }
                    }
                    _ = &mut auth_deadline, if !state.authenticated && !state.closing => {
                        warn!("Connection {} did not authenticate in time", conn.short());
                        Self::authenticate(&shared, conn, &mut state, None, &msg_tx).await;
                    }
                    _ = shutdown_rx.recv(), if !state.closing => {
                        state.closing = true;
                        let _ = msg_tx.send(ServerMessage::Shutdown {
                            reason: "Server shutting down".to_string(),
                        }).await;
                    }
                }
            }

            if !sender_done {
                sender_task.abort();
            }

            Self::disconnect(&shared, conn).await;
        });
    }

    /// Tear down everything a connection took part in.
    async fn disconnect(shared: &Shared, conn: ConnectionId) {
        shared.pairing.remove(conn).await;
        shared.rooms.handle_disconnect(&conn).await;
        if let Some(client) = shared.registry.unregister(&conn).await {
            match client.identity {
                Some(identity) => info!("Connection {} ({}) cleaned up", conn.short(), identity),
                None => info!("Connection {} cleaned up", conn.short()),
            }
        }
    }

    /// Parse result of an inbound frame.
    async fn dispatch(
        shared: &Shared,
        conn: ConnectionId,
        state: &mut ConnectionState,
        parsed: Result<ClientMessage, serde_json::Error>,
        sender: &ClientSender,
    ) {
        let msg = match parsed {
            Ok(m) => m,
            Err(e) => {
                debug!("Invalid message from {}: {}", conn.short(), e);
                let _ = sender
                    .send(ServerMessage::error(ErrorCode::InvalidInput, "Invalid message format"))
                    .await;
                return;
            }
        };

        shared.registry.touch(&conn).await;
        Self::handle_client_message(shared, conn, state, msg, sender).await;
    }

    /// Handle a client message.
    async fn handle_client_message(
        shared: &Shared,
        conn: ConnectionId,
        state: &mut ConnectionState,
        msg: ClientMessage,
        sender: &ClientSender,
    ) {
        match msg {
            ClientMessage::Auth(auth) => {
                Self::handle_auth(shared, conn, state, auth, sender).await;
            }
            ClientMessage::Ping { timestamp } => {
                let _ = sender
                    .send(ServerMessage::Pong {
                        timestamp,
                        server_time: unix_millis(),
                    })
                    .await;
            }
            other => {
                let Some(identity) = shared.registry.identity_of(&conn).await else {
                    let _ = sender
                        .send(ServerMessage::error(
                            ErrorCode::NotAuthenticated,
                            "Must authenticate first",
                        ))
                        .await;
                    return;
                };

                match other {
                    ClientMessage::Move(payload) => {
                        Self::handle_move(shared, conn, payload, sender).await;
                    }
                    ClientMessage::Chat { text } => {
                        Self::handle_chat(shared, conn, text, sender).await;
                    }
                    ClientMessage::GameOver { outcome } => {
                        Self::handle_game_over(shared, conn, outcome, sender).await;
                    }
                    ClientMessage::FindMatch => {
                        Self::handle_find_match(shared, conn, identity, sender).await;
                    }
                    ClientMessage::CancelMatchmaking => {
                        shared.pairing.remove(conn).await;
                        let _ = sender
                            .send(ServerMessage::Matchmaking(MatchmakingResponse {
                                status: MatchmakingStatus::Cancelled,
                            }))
                            .await;
                    }
                    ClientMessage::Profile { identity: target } => {
                        Self::handle_profile(shared, target.unwrap_or(identity), sender).await;
                    }
                    ClientMessage::Leave => {
                        Self::handle_leave(shared, conn).await;
                    }
                    ClientMessage::Auth(_) | ClientMessage::Ping { .. } => {}
                }
            }
        }
    }

    /// Handle in-band authentication.
    async fn handle_auth(
        shared: &Shared,
        conn: ConnectionId,
        state: &mut ConnectionState,
        auth: AuthRequest,
        sender: &ClientSender,
    ) {
        if state.authenticated {
            let _ = sender
                .send(ServerMessage::error(
                    ErrorCode::AlreadyAuthenticated,
                    "Connection already authenticated",
                ))
                .await;
            return;
        }

        if let Some(version) = &auth.client_version {
            debug!("Connection {} client version {}", conn.short(), version);
        }
        Self::authenticate(shared, conn, state, Some(&auth.token), sender).await;
    }

    /// Resolve `token`, then enter the pairing queue. Failure, including
    /// an absent token, closes the connection.
    async fn authenticate(
        shared: &Shared,
        conn: ConnectionId,
        state: &mut ConnectionState,
        token: Option<&str>,
        sender: &ClientSender,
    ) {
        let identity = match shared.resolver.resolve_optional(token).await {
            Ok(identity) => identity,
            Err(e) => {
                match &e {
                    e if e.is_invalid_token() => warn!(
                        "Rejected token {} on {}: {}",
                        token.map(token_fingerprint).unwrap_or_default(),
                        conn.short(),
                        e
                    ),
                    AuthError::MissingToken | AuthError::UnknownIdentity(_) => {
                        info!("Authentication refused for {}: {}", conn.short(), e)
                    }
                    _ => error!("Authentication unavailable for {}: {}", conn.short(), e),
                }
                state.closing = true;
                let _ = sender
                    .send(ServerMessage::error(ErrorCode::AuthFailed, e.to_string()))
                    .await;
                return;
            }
        };

        if let Err(e) = shared.registry.attach_identity(conn, identity.clone()).await {
            error!("Failed to attach identity to {}: {}", conn.short(), e);
            let _ = sender
                .send(ServerMessage::error(ErrorCode::InternalError, "Connection state lost"))
                .await;
            return;
        }
        state.authenticated = true;

        let _ = sender
            .send(ServerMessage::AuthResult(AuthResult {
                success: true,
                identity: Some(identity.clone()),
                error: None,
                server_version: shared.config.version.clone(),
            }))
            .await;
        info!("Connection {} authenticated as {}", conn.short(), identity);

        Self::handle_find_match(shared, conn, identity, sender).await;
    }

    /// Enter the pairing queue.
    async fn handle_find_match(
        shared: &Shared,
        conn: ConnectionId,
        identity: Identity,
        sender: &ClientSender,
    ) {
        let participant = Participant {
            connection: conn,
            identity,
            sender: sender.clone(),
        };

        match shared.pairing.arrive(participant).await {
            Ok(Arrival::Waiting) => debug!("Connection {} waiting", conn.short()),
            Ok(Arrival::Paired(room_id)) => debug!("Connection {} paired into {}", conn.short(), room_id),
            Err(PairingError::AlreadyInMatch(identity)) => {
                let _ = sender
                    .send(ServerMessage::error(
                        ErrorCode::AlreadyInMatch,
                        format!("{} is already in a match", identity),
                    ))
                    .await;
            }
            Err(e) => {
                error!("Pairing failed for {}: {}", conn.short(), e);
                let _ = sender
                    .send(ServerMessage::error(ErrorCode::InternalError, "Pairing failed"))
                    .await;
            }
        }
    }

    /// Relay a move to the opponent.
    async fn handle_move(
        shared: &Shared,
        conn: ConnectionId,
        payload: MovePayload,
        sender: &ClientSender,
    ) {
        let Some(room_id) = shared.rooms.room_of(&conn).await else {
            Self::reject_relay(conn, "move", RoomError::NoActiveRoom, sender).await;
            return;
        };
        match shared.rooms.relay_move(&room_id, conn, payload).await {
            Ok(Delivery::Delivered) => {}
            Ok(Delivery::PeerUnavailable) => {
                debug!("Move from {} dropped; opponent disconnected", conn.short());
            }
            Err(e) => Self::reject_relay(conn, "move", e, sender).await,
        }
    }

    /// Relay chat to the opponent.
    async fn handle_chat(shared: &Shared, conn: ConnectionId, text: String, sender: &ClientSender) {
        let Some(room_id) = shared.rooms.room_of(&conn).await else {
            Self::reject_relay(conn, "chat", RoomError::NoActiveRoom, sender).await;
            return;
        };
        match shared.rooms.relay_chat(&room_id, conn, text).await {
            Ok(Delivery::Delivered) => {}
            Ok(Delivery::PeerUnavailable) => {
                debug!("Chat from {} dropped; opponent disconnected", conn.short());
            }
            Err(e) => Self::reject_relay(conn, "chat", e, sender).await,
        }
    }

    async fn reject_relay(conn: ConnectionId, kind: &str, err: RoomError, sender: &ClientSender) {
        debug!("Dropped {} from {}: {}", kind, conn.short(), err);
        let _ = sender
            .send(ServerMessage::error(ErrorCode::NotInMatch, err.to_string()))
            .await;
    }

    /// Handle a reported result.
    async fn handle_game_over(
        shared: &Shared,
        conn: ConnectionId,
        outcome: ReportedOutcome,
        sender: &ClientSender,
    ) {
        let Some(room_id) = shared.rooms.room_of(&conn).await else {
            Self::reject_relay(conn, "game_over", RoomError::NoActiveRoom, sender).await;
            return;
        };

        match shared.rooms.conclude(&room_id, conn, outcome).await {
            Ok(Conclusion::AlreadyConcluded) => {
                debug!("Duplicate game_over from {} ignored", conn.short());
            }
            Ok(_) => {}
            Err(e @ RoomError::InvalidOutcome(_)) => {
                let _ = sender
                    .send(ServerMessage::error(ErrorCode::InvalidOutcome, e.to_string()))
                    .await;
            }
            Err(e) => Self::reject_relay(conn, "game_over", e, sender).await,
        }
    }

    /// Handle leave: withdraw from the queue and resign any active room.
    async fn handle_leave(shared: &Shared, conn: ConnectionId) {
        shared.pairing.remove(conn).await;
        match shared.rooms.resign(&conn).await {
            Ok(_) => info!("Connection {} resigned", conn.short()),
            Err(e) => debug!("Leave from {}: {}", conn.short(), e),
        }
    }

    /// Look up rating and match history.
    async fn handle_profile(shared: &Shared, target: Identity, sender: &ClientSender) {
        let user = match shared.store.get_user(&target).await {
            Ok(user) => user,
            Err(StoreError::NotFound(identity)) => {
                let _ = sender
                    .send(ServerMessage::error(
                        ErrorCode::NotFound,
                        format!("No such player: {}", identity),
                    ))
                    .await;
                return;
            }
            Err(e) => {
                error!("Profile lookup for {} failed: {}", target, e);
                let _ = sender
                    .send(ServerMessage::error(ErrorCode::InternalError, "Profile unavailable"))
                    .await;
                return;
            }
        };

        let history = match shared.store.list_matches(&target).await {
            Ok(history) => history,
            Err(e) => {
                warn!("Match history for {} unavailable: {}", target, e);
                Vec::new()
            }
        };

        let matches = history
            .iter()
            .filter_map(|record| {
                Some(MatchSummary {
                    opponent: record.opponent_of(&target)?.clone(),
                    result: record.result_for(&target)?,
                    played_at: record.created_at.timestamp(),
                })
            })
            .collect();

        let _ = sender
            .send(ServerMessage::Profile(ProfileInfo {
                identity: user.identity,
                rating: user.rating,
                matches,
            }))
            .await;
    }

    /// Run cleanup loop: idle connections, forfeits, expired rooms.
    async fn run_cleanup_loop(shared: Arc<Shared>) {
        let mut interval = interval(shared.config.sweep_interval);

        loop {
            interval.tick().await;

            for conn in shared.registry.idle_connections(shared.config.idle_timeout).await {
                if let Some(sender) = shared.registry.sender_of(&conn).await {
                    info!("Closing idle connection {}", conn.short());
                    try_notify(
                        &sender,
                        ServerMessage::error(ErrorCode::IdleTimeout, "Connection idle for too long"),
                    );
                }
            }

            let forfeited = shared.rooms.forfeit_abandoned().await;
            if !forfeited.is_empty() {
                debug!("Sweep closed {} abandoned rooms", forfeited.len());
            }

            shared.rooms.cleanup().await;
        }
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get live connection count.
    pub async fn connection_count(&self) -> usize {
        self.shared.registry.count().await
    }

    /// Get room count (active and awaiting cleanup).
    pub async fn room_count(&self) -> usize {
        self.shared.rooms.room_count().await
    }
}

/// Complete the handshake only to tell the client the server is full.
async fn reject_overloaded(stream: TcpStream, addr: SocketAddr) {
    let rejection = async {
        let mut ws = accept_async(stream).await?;
        let notice = ServerMessage::error(ErrorCode::ServerOverloaded, "Server at capacity");
        if let Ok(text) = notice.to_json() {
            ws.send(Message::Text(text)).await?;
        }
        ws.close(None).await?;
        Ok::<_, GameServerError>(())
    };
    match tokio::time::timeout(REJECT_TIMEOUT, rejection).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Rejection of {} failed: {}", addr, e),
        Err(_) => debug!("Rejection of {} timed out", addr),
    }
}

/// Complete the WebSocket handshake, capturing any token it carries.
async fn accept_with_token(
    stream: TcpStream,
) -> Result<(WebSocketStream<TcpStream>, Option<String>), GameServerError> {
    let mut token = None;
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        let header = |name: &str| req.headers().get(name).and_then(|v| v.to_str().ok());
        token = token_from_parts(header("authorization"), header("cookie"), req.uri().query());
        Ok(resp)
    };
    let ws_stream = accept_hdr_async(stream, callback).await?;
    Ok((ws_stream, token))
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{PersonalResult, Role};
    use crate::network::auth::issue_token;
    use crate::network::protocol::EndReason;
    use crate::rating::INITIAL_RATING;
    use crate::store::{MemoryUserStore, UserRecord};
    use tokio_tungstenite::{connect_async, MaybeTlsStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    struct Harness {
        server: Arc<GameServer>,
        addr: SocketAddr,
        store: Arc<MemoryUserStore>,
        auth: AuthConfig,
    }

    impl Harness {
        async fn start() -> Self {
            Self::start_with(|_| {}).await
        }

        async fn start_with(tweak: impl FnOnce(&mut ServerConfig)) -> Self {
            let store = Arc::new(MemoryUserStore::new());
            for name in ["alice", "bob"] {
                store
                    .create_user(UserRecord::new(Identity::new(name), INITIAL_RATING))
                    .await
                    .unwrap();
            }

            let auth = AuthConfig {
                secret: Some("test-secret".into()),
                ..Default::default()
            };
            let mut config = ServerConfig {
                bind_addr: "127.0.0.1:0".parse().unwrap(),
                auth: auth.clone(),
                sweep_interval: Duration::from_millis(50),
                ..Default::default()
            };
            tweak(&mut config);

            let server = Arc::new(GameServer::new(config, store.clone()));
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();

            let serving = server.clone();
            tokio::spawn(async move { serving.serve(listener).await });

            Self { server, addr, store, auth }
        }

        fn token(&self, name: &str) -> String {
            issue_token(&Identity::new(name), &self.auth).unwrap()
        }

        async fn connect(&self, token: Option<&str>) -> Client {
            let url = match token {
                Some(t) => format!("ws://{}/?token={}", self.addr, t),
                None => format!("ws://{}/", self.addr),
            };
            let (client, _) = connect_async(url).await.unwrap();
            client
        }

        async fn wait_for_connections(&self, expected: usize) {
            for _ in 0..100 {
                if self.server.connection_count().await == expected {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("connection count never reached {}", expected);
        }
    }

    async fn recv(client: &mut Client) -> ServerMessage {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(2), client.next())
                .await
                .expect("timed out waiting for frame")
                .expect("stream ended")
                .expect("websocket error");
            if let Message::Text(text) = frame {
                return ServerMessage::from_json(&text).unwrap();
            }
        }
    }

    async fn send(client: &mut Client, msg: ClientMessage) {
        client.send(Message::Text(msg.to_json().unwrap())).await.unwrap();
    }

    async fn expect_authenticated(client: &mut Client, name: &str) {
        match recv(client).await {
            ServerMessage::AuthResult(result) => {
                assert!(result.success);
                assert_eq!(result.identity, Some(Identity::new(name)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.rooms.forfeit_timeout, Some(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_server_creation() {
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        };
        let server = GameServer::new(config, Arc::new(MemoryUserStore::new()));

        assert_eq!(server.connection_count().await, 0);
        assert_eq!(server.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_server_shutdown() {
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        };
        let server = GameServer::new(config, Arc::new(MemoryUserStore::new()));
        server.shutdown();
        // Should not panic
    }

    #[tokio::test]
    async fn test_pair_relay_and_conclude() {
        let h = Harness::start().await;

        let mut alice = h.connect(Some(&h.token("alice"))).await;
        expect_authenticated(&mut alice, "alice").await;
        assert_eq!(recv(&mut alice).await, ServerMessage::Waiting);

        let mut bob = h.connect(Some(&h.token("bob"))).await;
        expect_authenticated(&mut bob, "bob").await;

        let room_id = match recv(&mut bob).await {
            ServerMessage::Paired(info) => {
                assert_eq!(info.role, Role::Black);
                assert_eq!(info.opponent, Identity::new("alice"));
                info.room_id
            }
            other => panic!("unexpected {:?}", other),
        };
        match recv(&mut alice).await {
            ServerMessage::Paired(info) => {
                assert_eq!(info.role, Role::White);
                assert_eq!(info.opponent, Identity::new("bob"));
                assert_eq!(info.room_id, room_id);
            }
            other => panic!("unexpected {:?}", other),
        }

        let payload = MovePayload::new("e2", "e4");
        send(&mut alice, ClientMessage::Move(payload.clone())).await;
        assert_eq!(recv(&mut bob).await, ServerMessage::Move(payload));

        send(&mut bob, ClientMessage::Chat { text: "gg".into() }).await;
        assert_eq!(
            recv(&mut alice).await,
            ServerMessage::Chat {
                sender_role: Role::Black,
                sender: Identity::new("bob"),
                text: "gg".into(),
            }
        );

        send(
            &mut alice,
            ClientMessage::GameOver {
                outcome: ReportedOutcome::Winner(Identity::new("alice")),
            },
        )
        .await;

        match recv(&mut alice).await {
            ServerMessage::MatchEnd(info) => {
                assert_eq!(info.result, PersonalResult::Win);
                assert_eq!(info.reason, EndReason::Reported);
            }
            other => panic!("unexpected {:?}", other),
        }
        match recv(&mut bob).await {
            ServerMessage::MatchEnd(info) => assert_eq!(info.result, PersonalResult::Loss),
            other => panic!("unexpected {:?}", other),
        }
        match recv(&mut alice).await {
            ServerMessage::RatingUpdate(change) => assert_eq!(change.after, 608),
            other => panic!("unexpected {:?}", other),
        }
        match recv(&mut bob).await {
            ServerMessage::RatingUpdate(change) => assert_eq!(change.after, 592),
            other => panic!("unexpected {:?}", other),
        }

        assert_eq!(h.store.get_rating(&Identity::new("alice")).await.unwrap(), 608);
        assert_eq!(h.store.get_rating(&Identity::new("bob")).await.unwrap(), 592);
    }

    #[tokio::test]
    async fn test_invalid_token_closes_connection() {
        let h = Harness::start().await;
        let mut client = h.connect(Some("not-a-token")).await;

        match recv(&mut client).await {
            ServerMessage::Error(err) => assert_eq!(err.code, ErrorCode::AuthFailed),
            other => panic!("unexpected {:?}", other),
        }
        h.wait_for_connections(0).await;
    }

    #[tokio::test]
    async fn test_unknown_identity_rejected() {
        let h = Harness::start().await;
        let mut client = h.connect(Some(&h.token("mallory"))).await;

        match recv(&mut client).await {
            ServerMessage::Error(err) => assert_eq!(err.code, ErrorCode::AuthFailed),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_in_band_auth() {
        let h = Harness::start().await;
        let mut client = h.connect(None).await;

        send(&mut client, ClientMessage::FindMatch).await;
        match recv(&mut client).await {
            ServerMessage::Error(err) => assert_eq!(err.code, ErrorCode::NotAuthenticated),
            other => panic!("unexpected {:?}", other),
        }

        send(
            &mut client,
            ClientMessage::Auth(AuthRequest {
                token: h.token("alice"),
                client_version: Some("test".into()),
            }),
        )
        .await;
        expect_authenticated(&mut client, "alice").await;
        assert_eq!(recv(&mut client).await, ServerMessage::Waiting);
    }

    #[tokio::test]
    async fn test_disconnect_clears_waiting_slot() {
        let h = Harness::start().await;

        let mut alice = h.connect(Some(&h.token("alice"))).await;
        expect_authenticated(&mut alice, "alice").await;
        assert_eq!(recv(&mut alice).await, ServerMessage::Waiting);
        alice.close(None).await.unwrap();
        drop(alice);
        h.wait_for_connections(0).await;

        let mut bob = h.connect(Some(&h.token("bob"))).await;
        expect_authenticated(&mut bob, "bob").await;
        assert_eq!(recv(&mut bob).await, ServerMessage::Waiting);
        assert_eq!(h.server.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_profile_lookup() {
        let h = Harness::start().await;
        let mut alice = h.connect(Some(&h.token("alice"))).await;
        expect_authenticated(&mut alice, "alice").await;
        assert_eq!(recv(&mut alice).await, ServerMessage::Waiting);

        send(&mut alice, ClientMessage::Profile { identity: None }).await;
        assert_eq!(
            recv(&mut alice).await,
            ServerMessage::Profile(ProfileInfo {
                identity: Identity::new("alice"),
                rating: INITIAL_RATING,
                matches: Vec::new(),
            })
        );

        send(&mut alice, ClientMessage::Profile { identity: Some(Identity::new("nobody")) }).await;
        match recv(&mut alice).await {
            ServerMessage::Error(err) => assert_eq!(err.code, ErrorCode::NotFound),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_move_outside_room_rejected() {
        let h = Harness::start().await;
        let mut alice = h.connect(Some(&h.token("alice"))).await;
        expect_authenticated(&mut alice, "alice").await;
        assert_eq!(recv(&mut alice).await, ServerMessage::Waiting);

        send(&mut alice, ClientMessage::Move(MovePayload::new("e2", "e4"))).await;
        match recv(&mut alice).await {
            ServerMessage::Error(err) => assert_eq!(err.code, ErrorCode::NotInMatch),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_auth_timeout_closes_connection() {
        let h = Harness::start_with(|c| c.auth_timeout = Duration::from_millis(100)).await;
        let mut client = h.connect(None).await;

        match recv(&mut client).await {
            ServerMessage::Error(err) => assert_eq!(err.code, ErrorCode::AuthFailed),
            other => panic!("unexpected {:?}", other),
        }
        h.wait_for_connections(0).await;
    }

    #[tokio::test]
    async fn test_empty_in_band_token_rejected() {
        let h = Harness::start().await;
        let mut client = h.connect(None).await;

        send(
            &mut client,
            ClientMessage::Auth(AuthRequest { token: String::new(), client_version: None }),
        )
        .await;
        match recv(&mut client).await {
            ServerMessage::Error(err) => assert_eq!(err.code, ErrorCode::AuthFailed),
            other => panic!("unexpected {:?}", other),
        }
        h.wait_for_connections(0).await;
    }

    #[tokio::test]
    async fn test_connection_limit_sends_overloaded() {
        let h = Harness::start_with(|c| c.max_connections = 1).await;

        let mut alice = h.connect(Some(&h.token("alice"))).await;
        expect_authenticated(&mut alice, "alice").await;

        let mut extra = h.connect(Some(&h.token("bob"))).await;
        match recv(&mut extra).await {
            ServerMessage::Error(err) => assert_eq!(err.code, ErrorCode::ServerOverloaded),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.server.connection_count().await, 1);

        // The slot frees once the admitted connection is gone
        alice.close(None).await.unwrap();
        drop(alice);
        h.wait_for_connections(0).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut bob = h.connect(Some(&h.token("bob"))).await;
        expect_authenticated(&mut bob, "bob").await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_connection_burst_admits_only_limit() {
        const LIMIT: usize = 2;
        const BURST: usize = 6;
        let h = Harness::start_with(|c| c.max_connections = LIMIT).await;

        let mut tasks = Vec::new();
        for _ in 0..BURST {
            let url = format!("ws://{}/", h.addr);
            tasks.push(tokio::spawn(async move {
                let (mut client, _) = connect_async(url).await.unwrap();
                // Admitted connections stay silent until the auth deadline
                let first = tokio::time::timeout(Duration::from_millis(500), client.next()).await;
                let overloaded = match first {
                    Ok(Some(Ok(Message::Text(text)))) => matches!(
                        ServerMessage::from_json(&text),
                        Ok(ServerMessage::Error(ref err)) if err.code == ErrorCode::ServerOverloaded
                    ),
                    _ => false,
                };
                (client, overloaded)
            }));
        }

        // Keep every client open until all are counted
        let mut clients = Vec::new();
        let mut rejected = 0;
        for task in tasks {
            let (client, overloaded) = task.await.unwrap();
            if overloaded {
                rejected += 1;
            }
            clients.push(client);
        }

        assert_eq!(rejected, BURST - LIMIT);
        assert_eq!(h.server.connection_count().await, LIMIT);
    }
}
