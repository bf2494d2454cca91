//! HTTP and WebSocket handlers for the Parley server.
//!
//! The REST routes map one-to-one onto [`ConversationService`] operations.
//! The caller is identified by the `x-user-id` header. Live delivery is
//! offered as a WebSocket session or a single long-poll wait.

use crate::config::Config;
use crate::error::{ApiError, ApiResult};
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    async_trait,
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        FromRequestParts, Path, Query, State,
    },
    http::{header::CONTENT_TYPE, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parley_cache::{CacheConfig, MemoryCache};
use parley_core::{
    user_channels, Broker, BrokerConfig, ChannelId, Command, ConversationId, CursorMode,
    MessageId, UserId,
};
use parley_protocol::{codec, frames::codes, Frame};
use parley_service::{
    ConfigHandle, ConversationService, LogPushDispatcher, NetworkDirectory, ServiceError,
    StaticDirectory,
};
use parley_store::{ConversationStore, SqliteStore};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Header carrying the caller's user ID.
pub const USER_HEADER: &str = "x-user-id";

/// Shared server state.
pub struct AppState {
    pub service: ConversationService,
    /// Users and network membership, shared with the service.
    pub directory: Arc<StaticDirectory>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Wire the service stack over a store.
    #[must_use]
    pub fn new(config: Config, store: Arc<dyn ConversationStore>) -> Self {
        let broker = Arc::new(Broker::with_config(BrokerConfig {
            max_channels: config.limits.max_channels,
            max_subscriptions_per_session: config.limits.max_subscriptions_per_session,
            channel_capacity: config.limits.channel_capacity,
            session_buffer: config.limits.session_buffer,
        }));
        let cache = Arc::new(MemoryCache::with_config(CacheConfig {
            message_depth: config.service.message_cache,
            conversation_depth: config.service.conversation_cache,
        }));
        let directory = Arc::new(StaticDirectory::new(config.directory.users.clone()));

        let service = ConversationService::new(
            store,
            cache,
            broker,
            ConfigHandle::new(config.service.clone()),
        )
        .with_users(directory.clone())
        .with_push(Arc::new(LogPushDispatcher));

        Self {
            service,
            directory,
            config,
        }
    }

    /// Apply the reloadable parts of a new configuration.
    pub fn reload(&self, config: Config) {
        self.service.config().store(config.service);
        for entry in config.directory.users {
            self.directory.insert(entry);
        }
        info!(users = self.directory.len(), "directory reloaded");
    }
}

/// Open the configured store.
///
/// # Errors
///
/// Returns an error if the database cannot be opened or migrated.
pub fn open_store(config: &Config) -> Result<Arc<dyn ConversationStore>> {
    let store = match config.database.file() {
        Some(path) => {
            info!("Opening database at {}", path.display());
            SqliteStore::open(&path)?
        }
        None => {
            warn!("Using an in-memory database; conversations will not survive a restart");
            SqliteStore::open_in_memory()?
        }
    };
    Ok(Arc::new(store))
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/conversations",
            get(list_conversations).post(create_conversation),
        )
        .route("/conversations/unexpire", post(unexpire_conversation))
        .route(
            "/conversations/:id",
            get(get_conversation).delete(delete_conversation),
        )
        .route("/conversations/:id/terminate", post(terminate_conversation))
        .route(
            "/conversations/:id/messages",
            get(get_messages).post(post_message),
        )
        .route("/conversations/:id/seen", put(mark_seen))
        .route("/conversations/:id/participants", post(add_participants))
        .route("/conversations/:id/mute", put(set_muted))
        .route("/conversations/:id/expiry", put(set_expiry))
        .route("/conversations/:id/typing", post(typing))
        .route("/presence", post(presence))
        .route("/unread", get(unread))
        .route("/longpoll", get(longpoll))
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server until interrupted.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let store = open_store(&config)?;
    let state = Arc::new(AppState::new(config.clone(), store));

    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    #[cfg(unix)]
    spawn_reload(Arc::clone(&state));

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Parley server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app(Arc::clone(&state)))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Draining background work");
    state.service.drain().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown requested");
}

#[cfg(unix)]
fn spawn_reload(state: Arc<AppState>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            warn!("SIGHUP reload disabled: {}", e);
            return;
        }
    };

    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            match Config::load() {
                Ok(config) => state.reload(config),
                Err(e) => warn!(error = %e, "configuration reload failed; keeping current"),
            }
        }
    });
}

/// The authenticated caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller(pub UserId);

#[async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<UserId>().ok())
            .filter(|id| *id != 0)
            .map(Caller)
            .ok_or_else(|| ApiError::unauthorized(format!("missing or invalid {USER_HEADER}")))
    }
}

// --- request bodies ------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreateConversation {
    participants: Vec<UserId>,
    #[serde(default)]
    primary: bool,
    #[serde(default)]
    expiring: bool,
    /// Require every participant to belong to this network.
    network: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    start: usize,
    count: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct MessagesQuery {
    mode: Option<String>,
    #[serde(default)]
    cursor: u64,
    count: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct PostMessage {
    text: String,
}

#[derive(Debug, Deserialize)]
struct Seen {
    message: MessageId,
}

#[derive(Debug, Deserialize)]
struct Participants {
    users: Vec<UserId>,
}

#[derive(Debug, Deserialize)]
struct Unexpire {
    participants: Vec<UserId>,
}

#[derive(Debug, Deserialize)]
struct Mute {
    muted: bool,
}

#[derive(Debug, Deserialize)]
struct ExpiryUpdate {
    expiry: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct Typing {
    typing: bool,
}

#[derive(Debug, Deserialize)]
struct PresenceUpdate {
    form: String,
}

#[derive(Debug, Deserialize)]
struct LongpollQuery {
    timeout_ms: Option<u64>,
}

// --- conversations -------------------------------------------------------

async fn create_conversation(
    State(state): State<Arc<AppState>>,
    Caller(user): Caller,
    Json(body): Json<CreateConversation>,
) -> ApiResult<impl IntoResponse> {
    if body.participants.is_empty() {
        return Err(ApiError::bad_request("participants must not be empty"));
    }

    if let Some(network) = body.network {
        for member in std::iter::once(user).chain(body.participants.iter().copied()) {
            if !state.directory.user_in_network(member, network).await {
                debug!(user = member, network, "participant outside network");
                return Err(ApiError::forbidden(format!(
                    "user {member} is not in network {network}"
                )));
            }
        }
    }

    let conversation = state
        .service
        .create_conversation(user, &body.participants, body.primary, body.expiring)
        .await?;
    Ok((StatusCode::CREATED, Json(conversation)))
}

async fn list_conversations(
    State(state): State<Arc<AppState>>,
    Caller(user): Caller,
    Query(query): Query<ListQuery>,
) -> ApiResult<impl IntoResponse> {
    let conversations = state
        .service
        .get_conversations(user, query.start, query.count)
        .await?;
    Ok(Json(conversations))
}

async fn unexpire_conversation(
    State(state): State<Arc<AppState>>,
    Caller(user): Caller,
    Json(body): Json<Unexpire>,
) -> ApiResult<impl IntoResponse> {
    let mut users = vec![user];
    users.extend(body.participants.into_iter().filter(|id| *id != user));

    let conversation = state.service.un_expire_between(&users).await?;
    Ok(Json(json!({ "conversation": conversation })))
}

async fn get_conversation(
    State(state): State<Arc<AppState>>,
    Caller(user): Caller,
    Path(id): Path<ConversationId>,
) -> ApiResult<impl IntoResponse> {
    let conversation = state.service.get_conversation(user, id).await?;
    Ok(Json(conversation))
}

async fn delete_conversation(
    State(state): State<Arc<AppState>>,
    Caller(user): Caller,
    Path(id): Path<ConversationId>,
) -> ApiResult<StatusCode> {
    state.service.delete_conversation(user, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn terminate_conversation(
    State(state): State<Arc<AppState>>,
    Caller(user): Caller,
    Path(id): Path<ConversationId>,
) -> ApiResult<StatusCode> {
    state.service.terminate_conversation(user, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn add_participants(
    State(state): State<Arc<AppState>>,
    Caller(user): Caller,
    Path(id): Path<ConversationId>,
    Json(body): Json<Participants>,
) -> ApiResult<impl IntoResponse> {
    let added = state.service.add_participants(user, id, &body.users).await?;
    Ok(Json(json!({ "added": added })))
}

async fn set_muted(
    State(state): State<Arc<AppState>>,
    Caller(user): Caller,
    Path(id): Path<ConversationId>,
    Json(body): Json<Mute>,
) -> ApiResult<StatusCode> {
    state.service.set_muted(user, id, body.muted).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_expiry(
    State(state): State<Arc<AppState>>,
    Caller(user): Caller,
    Path(id): Path<ConversationId>,
    Json(body): Json<ExpiryUpdate>,
) -> ApiResult<StatusCode> {
    state.service.set_expiry(user, id, body.expiry).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn unread(
    State(state): State<Arc<AppState>>,
    Caller(user): Caller,
) -> ApiResult<impl IntoResponse> {
    let unread = state.service.unread_count(user).await?;
    Ok(Json(json!({ "unread": unread })))
}

// --- messages ------------------------------------------------------------

async fn get_messages(
    State(state): State<Arc<AppState>>,
    Caller(user): Caller,
    Path(id): Path<ConversationId>,
    Query(query): Query<MessagesQuery>,
) -> ApiResult<impl IntoResponse> {
    let started = Instant::now();
    let mode: CursorMode = query
        .mode
        .as_deref()
        .unwrap_or("start")
        .parse()
        .map_err(ServiceError::from)?;

    let messages = state
        .service
        .get_messages(user, id, query.cursor, mode, query.count)
        .await?;
    metrics::record_request("get_messages", started.elapsed().as_secs_f64());
    Ok(Json(messages))
}

async fn post_message(
    State(state): State<Arc<AppState>>,
    Caller(user): Caller,
    Path(id): Path<ConversationId>,
    Json(body): Json<PostMessage>,
) -> ApiResult<impl IntoResponse> {
    let started = Instant::now();
    if body.text.trim().is_empty() {
        return Err(ApiError::bad_request("message text must not be empty"));
    }
    if body.text.len() > state.config.limits.max_message_size {
        return Err(ApiError::bad_request(format!(
            "message text exceeds {} bytes",
            state.config.limits.max_message_size
        )));
    }

    let message = state.service.add_message(user, id, &body.text).await?;
    metrics::record_request("post_message", started.elapsed().as_secs_f64());
    Ok((StatusCode::CREATED, Json(message)))
}

async fn mark_seen(
    State(state): State<Arc<AppState>>,
    Caller(user): Caller,
    Path(id): Path<ConversationId>,
    Json(body): Json<Seen>,
) -> ApiResult<impl IntoResponse> {
    let last_read = state
        .service
        .mark_conversation_seen(user, id, body.message)
        .await?;
    Ok(Json(json!({ "last_read": last_read })))
}

// --- presence ------------------------------------------------------------

async fn typing(
    State(state): State<Arc<AppState>>,
    Caller(user): Caller,
    Path(id): Path<ConversationId>,
    Json(body): Json<Typing>,
) -> ApiResult<impl IntoResponse> {
    let delivered = state
        .service
        .notifier()
        .broadcast_typing(user, id, body.typing)
        .await?;
    Ok(Json(json!({ "delivered": delivered })))
}

async fn presence(
    State(state): State<Arc<AppState>>,
    Caller(user): Caller,
    Json(body): Json<PresenceUpdate>,
) -> ApiResult<impl IntoResponse> {
    let delivered = state
        .service
        .notifier()
        .broadcast_presence(user, &body.form)?;
    Ok(Json(json!({ "delivered": delivered })))
}

// --- live delivery -------------------------------------------------------

/// Wait for the next event on the caller's channels.
///
/// Answers `204 No Content` when nothing arrives in time.
async fn longpoll(
    State(state): State<Arc<AppState>>,
    Caller(user): Caller,
    Query(query): Query<LongpollQuery>,
) -> ApiResult<Response> {
    let limit = state.config.transport.longpoll_timeout_ms;
    let timeout = Duration::from_millis(query.timeout_ms.unwrap_or(limit).min(limit));

    match state.service.await_event(user, timeout).await? {
        Some(payload) => {
            metrics::record_longpoll("event");
            Ok(([(CONTENT_TYPE, "application/json")], payload.body.clone()).into_response())
        }
        None => {
            metrics::record_longpoll("timeout");
            Ok(StatusCode::NO_CONTENT.into_response())
        }
    }
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.service.broker().stats();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "channels": stats.channel_count,
        "sessions": stats.session_count,
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Caller(user): Caller,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state, user))
}

type WsSender = SplitSink<WebSocket, WsMessage>;

/// Drive a live session over a WebSocket.
///
/// The session starts on the caller's own channels. It ends when the socket
/// closes, the heartbeat times out, or the session tears down.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, user: UserId) {
    let _metrics_guard = ConnectionMetricsGuard::new();
    let broker = state.service.broker();

    let subscription = match state.service.subscribe(user, Vec::new()) {
        Ok(subscription) => subscription,
        Err(e) => {
            warn!(user, error = %e, "Failed to open live session");
            metrics::record_error("subscribe");
            return;
        }
    };
    let (session_id, mut payloads, commands) = subscription.into_parts();
    metrics::set_active_channels(broker.stats().channel_count);
    debug!(session = %session_id, user, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    let heartbeat = &state.config.heartbeat;
    let connected = Frame::connected(
        &session_id,
        u32::try_from(heartbeat.interval_ms).unwrap_or(u32::MAX),
        user_channels(user),
    );
    if send_frame(&mut sender, &connected).await.is_err() {
        error!(session = %session_id, "Failed to send Connected frame");
        return;
    }

    let timeout = Duration::from_millis(heartbeat.timeout_ms);
    let mut ticker = tokio::time::interval(Duration::from_millis(heartbeat.interval_ms.max(1)));
    ticker.tick().await;
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            payload = payloads.recv() => {
                let Some(payload) = payload else {
                    debug!(session = %session_id, "Session ended");
                    break;
                };
                let data = match payload.json() {
                    Ok(data) => data,
                    Err(e) => {
                        warn!(session = %session_id, error = %e, "Undecodable payload");
                        continue;
                    }
                };
                let frame = Frame::event(payload.channel.clone(), data);
                if send_frame(&mut sender, &frame).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        last_seen = Instant::now();
                        metrics::record_frame(text.len(), "inbound");
                        if let Some(reply) = handle_frame(&text, user, &state, &commands).await {
                            if send_frame(&mut sender, &reply).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(WsMessage::Binary(_))) => {
                        last_seen = Instant::now();
                        let reply = Frame::error(0, codes::BAD_FRAME, "frames are JSON text");
                        if send_frame(&mut sender, &reply).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        last_seen = Instant::now();
                        if sender.send(WsMessage::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Pong(_))) => {
                        last_seen = Instant::now();
                    }
                    Some(Ok(WsMessage::Close(_))) => {
                        debug!(session = %session_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(session = %session_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(session = %session_id, "WebSocket stream ended");
                        break;
                    }
                }
            }

            _ = ticker.tick() => {
                if last_seen.elapsed() > timeout {
                    debug!(session = %session_id, "Heartbeat timed out");
                    break;
                }
                let ping = Frame::Ping {
                    timestamp: u64::try_from(Utc::now().timestamp_millis()).ok(),
                };
                if send_frame(&mut sender, &ping).await.is_err() {
                    break;
                }
            }
        }
    }

    // Dropping the command sender tears the session down.
    drop(commands);
    drop(payloads);
    metrics::set_active_channels(broker.stats().channel_count);

    debug!(session = %session_id, "WebSocket disconnected");
}

/// Handle one client frame, returning the reply if any.
async fn handle_frame(
    text: &str,
    user: UserId,
    state: &AppState,
    commands: &mpsc::Sender<Command>,
) -> Option<Frame> {
    let frame = match codec::decode(text) {
        Ok(frame) => frame,
        Err(e) => return Some(Frame::error(0, codes::BAD_FRAME, e.to_string())),
    };

    match frame {
        Frame::Subscribe { id, channels } => Some(
            apply_command(id, user, state, commands, channels, Command::Subscribe).await,
        ),
        Frame::Unsubscribe { id, channels } => Some(
            apply_command(id, user, state, commands, channels, Command::Unsubscribe).await,
        ),
        Frame::Ping { timestamp } => Some(Frame::pong(timestamp)),
        Frame::Pong { .. } => None,
        other => {
            warn!(user, kind = other.kind(), "Unexpected frame type");
            Some(Frame::error(
                0,
                codes::BAD_FRAME,
                format!("unexpected {} frame", other.kind()),
            ))
        }
    }
}

async fn apply_command(
    id: u64,
    user: UserId,
    state: &AppState,
    commands: &mpsc::Sender<Command>,
    channels: Vec<ChannelId>,
    command: fn(Vec<ChannelId>) -> Command,
) -> Frame {
    if channels.is_empty() {
        return Frame::error(id, codes::INVALID_CHANNEL, "no channels given");
    }
    if let Err(e) = state.service.authorize_channels(user, &channels) {
        debug!(user, ?channels, "Channel change refused");
        return Frame::error(id, codes::NOT_ALLOWED, e.to_string());
    }
    match commands.send(command(channels)).await {
        Ok(()) => Frame::ack(id),
        Err(_) => Frame::error(id, codes::SESSION_CLOSED, "session closed"),
    }
}

/// Send a frame to the WebSocket.
async fn send_frame(sender: &mut WsSender, frame: &Frame) -> Result<()> {
    let text = codec::encode(frame)?;
    metrics::record_frame(text.len(), "outbound");
    sender.send(WsMessage::Text(text)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use parley_service::DirectoryEntry;
    use serde_json::Value;
    use tower::ServiceExt;

    fn state() -> Arc<AppState> {
        let mut config = Config::default();
        config.transport.longpoll_timeout_ms = 50;
        config.directory.users = (1..=3)
            .map(|id| DirectoryEntry {
                id,
                name: format!("user{id}"),
                avatar: None,
                networks: if id < 3 { vec![7] } else { Vec::new() },
            })
            .collect();

        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        Arc::new(AppState::new(config, store))
    }

    async fn call(
        state: &Arc<AppState>,
        method: &str,
        uri: &str,
        user: Option<UserId>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            request = request.header(USER_HEADER, user.to_string());
        }
        let request = match body {
            Some(body) => request
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string())),
            None => request.body(Body::empty()),
        }
        .unwrap();

        let response = app(Arc::clone(state)).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn create(state: &Arc<AppState>, user: UserId, others: &[UserId]) -> u64 {
        let (status, body) = call(
            state,
            "POST",
            "/conversations",
            Some(user),
            Some(json!({ "participants": others })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        body["id"].as_u64().unwrap()
    }

    #[tokio::test]
    async fn test_missing_caller_is_unauthorized() {
        let state = state();
        let (status, body) = call(&state, "GET", "/conversations", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "unauthorized");

        let (status, _) = call(&state, "GET", "/conversations", Some(0), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_message_flow() {
        let state = state();
        let conv = create(&state, 1, &[2]).await;

        let (status, message) = call(
            &state,
            "POST",
            &format!("/conversations/{conv}/messages"),
            Some(2),
            Some(json!({ "text": "hello" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        state.service.drain().await;

        let (status, page) = call(
            &state,
            "GET",
            &format!("/conversations/{conv}/messages?mode=start&count=10"),
            Some(1),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page.as_array().unwrap().len(), 1);
        assert_eq!(page[0]["text"], "hello");

        let (_, unread) = call(&state, "GET", "/unread", Some(1), None).await;
        assert_eq!(unread["unread"], 1);

        let (status, seen) = call(
            &state,
            "PUT",
            &format!("/conversations/{conv}/seen"),
            Some(1),
            Some(json!({ "message": message["id"] })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(seen["last_read"], message["id"]);

        let (_, unread) = call(&state, "GET", "/unread", Some(1), None).await;
        assert_eq!(unread["unread"], 0);

        let (status, list) = call(&state, "GET", "/conversations", Some(2), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list[0]["id"], conv);
    }

    #[tokio::test]
    async fn test_request_errors() {
        let state = state();
        let conv = create(&state, 1, &[2]).await;

        let (status, body) = call(
            &state,
            "GET",
            &format!("/conversations/{conv}"),
            Some(3),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "forbidden");

        let (status, _) = call(
            &state,
            "GET",
            &format!("/conversations/{conv}/messages?mode=sideways"),
            Some(1),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &state,
            "POST",
            &format!("/conversations/{conv}/messages"),
            Some(1),
            Some(json!({ "text": "   " })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&state, "DELETE", "/conversations/999", Some(1), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(
            &state,
            "POST",
            "/presence",
            Some(1),
            Some(json!({ "form": "toaster" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_network_restricted_create() {
        let state = state();

        let (status, _) = call(
            &state,
            "POST",
            "/conversations",
            Some(1),
            Some(json!({ "participants": [3], "network": 7 })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = call(
            &state,
            "POST",
            "/conversations",
            Some(1),
            Some(json!({ "participants": [2], "network": 7, "primary": true })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["primary"], true);
    }

    #[tokio::test]
    async fn test_delete_then_terminate() {
        let state = state();
        let conv = create(&state, 1, &[2]).await;

        let (status, _) = call(
            &state,
            "DELETE",
            &format!("/conversations/{conv}"),
            Some(1),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        state.service.drain().await;

        let (_, list) = call(&state, "GET", "/conversations", Some(1), None).await;
        assert!(list.as_array().unwrap().is_empty());

        let (status, _) = call(
            &state,
            "POST",
            &format!("/conversations/{conv}/terminate"),
            Some(2),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        state.service.drain().await;

        let (_, list) = call(&state, "GET", "/conversations", Some(2), None).await;
        assert!(list.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_typing_reaches_nobody_offline() {
        let state = state();
        let conv = create(&state, 1, &[2]).await;

        let (status, body) = call(
            &state,
            "POST",
            &format!("/conversations/{conv}/typing"),
            Some(1),
            Some(json!({ "typing": true })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["delivered"], 0);
    }

    #[tokio::test]
    async fn test_longpoll_times_out_empty() {
        let state = state();
        let (status, body) = call(&state, "GET", "/longpoll?timeout_ms=10", Some(1), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(body, Value::Null);
    }

    #[tokio::test]
    async fn test_health() {
        let state = state();
        let (status, body) = call(&state, "GET", "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_frame_commands() {
        let state = state();
        let (tx, mut rx) = mpsc::channel(4);

        let reply = handle_frame(
            r#"{"type":"subscribe","id":3,"channels":["c:1"]}"#,
            1,
            &state,
            &tx,
        )
        .await;
        assert_eq!(reply, Some(Frame::ack(3)));
        assert_eq!(
            rx.recv().await,
            Some(Command::Subscribe(vec!["c:1".to_string()]))
        );

        let reply = handle_frame(
            r#"{"type":"subscribe","id":4,"channels":["c:2"]}"#,
            1,
            &state,
            &tx,
        )
        .await;
        assert!(matches!(
            reply,
            Some(Frame::Error { id: 4, code: codes::NOT_ALLOWED, .. })
        ));

        let reply = handle_frame("{oops", 1, &state, &tx).await;
        assert!(matches!(
            reply,
            Some(Frame::Error { code: codes::BAD_FRAME, .. })
        ));

        drop(rx);
        let reply = handle_frame(
            r#"{"type":"unsubscribe","id":5,"channels":["1"]}"#,
            1,
            &state,
            &tx,
        )
        .await;
        assert!(matches!(
            reply,
            Some(Frame::Error { id: 5, code: codes::SESSION_CLOSED, .. })
        ));

        let reply = handle_frame(r#"{"type":"ping","timestamp":9}"#, 1, &state, &tx).await;
        assert_eq!(reply, Some(Frame::pong(Some(9))));
    }
}
