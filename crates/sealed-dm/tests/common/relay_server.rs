//! In-process message relay for testing
//!
//! Implements the REST routes and the `/ws/messages` push socket the client
//! talks to. Stores only what it is given (ciphertext and metadata) and
//! counts read transitions so tests can check receipts land exactly once.

use axum::{
    extract::{
        ws::{Message as WsFrame, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, RwLock};

type Reply = Result<Json<Value>, StatusCode>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredKeys {
    pub user_id: String,
    pub public_key: String,
    pub identity_public_key: String,
    pub signed_pre_key: String,
    pub pre_key_signature: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredConversation {
    pub id: String,
    pub participant1_id: String,
    pub participant2_id: String,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl StoredConversation {
    fn has(&self, user: &str) -> bool {
        self.participant1_id == user || self.participant2_id == user
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub encrypted_content: String,
    pub encrypted_content_iv: String,
    pub message_type: String,
    pub is_read: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishBody {
    public_key: String,
    identity_public_key: String,
    signed_pre_key: String,
    pre_key_signature: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendBody {
    encrypted_content: String,
    encrypted_content_iv: String,
    #[serde(default)]
    message_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadBody {
    message_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateBody {
    participant_id: String,
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<usize>,
    before: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

/// One `POST /read` as received.
#[derive(Debug, Clone)]
pub struct ReadRequest {
    pub user_id: String,
    pub message_ids: Vec<String>,
}

struct RelayState {
    tokens: RwLock<HashMap<String, String>>,
    keys: RwLock<HashMap<String, StoredKeys>>,
    conversations: RwLock<Vec<StoredConversation>>,
    messages: RwLock<Vec<StoredMessage>>,
    read_requests: RwLock<Vec<ReadRequest>>,
    read_transitions: AtomicUsize,
    peer_key_lookups: AtomicUsize,
    next_message: AtomicU64,
    ws_enabled: AtomicBool,
    fail_sends: AtomicBool,
    fail_reads: AtomicBool,
    /// (recipient user id, frame)
    push: broadcast::Sender<(String, String)>,
}

impl RelayState {
    fn new() -> Self {
        let (push, _) = broadcast::channel(1000);
        Self {
            tokens: RwLock::new(HashMap::new()),
            keys: RwLock::new(HashMap::new()),
            conversations: RwLock::new(Vec::new()),
            messages: RwLock::new(Vec::new()),
            read_requests: RwLock::new(Vec::new()),
            read_transitions: AtomicUsize::new(0),
            peer_key_lookups: AtomicUsize::new(0),
            next_message: AtomicU64::new(1),
            ws_enabled: AtomicBool::new(true),
            fail_sends: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
            push,
        }
    }

    async fn user_for_token(&self, token: &str) -> Option<String> {
        self.tokens.read().await.get(token).cloned()
    }

    async fn authenticate(&self, headers: &HeaderMap) -> Result<String, StatusCode> {
        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or(StatusCode::UNAUTHORIZED)?;
        self.user_for_token(token)
            .await
            .ok_or(StatusCode::UNAUTHORIZED)
    }

    async fn conversation_for(&self, id: &str, user: &str) -> Result<StoredConversation, StatusCode> {
        let conversations = self.conversations.read().await;
        let conv = conversations
            .iter()
            .find(|c| c.id == id)
            .ok_or(StatusCode::NOT_FOUND)?;
        if !conv.has(user) {
            return Err(StatusCode::FORBIDDEN);
        }
        Ok(conv.clone())
    }

    async fn get_or_create_conversation(&self, a: &str, b: &str) -> StoredConversation {
        let mut conversations = self.conversations.write().await;
        if let Some(existing) = conversations.iter().find(|c| c.has(a) && c.has(b)) {
            return existing.clone();
        }
        let conv = StoredConversation {
            id: uuid::Uuid::new_v4().to_string(),
            participant1_id: a.to_string(),
            participant2_id: b.to_string(),
            last_message_at: None,
            created_at: Utc::now(),
        };
        conversations.push(conv.clone());
        conv
    }

    async fn store_message(
        &self,
        conversation_id: &str,
        sender_id: &str,
        encrypted_content: String,
        encrypted_content_iv: String,
        message_type: String,
    ) -> StoredMessage {
        let n = self.next_message.fetch_add(1, Ordering::SeqCst);
        let message = StoredMessage {
            id: format!("m{:06}", n),
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            encrypted_content,
            encrypted_content_iv,
            message_type,
            is_read: false,
            read_at: None,
            created_at: Utc::now(),
        };
        self.messages.write().await.push(message.clone());

        let mut conversations = self.conversations.write().await;
        if let Some(conv) = conversations.iter_mut().find(|c| c.id == conversation_id) {
            conv.last_message_at = Some(message.created_at);
            let frame = json!({
                "type": "new_message",
                "conversationId": conversation_id,
                "message": { "id": message.id },
            })
            .to_string();
            for user in [&conv.participant1_id, &conv.participant2_id] {
                let _ = self.push.send((user.clone(), frame.clone()));
            }
        }
        message
    }
}

/// Relay server for integration tests
pub struct RelayServer {
    state: Arc<RelayState>,
    addr: Option<SocketAddr>,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl RelayServer {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RelayState::new()),
            addr: None,
            shutdown_tx: None,
        }
    }

    /// Start the relay on a random available port
    pub async fn start(&mut self) -> Result<SocketAddr, std::io::Error> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        self.addr = Some(addr);

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);

        let api = Router::new()
            .route("/keys", get(get_own_keys).post(publish_keys))
            .route("/keys/:peer_id", get(get_peer_keys))
            .route("/conversations", get(list_conversations).post(create_conversation))
            .route(
                "/conversations/:id/messages",
                get(list_messages).post(send_message),
            )
            .route("/conversations/:id/read", post(mark_read))
            .route("/unread-count", get(unread_count));

        let app = Router::new()
            .nest("/api/messages", api)
            .route("/ws/messages", get(ws_handler))
            .with_state(self.state.clone());

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    shutdown_rx.recv().await;
                })
                .await
                .ok();
        });

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        Ok(addr)
    }

    pub fn api_url(&self) -> String {
        match self.addr {
            Some(addr) => format!("http://{}/api/messages", addr),
            None => panic!("relay not started"),
        }
    }

    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
    }

    /// Register a user and return their bearer token.
    pub async fn register(&self, user_id: &str) -> String {
        let token = format!("token-{}", user_id);
        self.state
            .tokens
            .write()
            .await
            .insert(token.clone(), user_id.to_string());
        token
    }

    pub async fn create_conversation(&self, a: &str, b: &str) -> String {
        self.state.get_or_create_conversation(a, b).await.id
    }

    /// Store a message as if `sender_id` had posted it, bypassing the client.
    #[allow(dead_code)]
    pub async fn inject_message(
        &self,
        conversation_id: &str,
        sender_id: &str,
        encrypted_content: &str,
        encrypted_content_iv: &str,
    ) -> String {
        self.state
            .store_message(
                conversation_id,
                sender_id,
                encrypted_content.to_string(),
                encrypted_content_iv.to_string(),
                "text".to_string(),
            )
            .await
            .id
    }

    #[allow(dead_code)]
    pub async fn messages(&self, conversation_id: &str) -> Vec<StoredMessage> {
        self.state
            .messages
            .read()
            .await
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect()
    }

    #[allow(dead_code)]
    pub async fn published_key(&self, user_id: &str) -> Option<StoredKeys> {
        self.state.keys.read().await.get(user_id).cloned()
    }

    #[allow(dead_code)]
    pub fn read_transitions(&self) -> usize {
        self.state.read_transitions.load(Ordering::SeqCst)
    }

    #[allow(dead_code)]
    pub async fn read_requests(&self) -> Vec<ReadRequest> {
        self.state.read_requests.read().await.clone()
    }

    #[allow(dead_code)]
    pub fn peer_key_lookups(&self) -> usize {
        self.state.peer_key_lookups.load(Ordering::SeqCst)
    }

    /// Refuse WebSocket upgrades so only polling delivers updates.
    #[allow(dead_code)]
    pub fn set_ws_enabled(&self, enabled: bool) {
        self.state.ws_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Answer message posts with 503.
    #[allow(dead_code)]
    pub fn set_fail_sends(&self, fail: bool) {
        self.state.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Answer read receipts with 503 without recording them.
    #[allow(dead_code)]
    pub fn set_fail_reads(&self, fail: bool) {
        self.state.fail_reads.store(fail, Ordering::SeqCst);
    }
}

impl Default for RelayServer {
    fn default() -> Self {
        Self::new()
    }
}

async fn get_own_keys(State(state): State<Arc<RelayState>>, headers: HeaderMap) -> Reply {
    let user = state.authenticate(&headers).await?;
    let keys = state.keys.read().await.get(&user).cloned();
    Ok(Json(json!({ "keys": keys })))
}

async fn publish_keys(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
    Json(body): Json<PublishBody>,
) -> Reply {
    let user = state.authenticate(&headers).await?;
    let stored = StoredKeys {
        user_id: user.clone(),
        public_key: body.public_key,
        identity_public_key: body.identity_public_key,
        signed_pre_key: body.signed_pre_key,
        pre_key_signature: body.pre_key_signature,
        created_at: Utc::now(),
    };
    state.keys.write().await.insert(user, stored.clone());
    Ok(Json(json!({ "keys": stored })))
}

async fn get_peer_keys(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
    Path(peer_id): Path<String>,
) -> Reply {
    state.authenticate(&headers).await?;
    state.peer_key_lookups.fetch_add(1, Ordering::SeqCst);
    let keys = state
        .keys
        .read()
        .await
        .get(&peer_id)
        .cloned()
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(json!({
        "userId": keys.user_id,
        "publicKey": keys.public_key,
        "identityPublicKey": keys.identity_public_key,
        "createdAt": keys.created_at,
    })))
}

async fn list_conversations(State(state): State<Arc<RelayState>>, headers: HeaderMap) -> Reply {
    let user = state.authenticate(&headers).await?;
    let conversations = state.conversations.read().await;
    let messages = state.messages.read().await;

    let listed: Vec<Value> = conversations
        .iter()
        .filter(|c| c.has(&user))
        .map(|c| {
            let unread = messages
                .iter()
                .filter(|m| m.conversation_id == c.id && m.sender_id != user && !m.is_read)
                .count();
            let mut row = serde_json::to_value(c).unwrap_or(Value::Null);
            row["unreadCount"] = json!(unread);
            row
        })
        .collect();
    Ok(Json(json!({ "conversations": listed })))
}

async fn create_conversation(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
    Json(body): Json<CreateBody>,
) -> Reply {
    let user = state.authenticate(&headers).await?;
    if body.participant_id == user {
        return Err(StatusCode::BAD_REQUEST);
    }
    let conv = state
        .get_or_create_conversation(&user, &body.participant_id)
        .await;
    Ok(Json(json!({ "conversation": conv })))
}

async fn list_messages(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<ListQuery>,
) -> Reply {
    let user = state.authenticate(&headers).await?;
    state.conversation_for(&id, &user).await?;

    let messages = state.messages.read().await;
    let mut listed: Vec<&StoredMessage> =
        messages.iter().filter(|m| m.conversation_id == id).collect();

    if let Some(before) = query.before.as_deref() {
        if let Some(pivot) = listed.iter().find(|m| m.id == before).map(|m| m.id.clone()) {
            listed.retain(|m| m.id < pivot);
        }
    }

    // newest first, cut to the page, then back to oldest first
    listed.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
    listed.truncate(query.limit.unwrap_or(50));
    listed.reverse();

    Ok(Json(json!({ "messages": listed })))
}

async fn send_message(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<SendBody>,
) -> Reply {
    let user = state.authenticate(&headers).await?;
    state.conversation_for(&id, &user).await?;
    if state.fail_sends.load(Ordering::SeqCst) {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    if body.encrypted_content.is_empty() || body.encrypted_content_iv.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let message = state
        .store_message(
            &id,
            &user,
            body.encrypted_content,
            body.encrypted_content_iv,
            body.message_type.unwrap_or_else(|| "text".to_string()),
        )
        .await;
    Ok(Json(json!({ "message": message })))
}

async fn mark_read(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<ReadBody>,
) -> Reply {
    let user = state.authenticate(&headers).await?;
    state.conversation_for(&id, &user).await?;
    if state.fail_reads.load(Ordering::SeqCst) {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    state.read_requests.write().await.push(ReadRequest {
        user_id: user.clone(),
        message_ids: body.message_ids.clone(),
    });

    let now = Utc::now();
    let mut messages = state.messages.write().await;
    for m in messages.iter_mut().filter(|m| {
        m.conversation_id == id
            && m.sender_id != user
            && !m.is_read
            && body.message_ids.contains(&m.id)
    }) {
        m.is_read = true;
        m.read_at = Some(now);
        state.read_transitions.fetch_add(1, Ordering::SeqCst);
    }
    Ok(Json(json!({ "success": true })))
}

async fn unread_count(State(state): State<Arc<RelayState>>, headers: HeaderMap) -> Reply {
    let user = state.authenticate(&headers).await?;
    let conversations = state.conversations.read().await;
    let mine: Vec<&str> = conversations
        .iter()
        .filter(|c| c.has(&user))
        .map(|c| c.id.as_str())
        .collect();
    let count = state
        .messages
        .read()
        .await
        .iter()
        .filter(|m| mine.contains(&m.conversation_id.as_str()) && m.sender_id != user && !m.is_read)
        .count();
    Ok(Json(json!({ "count": count })))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<RelayState>>,
    Query(query): Query<WsQuery>,
) -> Response {
    if !state.ws_enabled.load(Ordering::SeqCst) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let user = match query.token.as_deref() {
        Some(token) => state.user_for_token(token).await,
        None => None,
    };
    let Some(user) = user else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, user))
}

async fn handle_socket(socket: WebSocket, state: Arc<RelayState>, user: String) {
    let (mut sender, mut receiver) = socket.split();
    let mut push_rx = state.push.subscribe();

    let hello = json!({ "type": "connected", "userId": user }).to_string();
    if sender.send(WsFrame::Text(hello)).await.is_err() {
        return;
    }

    let target = user.clone();
    let send_task = tokio::spawn(async move {
        while let Ok((recipient, frame)) = push_rx.recv().await {
            if recipient != target {
                continue;
            }
            if sender.send(WsFrame::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    // Client frames are not part of the protocol under test; drain until close
    while let Some(Ok(frame)) = receiver.next().await {
        if let WsFrame::Close(_) = frame {
            break;
        }
    }

    send_task.abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_relay_starts_and_stops() {
        let mut relay = RelayServer::new();
        relay.start().await.expect("Failed to start relay");
        assert!(relay.api_url().starts_with("http://127.0.0.1:"));
        relay.stop().await;
    }
}
