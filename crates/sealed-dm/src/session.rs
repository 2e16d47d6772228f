//! One open conversation view.
//!
//! A session owns four background tasks that share a single shutdown
//! signal: the key pipeline (identity, publish, peer key, derivation), the
//! WebSocket push listener, the poll timer and the driver that turns sync
//! triggers into refetches. Closing or dropping the session stops all four.

use crate::api::ApiClient;
use crate::cache::DecryptCache;
use crate::cipher;
use crate::conversation_keys::{ConversationKey, ConversationKeyStore};
use crate::identity::IdentityKeyManager;
use crate::peer_keys::PeerKeyResolver;
use crate::shutdown::{shutdown_channel, ShutdownHandle, ShutdownSignal};
use crate::sync::{SyncChannel, SyncTrigger};
use crate::{
    ClientConfig, DecryptionFailure, Error, Message, MessageType, Result, SendMessageRequest,
};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    KeysInitializing,
    AwaitingPeerKey,
    Ready,
    /// The peer never published a key. Left only through `retry_key_setup`.
    PeerUnavailable,
    /// Key setup hit a non-retryable error (publish rejected, relay down).
    Failed(String),
    Closed,
}

impl SessionState {
    /// No further transition happens without a user action.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            SessionState::Ready
                | SessionState::PeerUnavailable
                | SessionState::Failed(_)
                | SessionState::Closed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Plaintext(String),
    Undecryptable(DecryptionFailure),
    /// The conversation key is not established yet.
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayMessage {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub message_type: MessageType,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
    pub is_own: bool,
    pub body: MessageBody,
}

impl DisplayMessage {
    pub fn text(&self) -> Option<&str> {
        match &self.body {
            MessageBody::Plaintext(text) => Some(text),
            _ => None,
        }
    }
}

/// Read receipts this session has sent or is sending.
#[derive(Default)]
struct ReadLedger {
    acknowledged: HashSet<String>,
    in_flight: HashSet<String>,
    /// Ids this user authored; never acknowledged.
    own: HashSet<String>,
}

struct Inner {
    conversation_id: String,
    peer_id: String,
    peer_name: String,
    user_id: String,
    message_page: usize,
    api: ApiClient,
    identity: Arc<IdentityKeyManager>,
    resolver: PeerKeyResolver,
    keys: ConversationKeyStore,
    cache: Mutex<DecryptCache>,
    reads: Mutex<ReadLedger>,
    refresh_lock: tokio::sync::Mutex<()>,
    state_tx: watch::Sender<SessionState>,
    messages_tx: watch::Sender<Vec<DisplayMessage>>,
    status_tx: watch::Sender<Option<String>>,
}

pub struct ConversationSession {
    inner: Arc<Inner>,
    shutdown: ShutdownHandle,
    sync: Mutex<Option<SyncChannel>>,
    key_task: Mutex<Option<JoinHandle<()>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl ConversationSession {
    /// Start a session for `conversation_id` with `peer_id`. Must be called
    /// inside a tokio runtime; returns immediately while keys are set up in
    /// the background.
    pub fn open(
        config: &ClientConfig,
        api: ApiClient,
        identity: Arc<IdentityKeyManager>,
        conversation_id: impl Into<String>,
        peer_id: impl Into<String>,
        peer_name: impl Into<String>,
    ) -> Self {
        let conversation_id = conversation_id.into();
        let (state_tx, _) = watch::channel(SessionState::Uninitialized);
        let (messages_tx, _) = watch::channel(Vec::new());
        let (status_tx, _) = watch::channel(None);

        let inner = Arc::new(Inner {
            user_id: identity.user_id().to_string(),
            conversation_id: conversation_id.clone(),
            peer_id: peer_id.into(),
            peer_name: peer_name.into(),
            message_page: config.message_page,
            resolver: PeerKeyResolver::new(api.clone(), config.key_retry),
            api: api.clone(),
            identity,
            keys: ConversationKeyStore::new(),
            cache: Mutex::new(DecryptCache::new(config.decrypt_cache_capacity)),
            reads: Mutex::new(ReadLedger::default()),
            refresh_lock: tokio::sync::Mutex::new(()),
            state_tx,
            messages_tx,
            status_tx,
        });

        let (shutdown, signal) = shutdown_channel();
        let (sync, triggers) =
            SyncChannel::start(config, api.auth().clone(), &conversation_id, signal.clone());
        // history renders as pending until the key is ready
        sync.request(SyncTrigger::Manual);

        let driver = tokio::spawn(drive(inner.clone(), triggers, signal));
        tracing::debug!(conversation_id = %inner.conversation_id, peer_id = %inner.peer_id, "session opened");

        let session = Self {
            inner,
            shutdown,
            sync: Mutex::new(Some(sync)),
            key_task: Mutex::new(None),
            driver: Mutex::new(Some(driver)),
        };
        session.spawn_key_pipeline();
        session
    }

    pub fn conversation_id(&self) -> &str {
        &self.inner.conversation_id
    }

    pub fn peer_id(&self) -> &str {
        &self.inner.peer_id
    }

    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn current_state(&self) -> SessionState {
        self.inner.state_tx.borrow().clone()
    }

    pub fn messages(&self) -> watch::Receiver<Vec<DisplayMessage>> {
        self.inner.messages_tx.subscribe()
    }

    pub fn status(&self) -> watch::Receiver<Option<String>> {
        self.inner.status_tx.subscribe()
    }

    /// Waiting or error text for the user, if any.
    pub fn status_line(&self) -> Option<String> {
        self.inner.status_tx.borrow().clone()
    }

    pub fn is_push_connected(&self) -> bool {
        self.sync
            .lock()
            .ok()
            .and_then(|s| s.as_ref().map(|s| s.is_push_connected()))
            .unwrap_or(false)
    }

    /// Resolves with the first state that needs no further background work.
    pub async fn settled(&self) -> SessionState {
        let mut rx = self.state();
        let state = match rx.wait_for(|s| s.is_settled()).await {
            Ok(state) => state.clone(),
            Err(_) => SessionState::Closed,
        };
        state
    }

    /// Encrypt and post `text`. Nothing is committed locally if the relay
    /// rejects it; the refreshed view shows the message once stored.
    pub async fn send(&self, text: &str) -> Result<Message> {
        if self.shutdown.is_triggered() {
            return Err(Error::SessionClosed);
        }
        if *self.inner.state_tx.borrow() != SessionState::Ready {
            return Err(Error::EncryptionNotReady);
        }
        if text.trim().is_empty() {
            return Err(Error::EmptyMessage);
        }
        let key = self
            .inner
            .keys
            .get(&self.inner.conversation_id)
            .ok_or(Error::EncryptionNotReady)?;

        let payload = cipher::encrypt(&key, text)?;
        let request = SendMessageRequest {
            encrypted_content: payload.ciphertext,
            encrypted_content_iv: payload.iv,
            message_type: MessageType::Text,
        };
        let sent = self
            .inner
            .api
            .send_message(&self.inner.conversation_id, &request)
            .await?;
        tracing::debug!(conversation_id = %self.inner.conversation_id, message_id = %sent.id, "message sent");

        if let Ok(mut cache) = self.inner.cache.lock() {
            cache.insert(&sent.id, text.to_string());
        }
        if let Ok(mut reads) = self.inner.reads.lock() {
            reads.own.insert(sent.id.clone());
        }
        if let Err(err) = self.inner.refresh().await {
            tracing::warn!(conversation_id = %self.inner.conversation_id, error = err.class(), "refresh after send failed");
        }
        Ok(sent)
    }

    /// Refetch, decrypt and publish the view, then acknowledge unread peer messages.
    pub async fn refresh(&self) -> Result<Vec<DisplayMessage>> {
        if self.shutdown.is_triggered() {
            return Err(Error::SessionClosed);
        }
        self.inner.refresh().await
    }

    /// Acknowledge `message_ids`. Own messages and ids already acknowledged
    /// or in flight are skipped. Returns how many ids this call submitted.
    pub async fn mark_read(&self, message_ids: &[String]) -> Result<usize> {
        if self.shutdown.is_triggered() {
            return Err(Error::SessionClosed);
        }
        self.inner.mark_read(message_ids).await
    }

    /// Restart key setup after `PeerUnavailable` or `Failed`. Returns
    /// `false` when the session is in any other state.
    pub fn retry_key_setup(&self) -> Result<bool> {
        if self.shutdown.is_triggered() {
            return Err(Error::SessionClosed);
        }
        let current = self.current_state();
        if !matches!(
            current,
            SessionState::PeerUnavailable | SessionState::Failed(_)
        ) {
            return Ok(false);
        }
        tracing::info!(conversation_id = %self.inner.conversation_id, "retrying key setup");
        self.inner.set_status(None);
        self.inner.set_state(SessionState::Uninitialized);
        self.spawn_key_pipeline();
        Ok(true)
    }

    /// Stop every background task and move to `Closed`. Idempotent.
    pub fn close(&self) {
        if self.shutdown.is_triggered() {
            return;
        }
        self.shutdown.trigger();

        for slot in [&self.key_task, &self.driver] {
            if let Ok(mut task) = slot.lock() {
                if let Some(task) = task.take() {
                    task.abort();
                }
            }
        }
        if let Ok(mut sync) = self.sync.lock() {
            if let Some(mut sync) = sync.take() {
                sync.stop();
            }
        }

        self.inner.keys.clear();
        if let Ok(mut cache) = self.inner.cache.lock() {
            cache.clear();
        }
        self.inner.state_tx.send_replace(SessionState::Closed);
        self.inner.set_status(None);
        tracing::debug!(conversation_id = %self.inner.conversation_id, "session closed");
    }

    fn spawn_key_pipeline(&self) {
        let task = tokio::spawn(establish_keys(self.inner.clone(), self.shutdown.signal()));
        if let Ok(mut slot) = self.key_task.lock() {
            if let Some(previous) = slot.replace(task) {
                previous.abort();
            }
        }
    }
}

impl Drop for ConversationSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl Inner {
    fn set_state(&self, next: SessionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == SessionState::Closed || *current == next {
                return false;
            }
            tracing::debug!(conversation_id = %self.conversation_id, from = ?current, to = ?next, "session state");
            *current = next;
            true
        });
    }

    fn set_status(&self, line: Option<String>) {
        self.status_tx.send_if_modified(|current| {
            if *current == line {
                return false;
            }
            *current = line;
            true
        });
    }

    fn is_ready(&self) -> bool {
        *self.state_tx.borrow() == SessionState::Ready
    }

    async fn refresh(&self) -> Result<Vec<DisplayMessage>> {
        let _serial = self.refresh_lock.lock().await;

        let mut fetched = self
            .api
            .list_messages(&self.conversation_id, Some(self.message_page), None)
            .await?;
        fetched.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });

        let key = if self.is_ready() {
            self.keys.get(&self.conversation_id)
        } else {
            None
        };

        if let Ok(mut reads) = self.reads.lock() {
            reads.own.extend(
                fetched
                    .iter()
                    .filter(|m| m.sender_id == self.user_id)
                    .map(|m| m.id.clone()),
            );
        }

        let view: Vec<DisplayMessage> = {
            let mut cache = self
                .cache
                .lock()
                .map_err(|_| Error::Storage("decrypt cache poisoned".to_string()))?;
            fetched
                .iter()
                .map(|m| self.render(m, key.as_deref(), &mut cache))
                .collect()
        };
        self.messages_tx.send_replace(view.clone());
        tracing::trace!(conversation_id = %self.conversation_id, count = view.len(), "view refreshed");

        let unread: Vec<String> = fetched
            .iter()
            .filter(|m| m.sender_id != self.user_id && !m.is_read)
            .map(|m| m.id.clone())
            .collect();
        if !unread.is_empty() {
            if let Err(err) = self.mark_read(&unread).await {
                tracing::warn!(conversation_id = %self.conversation_id, error = err.class(), "read receipt failed");
            }
        }

        // a receipt may have landed while the view was being published
        if let Ok(reads) = self.reads.lock() {
            return Ok(with_acknowledged(view, &reads.acknowledged));
        }
        Ok(view)
    }

    fn render(
        &self,
        message: &Message,
        key: Option<&ConversationKey>,
        cache: &mut DecryptCache,
    ) -> DisplayMessage {
        let body = if let Some(text) = cache.get(&message.id) {
            MessageBody::Plaintext(text.to_string())
        } else {
            match key {
                None => MessageBody::Pending,
                Some(key) => match cipher::decrypt(key, &message.ciphertext, &message.iv) {
                    Ok(text) => {
                        cache.insert(&message.id, text.clone());
                        MessageBody::Plaintext(text)
                    }
                    Err(failure) => {
                        tracing::debug!(
                            conversation_id = %self.conversation_id,
                            message_id = %message.id,
                            %failure,
                            "message could not be decrypted"
                        );
                        MessageBody::Undecryptable(failure)
                    }
                },
            }
        };

        DisplayMessage {
            id: message.id.clone(),
            conversation_id: message.conversation_id.clone(),
            sender_id: message.sender_id.clone(),
            message_type: message.message_type,
            is_read: message.is_read,
            created_at: message.created_at,
            is_own: message.sender_id == self.user_id,
            body,
        }
    }

    async fn mark_read(&self, message_ids: &[String]) -> Result<usize> {
        let batch: Vec<String> = {
            let mut reads = self
                .reads
                .lock()
                .map_err(|_| Error::Storage("read ledger poisoned".to_string()))?;
            let ReadLedger {
                acknowledged,
                in_flight,
                own,
            } = &mut *reads;
            message_ids
                .iter()
                .filter(|id| {
                    !own.contains(*id)
                        && !acknowledged.contains(*id)
                        && in_flight.insert((*id).clone())
                })
                .cloned()
                .collect()
        };
        if batch.is_empty() {
            return Ok(0);
        }

        let outcome = self.api.mark_read(&self.conversation_id, &batch).await;

        let mut reads = self
            .reads
            .lock()
            .map_err(|_| Error::Storage("read ledger poisoned".to_string()))?;
        for id in &batch {
            reads.in_flight.remove(id);
        }
        match outcome {
            Ok(()) => {
                reads.acknowledged.extend(batch.iter().cloned());
                drop(reads);
                let done: HashSet<&String> = batch.iter().collect();
                self.messages_tx.send_if_modified(|view| {
                    let mut changed = false;
                    let acked = view
                        .iter_mut()
                        .filter(|m| !m.is_own && !m.is_read && done.contains(&m.id));
                    for m in acked {
                        m.is_read = true;
                        changed = true;
                    }
                    changed
                });
                tracing::debug!(conversation_id = %self.conversation_id, count = batch.len(), "messages marked read");
                Ok(batch.len())
            }
            Err(err) => Err(err),
        }
    }
}

fn with_acknowledged(mut view: Vec<DisplayMessage>, acknowledged: &HashSet<String>) -> Vec<DisplayMessage> {
    for m in view.iter_mut() {
        if !m.is_own && acknowledged.contains(&m.id) {
            m.is_read = true;
        }
    }
    view
}

/// Identity, publish, peer key, derivation. Ends in `Ready`,
/// `PeerUnavailable` or `Failed`, or silently on shutdown.
async fn establish_keys(inner: Arc<Inner>, mut shutdown: ShutdownSignal) {
    inner.set_state(SessionState::KeysInitializing);

    let identity = match inner.identity.init() {
        Ok(identity) => identity,
        Err(err) => return fail(&inner, err),
    };

    let published = tokio::select! {
        res = inner.identity.publish(&inner.api) => res,
        _ = shutdown.triggered() => return,
    };
    if let Err(err) = published {
        return fail(&inner, err);
    }

    inner.set_state(SessionState::AwaitingPeerKey);
    let resolved = inner
        .resolver
        .resolve(&inner.peer_id, &inner.peer_name, &mut shutdown, |line| {
            inner.set_status(Some(line.to_string()))
        })
        .await;

    let peer = match resolved {
        Ok(peer) => peer,
        Err(Error::Cancelled) => return,
        Err(Error::PeerUnavailable { message, .. }) => {
            inner.set_status(Some(message));
            inner.set_state(SessionState::PeerUnavailable);
            return;
        }
        Err(err) => return fail(&inner, err),
    };

    if let Err(err) = inner.keys.setup(
        &inner.conversation_id,
        &identity,
        &peer.peer_id,
        &peer.public_key,
    ) {
        return fail(&inner, err);
    }
    if shutdown.is_triggered() {
        return;
    }

    inner.set_status(None);
    inner.set_state(SessionState::Ready);
    tracing::info!(conversation_id = %inner.conversation_id, peer_id = %inner.peer_id, "conversation encrypted");

    if let Err(err) = inner.refresh().await {
        tracing::warn!(conversation_id = %inner.conversation_id, error = err.class(), "refresh on ready failed");
    }
}

fn fail(inner: &Inner, err: Error) {
    tracing::warn!(conversation_id = %inner.conversation_id, error = err.class(), "key setup failed");
    inner.set_status(Some(err.to_string()));
    inner.set_state(SessionState::Failed(err.to_string()));
}

async fn drive(inner: Arc<Inner>, mut triggers: mpsc::Receiver<SyncTrigger>, mut shutdown: ShutdownSignal) {
    loop {
        let trigger = tokio::select! {
            t = triggers.recv() => t,
            _ = shutdown.triggered() => break,
        };
        let Some(trigger) = trigger else {
            break;
        };

        if let Err(err) = inner.refresh().await {
            match &err {
                Error::Transport(_) => {
                    tracing::debug!(conversation_id = %inner.conversation_id, ?trigger, error = err.class(), "refresh failed")
                }
                _ => {
                    tracing::warn!(conversation_id = %inner.conversation_id, ?trigger, error = err.class(), "refresh failed")
                }
            }
        }
    }
}
