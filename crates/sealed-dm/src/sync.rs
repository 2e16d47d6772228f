//! Inbound change notification for one conversation.
//!
//! Two independent paths feed the same trigger queue: a WebSocket that the
//! relay pushes `new_message` frames over, and a fixed-interval poll that
//! runs no matter how the socket is doing. The queue holds at most one
//! pending trigger, so bursts collapse into a single refetch.

use crate::api::AuthGateway;
use crate::shutdown::ShutdownSignal;
use crate::{ClientConfig, Error, ReconnectPolicy, ServerEvent};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use url::Url;

/// Why a refetch was requested. Every trigger leads to the same refetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    Push,
    Poll,
    Manual,
}

pub struct SyncChannel {
    triggers: mpsc::Sender<SyncTrigger>,
    push_connected: watch::Receiver<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncChannel {
    /// Spawn the push and poll tasks. The receiver is the session's only
    /// source of refetch requests.
    pub fn start(
        config: &ClientConfig,
        auth: Arc<dyn AuthGateway>,
        conversation_id: &str,
        shutdown: ShutdownSignal,
    ) -> (Self, mpsc::Receiver<SyncTrigger>) {
        let (tx, rx) = mpsc::channel(1);
        let (connected_tx, connected_rx) = watch::channel(false);

        let push = tokio::spawn(run_push(
            config.ws_url.clone(),
            auth,
            conversation_id.to_string(),
            config.reconnect,
            tx.clone(),
            connected_tx,
            shutdown.clone(),
        ));
        let poll = tokio::spawn(run_poll(config.poll_interval, tx.clone(), shutdown));

        let channel = Self {
            triggers: tx,
            push_connected: connected_rx,
            tasks: vec![push, poll],
        };
        (channel, rx)
    }

    /// Queue a refetch. Returns `false` if one is already pending or the
    /// channel has stopped.
    pub fn request(&self, trigger: SyncTrigger) -> bool {
        enqueue(&self.triggers, trigger)
    }

    pub fn is_push_connected(&self) -> bool {
        *self.push_connected.borrow()
    }

    pub fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for SyncChannel {
    fn drop(&mut self) {
        self.stop();
    }
}

fn enqueue(tx: &mpsc::Sender<SyncTrigger>, trigger: SyncTrigger) -> bool {
    match tx.try_send(trigger) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => false,
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

/// `true` when a pushed text frame asks for a refetch of `conversation_id`.
pub fn is_refetch_frame(text: &str, conversation_id: &str) -> bool {
    match serde_json::from_str::<ServerEvent>(text) {
        Ok(ServerEvent::NewMessage {
            conversation_id: target,
        }) => target == conversation_id,
        Ok(_) => false,
        Err(_) => {
            tracing::debug!("ignoring unparseable push frame");
            false
        }
    }
}

fn push_endpoint(ws_url: &Url, token: &str) -> Url {
    let mut endpoint = ws_url.clone();
    endpoint.set_query(Some(&format!("token={}", urlencoding::encode(token))));
    endpoint
}

async fn run_push(
    ws_url: Url,
    auth: Arc<dyn AuthGateway>,
    conversation_id: String,
    policy: ReconnectPolicy,
    tx: mpsc::Sender<SyncTrigger>,
    connected: watch::Sender<bool>,
    mut shutdown: ShutdownSignal,
) {
    let mut attempt = 0u32;

    loop {
        if shutdown.is_triggered() || tx.is_closed() {
            break;
        }

        match auth.bearer_token() {
            None => tracing::warn!(conversation_id, "no token, push channel idle"),
            Some(token) => {
                let endpoint = push_endpoint(&ws_url, &token);
                let connecting = tokio::select! {
                    res = tokio_tungstenite::connect_async(endpoint.as_str()) => res,
                    _ = shutdown.triggered() => break,
                };

                match connecting {
                    Ok((stream, _)) => {
                        attempt = 0;
                        connected.send_replace(true);
                        tracing::debug!(conversation_id, "push channel connected");

                        let (mut write, mut read) = stream.split();
                        loop {
                            tokio::select! {
                                frame = read.next() => match frame {
                                    Some(Ok(WsMessage::Text(text))) => {
                                        if is_refetch_frame(&text, &conversation_id) {
                                            enqueue(&tx, SyncTrigger::Push);
                                        }
                                    }
                                    Some(Ok(WsMessage::Close(_))) | None => {
                                        tracing::debug!(conversation_id, "push channel closed by relay");
                                        break;
                                    }
                                    Some(Ok(_)) => {}
                                    Some(Err(err)) => {
                                        tracing::debug!(conversation_id, error = %err, "push channel read failed");
                                        break;
                                    }
                                },
                                _ = shutdown.triggered() => {
                                    let _ = write.send(WsMessage::Close(None)).await;
                                    connected.send_replace(false);
                                    return;
                                }
                            }
                        }
                        connected.send_replace(false);
                    }
                    Err(err) => {
                        let err = Error::from(err);
                        tracing::warn!(conversation_id, attempt, error = %err, "push channel connect failed");
                    }
                }
            }
        }

        let delay = policy.delay_for(attempt);
        attempt = attempt.saturating_add(1);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.triggered() => break,
        }
    }

    connected.send_replace(false);
}

async fn run_poll(interval: Duration, tx: mpsc::Sender<SyncTrigger>, mut shutdown: ShutdownSignal) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // first tick fires immediately; the session already refreshes on open
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if tx.is_closed() {
                    break;
                }
                enqueue(&tx, SyncTrigger::Poll);
            }
            _ = shutdown.triggered() => break,
        }
    }
}
