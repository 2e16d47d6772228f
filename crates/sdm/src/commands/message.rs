use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sealed_dm::{ConversationSession, DisplayMessage, MessageBody, MessageType, SessionState};
use serde::Serialize;
use std::collections::HashSet;

use super::Client;
use crate::output::Output;

#[derive(Debug, Serialize)]
struct MessageView {
    id: String,
    sender_id: String,
    is_own: bool,
    is_read: bool,
    message_type: MessageType,
    created_at: DateTime<Utc>,
    /// "decrypted", "pending" or "undecryptable"
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl From<&DisplayMessage> for MessageView {
    fn from(m: &DisplayMessage) -> Self {
        let (status, text, error) = match &m.body {
            MessageBody::Plaintext(text) => ("decrypted", Some(text.clone()), None),
            MessageBody::Pending => ("pending", None, None),
            MessageBody::Undecryptable(failure) => {
                ("undecryptable", None, Some(failure.to_string()))
            }
        };
        Self {
            id: m.id.clone(),
            sender_id: m.sender_id.clone(),
            is_own: m.is_own,
            is_read: m.is_read,
            message_type: m.message_type,
            created_at: m.created_at,
            status,
            text,
            error,
        }
    }
}

#[derive(Serialize)]
struct SendResult {
    id: String,
    conversation_id: String,
    created_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct ReadResult {
    conversation_id: String,
    peer_id: String,
    encrypted: bool,
    messages: Vec<MessageView>,
}

#[derive(Serialize)]
struct StateEvent {
    state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<String>,
}

fn state_label(state: &SessionState) -> &'static str {
    match state {
        SessionState::Uninitialized => "uninitialized",
        SessionState::KeysInitializing => "keys_initializing",
        SessionState::AwaitingPeerKey => "awaiting_peer_key",
        SessionState::Ready => "ready",
        SessionState::PeerUnavailable => "peer_unavailable",
        SessionState::Failed(_) => "failed",
        SessionState::Closed => "closed",
    }
}

fn open_session(
    client: &Client,
    config: &sealed_dm::ClientConfig,
    conversation_id: &str,
    peer_id: &str,
) -> ConversationSession {
    ConversationSession::open(
        config,
        client.api.clone(),
        client.identity.clone(),
        conversation_id,
        peer_id,
        peer_id,
    )
}

/// Wait for key setup to finish, echoing waiting lines as notices.
async fn wait_settled(session: &ConversationSession, output: &Output) -> SessionState {
    let mut status = session.status();
    let settled = session.settled();
    tokio::pin!(settled);

    loop {
        tokio::select! {
            state = &mut settled => return state,
            changed = status.changed() => {
                if changed.is_err() {
                    return (&mut settled).await;
                }
                let line = status.borrow_and_update().clone();
                if let Some(line) = line {
                    output.notice(&line);
                }
            }
        }
    }
}

fn ensure_ready(state: &SessionState, session: &ConversationSession) -> Result<()> {
    match state {
        SessionState::Ready => Ok(()),
        SessionState::Failed(reason) => anyhow::bail!("Encryption setup failed: {}", reason),
        SessionState::Closed => anyhow::bail!("Session closed"),
        other => anyhow::bail!(
            "{}",
            session
                .status_line()
                .unwrap_or_else(|| format!("Encryption not ready ({})", state_label(other)))
        ),
    }
}

/// Open the conversation, wait for encryption, send one message, close
pub async fn send(
    client: &Client,
    conversation_id: &str,
    peer_id: &str,
    text: &str,
    output: &Output,
) -> Result<()> {
    let session = open_session(client, &client.config, conversation_id, peer_id);
    let state = wait_settled(&session, output).await;
    ensure_ready(&state, &session)?;

    let sent = session.send(text).await.context("Failed to send message")?;
    session.close();

    output.success(
        "send",
        SendResult {
            id: sent.id,
            conversation_id: sent.conversation_id,
            created_at: sent.created_at,
        },
    );
    Ok(())
}

/// One refresh: print the newest `limit` messages and acknowledge the peer's
pub async fn read(
    client: &Client,
    conversation_id: &str,
    peer_id: &str,
    limit: usize,
    output: &Output,
) -> Result<()> {
    let config = client.config.clone().with_message_page(limit);
    let session = open_session(client, &config, conversation_id, peer_id);
    let state = wait_settled(&session, output).await;
    if state != SessionState::Ready {
        if let Some(line) = session.status_line() {
            output.notice(&line);
        }
    }

    let view = session
        .refresh()
        .await
        .context("Failed to fetch messages")?;
    session.close();

    output.success(
        "read",
        ReadResult {
            conversation_id: session.conversation_id().to_string(),
            peer_id: session.peer_id().to_string(),
            encrypted: state == SessionState::Ready,
            messages: view.iter().map(MessageView::from).collect(),
        },
    );
    Ok(())
}

/// Stream state changes and new messages until Ctrl-C
pub async fn listen(
    client: &Client,
    conversation_id: &str,
    peer_id: &str,
    output: &Output,
) -> Result<()> {
    let session = open_session(client, &client.config, conversation_id, peer_id);
    let mut state = session.state();
    let mut status = session.status();
    let mut messages = session.messages();
    let mut shown: HashSet<String> = HashSet::new();

    let initial = state.borrow_and_update().clone();
    output.event(
        "state",
        StateEvent {
            state: state_label(&initial),
            status: None,
        },
    );

    loop {
        tokio::select! {
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = state.borrow_and_update().clone();
                output.event("state", StateEvent {
                    state: state_label(&current),
                    status: session.status_line(),
                });
                if current == SessionState::Closed {
                    break;
                }
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let line = status.borrow_and_update().clone();
                if let Some(line) = line {
                    output.event("status", serde_json::json!({ "status": line }));
                }
            }
            changed = messages.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = messages.borrow_and_update().clone();
                for m in view
                    .iter()
                    .filter(|m| m.body != MessageBody::Pending && shown.insert(m.id.clone()))
                {
                    output.event("message", MessageView::from(m));
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.close();
    Ok(())
}
