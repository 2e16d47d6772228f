use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sealed_dm::{Conversation, ConversationSummary};
use serde::Serialize;

use super::Client;
use crate::output::Output;

#[derive(Serialize)]
struct ChatList {
    chats: Vec<ChatInfo>,
}

#[derive(Serialize)]
struct ChatInfo {
    id: String,
    peer_id: String,
    created_at: DateTime<Utc>,
    last_message_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    unread_count: Option<u64>,
}

impl ChatInfo {
    fn from_conversation(conversation: Conversation, user_id: &str) -> Self {
        Self {
            peer_id: conversation.peer_of(user_id).to_string(),
            id: conversation.id,
            created_at: conversation.created_at,
            last_message_at: conversation.last_message_at,
            unread_count: None,
        }
    }

    fn from_summary(summary: ConversationSummary, user_id: &str) -> Self {
        let unread = summary.unread_count;
        let mut info = Self::from_conversation(summary.conversation, user_id);
        info.unread_count = Some(unread);
        info
    }
}

#[derive(Serialize)]
struct UnreadCount {
    unread: u64,
}

/// Get or create the conversation with `peer_id`
pub async fn start(client: &Client, peer_id: &str, output: &Output) -> Result<()> {
    if peer_id == client.user_id {
        anyhow::bail!("Cannot start a chat with yourself");
    }
    let conversation = client
        .api
        .create_conversation(peer_id)
        .await
        .context("Failed to start chat")?;

    output.success(
        "chat.start",
        ChatInfo::from_conversation(conversation, &client.user_id),
    );
    Ok(())
}

/// List conversations, most recently active first
pub async fn list(client: &Client, output: &Output) -> Result<()> {
    let summaries = client
        .api
        .list_conversations()
        .await
        .context("Failed to list chats")?;

    let mut chats: Vec<ChatInfo> = summaries
        .into_iter()
        .map(|s| ChatInfo::from_summary(s, &client.user_id))
        .collect();
    chats.sort_by(|a, b| {
        let a_at = a.last_message_at.unwrap_or(a.created_at);
        let b_at = b.last_message_at.unwrap_or(b.created_at);
        b_at.cmp(&a_at)
    });

    output.success("chat.list", ChatList { chats });
    Ok(())
}

pub async fn unread(client: &Client, output: &Output) -> Result<()> {
    let unread = client
        .api
        .unread_count()
        .await
        .context("Failed to fetch unread count")?;
    output.success("unread", UnreadCount { unread });
    Ok(())
}
