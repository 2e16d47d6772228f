use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// HKDF info label for per-conversation keys. Changing it orphans every
/// message already stored on the relay.
pub const CONVERSATION_KEY_INFO: &[u8] = b"sealed-dm/conversation-key/v1";

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);
pub const KEY_RETRY_STEP: Duration = Duration::from_secs(2);
pub const KEY_RETRY_CAP: Duration = Duration::from_secs(10);
pub const MAX_KEY_RETRIES: u32 = 10;
pub const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);
pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);
pub const DEFAULT_MESSAGE_PAGE: usize = 50;
pub const DEFAULT_DECRYPT_CACHE_CAPACITY: usize = 10_000;

/// XChaCha20-Poly1305 nonce length in bytes.
pub const NONCE_LEN: usize = 24;

/// Public half of a user's identity as stored by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedKeyBundle {
    #[serde(default)]
    pub user_id: String,
    pub public_key: String,
    #[serde(default, alias = "createdAt", skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeysResponse {
    pub keys: Option<PublishedKeyBundle>,
}

/// Upload body for `POST /keys`.
///
/// The relay schema carries pre-key fields; this protocol has no pre-keys,
/// so the signed pre-key mirrors the identity key and the signature is empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishKeysRequest {
    pub public_key: String,
    pub identity_public_key: String,
    pub signed_pre_key: String,
    pub pre_key_signature: String,
}

impl PublishKeysRequest {
    pub fn for_public_key(public_key: &str) -> Self {
        Self {
            public_key: public_key.to_string(),
            identity_public_key: public_key.to_string(),
            signed_pre_key: public_key.to_string(),
            pre_key_signature: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    Video,
    Audio,
    #[serde(other)]
    Unknown,
}

/// A message exactly as the relay stores it: ciphertext and metadata only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    #[serde(rename = "encryptedContent")]
    pub ciphertext: String,
    #[serde(rename = "encryptedContentIv")]
    pub iv: String,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default)]
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesResponse {
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub encrypted_content: String,
    pub encrypted_content_iv: String,
    pub message_type: MessageType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageResponse {
    pub message: Message,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceiptRequest {
    pub message_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub participant1_id: String,
    pub participant2_id: String,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    /// The participant that is not `user_id`.
    pub fn peer_of(&self, user_id: &str) -> &str {
        if self.participant1_id == user_id {
            &self.participant2_id
        } else {
            &self.participant1_id
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    #[serde(flatten)]
    pub conversation: Conversation,
    #[serde(default)]
    pub unread_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConversationRequest {
    pub participant_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationResponse {
    pub conversation: Conversation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationsResponse {
    pub conversations: Vec<ConversationSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnreadCountResponse {
    pub count: u64,
}

/// Frames the relay pushes over the WebSocket. Only `NewMessage` drives
/// behavior; it never carries content, just the conversation to refetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    NewMessage {
        conversation_id: String,
    },
    Connected {
        #[serde(default)]
        user_id: Option<String>,
    },
    Pong,
    Typing {
        conversation_id: String,
    },
    ReadReceipt {
        conversation_id: String,
        #[serde(default)]
        message_ids: Vec<String>,
    },
    #[serde(other)]
    Unknown,
}

/// Output of a single seal: both halves are base64 text, ready for the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedPayload {
    pub ciphertext: String,
    pub iv: String,
}
