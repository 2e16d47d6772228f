use thiserror::Error;

/// Why a single message could not be opened.
///
/// Carried per message rather than raised, so one bad entry never aborts
/// rendering of the rest of a conversation.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptionFailure {
    #[error("ciphertext is not valid base64")]
    MalformedCiphertext,

    #[error("nonce is malformed or has the wrong length")]
    MalformedNonce,

    #[error("authentication tag mismatch")]
    AuthenticationFailed,

    #[error("decrypted content is not valid UTF-8")]
    InvalidUtf8,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Peer {peer_id} has not published an encryption key")]
    KeyUnavailable { peer_id: String },

    #[error("{message}")]
    PeerUnavailable { peer_id: String, message: String },

    #[error("Encryption not ready")]
    EncryptionNotReady,

    #[error("Decryption failed: {0}")]
    Decryption(#[from] DecryptionFailure),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Unexpected HTTP status {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Message is empty")]
    EmptyMessage,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Session closed")]
    SessionClosed,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Base64(#[from] base64::DecodeError),

    #[error(transparent)]
    Url(#[from] url::ParseError),
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        // reqwest errors may embed the request URL; the token never appears there.
        Error::Transport(err.without_url().to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

impl Error {
    /// Short class name for log fields. Never includes payload data.
    pub fn class(&self) -> &'static str {
        match self {
            Error::KeyUnavailable { .. } => "key_unavailable",
            Error::PeerUnavailable { .. } => "peer_unavailable",
            Error::EncryptionNotReady => "encryption_not_ready",
            Error::Decryption(_) => "decryption_failure",
            Error::Encryption(_) => "encryption",
            Error::Transport(_) => "transport",
            Error::Http { .. } => "http",
            Error::Unauthorized => "unauthorized",
            Error::InvalidKey(_) => "invalid_key",
            Error::EmptyMessage => "empty_message",
            Error::Cancelled => "cancelled",
            Error::SessionClosed => "session_closed",
            Error::Storage(_) => "storage",
            Error::Serialization(_) | Error::Json(_) | Error::Base64(_) => "serialization",
            Error::Url(_) => "url",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
