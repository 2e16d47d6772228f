//! End-to-end encrypted direct messages over a relay that only ever sees
//! ciphertext.
//!
//! Each user holds a long-lived X25519 identity. Two participants derive a
//! per-conversation key from their identities and the conversation id, and
//! seal every message with XChaCha20-Poly1305 under a fresh random nonce.
//! [`ConversationSession`] ties key setup, sync and rendering together for
//! one open conversation.

pub mod api;
pub mod cache;
pub mod cipher;
pub mod config;
pub mod conversation_keys;
pub mod error;
pub mod file_storage;
pub mod identity;
pub mod peer_keys;
pub mod session;
pub mod shutdown;
pub mod storage;
pub mod sync;
pub mod types;
pub mod utils;

pub use api::*;
pub use cache::*;
pub use config::*;
pub use conversation_keys::*;
pub use error::*;
pub use file_storage::*;
pub use identity::*;
pub use peer_keys::*;
pub use session::*;
pub use shutdown::*;
pub use storage::*;
pub use sync::*;
pub use types::*;
