//! Core contract shared by the room state cache, the delivery pipeline and
//! the Matrix adapter.
//!
//! This crate defines the protocol content types, the error taxonomy, the
//! retry primitive and the capability traits for encryption and transport.

/// Group-encryption capability and its error conditions.
pub mod crypto;
/// Stable backend error types and HTTP classification helpers.
pub mod error;
/// Fibonacci backoff policy and the generic retry loop.
pub mod retry;
/// Protocol call used to put events into rooms.
pub mod transport;
/// Event content, room state and encryption types.
pub mod types;

pub use crypto::{CryptoEngine, CryptoError};
pub use error::{BackendError, BackendErrorCategory, classify_http_status};
pub use retry::{RetryExhausted, RetryPolicy, retry_with_backoff};
pub use transport::Transport;
pub use types::{
    EncryptedEnvelope, EncryptionConfig, InReplyTo, MEGOLM_ALGORITHM, Membership, MessageContent,
    MessageType, OutgoingContent, REACTION_EVENT_TYPE, ROOM_ENCRYPTED_EVENT_TYPE,
    ROOM_MESSAGE_EVENT_TYPE, ReactionContent, Relation, RoomStateEvent, SendResponse,
};
