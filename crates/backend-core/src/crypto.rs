use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::types::EncryptedEnvelope;

/// Failures reported by the group-encryption engine.
///
/// The first three variants mean the current group session cannot be used and
/// a fresh one must be shared before encryption can succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("group session has expired")]
    SessionExpired,
    #[error("group session has not been shared with every recipient")]
    SessionNotShared,
    #[error("no group session exists for the room")]
    NoGroupSession,
    #[error("encryption failed: {0}")]
    Other(String),
}

impl CryptoError {
    /// Whether sharing a new group session can recover from this error.
    pub fn is_rekeyable(&self) -> bool {
        matches!(
            self,
            Self::SessionExpired | Self::SessionNotShared | Self::NoGroupSession
        )
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::SessionExpired => "session_expired",
            Self::SessionNotShared => "session_not_shared",
            Self::NoGroupSession => "no_group_session",
            Self::Other(_) => "encryption_failed",
        }
    }
}

/// Group-encryption capability used by the outbound pipeline.
///
/// The engine owns its session state; callers treat it as opaque.
#[async_trait]
pub trait CryptoEngine: Send + Sync {
    /// Encrypt one event's content for every member of `room_id`.
    async fn encrypt_for_room(
        &self,
        room_id: &str,
        event_type: &str,
        content: &Value,
    ) -> Result<EncryptedEnvelope, CryptoError>;

    /// Create and distribute a fresh group session to `members`.
    async fn share_group_session(
        &self,
        room_id: &str,
        members: &[String],
    ) -> Result<(), CryptoError>;
}
