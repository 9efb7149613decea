use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BackendError;

/// Event type of plain room messages.
pub const ROOM_MESSAGE_EVENT_TYPE: &str = "m.room.message";
/// Event type of reactions (annotations).
pub const REACTION_EVENT_TYPE: &str = "m.reaction";
/// Event type wrapping encrypted payloads.
pub const ROOM_ENCRYPTED_EVENT_TYPE: &str = "m.room.encrypted";
/// Group-session algorithm announced by encrypted rooms.
pub const MEGOLM_ALGORITHM: &str = "m.megolm.v1.aes-sha2";

const DEFAULT_ROTATION_PERIOD_MS: u64 = 604_800_000;
const DEFAULT_ROTATION_PERIOD_MSGS: u64 = 100;

/// Matrix message type used when sending room messages.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MessageType {
    /// Standard text message (`m.text`).
    #[serde(rename = "m.text")]
    Text,
    /// Notice message (`m.notice`), usually non-intrusive/system-like.
    #[serde(rename = "m.notice")]
    Notice,
    /// Emote message (`m.emote`).
    #[serde(rename = "m.emote")]
    Emote,
}

/// Room membership state carried by `m.room.member` events.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Membership {
    Invite,
    Join,
    Leave,
    Ban,
    Knock,
}

impl Membership {
    /// Invited and joined users are the ones who must receive the group key.
    pub fn is_invite_or_join(self) -> bool {
        matches!(self, Self::Invite | Self::Join)
    }
}

/// Content of an `m.room.encryption` state event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptionConfig {
    /// Group-session algorithm, normally [`MEGOLM_ALGORITHM`].
    pub algorithm: String,
    /// How long a group session may be used before rotating.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_period_ms: Option<u64>,
    /// How many messages a group session may encrypt before rotating.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_period_msgs: Option<u64>,
}

impl EncryptionConfig {
    /// Megolm configuration with protocol-default rotation.
    pub fn megolm() -> Self {
        Self {
            algorithm: MEGOLM_ALGORITHM.to_owned(),
            rotation_period_ms: None,
            rotation_period_msgs: None,
        }
    }

    /// Session lifetime, falling back to one week.
    pub fn rotation_period(&self) -> Duration {
        Duration::from_millis(
            self.rotation_period_ms
                .unwrap_or(DEFAULT_ROTATION_PERIOD_MS),
        )
    }

    /// Messages per session, falling back to 100.
    pub fn rotation_message_count(&self) -> u64 {
        self.rotation_period_msgs
            .unwrap_or(DEFAULT_ROTATION_PERIOD_MSGS)
    }
}

/// Target of an `m.in_reply_to` relation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InReplyTo {
    pub event_id: String,
}

/// `m.relates_to` block. It stays in clear text on encrypted events.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Relation {
    #[serde(
        rename = "m.in_reply_to",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub in_reply_to: Option<InReplyTo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rel_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl Relation {
    /// Rich reply to `event_id`.
    pub fn reply_to(event_id: impl Into<String>) -> Self {
        Self {
            in_reply_to: Some(InReplyTo {
                event_id: event_id.into(),
            }),
            ..Self::default()
        }
    }

    /// Reaction `key` on `event_id`.
    pub fn annotation(event_id: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            rel_type: Some("m.annotation".to_owned()),
            event_id: Some(event_id.into()),
            key: Some(key.into()),
            ..Self::default()
        }
    }
}

/// Content of an `m.room.message` event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageContent {
    pub msgtype: MessageType,
    pub body: String,
    #[serde(
        rename = "m.relates_to",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub relates_to: Option<Relation>,
}

impl MessageContent {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            msgtype: MessageType::Text,
            body: body.into(),
            relates_to: None,
        }
    }

    pub fn notice(body: impl Into<String>) -> Self {
        Self {
            msgtype: MessageType::Notice,
            body: body.into(),
            relates_to: None,
        }
    }

    /// Mark this message as a reply to `event_id`.
    pub fn in_reply_to(mut self, event_id: impl Into<String>) -> Self {
        self.relates_to = Some(Relation::reply_to(event_id));
        self
    }
}

/// Content of an `m.reaction` event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReactionContent {
    #[serde(rename = "m.relates_to")]
    pub relates_to: Relation,
}

/// Anything the outbound pipeline can deliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutgoingContent {
    Message(MessageContent),
    Reaction(ReactionContent),
}

impl OutgoingContent {
    /// Event type used when the content is sent unencrypted.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Message(_) => ROOM_MESSAGE_EVENT_TYPE,
            Self::Reaction(_) => REACTION_EVENT_TYPE,
        }
    }

    /// Relation metadata that must remain visible after encryption.
    pub fn relation(&self) -> Option<&Relation> {
        match self {
            Self::Message(content) => content.relates_to.as_ref(),
            Self::Reaction(content) => Some(&content.relates_to),
        }
    }

    /// Wire form of the content.
    pub fn to_json(&self) -> Result<Value, BackendError> {
        let value = match self {
            Self::Message(content) => serde_json::to_value(content),
            Self::Reaction(content) => serde_json::to_value(content),
        };
        value.map_err(BackendError::serialization)
    }
}

impl From<MessageContent> for OutgoingContent {
    fn from(content: MessageContent) -> Self {
        Self::Message(content)
    }
}

impl From<ReactionContent> for OutgoingContent {
    fn from(content: ReactionContent) -> Self {
        Self::Reaction(content)
    }
}

/// Content of an `m.room.encrypted` event as produced by the crypto engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptedEnvelope {
    pub algorithm: String,
    pub sender_key: String,
    pub ciphertext: String,
    pub session_id: String,
    pub device_id: String,
    #[serde(
        rename = "m.relates_to",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub relates_to: Option<Relation>,
}

/// Result of a successful transport call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendResponse {
    /// Event ID assigned by the homeserver.
    pub event_id: String,
}

/// Inbound state change that updates the room state cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomStateEvent {
    /// `m.room.member` for `user_id` in `room_id`.
    Membership {
        room_id: String,
        user_id: String,
        membership: Membership,
    },
    /// `m.room.encryption` for `room_id`. `None` clears the configuration.
    Encryption {
        room_id: String,
        config: Option<EncryptionConfig>,
    },
}

impl RoomStateEvent {
    pub fn room_id(&self) -> &str {
        match self {
            Self::Membership { room_id, .. } | Self::Encryption { room_id, .. } => room_id,
        }
    }
}
