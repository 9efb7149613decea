use std::sync::Arc;

use backend_core::{
    BackendError, CryptoEngine, EncryptedEnvelope, MessageContent, OutgoingContent,
    ROOM_ENCRYPTED_EVENT_TYPE, ReactionContent, Relation, RetryPolicy, SendResponse, Transport,
    retry_with_backoff,
};
use backend_store::RoomStateStore;
use serde_json::Value;
use tracing::{debug, error, info};

/// Turns one logical outgoing event into one transport call, encrypting it
/// first when the room state cache says the room is encrypted.
///
/// The whole decide, encrypt, re-key and dispatch sequence is the unit the
/// retry policy repeats. A retried send therefore re-reads the cache and may
/// share a group session more than once.
pub struct OutboundPipeline {
    store: RoomStateStore,
    crypto: Arc<dyn CryptoEngine>,
    transport: Arc<dyn Transport>,
    retry_policy: RetryPolicy,
}

impl OutboundPipeline {
    pub fn new(
        store: RoomStateStore,
        crypto: Arc<dyn CryptoEngine>,
        transport: Arc<dyn Transport>,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            crypto,
            transport,
            retry_policy,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Deliver `content` to `room_id`.
    ///
    /// Returns a `RetryExhausted` error, carrying the last failure as its
    /// cause, once the retry budget is spent. That error is reported once;
    /// nothing is queued for later.
    pub async fn send(
        &self,
        room_id: &str,
        content: impl Into<OutgoingContent>,
    ) -> Result<SendResponse, BackendError> {
        let content = content.into();
        let description = format!("send {} to {room_id}", content.event_type());

        retry_with_backoff(&description, &self.retry_policy, || {
            self.deliver_once(room_id, &content)
        })
        .await
        .map_err(|exhausted| {
            let err = BackendError::retry_exhausted(exhausted);
            error!(room_id, error = %err, "failed to send event");
            err
        })
    }

    /// Send a plain text message.
    pub async fn send_text(
        &self,
        room_id: &str,
        body: impl Into<String>,
    ) -> Result<SendResponse, BackendError> {
        self.send(room_id, MessageContent::text(body)).await
    }

    /// Send a text message as a rich reply to `event_id`.
    pub async fn send_reply(
        &self,
        room_id: &str,
        event_id: &str,
        body: impl Into<String>,
    ) -> Result<SendResponse, BackendError> {
        self.send(room_id, MessageContent::text(body).in_reply_to(event_id))
            .await
    }

    /// React to `event_id` with `key`.
    pub async fn send_reaction(
        &self,
        room_id: &str,
        event_id: &str,
        key: &str,
    ) -> Result<SendResponse, BackendError> {
        let reaction = ReactionContent {
            relates_to: Relation::annotation(event_id, key),
        };
        self.send(room_id, reaction).await
    }

    async fn deliver_once(
        &self,
        room_id: &str,
        content: &OutgoingContent,
    ) -> Result<SendResponse, BackendError> {
        let encrypted = self.store.is_encrypted(room_id).map_err(|err| {
            error!(room_id, error = %err, "failed to read room encryption state");
            BackendError::from(err)
        })?;
        let plaintext = content.to_json()?;

        if !encrypted {
            debug!(room_id, event_type = content.event_type(), "sending unencrypted event");
            return self
                .transport
                .send_event(room_id, content.event_type(), plaintext)
                .await;
        }

        debug!(room_id, event_type = content.event_type(), "sending encrypted event");
        let mut envelope = self
            .encrypt(room_id, content.event_type(), &plaintext)
            .await?;
        // m.relates_to must stay readable by the server and other clients.
        envelope.relates_to = content.relation().cloned();

        let payload = serde_json::to_value(&envelope).map_err(BackendError::serialization)?;
        self.transport
            .send_event(room_id, ROOM_ENCRYPTED_EVENT_TYPE, payload)
            .await
    }

    async fn encrypt(
        &self,
        room_id: &str,
        event_type: &str,
        plaintext: &Value,
    ) -> Result<EncryptedEnvelope, BackendError> {
        match self
            .crypto
            .encrypt_for_room(room_id, event_type, plaintext)
            .await
        {
            Ok(envelope) => return Ok(envelope),
            Err(err) if err.is_rekeyable() => {
                info!(room_id, reason = %err, "group session unusable, sharing a new one");
            }
            Err(err) => {
                error!(room_id, error = %err, "failed to encrypt event");
                return Err(err.into());
            }
        }

        self.share_group_session(room_id).await?;

        self.crypto
            .encrypt_for_room(room_id, event_type, plaintext)
            .await
            .map_err(|err| {
                error!(room_id, error = %err, "failed to encrypt event after re-keying");
                BackendError::from(err)
            })
    }

    async fn share_group_session(&self, room_id: &str) -> Result<(), BackendError> {
        let members = self.store.get_room_members(room_id).map_err(|err| {
            error!(room_id, error = %err, "failed to read room members");
            BackendError::from(err)
        })?;

        debug!(room_id, members = members.len(), "sharing group session");
        self.crypto
            .share_group_session(room_id, &members)
            .await
            .map_err(|err| {
                error!(room_id, error = %err, "failed to share group session");
                BackendError::group_session_share(err)
            })
    }
}
