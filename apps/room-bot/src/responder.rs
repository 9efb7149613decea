//! Application logic: `ping` gets a `pong` reply, `yay` gets a 🎉.

use std::sync::Arc;

use backend_core::{BackendError, SendResponse};
use backend_delivery::OutboundPipeline;
use tracing::{debug, error, warn};

const FAILURE_REACTION: &str = "❌";

/// A text or notice message received in a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingText {
    pub room_id: String,
    pub event_id: String,
    pub sender: String,
    pub body: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Reply(&'static str),
    React(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Ignored,
    Replied(SendResponse),
    Reacted(SendResponse),
    Failed(BackendError),
}

#[derive(Clone)]
pub struct Responder {
    outbound: Arc<OutboundPipeline>,
    own_user_id: String,
}

impl Responder {
    pub fn new(outbound: Arc<OutboundPipeline>, own_user_id: impl Into<String>) -> Self {
        Self {
            outbound,
            own_user_id: own_user_id.into(),
        }
    }

    pub async fn handle(&self, message: &IncomingText) -> Outcome {
        if message.sender == self.own_user_id {
            return Outcome::Ignored;
        }
        let Some(action) = action_for(strip_reply_fallback(&message.body)) else {
            return Outcome::Ignored;
        };

        debug!(room_id = %message.room_id, event_id = %message.event_id, ?action, "answering message");
        let result = match action {
            Action::Reply(body) => self
                .outbound
                .send_reply(&message.room_id, &message.event_id, body)
                .await
                .map(Outcome::Replied),
            Action::React(key) => self
                .outbound
                .send_reaction(&message.room_id, &message.event_id, key)
                .await
                .map(Outcome::Reacted),
        };

        match result {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(
                    room_id = %message.room_id,
                    event_id = %message.event_id,
                    error = %err,
                    "answer was not delivered"
                );
                if let Err(react_err) = self
                    .outbound
                    .send_reaction(&message.room_id, &message.event_id, FAILURE_REACTION)
                    .await
                {
                    warn!(room_id = %message.room_id, error = %react_err, "failure reaction was not delivered");
                }
                Outcome::Failed(err)
            }
        }
    }
}

fn action_for(body: &str) -> Option<Action> {
    let body = body.trim();
    if body.eq_ignore_ascii_case("ping") {
        Some(Action::Reply("pong"))
    } else if body.eq_ignore_ascii_case("yay") {
        Some(Action::React("🎉"))
    } else {
        None
    }
}

/// Drop the quoted `> ` lines a client prepends to the body of a reply.
fn strip_reply_fallback(body: &str) -> &str {
    if !body.starts_with('>') {
        return body;
    }

    let mut offset = 0;
    for line in body.split_inclusive('\n') {
        if !line.starts_with('>') {
            break;
        }
        offset += line.len();
    }
    let rest = &body[offset..];
    rest.strip_prefix('\n').unwrap_or(rest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use backend_core::{
        BackendErrorCategory, CryptoEngine, CryptoError, EncryptedEnvelope, REACTION_EVENT_TYPE,
        ROOM_MESSAGE_EVENT_TYPE, RetryPolicy, Transport,
    };
    use backend_store::RoomStateStore;
    use serde_json::Value;
    use std::sync::Mutex;

    const ROOM: &str = "!room:example.org";
    const BOT: &str = "@bot:example.org";

    struct NoCrypto;

    #[async_trait]
    impl CryptoEngine for NoCrypto {
        async fn encrypt_for_room(
            &self,
            _room_id: &str,
            _event_type: &str,
            _content: &Value,
        ) -> Result<EncryptedEnvelope, CryptoError> {
            Err(CryptoError::Other("unused".to_owned()))
        }

        async fn share_group_session(
            &self,
            _room_id: &str,
            _members: &[String],
        ) -> Result<(), CryptoError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingTransport {
        fail_messages: bool,
        sent: Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send_event(
            &self,
            _room_id: &str,
            event_type: &str,
            content: Value,
        ) -> Result<SendResponse, BackendError> {
            self.sent
                .lock()
                .expect("sent lock")
                .push((event_type.to_owned(), content));
            if self.fail_messages && event_type == ROOM_MESSAGE_EVENT_TYPE {
                return Err(BackendError::new(
                    BackendErrorCategory::Network,
                    "offline",
                    "homeserver unreachable",
                ));
            }
            Ok(SendResponse {
                event_id: "$sent".to_owned(),
            })
        }
    }

    fn responder(transport: Arc<RecordingTransport>) -> Responder {
        let pipeline = OutboundPipeline::new(
            RoomStateStore::in_memory().expect("store"),
            Arc::new(NoCrypto),
            transport,
            RetryPolicy::new(10, 10, 2),
        );
        Responder::new(Arc::new(pipeline), BOT)
    }

    fn message(sender: &str, body: &str) -> IncomingText {
        IncomingText {
            room_id: ROOM.to_owned(),
            event_id: "$ping".to_owned(),
            sender: sender.to_owned(),
            body: body.to_owned(),
        }
    }

    #[test]
    fn ping_and_yay_are_the_only_triggers() {
        assert_eq!(action_for("ping"), Some(Action::Reply("pong")));
        assert_eq!(action_for("  PING \n"), Some(Action::Reply("pong")));
        assert_eq!(action_for("yay"), Some(Action::React("🎉")));
        assert_eq!(action_for("ping me later"), None);
        assert_eq!(action_for(""), None);
    }

    #[test]
    fn reply_fallback_is_stripped_before_matching() {
        let body = "> <@alice:example.org> are you there?\n> second line\n\nping";
        assert_eq!(strip_reply_fallback(body), "ping");
        assert_eq!(strip_reply_fallback("> only a quote"), "");
        assert_eq!(strip_reply_fallback("ping"), "ping");
        assert_eq!(strip_reply_fallback("not > a quote"), "not > a quote");
    }

    #[tokio::test]
    async fn replies_to_ping_referencing_the_ping_event() {
        let transport = Arc::new(RecordingTransport::default());
        let outcome = responder(transport.clone())
            .handle(&message("@alice:example.org", "ping"))
            .await;

        assert!(matches!(outcome, Outcome::Replied(_)));
        let sent = transport.sent.lock().expect("sent lock");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, ROOM_MESSAGE_EVENT_TYPE);
        assert_eq!(sent[0].1["body"], "pong");
        assert_eq!(
            sent[0].1["m.relates_to"]["m.in_reply_to"]["event_id"],
            "$ping"
        );
    }

    #[tokio::test]
    async fn ignores_own_messages_and_other_text() {
        let transport = Arc::new(RecordingTransport::default());
        let responder = responder(transport.clone());

        assert_eq!(responder.handle(&message(BOT, "ping")).await, Outcome::Ignored);
        assert_eq!(
            responder
                .handle(&message("@alice:example.org", "hello"))
                .await,
            Outcome::Ignored
        );
        assert!(transport.sent.lock().expect("sent lock").is_empty());
    }

    #[tokio::test]
    async fn yay_in_a_reply_gets_a_party_reaction() {
        let transport = Arc::new(RecordingTransport::default());
        let outcome = responder(transport.clone())
            .handle(&message(
                "@alice:example.org",
                "> <@bot:example.org> pong\n\nyay",
            ))
            .await;

        assert!(matches!(outcome, Outcome::Reacted(_)));
        let sent = transport.sent.lock().expect("sent lock");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, REACTION_EVENT_TYPE);
        assert_eq!(
            sent[0].1["m.relates_to"],
            serde_json::json!({ "rel_type": "m.annotation", "event_id": "$ping", "key": "🎉" })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reply_reacts_with_cross() {
        let transport = Arc::new(RecordingTransport {
            fail_messages: true,
            ..Default::default()
        });
        let outcome = responder(transport.clone())
            .handle(&message("@alice:example.org", "ping"))
            .await;

        let Outcome::Failed(err) = outcome else {
            panic!("expected a failed outcome, got {outcome:?}");
        };
        assert_eq!(err.category, BackendErrorCategory::RetryExhausted);

        let sent = transport.sent.lock().expect("sent lock");
        assert_eq!(sent.len(), 3);
        let (event_type, reaction) = &sent[2];
        assert_eq!(event_type, REACTION_EVENT_TYPE);
        assert_eq!(reaction["m.relates_to"]["key"], FAILURE_REACTION);
        assert_eq!(reaction["m.relates_to"]["event_id"], "$ping");
    }
}
