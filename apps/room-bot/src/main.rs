mod config;
mod logging;
mod responder;

use std::{process::ExitCode, sync::Arc};

use backend_core::BackendError;
use backend_delivery::DeliveryContext;
use backend_matrix::{DisabledCryptoEngine, MatrixBackend, MatrixBackendConfig};
use backend_store::RoomStateStore;
use matrix_sdk::{
    Room,
    ruma::events::room::message::{MessageType, OriginalSyncRoomMessageEvent},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::BotConfig,
    responder::{IncomingText, Outcome, Responder},
};

#[tokio::main]
async fn main() -> ExitCode {
    let config = match BotConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            logging::init(None);
            error!(error = %err, "bot config invalid");
            return ExitCode::FAILURE;
        }
    };
    logging::init(config.log_filter.as_deref());

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "bot stopped with error");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: BotConfig) -> Result<(), BackendError> {
    let retry_policy = config.retry_policy();
    let store = RoomStateStore::open(&config.db_path)?;
    info!(db_path = %config.db_path.display(), "room state cache opened");

    let backend = MatrixBackend::new(
        &MatrixBackendConfig::new(&config.homeserver).with_retry_policy(retry_policy),
    )
    .await?;
    let session = backend
        .login_password(&store, &config.user, &config.password, &config.display_name)
        .await?;

    warn!(
        reason = DisabledCryptoEngine::unavailable_reason(),
        "messages to encrypted rooms will not be delivered"
    );
    let context = DeliveryContext::new(
        store,
        Arc::new(DisabledCryptoEngine),
        Arc::new(backend.transport()),
        retry_policy,
    );
    backend.register_room_state_handlers(context.dispatcher().clone());
    backend.register_invite_handler();
    register_responder(
        &backend,
        Responder::new(context.outbound().clone(), session.user_id),
    );

    let stop = CancellationToken::new();
    let stop_on_signal = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
        }
        stop_on_signal.cancel();
    });

    backend.run_sync(context.store(), stop).await
}

fn register_responder(backend: &MatrixBackend, responder: Responder) {
    backend.client().add_event_handler(
        move |event: OriginalSyncRoomMessageEvent, room: Room| {
            let responder = responder.clone();
            async move {
                let Some(body) = answerable_body(&event.content.msgtype) else {
                    return;
                };
                let message = IncomingText {
                    room_id: room.room_id().to_string(),
                    event_id: event.event_id.to_string(),
                    sender: event.sender.to_string(),
                    body: body.to_owned(),
                };
                tokio::spawn(async move {
                    match responder.handle(&message).await {
                        Outcome::Replied(response) | Outcome::Reacted(response) => {
                            debug!(event_id = %response.event_id, "answer delivered");
                        }
                        Outcome::Failed(err) => debug!(code = %err.code, "answer abandoned"),
                        Outcome::Ignored => {}
                    }
                });
            }
        },
    );
}

/// Body of a message the bot may answer: text and notices only.
fn answerable_body(msgtype: &MessageType) -> Option<&str> {
    match msgtype {
        MessageType::Text(text) => Some(&text.body),
        MessageType::Notice(notice) => Some(&notice.body),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use matrix_sdk::ruma::events::room::message::{
        EmoteMessageEventContent, NoticeMessageEventContent, TextMessageEventContent,
    };

    use super::*;

    #[test]
    fn answers_text_and_notices_only() {
        let text = MessageType::Text(TextMessageEventContent::plain("ping"));
        let notice = MessageType::Notice(NoticeMessageEventContent::plain("yay"));
        let emote = MessageType::Emote(EmoteMessageEventContent::plain("pings"));

        assert_eq!(answerable_body(&text), Some("ping"));
        assert_eq!(answerable_body(&notice), Some("yay"));
        assert_eq!(answerable_body(&emote), None);
    }
}
