use std::time::Duration;

use async_trait::async_trait;
use backend_core::{
    BackendError, BackendErrorCategory, CryptoEngine, CryptoError, EncryptedEnvelope,
    EncryptionConfig, Membership, RetryPolicy, RoomStateEvent, SendResponse, Transport,
    classify_http_status, retry_with_backoff,
};
use backend_delivery::RoomEventDispatcher;
use backend_store::RoomStateStore;
use matrix_sdk::{
    Client, ClientBuildError, HttpError, Room,
    config::SyncSettings,
    ruma::{
        OwnedRoomId,
        api::client::error::{ErrorKind, RetryAfter},
        events::room::{
            encryption::{OriginalSyncRoomEncryptionEvent, RoomEncryptionEventContent},
            member::{MembershipState, OriginalSyncRoomMemberEvent, StrippedRoomMemberEvent},
        },
    },
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const SYNC_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct MatrixBackendConfig {
    pub homeserver: String,
    /// Backoff for login, invite joins and sync failures.
    pub retry_policy: RetryPolicy,
}

impl MatrixBackendConfig {
    pub fn new(homeserver: impl Into<String>) -> Self {
        Self {
            homeserver: homeserver.into(),
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }
}

/// Identity established by a successful login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginSession {
    pub user_id: String,
    pub device_id: String,
}

/// Thin wrapper around the matrix-sdk client used by the bot.
#[derive(Debug, Clone)]
pub struct MatrixBackend {
    client: Client,
    retry_policy: RetryPolicy,
}

impl MatrixBackend {
    pub async fn new(config: &MatrixBackendConfig) -> Result<Self, BackendError> {
        let client = Client::builder()
            .homeserver_url(&config.homeserver)
            .build()
            .await
            .map_err(map_client_build_error)?;

        Ok(Self {
            client,
            retry_policy: config.retry_policy,
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy
    }

    /// Logged-in user, if any.
    pub fn user_id(&self) -> Option<String> {
        self.client.user_id().map(ToString::to_string)
    }

    /// Password login, retried with the configured policy.
    ///
    /// Reuses the device id stored for `user_id_or_localpart` by a previous
    /// run and stores the one the homeserver hands back.
    pub async fn login_password(
        &self,
        store: &RoomStateStore,
        user_id_or_localpart: &str,
        password: &str,
        device_display_name: &str,
    ) -> Result<LoginSession, BackendError> {
        let device_id = stored_device_id(store, user_id_or_localpart);
        if let Some(device_id) = &device_id {
            info!(%device_id, "reusing stored device id");
        }

        let session = retry_with_backoff("login", &self.retry_policy, || {
            self.login_once(
                user_id_or_localpart,
                password,
                device_display_name,
                device_id.as_deref(),
            )
        })
        .await
        .map_err(BackendError::retry_exhausted)?;

        if let Err(err) = store.save_device_id(user_id_or_localpart, &session.device_id) {
            warn!(error = %err, "failed to persist device id");
        }
        info!(user_id = %session.user_id, device_id = %session.device_id, "logged in");
        Ok(session)
    }

    async fn login_once(
        &self,
        user_id_or_localpart: &str,
        password: &str,
        device_display_name: &str,
        device_id: Option<&str>,
    ) -> Result<LoginSession, BackendError> {
        let auth = self.client.matrix_auth();
        let mut login = auth
            .login_username(user_id_or_localpart, password)
            .initial_device_display_name(device_display_name);
        if let Some(device_id) = device_id {
            login = login.device_id(device_id);
        }

        let response = login.send().await.map_err(map_matrix_error)?;
        Ok(LoginSession {
            user_id: response.user_id.to_string(),
            device_id: response.device_id.to_string(),
        })
    }

    pub fn transport(&self) -> MatrixTransport {
        MatrixTransport::new(self.client.clone())
    }

    /// Forward membership and encryption state events to the room state
    /// cache. Each event becomes its own unit of work.
    pub fn register_room_state_handlers(&self, dispatcher: RoomEventDispatcher) {
        let members = dispatcher.clone();
        self.client.add_event_handler(
            move |event: OriginalSyncRoomMemberEvent, room: Room| {
                let dispatcher = members.clone();
                async move {
                    dispatcher.dispatch(RoomStateEvent::Membership {
                        room_id: room.room_id().to_string(),
                        user_id: event.state_key.to_string(),
                        membership: membership_from_state(&event.content.membership),
                    });
                }
            },
        );

        self.client.add_event_handler(
            move |event: OriginalSyncRoomEncryptionEvent, room: Room| {
                let dispatcher = dispatcher.clone();
                async move {
                    dispatcher.dispatch(RoomStateEvent::Encryption {
                        room_id: room.room_id().to_string(),
                        config: Some(encryption_config_from_content(&event.content)),
                    });
                }
            },
        );
    }

    /// Join every room the bot is invited to, retrying each join.
    pub fn register_invite_handler(&self) {
        let retry_policy = self.retry_policy;
        self.client.add_event_handler(
            move |event: StrippedRoomMemberEvent, room: Room, client: Client| async move {
                if event.content.membership != MembershipState::Invite
                    || client.user_id() != Some(&*event.state_key)
                {
                    return;
                }

                let room_id = room.room_id().to_owned();
                info!(%room_id, "joining room after invite");
                let description = format!("join {room_id}");
                match retry_with_backoff(&description, &retry_policy, || async {
                    room.join().await.map_err(map_matrix_error)
                })
                .await
                {
                    Ok(()) => info!(%room_id, "joined room"),
                    Err(err) => error!(%room_id, error = %err, "could not join room"),
                }
            },
        );
    }

    /// Long-poll the homeserver until `stop` fires or a non-recoverable error
    /// occurs, persisting the sync cursor after every successful round.
    pub async fn run_sync(
        &self,
        store: &RoomStateStore,
        stop: CancellationToken,
    ) -> Result<(), BackendError> {
        let user_id = self.user_id().ok_or_else(|| {
            BackendError::new(
                BackendErrorCategory::Auth,
                "auth_required",
                "sync requires a logged-in client",
            )
        })?;

        let retry_policy = self.retry_policy;
        let mut attempt: u32 = 0;
        let mut sync_settings = SyncSettings::default().timeout(SYNC_TIMEOUT);
        match store.load_sync_cursor(&user_id) {
            Ok(token) if !token.is_empty() => {
                info!(%user_id, "resuming sync from stored cursor");
                sync_settings = sync_settings.token(token);
            }
            Ok(_) => {}
            Err(err) if err.is_not_found() => info!(%user_id, "no stored sync cursor"),
            Err(err) => return Err(err.into()),
        }

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                sync_result = self.client.sync_once(sync_settings.clone()) => {
                    match sync_result {
                        Ok(response) => {
                            attempt = 0;
                            if let Err(err) = store.save_sync_cursor(&user_id, &response.next_batch) {
                                warn!(error = %err, "failed to persist sync cursor");
                            }
                            sync_settings = sync_settings.token(response.next_batch);
                        }
                        Err(err) => {
                            let mapped = map_matrix_error(err);
                            if !is_recoverable_sync_error(&mapped) {
                                error!(error = %mapped, "sync failed");
                                return Err(mapped);
                            }

                            let delay = retry_policy.delay_for_attempt(attempt, mapped.retry_after_ms);
                            attempt = attempt.saturating_add(1);
                            warn!(error = %mapped, delay_ms = delay.as_millis() as u64, "sync failed, backing off");

                            tokio::select! {
                                _ = stop.cancelled() => break,
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                    }
                }
            }
        }

        info!("sync stopped");
        Ok(())
    }
}

/// [`Transport`] that sends raw events through matrix-sdk.
///
/// Content is sent exactly as given; encryption happens before this layer.
#[derive(Debug, Clone)]
pub struct MatrixTransport {
    client: Client,
}

impl MatrixTransport {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn lookup_room(&self, room_id: &str) -> Result<Room, BackendError> {
        let room_id = parse_room_id(room_id)?;
        self.client.get_room(&room_id).ok_or_else(|| {
            BackendError::new(
                BackendErrorCategory::Config,
                "room_not_found",
                format!("room not found: {room_id}"),
            )
        })
    }
}

#[async_trait]
impl Transport for MatrixTransport {
    async fn send_event(
        &self,
        room_id: &str,
        event_type: &str,
        content: Value,
    ) -> Result<SendResponse, BackendError> {
        let room = self.lookup_room(room_id)?;
        let response = room
            .send_raw(event_type, content)
            .await
            .map_err(map_matrix_error)?;
        debug!(room_id, event_type, event_id = %response.event_id, "event sent");

        Ok(SendResponse {
            event_id: response.event_id.to_string(),
        })
    }
}

/// Crypto engine for builds without end-to-end encryption support.
///
/// Every call fails with a non-recoverable error, so sends to encrypted rooms
/// exhaust their retry budget instead of leaking plaintext.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledCryptoEngine;

const E2EE_UNAVAILABLE: &str = "end-to-end encryption is not available in this build";

impl DisabledCryptoEngine {
    /// Text of every error this engine returns, for startup warnings.
    pub fn unavailable_reason() -> &'static str {
        E2EE_UNAVAILABLE
    }
}

#[async_trait]
impl CryptoEngine for DisabledCryptoEngine {
    async fn encrypt_for_room(
        &self,
        _room_id: &str,
        _event_type: &str,
        _content: &Value,
    ) -> Result<EncryptedEnvelope, CryptoError> {
        Err(CryptoError::Other(E2EE_UNAVAILABLE.to_owned()))
    }

    async fn share_group_session(
        &self,
        _room_id: &str,
        _members: &[String],
    ) -> Result<(), CryptoError> {
        Err(CryptoError::Other(E2EE_UNAVAILABLE.to_owned()))
    }
}

fn parse_room_id(value: &str) -> Result<OwnedRoomId, BackendError> {
    value.parse::<OwnedRoomId>().map_err(|err| {
        BackendError::new(
            BackendErrorCategory::Config,
            "invalid_room_id",
            format!("invalid room id '{value}': {err}"),
        )
    })
}

/// Device id saved by an earlier login. Read failures fall back to a fresh
/// device.
fn stored_device_id(store: &RoomStateStore, user: &str) -> Option<String> {
    match store.load_device_id(user) {
        Ok(device_id) if !device_id.is_empty() => Some(device_id),
        Ok(_) => None,
        Err(err) if err.is_not_found() => None,
        Err(err) => {
            warn!(error = %err, "failed to read stored device id");
            None
        }
    }
}

fn membership_from_state(state: &MembershipState) -> Membership {
    match state {
        MembershipState::Invite => Membership::Invite,
        MembershipState::Join => Membership::Join,
        MembershipState::Ban => Membership::Ban,
        MembershipState::Knock => Membership::Knock,
        _ => Membership::Leave,
    }
}

fn encryption_config_from_content(content: &RoomEncryptionEventContent) -> EncryptionConfig {
    EncryptionConfig {
        algorithm: content.algorithm.to_string(),
        rotation_period_ms: content.rotation_period_ms.map(u64::from),
        rotation_period_msgs: content.rotation_period_msgs.map(u64::from),
    }
}

fn is_recoverable_sync_error(err: &BackendError) -> bool {
    matches!(
        err.category,
        BackendErrorCategory::Network | BackendErrorCategory::RateLimited
    )
}

fn map_matrix_http_error(err: HttpError) -> BackendError {
    if let Some(client_err) = err.as_client_api_error() {
        let status = client_err.status_code.as_u16();
        let mut mapped = BackendError::new(
            classify_http_status(status),
            "matrix_http_error",
            client_err.to_string(),
        );

        if let Some(ErrorKind::LimitExceeded { retry_after }) = client_err.error_kind()
            && let Some(RetryAfter::Delay(delay)) = retry_after
        {
            mapped = mapped.with_retry_after(*delay);
        }

        mapped
    } else {
        BackendError::new(
            BackendErrorCategory::Network,
            "matrix_http_error",
            err.to_string(),
        )
    }
}

fn map_matrix_error(err: matrix_sdk::Error) -> BackendError {
    use matrix_sdk::Error;

    match err {
        Error::Http(http_err) => map_matrix_http_error(*http_err),
        Error::AuthenticationRequired => {
            BackendError::new(BackendErrorCategory::Auth, "auth_required", err.to_string())
        }
        Error::StateStore(_) | Error::Io(_) => BackendError::new(
            BackendErrorCategory::Storage,
            "storage_error",
            err.to_string(),
        ),
        Error::SerdeJson(_) => BackendError::new(
            BackendErrorCategory::Serialization,
            "serde_json_error",
            err.to_string(),
        ),
        _ => BackendError::new(
            BackendErrorCategory::Internal,
            "matrix_error",
            err.to_string(),
        ),
    }
}

fn map_client_build_error(err: ClientBuildError) -> BackendError {
    BackendError::new(
        BackendErrorCategory::Config,
        "client_build_error",
        err.to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use backend_core::MEGOLM_ALGORITHM;
    use serde_json::json;

    async fn offline_backend() -> MatrixBackend {
        MatrixBackend::new(&MatrixBackendConfig::new("https://matrix.example.org"))
            .await
            .expect("client builds without network access")
    }

    #[test]
    fn rejects_invalid_room_id() {
        let err = parse_room_id("not-a-room-id").expect_err("invalid room id must fail");
        assert_eq!(err.code, "invalid_room_id");
    }

    #[test]
    fn maps_membership_states() {
        assert_eq!(membership_from_state(&MembershipState::Join), Membership::Join);
        assert_eq!(membership_from_state(&MembershipState::Invite), Membership::Invite);
        assert_eq!(membership_from_state(&MembershipState::Ban), Membership::Ban);
        assert_eq!(membership_from_state(&MembershipState::Leave), Membership::Leave);
        assert_eq!(membership_from_state(&MembershipState::Knock), Membership::Knock);
    }

    #[test]
    fn maps_encryption_event_content() {
        let content: RoomEncryptionEventContent = serde_json::from_value(json!({
            "algorithm": MEGOLM_ALGORITHM,
            "rotation_period_ms": 604800000,
            "rotation_period_msgs": 100
        }))
        .expect("valid m.room.encryption content");

        assert_eq!(
            encryption_config_from_content(&content),
            EncryptionConfig {
                algorithm: MEGOLM_ALGORITHM.to_owned(),
                rotation_period_ms: Some(604_800_000),
                rotation_period_msgs: Some(100),
            }
        );
    }

    #[test]
    fn recoverable_sync_error_categories_are_limited_to_network_and_rate_limit() {
        let network = BackendError::new(BackendErrorCategory::Network, "n", "network");
        let rate = BackendError::new(BackendErrorCategory::RateLimited, "r", "rate");
        let auth = BackendError::new(BackendErrorCategory::Auth, "a", "auth");

        assert!(is_recoverable_sync_error(&network));
        assert!(is_recoverable_sync_error(&rate));
        assert!(!is_recoverable_sync_error(&auth));
    }

    #[test]
    fn sync_loop_retry_hint_uses_error_retry_after() {
        let err = BackendError::new(BackendErrorCategory::RateLimited, "rate", "wait")
            .with_retry_after(Duration::from_secs(7));
        let policy = RetryPolicy::default();
        let delay = policy.delay_for_attempt(0, err.retry_after_ms);
        assert_eq!(delay, Duration::from_secs(7));
    }

    #[tokio::test]
    async fn disabled_crypto_engine_is_not_rekeyable() {
        let engine = DisabledCryptoEngine;
        let err = engine
            .encrypt_for_room("!a:example.org", "m.room.message", &json!({}))
            .await
            .expect_err("encryption is disabled");
        assert!(!err.is_rekeyable());
        assert_eq!(
            err,
            CryptoError::Other(DisabledCryptoEngine::unavailable_reason().to_owned())
        );
        assert!(
            engine
                .share_group_session("!a:example.org", &[])
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn transport_rejects_unknown_rooms_before_any_request() {
        let transport = offline_backend().await.transport();

        let err = transport
            .send_event("not-a-room", "m.room.message", json!({}))
            .await
            .expect_err("invalid id");
        assert_eq!(err.code, "invalid_room_id");

        let err = transport
            .send_event("!unknown:example.org", "m.room.message", json!({}))
            .await
            .expect_err("room not joined");
        assert_eq!(err.code, "room_not_found");
    }

    #[test]
    fn stored_device_id_is_reused_when_present() {
        let store = RoomStateStore::in_memory().expect("store");
        assert_eq!(stored_device_id(&store, "bot"), None);

        store.save_device_id("bot", "").expect("save empty");
        assert_eq!(stored_device_id(&store, "bot"), None);

        store.save_device_id("bot", "BOTDEVICE").expect("save");
        assert_eq!(stored_device_id(&store, "bot").as_deref(), Some("BOTDEVICE"));
        assert_eq!(stored_device_id(&store, "other"), None);
    }

    #[tokio::test]
    async fn backend_keeps_configured_retry_policy() {
        let config = MatrixBackendConfig::new("https://matrix.example.org")
            .with_retry_policy(RetryPolicy::new(250, 5_000, 3));
        let backend = MatrixBackend::new(&config).await.expect("client builds");

        let policy = backend.retry_policy();
        assert_eq!(policy.base_delay_ms(), 250);
        assert_eq!(policy.max_delay_ms(), 5_000);
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(
            MatrixBackendConfig::new("https://matrix.example.org")
                .retry_policy
                .max_attempts(),
            RetryPolicy::default().max_attempts()
        );
    }

    #[tokio::test]
    async fn sync_requires_login() {
        let backend = offline_backend().await;
        let store = RoomStateStore::in_memory().expect("store");

        let err = backend
            .run_sync(&store, CancellationToken::new())
            .await
            .expect_err("not logged in");
        assert_eq!(err.code, "auth_required");
    }
}
