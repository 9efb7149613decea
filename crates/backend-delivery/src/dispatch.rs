use backend_core::RoomStateEvent;
use backend_store::RoomStateStore;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Applies inbound room-state events to the cache, one independent unit of
/// work per event.
///
/// Dispatch never waits for the write. Units race with each other and with
/// in-flight sends; each write is atomic on its own, but there is no
/// ordering between them.
#[derive(Clone, Debug)]
pub struct RoomEventDispatcher {
    store: RoomStateStore,
}

impl RoomEventDispatcher {
    pub fn new(store: RoomStateStore) -> Self {
        Self { store }
    }

    /// Spawn the cache update for `event` and return without blocking.
    ///
    /// Must be called from within a Tokio runtime. Awaiting the handle is
    /// only needed by callers that want to observe completion.
    pub fn dispatch(&self, event: RoomStateEvent) -> JoinHandle<()> {
        let store = self.store.clone();
        debug!(room_id = event.room_id(), "dispatching room state event");
        tokio::task::spawn_blocking(move || apply_room_state_event(&store, event))
    }
}

/// Write one room-state event to the cache. Failures are logged.
pub fn apply_room_state_event(store: &RoomStateStore, event: RoomStateEvent) {
    match event {
        RoomStateEvent::Membership {
            room_id,
            user_id,
            membership,
        } => store.set_membership(&room_id, &user_id, membership),
        RoomStateEvent::Encryption { room_id, config } => {
            if let Err(err) = store.set_encryption_config(&room_id, config.as_ref()) {
                error!(room_id, error = %err, "failed to store encryption config");
            }
        }
    }
}
