use std::sync::Arc;

use backend_core::{CryptoEngine, RetryPolicy, Transport};
use backend_store::RoomStateStore;

use crate::{dispatch::RoomEventDispatcher, pipeline::OutboundPipeline};

/// Everything the bot's handlers need, built once at startup and handed to
/// each component explicitly.
#[derive(Clone)]
pub struct DeliveryContext {
    store: RoomStateStore,
    outbound: Arc<OutboundPipeline>,
    dispatcher: RoomEventDispatcher,
}

impl DeliveryContext {
    pub fn new(
        store: RoomStateStore,
        crypto: Arc<dyn CryptoEngine>,
        transport: Arc<dyn Transport>,
        retry_policy: RetryPolicy,
    ) -> Self {
        let outbound = Arc::new(OutboundPipeline::new(
            store.clone(),
            crypto,
            transport,
            retry_policy,
        ));
        let dispatcher = RoomEventDispatcher::new(store.clone());
        Self {
            store,
            outbound,
            dispatcher,
        }
    }

    pub fn store(&self) -> &RoomStateStore {
        &self.store
    }

    pub fn outbound(&self) -> &Arc<OutboundPipeline> {
        &self.outbound
    }

    pub fn dispatcher(&self) -> &RoomEventDispatcher {
        &self.dispatcher
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        self.outbound.retry_policy()
    }
}
