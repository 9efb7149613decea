//! Outbound delivery for room-bot.
//!
//! [`OutboundPipeline`] decides per event whether to encrypt, recovers from
//! unusable group sessions by re-sharing one with the cached member list, and
//! retries the whole sequence with Fibonacci backoff.
//! [`RoomEventDispatcher`] keeps the room state cache current from inbound
//! events without blocking the caller.

mod context;
mod dispatch;
mod pipeline;

pub use context::DeliveryContext;
pub use dispatch::{RoomEventDispatcher, apply_room_state_event};
pub use pipeline::OutboundPipeline;
