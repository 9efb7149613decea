//! SQLite-backed cache of room state.
//!
//! Tracks which rooms are encrypted, who is invited to or joined in each
//! room, and the per-account filter id and sync cursor. Inbound event
//! handlers write to it; the delivery pipeline, the crypto engine and the
//! sync loop read from it.

mod error;
mod schema;
mod store;

pub use error::StoreError;
pub use store::RoomStateStore;
