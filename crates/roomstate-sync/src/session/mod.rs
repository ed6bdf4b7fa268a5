//! Room session
//!
//! [`RoomSession`] is the consumer surface of the engine. A session owns one
//! room's canonical state on a dedicated task and serializes every mutation:
//! optimistic updates, sync responses, conflict resolutions and snapshot
//! restores commit one at a time, and the version never decreases.

mod actor;
mod events;
mod handle;

pub use actor::UpdateBacklog;
pub use events::{
    ConflictListener, ErrorListener, StateChange, StateChangeCause, StateListener, SubscriptionId,
};
pub use handle::{RoomSession, RoomSessionBuilder};
