//! Effect interfaces for the engine's external capabilities
//!
//! The engine talks to the outside world through two capabilities: the
//! remote synchronization endpoint (the room's single authority) and
//! snapshot storage. Both are async traits; handlers live in the sync crate
//! (storage) or are supplied by the embedding application (transport).

pub mod remote;
pub mod storage;
pub mod time;

pub use remote::{PendingUpdateEnvelope, RemoteEndpoint, SyncRequest, SyncResponse};
pub use storage::SnapshotStorage;
pub use time::{PhysicalClock, SystemClock};
