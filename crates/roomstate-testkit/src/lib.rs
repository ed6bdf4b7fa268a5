//! Roomstate Testing Infrastructure
//!
//! Shared test support for the roomstate crates: in-process authorities,
//! fault-injecting snapshot storage, a manual clock and game-room fixtures.
//!
//! ```rust,no_run
//! use roomstate_testkit::*;
//!
//! init_test_tracing();
//! let authority = LoopbackAuthority::new(fixtures::authoritative_state(5, 1_000));
//! authority.fail_next(2, roomstate_core::TransportError::unreachable("down"));
//! ```

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

pub mod clock;
pub mod fixtures;
pub mod remote;
pub mod storage;

pub use clock::ManualClock;
pub use remote::{LoopbackAuthority, ScriptedEndpoint};
pub use storage::FaultyStorage;

use std::sync::Once;

static TRACING: Once = Once::new();

/// Install a test-writer `tracing` subscriber once per process.
///
/// Honors `RUST_LOG`, defaulting to `warn`.
pub fn init_test_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
