//! Settlement of in-flight explorations.
//!
//! An accepted exploration is parked in a [`PendingExplorationStore`] until
//! either its feedback arrives (explicit `pop`) or its TTL runs out (the entry's
//! expiry callback). Both paths go through the same lock, so every entry is
//! settled exactly once. The TTL itself comes from an
//! [`AdaptiveTimeoutEstimator`] fed with confirmed feedback latencies.

mod store;
mod timeout;

pub use store::{ExpireCallback, PendingExplorationStore};
pub use timeout::{AdaptiveTimeoutEstimator, RECENT_CAPACITY};
