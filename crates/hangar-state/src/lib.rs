//! hangar-state: the coordinator's authoritative view of the fleet.
//!
//! # Architecture
//!
//! ```text
//!  agents:              agent_id    → Agent
//!  runners:             runner_id   → Runner
//!  runner_to_agent:     runner_id   → agent_id
//!  external_to_runner:  external_id → runner_id
//! ```
//!
//! All four maps live behind one `RwLock`, so every operation is atomic
//! with respect to every other. Nothing is persisted: after a coordinator
//! restart the store is rebuilt from agent re-registration and snapshots.
//!
//! The `Store` is `Clone` + `Send` + `Sync` (backed by an `Arc`) and can be
//! shared across async tasks. No lock is ever held across an `.await`.

pub mod error;
pub mod store;

pub use error::{StateError, StateResult};
pub use store::Store;
