//! hangar-core: shared domain types for the Hangar runner fleet.
//!
//! Defines the agent and runner data model exchanged between the
//! coordinator and host agents, the runner lifecycle transition rules,
//! and the TOML configuration for both daemon modes.

pub mod config;
pub mod lifecycle;
pub mod types;

pub use lifecycle::{TransitionError, TransitionResult};
pub use types::*;
