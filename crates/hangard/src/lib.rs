//! hangard: assembly of the coordinator and agent daemons.
//!
//! The binary in `main.rs` parses flags and hands off to one of these
//! modules. They are a library so the integration tests can build the
//! same service graph the daemon runs.

pub mod agent_mode;
pub mod control_plane;
pub mod vm_cmd;
