//! hangar-vm: everything an agent needs to turn a runner id into a
//! reachable, configured VM and back.
//!
//! # Architecture
//!
//! ```text
//!  VmLifecycleManager
//!    ├── Hypervisor      (clone / boot / stop / kill / state)
//!    ├── IpArbiter       (guest POST /notify-ip  →  waiting start())
//!    ├── GuestShell      (ssh reachability, setup script)
//!    ├── GuestShimClient (guest HTTP /exec and /status)
//!    └── bundle          (<runners_path>/<runner_id>.bundle/RuntimeMetadata.json)
//!
//!  RunnerManager         (agent-local runner records + change notification)
//! ```
//!
//! The manager reports failures as [`VmError`]; it never touches runner
//! state. Callers driving the lifecycle decide how a failure maps onto
//! the runner.

pub mod bundle;
pub mod error;
#[cfg(any(test, feature = "testing"))]
pub mod fake;
pub mod hypervisor;
pub mod ipnotify;
pub mod manager;
pub mod runner;
pub mod shell;
pub mod shim;

pub use error::{VmError, VmResult};
pub use hypervisor::{CommandHypervisor, Hypervisor, VmPowerState};
pub use ipnotify::{ArbiterError, ArbiterResult, IpArbiter};
pub use manager::{LifecycleTimeouts, VmInfo, VmLifecycleManager, VmManager};
pub use runner::{RunnerError, RunnerManager, RunnerResult};
pub use shell::{GuestShell, SshShell};
pub use shim::{ExecOutput, GuestShimClient, GuestStatus};
