//! VM lifecycle error types.

use std::time::Duration;

use thiserror::Error;

use crate::ipnotify::ArbiterError;

pub type VmResult<T> = Result<T, VmError>;

#[derive(Debug, Error)]
pub enum VmError {
    #[error("hypervisor error: {0}")]
    Hypervisor(String),

    #[error("VM failed to start, state: {0}")]
    BootFailed(String),

    #[error("VM did not reach running state within {0:?}")]
    BootTimeout(Duration),

    #[error("failed to receive IP notification: {0}")]
    IpTimeout(#[from] ArbiterError),

    #[error("SSH wait timeout after {attempts} attempts")]
    SshTimeout { attempts: u32 },

    #[error("setup script failed: {0}")]
    SetupScript(String),

    #[error("exec failed: {0}")]
    Exec(String),

    #[error("VM not found: {0}")]
    NotFound(String),

    #[error("VM IP address not yet discovered: {0}")]
    NoIpAddress(String),

    #[error("runtime metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl VmError {
    /// The target VM or bundle is already gone.
    pub fn is_not_found(&self) -> bool {
        match self {
            VmError::NotFound(_) => true,
            VmError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}
