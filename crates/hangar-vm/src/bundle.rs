//! On-disk VM bundles.
//!
//! Each runner's VM lives in `<runners_path>/<runner_id>.bundle/`. The
//! hypervisor owns the disk images inside it; the agent owns
//! `RuntimeMetadata.json`, which records what the agent learned at
//! runtime (mainly the guest IP) so maintenance commands can find it.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{VmError, VmResult};

pub const BUNDLE_SUFFIX: &str = ".bundle";
pub const DISK_IMAGE: &str = "Disk.img";
pub const AUXILIARY_STORAGE: &str = "AuxiliaryStorage";
pub const HARDWARE_MODEL: &str = "HardwareModel.json";
pub const MACHINE_IDENTIFIER: &str = "MachineIdentifier";
pub const RUNTIME_METADATA: &str = "RuntimeMetadata.json";

/// Paths of one runner's bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    root: PathBuf,
}

impl Bundle {
    pub fn for_runner(runners_path: &Path, runner_id: &str) -> Self {
        Self {
            root: runners_path.join(format!("{runner_id}{BUNDLE_SUFFIX}")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn exists(&self) -> bool {
        self.root.is_dir()
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.root.join(RUNTIME_METADATA)
    }

    pub fn load_metadata(&self) -> VmResult<RuntimeMetadata> {
        let data = std::fs::read(self.metadata_path())?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub fn save_metadata(&self, metadata: &RuntimeMetadata) -> VmResult<()> {
        let data = serde_json::to_vec_pretty(metadata)?;
        std::fs::write(self.metadata_path(), data)?;
        Ok(())
    }

    /// Load, apply `f`, stamp `updated_at`, save.
    pub fn update_metadata(&self, f: impl FnOnce(&mut RuntimeMetadata)) -> VmResult<RuntimeMetadata> {
        let mut metadata = self.load_metadata()?;
        f(&mut metadata);
        metadata.updated_at = Utc::now();
        self.save_metadata(&metadata)?;
        Ok(metadata)
    }

    /// Guest IP recorded in the metadata. Errors while it is still empty.
    pub fn ip_address(&self, runner_id: &str) -> VmResult<String> {
        let metadata = self.load_metadata()?;
        if metadata.ip_address.is_empty() {
            return Err(VmError::NoIpAddress(runner_id.to_string()));
        }
        Ok(metadata.ip_address)
    }

    /// Remove the whole bundle. A bundle that is already gone is success.
    pub fn remove(&self) -> VmResult<()> {
        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = ?self.root, "bundle already removed");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Agent-side state of a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleState {
    Creating,
    Booting,
    Running,
    Stopped,
    Error,
}

impl std::fmt::Display for BundleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BundleState::Creating => "creating",
            BundleState::Booting => "booting",
            BundleState::Running => "running",
            BundleState::Stopped => "stopped",
            BundleState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Contents of `RuntimeMetadata.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeMetadata {
    pub runner_id: String,
    #[serde(default)]
    pub ip_address: String,
    pub created_at: DateTime<Utc>,
    pub state: BundleState,
    pub updated_at: DateTime<Utc>,
}

impl RuntimeMetadata {
    pub fn new(runner_id: &str) -> Self {
        let now = Utc::now();
        Self {
            runner_id: runner_id.to_string(),
            ip_address: String::new(),
            created_at: now,
            state: BundleState::Creating,
            updated_at: now,
        }
    }
}

/// One entry of [`list_bundles`].
#[derive(Debug, Clone, PartialEq)]
pub struct BundleEntry {
    pub path: PathBuf,
    pub metadata: RuntimeMetadata,
}

/// Every bundle under `runners_path` with readable metadata, sorted by
/// runner id. A missing directory yields an empty list.
pub fn list_bundles(runners_path: &Path) -> VmResult<Vec<BundleEntry>> {
    let entries = match std::fs::read_dir(runners_path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut bundles = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.ends_with(BUNDLE_SUFFIX) || !entry.path().is_dir() {
            continue;
        }
        let bundle = Bundle { root: entry.path() };
        match bundle.load_metadata() {
            Ok(metadata) => bundles.push(BundleEntry {
                path: bundle.root,
                metadata,
            }),
            Err(e) => debug!(path = ?entry.path(), error = %e, "skipping unreadable bundle"),
        }
    }
    bundles.sort_by(|a, b| a.metadata.runner_id.cmp(&b.metadata.runner_id));
    Ok(bundles)
}
