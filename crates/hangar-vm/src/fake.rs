//! In-memory stand-ins for the hypervisor and the guest shell.
//!
//! Used by unit tests here and by the end-to-end tests of `hangard`.
//! [`FakeHypervisor::announce_via`] plays the part of a booting guest by
//! posting its IP to an [`IpArbiter`] the way the real guest does over
//! HTTP.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::bundle::{AUXILIARY_STORAGE, DISK_IMAGE, HARDWARE_MODEL, MACHINE_IDENTIFIER};
use crate::error::{VmError, VmResult};
use crate::hypervisor::{Hypervisor, VmPowerState};
use crate::ipnotify::{ArbiterError, IpArbiter};
use crate::shell::GuestShell;

struct Announcer {
    arbiter: IpArbiter,
    ip: String,
}

pub struct FakeHypervisor {
    states: Mutex<HashMap<PathBuf, VmPowerState>>,
    boot_state: VmPowerState,
    hang_boot: bool,
    graceful_stop: bool,
    create_error: Option<String>,
    announcer: Mutex<Option<Announcer>>,
    force_stops: AtomicU32,
}

impl Default for FakeHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeHypervisor {
    pub fn new() -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            boot_state: VmPowerState::Running,
            hang_boot: false,
            graceful_stop: true,
            create_error: None,
            announcer: Mutex::new(None),
            force_stops: AtomicU32::new(0),
        }
    }

    /// State every VM reports after `boot`.
    pub fn with_boot_state(mut self, state: VmPowerState) -> Self {
        self.boot_state = state;
        self
    }

    /// `boot` never returns.
    pub fn with_hanging_boot(mut self) -> Self {
        self.hang_boot = true;
        self
    }

    /// Whether guests honour a graceful stop request.
    pub fn with_graceful_stop(mut self, honoured: bool) -> Self {
        self.graceful_stop = honoured;
        self
    }

    pub fn with_create_error(mut self, message: &str) -> Self {
        self.create_error = Some(message.to_string());
        self
    }

    /// After each successful boot, announce `ip` to `arbiter` under a
    /// fresh guest UUID.
    pub fn announce_via(&self, arbiter: IpArbiter, ip: &str) {
        *self.announcer.lock().expect("announcer lock") = Some(Announcer {
            arbiter,
            ip: ip.to_string(),
        });
    }

    pub fn force_stops(&self) -> u32 {
        self.force_stops.load(Ordering::SeqCst)
    }

    pub fn power_state(&self, bundle: &Path) -> Option<VmPowerState> {
        self.states.lock().expect("states lock").get(bundle).copied()
    }

    fn set(&self, bundle: &Path, state: VmPowerState) {
        self.states
            .lock()
            .expect("states lock")
            .insert(bundle.to_path_buf(), state);
    }
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    async fn create_from_template(&self, _template: &Path, bundle: &Path) -> VmResult<()> {
        if let Some(message) = &self.create_error {
            return Err(VmError::Hypervisor(message.clone()));
        }
        std::fs::create_dir_all(bundle)?;
        for name in [DISK_IMAGE, AUXILIARY_STORAGE, HARDWARE_MODEL, MACHINE_IDENTIFIER] {
            std::fs::write(bundle.join(name), b"")?;
        }
        self.set(bundle, VmPowerState::Stopped);
        Ok(())
    }

    async fn boot(&self, bundle: &Path) -> VmResult<()> {
        if self.hang_boot {
            self.set(bundle, VmPowerState::Starting);
            std::future::pending::<()>().await;
        }
        self.set(bundle, self.boot_state);
        if self.boot_state != VmPowerState::Running {
            return Ok(());
        }

        let announcer = self.announcer.lock().expect("announcer lock");
        if let Some(Announcer { arbiter, ip }) = announcer.as_ref() {
            let arbiter = arbiter.clone();
            let ip = ip.clone();
            let guest_id = uuid::Uuid::new_v4().to_string();
            tokio::spawn(async move {
                // The waiter registers only after boot returns.
                for _ in 0..600 {
                    match arbiter.notify(&guest_id, &ip) {
                        Err(ArbiterError::NoPendingRequests) => {
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                        other => {
                            debug!(%guest_id, result = ?other, "fake guest announced");
                            return;
                        }
                    }
                }
            });
        }
        Ok(())
    }

    async fn request_graceful_stop(&self, bundle: &Path) -> VmResult<bool> {
        if self.graceful_stop {
            self.set(bundle, VmPowerState::Stopped);
        }
        Ok(self.graceful_stop)
    }

    async fn force_stop(&self, bundle: &Path) -> VmResult<()> {
        self.force_stops.fetch_add(1, Ordering::SeqCst);
        self.set(bundle, VmPowerState::Stopped);
        Ok(())
    }

    async fn state(&self, bundle: &Path) -> VmResult<VmPowerState> {
        Ok(self.power_state(bundle).unwrap_or(VmPowerState::Stopped))
    }
}

/// Guest shell that never leaves the process.
pub struct FakeShell {
    reachable: AtomicBool,
    script_error: Mutex<Option<String>>,
    scripts: Mutex<Vec<(String, String)>>,
}

impl Default for FakeShell {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeShell {
    pub fn new() -> Self {
        Self {
            reachable: AtomicBool::new(true),
            script_error: Mutex::new(None),
            scripts: Mutex::new(Vec::new()),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Make every subsequent script fail with `message`.
    pub fn fail_scripts(&self, message: &str) {
        *self.script_error.lock().expect("script lock") = Some(message.to_string());
    }

    /// `(ip, script)` pairs run so far.
    pub fn scripts(&self) -> Vec<(String, String)> {
        self.scripts.lock().expect("script lock").clone()
    }
}

#[async_trait]
impl GuestShell for FakeShell {
    async fn check_reachable(&self, ip: &str) -> VmResult<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(VmError::Io(std::io::Error::other(format!(
                "ssh: connect to host {ip} port 22: Connection refused"
            ))))
        }
    }

    async fn run_script(&self, ip: &str, script: &str) -> VmResult<String> {
        self.scripts
            .lock()
            .expect("script lock")
            .push((ip.to_string(), script.to_string()));
        match self.script_error.lock().expect("script lock").clone() {
            Some(message) => Err(VmError::SetupScript(message)),
            None => Ok(String::new()),
        }
    }
}
