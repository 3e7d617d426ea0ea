//! Per-VM lifecycle: config generation, firecracker spawn, guest
//! handshake, kill.
//!
//! A VM owns its workspace directory and everything in it (sockets,
//! config); the pooled namespace it boots in is owned by the caller and
//! returned to the pool by the caller, never by the VM.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use uuid::Uuid;
use vsock_host::VsockClient;

use guest_client::GuestClient as _;

use crate::api::FirecrackerApi;
use crate::config::VmConfig;
use crate::error::{FleetError, Result};
use crate::network::{GUEST_NETWORK, generate_guest_boot_args};
use crate::paths::VmPaths;
use crate::process;

/// Grace period between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Eight lowercase hex characters identifying one concurrent VM.
///
/// Derived from the first segment of the run id; cross-process collisions
/// are prevented by workspace path namespacing, not by the id itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmId(String);

impl VmId {
    pub fn from_run_id(run_id: &Uuid) -> Self {
        let hyphenated = run_id.to_string();
        let first_segment = hyphenated.split('-').next().unwrap_or_default();
        Self(first_segment.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for VmId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// VM lifecycle states. Monotonic, except that `Killing` is reachable from
/// every non-terminal state.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Created = 0,
    Booting = 1,
    Ready = 2,
    Executing = 3,
    Killing = 4,
    Dead = 5,
}

impl VmState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Created,
            1 => Self::Booting,
            2 => Self::Ready,
            3 => Self::Executing,
            4 => Self::Killing,
            _ => Self::Dead,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Booting => "booting",
            Self::Ready => "ready",
            Self::Executing => "executing",
            Self::Killing => "killing",
            Self::Dead => "dead",
        }
    }
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

pub struct FirecrackerVm {
    vm_id: VmId,
    config: VmConfig,
    paths: VmPaths,
    netns_name: String,
    process: Option<tokio::process::Child>,
    state: Arc<AtomicU8>,
    vsock_task: Option<tokio::task::JoinHandle<guest_client::Result<VsockClient>>>,
    guest: Option<Arc<VsockClient>>,
}

impl FirecrackerVm {
    /// Allocate the VM's workspace directory and prepare its identity.
    pub async fn create(vm_id: VmId, config: VmConfig, netns_name: &str) -> Result<Self> {
        let paths = VmPaths::new(&config.workspace_root, vm_id.as_str());
        tokio::fs::create_dir_all(paths.workspace())
            .await
            .map_err(|e| FleetError::StartFailed(format!("mkdir workspace: {e}")))?;

        Ok(Self {
            vm_id,
            config,
            paths,
            netns_name: netns_name.to_string(),
            process: None,
            state: Arc::new(AtomicU8::new(VmState::Created as u8)),
            vsock_task: None,
            guest: None,
        })
    }

    pub fn id(&self) -> &VmId {
        &self.vm_id
    }

    pub fn state(&self) -> VmState {
        VmState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn paths(&self) -> &VmPaths {
        &self.paths
    }

    fn transition(&self, from: VmState, to: VmState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Spawn firecracker inside the namespace. `Created → Booting`.
    ///
    /// The vsock listener is bound *before* the spawn so the guest's first
    /// connection attempt cannot race the listener; `guest_timeout` bounds
    /// both the accept and the handshake, collected later by
    /// [`wait_for_guest`](Self::wait_for_guest).
    ///
    /// A failure after the spawn kills the process and removes the
    /// workspace before returning.
    pub async fn start(&mut self, guest_timeout: Duration) -> Result<()> {
        if !self.transition(VmState::Created, VmState::Booting) {
            return Err(FleetError::InvalidState {
                expected: VmState::Created.name(),
                found: self.state().name(),
            });
        }

        let vsock_path = self.paths.vsock_sock().display().to_string();
        self.vsock_task = Some(tokio::spawn(async move {
            VsockClient::wait_for_connection(&vsock_path, guest_timeout).await
        }));

        let result = if self.config.snapshot.is_some() {
            self.start_from_snapshot().await
        } else {
            self.start_cold().await
        };

        if let Err(e) = result {
            if let Some(task) = self.vsock_task.take() {
                task.abort();
            }
            self.kill().await?;
            return Err(e);
        }

        info!(vm_id = %self.vm_id, "firecracker started");
        Ok(())
    }

    /// Cold boot via `--config-file --no-api`.
    async fn start_cold(&mut self) -> Result<()> {
        let config_json = self.build_boot_config();
        let pretty = serde_json::to_string_pretty(&config_json)
            .map_err(|e| FleetError::StartFailed(format!("serialize config: {e}")))?;
        tokio::fs::write(self.paths.config_json(), pretty.as_bytes())
            .await
            .map_err(|e| FleetError::StartFailed(format!("write config: {e}")))?;

        let username = process::current_username()?;
        let child = tokio::process::Command::new("sudo")
            .args(["ip", "netns", "exec", &self.netns_name])
            .args(["sudo", "-u", &username])
            .arg(&self.config.binary_path)
            .arg("--config-file")
            .arg(self.paths.config_json())
            .arg("--no-api")
            .current_dir(self.paths.workspace())
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| FleetError::ProcessSpawn(format!("firecracker: {e}")))?;

        self.track_process(child);
        Ok(())
    }

    /// Snapshot restore via `--api-sock` + `PUT /snapshot/load`.
    async fn start_from_snapshot(&mut self) -> Result<()> {
        let snapshot = self
            .config
            .snapshot
            .clone()
            .ok_or_else(|| FleetError::StartFailed("missing snapshot config".into()))?;

        let username = process::current_username()?;
        let child = tokio::process::Command::new("sudo")
            .args(["ip", "netns", "exec", &self.netns_name])
            .args(["sudo", "-u", &username])
            .arg(&self.config.binary_path)
            .arg("--api-sock")
            .arg(self.paths.api_sock())
            .current_dir(self.paths.workspace())
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| FleetError::ProcessSpawn(format!("firecracker: {e}")))?;

        self.track_process(child);

        let api = FirecrackerApi::new(self.paths.api_sock());
        api.wait_for_ready(Duration::from_secs(5)).await?;
        api.load_snapshot(
            &snapshot.snapshot_path.display().to_string(),
            &snapshot.memory_path.display().to_string(),
        )
        .await?;

        info!(vm_id = %self.vm_id, "snapshot loaded and resumed");
        Ok(())
    }

    /// Firecracker JSON config for a cold boot: fixed network identity,
    /// rootfs drive, vsock device bridged through the workspace.
    fn build_boot_config(&self) -> serde_json::Value {
        let boot_args = format!(
            "console=ttyS0 reboot=k panic=1 pci=off {}",
            generate_guest_boot_args()
        );
        serde_json::json!({
            "boot-source": {
                "kernel_image_path": self.config.kernel_path.display().to_string(),
                "boot_args": boot_args,
            },
            "drives": [
                {
                    "drive_id": "rootfs",
                    "path_on_host": self.config.rootfs_path.display().to_string(),
                    "is_root_device": true,
                    "is_read_only": false,
                },
            ],
            "machine-config": {
                "vcpu_count": self.config.vcpu,
                "mem_size_mib": self.config.memory_mb,
            },
            "network-interfaces": [
                {
                    "iface_id": "eth0",
                    "guest_mac": GUEST_NETWORK.guest_mac,
                    "host_dev_name": GUEST_NETWORK.tap_name,
                },
            ],
            "vsock": {
                "guest_cid": 3,
                "uds_path": self.paths.vsock_sock().display().to_string(),
            },
        })
    }

    /// Forward child output to tracing and flag unexpected exits.
    fn track_process(&mut self, mut child: tokio::process::Child) {
        let vm_id = self.vm_id.to_string();
        let state = Arc::clone(&self.state);

        if let Some(stdout) = child.stdout.take() {
            let vm_id = vm_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.is_empty() {
                        info!(vm_id = %vm_id, "{line}");
                    }
                }
                // Pipe closed: the process exited. If nobody asked for a
                // kill, this is a crash.
                let prev = VmState::from_u8(state.swap(VmState::Dead as u8, Ordering::AcqRel));
                if !matches!(prev, VmState::Killing | VmState::Dead) {
                    warn!(vm_id = %vm_id, state = %prev, "firecracker exited unexpectedly");
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.is_empty() {
                        warn!(vm_id = %vm_id, "stderr: {line}");
                    }
                }
            });
        }

        self.process = Some(child);
    }

    /// Complete the guest handshake. `Booting → Ready`.
    ///
    /// A failure here does not kill the VM; the caller decides.
    pub async fn wait_for_guest(&mut self) -> Result<Arc<VsockClient>> {
        let task = self.vsock_task.take().ok_or(FleetError::InvalidState {
            expected: VmState::Booting.name(),
            found: self.state().name(),
        })?;

        let client = task
            .await
            .map_err(|e| FleetError::StartFailed(format!("vsock task: {e}")))??;

        if !self.transition(VmState::Booting, VmState::Ready) {
            return Err(FleetError::InvalidState {
                expected: VmState::Booting.name(),
                found: self.state().name(),
            });
        }

        let client = Arc::new(client);
        self.guest = Some(Arc::clone(&client));
        info!(vm_id = %self.vm_id, "guest connected");
        Ok(client)
    }

    /// Mark the VM as running the agent. `Ready → Executing`.
    pub fn mark_executing(&self) -> Result<()> {
        if self.transition(VmState::Ready, VmState::Executing) {
            Ok(())
        } else {
            Err(FleetError::InvalidState {
                expected: VmState::Ready.name(),
                found: self.state().name(),
            })
        }
    }

    /// Tear the VM down: SIGTERM, grace, SIGKILL, workspace removal.
    ///
    /// Reachable from every state and idempotent; a second kill is a
    /// no-op.
    pub async fn kill(&mut self) -> Result<()> {
        let current = self.state();
        if matches!(current, VmState::Killing | VmState::Dead) {
            return Ok(());
        }
        self.state.store(VmState::Killing as u8, Ordering::Release);
        info!(vm_id = %self.vm_id, from = %current, "killing VM");

        if let Some(task) = self.vsock_task.take() {
            task.abort();
        }
        if let Some(guest) = self.guest.take() {
            guest.close().await;
        }

        if let Some(mut child) = self.process.take() {
            if let Some(pid) = child.id() {
                process::kill_with_grace(pid, KILL_GRACE).await?;
            }
            // Reap the zombie.
            let _ = child.wait().await;
        }

        if let Err(e) = tokio::fs::remove_dir_all(self.paths.workspace()).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(vm_id = %self.vm_id, error = %e, "failed to remove workspace");
        }

        self.state.store(VmState::Dead as u8, Ordering::Release);
        info!(vm_id = %self.vm_id, "VM dead");
        Ok(())
    }
}
