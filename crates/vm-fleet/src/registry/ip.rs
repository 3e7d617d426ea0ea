//! Persistent IP allocation registry for the bridged (non-namespace) path.
//!
//! Maps guest IPs in `172.16.0.0/24` to the runner PID and TAP device that
//! own them, plus the VM currently claiming the pair. Crash recovery:
//! [`IpRegistry::reap`] drops entries whose runner died or whose TAP is
//! gone, returning the TAP names the caller must delete from the kernel.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{FleetError, Result};
use crate::lock::{ensure_file, with_lock};
use crate::process::pid_alive;
use crate::registry::{load_json, store_json};

/// Shared /24 for bridged guests; `.1` is the bridge itself.
const IP_PREFIX: &str = "172.16.0.";
const FIRST_HOST: u8 = 2;
const LAST_HOST: u8 = 254;

#[derive(Debug, Default, Serialize, Deserialize)]
struct IpRegistryFile {
    #[serde(default)]
    allocations: BTreeMap<String, IpAllocation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpAllocation {
    pub runner_pid: u32,
    pub tap_device: String,
    /// The VM currently claiming this IP; `None` while pooled.
    #[serde(default)]
    pub vm_id: Option<String>,
}

/// File-locked registry at `<runtime>/ip-registry.json`.
#[derive(Clone)]
pub struct IpRegistry {
    path: PathBuf,
    lock_path: PathBuf,
}

impl IpRegistry {
    pub fn new(runtime_dir: &Path) -> Self {
        Self {
            path: runtime_dir.join("ip-registry.json"),
            lock_path: runtime_dir.join("ip-registry.lock"),
        }
    }

    /// Allocate the lowest free IP for `tap_device`, owned by this process.
    pub async fn allocate(&self, tap_device: &str) -> Result<String> {
        ensure_file(&self.lock_path)?;
        let path = self.path.clone();
        let tap = tap_device.to_string();
        with_lock(&self.lock_path, || async move {
            let mut file: IpRegistryFile = load_json(&path)?;

            let ip = (FIRST_HOST..=LAST_HOST)
                .map(|host| format!("{IP_PREFIX}{host}"))
                .find(|ip| !file.allocations.contains_key(ip))
                .ok_or(FleetError::NoFreeIp)?;

            file.allocations.insert(
                ip.clone(),
                IpAllocation {
                    runner_pid: std::process::id(),
                    tap_device: tap,
                    vm_id: None,
                },
            );
            store_json(&path, &file)?;
            Ok(ip)
        })
        .await
    }

    /// Release an allocation. No-op if absent.
    pub async fn release(&self, ip: &str) -> Result<()> {
        ensure_file(&self.lock_path)?;
        let path = self.path.clone();
        let ip = ip.to_string();
        with_lock(&self.lock_path, || async move {
            let mut file: IpRegistryFile = load_json(&path)?;
            if file.allocations.remove(&ip).is_some() {
                store_json(&path, &file)?;
            }
            Ok(())
        })
        .await
    }

    /// Claim an allocation for a VM.
    pub async fn assign_vm(&self, ip: &str, vm_id: &str) -> Result<()> {
        ensure_file(&self.lock_path)?;
        let path = self.path.clone();
        let (ip, vm_id) = (ip.to_string(), vm_id.to_string());
        with_lock(&self.lock_path, || async move {
            let mut file: IpRegistryFile = load_json(&path)?;
            let entry = file
                .allocations
                .get_mut(&ip)
                .ok_or_else(|| FleetError::Config(format!("assign_vm: {ip} not allocated")))?;
            entry.vm_id = Some(vm_id);
            store_json(&path, &file)?;
            Ok(())
        })
        .await
    }

    /// Clear a VM claim, but only if it still matches `expected_vm_id`.
    ///
    /// Compare-and-set: a release that races with the next allocation must
    /// not clear the new owner's claim.
    pub async fn clear_vm(&self, ip: &str, expected_vm_id: &str) -> Result<()> {
        ensure_file(&self.lock_path)?;
        let path = self.path.clone();
        let (ip, expected) = (ip.to_string(), expected_vm_id.to_string());
        with_lock(&self.lock_path, || async move {
            let mut file: IpRegistryFile = load_json(&path)?;
            if let Some(entry) = file.allocations.get_mut(&ip)
                && entry.vm_id.as_deref() == Some(expected.as_str())
            {
                entry.vm_id = None;
                store_json(&path, &file)?;
            }
            Ok(())
        })
        .await
    }

    /// Drop entries whose runner died or whose TAP device is gone.
    ///
    /// `present_taps` is the caller's pre-lock kernel scan. A TAP missing
    /// from the scan is probed again under the lock (`probe`) before the
    /// entry is condemned, tolerating TAPs created after the scan. Returns
    /// the TAPs that outlived their runner so the caller can
    /// `ip link del` them.
    pub async fn reap<F, Fut>(
        &self,
        present_taps: &HashSet<String>,
        probe: F,
    ) -> Result<Vec<String>>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = bool>,
    {
        ensure_file(&self.lock_path)?;
        let path = self.path.clone();
        with_lock(&self.lock_path, || async move {
            let mut file: IpRegistryFile = load_json(&path)?;

            let mut orphan_taps = Vec::new();
            let mut keep = BTreeMap::new();
            for (ip, alloc) in file.allocations {
                let pid_dead = !pid_alive(alloc.runner_pid);
                let tap_present = present_taps.contains(&alloc.tap_device)
                    || probe(alloc.tap_device.clone()).await;

                if pid_dead || !tap_present {
                    info!(
                        ip = %ip,
                        tap = %alloc.tap_device,
                        pid_dead,
                        tap_present,
                        "reaping IP allocation"
                    );
                    if tap_present {
                        orphan_taps.push(alloc.tap_device);
                    }
                } else {
                    keep.insert(ip, alloc);
                }
            }

            file = IpRegistryFile { allocations: keep };
            store_json(&path, &file)?;
            Ok(orphan_taps)
        })
        .await
    }

    /// All current allocations (for the reaper's diff pass).
    pub async fn allocations(&self) -> Result<BTreeMap<String, IpAllocation>> {
        ensure_file(&self.lock_path)?;
        let path = self.path.clone();
        with_lock(&self.lock_path, || async move {
            let file: IpRegistryFile = load_json(&path)?;
            Ok(file.allocations)
        })
        .await
    }
}
