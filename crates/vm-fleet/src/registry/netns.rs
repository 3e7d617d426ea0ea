//! Persistent namespace registry shared by all runners on a host.
//!
//! One JSON file maps runner indices to their PID and the namespaces they
//! own, so a fresh runner can claim a free index and prune what a crashed
//! predecessor left behind. Layout:
//!
//! ```json
//! { "runners": { "00": { "name": ..., "pid": ...,
//!     "namespaces": { "00": { "vethHost": ..., "hostIp": ..., "nsIp": ... } } } } }
//! ```
//!
//! Keys are two-character zero-padded hex; a runner owns up to 256
//! namespaces and a host supports up to 64 runners.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{FleetError, Result};
use crate::lock::{ensure_file, with_lock};
use crate::process::pid_alive;
use crate::registry::{load_json, store_json};

/// Maximum concurrent runners per host (index 0x00–0x3f).
pub const MAX_RUNNERS: u32 = 64;
/// Maximum namespaces per runner (index 0x00–0xff).
pub const MAX_NAMESPACES: u32 = 256;

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct NetnsRegistryFile {
    #[serde(default)]
    pub runners: BTreeMap<String, RunnerEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerEntry {
    pub name: String,
    pub pid: u32,
    #[serde(default)]
    pub namespaces: BTreeMap<String, NamespaceEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceEntry {
    pub veth_host: String,
    pub host_ip: String,
    pub ns_ip: String,
}

/// Two-character zero-padded lower hex, the registry key format.
pub fn hex_index(index: u32) -> String {
    format!("{index:02x}")
}

/// File-locked registry at `<runtime>/netns-registry.json`.
#[derive(Clone)]
pub struct NetnsRegistry {
    path: PathBuf,
    lock_path: PathBuf,
}

impl NetnsRegistry {
    pub fn new(runtime_dir: &Path) -> Self {
        Self {
            path: runtime_dir.join("netns-registry.json"),
            lock_path: runtime_dir.join("netns-registry.lock"),
        }
    }

    /// Claim the lowest free runner index for this process.
    pub async fn register_runner(&self, name: &str) -> Result<u32> {
        ensure_file(&self.lock_path)?;
        let path = self.path.clone();
        let name = name.to_string();
        with_lock(&self.lock_path, || async move {
            let mut file: NetnsRegistryFile = load_json(&path)?;

            let index = (0..MAX_RUNNERS)
                .find(|i| !file.runners.contains_key(&hex_index(*i)))
                .ok_or(FleetError::RunnerLimit { max: MAX_RUNNERS })?;

            file.runners.insert(
                hex_index(index),
                RunnerEntry {
                    name,
                    pid: std::process::id(),
                    namespaces: BTreeMap::new(),
                },
            );
            store_json(&path, &file)?;
            info!(index, "runner registered");
            Ok(index)
        })
        .await
    }

    /// Record a namespace under this runner's entry.
    pub async fn record_namespace(
        &self,
        runner_index: u32,
        ns_index: u32,
        entry: NamespaceEntry,
    ) -> Result<()> {
        if ns_index >= MAX_NAMESPACES {
            return Err(FleetError::NamespaceLimit {
                max: MAX_NAMESPACES,
            });
        }
        ensure_file(&self.lock_path)?;
        let path = self.path.clone();
        with_lock(&self.lock_path, || async move {
            let mut file: NetnsRegistryFile = load_json(&path)?;
            let runner = file
                .runners
                .get_mut(&hex_index(runner_index))
                .ok_or_else(|| {
                    FleetError::Config(format!("runner {runner_index:02x} not registered"))
                })?;
            runner.namespaces.insert(hex_index(ns_index), entry);
            store_json(&path, &file)?;
            Ok(())
        })
        .await
    }

    /// Remove a namespace from this runner's entry. No-op if absent.
    pub async fn remove_namespace(&self, runner_index: u32, ns_index: u32) -> Result<()> {
        ensure_file(&self.lock_path)?;
        let path = self.path.clone();
        with_lock(&self.lock_path, || async move {
            let mut file: NetnsRegistryFile = load_json(&path)?;
            if let Some(runner) = file.runners.get_mut(&hex_index(runner_index))
                && runner.namespaces.remove(&hex_index(ns_index)).is_some()
            {
                store_json(&path, &file)?;
            }
            Ok(())
        })
        .await
    }

    /// Remove this runner's entire entry (namespaces included).
    pub async fn remove_runner(&self, runner_index: u32) -> Result<()> {
        ensure_file(&self.lock_path)?;
        let path = self.path.clone();
        with_lock(&self.lock_path, || async move {
            let mut file: NetnsRegistryFile = load_json(&path)?;
            if file.runners.remove(&hex_index(runner_index)).is_some() {
                store_json(&path, &file)?;
            }
            Ok(())
        })
        .await
    }

    /// Entries whose runner PID is no longer alive, with their index.
    ///
    /// Read-only: callers delete kernel objects outside the lock, then call
    /// [`remove_dead_runners`](Self::remove_dead_runners) to commit.
    pub async fn dead_runners(&self) -> Result<Vec<(u32, RunnerEntry)>> {
        ensure_file(&self.lock_path)?;
        let path = self.path.clone();
        with_lock(&self.lock_path, || async move {
            let file: NetnsRegistryFile = load_json(&path)?;
            let mut dead = Vec::new();
            for (key, entry) in &file.runners {
                if let Ok(index) = u32::from_str_radix(key, 16)
                    && !pid_alive(entry.pid)
                {
                    dead.push((index, entry.clone()));
                }
            }
            Ok(dead)
        })
        .await
    }

    /// Remove the given runner entries, re-checking PID liveness under the
    /// lock (PIDs can be reused between the scan and the commit). Returns
    /// the indices actually removed.
    pub async fn remove_dead_runners(&self, indices: &[u32]) -> Result<Vec<u32>> {
        ensure_file(&self.lock_path)?;
        let path = self.path.clone();
        with_lock(&self.lock_path, || async move {
            let mut file: NetnsRegistryFile = load_json(&path)?;
            let mut removed = Vec::new();
            for &index in indices {
                let key = hex_index(index);
                let still_dead = file
                    .runners
                    .get(&key)
                    .is_some_and(|entry| !pid_alive(entry.pid));
                if still_dead && file.runners.remove(&key).is_some() {
                    removed.push(index);
                }
            }
            if !removed.is_empty() {
                store_json(&path, &file)?;
            }
            Ok(removed)
        })
        .await
    }

    /// A point-in-time copy of the whole registry (for the reaper's diff).
    pub async fn snapshot(&self) -> Result<NetnsRegistryFile> {
        ensure_file(&self.lock_path)?;
        let path = self.path.clone();
        with_lock(&self.lock_path, || async move { load_json(&path) }).await
    }
}
