//! Orphan reconciliation after crashes.
//!
//! Compares three sources of truth — the on-disk registries, live kernel
//! state, and the process table — and deletes whatever lost its owner.
//! Runs at runner start and again opportunistically from pool init.
//!
//! Lock discipline: kernel state is scanned before any lock is taken,
//! diffs are computed under the registry lock, kernel deletions happen
//! with the lock released, and commits re-check PID liveness.

use std::collections::HashSet;
use std::path::Path;

use tracing::info;

use crate::command::{Privilege, exec_command, exec_command_ignore_errors};
use crate::error::Result;
use crate::network::{reap_dead_runners, tap_exists};
use crate::registry::ip::IpRegistry;
use crate::registry::netns::NetnsRegistry;
use crate::scanner::{FirecrackerProcess, ProcessScanner};

/// Host-side TAP devices of the bridged (non-namespace) path.
const LEGACY_TAP_PREFIX: &str = "vm0-tap-";

/// What one reap pass changed or surfaced.
#[derive(Debug, Default)]
pub struct ReapReport {
    /// Registry entries of dead runners that were pruned.
    pub removed_runner_indices: Vec<u32>,
    /// TAP devices deleted from the kernel.
    pub deleted_taps: Vec<String>,
    /// Firecracker processes with no live parent, for the caller to kill.
    pub orphan_firecrackers: Vec<FirecrackerProcess>,
}

/// Reconcile registries, kernel state, and the process table.
pub async fn reap_orphans(runtime_dir: &Path, scanner: &ProcessScanner) -> Result<ReapReport> {
    let mut report = ReapReport::default();

    // (a) Kernel scan, before any lock.
    let host_links = list_host_links().await;
    let kernel_taps: HashSet<String> = host_links
        .iter()
        .filter(|name| name.starts_with(LEGACY_TAP_PREFIX))
        .cloned()
        .collect();

    // (b) Dead-runner namespaces: kernel artefacts first, then entries.
    let netns_registry = NetnsRegistry::new(runtime_dir);
    report.removed_runner_indices = reap_dead_runners(&netns_registry).await;

    // (c) IP allocations whose runner died or whose TAP vanished. TAPs
    //     missing from the pre-lock scan are double-checked under the lock
    //     before the entry is condemned.
    let ip_registry = IpRegistry::new(runtime_dir);
    let orphan_taps = ip_registry
        .reap(&kernel_taps, |tap| async move { tap_exists(&tap).await })
        .await?;
    for tap in &orphan_taps {
        exec_command_ignore_errors(&format!("ip link del {tap}"), Privilege::Sudo).await;
    }
    report.deleted_taps.extend(orphan_taps);

    // (d) TAPs in the kernel that no registry knows about.
    let registered: HashSet<String> = ip_registry
        .allocations()
        .await?
        .into_values()
        .map(|alloc| alloc.tap_device)
        .collect();
    for tap in kernel_taps {
        if !registered.contains(&tap) && !report.deleted_taps.contains(&tap) {
            info!(tap = %tap, "deleting unregistered TAP");
            exec_command_ignore_errors(&format!("ip link del {tap}"), Privilege::Sudo).await;
            report.deleted_taps.push(tap);
        }
    }

    // (e) Firecracker processes reparented to init: their runner is gone.
    report.orphan_firecrackers = scanner
        .firecracker_processes()
        .into_iter()
        .filter(FirecrackerProcess::is_orphan)
        .collect();

    if !report.removed_runner_indices.is_empty()
        || !report.deleted_taps.is_empty()
        || !report.orphan_firecrackers.is_empty()
    {
        info!(
            runners = report.removed_runner_indices.len(),
            taps = report.deleted_taps.len(),
            orphan_vms = report.orphan_firecrackers.len(),
            "reap pass complete"
        );
    }
    Ok(report)
}

/// Names of all host-side links.
async fn list_host_links() -> Vec<String> {
    let Ok(output) = exec_command("ip -o link show", Privilege::User).await else {
        return Vec::new();
    };
    parse_link_names(&output)
}

/// Parse `ip -o link show` output into device names.
///
/// Lines look like `3: vm0-ve-00-01@if2: <BROADCAST,...> mtu 1500 ...`;
/// the `@peer` suffix is not part of the name.
fn parse_link_names(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let name = line.split(':').nth(1)?.trim();
            let name = name.split('@').next()?;
            if name.is_empty() {
                None
            } else {
                Some(name.to_string())
            }
        })
        .collect()
}
