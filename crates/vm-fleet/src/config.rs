use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct VmConfig {
    pub binary_path: PathBuf,
    pub kernel_path: PathBuf,
    pub rootfs_path: PathBuf,
    /// Root under which per-VM workspaces are created
    /// (`<workspace_root>/workspaces/vm0-<vmId>`).
    pub workspace_root: PathBuf,
    pub vcpu: u32,
    pub memory_mb: u32,
    /// Snapshot to restore from. When set, VMs boot via snapshot restore
    /// instead of a cold boot.
    pub snapshot: Option<SnapshotConfig>,
}

#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    /// Path to the snapshot state file.
    pub snapshot_path: PathBuf,
    /// Path to the memory dump file.
    pub memory_path: PathBuf,
}
