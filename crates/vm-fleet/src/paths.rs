use std::path::{Path, PathBuf};

/// Base directory for shared runtime state (registries, locks).
/// Created with mode 1777 by the prerequisite check.
pub const RUNTIME_DIR: &str = "/run/vm0";

/// Per-VM workspace paths: `<root>/workspaces/vm0-<vmId>/`.
///
/// The workspace is owned exclusively by one VM; nothing else writes there.
#[derive(Debug, Clone)]
pub struct VmPaths {
    workspace: PathBuf,
}

impl VmPaths {
    pub fn new(workspace_root: &Path, vm_id: &str) -> Self {
        Self {
            workspace: workspace_root.join("workspaces").join(format!("vm0-{vm_id}")),
        }
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Firecracker control socket.
    pub fn api_sock(&self) -> PathBuf {
        self.workspace.join("api.sock")
    }

    /// Vsock UDS (host side). Firecracker creates `vsock.sock_1000` beside
    /// it for the guest-initiated connection.
    pub fn vsock_sock(&self) -> PathBuf {
        self.workspace.join("vsock.sock")
    }

    /// Cold-boot Firecracker config.
    pub fn config_json(&self) -> PathBuf {
        self.workspace.join("config.json")
    }
}
