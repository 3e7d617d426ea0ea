use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{RunnerError, RunnerResult};

pub(crate) const DEFAULT_VCPU: u32 = 2;
pub(crate) const DEFAULT_MEMORY_MB: u32 = 2048;
pub(crate) const DEFAULT_MAX_CONCURRENT: usize = 4;
pub(crate) const DEFAULT_POLL_INTERVAL_MS: u64 = 5000;

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    pub name: String,
    /// Runner group in scope/name format (e.g. "acme/production").
    pub group: String,
    /// Base directory for runtime data (workspaces, status file).
    pub base_dir: PathBuf,
    pub server: ServerConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    pub firecracker: FirecrackerConfig,
    /// Directory of agent scripts staged into every guest.
    #[serde(default)]
    pub agent_scripts_dir: Option<PathBuf>,
    /// HTTP/HTTPS proxy port; when set, namespace traffic on 80/443 is
    /// redirected there.
    #[serde(default)]
    pub proxy_port: Option<u16>,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub url: String,
    pub token: String,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub vcpu: u32,
    pub memory_mb: u32,
    pub max_concurrent: usize,
    pub poll_interval_ms: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            vcpu: DEFAULT_VCPU,
            memory_mb: DEFAULT_MEMORY_MB,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct FirecrackerConfig {
    pub binary: PathBuf,
    pub kernel: PathBuf,
    pub rootfs: PathBuf,
    #[serde(default)]
    pub snapshot: Option<SnapshotConfig>,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotConfig {
    pub snapshot_path: PathBuf,
    pub memory_path: PathBuf,
}

/// Load and validate a runner config from a YAML file.
///
/// Relative paths are resolved against the config file's directory.
pub async fn load(path: &Path) -> RunnerResult<RunnerConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| RunnerError::Config(format!("read {}: {e}", path.display())))?;
    let mut config: RunnerConfig = serde_yaml_ng::from_str(&content)
        .map_err(|e| RunnerError::Config(format!("parse {}: {e}", path.display())))?;
    if let Some(config_dir) = path.parent() {
        config.resolve_relative_paths(config_dir);
    }
    validate(&config).await?;
    Ok(config)
}

async fn check_path_exists(path: &Path, label: &str) -> RunnerResult<()> {
    let exists = tokio::fs::try_exists(path)
        .await
        .map_err(|e| RunnerError::Config(format!("check {label}: {e}")))?;
    if !exists {
        return Err(RunnerError::Config(format!(
            "{label} not found: {}",
            path.display()
        )));
    }
    Ok(())
}

async fn validate(config: &RunnerConfig) -> RunnerResult<()> {
    if config.name.is_empty() {
        return Err(RunnerError::Config("runner name must not be empty".into()));
    }
    if config.sandbox.max_concurrent == 0 {
        return Err(RunnerError::Config("max_concurrent must be at least 1".into()));
    }

    check_path_exists(&config.firecracker.binary, "firecracker binary").await?;
    check_path_exists(&config.firecracker.kernel, "kernel").await?;
    check_path_exists(&config.firecracker.rootfs, "rootfs").await?;
    if let Some(snap) = &config.firecracker.snapshot {
        check_path_exists(&snap.snapshot_path, "snapshot state").await?;
        check_path_exists(&snap.memory_path, "snapshot memory").await?;
    }
    if let Some(scripts) = &config.agent_scripts_dir {
        check_path_exists(scripts, "agent scripts dir").await?;
    }
    Ok(())
}

impl RunnerConfig {
    fn resolve_relative_paths(&mut self, config_dir: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = config_dir.join(&*p);
            }
        };
        resolve(&mut self.base_dir);
        resolve(&mut self.firecracker.binary);
        resolve(&mut self.firecracker.kernel);
        resolve(&mut self.firecracker.rootfs);
        if let Some(snap) = &mut self.firecracker.snapshot {
            resolve(&mut snap.snapshot_path);
            resolve(&mut snap.memory_path);
        }
        if let Some(scripts) = &mut self.agent_scripts_dir {
            resolve(scripts);
        }
    }

    /// The per-VM config template this runner boots VMs from.
    pub fn vm_config(&self) -> vm_fleet::VmConfig {
        vm_fleet::VmConfig {
            binary_path: self.firecracker.binary.clone(),
            kernel_path: self.firecracker.kernel.clone(),
            rootfs_path: self.firecracker.rootfs.clone(),
            workspace_root: self.base_dir.clone(),
            vcpu: self.sandbox.vcpu,
            memory_mb: self.sandbox.memory_mb,
            snapshot: self.firecracker.snapshot.as_ref().map(|s| {
                vm_fleet::SnapshotConfig {
                    snapshot_path: s.snapshot_path.clone(),
                    memory_path: s.memory_path.clone(),
                }
            }),
        }
    }
}
