use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::command::{Privilege, exec_command};
use crate::config::VmConfig;
use crate::error::{FleetError, Result};
use crate::paths::RUNTIME_DIR;

pub struct PrerequisiteConfig<'a> {
    pub vm: &'a VmConfig,
}

/// Verify every host requirement before the fleet starts.
///
/// Checks the firecracker binary, kernel, rootfs, `/dev/kvm`, the network
/// commands, passwordless sudo, and the shared runtime directory. All
/// failures are collected into one fatal error so the operator sees the
/// complete list at once.
pub async fn check_prerequisites(config: &PrerequisiteConfig<'_>) -> Result<()> {
    let mut errors = Vec::new();

    check_file_exists(&config.vm.binary_path, "firecracker binary", &mut errors);
    check_executable(&config.vm.binary_path, "firecracker binary", &mut errors);
    check_file_exists(&config.vm.kernel_path, "kernel", &mut errors);
    check_file_exists(&config.vm.rootfs_path, "rootfs", &mut errors);
    if let Some(snapshot) = &config.vm.snapshot {
        check_file_exists(&snapshot.snapshot_path, "snapshot state", &mut errors);
        check_file_exists(&snapshot.memory_path, "snapshot memory", &mut errors);
    }
    check_kvm(&mut errors);
    check_required_commands(&mut errors);
    check_sudo(&mut errors).await;
    ensure_runtime_dir(&mut errors).await;

    if errors.is_empty() {
        Ok(())
    } else {
        Err(FleetError::Network(errors.join("; ")))
    }
}

fn check_file_exists(path: &Path, label: &str, errors: &mut Vec<String>) {
    if !path.exists() {
        errors.push(format!("{label} not found: {}", path.display()));
    }
}

fn check_executable(path: &Path, label: &str, errors: &mut Vec<String>) {
    if let Ok(meta) = path.metadata()
        && meta.permissions().mode() & 0o111 == 0
    {
        errors.push(format!("{label} is not executable: {}", path.display()));
    }
}

fn check_kvm(errors: &mut Vec<String>) {
    let kvm = Path::new("/dev/kvm");
    if !kvm.exists() {
        errors.push("/dev/kvm not found (KVM not available)".to_string());
    } else if let Err(e) = std::fs::File::options().read(true).write(true).open(kvm) {
        errors.push(format!("/dev/kvm not accessible: {e}"));
    }
}

fn check_required_commands(errors: &mut Vec<String>) {
    for cmd in ["ip", "iptables", "iptables-save", "sysctl", "pgrep"] {
        if which::which(cmd).is_err() {
            errors.push(format!("required command not found: {cmd}"));
        }
    }
}

async fn check_sudo(errors: &mut Vec<String>) {
    if exec_command("sudo -n true", Privilege::User).await.is_err() {
        errors.push(
            "passwordless sudo required for network configuration; \
             configure sudoers for this user"
                .to_string(),
        );
    }
}

/// Create `/run/vm0` world-writable so every runner (and mitmproxy, which
/// runs as a different user) can reach the registries.
async fn ensure_runtime_dir(errors: &mut Vec<String>) {
    if Path::new(RUNTIME_DIR).is_dir() {
        return;
    }
    if let Err(e) = exec_command(
        &format!("mkdir -p {RUNTIME_DIR} && chmod 1777 {RUNTIME_DIR}"),
        Privilege::Sudo,
    )
    .await
    {
        errors.push(format!("cannot create {RUNTIME_DIR}: {e}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_reported() {
        let mut errors = Vec::new();
        check_file_exists(Path::new("/nonexistent/firecracker"), "binary", &mut errors);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("binary not found"));
    }

    #[test]
    fn non_executable_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("firecracker");
        std::fs::write(&path, b"").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        let mut errors = Vec::new();
        check_executable(&path, "binary", &mut errors);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("not executable"));
    }

    #[test]
    fn executable_file_passes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("firecracker");
        std::fs::write(&path, b"").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut errors = Vec::new();
        check_executable(&path, "binary", &mut errors);
        assert!(errors.is_empty());
    }

    #[test]
    fn common_commands_are_found() {
        // `ip` et al. may be absent in minimal CI images; only assert the
        // reporting shape for a command that certainly exists.
        assert!(which::which("sh").is_ok());
    }
}
