//! Discovery of fleet-related processes from `/proc`.
//!
//! The cmdline parsers are pure functions over argv slices so they can be
//! unit-tested without a kernel; [`ProcessScanner`] walks a proc
//! filesystem root (the real `/proc`, or a fake tree in tests) and applies
//! them. Results are best-effort: unreadable processes are skipped.

use std::path::{Path, PathBuf};

/// Path fragment identifying a fleet VM workspace in any argument.
const WORKSPACE_MARKER: &str = "workspaces/vm0-";
/// mitmproxy addon option carrying the runner's registry path.
const REGISTRY_OPTION: &str = "vm0_registry_path=";

/// A firecracker process serving one of our VMs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirecrackerProcess {
    pub pid: u32,
    pub ppid: u32,
    pub vm_id: String,
    pub base_dir: PathBuf,
}

impl FirecrackerProcess {
    /// A process reparented to init lost its runner.
    pub fn is_orphan(&self) -> bool {
        self.ppid == 1
    }
}

/// A mitmproxy sidecar process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MitmproxyProcess {
    pub pid: u32,
    pub ppid: u32,
    pub base_dir: PathBuf,
}

/// How a runner process was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerInvocation {
    /// Direct CLI invocation with `--config <path>`.
    Cli,
    /// Wrapped by PM2; the config lives in the working directory.
    Pm2,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerProcess {
    pub pid: u32,
    pub config_path: PathBuf,
    pub invocation: RunnerInvocation,
}

// ---------------------------------------------------------------------------
// Pure cmdline parsers
// ---------------------------------------------------------------------------

/// Extract `(vm_id, base_dir)` from a firecracker cmdline.
///
/// Any argument containing `<base>/workspaces/vm0-<8 hex>` qualifies
/// (api-sock and config-file paths both do). Total: anything else is
/// `None`.
pub fn parse_firecracker_cmdline(argv: &[String]) -> Option<(String, PathBuf)> {
    for arg in argv {
        let Some(pos) = arg.find(WORKSPACE_MARKER) else {
            continue;
        };
        let id_start = pos + WORKSPACE_MARKER.len();
        let Some(vm_id) = arg.get(id_start..id_start + 8) else {
            continue;
        };
        if !vm_id
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            continue;
        }
        // The id must terminate the path segment.
        match arg.as_bytes().get(id_start + 8) {
            None | Some(b'/') => {}
            Some(_) => continue,
        }
        // The marker must sit below a non-empty base directory.
        let base = match pos.checked_sub(1) {
            Some(slash) if arg.as_bytes().get(slash) == Some(&b'/') => arg.get(..slash)?,
            _ => continue,
        };
        if base.is_empty() {
            continue;
        }
        return Some((vm_id.to_string(), PathBuf::from(base)));
    }
    None
}

/// Extract the runner base directory from a mitmproxy cmdline.
///
/// The addon is configured with `--set vm0_registry_path=<base>/<file>`;
/// the base directory is the registry file's parent.
pub fn parse_mitmproxy_cmdline(argv: &[String]) -> Option<PathBuf> {
    for arg in argv {
        let Some(value) = arg.strip_prefix(REGISTRY_OPTION) else {
            continue;
        };
        let parent = Path::new(value).parent()?;
        if parent.as_os_str().is_empty() {
            return None;
        }
        return Some(parent.to_path_buf());
    }
    None
}

/// Extract the config path from a runner cmdline (`--config <x>.yaml|yml`,
/// `--config=<x>.yaml` also accepted).
pub fn parse_runner_cmdline(argv: &[String]) -> Option<PathBuf> {
    let mut args = argv.iter();
    while let Some(arg) = args.next() {
        let value = if arg == "--config" {
            args.next()?
        } else if let Some(v) = arg.strip_prefix("--config=") {
            v
        } else {
            continue;
        };
        if value.ends_with(".yaml") || value.ends_with(".yml") {
            return Some(PathBuf::from(value));
        }
        return None;
    }
    None
}

// ---------------------------------------------------------------------------
// /proc walking
// ---------------------------------------------------------------------------

struct ProcEntry {
    pid: u32,
    ppid: u32,
    argv: Vec<String>,
}

/// Walks a proc filesystem and classifies the processes it finds.
pub struct ProcessScanner {
    proc_root: PathBuf,
}

impl Default for ProcessScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessScanner {
    pub fn new() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
        }
    }

    /// Scan an alternate root (fake `/proc` trees in tests).
    pub fn with_root(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }

    /// Firecracker processes serving fleet VMs.
    pub fn firecracker_processes(&self) -> Vec<FirecrackerProcess> {
        self.entries()
            .filter(|e| e.argv.first().is_some_and(|a| a.contains("firecracker")))
            .filter_map(|e| {
                let (vm_id, base_dir) = parse_firecracker_cmdline(&e.argv)?;
                Some(FirecrackerProcess {
                    pid: e.pid,
                    ppid: e.ppid,
                    vm_id,
                    base_dir,
                })
            })
            .collect()
    }

    /// mitmproxy sidecars carrying a fleet registry path.
    pub fn mitmproxy_processes(&self) -> Vec<MitmproxyProcess> {
        self.entries()
            .filter(|e| {
                e.argv
                    .first()
                    .is_some_and(|a| a.contains("mitmdump") || a.contains("mitmproxy"))
            })
            .filter_map(|e| {
                Some(MitmproxyProcess {
                    pid: e.pid,
                    ppid: e.ppid,
                    base_dir: parse_mitmproxy_cmdline(&e.argv)?,
                })
            })
            .collect()
    }

    /// Runner processes, whether started directly or under PM2.
    pub fn runner_processes(&self) -> Vec<RunnerProcess> {
        self.entries()
            .filter_map(|e| {
                if let Some(config_path) = parse_runner_cmdline(&e.argv) {
                    return Some(RunnerProcess {
                        pid: e.pid,
                        config_path,
                        invocation: RunnerInvocation::Cli,
                    });
                }
                // PM2 hides the real argv behind its interpreter; the
                // working directory still carries runner.yaml.
                if e.argv.iter().any(|a| a.contains("pm2") || a.contains("PM2")) {
                    let cwd = std::fs::read_link(
                        self.proc_root.join(e.pid.to_string()).join("cwd"),
                    )
                    .ok()?;
                    let config_path = cwd.join("runner.yaml");
                    if config_path.exists() {
                        return Some(RunnerProcess {
                            pid: e.pid,
                            config_path,
                            invocation: RunnerInvocation::Pm2,
                        });
                    }
                }
                None
            })
            .collect()
    }

    fn entries(&self) -> impl Iterator<Item = ProcEntry> + '_ {
        let dirs = std::fs::read_dir(&self.proc_root)
            .map(|iter| iter.flatten().collect::<Vec<_>>())
            .unwrap_or_default();

        dirs.into_iter().filter_map(|dir| {
            // Numeric directories only; everything else in /proc is noise.
            let pid: u32 = dir.file_name().to_str()?.parse().ok()?;
            let argv = read_cmdline(&dir.path())?;
            let ppid = read_ppid(&dir.path())?;
            Some(ProcEntry { pid, ppid, argv })
        })
    }
}

/// Read and split a NUL-separated cmdline. `None` on any read failure
/// (process exited, permission denied) or for kernel threads (empty file).
fn read_cmdline(proc_dir: &Path) -> Option<Vec<String>> {
    let raw = std::fs::read(proc_dir.join("cmdline")).ok()?;
    let argv: Vec<String> = raw
        .split(|b| *b == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part).into_owned())
        .collect();
    if argv.is_empty() { None } else { Some(argv) }
}

/// Parse the PPID out of `/proc/<pid>/stat`.
///
/// The comm field may contain spaces and parentheses, so fields are
/// counted from after the *last* `)`.
fn read_ppid(proc_dir: &Path) -> Option<u32> {
    let stat = std::fs::read_to_string(proc_dir.join("stat")).ok()?;
    let (_, rest) = stat.rsplit_once(')')?;
    // rest = " <state> <ppid> ..."
    rest.split_whitespace().nth(1)?.parse().ok()
}
