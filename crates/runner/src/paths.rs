use std::path::PathBuf;

/// Guest paths (must match the rootfs layout).
pub mod guest {
    /// Agent environment, staged as JSON to avoid shell escaping.
    pub const ENV_JSON: &str = "/tmp/vm0-env.json";
    /// Storage manifest consumed by the download script.
    pub const STORAGE_MANIFEST: &str = "/tmp/storage-manifest.json";
    /// Sentinel file carrying the agent's exit code.
    pub const EXIT_CODE_FILE: &str = "/tmp/vm0-exit-code";
    /// Directory the agent-script bundle is staged into.
    pub const AGENT_DIR: &str = "/usr/local/bin/vm0-agent";
    /// Loads ENV_JSON into the environment and execs the agent runner.
    pub const ENV_LOADER: &str = "/usr/local/bin/vm0-agent/env-loader.sh";
    /// Parallel presigned-URL downloads with streamed tar extraction.
    pub const DOWNLOAD_SCRIPT: &str = "/usr/local/bin/vm0-agent/download-storages.sh";
    /// Provider-specific session checkpoint/restore.
    pub const CHECKPOINT_SCRIPT: &str = "/usr/local/bin/vm0-agent/checkpoint.sh";

    /// Per-run agent log file.
    pub fn log_file(run_id: &uuid::Uuid) -> String {
        format!("/tmp/vm0-agent-{run_id}.log")
    }
}

/// Runner-level paths derived from the base directory.
pub struct RunnerPaths {
    base_dir: PathBuf,
}

impl RunnerPaths {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn status(&self) -> PathBuf {
        self.base_dir.join("status.json")
    }
}
