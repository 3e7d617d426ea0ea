//! Staging of the agent-script bundle into the guest.
//!
//! The bundle is many small files; uploads run in parallel batches to keep
//! guest round-trips from dominating boot-to-agent latency.

use std::path::{Path, PathBuf};

use futures_util::future::join_all;
use guest_client::GuestClient;
use tracing::info;

use crate::error::{RunnerError, RunnerResult};
use crate::paths::guest;

/// Concurrent uploads per batch.
const UPLOAD_CONCURRENCY: usize = 8;

/// Extensions marked executable after upload (plus extensionless files).
const EXECUTABLE_EXTENSIONS: &[&str] = &["sh", "mjs", "js", "py"];

/// Upload everything under `scripts_dir` into the guest's agent directory,
/// preserving relative paths, then mark executables.
pub async fn upload_agent_scripts(
    guest_client: &dyn GuestClient,
    scripts_dir: &Path,
) -> RunnerResult<()> {
    let files = collect_files(scripts_dir)?;
    if files.is_empty() {
        return Ok(());
    }
    info!(count = files.len(), "uploading agent scripts");

    guest_client.mkdir(guest::AGENT_DIR).await?;

    for batch in files.chunks(UPLOAD_CONCURRENCY) {
        let uploads = batch.iter().map(|(abs, rel)| async move {
            let content = tokio::fs::read(abs)
                .await
                .map_err(|e| RunnerError::Internal(format!("read {}: {e}", abs.display())))?;
            let target = format!("{}/{rel}", guest::AGENT_DIR);
            guest_client
                .write_file_with_sudo(&target, &content)
                .await?;
            Ok::<(), RunnerError>(())
        });
        for result in join_all(uploads).await {
            result?;
        }
    }

    let executables: Vec<String> = files
        .iter()
        .filter(|(abs, _)| is_executable_name(abs))
        .map(|(_, rel)| format!("{}/{rel}", guest::AGENT_DIR))
        .collect();
    if !executables.is_empty() {
        guest_client
            .exec_or_throw(&format!("sudo chmod +x {}", executables.join(" ")))
            .await?;
    }

    Ok(())
}

fn is_executable_name(path: &Path) -> bool {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => EXECUTABLE_EXTENSIONS.contains(&ext),
        None => true,
    }
}

/// Walk `dir` and return `(absolute, relative)` pairs, sorted for
/// deterministic upload order.
fn collect_files(dir: &Path) -> RunnerResult<Vec<(PathBuf, String)>> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let entries = std::fs::read_dir(&current)
            .map_err(|e| RunnerError::Internal(format!("read {}: {e}", current.display())))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if let Ok(rel) = path.strip_prefix(dir) {
                let rel = rel.to_string_lossy().into_owned();
                files.push((path, rel));
            }
        }
    }
    files.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(files)
}
