use std::collections::HashSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerMode {
    Running,
    Draining,
    Stopping,
    Stopped,
}

#[derive(Debug, Serialize)]
struct RunnerStatus {
    mode: RunnerMode,
    active_runs: usize,
    active_run_ids: Vec<Uuid>,
    #[serde(serialize_with = "serialize_iso")]
    started_at: DateTime<Utc>,
    #[serde(serialize_with = "serialize_iso")]
    updated_at: DateTime<Utc>,
}

/// ISO 8601 with millisecond precision.
fn serialize_iso<S: serde::Serializer>(dt: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
}

/// Persists runner state to `status.json` atomically so external tooling
/// (PM2 wrappers, ops scripts) can observe the runner.
///
/// Share via `Arc<StatusTracker>`; immutable fields live outside the mutex.
pub struct StatusTracker {
    started_at: DateTime<Utc>,
    path: PathBuf,
    state: Mutex<MutableState>,
}

struct MutableState {
    mode: RunnerMode,
    active_run_ids: HashSet<Uuid>,
}

impl StatusTracker {
    pub fn new(path: PathBuf) -> Self {
        Self {
            started_at: Utc::now(),
            path,
            state: Mutex::new(MutableState {
                mode: RunnerMode::Running,
                active_run_ids: HashSet::new(),
            }),
        }
    }

    pub async fn write_initial(&self) {
        let state = self.state.lock().await;
        self.persist(&state).await;
    }

    pub async fn set_mode(&self, mode: RunnerMode) {
        let mut state = self.state.lock().await;
        state.mode = mode;
        self.persist(&state).await;
    }

    pub async fn add_run(&self, run_id: Uuid) {
        let mut state = self.state.lock().await;
        state.active_run_ids.insert(run_id);
        self.persist(&state).await;
    }

    pub async fn remove_run(&self, run_id: Uuid) {
        let mut state = self.state.lock().await;
        state.active_run_ids.remove(&run_id);
        self.persist(&state).await;
    }

    async fn persist(&self, state: &MutableState) {
        let status = RunnerStatus {
            mode: state.mode,
            active_runs: state.active_run_ids.len(),
            active_run_ids: state.active_run_ids.iter().copied().collect(),
            started_at: self.started_at,
            updated_at: Utc::now(),
        };
        let Ok(json) = serde_json::to_vec_pretty(&status) else {
            return;
        };

        // Atomic write: a reader never sees a half-written file.
        let tmp = self.path.with_extension("json.tmp");
        let result = async {
            tokio::fs::write(&tmp, &json).await?;
            tokio::fs::rename(&tmp, &self.path).await
        }
        .await;
        if let Err(e) = result {
            warn!(error = %e, path = %self.path.display(), "failed to write status");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn status_file_reflects_runs_and_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        let tracker = StatusTracker::new(path.clone());

        tracker.write_initial().await;
        let run = Uuid::new_v4();
        tracker.add_run(run).await;

        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(json["mode"], "running");
        assert_eq!(json["active_runs"], 1);
        assert_eq!(json["active_run_ids"][0], run.to_string());

        tracker.remove_run(run).await;
        tracker.set_mode(RunnerMode::Draining).await;
        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(json["mode"], "draining");
        assert_eq!(json["active_runs"], 0);
        assert!(json["active_run_ids"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn timestamps_are_iso_with_millis() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        let tracker = StatusTracker::new(path.clone());
        tracker.write_initial().await;

        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        let started = json["started_at"].as_str().unwrap();
        assert!(started.ends_with('Z'));
        assert_eq!(started.len(), "2026-01-01T00:00:00.000Z".len());
    }
}
