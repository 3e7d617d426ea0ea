use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Poll
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollResponse {
    pub run_id: Option<Uuid>,
}

// ---------------------------------------------------------------------------
// Claim (execution context)
// ---------------------------------------------------------------------------

/// Everything the control plane hands over for one job. Immutable for the
/// duration of the run.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    pub run_id: Uuid,
    #[serde(default)]
    pub user_id: Option<String>,
    pub sandbox_token: String,
    pub prompt: String,
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default)]
    pub cli_agent_type: String,
    pub working_dir: String,
    #[serde(default)]
    pub storage_manifest: Option<StorageManifest>,
    #[serde(default)]
    pub environment: Option<HashMap<String, String>>,
    #[serde(default)]
    pub secret_values: Option<Vec<String>>,
    #[serde(default)]
    pub vars: Option<HashMap<String, String>>,
    #[serde(default)]
    pub resume_session: Option<ResumeSession>,
    #[serde(default)]
    pub experimental_firewall: Option<bool>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageManifest {
    pub storages: Vec<StorageEntry>,
    #[serde(default)]
    pub artifact: Option<ArtifactEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageEntry {
    pub mount_path: String,
    /// Presigned download URL; time-limited.
    #[serde(default)]
    pub archive_url: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactEntry {
    pub mount_path: String,
    #[serde(default)]
    pub archive_url: Option<String>,
    pub vas_storage_name: String,
    pub vas_version_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeSession {
    pub session_id: String,
    pub session_history: String,
}

// ---------------------------------------------------------------------------
// Complete
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteRequest {
    pub run_id: Uuid,
    pub exit_code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_context_deserializes_minimal_payload() {
        let ctx: ExecutionContext = serde_json::from_value(serde_json::json!({
            "runId": "a1b2c3d4-1111-4222-8333-444455556666",
            "sandboxToken": "tok",
            "prompt": "echo hello",
            "workingDir": "/workspace",
        }))
        .unwrap();

        assert_eq!(ctx.prompt, "echo hello");
        assert!(ctx.cli_agent_type.is_empty());
        assert!(ctx.storage_manifest.is_none());
        assert!(ctx.resume_session.is_none());
    }

    #[test]
    fn execution_context_deserializes_full_payload() {
        let ctx: ExecutionContext = serde_json::from_value(serde_json::json!({
            "runId": "a1b2c3d4-1111-4222-8333-444455556666",
            "userId": "user-9",
            "sandboxToken": "tok",
            "prompt": "do things",
            "apiUrl": "https://api.example.com",
            "cliAgentType": "codex",
            "workingDir": "/workspace",
            "storageManifest": {
                "storages": [{"mountPath": "/data", "archiveUrl": "https://presigned"}],
                "artifact": {
                    "mountPath": "/artifacts",
                    "vasStorageName": "vol",
                    "vasVersionId": "v3",
                },
            },
            "environment": {"FOO": "bar"},
            "secretValues": ["s3cret"],
            "vars": {"X": "1"},
            "resumeSession": {"sessionId": "sess-1", "sessionHistory": "{}"},
            "experimentalFirewall": true,
        }))
        .unwrap();

        assert_eq!(ctx.user_id.as_deref(), Some("user-9"));
        assert_eq!(ctx.cli_agent_type, "codex");
        let manifest = ctx.storage_manifest.unwrap();
        assert_eq!(manifest.storages.len(), 1);
        assert_eq!(manifest.artifact.unwrap().vas_version_id, "v3");
        assert_eq!(ctx.experimental_firewall, Some(true));
    }

    #[test]
    fn complete_request_omits_absent_error() {
        let req = CompleteRequest {
            run_id: Uuid::nil(),
            exit_code: 0,
            error: None,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert!(json.get("error").is_none());
        assert_eq!(json["exitCode"], 0);
    }
}
