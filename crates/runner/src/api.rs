use reqwest::StatusCode;
use tracing::warn;

use crate::error::{RunnerError, RunnerResult};
use crate::http::HttpClient;
use crate::types::{CompleteRequest, ExecutionContext, PollResponse};

/// Async client for the control-plane runner API.
#[derive(Clone)]
pub struct ApiClient {
    http: HttpClient,
    token: String,
}

impl ApiClient {
    pub fn new(http: HttpClient, token: String) -> Self {
        Self { http, token }
    }

    /// Poll for a pending job. `Ok(None)` when no work is available
    /// (HTTP 204 or an empty body).
    pub async fn poll(&self, group: &str) -> RunnerResult<Option<uuid::Uuid>> {
        let path = format!("/runners/poll?group={group}");
        let resp = self
            .http
            .request(reqwest::Method::POST, &path, &self.token)
            .send()
            .await
            .map_err(|e| RunnerError::Api(format!("poll: {e}")))?;

        if resp.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RunnerError::Api(format!("poll {status}: {body}")));
        }

        let poll: PollResponse = resp
            .json()
            .await
            .map_err(|e| RunnerError::Api(format!("poll decode: {e}")))?;
        Ok(poll.run_id)
    }

    /// Claim a job for execution. HTTP 409 maps to
    /// [`RunnerError::AlreadyClaimed`] so the loop can continue gracefully.
    pub async fn claim(&self, run_id: uuid::Uuid) -> RunnerResult<ExecutionContext> {
        let resp = self
            .http
            .request(reqwest::Method::POST, "/runners/claim", &self.token)
            .json(&serde_json::json!({ "runId": run_id }))
            .send()
            .await
            .map_err(|e| RunnerError::Api(format!("claim: {e}")))?;

        if resp.status() == StatusCode::CONFLICT {
            return Err(RunnerError::AlreadyClaimed);
        }
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RunnerError::Api(format!("claim {status}: {body}")));
        }

        resp.json()
            .await
            .map_err(|e| RunnerError::Api(format!("claim decode: {e}")))
    }

    /// Report job completion, authenticated with the per-job sandbox token.
    pub async fn complete(
        &self,
        sandbox_token: &str,
        run_id: uuid::Uuid,
        exit_code: i32,
        error: Option<&str>,
    ) -> RunnerResult<()> {
        let body = CompleteRequest {
            run_id,
            exit_code,
            error: error.map(String::from),
        };

        let resp = self
            .http
            .request(reqwest::Method::POST, "/runners/complete", sandbox_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| RunnerError::Api(format!("complete: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!(status = %status, "complete request failed: {body}");
            return Err(RunnerError::Api(format!("complete {status}: {body}")));
        }
        Ok(())
    }
}
