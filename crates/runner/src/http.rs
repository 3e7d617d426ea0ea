use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tracing::info;

use crate::error::{RunnerError, RunnerResult};

/// Default timeout for control-plane requests (covers large claim payloads).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared HTTP client for the control plane. Owns the connection pool and
/// base URL. Clone is a cheap Arc refcount bump.
#[derive(Clone)]
pub struct HttpClient {
    inner: Arc<Inner>,
}

struct Inner {
    client: Client,
    api_url: String,
}

impl HttpClient {
    pub fn new(api_url: String) -> RunnerResult<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| RunnerError::Internal(format!("http client: {e}")))?;

        info!(api_url = %api_url, "http client initialized");

        Ok(Self {
            inner: Arc::new(Inner { client, api_url }),
        })
    }

    /// Build a bearer-authenticated request. `path` is appended to the
    /// base URL (e.g. `/runners/poll`).
    pub fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        token: &str,
    ) -> reqwest::RequestBuilder {
        let url = format!("{}{path}", self.inner.api_url);
        self.inner.client.request(method, url).bearer_auth(token)
    }
}
