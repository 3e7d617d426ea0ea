//! Minimal HTTP/1.1 client for the Firecracker API socket.
//!
//! The API listens on a Unix domain socket, which reqwest cannot dial, so
//! requests are framed by hand over a `UnixStream`. One connection per
//! request; the API's responses always carry `Content-Length`.

use std::path::PathBuf;
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use crate::error::{FleetError, Result};

pub struct FirecrackerApi {
    sock_path: PathBuf,
}

impl FirecrackerApi {
    pub fn new(sock_path: impl Into<PathBuf>) -> Self {
        Self {
            sock_path: sock_path.into(),
        }
    }

    /// Poll until the API socket accepts connections and answers.
    pub async fn wait_for_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.request("GET", "/", None).await.is_ok() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(FleetError::StartFailed(format!(
                    "firecracker API not ready after {}ms",
                    timeout.as_millis()
                )));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Load a snapshot and resume the VM.
    pub async fn load_snapshot(&self, snapshot_path: &str, memory_path: &str) -> Result<()> {
        let body = json!({
            "snapshot_path": snapshot_path,
            "mem_backend": {
                "backend_type": "File",
                "backend_path": memory_path,
            },
            "resume_vm": true,
        });
        let (status, response) = self
            .request("PUT", "/snapshot/load", Some(&body.to_string()))
            .await?;
        if !(200..300).contains(&status) {
            return Err(FleetError::StartFailed(format!(
                "snapshot load failed ({status}): {response}"
            )));
        }
        Ok(())
    }

    /// Issue one request and return `(status, body)`.
    async fn request(
        &self,
        method: &str,
        path: &str,
        body: Option<&str>,
    ) -> Result<(u16, String)> {
        let mut stream = UnixStream::connect(&self.sock_path).await?;

        let body = body.unwrap_or("");
        let request = format!(
            "{method} {path} HTTP/1.1\r\n\
             Host: localhost\r\n\
             Accept: application/json\r\n\
             Content-Type: application/json\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(request.as_bytes()).await?;

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await?;
        parse_response(&response)
    }
}

/// Parse an HTTP/1.1 response into `(status, body)`.
fn parse_response(raw: &[u8]) -> Result<(u16, String)> {
    let text = String::from_utf8_lossy(raw);
    let (head, body) = text
        .split_once("\r\n\r\n")
        .ok_or_else(|| FleetError::StartFailed("malformed API response".into()))?;
    let status: u16 = head
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| FleetError::StartFailed(format!("bad status line: {head}")))?;
    Ok((status, body.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    /// One-shot fake API server answering every request with `response`.
    fn serve(sock: PathBuf, response: &'static str) {
        tokio::spawn(async move {
            let listener = UnixListener::bind(&sock).unwrap();
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf).await;
                stream.write_all(response.as_bytes()).await.unwrap();
                stream.shutdown().await.unwrap();
            }
        });
    }

    #[tokio::test]
    async fn load_snapshot_accepts_2xx() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("api.sock");
        serve(sock.clone(), "HTTP/1.1 204 No Content\r\n\r\n");

        tokio::time::sleep(Duration::from_millis(20)).await;
        let api = FirecrackerApi::new(&sock);
        api.load_snapshot("/snap/state.bin", "/snap/mem.bin")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn load_snapshot_propagates_api_errors() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("api.sock");
        serve(
            sock.clone(),
            "HTTP/1.1 400 Bad Request\r\nContent-Length: 24\r\n\r\n{\"fault_message\":\"nope\"}",
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        let api = FirecrackerApi::new(&sock);
        let err = api.load_snapshot("/s", "/m").await.unwrap_err();
        assert!(err.to_string().contains("400"), "got: {err}");
    }

    #[tokio::test]
    async fn wait_for_ready_times_out_without_socket() {
        let dir = tempfile::tempdir().unwrap();
        let api = FirecrackerApi::new(dir.path().join("missing.sock"));
        let err = api.wait_for_ready(Duration::from_millis(80)).await.unwrap_err();
        assert!(err.to_string().contains("not ready"));
    }

    #[tokio::test]
    async fn wait_for_ready_succeeds_once_listening() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("api.sock");
        serve(sock.clone(), "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\n{}");

        tokio::time::sleep(Duration::from_millis(20)).await;
        let api = FirecrackerApi::new(&sock);
        api.wait_for_ready(Duration::from_secs(2)).await.unwrap();
    }

    #[test]
    fn parse_response_splits_status_and_body() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nbody";
        let (status, body) = parse_response(raw).unwrap();
        assert_eq!(status, 200);
        assert_eq!(body, "body");
    }

    #[test]
    fn parse_response_rejects_garbage() {
        assert!(parse_response(b"not http").is_err());
    }
}
