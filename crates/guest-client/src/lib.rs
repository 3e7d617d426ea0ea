//! Protocol-agnostic VM I/O.
//!
//! [`GuestClient`] is the seam between the executor and whatever transport
//! reaches the guest (vsock today). Implementations provide `exec` and
//! `close`; everything else — file transfer, probes — is built on top of
//! `exec` so it works over any transport.
//!
//! File writes use the base64 chunk-and-append strategy: content is
//! base64-encoded on the host, split into chunks, and appended with
//! `base64 -d >>`. This is the interface contract with the guest agent —
//! it sidesteps shell quoting entirely, so binary content is safe.

mod error;

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;

pub use error::{GuestError, Result};

/// Default timeout for guest commands (5 minutes).
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(300);

/// Maximum base64 payload per append command.
///
/// Kept under 65 536 so the full shell line stays clear of `ARG_MAX`
/// per-argument limits on the guest.
pub const MAX_BASE64_CHUNK: usize = 65_000;

/// Raw bytes per chunk: a multiple of 3 so every chunk encodes without
/// padding and the concatenation of decoded chunks is exact.
const RAW_CHUNK_SIZE: usize = MAX_BASE64_CHUNK / 4 * 3;

/// Result of executing a command on the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Single-quote `s` for the guest shell.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[async_trait]
pub trait GuestClient: Send + Sync {
    /// Execute a command on the guest.
    ///
    /// Never fails: transport errors are reported as `exit_code = 1` with
    /// the error message in `stderr`, so callers can treat every outcome
    /// uniformly.
    async fn exec(&self, command: &str, timeout: Duration) -> ExecOutput;

    /// Close the connection. Pending requests fail with
    /// [`GuestError::ConnectionClosed`].
    async fn close(&self);

    /// Execute a command and return its stdout, failing on non-zero exit.
    async fn exec_or_throw(&self, command: &str) -> Result<String> {
        let output = self.exec(command, DEFAULT_EXEC_TIMEOUT).await;
        if output.exit_code != 0 {
            return Err(GuestError::CommandFailed {
                command: command.to_string(),
                exit_code: output.exit_code,
                stderr: output.stderr,
            });
        }
        Ok(output.stdout)
    }

    /// Write `content` to `path` on the guest, creating parent directories.
    async fn write_file(&self, path: &str, content: &[u8]) -> Result<()> {
        let quoted = shell_quote(path);
        self.exec_or_throw(&format!(
            "mkdir -p \"$(dirname {quoted})\" && : > {quoted}"
        ))
        .await?;
        for chunk in content.chunks(RAW_CHUNK_SIZE) {
            let encoded = base64::engine::general_purpose::STANDARD.encode(chunk);
            self.exec_or_throw(&format!("echo {encoded} | base64 -d >> {quoted}"))
                .await?;
        }
        Ok(())
    }

    /// Like [`write_file`](Self::write_file) but via sudo, for paths the
    /// guest user cannot write.
    async fn write_file_with_sudo(&self, path: &str, content: &[u8]) -> Result<()> {
        let quoted = shell_quote(path);
        self.exec_or_throw(&format!(
            "sudo mkdir -p \"$(dirname {quoted})\" && sudo tee {quoted} < /dev/null > /dev/null"
        ))
        .await?;
        for chunk in content.chunks(RAW_CHUNK_SIZE) {
            let encoded = base64::engine::general_purpose::STANDARD.encode(chunk);
            self.exec_or_throw(&format!(
                "echo {encoded} | base64 -d | sudo tee -a {quoted} > /dev/null"
            ))
            .await?;
        }
        Ok(())
    }

    /// Read a file from the guest as UTF-8 text.
    async fn read_file(&self, path: &str) -> Result<String> {
        let output = self.exec(&format!("cat {}", shell_quote(path)), DEFAULT_EXEC_TIMEOUT).await;
        if output.exit_code != 0 {
            return Err(GuestError::ReadFailed {
                path: path.to_string(),
                detail: output.stderr,
            });
        }
        Ok(output.stdout)
    }

    /// Create a directory (and parents) on the guest.
    async fn mkdir(&self, path: &str) -> Result<()> {
        self.exec_or_throw(&format!("mkdir -p {}", shell_quote(path)))
            .await?;
        Ok(())
    }

    /// Whether `path` exists on the guest.
    async fn exists(&self, path: &str) -> Result<bool> {
        let output = self.exec(&format!("test -e {}", shell_quote(path)), DEFAULT_EXEC_TIMEOUT).await;
        Ok(output.exit_code == 0)
    }

    /// Probe the guest with a trivial command.
    async fn is_reachable(&self) -> bool {
        let output = self.exec("echo ok", Duration::from_secs(10)).await;
        output.exit_code == 0 && output.stdout.trim() == "ok"
    }
}
