use tokio::process::Command;
use tracing::trace;

/// Error from a failed command.
#[derive(Debug, thiserror::Error)]
#[error("command failed: {command}\n{detail}")]
pub struct CommandError {
    pub command: String,
    pub detail: String,
}

/// How a command should be executed.
#[derive(Debug, Clone, Copy)]
pub enum Privilege {
    /// Prefix with `sudo`.
    Sudo,
    /// Run as the current user.
    User,
}

/// Run a shell command line, formatted with `sudo!`/`format!` semantics.
///
/// The command runs through `bash -c` so pipes and redirections work.
/// Returns trimmed stdout on success.
pub async fn exec_command(command: &str, privilege: Privilege) -> Result<String, CommandError> {
    trace!(command, privilege = ?privilege, "exec");

    let output = match privilege {
        Privilege::Sudo => {
            Command::new("sudo")
                .args(["bash", "-c", command])
                .output()
                .await
        }
        Privilege::User => Command::new("bash").args(["-c", command]).output().await,
    };

    let output = output.map_err(|e| CommandError {
        command: command.to_string(),
        detail: e.to_string(),
    })?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        Err(CommandError {
            command: command.to_string(),
            detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Run a shell command line, ignoring any errors.
pub async fn exec_command_ignore_errors(command: &str, privilege: Privilege) {
    if let Err(e) = exec_command(command, privilege).await {
        trace!(command, error = %e.detail, "command failed (ignored)");
    }
}

/// `sudo!("ip netns add {name}")` — format, run under sudo, await.
macro_rules! sudo {
    ($($arg:tt)*) => {
        $crate::command::exec_command(&format!($($arg)*), $crate::command::Privilege::Sudo).await
    };
}
pub(crate) use sudo;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exec_returns_trimmed_stdout() {
        let output = exec_command("echo hello", Privilege::User).await.unwrap();
        assert_eq!(output, "hello");
    }

    #[tokio::test]
    async fn exec_supports_pipes() {
        let output = exec_command("printf 'a\\nb\\nc' | wc -l", Privilege::User)
            .await
            .unwrap();
        assert_eq!(output, "2");
    }

    #[tokio::test]
    async fn exec_returns_error_with_stderr() {
        let err = exec_command("echo oops >&2; exit 3", Privilege::User)
            .await
            .unwrap_err();
        assert!(err.detail.contains("oops"), "detail was: {}", err.detail);
    }

    #[tokio::test]
    async fn exec_ignore_errors_swallows_failure() {
        exec_command_ignore_errors("false", Privilege::User).await;
    }
}
