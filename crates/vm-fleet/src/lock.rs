//! Cross-process advisory file locking.
//!
//! Registries shared between runner processes are mutated only inside
//! [`with_lock`] critical sections. Callers keep sections short: file
//! reads and writes only, no network I/O, and (with the single exception
//! of TAP existence double-checks) no `ip`/`iptables` invocations.

use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};

use crate::error::{FleetError, Result};

/// Guard holding an exclusive flock; released on drop.
pub type LockGuard = Flock<std::fs::File>;

/// Acquire an exclusive flock on `path`, blocking until available.
///
/// The lock file is created if missing. Blocking happens on a dedicated
/// thread so the runtime is never stalled.
pub async fn acquire(path: &Path) -> Result<LockGuard> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::options()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| FleetError::Config(format!("open lock {}: {e}", path.display())))?;
        Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_file, e)| FleetError::Config(format!("flock {}: {e}", path.display())))
    })
    .await
    .map_err(|e| FleetError::Config(format!("lock task: {e}")))?
}

/// Run `f` while holding the exclusive lock on `path`.
///
/// The lock is released on every exit path, including panics inside `f`
/// (the guard unlocks on drop during unwinding). Non-reentrant: a task
/// must not call `with_lock` for a path it already holds.
pub async fn with_lock<T, F, Fut>(path: &Path, f: F) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let guard = acquire(path).await?;
    let result = f().await;
    drop(guard);
    result
}

/// Create `path` as an empty file if it does not exist.
///
/// Uses exclusive-create so two processes racing to initialize a registry
/// cannot truncate each other; the loser's `EEXIST` is benign and ignored.
pub fn ensure_file(path: &PathBuf) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::File::options().write(true).create_new(true).open(path) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(FleetError::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn with_lock_creates_file_and_runs_closure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.lock");

        let value = with_lock(&path, || async { Ok(41 + 1) }).await.unwrap();
        assert_eq!(value, 42);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn held_lock_blocks_nonblocking_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.lock");

        let _guard = acquire(&path).await.unwrap();

        let file = std::fs::File::options()
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        let err = Flock::lock(file, FlockArg::LockExclusiveNonblock).unwrap_err();
        assert_eq!(err.1, nix::errno::Errno::EWOULDBLOCK);
    }

    #[tokio::test]
    async fn lock_released_after_with_lock_returns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.lock");

        with_lock(&path, || async { Ok(()) }).await.unwrap();

        let file = std::fs::File::options()
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        let _lock = Flock::lock(file, FlockArg::LockExclusiveNonblock).unwrap();
    }

    #[tokio::test]
    async fn lock_released_when_closure_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.lock");

        let result: Result<()> =
            with_lock(&path, || async { Err(FleetError::NoFreeIp) }).await;
        assert!(result.is_err());

        // Failure path still releases the lock.
        let file = std::fs::File::options()
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        let _lock = Flock::lock(file, FlockArg::LockExclusiveNonblock).unwrap();
    }

    #[test]
    fn ensure_file_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("registry.json");

        ensure_file(&path).unwrap();
        std::fs::write(&path, b"{\"data\": true}").unwrap();
        // Second call must not truncate existing content.
        ensure_file(&path).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"{\"data\": true}");
    }
}
