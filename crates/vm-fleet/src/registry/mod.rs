//! Crash-tolerant on-disk registries shared across runner processes.
//!
//! Both registries are single JSON files mutated only under an exclusive
//! file lock. Entries carry the owning runner's PID so a later process can
//! tell live state from garbage left by a crash.

pub mod ip;
pub mod netns;

use std::path::Path;

use crate::error::{FleetError, Result};

/// Load a JSON registry file, treating an empty file as the default value.
pub(crate) fn load_json<T: serde::de::DeserializeOwned + Default>(path: &Path) -> Result<T> {
    let content = match std::fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
        Err(e) => return Err(FleetError::Io(e)),
    };
    if content.is_empty() {
        return Ok(T::default());
    }
    serde_json::from_slice(&content).map_err(|e| FleetError::RegistryCorrupt {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })
}

/// Persist a JSON registry file atomically (write-then-rename).
pub(crate) fn store_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value).map_err(|e| FleetError::RegistryCorrupt {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
