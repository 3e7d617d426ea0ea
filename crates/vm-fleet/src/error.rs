use std::path::PathBuf;

use crate::command::CommandError;

#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("config error: {0}")]
    Config(String),

    #[error("registry corrupt: {}: {detail}", path.display())]
    RegistryCorrupt { path: PathBuf, detail: String },

    #[error("no free IP in allocation range")]
    NoFreeIp,

    #[error("namespace limit reached (max {max} per runner)")]
    NamespaceLimit { max: u32 },

    #[error("runner limit reached (max {max} per host)")]
    RunnerLimit { max: u32 },

    #[error("process spawn failed: {0}")]
    ProcessSpawn(String),

    #[error("network prerequisite missing: {0}")]
    Network(String),

    #[error("VM start failed: {0}")]
    StartFailed(String),

    #[error("invalid VM state: expected {expected}, found {found}")]
    InvalidState {
        expected: &'static str,
        found: &'static str,
    },

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Guest(#[from] guest_client::GuestError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FleetError>;
