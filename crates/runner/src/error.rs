#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("api error: {0}")]
    Api(String),

    #[error("job already claimed by another runner")]
    AlreadyClaimed,

    #[error("config error: {0}")]
    Config(String),

    #[error("storage download failed: {0}")]
    StorageDownload(String),

    #[error(transparent)]
    Fleet(#[from] vm_fleet::FleetError),

    #[error(transparent)]
    Guest(#[from] guest_client::GuestError),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type RunnerResult<T> = Result<T, RunnerError>;
