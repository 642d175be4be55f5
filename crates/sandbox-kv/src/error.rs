#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store protocol error: {0}")]
    Protocol(String),

    /// Error text returned by the store itself.
    #[error("{0}")]
    Server(String),

    #[error("store not connected")]
    NotConnected,

    #[error("sandbox id '{0}' must be non-empty and must not contain '#'")]
    InvalidSandboxId(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("corrupt reconciliation status: {0}")]
    Status(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
