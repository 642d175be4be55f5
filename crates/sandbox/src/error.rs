#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("unknown resource class: {0}")]
    UnknownResourceClass(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("resource {resource} setup failed: {reason}")]
    Setup { resource: String, reason: String },

    #[error("resource {resource} teardown failed: {reason}")]
    Teardown { resource: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SandboxError>;
