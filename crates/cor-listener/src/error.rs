use thiserror::Error;

#[derive(Error, Debug)]
pub enum ListenerError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Failed to start listener: {0}")]
    Startup(String),

    #[error("Failed to stop listener: {0}")]
    Stop(String),

    #[error("Failed to publish request: {0}")]
    Publish(String),

    #[error("Store error: {0}")]
    Store(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ListenerError>;
