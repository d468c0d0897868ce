use thiserror::Error;

#[derive(Debug, Error)]
pub enum ListenerError {
    /// The listener's callback returned an unrecoverable failure.
    #[error("Listener failed: {0}")]
    Failed(String),

    /// The listener needs a resource (store, channel) that is gone.
    #[error("Listener unavailable: {0}")]
    Unavailable(String),
}

impl ListenerError {
    pub fn failed(msg: impl std::fmt::Display) -> Self {
        ListenerError::Failed(msg.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ListenerError>;
