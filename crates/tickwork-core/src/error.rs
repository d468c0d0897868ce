use thiserror::Error;

#[derive(Debug, Error)]
pub enum TickworkError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// A job, trigger or payload failed model validation.
    #[error("Invalid {entity}: {reason}")]
    Validation { entity: &'static str, reason: String },

    #[error("Unknown {what}: {value}")]
    UnknownVariant { what: &'static str, value: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TickworkError {
    pub fn validation(entity: &'static str, reason: impl Into<String>) -> Self {
        TickworkError::Validation {
            entity,
            reason: reason.into(),
        }
    }

    /// Short machine-readable code, stable across releases.
    pub fn code(&self) -> &'static str {
        match self {
            TickworkError::Config(_) => "CONFIG_ERROR",
            TickworkError::Validation { .. } => "VALIDATION_ERROR",
            TickworkError::UnknownVariant { .. } => "UNKNOWN_VARIANT",
            TickworkError::Serialization(_) => "SERIALIZATION_ERROR",
            TickworkError::Io(_) => "IO_ERROR",
            TickworkError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, TickworkError>;
