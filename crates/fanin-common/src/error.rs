use thiserror::Error;

#[derive(Debug, Error)]
pub enum FaninError {
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("corrupt record in {location}: {reason}")]
    CorruptRecord { location: String, reason: String },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("internal error: {0}")]
    InternalError(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FaninError {
    pub fn corrupt(location: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CorruptRecord {
            location: location.into(),
            reason: reason.into(),
        }
    }

    /// Stable `kind` field attached to storage failures in logs.
    pub fn kind_label(&self) -> &'static str {
        match self {
            Self::InvalidOperation(_) => "invalid_operation",
            Self::StorageUnavailable(_) => "storage_unavailable",
            Self::CorruptRecord { .. } => "corrupt_record",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::Unsupported(_) => "unsupported",
            Self::InternalError(_) => "internal_error",
            Self::Io(_) => "io",
        }
    }
}

pub type Result<T> = std::result::Result<T, FaninError>;
