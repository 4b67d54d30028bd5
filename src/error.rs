use std::io;

/// Failures surfaced by bundle lifecycle operations.
///
/// `NotFound`, `InvalidState`, `IntegrityFailure` and `PermissionDenied` are
/// caller errors and are never retried internally. `Io` covers manifest and
/// bundle file access.
#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    #[error("bundle '{id}' not found")]
    NotFound { id: String },

    #[error("bundle '{id}' is in an invalid state: {reason}")]
    InvalidState { id: String, reason: String },

    #[error("integrity check failed for bundle '{id}': {reason}")]
    IntegrityFailure { id: String, reason: String },

    #[error("{operation} is disabled by configuration")]
    PermissionDenied { operation: &'static str },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl BundleError {
    pub fn not_found(id: &str) -> Self {
        Self::NotFound { id: id.to_string() }
    }

    pub fn invalid_state(id: &str, reason: impl Into<String>) -> Self {
        Self::InvalidState {
            id: id.to_string(),
            reason: reason.into(),
        }
    }

    pub fn integrity(id: &str, reason: impl Into<String>) -> Self {
        Self::IntegrityFailure {
            id: id.to_string(),
            reason: reason.into(),
        }
    }

    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::InvalidState { .. } => "invalid_state",
            Self::IntegrityFailure { .. } => "integrity_failure",
            Self::PermissionDenied { .. } => "permission_denied",
            Self::Io { .. } => "io_failure",
        }
    }
}

pub type BundleResult<T> = std::result::Result<T, BundleError>;
