use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub type SyncResult<T> = Result<T, SyncError>;

/// Errors reported by a remote record store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Network failure, connection reset, or an unexpected server error.
    #[error("transport error: {message}")]
    Transport { message: String, retryable: bool },

    /// The remote ran out of memory or time while handling the request. Smaller
    /// requests are expected to succeed.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The remote refused the data. The message is the remote's own wording.
    #[error("{0}")]
    Rejected(String),

    /// The remote answered with something this client cannot interpret.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl RemoteError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { retryable: true, .. })
    }

    /// True when shrinking the request is likely to make it succeed.
    pub fn is_size_attributable(&self) -> bool {
        matches!(self, Self::ResourceExhausted(_))
    }

    /// The message to surface next to a failed record.
    pub fn reason(&self) -> String {
        match self {
            Self::Rejected(message) => message.clone(),
            other => other.to_string(),
        }
    }
}

#[derive(Error, Debug)]
pub enum SyncError {
    /// Schema for a model could not be fetched or interpreted.
    #[error("schema unavailable for {model}: {message}")]
    Schema { model: String, message: String },

    #[error("unknown field {field} on {model}")]
    UnknownField { model: String, field: String },

    #[error("pass {pass} of {model} did not finish within {timeout:?}")]
    BarrierTimeout {
        model: String,
        pass: usize,
        timeout: Duration,
    },

    #[error("session {id}: {message}")]
    Session { id: String, message: String },

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("{context} {}: {source}", path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("worker task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

impl SyncError {
    pub fn schema(model: &str, message: impl Into<String>) -> Self {
        Self::Schema {
            model: model.to_string(),
            message: message.into(),
        }
    }

    pub fn io(context: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            context,
            path: path.into(),
            source,
        }
    }

    /// Errors that abort every remaining pass of a model.
    pub fn is_fatal_for_model(&self) -> bool {
        matches!(
            self,
            Self::Schema { .. } | Self::UnknownField { .. } | Self::BarrierTimeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_reason_is_verbatim() {
        let err = RemoteError::Rejected("The field 'Name' is required".into());
        assert_eq!(err.reason(), "The field 'Name' is required");
        assert_eq!(err.to_string(), "The field 'Name' is required");
    }

    #[test]
    fn only_resource_exhaustion_is_size_attributable() {
        assert!(RemoteError::ResourceExhausted("MemoryError".into()).is_size_attributable());
        assert!(!RemoteError::transport("reset").is_size_attributable());
        assert!(!RemoteError::Rejected("bad".into()).is_size_attributable());
    }

    #[test]
    fn retryable_transport() {
        assert!(RemoteError::transport("reset").is_retryable());
        let hard = RemoteError::Transport {
            message: "tls".into(),
            retryable: false,
        };
        assert!(!hard.is_retryable());
        assert!(!RemoteError::Protocol("garbage".into()).is_retryable());
    }

    #[test]
    fn fatal_classification() {
        assert!(SyncError::schema("res.partner", "unreachable").is_fatal_for_model());
        assert!(SyncError::UnknownField {
            model: "res.partner".into(),
            field: "nope".into()
        }
        .is_fatal_for_model());
        assert!(!SyncError::InvalidArgument("x".into()).is_fatal_for_model());
    }
}
