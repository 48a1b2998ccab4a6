use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::TransportOp;

/// Broad transport failure category used for user-facing reporting.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TransportErrorCategory {
    /// Transient network or server failure.
    Network,
    /// Authentication/authorization failure.
    Auth,
    /// Request rejected as invalid (unknown group, message not found, ...).
    Rejected,
}

/// Stable transport error payload returned by [`crate::ChatTransport`] calls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct TransportError {
    /// High-level error category.
    pub category: TransportErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl TransportError {
    /// Build an error from its parts.
    pub fn new(
        category: TransportErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
        }
    }

    /// Network-classified failure with a generic code.
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(TransportErrorCategory::Network, "network_error", message)
    }
}

/// Errors surfaced to callers of the synchronization core.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// An external transport call failed; local state has been rolled back.
    #[error("{operation} failed: {source}")]
    Transport {
        operation: TransportOp,
        #[source]
        source: TransportError,
    },
}

impl SyncError {
    /// Wrap a failed transport call.
    pub fn transport(operation: TransportOp, source: TransportError) -> Self {
        Self::Transport { operation, source }
    }

    /// Stable error code of the underlying failure.
    pub fn code(&self) -> &str {
        match self {
            Self::Transport { source, .. } => &source.code,
        }
    }

    /// Category of the underlying failure.
    pub fn category(&self) -> TransportErrorCategory {
        match self {
            Self::Transport { source, .. } => source.category,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_category_and_code() {
        let err = TransportError::new(
            TransportErrorCategory::Auth,
            "unauthorized",
            "token expired",
        );
        assert_eq!(err.to_string(), "Auth:unauthorized: token expired");
    }

    #[test]
    fn sync_error_exposes_transport_code() {
        let err = SyncError::transport(
            TransportOp::SendMessage,
            TransportError::network("connection reset"),
        );
        assert_eq!(err.code(), "network_error");
        assert_eq!(err.category(), TransportErrorCategory::Network);
        assert_eq!(
            err.to_string(),
            "send_message failed: Network:network_error: connection reset"
        );
    }
}
