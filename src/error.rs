//! Read-path error types

use crate::types::ChainId;

/// Errors surfaced by the read path.
///
/// Every variant is `Clone` so a single fetch outcome can be handed to all
/// waiters coalesced onto it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReadError {
    #[error("Missing required parameters: {}", .0.join(", "))]
    MissingParameters(Vec<&'static str>),

    #[error("Invalid parameter {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("Unsupported chainId: {0}")]
    UnsupportedChain(ChainId),

    #[error("Rate limit exceeded for chain {chain_id}")]
    RateLimited {
        chain_id: ChainId,
        limit: u32,
        reset_at_ms: i64,
    },

    #[error("Upstream call {method} timed out after {timeout_ms}ms")]
    UpstreamTimeout { method: String, timeout_ms: u64 },

    #[error("Upstream call {method} failed: {message}")]
    UpstreamCall { method: String, message: String },

    #[error("Malformed upstream response: {0}")]
    Decode(String),

    #[error("Metadata fetch failed for {token} on chain {chain_id}: {message}")]
    MetadataFetch {
        chain_id: ChainId,
        token: String,
        message: String,
    },

    #[error("Fetch was cancelled or panicked")]
    FetchAborted,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ReadError {
    /// Whether the caller sent a bad request (as opposed to an upstream failure).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ReadError::MissingParameters(_)
                | ReadError::InvalidParameter { .. }
                | ReadError::UnsupportedChain(_)
        )
    }

    /// Supplementary detail for the `details` field of an error body.
    pub fn details(&self) -> Option<String> {
        match self {
            ReadError::MissingParameters(names) => Some(format!(
                "expected query parameters: {}",
                names.join(", ")
            )),
            ReadError::InvalidParameter { reason, .. } => Some(reason.clone()),
            ReadError::UnsupportedChain(chain_id) => {
                Some(format!("no endpoint is configured for chain {}", chain_id))
            }
            ReadError::RateLimited { reset_at_ms, .. } => {
                Some(format!("retry after {}", reset_at_ms))
            }
            ReadError::UpstreamTimeout { method, .. } | ReadError::UpstreamCall { method, .. } => {
                Some(format!("upstream method: {}", method))
            }
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ReadError {
    fn from(err: serde_json::Error) -> Self {
        ReadError::Decode(err.to_string())
    }
}
