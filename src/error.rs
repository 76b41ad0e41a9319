//! Error types for the ordering engine and subscriptions.

use crate::types::{ChainKey, MessageRef, RequestId};
use thiserror::Error;

/// Main error type for client operations.
///
/// Errors are `Clone` because most of them travel to the application as
/// subscription events rather than being returned from a call.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("Gap fill failed on {chain}: could not recover {from} to {to}")]
    GapFillFailed {
        chain: ChainKey,
        from: MessageRef,
        to: MessageRef,
    },

    #[error("Unexpected reply: request {0} correlates to nothing")]
    UnexpectedReply(RequestId),

    #[error("Unexpected {kind} response for request {request_id}")]
    UnexpectedResponse {
        kind: &'static str,
        request_id: RequestId,
    },

    #[error("Verification failed: {0}")]
    Verification(String),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(u64),

    #[error("Not connected")]
    NotConnected,

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        ClientError::MalformedPayload(e.to_string())
    }
}

impl<T> From<crossbeam_channel::SendError<T>> for ClientError {
    fn from(_: crossbeam_channel::SendError<T>) -> Self {
        ClientError::Transport("request channel closed".to_string())
    }
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
