//! Error types for the Ethereum JSON-RPC client.

use std::sync::Arc;
use std::time::Duration;

use jsonrpc_core::Id;
use thiserror::Error;

/// Result type for the Ethereum JSON-RPC client.
pub type JsonRpcResult<T> = std::result::Result<T, JsonRpcError>;

/// Error type for the Ethereum JSON-RPC client.
#[derive(Error, Debug, Clone)]
pub enum JsonRpcError {
    /// Transport-level failure: connection, HTTP status, malformed payload.
    /// In a bulk request this error resolves every registered call.
    #[error("transport error: {0}")]
    Transport(Arc<anyhow::Error>),
    /// The response does not have a valid JSON-RPC shape.
    #[error("invalid JSON-RPC response: {0}")]
    Protocol(String),
    /// A single request was sent, but a batch response was received.
    #[error("unexpected batch response: expected single but got batch")]
    UnexpectedBatch,
    /// A batch request was sent, but the number of responses is not equal to the number of requests.
    #[error("unexpected response: expected {expected} but got {actual}")]
    UnexpectedResultsAmount { expected: usize, actual: usize },
    /// The node reported an error for this call. The message is preserved
    /// verbatim, e.g. "Unknown block number".
    #[error("remote error {}: {}", .0.code.code(), .0.message)]
    Remote(jsonrpc_core::Error),
    /// Error while parsing the JSON result value.
    #[error("invalid JSON response: {0}")]
    Json(Arc<serde_json::Error>),
    /// The node did not reach the requested block height before the wait
    /// ceiling elapsed. The underlying call was never sent.
    #[error("block height {requested} not reached after {waited:?}")]
    BlockHeightTimeout { requested: u64, waited: Duration },
    /// A call handle was read before its bulk request was executed.
    #[error("bulk request has not been executed yet")]
    NotReady,
    /// The bulk request was already executed and cannot be reused.
    #[error("bulk request was already executed")]
    AlreadyExecuted,
    /// The client was closed.
    #[error("client is closed")]
    Closed,
    /// The batch response did not contain an entry for this request id.
    #[error("no response for request id {0:?}")]
    MissingResponse(Id),
}

impl JsonRpcError {
    pub(crate) fn transport(err: anyhow::Error) -> Self {
        JsonRpcError::Transport(Arc::new(err))
    }

    /// Returns the verbatim message of a node-reported error, if this is one.
    pub fn remote_message(&self) -> Option<&str> {
        match self {
            JsonRpcError::Remote(err) => Some(&err.message),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for JsonRpcError {
    fn from(err: serde_json::Error) -> Self {
        JsonRpcError::Json(Arc::new(err))
    }
}
