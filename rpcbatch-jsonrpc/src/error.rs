use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::types;

pub type Result<T, E = JsonRpcError> = std::result::Result<T, E>;

/// Name given to any error that no [`crate::ErrorMapper`] was able to classify more precisely.
pub const UNKNOWN_ERROR_NAME: &str = "UnknownError";

/// Everything that can go wrong with a single call, as seen by whoever is awaiting it.
#[derive(Debug, Error)]
pub enum JsonRpcError {
    /// The remote peer answered this call with a JSON-RPC error object.
    #[error("Remote method '{method}' failed with {error}")]
    Rpc { method: types::Method, error: TypedError },

    /// The batch this call travelled in never produced a reply.  Every call in that batch fails
    /// with the same shared source error.
    #[error("Transport failed while calling '{method}': {error}")]
    Transport {
        method: types::Method,
        error: TypedError,
        source: Arc<TransportError>,
    },

    #[error("Call to '{method}' (request {request_id}) was cancelled")]
    Cancelled {
        method: types::Method,
        request_id: types::Id,
    },

    /// The reply to this call's batch arrived but did not include a response with its ID.
    #[error("Reply to the batch carrying '{method}' (request {request_id}) did not include a response for it")]
    MissingResponse {
        method: types::Method,
        request_id: types::Id,
    },

    /// Another call was registered under the same request ID and took over its bookkeeping.
    #[error("Call to '{method}' was superseded by another call with request ID {request_id}")]
    DuplicateRequestId {
        method: types::Method,
        request_id: types::Id,
    },

    #[error("'{method}' is a reserved name and cannot be invoked as a remote method")]
    ReservedMethodName { method: types::Method },

    #[error("Error serializing request params {type_name} to JSON")]
    SerRequest {
        source: serde_json::Error,
        type_name: &'static str,
    },

    #[error("Error deserializing response as {type_name}")]
    DeserResponse {
        source: serde_json::Error,
        type_name: &'static str,
        response: JsonValue,
    },

    #[error("The call scheduler is shut down")]
    SchedulerClosed,

    #[error("BUG: {message}")]
    Bug { message: String },
}

impl JsonRpcError {
    /// The typed error produced by the error mapper, for failures that have one.
    ///
    /// Only remote errors and transport failures are mapped; local conditions like cancellation
    /// have no wire code.
    pub fn typed_error(&self) -> Option<&TypedError> {
        match self {
            JsonRpcError::Rpc { error, .. } | JsonRpcError::Transport { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Shorthand for the code of [`Self::typed_error`]
    pub fn code(&self) -> Option<i32> {
        self.typed_error().map(|e| e.code)
    }

    /// The method this error relates to, when it relates to one specific call
    pub fn method(&self) -> Option<&types::Method> {
        match self {
            JsonRpcError::Rpc { method, .. }
            | JsonRpcError::Transport { method, .. }
            | JsonRpcError::Cancelled { method, .. }
            | JsonRpcError::MissingResponse { method, .. }
            | JsonRpcError::DuplicateRequestId { method, .. }
            | JsonRpcError::ReservedMethodName { method } => Some(method),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, JsonRpcError::Cancelled { .. })
    }
}

/// Structured error with a stable name and code, as produced by an [`crate::ErrorMapper`].
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{name} ({code}): {message}")]
pub struct TypedError {
    pub message: String,
    pub name: String,
    pub code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
}

impl TypedError {
    pub fn new(
        name: impl Into<String>,
        code: i32,
        message: impl Into<String>,
        data: impl Into<Option<JsonValue>>,
    ) -> Self {
        Self {
            message: message.into(),
            name: name.into(),
            code,
            data: data.into(),
        }
    }

    /// A typed error that carries no more information than the wire error itself.
    pub fn unknown(code: i32, message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self::new(UNKNOWN_ERROR_NAME, code, message, data)
    }
}

/// A failure of the transport itself, erased to a common type.
///
/// Carries the synthetic error code the transport assigned to the failure (an HTTP status, or a
/// JSON-RPC code like parse error for a malformed payload) so that it can go through the same
/// error mapping as errors reported by the remote peer.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct TransportError {
    pub code: i32,
    pub source: Box<dyn std::error::Error + Send + Sync + 'static>,
}

impl TransportError {
    pub fn new(code: i32, source: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>) -> Self {
        Self {
            code,
            source: source.into(),
        }
    }
}

/// Turn the payload of a caught panic into something printable
pub(crate) fn panic_err_to_string(err: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}
