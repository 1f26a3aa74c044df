use thiserror::Error;

use rpcbatch_jsonrpc::ErrorCode;

pub type Result<T, E = HttpTransportError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum HttpTransportError {
    /// The server answered with a non-success status.  The body is not examined.
    #[error("{status} {reason}")]
    Status { status: u16, reason: String },

    #[error("Response body is not a valid JSON-RPC reply")]
    Decode {
        #[source]
        source: serde_json::Error,
    },

    #[error("Error serializing request payload")]
    Encode {
        #[source]
        source: serde_json::Error,
    },

    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Invalid HTTP header '{name}'")]
    InvalidHeader {
        name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    #[error("Header provider failed")]
    HeaderProvider {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    #[error("URL scheme '{scheme}' is not supported; use http or https")]
    UnsupportedScheme { scheme: String },

    #[error("Request was cancelled")]
    Cancelled,
}

impl HttpTransportError {
    /// Wrap an error raised by a [`crate::HeaderProvider`]
    pub fn header_provider(source: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>) -> Self {
        Self::HeaderProvider {
            source: source.into(),
        }
    }

    /// The synthetic JSON-RPC error code that stands for this failure.
    ///
    /// This is what the client's error mapper sees as the code of the failed calls.
    pub fn code(&self) -> i32 {
        match self {
            HttpTransportError::Status { status, .. } => i32::from(*status),
            HttpTransportError::Decode { .. } => ErrorCode::ParseError.code(),
            _ => ErrorCode::InternalError.code(),
        }
    }
}
